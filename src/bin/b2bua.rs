use clap::Parser;
use rsipb2bua::{
    config::{B2buaConfig, StirShakenConfig, Timers},
    dialog::authenticate::{Credential, DigestAlgorithm},
    identity::Identity,
    logging,
    sip::HostPort,
    transaction::NewDialogHandler,
    transport::{tcp_listener::TcpListenerConnection, udp::UdpConnection, TransportLayer},
    CallMap, EndpointBuilder, Error, Result,
};
use std::{net::IpAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::{
    select,
    signal::unix::{signal, SignalKind},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long calls get to hang up on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(author, version, about = "Simple SIP back-to-back user agent")]
struct Args {
    /// Local address to listen on
    #[arg(short = 'l', long, default_value = "0.0.0.0")]
    laddr: IpAddr,

    /// Local port to listen on
    #[arg(short = 'p', long, default_value = "5060")]
    lport: u16,

    /// Also accept SIP over TCP
    #[arg(long)]
    tcp: bool,

    /// Next hop for outgoing calls: host, host:port or [v6]:port
    #[arg(short = 'n', long, default_value = "127.0.0.1:5060")]
    nh_addr: HostPort,

    /// Log file. Records are appended under an exclusive lock
    #[arg(short = 'L', long)]
    logfile: Option<PathBuf>,

    /// Log level, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: String,

    /// User-Agent and Server header value
    #[arg(long, default_value = rsipb2bua::config::DEFAULT_USER_AGENT)]
    user_agent: String,

    /// Payload types allowed in forwarded offers
    #[arg(long, value_delimiter = ',', default_values_t = rsipb2bua::config::DEFAULT_PAYLOAD_TYPES)]
    allowed_pts: Vec<u32>,

    /// Require callers to authenticate as this user
    #[arg(long, requires = "passwd_in")]
    authname_in: Option<String>,

    #[arg(long)]
    passwd_in: Option<String>,

    /// Answer next-hop challenges as this user
    #[arg(long, requires = "passwd_out")]
    authname_out: Option<String>,

    #[arg(long)]
    passwd_out: Option<String>,

    /// Digest algorithm for challenges: MD5, SHA-256, SHA-512-256 (and -sess)
    #[arg(long, default_value = "MD5")]
    hash_alg: DigestAlgorithm,

    #[arg(long, default_value = rsipb2bua::config::DEFAULT_REALM)]
    realm: String,

    /// Send transferred calls to the transfer target's host
    #[arg(long)]
    transfer_to_target: bool,

    /// Maximum call duration in seconds
    #[arg(long)]
    credit_time: Option<u64>,

    /// STIR/SHAKEN attestation level (A, B or C); enables signing
    #[arg(long, requires_all = ["origid", "x5u", "cert_file", "pkey_file"])]
    attest: Option<String>,

    #[arg(long)]
    origid: Option<String>,

    /// URL the signing certificate is published at
    #[arg(long)]
    x5u: Option<String>,

    #[arg(long)]
    cert_file: Option<PathBuf>,

    #[arg(long)]
    pkey_file: Option<PathBuf>,

    /// Trusted roots for verifying caller identity
    #[arg(long)]
    root_certs: Option<PathBuf>,

    /// Verify the Identity header of incoming calls
    #[arg(long, requires = "root_certs")]
    verify: bool,
}

fn credential(name: Option<String>, password: Option<String>) -> Option<Credential> {
    Some(Credential {
        username: name?,
        password: password.unwrap_or_default(),
    })
}

impl Args {
    fn into_config(self) -> Result<B2buaConfig> {
        let stir_shaken = match self.attest {
            Some(attest) => Some(StirShakenConfig {
                attest,
                origid: self.origid.unwrap_or_default(),
                x5u: self.x5u.unwrap_or_default(),
                cert_file: self.cert_file.unwrap_or_default(),
                pkey_file: self.pkey_file.unwrap_or_default(),
                root_certs: self.root_certs.unwrap_or_default(),
                verify: self.verify,
            }),
            None if self.verify => {
                return Err(Error::ConfigError(
                    "identity verification needs a STIR/SHAKEN setup".to_string(),
                ))
            }
            None => None,
        };
        let config = B2buaConfig {
            local_addr: self.laddr,
            local_port: self.lport,
            tcp: self.tcp,
            next_hop: self.nh_addr,
            user_agent: self.user_agent,
            allowed_pts: self.allowed_pts,
            logfile: self.logfile,
            auth_in: credential(self.authname_in, self.passwd_in),
            auth_out: credential(self.authname_out, self.passwd_out),
            realm: self.realm,
            hash_alg: self.hash_alg,
            transfer_to_redirect_host: self.transfer_to_target,
            stir_shaken,
            timers: Timers {
                credit_time: self.credit_time.map(Duration::from_secs),
                ..Default::default()
            },
        };
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let log_level = args.log_level.clone();
    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("b2bua: {}", e);
            std::process::exit(2);
        }
    };
    if let Err(e) = logging::init(config.logfile.as_deref(), &log_level) {
        eprintln!("b2bua: {}", e);
        std::process::exit(1);
    }
    if let Err(e) = run(config).await {
        error!("b2bua failed: {}", e);
        std::process::exit(1);
    }
}

async fn run(config: B2buaConfig) -> Result<()> {
    // SIGPIPE is already ignored by the Rust runtime; SIGHUP is consumed here
    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    let identity = match &config.stir_shaken {
        Some(stir_shaken) => Some(Arc::new(Identity::from_config(stir_shaken)?)),
        None => None,
    };

    let token = CancellationToken::new();
    let transport_layer = TransportLayer::new(token.child_token());
    let local = config.local_socket_addr();
    let udp = UdpConnection::create_connection(local, None).await?;
    transport_layer.add_transport(udp.into());
    if config.tcp {
        transport_layer.add_tcp_listener(TcpListenerConnection::bind(local, None).await?);
    }

    let endpoint = EndpointBuilder::new()
        .with_user_agent(&config.user_agent)
        .with_transport_layer(transport_layer)
        .with_cancel_token(token.clone())
        .with_option(config.endpoint_option())
        .build();

    let call_map = CallMap::new(endpoint.inner.clone(), Arc::new(config.clone()), identity);
    let handler: Arc<dyn NewDialogHandler> = call_map.as_handler();
    endpoint.inner.set_new_dialog_handler(&handler);
    info!(
        "listening on {}, next hop {}",
        local, config.next_hop
    );

    let serving = endpoint.clone();
    let mut serve = tokio::spawn(async move { serving.serve().await });

    loop {
        select! {
            _ = hangup.recv() => debug!("SIGHUP ignored"),
            _ = interrupt.recv() => break,
            _ = terminate.recv() => break,
            _ = &mut serve => {
                warn!("endpoint stopped");
                return Err(Error::EndpointError("endpoint stopped".to_string()));
            }
        }
    }

    info!(calls = call_map.len(), "shutting down");
    call_map.shutdown();
    if !call_map.wait_drained(SHUTDOWN_GRACE).await {
        warn!(calls = call_map.len(), "calls still up after the grace period");
        call_map.clear();
    }
    endpoint.shutdown();
    serve.await.ok();
    Ok(())
}

//! Validated configuration consumed by the call layer and the binary.
use crate::{
    dialog::authenticate::{Credential, DigestAlgorithm},
    sip::HostPort,
    transaction::EndpointOption,
    Error, Result,
};
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

pub const DEFAULT_USER_AGENT: &str = "Sippy B2BUA (Simple)";
pub const DEFAULT_REALM: &str = "myrealm";
pub const DEFAULT_PAYLOAD_TYPES: [u32; 5] = [0, 8, 18, 100, 101];

#[derive(Debug, Clone)]
pub struct B2buaConfig {
    pub local_addr: IpAddr,
    pub local_port: u16,
    /// Also listen on TCP at the same address.
    pub tcp: bool,
    pub next_hop: HostPort,
    pub user_agent: String,
    /// Payload types kept in the SDP offered to the callee.
    pub allowed_pts: Vec<u32>,
    pub logfile: Option<PathBuf>,
    /// Credentials callers must present. No challenge is sent when unset.
    pub auth_in: Option<Credential>,
    /// Credentials used when the next hop challenges us.
    pub auth_out: Option<Credential>,
    pub realm: String,
    pub hash_alg: DigestAlgorithm,
    /// Send transferred calls to the host of the transfer target instead of
    /// the next hop.
    pub transfer_to_redirect_host: bool,
    pub stir_shaken: Option<StirShakenConfig>,
    pub timers: Timers,
}

impl Default for B2buaConfig {
    fn default() -> Self {
        B2buaConfig {
            local_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            local_port: 5060,
            tcp: false,
            next_hop: HostPort::new("127.0.0.1", Some(5060)),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            allowed_pts: DEFAULT_PAYLOAD_TYPES.to_vec(),
            logfile: None,
            auth_in: None,
            auth_out: None,
            realm: DEFAULT_REALM.to_string(),
            hash_alg: DigestAlgorithm::Md5,
            transfer_to_redirect_host: false,
            stir_shaken: None,
            timers: Timers::default(),
        }
    }
}

impl B2buaConfig {
    pub fn validate(&self) -> Result<()> {
        if self.next_hop.host.is_empty() {
            return Err(Error::ConfigError("next hop host is empty".to_string()));
        }
        if self.user_agent.trim().is_empty() {
            return Err(Error::ConfigError("user agent is empty".to_string()));
        }
        if self.allowed_pts.is_empty() {
            return Err(Error::ConfigError("no payload type allowed".to_string()));
        }
        for cred in [&self.auth_in, &self.auth_out].into_iter().flatten() {
            if cred.username.is_empty() {
                return Err(Error::ConfigError("empty auth name".to_string()));
            }
        }
        if let Some(stir) = &self.stir_shaken {
            stir.validate()?;
        }
        if self.timers.t1.is_zero() || self.timers.t2 < self.timers.t1 {
            return Err(Error::ConfigError(format!(
                "bad timers: t1={:?} t2={:?}",
                self.timers.t1, self.timers.t2
            )));
        }
        Ok(())
    }

    pub fn local_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.local_addr, self.local_port)
    }

    pub fn endpoint_option(&self) -> EndpointOption {
        EndpointOption {
            t1: self.timers.t1,
            t2: self.timers.t2,
            t4: self.timers.t4,
            ..Default::default()
        }
    }
}

/// STIR/SHAKEN settings. Calls are signed with `pkey_file` and point to
/// `x5u`; incoming identities are checked against `root_certs` when
/// `verify` is set.
#[derive(Debug, Clone)]
pub struct StirShakenConfig {
    pub attest: String,
    pub origid: String,
    pub x5u: String,
    pub cert_file: PathBuf,
    pub pkey_file: PathBuf,
    pub root_certs: PathBuf,
    pub verify: bool,
}

impl StirShakenConfig {
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.attest.as_str(), "A" | "B" | "C") {
            return Err(Error::ConfigError(format!(
                "attestation level must be A, B or C, not {:?}",
                self.attest
            )));
        }
        if self.x5u.is_empty() || self.origid.is_empty() {
            return Err(Error::ConfigError("x5u and origid are required".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Timers {
    pub t1: Duration,
    pub t2: Duration,
    pub t4: Duration,
    /// How long a finished leg lingers before it is dropped.
    pub dead_delay: Duration,
    pub late_offer_timeout: Duration,
    /// Maximum call duration after answer.
    pub credit_time: Option<Duration>,
}

impl Default for Timers {
    fn default() -> Self {
        Timers {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
            dead_delay: Duration::from_secs(32),
            late_offer_timeout: Duration::from_secs(32),
            credit_time: None,
        }
    }
}

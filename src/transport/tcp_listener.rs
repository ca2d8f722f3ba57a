use crate::transport::{
    connection::TransportSender,
    tcp::TcpConnection,
    SipAddr, SipConnection, TransportEvent, TransportKind,
};
use crate::Result;
use std::{fmt, net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, select, sync::Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct TcpListenerConnectionInner {
    pub local_addr: SipAddr,
    pub external: Option<SipAddr>,
    listener: Mutex<Option<TcpListener>>,
}

/// Accepts TCP connections and runs one serve loop per accepted stream.
#[derive(Clone)]
pub struct TcpListenerConnection {
    pub inner: Arc<TcpListenerConnectionInner>,
}

impl TcpListenerConnection {
    /// Binds immediately so that a busy port is reported at startup.
    pub async fn bind(local: SocketAddr, external: Option<SocketAddr>) -> Result<Self> {
        let listener = TcpListener::bind(local).await?;
        let bound = listener.local_addr()?;
        let inner = TcpListenerConnectionInner {
            local_addr: SipAddr::new(TransportKind::Tcp, bound.into()),
            external: external.map(|addr| SipAddr::new(TransportKind::Tcp, addr.into())),
            listener: Mutex::new(Some(listener)),
        };
        info!("created TCP listener: {}", inner.local_addr);
        Ok(TcpListenerConnection {
            inner: Arc::new(inner),
        })
    }

    pub async fn serve_listener(
        &self,
        cancel_token: CancellationToken,
        sender: TransportSender,
    ) -> Result<()> {
        let listener = match self.inner.listener.lock().await.take() {
            Some(listener) => listener,
            None => {
                return Err(crate::Error::TransportLayerError(
                    "listener already serving".to_string(),
                    self.inner.local_addr.clone(),
                ))
            }
        };
        let local_addr = self.get_addr().clone();

        tokio::spawn(async move {
            loop {
                let stream = select! {
                    _ = cancel_token.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => stream,
                        Err(e) => {
                            warn!("Failed to accept connection: {:?}", e);
                            continue;
                        }
                    }
                };
                let tcp_connection = match TcpConnection::accepted(stream, local_addr.clone()) {
                    Ok(tcp_connection) => tcp_connection,
                    Err(e) => {
                        error!("Failed to create TCP connection: {:?}", e);
                        continue;
                    }
                };

                let sip_connection = SipConnection::Tcp(tcp_connection.clone());
                let sender_clone = sender.clone();
                let cancel_token = cancel_token.child_token();
                let remote_addr = tcp_connection.remote_addr().clone();
                tokio::spawn(async move {
                    if let Err(e) = sender_clone.send(TransportEvent::New(sip_connection.clone())) {
                        error!(%remote_addr, "Error sending new connection event: {:?}", e);
                        return;
                    }
                    select! {
                        _ = cancel_token.cancelled() => {}
                        _ = tcp_connection.serve_loop(sender_clone.clone()) => {
                            info!(%remote_addr, "TCP connection serve loop completed");
                        }
                    }
                    if let Err(e) = sender_clone.send(TransportEvent::Closed(sip_connection)) {
                        warn!(%remote_addr, "Error sending connection closed event: {:?}", e);
                    }
                });
            }
        });
        Ok(())
    }

    pub fn get_addr(&self) -> &SipAddr {
        if let Some(external) = &self.inner.external {
            external
        } else {
            &self.inner.local_addr
        }
    }
}

impl fmt::Display for TcpListenerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TCP Listener {}", self.get_addr())
    }
}

impl fmt::Debug for TcpListenerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

use crate::{
    sip::{HostPort, SipUri},
    Error, Result,
};
use std::{fmt, net::SocketAddr, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransportKind {
    #[default]
    Udp,
    Tcp,
    Tls,
    /// In-memory transport used by tests.
    Channel,
}

impl TransportKind {
    pub fn is_reliable(&self) -> bool {
        !matches!(self, TransportKind::Udp)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
            TransportKind::Tls => "TLS",
            TransportKind::Channel => "CHANNEL",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "UDP" => Ok(TransportKind::Udp),
            "TCP" => Ok(TransportKind::Tcp),
            "TLS" => Ok(TransportKind::Tls),
            "CHANNEL" => Ok(TransportKind::Channel),
            _ => Err(Error::Error(format!("unknown transport: {}", s))),
        }
    }
}

/// SIP Address
///
/// A host/port plus an optional transport. Used for listening addresses,
/// request destinations and the source of received messages.
///
/// ```rust
/// use rsipb2bua::transport::{SipAddr, TransportKind};
///
/// let addr = SipAddr::new(TransportKind::Udp, "192.168.1.100:5060".parse().unwrap());
/// assert_eq!(addr.get_socketaddr().unwrap().port(), 5060);
/// ```
#[derive(Debug, Eq, PartialEq, Clone, Default, Hash)]
pub struct SipAddr {
    pub r#type: Option<TransportKind>,
    pub addr: HostPort,
}

impl fmt::Display for SipAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.r#type {
            Some(r#type) => write!(f, "{} {}", r#type, self.addr),
            None => write!(f, "{}", self.addr),
        }
    }
}

impl SipAddr {
    pub fn new(transport: TransportKind, addr: HostPort) -> Self {
        SipAddr {
            r#type: Some(transport),
            addr,
        }
    }

    pub fn transport(&self) -> TransportKind {
        self.r#type.unwrap_or_default()
    }

    pub fn get_socketaddr(&self) -> Result<SocketAddr> {
        self.addr.to_socket_addr().ok_or_else(|| {
            Error::Error(format!(
                "Cannot convert domain {} to SocketAddr",
                self.addr.host
            ))
        })
    }

    /// Resolves domain names through the system resolver.
    pub async fn resolve(&self) -> Result<SocketAddr> {
        if let Ok(addr) = self.get_socketaddr() {
            return Ok(addr);
        }
        let target = (self.addr.host.as_str(), self.addr.port_or_default());
        tokio::net::lookup_host(target)
            .await?
            .next()
            .ok_or_else(|| {
                Error::TransportLayerError("no address for host".to_string(), self.clone())
            })
    }
}

impl From<SocketAddr> for SipAddr {
    fn from(addr: SocketAddr) -> Self {
        SipAddr {
            r#type: None,
            addr: addr.into(),
        }
    }
}

impl From<HostPort> for SipAddr {
    fn from(addr: HostPort) -> Self {
        SipAddr { r#type: None, addr }
    }
}

impl From<&SipUri> for SipAddr {
    fn from(uri: &SipUri) -> Self {
        let r#type = match uri.param("transport") {
            Some(t) => t.parse().ok(),
            None if uri.is_secure() => Some(TransportKind::Tls),
            None => Some(TransportKind::Udp),
        };
        let mut addr = uri.host.clone();
        if let Some(maddr) = uri.param("maddr") {
            addr.host = maddr.to_string();
        }
        SipAddr { r#type, addr }
    }
}

impl From<&SipAddr> for SipUri {
    fn from(addr: &SipAddr) -> Self {
        let mut uri = SipUri::new(None, addr.addr.clone());
        match addr.r#type {
            Some(TransportKind::Tls) => uri.scheme = "sips".to_string(),
            Some(TransportKind::Tcp) => {
                uri = uri.with_param("transport", Some("tcp".to_string()));
            }
            _ => {}
        }
        uri
    }
}

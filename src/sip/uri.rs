use super::parser;
use crate::{Error, Result};
use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    str::FromStr,
};

pub const DEFAULT_SIP_PORT: u16 = 5060;

/// Host and optional port.
///
/// The host is stored without IPv6 brackets; they are restored by `Display`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct HostPort {
    pub host: String,
    pub port: Option<u16>,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        let host: String = host.into();
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .map(|h| h.to_string())
            .unwrap_or(host);
        HostPort { host, port }
    }

    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_SIP_PORT)
    }

    pub fn is_ipv6(&self) -> bool {
        self.host.contains(':')
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    /// Socket address for IP literals, `None` for domain names.
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        self.ip()
            .map(|ip| SocketAddr::new(ip, self.port_or_default()))
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ipv6() {
            write!(f, "[{}]", self.host)?;
        } else {
            write!(f, "{}", self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}

impl FromStr for HostPort {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::SipMessageError("empty host".to_string()));
        }
        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| Error::SipMessageError(format!("unterminated IPv6 host: {}", s)))?;
            let port = match tail.strip_prefix(':') {
                Some(p) => Some(parse_port(p)?),
                None if tail.is_empty() => None,
                None => {
                    return Err(Error::SipMessageError(format!("invalid host: {}", s)));
                }
            };
            return Ok(HostPort::new(host, port));
        }
        match s.matches(':').count() {
            0 => Ok(HostPort::new(s, None)),
            1 => {
                let (host, port) = s.split_once(':').unwrap_or((s, ""));
                Ok(HostPort::new(host, Some(parse_port(port)?)))
            }
            // bare IPv6 literal
            _ => Ok(HostPort::new(s, None)),
        }
    }
}

fn parse_port(s: &str) -> Result<u16> {
    s.parse::<u16>()
        .map_err(|e| Error::SipMessageError(format!("invalid port {}: {}", s, e)))
}

impl From<SocketAddr> for HostPort {
    fn from(addr: SocketAddr) -> Self {
        HostPort {
            host: addr.ip().to_string(),
            port: Some(addr.port()),
        }
    }
}

/// `name[=value]` parameter as found on URIs, Via and name-addr headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub value: Option<String>,
}

impl Param {
    pub fn new(name: impl Into<String>, value: Option<String>) -> Self {
        Param {
            name: name.into(),
            value,
        }
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, ";{}={}", self.name, value),
            None => write!(f, ";{}", self.name),
        }
    }
}

pub fn find_param<'a>(params: &'a [Param], name: &str) -> Option<&'a Param> {
    params.iter().find(|p| p.name.eq_ignore_ascii_case(name))
}

pub fn param_value<'a>(params: &'a [Param], name: &str) -> Option<&'a str> {
    find_param(params, name).and_then(|p| p.value.as_deref())
}

/// Replaces or appends a parameter.
pub fn set_param(params: &mut Vec<Param>, name: &str, value: Option<String>) {
    match params.iter_mut().find(|p| p.name.eq_ignore_ascii_case(name)) {
        Some(param) => param.value = value,
        None => params.push(Param::new(name, value)),
    }
}

pub fn remove_param(params: &mut Vec<Param>, name: &str) {
    params.retain(|p| !p.name.eq_ignore_ascii_case(name));
}

/// A `sip:`, `sips:` or `tel:` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipUri {
    pub scheme: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: HostPort,
    pub params: Vec<Param>,
    pub headers: Option<String>,
}

impl SipUri {
    pub fn new(user: Option<&str>, host: HostPort) -> Self {
        SipUri {
            scheme: "sip".to_string(),
            user: user.map(|u| u.to_string()),
            password: None,
            host,
            params: Vec::new(),
            headers: None,
        }
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        param_value(&self.params, name)
    }

    pub fn has_param(&self, name: &str) -> bool {
        find_param(&self.params, name).is_some()
    }

    pub fn with_param(mut self, name: &str, value: Option<String>) -> Self {
        set_param(&mut self.params, name, value);
        self
    }

    pub fn is_secure(&self) -> bool {
        self.scheme.eq_ignore_ascii_case("sips")
    }

    pub fn is_tel(&self) -> bool {
        self.scheme.eq_ignore_ascii_case("tel")
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if self.is_tel() {
            write!(f, "{}", self.user.as_deref().unwrap_or_default())?;
        } else {
            if let Some(user) = &self.user {
                write!(f, "{}", user)?;
                if let Some(password) = &self.password {
                    write!(f, ":{}", password)?;
                }
                write!(f, "@")?;
            }
            write!(f, "{}", self.host)?;
        }
        for param in &self.params {
            write!(f, "{}", param)?;
        }
        if let Some(headers) = &self.headers {
            write!(f, "?{}", headers)?;
        }
        Ok(())
    }
}

impl FromStr for SipUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parser::parse_uri(s.trim())
    }
}

impl TryFrom<&str> for SipUri {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        s.parse()
    }
}

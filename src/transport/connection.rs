use super::{
    channel::ChannelConnection, tcp::TcpConnection, udp::UdpConnection,
    RecvTime, SipAddr, TransportKind,
};
use crate::{
    sip::{HasHeaders, Header, HostPort, SipMessage, Via},
    Result,
};
use std::{fmt, net::SocketAddr};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

#[derive(Clone, Debug)]
pub enum TransportEvent {
    /// A parsed message, the connection it arrived on, its source and the
    /// time it was read off the wire.
    Incoming(SipMessage, SipConnection, SipAddr, RecvTime),
    New(SipConnection),
    Closed(SipConnection),
}

pub type TransportReceiver = UnboundedReceiver<TransportEvent>;
pub type TransportSender = UnboundedSender<TransportEvent>;

pub const KEEPALIVE_REQUEST: &[u8] = b"\r\n\r\n";
pub const KEEPALIVE_RESPONSE: &[u8] = b"\r\n";

#[derive(Clone, Debug)]
pub enum SipConnection {
    Udp(UdpConnection),
    Tcp(TcpConnection),
    Channel(ChannelConnection),
}

impl SipConnection {
    pub fn is_reliable(&self) -> bool {
        match self {
            SipConnection::Udp(_) => false,
            SipConnection::Tcp(_) => true,
            SipConnection::Channel(transport) => transport.is_reliable(),
        }
    }

    pub fn get_addr(&self) -> &SipAddr {
        match self {
            SipConnection::Udp(transport) => transport.get_addr(),
            SipConnection::Tcp(transport) => transport.get_addr(),
            SipConnection::Channel(transport) => transport.get_addr(),
        }
    }

    pub async fn send(&self, msg: SipMessage, destination: Option<&SipAddr>) -> Result<()> {
        match self {
            SipConnection::Udp(transport) => transport.send(msg, destination).await,
            SipConnection::Tcp(transport) => transport.send_message(msg).await,
            SipConnection::Channel(transport) => transport.send(msg, destination).await,
        }
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        match self {
            SipConnection::Udp(transport) => transport.serve_loop(sender).await,
            SipConnection::Tcp(transport) => transport.serve_loop(sender).await,
            SipConnection::Channel(transport) => transport.serve_loop(sender).await,
        }
    }

    pub async fn close(&self) -> Result<()> {
        match self {
            SipConnection::Tcp(transport) => transport.close().await,
            _ => Ok(()),
        }
    }
}

impl SipConnection {
    /// Stamps `received`/`rport` on the top Via of a request when the
    /// packet came from somewhere other than the Via sent-by.
    pub fn update_msg_received(msg: SipMessage, addr: SocketAddr) -> Result<SipMessage> {
        match msg {
            SipMessage::Request(mut req) => {
                if let Some(header) = req.headers.iter_mut().find(|h| h.is("Via")) {
                    Self::build_via_received(header, addr)?;
                }
                Ok(req.into())
            }
            SipMessage::Response(_) => Ok(msg),
        }
    }

    pub fn build_via_received(header: &mut Header, addr: SocketAddr) -> Result<()> {
        let mut via: Via = header.typed()?;
        let received = HostPort::from(addr);
        if via.sent_by.ip() == received.ip() && via.sent_by.port_or_default() == addr.port() {
            return Ok(());
        }
        via.set_param("received", Some(addr.ip().to_string()));
        via.set_param("rport", Some(addr.port().to_string()));
        *header = via.into();
        Ok(())
    }

    pub fn parse_target_from_via(via: &Via) -> HostPort {
        let mut target = via.sent_by.clone();
        if let Some(received) = via.received() {
            target.host = received.trim_matches(|c: char| c == '[' || c == ']').to_string();
        }
        if let Some(rport) = via.rport() {
            target.port = Some(rport);
        }
        target
    }

    /// Where a message goes when no explicit destination is given:
    /// the Request-URI for requests, the top Via for responses.
    pub fn get_destination(msg: &SipMessage) -> Result<SipAddr> {
        match msg {
            SipMessage::Request(req) => Ok(SipAddr::from(&req.uri)),
            SipMessage::Response(resp) => {
                let via = resp.via()?;
                let r#type = via.transport.parse::<TransportKind>().ok();
                Ok(SipAddr {
                    r#type,
                    addr: Self::parse_target_from_via(&via),
                })
            }
        }
    }
}

impl fmt::Display for SipConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipConnection::Udp(t) => write!(f, "UDP {}", t),
            SipConnection::Tcp(t) => write!(f, "TCP {}", t),
            SipConnection::Channel(t) => write!(f, "CHANNEL {}", t),
        }
    }
}

impl From<UdpConnection> for SipConnection {
    fn from(connection: UdpConnection) -> Self {
        SipConnection::Udp(connection)
    }
}

impl From<TcpConnection> for SipConnection {
    fn from(connection: TcpConnection) -> Self {
        SipConnection::Tcp(connection)
    }
}

impl From<ChannelConnection> for SipConnection {
    fn from(connection: ChannelConnection) -> Self {
        SipConnection::Channel(connection)
    }
}

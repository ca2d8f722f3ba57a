use super::{
    connection::{TransportSender, KEEPALIVE_REQUEST, KEEPALIVE_RESPONSE},
    RecvTime, SipAddr, SipConnection, TransportEvent, TransportKind,
};
use crate::{sip::SipMessage, Result};
use std::{net::SocketAddr, sync::Arc};
use tokio::net::UdpSocket;
use tracing::{debug, error, info, instrument, trace};

const MAX_DATAGRAM_SIZE: usize = 65535;

struct UdpInner {
    conn: UdpSocket,
    addr: SipAddr,
}

#[derive(Clone)]
pub struct UdpConnection {
    inner: Arc<UdpInner>,
}

impl UdpConnection {
    pub async fn create_connection(
        local: SocketAddr,
        external: Option<SocketAddr>,
    ) -> Result<Self> {
        let conn = UdpSocket::bind(local).await?;
        let bound = conn.local_addr()?;
        let addr = SipAddr::new(TransportKind::Udp, external.unwrap_or(bound).into());

        let t = UdpConnection {
            inner: Arc::new(UdpInner { addr, conn }),
        };
        info!("created UDP connection: {} external: {:?}", t, external);
        Ok(t)
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, addr) = match self.inner.conn.recv_from(&mut buf).await {
                Ok((len, addr)) => (len, addr),
                Err(e) => {
                    error!("Error receiving UDP packet: {}", e);
                    continue;
                }
            };
            let rtime = RecvTime::now();

            match &buf[..len] {
                KEEPALIVE_REQUEST => {
                    self.inner.conn.send_to(KEEPALIVE_RESPONSE, addr).await.ok();
                    continue;
                }
                KEEPALIVE_RESPONSE => continue,
                data if data.iter().all(|b| b.is_ascii_whitespace()) => continue,
                _ => {}
            }

            let msg = match SipMessage::parse(&buf[..len]) {
                Ok(msg) => msg,
                Err(e) => {
                    info!(
                        "Error parsing SIP message from: {} error: {} buf: {}",
                        addr,
                        e,
                        String::from_utf8_lossy(&buf[..len])
                    );
                    continue;
                }
            };

            let msg = match SipConnection::update_msg_received(msg, addr) {
                Ok(msg) => msg,
                Err(e) => {
                    info!("Error updating Via from: {} error: {}", addr, e);
                    continue;
                }
            };

            debug!("received {} {} -> {}", len, addr, self.get_addr());

            let mut source = SipAddr::from(addr);
            source.r#type = Some(TransportKind::Udp);
            sender.send(TransportEvent::Incoming(
                msg,
                SipConnection::Udp(self.clone()),
                source,
                rtime,
            ))?;
        }
    }

    #[instrument(skip(self, msg), fields(addr = %self.get_addr()))]
    pub async fn send(&self, msg: SipMessage, destination: Option<&SipAddr>) -> Result<()> {
        let target = match destination {
            Some(destination) => destination.resolve().await?,
            None => SipConnection::get_destination(&msg)?.resolve().await?,
        };
        let buf = msg.to_bytes();

        trace!("sending {} -> {} {}", buf.len(), target, msg);

        self.inner
            .conn
            .send_to(&buf, target)
            .await
            .map_err(|e| crate::Error::TransportLayerError(e.to_string(), self.get_addr().to_owned()))
            .map(|_| ())
    }

    pub async fn send_raw(&self, buf: &[u8], target: &SipAddr) -> Result<()> {
        self.inner
            .conn
            .send_to(buf, target.get_socketaddr()?)
            .await
            .map_err(|e| crate::Error::TransportLayerError(e.to_string(), target.to_owned()))
            .map(|_| ())
    }

    pub async fn recv_raw(&self, buf: &mut [u8]) -> Result<(usize, SipAddr)> {
        let (len, addr) = self.inner.conn.recv_from(buf).await?;
        Ok((len, addr.into()))
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.addr
    }
}

impl std::fmt::Display for UdpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.conn.local_addr() {
            Ok(addr) => write!(f, "{}", addr),
            Err(_) => write!(f, "*:*"),
        }
    }
}

impl std::fmt::Debug for UdpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner.addr)
    }
}

impl Drop for UdpInner {
    fn drop(&mut self) {
        info!("dropping UDP connection: {}", self.addr);
    }
}

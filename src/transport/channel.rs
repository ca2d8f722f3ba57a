use super::{
    connection::{TransportReceiver, TransportSender},
    RecvTime, SipAddr, SipConnection, TransportEvent, TransportKind,
};
use crate::{sip::SipMessage, Result};
use std::sync::{Arc, Mutex};

struct ChannelInner {
    incoming: Mutex<Option<TransportReceiver>>,
    outgoing: TransportSender,
    addr: SipAddr,
}

/// In-memory transport.
///
/// Everything the stack sends is pushed to `outgoing` as
/// `TransportEvent::Incoming(msg, connection, destination, rtime)`, and
/// everything pushed into `incoming` is handed to the stack as if it had
/// arrived from the network. An address typed UDP behaves as an unreliable
/// transport, so retransmission timers run.
#[derive(Clone)]
pub struct ChannelConnection {
    inner: Arc<ChannelInner>,
}

impl ChannelConnection {
    pub async fn create_connection(
        incoming: TransportReceiver,
        outgoing: TransportSender,
        addr: SipAddr,
    ) -> Result<Self> {
        let t = ChannelConnection {
            inner: Arc::new(ChannelInner {
                incoming: Mutex::new(Some(incoming)),
                outgoing,
                addr,
            }),
        };
        Ok(t)
    }

    pub fn is_reliable(&self) -> bool {
        self.inner.addr.r#type != Some(TransportKind::Udp)
    }

    pub async fn send(&self, msg: SipMessage, destination: Option<&SipAddr>) -> Result<()> {
        let destination = match destination {
            Some(destination) => destination.clone(),
            None => SipConnection::get_destination(&msg)?,
        };
        self.inner
            .outgoing
            .send(TransportEvent::Incoming(
                msg,
                SipConnection::Channel(self.clone()),
                destination,
                RecvTime::now(),
            ))
            .map_err(|e| e.into())
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.addr
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let incoming = self.inner.incoming.lock().unwrap().take();
        let mut incoming = match incoming {
            Some(incoming) => incoming,
            None => {
                return Err(crate::Error::Error(
                    "ChannelConnection::serve_loop called twice".to_string(),
                ));
            }
        };
        while let Some(event) = incoming.recv().await {
            sender.send(event)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for ChannelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner.addr.addr)
    }
}

impl std::fmt::Debug for ChannelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner.addr)
    }
}

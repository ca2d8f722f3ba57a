use super::{
    connection::TransportSender, tcp::TcpConnection,
    tcp_listener::TcpListenerConnection, SipAddr, SipConnection, TransportEvent, TransportKind,
};
use crate::Result;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Default)]
pub struct TransportLayerInner {
    cancel_token: CancellationToken,
    // listening connections in the order they were added
    listens: Arc<Mutex<Vec<SipConnection>>>,
    // stream connections keyed by remote address
    streams: Arc<Mutex<HashMap<SipAddr, SipConnection>>>,
    tcp_listeners: Mutex<Vec<TcpListenerConnection>>,
    sender: Mutex<Option<TransportSender>>,
}

#[derive(Default)]
pub struct TransportLayer {
    pub outbound: Option<SipAddr>,
    pub inner: Arc<TransportLayerInner>,
}

impl TransportLayer {
    pub fn new(cancel_token: CancellationToken) -> Self {
        let inner = TransportLayerInner {
            cancel_token,
            ..Default::default()
        };
        Self {
            outbound: None,
            inner: Arc::new(inner),
        }
    }

    pub fn add_transport(&self, transport: SipConnection) {
        self.inner.add_connection(transport)
    }

    pub fn add_tcp_listener(&self, listener: TcpListenerConnection) {
        self.inner.tcp_listeners.lock().unwrap().push(listener);
    }

    pub fn del_transport(&self, addr: &SipAddr) {
        self.inner.del_connection(addr)
    }

    /// Remembers an accepted or connected stream so that requests to the
    /// same peer reuse it.
    pub fn register_stream(&self, connection: SipConnection) {
        if let SipConnection::Tcp(tcp) = &connection {
            self.inner
                .streams
                .lock()
                .unwrap()
                .insert(tcp.remote_addr().clone(), connection.clone());
        }
    }

    pub fn unregister_stream(&self, connection: &SipConnection) {
        if let SipConnection::Tcp(tcp) = connection {
            self.inner.streams.lock().unwrap().remove(tcp.remote_addr());
        }
    }

    /// Connection that already exists for `destination`, if any. Never
    /// opens a new stream.
    pub fn find_connection(&self, destination: &SipAddr) -> Option<SipConnection> {
        self.inner.find(self.outbound.as_ref().unwrap_or(destination))
    }

    pub async fn lookup(&self, destination: &SipAddr) -> Result<SipConnection> {
        self.inner
            .lookup(self.outbound.as_ref().unwrap_or(destination))
            .await
    }

    pub async fn serve_listens(&self, sender: TransportSender) -> Result<()> {
        self.inner.serve_listens(sender).await
    }

    pub fn get_addrs(&self) -> Vec<SipAddr> {
        let mut addrs: Vec<SipAddr> = self
            .inner
            .listens
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.get_addr().clone())
            .collect();
        addrs.extend(
            self.inner
                .tcp_listeners
                .lock()
                .unwrap()
                .iter()
                .map(|l| l.get_addr().clone()),
        );
        addrs
    }

    /// First listening address for a transport, or the first one at all.
    pub fn first_addr(&self, kind: Option<TransportKind>) -> Option<SipAddr> {
        let addrs = self.get_addrs();
        addrs
            .iter()
            .find(|a| kind.is_some() && a.r#type == kind)
            .or_else(|| addrs.first())
            .cloned()
    }
}

impl TransportLayerInner {
    pub fn add_connection(&self, connection: SipConnection) {
        let mut listens = self.listens.lock().unwrap();
        listens.retain(|c| c.get_addr() != connection.get_addr());
        listens.push(connection);
    }

    pub fn del_connection(&self, addr: &SipAddr) {
        self.listens.lock().unwrap().retain(|c| c.get_addr() != addr);
    }

    fn find(&self, target: &SipAddr) -> Option<SipConnection> {
        let listens = self.listens.lock().unwrap();
        if let Some(transport) = listens.iter().find(|c| c.get_addr() == target) {
            return Some(transport.clone());
        }
        match target.transport() {
            TransportKind::Udp => {
                if let Some(transport) = listens
                    .iter()
                    .find(|c| c.get_addr().r#type == Some(TransportKind::Udp))
                {
                    return Some(transport.clone());
                }
            }
            TransportKind::Tcp => {
                if let Some(stream) = self.streams.lock().unwrap().get(target) {
                    return Some(stream.clone());
                }
            }
            _ => {}
        }
        // the in-memory transport carries everything it is given
        listens
            .iter()
            .find(|c| matches!(c, SipConnection::Channel(_)))
            .cloned()
    }

    async fn lookup(&self, target: &SipAddr) -> Result<SipConnection> {
        debug!("lookup target: {}", target);
        if let Some(connection) = self.find(target) {
            return Ok(connection);
        }
        if target.transport() == TransportKind::Tcp {
            return self.connect_tcp(target).await;
        }
        Err(crate::Error::TransportLayerError(
            format!("unsupported transport type: {:?}", target.r#type),
            target.to_owned(),
        ))
    }

    async fn connect_tcp(&self, target: &SipAddr) -> Result<SipConnection> {
        let tcp = TcpConnection::connect(target).await?;
        let connection = SipConnection::Tcp(tcp.clone());
        self.streams
            .lock()
            .unwrap()
            .insert(target.clone(), connection.clone());

        let sender = self.sender.lock().unwrap().clone();
        if let Some(sender) = sender {
            let sub_token = self.cancel_token.child_token();
            let streams = self.streams.clone();
            let key = target.clone();
            let serving = connection.clone();
            tokio::spawn(async move {
                select! {
                    _ = sub_token.cancelled() => {}
                    _ = tcp.serve_loop(sender.clone()) => {}
                }
                streams.lock().unwrap().remove(&key);
                info!("TCP connection closed: {}", key);
                sender.send(TransportEvent::Closed(serving)).ok();
            });
        }
        Ok(connection)
    }

    async fn serve_listens(&self, sender: TransportSender) -> Result<()> {
        self.sender.lock().unwrap().replace(sender.clone());

        let listens = self.listens.lock().unwrap().clone();
        for transport in listens {
            let sub_token = self.cancel_token.child_token();
            let sender_clone = sender.clone();
            let listens_ref = self.listens.clone();

            tokio::spawn(async move {
                select! {
                    _ = sub_token.cancelled() => { }
                    _ = transport.serve_loop(sender_clone.clone()) => {
                    }
                }
                listens_ref
                    .lock()
                    .unwrap()
                    .retain(|c| c.get_addr() != transport.get_addr());
                warn!("transport serve_loop exited: {}", transport.get_addr());
                sender_clone.send(TransportEvent::Closed(transport)).ok();
            });
        }

        let listeners = self.tcp_listeners.lock().unwrap().clone();
        for listener in listeners {
            listener
                .serve_listener(self.cancel_token.child_token(), sender.clone())
                .await?;
        }
        Ok(())
    }
}

use crate::{
    sip::SipMessage,
    transport::{
        connection::TransportSender,
        sip_addr::{SipAddr, TransportKind},
        stream::StreamConnectionInner,
        SipConnection,
    },
    Result,
};
use std::{fmt, net::SocketAddr, sync::Arc};
use tokio::{
    io::{ReadHalf, WriteHalf},
    net::TcpStream,
};
use tracing::info;

type TcpInner = StreamConnectionInner<ReadHalf<TcpStream>, WriteHalf<TcpStream>>;

/// One TCP stream. Framing and keep-alives are handled by
/// [`StreamConnectionInner`].
#[derive(Clone)]
pub struct TcpConnection {
    inner: Arc<TcpInner>,
}

impl TcpConnection {
    pub async fn connect(remote: &SipAddr) -> Result<Self> {
        let peer = remote.resolve().await?;
        let stream = TcpStream::connect(peer).await?;
        let local = SipAddr::new(TransportKind::Tcp, stream.local_addr()?.into());
        let connection = Self::wrap(stream, local, peer);
        info!(%connection, "tcp connected to {}", remote);
        Ok(connection)
    }

    /// A stream accepted on the listener bound to `local`.
    pub fn accepted(stream: TcpStream, local: SipAddr) -> Result<Self> {
        let peer = stream.peer_addr()?;
        let connection = Self::wrap(stream, local, peer);
        info!(%connection, "tcp accepted");
        Ok(connection)
    }

    fn wrap(stream: TcpStream, local: SipAddr, peer: SocketAddr) -> Self {
        let remote = SipAddr::new(TransportKind::Tcp, peer.into());
        let (read_half, write_half) = tokio::io::split(stream);
        TcpConnection {
            inner: Arc::new(StreamConnectionInner::new(local, remote, read_half, write_half)),
        }
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.local_addr
    }

    pub fn remote_addr(&self) -> &SipAddr {
        &self.inner.remote_addr
    }

    pub async fn send_message(&self, msg: SipMessage) -> Result<()> {
        self.inner.send_message(msg).await
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let connection = SipConnection::Tcp(self.clone());
        self.inner.serve_loop(sender, connection).await
    }

    pub async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

impl fmt::Display for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}",
            self.inner.local_addr.addr, self.inner.remote_addr.addr
        )
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

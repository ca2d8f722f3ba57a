use crate::{
    sip::SipMessage,
    transport::{
        connection::{TransportSender, KEEPALIVE_REQUEST, KEEPALIVE_RESPONSE},
        RecvTime, SipAddr, SipConnection, TransportEvent,
    },
    Result,
};
use bytes::{Buf, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, info, warn};

pub(super) const MAX_SIP_MESSAGE_SIZE: usize = 65535;

/// Frames SIP messages on a byte stream by their Content-Length.
#[derive(Default)]
pub struct SipCodec {}

impl SipCodec {
    pub fn new() -> Self {
        Self {}
    }
}

#[derive(Debug, Clone)]
pub enum SipCodecType {
    Message(SipMessage),
    KeepaliveRequest,
    KeepaliveResponse,
}

fn content_length(headers: &str) -> Result<usize> {
    for line in headers.lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name.eq_ignore_ascii_case("Content-Length") || name.eq_ignore_ascii_case("l") {
            return value
                .trim()
                .parse::<usize>()
                .map_err(|e| crate::Error::SipMessageError(format!("Invalid Content-Length: {}", e)));
        }
    }
    Ok(0)
}

impl Decoder for SipCodec {
    type Item = SipCodecType;
    type Error = crate::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() >= 4 && &src[0..4] == KEEPALIVE_REQUEST {
            src.advance(4);
            return Ok(Some(SipCodecType::KeepaliveRequest));
        }

        if src.len() >= 2 && &src[0..2] == KEEPALIVE_RESPONSE {
            src.advance(2);
            return Ok(Some(SipCodecType::KeepaliveResponse));
        }

        if let Some(headers_end) = src.windows(4).position(|w| w == b"\r\n\r\n") {
            let headers = std::str::from_utf8(&src[..headers_end]).map_err(|e| {
                crate::Error::SipMessageError(format!("Invalid UTF-8 in headers: {}", e))
            })?;
            let total_len = headers_end + 4 + content_length(headers)?;

            if src.len() >= total_len {
                let msg_data = src.split_to(total_len);
                let msg = SipMessage::parse(&msg_data[..])?;
                return Ok(Some(SipCodecType::Message(msg)));
            }
        }

        if src.len() > MAX_SIP_MESSAGE_SIZE {
            return Err(crate::Error::SipMessageError(
                "SIP message too large".to_string(),
            ));
        }
        Ok(None)
    }
}

impl Encoder<SipMessage> for SipCodec {
    type Error = crate::Error;

    fn encode(&mut self, item: SipMessage, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&item.to_bytes());
        Ok(())
    }
}

pub struct StreamConnectionInner<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub local_addr: SipAddr,
    pub remote_addr: SipAddr,
    pub read_half: Mutex<Option<R>>,
    pub write_half: Mutex<W>,
}

impl<R, W> StreamConnectionInner<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(local_addr: SipAddr, remote_addr: SipAddr, read_half: R, write_half: W) -> Self {
        Self {
            local_addr,
            remote_addr,
            read_half: Mutex::new(Some(read_half)),
            write_half: Mutex::new(write_half),
        }
    }

    pub async fn send_message(&self, msg: SipMessage) -> Result<()> {
        send_raw_to_stream(&self.write_half, &msg.to_bytes()).await
    }

    pub async fn send_raw(&self, data: &[u8]) -> Result<()> {
        send_raw_to_stream(&self.write_half, data).await
    }

    pub async fn serve_loop(
        &self,
        sender: TransportSender,
        connection: SipConnection,
    ) -> Result<()> {
        let mut read_half = match self.read_half.lock().await.take() {
            Some(read_half) => read_half,
            None => {
                warn!("Connection closed");
                return Ok(());
            }
        };

        let remote_addr = self.remote_addr.clone();
        let remote_socket_addr = remote_addr.get_socketaddr()?;

        let mut codec = SipCodec::new();
        let mut buffer = BytesMut::with_capacity(MAX_SIP_MESSAGE_SIZE);
        let mut read_buf = vec![0u8; MAX_SIP_MESSAGE_SIZE];

        loop {
            let n = match read_half.read(&mut read_buf).await {
                Ok(0) => {
                    info!("Connection closed: {}", self.local_addr);
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!("Error reading from stream: {}", e);
                    break;
                }
            };
            let rtime = RecvTime::now();
            buffer.extend_from_slice(&read_buf[0..n]);

            loop {
                match codec.decode(&mut buffer) {
                    Ok(Some(SipCodecType::Message(msg))) => {
                        debug!("Received message from {}", remote_addr);
                        let msg = SipConnection::update_msg_received(msg, remote_socket_addr)?;
                        if let Err(e) = sender.send(TransportEvent::Incoming(
                            msg,
                            connection.clone(),
                            remote_addr.clone(),
                            rtime,
                        )) {
                            warn!("Error sending incoming message: {:?}", e);
                            return Err(e.into());
                        }
                    }
                    Ok(Some(SipCodecType::KeepaliveRequest)) => {
                        self.send_raw(KEEPALIVE_RESPONSE).await?;
                    }
                    Ok(Some(SipCodecType::KeepaliveResponse)) => {}
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Error decoding message from {}: {}", remote_addr, e);
                        buffer.clear();
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        let mut write_half = self.write_half.lock().await;
        write_half.shutdown().await?;
        Ok(())
    }
}

pub async fn send_raw_to_stream<W>(write_half: &Mutex<W>, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut lock = write_half.lock().await;
    lock.write_all(data).await?;
    lock.flush().await?;
    Ok(())
}

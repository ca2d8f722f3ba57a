use super::{
    endpoint::{Endpoint, EndpointOption},
    transaction::{RequestReceiver, ResponseReceiver, ServerTransaction},
    EndpointBuilder, NewDialogAction, NewDialogHandler, RequestReceiverRef,
};
use crate::{
    sip::{Request, Response, SipMessage},
    transport::{
        channel::ChannelConnection, RecvTime, SipAddr, SipConnection, TransportEvent,
        TransportKind, TransportLayer, TransportReceiver, TransportSender,
    },
    Result,
};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

mod test_server;

/// An endpoint served on an in-memory transport. Messages are injected as
/// if they came from `peer` and everything the endpoint sends is observed
/// on `outgoing`.
pub(crate) struct TestEndpoint {
    pub endpoint: Endpoint,
    pub connection: SipConnection,
    pub peer: SipAddr,
    incoming: TransportSender,
    outgoing: TransportReceiver,
}

impl TestEndpoint {
    pub fn inject(&self, raw: &str) -> Result<()> {
        let msg = SipMessage::try_from(raw)?;
        self.inject_message(msg)
    }

    pub fn inject_message(&self, msg: impl Into<SipMessage>) -> Result<()> {
        self.incoming.send(TransportEvent::Incoming(
            msg.into(),
            self.connection.clone(),
            self.peer.clone(),
            RecvTime::now(),
        ))?;
        Ok(())
    }

    pub async fn next_message(&mut self, wait: Duration) -> Option<SipMessage> {
        match tokio::time::timeout(wait, self.outgoing.recv()).await {
            Ok(Some(TransportEvent::Incoming(msg, _, _, _))) => Some(msg),
            _ => None,
        }
    }

    pub async fn expect_request(&mut self) -> Request {
        match self.next_message(Duration::from_secs(2)).await {
            Some(SipMessage::Request(req)) => req,
            other => panic!("expected a request, got {:?}", other),
        }
    }

    pub async fn expect_response(&mut self) -> Response {
        match self.next_message(Duration::from_secs(2)).await {
            Some(SipMessage::Response(resp)) => resp,
            other => panic!("expected a response, got {:?}", other),
        }
    }
}

impl Drop for TestEndpoint {
    fn drop(&mut self) {
        self.endpoint.shutdown();
    }
}

pub(crate) async fn create_test_endpoint(
    kind: TransportKind,
    option: EndpointOption,
) -> Result<TestEndpoint> {
    let token = CancellationToken::new();
    let (incoming_tx, incoming_rx) = unbounded_channel();
    let (outgoing_tx, outgoing_rx) = unbounded_channel();
    let local = SipAddr::new(kind, "127.0.0.1:5060".parse()?);
    let connection: SipConnection =
        ChannelConnection::create_connection(incoming_rx, outgoing_tx, local)
            .await?
            .into();

    let tl = TransportLayer::new(token.child_token());
    tl.add_transport(connection.clone());

    let endpoint = EndpointBuilder::new()
        .with_user_agent("rsipb2bua-test")
        .with_transport_layer(tl)
        .with_cancel_token(token)
        .with_option(option)
        .build();

    let serving = endpoint.clone();
    tokio::spawn(async move { serving.serve().await });

    Ok(TestEndpoint {
        endpoint,
        connection,
        peer: SipAddr::new(TransportKind::Udp, "10.0.0.1:5060".parse()?),
        incoming: incoming_tx,
        outgoing: outgoing_rx,
    })
}

pub(crate) fn fast_timers(t1_ms: u64) -> EndpointOption {
    EndpointOption {
        t1: Duration::from_millis(t1_ms),
        t2: Duration::from_millis(t1_ms * 8),
        t4: Duration::from_millis(t1_ms * 10),
        timer_interval: Duration::from_millis(5),
    }
}

/// Collects responses delivered to a client transaction.
pub(crate) struct ResponseCollector {
    sender: UnboundedSender<Response>,
}

impl ResponseCollector {
    pub fn new() -> (Arc<Self>, UnboundedReceiver<Response>) {
        let (sender, receiver) = unbounded_channel();
        (Arc::new(ResponseCollector { sender }), receiver)
    }
}

impl ResponseReceiver for ResponseCollector {
    fn recv_response(&self, resp: Response, _rtime: RecvTime) {
        self.sender.send(resp).ok();
    }
}

/// Records what reached the transaction user and optionally answers.
#[derive(Default)]
pub(crate) struct RecordingReceiver {
    pub answer: Option<u16>,
    pub requests: Mutex<Vec<Request>>,
    pub transactions: Mutex<Vec<ServerTransaction>>,
    pub acks: Mutex<Vec<Request>>,
}

impl RecordingReceiver {
    pub fn answering(status: u16) -> Arc<Self> {
        Arc::new(RecordingReceiver {
            answer: Some(status),
            ..Default::default()
        })
    }

    pub fn silent() -> Arc<Self> {
        Arc::new(RecordingReceiver::default())
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl RequestReceiver for RecordingReceiver {
    fn recv_request(&self, req: Request, tx: ServerTransaction, _rtime: RecvTime) {
        if let Some(status) = self.answer {
            tx.reply(status, Some("uas-tag")).expect("reply");
        }
        self.requests.lock().unwrap().push(req);
        self.transactions.lock().unwrap().push(tx);
    }

    fn recv_ack(&self, req: Request, _rtime: RecvTime) {
        self.acks.lock().unwrap().push(req);
    }
}

/// Accepts every new request into one receiver.
pub(crate) struct AcceptAll(pub RequestReceiverRef);

impl NewDialogHandler for AcceptAll {
    fn on_new_dialog(&self, _req: &Request, _rtime: RecvTime) -> NewDialogAction {
        NewDialogAction::Accept(self.0.clone())
    }
}

pub(crate) fn install_handler(
    test: &TestEndpoint,
    receiver: RequestReceiverRef,
) -> Arc<dyn NewDialogHandler> {
    let handler: Arc<dyn NewDialogHandler> = Arc::new(AcceptAll(receiver));
    test.endpoint.inner.set_new_dialog_handler(&handler);
    handler
}

pub(crate) fn options_request(branch: &str) -> String {
    format!(
        "OPTIONS sip:b2bua@127.0.0.1:5060 SIP/2.0\r\n\
Via: SIP/2.0/UDP 10.0.0.1:5060;branch={branch}\r\n\
Max-Forwards: 70\r\n\
From: <sip:alice@10.0.0.1>;tag=a1\r\n\
To: <sip:b2bua@127.0.0.1>\r\n\
Call-ID: options-{branch}@10.0.0.1\r\n\
CSeq: 1 OPTIONS\r\n\
Content-Length: 0\r\n\r\n"
    )
}

pub(crate) fn invite_request(branch: &str, method: &str) -> String {
    format!(
        "{method} sip:1000@127.0.0.1:5060 SIP/2.0\r\n\
Via: SIP/2.0/UDP 10.0.0.1:5060;branch={branch}\r\n\
Max-Forwards: 70\r\n\
From: \"Alice\" <sip:alice@10.0.0.1>;tag=a1\r\n\
To: <sip:1000@127.0.0.1>\r\n\
Call-ID: call-{branch}@10.0.0.1\r\n\
CSeq: 1 {method}\r\n\
Content-Length: 0\r\n\r\n"
    )
}

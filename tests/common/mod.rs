#![allow(dead_code)]
use rsipb2bua::{
    config::{B2buaConfig, Timers},
    identity::Identity,
    sip::{make_response, HasHeaders, Header, HostPort, Method, Request, Response, SipMessage, SipUri},
    transaction::{EndpointOption, NewDialogHandler},
    transport::{
        channel::ChannelConnection, RecvTime, SipAddr, SipConnection, TransportEvent,
        TransportKind, TransportLayer, TransportReceiver, TransportSender,
    },
    CallMap, Endpoint, EndpointBuilder, Result,
};
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tokio::sync::mpsc::unbounded_channel;
use tokio_util::sync::CancellationToken;

pub const CALLER: &str = "10.0.0.1:5060";
pub const NEXT_HOP: &str = "10.0.0.2:5060";

pub const CALLER_SDP: &str = "v=0\r\n\
o=alice 1 1 IN IP4 10.0.0.1\r\n\
s=-\r\n\
c=IN IP4 10.0.0.1\r\n\
t=0 0\r\n\
m=audio 10000 RTP/AVP 0 8 101\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=rtpmap:8 PCMA/8000\r\n\
a=rtpmap:101 telephone-event/8000\r\n";

pub const CALLEE_SDP: &str = "v=0\r\n\
o=bob 2 2 IN IP4 10.0.0.2\r\n\
s=-\r\n\
c=IN IP4 10.0.0.2\r\n\
t=0 0\r\n\
m=audio 20000 RTP/AVP 0\r\n\
a=rtpmap:0 PCMU/8000\r\n";

pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_file(true)
        .with_line_number(true)
        .with_test_writer()
        .try_init()
        .ok();
}

pub fn test_config() -> B2buaConfig {
    B2buaConfig {
        local_addr: "127.0.0.1".parse().unwrap(),
        next_hop: NEXT_HOP.parse().unwrap(),
        timers: Timers {
            t1: Duration::from_millis(20),
            t2: Duration::from_millis(160),
            t4: Duration::from_millis(200),
            dead_delay: Duration::from_millis(100),
            late_offer_timeout: Duration::from_millis(500),
            credit_time: None,
        },
        ..Default::default()
    }
}

/// A B2BUA served on an in-memory transport, with a caller at
/// [`CALLER`] and the next hop at [`NEXT_HOP`].
pub struct Harness {
    pub endpoint: Endpoint,
    pub call_map: CallMap,
    _handler: Arc<dyn NewDialogHandler>,
    connection: SipConnection,
    incoming: TransportSender,
    outgoing: TransportReceiver,
    to_caller: VecDeque<SipMessage>,
    to_next_hop: VecDeque<SipMessage>,
}

impl Harness {
    pub async fn new(config: B2buaConfig) -> Result<Self> {
        Self::with_identity(config, None).await
    }

    pub async fn with_identity(config: B2buaConfig, identity: Option<Arc<Identity>>) -> Result<Self> {
        init_logging();
        let token = CancellationToken::new();
        let (incoming, incoming_rx) = unbounded_channel();
        let (outgoing_tx, outgoing) = unbounded_channel();
        let local = SipAddr::new(TransportKind::Udp, "127.0.0.1:5060".parse()?);
        let connection: SipConnection =
            ChannelConnection::create_connection(incoming_rx, outgoing_tx, local)
                .await?
                .into();
        let transport_layer = TransportLayer::new(token.child_token());
        transport_layer.add_transport(connection.clone());

        let endpoint = EndpointBuilder::new()
            .with_user_agent(&config.user_agent)
            .with_transport_layer(transport_layer)
            .with_cancel_token(token)
            .with_option(EndpointOption {
                timer_interval: Duration::from_millis(5),
                ..config.endpoint_option()
            })
            .build();
        let call_map = CallMap::new(endpoint.inner.clone(), Arc::new(config), identity);
        let handler = call_map.as_handler();
        endpoint.inner.set_new_dialog_handler(&handler);

        let serving = endpoint.clone();
        tokio::spawn(async move { serving.serve().await });

        Ok(Harness {
            endpoint,
            call_map,
            _handler: handler,
            connection,
            incoming,
            outgoing,
            to_caller: VecDeque::new(),
            to_next_hop: VecDeque::new(),
        })
    }

    fn inject(&self, msg: SipMessage, source: &str) {
        let source = SipAddr::new(TransportKind::Udp, source.parse().unwrap());
        self.incoming
            .send(TransportEvent::Incoming(
                msg,
                self.connection.clone(),
                source,
                RecvTime::now(),
            ))
            .unwrap();
    }

    pub fn from_caller(&self, msg: impl Into<SipMessage>) {
        self.inject(msg.into(), CALLER);
    }

    pub fn from_next_hop(&self, msg: impl Into<SipMessage>) {
        self.inject(msg.into(), NEXT_HOP);
    }

    /// Moves everything sent so far into the per-peer queues, waiting up
    /// to `wait` for one more message.
    async fn pump(&mut self, wait: Duration) -> bool {
        let event = match tokio::time::timeout(wait, self.outgoing.recv()).await {
            Ok(Some(event)) => event,
            _ => return false,
        };
        if let TransportEvent::Incoming(msg, _, destination, _) = event {
            let caller: HostPort = CALLER.parse().unwrap();
            let to_caller = destination.addr.host == caller.host
                && destination.addr.port_or_default() == caller.port_or_default();
            if to_caller {
                self.to_caller.push_back(msg);
            } else {
                self.to_next_hop.push_back(msg);
            }
        }
        true
    }

    async fn wait_for(
        &mut self,
        to_caller: bool,
        what: &str,
        pred: impl Fn(&SipMessage) -> bool,
    ) -> SipMessage {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            let queue = if to_caller {
                &mut self.to_caller
            } else {
                &mut self.to_next_hop
            };
            while let Some(msg) = queue.pop_front() {
                if pred(&msg) {
                    return msg;
                }
            }
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            if left.is_zero() || !self.pump(left).await {
                panic!(
                    "no {} sent to the {}",
                    what,
                    if to_caller { "caller" } else { "next hop" }
                );
            }
        }
    }

    pub async fn caller_request(&mut self, method: Method) -> Request {
        let what = format!("{} request", method);
        expect_request(
            self.wait_for(true, &what, |m| matches!(m, SipMessage::Request(r) if r.method == method))
                .await,
        )
    }

    pub async fn caller_response(&mut self, method: Method, status: u16) -> Response {
        let what = format!("{} response to {}", status, method);
        expect_response(self.wait_for(true, &what, |m| is_response(m, &method, status)).await)
    }

    pub async fn next_hop_request(&mut self, method: Method) -> Request {
        let what = format!("{} request", method);
        expect_request(
            self.wait_for(false, &what, |m| matches!(m, SipMessage::Request(r) if r.method == method))
                .await,
        )
    }

    pub async fn next_hop_response(&mut self, method: Method, status: u16) -> Response {
        let what = format!("{} response to {}", status, method);
        expect_response(self.wait_for(false, &what, |m| is_response(m, &method, status)).await)
    }

    pub async fn caller_matching(&mut self, what: &str, pred: impl Fn(&SipMessage) -> bool) -> SipMessage {
        self.wait_for(true, what, pred).await
    }

    pub async fn next_hop_matching(&mut self, what: &str, pred: impl Fn(&SipMessage) -> bool) -> SipMessage {
        self.wait_for(false, what, pred).await
    }

    /// True when nothing sent to the next hop within `wait` matches.
    pub async fn next_hop_quiet(&mut self, wait: Duration, pred: impl Fn(&SipMessage) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if self.to_next_hop.iter().any(&pred) {
                return false;
            }
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            if left.is_zero() {
                return true;
            }
            self.pump(left).await;
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.endpoint.shutdown();
    }
}

pub fn call_id_of(msg: &SipMessage) -> Option<String> {
    let call_id = match msg {
        SipMessage::Request(req) => req.call_id(),
        SipMessage::Response(resp) => resp.call_id(),
    };
    call_id.ok().map(str::to_string)
}

pub fn cseq_of(msg: &SipMessage) -> u32 {
    let cseq = match msg {
        SipMessage::Request(req) => req.cseq(),
        SipMessage::Response(resp) => resp.cseq(),
    };
    cseq.map(|c| c.seq).unwrap_or(0)
}

pub fn is_request_in(msg: &SipMessage, call_id: &str, method: &Method) -> bool {
    matches!(msg, SipMessage::Request(r) if r.method == *method)
        && call_id_of(msg).as_deref() == Some(call_id)
}

pub fn is_response_in(msg: &SipMessage, call_id: &str, method: &Method, status: u16) -> bool {
    is_response(msg, method, status) && call_id_of(msg).as_deref() == Some(call_id)
}

pub fn is_response(msg: &SipMessage, method: &Method, status: u16) -> bool {
    match msg {
        SipMessage::Response(resp) => {
            resp.status == status
                && resp.cseq().map(|c| c.method == *method).unwrap_or(false)
        }
        _ => false,
    }
}

/// A request as the caller sends it.
pub struct CallerRequest<'a> {
    pub method: Method,
    pub uri: &'a str,
    pub branch: &'a str,
    pub call_id: &'a str,
    pub from: &'a str,
    pub to: &'a str,
    pub seq: u32,
}

impl CallerRequest<'_> {
    pub fn build(&self, via_host: &str) -> Request {
        let mut req = Request::new(self.method.clone(), self.uri.parse::<SipUri>().unwrap());
        req.headers.push(Header::new(
            "Via",
            format!("SIP/2.0/UDP {};branch={}", via_host, self.branch),
        ));
        req.headers.push(Header::new("Max-Forwards", "70"));
        req.headers.push(Header::new("From", self.from));
        req.headers.push(Header::new("To", self.to));
        req.headers.push(Header::new("Call-ID", self.call_id));
        req.headers
            .push(Header::new("CSeq", format!("{} {}", self.seq, self.method)));
        req
    }
}

pub fn invite(call_id: &str, branch: &str, seq: u32, cld: &str, body: Option<&str>) -> Request {
    let uri = format!("sip:{}@127.0.0.1:5060", cld);
    let to = format!("<sip:{}@127.0.0.1>", cld);
    let mut req = CallerRequest {
        method: Method::Invite,
        uri: &uri,
        branch,
        call_id,
        from: "\"Alice\" <sip:alice@10.0.0.1>;tag=a1",
        to: &to,
        seq,
    }
    .build(CALLER);
    req.headers
        .push(Header::new("Contact", format!("<sip:alice@{}>", CALLER)));
    if let Some(body) = body {
        req.headers.push(Header::new("Content-Type", "application/sdp"));
        req.body = body.as_bytes().to_vec();
    }
    req
}

/// Request inside the dialog a response of the B2BUA created, sent by the
/// caller.
pub fn in_dialog(invite: &Request, answer: &Response, method: Method, branch: &str, seq: u32) -> Request {
    let target = answer.contact().expect("Contact in answer").uri;
    let mut req = Request::new(method.clone(), target);
    req.headers.push(Header::new(
        "Via",
        format!("SIP/2.0/UDP {};branch={}", CALLER, branch),
    ));
    req.headers.push(Header::new("Max-Forwards", "70"));
    for name in ["From", "Call-ID"] {
        req.headers
            .push(invite.headers.get(name).expect("header").clone());
    }
    req.headers
        .push(answer.headers.get("To").expect("To").clone());
    req.headers
        .push(Header::new("CSeq", format!("{} {}", seq, method)));
    req
}

/// ACK for a non-2xx final response: same branch as the INVITE.
pub fn ack_failure(invite: &Request, resp: &Response) -> Request {
    let mut ack = Request::new(Method::Ack, invite.uri.clone());
    for name in ["Via", "Max-Forwards", "From", "Call-ID"] {
        ack.headers.push(invite.headers.get(name).expect("header").clone());
    }
    ack.headers.push(resp.headers.get("To").expect("To").clone());
    ack.headers.push(Header::new(
        "CSeq",
        format!("{} ACK", invite.cseq().unwrap().seq),
    ));
    ack
}

/// Response of the next hop, tagged and with a Contact.
pub fn answer(req: &Request, status: u16, tag: &str, contact_user: &str, body: Option<&str>) -> Response {
    let mut resp = make_response(req, status, None, Some(tag));
    resp.headers.push(Header::new(
        "Contact",
        format!("<sip:{}@{}>", contact_user, NEXT_HOP),
    ));
    if let Some(body) = body {
        resp.headers.push(Header::new("Content-Type", "application/sdp"));
        resp.body = body.as_bytes().to_vec();
    }
    resp
}

/// Request the next hop sends inside a dialog the B2BUA opened toward it.
pub fn from_callee(invite: &Request, answer: &Response, method: Method, branch: &str, seq: u32) -> Request {
    let target = invite.contact().expect("Contact in INVITE").uri;
    let mut req = Request::new(method.clone(), target);
    req.headers.push(Header::new(
        "Via",
        format!("SIP/2.0/UDP {};branch={}", NEXT_HOP, branch),
    ));
    req.headers.push(Header::new("Max-Forwards", "70"));
    let to = answer.headers.get("To").expect("To").value().to_string();
    let from = invite.headers.get("From").expect("From").value().to_string();
    req.headers.push(Header::new("From", to));
    req.headers.push(Header::new("To", from));
    req.headers
        .push(invite.headers.get("Call-ID").expect("Call-ID").clone());
    req.headers
        .push(Header::new("CSeq", format!("{} {}", seq, method)));
    req
}

/// Sets up a connected call and returns the caller's INVITE and the 200
/// it got, with the INVITE and 200 seen by the next hop.
pub async fn connect_call(h: &mut Harness, call_id: &str) -> (Request, Response, Request, Response) {
    let invite = invite(call_id, &format!("z9hG4bK-{}-1", call_id), 1, "1000", Some(CALLER_SDP));
    h.from_caller(invite.clone());
    h.caller_matching("100", |m| is_response_in(m, call_id, &Method::Invite, 100))
        .await;

    let outbound = expect_request(
        h.next_hop_matching("INVITE", |m| is_request_in(m, call_id, &Method::Invite))
            .await,
    );
    let ok = answer(&outbound, 200, "nh1", "1000", Some(CALLEE_SDP));
    h.from_next_hop(ok.clone());
    h.next_hop_matching("ACK", |m| is_request_in(m, call_id, &Method::Ack))
        .await;

    let answered = expect_response(
        h.caller_matching("200", |m| is_response_in(m, call_id, &Method::Invite, 200))
            .await,
    );
    let ack = in_dialog(&invite, &answered, Method::Ack, &format!("z9hG4bK-{}-ack", call_id), 1);
    h.from_caller(ack);
    (invite, answered, outbound, ok)
}

pub fn expect_request(msg: SipMessage) -> Request {
    match msg {
        SipMessage::Request(req) => req,
        SipMessage::Response(resp) => panic!("expected a request, got {}", resp.status),
    }
}

pub fn expect_response(msg: SipMessage) -> Response {
    match msg {
        SipMessage::Response(resp) => resp,
        SipMessage::Request(req) => panic!("expected a response, got {}", req.method),
    }
}

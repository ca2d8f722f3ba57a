use super::{
    client_invite, client_non_invite,
    endpoint::EndpointInner,
    key::TransactionKey,
    server_invite, server_non_invite,
};
use crate::{
    sip::{make_response, HasHeaders, Method, Request, Response, SipMessage},
    transport::{RecvTime, SipAddr, SipConnection, TransportKind},
    Error, Result,
};
use std::{
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Calling,
    Trying,
    Proceeding,
    Completed,
    /// RFC 6026: a 2xx went through an INVITE transaction.
    Accepted,
    Confirmed,
    Terminated,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    ClientInvite,
    ClientNonInvite,
    ServerInvite,
    ServerNonInvite,
}

impl TransactionType {
    pub fn is_client(&self) -> bool {
        matches!(
            self,
            TransactionType::ClientInvite | TransactionType::ClientNonInvite
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionTimer {
    TimerA(TransactionKey),
    TimerB(TransactionKey),
    TimerD(TransactionKey),
    TimerE(TransactionKey),
    TimerF(TransactionKey),
    TimerG(TransactionKey),
    TimerH(TransactionKey),
    TimerI(TransactionKey),
    TimerJ(TransactionKey),
    TimerK(TransactionKey),
    TimerL(TransactionKey),
    TimerM(TransactionKey),
}

impl TransactionTimer {
    pub fn key(&self) -> &TransactionKey {
        match self {
            TransactionTimer::TimerA(key)
            | TransactionTimer::TimerB(key)
            | TransactionTimer::TimerD(key)
            | TransactionTimer::TimerE(key)
            | TransactionTimer::TimerF(key)
            | TransactionTimer::TimerG(key)
            | TransactionTimer::TimerH(key)
            | TransactionTimer::TimerI(key)
            | TransactionTimer::TimerJ(key)
            | TransactionTimer::TimerK(key)
            | TransactionTimer::TimerL(key)
            | TransactionTimer::TimerM(key) => key,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            TransactionTimer::TimerA(_) => "TimerA",
            TransactionTimer::TimerB(_) => "TimerB",
            TransactionTimer::TimerD(_) => "TimerD",
            TransactionTimer::TimerE(_) => "TimerE",
            TransactionTimer::TimerF(_) => "TimerF",
            TransactionTimer::TimerG(_) => "TimerG",
            TransactionTimer::TimerH(_) => "TimerH",
            TransactionTimer::TimerI(_) => "TimerI",
            TransactionTimer::TimerJ(_) => "TimerJ",
            TransactionTimer::TimerK(_) => "TimerK",
            TransactionTimer::TimerL(_) => "TimerL",
            TransactionTimer::TimerM(_) => "TimerM",
        }
    }
}

impl fmt::Display for TransactionTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name(), self.key())
    }
}

/// Receives the responses of a client transaction, including the 408 and
/// 503 the endpoint synthesizes on timeout or transport failure.
pub trait ResponseReceiver: Send + Sync {
    fn recv_response(&self, resp: Response, rtime: RecvTime);
}

pub type ResponseReceiverRef = Arc<dyn ResponseReceiver>;

/// Transaction user for requests arriving from the network.
///
/// Implementations are invoked from the endpoint task with no endpoint
/// lock held, so they may call back into the endpoint.
pub trait RequestReceiver: Send + Sync {
    fn recv_request(&self, req: Request, tx: ServerTransaction, rtime: RecvTime);

    /// ACK for a 2xx. It travels outside any transaction.
    fn recv_ack(&self, _req: Request, _rtime: RecvTime) {}

    /// CANCEL for an INVITE still waiting for its final response. The
    /// CANCEL itself is already answered.
    fn recv_cancel(&self, _req: Request, invite: ServerTransaction, _rtime: RecvTime) {
        invite.reply(487, None).ok();
    }

    /// Whether a request outside any transaction belongs to this consumer.
    fn is_yours(&self, _req: &Request) -> bool {
        false
    }
}

pub type RequestReceiverRef = Arc<dyn RequestReceiver>;

/// Handle on a server transaction given to its transaction user.
#[derive(Clone, Debug)]
pub struct ServerTransaction {
    pub key: TransactionKey,
    pub original: Request,
    endpoint: Weak<EndpointInner>,
}

impl ServerTransaction {
    pub(super) fn new(key: TransactionKey, original: Request, endpoint: Weak<EndpointInner>) -> Self {
        ServerTransaction {
            key,
            original,
            endpoint,
        }
    }

    pub fn respond(&self, resp: Response) -> Result<()> {
        let endpoint = self.endpoint.upgrade().ok_or_else(|| {
            Error::TransactionError("endpoint is gone".to_string(), self.key.clone())
        })?;
        endpoint.respond(&self.key, resp)
    }

    pub fn reply(&self, status: u16, to_tag: Option<&str>) -> Result<()> {
        self.respond(make_response(&self.original, status, None, to_tag))
    }
}

/// What the endpoint must do after a transaction changed state. Produced
/// under the transaction table lock, carried out after it is released.
#[derive(Default)]
pub(super) struct TransactionStep {
    pub send: Vec<SipMessage>,
    pub deliver: Option<Response>,
    pub deliver_ack: Option<Request>,
    pub cancel: Option<Request>,
    pub terminated: bool,
}

impl TransactionStep {
    pub fn send(msg: impl Into<SipMessage>) -> Self {
        TransactionStep {
            send: vec![msg.into()],
            ..Default::default()
        }
    }

    pub fn terminate() -> Self {
        TransactionStep {
            terminated: true,
            ..Default::default()
        }
    }
}

pub(super) struct Transaction {
    pub key: TransactionKey,
    pub transaction_type: TransactionType,
    pub state: TransactionState,
    pub original: Request,
    pub destination: SipAddr,
    pub connection: Option<SipConnection>,
    pub reliable: bool,
    pub last_response: Option<Response>,
    pub last_ack: Option<Request>,
    pub response_receiver: Option<ResponseReceiverRef>,
    pub request_receiver: Option<RequestReceiverRef>,
    pub retransmit_timer: Option<u64>,
    pub timeout_timer: Option<u64>,
    pub interval: Duration,
    pub cancel_pending: bool,
    pub cancel_sent: bool,
}

impl Transaction {
    pub fn new_client(
        key: TransactionKey,
        original: Request,
        destination: SipAddr,
        connection: Option<SipConnection>,
        response_receiver: Option<ResponseReceiverRef>,
    ) -> Self {
        let reliable = match &connection {
            Some(connection) => connection.is_reliable(),
            None => destination.transport().is_reliable(),
        };
        let (transaction_type, state) = match original.method {
            Method::Invite => (TransactionType::ClientInvite, TransactionState::Calling),
            _ => (TransactionType::ClientNonInvite, TransactionState::Trying),
        };
        Transaction {
            key,
            transaction_type,
            state,
            original,
            destination,
            connection,
            reliable,
            last_response: None,
            last_ack: None,
            response_receiver,
            request_receiver: None,
            retransmit_timer: None,
            timeout_timer: None,
            interval: Duration::ZERO,
            cancel_pending: false,
            cancel_sent: false,
        }
    }

    /// Responses go back along the top Via, honouring received/rport.
    pub fn new_server(key: TransactionKey, original: Request, connection: SipConnection) -> Self {
        let destination = match original.via() {
            Ok(via) => SipAddr {
                r#type: via.transport.parse::<TransportKind>().ok(),
                addr: SipConnection::parse_target_from_via(&via),
            },
            Err(_) => connection.get_addr().clone(),
        };
        let (transaction_type, state) = match original.method {
            Method::Invite => (TransactionType::ServerInvite, TransactionState::Proceeding),
            _ => (TransactionType::ServerNonInvite, TransactionState::Trying),
        };
        Transaction {
            key,
            transaction_type,
            state,
            reliable: connection.is_reliable(),
            original,
            destination,
            connection: Some(connection),
            last_response: None,
            last_ack: None,
            response_receiver: None,
            request_receiver: None,
            retransmit_timer: None,
            timeout_timer: None,
            interval: Duration::ZERO,
            cancel_pending: false,
            cancel_sent: false,
        }
    }

    /// (Re)arms the retransmission timer.
    pub fn arm_retransmit(&mut self, endpoint: &EndpointInner, timer: TransactionTimer) {
        if let Some(id) = self.retransmit_timer.take() {
            endpoint.timers.cancel(id);
        }
        self.retransmit_timer = Some(endpoint.timers.timeout(self.interval, timer));
    }

    /// Replaces the timeout timer.
    pub fn arm_timeout(&mut self, endpoint: &EndpointInner, timer: TransactionTimer, after: Duration) {
        if let Some(id) = self.timeout_timer.take() {
            endpoint.timers.cancel(id);
        }
        self.timeout_timer = Some(endpoint.timers.timeout(after, timer));
    }

    pub fn cancel_retransmit(&mut self, endpoint: &EndpointInner) {
        if let Some(id) = self.retransmit_timer.take() {
            endpoint.timers.cancel(id);
        }
    }

    pub fn cancel_timers(&mut self, endpoint: &EndpointInner) {
        self.cancel_retransmit(endpoint);
        if let Some(id) = self.timeout_timer.take() {
            endpoint.timers.cancel(id);
        }
    }

    pub fn start(&mut self, endpoint: &EndpointInner) -> TransactionStep {
        match self.transaction_type {
            TransactionType::ClientInvite => client_invite::start(self, endpoint),
            TransactionType::ClientNonInvite => client_non_invite::start(self, endpoint),
            _ => TransactionStep::default(),
        }
    }

    pub fn on_response(&mut self, endpoint: &EndpointInner, resp: Response) -> TransactionStep {
        match self.transaction_type {
            TransactionType::ClientInvite => client_invite::on_response(self, endpoint, resp),
            TransactionType::ClientNonInvite => client_non_invite::on_response(self, endpoint, resp),
            _ => TransactionStep::default(),
        }
    }

    /// A request that matched this server transaction: a retransmission
    /// or the ACK of a non-2xx final response.
    pub fn on_request(&mut self, endpoint: &EndpointInner, req: Request) -> TransactionStep {
        match self.transaction_type {
            TransactionType::ServerInvite => server_invite::on_request(self, endpoint, req),
            TransactionType::ServerNonInvite => server_non_invite::on_request(self, req),
            _ => TransactionStep::default(),
        }
    }

    /// A response from the transaction user.
    pub fn respond(&mut self, endpoint: &EndpointInner, resp: Response) -> Result<TransactionStep> {
        match self.transaction_type {
            TransactionType::ServerInvite => server_invite::respond(self, endpoint, resp),
            TransactionType::ServerNonInvite => server_non_invite::respond(self, endpoint, resp),
            _ => Err(Error::TransactionError(
                "client transaction cannot respond".to_string(),
                self.key.clone(),
            )),
        }
    }

    pub fn on_timer(&mut self, endpoint: &EndpointInner, timer: &TransactionTimer) -> TransactionStep {
        match self.transaction_type {
            TransactionType::ClientInvite => client_invite::on_timer(self, endpoint, timer),
            TransactionType::ClientNonInvite => client_non_invite::on_timer(self, endpoint, timer),
            TransactionType::ServerInvite => server_invite::on_timer(self, endpoint, timer),
            TransactionType::ServerNonInvite => server_non_invite::on_timer(self, timer),
        }
    }

    /// The transport could not carry a message of this transaction. A
    /// pending client transaction reports 503 to its user.
    pub fn on_transport_error(&mut self) -> TransactionStep {
        let pending = matches!(
            self.state,
            TransactionState::Calling | TransactionState::Trying | TransactionState::Proceeding
        );
        if !pending {
            return TransactionStep::default();
        }
        let mut step = TransactionStep::terminate();
        if self.transaction_type.is_client() {
            step.deliver = Some(make_response(&self.original, 503, None, None));
        }
        self.state = TransactionState::Terminated;
        step
    }

    /// Final response the transaction synthesizes on Timer B or F.
    pub fn timeout_response(&mut self) -> TransactionStep {
        self.state = TransactionState::Terminated;
        let mut step = TransactionStep::terminate();
        step.deliver = Some(make_response(&self.original, 408, None, None));
        step
    }
}

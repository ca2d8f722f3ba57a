use super::{
    client_invite,
    key::{TransactionKey, TransactionRole},
    make_via_branch,
    timer::Timer,
    transaction::{
        RequestReceiverRef, ResponseReceiverRef, ServerTransaction, Transaction, TransactionState,
        TransactionStep, TransactionTimer,
    },
};
use crate::{
    sip::{make_response, HasHeaders, Header, Method, NameAddr, Request, Response, SipMessage, SipUri, Via},
    transport::{
        RecvTime, SipAddr, SipConnection, TransportEvent, TransportKind, TransportLayer,
    },
    Error, Result,
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
    time::{Duration, Instant},
};
use tokio::{
    select,
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const USER_AGENT: &str = "rsipb2bua/0.1";

#[derive(Debug, Clone)]
pub struct EndpointOption {
    pub t1: Duration,
    pub t2: Duration,
    pub t4: Duration,
    pub timer_interval: Duration,
}

impl Default for EndpointOption {
    fn default() -> Self {
        EndpointOption {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
            timer_interval: Duration::from_millis(20),
        }
    }
}

/// What the application does with a request that matched neither a
/// transaction nor a registered consumer.
pub enum NewDialogAction {
    /// Answer with this response and forget the request.
    Respond(Response),
    /// Hand the request, and the transaction's future CANCEL, to this
    /// receiver.
    Accept(RequestReceiverRef),
}

pub trait NewDialogHandler: Send + Sync {
    fn on_new_dialog(&self, req: &Request, rtime: RecvTime) -> NewDialogAction;
}

/// A message on its way to the transport.
struct Outgoing {
    msg: SipMessage,
    connection: Option<SipConnection>,
    destination: SipAddr,
    key: Option<TransactionKey>,
}

/// Everything a step needs once the transaction table is unlocked.
struct Effects {
    key: TransactionKey,
    step: TransactionStep,
    connection: Option<SipConnection>,
    destination: SipAddr,
    response_receiver: Option<ResponseReceiverRef>,
    request_receiver: Option<RequestReceiverRef>,
}

pub struct EndpointInner {
    pub user_agent: String,
    pub option: EndpointOption,
    pub transport_layer: TransportLayer,
    pub(super) timers: Timer<TransactionTimer>,
    transactions: Mutex<HashMap<TransactionKey, Transaction>>,
    consumers: Mutex<HashMap<String, Vec<RequestReceiverRef>>>,
    new_dialog_handler: Mutex<Option<Weak<dyn NewDialogHandler>>>,
    outgoing_sender: UnboundedSender<Outgoing>,
    outgoing_receiver: Mutex<Option<UnboundedReceiver<Outgoing>>>,
    cancel_token: CancellationToken,
    self_ref: Weak<EndpointInner>,
}

pub type EndpointInnerRef = Arc<EndpointInner>;

pub struct EndpointBuilder {
    user_agent: String,
    transport_layer: Option<TransportLayer>,
    cancel_token: Option<CancellationToken>,
    option: EndpointOption,
}

/// The transaction manager: owns the transactions, runs the timer wheel
/// and the send queue, and dispatches requests that start new dialogs.
#[derive(Clone)]
pub struct Endpoint {
    pub inner: EndpointInnerRef,
}

impl Default for EndpointBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointBuilder {
    pub fn new() -> Self {
        EndpointBuilder {
            user_agent: USER_AGENT.to_string(),
            transport_layer: None,
            cancel_token: None,
            option: EndpointOption::default(),
        }
    }

    pub fn with_user_agent(&mut self, user_agent: &str) -> &mut Self {
        self.user_agent = user_agent.to_string();
        self
    }

    pub fn with_transport_layer(&mut self, transport_layer: TransportLayer) -> &mut Self {
        self.transport_layer.replace(transport_layer);
        self
    }

    pub fn with_cancel_token(&mut self, cancel_token: CancellationToken) -> &mut Self {
        self.cancel_token.replace(cancel_token);
        self
    }

    pub fn with_option(&mut self, option: EndpointOption) -> &mut Self {
        self.option = option;
        self
    }

    pub fn with_timer_interval(&mut self, timer_interval: Duration) -> &mut Self {
        self.option.timer_interval = timer_interval;
        self
    }

    pub fn build(&mut self) -> Endpoint {
        let cancel_token = self.cancel_token.take().unwrap_or_default();
        let transport_layer = self
            .transport_layer
            .take()
            .unwrap_or_else(|| TransportLayer::new(cancel_token.child_token()));
        let (outgoing_sender, outgoing_receiver) = unbounded_channel();
        let user_agent = self.user_agent.clone();
        let option = self.option.clone();

        let inner = Arc::new_cyclic(|self_ref| EndpointInner {
            user_agent,
            option,
            transport_layer,
            timers: Timer::new(),
            transactions: Mutex::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
            new_dialog_handler: Mutex::new(None),
            outgoing_sender,
            outgoing_receiver: Mutex::new(Some(outgoing_receiver)),
            cancel_token,
            self_ref: self_ref.clone(),
        });
        Endpoint { inner }
    }
}

impl Endpoint {
    pub async fn serve(&self) {
        let inner = self.inner.clone();
        select! {
            _ = inner.cancel_token.cancelled() => {
                info!("endpoint cancelled");
            }
            r = inner.process_transport() => {
                if let Err(e) = r {
                    warn!("transport loop stopped: {}", e);
                }
            }
            r = inner.process_timer() => {
                if let Err(e) = r {
                    warn!("timer loop stopped: {}", e);
                }
            }
            r = inner.process_outgoing() => {
                if let Err(e) = r {
                    warn!("send loop stopped: {}", e);
                }
            }
        }
        info!("endpoint shutdown");
    }

    pub fn shutdown(&self) {
        self.inner.cancel_token.cancel();
    }

    pub fn get_addrs(&self) -> Vec<SipAddr> {
        self.inner.transport_layer.get_addrs()
    }
}

impl EndpointInner {
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    pub fn set_new_dialog_handler(&self, handler: &Arc<dyn NewDialogHandler>) {
        self.new_dialog_handler
            .lock()
            .unwrap()
            .replace(Arc::downgrade(handler));
    }

    /// Routes requests outside any transaction with this Call-ID to
    /// `receiver`, subject to its `is_yours`.
    pub fn register_consumer(&self, call_id: &str, receiver: RequestReceiverRef) {
        self.consumers
            .lock()
            .unwrap()
            .entry(call_id.to_string())
            .or_default()
            .push(receiver);
    }

    pub fn unregister_consumer(&self, call_id: &str, receiver: &RequestReceiverRef) {
        let mut consumers = self.consumers.lock().unwrap();
        if let Some(list) = consumers.get_mut(call_id) {
            list.retain(|r| !same_receiver(r, receiver));
            if list.is_empty() {
                consumers.remove(call_id);
            }
        }
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().unwrap().values().map(Vec::len).sum()
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.lock().unwrap().len()
    }

    pub fn local_addr(&self, kind: Option<TransportKind>) -> Option<SipAddr> {
        self.transport_layer.first_addr(kind)
    }

    /// Contact URI for dialogs created by this endpoint.
    pub fn local_contact(&self, user: Option<&str>) -> Result<SipUri> {
        let addr = self
            .local_addr(None)
            .ok_or_else(|| Error::EndpointError("no transport available".to_string()))?;
        let mut uri = SipUri::from(&addr);
        uri.user = user.map(|u| u.to_string());
        Ok(uri)
    }

    /// Starts a client transaction for `req` after prepending a Via with
    /// a fresh branch. Without an explicit destination the request goes to
    /// its first Route, else to its Request-URI.
    pub fn send_request(
        &self,
        mut req: Request,
        destination: Option<SipAddr>,
        receiver: Option<ResponseReceiverRef>,
    ) -> Result<TransactionKey> {
        let destination = destination.unwrap_or_else(|| request_destination(&req));
        let connection = self.transport_layer.find_connection(&destination);
        self.prepend_via(&mut req, &destination, connection.as_ref())?;
        if !req.headers.contains("Max-Forwards") {
            req.headers.push(Header::new("Max-Forwards", "70"));
        }
        self.start_client_transaction(req, destination, connection, receiver)
    }

    /// Sends the ACK for a 2xx. It is a transaction of its own with no
    /// response, so it goes out statelessly.
    pub fn send_ack(&self, mut ack: Request, destination: Option<SipAddr>) -> Result<()> {
        let destination = destination.unwrap_or_else(|| request_destination(&ack));
        let connection = self.transport_layer.find_connection(&destination);
        self.prepend_via(&mut ack, &destination, connection.as_ref())?;
        if !ack.headers.contains("Max-Forwards") {
            ack.headers.push(Header::new("Max-Forwards", "70"));
        }
        self.enqueue(Outgoing {
            msg: ack.into(),
            connection,
            destination,
            key: None,
        })
    }

    /// Cancels a pending INVITE. The CANCEL goes out at once when a
    /// provisional response was seen, otherwise when the first one arrives.
    pub fn cancel_request(&self, key: &TransactionKey) -> Result<()> {
        let effects = {
            let mut transactions = self.transactions.lock().unwrap();
            let tx = transactions.get_mut(key).ok_or_else(|| {
                Error::TransactionError("transaction not found".to_string(), key.clone())
            })?;
            let step = client_invite::cancel(tx, self);
            effects_of(tx, step)
        };
        self.run_effects(effects, RecvTime::now());
        Ok(())
    }

    /// Sends a response through the server transaction `key`. A 2xx to an
    /// INVITE whose transaction is already gone is sent statelessly.
    pub fn respond(&self, key: &TransactionKey, resp: Response) -> Result<()> {
        let outcome = {
            let mut transactions = self.transactions.lock().unwrap();
            match transactions.get_mut(key) {
                Some(tx) => {
                    let step = tx.respond(self, resp)?;
                    let effects = effects_of(tx, step);
                    if effects.step.terminated {
                        remove_transaction(&mut transactions, self, key);
                    }
                    Ok(effects)
                }
                None => Err(resp),
            }
        };
        match outcome {
            Ok(effects) => {
                self.run_effects(effects, RecvTime::now());
                Ok(())
            }
            Err(resp) if resp.is_success() && key.method() == Some(&Method::Invite) => {
                let msg = SipMessage::Response(resp);
                let destination = SipConnection::get_destination(&msg)?;
                self.enqueue(Outgoing {
                    msg,
                    connection: None,
                    destination,
                    key: None,
                })
            }
            Err(_) => Err(Error::TransactionError(
                "transaction not found".to_string(),
                key.clone(),
            )),
        }
    }

    fn prepend_via(
        &self,
        req: &mut Request,
        destination: &SipAddr,
        connection: Option<&SipConnection>,
    ) -> Result<()> {
        let local = match connection {
            Some(connection) => connection.get_addr().clone(),
            None => self
                .local_addr(destination.r#type)
                .ok_or_else(|| {
                    Error::TransportLayerError(
                        "no local address".to_string(),
                        destination.clone(),
                    )
                })?,
        };
        let transport = match local.transport() {
            TransportKind::Tcp => "TCP",
            TransportKind::Tls => "TLS",
            _ => "UDP",
        };
        let mut via = Via::new(transport, local.addr, &make_via_branch());
        via.set_param("rport", None);
        req.headers.push_top(via.into());
        Ok(())
    }

    fn start_client_transaction(
        &self,
        req: Request,
        destination: SipAddr,
        connection: Option<SipConnection>,
        receiver: Option<ResponseReceiverRef>,
    ) -> Result<TransactionKey> {
        let key = TransactionKey::from_request(&req, TransactionRole::Client)?;
        let mut tx = Transaction::new_client(key.clone(), req, destination, connection, receiver);
        debug!(key = %key, "client transaction created");
        let effects = {
            let mut transactions = self.transactions.lock().unwrap();
            let step = tx.start(self);
            let effects = effects_of(&tx, step);
            transactions.insert(key.clone(), tx);
            effects
        };
        self.run_effects(effects, RecvTime::now());
        Ok(key)
    }

    fn enqueue(&self, outgoing: Outgoing) -> Result<()> {
        self.outgoing_sender
            .send(outgoing)
            .map_err(|e| Error::EndpointError(e.to_string()))
    }

    fn run_effects(&self, effects: Effects, rtime: RecvTime) {
        let Effects {
            key,
            step,
            connection,
            destination,
            response_receiver,
            request_receiver,
        } = effects;

        for msg in step.send {
            self.enqueue(Outgoing {
                msg,
                connection: connection.clone(),
                destination: destination.clone(),
                key: Some(key.clone()),
            })
            .ok();
        }
        if let Some(cancel) = step.cancel {
            if let Err(e) =
                self.start_client_transaction(cancel, destination, connection, None)
            {
                warn!(key = %key, "failed to send CANCEL: {}", e);
            }
        }
        if let (Some(resp), Some(receiver)) = (step.deliver, response_receiver) {
            receiver.recv_response(resp, rtime);
        }
        if let (Some(ack), Some(receiver)) = (step.deliver_ack, request_receiver) {
            receiver.recv_ack(ack, rtime);
        }
    }

    fn on_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Incoming(SipMessage::Request(req), connection, source, rtime) => {
                trace!(%source, "received {} {}", req.method, req.uri);
                self.on_received_request(req, connection, rtime);
            }
            TransportEvent::Incoming(SipMessage::Response(resp), _, source, rtime) => {
                trace!(%source, "received {} {}", resp.status, resp.reason);
                self.on_received_response(resp, rtime);
            }
            TransportEvent::New(connection) => {
                self.transport_layer.register_stream(connection);
            }
            TransportEvent::Closed(connection) => {
                self.transport_layer.unregister_stream(&connection);
            }
        }
    }

    fn on_received_response(&self, resp: Response, rtime: RecvTime) {
        let key = match TransactionKey::from_response(&resp) {
            Ok(key) => key,
            Err(e) => {
                warn!("dropping response without transaction key: {}", e);
                return;
            }
        };
        let effects = {
            let mut transactions = self.transactions.lock().unwrap();
            let Some(tx) = transactions.get_mut(&key) else {
                debug!(key = %key, status = resp.status, "response does not match any transaction");
                return;
            };
            let step = tx.on_response(self, resp);
            let effects = effects_of(tx, step);
            if effects.step.terminated {
                remove_transaction(&mut transactions, self, &key);
            }
            effects
        };
        self.run_effects(effects, rtime);
    }

    fn on_received_request(&self, req: Request, connection: SipConnection, rtime: RecvTime) {
        if let Err(e) = req.validate() {
            warn!("invalid request {} {}: {}", req.method, req.uri, e);
            if req.method != Method::Ack && req.via().is_ok() {
                let msg = SipMessage::Response(make_response(&req, 400, None, None));
                if let Ok(destination) = SipConnection::get_destination(&msg) {
                    self.enqueue(Outgoing {
                        msg,
                        connection: Some(connection),
                        destination,
                        key: None,
                    })
                    .ok();
                }
            }
            return;
        }
        let key = match TransactionKey::from_request(&req, TransactionRole::Server) {
            Ok(key) => key,
            Err(e) => {
                warn!("dropping request without transaction key: {}", e);
                return;
            }
        };

        let existing = {
            let mut transactions = self.transactions.lock().unwrap();
            match transactions.get_mut(&key) {
                Some(tx) => {
                    let step = tx.on_request(self, req.clone());
                    let effects = effects_of(tx, step);
                    if effects.step.terminated {
                        remove_transaction(&mut transactions, self, &key);
                    }
                    Some(effects)
                }
                None => None,
            }
        };
        if let Some(effects) = existing {
            self.run_effects(effects, rtime);
            return;
        }

        match req.method {
            Method::Ack => {
                match self.find_consumer(&req) {
                    Some(receiver) => receiver.recv_ack(req, rtime),
                    None => debug!(key = %key, "ACK does not match any dialog"),
                }
                return;
            }
            Method::Cancel => {
                self.on_received_cancel(key, req, connection, rtime);
                return;
            }
            _ => {}
        }

        let tx = Transaction::new_server(key.clone(), req.clone(), connection);
        self.transactions.lock().unwrap().insert(key.clone(), tx);
        let server_tx = ServerTransaction::new(key.clone(), req.clone(), self.self_ref.clone());

        if let Some(receiver) = self.find_consumer(&req) {
            self.set_request_receiver(&key, &receiver);
            receiver.recv_request(req, server_tx, rtime);
            return;
        }

        let handler = self
            .new_dialog_handler
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|handler| handler.upgrade());
        let action = match handler {
            Some(handler) => handler.on_new_dialog(&req, rtime),
            None => {
                let has_tag = req.to_header().map(|to| to.tag().is_some()).unwrap_or(false);
                NewDialogAction::Respond(make_response(
                    &req,
                    if has_tag { 481 } else { 501 },
                    None,
                    None,
                ))
            }
        };
        match action {
            NewDialogAction::Respond(resp) => {
                if let Err(e) = self.respond(&key, resp) {
                    warn!(key = %key, "failed to respond: {}", e);
                }
            }
            NewDialogAction::Accept(receiver) => {
                self.set_request_receiver(&key, &receiver);
                receiver.recv_request(req, server_tx, rtime);
            }
        }
    }

    /// The CANCEL is answered here. The INVITE it refers to gets its 487
    /// from the receiver of that INVITE.
    fn on_received_cancel(
        &self,
        key: TransactionKey,
        req: Request,
        connection: SipConnection,
        rtime: RecvTime,
    ) {
        let invite_key = key.with_method(Method::Invite);
        let invite = {
            let transactions = self.transactions.lock().unwrap();
            transactions.get(&invite_key).map(|tx| {
                let to_tag = tx
                    .last_response
                    .as_ref()
                    .and_then(|resp| resp.to_header().ok())
                    .and_then(|to| to.tag().map(|t| t.to_string()));
                (tx.state, tx.request_receiver.clone(), tx.original.clone(), to_tag)
            })
        };

        let tx = Transaction::new_server(key.clone(), req.clone(), connection);
        self.transactions.lock().unwrap().insert(key.clone(), tx);

        let Some((state, receiver, original, to_tag)) = invite else {
            self.respond(&key, make_response(&req, 481, None, None)).ok();
            return;
        };
        self.respond(&key, make_response(&req, 200, None, to_tag.as_deref()))
            .ok();
        if state != TransactionState::Proceeding {
            return;
        }
        let invite_tx = ServerTransaction::new(invite_key, original, self.self_ref.clone());
        match receiver {
            Some(receiver) => receiver.recv_cancel(req, invite_tx, rtime),
            None => {
                invite_tx.reply(487, to_tag.as_deref()).ok();
            }
        }
    }

    fn set_request_receiver(&self, key: &TransactionKey, receiver: &RequestReceiverRef) {
        if let Some(tx) = self.transactions.lock().unwrap().get_mut(key) {
            tx.request_receiver = Some(receiver.clone());
        }
    }

    fn find_consumer(&self, req: &Request) -> Option<RequestReceiverRef> {
        let call_id = req.call_id().ok()?;
        let candidates = self.consumers.lock().unwrap().get(call_id).cloned()?;
        candidates.into_iter().find(|receiver| receiver.is_yours(req))
    }

    fn on_send_failure(&self, key: Option<TransactionKey>, error: &Error) {
        let Some(key) = key else {
            return;
        };
        warn!(key = %key, "send failed: {}", error);
        let effects = {
            let mut transactions = self.transactions.lock().unwrap();
            let Some(tx) = transactions.get_mut(&key) else {
                return;
            };
            let step = tx.on_transport_error();
            let effects = effects_of(tx, step);
            if effects.step.terminated {
                remove_transaction(&mut transactions, self, &key);
            }
            effects
        };
        self.run_effects(effects, RecvTime::now());
    }

    async fn process_transport(&self) -> Result<()> {
        let (sender, mut receiver) = unbounded_channel();
        self.transport_layer.serve_listens(sender).await?;
        while let Some(event) = receiver.recv().await {
            self.on_transport_event(event);
        }
        Ok(())
    }

    async fn process_timer(&self) -> Result<()> {
        loop {
            for timer in self.timers.poll(Instant::now()) {
                let key = timer.key().clone();
                let effects = {
                    let mut transactions = self.transactions.lock().unwrap();
                    let Some(tx) = transactions.get_mut(&key) else {
                        continue;
                    };
                    trace!("{} fired in {}", timer, tx.state);
                    let step = tx.on_timer(self, &timer);
                    let effects = effects_of(tx, step);
                    if effects.step.terminated {
                        remove_transaction(&mut transactions, self, &key);
                    }
                    effects
                };
                self.run_effects(effects, RecvTime::now());
            }
            tokio::time::sleep(self.option.timer_interval).await;
        }
    }

    async fn process_outgoing(&self) -> Result<()> {
        let mut receiver = self
            .outgoing_receiver
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::EndpointError("send queue already served".to_string()))?;

        while let Some(outgoing) = receiver.recv().await {
            let Outgoing {
                msg,
                connection,
                destination,
                key,
            } = outgoing;
            let connection = match connection {
                Some(connection) => connection,
                None => match self.transport_layer.lookup(&destination).await {
                    Ok(connection) => connection,
                    Err(e) => {
                        self.on_send_failure(key, &e);
                        continue;
                    }
                },
            };
            if let Err(e) = connection.send(msg, Some(&destination)).await {
                self.on_send_failure(key, &e);
            }
        }
        Ok(())
    }
}

fn effects_of(tx: &Transaction, step: TransactionStep) -> Effects {
    Effects {
        key: tx.key.clone(),
        step,
        connection: tx.connection.clone(),
        destination: tx.destination.clone(),
        response_receiver: tx.response_receiver.clone(),
        request_receiver: tx.request_receiver.clone(),
    }
}

fn remove_transaction(
    transactions: &mut HashMap<TransactionKey, Transaction>,
    endpoint: &EndpointInner,
    key: &TransactionKey,
) {
    if let Some(mut tx) = transactions.remove(key) {
        tx.cancel_timers(endpoint);
        debug!(key = %key, "transaction terminated");
    }
}

fn same_receiver(a: &RequestReceiverRef, b: &RequestReceiverRef) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// First Route when present, else the Request-URI.
pub fn request_destination(req: &Request) -> SipAddr {
    match req
        .headers
        .get("Route")
        .and_then(|route| route.typed::<NameAddr>().ok())
    {
        Some(route) => SipAddr::from(&route.uri),
        None => SipAddr::from(&req.uri),
    }
}

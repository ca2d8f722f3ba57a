use super::{authenticate::Credential, dialog::Dialog, DialogId};
use crate::{
    call::event::{CcEvent, CcEventKind, MsgBody},
    sip::{HasHeaders, Header, HostPort, Method, NameAddr, Request, Response},
    transaction::{
        make_tag, EndpointInnerRef, RequestReceiver, RequestReceiverRef, ResponseReceiver,
        ServerTransaction, TransactionKey,
    },
    transport::{RecvTime, SipAddr},
    Error, Result,
};
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{select, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Identifies a leg inside its call controller.
pub type LegId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UaRole {
    Uac,
    Uas,
}

/// Leg state. Authentication retries, re-INVITEs and a held ACK are
/// side states tracked next to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UaState {
    Idle,
    Trying,
    Ringing,
    /// CANCEL sent, waiting for the INVITE to finish.
    Cancelling,
    Connected,
    /// BYE sent, waiting for its response.
    Disconnecting,
    /// Dialog over, lingering for retransmissions.
    Disconnected,
    Dead,
}

impl fmt::Display for UaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UaTimer {
    /// Call duration limit.
    Credit,
    /// Resends the 2xx until the ACK arrives.
    AnswerRetransmit,
    /// Gives up on the ACK of a 2xx.
    AckTimeout,
    /// Gives up on the answer to a late offer.
    LateOfferAnswer,
    Dead,
}

pub enum UaOutput {
    Event(CcEvent),
    /// The leg finished; nothing more will come from it.
    Dead,
}

impl fmt::Debug for UaOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UaOutput::Event(event) => write!(f, "Event({})", event),
            UaOutput::Dead => write!(f, "Dead"),
        }
    }
}

/// What a leg reports to. Every call takes the owner's lock before it
/// touches the leg.
pub trait UaDriver: Send + Sync {
    fn on_request(&self, leg: LegId, req: Request, tx: ServerTransaction, rtime: RecvTime);
    fn on_ack(&self, leg: LegId, req: Request, rtime: RecvTime);
    fn on_cancel(&self, leg: LegId, req: Request, invite: ServerTransaction, rtime: RecvTime);
    fn on_response(&self, leg: LegId, resp: Response, rtime: RecvTime);
    fn on_timer(&self, leg: LegId, timer: UaTimer, generation: u64);
}

/// The face a leg shows to the transaction layer: receives its requests
/// and responses and forwards them to the driver under the leg's id.
pub struct LegHandle {
    pub leg: LegId,
    local_tag: String,
    driver: Weak<dyn UaDriver>,
}

impl RequestReceiver for LegHandle {
    fn recv_request(&self, req: Request, tx: ServerTransaction, rtime: RecvTime) {
        match self.driver.upgrade() {
            Some(driver) => driver.on_request(self.leg, req, tx, rtime),
            None => {
                tx.reply(481, None).ok();
            }
        }
    }

    fn recv_ack(&self, req: Request, rtime: RecvTime) {
        if let Some(driver) = self.driver.upgrade() {
            driver.on_ack(self.leg, req, rtime);
        }
    }

    fn recv_cancel(&self, req: Request, invite: ServerTransaction, rtime: RecvTime) {
        match self.driver.upgrade() {
            Some(driver) => driver.on_cancel(self.leg, req, invite, rtime),
            None => {
                invite.reply(487, None).ok();
            }
        }
    }

    fn is_yours(&self, req: &Request) -> bool {
        req.to_header()
            .map(|to| to.tag() == Some(self.local_tag.as_str()))
            .unwrap_or(false)
    }
}

impl ResponseReceiver for LegHandle {
    fn recv_response(&self, resp: Response, rtime: RecvTime) {
        if let Some(driver) = self.driver.upgrade() {
            driver.on_response(self.leg, resp, rtime);
        }
    }
}

#[derive(Debug, Clone)]
pub struct UaOptions {
    /// Name carried as the origin of emitted events.
    pub origin: String,
    /// Where a client leg sends its requests.
    pub destination: Option<SipAddr>,
    /// Host of the Request-URI a client leg builds from the called number.
    pub remote_host: Option<HostPort>,
    pub credential: Option<Credential>,
    pub credit_time: Option<Duration>,
    pub dead_delay: Duration,
    pub late_offer_timeout: Duration,
}

impl Default for UaOptions {
    fn default() -> Self {
        UaOptions {
            origin: String::new(),
            destination: None,
            remote_host: None,
            credential: None,
            credit_time: None,
            dead_delay: Duration::from_secs(32),
            late_offer_timeout: Duration::from_secs(32),
        }
    }
}

/// One call leg.
///
/// A `Ua` has no lock of its own. It is owned by its call controller and
/// only touched while the controller's lock is held; every entry point
/// returns the events the controller has to route next.
pub struct Ua {
    pub leg: LegId,
    pub role: UaRole,
    pub(super) state: UaState,
    pub(super) endpoint: EndpointInnerRef,
    pub(super) options: UaOptions,
    pub(super) dialog: Option<Dialog>,
    pub(super) local_tag: String,
    pub(super) call_id: Option<String>,
    handle: Arc<LegHandle>,
    driver: Weak<dyn UaDriver>,

    /// Initial INVITE being answered.
    pub(super) invite_tx: Option<ServerTransaction>,
    /// 2xx being retransmitted until the ACK, with its transaction.
    pub(super) answer: Option<(ServerTransaction, Response)>,
    pub(super) answer_interval: Duration,
    /// The 2xx sent carried an offer, so the ACK carries the answer.
    pub(super) expect_ack_body: bool,

    /// Last INVITE this leg sent, before the transaction layer added a Via.
    pub(super) invite: Option<Request>,
    pub(super) invite_key: Option<TransactionKey>,
    pub(super) auth_attempted: bool,
    pub(super) local_seq: u32,
    /// CSeq of a 2xx whose ACK waits for an answer from the peer leg.
    pub(super) held_ack: Option<u32>,
    pub(super) last_ack: Option<Request>,

    /// re-INVITE or UPDATE from the peer waiting for the other leg.
    pub(super) reinvite_tx: Option<ServerTransaction>,
    /// re-INVITE this leg sent and whose final response is pending.
    pub(super) reinvite_out: Option<Request>,

    timers: HashMap<UaTimer, u64>,
    generation: u64,
    cancel_token: CancellationToken,
}

impl Ua {
    pub fn new(
        role: UaRole,
        leg: LegId,
        endpoint: EndpointInnerRef,
        driver: Weak<dyn UaDriver>,
        options: UaOptions,
    ) -> Self {
        let local_tag = make_tag();
        let handle = Arc::new(LegHandle {
            leg,
            local_tag: local_tag.clone(),
            driver: driver.clone(),
        });
        let cancel_token = endpoint.cancel_token().child_token();
        let answer_interval = endpoint.option.t1;
        Ua {
            leg,
            role,
            state: UaState::Idle,
            endpoint,
            options,
            dialog: None,
            local_tag,
            call_id: None,
            handle,
            driver,
            invite_tx: None,
            answer: None,
            answer_interval,
            expect_ack_body: false,
            invite: None,
            invite_key: None,
            auth_attempted: false,
            local_seq: 1,
            held_ack: None,
            last_ack: None,
            reinvite_tx: None,
            reinvite_out: None,
            timers: HashMap::new(),
            generation: 0,
            cancel_token,
        }
    }

    pub fn state(&self) -> UaState {
        self.state
    }

    pub fn is_dead(&self) -> bool {
        self.state == UaState::Dead
    }

    pub fn handle(&self) -> Arc<LegHandle> {
        self.handle.clone()
    }

    pub fn local_tag(&self) -> &str {
        &self.local_tag
    }

    pub fn dialog_id(&self) -> Option<&DialogId> {
        self.dialog.as_ref().map(|d| &d.id)
    }

    pub fn call_id(&self) -> Option<&str> {
        self.call_id.as_deref()
    }

    /// Routes requests of `call_id` that carry this leg's tag here.
    pub(super) fn register(&mut self, call_id: &str) {
        if self.call_id.is_some() {
            return;
        }
        self.call_id = Some(call_id.to_string());
        let receiver: RequestReceiverRef = self.handle.clone();
        self.endpoint.register_consumer(call_id, receiver);
    }

    fn unregister(&mut self) {
        if let Some(call_id) = self.call_id.take() {
            let receiver: RequestReceiverRef = self.handle.clone();
            self.endpoint.unregister_consumer(&call_id, &receiver);
        }
    }

    pub(super) fn event(&self, kind: CcEventKind, rtime: RecvTime) -> UaOutput {
        UaOutput::Event(CcEvent::new(kind, rtime, &self.options.origin))
    }

    pub(super) fn arm(&mut self, timer: UaTimer, after: Duration) {
        self.generation += 1;
        let generation = self.generation;
        self.timers.insert(timer, generation);

        let driver = self.driver.clone();
        let leg = self.leg;
        let token = self.cancel_token.clone();
        tokio::spawn(async move {
            select! {
                _ = token.cancelled() => {}
                _ = sleep(after) => {
                    if let Some(driver) = driver.upgrade() {
                        driver.on_timer(leg, timer, generation);
                    }
                }
            }
        });
    }

    pub(super) fn disarm(&mut self, timer: UaTimer) {
        self.timers.remove(&timer);
    }

    pub fn is_armed(&self, timer: UaTimer) -> bool {
        self.timers.contains_key(&timer)
    }

    /// A timer fired. Stale firings of re-armed or disarmed timers are
    /// ignored.
    pub fn on_timer(&mut self, timer: UaTimer, generation: u64) -> Result<Vec<UaOutput>> {
        if self.timers.get(&timer) != Some(&generation) {
            return Ok(vec![]);
        }
        self.timers.remove(&timer);
        debug!(leg = self.leg, state = %self.state, "{:?} fired", timer);
        let rtime = RecvTime::now();
        match timer {
            UaTimer::Credit => {
                info!(call_id = ?self.call_id, "credit time expired");
                self.hangup(rtime)
            }
            UaTimer::AnswerRetransmit => self.retransmit_answer(),
            UaTimer::AckTimeout => {
                warn!(call_id = ?self.call_id, "no ACK for 2xx");
                self.answer = None;
                self.hangup(rtime)
            }
            UaTimer::LateOfferAnswer => {
                warn!(call_id = ?self.call_id, "no answer for late offer");
                if let Some(seq) = self.held_ack.take() {
                    self.send_ack(seq, None)?;
                }
                self.hangup(rtime)
            }
            UaTimer::Dead => Ok(self.go_dead()),
        }
    }

    /// BYE from this side, with Disconnect reported to the controller.
    fn hangup(&mut self, rtime: RecvTime) -> Result<Vec<UaOutput>> {
        if self.state != UaState::Connected {
            return Ok(vec![]);
        }
        self.send_bye()?;
        Ok(vec![self.event(CcEventKind::Disconnect { redirect_url: None }, rtime)])
    }

    /// The dialog is over. The leg stays registered for a while so that
    /// retransmissions are still absorbed, then reports Dead.
    pub(super) fn disconnected(&mut self) {
        if matches!(self.state, UaState::Disconnected | UaState::Dead) {
            return;
        }
        debug!(leg = self.leg, "{} -> Disconnected", self.state);
        self.state = UaState::Disconnected;
        self.timers.clear();
        self.answer = None;
        let delay = self.options.dead_delay;
        self.arm(UaTimer::Dead, delay);
    }

    fn go_dead(&mut self) -> Vec<UaOutput> {
        self.state = UaState::Dead;
        self.timers.clear();
        self.cancel_token.cancel();
        self.unregister();
        vec![UaOutput::Dead]
    }

    pub(super) fn connected(&mut self) {
        self.state = UaState::Connected;
        if let Some(credit) = self.options.credit_time {
            self.arm(UaTimer::Credit, credit);
        }
    }

    /// Sends an in-dialog request and returns it as built.
    pub(super) fn send_in_dialog(
        &mut self,
        method: Method,
        body: Option<&MsgBody>,
        extra_headers: &[Header],
    ) -> Result<Request> {
        let destination = self.in_dialog_destination()?;
        let dialog = self.dialog.as_mut().ok_or_else(|| {
            Error::EndpointError(format!("{} outside of a dialog", method))
        })?;
        let mut req = dialog.make_request(method);
        for header in extra_headers {
            req.headers.push(header.clone());
        }
        set_body(&mut req.headers, &mut req.body, body);
        let receiver = self.handle.clone();
        self.endpoint
            .send_request(req.clone(), Some(destination), Some(receiver))?;
        Ok(req)
    }

    pub(super) fn send_bye(&mut self) -> Result<()> {
        self.send_in_dialog(Method::Bye, None, &[])?;
        self.state = UaState::Disconnecting;
        self.disarm(UaTimer::Credit);
        Ok(())
    }

    pub(super) fn send_ack(&mut self, seq: u32, body: Option<&MsgBody>) -> Result<()> {
        let destination = self.in_dialog_destination()?;
        let dialog = self
            .dialog
            .as_ref()
            .ok_or_else(|| Error::EndpointError("ACK outside of a dialog".to_string()))?;
        let mut ack = dialog.make_ack(seq);
        set_body(&mut ack.headers, &mut ack.body, body);
        self.endpoint.send_ack(ack.clone(), Some(destination))?;
        self.last_ack = Some(ack);
        Ok(())
    }

    pub(super) fn in_dialog_destination(&self) -> Result<SipAddr> {
        let dialog = self
            .dialog
            .as_ref()
            .ok_or_else(|| Error::EndpointError("no dialog".to_string()))?;
        // a client leg keeps using its configured next hop as outbound proxy
        match (&self.role, &self.options.destination) {
            (UaRole::Uac, Some(destination)) if dialog.route_set.is_empty() => {
                Ok(destination.clone())
            }
            _ => Ok(dialog.next_hop()),
        }
    }

    /// Response to a request of the peer, with this leg's tag and, for
    /// dialog-creating responses, its Contact.
    pub(super) fn make_response(
        &self,
        req: &Request,
        status: u16,
        reason: Option<&str>,
        body: Option<&MsgBody>,
    ) -> Response {
        let mut resp = self.endpoint.make_response(req, status, Some(&self.local_tag), None);
        if let Some(reason) = reason {
            resp.reason = reason.to_string();
        }
        let needs_contact = status > 100
            && status < 300
            && matches!(req.method, Method::Invite | Method::Update | Method::Refer);
        if needs_contact {
            if let Some(dialog) = &self.dialog {
                resp.headers
                    .push(NameAddr::new(dialog.local_contact.clone()).to_header("Contact"));
            }
        }
        set_body(&mut resp.headers, &mut resp.body, body);
        resp
    }

    /// Sends a 2xx to an INVITE and resends it until the ACK comes.
    pub(super) fn send_answer(&mut self, tx: ServerTransaction, resp: Response) -> Result<()> {
        tx.respond(resp.clone())?;
        self.answer_interval = self.endpoint.option.t1;
        self.answer = Some((tx, resp));
        let (interval, ack_timeout) = (self.answer_interval, self.endpoint.option.t1 * 64);
        self.arm(UaTimer::AnswerRetransmit, interval);
        self.arm(UaTimer::AckTimeout, ack_timeout);
        Ok(())
    }

    fn retransmit_answer(&mut self) -> Result<Vec<UaOutput>> {
        let Some((tx, resp)) = &self.answer else {
            return Ok(vec![]);
        };
        tx.respond(resp.clone())?;
        self.answer_interval = (self.answer_interval * 2).min(self.endpoint.option.t2);
        let interval = self.answer_interval;
        self.arm(UaTimer::AnswerRetransmit, interval);
        Ok(vec![])
    }

    /// ACK from the peer. Ends the 2xx retransmission it answers; when
    /// the 2xx carried an offer, its body is the answer for the other leg.
    pub fn recv_ack(&mut self, req: Request, rtime: RecvTime) -> Result<Vec<UaOutput>> {
        let seq = req.cseq()?.seq;
        let answered = match &self.answer {
            Some((tx, _)) => tx.original.cseq()?.seq == seq,
            None => false,
        };
        if !answered {
            debug!(leg = self.leg, seq, "ACK without pending 2xx");
            return Ok(vec![]);
        }
        self.answer = None;
        self.disarm(UaTimer::AnswerRetransmit);
        self.disarm(UaTimer::AckTimeout);
        if !self.expect_ack_body {
            return Ok(vec![]);
        }
        self.expect_ack_body = false;
        match MsgBody::from_message(&req) {
            Some(body) => Ok(vec![self.event(
                CcEventKind::Connect {
                    status: 200,
                    reason: "OK".to_string(),
                    body: Some(body),
                },
                rtime,
            )]),
            None => Ok(vec![]),
        }
    }

    /// An event from the controller for this leg.
    pub fn recv_event(&mut self, event: CcEvent) -> Result<Vec<UaOutput>> {
        debug!(leg = self.leg, state = %self.state, "recv {}", event);
        match self.role {
            UaRole::Uac => self.uac_recv_event(event),
            UaRole::Uas => self.uas_recv_event(event),
        }
    }

    pub fn recv_request(
        &mut self,
        req: Request,
        tx: ServerTransaction,
        rtime: RecvTime,
    ) -> Result<Vec<UaOutput>> {
        if self.state == UaState::Idle && self.role == UaRole::Uas && req.method == Method::Invite
        {
            return self.uas_recv_invite(req, tx, rtime);
        }
        self.recv_in_dialog(req, tx, rtime)
    }

    pub fn recv_cancel(
        &mut self,
        _req: Request,
        invite: ServerTransaction,
        rtime: RecvTime,
    ) -> Result<Vec<UaOutput>> {
        match self.role {
            UaRole::Uas => self.uas_recv_cancel(invite, rtime),
            UaRole::Uac => {
                invite.reply(487, Some(&self.local_tag))?;
                Ok(vec![])
            }
        }
    }

    pub fn recv_response(&mut self, resp: Response, rtime: RecvTime) -> Result<Vec<UaOutput>> {
        let cseq = resp.cseq()?;
        match cseq.method {
            Method::Invite => {
                let reinvite = self
                    .reinvite_out
                    .as_ref()
                    .map(|req| req.cseq().map(|c| c.seq == cseq.seq).unwrap_or(false))
                    .unwrap_or(false);
                if reinvite {
                    self.recv_reinvite_response(resp, rtime)
                } else if self.role == UaRole::Uac {
                    self.uac_recv_invite_response(resp, rtime)
                } else {
                    self.resend_ack_for(&resp)?;
                    Ok(vec![])
                }
            }
            Method::Bye => {
                if resp.is_final() && self.state == UaState::Disconnecting {
                    self.disconnected();
                }
                Ok(vec![])
            }
            _ => {
                if matches!(resp.status, 408 | 481) && self.state == UaState::Connected {
                    warn!(call_id = ?self.call_id, "in-dialog {} failed with {}", cseq.method, resp.status);
                    self.disconnected();
                    return Ok(vec![self.event(CcEventKind::Disconnect { redirect_url: None }, rtime)]);
                }
                Ok(vec![])
            }
        }
    }

    /// A retransmitted 2xx means the ACK got lost.
    pub(super) fn resend_ack_for(&mut self, resp: &Response) -> Result<()> {
        if !resp.is_success() {
            return Ok(());
        }
        let seq = resp.cseq()?.seq;
        if let Some(ack) = &self.last_ack {
            if ack.cseq()?.seq == seq {
                let destination = self.in_dialog_destination()?;
                self.endpoint.send_ack(ack.clone(), Some(destination))?;
            }
        }
        Ok(())
    }

    /// Requests from the peer inside the dialog.
    fn recv_in_dialog(
        &mut self,
        req: Request,
        tx: ServerTransaction,
        rtime: RecvTime,
    ) -> Result<Vec<UaOutput>> {
        let in_dialog = matches!(
            self.state,
            UaState::Connected | UaState::Disconnecting | UaState::Disconnected
        );
        let Some(dialog) = self.dialog.as_mut().filter(|_| in_dialog) else {
            tx.respond(self.endpoint.make_response(&req, 481, None, None))?;
            return Ok(vec![]);
        };
        if !dialog.accept_remote_seq(&req) {
            tx.respond(self.make_response(&req, 500, Some("CSeq Out of Order"), None))?;
            return Ok(vec![]);
        }
        let connected = self.state == UaState::Connected;
        match req.method {
            Method::Bye => {
                tx.respond(self.make_response(&req, 200, None, None))?;
                let redirect_url = req
                    .headers
                    .get("Also")
                    .and_then(|also| also.typed::<NameAddr>().ok());
                let was_connected = connected;
                self.disconnected();
                if !was_connected {
                    return Ok(vec![]);
                }
                Ok(vec![self.event(CcEventKind::Disconnect { redirect_url }, rtime)])
            }
            Method::Invite | Method::Update if connected => {
                if self.reinvite_tx.is_some() || self.reinvite_out.is_some() || self.answer.is_some() {
                    tx.respond(self.make_response(&req, 491, None, None))?;
                    return Ok(vec![]);
                }
                let body = MsgBody::from_message(&req);
                if req.method == Method::Update && body.is_none() {
                    tx.respond(self.make_response(&req, 200, None, None))?;
                    return Ok(vec![]);
                }
                if let Some(dialog) = self.dialog.as_mut() {
                    dialog.update_target(&req);
                }
                if req.method == Method::Invite {
                    tx.respond(self.make_response(&req, 100, None, None))?;
                }
                self.reinvite_tx = Some(tx);
                Ok(vec![self.event(CcEventKind::Update { body }, rtime)])
            }
            Method::Info if connected => {
                tx.respond(self.make_response(&req, 200, None, None))?;
                let body = MsgBody::from_message(&req);
                Ok(vec![self.event(CcEventKind::Info { body }, rtime)])
            }
            Method::Refer if connected => {
                let refer_to = req
                    .headers
                    .get("Refer-To")
                    .and_then(|h| h.typed::<NameAddr>().ok());
                let Some(refer_to) = refer_to else {
                    tx.respond(self.make_response(&req, 400, Some("Missing Refer-To"), None))?;
                    return Ok(vec![]);
                };
                tx.respond(self.make_response(&req, 202, None, None))?;
                info!(call_id = ?self.call_id, "transfer to {}", refer_to);
                self.send_bye()?;
                Ok(vec![self.event(
                    CcEventKind::Disconnect {
                        redirect_url: Some(refer_to),
                    },
                    rtime,
                )])
            }
            Method::Options | Method::Notify => {
                tx.respond(self.make_response(&req, 200, None, None))?;
                Ok(vec![])
            }
            _ if !connected => {
                tx.respond(self.make_response(&req, 481, None, None))?;
                Ok(vec![])
            }
            _ => {
                tx.respond(self.make_response(&req, 501, None, None))?;
                Ok(vec![])
            }
        }
    }

    /// Events every connected leg handles the same way.
    pub(super) fn recv_connected_event(&mut self, event: CcEvent) -> Result<Vec<UaOutput>> {
        match event.kind {
            CcEventKind::Update { body } => {
                if self.reinvite_out.is_some() || self.reinvite_tx.is_some() {
                    debug!(leg = self.leg, "update while another one is pending");
                    return Ok(vec![]);
                }
                let req = self.send_in_dialog(Method::Invite, body.as_ref(), &event.extra_headers)?;
                self.reinvite_out = Some(req);
                Ok(vec![])
            }
            CcEventKind::Info { body } => {
                self.send_in_dialog(Method::Info, body.as_ref(), &event.extra_headers)?;
                Ok(vec![])
            }
            CcEventKind::Connect { body, .. } => {
                if let Some(seq) = self.held_ack.take() {
                    self.disarm(UaTimer::LateOfferAnswer);
                    self.send_ack(seq, body.as_ref())?;
                } else if let Some(tx) = self.reinvite_tx.take() {
                    let resp = self.make_response(&tx.original, 200, None, body.as_ref());
                    if tx.original.method == Method::Invite {
                        self.send_answer(tx, resp)?;
                    } else {
                        tx.respond(resp)?;
                    }
                }
                Ok(vec![])
            }
            CcEventKind::PreConnect { body, .. } => {
                // the peer answered a body-less re-INVITE with an offer
                if let Some(tx) = self.reinvite_tx.take() {
                    let resp = self.make_response(&tx.original, 200, None, body.as_ref());
                    self.expect_ack_body = true;
                    self.send_answer(tx, resp)?;
                }
                Ok(vec![])
            }
            CcEventKind::Fail { status, reason, .. } => {
                if let Some(tx) = self.reinvite_tx.take() {
                    let resp = self.make_response(&tx.original, status, Some(&reason), None);
                    tx.respond(resp)?;
                    return Ok(vec![]);
                }
                // nothing of ours was refused: the other side is gone
                if let Some(seq) = self.held_ack.take() {
                    self.disarm(UaTimer::LateOfferAnswer);
                    self.send_ack(seq, None)?;
                }
                self.send_bye()?;
                Ok(vec![])
            }
            CcEventKind::Disconnect { .. } => {
                if let Some(tx) = self.reinvite_tx.take() {
                    tx.respond(self.make_response(&tx.original, 487, None, None)).ok();
                }
                if let Some(seq) = self.held_ack.take() {
                    self.send_ack(seq, None)?;
                }
                self.send_bye()?;
                Ok(vec![])
            }
            CcEventKind::Ring { .. } => Ok(vec![]),
            CcEventKind::Try { .. } => Err(Error::DialogError(
                "Try on a connected leg".to_string(),
                self.dialog_id().cloned().unwrap_or_default(),
            )),
        }
    }

    /// Responses to a re-INVITE this leg sent.
    fn recv_reinvite_response(&mut self, resp: Response, rtime: RecvTime) -> Result<Vec<UaOutput>> {
        if resp.is_provisional() {
            return Ok(vec![]);
        }
        let Some(req) = self.reinvite_out.take() else {
            return Ok(vec![]);
        };
        let seq = req.cseq()?.seq;
        if resp.is_success() {
            if let Some(dialog) = self.dialog.as_mut() {
                dialog.update_target(&resp);
            }
            let body = MsgBody::from_message(&resp);
            if req.body.is_empty() && body.is_some() {
                self.held_ack = Some(seq);
                let timeout = self.options.late_offer_timeout;
                self.arm(UaTimer::LateOfferAnswer, timeout);
                return Ok(vec![self.event(
                    CcEventKind::PreConnect {
                        status: resp.status,
                        reason: resp.reason.clone(),
                        body,
                    },
                    rtime,
                )]);
            }
            self.send_ack(seq, None)?;
            return Ok(vec![self.event(
                CcEventKind::Connect {
                    status: resp.status,
                    reason: resp.reason.clone(),
                    body,
                },
                rtime,
            )]);
        }
        if matches!(resp.status, 401 | 407) && self.retry_with_credentials(&req, &resp)? {
            return Ok(vec![]);
        }
        match resp.status {
            408 | 481 => {
                warn!(call_id = ?self.call_id, "re-INVITE failed with {}, dropping call", resp.status);
                if resp.status == 408 {
                    self.send_bye()?;
                } else {
                    self.disconnected();
                }
                Ok(vec![self.event(CcEventKind::Disconnect { redirect_url: None }, rtime)])
            }
            _ => Ok(vec![self.event(
                CcEventKind::Fail {
                    status: resp.status,
                    reason: resp.reason.clone(),
                    challenge: None,
                },
                rtime,
            )]),
        }
    }
}

impl Drop for Ua {
    fn drop(&mut self) {
        self.cancel_token.cancel();
        self.unregister();
    }
}

/// Replaces the body and its Content-Type.
pub(super) fn set_body(headers: &mut crate::sip::Headers, data: &mut Vec<u8>, body: Option<&MsgBody>) {
    headers.remove("Content-Type");
    match body {
        Some(body) => {
            headers.push(Header::new("Content-Type", body.content_type.clone()));
            *data = body.data.clone();
        }
        None => data.clear(),
    }
}

use super::{
    call_map::CallMapInner,
    event::{CcEvent, CcEventKind},
    sdp::filter_payload_types,
};
use crate::{
    config::B2buaConfig,
    dialog::{
        authenticate::{make_challenge, Credentials},
        LegHandle, LegId, Ua, UaDriver, UaOptions, UaOutput, UaRole, UaState, UaTimer,
    },
    identity::Identity,
    sip::{Header, HostPort, Method, NameAddr, Request, Response},
    transaction::{EndpointInnerRef, ServerTransaction},
    transport::{RecvTime, SipAddr, TransportKind},
    Result,
};
use chrono::{DateTime, Utc};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, Weak},
};
use tracing::{debug, error, info, warn};

const ORIGIN: &str = "controller";

enum Work {
    /// Something a leg reported.
    Output(LegId, UaOutput),
    /// An event for a leg.
    Deliver(LegId, CcEvent),
}

struct CcState {
    legs: HashMap<LegId, Ua>,
    ua_a: LegId,
    ua_o: Option<LegId>,
    next_leg: LegId,
    /// The caller's Try as sent to the first callee, replayed on transfer.
    saved_try: Option<CcEvent>,
    transfer_in_progress: bool,
    /// Set once the legs are being torn down after an error.
    failed: bool,
    /// Shutting down: done once every leg has hung up, without waiting for
    /// the legs to linger out.
    closing: bool,
}

impl CcState {
    fn leg_state(&self, leg: LegId) -> UaState {
        self.legs
            .get(&leg)
            .map(|ua| ua.state())
            .unwrap_or(UaState::Dead)
    }

    fn is_done(&self) -> bool {
        let finished = |leg: LegId| match self.leg_state(leg) {
            UaState::Dead => true,
            UaState::Disconnected => self.closing,
            _ => false,
        };
        finished(self.ua_a) && self.ua_o.map(finished).unwrap_or(true)
    }
}

/// Couples the caller's leg (A) with the leg toward the next hop (O).
///
/// One mutex covers both legs and everything they share. Every request,
/// response and timer of either leg goes through it, so a call is a serial
/// actor. The legs never see each other: what one reports is routed here
/// and delivered to the other as a [`CcEvent`].
pub struct CallController {
    pub id: u64,
    state: Mutex<CcState>,
    endpoint: EndpointInnerRef,
    config: Arc<B2buaConfig>,
    identity: Option<Arc<Identity>>,
    call_map: Weak<CallMapInner>,
    a_handle: Arc<LegHandle>,
    self_ref: Weak<CallController>,
}

impl CallController {
    pub(super) fn new(
        id: u64,
        endpoint: EndpointInnerRef,
        config: Arc<B2buaConfig>,
        identity: Option<Arc<Identity>>,
        call_map: Weak<CallMapInner>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<CallController>| {
            let driver: Weak<dyn UaDriver> = me.clone();
            let options = UaOptions {
                origin: "caller".to_string(),
                credit_time: config.timers.credit_time,
                dead_delay: config.timers.dead_delay,
                late_offer_timeout: config.timers.late_offer_timeout,
                ..Default::default()
            };
            let ua_a = Ua::new(UaRole::Uas, 0, endpoint.clone(), driver, options);
            let a_handle = ua_a.handle();
            let mut legs = HashMap::new();
            legs.insert(0, ua_a);
            CallController {
                id,
                state: Mutex::new(CcState {
                    legs,
                    ua_a: 0,
                    ua_o: None,
                    next_leg: 1,
                    saved_try: None,
                    transfer_in_progress: false,
                    failed: false,
                    closing: false,
                }),
                endpoint,
                config,
                identity,
                call_map,
                a_handle,
                self_ref: me.clone(),
            }
        })
    }

    /// Receiver of the caller's INVITE.
    pub fn a_leg(&self) -> Arc<LegHandle> {
        self.a_handle.clone()
    }

    pub fn is_transferring(&self) -> bool {
        self.state.lock().unwrap().transfer_in_progress
    }

    pub fn leg_states(&self) -> (UaState, Option<UaState>) {
        let state = self.state.lock().unwrap();
        (state.leg_state(state.ua_a), state.ua_o.map(|o| state.leg_state(o)))
    }

    /// Hangs up both legs, as if the caller had.
    pub fn disconnect(&self, rtime: RecvTime) {
        let done = {
            let mut state = self.state.lock().unwrap();
            state.closing = true;
            let mut work = VecDeque::new();
            work.push_back(Work::Deliver(state.ua_a, CcEvent::disconnect(rtime, ORIGIN)));
            if let Some(o) = state.ua_o {
                work.push_back(Work::Deliver(o, CcEvent::disconnect(rtime, ORIGIN)));
            }
            self.run(&mut state, work);
            state.is_done()
        };
        if done {
            self.finish();
        }
    }

    /// Runs `f` on `leg` under the call lock, then everything it caused.
    fn dispatch(&self, leg: LegId, f: impl FnOnce(&mut Ua) -> Result<Vec<UaOutput>>) {
        let done = {
            let mut state = self.state.lock().unwrap();
            let Some(ua) = state.legs.get_mut(&leg) else {
                warn!(cc = self.id, leg, "message for an unknown leg");
                return;
            };
            let result = f(ua);
            let mut work = VecDeque::new();
            self.collect(&mut state, leg, result, &mut work);
            self.run(&mut state, work);
            state.is_done()
        };
        if done {
            self.finish();
        }
    }

    fn run(&self, state: &mut CcState, mut work: VecDeque<Work>) {
        while let Some(item) = work.pop_front() {
            match item {
                Work::Output(leg, UaOutput::Dead) => {
                    if leg == state.ua_a || Some(leg) == state.ua_o {
                        debug!(cc = self.id, leg, "leg is dead");
                    } else {
                        debug!(cc = self.id, leg, "replaced leg is dead");
                    }
                }
                Work::Output(leg, UaOutput::Event(event)) => {
                    self.route(state, leg, event, &mut work);
                }
                Work::Deliver(leg, event) => {
                    let Some(ua) = state.legs.get_mut(&leg) else {
                        continue;
                    };
                    let result = ua.recv_event(event);
                    self.collect(state, leg, result, &mut work);
                }
            }
        }
    }

    fn collect(
        &self,
        state: &mut CcState,
        leg: LegId,
        result: Result<Vec<UaOutput>>,
        work: &mut VecDeque<Work>,
    ) {
        match result {
            Ok(outputs) => {
                work.extend(outputs.into_iter().map(|output| Work::Output(leg, output)));
            }
            Err(e) => {
                let call_id = state
                    .legs
                    .get(&leg)
                    .and_then(|ua| ua.call_id().map(str::to_string))
                    .unwrap_or_default();
                error!(cc = self.id, leg, call_id = %call_id, "call failed: {}", e);
                if state.failed {
                    return;
                }
                state.failed = true;
                let rtime = RecvTime::now();
                work.push_back(Work::Deliver(state.ua_a, CcEvent::disconnect(rtime, ORIGIN)));
                if let Some(o) = state.ua_o {
                    work.push_back(Work::Deliver(o, CcEvent::disconnect(rtime, ORIGIN)));
                }
            }
        }
    }

    fn route(&self, state: &mut CcState, from: LegId, event: CcEvent, work: &mut VecDeque<Work>) {
        debug!(cc = self.id, leg = from, "{}", event);
        if from == state.ua_a {
            let Some(o) = state.ua_o else {
                match event.kind {
                    CcEventKind::Try { .. } => self.on_a_try(state, event, work),
                    _ => work.push_back(Work::Deliver(
                        state.ua_a,
                        CcEvent::disconnect(event.rtime, ORIGIN),
                    )),
                }
                return;
            };
            if state.transfer_in_progress {
                match event.kind {
                    CcEventKind::Connect { .. } => {
                        info!(cc = self.id, "transfer complete");
                        state.transfer_in_progress = false;
                    }
                    CcEventKind::Fail { .. } => {
                        // the caller refused the new callee's offer
                        info!(cc = self.id, "transfer failed at the caller");
                        state.transfer_in_progress = false;
                        let rtime = event.rtime;
                        work.push_back(Work::Deliver(o, event));
                        work.push_back(Work::Deliver(
                            state.ua_a,
                            CcEvent::disconnect(rtime, ORIGIN),
                        ));
                        return;
                    }
                    _ => {}
                }
            }
            work.push_back(Work::Deliver(o, event));
            return;
        }
        if Some(from) != state.ua_o {
            debug!(cc = self.id, leg = from, "dropping {} from a replaced leg", event.name());
            return;
        }
        match event.kind {
            CcEventKind::Disconnect {
                redirect_url: Some(target),
            } => self.start_transfer(state, target, event.rtime, work),
            CcEventKind::PreConnect { body, .. }
                if state.transfer_in_progress
                    && state.leg_state(state.ua_a) == UaState::Connected =>
            {
                // the caller re-INVITEs with the new callee's offer
                let update = CcEvent::new(CcEventKind::Update { body }, event.rtime, &event.origin);
                work.push_back(Work::Deliver(state.ua_a, update));
            }
            CcEventKind::Fail { .. } if state.transfer_in_progress => {
                info!(cc = self.id, "transfer target refused the call");
                state.transfer_in_progress = false;
                work.push_back(Work::Deliver(state.ua_a, event));
            }
            _ => work.push_back(Work::Deliver(state.ua_a, event)),
        }
    }

    fn on_a_try(&self, state: &mut CcState, mut event: CcEvent, work: &mut VecDeque<Work>) {
        let a = state.ua_a;
        let rtime = event.rtime;
        let CcEventKind::Try {
            call_id,
            cli,
            cld,
            body,
            auth,
            identity,
            date,
            ..
        } = &mut event.kind
        else {
            return;
        };

        if let Some(credential) = &self.config.auth_in {
            let Some(auth) = auth.as_deref() else {
                let challenge = make_challenge(&self.config.realm, self.config.hash_alg, &rtime);
                info!(cc = self.id, call_id = %call_id, "challenging {}", cli);
                let fail = CcEventKind::Fail {
                    status: 401,
                    reason: "Unauthorized".to_string(),
                    challenge: Some(challenge.to_string()),
                };
                work.push_back(Work::Deliver(a, CcEvent::new(fail, rtime, ORIGIN)));
                return;
            };
            let entity = body.as_ref().map(|b| b.data.as_slice()).unwrap_or_default();
            let authorized = auth
                .parse::<Credentials>()
                .map(|c| {
                    c.username == credential.username
                        && c.realm == self.config.realm
                        && c.algorithm == self.config.hash_alg
                        && c.verify(&credential.password, &Method::Invite, entity)
                })
                .unwrap_or(false);
            if !authorized {
                info!(cc = self.id, call_id = %call_id, "authentication of {} failed", cli);
                work.push_back(Work::Deliver(
                    a,
                    CcEvent::fail(401, "Unauthorized", rtime, ORIGIN),
                ));
                return;
            }
        }

        if let Some(verifier) = self.identity.as_ref().filter(|i| i.verifies()) {
            let now = DateTime::<Utc>::from(rtime.wall);
            let verified = match identity.as_deref() {
                Some(identity) => verifier.verify(identity, cli, cld, date.as_deref(), now),
                None => Err(crate::Error::IdentityError("no Identity header".to_string())),
            };
            if let Err(e) = verified {
                info!(cc = self.id, call_id = %call_id, "rejecting identity: {}", e);
                work.push_back(Work::Deliver(
                    a,
                    CcEvent::fail(438, "Invalid Identity Header", rtime, ORIGIN),
                ));
                return;
            }
        }

        if let Some(body) = body.as_mut().filter(|b| b.is_sdp()) {
            if let Some(filtered) = filter_payload_types(&body.data, &self.config.allowed_pts) {
                debug!(cc = self.id, "filtered payload types of the offer");
                body.data = filtered;
            }
        }
        // credentials are for us, not for the next hop
        *auth = None;
        *identity = None;
        *date = None;

        state.saved_try = Some(event.clone());
        let o = self.new_o_leg(state, None);
        state.ua_o = Some(o);
        let event = self.sign(event);
        work.push_back(Work::Deliver(o, event));
    }

    fn start_transfer(
        &self,
        state: &mut CcState,
        target: NameAddr,
        rtime: RecvTime,
        work: &mut VecDeque<Work>,
    ) {
        let a = state.ua_a;
        let (Some(mut event), Some(user)) = (state.saved_try.clone(), target.uri.user.clone())
        else {
            warn!(cc = self.id, "cannot transfer to {}", target);
            work.push_back(Work::Deliver(a, CcEvent::disconnect(rtime, ORIGIN)));
            return;
        };
        let answered = state.leg_state(a) == UaState::Connected;
        if let CcEventKind::Try { cld, body, .. } = &mut event.kind {
            *cld = user;
            // the caller's offer was answered already; the new callee makes one
            if answered {
                *body = None;
            }
        }
        event.rtime = rtime;
        info!(cc = self.id, "transferring to {}", target);

        state.transfer_in_progress = true;
        let remote = self
            .config
            .transfer_to_redirect_host
            .then(|| target.uri.host.clone());
        let o = self.new_o_leg(state, remote);
        state.ua_o = Some(o);
        let event = self.sign(event);
        work.push_back(Work::Deliver(o, event));
    }

    fn new_o_leg(&self, state: &mut CcState, remote: Option<HostPort>) -> LegId {
        let leg = state.next_leg;
        state.next_leg += 1;
        let host = remote.unwrap_or_else(|| self.config.next_hop.clone());
        let options = UaOptions {
            origin: "callee".to_string(),
            destination: Some(SipAddr::new(TransportKind::Udp, host.clone())),
            remote_host: Some(host),
            credential: self.config.auth_out.clone(),
            dead_delay: self.config.timers.dead_delay,
            late_offer_timeout: self.config.timers.late_offer_timeout,
            ..Default::default()
        };
        let driver: Weak<dyn UaDriver> = self.self_ref.clone();
        let ua = Ua::new(UaRole::Uac, leg, self.endpoint.clone(), driver, options);
        state.legs.insert(leg, ua);
        leg
    }

    /// Adds `Date` and `Identity` to the Try sent to a callee.
    fn sign(&self, mut event: CcEvent) -> CcEvent {
        let Some(identity) = &self.identity else {
            return event;
        };
        let CcEventKind::Try { cli, cld, .. } = &event.kind else {
            return event;
        };
        match identity.authenticate(cli, cld, Utc::now()) {
            Ok((date, value)) => {
                event.extra_headers.push(Header::new("Date", date));
                event.extra_headers.push(Header::new("Identity", value));
            }
            Err(e) => warn!(cc = self.id, "call from {} not signed: {}", cli, e),
        }
        event
    }

    fn finish(&self) {
        info!(cc = self.id, "call finished");
        if let Some(call_map) = self.call_map.upgrade() {
            call_map.remove(self.id);
        }
    }
}

impl UaDriver for CallController {
    fn on_request(&self, leg: LegId, req: Request, tx: ServerTransaction, rtime: RecvTime) {
        self.dispatch(leg, |ua| ua.recv_request(req, tx, rtime));
    }

    fn on_ack(&self, leg: LegId, req: Request, rtime: RecvTime) {
        self.dispatch(leg, |ua| ua.recv_ack(req, rtime));
    }

    fn on_cancel(&self, leg: LegId, req: Request, invite: ServerTransaction, rtime: RecvTime) {
        self.dispatch(leg, |ua| ua.recv_cancel(req, invite, rtime));
    }

    fn on_response(&self, leg: LegId, resp: Response, rtime: RecvTime) {
        self.dispatch(leg, |ua| ua.recv_response(resp, rtime));
    }

    fn on_timer(&self, leg: LegId, timer: UaTimer, generation: u64) {
        self.dispatch(leg, |ua| ua.on_timer(timer, generation));
    }
}

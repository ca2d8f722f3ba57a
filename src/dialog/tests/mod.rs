use super::ua::{Ua, UaDriver, UaOptions, UaOutput, UaRole, UaState, UaTimer};
use crate::{
    call::event::{CcEvent, CcEventKind},
    sip::{Request, Response},
    transaction::{tests::TestEndpoint, RequestReceiverRef, ServerTransaction},
    transport::RecvTime,
    Result,
};
use std::{
    sync::{Arc, Mutex, Weak},
    time::Duration,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};


pub(super) const SDP: &str = "v=0\r\n\
o=- 1 1 IN IP4 10.0.0.1\r\n\
s=-\r\n\
c=IN IP4 10.0.0.1\r\n\
t=0 0\r\n\
m=audio 10000 RTP/AVP 0\r\n\
a=rtpmap:0 PCMU/8000\r\n";

/// Hosts a single leg and hands everything it reports to the test.
pub(super) struct LegDriver {
    ua: Mutex<Option<Ua>>,
    outputs: UnboundedSender<UaOutput>,
}

impl LegDriver {
    pub fn create(
        test: &TestEndpoint,
        role: UaRole,
        options: UaOptions,
    ) -> (Arc<Self>, UnboundedReceiver<UaOutput>) {
        let (outputs, receiver) = unbounded_channel();
        let endpoint = test.endpoint.inner.clone();
        let driver = Arc::new_cyclic(|me: &Weak<LegDriver>| {
            let me: Weak<dyn UaDriver> = me.clone();
            LegDriver {
                ua: Mutex::new(Some(Ua::new(role, 1, endpoint, me, options))),
                outputs,
            }
        });
        (driver, receiver)
    }

    fn run(&self, f: impl FnOnce(&mut Ua) -> Result<Vec<UaOutput>>) {
        let mut ua = self.ua.lock().unwrap();
        let Some(ua) = ua.as_mut() else {
            return;
        };
        for output in f(ua).expect("leg failed") {
            self.outputs.send(output).ok();
        }
    }

    pub fn deliver(&self, kind: CcEventKind) {
        self.run(|ua| ua.recv_event(CcEvent::new(kind, RecvTime::now(), "test")))
    }

    pub fn state(&self) -> UaState {
        self.ua.lock().unwrap().as_ref().map(|ua| ua.state()).expect("leg")
    }

    pub fn is_armed(&self, timer: UaTimer) -> bool {
        self.ua.lock().unwrap().as_ref().map(|ua| ua.is_armed(timer)).expect("leg")
    }

    pub fn local_tag(&self) -> String {
        self.ua.lock().unwrap().as_ref().map(|ua| ua.local_tag().to_string()).expect("leg")
    }

    pub fn handle(&self) -> RequestReceiverRef {
        self.ua.lock().unwrap().as_ref().map(|ua| ua.handle()).expect("leg")
    }
}

impl UaDriver for LegDriver {
    fn on_request(&self, _leg: u64, req: Request, tx: ServerTransaction, rtime: RecvTime) {
        self.run(|ua| ua.recv_request(req, tx, rtime))
    }

    fn on_ack(&self, _leg: u64, req: Request, rtime: RecvTime) {
        self.run(|ua| ua.recv_ack(req, rtime))
    }

    fn on_cancel(&self, _leg: u64, req: Request, invite: ServerTransaction, rtime: RecvTime) {
        self.run(|ua| ua.recv_cancel(req, invite, rtime))
    }

    fn on_response(&self, _leg: u64, resp: Response, rtime: RecvTime) {
        self.run(|ua| ua.recv_response(resp, rtime))
    }

    fn on_timer(&self, _leg: u64, timer: UaTimer, generation: u64) {
        self.run(|ua| ua.on_timer(timer, generation))
    }
}

pub(super) fn leg_options() -> UaOptions {
    UaOptions {
        origin: "test".to_string(),
        dead_delay: Duration::from_millis(50),
        late_offer_timeout: Duration::from_millis(300),
        ..Default::default()
    }
}

pub(super) async fn next_event(outputs: &mut UnboundedReceiver<UaOutput>) -> CcEventKind {
    match tokio::time::timeout(Duration::from_secs(2), outputs.recv()).await {
        Ok(Some(UaOutput::Event(event))) => event.kind,
        other => panic!("expected an event, got {:?}", other),
    }
}

pub(super) async fn expect_dead(outputs: &mut UnboundedReceiver<UaOutput>) {
    loop {
        match tokio::time::timeout(Duration::from_secs(2), outputs.recv()).await {
            Ok(Some(UaOutput::Dead)) => return,
            Ok(Some(UaOutput::Event(_))) => continue,
            other => panic!("expected the leg to die, got {:?}", other),
        }
    }
}

/// Drains what is already queued and then expects silence.
pub(super) async fn expect_quiet(test: &mut TestEndpoint, wait: Duration) {
    while test.next_message(Duration::from_millis(20)).await.is_some() {}
    if let Some(msg) = test.next_message(wait).await {
        panic!("unexpected message: {}", msg);
    }
}

use super::{controller::CallController, proxy::StatefulProxy};
use crate::{
    config::B2buaConfig,
    identity::Identity,
    sip::{HasHeaders, Method, Request},
    transaction::{EndpointInnerRef, NewDialogAction, NewDialogHandler, RequestReceiverRef},
    transport::{RecvTime, SipAddr, TransportKind},
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{sync::Notify, time::Instant};
use tracing::{debug, info};

pub struct CallMapInner {
    endpoint: EndpointInnerRef,
    config: Arc<B2buaConfig>,
    identity: Option<Arc<Identity>>,
    proxy: RequestReceiverRef,
    calls: Mutex<HashMap<u64, Arc<CallController>>>,
    next_id: AtomicU64,
    removed: Notify,
}

impl CallMapInner {
    pub(super) fn remove(&self, id: u64) {
        let removed = self.calls.lock().unwrap().remove(&id).is_some();
        if removed {
            debug!(cc = id, "removed from the call map");
            self.removed.notify_waiters();
        }
    }
}

/// The registry of live calls and the entry point for every request that
/// starts outside a dialog.
#[derive(Clone)]
pub struct CallMap {
    inner: Arc<CallMapInner>,
}

impl CallMap {
    pub fn new(
        endpoint: EndpointInnerRef,
        config: Arc<B2buaConfig>,
        identity: Option<Arc<Identity>>,
    ) -> Self {
        let next_hop = SipAddr::new(TransportKind::Udp, config.next_hop.clone());
        let proxy: RequestReceiverRef = Arc::new(StatefulProxy::new(endpoint.clone(), next_hop));
        CallMap {
            inner: Arc::new(CallMapInner {
                endpoint,
                config,
                identity,
                proxy,
                calls: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                removed: Notify::new(),
            }),
        }
    }

    /// This map as the endpoint's handler for new dialogs. The endpoint only
    /// keeps a weak reference: hold on to the returned handle.
    pub fn as_handler(&self) -> Arc<dyn NewDialogHandler> {
        Arc::new(self.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.calls.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: u64) -> Option<Arc<CallController>> {
        self.inner.calls.lock().unwrap().get(&id).cloned()
    }

    pub fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.inner.calls.lock().unwrap().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Disconnects every call. The calls are collected under the map lock
    /// and disconnected after it is released, since a finishing call takes
    /// the map lock while holding its own.
    pub fn shutdown(&self) {
        let calls: Vec<Arc<CallController>> =
            self.inner.calls.lock().unwrap().values().cloned().collect();
        info!(calls = calls.len(), "disconnecting all calls");
        let rtime = RecvTime::now();
        for cc in calls {
            cc.disconnect(rtime);
        }
    }

    /// Waits until the map is empty. Returns false when `timeout` elapsed
    /// first.
    pub async fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let removed = self.inner.removed.notified();
            if self.is_empty() {
                return true;
            }
            if tokio::time::timeout_at(deadline, removed).await.is_err() {
                return self.is_empty();
            }
        }
    }

    /// Drops every call still in the map.
    pub fn clear(&self) {
        let calls = std::mem::take(&mut *self.inner.calls.lock().unwrap());
        if !calls.is_empty() {
            info!(calls = calls.len(), "dropping calls after the grace period");
        }
        self.inner.removed.notify_waiters();
    }

    fn new_call(&self) -> Arc<CallController> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let cc = CallController::new(
            id,
            self.inner.endpoint.clone(),
            self.inner.config.clone(),
            self.inner.identity.clone(),
            Arc::downgrade(&self.inner),
        );
        self.inner.calls.lock().unwrap().insert(id, cc.clone());
        cc
    }
}

impl NewDialogHandler for CallMap {
    fn on_new_dialog(&self, req: &Request, _rtime: RecvTime) -> NewDialogAction {
        let endpoint = &self.inner.endpoint;
        let has_tag = req
            .to_header()
            .map(|to| to.tag().is_some())
            .unwrap_or(false);
        if has_tag {
            return NewDialogAction::Respond(endpoint.make_response(req, 481, None, None));
        }
        match &req.method {
            Method::Invite => {
                let cc = self.new_call();
                info!(cc = cc.id, "new call");
                NewDialogAction::Accept(cc.a_leg())
            }
            Method::Register => NewDialogAction::Accept(self.inner.proxy.clone()),
            method if *method == Method::Notify || method.is_ping() => {
                NewDialogAction::Respond(endpoint.make_response(req, 200, None, None))
            }
            _ => NewDialogAction::Respond(endpoint.make_response(req, 501, None, None)),
        }
    }
}

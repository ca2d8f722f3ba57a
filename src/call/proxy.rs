use crate::{
    sip::{Request, Response},
    transaction::{
        EndpointInnerRef, RequestReceiver, ResponseReceiver, ServerTransaction,
    },
    transport::{RecvTime, SipAddr},
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Forwards requests the B2BUA does not terminate, REGISTER mostly, to the
/// next hop and relays the answers back through its own server
/// transaction.
pub struct StatefulProxy {
    endpoint: EndpointInnerRef,
    next_hop: SipAddr,
}

impl StatefulProxy {
    pub fn new(endpoint: EndpointInnerRef, next_hop: SipAddr) -> Self {
        StatefulProxy { endpoint, next_hop }
    }
}

impl RequestReceiver for StatefulProxy {
    fn recv_request(&self, mut req: Request, tx: ServerTransaction, _rtime: RecvTime) {
        let max_forwards = req.max_forwards().unwrap_or(70);
        if max_forwards == 0 {
            tx.reply(483, None).ok();
            return;
        }
        req.headers.set("Max-Forwards", (max_forwards - 1).to_string());
        debug!(key = %tx.key, "proxying {} to {}", req.method, self.next_hop);

        let branch = Arc::new(ProxyBranch { server: tx.clone() });
        if let Err(e) = self
            .endpoint
            .send_request(req, Some(self.next_hop.clone()), Some(branch))
        {
            warn!(key = %tx.key, "cannot forward request: {}", e);
            tx.reply(503, None).ok();
        }
    }
}

/// The client side of one proxied request.
struct ProxyBranch {
    server: ServerTransaction,
}

impl ResponseReceiver for ProxyBranch {
    fn recv_response(&self, mut resp: Response, _rtime: RecvTime) {
        if resp.status == 100 {
            return;
        }
        // our own Via
        resp.headers.remove_first("Via");
        if let Err(e) = self.server.respond(resp) {
            debug!(key = %self.server.key, "response not relayed: {}", e);
        }
    }
}

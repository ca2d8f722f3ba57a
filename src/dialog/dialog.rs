use super::DialogId;
use crate::{
    sip::{CSeq, HasHeaders, Header, Method, NameAddr, Request, Response, SipUri},
    transport::SipAddr,
    Error, Result,
};
use tracing::debug;

/// Dialog state shared by both roles (RFC 3261 §12).
///
/// `local` and `remote` are the From/To values as this side writes them
/// in its own requests: `local` goes to From, `remote` to To.
#[derive(Debug, Clone)]
pub struct Dialog {
    pub id: DialogId,
    pub local: NameAddr,
    pub remote: NameAddr,
    pub remote_target: SipUri,
    pub local_contact: SipUri,
    /// Routes in the order this side puts them in its requests.
    pub route_set: Vec<NameAddr>,
    pub local_seq: u32,
    pub remote_seq: Option<u32>,
    pub secure: bool,
}

impl Dialog {
    /// Dialog of the side that received `invite`.
    pub fn new_uas(invite: &Request, local_tag: &str, local_contact: SipUri) -> Result<Self> {
        let remote = invite.from_header()?;
        let local = invite.to_header()?.with_tag(local_tag);
        let remote_tag = remote
            .tag()
            .ok_or_else(|| Error::SipMessageError("From without tag".to_string()))?
            .to_string();
        let remote_target = invite
            .contact()
            .map(|c| c.uri)
            .unwrap_or_else(|| remote.uri.clone());
        Ok(Dialog {
            id: DialogId {
                call_id: invite.call_id()?.to_string(),
                local_tag: local_tag.to_string(),
                remote_tag,
            },
            local,
            remote,
            remote_target,
            local_contact,
            route_set: invite.record_routes(),
            local_seq: 0,
            remote_seq: Some(invite.cseq()?.seq),
            secure: invite.uri.is_secure(),
        })
    }

    /// Dialog of the side that sent `invite` and got `resp` back.
    pub fn new_uac(invite: &Request, resp: &Response, local_contact: SipUri) -> Result<Self> {
        let local = invite.from_header()?;
        let remote = resp.to_header()?;
        let local_tag = local
            .tag()
            .ok_or_else(|| Error::SipMessageError("From without tag".to_string()))?
            .to_string();
        let remote_tag = remote.tag().unwrap_or_default().to_string();
        let remote_target = resp
            .contact()
            .map(|c| c.uri)
            .unwrap_or_else(|| invite.uri.clone());
        let mut route_set = resp.record_routes();
        route_set.reverse();
        Ok(Dialog {
            id: DialogId {
                call_id: invite.call_id()?.to_string(),
                local_tag,
                remote_tag,
            },
            local,
            remote,
            remote_target,
            local_contact,
            route_set,
            local_seq: invite.cseq()?.seq,
            remote_seq: None,
            secure: invite.uri.is_secure(),
        })
    }

    pub fn next_local_seq(&mut self) -> u32 {
        self.local_seq += 1;
        self.local_seq
    }

    /// Checks and records the CSeq of a request from the peer. ACK and
    /// CANCEL reuse the sequence number of the request they refer to.
    pub fn accept_remote_seq(&mut self, req: &Request) -> bool {
        if matches!(req.method, Method::Ack | Method::Cancel) {
            return true;
        }
        let Ok(cseq) = req.cseq() else {
            return false;
        };
        match self.remote_seq {
            Some(last) if cseq.seq <= last => {
                debug!(dialog = %self.id, "out of order CSeq {} <= {}", cseq.seq, last);
                false
            }
            _ => {
                self.remote_seq = Some(cseq.seq);
                true
            }
        }
    }

    /// In-dialog request with the next local CSeq. The transaction layer
    /// adds Via and Max-Forwards.
    pub fn make_request(&mut self, method: Method) -> Request {
        let seq = self.next_local_seq();
        self.make_request_with_seq(method, seq)
    }

    /// ACK for the 2xx of the INVITE numbered `seq`.
    pub fn make_ack(&self, seq: u32) -> Request {
        self.make_request_with_seq(Method::Ack, seq)
    }

    fn make_request_with_seq(&self, method: Method, seq: u32) -> Request {
        let mut req = Request::new(method.clone(), self.remote_target.clone());
        for route in &self.route_set {
            req.headers.push(route.to_header("Route"));
        }
        req.headers.push(self.local.to_header("From"));
        req.headers.push(self.remote.to_header("To"));
        req.headers
            .push(Header::new("Call-ID", self.id.call_id.clone()));
        req.headers.push(CSeq::new(seq, method.clone()).into());
        if matches!(method, Method::Invite | Method::Update | Method::Refer) {
            req.headers
                .push(NameAddr::new(self.local_contact.clone()).to_header("Contact"));
        }
        req
    }

    /// Where in-dialog requests go: the first route, else the target.
    pub fn next_hop(&self) -> SipAddr {
        match self.route_set.first() {
            Some(route) => SipAddr::from(&route.uri),
            None => SipAddr::from(&self.remote_target),
        }
    }

    /// A refreshed target from a re-INVITE or its 2xx.
    pub fn update_target(&mut self, msg: &impl HasHeaders) {
        if let Some(contact) = msg.contact() {
            self.remote_target = contact.uri;
        }
    }
}

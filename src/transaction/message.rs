use super::{endpoint::EndpointInner, make_call_id};
use crate::sip::{CSeq, HasHeaders, Header, Method, NameAddr, Request, Response, SipUri};

/// Headers a request generated from another one carries over.
fn copy_headers(from: &Request, to: &mut Request, names: &[&str]) {
    for header in from.headers.iter() {
        if names.iter().any(|name| header.is(name)) {
            to.headers.push(header.clone());
        }
    }
}

/// ACK for a non-2xx final response. It belongs to the INVITE
/// transaction, so it reuses the INVITE's top Via and Request-URI.
pub fn make_ack_for_failure(invite: &Request, resp: &Response) -> Request {
    let mut ack = Request::new(Method::Ack, invite.uri.clone());
    if let Some(via) = invite.headers.get("Via") {
        ack.headers.push(via.clone());
    }
    copy_headers(invite, &mut ack, &["Call-ID", "From"]);
    match resp.headers.get("To") {
        Some(to) => ack.headers.push(to.clone()),
        None => copy_headers(invite, &mut ack, &["To"]),
    }
    if let Ok(cseq) = invite.cseq() {
        ack.headers.push(CSeq::new(cseq.seq, Method::Ack).into());
    }
    copy_headers(invite, &mut ack, &["Route"]);
    ack.headers.push(Header::new("Max-Forwards", "70"));
    ack
}

/// CANCEL for a pending INVITE: same top Via, Request-URI, Route set and
/// CSeq number.
pub fn make_cancel(invite: &Request) -> Request {
    let mut cancel = Request::new(Method::Cancel, invite.uri.clone());
    if let Some(via) = invite.headers.get("Via") {
        cancel.headers.push(via.clone());
    }
    copy_headers(invite, &mut cancel, &["Call-ID", "From", "To"]);
    if let Ok(cseq) = invite.cseq() {
        cancel.headers.push(CSeq::new(cseq.seq, Method::Cancel).into());
    }
    copy_headers(invite, &mut cancel, &["Route"]);
    cancel.headers.push(Header::new("Max-Forwards", "70"));
    cancel
}

impl EndpointInner {
    /// Builds a request with the mandatory headers except Via, which the
    /// endpoint prepends when the request is sent.
    pub fn make_request(
        &self,
        method: Method,
        req_uri: SipUri,
        from: NameAddr,
        to: NameAddr,
        call_id: Option<&str>,
        seq: u32,
    ) -> Request {
        let call_id = match call_id {
            Some(call_id) => call_id.to_string(),
            None => make_call_id(Some(&req_uri.host.host)),
        };
        let mut req = Request::new(method.clone(), req_uri);
        req.headers.push(Header::new("Max-Forwards", "70"));
        req.headers.push(from.to_header("From"));
        req.headers.push(to.to_header("To"));
        req.headers.push(Header::new("Call-ID", call_id));
        req.headers.push(CSeq::new(seq, method).into());
        req.headers.push(Header::new("User-Agent", self.user_agent.clone()));
        req
    }

    /// Response to `req` carrying the Server header and an optional body.
    pub fn make_response(
        &self,
        req: &Request,
        status: u16,
        to_tag: Option<&str>,
        body: Option<(&str, Vec<u8>)>,
    ) -> Response {
        let mut resp = crate::sip::make_response(req, status, None, to_tag);
        resp.headers.push(Header::new("Server", self.user_agent.clone()));
        if let Some((content_type, body)) = body {
            resp.headers.push(Header::new("Content-Type", content_type));
            resp.body = body;
        }
        resp
    }
}

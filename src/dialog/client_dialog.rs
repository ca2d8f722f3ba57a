use super::{
    authenticate::{make_credentials, Challenge},
    dialog::Dialog,
    ua::{set_body, Ua, UaOutput, UaState, UaTimer},
};
use crate::{
    call::event::{CcEvent, CcEventKind, MsgBody},
    sip::{CSeq, HasHeaders, Header, Method, NameAddr, Request, Response, SipUri},
    transport::RecvTime,
    Error, Result,
};
use tracing::{debug, info, warn};

/// The calling side: places the outgoing INVITE for a Try and reports
/// its progress back as events.
impl Ua {
    pub(super) fn uac_recv_event(&mut self, event: CcEvent) -> Result<Vec<UaOutput>> {
        match self.state {
            UaState::Idle => match event.kind {
                CcEventKind::Try { .. } => self.start_call(event),
                CcEventKind::Disconnect { .. } | CcEventKind::Fail { .. } => {
                    self.disconnected();
                    Ok(vec![])
                }
                _ => Ok(vec![]),
            },
            UaState::Trying | UaState::Ringing => match event.kind {
                CcEventKind::Disconnect { .. } | CcEventKind::Fail { .. } => {
                    self.cancel_call();
                    Ok(vec![])
                }
                _ => {
                    debug!(leg = self.leg, "{} before the answer", event.name());
                    Ok(vec![])
                }
            },
            UaState::Connected => self.recv_connected_event(event),
            _ => {
                debug!(leg = self.leg, state = %self.state, "ignoring {}", event);
                Ok(vec![])
            }
        }
    }

    fn start_call(&mut self, event: CcEvent) -> Result<Vec<UaOutput>> {
        let CcEventKind::Try {
            call_id,
            cli,
            cld,
            body,
            caller_name,
            ..
        } = event.kind
        else {
            return Ok(vec![]);
        };
        let host = match (&self.options.remote_host, &self.options.destination) {
            (Some(host), _) => host.clone(),
            (None, Some(destination)) => destination.addr.clone(),
            (None, None) => {
                return Err(Error::EndpointError(format!(
                    "no destination for call {}",
                    call_id
                )))
            }
        };
        let local = self
            .endpoint
            .local_addr(None)
            .ok_or_else(|| Error::EndpointError("no transport available".to_string()))?;

        let req_uri = SipUri::new(Some(&cld), host);
        let mut from = NameAddr::new(SipUri::new(Some(&cli), local.addr)).with_tag(&self.local_tag);
        from.display_name = caller_name;
        let to = NameAddr::new(req_uri.clone());

        let mut req = self.endpoint.make_request(
            Method::Invite,
            req_uri,
            from,
            to,
            Some(&call_id),
            self.local_seq,
        );
        let contact = self.endpoint.local_contact(Some(&cli))?;
        req.headers.push(NameAddr::new(contact).to_header("Contact"));
        req.headers.extend(event.extra_headers);
        set_body(&mut req.headers, &mut req.body, body.as_ref());

        self.register(&call_id);
        info!(call_id = %call_id, "outgoing call {} -> {}", cli, req.uri);
        self.send_invite(req)?;
        self.state = UaState::Trying;
        Ok(vec![])
    }

    fn send_invite(&mut self, req: Request) -> Result<()> {
        self.invite = Some(req.clone());
        let receiver = self.handle();
        let key = self
            .endpoint
            .send_request(req, self.options.destination.clone(), Some(receiver))?;
        self.invite_key = Some(key);
        Ok(())
    }

    fn cancel_call(&mut self) {
        if let Some(key) = &self.invite_key {
            if let Err(e) = self.endpoint.cancel_request(key) {
                debug!(leg = self.leg, "cancel: {}", e);
            }
        }
        self.state = UaState::Cancelling;
    }

    pub(super) fn uac_recv_invite_response(
        &mut self,
        resp: Response,
        rtime: RecvTime,
    ) -> Result<Vec<UaOutput>> {
        match self.state {
            UaState::Trying | UaState::Ringing => self.recv_progress(resp, rtime),
            UaState::Cancelling => {
                if resp.is_success() {
                    // the answer crossed our CANCEL
                    self.establish(&resp)?;
                    self.send_ack(resp.cseq()?.seq, None)?;
                    self.send_bye()?;
                } else if resp.is_final() {
                    self.disconnected();
                }
                Ok(vec![])
            }
            _ => {
                self.resend_ack_for(&resp)?;
                Ok(vec![])
            }
        }
    }

    fn recv_progress(&mut self, resp: Response, rtime: RecvTime) -> Result<Vec<UaOutput>> {
        let status = resp.status;
        let reason = resp.reason.clone();
        match status {
            100 => Ok(vec![]),
            101..=199 => {
                self.state = UaState::Ringing;
                let body = MsgBody::from_message(&resp);
                Ok(vec![self.event(CcEventKind::Ring { status, reason, body }, rtime)])
            }
            200..=299 => {
                self.establish(&resp)?;
                self.connected();
                let seq = resp.cseq()?.seq;
                let body = MsgBody::from_message(&resp);
                let offered = self
                    .invite
                    .as_ref()
                    .map(|invite| !invite.body.is_empty())
                    .unwrap_or(false);
                if !offered && body.is_some() {
                    // late offer: the ACK carries the answer of the other leg
                    self.held_ack = Some(seq);
                    let timeout = self.options.late_offer_timeout;
                    self.arm(UaTimer::LateOfferAnswer, timeout);
                    return Ok(vec![self.event(CcEventKind::PreConnect { status, reason, body }, rtime)]);
                }
                self.send_ack(seq, None)?;
                Ok(vec![self.event(CcEventKind::Connect { status, reason, body }, rtime)])
            }
            401 | 407 => {
                let invite = self.invite.clone();
                if let Some(invite) = invite {
                    if self.retry_with_credentials(&invite, &resp)? {
                        return Ok(vec![]);
                    }
                }
                self.fail(resp, rtime)
            }
            300..=399 => {
                let redirect_url = resp.contact();
                info!(call_id = ?self.call_id, "redirected to {:?}", redirect_url.as_ref().map(|c| c.to_string()));
                self.disconnected();
                Ok(vec![self.event(CcEventKind::Disconnect { redirect_url }, rtime)])
            }
            _ => self.fail(resp, rtime),
        }
    }

    fn fail(&mut self, resp: Response, rtime: RecvTime) -> Result<Vec<UaOutput>> {
        let challenge = resp
            .header_value("WWW-Authenticate")
            .or_else(|| resp.header_value("Proxy-Authenticate"))
            .map(str::to_string);
        self.disconnected();
        Ok(vec![self.event(
            CcEventKind::Fail {
                status: resp.status,
                reason: resp.reason,
                challenge,
            },
            rtime,
        )])
    }

    /// Dialog from the 2xx of the initial INVITE.
    fn establish(&mut self, resp: &Response) -> Result<()> {
        if self.dialog.is_some() {
            return Ok(());
        }
        let invite = self
            .invite
            .as_ref()
            .ok_or_else(|| Error::EndpointError("2xx without INVITE".to_string()))?;
        let user = invite.from_header()?.uri.user;
        let contact = self.endpoint.local_contact(user.as_deref())?;
        let dialog = Dialog::new_uac(invite, resp, contact)?;
        info!(dialog = %dialog.id, "call answered");
        self.dialog = Some(dialog);
        Ok(())
    }

    /// Resends `req` with credentials answering the challenge in `resp`.
    /// Only one attempt is made per leg.
    pub(super) fn retry_with_credentials(&mut self, req: &Request, resp: &Response) -> Result<bool> {
        if self.auth_attempted {
            return Ok(false);
        }
        let Some(credential) = self.options.credential.clone() else {
            return Ok(false);
        };
        let (challenge_header, auth_header) = if resp.status == 407 {
            ("Proxy-Authenticate", "Proxy-Authorization")
        } else {
            ("WWW-Authenticate", "Authorization")
        };
        let challenge = match resp.header_value(challenge_header).map(str::parse::<Challenge>) {
            Some(Ok(challenge)) => challenge,
            Some(Err(e)) => {
                warn!(call_id = ?self.call_id, "bad challenge: {}", e);
                return Ok(false);
            }
            None => return Ok(false),
        };
        self.auth_attempted = true;

        let mut retry = req.clone();
        let credentials = make_credentials(&challenge, &credential, &retry.method, &retry.uri, &retry.body);
        retry.headers.remove(auth_header);
        retry.headers.push(Header::new(auth_header, credentials.to_string()));

        let reinvite = self.reinvite_out.is_some() || self.state == UaState::Connected;
        if reinvite {
            let dialog = self.dialog.as_mut().ok_or_else(|| {
                Error::EndpointError("re-INVITE outside of a dialog".to_string())
            })?;
            let seq = dialog.next_local_seq();
            retry.headers.set("CSeq", CSeq::new(seq, retry.method.clone()).to_string());
            let destination = self.in_dialog_destination()?;
            let receiver = self.handle();
            self.endpoint
                .send_request(retry.clone(), Some(destination), Some(receiver))?;
            self.reinvite_out = Some(retry);
        } else {
            self.local_seq += 1;
            retry.headers.set("CSeq", CSeq::new(self.local_seq, retry.method.clone()).to_string());
            debug!(call_id = ?self.call_id, "retrying INVITE with credentials");
            self.send_invite(retry)?;
        }
        Ok(true)
    }
}

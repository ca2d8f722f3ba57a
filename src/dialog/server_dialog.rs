use super::{
    dialog::Dialog,
    ua::{Ua, UaOutput, UaState},
};
use crate::{
    call::event::{CcEvent, CcEventKind, MsgBody},
    sip::{HasHeaders, Header, Request},
    transaction::ServerTransaction,
    transport::RecvTime,
    Error, Result,
};
use tracing::{debug, info};

/// The answering side: the caller's INVITE arrives here and the
/// controller decides what becomes of it.
impl Ua {
    pub(super) fn uas_recv_invite(
        &mut self,
        req: Request,
        tx: ServerTransaction,
        rtime: RecvTime,
    ) -> Result<Vec<UaOutput>> {
        let call_id = req.call_id()?.to_string();
        self.register(&call_id);
        let contact = self.endpoint.local_contact(req.uri.user())?;
        let dialog = match Dialog::new_uas(&req, &self.local_tag, contact) {
            Ok(dialog) => dialog,
            Err(e) => {
                tx.reply(400, None).ok();
                self.disconnected();
                return Err(e);
            }
        };
        tx.respond(self.endpoint.make_response(&req, 100, None, None))?;
        info!(dialog = %dialog.id, "incoming call {} -> {}", dialog.remote, req.uri);
        self.dialog = Some(dialog);
        self.state = UaState::Trying;

        let from = req.from_header()?;
        let kind = CcEventKind::Try {
            call_id,
            cli: from.uri.user().unwrap_or_default().to_string(),
            cld: req.uri.user().unwrap_or_default().to_string(),
            body: MsgBody::from_message(&req),
            auth: req.header_value("Authorization").map(str::to_string),
            caller_name: from.display_name.clone(),
            identity: req.header_value("Identity").map(str::to_string),
            date: req.header_value("Date").map(str::to_string),
        };
        self.invite_tx = Some(tx);
        Ok(vec![self.event(kind, rtime)])
    }

    pub(super) fn uas_recv_cancel(
        &mut self,
        invite: ServerTransaction,
        rtime: RecvTime,
    ) -> Result<Vec<UaOutput>> {
        if !matches!(self.state, UaState::Trying | UaState::Ringing) {
            debug!(leg = self.leg, state = %self.state, "CANCEL after the answer");
            return Ok(vec![]);
        }
        invite.respond(self.make_response(&invite.original, 487, None, None))?;
        self.invite_tx = None;
        self.disconnected();
        Ok(vec![self.event(CcEventKind::Disconnect { redirect_url: None }, rtime)])
    }

    pub(super) fn uas_recv_event(&mut self, event: CcEvent) -> Result<Vec<UaOutput>> {
        match self.state {
            UaState::Trying | UaState::Ringing => self.answer_invite(event),
            UaState::Connected => self.recv_connected_event(event),
            _ => {
                debug!(leg = self.leg, state = %self.state, "ignoring {}", event);
                Ok(vec![])
            }
        }
    }

    /// Final or provisional answer to the initial INVITE.
    fn answer_invite(&mut self, event: CcEvent) -> Result<Vec<UaOutput>> {
        let Some(tx) = self.invite_tx.take() else {
            return Ok(vec![]);
        };
        let name = event.name();
        let pre_connect = matches!(event.kind, CcEventKind::PreConnect { .. });
        match event.kind {
            CcEventKind::Ring {
                status,
                reason,
                body,
            } => {
                // a plain 100 has already gone out
                if status > 100 {
                    let mut resp = self.make_response(&tx.original, status, Some(&reason), body.as_ref());
                    resp.headers.extend(event.extra_headers);
                    tx.respond(resp)?;
                }
                self.state = UaState::Ringing;
                self.invite_tx = Some(tx);
            }
            CcEventKind::Connect {
                status,
                reason,
                body,
            }
            | CcEventKind::PreConnect {
                status,
                reason,
                body,
            } => {
                self.expect_ack_body = pre_connect;
                let mut resp = self.make_response(&tx.original, status, Some(&reason), body.as_ref());
                resp.headers.extend(event.extra_headers);
                self.send_answer(tx, resp)?;
                self.connected();
            }
            CcEventKind::Fail {
                status,
                reason,
                challenge,
            } => {
                let mut resp = self.make_response(&tx.original, status, Some(&reason), None);
                if let Some(challenge) = challenge {
                    let header = if status == 407 {
                        "Proxy-Authenticate"
                    } else {
                        "WWW-Authenticate"
                    };
                    resp.headers.push(Header::new(header, challenge));
                }
                resp.headers.extend(event.extra_headers);
                tx.respond(resp)?;
                self.disconnected();
            }
            CcEventKind::Disconnect { redirect_url } => {
                let resp = match redirect_url {
                    Some(target) => {
                        let mut resp = self.make_response(&tx.original, 302, None, None);
                        resp.headers.push(target.to_header("Contact"));
                        resp
                    }
                    None => self.make_response(&tx.original, 500, Some("Disconnected"), None),
                };
                tx.respond(resp)?;
                self.disconnected();
            }
            CcEventKind::Update { .. } | CcEventKind::Info { .. } => {
                debug!(leg = self.leg, "{} before the answer", name);
                self.invite_tx = Some(tx);
            }
            CcEventKind::Try { .. } => {
                self.invite_tx = Some(tx);
                return Err(Error::DialogError(
                    "Try on an answering leg".to_string(),
                    self.dialog_id().cloned().unwrap_or_default(),
                ));
            }
        }
        Ok(vec![])
    }
}

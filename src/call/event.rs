use crate::{
    sip::{HasHeaders, Header, NameAddr},
    transport::RecvTime,
};
use std::fmt;

/// An opaque message body with its content type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgBody {
    pub content_type: String,
    pub data: Vec<u8>,
}

impl MsgBody {
    pub fn new(content_type: &str, data: impl Into<Vec<u8>>) -> Self {
        MsgBody {
            content_type: content_type.to_string(),
            data: data.into(),
        }
    }

    pub fn is_sdp(&self) -> bool {
        self.content_type.eq_ignore_ascii_case("application/sdp")
    }

    /// Body of a message, `None` when it carries none.
    pub fn from_message(msg: &impl HasHeaders) -> Option<MsgBody> {
        if msg.body().is_empty() {
            return None;
        }
        Some(MsgBody {
            content_type: msg
                .content_type()
                .unwrap_or("application/sdp")
                .to_string(),
            data: msg.body().to_vec(),
        })
    }
}

/// Call-control intent exchanged between a leg and its call controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CcEventKind {
    Try {
        call_id: String,
        cli: String,
        cld: String,
        body: Option<MsgBody>,
        /// Raw `Authorization` value of the INVITE.
        auth: Option<String>,
        caller_name: Option<String>,
        /// First `Identity` and the `Date` of the INVITE.
        identity: Option<String>,
        date: Option<String>,
    },
    Ring {
        status: u16,
        reason: String,
        body: Option<MsgBody>,
    },
    /// A 2xx whose body is an offer still waiting for its answer.
    PreConnect {
        status: u16,
        reason: String,
        body: Option<MsgBody>,
    },
    Connect {
        status: u16,
        reason: String,
        body: Option<MsgBody>,
    },
    Update {
        body: Option<MsgBody>,
    },
    Info {
        body: Option<MsgBody>,
    },
    Fail {
        status: u16,
        reason: String,
        /// Challenge to relay in `WWW-Authenticate`/`Proxy-Authenticate`.
        challenge: Option<String>,
    },
    Disconnect {
        redirect_url: Option<NameAddr>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CcEvent {
    pub kind: CcEventKind,
    pub rtime: RecvTime,
    pub origin: String,
    /// Headers the receiving leg adds to the request it sends.
    pub extra_headers: Vec<Header>,
}

impl CcEvent {
    pub fn new(kind: CcEventKind, rtime: RecvTime, origin: &str) -> Self {
        CcEvent {
            kind,
            rtime,
            origin: origin.to_string(),
            extra_headers: Vec::new(),
        }
    }

    pub fn disconnect(rtime: RecvTime, origin: &str) -> Self {
        CcEvent::new(CcEventKind::Disconnect { redirect_url: None }, rtime, origin)
    }

    pub fn fail(status: u16, reason: &str, rtime: RecvTime, origin: &str) -> Self {
        CcEvent::new(
            CcEventKind::Fail {
                status,
                reason: reason.to_string(),
                challenge: None,
            },
            rtime,
            origin,
        )
    }

    pub fn name(&self) -> &'static str {
        match &self.kind {
            CcEventKind::Try { .. } => "Try",
            CcEventKind::Ring { .. } => "Ring",
            CcEventKind::PreConnect { .. } => "PreConnect",
            CcEventKind::Connect { .. } => "Connect",
            CcEventKind::Update { .. } => "Update",
            CcEventKind::Info { .. } => "Info",
            CcEventKind::Fail { .. } => "Fail",
            CcEventKind::Disconnect { .. } => "Disconnect",
        }
    }
}

impl fmt::Display for CcEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CCEvent{}", self.name())?;
        match &self.kind {
            CcEventKind::Ring { status, .. }
            | CcEventKind::PreConnect { status, .. }
            | CcEventKind::Connect { status, .. }
            | CcEventKind::Fail { status, .. } => write!(f, "({})", status)?,
            CcEventKind::Disconnect {
                redirect_url: Some(url),
            } => write!(f, "(-> {})", url)?,
            _ => {}
        }
        write!(f, " from {}", self.origin)
    }
}

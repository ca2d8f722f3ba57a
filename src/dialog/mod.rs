//! Dialogs and the user agents that drive one call leg each.
//!
//! A [`Ua`] is either the server side of an incoming INVITE (the A-leg
//! of a call) or the client side of an outgoing one (an O-leg). It turns
//! SIP traffic into call-control events for its controller and events
//! from the controller back into SIP.
use std::fmt;

pub mod authenticate;
mod client_dialog;
#[allow(clippy::module_inception)]
pub mod dialog;
mod server_dialog;
pub mod ua;

#[cfg(test)]
mod tests;

pub use dialog::Dialog;
pub use ua::{LegHandle, LegId, Ua, UaDriver, UaOptions, UaOutput, UaRole, UaState, UaTimer};

/// Call-ID plus the tags of both sides, local first.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.call_id, self.local_tag, self.remote_tag)
    }
}

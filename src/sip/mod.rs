//! SIP message model.
//!
//! Messages keep their headers as raw `name: value` pairs in arrival order.
//! Typed views (`Via`, `NameAddr`, `CSeq`, ...) are parsed on demand through
//! [`Header::typed`] or the [`HasHeaders`] accessors, so headers nobody looks
//! at are never parsed and unknown headers pass through untouched.
pub mod header;
pub mod message;
pub mod method;
pub mod parser;
pub mod uri;

pub use header::{CSeq, Header, Headers, NameAddr, TypedHeader, Via};
pub use message::{make_response, HasHeaders, Request, Response, SipMessage};
pub use method::{reason_phrase, Method};
pub use uri::{HostPort, Param, SipUri};

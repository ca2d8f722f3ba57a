//! RFC 3261 section 17 transactions.
//!
//! The [`Endpoint`] owns every client and server transaction, the timer
//! wheel that drives retransmissions and timeouts, and the queue of
//! outgoing messages. Transaction users (dialogs, the proxy) talk to it
//! through [`ResponseReceiver`] and [`RequestReceiver`] and are never
//! called while the endpoint holds one of its own locks.
use rand::{distr::Alphanumeric, Rng};

mod client_invite;
mod client_non_invite;
pub mod endpoint;
pub mod key;
pub mod message;
mod server_invite;
mod server_non_invite;
mod timer;
pub mod transaction;

#[cfg(test)]
pub(crate) mod tests;

pub use endpoint::{
    Endpoint, EndpointBuilder, EndpointInner, EndpointInnerRef, EndpointOption, NewDialogAction,
    NewDialogHandler,
};
pub use key::{TransactionKey, TransactionRole};
pub use transaction::{
    RequestReceiver, RequestReceiverRef, ResponseReceiver, ResponseReceiverRef, ServerTransaction,
    TransactionState, TransactionTimer, TransactionType,
};

pub const TAG_LEN: usize = 8;
pub const BRANCH_LEN: usize = 12;
pub const CALL_ID_LEN: usize = 22;
pub const BRANCH_MAGIC: &str = "z9hG4bK";

pub fn random_text(count: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(count)
        .map(char::from)
        .collect()
}

pub fn make_via_branch() -> String {
    format!("{}{}", BRANCH_MAGIC, random_text(BRANCH_LEN))
}

pub fn make_tag() -> String {
    random_text(TAG_LEN)
}

pub fn make_call_id(domain: Option<&str>) -> String {
    match domain {
        Some(domain) => format!("{}@{}", random_text(CALL_ID_LEN), domain),
        None => random_text(CALL_ID_LEN),
    }
}

// A SIP back-to-back user agent on top of a transaction-stateful SIP stack

pub mod call;
pub mod config;
pub mod dialog;
pub mod error;
pub mod identity;
pub mod logging;
pub mod sip;
pub mod transaction;
pub mod transport;

pub use crate::error::{Error, Result};
pub use call::{CallController, CallMap};
pub use config::B2buaConfig;
pub use transaction::{Endpoint, EndpointBuilder};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

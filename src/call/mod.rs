//! Call control: the controller that couples two legs, the registry of
//! calls and the proxy for what the B2BUA does not terminate.
pub mod call_map;
pub mod controller;
pub mod event;
pub mod proxy;
pub mod sdp;

pub use call_map::CallMap;
pub use controller::CallController;
pub use event::{CcEvent, CcEventKind, MsgBody};
pub use proxy::StatefulProxy;

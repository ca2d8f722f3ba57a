use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub mod channel;
pub mod connection;
pub mod sip_addr;
pub mod stream;
pub mod tcp;
pub mod tcp_listener;
pub mod transport_layer;
pub mod udp;

pub use connection::{SipConnection, TransportEvent, TransportReceiver, TransportSender};
pub use sip_addr::{SipAddr, TransportKind};
pub use transport_layer::TransportLayer;

#[cfg(test)]
mod tests;

/// Receive time of a message, stamped once by the transport and carried
/// unchanged through transactions, dialogs and call-control events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvTime {
    /// Monotonic clock, used for timers and ordering.
    pub mono: Instant,
    /// Wall clock, used where a timestamp leaves the process.
    pub wall: SystemTime,
}

impl RecvTime {
    pub fn now() -> Self {
        RecvTime {
            mono: Instant::now(),
            wall: SystemTime::now(),
        }
    }

    pub fn wall_nanos(&self) -> u128 {
        self.wall
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default()
    }

    pub fn elapsed(&self) -> Duration {
        self.mono.elapsed()
    }
}

impl Default for RecvTime {
    fn default() -> Self {
        Self::now()
    }
}

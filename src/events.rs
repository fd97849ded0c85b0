//! Pipeline observer traits.
//!
//! Front-ends (CLI status loops, future UIs) learn about pipeline state
//! through these callbacks instead of polling. Every method has a no-op
//! default, so callers implement only what they render. Implementations
//! are invoked from pipeline threads and must not block.

use std::net::SocketAddr;

use crate::codec::DecoderMode;
use crate::registry::ListenerInfo;

/// Callbacks emitted by a running [`SenderPipeline`].
///
/// [`SenderPipeline`]: crate::network::sender::SenderPipeline
pub trait SenderObserver: Send + Sync {
    /// A listener said Hello for the first time.
    fn listener_joined(&self, addr: SocketAddr, display_name: &str) {
        let _ = (addr, display_name);
    }

    /// A listener said Goodbye or went stale.
    fn listener_left(&self, addr: SocketAddr, display_name: &str) {
        let _ = (addr, display_name);
    }

    /// The registry changed in any way; `listeners` is a sorted snapshot.
    fn registry_changed(&self, listeners: &[ListenerInfo]) {
        let _ = listeners;
    }

    /// Normalized RMS level of the captured audio, in [0, 1].
    fn level_changed(&self, level: f32) {
        let _ = level;
    }
}

/// Callbacks emitted by a running [`ReceiverPipeline`].
///
/// [`ReceiverPipeline`]: crate::network::receiver::ReceiverPipeline
pub trait ReceiverObserver: Send + Sync {
    /// The decoder switched between framed and raw payload handling.
    fn mode_changed(&self, mode: DecoderMode) {
        let _ = mode;
    }

    /// Decoder recovery keeps failing; audio continues best-effort.
    fn playback_degraded(&self, detail: &str) {
        let _ = detail;
    }
}

/// Observer that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl SenderObserver for NullObserver {}
impl ReceiverObserver for NullObserver {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_no_ops() {
        let observer = NullObserver;
        SenderObserver::level_changed(&observer, 0.5);
        SenderObserver::registry_changed(&observer, &[]);
        ReceiverObserver::mode_changed(&observer, DecoderMode::Raw);
        ReceiverObserver::playback_degraded(&observer, "decoder unavailable");
    }
}

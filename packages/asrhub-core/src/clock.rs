//! Monotonic clock and session identifier generation.
//!
//! All internal timestamps (queue chunks, FCM state entry times, silence
//! tracking) come from one [`HubClock`] so they are comparable. Wall time is
//! only used at the transport boundary for ISO-8601 event timestamps.

use std::sync::Arc;

use tokio::time::Instant;
use uuid::Uuid;

/// Monotonic time source measured in seconds since clock creation.
///
/// Backed by `tokio::time::Instant` so tests running with a paused runtime
/// (`#[tokio::test(start_paused = true)]`) observe the mocked clock.
#[derive(Debug, Clone)]
pub struct HubClock {
    origin: Instant,
}

impl HubClock {
    /// Creates a clock anchored at the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Creates a clock wrapped in an `Arc` for sharing across services.
    #[must_use]
    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Returns seconds elapsed since the clock origin.
    ///
    /// Monotonic and non-decreasing; sub-microsecond resolution.
    #[must_use]
    pub fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    /// Returns the underlying instant corresponding to `now()`.
    #[must_use]
    pub fn instant(&self) -> Instant {
        Instant::now()
    }
}

impl Default for HubClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Generates a new session identifier.
///
/// UUIDv7 embeds a millisecond timestamp in its most significant bits, so the
/// lexical order of generated ids matches creation order. This makes session
/// logs and traces sortable without a join against creation timestamps.
#[must_use]
pub fn session_id() -> String {
    Uuid::now_v7().to_string()
}

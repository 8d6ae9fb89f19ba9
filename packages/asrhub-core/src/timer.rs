//! Per-session named countdown timers.
//!
//! Each `(session_id, name)` pair has at most one RUNNING timer. Callbacks
//! run on their own spawned task, never inline with dispatch, so a slow or
//! panicking callback cannot stall other timers.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Upper bound on any timer duration (24 hours).
const MAX_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Callback invoked with `(session_id, timer_name)` when a timer fires.
pub type TimerCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

struct TimerEntry {
    deadline: Instant,
    duration: Duration,
    cancel: CancellationToken,
}

/// Keyed countdown service shared by all sessions.
pub struct TimerService {
    timers: DashMap<(String, String), TimerEntry>,
}

impl TimerService {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            timers: DashMap::new(),
        })
    }

    fn clamp(duration: Duration) -> Duration {
        duration.min(MAX_DURATION)
    }

    /// Starts a timer. No-op (returns false) if one is already RUNNING for
    /// the same `(session_id, name)`; use [`TimerService::reset`] to re-arm.
    pub fn start(
        self: &Arc<Self>,
        session_id: &str,
        name: &str,
        duration: Duration,
        callback: TimerCallback,
    ) -> bool {
        let key = (session_id.to_string(), name.to_string());
        if self.timers.contains_key(&key) {
            return false;
        }
        let duration = Self::clamp(duration);
        let cancel = CancellationToken::new();
        let deadline = Instant::now() + duration;
        self.timers.insert(
            key.clone(),
            TimerEntry {
                deadline,
                duration,
                cancel: cancel.clone(),
            },
        );

        let service = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    // Remove before firing so the callback can re-arm.
                    if service.timers.remove(&key).is_some() {
                        let (session_id, name) = key;
                        log::trace!("[Timer] {}/{} fired", session_id, name);
                        // Callback runs on its own task; a panic there is
                        // contained by the task boundary.
                        tokio::spawn(async move {
                            callback(&session_id, &name);
                        });
                    }
                }
            }
        });
        true
    }

    /// Cancels and re-arms with `duration`, or the original duration if None.
    /// Arms a fresh timer if none was running and `duration` is given.
    pub fn reset(
        self: &Arc<Self>,
        session_id: &str,
        name: &str,
        duration: Option<Duration>,
        callback: TimerCallback,
    ) {
        let key = (session_id.to_string(), name.to_string());
        let original = self.timers.remove(&key).map(|(_, entry)| {
            entry.cancel.cancel();
            entry.duration
        });
        let Some(duration) = duration.or(original) else {
            return;
        };
        self.start(session_id, name, duration, callback);
    }

    /// Cancels a timer. Idempotent.
    pub fn cancel(&self, session_id: &str, name: &str) {
        let key = (session_id.to_string(), name.to_string());
        if let Some((_, entry)) = self.timers.remove(&key) {
            entry.cancel.cancel();
        }
    }

    /// Seconds until the timer fires, or None if not RUNNING.
    #[must_use]
    pub fn remaining(&self, session_id: &str, name: &str) -> Option<f64> {
        let key = (session_id.to_string(), name.to_string());
        self.timers.get(&key).map(|entry| {
            entry
                .deadline
                .saturating_duration_since(Instant::now())
                .as_secs_f64()
        })
    }

    /// Cancels every timer of a session. Called on session destruction.
    pub fn cancel_all(&self, session_id: &str) {
        let keys: Vec<(String, String)> = self
            .timers
            .iter()
            .filter(|entry| entry.key().0 == session_id)
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            if let Some((_, entry)) = self.timers.remove(&key) {
                entry.cancel.cancel();
            }
        }
    }

    /// Number of RUNNING timers (all sessions).
    #[must_use]
    pub fn running(&self) -> usize {
        self.timers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_callback() -> (TimerCallback, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&fired);
        let callback: TimerCallback = Arc::new(move |_, _| {
            count.fetch_add(1, Ordering::SeqCst);
        });
        (callback, fired)
    }

    #[tokio::test(start_paused = true)]
    async fn timer_fires_exactly_once() {
        let timers = TimerService::new();
        let (callback, fired) = counting_callback();
        assert!(timers.start("s-1", "awake", Duration::from_secs(2), callback));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(timers.running(), 0);
        // Property: one start -> exactly one fire, never a second.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn start_while_running_is_noop() {
        let timers = TimerService::new();
        let (callback, fired) = counting_callback();
        assert!(timers.start("s-1", "awake", Duration::from_secs(5), Arc::clone(&callback)));
        assert!(!timers.start("s-1", "awake", Duration::from_secs(1), callback));
        tokio::time::sleep(Duration::from_secs(2)).await;
        // The second (shorter) start must not have replaced the first.
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_fire() {
        let timers = TimerService::new();
        let (callback, fired) = counting_callback();
        timers.start("s-1", "awake", Duration::from_secs(2), callback);
        timers.cancel("s-1", "awake");
        timers.cancel("s-1", "awake"); // idempotent
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(timers.remaining("s-1", "awake").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_rearms_with_original_duration() {
        let timers = TimerService::new();
        let (callback, fired) = counting_callback();
        timers.start("s-1", "awake", Duration::from_secs(4), Arc::clone(&callback));
        tokio::time::sleep(Duration::from_secs(3)).await;
        timers.reset("s-1", "awake", None, callback);
        // 3s in plus 2s more: without the reset this would have fired at 4s.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_reports_time_left() {
        let timers = TimerService::new();
        let (callback, _) = counting_callback();
        timers.start("s-1", "awake", Duration::from_secs(10), callback);
        tokio::time::sleep(Duration::from_secs(4)).await;
        let left = timers.remaining("s-1", "awake").unwrap();
        assert!((left - 6.0).abs() < 0.1, "remaining was {left}");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_clears_only_that_session() {
        let timers = TimerService::new();
        let (callback, fired) = counting_callback();
        timers.start("s-1", "awake", Duration::from_secs(2), Arc::clone(&callback));
        timers.start("s-1", "recording", Duration::from_secs(2), Arc::clone(&callback));
        timers.start("s-2", "awake", Duration::from_secs(2), callback);
        timers.cancel_all("s-1");
        assert_eq!(timers.running(), 1);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_callback_does_not_stall_other_timers() {
        let timers = TimerService::new();
        let (fast_callback, fast_fired) = counting_callback();
        let slow_callback: TimerCallback = Arc::new(move |_, _| {
            std::thread::yield_now();
        });
        timers.start("s-1", "slow", Duration::from_secs(1), slow_callback);
        timers.start("s-2", "fast", Duration::from_secs(1), fast_callback);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fast_fired.load(Ordering::SeqCst), 1);
    }
}

//! Per-session timestamped audio queue with multi-reader cursors.
//!
//! One writer (the transport path) appends chunks; any number of named
//! readers consume independently without affecting each other. Eviction is
//! driven by retention limits, and a reader that falls behind the eviction
//! horizon is snapped forward and flagged lagged rather than fed duplicates.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::audio::AudioFormat;
use crate::clock::HubClock;
use crate::config::QueueConfig;

/// Minimum spacing enforced between two chunk timestamps (1 microsecond).
const TIMESTAMP_EPSILON: f64 = 1e-6;

/// Errors surfaced by queue operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The owning session was destroyed.
    #[error("queue closed")]
    Closed,

    /// `pull_blocking` or `reader_status` on a reader that was never opened.
    #[error("unknown reader: {0}")]
    UnknownReader(String),
}

/// One chunk of hub-format PCM with its queue-assigned timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct TimestampedChunk {
    /// Monotonic seconds, assigned at push, strictly increasing per queue.
    pub timestamp: f64,
    pub audio: Bytes,
    /// Seconds of audio in `audio` at the hub format.
    pub duration: f64,
}

/// Snapshot of a reader cursor's health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderStatus {
    /// True if eviction overtook this cursor since the last status read.
    /// Reading the status clears the flag, so each lag event surfaces once.
    pub lagged: bool,
}

struct Reader {
    /// Timestamp of the last chunk delivered; the cursor sits just after it.
    position: f64,
    lagged: bool,
}

struct Inner {
    chunks: VecDeque<TimestampedChunk>,
    bytes: usize,
    readers: HashMap<String, Reader>,
    last_timestamp: f64,
}

/// Append-only timestamped chunk sequence with independent reader cursors.
pub struct AudioQueue {
    clock: Arc<HubClock>,
    config: QueueConfig,
    inner: Mutex<Inner>,
    notify: Notify,
    closed: AtomicBool,
}

impl AudioQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new(clock: Arc<HubClock>, config: QueueConfig) -> Self {
        Self {
            clock,
            config,
            inner: Mutex::new(Inner {
                chunks: VecDeque::new(),
                bytes: 0,
                readers: HashMap::new(),
                last_timestamp: f64::NEG_INFINITY,
            }),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Appends a chunk, assigns its timestamp, evicts past retention limits,
    /// and returns the assigned timestamp.
    pub fn push(&self, audio: Bytes) -> Result<f64, QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        let duration = AudioFormat::HUB.duration_secs(audio.len());
        let mut inner = self.inner.lock();

        // Strictly increasing timestamps; bump by 1us on collision.
        let mut timestamp = self.clock.now();
        if timestamp <= inner.last_timestamp {
            timestamp = inner.last_timestamp + TIMESTAMP_EPSILON;
        }
        inner.last_timestamp = timestamp;

        inner.bytes += audio.len();
        inner.chunks.push_back(TimestampedChunk {
            timestamp,
            audio,
            duration,
        });
        self.evict(&mut inner);
        drop(inner);

        self.notify.notify_waiters();
        Ok(timestamp)
    }

    /// Evicts oldest-first until byte and retention limits hold, marking
    /// overtaken cursors lagged. List and cursors mutate under one lock.
    fn evict(&self, inner: &mut Inner) {
        let newest = match inner.chunks.back() {
            Some(chunk) => chunk.timestamp,
            None => return,
        };
        while inner.chunks.len() > 1 {
            let front = &inner.chunks[0];
            let over_bytes = inner.bytes > self.config.max_bytes;
            let over_age = newest - front.timestamp > self.config.max_retention_secs;
            if !over_bytes && !over_age {
                break;
            }
            let evicted = inner.chunks.pop_front().expect("len checked above");
            inner.bytes -= evicted.audio.len();
            for reader in inner.readers.values_mut() {
                if reader.position < evicted.timestamp {
                    reader.lagged = true;
                }
            }
        }
    }

    /// Opens (or re-opens) a named reader cursor.
    ///
    /// Idempotent: an existing cursor with the same id is left untouched, so
    /// two consumers sharing a `reader_id` share one cursor. A new cursor
    /// starts at the current tail, or at `from_timestamp` (clamped to the
    /// present; cursors are never initialized into the future).
    pub fn open_reader(&self, reader_id: &str, from_timestamp: Option<f64>) {
        let mut inner = self.inner.lock();
        if inner.readers.contains_key(reader_id) {
            return;
        }
        let tail = inner.last_timestamp.max(f64::MIN);
        let position = match from_timestamp {
            // Cursor sits just before the requested time so the chunk at
            // `from_timestamp` itself is delivered.
            Some(ts) => ts.min(tail) - TIMESTAMP_EPSILON,
            None => tail,
        };
        inner.readers.insert(
            reader_id.to_string(),
            Reader {
                position,
                lagged: false,
            },
        );
    }

    /// Removes a reader cursor. Idempotent.
    pub fn close_reader(&self, reader_id: &str) {
        self.inner.lock().readers.remove(reader_id);
        // Wake any puller parked on this cursor so it can observe removal.
        self.notify.notify_waiters();
    }

    /// Returns and clears the lag flag for a reader.
    pub fn reader_status(&self, reader_id: &str) -> Result<ReaderStatus, QueueError> {
        let mut inner = self.inner.lock();
        let reader = inner
            .readers
            .get_mut(reader_id)
            .ok_or_else(|| QueueError::UnknownReader(reader_id.to_string()))?;
        let lagged = reader.lagged;
        reader.lagged = false;
        Ok(ReaderStatus { lagged })
    }

    /// Returns the next chunk strictly after the reader's cursor and advances
    /// it, blocking up to `timeout`. `Ok(None)` on timeout. Non-destructive
    /// with respect to every other reader.
    ///
    /// If eviction overtook the cursor, the earliest surviving chunk is
    /// returned and the reader's lag flag is set (readable once via
    /// [`AudioQueue::reader_status`]).
    pub async fn pull_blocking(
        &self,
        reader_id: &str,
        timeout: std::time::Duration,
    ) -> Result<Option<TimestampedChunk>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);

            {
                let mut inner = self.inner.lock();
                let reader = inner
                    .readers
                    .get(reader_id)
                    .ok_or_else(|| QueueError::UnknownReader(reader_id.to_string()))?;
                let position = reader.position;
                let next = inner
                    .chunks
                    .iter()
                    .find(|chunk| chunk.timestamp > position)
                    .cloned();
                if let Some(chunk) = next {
                    let reader = inner.readers.get_mut(reader_id).expect("checked above");
                    reader.position = chunk.timestamp;
                    return Ok(Some(chunk));
                }
                if self.closed.load(Ordering::Acquire) {
                    return Err(QueueError::Closed);
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    /// Returns all chunks whose timestamps fall inside the closed interval
    /// `[start_ts, end_ts]`, without touching any cursor.
    #[must_use]
    pub fn get_between(&self, start_ts: f64, end_ts: f64) -> Vec<TimestampedChunk> {
        self.inner
            .lock()
            .chunks
            .iter()
            .filter(|chunk| chunk.timestamp >= start_ts && chunk.timestamp <= end_ts)
            .cloned()
            .collect()
    }

    /// Bytes currently retained.
    #[must_use]
    pub fn retained_bytes(&self) -> usize {
        self.inner.lock().bytes
    }

    /// Closes the queue: further pushes fail and parked pullers error out.
    /// Called on session destruction.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Whether the queue has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

//! Windowed buffer manager feeding one downstream consumer.
//!
//! Three cutting modes cover the detector/recognizer recipes: fixed frames
//! (VAD, wake word), overlapping sliding windows (batch ASR), and dynamic
//! min/max-bounded windows (streaming ASR).

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::config::{BufferConfig, BufferMode};

/// Errors surfaced by buffer operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    /// Accepting the bytes would exceed `max_buffer_size`.
    #[error("buffer overflow: {buffered} + {incoming} > {cap}")]
    Overflow {
        buffered: usize,
        incoming: usize,
        cap: usize,
    },
}

/// Byte accumulator that cuts frames per its configured mode.
///
/// Single-consumer: one `BufferManager` feeds exactly one detector or
/// recognizer. Overflow policy is decided by the caller; the manager only
/// reports the condition and offers [`BufferManager::make_room`].
pub struct BufferManager {
    config: BufferConfig,
    accumulator: BytesMut,
    flush_requested: bool,
}

impl BufferManager {
    #[must_use]
    pub fn new(config: BufferConfig) -> Self {
        Self {
            config,
            accumulator: BytesMut::new(),
            flush_requested: false,
        }
    }

    /// Accepts bytes into the accumulator.
    ///
    /// Returns `Ok(true)` when the push made at least one frame ready.
    /// Fails with [`BufferError::Overflow`] when the cap would be exceeded;
    /// the accumulator is left unchanged in that case.
    pub fn push(&mut self, bytes: &[u8]) -> Result<bool, BufferError> {
        if self.accumulator.len() + bytes.len() > self.config.max_buffer_size {
            return Err(BufferError::Overflow {
                buffered: self.accumulator.len(),
                incoming: bytes.len(),
                cap: self.config.max_buffer_size,
            });
        }
        self.accumulator.extend_from_slice(bytes);
        Ok(self.ready())
    }

    /// Drops bytes from the head until `incoming` more bytes would fit.
    /// Used by callers configured with `drop_oldest`.
    pub fn make_room(&mut self, incoming: usize) {
        let cap = self.config.max_buffer_size;
        if incoming >= cap {
            self.accumulator.clear();
            return;
        }
        let keep = cap - incoming;
        if self.accumulator.len() > keep {
            let drop = self.accumulator.len() - keep;
            self.accumulator.advance_head(drop);
        }
    }

    /// Whether at least one frame can be popped.
    #[must_use]
    pub fn ready(&self) -> bool {
        let len = self.accumulator.len();
        match self.config.mode {
            BufferMode::Fixed | BufferMode::Sliding => len >= self.config.frame_bytes(),
            BufferMode::Dynamic => {
                let min = self.min_bytes();
                let max = self.max_bytes();
                len >= min && (self.flush_requested || len >= max)
            }
        }
    }

    /// Pops one frame if ready.
    ///
    /// Fixed: the frame is removed from the head. Sliding: only `step_size`
    /// is removed, so consecutive frames overlap by `frame_size - step_size`.
    /// Dynamic: emits min(len, max_duration) bytes and removes them.
    pub fn pop(&mut self) -> Option<Bytes> {
        if !self.ready() {
            return None;
        }
        match self.config.mode {
            BufferMode::Fixed => {
                let frame = self.config.frame_bytes();
                Some(self.accumulator.split_to(frame).freeze())
            }
            BufferMode::Sliding => {
                let frame = self.config.frame_bytes();
                let step = self.config.step_bytes();
                let out = Bytes::copy_from_slice(&self.accumulator[..frame]);
                self.accumulator.advance_head(step);
                Some(out)
            }
            BufferMode::Dynamic => {
                let take = self.accumulator.len().min(self.max_bytes());
                self.flush_requested = false;
                Some(self.accumulator.split_to(take).freeze())
            }
        }
    }

    /// Pops every ready frame.
    pub fn pop_all(&mut self) -> Vec<Bytes> {
        let mut frames = Vec::new();
        while let Some(frame) = self.pop() {
            frames.push(frame);
        }
        frames
    }

    /// Requests emission of the current dynamic window.
    ///
    /// Returns the window if the accumulator has reached `min_duration_ms`;
    /// below the minimum the request is remembered for the next push. For
    /// fixed/sliding modes this drains any ready frame plus the remainder.
    pub fn flush(&mut self) -> Option<Bytes> {
        match self.config.mode {
            BufferMode::Dynamic => {
                self.flush_requested = true;
                self.pop()
            }
            BufferMode::Fixed | BufferMode::Sliding => {
                if self.accumulator.is_empty() {
                    return None;
                }
                let rest = self.accumulator.split().freeze();
                Some(rest)
            }
        }
    }

    /// Clears the accumulator and any pending flush request.
    pub fn reset(&mut self) {
        self.accumulator.clear();
        self.flush_requested = false;
    }

    /// Bytes currently buffered.
    #[must_use]
    pub fn buffered_bytes(&self) -> usize {
        self.accumulator.len()
    }

    /// The recipe this manager was built from.
    #[must_use]
    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    fn min_bytes(&self) -> usize {
        self.config.ms_to_bytes(self.config.min_duration_ms.unwrap_or(0))
    }

    fn max_bytes(&self) -> usize {
        self.config
            .ms_to_bytes(self.config.max_duration_ms.unwrap_or(u64::MAX / 1_000_000))
    }
}

/// Head-advance helper for `BytesMut` (split_to without keeping the head).
trait AdvanceHead {
    fn advance_head(&mut self, n: usize);
}

impl AdvanceHead for BytesMut {
    fn advance_head(&mut self, n: usize) {
        let _ = self.split_to(n.min(self.len()));
    }
}

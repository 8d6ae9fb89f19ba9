//! Core audio state: formats, the per-session timestamped queue, and the
//! windowed buffer manager.
//!
//! These are deliberately kept as core state rather than services: everything
//! downstream (detectors, recognizers, the recorder) is a consumer of the
//! queue, and every consumer shapes its input through a buffer manager.

mod buffer;
mod format;
mod queue;

pub use buffer::{BufferError, BufferManager};
pub use format::AudioFormat;
pub use queue::{AudioQueue, QueueError, ReaderStatus, TimestampedChunk};

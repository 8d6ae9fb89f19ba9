//! ASR Hub core - speech-recognition middleware.
//!
//! This crate provides the session orchestration substrate for ASR Hub: live
//! audio arrives from many concurrent clients over several transports, runs
//! through a configurable detection pipeline, and finalized utterances are
//! dispatched to pooled ASR backends, with transcripts returned as
//! asynchronous events.
//!
//! # Architecture
//!
//! - [`clock`]: monotonic time source and time-ordered session ids
//! - [`config`]: immutable configuration snapshot and buffer recipes
//! - [`audio`]: the timestamped multi-reader queue and the buffer manager
//! - [`services`]: pipeline service contracts and reference implementations
//! - [`provider`]: ASR backend contract and the bounded worker pool
//! - [`fcm`]: the per-session finite control machine
//! - [`timer`]: per-session named countdown timers
//! - [`store`]: action dispatch, reducer, selectors, subscribers
//! - [`events`]: outbound event types and the broadcast bridge
//! - [`effects`]: the session orchestration glue
//! - [`api`]: HTTP + SSE, WebSocket, Socket.IO and Redis adapters
//! - [`bootstrap`]: the composition root
//!
//! Concrete ASR/VAD/wake-word models stay outside this crate; they plug in
//! through the [`services`] and [`provider`] traits.

#![warn(clippy::all)]

pub mod api;
pub mod audio;
pub mod bootstrap;
pub mod clock;
pub mod config;
pub mod effects;
pub mod error;
pub mod events;
pub mod fcm;
pub mod provider;
pub mod services;
pub mod store;
pub mod timer;

// Re-export commonly used types at the crate root.
pub use api::{start_server, AppState, ServerError, WsConnectionManager};
pub use audio::{AudioFormat, AudioQueue, BufferManager, TimestampedChunk};
pub use bootstrap::{bootstrap_hub, BackendFactory, HubServices};
pub use clock::{session_id, HubClock};
pub use config::{BufferConfig, BufferMode, FcmConfig, HubConfig, PoolConfig, QueueConfig};
pub use effects::{FcmRegistry, ServiceSet, SessionEffects};
pub use error::{ErrorCode, HubError, HubResult};
pub use events::{EventBridge, EventSink, OutboundEvent};
pub use fcm::{Fcm, FcmEvent, FcmState, Strategy};
pub use provider::{AsrBackend, Lease, MockBackend, ProviderPool, Transcript};
pub use services::{
    Converter, Denoiser, EnergyVad, Enhancer, LinearConverter, RecorderService, VadDetector,
    WakeWordDetector,
};
pub use store::{Action, HubState, StateStore};
pub use timer::TimerService;

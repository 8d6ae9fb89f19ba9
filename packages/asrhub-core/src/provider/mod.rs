//! ASR provider backends and the bounded worker pool.

mod backend;
mod pool;

pub use backend::{AsrBackend, BackendError, MockBackend, Transcript};
pub use pool::{Lease, PoolError, PoolSnapshot, ProviderPool};

//! Bounded pool of ASR worker instances with lease semantics.
//!
//! Instances are mutually exclusive: a leased instance is never handed to a
//! second waiter until released. Waiters queue FIFO with an aging boost so
//! no session starves, and a per-session counter enforces the lease quota.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::backend::{AsrBackend, BackendError, Transcript};
use crate::audio::AudioFormat;
use crate::config::PoolConfig;

/// Errors surfaced by lease acquisition.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// No instance became available within the acquire timeout.
    #[error("acquire timed out")]
    AcquireTimeout,

    /// The session already holds `per_session_quota` leases.
    #[error("per-session lease quota exceeded")]
    QuotaExceeded,

    /// The pool is shutting down.
    #[error("pool draining")]
    PoolDraining,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum InstanceState {
    Idle,
    Leased,
}

struct InstanceSlot {
    id: u64,
    backend: Arc<dyn AsrBackend>,
    state: InstanceState,
    created_at: Instant,
    last_used_at: Instant,
    /// Requests served over the instance lifetime (least-loaded selection).
    served: u64,
    owner: Option<String>,
    consecutive_failures: u32,
}

struct Grant {
    instance_id: u64,
    backend: Arc<dyn AsrBackend>,
}

struct Waiter {
    waiter_id: u64,
    session_id: String,
    enqueued_at: Instant,
    tx: oneshot::Sender<Result<Grant, PoolError>>,
}

struct PoolInner {
    instances: Vec<InstanceSlot>,
    waiters: VecDeque<Waiter>,
    active_leases: HashMap<String, usize>,
    draining: bool,
    next_instance_id: u64,
    next_waiter_id: u64,
}

/// Aggregate pool state for health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub name: String,
    pub size: usize,
    pub leased: usize,
    pub waiters: usize,
    pub min_size: usize,
    pub max_size: usize,
}

type BackendFactory = Box<dyn Fn() -> Arc<dyn AsrBackend> + Send + Sync>;

/// Bounded set of ASR worker instances for one backend type.
pub struct ProviderPool {
    name: String,
    config: PoolConfig,
    factory: BackendFactory,
    inner: Mutex<PoolInner>,
}

impl ProviderPool {
    /// Creates the pool and eagerly builds `min_size` instances.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        config: PoolConfig,
        factory: impl Fn() -> Arc<dyn AsrBackend> + Send + Sync + 'static,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            name: name.into(),
            config,
            factory: Box::new(factory),
            inner: Mutex::new(PoolInner {
                instances: Vec::new(),
                waiters: VecDeque::new(),
                active_leases: HashMap::new(),
                draining: false,
                next_instance_id: 1,
                next_waiter_id: 1,
            }),
        });
        {
            let mut inner = pool.inner.lock();
            for _ in 0..pool.config.min_size {
                let slot = pool.build_instance(&mut inner);
                inner.instances.push(slot);
            }
        }
        pool
    }

    fn build_instance(&self, inner: &mut PoolInner) -> InstanceSlot {
        let id = inner.next_instance_id;
        inner.next_instance_id += 1;
        let now = Instant::now();
        log::debug!("[Pool:{}] creating instance #{}", self.name, id);
        InstanceSlot {
            id,
            backend: (self.factory)(),
            state: InstanceState::Idle,
            created_at: now,
            last_used_at: now,
            served: 0,
            owner: None,
            consecutive_failures: 0,
        }
    }

    /// Idle instance with fewest served requests, ties by least-recently-used.
    fn pick_idle(inner: &mut PoolInner) -> Option<&mut InstanceSlot> {
        inner
            .instances
            .iter_mut()
            .filter(|slot| slot.state == InstanceState::Idle)
            .min_by_key(|slot| (slot.served, slot.last_used_at))
    }

    fn grant_slot(slot: &mut InstanceSlot, session_id: &str) -> Grant {
        slot.state = InstanceState::Leased;
        slot.owner = Some(session_id.to_string());
        slot.served += 1;
        slot.last_used_at = Instant::now();
        Grant {
            instance_id: slot.id,
            backend: Arc::clone(&slot.backend),
        }
    }

    /// Picks the most urgent waiter: FIFO order, with urgency boosted by
    /// `wait_time / acquire_timeout` so long waits climb past later arrivals.
    fn pick_waiter(&self, inner: &mut PoolInner) -> Option<Waiter> {
        if inner.waiters.is_empty() {
            return None;
        }
        let now = Instant::now();
        let timeout = self.config.acquire_timeout_secs.max(1) as f64;
        let best = inner
            .waiters
            .iter()
            .enumerate()
            .map(|(idx, waiter)| {
                let aging = now.duration_since(waiter.enqueued_at).as_secs_f64() / timeout;
                (idx, idx as f64 - aging)
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(idx, _)| idx)?;
        inner.waiters.remove(best)
    }

    /// Hands idle instances to waiters until one side runs out.
    fn grant_next(&self, inner: &mut PoolInner) {
        while let Some(waiter) = {
            if Self::pick_idle(inner).is_none() {
                None
            } else {
                self.pick_waiter(inner)
            }
        } {
            let quota = self.config.per_session_quota;
            let active = inner
                .active_leases
                .get(&waiter.session_id)
                .copied()
                .unwrap_or(0);
            if active >= quota {
                let _ = waiter.tx.send(Err(PoolError::QuotaExceeded));
                continue;
            }
            let grant = {
                let slot = Self::pick_idle(inner).expect("idle instance checked above");
                Self::grant_slot(slot, &waiter.session_id)
            };
            let instance_id = grant.instance_id;
            let session = waiter.session_id.clone();
            *inner.active_leases.entry(session.clone()).or_insert(0) += 1;
            if waiter.tx.send(Ok(grant)).is_err() {
                // Waiter gave up (cancelled); revert so the instance is not
                // stranded in LEASED with nobody holding the lease.
                self.revert_grant(inner, instance_id, &session);
            }
        }
    }

    fn revert_grant(&self, inner: &mut PoolInner, instance_id: u64, session_id: &str) {
        if let Some(slot) = inner.instances.iter_mut().find(|s| s.id == instance_id) {
            slot.state = InstanceState::Idle;
            slot.owner = None;
            slot.served = slot.served.saturating_sub(1);
        }
        Self::decrement_lease(inner, session_id);
    }

    fn decrement_lease(inner: &mut PoolInner, session_id: &str) {
        if let Some(count) = inner.active_leases.get_mut(session_id) {
            *count -= 1;
            if *count == 0 {
                inner.active_leases.remove(session_id);
            }
        }
    }

    /// Acquires a lease for the session, blocking up to `timeout`.
    pub async fn lease(
        self: &Arc<Self>,
        session_id: &str,
        timeout: Duration,
    ) -> Result<Lease, PoolError> {
        let (waiter_id, mut rx) = {
            let mut inner = self.inner.lock();
            if inner.draining {
                return Err(PoolError::PoolDraining);
            }
            let active = inner.active_leases.get(session_id).copied().unwrap_or(0);
            if active >= self.config.per_session_quota {
                return Err(PoolError::QuotaExceeded);
            }

            let granted = Self::pick_idle(&mut inner).map(|slot| Self::grant_slot(slot, session_id));
            if let Some(grant) = granted {
                *inner
                    .active_leases
                    .entry(session_id.to_string())
                    .or_insert(0) += 1;
                return Ok(self.make_lease(grant, session_id));
            }

            if inner.instances.len() < self.config.max_size {
                let mut slot = self.build_instance(&mut inner);
                let grant = Self::grant_slot(&mut slot, session_id);
                inner.instances.push(slot);
                *inner
                    .active_leases
                    .entry(session_id.to_string())
                    .or_insert(0) += 1;
                return Ok(self.make_lease(grant, session_id));
            }

            // All instances busy at max size: park as a waiter.
            let (tx, rx) = oneshot::channel();
            let waiter_id = inner.next_waiter_id;
            inner.next_waiter_id += 1;
            inner.waiters.push_back(Waiter {
                waiter_id,
                session_id: session_id.to_string(),
                enqueued_at: Instant::now(),
                tx,
            });
            (waiter_id, rx)
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(Ok(grant))) => Ok(self.make_lease(grant, session_id)),
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_closed)) => Err(PoolError::PoolDraining),
            Err(_elapsed) => {
                let still_waiting = {
                    let mut inner = self.inner.lock();
                    let before = inner.waiters.len();
                    inner.waiters.retain(|w| w.waiter_id != waiter_id);
                    inner.waiters.len() < before
                };
                if still_waiting {
                    Err(PoolError::AcquireTimeout)
                } else {
                    // A grant raced the timeout; collect it.
                    match rx.await {
                        Ok(Ok(grant)) => Ok(self.make_lease(grant, session_id)),
                        Ok(Err(err)) => Err(err),
                        Err(_) => Err(PoolError::PoolDraining),
                    }
                }
            }
        }
    }

    fn make_lease(self: &Arc<Self>, grant: Grant, session_id: &str) -> Lease {
        Lease {
            pool: Arc::clone(self),
            instance_id: grant.instance_id,
            session_id: session_id.to_string(),
            backend: grant.backend,
            released: false,
        }
    }

    /// Returns an instance to the pool after an async health probe.
    ///
    /// A failed probe (or a failure streak past the threshold) retires the
    /// instance and replaces it to keep `min_size`.
    async fn release_with_probe(&self, instance_id: u64, session_id: &str) {
        let backend = {
            let inner = self.inner.lock();
            inner
                .instances
                .iter()
                .find(|slot| slot.id == instance_id)
                .map(|slot| Arc::clone(&slot.backend))
        };
        let healthy = match backend {
            Some(backend) => backend.probe().await,
            None => return,
        };
        self.finish_release(instance_id, session_id, healthy);
    }

    fn finish_release(&self, instance_id: u64, session_id: &str, healthy: bool) {
        let mut inner = self.inner.lock();
        Self::decrement_lease(&mut inner, session_id);
        let failed_streak = inner
            .instances
            .iter()
            .find(|slot| slot.id == instance_id)
            .map(|slot| slot.consecutive_failures >= self.config.unhealthy_after_failures)
            .unwrap_or(false);

        if !healthy || failed_streak {
            log::warn!(
                "[Pool:{}] instance #{} unhealthy after release, replacing",
                self.name,
                instance_id
            );
            inner.instances.retain(|slot| slot.id != instance_id);
            while inner.instances.len() < self.config.min_size {
                let slot = self.build_instance(&mut inner);
                inner.instances.push(slot);
            }
        } else if let Some(slot) = inner.instances.iter_mut().find(|s| s.id == instance_id) {
            slot.state = InstanceState::Idle;
            slot.owner = None;
            slot.last_used_at = Instant::now();
        }
        self.grant_next(&mut inner);
    }

    /// Records a transcription outcome for failure-streak accounting.
    ///
    /// Transcription errors do not poison the instance by themselves; only a
    /// configured streak of consecutive failures does.
    fn record_result(&self, instance_id: u64, ok: bool) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.instances.iter_mut().find(|s| s.id == instance_id) {
            if ok {
                slot.consecutive_failures = 0;
            } else {
                slot.consecutive_failures += 1;
            }
        }
    }

    /// Spawns the maintenance task: health probes of idle instances, idle
    /// reaping and auto-scaling. One size change at most per scale tick.
    pub fn start_maintenance(self: &Arc<Self>, cancel: CancellationToken) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let health_every = Duration::from_secs(pool.config.health_check_interval_secs.max(1));
            let scale_every = Duration::from_secs(pool.config.auto_scale.scale_interval_secs.max(1));
            let mut health_tick = tokio::time::interval(health_every);
            let mut scale_tick = tokio::time::interval(scale_every);
            health_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            scale_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = health_tick.tick() => {
                        pool.health_pass().await;
                        pool.reap_idle();
                    }
                    _ = scale_tick.tick() => {
                        if pool.config.auto_scale.enabled {
                            pool.scale_pass();
                        }
                    }
                }
            }
            log::debug!("[Pool:{}] maintenance task stopped", pool.name);
        });
    }

    /// Probes every idle instance; a failure streak triggers replacement.
    async fn health_pass(&self) {
        let idle: Vec<(u64, Arc<dyn AsrBackend>)> = {
            let inner = self.inner.lock();
            inner
                .instances
                .iter()
                .filter(|slot| slot.state == InstanceState::Idle)
                .map(|slot| (slot.id, Arc::clone(&slot.backend)))
                .collect()
        };
        for (id, backend) in idle {
            let ok = backend.probe().await;
            let mut inner = self.inner.lock();
            let Some(slot) = inner.instances.iter_mut().find(|s| s.id == id) else {
                continue;
            };
            if slot.state != InstanceState::Idle {
                continue; // leased while we probed
            }
            if ok {
                slot.consecutive_failures = 0;
                continue;
            }
            slot.consecutive_failures += 1;
            if slot.consecutive_failures >= self.config.unhealthy_after_failures {
                log::warn!("[Pool:{}] instance #{} failed health checks, replacing", self.name, id);
                inner.instances.retain(|s| s.id != id);
                while inner.instances.len() < self.config.min_size {
                    let slot = self.build_instance(&mut inner);
                    inner.instances.push(slot);
                }
                self.grant_next(&mut inner);
            }
        }
    }

    /// Retires idle instances past `idle_timeout` while above `min_size`.
    fn reap_idle(&self) {
        let mut inner = self.inner.lock();
        let idle_timeout = Duration::from_secs(self.config.idle_timeout_secs);
        let now = Instant::now();
        while inner.instances.len() > self.config.min_size {
            let stale = inner
                .instances
                .iter()
                .filter(|slot| {
                    slot.state == InstanceState::Idle
                        && now.duration_since(slot.last_used_at) > idle_timeout
                })
                .min_by_key(|slot| slot.created_at)
                .map(|slot| slot.id);
            match stale {
                Some(id) => {
                    log::debug!("[Pool:{}] retiring idle instance #{}", self.name, id);
                    inner.instances.retain(|slot| slot.id != id);
                }
                None => break,
            }
        }
    }

    /// One scaling decision: up on high utilization, down on low, never both.
    fn scale_pass(&self) {
        let mut inner = self.inner.lock();
        let size = inner.instances.len();
        if size == 0 {
            return;
        }
        let leased = inner
            .instances
            .iter()
            .filter(|slot| slot.state == InstanceState::Leased)
            .count();
        let utilization = leased as f64 / size as f64;
        let auto = &self.config.auto_scale;

        if utilization >= auto.scale_up_threshold && size < self.config.max_size {
            log::info!(
                "[Pool:{}] scaling up ({}/{} leased)",
                self.name,
                leased,
                size
            );
            let slot = self.build_instance(&mut inner);
            inner.instances.push(slot);
            self.grant_next(&mut inner);
        } else if utilization <= auto.scale_down_threshold && size > self.config.min_size {
            // Retire one idle instance, oldest first.
            let oldest_idle = inner
                .instances
                .iter()
                .filter(|slot| slot.state == InstanceState::Idle)
                .min_by_key(|slot| slot.created_at)
                .map(|slot| slot.id);
            if let Some(id) = oldest_idle {
                log::info!("[Pool:{}] scaling down, retiring #{}", self.name, id);
                inner.instances.retain(|slot| slot.id != id);
            }
        }
    }

    /// Marks the pool draining: waiters fail fast, new leases are refused.
    pub fn drain(&self) {
        let mut inner = self.inner.lock();
        inner.draining = true;
        for waiter in inner.waiters.drain(..) {
            let _ = waiter.tx.send(Err(PoolError::PoolDraining));
        }
    }

    /// Aggregate state for introspection.
    #[must_use]
    pub fn snapshot(&self) -> PoolSnapshot {
        let inner = self.inner.lock();
        PoolSnapshot {
            name: self.name.clone(),
            size: inner.instances.len(),
            leased: inner
                .instances
                .iter()
                .filter(|slot| slot.state == InstanceState::Leased)
                .count(),
            waiters: inner.waiters.len(),
            min_size: self.config.min_size,
            max_size: self.config.max_size,
        }
    }

    /// Leases held by one session right now.
    #[must_use]
    pub fn session_leases(&self, session_id: &str) -> usize {
        self.inner
            .lock()
            .active_leases
            .get(session_id)
            .copied()
            .unwrap_or(0)
    }
}

/// Bounded-time ownership of one provider instance by one session.
///
/// Dropping without [`Lease::release`] returns the instance without the
/// post-release health probe.
pub struct Lease {
    pool: Arc<ProviderPool>,
    instance_id: u64,
    session_id: String,
    backend: Arc<dyn AsrBackend>,
    released: bool,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("instance_id", &self.instance_id)
            .field("session_id", &self.session_id)
            .field("released", &self.released)
            .finish()
    }
}

impl Lease {
    /// The leased instance id.
    #[must_use]
    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    /// Transcribes on the leased instance, recording the outcome for
    /// failure-streak accounting.
    pub async fn transcribe(
        &self,
        audio: bytes::Bytes,
        format: AudioFormat,
    ) -> Result<Transcript, BackendError> {
        let result = self.backend.transcribe(audio, format).await;
        self.pool.record_result(self.instance_id, result.is_ok());
        result
    }

    /// Returns the instance to the pool after a post-release health probe.
    pub async fn release(mut self) {
        self.released = true;
        let pool = Arc::clone(&self.pool);
        let instance_id = self.instance_id;
        let session_id = self.session_id.clone();
        pool.release_with_probe(instance_id, &session_id).await;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.released {
            self.pool
                .finish_release(self.instance_id, &self.session_id, true);
        }
    }
}

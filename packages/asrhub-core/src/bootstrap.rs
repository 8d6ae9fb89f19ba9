//! Application bootstrap and dependency wiring.
//!
//! The composition root: every service is instantiated and wired here, in
//! dependency order, so the relationships stay visible in one place and
//! embedders can swap implementations for testing.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::api::{AppState, WsConnectionManager};
use crate::clock::HubClock;
use crate::config::HubConfig;
use crate::effects::{FcmRegistry, ServiceSet, SessionEffects};
use crate::error::{HubError, HubResult};
use crate::events::EventBridge;
use crate::provider::{AsrBackend, ProviderPool};
use crate::services::RecorderService;
use crate::store::{StateStore, TransitionValidator};
use crate::timer::TimerService;

/// Factory building worker instances for one backend type.
pub type BackendFactory = Arc<dyn Fn() -> Arc<dyn AsrBackend> + Send + Sync>;

/// Container for all bootstrapped services.
#[derive(Clone)]
pub struct HubServices {
    pub config: Arc<HubConfig>,
    pub clock: Arc<HubClock>,
    pub store: Arc<StateStore>,
    pub timers: Arc<TimerService>,
    pub registry: Arc<FcmRegistry>,
    pub pools: HashMap<String, Arc<ProviderPool>>,
    pub effects: Arc<SessionEffects>,
    pub bridge: Arc<EventBridge>,
    pub ws_manager: Arc<WsConnectionManager>,
    pub cancel_token: CancellationToken,
}

impl std::fmt::Debug for HubServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubServices").finish_non_exhaustive()
    }
}

impl HubServices {
    /// Builds the API-layer state from the wired services.
    #[must_use]
    pub fn app_state(&self) -> AppState {
        AppState {
            effects: Arc::clone(&self.effects),
            store: Arc::clone(&self.store),
            bridge: Arc::clone(&self.bridge),
            config: Arc::clone(&self.config),
            ws_manager: Arc::clone(&self.ws_manager),
            pools: self.pools.values().cloned().collect(),
        }
    }

    /// Starts the background maintenance tasks (pool health and scaling)
    /// and, when enabled, the Redis adapter.
    pub fn start_background_tasks(&self) {
        for pool in self.pools.values() {
            pool.start_maintenance(self.cancel_token.clone());
        }
        if self.config.transports.redis.enabled {
            crate::api::redis::spawn(
                self.config.transports.redis.clone(),
                Arc::clone(&self.effects),
                Arc::clone(&self.bridge),
                self.cancel_token.clone(),
            );
        }
    }

    /// Graceful shutdown: destroy sessions, close connections, drain pools.
    pub async fn shutdown(&self) {
        log::info!("[Bootstrap] beginning graceful shutdown");
        let closed = self.ws_manager.close_all();
        if closed > 0 {
            log::info!("[Bootstrap] closed {closed} connection(s)");
        }
        self.effects.shutdown().await;
        self.cancel_token.cancel();
        log::info!("[Bootstrap] shutdown complete");
    }
}

/// Wires all hub services together.
///
/// `factories` supplies one backend factory per enabled provider pool. The
/// configuration must already be validated; a pool enabled in configuration
/// with no factory is a mandatory-provider failure (exit code 4 territory).
pub fn bootstrap_hub(
    config: HubConfig,
    factories: HashMap<String, BackendFactory>,
    services: ServiceSet,
) -> HubResult<HubServices> {
    config
        .validate()
        .map_err(HubError::Configuration)?;
    let config = Arc::new(config);

    let clock = HubClock::arc();
    let store = StateStore::new(Arc::clone(&clock));
    let timers = TimerService::new();
    let registry = FcmRegistry::new();
    store.set_validator(Arc::clone(&registry) as Arc<dyn TransitionValidator>);

    let bridge = Arc::new(EventBridge::new(config.transports.event_channel_capacity));
    let ws_manager = Arc::new(WsConnectionManager::new());
    let cancel_token = CancellationToken::new();

    let recorder = Arc::new(RecorderService::new(
        config.services.recording_dir.clone(),
        config.services.recording_rotate_bytes,
    ));

    let mut pools = HashMap::new();
    for (name, pool_config) in config.providers.iter().filter(|(_, p)| p.enabled) {
        let factory = factories.get(name).cloned().ok_or_else(|| {
            HubError::ProviderFailure(format!("no backend factory for mandatory provider {name}"))
        })?;
        let pool = ProviderPool::new(name.clone(), pool_config.clone(), move || factory());
        pools.insert(name.clone(), pool);
    }

    // The effects layer brokers leases from one primary pool.
    let default_pool = pools
        .get("default")
        .or_else(|| pools.values().next())
        .cloned()
        .ok_or_else(|| {
            HubError::ProviderFailure("no enabled provider pool configured".to_string())
        })?;

    let effects = SessionEffects::new(
        Arc::clone(&clock),
        Arc::clone(&config),
        Arc::clone(&store),
        Arc::clone(&timers),
        Arc::clone(&registry),
        default_pool,
        Arc::clone(&bridge),
        recorder,
        services,
        cancel_token.clone(),
    );

    Ok(HubServices {
        config,
        clock,
        store,
        timers,
        registry,
        pools,
        effects,
        bridge,
        ws_manager,
        cancel_token,
    })
}

//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides
//! (`APP_ENV`, `DEBUG`, `LOG_LEVEL`, `API_HOST`, `API_PORT`, `WS_HOST`,
//! `WS_PORT`, `GRPC_HOST`, `GRPC_PORT`, `SOCKETIO_HOST`, `SOCKETIO_PORT`,
//! `REDIS_HOST`, `REDIS_PORT`, `REDIS_DB`, `REDIS_PASSWORD`).

use std::path::Path;

use anyhow::{Context, Result};
use asrhub_core::config::HubConfig;
use serde::Deserialize;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Deployment environment label (logged, not interpreted).
    pub app_env: String,

    /// Force debug-level logging regardless of `LOG_LEVEL`.
    pub debug: bool,

    /// Host the HTTP/WS/Socket.IO server binds to.
    /// Override: `API_HOST`
    pub api_host: String,

    /// Port the HTTP/WS/Socket.IO server binds to.
    /// Override: `API_PORT`
    pub api_port: u16,

    /// Recognized for deployment parity; WebSocket is served on the API
    /// bind point at `/ws`.
    pub ws_host: Option<String>,
    pub ws_port: Option<u16>,

    /// Recognized for deployment parity; no gRPC transport is mounted.
    pub grpc_host: Option<String>,
    pub grpc_port: Option<u16>,

    /// Recognized for deployment parity; Socket.IO shares the API bind
    /// point.
    pub socketio_host: Option<String>,
    pub socketio_port: Option<u16>,
    pub socketio_enabled: bool,

    /// Redis transport.
    pub redis_enabled: bool,
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_db: i64,
    pub redis_password: Option<String>,
    pub redis_channel_prefix: String,

    /// Core hub configuration (providers, fcm, buffers, queue, services).
    pub hub: HubConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            app_env: "production".to_string(),
            debug: false,
            api_host: "0.0.0.0".to_string(),
            api_port: 8080,
            ws_host: None,
            ws_port: None,
            grpc_host: None,
            grpc_port: None,
            socketio_host: None,
            socketio_port: None,
            socketio_enabled: true,
            redis_enabled: false,
            redis_host: "127.0.0.1".to_string(),
            redis_port: 6379,
            redis_db: 0,
            redis_password: None,
            redis_channel_prefix: "asrhub:".to_string(),
            hub: HubConfig::with_defaults(),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn env_string(name: &str, target: &mut String) {
        if let Ok(value) = std::env::var(name) {
            *target = value;
        }
    }

    fn env_parse<T: std::str::FromStr>(name: &str, target: &mut T) {
        if let Ok(value) = std::env::var(name) {
            if let Ok(parsed) = value.parse() {
                *target = parsed;
            }
        }
    }

    fn env_parse_opt<T: std::str::FromStr>(name: &str, target: &mut Option<T>) {
        if let Ok(value) = std::env::var(name) {
            if let Ok(parsed) = value.parse() {
                *target = Some(parsed);
            }
        }
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        Self::env_string("APP_ENV", &mut self.app_env);
        Self::env_parse("DEBUG", &mut self.debug);
        Self::env_string("API_HOST", &mut self.api_host);
        Self::env_parse("API_PORT", &mut self.api_port);
        Self::env_parse_opt("WS_HOST", &mut self.ws_host);
        Self::env_parse_opt("WS_PORT", &mut self.ws_port);
        Self::env_parse_opt("GRPC_HOST", &mut self.grpc_host);
        Self::env_parse_opt("GRPC_PORT", &mut self.grpc_port);
        Self::env_parse_opt("SOCKETIO_HOST", &mut self.socketio_host);
        Self::env_parse_opt("SOCKETIO_PORT", &mut self.socketio_port);
        Self::env_string("REDIS_HOST", &mut self.redis_host);
        Self::env_parse("REDIS_PORT", &mut self.redis_port);
        Self::env_parse("REDIS_DB", &mut self.redis_db);
        Self::env_parse_opt("REDIS_PASSWORD", &mut self.redis_password);
        // Note: LOG_LEVEL is handled by clap via #[arg(env = ...)] in main.rs
    }

    /// Converts to the immutable core snapshot, folding the transport
    /// settings into `hub.transports`.
    pub fn to_hub_config(&self) -> HubConfig {
        let mut hub = self.hub.clone();
        hub.transports.api_host = self.api_host.clone();
        hub.transports.api_port = self.api_port;
        hub.transports.socketio_enabled = self.socketio_enabled;
        hub.transports.grpc_host = self.grpc_host.clone();
        hub.transports.grpc_port = self.grpc_port;
        hub.transports.redis.enabled = self.redis_enabled;
        hub.transports.redis.host = self.redis_host.clone();
        hub.transports.redis.port = self.redis_port;
        hub.transports.redis.db = self.redis_db;
        hub.transports.redis.password = self.redis_password.clone();
        hub.transports.redis.channel_prefix = self.redis_channel_prefix.clone();
        hub
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_produce_valid_hub_config() {
        let config = ServerConfig::default();
        assert!(config.to_hub_config().validate().is_ok());
    }

    #[test]
    fn transport_fields_fold_into_hub_snapshot() {
        let mut config = ServerConfig::default();
        config.api_port = 9999;
        config.redis_enabled = true;
        config.redis_host = "redis.internal".to_string();
        let hub = config.to_hub_config();
        assert_eq!(hub.transports.api_port, 9999);
        assert!(hub.transports.redis.enabled);
        assert_eq!(hub.transports.redis.host, "redis.internal");
    }
}

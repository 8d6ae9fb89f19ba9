//! Immutable configuration snapshot.
//!
//! The whole hub is configured through one [`HubConfig`] captured at startup.
//! Services receive it behind an `Arc` and never observe changes afterwards;
//! the only process-wide state besides it is the set of provider pools.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// How a buffer manager cuts windows out of the byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferMode {
    /// Emit non-overlapping frames of exactly `frame_size` samples.
    Fixed,
    /// Emit overlapping frames advancing by `step_size` samples.
    Sliding,
    /// Emit variable-length windows bounded by min/max duration.
    Dynamic,
}

/// What to do when a buffer would exceed `max_buffer_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowStrategy {
    /// Discard from the head until the new bytes fit; the reader is lagged.
    #[default]
    DropOldest,
    /// Discard the incoming bytes.
    DropNewest,
    /// Surface the overflow to the caller and keep the buffer unchanged.
    Block,
}

/// A named buffer recipe tuned to a downstream consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    pub mode: BufferMode,
    pub sample_rate: u32,
    /// Bytes per sample (2 for int16 PCM).
    pub sample_width: u16,
    pub channels: u16,
    /// Frame size in samples per channel (fixed/sliding modes).
    pub frame_size: usize,
    /// Advance per frame in samples (sliding mode). Defaults to `frame_size`.
    #[serde(default)]
    pub step_size: Option<usize>,
    /// Smallest window the dynamic mode will emit.
    #[serde(default)]
    pub min_duration_ms: Option<u64>,
    /// Window size that forces an emit in dynamic mode.
    #[serde(default)]
    pub max_duration_ms: Option<u64>,
    /// Accumulator cap in bytes.
    pub max_buffer_size: usize,
    #[serde(default)]
    pub overflow_strategy: OverflowStrategy,
}

impl BufferConfig {
    /// Bytes per sample across all channels.
    #[must_use]
    pub fn bytes_per_sample(&self) -> usize {
        self.sample_width as usize * self.channels as usize
    }

    /// Frame size in bytes.
    #[must_use]
    pub fn frame_bytes(&self) -> usize {
        self.frame_size * self.bytes_per_sample()
    }

    /// Step size in bytes (sliding mode).
    #[must_use]
    pub fn step_bytes(&self) -> usize {
        self.step_size.unwrap_or(self.frame_size) * self.bytes_per_sample()
    }

    /// Converts a duration in milliseconds to a byte count for this recipe.
    #[must_use]
    pub fn ms_to_bytes(&self, ms: u64) -> usize {
        (ms as usize * self.sample_rate as usize / 1000) * self.bytes_per_sample()
    }

    fn validate(&self, name: &str) -> Result<(), String> {
        if self.sample_rate == 0 || self.sample_width == 0 || self.channels == 0 {
            return Err(format!("buffer.{name}: zero sample_rate/width/channels"));
        }
        if self.max_buffer_size == 0 {
            return Err(format!("buffer.{name}: max_buffer_size must be >= 1"));
        }
        match self.mode {
            BufferMode::Fixed | BufferMode::Sliding => {
                if self.frame_size == 0 {
                    return Err(format!("buffer.{name}: frame_size must be >= 1"));
                }
                if self.mode == BufferMode::Sliding {
                    let step = self.step_size.unwrap_or(self.frame_size);
                    if step == 0 || step > self.frame_size {
                        return Err(format!(
                            "buffer.{name}: step_size must be in 1..=frame_size"
                        ));
                    }
                }
            }
            BufferMode::Dynamic => {
                let min = self.min_duration_ms.unwrap_or(0);
                let max = self.max_duration_ms.unwrap_or(0);
                if min == 0 || max == 0 || min > max {
                    return Err(format!(
                        "buffer.{name}: dynamic mode needs 0 < min_duration_ms <= max_duration_ms"
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Auto-scaling behavior for a provider pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoScaleConfig {
    pub enabled: bool,
    /// Utilization at or above which one instance is added.
    pub scale_up_threshold: f64,
    /// Utilization at or below which one idle instance is retired.
    pub scale_down_threshold: f64,
    /// Seconds between scaling decisions; at most one size change per tick.
    pub scale_interval_secs: u64,
}

impl Default for AutoScaleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            scale_interval_secs: 10,
        }
    }
}

/// Configuration for one ASR provider pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub enabled: bool,
    pub min_size: usize,
    pub max_size: usize,
    /// Idle instances past this age are retired while above `min_size`.
    pub idle_timeout_secs: u64,
    /// How long `lease` blocks before failing with an acquire timeout.
    pub acquire_timeout_secs: u64,
    /// Interval between synthetic health probes of idle instances.
    pub health_check_interval_secs: u64,
    /// Maximum simultaneous leases per session.
    pub per_session_quota: usize,
    /// Consecutive transcription failures before an instance is replaced.
    pub unhealthy_after_failures: u32,
    #[serde(default)]
    pub auto_scale: AutoScaleConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_size: 1,
            max_size: 2,
            idle_timeout_secs: 300,
            acquire_timeout_secs: 10,
            health_check_interval_secs: 60,
            per_session_quota: 1,
            unhealthy_after_failures: 3,
            auto_scale: AutoScaleConfig::default(),
        }
    }
}

impl PoolConfig {
    fn validate(&self, name: &str) -> Result<(), String> {
        if self.min_size == 0 {
            return Err(format!("providers.{name}.pool: min_size must be >= 1"));
        }
        if self.max_size < self.min_size {
            return Err(format!("providers.{name}.pool: max_size < min_size"));
        }
        if self.per_session_quota == 0 {
            return Err(format!(
                "providers.{name}.pool: per_session_quota must be >= 1"
            ));
        }
        if self.auto_scale.enabled {
            let a = &self.auto_scale;
            if !(0.0..=1.0).contains(&a.scale_up_threshold)
                || !(0.0..=1.0).contains(&a.scale_down_threshold)
                || a.scale_down_threshold >= a.scale_up_threshold
            {
                return Err(format!(
                    "providers.{name}.pool.auto_scale: thresholds must satisfy 0 <= down < up <= 1"
                ));
            }
            if a.scale_interval_secs == 0 {
                return Err(format!(
                    "providers.{name}.pool.auto_scale: scale_interval must be >= 1s"
                ));
            }
        }
        Ok(())
    }
}

/// Where the FCM returns after a capture phase ends without a reply claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReturnTarget {
    #[default]
    Activated,
    Listening,
}

/// State machine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FcmConfig {
    /// How long ACTIVATED waits for capture before falling back to LISTENING.
    pub awake_timeout_ms: u64,
    /// How long after a transcript an LLM may claim the turn.
    pub llm_claim_ttl_ms: u64,
    /// How long after an LLM reply a TTS may claim playback.
    pub tts_claim_ttl_ms: u64,
    /// Whether a finished reply returns to ACTIVATED instead of LISTENING.
    pub keep_awake_after_reply: bool,
    pub return_after_capture: ReturnTarget,
    pub allow_barge_in: bool,
    /// Hard cap on a single recording; -1 disables the cap.
    pub max_recording_ms: i64,
    /// Hard cap on a single streaming capture; -1 disables the cap.
    pub max_streaming_ms: i64,
    /// Idle sessions are reset after this long without inbound events.
    pub session_idle_timeout_ms: u64,
    /// Whether entering ACTIVATED schedules capture automatically.
    pub auto_capture_on_wake: bool,
}

impl Default for FcmConfig {
    fn default() -> Self {
        Self {
            awake_timeout_ms: 8_000,
            llm_claim_ttl_ms: 3_000,
            tts_claim_ttl_ms: 3_000,
            keep_awake_after_reply: true,
            return_after_capture: ReturnTarget::Activated,
            allow_barge_in: true,
            max_recording_ms: 60_000,
            max_streaming_ms: 60_000,
            session_idle_timeout_ms: 300_000,
            auto_capture_on_wake: true,
        }
    }
}

impl FcmConfig {
    fn validate(&self) -> Result<(), String> {
        if self.max_recording_ms < -1 || self.max_streaming_ms < -1 {
            return Err("fcm: maxRecordingMs/maxStreamingMs must be >= -1".to_string());
        }
        if self.session_idle_timeout_ms == 0 {
            return Err("fcm: sessionIdleTimeoutMs must be >= 1".to_string());
        }
        Ok(())
    }
}

/// Per-session audio queue retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum seconds of audio kept per session.
    pub max_retention_secs: f64,
    /// Maximum bytes kept per session.
    pub max_bytes: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retention_secs: 60.0,
            // ~60s of 16kHz mono int16
            max_bytes: 2 * 16_000 * 60,
        }
    }
}

/// Gates and tuning for the optional pipeline services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    pub vad_enabled: bool,
    pub wakeword_enabled: bool,
    pub denoise_enabled: bool,
    pub enhance_enabled: bool,
    pub recording_enabled: bool,
    /// Sustained silence that ends a capture (seconds).
    pub silence_threshold_secs: f64,
    /// Audio retrieved from before the wake timestamp (seconds).
    pub pre_roll_secs: f64,
    /// Audio retrieved past the detected end of speech (seconds).
    pub tail_padding_secs: f64,
    /// Directory recordings are written to.
    pub recording_dir: String,
    /// Rotate recording files past this many bytes; 0 disables rotation.
    pub recording_rotate_bytes: u64,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            vad_enabled: true,
            wakeword_enabled: true,
            denoise_enabled: false,
            enhance_enabled: false,
            recording_enabled: false,
            silence_threshold_secs: 2.0,
            pre_roll_secs: 0.5,
            tail_padding_secs: 0.3,
            recording_dir: "recordings".to_string(),
            recording_rotate_bytes: 0,
        }
    }
}

/// Envelope encoding for the Redis transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RedisCodec {
    #[default]
    Json,
    Msgpack,
}

/// Redis pub/sub transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub db: i64,
    #[serde(default)]
    pub password: Option<String>,
    pub channel_prefix: String,
    #[serde(default)]
    pub codec: RedisCodec,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 6379,
            db: 0,
            password: None,
            channel_prefix: "asrhub:".to_string(),
            codec: RedisCodec::Json,
        }
    }
}

impl RedisConfig {
    /// Builds the `redis://` connection URL.
    #[must_use]
    pub fn url(&self) -> String {
        match &self.password {
            Some(pw) => format!("redis://:{}@{}:{}/{}", pw, self.host, self.port, self.db),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// Transport bind points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    pub api_host: String,
    pub api_port: u16,
    /// Capacity of the outbound event broadcast channel.
    pub event_channel_capacity: usize,
    /// SSE heartbeat interval (seconds).
    pub heartbeat_interval_secs: u64,
    /// WebSocket inbound inactivity timeout (seconds).
    pub ws_heartbeat_timeout_secs: u64,
    pub socketio_enabled: bool,
    #[serde(default)]
    pub redis: RedisConfig,
    /// Recognized for deployment parity; no gRPC transport is mounted.
    #[serde(default)]
    pub grpc_host: Option<String>,
    #[serde(default)]
    pub grpc_port: Option<u16>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            api_host: "0.0.0.0".to_string(),
            api_port: 8080,
            event_channel_capacity: 256,
            heartbeat_interval_secs: 30,
            ws_heartbeat_timeout_secs: 30,
            socketio_enabled: true,
            redis: RedisConfig::default(),
            grpc_host: None,
            grpc_port: None,
        }
    }
}

/// The immutable configuration snapshot for the whole hub.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HubConfig {
    /// Provider pools keyed by backend name; one pool per enabled backend.
    pub providers: HashMap<String, PoolConfig>,
    pub fcm: FcmConfig,
    /// Buffer recipes keyed by consumer name.
    pub buffers: HashMap<String, BufferConfig>,
    pub queue: QueueConfig,
    pub services: ServicesConfig,
    pub transports: TransportConfig,
}

impl HubConfig {
    /// A snapshot with the built-in recipes and a single default pool.
    ///
    /// Recipes follow the downstream consumers: Silero-style VAD wants fixed
    /// 400 ms frames, wake-word models 512-sample frames, Whisper-style batch
    /// ASR a 5 s sliding window with 50% overlap, and streaming ASR a dynamic
    /// 0.2-3 s window.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut buffers = HashMap::new();
        buffers.insert("vad".to_string(), recipes::vad());
        buffers.insert("wake_word".to_string(), recipes::wake_word());
        buffers.insert("whisper".to_string(), recipes::whisper());
        buffers.insert("streaming_asr".to_string(), recipes::streaming_asr());

        let mut providers = HashMap::new();
        providers.insert("default".to_string(), PoolConfig::default());

        Self {
            providers,
            buffers,
            ..Self::default()
        }
    }

    /// Returns a buffer recipe, falling back to the built-in of that name.
    #[must_use]
    pub fn buffer_recipe(&self, name: &str) -> Option<BufferConfig> {
        if let Some(recipe) = self.buffers.get(name) {
            return Some(recipe.clone());
        }
        match name {
            "vad" => Some(recipes::vad()),
            "wake_word" => Some(recipes::wake_word()),
            "whisper" => Some(recipes::whisper()),
            "streaming_asr" => Some(recipes::streaming_asr()),
            _ => None,
        }
    }

    /// Validates snapshot coherence. Called once at boot; failure is fatal
    /// (configuration exit code).
    pub fn validate(&self) -> Result<(), String> {
        self.fcm.validate()?;
        for (name, pool) in &self.providers {
            pool.validate(name)?;
        }
        for (name, recipe) in &self.buffers {
            recipe.validate(name)?;
        }
        if self.queue.max_bytes == 0 || self.queue.max_retention_secs <= 0.0 {
            return Err("queue: retention limits must be positive".to_string());
        }
        if self.transports.event_channel_capacity == 0 {
            return Err(
                "transports: event_channel_capacity must be >= 1 (broadcast::channel panics on 0)"
                    .to_string(),
            );
        }
        if self.providers.values().filter(|p| p.enabled).count() == 0 {
            return Err("providers: at least one enabled pool is required".to_string());
        }
        Ok(())
    }
}

/// Built-in buffer recipes.
pub mod recipes {
    use super::{BufferConfig, BufferMode, OverflowStrategy};

    /// Fixed 400 ms frames at 16 kHz mono int16 (6400 samples).
    #[must_use]
    pub fn vad() -> BufferConfig {
        BufferConfig {
            mode: BufferMode::Fixed,
            sample_rate: 16_000,
            sample_width: 2,
            channels: 1,
            frame_size: 6_400,
            step_size: None,
            min_duration_ms: None,
            max_duration_ms: None,
            max_buffer_size: 256 * 1024,
            overflow_strategy: OverflowStrategy::DropOldest,
        }
    }

    /// Fixed 512-sample frames (32 ms at 16 kHz).
    #[must_use]
    pub fn wake_word() -> BufferConfig {
        BufferConfig {
            mode: BufferMode::Fixed,
            sample_rate: 16_000,
            sample_width: 2,
            channels: 1,
            frame_size: 512,
            step_size: None,
            min_duration_ms: None,
            max_duration_ms: None,
            max_buffer_size: 256 * 1024,
            overflow_strategy: OverflowStrategy::DropOldest,
        }
    }

    /// Sliding 5 s window with 50% overlap (80k samples, 40k step).
    #[must_use]
    pub fn whisper() -> BufferConfig {
        BufferConfig {
            mode: BufferMode::Sliding,
            sample_rate: 16_000,
            sample_width: 2,
            channels: 1,
            frame_size: 80_000,
            step_size: Some(40_000),
            min_duration_ms: None,
            max_duration_ms: None,
            max_buffer_size: 2 * 1024 * 1024,
            overflow_strategy: OverflowStrategy::DropOldest,
        }
    }

    /// Dynamic 0.2-3 s window for incremental streaming ASR.
    #[must_use]
    pub fn streaming_asr() -> BufferConfig {
        BufferConfig {
            mode: BufferMode::Dynamic,
            sample_rate: 16_000,
            sample_width: 2,
            channels: 1,
            frame_size: 0,
            step_size: None,
            min_duration_ms: Some(200),
            max_duration_ms: Some(3_000),
            max_buffer_size: 2 * 1024 * 1024,
            overflow_strategy: OverflowStrategy::DropOldest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_snapshot_is_valid() {
        assert!(HubConfig::with_defaults().validate().is_ok());
    }

    #[test]
    fn rejects_inverted_pool_sizes() {
        let mut config = HubConfig::with_defaults();
        config.providers.get_mut("default").unwrap().min_size = 5;
        config.providers.get_mut("default").unwrap().max_size = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_dynamic_recipe_without_bounds() {
        let mut config = HubConfig::with_defaults();
        let recipe = config.buffers.get_mut("streaming_asr").unwrap();
        recipe.min_duration_ms = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_no_enabled_providers() {
        let mut config = HubConfig::with_defaults();
        config.providers.get_mut("default").unwrap().enabled = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn recipe_byte_math() {
        let whisper = recipes::whisper();
        assert_eq!(whisper.frame_bytes(), 160_000);
        assert_eq!(whisper.step_bytes(), 80_000);
        let streaming = recipes::streaming_asr();
        assert_eq!(streaming.ms_to_bytes(200), 6_400);
        assert_eq!(streaming.ms_to_bytes(3_000), 96_000);
    }

    #[test]
    fn redis_url_includes_password() {
        let mut redis = RedisConfig::default();
        assert_eq!(redis.url(), "redis://127.0.0.1:6379/0");
        redis.password = Some("secret".to_string());
        assert_eq!(redis.url(), "redis://:secret@127.0.0.1:6379/0");
    }
}

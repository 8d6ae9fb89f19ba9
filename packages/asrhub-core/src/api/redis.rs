//! Redis pub/sub adapter.
//!
//! Inbound envelopes arrive on `<prefix>session:<id>:in`; outbound events
//! are published to `<prefix>session:<id>:out`. Envelopes are encoded as
//! JSON or MessagePack per configuration. The adapter runs as a pair of
//! background tasks and is fully optional.

use std::sync::Arc;

use futures::StreamExt;
use redis::AsyncCommands;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::{RedisCodec, RedisConfig};
use crate::effects::SessionEffects;
use crate::events::{EventBridge, OutboundEvent};
use crate::store::Action;

fn encode(codec: RedisCodec, value: &Value) -> Option<Vec<u8>> {
    match codec {
        RedisCodec::Json => serde_json::to_vec(value).ok(),
        RedisCodec::Msgpack => rmp_serde::to_vec_named(value).ok(),
    }
}

fn decode(codec: RedisCodec, payload: &[u8]) -> Option<Value> {
    match codec {
        RedisCodec::Json => serde_json::from_slice(payload).ok(),
        RedisCodec::Msgpack => rmp_serde::from_slice(payload).ok(),
    }
}

/// Extracts the session id out of `<prefix>session:<id>:in`.
fn session_from_channel<'a>(channel: &'a str, prefix: &str) -> Option<&'a str> {
    channel
        .strip_prefix(prefix)?
        .strip_prefix("session:")?
        .strip_suffix(":in")
}

/// Spawns the inbound subscriber and the outbound publisher.
///
/// Connection failures are logged and retried with a fixed backoff; the
/// tasks exit on cancellation.
pub fn spawn(
    config: RedisConfig,
    effects: Arc<SessionEffects>,
    bridge: Arc<EventBridge>,
    cancel: CancellationToken,
) {
    let url = config.url();
    let inbound_config = config.clone();
    let inbound_cancel = cancel.clone();
    let inbound_url = url.clone();
    tokio::spawn(async move {
        loop {
            if inbound_cancel.is_cancelled() {
                break;
            }
            if let Err(err) =
                run_inbound(&inbound_url, &inbound_config, &effects, &inbound_cancel).await
            {
                log::warn!("[Redis] inbound task error: {err}, retrying in 5s");
            }
            tokio::select! {
                _ = inbound_cancel.cancelled() => break,
                _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => {}
            }
        }
        log::debug!("[Redis] inbound task stopped");
    });

    tokio::spawn(async move {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            if let Err(err) = run_outbound(&url, &config, &bridge, &cancel).await {
                log::warn!("[Redis] outbound task error: {err}, retrying in 5s");
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => {}
            }
        }
        log::debug!("[Redis] outbound task stopped");
    });
}

async fn run_inbound(
    url: &str,
    config: &RedisConfig,
    effects: &Arc<SessionEffects>,
    cancel: &CancellationToken,
) -> redis::RedisResult<()> {
    let client = redis::Client::open(url)?;
    let mut pubsub = client.get_async_pubsub().await?;
    let pattern = format!("{}session:*:in", config.channel_prefix);
    pubsub.psubscribe(&pattern).await?;
    log::info!("[Redis] subscribed to {pattern}");

    let mut stream = pubsub.on_message();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            message = stream.next() => {
                let Some(message) = message else { return Ok(()) };
                let channel = message.get_channel_name().to_string();
                let Some(session_id) =
                    session_from_channel(&channel, &config.channel_prefix)
                else {
                    continue;
                };
                let payload: Vec<u8> = message.get_payload()?;
                let Some(envelope) = decode(config.codec, &payload) else {
                    log::warn!("[Redis] undecodable envelope on {channel}");
                    continue;
                };
                let Some(action) = Action::from_envelope(&envelope) else {
                    log::debug!(
                        "[Redis] unknown action type {:?} on {channel}, ignored",
                        envelope["type"].as_str()
                    );
                    continue;
                };
                if matches!(action, Action::SessionCreate { .. }) {
                    // Session creation needs a reply channel that does not
                    // exist yet; create over HTTP/WS/Socket.IO instead.
                    log::warn!("[Redis] session/create over redis is not supported");
                    continue;
                }
                if action.session_id() != Some(session_id) {
                    log::warn!(
                        "[Redis] envelope session mismatch on {channel}, dropped"
                    );
                    continue;
                }
                if let Err(err) = effects.submit(action) {
                    log::debug!("[Redis] submit failed: {err}");
                }
            }
        }
    }
}

async fn run_outbound(
    url: &str,
    config: &RedisConfig,
    bridge: &Arc<EventBridge>,
    cancel: &CancellationToken,
) -> redis::RedisResult<()> {
    let client = redis::Client::open(url)?;
    let mut conn = client.get_multiplexed_async_connection().await?;
    let mut rx = bridge.subscribe();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            event = rx.recv() => {
                let event: OutboundEvent = match event {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("[Redis] dropped {skipped} events");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
                };
                let Some(session_id) = event.session_id() else {
                    continue;
                };
                let channel = format!("{}session:{}:out", config.channel_prefix, session_id);
                let Ok(value) = serde_json::to_value(&event) else {
                    continue;
                };
                let Some(payload) = encode(config.codec, &value) else {
                    continue;
                };
                let _: () = conn.publish(channel, payload).await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_parsing() {
        assert_eq!(
            session_from_channel("asrhub:session:s-42:in", "asrhub:"),
            Some("s-42")
        );
        assert_eq!(session_from_channel("asrhub:session:s-42:out", "asrhub:"), None);
        assert_eq!(session_from_channel("other:session:s-42:in", "asrhub:"), None);
    }

    #[test]
    fn json_and_msgpack_round_trip() {
        let value = serde_json::json!({
            "type": "start_listening",
            "payload": {"session_id": "s-1", "sample_rate": 16000}
        });
        for codec in [RedisCodec::Json, RedisCodec::Msgpack] {
            let encoded = encode(codec, &value).unwrap();
            let decoded = decode(codec, &encoded).unwrap();
            assert_eq!(decoded, value);
        }
    }
}

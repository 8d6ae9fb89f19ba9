//! HTTP endpoints and the SSE event channel.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, IntervalStream};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::AppState;
use crate::error::HubError;
use crate::events::{iso_timestamp, OutboundEvent};
use crate::fcm::Strategy;
use crate::store::Action;

/// Delimiter between the metadata JSON and the raw PCM in audio uploads.
const AUDIO_DELIMITER: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// Builds the full router: REST endpoints, SSE, WebSocket and Socket.IO.
pub fn create_router(state: AppState) -> Router {
    let socketio = state
        .config
        .transports
        .socketio_enabled
        .then(|| super::socketio::layer(state.clone()));

    let api = Router::new()
        .route("/create_session", post(create_session))
        .route("/start_listening", post(start_listening))
        .route("/emit_audio_chunk", post(emit_audio_chunk))
        .route("/sessions", get(list_sessions))
        .route("/sessions/{session_id}", get(get_session))
        .route("/sessions/{session_id}/events", get(session_events));

    let mut router = Router::new()
        .nest("/api/v1", api)
        .route("/health", get(health))
        .route("/ws", get(super::ws::ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    if let Some(layer) = socketio {
        router = router.layer(layer);
    }

    router.with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// Session lifecycle
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateSessionRequest {
    strategy: Strategy,
    #[serde(default)]
    request_id: Option<String>,
}

#[derive(Serialize)]
struct CreateSessionResponse {
    session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
    sse_url: String,
    audio_url: String,
}

async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>, HubError> {
    let session_id = state
        .effects
        .create_session(body.strategy, body.request_id.clone())?;
    Ok(Json(CreateSessionResponse {
        sse_url: format!("/api/v1/sessions/{session_id}/events"),
        audio_url: "/api/v1/emit_audio_chunk".to_string(),
        session_id,
        request_id: body.request_id,
    }))
}

#[derive(Deserialize)]
struct StartListeningRequest {
    session_id: String,
    #[serde(default)]
    sample_rate: Option<u32>,
    #[serde(default)]
    channels: Option<u16>,
    #[serde(default)]
    format: Option<String>,
}

async fn start_listening(
    State(state): State<AppState>,
    Json(body): Json<StartListeningRequest>,
) -> Result<Json<serde_json::Value>, HubError> {
    state.effects.submit(Action::StartListening {
        session_id: body.session_id.clone(),
        sample_rate: body.sample_rate,
        channels: body.channels,
        format: body.format,
    })?;
    Ok(Json(json!({
        "session_id": body.session_id,
        "status": "accepted",
        "timestamp": iso_timestamp(),
    })))
}

// ─────────────────────────────────────────────────────────────────────────────
// Audio ingestion
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct AudioChunkMetadata {
    session_id: String,
    #[serde(default)]
    chunk_id: Option<String>,
}

/// Splits `<metadata-json> || 00 00 FF FF || <raw-pcm>`.
fn split_audio_body(body: &[u8]) -> Option<(AudioChunkMetadata, Bytes)> {
    let at = body
        .windows(AUDIO_DELIMITER.len())
        .position(|window| window == AUDIO_DELIMITER)?;
    let metadata: AudioChunkMetadata = serde_json::from_slice(&body[..at]).ok()?;
    let audio = Bytes::copy_from_slice(&body[at + AUDIO_DELIMITER.len()..]);
    Some((metadata, audio))
}

async fn emit_audio_chunk(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, HubError> {
    let Some((metadata, audio)) = split_audio_body(&body) else {
        return Err(HubError::Transport(
            "malformed audio frame: missing delimiter or bad metadata".to_string(),
        ));
    };
    if audio.is_empty() {
        return Err(HubError::Validation("empty audio payload".to_string()));
    }
    let session_id = metadata.session_id.clone();
    state.effects.submit(Action::AudioChunk {
        session_id: session_id.clone(),
        chunk_id: metadata.chunk_id,
        timestamp: None,
        audio,
    })?;
    Ok(Json(json!({
        "session_id": session_id,
        "status": "accepted",
    })))
}

// ─────────────────────────────────────────────────────────────────────────────
// Introspection
// ─────────────────────────────────────────────────────────────────────────────

async fn list_sessions(State(state): State<AppState>) -> Json<serde_json::Value> {
    let sessions = state
        .store
        .select(|s| s.sessions.values().cloned().collect::<Vec<_>>());
    Json(json!({ "sessions": sessions }))
}

async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, HubError> {
    state
        .store
        .select(|s| s.sessions.get(&session_id).cloned())
        .map(|session| Json(json!({ "session": session })))
        .ok_or(HubError::UnknownSession(session_id))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let stats = state.store.select(|s| s.stats.clone());
    let pools: Vec<_> = state.pools.iter().map(|pool| pool.snapshot()).collect();
    Json(json!({
        "service": "asr-hub",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.effects.session_count(),
        "connections": state.ws_manager.connection_count(),
        "stats": stats,
        "pools": pools,
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// SSE
// ─────────────────────────────────────────────────────────────────────────────

fn sse_event(event: &OutboundEvent) -> Event {
    let value = serde_json::to_value(event).unwrap_or_default();
    let name = value["type"].as_str().unwrap_or("event").to_string();
    Event::default()
        .event(name)
        .data(value["payload"].to_string())
}

/// Per-session SSE channel: `connection_ready` first, then the session's
/// events interleaved with periodic heartbeats. The stream ends after
/// `session_destroyed`.
async fn session_events(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, HubError> {
    let known = state
        .store
        .select(|s| s.sessions.contains_key(&session_id));
    if !known {
        return Err(HubError::UnknownSession(session_id));
    }

    let rx = state.bridge.subscribe();
    let heartbeat = Duration::from_secs(state.config.transports.heartbeat_interval_secs);

    let session = session_id.clone();
    let session_events = BroadcastStream::new(rx).filter_map(move |received| {
        let event = match received {
            Ok(event) if event.session_id() == Some(session.as_str()) => Some(event),
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                log::warn!("[SSE:{}] dropped {} events", session, skipped);
                None
            }
        };
        futures::future::ready(event)
    });

    let ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + heartbeat,
        heartbeat,
    );
    let heartbeats = IntervalStream::new(ticker).map(|_| OutboundEvent::Heartbeat {
        timestamp: iso_timestamp(),
    });

    let ready = futures::stream::once(futures::future::ready(OutboundEvent::ConnectionReady {
        timestamp: iso_timestamp(),
    }));

    // End the stream right after the session's destruction event.
    let merged = ready
        .chain(futures::stream::select(session_events, heartbeats))
        .scan(false, |done, event| {
            if *done {
                return futures::future::ready(None);
            }
            if matches!(event, OutboundEvent::SessionDestroyed { .. }) {
                *done = true;
            }
            futures::future::ready(Some(event))
        })
        .map(|event| Ok(sse_event(&event)));

    Ok(Sse::new(merged))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_audio_body_parses_metadata_and_pcm() {
        let mut body = Vec::new();
        body.extend_from_slice(br#"{"session_id":"s-1","chunk_id":"c-7"}"#);
        body.extend_from_slice(&AUDIO_DELIMITER);
        body.extend_from_slice(&[1, 2, 3, 4]);

        let (metadata, audio) = split_audio_body(&body).unwrap();
        assert_eq!(metadata.session_id, "s-1");
        assert_eq!(metadata.chunk_id.as_deref(), Some("c-7"));
        assert_eq!(&audio[..], &[1, 2, 3, 4]);
    }

    #[test]
    fn split_audio_body_rejects_missing_delimiter() {
        assert!(split_audio_body(br#"{"session_id":"s-1"}"#).is_none());
    }

    #[test]
    fn split_audio_body_rejects_bad_metadata() {
        let mut body = Vec::new();
        body.extend_from_slice(b"not-json");
        body.extend_from_slice(&AUDIO_DELIMITER);
        body.extend_from_slice(&[1, 2]);
        assert!(split_audio_body(&body).is_none());
    }

    #[test]
    fn audio_payload_may_contain_delimiter_bytes() {
        // Only the first delimiter splits; PCM bytes after it are opaque.
        let mut body = Vec::new();
        body.extend_from_slice(br#"{"session_id":"s-1"}"#);
        body.extend_from_slice(&AUDIO_DELIMITER);
        body.extend_from_slice(&AUDIO_DELIMITER);
        let (_, audio) = split_audio_body(&body).unwrap();
        assert_eq!(&audio[..], &AUDIO_DELIMITER);
    }

    #[test]
    fn sse_event_maps_type_and_payload() {
        let event = OutboundEvent::Heartbeat {
            timestamp: iso_timestamp(),
        };
        let sse = sse_event(&event);
        // Event is opaque; round-trip through Debug to confirm the name.
        let debug = format!("{sse:?}");
        assert!(debug.contains("heartbeat"));
    }
}

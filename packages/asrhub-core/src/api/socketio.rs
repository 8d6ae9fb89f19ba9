//! Socket.IO adapter.
//!
//! Mounted as a tower layer on the main router. Clients send canonical
//! `{type, payload}` envelopes on the `action` event and PCM as base64 on
//! the `audio` event; outbound events arrive named by their `type` with the
//! payload as the argument.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use parking_lot::RwLock;
use serde_json::{json, Value};
use socketioxide::extract::{Data, SocketRef};
use socketioxide::layer::SocketIoLayer;
use socketioxide::SocketIo;

use super::AppState;
use crate::error::HubError;
use crate::events::iso_timestamp;
use crate::store::Action;

type BoundSession = Arc<RwLock<Option<String>>>;

/// Builds the Socket.IO layer and registers the root namespace.
pub fn layer(state: AppState) -> SocketIoLayer {
    let (layer, io) = SocketIo::new_layer();
    let _ = io.ns("/", move |socket: SocketRef| {
        let state = state.clone();
        async move {
            on_connect(socket, state);
        }
    });
    layer
}

fn emit_error(socket: &SocketRef, err: &HubError) {
    let _ = socket.emit(
        "error",
        &json!({
            "error_code": err.code(),
            "error_message": err.to_string(),
            "timestamp": iso_timestamp(),
        }),
    );
}

fn on_connect(socket: SocketRef, state: AppState) {
    log::info!("[SocketIO] connection established: {}", socket.id);
    let bound: BoundSession = Arc::default();

    let _ = socket.emit(
        "connection_ready",
        &json!({ "timestamp": iso_timestamp() }),
    );

    // Outbound: forward broadcast events for the bound session.
    let mut rx = state.bridge.subscribe();
    let forward_socket = socket.clone();
    let forward_bound = Arc::clone(&bound);
    let forwarder = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let deliver = match event.session_id() {
                        None => true,
                        Some(sid) => forward_bound.read().as_deref() == Some(sid),
                    };
                    if !deliver {
                        continue;
                    }
                    let Ok(value) = serde_json::to_value(&event) else {
                        continue;
                    };
                    let name = value["type"].as_str().unwrap_or("event").to_string();
                    if forward_socket.emit(name.as_str(), &value["payload"]).is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("[SocketIO] dropped {} events", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
    let forwarder_abort = forwarder.abort_handle();

    // Inbound: canonical action envelopes.
    let action_state = state.clone();
    let action_bound = Arc::clone(&bound);
    socket.on(
        "action",
        move |socket: SocketRef, Data::<Value>(envelope)| {
            let state = action_state.clone();
            let bound = Arc::clone(&action_bound);
            async move {
                handle_action(&socket, &state, &bound, &envelope);
            }
        },
    );

    // Inbound: base64 PCM frames.
    let audio_state = state;
    let audio_bound = bound;
    socket.on(
        "audio",
        move |socket: SocketRef, Data::<Value>(payload)| {
            let state = audio_state.clone();
            let bound = Arc::clone(&audio_bound);
            async move {
                handle_audio(&socket, &state, &bound, &payload);
            }
        },
    );

    socket.on_disconnect(move |socket: SocketRef| {
        let abort = forwarder_abort.clone();
        async move {
            log::info!("[SocketIO] connection closed: {}", socket.id);
            abort.abort();
        }
    });
}

fn handle_action(socket: &SocketRef, state: &AppState, bound: &BoundSession, envelope: &Value) {
    let Some(action) = Action::from_envelope(envelope) else {
        log::debug!(
            "[SocketIO] unknown action type {:?}, ignored",
            envelope["type"].as_str()
        );
        return;
    };

    match action {
        Action::SessionCreate {
            strategy,
            request_id,
            ..
        } => match state.effects.create_session(strategy, request_id.clone()) {
            Ok(session_id) => {
                *bound.write() = Some(session_id.clone());
                let _ = socket.emit(
                    "session_created",
                    &json!({
                        "session_id": session_id,
                        "request_id": request_id,
                        "timestamp": iso_timestamp(),
                    }),
                );
            }
            Err(err) => emit_error(socket, &err),
        },
        action => {
            if bound.read().is_none() {
                if let Some(session_id) = action.session_id() {
                    *bound.write() = Some(session_id.to_string());
                }
            }
            if let Err(err) = state.effects.submit(action) {
                emit_error(socket, &err);
            }
        }
    }
}

fn handle_audio(socket: &SocketRef, state: &AppState, bound: &BoundSession, payload: &Value) {
    let session_id = payload["session_id"]
        .as_str()
        .map(str::to_string)
        .or_else(|| bound.read().clone());
    let Some(session_id) = session_id else {
        emit_error(
            socket,
            &HubError::Transport("audio before session binding".to_string()),
        );
        return;
    };
    let Some(encoded) = payload["audio"].as_str() else {
        emit_error(
            socket,
            &HubError::Transport("audio event missing base64 payload".to_string()),
        );
        return;
    };
    let audio = match BASE64.decode(encoded) {
        Ok(bytes) => Bytes::from(bytes),
        Err(err) => {
            emit_error(
                socket,
                &HubError::Transport(format!("invalid base64 audio: {err}")),
            );
            return;
        }
    };
    let action = Action::AudioChunk {
        session_id,
        chunk_id: payload["chunk_id"].as_str().map(str::to_string),
        timestamp: None,
        audio,
    };
    if let Err(err) = state.effects.submit(action) {
        emit_error(socket, &err);
    }
}

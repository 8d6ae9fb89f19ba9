//! WebSocket adapter.
//!
//! Carries canonical `{type, payload}` envelopes as text frames and raw PCM
//! as binary frames. A connection binds itself to a session via
//! `session/create` (the hub assigns the id) or the first action naming a
//! `session_id`; binary audio is attributed to the bound session.

use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use bytes::Bytes;
use futures::sink::SinkExt;
use futures::stream::{SplitSink, StreamExt};
use serde_json::{json, Value};

use super::ws_connection::ConnectionGuard;
use super::AppState;
use crate::error::HubError;
use crate::events::{iso_timestamp, OutboundEvent};
use crate::store::Action;

/// WebSocket upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn send_json(sender: &mut SplitSink<WebSocket, Message>, value: Value) -> bool {
    match serde_json::to_string(&value) {
        Ok(text) => sender.send(Message::Text(text.into())).await.is_ok(),
        Err(_) => true,
    }
}

async fn send_event(sender: &mut SplitSink<WebSocket, Message>, event: &OutboundEvent) -> bool {
    match serde_json::to_value(event) {
        Ok(value) => send_json(sender, value).await,
        Err(_) => true,
    }
}

async fn send_error(sender: &mut SplitSink<WebSocket, Message>, err: &HubError) -> bool {
    send_json(
        sender,
        json!({
            "type": "error",
            "payload": {
                "error_code": err.code(),
                "error_message": err.to_string(),
                "timestamp": iso_timestamp(),
            }
        }),
    )
    .await
}

/// Handles one inbound text envelope. Returns the session to bind, if the
/// action established one.
async fn handle_envelope(
    state: &AppState,
    guard: &ConnectionGuard,
    sender: &mut SplitSink<WebSocket, Message>,
    text: &str,
) -> Option<String> {
    let envelope: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            let err = HubError::Transport(format!("malformed envelope: {err}"));
            send_error(sender, &err).await;
            return None;
        }
    };
    let Some(action) = Action::from_envelope(&envelope) else {
        log::debug!(
            "[WS:{}] unknown action type {:?}, ignored",
            guard.id(),
            envelope["type"].as_str()
        );
        return None;
    };

    match action {
        Action::SessionCreate {
            strategy,
            request_id,
            ..
        } => match state.effects.create_session(strategy, request_id.clone()) {
            Ok(session_id) => {
                send_json(
                    sender,
                    json!({
                        "type": "session_created",
                        "payload": {
                            "session_id": session_id,
                            "request_id": request_id,
                            "timestamp": iso_timestamp(),
                        }
                    }),
                )
                .await;
                Some(session_id)
            }
            Err(err) => {
                send_error(sender, &err).await;
                None
            }
        },
        action => {
            let bind = action.session_id().map(str::to_string);
            if let Err(err) = state.effects.submit(action) {
                send_error(sender, &err).await;
                return None;
            }
            bind
        }
    }
}

/// Main WebSocket connection handler.
async fn handle_ws(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut broadcast_rx = state.bridge.subscribe();
    let mut last_activity = Instant::now();
    let heartbeat_timeout =
        Duration::from_secs(state.config.transports.ws_heartbeat_timeout_secs);

    let guard = state.ws_manager.register();
    let cancel_token = guard.cancel_token().clone();

    if !send_event(
        &mut sender,
        &OutboundEvent::ConnectionReady {
            timestamp: iso_timestamp(),
        },
    )
    .await
    {
        return;
    }

    let mut heartbeat_check = tokio::time::interval(Duration::from_secs(1));
    heartbeat_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                log::info!("[WS:{}] force-closed", guard.id());
                break;
            }
            inbound = receiver.next() => {
                last_activity = Instant::now();
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(session_id) =
                            handle_envelope(&state, &guard, &mut sender, &text).await
                        {
                            if guard.bound_session().is_none() {
                                guard.bind_session(&session_id);
                            }
                        }
                    }
                    Some(Ok(Message::Binary(audio))) => {
                        let Some(session_id) = guard.bound_session() else {
                            let err = HubError::Transport(
                                "binary audio before session binding".to_string(),
                            );
                            send_error(&mut sender, &err).await;
                            continue;
                        };
                        let action = Action::AudioChunk {
                            session_id,
                            chunk_id: None,
                            timestamp: None,
                            audio: Bytes::from(audio),
                        };
                        if let Err(err) = state.effects.submit(action) {
                            send_error(&mut sender, &err).await;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
            event = broadcast_rx.recv() => {
                match event {
                    Ok(event) => {
                        let bound = guard.bound_session();
                        let deliver = match event.session_id() {
                            // Channel-level events go to every connection.
                            None => true,
                            Some(sid) => bound.as_deref() == Some(sid),
                        };
                        if deliver && !send_event(&mut sender, &event).await {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("[WS:{}] dropped {} events", guard.id(), skipped);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = heartbeat_check.tick() => {
                if last_activity.elapsed() > heartbeat_timeout {
                    log::warn!("[WS:{}] heartbeat timeout", guard.id());
                    break;
                }
            }
        }
    }

    // Sessions survive disconnects for possible reuse; the idle timer is
    // what eventually reaps them.
    if let Some(session_id) = guard.bound_session() {
        let _ = state.effects.submit(Action::TransportDisconnected {
            session_id: Some(session_id),
        });
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::coordinator::{BookError, BookRequest, BookingCoordinator};
use crate::ledger::Ledger;
use crate::model::{ClientMessage, SlotKey};
use crate::notify::RoomHub;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<BookingCoordinator>,
    pub rooms: Arc<RoomHub>,
    pub ledger: Arc<Ledger>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/book", post(book))
        .route("/book/:id", patch(patch_booking))
        .route("/slots/:resource_id/:date/:time", get(slot_status))
        .route("/ledger/verify", get(ledger_verify))
        .route("/health", get(health))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

fn status_for(e: &BookError) -> StatusCode {
    match e {
        BookError::SlotUnavailable => StatusCode::CONFLICT,
        BookError::ValidationFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
        BookError::PersistenceFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
        BookError::UnknownBooking => StatusCode::NOT_FOUND,
        BookError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_body(e: &BookError) -> Json<serde_json::Value> {
    Json(json!({ "error": e.to_string() }))
}

async fn book(
    State(state): State<AppState>,
    Json(request): Json<BookRequest>,
) -> impl IntoResponse {
    match state.coordinator.book(&request).await {
        Ok(appointment) => (
            StatusCode::CREATED,
            Json(json!({
                "booking_id": appointment.id,
                "slot": appointment.slot,
                "confirmed_at": appointment.confirmed_at,
            })),
        )
            .into_response(),
        Err(e) => {
            debug!("booking rejected: {e}");
            (status_for(&e), error_body(&e)).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
enum BookingPatch {
    Cancel,
    Reschedule {
        resource_id: String,
        date: String,
        time: String,
    },
}

async fn patch_booking(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<BookingPatch>,
) -> impl IntoResponse {
    let Ok(booking_id) = id.parse::<Ulid>() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "malformed booking id" })),
        )
            .into_response();
    };
    match patch {
        BookingPatch::Cancel => match state.coordinator.cancel(&booking_id).await {
            Ok(_) => (
                StatusCode::OK,
                Json(json!({ "booking_id": booking_id, "status": "cancelled" })),
            )
                .into_response(),
            Err(e) => (status_for(&e), error_body(&e)).into_response(),
        },
        BookingPatch::Reschedule {
            resource_id,
            date,
            time,
        } => {
            let new_slot = SlotKey::new(resource_id, date, time);
            match state.coordinator.reschedule(&booking_id, new_slot).await {
                Ok(appointment) => (
                    StatusCode::OK,
                    Json(json!({
                        "booking_id": appointment.id,
                        "slot": appointment.slot,
                        "confirmed_at": appointment.confirmed_at,
                    })),
                )
                    .into_response(),
                Err(e) => (status_for(&e), error_body(&e)).into_response(),
            }
        }
    }
}

/// Reconcile path for clients that missed room events.
async fn slot_status(
    State(state): State<AppState>,
    Path((resource_id, date, time)): Path<(String, String, String)>,
) -> impl IntoResponse {
    let key = SlotKey::new(resource_id, date, time);
    match state.coordinator.locks().status(&key).await {
        Ok(status) => (StatusCode::OK, Json(json!(status))).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// Full-chain audit. Off the hot path; cost is linear in ledger size.
async fn ledger_verify(State(state): State<AppState>) -> impl IntoResponse {
    let entries = state.ledger.len().await;
    let valid = entries == 0 || state.ledger.verify(0, entries - 1).await;
    Json(json!({ "valid": valid, "entries": entries }))
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// One task per connection reading client messages, one writer task draining
/// the connection's send queue, and one forwarder task per joined room.
/// Events flow room broadcast → bounded queue → socket, so a slow client
/// backs up only its own queue, never the hub.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let conn_id = Ulid::new();
    metrics::counter!(crate::observability::WS_CONNECTIONS_TOTAL).increment(1);
    metrics::gauge!(crate::observability::WS_CONNECTIONS_ACTIVE).increment(1.0);
    info!(%conn_id, "websocket connected");

    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(64);

    let writer: JoinHandle<()> = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut joined: HashMap<String, JoinHandle<()>> = HashMap::new();

    while let Some(Ok(message)) = stream.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            // Ping/pong handled by the library; binary frames are ignored
            _ => continue,
        };
        let parsed: ClientMessage = match serde_json::from_str(&text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(%conn_id, "unparseable client message: {e}");
                let reply = json!({ "type": "error", "message": "malformed message" });
                if out_tx.send(reply.to_string()).await.is_err() {
                    break;
                }
                continue;
            }
        };

        match parsed {
            ClientMessage::JoinRoom { room } => {
                if joined.contains_key(&room) {
                    continue;
                }
                debug!(%conn_id, room, "joined room");
                let mut rx = state.rooms.subscribe(&room);
                let tx = out_tx.clone();
                let forwarder = tokio::spawn(async move {
                    loop {
                        match rx.recv().await {
                            Ok(event) => {
                                let Ok(text) = serde_json::to_string(&event) else {
                                    continue;
                                };
                                if tx.send(text).await.is_err() {
                                    break;
                                }
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                // Dropped events are recovered via the
                                // slot status endpoint
                                warn!("room subscriber lagged, skipped {n} events");
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                });
                joined.insert(room, forwarder);
            }
            ClientMessage::LeaveRoom { room } => {
                if let Some(forwarder) = joined.remove(&room) {
                    debug!(%conn_id, room, "left room");
                    forwarder.abort();
                }
            }
            ClientMessage::LockSlot {
                resource_id,
                date,
                time,
                client_id,
            } => {
                let key = SlotKey::new(resource_id, date, time);
                if let Err(e) = state.coordinator.hold(&key, &client_id).await {
                    // Failure goes back to the requester only; the room
                    // hears nothing about it
                    let reply = json!({
                        "type": "lock-failed",
                        "resource_id": key.resource_id,
                        "date": key.date,
                        "time": key.time,
                        "reason": e.to_string(),
                    });
                    if out_tx.send(reply.to_string()).await.is_err() {
                        break;
                    }
                }
            }
            ClientMessage::UnlockSlot {
                resource_id,
                date,
                time,
                client_id,
            } => {
                let key = SlotKey::new(resource_id, date, time);
                if let Err(e) = state.coordinator.release_hold(&key, &client_id).await {
                    debug!(%conn_id, slot = %key, "unlock ignored: {e}");
                }
            }
        }
    }

    for (_, forwarder) in joined {
        forwarder.abort();
    }
    drop(out_tx);
    writer.abort();
    metrics::gauge!(crate::observability::WS_CONNECTIONS_ACTIVE).decrement(1.0);
    info!(%conn_id, "websocket disconnected");
}

//! Axum HTTP + WebSocket host (SPEC_FULL.md §6 "External Interfaces"):
//! `GET /ws?room_id=&session_id=` upgrades to the sync protocol, `GET
//! /healthz` is a liveness probe. One room actor task per room-id, looked
//! up lazily in a `DashMap` registry and spawned on first use.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use sync_core::config::{self, Config};
use sync_core::persistence::{PersistenceAdapter, SqliteBlobStore};
use sync_core::schema::{self, Schema};
use sync_core::session::SessionId;
use sync_core::wire::{encode_outbound, ChunkAssembler, ServerMessage};
use sync_core::{spawn_room, RoomHandle};

/// Shared state behind every request: the room registry plus the two
/// things every room needs to be spawned (schema catalogue, persistence
/// backend), cloned cheaply per-request (`Arc`/`DashMap` are both cheap
/// to clone).
#[derive(Clone)]
struct AppState {
    rooms: Arc<DashMap<String, RoomHandle>>,
    schema: Arc<Schema>,
    persistence: Arc<dyn PersistenceAdapter>,
    config: &'static Config,
}

#[derive(serde::Deserialize)]
struct WsQuery {
    room_id: String,
    session_id: String,
}

/// Runs the Axum server. Binds to 127.0.0.1 only; this is a reference
/// host, not a production-hardened edge listener (SPEC_FULL.md §6).
pub async fn run_sync_server(port: u16) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = config::ensure_loaded();
    std::fs::create_dir_all(&config.data_dir)?;
    let db_path = config.data_dir.join("rooms.db");
    let persistence: Arc<dyn PersistenceAdapter> = Arc::new(SqliteBlobStore::open(&db_path)?);

    let state = AppState {
        rooms: Arc::new(DashMap::new()),
        schema: Arc::new(schema::server_schema()),
        persistence,
        config,
    };

    let app = Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/ws", get(ws_handler))
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    tracing::info!(%addr, db = %db_path.display(), "sync-server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if query.room_id.trim().is_empty() || query.session_id.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "room_id and session_id are required").into_response();
    }
    let room = room_handle_for(&state, &query.room_id);
    let session_id = SessionId::from(query.session_id);
    let max_safe_message_size = state.config.max_safe_message_size;
    ws.on_upgrade(move |socket| handle_socket(socket, room, session_id, max_safe_message_size))
}

fn room_handle_for(state: &AppState, room_id: &str) -> RoomHandle {
    if let Some(existing) = state.rooms.get(room_id) {
        return existing.clone();
    }
    state
        .rooms
        .entry(room_id.to_string())
        .or_insert_with(|| spawn_room(room_id.to_string(), state.schema.clone(), state.persistence.clone()))
        .clone()
}

async fn handle_socket(socket: WebSocket, room: RoomHandle, session_id: SessionId, max_safe_message_size: usize) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerMessage>();
    room.accept_session(session_id.clone(), outbound_tx);

    let outbound_to_ws = async {
        while let Some(message) = outbound_rx.recv().await {
            for frame in encode_outbound(&message, max_safe_message_size) {
                if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                    return;
                }
            }
        }
    };

    let inbound_to_room = async {
        let mut assembler = ChunkAssembler::new();
        while let Some(Ok(msg)) = ws_rx.next().await {
            let Message::Text(text) = msg else { continue };
            match assembler.feed(&text) {
                Ok(Some(client_message)) => room.handle_message(session_id.clone(), client_message),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(%session_id, error = %e, "protocol violation, closing socket");
                    room.handle_error(session_id.clone());
                    return;
                }
            }
        }
    };

    tokio::select! {
        _ = outbound_to_ws => {}
        _ = inbound_to_room => {}
    }
    room.handle_close(session_id);
}

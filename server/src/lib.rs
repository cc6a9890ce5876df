//! sync-server: Axum HTTP + WebSocket host for sync-core rooms.

mod web_server;

pub use web_server::run_sync_server;

//! Status HTTP server: health and channel summary for monitoring, plus the stored messages.

use crate::channels::ChannelRegistry;
use crate::multipart::Reassembler;
use crate::store::{MessageStore, StoredMessage};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;

#[derive(Clone)]
pub struct StatusState {
    pub registry: Arc<ChannelRegistry>,
    pub reassembler: Arc<Reassembler>,
    pub store: Arc<MessageStore>,
    pub port: u16,
}

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/", get(health_http))
        .route("/messages", get(messages_http))
        .with_state(state)
}

/// GET / returns health JSON with per-channel queue depth.
async fn health_http(State(state): State<StatusState>) -> Json<serde_json::Value> {
    let mut channels = Vec::new();
    for handle in state.registry.handles().await {
        let queued = handle.queued().await;
        channels.push(json!({
            "name": handle.name,
            "kind": handle.kind,
            "queued": queued,
        }));
    }
    Json(json!({
        "runtime": "running",
        "channels": channels,
        "multipartPending": state.reassembler.pending_count().await,
        "stored": state.store.len().await,
        "port": state.port,
    }))
}

/// GET /messages returns the retained messages, oldest first.
async fn messages_http(State(state): State<StatusState>) -> Json<Vec<StoredMessage>> {
    Json(state.store.snapshot().await)
}

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Json;
use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use futures::future::BoxFuture;
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::selection::Slot;

/// Something that can publish one slot on demand.
pub trait SlotRunner: Send + Sync {
    fn run(&self, slot: Slot) -> BoxFuture<'_, Result<()>>;
}

#[derive(Clone)]
struct TriggerState {
    token: Option<String>,
    runner: Arc<dyn SlotRunner>,
}

#[derive(Debug, Deserialize)]
struct TriggerParams {
    slot: Option<String>,
    token: Option<String>,
}

pub fn router(token: Option<String>, runner: Arc<dyn SlotRunner>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/trigger", get(trigger))
        .with_state(TriggerState { token, runner })
}

pub async fn serve(port: u16, token: Option<String>, runner: Arc<dyn SlotRunner>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Could not bind port {port}"))?;
    info!("Listening on 0.0.0.0:{port}");
    if token.is_none() {
        warn!("TRIGGER_TOKEN is not set, /trigger is open to anyone");
    }
    axum::serve(listener, router(token, runner))
        .await
        .context("HTTP server stopped")
}

async fn health() -> &'static str {
    "OK"
}

async fn trigger(State(state): State<TriggerState>, Query(params): Query<TriggerParams>) -> (StatusCode, Json<Value>) {
    if let Some(expected) = &state.token {
        if params.token.as_deref() != Some(expected.as_str()) {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"ok": false, "error": "unauthorized"})),
            );
        }
    }

    let raw = params.slot.unwrap_or_else(|| "0".to_string());
    let Some(slot) = raw.trim().parse::<i64>().ok().and_then(Slot::from_index) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"ok": false, "error": "slot must be 0 or 1"})),
        );
    };

    info!("Trigger received for slot {}", slot.index());
    match state.runner.run(slot).await {
        Ok(()) => (StatusCode::OK, Json(json!({"ok": true, "slot": slot.index()}))),
        Err(e) => {
            error!("Triggered slot {} failed: {:#}", slot.index(), e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"ok": false, "error": format!("{e:#}")})),
            )
        }
    }
}

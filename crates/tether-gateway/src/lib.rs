//! # tether-gateway
//!
//! Ingress plane of the tether control plane: authenticates external
//! webhook events, resolves their tenant server-side, and creates
//! Sessions; hosts the read API consumed by the UI and the callback
//! surface runners report through. Reconcilers from `tether-core` are
//! wired up by the binary in `main.rs`.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod api;
pub mod callback;
pub mod metrics;
pub mod notify_http;
pub mod state;
pub mod trace;
pub mod webhook;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;

use state::AppState;

/// Composes every gateway surface into one router.
#[must_use]
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(webhook::router())
        .merge(api::router())
        .merge(callback::router())
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_text))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics_text(State(state): State<AppState>) -> Result<String, StatusCode> {
    state
        .metrics
        .encode_text()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

//! Health check endpoint
//!
//! `/health` and `/healthz` report liveness plus which backends the process
//! was wired with, so an operator can tell a dev-mode instance apart.

use hyper::{Response, StatusCode};
use serde::Serialize;

use super::{json_response, FullBody};
use crate::server::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: &'static str,
    /// Uptime in seconds
    pub uptime: u64,
    /// "development" or "production"
    pub mode: &'static str,
    pub store: &'static str,
    pub settlement: &'static str,
    pub approval_quorum: usize,
    pub timestamp: String,
}

pub fn health_check(state: &AppState) -> Response<FullBody> {
    let body = HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION"),
        uptime: state.started_at.elapsed().as_secs(),
        mode: if state.args.dev_mode {
            "development"
        } else {
            "production"
        },
        store: state.store_kind,
        settlement: state.settlement_kind,
        approval_quorum: state.ledger.milestones.policy().quorum,
        timestamp: chrono::Utc::now().to_rfc3339(),
    };
    json_response(StatusCode::OK, &body)
}

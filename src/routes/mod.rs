//! HTTP route handlers
//!
//! ## Endpoints
//!
//! - `health` - liveness and mode report
//! - `escrow` - deposits, escrow reads, deposit status changes
//! - `milestones` - milestone locks, approvals, releases
//! - `treasury` - fees, donations, withdrawals, distributions, reserve, reads
//! - `investments` - investment creation, status changes, reads
//! - `events` - event log queries and tx hash reconciliation
//!
//! Handlers return `Result<Response<FullBody>>`; the server renders any
//! `LedgerError` as `{"error": ..., "code": ...}` with its status.

pub mod escrow;
pub mod events;
pub mod health;
pub mod investments;
pub mod milestones;
pub mod treasury;

pub use health::health_check;

use std::collections::HashMap;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, CACHE_CONTROL, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::types::{Amount, LedgerError, Result};

pub type FullBody = Full<Bytes>;

// =============================================================================
// Responses
// =============================================================================

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<FullBody> {
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
    let mut response = Response::new(Full::new(Bytes::from(json)));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

pub fn error_response(status: StatusCode, error: &str, code: Option<&str>) -> Response<FullBody> {
    json_response(
        status,
        &ErrorResponse {
            error: error.to_string(),
            code: code.map(|c| c.to_string()),
        },
    )
}

/// Render a ledger error with its status and stable code
pub fn ledger_error_response(err: &LedgerError) -> Response<FullBody> {
    let status = err.status_code();
    // Do not leak internals on 5xx
    let message = if status.is_server_error() {
        match err {
            LedgerError::ConfigurationMissing(_) => err.to_string(),
            _ => "Internal server error".to_string(),
        }
    } else {
        err.to_string()
    };
    error_response(status, &message, Some(err.code()))
}

pub fn ok<T: Serialize>(body: &T) -> Result<Response<FullBody>> {
    Ok(json_response(StatusCode::OK, body))
}

pub fn created<T: Serialize>(body: &T) -> Result<Response<FullBody>> {
    Ok(json_response(StatusCode::CREATED, body))
}

// =============================================================================
// Requests
// =============================================================================

/// Parse a JSON request body
pub async fn read_json<T: DeserializeOwned>(req: Request<Incoming>) -> Result<T> {
    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| LedgerError::BadRequest(format!("Invalid body: {}", e)))?
        .to_bytes();
    serde_json::from_slice(&body).map_err(|e| LedgerError::BadRequest(format!("Invalid JSON: {}", e)))
}

/// Parse a JSON body that may be absent
pub async fn read_json_or_default<T: DeserializeOwned + Default>(req: Request<Incoming>) -> Result<T> {
    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| LedgerError::BadRequest(format!("Invalid body: {}", e)))?
        .to_bytes();
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(&body).map_err(|e| LedgerError::BadRequest(format!("Invalid JSON: {}", e)))
}

/// Decode a query string into a key -> value map
pub fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    let mut params = HashMap::new();
    if let Some(q) = query {
        for pair in q.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let value = urlencoding::decode(value)
                .map(|v| v.into_owned())
                .unwrap_or_default();
            params.insert(key.to_string(), value);
        }
    }
    params
}

/// Parse an optional numeric query parameter
pub fn query_u64(params: &HashMap<String, String>, key: &str) -> Result<Option<u64>> {
    params
        .get(key)
        .map(|v| {
            v.parse::<u64>()
                .map_err(|_| LedgerError::BadRequest(format!("{} must be a positive integer", key)))
        })
        .transpose()
}

/// Monetary input accepted as a decimal string or a JSON number
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AmountInput {
    Text(String),
    Number(serde_json::Number),
}

impl AmountInput {
    /// Strictly positive amount
    pub fn positive(&self) -> Result<Amount> {
        match self {
            AmountInput::Text(s) => Amount::parse_positive(s),
            AmountInput::Number(n) => Amount::parse_positive(&n.to_string()),
        }
    }
}

/// Amount as rendered in responses
pub fn amount_json(amount: Amount) -> f64 {
    amount.to_f64()
}

/// RFC 3339 timestamp of a BSON datetime
pub fn timestamp(dt: bson::DateTime) -> String {
    dt.to_chrono().to_rfc3339()
}

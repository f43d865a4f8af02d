//! HTTP server implementation
//!
//! Uses hyper http1 with TokioIo for async handling.

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{
    HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, AUTHORIZATION,
};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::auth::{extract_token_from_header, Actor, CapabilityTable, JwtValidator};
use crate::config::Args;
use crate::ledger::Ledger;
use crate::routes::{self, FullBody};
use crate::types::{LedgerError, Result};

/// Shared application state
pub struct AppState {
    pub args: Args,
    pub ledger: Ledger,
    pub jwt: JwtValidator,
    /// Role -> capability table shared with the ledger
    pub capabilities: Arc<CapabilityTable>,
    /// "mongodb" or "memory"
    pub store_kind: &'static str,
    /// "gateway" or "simulated"
    pub settlement_kind: &'static str,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        args: Args,
        ledger: Ledger,
        jwt: JwtValidator,
        capabilities: Arc<CapabilityTable>,
        store_kind: &'static str,
        settlement_kind: &'static str,
    ) -> Self {
        Self {
            args,
            ledger,
            jwt,
            capabilities,
            store_kind,
            settlement_kind,
            started_at: Instant::now(),
        }
    }

    /// Resolve the caller from the bearer token
    pub fn authenticate(&self, header: Option<&str>) -> Result<Actor> {
        let token = extract_token_from_header(header)
            .ok_or_else(|| LedgerError::Unauthorized("Missing bearer token".into()))?;
        let result = self.jwt.verify_token(token);
        match result.claims {
            Some(claims) if result.valid => Ok(claims.actor()),
            _ => Err(LedgerError::Unauthorized(
                result.error.unwrap_or_else(|| "Invalid token".to_string()),
            )),
        }
    }
}

/// Start the HTTP server
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let listener = TcpListener::bind(state.args.listen).await?;

    info!("fundledger listening on {}", state.args.listen);
    if state.args.dev_mode {
        warn!("Development mode enabled - dev JWT secret and in-process fallbacks may be active");
    }

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new()
                        .preserve_header_case(true)
                        .title_case_headers(true)
                        .serve_connection(io, service)
                        .await
                    {
                        error!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> std::result::Result<Response<FullBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!("[{}] {} {}", addr, method, path);

    let response = match route(state, req, &method, &path).await {
        Ok(response) => response,
        Err(e) => {
            let status = e.status_code();
            if status.is_server_error() {
                error!(method = %method, path = %path, error = %e, "request failed");
            } else {
                debug!(method = %method, path = %path, error = %e, "request rejected");
            }
            routes::ledger_error_response(&e)
        }
    };

    info!("[{}] {} {} -> {}", addr, method, path, response.status().as_u16());
    Ok(response)
}

/// Route incoming HTTP requests
async fn route(
    state: Arc<AppState>,
    req: Request<Incoming>,
    method: &Method,
    path: &str,
) -> Result<Response<FullBody>> {
    match (method, path) {
        (&Method::GET, "/health") | (&Method::GET, "/healthz") => {
            return Ok(routes::health_check(&state));
        }
        (&Method::OPTIONS, _) => return Ok(preflight_response()),
        _ => {}
    }

    let actor = state.authenticate(
        req.headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok()),
    )?;

    // ========================================================================
    // Ledger API
    // ========================================================================
    if let Some(rest) = path.strip_prefix("/api/v1/escrow") {
        routes::escrow::handle_escrow_request(req, state, actor, rest).await
    } else if let Some(rest) = path.strip_prefix("/api/v1/milestones/locks") {
        routes::milestones::handle_milestone_request(req, state, actor, rest).await
    } else if let Some(rest) = path.strip_prefix("/api/v1/treasury") {
        routes::treasury::handle_treasury_request(req, state, actor, rest).await
    } else if let Some(rest) = path.strip_prefix("/api/v1/investments") {
        routes::investments::handle_investment_request(req, state, actor, rest).await
    } else if let Some(rest) = path.strip_prefix("/api/v1/projects/") {
        routes::investments::handle_project_investments(req, state, actor, rest).await
    } else if path == "/api/v1/events" || path.starts_with("/api/v1/reconciliation/") {
        routes::events::handle_event_request(req, state, actor, path).await
    } else {
        Err(not_found(method, path))
    }
}

pub(crate) fn not_found(method: &Method, path: &str) -> LedgerError {
    LedgerError::NotFound(format!("no route for {} {}", method, path))
}

/// CORS preflight response
fn preflight_response() -> Response<FullBody> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("*"));
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, PATCH, OPTIONS"),
    );
    response
}

//! Escrow API endpoints
//!
//! ## Endpoints
//!
//! - `POST /api/v1/escrow/deposits` - Record a deposit
//! - `GET /api/v1/escrow/deposits/{id}` - Deposit details
//! - `POST /api/v1/escrow/deposits/{id}/confirm|release|dispute|refund` - Status changes
//! - `GET /api/v1/escrow/projects/{projectId}[?currency=]` - Escrow of a project, or `null`
//! - `GET /api/v1/escrow/{escrowId}` - Escrow by id
//! - `GET /api/v1/escrow/{escrowId}/events` - Event log of an escrow

use hyper::body::Incoming;
use hyper::{Method, Request, Response};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::events::EventDto;
use super::milestones::MilestoneLockDto;
use super::{amount_json, created, ok, parse_query, read_json, read_json_or_default, timestamp, AmountInput, FullBody};
use crate::auth::{Actor, Capability};
use crate::db::schemas::{DepositDoc, DepositSource, EmbeddedMilestoneLock};
use crate::ledger::{DepositReceipt, EscrowView, NewDeposit};
use crate::server::http::not_found;
use crate::server::AppState;
use crate::types::{Currency, LedgerError, Result};

// =============================================================================
// Request / Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDepositRequest {
    pub project_id: String,
    /// Defaults to the caller; only escrow managers may record for someone else
    pub investor_id: Option<String>,
    pub amount: AmountInput,
    pub currency: String,
    pub source: DepositSource,
    pub tx_hash: Option<String>,
    pub provider_tx_id: Option<String>,
    pub nft_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReasonRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositReceiptDto {
    pub success: bool,
    pub deposit_id: String,
    pub escrow_id: String,
    pub status: &'static str,
}

impl From<DepositReceipt> for DepositReceiptDto {
    fn from(r: DepositReceipt) -> Self {
        Self {
            success: r.success,
            deposit_id: r.deposit_id,
            escrow_id: r.escrow_id,
            status: r.status.as_str(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositDto {
    pub deposit_id: String,
    pub escrow_id: String,
    pub project_id: String,
    pub investor_id: String,
    pub amount: f64,
    pub currency: Currency,
    pub source: DepositSource,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_tx_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nft_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution_tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_changed_at: Option<String>,
}

impl From<DepositDoc> for DepositDto {
    fn from(d: DepositDoc) -> Self {
        Self {
            deposit_id: d.deposit_id,
            escrow_id: d.escrow_id,
            project_id: d.project_id,
            investor_id: d.investor_id,
            amount: amount_json(d.amount),
            currency: d.currency,
            source: d.source,
            status: d.status.as_str(),
            tx_hash: d.tx_hash,
            provider_tx_id: d.provider_tx_id,
            nft_id: d.nft_id,
            status_reason: d.status_reason,
            resolution_tx_hash: d.resolution_tx_hash,
            metadata: d.details,
            created_at: d.metadata.created_at.map(timestamp),
            status_changed_at: d.status_changed_at.map(timestamp),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MilestoneViewDto {
    pub lock_id: String,
    pub milestone_id: String,
    pub amount: f64,
    pub status: &'static str,
    pub locked_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub released_at: Option<String>,
}

impl From<EmbeddedMilestoneLock> for MilestoneViewDto {
    fn from(m: EmbeddedMilestoneLock) -> Self {
        Self {
            lock_id: m.lock_id,
            milestone_id: m.milestone_id,
            amount: amount_json(m.amount),
            status: m.status.as_str(),
            locked_at: timestamp(m.locked_at),
            released_at: m.released_at.map(timestamp),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EscrowDto {
    pub escrow_id: String,
    pub project_id: String,
    pub currency: Currency,
    pub status: &'static str,
    pub total_locked: f64,
    /// Locked funds not reserved by an active milestone lock
    pub unreserved: f64,
    pub locked_by_milestone: Vec<MilestoneViewDto>,
    pub deposits: Vec<DepositDto>,
    pub milestone_locks: Vec<MilestoneLockDto>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl From<EscrowView> for EscrowDto {
    fn from(view: EscrowView) -> Self {
        let escrow = view.escrow;
        let unreserved = amount_json(escrow.unreserved());
        Self {
            escrow_id: escrow.escrow_id,
            project_id: escrow.project_id,
            currency: escrow.currency,
            status: escrow.status.as_str(),
            total_locked: amount_json(escrow.total_locked),
            unreserved,
            locked_by_milestone: escrow.locked_by_milestone.into_iter().map(Into::into).collect(),
            deposits: view.deposits.into_iter().map(Into::into).collect(),
            milestone_locks: view.milestone_locks.into_iter().map(Into::into).collect(),
            created_at: escrow.metadata.created_at.map(timestamp),
        }
    }
}

// =============================================================================
// Router
// =============================================================================

pub async fn handle_escrow_request(
    req: Request<Incoming>,
    state: Arc<AppState>,
    actor: Actor,
    subpath: &str,
) -> Result<Response<FullBody>> {
    let method = req.method().clone();
    let segments: Vec<&str> = subpath.trim_matches('/').split('/').collect();

    match (&method, segments.as_slice()) {
        (&Method::POST, ["deposits"]) => create_deposit(req, &state, &actor).await,
        (&Method::GET, ["deposits", id]) => {
            actor.require(&state.capabilities, Capability::ReadLedger)?;
            ok(&DepositDto::from(state.ledger.escrow.get_deposit(id).await?))
        }
        (&Method::POST, ["deposits", id, action]) => deposit_action(req, &state, &actor, id, action).await,
        (&Method::GET, ["projects", project_id]) => {
            actor.require(&state.capabilities, Capability::ReadLedger)?;
            let params = parse_query(req.uri().query());
            let currency = params
                .get("currency")
                .map(|c| c.parse::<Currency>())
                .transpose()?;
            let view = state.ledger.escrow.get_escrow_by_project(project_id, currency).await?;
            ok(&view.map(EscrowDto::from))
        }
        (&Method::GET, [escrow_id]) if !escrow_id.is_empty() => {
            actor.require(&state.capabilities, Capability::ReadLedger)?;
            let view = state
                .ledger
                .escrow
                .get_escrow(escrow_id)
                .await?
                .ok_or_else(|| LedgerError::NotFound(format!("escrow {}", escrow_id)))?;
            ok(&EscrowDto::from(view))
        }
        (&Method::GET, [escrow_id, "events"]) => {
            actor.require(&state.capabilities, Capability::ReadLedger)?;
            let events: Vec<EventDto> = state
                .ledger
                .events
                .for_escrow(escrow_id)
                .await?
                .into_iter()
                .map(Into::into)
                .collect();
            ok(&events)
        }
        _ => Err(not_found(&method, subpath)),
    }
}

async fn create_deposit(req: Request<Incoming>, state: &AppState, actor: &Actor) -> Result<Response<FullBody>> {
    let body: CreateDepositRequest = read_json(req).await?;

    let investor_id = match body.investor_id {
        Some(id) if id != actor.id => {
            actor.require(&state.capabilities, Capability::ManageEscrow)?;
            id
        }
        _ => actor.id.clone(),
    };

    let receipt = state
        .ledger
        .escrow
        .create_deposit(
            NewDeposit {
                project_id: body.project_id,
                investor_id,
                amount: body.amount.positive()?,
                currency: body.currency.parse::<Currency>()?,
                source: body.source,
                tx_hash: body.tx_hash,
                provider_tx_id: body.provider_tx_id,
                nft_id: body.nft_id,
                metadata: body.metadata,
            },
            actor,
        )
        .await?;
    created(&DepositReceiptDto::from(receipt))
}

async fn deposit_action(
    req: Request<Incoming>,
    state: &AppState,
    actor: &Actor,
    deposit_id: &str,
    action: &str,
) -> Result<Response<FullBody>> {
    let body: ReasonRequest = read_json_or_default(req).await?;
    let escrow = &state.ledger.escrow;

    let deposit = match action {
        "confirm" => escrow.confirm_deposit(deposit_id, actor).await?,
        "release" => escrow.release_deposit(deposit_id, body.reason, actor).await?,
        "dispute" => escrow.dispute_deposit(deposit_id, body.reason, actor).await?,
        "refund" => escrow.refund_deposit(deposit_id, body.reason, actor).await?,
        other => {
            return Err(LedgerError::NotFound(format!("unknown deposit action '{}'", other)));
        }
    };
    ok(&DepositDto::from(deposit))
}

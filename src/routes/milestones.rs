//! Milestone lock endpoints
//!
//! - `POST /api/v1/milestones/locks` - Lock escrowed funds against a milestone
//! - `GET /api/v1/milestones/locks/{lockId}` - Lock details
//! - `POST /api/v1/milestones/locks/{lockId}/approve` - Add a signer approval
//! - `POST /api/v1/milestones/locks/{lockId}/release` - Pay the lock out
//! - `POST /api/v1/milestones/locks/{lockId}/cancel` - Drop the reservation

use hyper::body::Incoming;
use hyper::{Method, Request, Response};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::escrow::ReasonRequest;
use super::{amount_json, created, ok, read_json, read_json_or_default, timestamp, AmountInput, FullBody};
use crate::auth::{Actor, Capability};
use crate::db::schemas::{MilestoneApproval, MilestoneLockDoc};
use crate::server::http::not_found;
use crate::server::AppState;
use crate::types::{Currency, Result};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRequest {
    pub project_id: String,
    pub currency: String,
    pub milestone_id: String,
    pub amount: AmountInput,
}

#[derive(Debug, Deserialize)]
pub struct ApproveRequest {
    pub signature: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalDto {
    pub approver: String,
    pub signature: String,
    pub timestamp: String,
}

impl From<MilestoneApproval> for ApprovalDto {
    fn from(a: MilestoneApproval) -> Self {
        Self {
            approver: a.approver,
            signature: a.signature,
            timestamp: timestamp(a.timestamp),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MilestoneLockDto {
    pub lock_id: String,
    pub escrow_id: String,
    pub project_id: String,
    pub milestone_id: String,
    pub currency: Currency,
    pub amount: f64,
    pub status: &'static str,
    pub locked_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub released_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<String>,
    pub approvals: Vec<ApprovalDto>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl From<MilestoneLockDoc> for MilestoneLockDto {
    fn from(l: MilestoneLockDoc) -> Self {
        Self {
            lock_id: l.lock_id,
            escrow_id: l.escrow_id,
            project_id: l.project_id,
            milestone_id: l.milestone_id,
            currency: l.currency,
            amount: amount_json(l.amount),
            status: l.status.as_str(),
            locked_at: timestamp(l.locked_at),
            released_at: l.released_at.map(timestamp),
            cancelled_at: l.cancelled_at.map(timestamp),
            approvals: l.approvals.into_iter().map(Into::into).collect(),
            release_tx_hash: l.release_tx_hash,
            reason: l.reason,
        }
    }
}

pub async fn handle_milestone_request(
    req: Request<Incoming>,
    state: Arc<AppState>,
    actor: Actor,
    subpath: &str,
) -> Result<Response<FullBody>> {
    let method = req.method().clone();
    let segments: Vec<&str> = subpath
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();
    let milestones = &state.ledger.milestones;

    match (&method, segments.as_slice()) {
        (&Method::POST, []) => {
            let body: LockRequest = read_json(req).await?;
            let lock = milestones
                .lock(
                    &body.project_id,
                    body.currency.parse::<Currency>()?,
                    &body.milestone_id,
                    body.amount.positive()?,
                    &actor,
                )
                .await?;
            created(&MilestoneLockDto::from(lock))
        }
        (&Method::GET, [lock_id]) => {
            actor.require(&state.capabilities, Capability::ReadLedger)?;
            ok(&MilestoneLockDto::from(milestones.get(lock_id).await?))
        }
        (&Method::POST, [lock_id, "approve"]) => {
            let body: ApproveRequest = read_json(req).await?;
            let lock = milestones.approve(lock_id, &body.signature, &actor).await?;
            ok(&MilestoneLockDto::from(lock))
        }
        (&Method::POST, [lock_id, "release"]) => {
            let body: ReasonRequest = read_json_or_default(req).await?;
            let lock = milestones.release(lock_id, body.reason, &actor).await?;
            ok(&MilestoneLockDto::from(lock))
        }
        (&Method::POST, [lock_id, "cancel"]) => {
            let body: ReasonRequest = read_json_or_default(req).await?;
            let lock = milestones.cancel(lock_id, body.reason, &actor).await?;
            ok(&MilestoneLockDto::from(lock))
        }
        _ => Err(not_found(&method, subpath)),
    }
}

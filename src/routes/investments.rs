//! Investment endpoints
//!
//! - `POST /api/v1/investments` - Invest in a project (settles on chain)
//! - `GET /api/v1/investments/{id}` - Investment details
//! - `PATCH /api/v1/investments/{id}/status` - Move along the status machine
//! - `GET /api/v1/projects/{projectId}/investments` - Investments of a project

use hyper::body::Incoming;
use hyper::{Method, Request, Response};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{amount_json, created, ok, read_json, timestamp, AmountInput, FullBody};
use crate::auth::{Actor, Capability};
use crate::db::schemas::{InvestmentDoc, InvestmentStatus, StatusChange};
use crate::ledger::NewInvestment;
use crate::server::http::not_found;
use crate::server::AppState;
use crate::types::{Currency, Result};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInvestmentRequest {
    pub project_id: String,
    pub amount: AmountInput,
    pub currency: String,
    pub nft_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: String,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChangeDto {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<&'static str>,
    pub to: &'static str,
    pub at: String,
    pub by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
}

impl From<StatusChange> for StatusChangeDto {
    fn from(c: StatusChange) -> Self {
        Self {
            from: c.from.map(|s| s.as_str()),
            to: c.to.as_str(),
            at: timestamp(c.at),
            by: c.by,
            reason: c.reason,
            tx_hash: c.tx_hash,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvestmentDto {
    pub investment_id: String,
    pub project_id: String,
    pub investor_id: String,
    pub amount: f64,
    pub currency: Currency,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nft_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    pub status: &'static str,
    pub deposit_id: String,
    pub escrow_id: String,
    pub status_history: Vec<StatusChangeDto>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl From<InvestmentDoc> for InvestmentDto {
    fn from(i: InvestmentDoc) -> Self {
        Self {
            investment_id: i.investment_id,
            project_id: i.project_id,
            investor_id: i.investor_id,
            amount: amount_json(i.amount),
            currency: i.currency,
            nft_id: i.nft_id,
            tx_hash: i.tx_hash,
            status: i.status.as_str(),
            deposit_id: i.deposit_id,
            escrow_id: i.escrow_id,
            status_history: i.status_history.into_iter().map(Into::into).collect(),
            created_at: i.metadata.created_at.map(timestamp),
        }
    }
}

pub async fn handle_investment_request(
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
    let investments = &state.ledger.investments;

    match (&method, segments.as_slice()) {
        (&Method::POST, []) => {
            let body: CreateInvestmentRequest = read_json(req).await?;
            let investment = investments
                .create(
                    NewInvestment {
                        project_id: body.project_id,
                        amount: body.amount.positive()?,
                        currency: body.currency.parse::<Currency>()?,
                        nft_id: body.nft_id,
                    },
                    &actor,
                )
                .await?;
            created(&InvestmentDto::from(investment))
        }
        (&Method::GET, [investment_id]) => {
            actor.require(&state.capabilities, Capability::ReadLedger)?;
            ok(&InvestmentDto::from(investments.get(investment_id).await?))
        }
        (&Method::PATCH, [investment_id, "status"]) => {
            let body: StatusRequest = read_json(req).await?;
            let investment = investments
                .update_status(investment_id, body.status.parse::<InvestmentStatus>()?, body.reason, &actor)
                .await?;
            ok(&InvestmentDto::from(investment))
        }
        _ => Err(not_found(&method, subpath)),
    }
}

/// `GET /api/v1/projects/{projectId}/investments`
pub async fn handle_project_investments(
    req: Request<Incoming>,
    state: Arc<AppState>,
    actor: Actor,
    subpath: &str,
) -> Result<Response<FullBody>> {
    let method = req.method().clone();
    match (&method, subpath.trim_end_matches('/').split_once('/')) {
        (&Method::GET, Some((project_id, "investments"))) if !project_id.is_empty() => {
            actor.require(&state.capabilities, Capability::ReadLedger)?;
            let listing: Vec<InvestmentDto> = state
                .ledger
                .investments
                .list_for_project(project_id)
                .await?
                .into_iter()
                .map(Into::into)
                .collect();
            ok(&listing)
        }
        _ => Err(not_found(&method, subpath)),
    }
}

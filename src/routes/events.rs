//! Event log endpoints
//!
//! - `GET /api/v1/events?txHash=` - Events sharing a chain transaction hash
//! - `GET /api/v1/reconciliation/{txHash}` - Every off-chain record of a hash

use hyper::body::Incoming;
use hyper::{Method, Request, Response};
use serde::Serialize;
use std::sync::Arc;

use super::escrow::DepositDto;
use super::treasury::TransactionDto;
use super::{ok, parse_query, timestamp, FullBody};
use crate::auth::{Actor, Capability};
use crate::db::schemas::{EscrowEventDoc, EventActor};
use crate::ledger::TxReconciliation;
use crate::server::http::not_found;
use crate::server::AppState;
use crate::types::{LedgerError, Result};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDto {
    pub event_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escrow_id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: &'static str,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    pub actor: EventActor,
    pub created_at: String,
}

impl From<EscrowEventDoc> for EventDto {
    fn from(e: EscrowEventDoc) -> Self {
        Self {
            event_id: e.event_id,
            escrow_id: e.escrow_id,
            event_type: e.event_type.as_str(),
            payload: e.payload,
            tx_hash: e.tx_hash,
            actor: e.actor,
            created_at: timestamp(e.created_at),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationDto {
    pub tx_hash: String,
    pub known: bool,
    pub events: Vec<EventDto>,
    pub deposits: Vec<DepositDto>,
    pub treasury_transactions: Vec<TransactionDto>,
}

impl From<TxReconciliation> for ReconciliationDto {
    fn from(r: TxReconciliation) -> Self {
        Self {
            known: r.is_known(),
            tx_hash: r.tx_hash,
            events: r.events.into_iter().map(Into::into).collect(),
            deposits: r.deposits.into_iter().map(Into::into).collect(),
            treasury_transactions: r.treasury_transactions.into_iter().map(Into::into).collect(),
        }
    }
}

/// Handles the full request path; both prefixes live here
pub async fn handle_event_request(
    req: Request<Incoming>,
    state: Arc<AppState>,
    actor: Actor,
    path: &str,
) -> Result<Response<FullBody>> {
    let method = req.method().clone();
    if method != Method::GET {
        return Err(not_found(&method, path));
    }
    actor.require(&state.capabilities, Capability::ReadLedger)?;

    if path == "/api/v1/events" {
        let params = parse_query(req.uri().query());
        let tx_hash = params
            .get("txHash")
            .ok_or_else(|| LedgerError::BadRequest("txHash is required".into()))?;
        let events: Vec<EventDto> = state
            .ledger
            .escrow
            .get_events_by_tx_hash(tx_hash)
            .await?
            .into_iter()
            .map(Into::into)
            .collect();
        return ok(&events);
    }

    match path.strip_prefix("/api/v1/reconciliation/") {
        Some(raw) => {
            let tx_hash = urlencoding::decode(raw)
                .map_err(|_| LedgerError::BadRequest("txHash is not valid UTF-8".into()))?;
            let report = state.ledger.events.reconcile_tx(&tx_hash).await?;
            ok(&ReconciliationDto::from(report))
        }
        None => Err(not_found(&method, path)),
    }
}

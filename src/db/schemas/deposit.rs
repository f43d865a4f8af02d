//! Deposit document schema
//!
//! A single investor contribution attached to an escrow. Deposits are child
//! records referenced by id from the escrow so their status can change
//! independently. They are never deleted.

use bson::{doc, oid::ObjectId, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;
use crate::types::{Amount, Currency};

/// Collection name for deposits
pub const DEPOSIT_COLLECTION: &str = "deposits";

/// Where the deposited funds came from
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DepositSource {
    Onchain,
    Fiat,
    Offchain,
}

/// Deposit status
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DepositStatus {
    /// Recorded, not yet confirmed
    Pending,
    /// Waiting for an on-chain receipt
    PendingTx,
    /// Funds confirmed in trust
    Confirmed,
    /// Paid out to the project (terminal)
    Released,
    /// Returned to the investor (terminal)
    Refunded,
    /// Under dispute
    Disputed,
}

impl DepositStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DepositStatus::Pending => "PENDING",
            DepositStatus::PendingTx => "PENDING_TX",
            DepositStatus::Confirmed => "CONFIRMED",
            DepositStatus::Released => "RELEASED",
            DepositStatus::Refunded => "REFUNDED",
            DepositStatus::Disputed => "DISPUTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DepositStatus::Released | DepositStatus::Refunded)
    }

    /// Whether entering this status takes the funds out of trust
    pub fn exits_escrow(&self) -> bool {
        self.is_terminal()
    }

    /// Allowed status edges
    pub fn can_transition_to(&self, next: DepositStatus) -> bool {
        use DepositStatus::*;
        matches!(
            (self, next),
            (Pending, PendingTx)
                | (Pending, Confirmed)
                | (PendingTx, Confirmed)
                | (Pending, Disputed)
                | (PendingTx, Disputed)
                | (Confirmed, Disputed)
                | (Confirmed, Released)
                | (Disputed, Released)
                | (Pending, Refunded)
                | (PendingTx, Refunded)
                | (Confirmed, Refunded)
                | (Disputed, Refunded)
        )
    }
}

impl std::str::FromStr for DepositStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "PENDING" => Ok(DepositStatus::Pending),
            "PENDING_TX" => Ok(DepositStatus::PendingTx),
            "CONFIRMED" => Ok(DepositStatus::Confirmed),
            "RELEASED" => Ok(DepositStatus::Released),
            "REFUNDED" => Ok(DepositStatus::Refunded),
            "DISPUTED" => Ok(DepositStatus::Disputed),
            other => Err(format!("unknown deposit status '{}'", other)),
        }
    }
}

/// Optional fields written alongside a status change
#[derive(Debug, Clone, Default)]
pub struct DepositStatusExtra {
    /// Free-text reason (dispute reason, refund note, ...)
    pub reason: Option<String>,
    /// Settlement transaction that moved the funds
    pub resolution_tx_hash: Option<String>,
}

/// Deposit document stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DepositDoc {
    /// MongoDB document ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    /// Common metadata (created_at, updated_at)
    #[serde(default)]
    pub metadata: Metadata,

    pub deposit_id: String,

    /// Owning escrow
    pub escrow_id: String,

    pub project_id: String,

    pub investor_id: String,

    pub amount: Amount,

    pub currency: Currency,

    pub source: DepositSource,

    /// Chain transaction hash; unique when present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,

    /// Payment provider reference for fiat deposits
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_tx_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub nft_id: Option<String>,

    pub status: DepositStatus,

    /// Reason attached to the latest status change
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,

    /// Settlement transaction of a release or refund
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution_tx_hash: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_changed_at: Option<DateTime>,

    /// Caller-supplied metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl DepositDoc {
    /// Apply a status change in memory (stores persist the same fields)
    pub fn apply_status(&mut self, status: DepositStatus, extra: &DepositStatusExtra) {
        self.status = status;
        if extra.reason.is_some() {
            self.status_reason = extra.reason.clone();
        }
        if extra.resolution_tx_hash.is_some() {
            self.resolution_tx_hash = extra.resolution_tx_hash.clone();
        }
        self.status_changed_at = Some(DateTime::now());
        self.metadata.touch();
    }
}

impl IntoIndexes for DepositDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "deposit_id": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("deposit_id_unique".to_string())
                        .build(),
                ),
            ),
            // Unique only when present
            (
                doc! { "tx_hash": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .sparse(true)
                        .name("tx_hash_unique".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "escrow_id": 1, "metadata.created_at": 1 },
                Some(
                    IndexOptions::builder()
                        .name("escrow_deposits_index".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "investor_id": 1 },
                Some(
                    IndexOptions::builder()
                        .name("investor_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for DepositDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

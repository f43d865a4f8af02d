//! Escrow document schema
//!
//! One escrow per (project, currency). The escrow is the aggregate root for
//! deposits (referenced by id) and carries the live view of milestone locks.

use bson::{doc, oid::ObjectId, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::{Metadata, MilestoneLockStatus};
use crate::types::{Amount, Currency};

/// Collection name for escrows
pub const ESCROW_COLLECTION: &str = "escrows";

/// Escrow status
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscrowStatus {
    /// Accepting deposits and milestone locks
    #[default]
    Active,
    /// Temporarily frozen by an operator
    Paused,
    /// Project wound down
    Closed,
}

impl EscrowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscrowStatus::Active => "ACTIVE",
            EscrowStatus::Paused => "PAUSED",
            EscrowStatus::Closed => "CLOSED",
        }
    }
}

/// Live view of a milestone lock, embedded in the escrow
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EmbeddedMilestoneLock {
    /// Id of the durable MilestoneLock record
    pub lock_id: String,
    pub milestone_id: String,
    pub amount: Amount,
    pub status: MilestoneLockStatus,
    pub locked_at: DateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub released_at: Option<DateTime>,
}

/// Escrow document stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct EscrowDoc {
    /// MongoDB document ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    /// Common metadata (created_at, updated_at)
    #[serde(default)]
    pub metadata: Metadata,

    /// Stable id derived from (project_id, currency)
    pub escrow_id: String,

    pub project_id: String,

    pub currency: Currency,

    /// Sum of deposit amounts still held in trust
    #[serde(default)]
    pub total_locked: Amount,

    /// Milestone reservations against this escrow
    #[serde(default)]
    pub locked_by_milestone: Vec<EmbeddedMilestoneLock>,

    /// Deposit ids attached to this escrow
    #[serde(default)]
    pub deposits: Vec<String>,

    #[serde(default)]
    pub status: EscrowStatus,
}

impl EscrowDoc {
    /// Derive the stable escrow id for a project and currency
    pub fn derive_id(project_id: &str, currency: Currency) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("escrow:{}:{}", project_id, currency.as_str()).as_bytes());
        let digest = hex::encode(hasher.finalize());
        digest[..24].to_string()
    }

    /// Create a new, empty escrow document
    pub fn new(project_id: &str, currency: Currency) -> Self {
        Self {
            _id: None,
            metadata: Metadata::new(),
            escrow_id: Self::derive_id(project_id, currency),
            project_id: project_id.to_string(),
            currency,
            total_locked: Amount::ZERO,
            locked_by_milestone: Vec::new(),
            deposits: Vec::new(),
            status: EscrowStatus::Active,
        }
    }

    /// Sum of milestone locks that are LOCKED or already RELEASED.
    ///
    /// A released payout stays counted: the funding deposits keep it inside
    /// `total_locked`, but it is no longer available to lock or refund.
    pub fn reserved_by_milestones(&self) -> Amount {
        self.locked_by_milestone
            .iter()
            .filter(|m| m.status.holds_funds())
            .fold(Amount::ZERO, |acc, m| {
                Amount::from_units(acc.units().saturating_add(m.amount.units()))
            })
    }

    /// Locked funds not reserved or paid out by a milestone
    pub fn unreserved(&self) -> Amount {
        Amount::from_units(
            self.total_locked
                .units()
                .saturating_sub(self.reserved_by_milestones().units()),
        )
    }

    /// Whether `total_locked` may move by `delta` without dipping below the
    /// milestone reservations. Increases always fit.
    pub fn can_absorb(&self, delta: Amount) -> bool {
        if !delta.is_negative() {
            return true;
        }
        self.total_locked.units().saturating_add(delta.units()) >= self.reserved_by_milestones().units()
    }
}

impl IntoIndexes for EscrowDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            // One escrow per project and currency; find-or-create relies on this
            (
                doc! { "project_id": 1, "currency": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("project_currency_unique".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "escrow_id": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("escrow_id_unique".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for EscrowDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

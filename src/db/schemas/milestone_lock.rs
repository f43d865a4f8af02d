//! Milestone lock document schema
//!
//! Durable audit record of a milestone reservation. The escrow's embedded
//! `locked_by_milestone` array is the live view of the same lock.

use bson::{doc, oid::ObjectId, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;
use crate::types::{Amount, Currency};

/// Collection name for milestone locks
pub const MILESTONE_LOCK_COLLECTION: &str = "milestone_locks";

/// Milestone lock status
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MilestoneLockStatus {
    Locked,
    Released,
    Cancelled,
}

impl MilestoneLockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MilestoneLockStatus::Locked => "LOCKED",
            MilestoneLockStatus::Released => "RELEASED",
            MilestoneLockStatus::Cancelled => "CANCELLED",
        }
    }

    /// LOCKED reserves escrow funds and RELEASED has paid them out
    pub fn holds_funds(&self) -> bool {
        !matches!(self, MilestoneLockStatus::Cancelled)
    }

    /// Only LOCKED has outgoing edges
    pub fn can_transition_to(&self, next: MilestoneLockStatus) -> bool {
        matches!(
            (self, next),
            (MilestoneLockStatus::Locked, MilestoneLockStatus::Released)
                | (MilestoneLockStatus::Locked, MilestoneLockStatus::Cancelled)
        )
    }
}

/// A recorded approval. Approvals are append-only.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MilestoneApproval {
    pub approver: String,
    pub signature: String,
    pub timestamp: DateTime,
}

/// Milestone lock document stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MilestoneLockDoc {
    /// MongoDB document ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    /// Common metadata (created_at, updated_at)
    #[serde(default)]
    pub metadata: Metadata,

    pub lock_id: String,

    pub escrow_id: String,

    pub project_id: String,

    pub milestone_id: String,

    pub currency: Currency,

    pub amount: Amount,

    pub status: MilestoneLockStatus,

    pub locked_at: DateTime,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub released_at: Option<DateTime>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime>,

    #[serde(default)]
    pub approvals: Vec<MilestoneApproval>,

    /// Settlement transaction of the payout
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_tx_hash: Option<String>,

    /// Reason given on release or cancellation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl MilestoneLockDoc {
    pub fn has_approval_from(&self, approver: &str) -> bool {
        self.approvals.iter().any(|a| a.approver == approver)
    }
}

impl IntoIndexes for MilestoneLockDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "lock_id": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("lock_id_unique".to_string())
                        .build(),
                ),
            ),
            // At most one active lock per escrow milestone
            (
                doc! { "escrow_id": 1, "milestone_id": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .partial_filter_expression(doc! { "status": "LOCKED" })
                        .name("active_milestone_unique".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "project_id": 1 },
                Some(
                    IndexOptions::builder()
                        .name("project_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for MilestoneLockDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

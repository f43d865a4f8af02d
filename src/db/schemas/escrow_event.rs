//! Escrow event log schema
//!
//! Append-only audit trail. Rows are written once and never updated.

use bson::{doc, oid::ObjectId, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::auth::Actor;
use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;

/// Collection name for escrow events
pub const ESCROW_EVENT_COLLECTION: &str = "escrow_events";

/// Event taxonomy
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscrowEventType {
    EscrowCreated,
    DepositCreated,
    DepositConfirmed,
    DepositDisputed,
    DepositReleased,
    DepositRefunded,
    DepositStatusChanged,
    MilestoneLocked,
    MilestoneApproved,
    MilestoneReleased,
    MilestoneCancelled,
    InvestmentCreated,
    InvestmentStatusChanged,
}

impl EscrowEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscrowEventType::EscrowCreated => "ESCROW_CREATED",
            EscrowEventType::DepositCreated => "DEPOSIT_CREATED",
            EscrowEventType::DepositConfirmed => "DEPOSIT_CONFIRMED",
            EscrowEventType::DepositDisputed => "DEPOSIT_DISPUTED",
            EscrowEventType::DepositReleased => "DEPOSIT_RELEASED",
            EscrowEventType::DepositRefunded => "DEPOSIT_REFUNDED",
            EscrowEventType::DepositStatusChanged => "DEPOSIT_STATUS_CHANGED",
            EscrowEventType::MilestoneLocked => "MILESTONE_LOCKED",
            EscrowEventType::MilestoneApproved => "MILESTONE_APPROVED",
            EscrowEventType::MilestoneReleased => "MILESTONE_RELEASED",
            EscrowEventType::MilestoneCancelled => "MILESTONE_CANCELLED",
            EscrowEventType::InvestmentCreated => "INVESTMENT_CREATED",
            EscrowEventType::InvestmentStatusChanged => "INVESTMENT_STATUS_CHANGED",
        }
    }
}

/// Who caused the event
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct EventActor {
    pub id: String,
    pub role: String,
}

impl From<&Actor> for EventActor {
    fn from(actor: &Actor) -> Self {
        Self {
            id: actor.id.clone(),
            role: actor.role_name(),
        }
    }
}

/// Escrow event document stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct EscrowEventDoc {
    /// MongoDB document ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    pub event_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub escrow_id: Option<String>,

    #[serde(rename = "type")]
    pub event_type: EscrowEventType,

    #[serde(default)]
    pub payload: serde_json::Value,

    /// Chain transaction this event correlates with
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,

    pub actor: EventActor,

    pub created_at: DateTime,
}

impl EscrowEventDoc {
    pub fn new(
        escrow_id: Option<String>,
        event_type: EscrowEventType,
        payload: serde_json::Value,
        tx_hash: Option<String>,
        actor: &Actor,
    ) -> Self {
        Self {
            _id: None,
            metadata: Metadata::new(),
            event_id: uuid::Uuid::new_v4().to_string(),
            escrow_id,
            event_type,
            payload,
            tx_hash,
            actor: EventActor::from(actor),
            created_at: DateTime::now(),
        }
    }
}

impl IntoIndexes for EscrowEventDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "escrow_id": 1, "created_at": 1 },
                Some(
                    IndexOptions::builder()
                        .name("escrow_chronology_index".to_string())
                        .sparse(true)
                        .build(),
                ),
            ),
            // Reconciliation lookups by chain transaction
            (
                doc! { "tx_hash": 1, "created_at": 1 },
                Some(
                    IndexOptions::builder()
                        .name("tx_hash_index".to_string())
                        .sparse(true)
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for EscrowEventDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

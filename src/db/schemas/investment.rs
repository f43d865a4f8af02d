//! Investment document schema
//!
//! The investor-facing funding record. After creation only the status
//! changes, and every change is appended to `status_history`.

use bson::{doc, oid::ObjectId, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;
use crate::types::{Amount, Currency, LedgerError};

/// Collection name for investments
pub const INVESTMENT_COLLECTION: &str = "investments";

/// Investment status
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InvestmentStatus {
    Pending,
    Active,
    Completed,
    Refunded,
}

impl InvestmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvestmentStatus::Pending => "Pending",
            InvestmentStatus::Active => "Active",
            InvestmentStatus::Completed => "Completed",
            InvestmentStatus::Refunded => "Refunded",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InvestmentStatus::Completed | InvestmentStatus::Refunded)
    }

    /// Pending -> {Active, Refunded}; Active -> {Completed, Refunded}
    pub fn can_transition_to(&self, next: InvestmentStatus) -> bool {
        use InvestmentStatus::*;
        matches!(
            (self, next),
            (Pending, Active) | (Pending, Refunded) | (Active, Completed) | (Active, Refunded)
        )
    }
}

impl std::str::FromStr for InvestmentStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(InvestmentStatus::Pending),
            "active" => Ok(InvestmentStatus::Active),
            "completed" => Ok(InvestmentStatus::Completed),
            "refunded" => Ok(InvestmentStatus::Refunded),
            other => Err(LedgerError::BadRequest(format!(
                "unknown investment status '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for InvestmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of the status path
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StatusChange {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<InvestmentStatus>,
    pub to: InvestmentStatus,
    pub at: DateTime,
    pub by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
}

/// Investment document stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct InvestmentDoc {
    /// MongoDB document ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    pub investment_id: String,

    pub project_id: String,

    pub investor_id: String,

    pub amount: Amount,

    pub currency: Currency,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub nft_id: Option<String>,

    /// Chain transaction of the original deposit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,

    pub status: InvestmentStatus,

    /// Escrow deposit backing this investment
    pub deposit_id: String,

    pub escrow_id: String,

    #[serde(default)]
    pub status_history: Vec<StatusChange>,
}

impl InvestmentDoc {
    /// Create a Pending investment with its initial history entry
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        project_id: &str,
        investor_id: &str,
        amount: Amount,
        currency: Currency,
        nft_id: Option<String>,
        tx_hash: Option<String>,
        deposit_id: String,
        escrow_id: String,
    ) -> Self {
        let now = DateTime::now();
        Self {
            _id: None,
            metadata: Metadata::new(),
            investment_id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            investor_id: investor_id.to_string(),
            amount,
            currency,
            nft_id,
            tx_hash: tx_hash.clone(),
            status: InvestmentStatus::Pending,
            deposit_id,
            escrow_id,
            status_history: vec![StatusChange {
                from: None,
                to: InvestmentStatus::Pending,
                at: now,
                by: investor_id.to_string(),
                reason: None,
                tx_hash,
            }],
        }
    }
}

impl IntoIndexes for InvestmentDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "investment_id": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("investment_id_unique".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "project_id": 1, "metadata.created_at": 1 },
                Some(
                    IndexOptions::builder()
                        .name("project_investments_index".to_string())
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
            // Each deposit backs at most one investment
            (
                doc! { "deposit_id": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("deposit_id_unique".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for InvestmentDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use InvestmentStatus::*;

    #[test]
    fn test_allowed_edges() {
        assert!(Pending.can_transition_to(Active));
        assert!(Pending.can_transition_to(Refunded));
        assert!(Active.can_transition_to(Completed));
        assert!(Active.can_transition_to(Refunded));
    }

    #[test]
    fn test_skipping_active_is_rejected() {
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Refunded));
        assert!(!Refunded.can_transition_to(Active));
        assert!(!Active.can_transition_to(Active));
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(serde_json::to_string(&Pending).unwrap(), "\"Pending\"");
        assert_eq!("ACTIVE".parse::<InvestmentStatus>().unwrap(), Active);
        assert!("done".parse::<InvestmentStatus>().is_err());
    }

    #[test]
    fn test_new_investment_starts_pending() {
        let inv = InvestmentDoc::new(
            "p1",
            "investor-1",
            Amount::from_units(100),
            Currency::Usdc,
            None,
            Some("0xabc".into()),
            "d1".into(),
            "e1".into(),
        );
        assert_eq!(inv.status, Pending);
        assert_eq!(inv.status_history.len(), 1);
        assert_eq!(inv.status_history[0].from, None);
    }
}

//! Treasury wallet and transaction schemas
//!
//! The wallet is a singleton balance record; transactions are the
//! append-only history of every balance-affecting action.

use bson::{doc, oid::ObjectId, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;
use crate::types::{Amount, LedgerError, Result};

/// Collection name for the treasury wallet
pub const TREASURY_WALLET_COLLECTION: &str = "treasury_wallets";

/// Collection name for treasury transactions
pub const TREASURY_TRANSACTION_COLLECTION: &str = "treasury_transactions";

/// Key of the singleton wallet document
pub const TREASURY_WALLET_ID: &str = "platform";

/// Treasury transaction type
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TreasuryTxType {
    Fee,
    Donation,
    Withdrawal,
    Distribution,
    Refund,
    Reserve,
}

impl TreasuryTxType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TreasuryTxType::Fee => "FEE",
            TreasuryTxType::Donation => "DONATION",
            TreasuryTxType::Withdrawal => "WITHDRAWAL",
            TreasuryTxType::Distribution => "DISTRIBUTION",
            TreasuryTxType::Refund => "REFUND",
            TreasuryTxType::Reserve => "RESERVE",
        }
    }

    pub const ALL: [TreasuryTxType; 6] = [
        TreasuryTxType::Fee,
        TreasuryTxType::Donation,
        TreasuryTxType::Withdrawal,
        TreasuryTxType::Distribution,
        TreasuryTxType::Refund,
        TreasuryTxType::Reserve,
    ];

    /// Sign of this type's effect on `total_balance`
    pub fn total_sign(&self) -> i64 {
        match self {
            TreasuryTxType::Fee | TreasuryTxType::Donation => 1,
            TreasuryTxType::Withdrawal | TreasuryTxType::Refund => -1,
            TreasuryTxType::Distribution | TreasuryTxType::Reserve => 0,
        }
    }
}

impl std::str::FromStr for TreasuryTxType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "FEE" => Ok(TreasuryTxType::Fee),
            "DONATION" => Ok(TreasuryTxType::Donation),
            "WITHDRAWAL" => Ok(TreasuryTxType::Withdrawal),
            "DISTRIBUTION" => Ok(TreasuryTxType::Distribution),
            "REFUND" => Ok(TreasuryTxType::Refund),
            "RESERVE" => Ok(TreasuryTxType::Reserve),
            other => Err(LedgerError::BadRequest(format!(
                "unknown treasury transaction type '{}'",
                other
            ))),
        }
    }
}

/// Signed change to the three wallet balances
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BalanceDelta {
    pub total: Amount,
    pub available: Amount,
    pub reserved: Amount,
}

impl BalanceDelta {
    /// Funds entering the treasury
    pub fn credit(amount: Amount) -> Self {
        Self {
            total: amount,
            available: amount,
            reserved: Amount::ZERO,
        }
    }

    /// Funds leaving the treasury
    pub fn debit(amount: Amount) -> Self {
        Self {
            total: amount.neg(),
            available: amount.neg(),
            reserved: Amount::ZERO,
        }
    }

    /// Spend available funds without touching the recorded total
    pub fn spend_available(amount: Amount) -> Self {
        Self {
            total: Amount::ZERO,
            available: amount.neg(),
            reserved: Amount::ZERO,
        }
    }

    /// Move available funds into the reserve (negative amounts move them back)
    pub fn reserve(amount: Amount) -> Self {
        Self {
            total: Amount::ZERO,
            available: amount.neg(),
            reserved: amount,
        }
    }
}

/// Singleton treasury wallet document
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TreasuryWalletDoc {
    /// MongoDB document ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    pub wallet_id: String,

    #[serde(default)]
    pub total_balance: Amount,

    #[serde(default)]
    pub available_balance: Amount,

    #[serde(default)]
    pub reserved_balance: Amount,
}

impl Default for TreasuryWalletDoc {
    fn default() -> Self {
        Self {
            _id: None,
            metadata: Metadata::new(),
            wallet_id: TREASURY_WALLET_ID.to_string(),
            total_balance: Amount::ZERO,
            available_balance: Amount::ZERO,
            reserved_balance: Amount::ZERO,
        }
    }
}

impl TreasuryWalletDoc {
    /// Compute the balances after a delta. Fails without side effects if any
    /// resulting balance would be negative.
    pub fn apply_delta(&self, delta: &BalanceDelta) -> Result<TreasuryWalletDoc> {
        let total = self.total_balance.checked_add(delta.total)?;
        let available = self.available_balance.checked_add(delta.available)?;
        let reserved = self.reserved_balance.checked_add(delta.reserved)?;

        if total.is_negative() || available.is_negative() || reserved.is_negative() {
            return Err(LedgerError::InsufficientBalance(format!(
                "treasury would become total={} available={} reserved={}",
                total, available, reserved
            )));
        }

        let mut next = self.clone();
        next.total_balance = total;
        next.available_balance = available;
        next.reserved_balance = reserved;
        next.metadata.touch();
        Ok(next)
    }
}

impl IntoIndexes for TreasuryWalletDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "wallet_id": 1 },
            Some(
                IndexOptions::builder()
                    .unique(true)
                    .name("wallet_id_unique".to_string())
                    .build(),
            ),
        )]
    }
}

impl MutMetadata for TreasuryWalletDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

/// Treasury transaction document (append-only)
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TreasuryTransactionDoc {
    /// MongoDB document ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    pub transaction_id: String,

    #[serde(rename = "type")]
    pub tx_type: TreasuryTxType,

    pub amount: Amount,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub initiated_by: Option<String>,

    /// Free-form details (recipients, destination wallet, notes)
    #[serde(default)]
    pub details: serde_json::Value,

    pub created_at: DateTime,
}

impl TreasuryTransactionDoc {
    pub fn new(
        tx_type: TreasuryTxType,
        amount: Amount,
        tx_hash: Option<String>,
        initiated_by: Option<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            _id: None,
            metadata: Metadata::new(),
            transaction_id: uuid::Uuid::new_v4().to_string(),
            tx_type,
            amount,
            tx_hash,
            initiated_by,
            details,
            created_at: DateTime::now(),
        }
    }

    /// This transaction's signed contribution to `total_balance`
    pub fn signed_total_effect(&self) -> i64 {
        self.amount.units() * self.tx_type.total_sign()
    }
}

impl IntoIndexes for TreasuryTransactionDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "transaction_id": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("transaction_id_unique".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "type": 1, "created_at": -1 },
                Some(
                    IndexOptions::builder()
                        .name("type_created_index".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "tx_hash": 1 },
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

impl MutMetadata for TreasuryTransactionDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

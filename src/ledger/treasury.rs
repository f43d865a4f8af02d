//! Treasury wallet
//!
//! The platform's own balance ledger, separate from investor escrow. Every
//! operation records one append-only `TreasuryTransactionDoc` and applies one
//! `BalanceDelta` to the singleton wallet; the store rejects any delta that
//! would take a balance below zero and applies nothing in that case.
//!
//! Operations that call chain settlement check the balance first, so a
//! withdrawal that could never be booked is never submitted.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use tracing::{error, info, warn};

use crate::auth::{Actor, Capability, CapabilityTable};
use crate::db::schemas::{BalanceDelta, TreasuryTransactionDoc, TreasuryTxType, TreasuryWalletDoc};
use crate::services::{ChainRecipient, ChainSettlement, DistributionRequest, WithdrawRequest};
use crate::store::{LedgerStore, Page, Paginated, TreasuryTxFilter};
use crate::types::{Amount, LedgerError, Result};

// ============================================================================
// Inputs and projections
// ============================================================================

/// Withdrawal input. With a destination and no tx hash the withdrawal is
/// submitted to chain settlement.
#[derive(Debug, Clone, Default)]
pub struct Withdrawal {
    pub amount: Amount,
    pub destination: Option<String>,
    pub tx_hash: Option<String>,
    pub note: Option<String>,
}

/// One payee of a distribution
#[derive(Debug, Clone)]
pub struct Recipient {
    pub recipient_id: String,
    pub wallet: Option<String>,
    pub amount: Amount,
}

/// Totals of one transaction type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeTotal {
    pub tx_type: TreasuryTxType,
    pub amount: Amount,
    pub count: u64,
}

/// Calendar-month bucket of the summary series
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonthBucket {
    /// `YYYY-MM`
    pub month: String,
    pub fees: Amount,
    pub donations: Amount,
    pub distributions: Amount,
}

impl MonthBucket {
    fn new(month: String) -> Self {
        Self {
            month,
            fees: Amount::ZERO,
            donations: Amount::ZERO,
            distributions: Amount::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TreasurySummary {
    pub balance: TreasuryWalletDoc,
    pub totals: Vec<TypeTotal>,
    pub transaction_count: u64,
    /// Ordered by month
    pub monthly: Vec<MonthBucket>,
}

// ============================================================================
// Wallet
// ============================================================================

pub struct TreasuryWallet {
    store: Arc<dyn LedgerStore>,
    chain: Arc<dyn ChainSettlement>,
    capabilities: Arc<CapabilityTable>,
}

impl TreasuryWallet {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        chain: Arc<dyn ChainSettlement>,
        capabilities: Arc<CapabilityTable>,
    ) -> Self {
        Self {
            store,
            chain,
            capabilities,
        }
    }

    pub async fn record_fee(
        &self,
        amount: Amount,
        tx_hash: Option<String>,
        details: serde_json::Value,
        actor: &Actor,
    ) -> Result<TreasuryTransactionDoc> {
        actor.require(&self.capabilities, Capability::TreasuryRecord)?;
        amount.ensure_positive()?;
        self.commit(TreasuryTxType::Fee, amount, tx_hash, details, BalanceDelta::credit(amount), actor)
            .await
    }

    pub async fn record_donation(
        &self,
        amount: Amount,
        tx_hash: Option<String>,
        details: serde_json::Value,
        actor: &Actor,
    ) -> Result<TreasuryTransactionDoc> {
        actor.require(&self.capabilities, Capability::TreasuryRecord)?;
        amount.ensure_positive()?;
        self.commit(TreasuryTxType::Donation, amount, tx_hash, details, BalanceDelta::credit(amount), actor)
            .await
    }

    /// Take funds out of the treasury (total and available decrease)
    pub async fn withdraw(&self, withdrawal: Withdrawal, actor: &Actor) -> Result<TreasuryTransactionDoc> {
        actor.require(&self.capabilities, Capability::TreasuryWrite)?;
        let amount = withdrawal.amount.ensure_positive()?;
        let delta = BalanceDelta::debit(amount);
        self.precheck(&delta).await?;

        let (tx_hash, submitted) = match (withdrawal.tx_hash, &withdrawal.destination) {
            (Some(hash), _) => (Some(hash), false),
            (None, Some(destination)) => {
                let receipt = self
                    .chain
                    .admin_withdraw(&WithdrawRequest {
                        destination: destination.clone(),
                        amount,
                    })
                    .await?
                    .ensure_confirmed("withdraw")?;
                (Some(receipt.tx_hash), true)
            }
            (None, None) => (None, false),
        };

        let details = json!({
            "destination": withdrawal.destination,
            "note": withdrawal.note,
        });
        self.commit_after_chain(TreasuryTxType::Withdrawal, amount, tx_hash, details, delta, submitted, actor)
            .await
    }

    /// Pay several recipients out of available funds.
    ///
    /// The recorded total is left alone until the distribution is reconciled.
    pub async fn distribute(
        &self,
        recipients: Vec<Recipient>,
        tx_hash: Option<String>,
        actor: &Actor,
    ) -> Result<TreasuryTransactionDoc> {
        actor.require(&self.capabilities, Capability::TreasuryWrite)?;
        if recipients.is_empty() {
            return Err(LedgerError::BadRequest("at least one recipient is required".into()));
        }
        for recipient in &recipients {
            if recipient.recipient_id.trim().is_empty() {
                return Err(LedgerError::BadRequest("recipient id is required".into()));
            }
            recipient.amount.ensure_positive()?;
        }
        let total = Amount::sum(recipients.iter().map(|r| r.amount))?;
        let delta = BalanceDelta::spend_available(total);
        self.precheck(&delta).await?;

        let on_chain: Vec<ChainRecipient> = recipients
            .iter()
            .filter_map(|r| {
                r.wallet.as_ref().map(|wallet| ChainRecipient {
                    wallet: wallet.clone(),
                    amount: r.amount,
                })
            })
            .collect();

        let (tx_hash, submitted) = match tx_hash {
            Some(hash) => (Some(hash), false),
            None if !on_chain.is_empty() => {
                let receipt = self
                    .chain
                    .distribute_funds(&DistributionRequest { recipients: on_chain })
                    .await?
                    .ensure_confirmed("distribute")?;
                (Some(receipt.tx_hash), true)
            }
            None => (None, false),
        };

        let details = json!({
            "recipients": recipients
                .iter()
                .map(|r| json!({
                    "recipientId": r.recipient_id,
                    "wallet": r.wallet,
                    "amount": r.amount.to_string(),
                }))
                .collect::<Vec<_>>(),
        });
        self.commit_after_chain(TreasuryTxType::Distribution, total, tx_hash, details, delta, submitted, actor)
            .await
    }

    /// Move available funds into the reserve
    pub async fn reserve(&self, amount: Amount, note: Option<String>, actor: &Actor) -> Result<TreasuryTransactionDoc> {
        actor.require(&self.capabilities, Capability::TreasuryWrite)?;
        amount.ensure_positive()?;
        self.commit(
            TreasuryTxType::Reserve,
            amount,
            None,
            json!({ "direction": "reserve", "note": note }),
            BalanceDelta::reserve(amount),
            actor,
        )
        .await
    }

    /// Move reserved funds back to available
    pub async fn release_reserve(
        &self,
        amount: Amount,
        note: Option<String>,
        actor: &Actor,
    ) -> Result<TreasuryTransactionDoc> {
        actor.require(&self.capabilities, Capability::TreasuryWrite)?;
        amount.ensure_positive()?;
        self.commit(
            TreasuryTxType::Reserve,
            amount,
            None,
            json!({ "direction": "release", "note": note }),
            BalanceDelta::reserve(amount.neg()),
            actor,
        )
        .await
    }

    /// Refund paid out of treasury funds
    pub async fn record_refund(
        &self,
        amount: Amount,
        tx_hash: Option<String>,
        reason: Option<String>,
        actor: &Actor,
    ) -> Result<TreasuryTransactionDoc> {
        actor.require(&self.capabilities, Capability::TreasuryWrite)?;
        amount.ensure_positive()?;
        self.commit(
            TreasuryTxType::Refund,
            amount,
            tx_hash,
            json!({ "reason": reason }),
            BalanceDelta::debit(amount),
            actor,
        )
        .await
    }

    pub async fn get_balance(&self, actor: &Actor) -> Result<TreasuryWalletDoc> {
        actor.require(&self.capabilities, Capability::TreasuryRead)?;
        self.store.get_treasury_wallet().await
    }

    /// Filtered, paginated history, newest first
    pub async fn list_transactions(
        &self,
        filter: &TreasuryTxFilter,
        page: Page,
        actor: &Actor,
    ) -> Result<Paginated<TreasuryTransactionDoc>> {
        actor.require(&self.capabilities, Capability::TreasuryRead)?;
        if let (Some(from), Some(to)) = (filter.from, filter.to) {
            if from > to {
                return Err(LedgerError::BadRequest("from must not be after to".into()));
            }
        }
        if let (Some(min), Some(max)) = (filter.min_amount, filter.max_amount) {
            if min > max {
                return Err(LedgerError::BadRequest("minAmount must not exceed maxAmount".into()));
            }
        }
        self.store.list_treasury_transactions(filter, page).await
    }

    /// Per-type totals and a month series of fees, donations and distributions
    pub async fn get_summary(&self, actor: &Actor) -> Result<TreasurySummary> {
        actor.require(&self.capabilities, Capability::TreasuryRead)?;
        let balance = self.store.get_treasury_wallet().await?;
        let transactions = self.store.all_treasury_transactions().await?;

        let mut totals: Vec<TypeTotal> = TreasuryTxType::ALL
            .iter()
            .map(|t| TypeTotal {
                tx_type: *t,
                amount: Amount::ZERO,
                count: 0,
            })
            .collect();
        let mut months: BTreeMap<String, MonthBucket> = BTreeMap::new();

        for tx in &transactions {
            if let Some(total) = totals.iter_mut().find(|t| t.tx_type == tx.tx_type) {
                total.amount = total.amount.checked_add(tx.amount)?;
                total.count += 1;
            }

            let month = tx.created_at.to_chrono().format("%Y-%m").to_string();
            let bucket = months
                .entry(month.clone())
                .or_insert_with(|| MonthBucket::new(month));
            match tx.tx_type {
                TreasuryTxType::Fee => bucket.fees = bucket.fees.checked_add(tx.amount)?,
                TreasuryTxType::Donation => bucket.donations = bucket.donations.checked_add(tx.amount)?,
                TreasuryTxType::Distribution => {
                    bucket.distributions = bucket.distributions.checked_add(tx.amount)?
                }
                _ => {}
            }
        }

        Ok(TreasurySummary {
            balance,
            totals,
            transaction_count: transactions.len() as u64,
            monthly: months.into_values().collect(),
        })
    }

    /// Fail early when the delta could not be applied right now
    async fn precheck(&self, delta: &BalanceDelta) -> Result<()> {
        let wallet = self.store.get_treasury_wallet().await?;
        wallet.apply_delta(delta).map(|_| ())
    }

    async fn commit(
        &self,
        tx_type: TreasuryTxType,
        amount: Amount,
        tx_hash: Option<String>,
        details: serde_json::Value,
        delta: BalanceDelta,
        actor: &Actor,
    ) -> Result<TreasuryTransactionDoc> {
        let tx = TreasuryTransactionDoc::new(tx_type, amount, tx_hash, Some(actor.id.clone()), details);
        let wallet = match self.store.commit_treasury(tx.clone(), delta).await {
            Ok(wallet) => wallet,
            Err(e) => {
                warn!(tx_type = tx_type.as_str(), amount = %amount, error = %e, "treasury update rejected");
                return Err(e);
            }
        };

        info!(
            transaction_id = %tx.transaction_id,
            tx_type = tx_type.as_str(),
            amount = %amount,
            tx_hash = ?tx.tx_hash,
            total = %wallet.total_balance,
            available = %wallet.available_balance,
            reserved = %wallet.reserved_balance,
            "treasury transaction recorded"
        );
        Ok(tx)
    }

    #[allow(clippy::too_many_arguments)]
    async fn commit_after_chain(
        &self,
        tx_type: TreasuryTxType,
        amount: Amount,
        tx_hash: Option<String>,
        details: serde_json::Value,
        delta: BalanceDelta,
        submitted: bool,
        actor: &Actor,
    ) -> Result<TreasuryTransactionDoc> {
        let hash = tx_hash.clone();
        let result = self.commit(tx_type, amount, tx_hash, details, delta, actor).await;
        if let (Err(e), true, Some(hash)) = (&result, submitted, hash) {
            error!(
                tx_type = tx_type.as_str(),
                tx_hash = %hash,
                amount = %amount,
                error = %e,
                "settled on chain but not booked in treasury; needs reconciliation"
            );
        }
        result
    }
}

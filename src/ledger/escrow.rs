//! Escrow ledger
//!
//! Owns escrow creation, deposit attachment, `total_locked` maintenance and
//! the deposit status lifecycle. `total_locked` always equals the sum of the
//! deposits that have not left trust: entering RELEASED or REFUNDED moves the
//! total down in the same store step as the status change. That step is
//! refused when the remaining total would not cover the milestone locks.

use std::sync::Arc;

use serde_json::json;
use tracing::{error, info, warn};

use super::events::EventLog;
use crate::auth::{Actor, Capability, CapabilityTable};
use crate::db::schemas::{
    DepositDoc, DepositSource, DepositStatus, DepositStatusExtra, EscrowDoc, EscrowEventDoc,
    EscrowEventType, EscrowStatus, Metadata, MilestoneLockDoc,
};
use crate::services::{ChainSettlement, RefundRequest, ReleaseRequest};
use crate::store::{reservation_shortfall, LedgerStore};
use crate::types::{Amount, Currency, LedgerError, Result};

// ============================================================================
// Types
// ============================================================================

/// Deposit creation input
#[derive(Debug, Clone)]
pub struct NewDeposit {
    pub project_id: String,
    pub investor_id: String,
    pub amount: Amount,
    pub currency: Currency,
    pub source: DepositSource,
    pub tx_hash: Option<String>,
    pub provider_tx_id: Option<String>,
    pub nft_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Result of a deposit creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositReceipt {
    pub success: bool,
    pub deposit_id: String,
    pub escrow_id: String,
    pub status: DepositStatus,
}

/// An escrow with its deposits and milestone locks resolved
#[derive(Debug, Clone)]
pub struct EscrowView {
    pub escrow: EscrowDoc,
    pub deposits: Vec<DepositDoc>,
    pub milestone_locks: Vec<MilestoneLockDoc>,
}

// ============================================================================
// Escrow ledger
// ============================================================================

pub struct EscrowLedger {
    store: Arc<dyn LedgerStore>,
    chain: Arc<dyn ChainSettlement>,
    events: EventLog,
    capabilities: Arc<CapabilityTable>,
}

impl EscrowLedger {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        chain: Arc<dyn ChainSettlement>,
        events: EventLog,
        capabilities: Arc<CapabilityTable>,
    ) -> Self {
        Self {
            store,
            chain,
            events,
            capabilities,
        }
    }

    /// Idempotent: the same (project, currency) always yields the same escrow
    pub async fn find_or_create_escrow(
        &self,
        project_id: &str,
        currency: Currency,
        actor: &Actor,
    ) -> Result<EscrowDoc> {
        if project_id.trim().is_empty() {
            return Err(LedgerError::BadRequest("projectId is required".into()));
        }

        let (escrow, created) = self.store.find_or_create_escrow(project_id, currency).await?;
        if created {
            info!(
                escrow_id = %escrow.escrow_id,
                project_id,
                currency = %currency,
                "escrow created"
            );
            self.events
                .record(
                    Some(&escrow.escrow_id),
                    EscrowEventType::EscrowCreated,
                    json!({ "projectId": project_id, "currency": currency.as_str() }),
                    None,
                    actor,
                )
                .await?;
        }
        Ok(escrow)
    }

    /// Record a deposit against the project's escrow.
    ///
    /// ONCHAIN deposits carrying a tx hash are verified with the settlement
    /// collaborator before anything is written.
    pub async fn create_deposit(&self, deposit: NewDeposit, actor: &Actor) -> Result<DepositReceipt> {
        if !actor.has(&self.capabilities, Capability::Invest) {
            actor.require(&self.capabilities, Capability::ManageEscrow)?;
        }
        validate_new_deposit(&deposit)?;

        if deposit.source == DepositSource::Onchain {
            if let Some(hash) = &deposit.tx_hash {
                self.chain
                    .verify_deposit_tx(hash)
                    .await?
                    .ensure_confirmed("verify-deposit")?;
            }
        }

        self.record_verified_deposit(deposit, actor).await
    }

    /// Deposit path for callers that obtained the tx hash from settlement themselves
    pub(crate) async fn record_verified_deposit(
        &self,
        deposit: NewDeposit,
        actor: &Actor,
    ) -> Result<DepositReceipt> {
        validate_new_deposit(&deposit)?;

        let escrow = self
            .find_or_create_escrow(&deposit.project_id, deposit.currency, actor)
            .await?;
        if escrow.status != EscrowStatus::Active {
            return Err(LedgerError::InvalidProjectState(format!(
                "escrow {} is {}",
                escrow.escrow_id,
                escrow.status.as_str()
            )));
        }

        let doc = DepositDoc {
            _id: None,
            metadata: Metadata::new(),
            deposit_id: uuid::Uuid::new_v4().to_string(),
            escrow_id: escrow.escrow_id.clone(),
            project_id: deposit.project_id,
            investor_id: deposit.investor_id,
            amount: deposit.amount,
            currency: deposit.currency,
            source: deposit.source,
            tx_hash: deposit.tx_hash,
            provider_tx_id: deposit.provider_tx_id,
            nft_id: deposit.nft_id,
            status: DepositStatus::Pending,
            status_reason: None,
            resolution_tx_hash: None,
            status_changed_at: None,
            details: deposit.metadata,
        };

        let event = EscrowEventDoc::new(
            Some(escrow.escrow_id.clone()),
            EscrowEventType::DepositCreated,
            json!({
                "depositId": doc.deposit_id,
                "investorId": doc.investor_id,
                "amount": doc.amount.to_string(),
                "currency": doc.currency.as_str(),
                "source": doc.source,
            }),
            doc.tx_hash.clone(),
            actor,
        );

        let stored = self.store.record_deposit(doc, event).await?;
        info!(
            deposit_id = %stored.deposit_id,
            escrow_id = %stored.escrow_id,
            amount = %stored.amount,
            currency = %stored.currency,
            "deposit recorded"
        );

        Ok(DepositReceipt {
            success: true,
            deposit_id: stored.deposit_id,
            escrow_id: stored.escrow_id,
            status: stored.status,
        })
    }

    /// Raw status change. Checks the edge set but never adjusts `total_locked`.
    pub async fn mark_deposit_status(
        &self,
        deposit_id: &str,
        status: DepositStatus,
        extra: DepositStatusExtra,
        actor: &Actor,
    ) -> Result<DepositDoc> {
        actor.require(&self.capabilities, Capability::ManageEscrow)?;
        let deposit = self.load_deposit(deposit_id).await?;
        ensure_edge(&deposit, status)?;
        if status == DepositStatus::Refunded {
            self.ensure_not_investment_backed(&deposit).await?;
        }

        let updated = self
            .store
            .transition_deposit(deposit_id, deposit.status, status, &extra, Amount::ZERO)
            .await?;
        self.log_transition(&deposit, &updated, EscrowEventType::DepositStatusChanged, &extra, actor)
            .await?;
        Ok(updated)
    }

    /// PENDING / PENDING_TX -> CONFIRMED
    pub async fn confirm_deposit(&self, deposit_id: &str, actor: &Actor) -> Result<DepositDoc> {
        actor.require(&self.capabilities, Capability::ManageEscrow)?;
        self.transition(
            deposit_id,
            DepositStatus::Confirmed,
            DepositStatusExtra::default(),
            EscrowEventType::DepositConfirmed,
            actor,
        )
        .await
    }

    /// Freeze a deposit pending resolution
    pub async fn dispute_deposit(
        &self,
        deposit_id: &str,
        reason: Option<String>,
        actor: &Actor,
    ) -> Result<DepositDoc> {
        actor.require(&self.capabilities, Capability::ManageEscrow)?;
        self.transition(
            deposit_id,
            DepositStatus::Disputed,
            DepositStatusExtra {
                reason,
                resolution_tx_hash: None,
            },
            EscrowEventType::DepositDisputed,
            actor,
        )
        .await
    }

    /// Pay a deposit out to the project; funds leave trust
    pub async fn release_deposit(
        &self,
        deposit_id: &str,
        reason: Option<String>,
        actor: &Actor,
    ) -> Result<DepositDoc> {
        actor.require(&self.capabilities, Capability::ManageEscrow)?;
        let deposit = self.load_deposit(deposit_id).await?;
        ensure_edge(&deposit, DepositStatus::Released)?;
        self.ensure_can_leave(&deposit).await?;

        let resolution_tx_hash = if deposit.source == DepositSource::Onchain {
            let receipt = self
                .chain
                .release_onchain(&ReleaseRequest {
                    project_id: deposit.project_id.clone(),
                    escrow_id: deposit.escrow_id.clone(),
                    milestone_id: None,
                    deposit_id: Some(deposit.deposit_id.clone()),
                    amount: deposit.amount,
                    currency: deposit.currency,
                })
                .await?
                .ensure_confirmed("release")?;
            Some(receipt.tx_hash)
        } else {
            None
        };

        self.transition(
            deposit_id,
            DepositStatus::Released,
            DepositStatusExtra {
                reason,
                resolution_tx_hash,
            },
            EscrowEventType::DepositReleased,
            actor,
        )
        .await
    }

    /// Return a deposit to its investor; funds leave trust.
    ///
    /// ONCHAIN deposits are refunded through settlement first. Deposits
    /// backing an investment are refunded through the investment instead.
    pub async fn refund_deposit(
        &self,
        deposit_id: &str,
        reason: Option<String>,
        actor: &Actor,
    ) -> Result<DepositDoc> {
        actor.require(&self.capabilities, Capability::ManageEscrow)?;
        let deposit = self.load_deposit(deposit_id).await?;
        ensure_edge(&deposit, DepositStatus::Refunded)?;
        self.ensure_not_investment_backed(&deposit).await?;
        self.ensure_can_leave(&deposit).await?;

        let resolution_tx_hash = if deposit.source == DepositSource::Onchain {
            let receipt = self
                .chain
                .refund_onchain(&refund_request(&deposit))
                .await?
                .ensure_confirmed("refund")?;
            Some(receipt.tx_hash)
        } else {
            None
        };

        self.settle_refund(deposit_id, reason, resolution_tx_hash, actor).await
    }

    /// Book a refund whose settlement (if any) already happened
    pub(crate) async fn settle_refund(
        &self,
        deposit_id: &str,
        reason: Option<String>,
        resolution_tx_hash: Option<String>,
        actor: &Actor,
    ) -> Result<DepositDoc> {
        let result = self
            .transition(
                deposit_id,
                DepositStatus::Refunded,
                DepositStatusExtra {
                    reason,
                    resolution_tx_hash: resolution_tx_hash.clone(),
                },
                EscrowEventType::DepositRefunded,
                actor,
            )
            .await;

        if let (Err(e), Some(hash)) = (&result, &resolution_tx_hash) {
            error!(
                deposit_id,
                tx_hash = %hash,
                error = %e,
                "refund settled on chain but not booked; needs reconciliation"
            );
        }
        result
    }

    pub async fn get_deposit(&self, deposit_id: &str) -> Result<DepositDoc> {
        self.load_deposit(deposit_id).await
    }

    /// Escrow of a project with deposits and locks resolved. Without a
    /// currency the project's earliest escrow is returned.
    pub async fn get_escrow_by_project(
        &self,
        project_id: &str,
        currency: Option<Currency>,
    ) -> Result<Option<EscrowView>> {
        let escrow = match currency {
            Some(currency) => self.store.get_escrow(&EscrowDoc::derive_id(project_id, currency)).await?,
            None => self.store.escrows_for_project(project_id).await?.into_iter().next(),
        };

        match escrow {
            Some(escrow) => Ok(Some(self.resolve(escrow).await?)),
            None => Ok(None),
        }
    }

    pub async fn get_escrow(&self, escrow_id: &str) -> Result<Option<EscrowView>> {
        match self.store.get_escrow(escrow_id).await? {
            Some(escrow) => Ok(Some(self.resolve(escrow).await?)),
            None => Ok(None),
        }
    }

    /// Ordered ledger events sharing a chain transaction hash
    pub async fn get_events_by_tx_hash(&self, tx_hash: &str) -> Result<Vec<EscrowEventDoc>> {
        self.events.by_tx_hash(tx_hash).await
    }

    async fn resolve(&self, escrow: EscrowDoc) -> Result<EscrowView> {
        let deposits = self.store.deposits_for_escrow(&escrow.escrow_id).await?;
        let milestone_locks = self.store.milestone_locks_for_escrow(&escrow.escrow_id).await?;
        Ok(EscrowView {
            escrow,
            deposits,
            milestone_locks,
        })
    }

    /// Settlement pre-check; the store re-checks atomically when booking
    pub(crate) async fn ensure_can_leave(&self, deposit: &DepositDoc) -> Result<()> {
        let escrow = self
            .store
            .get_escrow(&deposit.escrow_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("escrow {}", deposit.escrow_id)))?;
        if escrow.can_absorb(deposit.amount.neg()) {
            Ok(())
        } else {
            Err(reservation_shortfall(&escrow, &deposit.deposit_id))
        }
    }

    /// Deposits booked for an investment leave escrow only through it
    async fn ensure_not_investment_backed(&self, deposit: &DepositDoc) -> Result<()> {
        match self.store.investment_for_deposit(&deposit.deposit_id).await? {
            Some(investment) => Err(LedgerError::InvalidTransition(format!(
                "deposit {} backs investment {}; refund the investment instead",
                deposit.deposit_id, investment.investment_id
            ))),
            None => Ok(()),
        }
    }

    async fn load_deposit(&self, deposit_id: &str) -> Result<DepositDoc> {
        self.store
            .get_deposit(deposit_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("deposit {}", deposit_id)))
    }

    /// Invariant-preserving transition: leaving trust decrements `total_locked`
    pub(crate) async fn transition(
        &self,
        deposit_id: &str,
        to: DepositStatus,
        extra: DepositStatusExtra,
        event_type: EscrowEventType,
        actor: &Actor,
    ) -> Result<DepositDoc> {
        let deposit = self.load_deposit(deposit_id).await?;
        ensure_edge(&deposit, to)?;

        let locked_delta = if to.exits_escrow() {
            deposit.amount.neg()
        } else {
            Amount::ZERO
        };

        let updated = self
            .store
            .transition_deposit(deposit_id, deposit.status, to, &extra, locked_delta)
            .await?;
        self.log_transition(&deposit, &updated, event_type, &extra, actor).await?;
        Ok(updated)
    }

    async fn log_transition(
        &self,
        before: &DepositDoc,
        after: &DepositDoc,
        event_type: EscrowEventType,
        extra: &DepositStatusExtra,
        actor: &Actor,
    ) -> Result<()> {
        info!(
            deposit_id = %after.deposit_id,
            escrow_id = %after.escrow_id,
            from = before.status.as_str(),
            to = after.status.as_str(),
            "deposit status changed"
        );

        let recorded = self
            .events
            .record(
                Some(&after.escrow_id),
                event_type,
                json!({
                    "depositId": after.deposit_id,
                    "from": before.status.as_str(),
                    "to": after.status.as_str(),
                    "amount": after.amount.to_string(),
                    "reason": extra.reason,
                }),
                extra.resolution_tx_hash.as_deref(),
                actor,
            )
            .await;

        if let Err(e) = &recorded {
            warn!(deposit_id = %after.deposit_id, error = %e, "status changed but event not recorded");
        }
        recorded.map(|_| ())
    }
}

fn validate_new_deposit(deposit: &NewDeposit) -> Result<()> {
    if deposit.project_id.trim().is_empty() {
        return Err(LedgerError::BadRequest("projectId is required".into()));
    }
    if deposit.investor_id.trim().is_empty() {
        return Err(LedgerError::BadRequest("investorId is required".into()));
    }
    deposit.amount.ensure_positive()?;
    if let Some(hash) = &deposit.tx_hash {
        if hash.trim().is_empty() {
            return Err(LedgerError::BadRequest("txHash must not be empty".into()));
        }
    }
    Ok(())
}

fn ensure_edge(deposit: &DepositDoc, to: DepositStatus) -> Result<()> {
    if deposit.status.can_transition_to(to) {
        Ok(())
    } else {
        Err(LedgerError::InvalidTransition(format!(
            "deposit {} cannot move from {} to {}",
            deposit.deposit_id,
            deposit.status.as_str(),
            to.as_str()
        )))
    }
}

pub(crate) fn refund_request(deposit: &DepositDoc) -> RefundRequest {
    RefundRequest {
        project_id: deposit.project_id.clone(),
        escrow_id: deposit.escrow_id.clone(),
        deposit_id: deposit.deposit_id.clone(),
        investor_id: deposit.investor_id.clone(),
        amount: deposit.amount,
        currency: deposit.currency,
    }
}

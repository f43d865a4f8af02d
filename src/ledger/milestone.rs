//! Milestone lock manager
//!
//! Reserves a slice of a project's escrow for a milestone payout. A lock is a
//! reservation inside `total_locked`, so locking, cancelling and releasing
//! never move the escrow total themselves. A released lock keeps its amount
//! reserved: the payout is gone and cannot be locked or refunded again.
//!
//! Release is gated twice: the approval quorum of the configured
//! `ApprovalPolicy`, and an approved verification decision from the project
//! service.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;
use tracing::{error, info};

use super::events::EventLog;
use crate::auth::{Actor, Capability, CapabilityTable};
use crate::db::schemas::{
    EscrowDoc, EscrowEventType, EscrowStatus, Metadata, MilestoneApproval, MilestoneLockDoc,
    MilestoneLockStatus, VerificationDecision,
};
use crate::services::{ChainSettlement, ProjectService, ReleaseRequest};
use crate::store::LedgerStore;
use crate::types::{Amount, Currency, LedgerError, Result};

// ============================================================================
// Approval policy
// ============================================================================

/// N-of-M signer policy for milestone releases
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalPolicy {
    /// Distinct approvals required before release
    pub quorum: usize,
    /// Allowed approvers; empty means any holder of `ApproveMilestone`
    pub signers: HashSet<String>,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            quorum: 1,
            signers: HashSet::new(),
        }
    }
}

impl ApprovalPolicy {
    pub fn new(quorum: usize, signers: impl IntoIterator<Item = String>) -> Self {
        Self {
            quorum: quorum.max(1),
            signers: signers.into_iter().collect(),
        }
    }

    pub fn may_approve(&self, approver: &str) -> bool {
        self.signers.is_empty() || self.signers.contains(approver)
    }

    /// Count approvals from eligible signers only
    pub fn is_met(&self, approvals: &[MilestoneApproval]) -> bool {
        self.counted(approvals) >= self.quorum
    }

    fn counted(&self, approvals: &[MilestoneApproval]) -> usize {
        approvals
            .iter()
            .filter(|a| self.may_approve(&a.approver))
            .map(|a| a.approver.as_str())
            .collect::<HashSet<_>>()
            .len()
    }
}

// ============================================================================
// Manager
// ============================================================================

pub struct MilestoneLockManager {
    store: Arc<dyn LedgerStore>,
    chain: Arc<dyn ChainSettlement>,
    projects: Arc<dyn ProjectService>,
    events: EventLog,
    capabilities: Arc<CapabilityTable>,
    policy: ApprovalPolicy,
}

impl MilestoneLockManager {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        chain: Arc<dyn ChainSettlement>,
        projects: Arc<dyn ProjectService>,
        events: EventLog,
        capabilities: Arc<CapabilityTable>,
        policy: ApprovalPolicy,
    ) -> Self {
        Self {
            store,
            chain,
            projects,
            events,
            capabilities,
            policy,
        }
    }

    pub fn policy(&self) -> &ApprovalPolicy {
        &self.policy
    }

    /// Reserve `amount` of the project's escrow for a milestone
    pub async fn lock(
        &self,
        project_id: &str,
        currency: Currency,
        milestone_id: &str,
        amount: Amount,
        actor: &Actor,
    ) -> Result<MilestoneLockDoc> {
        actor.require(&self.capabilities, Capability::ManageEscrow)?;
        amount.ensure_positive()?;
        if milestone_id.trim().is_empty() {
            return Err(LedgerError::BadRequest("milestoneId is required".into()));
        }

        let escrow_id = EscrowDoc::derive_id(project_id, currency);
        let escrow = self
            .store
            .get_escrow(&escrow_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("escrow for project {} in {}", project_id, currency)))?;
        if escrow.status != EscrowStatus::Active {
            return Err(LedgerError::InvalidProjectState(format!(
                "escrow {} is {}",
                escrow.escrow_id,
                escrow.status.as_str()
            )));
        }

        let now = bson::DateTime::now();
        let lock = MilestoneLockDoc {
            _id: None,
            metadata: Metadata::new(),
            lock_id: uuid::Uuid::new_v4().to_string(),
            escrow_id: escrow.escrow_id.clone(),
            project_id: project_id.to_string(),
            milestone_id: milestone_id.to_string(),
            currency,
            amount,
            status: MilestoneLockStatus::Locked,
            locked_at: now,
            released_at: None,
            cancelled_at: None,
            approvals: Vec::new(),
            release_tx_hash: None,
            reason: None,
        };

        // The store re-checks capacity and the one-active-lock rule atomically
        let lock = self.store.insert_milestone_lock(lock).await?;
        info!(
            lock_id = %lock.lock_id,
            escrow_id = %lock.escrow_id,
            milestone_id,
            amount = %amount,
            "milestone locked"
        );

        self.events
            .record(
                Some(&lock.escrow_id),
                EscrowEventType::MilestoneLocked,
                json!({
                    "lockId": lock.lock_id,
                    "milestoneId": lock.milestone_id,
                    "amount": lock.amount.to_string(),
                }),
                None,
                actor,
            )
            .await?;
        Ok(lock)
    }

    /// Record a signed approval from the acting signer
    pub async fn approve(&self, lock_id: &str, signature: &str, actor: &Actor) -> Result<MilestoneLockDoc> {
        actor.require(&self.capabilities, Capability::ApproveMilestone)?;
        if signature.trim().is_empty() {
            return Err(LedgerError::BadRequest("signature is required".into()));
        }
        if !self.policy.may_approve(&actor.id) {
            return Err(LedgerError::Forbidden(format!(
                "{} is not a milestone signer",
                actor.id
            )));
        }

        let lock = self.load(lock_id).await?;
        ensure_locked(&lock)?;

        let updated = self
            .store
            .add_milestone_approval(
                lock_id,
                MilestoneApproval {
                    approver: actor.id.clone(),
                    signature: signature.to_string(),
                    timestamp: bson::DateTime::now(),
                },
            )
            .await?;

        let approvals = self.policy.counted(&updated.approvals);
        info!(
            lock_id,
            approver = %actor.id,
            approvals,
            quorum = self.policy.quorum,
            "milestone approval recorded"
        );

        self.events
            .record(
                Some(&updated.escrow_id),
                EscrowEventType::MilestoneApproved,
                json!({
                    "lockId": updated.lock_id,
                    "milestoneId": updated.milestone_id,
                    "approver": actor.id,
                    "approvals": approvals,
                    "quorum": self.policy.quorum,
                }),
                None,
                actor,
            )
            .await?;
        Ok(updated)
    }

    /// Pay the reserved amount out to the project
    pub async fn release(&self, lock_id: &str, reason: Option<String>, actor: &Actor) -> Result<MilestoneLockDoc> {
        actor.require(&self.capabilities, Capability::ManageEscrow)?;
        let lock = self.load(lock_id).await?;
        ensure_transition(&lock, MilestoneLockStatus::Released)?;

        if !self.policy.is_met(&lock.approvals) {
            return Err(LedgerError::ApprovalQuorumNotMet(format!(
                "milestone lock {} has {} of {} approvals",
                lock_id,
                self.policy.counted(&lock.approvals),
                self.policy.quorum
            )));
        }

        match self
            .projects
            .milestone_verification(&lock.project_id, &lock.milestone_id)
            .await?
        {
            Some(VerificationDecision::Approved) => {}
            other => {
                return Err(LedgerError::InvalidProjectState(format!(
                    "milestone {} verification is {}",
                    lock.milestone_id,
                    other.map_or("missing", |d| d.as_str())
                )))
            }
        }

        let receipt = self
            .chain
            .release_onchain(&ReleaseRequest {
                project_id: lock.project_id.clone(),
                escrow_id: lock.escrow_id.clone(),
                milestone_id: Some(lock.milestone_id.clone()),
                deposit_id: None,
                amount: lock.amount,
                currency: lock.currency,
            })
            .await?
            .ensure_confirmed("release")?;

        let released = match self
            .store
            .transition_milestone_lock(
                lock_id,
                MilestoneLockStatus::Locked,
                MilestoneLockStatus::Released,
                Some(receipt.tx_hash.clone()),
                reason.clone(),
            )
            .await
        {
            Ok(lock) => lock,
            Err(e) => {
                error!(
                    lock_id,
                    tx_hash = %receipt.tx_hash,
                    error = %e,
                    "milestone paid on chain but not booked; needs reconciliation"
                );
                return Err(e);
            }
        };

        info!(lock_id, tx_hash = %receipt.tx_hash, amount = %released.amount, "milestone released");
        self.events
            .record(
                Some(&released.escrow_id),
                EscrowEventType::MilestoneReleased,
                json!({
                    "lockId": released.lock_id,
                    "milestoneId": released.milestone_id,
                    "amount": released.amount.to_string(),
                    "reason": reason,
                }),
                Some(&receipt.tx_hash),
                actor,
            )
            .await?;
        Ok(released)
    }

    /// LOCKED -> CANCELLED; the reservation is freed
    pub async fn cancel(&self, lock_id: &str, reason: Option<String>, actor: &Actor) -> Result<MilestoneLockDoc> {
        actor.require(&self.capabilities, Capability::ManageEscrow)?;
        let lock = self.load(lock_id).await?;
        ensure_transition(&lock, MilestoneLockStatus::Cancelled)?;

        let cancelled = self
            .store
            .transition_milestone_lock(
                lock_id,
                MilestoneLockStatus::Locked,
                MilestoneLockStatus::Cancelled,
                None,
                reason.clone(),
            )
            .await?;
        info!(lock_id, "milestone lock cancelled");

        self.events
            .record(
                Some(&cancelled.escrow_id),
                EscrowEventType::MilestoneCancelled,
                json!({
                    "lockId": cancelled.lock_id,
                    "milestoneId": cancelled.milestone_id,
                    "amount": cancelled.amount.to_string(),
                    "reason": reason,
                }),
                None,
                actor,
            )
            .await?;
        Ok(cancelled)
    }

    pub async fn get(&self, lock_id: &str) -> Result<MilestoneLockDoc> {
        self.load(lock_id).await
    }

    async fn load(&self, lock_id: &str) -> Result<MilestoneLockDoc> {
        self.store
            .get_milestone_lock(lock_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("milestone lock {}", lock_id)))
    }
}

fn ensure_transition(lock: &MilestoneLockDoc, to: MilestoneLockStatus) -> Result<()> {
    if lock.status.can_transition_to(to) {
        Ok(())
    } else {
        Err(LedgerError::InvalidTransition(format!(
            "milestone lock {} cannot move from {} to {}",
            lock.lock_id,
            lock.status.as_str(),
            to.as_str()
        )))
    }
}

fn ensure_locked(lock: &MilestoneLockDoc) -> Result<()> {
    if lock.status == MilestoneLockStatus::Locked {
        Ok(())
    } else {
        Err(LedgerError::InvalidTransition(format!(
            "milestone lock {} is {}",
            lock.lock_id,
            lock.status.as_str()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use crate::ledger::escrow::NewDeposit;
    use crate::ledger::testing::{admin, investor, Harness};
    use crate::db::schemas::DepositSource;
    use tokio_test::{assert_err, assert_ok};

    async fn funded(h: &Harness, amount: i64) {
        h.ledger
            .escrow
            .create_deposit(
                NewDeposit {
                    project_id: "P".into(),
                    investor_id: "investor-1".into(),
                    amount: Amount::from_whole(amount).unwrap(),
                    currency: Currency::Eth,
                    source: DepositSource::Offchain,
                    tx_hash: None,
                    provider_tx_id: None,
                    nft_id: None,
                    metadata: None,
                },
                &investor("investor-1"),
            )
            .await
            .unwrap();
    }

    fn signer(id: &str) -> Actor {
        Actor::new(id, vec![Role::Admin])
    }

    fn eth(whole: i64) -> Amount {
        Amount::from_whole(whole).unwrap()
    }

    #[test]
    fn test_policy_counts_distinct_eligible_signers() {
        let policy = ApprovalPolicy::new(2, vec!["alice".to_string(), "bob".to_string()]);
        let approval = |who: &str| MilestoneApproval {
            approver: who.into(),
            signature: "sig".into(),
            timestamp: bson::DateTime::now(),
        };
        assert!(!policy.is_met(&[approval("alice"), approval("mallory")]));
        assert!(policy.is_met(&[approval("alice"), approval("bob")]));
        assert!(ApprovalPolicy::default().may_approve("anyone"));
    }

    #[tokio::test]
    async fn test_lock_requires_unreserved_funds() {
        let h = Harness::new();
        funded(&h, 100).await;
        let milestones = &h.ledger.milestones;

        assert_ok!(milestones.lock("P", Currency::Eth, "m1", eth(60), &admin()).await);
        let err = assert_err!(milestones.lock("P", Currency::Eth, "m2", eth(50), &admin()).await);
        assert!(matches!(err, LedgerError::InsufficientBalance(_)));

        // A second active lock on the same milestone conflicts
        let err = assert_err!(milestones.lock("P", Currency::Eth, "m1", eth(10), &admin()).await);
        assert!(matches!(err, LedgerError::Conflict(_)));

        // Locks never move the escrow total
        let view = h.ledger.escrow.get_escrow_by_project("P", None).await.unwrap().unwrap();
        assert_eq!(view.escrow.total_locked, eth(100));
        assert_eq!(view.escrow.unreserved(), eth(40));
        assert_eq!(view.milestone_locks.len(), 1);
    }

    #[tokio::test]
    async fn test_lock_without_escrow_is_not_found() {
        let h = Harness::new();
        let err = assert_err!(h.ledger.milestones.lock("nope", Currency::Eth, "m1", eth(1), &admin()).await);
        assert!(matches!(err, LedgerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_release_needs_quorum_and_verification() {
        let h = Harness::with_policy(ApprovalPolicy::new(
            2,
            vec!["alice".to_string(), "bob".to_string(), "carol".to_string()],
        ));
        h.register_project("P");
        funded(&h, 100).await;
        let milestones = &h.ledger.milestones;
        let lock = milestones.lock("P", Currency::Eth, "m1", eth(30), &admin()).await.unwrap();

        milestones.approve(&lock.lock_id, "sig-a", &signer("alice")).await.unwrap();
        let err = assert_err!(milestones.release(&lock.lock_id, None, &admin()).await);
        assert!(matches!(err, LedgerError::ApprovalQuorumNotMet(_)));

        // Repeat approvals and outsiders do not count
        let err = assert_err!(milestones.approve(&lock.lock_id, "sig-a2", &signer("alice")).await);
        assert!(matches!(err, LedgerError::Conflict(_)));
        let err = assert_err!(milestones.approve(&lock.lock_id, "sig-m", &signer("mallory")).await);
        assert!(matches!(err, LedgerError::Forbidden(_)));

        milestones.approve(&lock.lock_id, "sig-b", &signer("bob")).await.unwrap();

        // Quorum met, but the milestone is not verified yet
        h.projects.record_verification("P", "m0", VerificationDecision::Approved);
        let err = assert_err!(milestones.release(&lock.lock_id, None, &admin()).await);
        assert!(matches!(err, LedgerError::NotFound(_)));
        h.projects.record_verification("P", "m1", VerificationDecision::Rejected);
        let err = assert_err!(milestones.release(&lock.lock_id, None, &admin()).await);
        assert!(matches!(err, LedgerError::InvalidProjectState(_)));
        assert_eq!(h.chain.call_count("release"), 0);

        h.projects.record_verification("P", "m1", VerificationDecision::Approved);
        let released = milestones
            .release(&lock.lock_id, Some("delivered".into()), &admin())
            .await
            .unwrap();
        assert_eq!(released.status, MilestoneLockStatus::Released);
        assert!(released.released_at.is_some());
        let tx_hash = released.release_tx_hash.clone().unwrap();

        let events = h.ledger.events.by_tx_hash(&tx_hash).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EscrowEventType::MilestoneReleased);

        // The embedded live view mirrors the durable record
        let view = h.ledger.escrow.get_escrow_by_project("P", None).await.unwrap().unwrap();
        assert_eq!(view.escrow.locked_by_milestone[0].status, MilestoneLockStatus::Released);
        assert_eq!(view.escrow.total_locked, eth(100));

        // The payout stays out of the lockable balance
        assert_eq!(view.escrow.unreserved(), eth(70));
        let err = assert_err!(milestones.lock("P", Currency::Eth, "m2", eth(80), &admin()).await);
        assert!(matches!(err, LedgerError::InsufficientBalance(_)));
    }

    #[tokio::test]
    async fn test_released_funds_cannot_be_locked_again() {
        let h = Harness::new();
        h.register_project("P");
        funded(&h, 100).await;
        let milestones = &h.ledger.milestones;

        let lock = milestones.lock("P", Currency::Eth, "m1", eth(100), &admin()).await.unwrap();
        milestones.approve(&lock.lock_id, "sig", &admin()).await.unwrap();
        h.projects.record_verification("P", "m1", VerificationDecision::Approved);
        assert_ok!(milestones.release(&lock.lock_id, None, &admin()).await);

        let err = assert_err!(milestones.lock("P", Currency::Eth, "m2", eth(100), &admin()).await);
        assert!(matches!(err, LedgerError::InsufficientBalance(_)));
        let err = assert_err!(milestones.lock("P", Currency::Eth, "m2", eth(1), &admin()).await);
        assert!(matches!(err, LedgerError::InsufficientBalance(_)));
        assert_eq!(h.chain.call_count("release"), 1);

        // Nor can the deposits behind the payout be refunded
        let view = h.ledger.escrow.get_escrow_by_project("P", None).await.unwrap().unwrap();
        let err = assert_err!(
            h.ledger
                .escrow
                .refund_deposit(&view.deposits[0].deposit_id, None, &admin())
                .await
        );
        assert!(matches!(err, LedgerError::InsufficientBalance(_)));
        assert_eq!(view.escrow.unreserved(), Amount::ZERO);
    }

    #[tokio::test]
    async fn test_cancel_is_terminal() {
        let h = Harness::new();
        h.register_project("P");
        funded(&h, 10).await;
        let milestones = &h.ledger.milestones;
        let lock = milestones.lock("P", Currency::Eth, "m1", eth(10), &admin()).await.unwrap();

        let cancelled = milestones.cancel(&lock.lock_id, Some("scope cut".into()), &admin()).await.unwrap();
        assert_eq!(cancelled.status, MilestoneLockStatus::Cancelled);
        assert!(cancelled.cancelled_at.is_some());

        assert!(matches!(
            milestones.cancel(&lock.lock_id, None, &admin()).await,
            Err(LedgerError::InvalidTransition(_))
        ));
        assert!(matches!(
            milestones.release(&lock.lock_id, None, &admin()).await,
            Err(LedgerError::InvalidTransition(_))
        ));
        assert!(matches!(
            milestones.approve(&lock.lock_id, "sig", &admin()).await,
            Err(LedgerError::InvalidTransition(_))
        ));

        // The freed reservation can be locked again
        assert_ok!(milestones.lock("P", Currency::Eth, "m1", eth(10), &admin()).await);
    }

    #[tokio::test]
    async fn test_investors_cannot_manage_locks() {
        let h = Harness::new();
        funded(&h, 10).await;
        let err = assert_err!(
            h.ledger
                .milestones
                .lock("P", Currency::Eth, "m1", eth(1), &investor("investor-1"))
                .await
        );
        assert!(matches!(err, LedgerError::Forbidden(_)));
    }
}

//! Investment state machine
//!
//! The investor-facing record of a contribution. Creation ties together the
//! profile, project, settlement and escrow collaborators; status changes walk
//! `Pending -> Active -> Completed` with `Refunded` reachable from Pending and
//! Active. A refund settles on chain, refunds the linked escrow deposit and
//! only then flips the investment. Activation and completion check the
//! deposit first, and the escrow API refuses to refund a deposit that backs
//! an investment, so escrow state and investment status never disagree.

use std::sync::Arc;

use bson::DateTime;
use serde_json::json;
use tracing::{error, info};

use super::escrow::{refund_request, EscrowLedger, NewDeposit};
use super::events::EventLog;
use crate::auth::{Actor, Capability, CapabilityTable};
use crate::db::schemas::{
    DepositSource, DepositStatus, DepositStatusExtra, EscrowEventType, InvestmentDoc,
    InvestmentStatus, StatusChange,
};
use crate::services::{ChainSettlement, DepositRequest, ProfileService, ProjectService};
use crate::store::LedgerStore;
use crate::types::{Amount, Currency, LedgerError, Result};

/// Investment creation input; the investor is the acting user
#[derive(Debug, Clone)]
pub struct NewInvestment {
    pub project_id: String,
    pub amount: Amount,
    pub currency: Currency,
    pub nft_id: Option<String>,
}

pub struct InvestmentStateMachine {
    store: Arc<dyn LedgerStore>,
    chain: Arc<dyn ChainSettlement>,
    projects: Arc<dyn ProjectService>,
    profiles: Arc<dyn ProfileService>,
    escrow: Arc<EscrowLedger>,
    events: EventLog,
    capabilities: Arc<CapabilityTable>,
}

impl InvestmentStateMachine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn LedgerStore>,
        chain: Arc<dyn ChainSettlement>,
        projects: Arc<dyn ProjectService>,
        profiles: Arc<dyn ProfileService>,
        escrow: Arc<EscrowLedger>,
        events: EventLog,
        capabilities: Arc<CapabilityTable>,
    ) -> Self {
        Self {
            store,
            chain,
            projects,
            profiles,
            escrow,
            events,
            capabilities,
        }
    }

    /// Validate, settle the deposit and record the investment as Pending
    pub async fn create(&self, request: NewInvestment, actor: &Actor) -> Result<InvestmentDoc> {
        actor.require(&self.capabilities, Capability::Invest)?;
        let amount = request.amount.ensure_positive()?;
        if request.project_id.trim().is_empty() {
            return Err(LedgerError::BadRequest("projectId is required".into()));
        }

        let profile = self.profiles.investor_profile(&actor.id).await?;
        if !profile.can_invest() {
            return Err(LedgerError::Forbidden(format!(
                "investor {} is not eligible (active: {}, kyc: {})",
                actor.id,
                profile.is_active,
                profile.kyc_status.as_str()
            )));
        }
        self.projects.ensure_open_for_investment(&request.project_id).await?;

        let receipt = self
            .chain
            .deposit_onchain(&DepositRequest {
                project_id: request.project_id.clone(),
                investor_id: actor.id.clone(),
                amount,
                currency: request.currency,
            })
            .await?
            .ensure_confirmed("deposit")?;
        let tx_hash = receipt.tx_hash;

        match self.book(&request, amount, &tx_hash, actor).await {
            Ok(investment) => Ok(investment),
            Err(e) => {
                error!(
                    project_id = %request.project_id,
                    investor_id = %actor.id,
                    tx_hash = %tx_hash,
                    error = %e,
                    "deposit settled on chain but investment not booked; needs reconciliation"
                );
                Err(e)
            }
        }
    }

    async fn book(
        &self,
        request: &NewInvestment,
        amount: Amount,
        tx_hash: &str,
        actor: &Actor,
    ) -> Result<InvestmentDoc> {
        let receipt = self
            .escrow
            .record_verified_deposit(
                NewDeposit {
                    project_id: request.project_id.clone(),
                    investor_id: actor.id.clone(),
                    amount,
                    currency: request.currency,
                    source: DepositSource::Onchain,
                    tx_hash: Some(tx_hash.to_string()),
                    provider_tx_id: None,
                    nft_id: request.nft_id.clone(),
                    metadata: None,
                },
                actor,
            )
            .await?;

        let investment = self
            .store
            .insert_investment(InvestmentDoc::new(
                &request.project_id,
                &actor.id,
                amount,
                request.currency,
                request.nft_id.clone(),
                Some(tx_hash.to_string()),
                receipt.deposit_id,
                receipt.escrow_id,
            ))
            .await?;

        self.projects.increment_funding(&request.project_id, amount).await?;

        info!(
            investment_id = %investment.investment_id,
            project_id = %investment.project_id,
            investor_id = %investment.investor_id,
            amount = %amount,
            tx_hash,
            "investment created"
        );
        self.events
            .record(
                Some(&investment.escrow_id),
                EscrowEventType::InvestmentCreated,
                json!({
                    "investmentId": investment.investment_id,
                    "depositId": investment.deposit_id,
                    "projectId": investment.project_id,
                    "amount": amount.to_string(),
                    "currency": request.currency.as_str(),
                }),
                Some(tx_hash),
                actor,
            )
            .await?;
        Ok(investment)
    }

    /// Move an investment along its edge set, compensating escrow as needed
    pub async fn update_status(
        &self,
        investment_id: &str,
        to: InvestmentStatus,
        reason: Option<String>,
        actor: &Actor,
    ) -> Result<InvestmentDoc> {
        actor.require(&self.capabilities, Capability::ManageInvestments)?;
        let investment = self.get(investment_id).await?;
        let from = investment.status;
        if !from.can_transition_to(to) {
            return Err(LedgerError::InvalidTransition(format!(
                "investment {} cannot move from {} to {}",
                investment_id, from, to
            )));
        }

        let tx_hash = match to {
            InvestmentStatus::Active => {
                self.confirm_deposit(&investment, actor).await?;
                None
            }
            InvestmentStatus::Completed => {
                self.ensure_deposit_settled(&investment).await?;
                None
            }
            InvestmentStatus::Refunded => self.refund_deposit(&investment, reason.clone(), actor).await?,
            InvestmentStatus::Pending => None,
        };

        let updated = self
            .store
            .transition_investment(
                investment_id,
                from,
                StatusChange {
                    from: Some(from),
                    to,
                    at: DateTime::now(),
                    by: actor.id.clone(),
                    reason: reason.clone(),
                    tx_hash: tx_hash.clone(),
                },
            )
            .await?;

        info!(investment_id, from = from.as_str(), to = to.as_str(), "investment status changed");
        self.events
            .record(
                Some(&updated.escrow_id),
                EscrowEventType::InvestmentStatusChanged,
                json!({
                    "investmentId": investment_id,
                    "from": from.as_str(),
                    "to": to.as_str(),
                    "reason": reason,
                }),
                tx_hash.as_deref(),
                actor,
            )
            .await?;
        Ok(updated)
    }

    pub async fn get(&self, investment_id: &str) -> Result<InvestmentDoc> {
        self.store
            .get_investment(investment_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("investment {}", investment_id)))
    }

    pub async fn list_for_project(&self, project_id: &str) -> Result<Vec<InvestmentDoc>> {
        self.store.investments_for_project(project_id).await
    }

    /// Pending deposits become CONFIRMED when the investment activates.
    /// Disputed or refunded deposits block activation.
    async fn confirm_deposit(&self, investment: &InvestmentDoc, actor: &Actor) -> Result<()> {
        let deposit = self.escrow.get_deposit(&investment.deposit_id).await?;
        match deposit.status {
            DepositStatus::Pending | DepositStatus::PendingTx => {
                self.escrow
                    .transition(
                        &deposit.deposit_id,
                        DepositStatus::Confirmed,
                        DepositStatusExtra::default(),
                        EscrowEventType::DepositConfirmed,
                        actor,
                    )
                    .await?;
                Ok(())
            }
            DepositStatus::Confirmed | DepositStatus::Released => Ok(()),
            DepositStatus::Disputed | DepositStatus::Refunded => {
                Err(deposit_blocks(investment, &deposit.deposit_id, deposit.status, InvestmentStatus::Active))
            }
        }
    }

    /// Completion needs the deposit confirmed or already paid out
    async fn ensure_deposit_settled(&self, investment: &InvestmentDoc) -> Result<()> {
        let deposit = self.escrow.get_deposit(&investment.deposit_id).await?;
        match deposit.status {
            DepositStatus::Confirmed | DepositStatus::Released => Ok(()),
            other => Err(deposit_blocks(investment, &deposit.deposit_id, other, InvestmentStatus::Completed)),
        }
    }

    /// Settle the refund on chain and take the deposit out of escrow.
    /// A deposit refunded by an earlier, interrupted attempt is left as is.
    async fn refund_deposit(
        &self,
        investment: &InvestmentDoc,
        reason: Option<String>,
        actor: &Actor,
    ) -> Result<Option<String>> {
        let deposit = self.escrow.get_deposit(&investment.deposit_id).await?;
        if deposit.status == DepositStatus::Refunded {
            return Ok(deposit.resolution_tx_hash);
        }
        if !deposit.status.can_transition_to(DepositStatus::Refunded) {
            return Err(LedgerError::InvalidTransition(format!(
                "deposit {} of investment {} is {} and cannot be refunded",
                deposit.deposit_id,
                investment.investment_id,
                deposit.status.as_str()
            )));
        }

        self.escrow.ensure_can_leave(&deposit).await?;

        let receipt = self
            .chain
            .refund_onchain(&refund_request(&deposit))
            .await?
            .ensure_confirmed("refund")?;

        let refunded = self
            .escrow
            .settle_refund(&deposit.deposit_id, reason, Some(receipt.tx_hash), actor)
            .await?;
        Ok(refunded.resolution_tx_hash)
    }
}

fn deposit_blocks(
    investment: &InvestmentDoc,
    deposit_id: &str,
    deposit_status: DepositStatus,
    to: InvestmentStatus,
) -> LedgerError {
    LedgerError::InvalidTransition(format!(
        "investment {} cannot become {} while deposit {} is {}",
        investment.investment_id,
        to,
        deposit_id,
        deposit_status.as_str()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use crate::db::schemas::{KycStatus, ProjectStatus};
    use crate::ledger::testing::{admin, investor, Harness};
    use crate::services::InvestorProfile;
    use tokio_test::{assert_err, assert_ok};

    fn request(amount: &str) -> NewInvestment {
        NewInvestment {
            project_id: "P".into(),
            amount: Amount::parse_positive(amount).unwrap(),
            currency: Currency::Eth,
            nft_id: Some("nft-1".into()),
        }
    }

    fn ready() -> Harness {
        let h = Harness::new();
        h.register_project("P");
        h.profiles.approve("investor-1");
        h
    }

    #[tokio::test]
    async fn test_create_links_deposit_and_escrow() {
        let h = ready();
        let investment = h
            .ledger
            .investments
            .create(request("2.5"), &investor("investor-1"))
            .await
            .unwrap();
        assert_eq!(investment.status, InvestmentStatus::Pending);
        assert_eq!(investment.status_history.len(), 1);

        let deposit = h.ledger.escrow.get_deposit(&investment.deposit_id).await.unwrap();
        assert_eq!(deposit.source, DepositSource::Onchain);
        assert_eq!(deposit.tx_hash, investment.tx_hash);

        let view = h.ledger.escrow.get_escrow_by_project("P", None).await.unwrap().unwrap();
        assert_eq!(view.escrow.escrow_id, investment.escrow_id);
        assert_eq!(view.escrow.total_locked, Amount::parse_positive("2.5").unwrap());

        let project = h.projects.get("P").unwrap();
        assert_eq!(project.raised_amount, Amount::parse_positive("2.5").unwrap());
        assert_eq!(project.backer_count, 1);

        // The settlement hash correlates deposit and investment events
        let hash = investment.tx_hash.clone().unwrap();
        let kinds: Vec<_> = h
            .ledger
            .events
            .by_tx_hash(&hash)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(
            kinds,
            vec![EscrowEventType::DepositCreated, EscrowEventType::InvestmentCreated]
        );
    }

    #[tokio::test]
    async fn test_create_requires_eligible_investor() {
        let h = ready();
        h.profiles.set_profile(
            "investor-2",
            InvestorProfile {
                is_active: true,
                kyc_status: KycStatus::Pending,
            },
        );

        let err = assert_err!(h.ledger.investments.create(request("1"), &investor("investor-2")).await);
        assert!(matches!(err, LedgerError::Forbidden(_)));

        // Admins lack the invest capability by default
        let err = assert_err!(h.ledger.investments.create(request("1"), &admin()).await);
        assert!(matches!(err, LedgerError::Forbidden(_)));
        assert_eq!(h.chain.call_count("deposit"), 0);
    }

    #[tokio::test]
    async fn test_closed_project_rejects_before_settlement() {
        let h = ready();
        h.projects.set_status("P", ProjectStatus::Closed);

        let err = assert_err!(h.ledger.investments.create(request("1"), &investor("investor-1")).await);
        assert!(matches!(err, LedgerError::InvalidProjectState(_)));
        assert_eq!(h.chain.call_count("deposit"), 0);
        assert!(h.ledger.escrow.get_escrow_by_project("P", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pending_cannot_jump_to_completed() {
        let h = ready();
        let investment = h
            .ledger
            .investments
            .create(request("1"), &investor("investor-1"))
            .await
            .unwrap();

        let err = assert_err!(
            h.ledger
                .investments
                .update_status(&investment.investment_id, InvestmentStatus::Completed, None, &admin())
                .await
        );
        assert!(matches!(err, LedgerError::InvalidTransition(_)));
        let unchanged = h.ledger.investments.get(&investment.investment_id).await.unwrap();
        assert_eq!(unchanged.status, InvestmentStatus::Pending);
    }

    #[tokio::test]
    async fn test_activation_confirms_deposit() {
        let h = ready();
        let investments = &h.ledger.investments;
        let investment = investments.create(request("1"), &investor("investor-1")).await.unwrap();

        let active = investments
            .update_status(&investment.investment_id, InvestmentStatus::Active, None, &admin())
            .await
            .unwrap();
        assert_eq!(active.status, InvestmentStatus::Active);
        let deposit = h.ledger.escrow.get_deposit(&investment.deposit_id).await.unwrap();
        assert_eq!(deposit.status, DepositStatus::Confirmed);

        let completed = investments
            .update_status(&investment.investment_id, InvestmentStatus::Completed, None, &admin())
            .await
            .unwrap();
        let path: Vec<_> = completed.status_history.iter().map(|c| c.to).collect();
        assert_eq!(
            path,
            vec![
                InvestmentStatus::Pending,
                InvestmentStatus::Active,
                InvestmentStatus::Completed
            ]
        );

        // Completed is terminal
        assert!(matches!(
            investments
                .update_status(&investment.investment_id, InvestmentStatus::Refunded, None, &admin())
                .await,
            Err(LedgerError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_escrow_refund_of_investment_deposit_is_rejected() {
        let h = ready();
        let investment = h
            .ledger
            .investments
            .create(request("4"), &investor("investor-1"))
            .await
            .unwrap();

        let err = assert_err!(
            h.ledger
                .escrow
                .refund_deposit(&investment.deposit_id, None, &admin())
                .await
        );
        assert!(matches!(err, LedgerError::InvalidTransition(_)));
        let err = assert_err!(
            h.ledger
                .escrow
                .mark_deposit_status(
                    &investment.deposit_id,
                    DepositStatus::Refunded,
                    DepositStatusExtra::default(),
                    &admin(),
                )
                .await
        );
        assert!(matches!(err, LedgerError::InvalidTransition(_)));
        assert_eq!(h.chain.call_count("refund"), 0);

        let deposit = h.ledger.escrow.get_deposit(&investment.deposit_id).await.unwrap();
        assert_eq!(deposit.status, DepositStatus::Pending);
        let view = h.ledger.escrow.get_escrow_by_project("P", None).await.unwrap().unwrap();
        assert_eq!(view.escrow.total_locked, Amount::from_whole(4).unwrap());
    }

    #[tokio::test]
    async fn test_disputed_deposit_blocks_activation_and_completion() {
        let h = ready();
        let investments = &h.ledger.investments;
        let pending = investments.create(request("1"), &investor("investor-1")).await.unwrap();
        let active = investments.create(request("2"), &investor("investor-1")).await.unwrap();
        investments
            .update_status(&active.investment_id, InvestmentStatus::Active, None, &admin())
            .await
            .unwrap();

        for investment in [&pending, &active] {
            h.ledger
                .escrow
                .dispute_deposit(&investment.deposit_id, Some("chargeback".into()), &admin())
                .await
                .unwrap();
        }

        let err = assert_err!(
            investments
                .update_status(&pending.investment_id, InvestmentStatus::Active, None, &admin())
                .await
        );
        assert!(matches!(err, LedgerError::InvalidTransition(_)));
        let err = assert_err!(
            investments
                .update_status(&active.investment_id, InvestmentStatus::Completed, None, &admin())
                .await
        );
        assert!(matches!(err, LedgerError::InvalidTransition(_)));
        assert_eq!(
            investments.get(&active.investment_id).await.unwrap().status,
            InvestmentStatus::Active
        );

        // A disputed deposit can still be refunded through the investment
        let refunded = investments
            .update_status(&pending.investment_id, InvestmentStatus::Refunded, None, &admin())
            .await
            .unwrap();
        assert_eq!(refunded.status, InvestmentStatus::Refunded);
        let deposit = h.ledger.escrow.get_deposit(&pending.deposit_id).await.unwrap();
        assert_eq!(deposit.status, DepositStatus::Refunded);
    }

    #[tokio::test]
    async fn test_refund_under_milestone_lock_skips_settlement() {
        let h = ready();
        let investments = &h.ledger.investments;
        let investment = investments.create(request("6"), &investor("investor-1")).await.unwrap();
        h.ledger
            .milestones
            .lock("P", Currency::Eth, "m1", Amount::from_whole(6).unwrap(), &admin())
            .await
            .unwrap();

        let err = assert_err!(
            investments
                .update_status(&investment.investment_id, InvestmentStatus::Refunded, None, &admin())
                .await
        );
        assert!(matches!(err, LedgerError::InsufficientBalance(_)));
        assert_eq!(h.chain.call_count("refund"), 0);
        assert_eq!(
            investments.get(&investment.investment_id).await.unwrap().status,
            InvestmentStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_completion_accepts_released_deposit() {
        let h = ready();
        let investments = &h.ledger.investments;
        let investment = investments.create(request("5"), &investor("investor-1")).await.unwrap();
        investments
            .update_status(&investment.investment_id, InvestmentStatus::Active, None, &admin())
            .await
            .unwrap();
        h.ledger
            .escrow
            .release_deposit(&investment.deposit_id, None, &admin())
            .await
            .unwrap();

        assert_ok!(
            investments
                .update_status(&investment.investment_id, InvestmentStatus::Completed, None, &admin())
                .await
        );
    }

    #[tokio::test]
    async fn test_refund_compensates_escrow() {
        let h = ready();
        let investments = &h.ledger.investments;
        let keep = investments.create(request("3"), &investor("investor-1")).await.unwrap();
        let refund = investments.create(request("2"), &investor("investor-1")).await.unwrap();

        let refunded = investments
            .update_status(
                &refund.investment_id,
                InvestmentStatus::Refunded,
                Some("project paused".into()),
                &admin(),
            )
            .await
            .unwrap();
        assert_eq!(refunded.status, InvestmentStatus::Refunded);
        assert_eq!(h.chain.call_count("refund"), 1);

        let refund_hash = refunded.status_history.last().unwrap().tx_hash.clone().unwrap();
        let deposit = h.ledger.escrow.get_deposit(&refund.deposit_id).await.unwrap();
        assert_eq!(deposit.status, DepositStatus::Refunded);
        assert_eq!(deposit.resolution_tx_hash.as_deref(), Some(refund_hash.as_str()));

        let view = h.ledger.escrow.get_escrow_by_project("P", None).await.unwrap().unwrap();
        assert_eq!(view.escrow.total_locked, Amount::from_whole(3).unwrap());
        assert_eq!(h.ledger.escrow.get_deposit(&keep.deposit_id).await.unwrap().status, DepositStatus::Pending);
    }

    #[tokio::test]
    async fn test_failed_refund_settlement_changes_nothing() {
        let h = ready();
        let investments = &h.ledger.investments;
        let investment = investments.create(request("2"), &investor("investor-1")).await.unwrap();
        h.chain.fail_operation("refund", "reverted");

        let err = assert_err!(
            investments
                .update_status(&investment.investment_id, InvestmentStatus::Refunded, None, &admin())
                .await
        );
        assert!(matches!(err, LedgerError::ChainCallFailed(_)));
        assert_eq!(
            investments.get(&investment.investment_id).await.unwrap().status,
            InvestmentStatus::Pending
        );
        let view = h.ledger.escrow.get_escrow_by_project("P", None).await.unwrap().unwrap();
        assert_eq!(view.escrow.total_locked, Amount::from_whole(2).unwrap());

        // Retrying once settlement recovers succeeds
        h.chain.clear_failures();
        assert_ok!(
            investments
                .update_status(&investment.investment_id, InvestmentStatus::Refunded, None, &admin())
                .await
        );
    }

    #[tokio::test]
    async fn test_status_updates_are_privileged() {
        let h = ready();
        let investment = h
            .ledger
            .investments
            .create(request("1"), &investor("investor-1"))
            .await
            .unwrap();
        let creator = Actor::new("creator-1", vec![Role::Creator]);
        let err = assert_err!(
            h.ledger
                .investments
                .update_status(&investment.investment_id, InvestmentStatus::Active, None, &creator)
                .await
        );
        assert!(matches!(err, LedgerError::Forbidden(_)));
        assert_eq!(h.ledger.investments.list_for_project("P").await.unwrap().len(), 1);
    }
}

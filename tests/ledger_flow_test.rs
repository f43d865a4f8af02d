//! End-to-end ledger flows against the in-memory store and simulated settlement

use std::sync::Arc;

use fundledger::auth::{Actor, CapabilityTable, Role};
use fundledger::db::schemas::{
    DepositSource, DepositStatus, EscrowEventType, InvestmentStatus, MilestoneLockStatus, ProjectDoc,
    ProjectKind, TreasuryTxType, VerificationDecision,
};
use fundledger::ledger::{ApprovalPolicy, Ledger, LedgerDeps, NewDeposit, NewInvestment, Withdrawal};
use fundledger::services::{InMemoryProfileService, InMemoryProjectService, SimulatedChainSettlement};
use fundledger::store::{MemoryLedgerStore, Page, TreasuryTxFilter};
use fundledger::types::{Amount, Currency, LedgerError};
use tokio_test::{assert_err, assert_ok};

struct World {
    ledger: Ledger,
    chain: Arc<SimulatedChainSettlement>,
    projects: Arc<InMemoryProjectService>,
}

fn world(policy: ApprovalPolicy) -> World {
    let chain = Arc::new(SimulatedChainSettlement::new());
    let projects = Arc::new(InMemoryProjectService::new());
    let profiles = Arc::new(InMemoryProfileService::new());
    profiles.approve("alice");
    profiles.approve("bob");

    projects.insert(ProjectDoc::new(
        "solar-farm",
        "Solar farm",
        "creator-1",
        amount("50000"),
        ProjectKind::Roi {
            expected_roi_bps: 800,
            term_months: 36,
        },
    ));

    let ledger = Ledger::new(LedgerDeps {
        store: Arc::new(MemoryLedgerStore::new()),
        chain: chain.clone(),
        projects: projects.clone(),
        profiles,
        capabilities: Arc::new(CapabilityTable::default()),
        approval_policy: policy,
    });
    World {
        ledger,
        chain,
        projects,
    }
}

fn amount(s: &str) -> Amount {
    Amount::parse_positive(s).unwrap()
}

fn investor(id: &str) -> Actor {
    Actor::new(id, vec![Role::Investor])
}

fn admin(id: &str) -> Actor {
    Actor::new(id, vec![Role::Admin])
}

fn invest(amount_str: &str) -> NewInvestment {
    NewInvestment {
        project_id: "solar-farm".into(),
        amount: amount(amount_str),
        currency: Currency::Usdc,
        nft_id: None,
    }
}

#[tokio::test]
async fn investment_to_milestone_payout() {
    let w = world(ApprovalPolicy::new(2, vec!["admin-1".to_string(), "admin-2".to_string()]));

    let first = assert_ok!(w.ledger.investments.create(invest("1500"), &investor("alice")).await);
    let second = assert_ok!(w.ledger.investments.create(invest("500.25"), &investor("bob")).await);
    assert_eq!(first.status, InvestmentStatus::Pending);
    assert_eq!(first.escrow_id, second.escrow_id);

    let view = w
        .ledger
        .escrow
        .get_escrow_by_project("solar-farm", Some(Currency::Usdc))
        .await
        .unwrap()
        .expect("escrow exists after first investment");
    assert_eq!(view.escrow.total_locked, amount("2000.25"));
    assert_eq!(view.deposits.len(), 2);
    assert!(view.deposits.iter().all(|d| d.source == DepositSource::Onchain));

    let project = w.projects.get("solar-farm").unwrap();
    assert_eq!(project.raised_amount, amount("2000.25"));

    let ops = admin("admin-1");
    assert_ok!(
        w.ledger
            .investments
            .update_status(&first.investment_id, InvestmentStatus::Active, None, &ops)
            .await
    );
    let deposit = w.ledger.escrow.get_deposit(&first.deposit_id).await.unwrap();
    assert_eq!(deposit.status, DepositStatus::Confirmed);

    let lock = assert_ok!(
        w.ledger
            .milestones
            .lock("solar-farm", Currency::Usdc, "site-survey", amount("1200"), &ops)
            .await
    );

    // Only 800.25 is left unreserved
    let too_big = w
        .ledger
        .milestones
        .lock("solar-farm", Currency::Usdc, "permits", amount("900"), &ops)
        .await;
    assert!(matches!(too_big, Err(LedgerError::InsufficientBalance(_))));

    assert_ok!(w.ledger.milestones.approve(&lock.lock_id, "sig-1", &ops).await);
    let early = w.ledger.milestones.release(&lock.lock_id, None, &ops).await;
    assert!(matches!(early, Err(LedgerError::ApprovalQuorumNotMet(_))));

    assert_ok!(
        w.ledger
            .milestones
            .approve(&lock.lock_id, "sig-2", &admin("admin-2"))
            .await
    );
    let unverified = w.ledger.milestones.release(&lock.lock_id, None, &ops).await;
    assert!(matches!(unverified, Err(LedgerError::InvalidProjectState(_))));

    w.projects
        .record_verification("solar-farm", "site-survey", VerificationDecision::Approved);
    let released = assert_ok!(
        w.ledger
            .milestones
            .release(&lock.lock_id, Some("survey delivered".into()), &ops)
            .await
    );
    assert_eq!(released.status, MilestoneLockStatus::Released);
    let tx_hash = released.release_tx_hash.clone().expect("payout hash");

    let events = w.ledger.events.by_tx_hash(&tx_hash).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EscrowEventType::MilestoneReleased);

    let history: Vec<_> = w
        .ledger
        .events
        .for_escrow(&first.escrow_id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(history.first(), Some(&EscrowEventType::EscrowCreated));
    assert_eq!(history.last(), Some(&EscrowEventType::MilestoneReleased));
    assert_eq!(
        history
            .iter()
            .filter(|t| **t == EscrowEventType::MilestoneApproved)
            .count(),
        2
    );
}

#[tokio::test]
async fn refunded_investment_leaves_escrow() {
    let w = world(ApprovalPolicy::default());
    let ops = admin("admin-1");

    let investment = assert_ok!(w.ledger.investments.create(invest("300"), &investor("alice")).await);
    let refunded = assert_ok!(
        w.ledger
            .investments
            .update_status(
                &investment.investment_id,
                InvestmentStatus::Refunded,
                Some("project cancelled".into()),
                &ops,
            )
            .await
    );
    assert_eq!(refunded.status, InvestmentStatus::Refunded);
    let refund_hash = refunded
        .status_history
        .last()
        .and_then(|c| c.tx_hash.clone())
        .expect("refund hash recorded");

    let escrow = w.ledger.escrow.get_escrow(&investment.escrow_id).await.unwrap().unwrap();
    assert_eq!(escrow.escrow.total_locked, Amount::ZERO);

    let report = w.ledger.events.reconcile_tx(&refund_hash).await.unwrap();
    assert!(report.is_known());
    assert_eq!(report.deposits.len(), 1);
    assert_eq!(report.deposits[0].status, DepositStatus::Refunded);

    // Terminal
    let again = w
        .ledger
        .investments
        .update_status(&investment.investment_id, InvestmentStatus::Active, None, &ops)
        .await;
    assert!(matches!(again, Err(LedgerError::InvalidTransition(_))));
}

#[tokio::test]
async fn failed_refund_settlement_changes_nothing() {
    let w = world(ApprovalPolicy::default());
    let ops = admin("admin-1");
    let investment = assert_ok!(w.ledger.investments.create(invest("75"), &investor("bob")).await);

    w.chain.fail_operation("refund", "gateway rejected");
    let failed = w
        .ledger
        .investments
        .update_status(&investment.investment_id, InvestmentStatus::Refunded, None, &ops)
        .await;
    assert!(matches!(failed, Err(LedgerError::ChainCallFailed(_))));

    let unchanged = w.ledger.investments.get(&investment.investment_id).await.unwrap();
    assert_eq!(unchanged.status, InvestmentStatus::Pending);
    let escrow = w.ledger.escrow.get_escrow(&investment.escrow_id).await.unwrap().unwrap();
    assert_eq!(escrow.escrow.total_locked, amount("75"));
}

#[tokio::test]
async fn fiat_deposit_dispute_and_release() {
    let w = world(ApprovalPolicy::default());
    let ops = admin("admin-1");

    let receipt = assert_ok!(
        w.ledger
            .escrow
            .create_deposit(
                NewDeposit {
                    project_id: "solar-farm".into(),
                    investor_id: "alice".into(),
                    amount: amount("40"),
                    currency: Currency::Eur,
                    source: DepositSource::Fiat,
                    tx_hash: None,
                    provider_tx_id: Some("pi_123".into()),
                    nft_id: None,
                    metadata: None,
                },
                &investor("alice"),
            )
            .await
    );
    assert_eq!(receipt.status, DepositStatus::Pending);

    assert_ok!(
        w.ledger
            .escrow
            .dispute_deposit(&receipt.deposit_id, Some("chargeback".into()), &ops)
            .await
    );
    let released = assert_ok!(w.ledger.escrow.release_deposit(&receipt.deposit_id, None, &ops).await);
    assert_eq!(released.status, DepositStatus::Released);

    let view = w.ledger.escrow.get_escrow(&receipt.escrow_id).await.unwrap().unwrap();
    assert_eq!(view.escrow.total_locked, Amount::ZERO);

    // Terminal: a released deposit cannot be refunded
    assert_err!(w.ledger.escrow.refund_deposit(&receipt.deposit_id, None, &ops).await);

    // Investors cannot move deposits
    let forbidden = w
        .ledger
        .escrow
        .confirm_deposit(&receipt.deposit_id, &investor("alice"))
        .await;
    assert!(matches!(forbidden, Err(LedgerError::Forbidden(_))));
}

#[tokio::test]
async fn treasury_accounting() {
    let w = world(ApprovalPolicy::default());
    let treasurer = Actor::new("treasurer-1", vec![Role::Treasury]);

    assert_ok!(
        w.ledger
            .treasury
            .record_fee(amount("100"), Some("0xfee".into()), serde_json::json!({ "projectId": "solar-farm" }), &treasurer)
            .await
    );
    assert_ok!(
        w.ledger
            .treasury
            .record_donation(amount("50"), None, serde_json::json!({}), &treasurer)
            .await
    );
    assert_ok!(w.ledger.treasury.reserve(amount("30"), None, &treasurer).await);

    let overdraw = w
        .ledger
        .treasury
        .withdraw(
            Withdrawal {
                amount: amount("125"),
                tx_hash: Some("0xout".into()),
                ..Default::default()
            },
            &treasurer,
        )
        .await;
    assert!(matches!(overdraw, Err(LedgerError::InsufficientBalance(_))));

    assert_ok!(
        w.ledger
            .treasury
            .withdraw(
                Withdrawal {
                    amount: amount("20"),
                    tx_hash: Some("0xout".into()),
                    ..Default::default()
                },
                &treasurer,
            )
            .await
    );

    let balance = w.ledger.treasury.get_balance(&treasurer).await.unwrap();
    assert_eq!(balance.total_balance, amount("130"));
    assert_eq!(balance.available_balance, amount("100"));
    assert_eq!(balance.reserved_balance, amount("30"));

    let fees = w
        .ledger
        .treasury
        .list_transactions(
            &TreasuryTxFilter {
                tx_type: Some(TreasuryTxType::Fee),
                ..Default::default()
            },
            Page::new(None, None).unwrap(),
            &treasurer,
        )
        .await
        .unwrap();
    assert_eq!(fees.total, 1);
    assert_eq!(fees.items[0].tx_hash.as_deref(), Some("0xfee"));

    let summary = w.ledger.treasury.get_summary(&treasurer).await.unwrap();
    assert_eq!(summary.transaction_count, 4);
    assert_eq!(summary.monthly.len(), 1);
    assert_eq!(summary.monthly[0].fees, amount("100"));

    // Investors may record fees but never read the treasury
    let denied = w.ledger.treasury.get_balance(&investor("alice")).await;
    assert!(matches!(denied, Err(LedgerError::Forbidden(_))));
}

//! Concurrent callers against the in-memory store: one escrow per
//! (project, currency), no lost counter updates, no overdrawn balances.

use std::sync::Arc;

use futures::future::join_all;
use fundledger::auth::{Actor, CapabilityTable, Role};
use fundledger::db::schemas::{DepositSource, ProjectDoc, ProjectKind};
use fundledger::ledger::{ApprovalPolicy, Ledger, LedgerDeps, NewDeposit, Withdrawal};
use fundledger::services::{
    InMemoryProfileService, InMemoryProjectService, ProjectService, SimulatedChainSettlement,
};
use fundledger::store::{LedgerStore, MemoryLedgerStore};
use fundledger::types::{Amount, Currency, LedgerError};

fn ledger_over(store: Arc<MemoryLedgerStore>) -> Ledger {
    Ledger::new(LedgerDeps {
        store,
        chain: Arc::new(SimulatedChainSettlement::new()),
        projects: Arc::new(InMemoryProjectService::new()),
        profiles: Arc::new(InMemoryProfileService::new()),
        capabilities: Arc::new(CapabilityTable::default()),
        approval_policy: ApprovalPolicy::default(),
    })
}

fn amount(s: &str) -> Amount {
    Amount::parse_positive(s).unwrap()
}

fn offchain(project_id: &str, amount_str: &str) -> NewDeposit {
    NewDeposit {
        project_id: project_id.into(),
        investor_id: "alice".into(),
        amount: amount(amount_str),
        currency: Currency::Usdc,
        source: DepositSource::Offchain,
        tx_hash: None,
        provider_tx_id: None,
        nft_id: None,
        metadata: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_find_or_create_yields_one_escrow() {
    let store = Arc::new(MemoryLedgerStore::new());

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.find_or_create_escrow("wind", Currency::Eth).await })
        })
        .collect();
    let results: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert_eq!(results.iter().filter(|(_, created)| *created).count(), 1);
    let id = &results[0].0.escrow_id;
    assert!(results.iter().all(|(escrow, _)| &escrow.escrow_id == id));
    assert_eq!(store.escrows_for_project("wind").await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_deposits_share_escrow_and_total() {
    let store = Arc::new(MemoryLedgerStore::new());
    let ledger = ledger_over(store.clone());

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                let alice = Actor::new("alice", vec![Role::Investor]);
                ledger.escrow.create_deposit(offchain("wind", "1.5"), &alice).await
            })
        })
        .collect();
    for joined in join_all(handles).await {
        joined.unwrap().unwrap();
    }

    let escrows = store.escrows_for_project("wind").await.unwrap();
    assert_eq!(escrows.len(), 1);
    assert_eq!(escrows[0].total_locked, amount("48"));
    assert_eq!(escrows[0].deposits.len(), 32);

    // Exactly one creation event despite the race
    let events = ledger.events.for_escrow(&escrows[0].escrow_id).await.unwrap();
    assert_eq!(events.len(), 33);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_funding_increments_are_not_lost() {
    let projects = Arc::new(InMemoryProjectService::new());
    projects.insert(ProjectDoc::new(
        "wind",
        "Wind park",
        "creator-1",
        amount("1000000"),
        ProjectKind::Roi {
            expected_roi_bps: 500,
            term_months: 12,
        },
    ));

    let handles: Vec<_> = (0..25)
        .map(|_| {
            let projects = projects.clone();
            tokio::spawn(async move { projects.increment_funding("wind", amount("2")).await })
        })
        .collect();
    for joined in join_all(handles).await {
        joined.unwrap().unwrap();
    }

    let project = projects.get("wind").unwrap();
    assert_eq!(project.raised_amount, amount("50"));
    assert_eq!(project.backer_count, 25);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_treasury_deltas_never_overdraw() {
    let ledger = ledger_over(Arc::new(MemoryLedgerStore::new()));

    let fees: Vec<_> = (0..20)
        .map(|_| {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                let treasurer = Actor::new("treasurer-1", vec![Role::Treasury]);
                ledger
                    .treasury
                    .record_fee(amount("5"), None, serde_json::Value::Null, &treasurer)
                    .await
            })
        })
        .collect();
    for joined in join_all(fees).await {
        joined.unwrap().unwrap();
    }

    let withdrawals: Vec<_> = (0..40)
        .map(|_| {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                let treasurer = Actor::new("treasurer-1", vec![Role::Treasury]);
                ledger
                    .treasury
                    .withdraw(
                        Withdrawal {
                            amount: amount("3"),
                            ..Default::default()
                        },
                        &treasurer,
                    )
                    .await
            })
        })
        .collect();
    let outcomes: Vec<_> = join_all(withdrawals)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    // 100 in fees covers 33 withdrawals of 3
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 33);
    assert!(outcomes
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, LedgerError::InsufficientBalance(_))));

    let treasurer = Actor::new("treasurer-1", vec![Role::Treasury]);
    let balance = ledger.treasury.get_balance(&treasurer).await.unwrap();
    assert_eq!(balance.total_balance, amount("1"));
    assert_eq!(balance.available_balance, amount("1"));
    let summary = ledger.treasury.get_summary(&treasurer).await.unwrap();
    assert_eq!(summary.transaction_count, 53);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_locks_cannot_overbook_escrow() {
    let ledger = ledger_over(Arc::new(MemoryLedgerStore::new()));
    let alice = Actor::new("alice", vec![Role::Investor]);
    ledger
        .escrow
        .create_deposit(offchain("wind", "100"), &alice)
        .await
        .unwrap();

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                let ops = Actor::new("admin-1", vec![Role::Admin]);
                ledger
                    .milestones
                    .lock("wind", Currency::Usdc, &format!("m{}", i), amount("30"), &ops)
                    .await
            })
        })
        .collect();
    let locked = join_all(handles)
        .await
        .into_iter()
        .filter(|joined| matches!(joined, Ok(Ok(_))))
        .count();
    assert_eq!(locked, 3);

    let view = ledger
        .escrow
        .get_escrow_by_project("wind", Some(Currency::Usdc))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(view.escrow.unreserved(), amount("10"));
}

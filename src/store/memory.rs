//! In-memory ledger store
//!
//! Backs tests and dev mode. All state sits behind one async mutex, so every
//! trait method observes and mutates a consistent snapshot.

use std::collections::HashMap;

use bson::DateTime;
use tokio::sync::Mutex;

use super::{reservation_shortfall, stale_status, LedgerStore, Page, Paginated, TreasuryTxFilter};
use crate::db::schemas::{
    BalanceDelta, DepositDoc, DepositStatus, DepositStatusExtra, EmbeddedMilestoneLock, EscrowDoc,
    EscrowEventDoc, EscrowStatus, InvestmentDoc, InvestmentStatus, MilestoneApproval,
    MilestoneLockDoc, MilestoneLockStatus, StatusChange, TreasuryTransactionDoc,
    TreasuryWalletDoc,
};
use crate::types::{Amount, Currency, LedgerError, Result};

#[derive(Default)]
struct MemoryState {
    escrows: HashMap<String, EscrowDoc>,
    /// Escrow ids in creation order
    escrow_order: Vec<String>,
    deposits: HashMap<String, DepositDoc>,
    deposit_order: Vec<String>,
    locks: HashMap<String, MilestoneLockDoc>,
    lock_order: Vec<String>,
    events: Vec<EscrowEventDoc>,
    wallet: Option<TreasuryWalletDoc>,
    treasury_txs: Vec<TreasuryTransactionDoc>,
    investments: HashMap<String, InvestmentDoc>,
    investment_order: Vec<String>,
}

/// Ledger store held in process memory
#[derive(Default)]
pub struct MemoryLedgerStore {
    state: Mutex<MemoryState>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn find_or_create_escrow(
        &self,
        project_id: &str,
        currency: Currency,
    ) -> Result<(EscrowDoc, bool)> {
        let mut state = self.state.lock().await;
        let escrow_id = EscrowDoc::derive_id(project_id, currency);

        if let Some(existing) = state.escrows.get(&escrow_id) {
            return Ok((existing.clone(), false));
        }

        let escrow = EscrowDoc::new(project_id, currency);
        state.escrows.insert(escrow_id.clone(), escrow.clone());
        state.escrow_order.push(escrow_id);
        Ok((escrow, true))
    }

    async fn get_escrow(&self, escrow_id: &str) -> Result<Option<EscrowDoc>> {
        let state = self.state.lock().await;
        Ok(state.escrows.get(escrow_id).cloned())
    }

    async fn escrows_for_project(&self, project_id: &str) -> Result<Vec<EscrowDoc>> {
        let state = self.state.lock().await;
        Ok(state
            .escrow_order
            .iter()
            .filter_map(|id| state.escrows.get(id))
            .filter(|e| e.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn record_deposit(&self, deposit: DepositDoc, event: EscrowEventDoc) -> Result<DepositDoc> {
        let mut state = self.state.lock().await;

        if state.deposits.contains_key(&deposit.deposit_id) {
            return Err(LedgerError::Conflict(format!(
                "deposit {} already exists",
                deposit.deposit_id
            )));
        }
        if let Some(hash) = &deposit.tx_hash {
            if state
                .deposits
                .values()
                .any(|d| d.tx_hash.as_deref() == Some(hash.as_str()))
            {
                return Err(LedgerError::Conflict(format!(
                    "tx hash {} already recorded",
                    hash
                )));
            }
        }

        let escrow = state
            .escrows
            .get_mut(&deposit.escrow_id)
            .ok_or_else(|| LedgerError::NotFound(format!("escrow {}", deposit.escrow_id)))?;
        let new_total = escrow.total_locked.checked_add(deposit.amount)?;
        escrow.total_locked = new_total;
        escrow.deposits.push(deposit.deposit_id.clone());
        escrow.metadata.touch();

        state.deposit_order.push(deposit.deposit_id.clone());
        state.deposits.insert(deposit.deposit_id.clone(), deposit.clone());
        state.events.push(event);
        Ok(deposit)
    }

    async fn get_deposit(&self, deposit_id: &str) -> Result<Option<DepositDoc>> {
        let state = self.state.lock().await;
        Ok(state.deposits.get(deposit_id).cloned())
    }

    async fn deposits_for_escrow(&self, escrow_id: &str) -> Result<Vec<DepositDoc>> {
        let state = self.state.lock().await;
        Ok(state
            .deposit_order
            .iter()
            .filter_map(|id| state.deposits.get(id))
            .filter(|d| d.escrow_id == escrow_id)
            .cloned()
            .collect())
    }

    async fn deposits_by_tx_hash(&self, tx_hash: &str) -> Result<Vec<DepositDoc>> {
        let state = self.state.lock().await;
        Ok(state
            .deposit_order
            .iter()
            .filter_map(|id| state.deposits.get(id))
            .filter(|d| {
                d.tx_hash.as_deref() == Some(tx_hash)
                    || d.resolution_tx_hash.as_deref() == Some(tx_hash)
            })
            .cloned()
            .collect())
    }

    async fn transition_deposit(
        &self,
        deposit_id: &str,
        from: DepositStatus,
        to: DepositStatus,
        extra: &DepositStatusExtra,
        locked_delta: Amount,
    ) -> Result<DepositDoc> {
        let mut state = self.state.lock().await;

        let deposit = state
            .deposits
            .get(deposit_id)
            .ok_or_else(|| LedgerError::NotFound(format!("deposit {}", deposit_id)))?;
        if deposit.status != from {
            return Err(stale_status(
                "deposit",
                deposit_id,
                from.as_str(),
                deposit.status.as_str(),
            ));
        }
        let escrow_id = deposit.escrow_id.clone();

        // Overflow or a reservation shortfall aborts before the deposit changes
        if locked_delta != Amount::ZERO {
            let escrow = state
                .escrows
                .get_mut(&escrow_id)
                .ok_or_else(|| LedgerError::NotFound(format!("escrow {}", escrow_id)))?;
            if !escrow.can_absorb(locked_delta) {
                return Err(reservation_shortfall(escrow, deposit_id));
            }
            escrow.total_locked = escrow.total_locked.checked_add(locked_delta)?;
            escrow.metadata.touch();
        }

        let deposit = state
            .deposits
            .get_mut(deposit_id)
            .ok_or_else(|| LedgerError::NotFound(format!("deposit {}", deposit_id)))?;
        deposit.apply_status(to, extra);
        Ok(deposit.clone())
    }

    async fn insert_milestone_lock(&self, lock: MilestoneLockDoc) -> Result<MilestoneLockDoc> {
        let mut state = self.state.lock().await;

        let escrow = state
            .escrows
            .get_mut(&lock.escrow_id)
            .ok_or_else(|| LedgerError::NotFound(format!("escrow {}", lock.escrow_id)))?;

        if escrow.status != EscrowStatus::Active {
            return Err(LedgerError::InvalidTransition(format!(
                "escrow {} is {}",
                escrow.escrow_id,
                escrow.status.as_str()
            )));
        }
        if escrow.locked_by_milestone.iter().any(|m| {
            m.milestone_id == lock.milestone_id && m.status == MilestoneLockStatus::Locked
        }) {
            return Err(LedgerError::Conflict(format!(
                "milestone {} already has an active lock",
                lock.milestone_id
            )));
        }
        let unreserved = escrow.unreserved();
        if lock.amount > unreserved {
            return Err(LedgerError::InsufficientBalance(format!(
                "lock of {} exceeds unreserved escrow funds {}",
                lock.amount, unreserved
            )));
        }

        escrow.locked_by_milestone.push(EmbeddedMilestoneLock {
            lock_id: lock.lock_id.clone(),
            milestone_id: lock.milestone_id.clone(),
            amount: lock.amount,
            status: lock.status,
            locked_at: lock.locked_at,
            released_at: None,
        });
        escrow.metadata.touch();

        state.lock_order.push(lock.lock_id.clone());
        state.locks.insert(lock.lock_id.clone(), lock.clone());
        Ok(lock)
    }

    async fn get_milestone_lock(&self, lock_id: &str) -> Result<Option<MilestoneLockDoc>> {
        let state = self.state.lock().await;
        Ok(state.locks.get(lock_id).cloned())
    }

    async fn milestone_locks_for_escrow(&self, escrow_id: &str) -> Result<Vec<MilestoneLockDoc>> {
        let state = self.state.lock().await;
        Ok(state
            .lock_order
            .iter()
            .filter_map(|id| state.locks.get(id))
            .filter(|l| l.escrow_id == escrow_id)
            .cloned()
            .collect())
    }

    async fn add_milestone_approval(
        &self,
        lock_id: &str,
        approval: MilestoneApproval,
    ) -> Result<MilestoneLockDoc> {
        let mut state = self.state.lock().await;
        let lock = state
            .locks
            .get_mut(lock_id)
            .ok_or_else(|| LedgerError::NotFound(format!("milestone lock {}", lock_id)))?;

        if lock.status != MilestoneLockStatus::Locked {
            return Err(stale_status(
                "milestone lock",
                lock_id,
                MilestoneLockStatus::Locked.as_str(),
                lock.status.as_str(),
            ));
        }
        if lock.has_approval_from(&approval.approver) {
            return Err(LedgerError::Conflict(format!(
                "{} already approved milestone lock {}",
                approval.approver, lock_id
            )));
        }

        lock.approvals.push(approval);
        lock.metadata.touch();
        Ok(lock.clone())
    }

    async fn transition_milestone_lock(
        &self,
        lock_id: &str,
        from: MilestoneLockStatus,
        to: MilestoneLockStatus,
        release_tx_hash: Option<String>,
        reason: Option<String>,
    ) -> Result<MilestoneLockDoc> {
        let mut state = self.state.lock().await;
        let now = DateTime::now();

        let lock = state
            .locks
            .get_mut(lock_id)
            .ok_or_else(|| LedgerError::NotFound(format!("milestone lock {}", lock_id)))?;
        if lock.status != from {
            return Err(stale_status(
                "milestone lock",
                lock_id,
                from.as_str(),
                lock.status.as_str(),
            ));
        }

        lock.status = to;
        match to {
            MilestoneLockStatus::Released => lock.released_at = Some(now),
            MilestoneLockStatus::Cancelled => lock.cancelled_at = Some(now),
            MilestoneLockStatus::Locked => {}
        }
        if release_tx_hash.is_some() {
            lock.release_tx_hash = release_tx_hash;
        }
        if reason.is_some() {
            lock.reason = reason;
        }
        lock.metadata.touch();
        let updated = lock.clone();

        if let Some(escrow) = state.escrows.get_mut(&updated.escrow_id) {
            if let Some(view) = escrow
                .locked_by_milestone
                .iter_mut()
                .find(|m| m.lock_id == lock_id)
            {
                view.status = to;
                if to == MilestoneLockStatus::Released {
                    view.released_at = Some(now);
                }
            }
            escrow.metadata.touch();
        }

        Ok(updated)
    }

    async fn append_event(&self, event: EscrowEventDoc) -> Result<()> {
        let mut state = self.state.lock().await;
        state.events.push(event);
        Ok(())
    }

    async fn events_for_escrow(&self, escrow_id: &str) -> Result<Vec<EscrowEventDoc>> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .filter(|e| e.escrow_id.as_deref() == Some(escrow_id))
            .cloned()
            .collect())
    }

    async fn events_by_tx_hash(&self, tx_hash: &str) -> Result<Vec<EscrowEventDoc>> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .filter(|e| e.tx_hash.as_deref() == Some(tx_hash))
            .cloned()
            .collect())
    }

    async fn get_treasury_wallet(&self) -> Result<TreasuryWalletDoc> {
        let state = self.state.lock().await;
        Ok(state.wallet.clone().unwrap_or_default())
    }

    async fn commit_treasury(
        &self,
        tx: TreasuryTransactionDoc,
        delta: BalanceDelta,
    ) -> Result<TreasuryWalletDoc> {
        let mut state = self.state.lock().await;
        let current = state.wallet.clone().unwrap_or_default();
        let next = current.apply_delta(&delta)?;

        state.wallet = Some(next.clone());
        state.treasury_txs.push(tx);
        Ok(next)
    }

    async fn list_treasury_transactions(
        &self,
        filter: &TreasuryTxFilter,
        page: Page,
    ) -> Result<Paginated<TreasuryTransactionDoc>> {
        let state = self.state.lock().await;
        let matching: Vec<&TreasuryTransactionDoc> = state
            .treasury_txs
            .iter()
            .rev()
            .filter(|tx| filter.matches(tx))
            .collect();

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(page.skip() as usize)
            .take(page.limit as usize)
            .cloned()
            .collect();
        Ok(Paginated::new(items, total, page))
    }

    async fn all_treasury_transactions(&self) -> Result<Vec<TreasuryTransactionDoc>> {
        let state = self.state.lock().await;
        Ok(state.treasury_txs.clone())
    }

    async fn treasury_transactions_by_tx_hash(
        &self,
        tx_hash: &str,
    ) -> Result<Vec<TreasuryTransactionDoc>> {
        let state = self.state.lock().await;
        Ok(state
            .treasury_txs
            .iter()
            .filter(|tx| tx.tx_hash.as_deref() == Some(tx_hash))
            .cloned()
            .collect())
    }

    async fn insert_investment(&self, investment: InvestmentDoc) -> Result<InvestmentDoc> {
        let mut state = self.state.lock().await;
        if state.investments.contains_key(&investment.investment_id) {
            return Err(LedgerError::Conflict(format!(
                "investment {} already exists",
                investment.investment_id
            )));
        }
        state.investment_order.push(investment.investment_id.clone());
        state
            .investments
            .insert(investment.investment_id.clone(), investment.clone());
        Ok(investment)
    }

    async fn get_investment(&self, investment_id: &str) -> Result<Option<InvestmentDoc>> {
        let state = self.state.lock().await;
        Ok(state.investments.get(investment_id).cloned())
    }

    async fn investments_for_project(&self, project_id: &str) -> Result<Vec<InvestmentDoc>> {
        let state = self.state.lock().await;
        Ok(state
            .investment_order
            .iter()
            .filter_map(|id| state.investments.get(id))
            .filter(|i| i.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn investment_for_deposit(&self, deposit_id: &str) -> Result<Option<InvestmentDoc>> {
        let state = self.state.lock().await;
        Ok(state
            .investments
            .values()
            .find(|i| i.deposit_id == deposit_id)
            .cloned())
    }

    async fn transition_investment(
        &self,
        investment_id: &str,
        from: InvestmentStatus,
        change: StatusChange,
    ) -> Result<InvestmentDoc> {
        let mut state = self.state.lock().await;
        let investment = state
            .investments
            .get_mut(investment_id)
            .ok_or_else(|| LedgerError::NotFound(format!("investment {}", investment_id)))?;

        if investment.status != from {
            return Err(stale_status(
                "investment",
                investment_id,
                from.as_str(),
                investment.status.as_str(),
            ));
        }

        investment.status = change.to;
        investment.status_history.push(change);
        investment.metadata.touch();
        Ok(investment.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Actor;
    use crate::db::schemas::{DepositSource, EscrowEventType, Metadata, TreasuryTxType};

    fn deposit(escrow: &EscrowDoc, units: i64, tx_hash: Option<&str>) -> DepositDoc {
        DepositDoc {
            _id: None,
            metadata: Metadata::new(),
            deposit_id: uuid::Uuid::new_v4().to_string(),
            escrow_id: escrow.escrow_id.clone(),
            project_id: escrow.project_id.clone(),
            investor_id: "investor-1".into(),
            amount: Amount::from_units(units),
            currency: escrow.currency,
            source: DepositSource::Offchain,
            tx_hash: tx_hash.map(String::from),
            provider_tx_id: None,
            nft_id: None,
            status: DepositStatus::Pending,
            status_reason: None,
            resolution_tx_hash: None,
            status_changed_at: None,
            details: None,
        }
    }

    fn event(escrow: &EscrowDoc) -> EscrowEventDoc {
        EscrowEventDoc::new(
            Some(escrow.escrow_id.clone()),
            EscrowEventType::DepositCreated,
            serde_json::json!({}),
            None,
            &Actor::system(),
        )
    }

    #[tokio::test]
    async fn test_find_or_create_is_idempotent() {
        let store = MemoryLedgerStore::new();
        let (first, created) = store.find_or_create_escrow("p1", Currency::Eth).await.unwrap();
        let (second, created_again) = store.find_or_create_escrow("p1", Currency::Eth).await.unwrap();
        assert!(created);
        assert!(!created_again);
        assert_eq!(first.escrow_id, second.escrow_id);
        assert_eq!(store.escrows_for_project("p1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_record_deposit_rejects_reused_tx_hash() {
        let store = MemoryLedgerStore::new();
        let (escrow, _) = store.find_or_create_escrow("p1", Currency::Eth).await.unwrap();

        store
            .record_deposit(deposit(&escrow, 10, Some("0xaa")), event(&escrow))
            .await
            .unwrap();
        let err = store
            .record_deposit(deposit(&escrow, 20, Some("0xaa")), event(&escrow))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(_)));

        let escrow = store.get_escrow(&escrow.escrow_id).await.unwrap().unwrap();
        assert_eq!(escrow.total_locked, Amount::from_units(10));
        assert_eq!(escrow.deposits.len(), 1);
    }

    #[tokio::test]
    async fn test_transition_deposit_is_compare_and_set() {
        let store = MemoryLedgerStore::new();
        let (escrow, _) = store.find_or_create_escrow("p1", Currency::Usdc).await.unwrap();
        let d = store
            .record_deposit(deposit(&escrow, 40, None), event(&escrow))
            .await
            .unwrap();

        let refunded = store
            .transition_deposit(
                &d.deposit_id,
                DepositStatus::Pending,
                DepositStatus::Refunded,
                &DepositStatusExtra::default(),
                Amount::from_units(-40),
            )
            .await
            .unwrap();
        assert_eq!(refunded.status, DepositStatus::Refunded);

        let err = store
            .transition_deposit(
                &d.deposit_id,
                DepositStatus::Pending,
                DepositStatus::Confirmed,
                &DepositStatusExtra::default(),
                Amount::ZERO,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition(_)));

        let escrow = store.get_escrow(&escrow.escrow_id).await.unwrap().unwrap();
        assert_eq!(escrow.total_locked, Amount::ZERO);
    }

    #[tokio::test]
    async fn test_commit_treasury_is_all_or_nothing() {
        let store = MemoryLedgerStore::new();
        let fee = TreasuryTransactionDoc::new(
            TreasuryTxType::Fee,
            Amount::from_units(15),
            None,
            None,
            serde_json::Value::Null,
        );
        store
            .commit_treasury(fee, BalanceDelta::credit(Amount::from_units(15)))
            .await
            .unwrap();

        let withdrawal = TreasuryTransactionDoc::new(
            TreasuryTxType::Withdrawal,
            Amount::from_units(100),
            None,
            None,
            serde_json::Value::Null,
        );
        let err = store
            .commit_treasury(withdrawal, BalanceDelta::debit(Amount::from_units(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance(_)));

        let wallet = store.get_treasury_wallet().await.unwrap();
        assert_eq!(wallet.available_balance, Amount::from_units(15));
        assert_eq!(store.all_treasury_transactions().await.unwrap().len(), 1);
    }
}

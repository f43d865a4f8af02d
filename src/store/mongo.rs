//! MongoDB ledger store
//!
//! Counters move with `$inc`, status changes filter on the expected status,
//! and escrow creation leans on the unique (project_id, currency) index.
//! With `transactions` enabled the multi-document deposit writes share one
//! session transaction (requires a replica set).

use bson::{doc, DateTime, Document};
use mongodb::options::ReturnDocument;
use mongodb::ClientSession;
use tracing::{debug, error, warn};

use super::{
    reservation_shortfall, stale_status, LedgerStore, Page, Paginated, TreasuryTxFilter,
};
use crate::db::schemas::{
    BalanceDelta, DepositDoc, DepositStatus, DepositStatusExtra, EmbeddedMilestoneLock, EscrowDoc,
    EscrowEventDoc, EscrowStatus, InvestmentDoc, InvestmentStatus, MilestoneApproval,
    MilestoneLockDoc, MilestoneLockStatus, StatusChange, TreasuryTransactionDoc,
    TreasuryWalletDoc, DEPOSIT_COLLECTION, ESCROW_COLLECTION, ESCROW_EVENT_COLLECTION,
    INVESTMENT_COLLECTION, MILESTONE_LOCK_COLLECTION, TREASURY_TRANSACTION_COLLECTION,
    TREASURY_WALLET_COLLECTION, TREASURY_WALLET_ID,
};
use crate::db::{MongoClient, MongoCollection};
use crate::types::{Amount, Currency, LedgerError, Result};

/// Ledger store backed by MongoDB collections
#[derive(Clone)]
pub struct MongoLedgerStore {
    client: MongoClient,
    escrows: MongoCollection<EscrowDoc>,
    deposits: MongoCollection<DepositDoc>,
    locks: MongoCollection<MilestoneLockDoc>,
    events: MongoCollection<EscrowEventDoc>,
    wallets: MongoCollection<TreasuryWalletDoc>,
    treasury_txs: MongoCollection<TreasuryTransactionDoc>,
    investments: MongoCollection<InvestmentDoc>,
    transactions: bool,
}

impl MongoLedgerStore {
    /// Open every ledger collection, applying schema indexes
    pub async fn new(client: MongoClient, transactions: bool) -> Result<Self> {
        Ok(Self {
            escrows: client.collection(ESCROW_COLLECTION).await?,
            deposits: client.collection(DEPOSIT_COLLECTION).await?,
            locks: client.collection(MILESTONE_LOCK_COLLECTION).await?,
            events: client.collection(ESCROW_EVENT_COLLECTION).await?,
            wallets: client.collection(TREASURY_WALLET_COLLECTION).await?,
            treasury_txs: client.collection(TREASURY_TRANSACTION_COLLECTION).await?,
            investments: client.collection(INVESTMENT_COLLECTION).await?,
            client,
            transactions,
        })
    }

    async fn deposit_writes_in_session(
        &self,
        session: &mut ClientSession,
        deposit: &DepositDoc,
        event: &EscrowEventDoc,
    ) -> Result<()> {
        self.deposits
            .insert_one_with_session(deposit.clone(), session)
            .await?;
        let result = self
            .escrows
            .update_one_with_session(
                doc! { "escrow_id": deposit.escrow_id.as_str() },
                attach_deposit_update(deposit),
                session,
            )
            .await?;
        if result.matched_count == 0 {
            return Err(LedgerError::NotFound(format!("escrow {}", deposit.escrow_id)));
        }
        self.events.insert_one_with_session(event.clone(), session).await?;
        Ok(())
    }

    async fn deposit_transition_in_session(
        &self,
        session: &mut ClientSession,
        escrow_id: &str,
        deposit_id: &str,
        filter: Document,
        update: Document,
        locked_delta: Amount,
    ) -> Result<Option<DepositDoc>> {
        let moved = self
            .escrows
            .update_one_with_session(
                total_locked_filter(escrow_id, locked_delta),
                doc! { "$inc": { "total_locked": locked_delta.units() } },
                session,
            )
            .await?;
        if moved.matched_count == 0 {
            return Err(self.total_locked_miss(escrow_id, deposit_id).await);
        }

        Ok(self
            .deposits
            .inner()
            .find_one_and_update(filter, update)
            .return_document(ReturnDocument::After)
            .session(&mut *session)
            .await?)
    }

    /// Explain why a guarded `total_locked` adjustment matched nothing
    async fn total_locked_miss(&self, escrow_id: &str, deposit_id: &str) -> LedgerError {
        match self.get_escrow(escrow_id).await {
            Ok(Some(escrow)) => reservation_shortfall(&escrow, deposit_id),
            Ok(None) => LedgerError::NotFound(format!("escrow {}", escrow_id)),
            Err(e) => e,
        }
    }

    /// Reverse a `total_locked` adjustment whose deposit update did not land
    async fn undo_total_locked(&self, escrow_id: &str, deposit_id: &str, locked_delta: Amount) {
        if let Err(e) = self
            .escrows
            .update_one(
                doc! { "escrow_id": escrow_id },
                doc! { "$inc": { "total_locked": -locked_delta.units() } },
            )
            .await
        {
            error!(
                deposit_id,
                escrow_id,
                delta = %locked_delta,
                error = %e,
                "escrow total adjusted without its deposit status change"
            );
        }
    }

    /// Explain why a deposit compare-and-set matched nothing
    async fn deposit_miss(&self, deposit_id: &str, from: DepositStatus) -> LedgerError {
        match self.get_deposit(deposit_id).await {
            Ok(Some(d)) => stale_status("deposit", deposit_id, from.as_str(), d.status.as_str()),
            Ok(None) => LedgerError::NotFound(format!("deposit {}", deposit_id)),
            Err(e) => e,
        }
    }

    async fn lock_miss(&self, lock_id: &str, from: MilestoneLockStatus) -> LedgerError {
        match self.get_milestone_lock(lock_id).await {
            Ok(Some(l)) => stale_status("milestone lock", lock_id, from.as_str(), l.status.as_str()),
            Ok(None) => LedgerError::NotFound(format!("milestone lock {}", lock_id)),
            Err(e) => e,
        }
    }

    /// Create the singleton wallet with zero balances if it does not exist
    async fn ensure_wallet(&self) -> Result<()> {
        let now = DateTime::now();
        let result = self
            .wallets
            .find_one_and_update(
                doc! { "wallet_id": TREASURY_WALLET_ID },
                doc! { "$setOnInsert": {
                    "total_balance": 0_i64,
                    "available_balance": 0_i64,
                    "reserved_balance": 0_i64,
                    "metadata.created_at": now,
                    "metadata.updated_at": now,
                } },
                true,
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            // A concurrent upsert won; the wallet exists
            Err(LedgerError::Conflict(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

async fn abort(session: &mut ClientSession, subject: &str) {
    if let Err(e) = session.abort_transaction().await {
        warn!(subject, error = %e, "transaction abort failed");
    }
}

/// Escrow filter for a `total_locked` move. Decreases only match while the
/// result still covers every LOCKED or RELEASED milestone amount.
fn total_locked_filter(escrow_id: &str, locked_delta: Amount) -> Document {
    let mut filter = doc! { "escrow_id": escrow_id };
    if locked_delta.is_negative() {
        filter.insert(
            "$expr",
            doc! { "$gte": [
                { "$add": ["$total_locked", locked_delta.units()] },
                reserved_expr(),
            ] },
        );
    }
    filter
}

fn attach_deposit_update(deposit: &DepositDoc) -> Document {
    doc! {
        "$push": { "deposits": deposit.deposit_id.as_str() },
        "$inc": { "total_locked": deposit.amount.units() },
    }
}

fn deposit_status_update(to: DepositStatus, extra: &DepositStatusExtra) -> Document {
    let now = DateTime::now();
    let mut set = doc! {
        "status": to.as_str(),
        "status_changed_at": now,
        "metadata.updated_at": now,
    };
    if let Some(reason) = &extra.reason {
        set.insert("status_reason", reason.as_str());
    }
    if let Some(hash) = &extra.resolution_tx_hash {
        set.insert("resolution_tx_hash", hash.as_str());
    }
    doc! { "$set": set }
}

/// Sum of the LOCKED and RELEASED milestone amounts embedded in an escrow,
/// as an aggregation expression
fn reserved_expr() -> Document {
    doc! {
        "$sum": {
            "$map": {
                "input": {
                    "$filter": {
                        "input": { "$ifNull": ["$locked_by_milestone", []] },
                        "as": "m",
                        "cond": { "$ne": ["$$m.status", MilestoneLockStatus::Cancelled.as_str()] },
                    }
                },
                "as": "m",
                "in": "$$m.amount",
            }
        }
    }
}

#[async_trait::async_trait]
impl LedgerStore for MongoLedgerStore {
    async fn find_or_create_escrow(
        &self,
        project_id: &str,
        currency: Currency,
    ) -> Result<(EscrowDoc, bool)> {
        let filter = doc! { "project_id": project_id, "currency": currency.as_str() };

        if let Some(existing) = self.escrows.find_one(filter.clone()).await? {
            return Ok((existing, false));
        }

        let escrow = EscrowDoc::new(project_id, currency);
        match self.escrows.insert_one(escrow.clone()).await {
            Ok(_) => Ok((escrow, true)),
            Err(LedgerError::Conflict(_)) => {
                // Lost the creation race; read the winner's record
                debug!(project_id, currency = %currency, "escrow created concurrently, re-reading");
                self.escrows
                    .find_one(filter)
                    .await?
                    .map(|e| (e, false))
                    .ok_or_else(|| {
                        LedgerError::Internal(format!(
                            "escrow for {}/{} missing after duplicate key",
                            project_id, currency
                        ))
                    })
            }
            Err(e) => Err(e),
        }
    }

    async fn get_escrow(&self, escrow_id: &str) -> Result<Option<EscrowDoc>> {
        self.escrows.find_one(doc! { "escrow_id": escrow_id }).await
    }

    async fn escrows_for_project(&self, project_id: &str) -> Result<Vec<EscrowDoc>> {
        self.escrows
            .find_sorted(
                doc! { "project_id": project_id },
                doc! { "metadata.created_at": 1, "_id": 1 },
                None,
                None,
            )
            .await
    }

    async fn record_deposit(&self, deposit: DepositDoc, event: EscrowEventDoc) -> Result<DepositDoc> {
        if self.transactions {
            let mut session = self.client.start_session().await?;
            session.start_transaction().await?;
            match self.deposit_writes_in_session(&mut session, &deposit, &event).await {
                Ok(()) => session.commit_transaction().await?,
                Err(e) => {
                    abort(&mut session, &deposit.deposit_id).await;
                    return Err(e);
                }
            }
            return Ok(deposit);
        }

        self.deposits.insert_one(deposit.clone()).await?;
        let result = self
            .escrows
            .update_one(
                doc! { "escrow_id": deposit.escrow_id.as_str() },
                attach_deposit_update(&deposit),
            )
            .await?;
        if result.matched_count == 0 {
            error!(
                deposit_id = %deposit.deposit_id,
                escrow_id = %deposit.escrow_id,
                "deposit stored but escrow missing"
            );
            return Err(LedgerError::NotFound(format!("escrow {}", deposit.escrow_id)));
        }
        self.events.insert_one(event).await?;
        Ok(deposit)
    }

    async fn get_deposit(&self, deposit_id: &str) -> Result<Option<DepositDoc>> {
        self.deposits.find_one(doc! { "deposit_id": deposit_id }).await
    }

    async fn deposits_for_escrow(&self, escrow_id: &str) -> Result<Vec<DepositDoc>> {
        self.deposits
            .find_sorted(
                doc! { "escrow_id": escrow_id },
                doc! { "metadata.created_at": 1, "_id": 1 },
                None,
                None,
            )
            .await
    }

    async fn deposits_by_tx_hash(&self, tx_hash: &str) -> Result<Vec<DepositDoc>> {
        self.deposits
            .find_sorted(
                doc! { "$or": [ { "tx_hash": tx_hash }, { "resolution_tx_hash": tx_hash } ] },
                doc! { "metadata.created_at": 1, "_id": 1 },
                None,
                None,
            )
            .await
    }

    async fn transition_deposit(
        &self,
        deposit_id: &str,
        from: DepositStatus,
        to: DepositStatus,
        extra: &DepositStatusExtra,
        locked_delta: Amount,
    ) -> Result<DepositDoc> {
        let filter = doc! { "deposit_id": deposit_id, "status": from.as_str() };
        let update = deposit_status_update(to, extra);

        if locked_delta == Amount::ZERO {
            return match self.deposits.find_one_and_update(filter, update, false).await? {
                Some(deposit) => Ok(deposit),
                None => Err(self.deposit_miss(deposit_id, from).await),
            };
        }

        let escrow_id = match self.get_deposit(deposit_id).await? {
            Some(d) if d.status == from => d.escrow_id,
            Some(d) => return Err(stale_status("deposit", deposit_id, from.as_str(), d.status.as_str())),
            None => return Err(LedgerError::NotFound(format!("deposit {}", deposit_id))),
        };

        if self.transactions {
            let mut session = self.client.start_session().await?;
            session.start_transaction().await?;
            let outcome = self
                .deposit_transition_in_session(
                    &mut session,
                    &escrow_id,
                    deposit_id,
                    filter,
                    update,
                    locked_delta,
                )
                .await;
            return match outcome {
                Ok(Some(deposit)) => {
                    session.commit_transaction().await?;
                    Ok(deposit)
                }
                Ok(None) => {
                    abort(&mut session, deposit_id).await;
                    Err(self.deposit_miss(deposit_id, from).await)
                }
                Err(e) => {
                    abort(&mut session, deposit_id).await;
                    Err(e)
                }
            };
        }

        // The guarded escrow move goes first; a lost deposit race gives it back
        let moved = self
            .escrows
            .update_one(
                total_locked_filter(&escrow_id, locked_delta),
                doc! { "$inc": { "total_locked": locked_delta.units() } },
            )
            .await?;
        if moved.matched_count == 0 {
            return Err(self.total_locked_miss(&escrow_id, deposit_id).await);
        }

        match self.deposits.find_one_and_update(filter, update, false).await {
            Ok(Some(deposit)) => Ok(deposit),
            Ok(None) => {
                self.undo_total_locked(&escrow_id, deposit_id, locked_delta).await;
                Err(self.deposit_miss(deposit_id, from).await)
            }
            Err(e) => {
                self.undo_total_locked(&escrow_id, deposit_id, locked_delta).await;
                Err(e)
            }
        }
    }

    async fn insert_milestone_lock(&self, lock: MilestoneLockDoc) -> Result<MilestoneLockDoc> {
        let embedded = bson::to_bson(&EmbeddedMilestoneLock {
            lock_id: lock.lock_id.clone(),
            milestone_id: lock.milestone_id.clone(),
            amount: lock.amount,
            status: lock.status,
            locked_at: lock.locked_at,
            released_at: None,
        })?;

        // Reserve on the escrow only if the milestone is free and the amount fits
        let filter = doc! {
            "escrow_id": lock.escrow_id.as_str(),
            "status": EscrowStatus::Active.as_str(),
            "locked_by_milestone": { "$not": { "$elemMatch": {
                "milestone_id": lock.milestone_id.as_str(),
                "status": MilestoneLockStatus::Locked.as_str(),
            } } },
            "$expr": { "$gte": [
                { "$subtract": ["$total_locked", reserved_expr()] },
                lock.amount.units(),
            ] },
        };
        let result = self
            .escrows
            .update_one(filter, doc! { "$push": { "locked_by_milestone": embedded } })
            .await?;

        if result.matched_count == 0 {
            let escrow = self
                .get_escrow(&lock.escrow_id)
                .await?
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
            return Err(LedgerError::InsufficientBalance(format!(
                "lock of {} exceeds unreserved escrow funds {}",
                lock.amount,
                escrow.unreserved()
            )));
        }

        if let Err(e) = self.locks.insert_one(lock.clone()).await {
            // Give the reservation back
            if let Err(undo) = self
                .escrows
                .update_one(
                    doc! { "escrow_id": lock.escrow_id.as_str() },
                    doc! { "$pull": { "locked_by_milestone": { "lock_id": lock.lock_id.as_str() } } },
                )
                .await
            {
                error!(lock_id = %lock.lock_id, error = %undo, "failed to roll back milestone reservation");
            }
            return Err(e);
        }
        Ok(lock)
    }

    async fn get_milestone_lock(&self, lock_id: &str) -> Result<Option<MilestoneLockDoc>> {
        self.locks.find_one(doc! { "lock_id": lock_id }).await
    }

    async fn milestone_locks_for_escrow(&self, escrow_id: &str) -> Result<Vec<MilestoneLockDoc>> {
        self.locks
            .find_sorted(
                doc! { "escrow_id": escrow_id },
                doc! { "locked_at": 1, "_id": 1 },
                None,
                None,
            )
            .await
    }

    async fn add_milestone_approval(
        &self,
        lock_id: &str,
        approval: MilestoneApproval,
    ) -> Result<MilestoneLockDoc> {
        let filter = doc! {
            "lock_id": lock_id,
            "status": MilestoneLockStatus::Locked.as_str(),
            "approvals.approver": { "$ne": approval.approver.as_str() },
        };
        let update = doc! {
            "$push": { "approvals": bson::to_bson(&approval)? },
            "$set": { "metadata.updated_at": DateTime::now() },
        };

        if let Some(lock) = self.locks.find_one_and_update(filter, update, false).await? {
            return Ok(lock);
        }

        match self.get_milestone_lock(lock_id).await? {
            None => Err(LedgerError::NotFound(format!("milestone lock {}", lock_id))),
            Some(lock) if lock.status != MilestoneLockStatus::Locked => Err(stale_status(
                "milestone lock",
                lock_id,
                MilestoneLockStatus::Locked.as_str(),
                lock.status.as_str(),
            )),
            Some(_) => Err(LedgerError::Conflict(format!(
                "{} already approved milestone lock {}",
                approval.approver, lock_id
            ))),
        }
    }

    async fn transition_milestone_lock(
        &self,
        lock_id: &str,
        from: MilestoneLockStatus,
        to: MilestoneLockStatus,
        release_tx_hash: Option<String>,
        reason: Option<String>,
    ) -> Result<MilestoneLockDoc> {
        let now = DateTime::now();
        let mut set = doc! { "status": to.as_str(), "metadata.updated_at": now };
        match to {
            MilestoneLockStatus::Released => {
                set.insert("released_at", now);
            }
            MilestoneLockStatus::Cancelled => {
                set.insert("cancelled_at", now);
            }
            MilestoneLockStatus::Locked => {}
        }
        if let Some(hash) = release_tx_hash {
            set.insert("release_tx_hash", hash);
        }
        if let Some(reason) = reason {
            set.insert("reason", reason);
        }

        let Some(lock) = self
            .locks
            .find_one_and_update(
                doc! { "lock_id": lock_id, "status": from.as_str() },
                doc! { "$set": set },
                false,
            )
            .await?
        else {
            return Err(self.lock_miss(lock_id, from).await);
        };

        // Mirror into the escrow's live view
        let mut view = doc! { "locked_by_milestone.$.status": to.as_str() };
        if to == MilestoneLockStatus::Released {
            view.insert("locked_by_milestone.$.released_at", now);
        }
        self.escrows
            .update_one(
                doc! { "escrow_id": lock.escrow_id.as_str(), "locked_by_milestone.lock_id": lock_id },
                doc! { "$set": view },
            )
            .await?;

        Ok(lock)
    }

    async fn append_event(&self, event: EscrowEventDoc) -> Result<()> {
        self.events.insert_one(event).await?;
        Ok(())
    }

    async fn events_for_escrow(&self, escrow_id: &str) -> Result<Vec<EscrowEventDoc>> {
        self.events
            .find_sorted(
                doc! { "escrow_id": escrow_id },
                doc! { "created_at": 1, "_id": 1 },
                None,
                None,
            )
            .await
    }

    async fn events_by_tx_hash(&self, tx_hash: &str) -> Result<Vec<EscrowEventDoc>> {
        self.events
            .find_sorted(
                doc! { "tx_hash": tx_hash },
                doc! { "created_at": 1, "_id": 1 },
                None,
                None,
            )
            .await
    }

    async fn get_treasury_wallet(&self) -> Result<TreasuryWalletDoc> {
        Ok(self
            .wallets
            .find_one(doc! { "wallet_id": TREASURY_WALLET_ID })
            .await?
            .unwrap_or_default())
    }

    async fn commit_treasury(
        &self,
        tx: TreasuryTransactionDoc,
        delta: BalanceDelta,
    ) -> Result<TreasuryWalletDoc> {
        self.ensure_wallet().await?;

        // Matches only when every balance stays non-negative after the $inc
        let filter = doc! {
            "wallet_id": TREASURY_WALLET_ID,
            "total_balance": { "$gte": -delta.total.units() },
            "available_balance": { "$gte": -delta.available.units() },
            "reserved_balance": { "$gte": -delta.reserved.units() },
        };
        let update = doc! {
            "$inc": {
                "total_balance": delta.total.units(),
                "available_balance": delta.available.units(),
                "reserved_balance": delta.reserved.units(),
            },
            "$set": { "metadata.updated_at": DateTime::now() },
        };

        let Some(wallet) = self.wallets.find_one_and_update(filter, update, false).await? else {
            let current = self.get_treasury_wallet().await?;
            return Err(LedgerError::InsufficientBalance(format!(
                "{} of {} exceeds treasury balances (total={} available={} reserved={})",
                tx.tx_type.as_str(),
                tx.amount,
                current.total_balance,
                current.available_balance,
                current.reserved_balance
            )));
        };

        let transaction_id = tx.transaction_id.clone();
        if let Err(e) = self.treasury_txs.insert_one(tx).await {
            let undo = doc! { "$inc": {
                "total_balance": -delta.total.units(),
                "available_balance": -delta.available.units(),
                "reserved_balance": -delta.reserved.units(),
            } };
            if let Err(undo_err) = self
                .wallets
                .update_one(doc! { "wallet_id": TREASURY_WALLET_ID }, undo)
                .await
            {
                error!(
                    transaction_id = %transaction_id,
                    error = %undo_err,
                    "treasury delta applied without its transaction record"
                );
            }
            return Err(e);
        }

        Ok(wallet)
    }

    async fn list_treasury_transactions(
        &self,
        filter: &TreasuryTxFilter,
        page: Page,
    ) -> Result<Paginated<TreasuryTransactionDoc>> {
        let query = filter.to_document();
        let total = self.treasury_txs.count(query.clone()).await?;
        let items = self
            .treasury_txs
            .find_sorted(
                query,
                doc! { "created_at": -1, "_id": -1 },
                Some(page.skip()),
                Some(page.limit as i64),
            )
            .await?;
        Ok(Paginated::new(items, total, page))
    }

    async fn all_treasury_transactions(&self) -> Result<Vec<TreasuryTransactionDoc>> {
        self.treasury_txs
            .find_sorted(doc! {}, doc! { "created_at": 1, "_id": 1 }, None, None)
            .await
    }

    async fn treasury_transactions_by_tx_hash(
        &self,
        tx_hash: &str,
    ) -> Result<Vec<TreasuryTransactionDoc>> {
        self.treasury_txs
            .find_sorted(
                doc! { "tx_hash": tx_hash },
                doc! { "created_at": 1, "_id": 1 },
                None,
                None,
            )
            .await
    }

    async fn insert_investment(&self, investment: InvestmentDoc) -> Result<InvestmentDoc> {
        self.investments.insert_one(investment.clone()).await?;
        Ok(investment)
    }

    async fn get_investment(&self, investment_id: &str) -> Result<Option<InvestmentDoc>> {
        self.investments
            .find_one(doc! { "investment_id": investment_id })
            .await
    }

    async fn investments_for_project(&self, project_id: &str) -> Result<Vec<InvestmentDoc>> {
        self.investments
            .find_sorted(
                doc! { "project_id": project_id },
                doc! { "metadata.created_at": 1, "_id": 1 },
                None,
                None,
            )
            .await
    }

    async fn investment_for_deposit(&self, deposit_id: &str) -> Result<Option<InvestmentDoc>> {
        self.investments.find_one(doc! { "deposit_id": deposit_id }).await
    }

    async fn transition_investment(
        &self,
        investment_id: &str,
        from: InvestmentStatus,
        change: StatusChange,
    ) -> Result<InvestmentDoc> {
        let update = doc! {
            "$set": { "status": change.to.as_str(), "metadata.updated_at": DateTime::now() },
            "$push": { "status_history": bson::to_bson(&change)? },
        };

        if let Some(investment) = self
            .investments
            .find_one_and_update(
                doc! { "investment_id": investment_id, "status": from.as_str() },
                update,
                false,
            )
            .await?
        {
            return Ok(investment);
        }

        match self.get_investment(investment_id).await? {
            Some(current) => Err(stale_status(
                "investment",
                investment_id,
                from.as_str(),
                current.status.as_str(),
            )),
            None => Err(LedgerError::NotFound(format!("investment {}", investment_id))),
        }
    }
}

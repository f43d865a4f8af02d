//! Ledger store
//!
//! Persistence for escrows, deposits, milestone locks, the event log, the
//! treasury and investments. Every method is scoped to one aggregate and is
//! atomic with respect to concurrent callers: counters move by delta, status
//! changes are compare-and-set, and find-or-create relies on a uniqueness
//! constraint rather than a prior read.

pub mod memory;
pub mod mongo;

pub use memory::MemoryLedgerStore;
pub use mongo::MongoLedgerStore;

use bson::DateTime;
use serde::Serialize;

use crate::db::schemas::{
    BalanceDelta, DepositDoc, DepositStatus, DepositStatusExtra, EscrowDoc, EscrowEventDoc,
    InvestmentDoc, InvestmentStatus, MilestoneApproval, MilestoneLockDoc, MilestoneLockStatus,
    StatusChange, TreasuryTransactionDoc, TreasuryTxType, TreasuryWalletDoc,
};
use crate::types::{Amount, Currency, LedgerError, Result};

// ============================================================================
// Query types
// ============================================================================

/// Default page size for listings
pub const DEFAULT_PAGE_LIMIT: u64 = 20;

/// Largest page size a caller may ask for
pub const MAX_PAGE_LIMIT: u64 = 100;

/// Validated pagination window (1-based page)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: u64,
    pub limit: u64,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            page: 1,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl Page {
    pub fn new(page: Option<u64>, limit: Option<u64>) -> Result<Self> {
        let page = page.unwrap_or(1);
        let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT);
        if page < 1 {
            return Err(LedgerError::BadRequest("page must be >= 1".into()));
        }
        if !(1..=MAX_PAGE_LIMIT).contains(&limit) {
            return Err(LedgerError::BadRequest(format!(
                "limit must be between 1 and {}",
                MAX_PAGE_LIMIT
            )));
        }
        Ok(Self { page, limit })
    }

    pub fn skip(&self) -> u64 {
        (self.page - 1) * self.limit
    }
}

/// One page of results
#[derive(Debug, Clone, Serialize)]
pub struct Paginated<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u64,
    pub limit: u64,
    pub total_pages: u64,
}

impl<T> Paginated<T> {
    pub fn new(items: Vec<T>, total: u64, page: Page) -> Self {
        Self {
            items,
            total,
            page: page.page,
            limit: page.limit,
            total_pages: total.div_ceil(page.limit),
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Paginated<U> {
        Paginated {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            page: self.page,
            limit: self.limit,
            total_pages: self.total_pages,
        }
    }
}

/// Treasury transaction listing filter. All bounds are inclusive.
#[derive(Debug, Clone, Default)]
pub struct TreasuryTxFilter {
    pub tx_type: Option<TreasuryTxType>,
    pub from: Option<DateTime>,
    pub to: Option<DateTime>,
    pub min_amount: Option<Amount>,
    pub max_amount: Option<Amount>,
}

impl TreasuryTxFilter {
    pub fn matches(&self, tx: &TreasuryTransactionDoc) -> bool {
        self.tx_type.map_or(true, |t| tx.tx_type == t)
            && self.from.map_or(true, |from| tx.created_at >= from)
            && self.to.map_or(true, |to| tx.created_at <= to)
            && self.min_amount.map_or(true, |min| tx.amount >= min)
            && self.max_amount.map_or(true, |max| tx.amount <= max)
    }

    /// MongoDB query document for this filter
    pub fn to_document(&self) -> bson::Document {
        let mut filter = bson::Document::new();
        if let Some(t) = self.tx_type {
            filter.insert("type", t.as_str());
        }

        let mut created = bson::Document::new();
        if let Some(from) = self.from {
            created.insert("$gte", from);
        }
        if let Some(to) = self.to {
            created.insert("$lte", to);
        }
        if !created.is_empty() {
            filter.insert("created_at", created);
        }

        let mut amount = bson::Document::new();
        if let Some(min) = self.min_amount {
            amount.insert("$gte", min.units());
        }
        if let Some(max) = self.max_amount {
            amount.insert("$lte", max.units());
        }
        if !amount.is_empty() {
            filter.insert("amount", amount);
        }

        filter
    }
}

// ============================================================================
// Store trait
// ============================================================================

/// Persistence contract of the ledger
#[async_trait::async_trait]
pub trait LedgerStore: Send + Sync {
    // --- escrows ---

    /// Return the escrow for (project, currency), creating it if absent.
    /// The flag is true when this call created it.
    async fn find_or_create_escrow(
        &self,
        project_id: &str,
        currency: Currency,
    ) -> Result<(EscrowDoc, bool)>;

    async fn get_escrow(&self, escrow_id: &str) -> Result<Option<EscrowDoc>>;

    /// Escrows of a project, oldest first
    async fn escrows_for_project(&self, project_id: &str) -> Result<Vec<EscrowDoc>>;

    // --- deposits ---

    /// Insert the deposit, attach it to its escrow, add its amount to
    /// `total_locked` and append the event.
    async fn record_deposit(&self, deposit: DepositDoc, event: EscrowEventDoc) -> Result<DepositDoc>;

    async fn get_deposit(&self, deposit_id: &str) -> Result<Option<DepositDoc>>;

    /// Deposits of an escrow, oldest first
    async fn deposits_for_escrow(&self, escrow_id: &str) -> Result<Vec<DepositDoc>>;

    /// Deposits whose funding or resolution transaction is `tx_hash`
    async fn deposits_by_tx_hash(&self, tx_hash: &str) -> Result<Vec<DepositDoc>>;

    /// Compare-and-set the deposit status and move the owning escrow's
    /// `total_locked` by `locked_delta` in the same step. A decrease that
    /// would leave less than the milestone reservations fails with
    /// `InsufficientBalance` and changes nothing.
    async fn transition_deposit(
        &self,
        deposit_id: &str,
        from: DepositStatus,
        to: DepositStatus,
        extra: &DepositStatusExtra,
        locked_delta: Amount,
    ) -> Result<DepositDoc>;

    // --- milestone locks ---

    /// Insert a LOCKED lock and push its live view onto the escrow. Fails with
    /// `InsufficientBalance` when the amount exceeds the unreserved funds and
    /// `Conflict` when the milestone already has an active lock.
    async fn insert_milestone_lock(&self, lock: MilestoneLockDoc) -> Result<MilestoneLockDoc>;

    async fn get_milestone_lock(&self, lock_id: &str) -> Result<Option<MilestoneLockDoc>>;

    async fn milestone_locks_for_escrow(&self, escrow_id: &str) -> Result<Vec<MilestoneLockDoc>>;

    /// Append an approval to a LOCKED lock; a repeated approver is a `Conflict`
    async fn add_milestone_approval(
        &self,
        lock_id: &str,
        approval: MilestoneApproval,
    ) -> Result<MilestoneLockDoc>;

    /// Compare-and-set the lock status, mirrored into the escrow's live view
    async fn transition_milestone_lock(
        &self,
        lock_id: &str,
        from: MilestoneLockStatus,
        to: MilestoneLockStatus,
        release_tx_hash: Option<String>,
        reason: Option<String>,
    ) -> Result<MilestoneLockDoc>;

    // --- event log ---

    async fn append_event(&self, event: EscrowEventDoc) -> Result<()>;

    /// Events of an escrow in chronological order
    async fn events_for_escrow(&self, escrow_id: &str) -> Result<Vec<EscrowEventDoc>>;

    /// Events correlated with a chain transaction, chronological
    async fn events_by_tx_hash(&self, tx_hash: &str) -> Result<Vec<EscrowEventDoc>>;

    // --- treasury ---

    /// Current wallet, zero balances if never written
    async fn get_treasury_wallet(&self) -> Result<TreasuryWalletDoc>;

    /// Apply `delta` to the wallet and record `tx`. Nothing is applied when
    /// any resulting balance would be negative.
    async fn commit_treasury(
        &self,
        tx: TreasuryTransactionDoc,
        delta: BalanceDelta,
    ) -> Result<TreasuryWalletDoc>;

    /// Newest first
    async fn list_treasury_transactions(
        &self,
        filter: &TreasuryTxFilter,
        page: Page,
    ) -> Result<Paginated<TreasuryTransactionDoc>>;

    /// Every treasury transaction, oldest first
    async fn all_treasury_transactions(&self) -> Result<Vec<TreasuryTransactionDoc>>;

    async fn treasury_transactions_by_tx_hash(
        &self,
        tx_hash: &str,
    ) -> Result<Vec<TreasuryTransactionDoc>>;

    // --- investments ---

    async fn insert_investment(&self, investment: InvestmentDoc) -> Result<InvestmentDoc>;

    async fn get_investment(&self, investment_id: &str) -> Result<Option<InvestmentDoc>>;

    /// Investments of a project, oldest first
    async fn investments_for_project(&self, project_id: &str) -> Result<Vec<InvestmentDoc>>;

    /// The investment a deposit was booked for, if any
    async fn investment_for_deposit(&self, deposit_id: &str) -> Result<Option<InvestmentDoc>>;

    /// Compare-and-set the investment status and append the history entry
    async fn transition_investment(
        &self,
        investment_id: &str,
        from: InvestmentStatus,
        change: StatusChange,
    ) -> Result<InvestmentDoc>;
}

/// Error for a compare-and-set that found the record in another state
pub(crate) fn stale_status(kind: &str, id: &str, expected: &str, actual: &str) -> LedgerError {
    LedgerError::InvalidTransition(format!(
        "{} {} is {}, expected {}",
        kind, id, actual, expected
    ))
}

/// Error for a deposit exit that would strand milestone reservations
pub(crate) fn reservation_shortfall(escrow: &EscrowDoc, deposit_id: &str) -> LedgerError {
    LedgerError::InsufficientBalance(format!(
        "deposit {} cannot leave escrow {}: {} of {} is reserved by milestones",
        deposit_id,
        escrow.escrow_id,
        escrow.reserved_by_milestones(),
        escrow.total_locked
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_bounds() {
        assert_eq!(Page::new(None, None).unwrap(), Page::default());
        assert!(Page::new(Some(0), None).is_err());
        assert!(Page::new(None, Some(0)).is_err());
        assert!(Page::new(None, Some(101)).is_err());
        assert_eq!(Page::new(Some(3), Some(10)).unwrap().skip(), 20);
    }

    #[test]
    fn test_total_pages_rounds_up() {
        let page = Page::new(Some(1), Some(20)).unwrap();
        assert_eq!(Paginated::<u8>::new(vec![], 41, page).total_pages, 3);
        assert_eq!(Paginated::<u8>::new(vec![], 0, page).total_pages, 0);
    }

    #[test]
    fn test_filter_document() {
        let filter = TreasuryTxFilter {
            tx_type: Some(TreasuryTxType::Fee),
            min_amount: Some(Amount::from_units(5)),
            ..Default::default()
        };
        let doc = filter.to_document();
        assert_eq!(doc.get_str("type").unwrap(), "FEE");
        assert_eq!(doc.get_document("amount").unwrap().get_i64("$gte").unwrap(), 5);
        assert!(!doc.contains_key("created_at"));
    }

    #[test]
    fn test_filter_matches_amount_range() {
        let tx = TreasuryTransactionDoc::new(
            TreasuryTxType::Donation,
            Amount::from_units(50),
            None,
            None,
            serde_json::Value::Null,
        );
        let within = TreasuryTxFilter {
            min_amount: Some(Amount::from_units(50)),
            max_amount: Some(Amount::from_units(60)),
            ..Default::default()
        };
        assert!(within.matches(&tx));
        let wrong_type = TreasuryTxFilter {
            tx_type: Some(TreasuryTxType::Fee),
            ..Default::default()
        };
        assert!(!wrong_type.matches(&tx));
    }
}

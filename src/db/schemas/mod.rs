//! Database schemas for fundledger
//!
//! Defines MongoDB document structures for escrows, deposits, milestone
//! locks, the event log, the treasury and investments, plus the read models
//! of the project and user collections the ledger consults.

mod deposit;
mod escrow;
mod escrow_event;
mod investment;
mod metadata;
mod milestone_lock;
mod project;
mod treasury;
mod user;

pub use deposit::{DepositDoc, DepositSource, DepositStatus, DepositStatusExtra, DEPOSIT_COLLECTION};
pub use escrow::{EmbeddedMilestoneLock, EscrowDoc, EscrowStatus, ESCROW_COLLECTION};
pub use escrow_event::{EscrowEventDoc, EscrowEventType, EventActor, ESCROW_EVENT_COLLECTION};
pub use investment::{InvestmentDoc, InvestmentStatus, StatusChange, INVESTMENT_COLLECTION};
pub use metadata::Metadata;
pub use milestone_lock::{
    MilestoneApproval, MilestoneLockDoc, MilestoneLockStatus, MILESTONE_LOCK_COLLECTION,
};
pub use project::{
    ProjectDoc, ProjectKind, ProjectMilestone, ProjectStatus, VerificationDecision,
    PROJECT_COLLECTION,
};
pub use treasury::{
    BalanceDelta, TreasuryTransactionDoc, TreasuryTxType, TreasuryWalletDoc,
    TREASURY_TRANSACTION_COLLECTION, TREASURY_WALLET_COLLECTION, TREASURY_WALLET_ID,
};
pub use user::{KycStatus, UserDoc, USER_COLLECTION};

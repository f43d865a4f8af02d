//! External collaborators of the ledger
//!
//! ## Services
//!
//! - **Chain settlement**: submits deposits, releases, refunds, withdrawals and
//!   distributions to the settlement gateway and returns receipts
//! - **Project**: open-for-investment checks, funding counters, milestone verification
//! - **Profile**: investor account status and KYC state

pub mod chain;
pub mod profile;
pub mod project;

pub use chain::{
    ChainReceipt, ChainRecipient, ChainSettlement, DepositRequest, DistributionRequest,
    HttpChainSettlement, ReceiptStatus, RefundRequest, ReleaseRequest, SimulatedChainSettlement,
    WithdrawRequest,
};
pub use profile::{InMemoryProfileService, InvestorProfile, MongoProfileService, ProfileService};
pub use project::{InMemoryProjectService, MongoProjectService, ProjectService};

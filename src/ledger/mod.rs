//! Financial ledger core
//!
//! ## Components
//!
//! - **EscrowLedger**: escrows per (project, currency), deposits, `total_locked`
//! - **MilestoneLockManager**: milestone reservations, approvals, releases
//! - **TreasuryWallet**: platform balances and their transaction history
//! - **InvestmentStateMachine**: investor records tied to escrow deposits
//! - **EventLog**: append-only audit trail, queryable by chain tx hash
//!
//! All components share one `LedgerStore` and one settlement collaborator.

pub mod escrow;
pub mod events;
pub mod investment;
pub mod milestone;
pub mod treasury;

pub use escrow::{DepositReceipt, EscrowLedger, EscrowView, NewDeposit};
pub use events::{EventLog, TxReconciliation};
pub use investment::{InvestmentStateMachine, NewInvestment};
pub use milestone::{ApprovalPolicy, MilestoneLockManager};
pub use treasury::{MonthBucket, Recipient, TreasurySummary, TreasuryWallet, TypeTotal, Withdrawal};

use std::sync::Arc;

use crate::auth::CapabilityTable;
use crate::services::{ChainSettlement, ProfileService, ProjectService};
use crate::store::LedgerStore;

/// Collaborators the ledger is assembled from
pub struct LedgerDeps {
    pub store: Arc<dyn LedgerStore>,
    pub chain: Arc<dyn ChainSettlement>,
    pub projects: Arc<dyn ProjectService>,
    pub profiles: Arc<dyn ProfileService>,
    pub capabilities: Arc<CapabilityTable>,
    pub approval_policy: ApprovalPolicy,
}

/// The assembled ledger
#[derive(Clone)]
pub struct Ledger {
    pub escrow: Arc<EscrowLedger>,
    pub milestones: Arc<MilestoneLockManager>,
    pub treasury: Arc<TreasuryWallet>,
    pub investments: Arc<InvestmentStateMachine>,
    pub events: EventLog,
}

impl Ledger {
    pub fn new(deps: LedgerDeps) -> Self {
        let events = EventLog::new(deps.store.clone());

        let escrow = Arc::new(EscrowLedger::new(
            deps.store.clone(),
            deps.chain.clone(),
            events.clone(),
            deps.capabilities.clone(),
        ));
        let milestones = Arc::new(MilestoneLockManager::new(
            deps.store.clone(),
            deps.chain.clone(),
            deps.projects.clone(),
            events.clone(),
            deps.capabilities.clone(),
            deps.approval_policy,
        ));
        let treasury = Arc::new(TreasuryWallet::new(
            deps.store.clone(),
            deps.chain.clone(),
            deps.capabilities.clone(),
        ));
        let investments = Arc::new(InvestmentStateMachine::new(
            deps.store,
            deps.chain,
            deps.projects,
            deps.profiles,
            escrow.clone(),
            events.clone(),
            deps.capabilities,
        ));

        Self {
            escrow,
            milestones,
            treasury,
            investments,
            events,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory ledger wiring shared by the component tests

    use super::*;
    use crate::auth::{Actor, Role};
    use crate::db::schemas::{ProjectDoc, ProjectKind};
    use crate::services::{InMemoryProfileService, InMemoryProjectService, SimulatedChainSettlement};
    use crate::store::MemoryLedgerStore;
    use crate::types::Amount;

    pub struct Harness {
        pub ledger: Ledger,
        pub chain: Arc<SimulatedChainSettlement>,
        pub projects: Arc<InMemoryProjectService>,
        pub profiles: Arc<InMemoryProfileService>,
    }

    impl Harness {
        pub fn new() -> Self {
            Self::with_policy(ApprovalPolicy::default())
        }

        pub fn with_policy(approval_policy: ApprovalPolicy) -> Self {
            let chain = Arc::new(SimulatedChainSettlement::new());
            let projects = Arc::new(InMemoryProjectService::new());
            let profiles = Arc::new(InMemoryProfileService::new());

            let ledger = Ledger::new(LedgerDeps {
                store: Arc::new(MemoryLedgerStore::new()),
                chain: chain.clone(),
                projects: projects.clone(),
                profiles: profiles.clone(),
                capabilities: Arc::new(CapabilityTable::default()),
                approval_policy,
            });

            Self {
                ledger,
                chain,
                projects,
                profiles,
            }
        }

        /// Register an open ROI project
        pub fn register_project(&self, project_id: &str) {
            self.projects.insert(ProjectDoc::new(
                project_id,
                "Community solar",
                "creator-1",
                Amount::from_units(1_000_000 * 100_000_000),
                ProjectKind::Roi {
                    expected_roi_bps: 650,
                    term_months: 24,
                },
            ));
        }
    }

    pub fn admin() -> Actor {
        Actor::new("admin-1", vec![Role::Admin])
    }

    pub fn investor(id: &str) -> Actor {
        Actor::new(id, vec![Role::Investor])
    }
}

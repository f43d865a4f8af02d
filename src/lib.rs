//! fundledger - escrow, treasury and investment ledger
//!
//! Holds investor funds for crowdfunding projects until milestones are
//! verified, keeps the platform treasury and records every mutation in an
//! append-only event log keyed by escrow and chain transaction hash.
//!
//! ## Components
//!
//! - **Escrow**: per project and currency holding accounts and their deposits
//! - **Milestones**: reservations of escrowed funds released on verification
//! - **Treasury**: platform wallet for fees, donations, withdrawals and distributions
//! - **Investments**: investment lifecycle settled through the chain gateway
//! - **Events**: audit trail and tx hash reconciliation

pub mod auth;
pub mod config;
pub mod db;
pub mod ledger;
pub mod routes;
pub mod server;
pub mod services;
pub mod store;
pub mod types;

pub use config::Args;
pub use ledger::{Ledger, LedgerDeps};
pub use server::{run, AppState};
pub use types::{LedgerError, Result};

//! HTTP server
//!
//! Exposes the ledger over JSON. The server layer owns authentication and
//! routing; all ledger semantics live in the `ledger` module.

pub mod http;

pub use http::{run, AppState};

//! Event log
//!
//! Append-only audit trail of ledger mutations, readable per escrow and per
//! chain transaction hash. Nothing here updates or deletes an event.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::auth::Actor;
use crate::db::schemas::{DepositDoc, EscrowEventDoc, EscrowEventType, TreasuryTransactionDoc};
use crate::store::LedgerStore;
use crate::types::{LedgerError, Result};

/// Everything the ledger knows about one chain transaction
#[derive(Debug, Clone, Serialize)]
pub struct TxReconciliation {
    pub tx_hash: String,
    pub events: Vec<EscrowEventDoc>,
    pub deposits: Vec<DepositDoc>,
    pub treasury_transactions: Vec<TreasuryTransactionDoc>,
}

impl TxReconciliation {
    /// Whether any off-chain record references the hash
    pub fn is_known(&self) -> bool {
        !self.events.is_empty() || !self.deposits.is_empty() || !self.treasury_transactions.is_empty()
    }
}

#[derive(Clone)]
pub struct EventLog {
    store: Arc<dyn LedgerStore>,
}

impl EventLog {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Append one event
    pub async fn record(
        &self,
        escrow_id: Option<&str>,
        event_type: EscrowEventType,
        payload: serde_json::Value,
        tx_hash: Option<&str>,
        actor: &Actor,
    ) -> Result<EscrowEventDoc> {
        let event = EscrowEventDoc::new(
            escrow_id.map(String::from),
            event_type,
            payload,
            tx_hash.map(String::from),
            actor,
        );
        debug!(
            event_id = %event.event_id,
            event_type = event_type.as_str(),
            escrow_id = ?escrow_id,
            tx_hash = ?tx_hash,
            "ledger event"
        );
        self.store.append_event(event.clone()).await?;
        Ok(event)
    }

    /// Events of one escrow, oldest first
    pub async fn for_escrow(&self, escrow_id: &str) -> Result<Vec<EscrowEventDoc>> {
        self.store.events_for_escrow(escrow_id).await
    }

    /// Events sharing a chain transaction hash, oldest first
    pub async fn by_tx_hash(&self, tx_hash: &str) -> Result<Vec<EscrowEventDoc>> {
        let tx_hash = normalize_tx_hash(tx_hash)?;
        self.store.events_by_tx_hash(tx_hash).await
    }

    /// Cross-reference every off-chain record carrying `tx_hash`
    pub async fn reconcile_tx(&self, tx_hash: &str) -> Result<TxReconciliation> {
        let tx_hash = normalize_tx_hash(tx_hash)?;
        let (events, deposits, treasury_transactions) = futures::try_join!(
            self.store.events_by_tx_hash(tx_hash),
            self.store.deposits_by_tx_hash(tx_hash),
            self.store.treasury_transactions_by_tx_hash(tx_hash),
        )?;
        Ok(TxReconciliation {
            tx_hash: tx_hash.to_string(),
            events,
            deposits,
            treasury_transactions,
        })
    }
}

fn normalize_tx_hash(tx_hash: &str) -> Result<&str> {
    let trimmed = tx_hash.trim();
    if trimmed.is_empty() {
        return Err(LedgerError::BadRequest("txHash is required".into()));
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryLedgerStore;

    #[tokio::test]
    async fn test_events_are_grouped_and_ordered() {
        let log = EventLog::new(Arc::new(MemoryLedgerStore::new()));
        let actor = Actor::system();

        log.record(Some("e1"), EscrowEventType::EscrowCreated, serde_json::json!({}), None, &actor)
            .await
            .unwrap();
        log.record(Some("e1"), EscrowEventType::DepositCreated, serde_json::json!({}), Some("0xa"), &actor)
            .await
            .unwrap();
        log.record(Some("e2"), EscrowEventType::DepositRefunded, serde_json::json!({}), Some("0xa"), &actor)
            .await
            .unwrap();

        let e1: Vec<_> = log
            .for_escrow("e1")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(e1, vec![EscrowEventType::EscrowCreated, EscrowEventType::DepositCreated]);

        let by_hash = log.by_tx_hash("0xa").await.unwrap();
        assert_eq!(by_hash.len(), 2);
        assert_eq!(by_hash[0].escrow_id.as_deref(), Some("e1"));
        assert_eq!(by_hash[1].escrow_id.as_deref(), Some("e2"));
    }

    #[tokio::test]
    async fn test_reconcile_unknown_hash() {
        let log = EventLog::new(Arc::new(MemoryLedgerStore::new()));
        let report = log.reconcile_tx("0xnothing").await.unwrap();
        assert!(!report.is_known());
        assert!(matches!(log.reconcile_tx("  ").await, Err(LedgerError::BadRequest(_))));
    }
}

//! Chain settlement collaborator
//!
//! The ledger never signs or submits transactions itself. It asks a
//! settlement gateway to do so and blocks for the resulting hash and
//! receipt. Two implementations:
//!
//! - `HttpChainSettlement`: JSON over HTTP to the settlement gateway, with a
//!   per-attempt timeout and bounded retries of transport failures. Each
//!   logical call carries one `Idempotency-Key` reused across its retries.
//! - `SimulatedChainSettlement`: in-process stand-in for dev mode and tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::SettlementArgs;
use crate::types::{amount_string, Amount, Currency, LedgerError, Result};

// ============================================================================
// Types
// ============================================================================

/// Outcome reported by the gateway for a submitted transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Confirmed,
    Failed,
}

/// Transaction hash plus receipt status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainReceipt {
    pub tx_hash: String,
    pub status: ReceiptStatus,
}

impl ChainReceipt {
    /// A failed receipt is a failed call
    pub fn ensure_confirmed(self, operation: &str) -> Result<Self> {
        match self.status {
            ReceiptStatus::Confirmed => Ok(self),
            ReceiptStatus::Failed => Err(LedgerError::ChainCallFailed(format!(
                "{} transaction {} reverted",
                operation, self.tx_hash
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DepositRequest {
    pub project_id: String,
    pub investor_id: String,
    #[serde(with = "amount_string")]
    pub amount: Amount,
    pub currency: Currency,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReleaseRequest {
    pub project_id: String,
    pub escrow_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub milestone_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deposit_id: Option<String>,
    #[serde(with = "amount_string")]
    pub amount: Amount,
    pub currency: Currency,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefundRequest {
    pub project_id: String,
    pub escrow_id: String,
    pub deposit_id: String,
    pub investor_id: String,
    #[serde(with = "amount_string")]
    pub amount: Amount,
    pub currency: Currency,
}

#[derive(Debug, Clone, Serialize)]
pub struct WithdrawRequest {
    pub destination: String,
    #[serde(with = "amount_string")]
    pub amount: Amount,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainRecipient {
    pub wallet: String,
    #[serde(with = "amount_string")]
    pub amount: Amount,
}

#[derive(Debug, Clone, Serialize)]
pub struct DistributionRequest {
    pub recipients: Vec<ChainRecipient>,
}

/// Settlement operations the ledger depends on
#[async_trait::async_trait]
pub trait ChainSettlement: Send + Sync {
    /// Confirm that an investor-submitted deposit transaction exists and succeeded
    async fn verify_deposit_tx(&self, tx_hash: &str) -> Result<ChainReceipt>;

    async fn deposit_onchain(&self, request: &DepositRequest) -> Result<ChainReceipt>;

    async fn release_onchain(&self, request: &ReleaseRequest) -> Result<ChainReceipt>;

    async fn refund_onchain(&self, request: &RefundRequest) -> Result<ChainReceipt>;

    async fn admin_withdraw(&self, request: &WithdrawRequest) -> Result<ChainReceipt>;

    /// One multi-recipient transaction
    async fn distribute_funds(&self, request: &DistributionRequest) -> Result<ChainReceipt>;
}

// ============================================================================
// HTTP gateway
// ============================================================================

#[derive(Serialize)]
struct GatewayRequest<'a, B: Serialize> {
    contract_address: &'a str,
    #[serde(flatten)]
    payload: &'a B,
}

#[derive(Deserialize)]
struct GatewayError {
    #[serde(default)]
    error: String,
}

/// Settlement gateway client
pub struct HttpChainSettlement {
    client: reqwest::Client,
    base_url: String,
    contract_address: String,
    admin_key: String,
    timeout: Duration,
    max_retries: u32,
}

impl HttpChainSettlement {
    /// Build from configuration; every connection setting is required
    pub fn from_args(args: &SettlementArgs) -> Result<Self> {
        let base_url = args
            .settlement_url
            .clone()
            .ok_or_else(|| LedgerError::ConfigurationMissing("SETTLEMENT_URL".into()))?;
        let contract_address = args.contract_address.clone().ok_or_else(|| {
            LedgerError::ConfigurationMissing("SETTLEMENT_CONTRACT_ADDRESS".into())
        })?;
        let admin_key = args
            .admin_key
            .clone()
            .ok_or_else(|| LedgerError::ConfigurationMissing("SETTLEMENT_ADMIN_KEY".into()))?;

        let client = reqwest::Client::builder()
            .user_agent(concat!("fundledger/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| LedgerError::Internal(format!("HTTP client: {}", e)))?;

        info!(
            url = %base_url,
            contract = %contract_address,
            timeout_ms = args.timeout_ms,
            max_retries = args.max_retries,
            "Chain settlement gateway configured"
        );

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            contract_address,
            admin_key,
            timeout: args.timeout(),
            max_retries: args.max_retries,
        })
    }

    async fn call<B: Serialize + Sync>(&self, operation: &str, payload: &B) -> Result<ChainReceipt> {
        let idempotency_key = uuid::Uuid::new_v4().to_string();
        let url = format!("{}/{}", self.base_url, operation);
        let body = GatewayRequest {
            contract_address: &self.contract_address,
            payload,
        };

        let mut last_error = String::new();
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = Duration::from_millis(200 * (1u64 << attempt.min(5)));
                debug!(operation, attempt, ?backoff, "retrying settlement call");
                tokio::time::sleep(backoff).await;
            }

            let request = self
                .client
                .post(&url)
                .bearer_auth(&self.admin_key)
                .header("Idempotency-Key", idempotency_key.as_str())
                .json(&body)
                .send();

            let response = match tokio::time::timeout(self.timeout, request).await {
                Err(_) => {
                    last_error = format!("timed out after {:?}", self.timeout);
                    warn!(operation, attempt, "settlement call timed out");
                    continue;
                }
                Ok(Err(e)) => {
                    last_error = e.to_string();
                    warn!(operation, attempt, error = %e, "settlement transport error");
                    continue;
                }
                Ok(Ok(response)) => response,
            };

            let status = response.status();
            if !status.is_success() {
                // The gateway answered: a rejection is final
                let text = response.text().await.unwrap_or_default();
                let message = serde_json::from_str::<GatewayError>(&text)
                    .map(|e| e.error)
                    .ok()
                    .filter(|m| !m.is_empty())
                    .unwrap_or(text);
                return Err(LedgerError::ChainCallFailed(format!(
                    "{} rejected ({}): {}",
                    operation, status, message
                )));
            }

            let receipt: ChainReceipt = response.json().await.map_err(|e| {
                LedgerError::ChainCallFailed(format!("{} returned an invalid receipt: {}", operation, e))
            })?;
            info!(operation, tx_hash = %receipt.tx_hash, status = ?receipt.status, "settlement receipt");
            return receipt.ensure_confirmed(operation);
        }

        Err(LedgerError::ChainCallFailed(format!(
            "{} failed after {} attempt(s): {}",
            operation,
            self.max_retries + 1,
            last_error
        )))
    }
}

#[derive(Serialize)]
struct VerifyDepositBody<'a> {
    tx_hash: &'a str,
}

#[async_trait::async_trait]
impl ChainSettlement for HttpChainSettlement {
    async fn verify_deposit_tx(&self, tx_hash: &str) -> Result<ChainReceipt> {
        self.call("verify-deposit", &VerifyDepositBody { tx_hash }).await
    }

    async fn deposit_onchain(&self, request: &DepositRequest) -> Result<ChainReceipt> {
        self.call("deposit", request).await
    }

    async fn release_onchain(&self, request: &ReleaseRequest) -> Result<ChainReceipt> {
        self.call("release", request).await
    }

    async fn refund_onchain(&self, request: &RefundRequest) -> Result<ChainReceipt> {
        self.call("refund", request).await
    }

    async fn admin_withdraw(&self, request: &WithdrawRequest) -> Result<ChainReceipt> {
        self.call("withdraw", request).await
    }

    async fn distribute_funds(&self, request: &DistributionRequest) -> Result<ChainReceipt> {
        self.call("distribute", request).await
    }
}

// ============================================================================
// Simulated settlement
// ============================================================================

/// A call seen by the simulator
#[derive(Debug, Clone)]
pub struct SimulatedCall {
    pub operation: &'static str,
    pub payload: serde_json::Value,
}

/// In-process settlement with deterministic hashes.
///
/// Hashes are `0x` + sha256 of the operation, payload and a call sequence
/// number, so a fresh simulator replays the same hashes for the same calls.
#[derive(Default)]
pub struct SimulatedChainSettlement {
    sequence: AtomicU64,
    /// Calls by resulting tx hash
    calls: DashMap<String, SimulatedCall>,
    /// Operations forced to fail, with the failure message
    failures: DashMap<&'static str, String>,
}

impl SimulatedChainSettlement {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later call of `operation` fail with `ChainCallFailed`
    pub fn fail_operation(&self, operation: &'static str, message: &str) {
        self.failures.insert(operation, message.to_string());
    }

    pub fn clear_failures(&self) {
        self.failures.clear();
    }

    /// Number of successful calls of an operation
    pub fn call_count(&self, operation: &str) -> usize {
        self.calls
            .iter()
            .filter(|entry| entry.value().operation == operation)
            .count()
    }

    pub fn call(&self, tx_hash: &str) -> Option<SimulatedCall> {
        self.calls.get(tx_hash).map(|entry| entry.value().clone())
    }

    fn submit<B: Serialize>(&self, operation: &'static str, payload: &B) -> Result<ChainReceipt> {
        if let Some(message) = self.failures.get(operation) {
            return Err(LedgerError::ChainCallFailed(format!(
                "{}: {}",
                operation,
                message.value()
            )));
        }

        let payload = serde_json::to_value(payload)
            .map_err(|e| LedgerError::Internal(format!("settlement payload: {}", e)))?;
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);

        let mut hasher = Sha256::new();
        hasher.update(operation.as_bytes());
        hasher.update(payload.to_string().as_bytes());
        hasher.update(sequence.to_be_bytes());
        let tx_hash = format!("0x{}", hex::encode(hasher.finalize()));

        debug!(operation, tx_hash = %tx_hash, "simulated settlement");
        self.calls
            .insert(tx_hash.clone(), SimulatedCall { operation, payload });

        Ok(ChainReceipt {
            tx_hash,
            status: ReceiptStatus::Confirmed,
        })
    }
}

#[async_trait::async_trait]
impl ChainSettlement for SimulatedChainSettlement {
    async fn verify_deposit_tx(&self, tx_hash: &str) -> Result<ChainReceipt> {
        if let Some(message) = self.failures.get("verify-deposit") {
            return Err(LedgerError::ChainCallFailed(format!(
                "verify-deposit {}: {}",
                tx_hash,
                message.value()
            )));
        }
        Ok(ChainReceipt {
            tx_hash: tx_hash.to_string(),
            status: ReceiptStatus::Confirmed,
        })
    }

    async fn deposit_onchain(&self, request: &DepositRequest) -> Result<ChainReceipt> {
        self.submit("deposit", request)
    }

    async fn release_onchain(&self, request: &ReleaseRequest) -> Result<ChainReceipt> {
        self.submit("release", request)
    }

    async fn refund_onchain(&self, request: &RefundRequest) -> Result<ChainReceipt> {
        self.submit("refund", request)
    }

    async fn admin_withdraw(&self, request: &WithdrawRequest) -> Result<ChainReceipt> {
        self.submit("withdraw", request)
    }

    async fn distribute_funds(&self, request: &DistributionRequest) -> Result<ChainReceipt> {
        self.submit("distribute", request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn withdraw(units: i64) -> WithdrawRequest {
        WithdrawRequest {
            destination: "0xdead".into(),
            amount: Amount::from_units(units),
        }
    }

    #[tokio::test]
    async fn test_simulated_hashes_are_deterministic() {
        let a = SimulatedChainSettlement::new();
        let b = SimulatedChainSettlement::new();
        let ra = a.admin_withdraw(&withdraw(5)).await.unwrap();
        let rb = b.admin_withdraw(&withdraw(5)).await.unwrap();
        assert_eq!(ra.tx_hash, rb.tx_hash);
        assert!(ra.tx_hash.starts_with("0x"));
        assert_eq!(ra.tx_hash.len(), 66);

        // Same payload again gets a new hash
        let again = a.admin_withdraw(&withdraw(5)).await.unwrap();
        assert_ne!(again.tx_hash, ra.tx_hash);
        assert_eq!(a.call_count("withdraw"), 2);
    }

    #[tokio::test]
    async fn test_simulated_failures() {
        let chain = SimulatedChainSettlement::new();
        chain.fail_operation("withdraw", "node unreachable");
        let err = assert_err!(chain.admin_withdraw(&withdraw(1)).await);
        assert!(matches!(err, LedgerError::ChainCallFailed(_)));

        chain.clear_failures();
        assert_ok!(chain.admin_withdraw(&withdraw(1)).await);
    }

    #[test]
    fn test_payload_amounts_are_decimal_strings() {
        let json = serde_json::to_value(withdraw(150_000_000)).unwrap();
        assert_eq!(json["amount"], "1.5");
    }

    #[test]
    fn test_failed_receipt_is_an_error() {
        let receipt = ChainReceipt {
            tx_hash: "0x1".into(),
            status: ReceiptStatus::Failed,
        };
        assert!(matches!(
            receipt.ensure_confirmed("release"),
            Err(LedgerError::ChainCallFailed(_))
        ));
    }

    #[test]
    fn test_http_settlement_requires_configuration() {
        let args = SettlementArgs {
            settlement_url: Some("http://localhost:9000".into()),
            contract_address: None,
            admin_key: Some("key".into()),
            timeout_ms: 1000,
            max_retries: 0,
        };
        assert!(matches!(
            HttpChainSettlement::from_args(&args),
            Err(LedgerError::ConfigurationMissing(_))
        ));
    }

    #[tokio::test]
    async fn test_http_settlement_fails_after_retries_on_transport_errors() {
        // Nothing listens on port 9; every attempt is a transport error
        let args = SettlementArgs {
            settlement_url: Some("http://127.0.0.1:9".into()),
            contract_address: Some("0xcontract".into()),
            admin_key: Some("key".into()),
            timeout_ms: 500,
            max_retries: 1,
        };
        let chain = HttpChainSettlement::from_args(&args).unwrap();
        let err = chain.admin_withdraw(&withdraw(1)).await.unwrap_err();
        match err {
            LedgerError::ChainCallFailed(message) => assert!(message.contains("2 attempt")),
            other => panic!("unexpected error {:?}", other),
        }
    }
}

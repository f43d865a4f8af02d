//! Treasury endpoints
//!
//! ## Writes
//! - `POST /api/v1/treasury/fees`
//! - `POST /api/v1/treasury/donations`
//! - `POST /api/v1/treasury/withdrawals`
//! - `POST /api/v1/treasury/distributions`
//! - `POST /api/v1/treasury/reserve`
//! - `POST /api/v1/treasury/reserve/release`
//! - `POST /api/v1/treasury/refunds`
//!
//! ## Reads
//! - `GET /api/v1/treasury/balance`
//! - `GET /api/v1/treasury/summary`
//! - `GET /api/v1/treasury/transactions?type=&from=&to=&minAmount=&maxAmount=&page=&limit=`

use std::collections::HashMap;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::{Method, Request, Response};
use serde::{Deserialize, Serialize};

use super::{amount_json, created, ok, parse_query, query_u64, read_json, timestamp, AmountInput, FullBody};
use crate::auth::Actor;
use crate::db::schemas::{TreasuryTransactionDoc, TreasuryTxType, TreasuryWalletDoc};
use crate::ledger::{MonthBucket, Recipient, TreasurySummary, TypeTotal, Withdrawal};
use crate::server::http::not_found;
use crate::server::AppState;
use crate::store::{Page, TreasuryTxFilter};
use crate::types::{Amount, LedgerError, Result};

// =============================================================================
// Request Types
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomeRequest {
    pub amount: AmountInput,
    pub tx_hash: Option<String>,
    #[serde(default)]
    pub details: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalRequest {
    pub amount: AmountInput,
    pub destination: Option<String>,
    pub tx_hash: Option<String>,
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipientRequest {
    pub recipient_id: String,
    pub wallet: Option<String>,
    pub amount: AmountInput,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionRequest {
    pub recipients: Vec<RecipientRequest>,
    pub tx_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReserveRequest {
    pub amount: AmountInput,
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundRequest {
    pub amount: AmountInput,
    pub tx_hash: Option<String>,
    pub reason: Option<String>,
}

// =============================================================================
// Response Types
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionDto {
    pub transaction_id: String,
    #[serde(rename = "type")]
    pub tx_type: &'static str,
    pub amount: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initiated_by: Option<String>,
    pub details: serde_json::Value,
    pub created_at: String,
}

impl From<TreasuryTransactionDoc> for TransactionDto {
    fn from(tx: TreasuryTransactionDoc) -> Self {
        Self {
            transaction_id: tx.transaction_id,
            tx_type: tx.tx_type.as_str(),
            amount: amount_json(tx.amount),
            tx_hash: tx.tx_hash,
            initiated_by: tx.initiated_by,
            details: tx.details,
            created_at: timestamp(tx.created_at),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceDto {
    pub wallet_id: String,
    pub total_balance: f64,
    pub available_balance: f64,
    pub reserved_balance: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl From<TreasuryWalletDoc> for BalanceDto {
    fn from(w: TreasuryWalletDoc) -> Self {
        Self {
            wallet_id: w.wallet_id,
            total_balance: amount_json(w.total_balance),
            available_balance: amount_json(w.available_balance),
            reserved_balance: amount_json(w.reserved_balance),
            updated_at: w.metadata.updated_at.map(timestamp),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeTotalDto {
    pub amount: f64,
    pub count: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthDto {
    pub month: String,
    pub fees: f64,
    pub donations: f64,
    pub distributions: f64,
}

impl From<MonthBucket> for MonthDto {
    fn from(m: MonthBucket) -> Self {
        Self {
            month: m.month,
            fees: amount_json(m.fees),
            donations: amount_json(m.donations),
            distributions: amount_json(m.distributions),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryDto {
    pub balance: BalanceDto,
    /// Keyed by transaction type
    pub totals: HashMap<&'static str, TypeTotalDto>,
    pub transaction_count: u64,
    pub monthly: Vec<MonthDto>,
}

impl From<TreasurySummary> for SummaryDto {
    fn from(s: TreasurySummary) -> Self {
        let totals = s
            .totals
            .into_iter()
            .map(|TypeTotal { tx_type, amount, count }| {
                (
                    tx_type.as_str(),
                    TypeTotalDto {
                        amount: amount_json(amount),
                        count,
                    },
                )
            })
            .collect();
        Self {
            balance: s.balance.into(),
            totals,
            transaction_count: s.transaction_count,
            monthly: s.monthly.into_iter().map(Into::into).collect(),
        }
    }
}

// =============================================================================
// Router
// =============================================================================

pub async fn handle_treasury_request(
    req: Request<Incoming>,
    state: Arc<AppState>,
    actor: Actor,
    subpath: &str,
) -> Result<Response<FullBody>> {
    let method = req.method().clone();
    let treasury = &state.ledger.treasury;

    match (&method, subpath.trim_end_matches('/')) {
        (&Method::POST, "/fees") => {
            let body: IncomeRequest = read_json(req).await?;
            let tx = treasury
                .record_fee(body.amount.positive()?, body.tx_hash, body.details, &actor)
                .await?;
            created(&TransactionDto::from(tx))
        }
        (&Method::POST, "/donations") => {
            let body: IncomeRequest = read_json(req).await?;
            let tx = treasury
                .record_donation(body.amount.positive()?, body.tx_hash, body.details, &actor)
                .await?;
            created(&TransactionDto::from(tx))
        }
        (&Method::POST, "/withdrawals") => {
            let body: WithdrawalRequest = read_json(req).await?;
            let withdrawal = Withdrawal {
                amount: body.amount.positive()?,
                destination: body.destination,
                tx_hash: body.tx_hash,
                note: body.note,
            };
            created(&TransactionDto::from(treasury.withdraw(withdrawal, &actor).await?))
        }
        (&Method::POST, "/distributions") => {
            let body: DistributionRequest = read_json(req).await?;
            let recipients = body
                .recipients
                .into_iter()
                .map(|r| {
                    Ok(Recipient {
                        recipient_id: r.recipient_id,
                        wallet: r.wallet,
                        amount: r.amount.positive()?,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            let tx = treasury.distribute(recipients, body.tx_hash, &actor).await?;
            created(&TransactionDto::from(tx))
        }
        (&Method::POST, "/reserve") => {
            let body: ReserveRequest = read_json(req).await?;
            let tx = treasury.reserve(body.amount.positive()?, body.note, &actor).await?;
            created(&TransactionDto::from(tx))
        }
        (&Method::POST, "/reserve/release") => {
            let body: ReserveRequest = read_json(req).await?;
            let tx = treasury
                .release_reserve(body.amount.positive()?, body.note, &actor)
                .await?;
            created(&TransactionDto::from(tx))
        }
        (&Method::POST, "/refunds") => {
            let body: RefundRequest = read_json(req).await?;
            let tx = treasury
                .record_refund(body.amount.positive()?, body.tx_hash, body.reason, &actor)
                .await?;
            created(&TransactionDto::from(tx))
        }
        (&Method::GET, "/balance") => ok(&BalanceDto::from(treasury.get_balance(&actor).await?)),
        (&Method::GET, "/summary") => ok(&SummaryDto::from(treasury.get_summary(&actor).await?)),
        (&Method::GET, "/transactions") => {
            let params = parse_query(req.uri().query());
            let filter = parse_filter(&params)?;
            let page = Page::new(query_u64(&params, "page")?, query_u64(&params, "limit")?)?;
            let listing = treasury.list_transactions(&filter, page, &actor).await?;
            ok(&listing.map(TransactionDto::from))
        }
        _ => Err(not_found(&method, subpath)),
    }
}

fn parse_filter(params: &HashMap<String, String>) -> Result<TreasuryTxFilter> {
    Ok(TreasuryTxFilter {
        tx_type: params.get("type").map(|t| t.parse::<TreasuryTxType>()).transpose()?,
        from: params.get("from").map(|v| parse_datetime("from", v)).transpose()?,
        to: params.get("to").map(|v| parse_datetime("to", v)).transpose()?,
        min_amount: params.get("minAmount").map(|v| parse_bound("minAmount", v)).transpose()?,
        max_amount: params.get("maxAmount").map(|v| parse_bound("maxAmount", v)).transpose()?,
    })
}

fn parse_datetime(key: &str, value: &str) -> Result<bson::DateTime> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|dt| bson::DateTime::from_chrono(dt.with_timezone(&chrono::Utc)))
        .map_err(|_| LedgerError::BadRequest(format!("{} must be an RFC 3339 timestamp", key)))
}

fn parse_bound(key: &str, value: &str) -> Result<Amount> {
    let amount: Amount = value.parse()?;
    if amount.is_negative() {
        return Err(LedgerError::BadRequest(format!("{} must not be negative", key)));
    }
    Ok(amount)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(query: &str) -> HashMap<String, String> {
        parse_query(Some(query))
    }

    #[test]
    fn test_parse_filter_reads_all_bounds() {
        let filter = parse_filter(&params(
            "type=fee&from=2024-01-01T00%3A00%3A00Z&to=2024-02-01T00%3A00%3A00%2B01%3A00&minAmount=1.5&maxAmount=100",
        ))
        .unwrap();
        assert_eq!(filter.tx_type.map(|t| t.as_str()), Some("FEE"));
        assert!(filter.from.unwrap() < filter.to.unwrap());
        assert_eq!(filter.min_amount, Some("1.5".parse().unwrap()));
        assert_eq!(filter.max_amount, Some(Amount::from_whole(100).unwrap()));
    }

    #[test]
    fn test_parse_filter_rejects_bad_values() {
        assert!(parse_filter(&params("type=bribe")).is_err());
        assert!(parse_filter(&params("from=yesterday")).is_err());
        assert!(matches!(
            parse_filter(&params("minAmount=-3")),
            Err(LedgerError::BadRequest(_))
        ));
        assert!(parse_filter(&params("")).unwrap().tx_type.is_none());
    }
}

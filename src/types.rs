//! Shared types for the ledger
//!
//! - `LedgerError`: the error taxonomy every component reports through
//! - `Amount`: fixed-point money with 8 decimal places
//! - `Currency`: the currencies an escrow can hold

use hyper::StatusCode;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Ledger error taxonomy
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Non-numeric, non-finite, non-positive or over-precise monetary value
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Project not open for investment, missing target, or milestone not verified
    #[error("Invalid project state: {0}")]
    InvalidProjectState(String),

    /// Status change outside the allowed edge set
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Treasury delta would drive a balance negative, or a lock exceeds free escrow funds
    #[error("Insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Chain RPC, contract address or admin key absent
    #[error("Configuration missing: {0}")]
    ConfigurationMissing(String),

    /// Settlement collaborator error, message preserved
    #[error("Chain call failed: {0}")]
    ChainCallFailed(String),

    /// Missing or invalid bearer token
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Uniqueness violation (reused tx hash, duplicate approver, second active lock)
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Approval quorum not met: {0}")]
    ApprovalQuorumNotMet(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    /// Stable machine-readable code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InvalidAmount(_) => "INVALID_AMOUNT",
            LedgerError::InvalidProjectState(_) => "INVALID_PROJECT_STATE",
            LedgerError::InvalidTransition(_) => "INVALID_TRANSITION",
            LedgerError::InsufficientBalance(_) => "INSUFFICIENT_BALANCE",
            LedgerError::NotFound(_) => "NOT_FOUND",
            LedgerError::ConfigurationMissing(_) => "CONFIGURATION_MISSING",
            LedgerError::ChainCallFailed(_) => "CHAIN_CALL_FAILED",
            LedgerError::Unauthorized(_) => "UNAUTHORIZED",
            LedgerError::Forbidden(_) => "FORBIDDEN",
            LedgerError::BadRequest(_) => "BAD_REQUEST",
            LedgerError::Conflict(_) => "CONFLICT",
            LedgerError::ApprovalQuorumNotMet(_) => "APPROVAL_QUORUM_NOT_MET",
            LedgerError::Database(_) => "DB_ERROR",
            LedgerError::Io(_) => "IO_ERROR",
            LedgerError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status the error is reported with
    pub fn status_code(&self) -> StatusCode {
        match self {
            LedgerError::InvalidAmount(_) | LedgerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            LedgerError::InvalidProjectState(_)
            | LedgerError::InvalidTransition(_)
            | LedgerError::InsufficientBalance(_)
            | LedgerError::ApprovalQuorumNotMet(_) => StatusCode::UNPROCESSABLE_ENTITY,
            LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
            LedgerError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            LedgerError::Forbidden(_) => StatusCode::FORBIDDEN,
            LedgerError::Conflict(_) => StatusCode::CONFLICT,
            LedgerError::ChainCallFailed(_) => StatusCode::BAD_GATEWAY,
            LedgerError::ConfigurationMissing(_)
            | LedgerError::Database(_)
            | LedgerError::Io(_)
            | LedgerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<mongodb::error::Error> for LedgerError {
    fn from(e: mongodb::error::Error) -> Self {
        LedgerError::Database(e.to_string())
    }
}

impl From<bson::ser::Error> for LedgerError {
    fn from(e: bson::ser::Error) -> Self {
        LedgerError::Database(format!("BSON serialization failed: {}", e))
    }
}

// ============================================================================
// Amount
// ============================================================================

/// Number of fractional digits an `Amount` carries
pub const AMOUNT_DECIMALS: u32 = 8;

/// 1 whole currency unit = 100_000_000 units
const AMOUNT_SCALE: i64 = 100_000_000;

/// Fixed-point monetary amount.
///
/// Stored as integer units so MongoDB `$inc` stays exact. Serializes as the
/// raw unit count; API layers convert with `to_f64` / `to_decimal`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub const fn from_units(units: i64) -> Self {
        Amount(units)
    }

    pub const fn units(&self) -> i64 {
        self.0
    }

    /// Whole-unit convenience constructor
    pub fn from_whole(whole: i64) -> Result<Self> {
        whole
            .checked_mul(AMOUNT_SCALE)
            .map(Amount)
            .ok_or_else(|| LedgerError::InvalidAmount(format!("{} overflows", whole)))
    }

    /// Parse a decimal string that must be strictly positive
    pub fn parse_positive(input: &str) -> Result<Self> {
        let amount: Amount = input.parse()?;
        amount.ensure_positive()
    }

    /// Reject zero and negative amounts
    pub fn ensure_positive(self) -> Result<Self> {
        if self.0 <= 0 {
            return Err(LedgerError::InvalidAmount(format!(
                "amount must be positive, got {}",
                self
            )));
        }
        Ok(self)
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(self, other: Amount) -> Result<Amount> {
        self.0
            .checked_add(other.0)
            .map(Amount)
            .ok_or_else(|| LedgerError::InvalidAmount("amount overflow".into()))
    }

    pub fn checked_sub(self, other: Amount) -> Result<Amount> {
        self.0
            .checked_sub(other.0)
            .map(Amount)
            .ok_or_else(|| LedgerError::InvalidAmount("amount overflow".into()))
    }

    pub fn neg(self) -> Amount {
        Amount(-self.0)
    }

    /// Exact decimal representation
    pub fn to_decimal(&self) -> Decimal {
        Decimal::new(self.0, AMOUNT_DECIMALS).normalize()
    }

    /// Lossy float view for JSON responses
    pub fn to_f64(&self) -> f64 {
        self.to_decimal().to_f64().unwrap_or(0.0)
    }

    /// Sum a sequence of amounts with overflow checking
    pub fn sum<I: IntoIterator<Item = Amount>>(items: I) -> Result<Amount> {
        items
            .into_iter()
            .try_fold(Amount::ZERO, |acc, a| acc.checked_add(a))
    }
}

impl FromStr for Amount {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(LedgerError::InvalidAmount("amount is empty".into()));
        }

        let decimal = Decimal::from_str_exact(trimmed)
            .map_err(|_| LedgerError::InvalidAmount(format!("'{}' is not a decimal number", trimmed)))?
            .normalize();

        if decimal.scale() > AMOUNT_DECIMALS {
            return Err(LedgerError::InvalidAmount(format!(
                "'{}' has more than {} decimal places",
                trimmed, AMOUNT_DECIMALS
            )));
        }

        decimal
            .checked_mul(Decimal::from(AMOUNT_SCALE))
            .and_then(|scaled| scaled.to_i64())
            .map(Amount)
            .ok_or_else(|| LedgerError::InvalidAmount(format!("'{}' is out of range", trimmed)))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_decimal())
    }
}

/// Serde adapter rendering an `Amount` as a decimal string, for payloads
/// leaving the service
pub mod amount_string {
    use super::Amount;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(amount: &Amount, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&amount.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Amount, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

// ============================================================================
// Currency
// ============================================================================

/// Currencies an escrow can hold. No conversion between them happens here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Eth,
    Usdc,
    Usdt,
    Usd,
    Eur,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Eth => "ETH",
            Currency::Usdc => "USDC",
            Currency::Usdt => "USDT",
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
        }
    }
}

impl FromStr for Currency {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "ETH" => Ok(Currency::Eth),
            "USDC" => Ok(Currency::Usdc),
            "USDT" => Ok(Currency::Usdt),
            "USD" => Ok(Currency::Usd),
            "EUR" => Ok(Currency::Eur),
            other => Err(LedgerError::BadRequest(format!("unsupported currency '{}'", other))),
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_amount_parses_decimal_strings() {
        let amount: Amount = "250.50".parse().unwrap();
        assert_eq!(amount.units(), 25_050_000_000);
        assert_eq!(amount.to_f64(), 250.5);
        assert_eq!(amount.to_string(), "250.5");
    }

    #[test]
    fn test_amount_rejects_garbage() {
        assert!(matches!("NaN".parse::<Amount>(), Err(LedgerError::InvalidAmount(_))));
        assert!(matches!("inf".parse::<Amount>(), Err(LedgerError::InvalidAmount(_))));
        assert!(matches!("".parse::<Amount>(), Err(LedgerError::InvalidAmount(_))));
        assert!(matches!("12abc".parse::<Amount>(), Err(LedgerError::InvalidAmount(_))));
    }

    #[test]
    fn test_amount_precision_limit() {
        assert!("0.00000001".parse::<Amount>().is_ok());
        assert!("0.000000001".parse::<Amount>().is_err());
        // Trailing zeros beyond the limit are harmless
        assert!("1.5000000000".parse::<Amount>().is_ok());
    }

    #[test]
    fn test_parse_positive() {
        assert!(Amount::parse_positive("0").is_err());
        assert!(Amount::parse_positive("-5").is_err());
        assert_eq!(Amount::parse_positive("5").unwrap(), Amount::from_whole(5).unwrap());
    }

    #[test]
    fn test_amount_overflow_is_invalid() {
        let max = Amount::from_units(i64::MAX);
        assert!(matches!(
            max.checked_add(Amount::from_units(1)),
            Err(LedgerError::InvalidAmount(_))
        ));
        assert!("99999999999999999999".parse::<Amount>().is_err());
    }

    #[test]
    fn test_currency_round_trip() {
        assert_eq!("usdc".parse::<Currency>().unwrap(), Currency::Usdc);
        assert_eq!(Currency::Eth.to_string(), "ETH");
        assert!("DOGE".parse::<Currency>().is_err());
        assert_eq!(serde_json::to_string(&Currency::Usdt).unwrap(), "\"USDT\"");
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(LedgerError::InsufficientBalance("x".into()).code(), "INSUFFICIENT_BALANCE");
        assert_eq!(
            LedgerError::Forbidden("x".into()).status_code(),
            StatusCode::FORBIDDEN
        );
    }
}

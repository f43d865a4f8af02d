//! Configuration for fundledger
//!
//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

use crate::auth::CapabilityTable;

/// fundledger - escrow, treasury and investment ledger
#[derive(Parser, Debug, Clone)]
#[command(name = "fundledger")]
#[command(about = "Escrow, treasury and investment ledger for the crowdfunding platform")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8090")]
    pub listen: SocketAddr,

    /// Enable development mode (in-memory fallbacks, simulated settlement, dev JWT secret)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format (text or json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// MongoDB connection URI
    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    pub mongodb_uri: String,

    /// MongoDB database name
    #[arg(long, env = "MONGODB_DB", default_value = "fundledger")]
    pub mongodb_db: String,

    /// Wrap aggregate writes in multi-document transactions (requires a replica set)
    #[arg(long, env = "MONGODB_TRANSACTIONS", default_value = "false")]
    pub mongodb_transactions: bool,

    /// JWT secret for token validation (required in production)
    #[arg(long, env = "JWT_SECRET")]
    pub jwt_secret: Option<String>,

    /// JWT token expiry in seconds
    #[arg(long, env = "JWT_EXPIRY_SECONDS", default_value = "3600")]
    pub jwt_expiry_seconds: u64,

    /// Chain settlement configuration
    #[command(flatten)]
    pub settlement: SettlementArgs,

    /// Approvals required before a milestone lock can be released
    #[arg(long, env = "MILESTONE_APPROVAL_QUORUM", default_value = "1")]
    pub milestone_approval_quorum: usize,

    /// Comma-separated user ids allowed to approve milestone releases (empty = any approver)
    #[arg(long, env = "MILESTONE_SIGNERS")]
    pub milestone_signers: Option<String>,

    /// JSON object overriding the default role -> capability table
    /// e.g. {"CREATOR": ["Invest", "ReadLedger"]}
    #[arg(long, env = "ROLE_CAPABILITIES")]
    pub role_capabilities: Option<String>,
}

/// Chain settlement gateway configuration
#[derive(Parser, Debug, Clone)]
pub struct SettlementArgs {
    /// Base URL of the settlement gateway (absent = simulated in dev mode)
    #[arg(long, env = "SETTLEMENT_URL")]
    pub settlement_url: Option<String>,

    /// Escrow contract address the gateway settles against
    #[arg(long, env = "SETTLEMENT_CONTRACT_ADDRESS")]
    pub contract_address: Option<String>,

    /// Admin key reference used for privileged treasury calls
    #[arg(long, env = "SETTLEMENT_ADMIN_KEY")]
    pub admin_key: Option<String>,

    /// Timeout per settlement attempt in milliseconds
    #[arg(long, env = "SETTLEMENT_TIMEOUT_MS", default_value = "30000")]
    pub timeout_ms: u64,

    /// Retries after a transport failure or timeout (gateway rejections are never retried)
    #[arg(long, env = "SETTLEMENT_MAX_RETRIES", default_value = "2")]
    pub max_retries: u32,
}

impl SettlementArgs {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Args {
    /// Get effective JWT secret (uses default in dev mode)
    pub fn jwt_secret(&self) -> Option<String> {
        match &self.jwt_secret {
            Some(secret) => Some(secret.clone()),
            None if self.dev_mode => Some("dev-only-insecure-secret".to_string()),
            None => None,
        }
    }

    /// Configured milestone signer set
    pub fn milestone_signer_list(&self) -> Vec<String> {
        self.milestone_signers
            .as_deref()
            .map(|s| {
                s.split(',')
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Build the capability table, applying any configured overrides
    pub fn capability_table(&self) -> Result<CapabilityTable, String> {
        match &self.role_capabilities {
            Some(json) => CapabilityTable::with_overrides_json(json),
            None => Ok(CapabilityTable::default()),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if !self.dev_mode {
            if self.jwt_secret.is_none() {
                return Err("JWT_SECRET is required in production mode".to_string());
            }
            if self.settlement.settlement_url.is_none() {
                return Err("SETTLEMENT_URL is required in production mode".to_string());
            }
        }

        if self.milestone_approval_quorum == 0 {
            return Err("MILESTONE_APPROVAL_QUORUM must be at least 1".to_string());
        }

        let signers = self.milestone_signer_list();
        if !signers.is_empty() && signers.len() < self.milestone_approval_quorum {
            return Err(format!(
                "MILESTONE_APPROVAL_QUORUM ({}) exceeds the number of MILESTONE_SIGNERS ({})",
                self.milestone_approval_quorum,
                signers.len()
            ));
        }

        if self.settlement.timeout_ms == 0 {
            return Err("SETTLEMENT_TIMEOUT_MS must be greater than zero".to_string());
        }

        if !matches!(self.log_format.as_str(), "text" | "json") {
            return Err("LOG_FORMAT must be 'text' or 'json'".to_string());
        }

        self.capability_table()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["fundledger"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_dev_mode_defaults_validate() {
        let args = parse(&["--dev-mode"]);
        assert!(args.validate().is_ok());
        assert_eq!(args.jwt_secret().as_deref(), Some("dev-only-insecure-secret"));
        assert_eq!(args.settlement.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_production_requires_secret() {
        let args = parse(&["--settlement-url", "http://gateway:9000"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_quorum_cannot_exceed_signers() {
        let args = parse(&[
            "--dev-mode",
            "--milestone-approval-quorum",
            "3",
            "--milestone-signers",
            "alice, bob",
        ]);
        assert_eq!(args.milestone_signer_list(), vec!["alice", "bob"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_bad_role_override_rejected() {
        let args = parse(&["--dev-mode", "--role-capabilities", "not json"]);
        assert!(args.validate().is_err());
    }
}

//! Authentication and authorization for fundledger
//!
//! Provides:
//! - JWT bearer token validation
//! - Roles and the role -> capability table
//! - `Actor`, the authenticated caller every ledger operation receives

pub mod jwt;
pub mod permissions;

pub use jwt::{extract_token_from_header, Claims, JwtValidator, TokenValidationResult};
pub use permissions::{Capability, CapabilityTable, Role};

use serde::{Deserialize, Serialize};

use crate::types::{LedgerError, Result};

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub roles: Vec<Role>,
}

impl Actor {
    pub fn new(id: impl Into<String>, roles: Vec<Role>) -> Self {
        Self {
            id: id.into(),
            roles,
        }
    }

    /// Internal actor for ledger-initiated compensation steps
    pub fn system() -> Self {
        Self::new("system", vec![Role::SuperAdmin])
    }

    /// Strongest role held, used when a single role is recorded
    pub fn primary_role(&self) -> Option<Role> {
        self.roles.iter().max().copied()
    }

    /// Role name recorded on audit entries
    pub fn role_name(&self) -> String {
        self.primary_role()
            .map(|r| r.as_str().to_string())
            .unwrap_or_else(|| "NONE".to_string())
    }

    pub fn has(&self, table: &CapabilityTable, capability: Capability) -> bool {
        table.allows(&self.roles, capability)
    }

    /// Fail with `Forbidden` unless the actor holds the capability
    pub fn require(&self, table: &CapabilityTable, capability: Capability) -> Result<()> {
        if self.has(table, capability) {
            Ok(())
        } else {
            Err(LedgerError::Forbidden(format!(
                "{} ({}) lacks capability {}",
                self.id,
                self.role_name(),
                capability
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_role_is_strongest() {
        let actor = Actor::new("u1", vec![Role::Investor, Role::Admin]);
        assert_eq!(actor.primary_role(), Some(Role::Admin));
        assert_eq!(Actor::new("u2", vec![]).role_name(), "NONE");
    }

    #[test]
    fn test_require_reports_forbidden() {
        let table = CapabilityTable::default();
        let investor = Actor::new("u1", vec![Role::Investor]);
        assert!(investor.require(&table, Capability::Invest).is_ok());
        assert!(matches!(
            investor.require(&table, Capability::TreasuryWrite),
            Err(LedgerError::Forbidden(_))
        ));
    }
}

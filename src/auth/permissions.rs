//! Roles, capabilities and the role -> capability table
//!
//! Resolution order is explicit: an override entry for a role replaces that
//! role's default set entirely; roles without an override use the defaults.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Platform roles carried in JWT claims
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Investor,
    Creator,
    Auditor,
    Treasury,
    Admin,
    SuperAdmin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Investor => "INVESTOR",
            Role::Creator => "CREATOR",
            Role::Auditor => "AUDITOR",
            Role::Treasury => "TREASURY",
            Role::Admin => "ADMIN",
            Role::SuperAdmin => "SUPERADMIN",
        }
    }

    pub const ALL: [Role; 6] = [
        Role::Investor,
        Role::Creator,
        Role::Auditor,
        Role::Treasury,
        Role::Admin,
        Role::SuperAdmin,
    ];
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operations a role may be granted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// Create investments and deposits
    Invest,
    /// Confirm, release, dispute and refund deposits; lock and cancel milestones
    ManageEscrow,
    /// Sign milestone release approvals
    ApproveMilestone,
    /// Move investments through their status machine
    ManageInvestments,
    /// Record fees and donations
    TreasuryRecord,
    /// Withdraw, distribute, reserve and refund treasury funds
    TreasuryWrite,
    /// Read treasury balances, transactions and summaries
    TreasuryRead,
    /// Read escrows, events and investments
    ReadLedger,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

fn default_capabilities(role: Role) -> HashSet<Capability> {
    use Capability::*;
    let caps: &[Capability] = match role {
        Role::Investor => &[Invest, TreasuryRecord, ReadLedger],
        Role::Creator => &[TreasuryRecord, ReadLedger],
        Role::Auditor => &[TreasuryRecord, TreasuryRead, ReadLedger],
        Role::Treasury => &[TreasuryRecord, TreasuryWrite, TreasuryRead, ReadLedger],
        Role::Admin => &[
            ManageEscrow,
            ApproveMilestone,
            ManageInvestments,
            TreasuryRecord,
            TreasuryWrite,
            TreasuryRead,
            ReadLedger,
        ],
        Role::SuperAdmin => &[
            Invest,
            ManageEscrow,
            ApproveMilestone,
            ManageInvestments,
            TreasuryRecord,
            TreasuryWrite,
            TreasuryRead,
            ReadLedger,
        ],
    };
    caps.iter().copied().collect()
}

/// Role -> capability lookup with explicit override precedence
#[derive(Debug, Clone)]
pub struct CapabilityTable {
    defaults: HashMap<Role, HashSet<Capability>>,
    overrides: HashMap<Role, HashSet<Capability>>,
}

impl Default for CapabilityTable {
    fn default() -> Self {
        Self {
            defaults: Role::ALL
                .iter()
                .map(|r| (*r, default_capabilities(*r)))
                .collect(),
            overrides: HashMap::new(),
        }
    }
}

impl CapabilityTable {
    /// Build a table from a JSON override object, e.g. `{"CREATOR": ["Invest"]}`
    pub fn with_overrides_json(json: &str) -> Result<Self, String> {
        let overrides: HashMap<Role, HashSet<Capability>> = serde_json::from_str(json)
            .map_err(|e| format!("Invalid ROLE_CAPABILITIES: {}", e))?;
        Ok(Self::default().with_overrides(overrides))
    }

    pub fn with_overrides(mut self, overrides: HashMap<Role, HashSet<Capability>>) -> Self {
        self.overrides = overrides;
        self
    }

    /// Effective capability set for a single role
    pub fn capabilities_for(&self, role: Role) -> HashSet<Capability> {
        self.overrides
            .get(&role)
            .or_else(|| self.defaults.get(&role))
            .cloned()
            .unwrap_or_default()
    }

    /// Whether any of the given roles grants the capability
    pub fn allows(&self, roles: &[Role], capability: Capability) -> bool {
        roles
            .iter()
            .any(|r| self.capabilities_for(*r).contains(&capability))
    }
}

//! User profile collaborator
//!
//! Confirms that an investor account is active and KYC-approved. The KYC
//! decision itself is made elsewhere; the ledger only reads it.

use bson::doc;
use dashmap::DashMap;
use serde::Serialize;

use crate::db::schemas::{KycStatus, UserDoc, USER_COLLECTION};
use crate::db::{MongoClient, MongoCollection};
use crate::types::{LedgerError, Result};

/// What the ledger needs to know about an investor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InvestorProfile {
    pub is_active: bool,
    pub kyc_status: KycStatus,
}

impl InvestorProfile {
    pub fn can_invest(&self) -> bool {
        self.is_active && self.kyc_status == KycStatus::Approved
    }
}

#[async_trait::async_trait]
pub trait ProfileService: Send + Sync {
    /// `NotFound` when the user does not exist
    async fn investor_profile(&self, user_id: &str) -> Result<InvestorProfile>;
}

/// Profile service reading the shared `users` collection
pub struct MongoProfileService {
    users: MongoCollection<UserDoc>,
}

impl MongoProfileService {
    pub async fn new(client: &MongoClient) -> Result<Self> {
        Ok(Self {
            users: client.collection(USER_COLLECTION).await?,
        })
    }
}

#[async_trait::async_trait]
impl ProfileService for MongoProfileService {
    async fn investor_profile(&self, user_id: &str) -> Result<InvestorProfile> {
        let user = self
            .users
            .find_one(doc! { "user_id": user_id })
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("user {}", user_id)))?;

        Ok(InvestorProfile {
            is_active: user.is_active,
            kyc_status: user.kyc_status,
        })
    }
}

/// Profile service held in memory.
///
/// With `approve_unknown` set (dev mode), users never registered are treated
/// as active and KYC-approved.
#[derive(Default)]
pub struct InMemoryProfileService {
    profiles: DashMap<String, InvestorProfile>,
    approve_unknown: bool,
}

impl InMemoryProfileService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn permissive() -> Self {
        Self {
            profiles: DashMap::new(),
            approve_unknown: true,
        }
    }

    pub fn set_profile(&self, user_id: &str, profile: InvestorProfile) {
        self.profiles.insert(user_id.to_string(), profile);
    }

    /// Register an active, KYC-approved investor
    pub fn approve(&self, user_id: &str) {
        self.set_profile(
            user_id,
            InvestorProfile {
                is_active: true,
                kyc_status: KycStatus::Approved,
            },
        );
    }
}

#[async_trait::async_trait]
impl ProfileService for InMemoryProfileService {
    async fn investor_profile(&self, user_id: &str) -> Result<InvestorProfile> {
        if let Some(profile) = self.profiles.get(user_id) {
            return Ok(*profile.value());
        }
        if self.approve_unknown {
            return Ok(InvestorProfile {
                is_active: true,
                kyc_status: KycStatus::Approved,
            });
        }
        Err(LedgerError::NotFound(format!("user {}", user_id)))
    }
}

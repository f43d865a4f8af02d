//! Project document schema
//!
//! Projects are owned by the project service; the ledger only reads their
//! funding state and milestone verification decisions, and bumps the raised
//! counters. ROI and charity projects share a base record and differ by a
//! `kind`-tagged variant.

use bson::{doc, oid::ObjectId, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;
use crate::types::Amount;

/// Collection name for projects
pub const PROJECT_COLLECTION: &str = "projects";

/// Project lifecycle status
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectStatus {
    Draft,
    Funding,
    Funded,
    Closed,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Draft => "DRAFT",
            ProjectStatus::Funding => "FUNDING",
            ProjectStatus::Funded => "FUNDED",
            ProjectStatus::Closed => "CLOSED",
        }
    }
}

/// Variant-specific project fields
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectKind {
    Roi {
        /// Expected return in basis points
        expected_roi_bps: u32,
        term_months: u32,
    },
    Charity {
        beneficiary: String,
    },
}

/// Verification decision recorded against a milestone
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationDecision {
    Approved,
    Rejected,
}

impl VerificationDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationDecision::Approved => "APPROVED",
            VerificationDecision::Rejected => "REJECTED",
        }
    }
}

/// Milestone as the project service records it
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ProjectMilestone {
    pub milestone_id: String,

    #[serde(default)]
    pub title: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationDecision>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<DateTime>,
}

/// Project document stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ProjectDoc {
    /// MongoDB document ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    pub project_id: String,

    pub title: String,

    pub creator_id: String,

    pub status: ProjectStatus,

    pub funding_target: Amount,

    #[serde(default)]
    pub raised_amount: Amount,

    #[serde(default)]
    pub backer_count: i64,

    #[serde(default)]
    pub milestones: Vec<ProjectMilestone>,

    #[serde(flatten)]
    pub kind: ProjectKind,
}

impl ProjectDoc {
    pub fn new(project_id: &str, title: &str, creator_id: &str, funding_target: Amount, kind: ProjectKind) -> Self {
        Self {
            _id: None,
            metadata: Metadata::new(),
            project_id: project_id.to_string(),
            title: title.to_string(),
            creator_id: creator_id.to_string(),
            status: ProjectStatus::Funding,
            funding_target,
            raised_amount: Amount::ZERO,
            backer_count: 0,
            milestones: Vec::new(),
            kind,
        }
    }

    /// FUNDING with a positive target
    pub fn is_open_for_investment(&self) -> bool {
        self.status == ProjectStatus::Funding && self.funding_target.is_positive()
    }

    pub fn milestone(&self, milestone_id: &str) -> Option<&ProjectMilestone> {
        self.milestones.iter().find(|m| m.milestone_id == milestone_id)
    }
}

impl IntoIndexes for ProjectDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "project_id": 1 },
            Some(
                IndexOptions::builder()
                    .unique(true)
                    .name("project_id_unique".to_string())
                    .build(),
            ),
        )]
    }
}

impl MutMetadata for ProjectDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tag_is_flattened() {
        let project = ProjectDoc::new(
            "p1",
            "Well",
            "c1",
            Amount::from_units(10),
            ProjectKind::Charity {
                beneficiary: "village".into(),
            },
        );
        let json = serde_json::to_value(&project).unwrap();
        assert_eq!(json["kind"], "CHARITY");
        assert_eq!(json["beneficiary"], "village");

        let back: ProjectDoc = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind, project.kind);
    }

    #[test]
    fn test_open_requires_funding_and_target() {
        let mut project = ProjectDoc::new(
            "p1",
            "Solar",
            "c1",
            Amount::ZERO,
            ProjectKind::Roi {
                expected_roi_bps: 800,
                term_months: 24,
            },
        );
        assert!(!project.is_open_for_investment());
        project.funding_target = Amount::from_units(1);
        assert!(project.is_open_for_investment());
        project.status = ProjectStatus::Closed;
        assert!(!project.is_open_for_investment());
    }
}

//! Project collaborator
//!
//! The project service owns project records. The ledger asks it whether a
//! project is open for investment, bumps the raised counters, and reads
//! milestone verification decisions before releasing milestone funds.

use bson::doc;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::db::schemas::{ProjectDoc, ProjectStatus, VerificationDecision, PROJECT_COLLECTION};
use crate::db::{MongoClient, MongoCollection};
use crate::types::{Amount, LedgerError, Result};

/// Operations the ledger needs from the project service
#[async_trait::async_trait]
pub trait ProjectService: Send + Sync {
    /// `NotFound` if absent, `InvalidProjectState` unless FUNDING with a positive target
    async fn ensure_open_for_investment(&self, project_id: &str) -> Result<ProjectDoc>;

    /// Atomically add to the raised amount and backer count, re-validating
    /// that the project is still open
    async fn increment_funding(&self, project_id: &str, amount: Amount) -> Result<()>;

    /// Recorded verification decision of a milestone, if any
    async fn milestone_verification(
        &self,
        project_id: &str,
        milestone_id: &str,
    ) -> Result<Option<VerificationDecision>>;
}

fn check_open(project: &ProjectDoc) -> Result<()> {
    if project.is_open_for_investment() {
        return Ok(());
    }
    if project.status != ProjectStatus::Funding {
        return Err(LedgerError::InvalidProjectState(format!(
            "project {} is {}, not open for investment",
            project.project_id,
            project.status.as_str()
        )));
    }
    Err(LedgerError::InvalidProjectState(format!(
        "project {} has no funding target",
        project.project_id
    )))
}

fn milestone_decision(project: &ProjectDoc, milestone_id: &str) -> Result<Option<VerificationDecision>> {
    project
        .milestone(milestone_id)
        .map(|m| m.verification)
        .ok_or_else(|| {
            LedgerError::NotFound(format!(
                "milestone {} of project {}",
                milestone_id, project.project_id
            ))
        })
}

// ============================================================================
// MongoDB
// ============================================================================

/// Project service reading the shared `projects` collection
pub struct MongoProjectService {
    projects: MongoCollection<ProjectDoc>,
}

impl MongoProjectService {
    pub async fn new(client: &MongoClient) -> Result<Self> {
        Ok(Self {
            projects: client.collection(PROJECT_COLLECTION).await?,
        })
    }

    async fn load(&self, project_id: &str) -> Result<ProjectDoc> {
        self.projects
            .find_one(doc! { "project_id": project_id })
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("project {}", project_id)))
    }
}

#[async_trait::async_trait]
impl ProjectService for MongoProjectService {
    async fn ensure_open_for_investment(&self, project_id: &str) -> Result<ProjectDoc> {
        let project = self.load(project_id).await?;
        check_open(&project)?;
        Ok(project)
    }

    async fn increment_funding(&self, project_id: &str, amount: Amount) -> Result<()> {
        let result = self
            .projects
            .update_one(
                doc! {
                    "project_id": project_id,
                    "status": ProjectStatus::Funding.as_str(),
                    "funding_target": { "$gt": 0_i64 },
                },
                doc! { "$inc": { "raised_amount": amount.units(), "backer_count": 1_i64 } },
            )
            .await?;

        if result.matched_count == 0 {
            // Say why: missing, or no longer open
            let project = self.load(project_id).await?;
            check_open(&project)?;
            return Err(LedgerError::Internal(format!(
                "funding increment for project {} matched nothing",
                project_id
            )));
        }

        debug!(project_id, amount = %amount, "project funding incremented");
        Ok(())
    }

    async fn milestone_verification(
        &self,
        project_id: &str,
        milestone_id: &str,
    ) -> Result<Option<VerificationDecision>> {
        let project = self.load(project_id).await?;
        milestone_decision(&project, milestone_id)
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Project service held in memory, for dev mode and tests
#[derive(Default)]
pub struct InMemoryProjectService {
    projects: DashMap<String, ProjectDoc>,
}

impl InMemoryProjectService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, project: ProjectDoc) {
        info!(project_id = %project.project_id, "project registered");
        self.projects.insert(project.project_id.clone(), project);
    }

    pub fn get(&self, project_id: &str) -> Option<ProjectDoc> {
        self.projects.get(project_id).map(|p| p.value().clone())
    }

    pub fn set_status(&self, project_id: &str, status: ProjectStatus) {
        if let Some(mut project) = self.projects.get_mut(project_id) {
            project.status = status;
        }
    }

    /// Record a verification decision, creating the milestone entry if needed
    pub fn record_verification(
        &self,
        project_id: &str,
        milestone_id: &str,
        decision: VerificationDecision,
    ) {
        if let Some(mut project) = self.projects.get_mut(project_id) {
            let now = bson::DateTime::now();
            match project
                .milestones
                .iter_mut()
                .find(|m| m.milestone_id == milestone_id)
            {
                Some(milestone) => {
                    milestone.verification = Some(decision);
                    milestone.verified_at = Some(now);
                }
                None => project.milestones.push(crate::db::schemas::ProjectMilestone {
                    milestone_id: milestone_id.to_string(),
                    title: String::new(),
                    verification: Some(decision),
                    verified_at: Some(now),
                }),
            }
        }
    }
}

#[async_trait::async_trait]
impl ProjectService for InMemoryProjectService {
    async fn ensure_open_for_investment(&self, project_id: &str) -> Result<ProjectDoc> {
        let project = self
            .get(project_id)
            .ok_or_else(|| LedgerError::NotFound(format!("project {}", project_id)))?;
        check_open(&project)?;
        Ok(project)
    }

    async fn increment_funding(&self, project_id: &str, amount: Amount) -> Result<()> {
        let mut project = self
            .projects
            .get_mut(project_id)
            .ok_or_else(|| LedgerError::NotFound(format!("project {}", project_id)))?;
        check_open(&project)?;
        project.raised_amount = project.raised_amount.checked_add(amount)?;
        project.backer_count += 1;
        Ok(())
    }

    async fn milestone_verification(
        &self,
        project_id: &str,
        milestone_id: &str,
    ) -> Result<Option<VerificationDecision>> {
        let project = self
            .get(project_id)
            .ok_or_else(|| LedgerError::NotFound(format!("project {}", project_id)))?;
        milestone_decision(&project, milestone_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schemas::ProjectKind;

    fn roi_project(id: &str, target: i64) -> ProjectDoc {
        ProjectDoc::new(
            id,
            "Solar farm",
            "creator-1",
            Amount::from_units(target),
            ProjectKind::Roi {
                expected_roi_bps: 700,
                term_months: 36,
            },
        )
    }

    #[tokio::test]
    async fn test_open_project_checks() {
        let service = InMemoryProjectService::new();
        service.insert(roi_project("open", 100));
        service.insert(roi_project("no-target", 0));

        assert!(service.ensure_open_for_investment("open").await.is_ok());
        assert!(matches!(
            service.ensure_open_for_investment("no-target").await,
            Err(LedgerError::InvalidProjectState(_))
        ));
        assert!(matches!(
            service.ensure_open_for_investment("missing").await,
            Err(LedgerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_increment_revalidates() {
        let service = InMemoryProjectService::new();
        service.insert(roi_project("p1", 100));

        service.increment_funding("p1", Amount::from_units(30)).await.unwrap();
        let project = service.get("p1").unwrap();
        assert_eq!(project.raised_amount, Amount::from_units(30));
        assert_eq!(project.backer_count, 1);

        service.set_status("p1", ProjectStatus::Closed);
        assert!(matches!(
            service.increment_funding("p1", Amount::from_units(1)).await,
            Err(LedgerError::InvalidProjectState(_))
        ));
    }

    #[tokio::test]
    async fn test_milestone_verification() {
        let service = InMemoryProjectService::new();
        service.insert(roi_project("p1", 100));
        assert!(service.milestone_verification("p1", "m1").await.is_err());

        service.record_verification("p1", "m1", VerificationDecision::Approved);
        assert_eq!(
            service.milestone_verification("p1", "m1").await.unwrap(),
            Some(VerificationDecision::Approved)
        );
    }
}

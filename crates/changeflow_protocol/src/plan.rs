//! Plans, specs and plan-check runs.

use crate::enums::{
    ChangeType, CheckResultStatus, ExportFormat, PlanCheckRunStatus, PlanCheckType, PlanState,
};
use changeflow_ids::{
    DatabaseGroupName, DatabaseName, EnvironmentId, IdParseError, PlanCheckRunName, PlanName,
    ProjectId, DATABASES, DATABASE_GROUPS, INSTANCES, PROJECTS,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub uid: i64,
    pub project: ProjectId,
    pub creator: String,
    pub title: String,
    pub description: String,
    pub state: PlanState,
    pub specs: Vec<Spec>,
    pub deployment: Option<Deployment>,
    /// Set once a rollout has been materialised from this plan.
    pub pipeline_uid: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Plan {
    pub fn name(&self) -> PlanName {
        PlanName::new(self.project.clone(), self.uid)
    }

    pub fn has_rollout(&self) -> bool {
        self.pipeline_uid.is_some()
    }

    /// Why the specs of this plan can no longer be replaced, if they can't.
    pub fn specs_frozen_reason(&self) -> Option<&'static str> {
        if self.has_rollout() {
            return Some("cannot update specs for plan that has a rollout");
        }
        for spec in &self.specs {
            match &spec.config {
                SpecConfig::CreateDatabase(_) => {
                    return Some("cannot update specs of a create database plan")
                }
                SpecConfig::ChangeDatabase(c) if c.release.is_some() => {
                    return Some("cannot update specs of a plan that uses a release")
                }
                _ => {}
            }
        }
        None
    }
}

/// Environment order a plan deploys through.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Deployment {
    pub environments: Vec<EnvironmentId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spec {
    pub id: String,
    pub config: SpecConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SpecConfig {
    CreateDatabase(CreateDatabaseConfig),
    ChangeDatabase(ChangeDatabaseConfig),
    ExportData(ExportDataConfig),
}

impl SpecConfig {
    pub fn kind_name(&self) -> &'static str {
        match self {
            SpecConfig::CreateDatabase(_) => "CreateDatabaseConfig",
            SpecConfig::ChangeDatabase(_) => "ChangeDatabaseConfig",
            SpecConfig::ExportData(_) => "ExportDataConfig",
        }
    }

    /// Target names of change and export specs; empty for create.
    pub fn targets(&self) -> &[String] {
        match self {
            SpecConfig::CreateDatabase(_) => &[],
            SpecConfig::ChangeDatabase(c) => &c.targets,
            SpecConfig::ExportData(c) => &c.targets,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateDatabaseConfig {
    /// `instances/{iid}`.
    pub target: String,
    pub database: String,
    pub character_set: String,
    pub collation: String,
    /// `environments/{eid}`; empty means the instance environment.
    pub environment: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangeDatabaseConfig {
    /// Database names, or exactly one database group name.
    pub targets: Vec<String>,
    /// `projects/{pid}/sheets/{sha256}`.
    pub sheet: Option<String>,
    /// `projects/{pid}/releases/{uid}`.
    pub release: Option<String>,
    pub change_type: ChangeType,
    pub enable_prior_backup: bool,
    pub enable_ghost: bool,
    pub ghost_flags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportDataConfig {
    pub targets: Vec<String>,
    pub sheet: String,
    pub format: ExportFormat,
    pub password: Option<String>,
}

/// A parsed change target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeTarget {
    Database(DatabaseName),
    DatabaseGroup(DatabaseGroupName),
}

impl ChangeTarget {
    pub fn parse(target: &str) -> Result<Self, IdParseError> {
        let prefix_db = format!("{}/", INSTANCES);
        if target.starts_with(&prefix_db) && target.contains(&format!("/{}/", DATABASES)) {
            return Ok(ChangeTarget::Database(DatabaseName::parse(target)?));
        }
        let prefix_project = format!("{}/", PROJECTS);
        if target.starts_with(&prefix_project)
            && target.contains(&format!("/{}/", DATABASE_GROUPS))
        {
            return Ok(ChangeTarget::DatabaseGroup(DatabaseGroupName::parse(target)?));
        }
        // Fall through to the database parser for its error message.
        DatabaseName::parse(target).map(ChangeTarget::Database)
    }
}

// ============================================================================
// Plan-check runs
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanCheckRun {
    pub uid: i64,
    pub project: ProjectId,
    pub plan_uid: i64,
    pub status: PlanCheckRunStatus,
    pub config: PlanCheckRunConfig,
    pub result: PlanCheckRunResult,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PlanCheckRun {
    pub fn name(&self) -> PlanCheckRunName {
        PlanCheckRunName::new(self.project.clone(), self.plan_uid, self.uid)
    }
}

/// Descriptor of the checks a run performs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanCheckRunConfig {
    pub targets: Vec<PlanCheckTarget>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanCheckTarget {
    /// `instances/{iid}/databases/{db}`.
    pub database: String,
    pub sheet_sha256: String,
    pub types: Vec<PlanCheckType>,
    #[serde(default)]
    pub change_type: ChangeType,
    #[serde(default)]
    pub enable_prior_backup: bool,
    #[serde(default)]
    pub ghost_flags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanCheckRunResult {
    pub results: Vec<PlanCheckResult>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanCheckResult {
    pub target: String,
    pub check_type: PlanCheckType,
    pub status: CheckResultStatus,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub code: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_target_parse() {
        assert!(matches!(
            ChangeTarget::parse("instances/i1/databases/d1").unwrap(),
            ChangeTarget::Database(_)
        ));
        assert!(matches!(
            ChangeTarget::parse("projects/p1/databaseGroups/g1").unwrap(),
            ChangeTarget::DatabaseGroup(_)
        ));
        assert!(ChangeTarget::parse("projects/p1/plans/1").is_err());
        assert!(ChangeTarget::parse("").is_err());
    }

    #[test]
    fn test_spec_config_tagged_json() {
        let spec = Spec {
            id: "s1".into(),
            config: SpecConfig::ChangeDatabase(ChangeDatabaseConfig {
                targets: vec!["instances/i1/databases/d1".into()],
                sheet: Some("projects/p1/sheets/ab".into()),
                ..Default::default()
            }),
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["config"]["kind"], "change_database");
        let back: Spec = serde_json::from_value(json).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn test_specs_frozen_reason() {
        let change = |release: Option<&str>| Spec {
            id: "s1".into(),
            config: SpecConfig::ChangeDatabase(ChangeDatabaseConfig {
                targets: vec!["instances/i1/databases/d1".into()],
                sheet: release.is_none().then(|| "projects/p1/sheets/ab".into()),
                release: release.map(Into::into),
                ..Default::default()
            }),
        };
        let mut plan = Plan {
            uid: 1,
            project: ProjectId::parse("p1").unwrap(),
            creator: "bob@example.com".into(),
            title: String::new(),
            description: String::new(),
            state: PlanState::Active,
            specs: vec![change(None)],
            deployment: None,
            pipeline_uid: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(plan.specs_frozen_reason(), None);

        plan.specs = vec![change(Some("projects/p1/releases/1"))];
        assert!(plan.specs_frozen_reason().unwrap().contains("release"));

        plan.specs = vec![Spec {
            id: "c1".into(),
            config: SpecConfig::CreateDatabase(CreateDatabaseConfig {
                target: "instances/i1".into(),
                database: "newdb".into(),
                ..Default::default()
            }),
        }];
        assert!(plan.specs_frozen_reason().unwrap().contains("create database"));

        plan.specs = vec![change(None)];
        plan.pipeline_uid = Some(7);
        assert!(plan.specs_frozen_reason().unwrap().contains("rollout"));
    }
}

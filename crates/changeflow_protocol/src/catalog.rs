//! Catalogue entities: projects, environments, instances, databases,
//! database groups, principals, sheets and releases.

use crate::enums::{DataSourceType, Engine, EnvironmentTier, SyncState, WebhookEventType};
use crate::iam::IamPolicy;
use changeflow_ids::{
    DatabaseGroupId, DatabaseGroupName, DatabaseName, EnvironmentId, InstanceId, ProjectId,
    ReleaseName, RoleId, SheetName,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub title: String,
    pub settings: ProjectSettings,
    pub webhooks: Vec<ProjectWebhook>,
    pub policy: IamPolicy,
    pub deleted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectSettings {
    pub force_issue_labels: bool,
    /// Labels an issue may carry. Empty means any.
    pub issue_labels: Vec<String>,
    pub allow_self_approval: bool,
    /// Zero means unlimited.
    pub parallel_tasks_per_rollout: i32,
    pub execution_retry_max: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectWebhook {
    pub title: String,
    pub url: String,
    pub events: Vec<WebhookEventType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub id: EnvironmentId,
    pub title: String,
    pub order: i32,
    #[serde(default)]
    pub tier: EnvironmentTier,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub title: String,
    pub engine: Engine,
    pub environment: Option<EnvironmentId>,
    pub data_sources: Vec<DataSource>,
    pub activation: bool,
    pub sync_interval_secs: Option<i64>,
    pub last_slow_query_sync: Option<DateTime<Utc>>,
    pub deleted: bool,
}

impl Instance {
    pub fn admin_data_source(&self) -> Option<&DataSource> {
        self.data_sources
            .iter()
            .find(|ds| ds.source_type == DataSourceType::Admin)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    pub id: String,
    pub source_type: DataSourceType,
    pub host: String,
    pub port: String,
    pub username: String,
    /// Plaintext on input; obfuscated by the store before it is persisted.
    #[serde(default)]
    pub password: String,
    /// Reference into an external secret manager, e.g. `vault://...`.
    #[serde(default)]
    pub external_secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Database {
    pub instance: InstanceId,
    pub name: String,
    pub project: ProjectId,
    /// Overrides the instance environment when set.
    pub environment: Option<EnvironmentId>,
    pub labels: BTreeMap<String, String>,
    pub sync_state: SyncState,
    pub last_sync_time: Option<DateTime<Utc>>,
}

impl Database {
    pub fn database_name(&self) -> DatabaseName {
        DatabaseName::new(self.instance.clone(), self.name.clone())
    }
}

/// Database plus the attributes resolved from its instance.
#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseRef {
    pub database: Database,
    pub engine: Engine,
    /// Effective environment: the database override, else the instance's.
    pub environment: Option<EnvironmentId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseGroup {
    pub project: ProjectId,
    pub id: DatabaseGroupId,
    pub title: String,
    /// Condition over `resource.database_name`, `resource.instance_id`,
    /// `resource.environment_id` and `resource.labels`.
    pub expression: String,
}

impl DatabaseGroup {
    pub fn name(&self) -> DatabaseGroupName {
        DatabaseGroupName::new(self.project.clone(), self.id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub uid: i64,
    pub email: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub email: String,
    pub title: String,
    /// Member emails.
    pub members: Vec<String>,
}

/// Custom role with an explicit permission list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub title: String,
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sheet {
    pub project: ProjectId,
    pub sha256: String,
    pub title: String,
    pub content: String,
    pub creator: String,
    pub created_at: DateTime<Utc>,
}

impl Sheet {
    pub fn name(&self) -> SheetName {
        SheetName::new(self.project.clone(), self.sha256.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub uid: i64,
    pub project: ProjectId,
    pub title: String,
    pub files: Vec<ReleaseFile>,
    pub creator: String,
    pub created_at: DateTime<Utc>,
}

impl Release {
    pub fn name(&self) -> ReleaseName {
        ReleaseName::new(self.project.clone(), self.uid)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseFile {
    pub path: String,
    pub version: String,
    pub sheet_sha256: String,
}

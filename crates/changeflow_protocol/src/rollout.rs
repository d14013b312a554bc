//! Pipelines, tasks and task runs, and the projected rollout view.

use crate::enums::{ExportFormat, MigrateType, TaskRunStatus, TaskType};
use changeflow_ids::{
    DatabaseName, EnvironmentId, InstanceId, ProjectId, RolloutName, StageId, StageName, TaskName,
    TaskRunName,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Persisted rollout container. Stages are derived on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub uid: i64,
    pub project: ProjectId,
    pub plan_uid: i64,
    pub creator: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub uid: i64,
    pub pipeline_uid: i64,
    /// Stage key; `None` when the environment is empty or was deleted.
    pub environment: Option<EnvironmentId>,
    pub instance: InstanceId,
    pub database: Option<String>,
    pub task_type: TaskType,
    pub migrate_type: Option<MigrateType>,
    pub sheet_sha256: Option<String>,
    pub spec_id: String,
    pub payload: TaskPayload,
    pub latest_task_run_status: TaskRunStatus,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn stage_id(&self) -> StageId {
        match &self.environment {
            Some(env) => StageId::Environment(env.clone()),
            None => StageId::Unassigned,
        }
    }

    pub fn database_name(&self) -> Option<DatabaseName> {
        self.database
            .as_ref()
            .map(|db| DatabaseName::new(self.instance.clone(), db.clone()))
    }

    pub fn name(&self, project: &ProjectId) -> TaskName {
        TaskName::new(project.clone(), self.pipeline_uid, self.stage_id(), self.uid)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskPayload {
    pub enable_prior_backup: bool,
    pub enable_ghost: bool,
    pub ghost_flags: BTreeMap<String, String>,
    pub character_set: String,
    pub collation: String,
    pub export_format: Option<ExportFormat>,
    pub skipped_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub uid: i64,
    pub task_uid: i64,
    pub creator: String,
    pub status: TaskRunStatus,
    pub started_at: Option<DateTime<Utc>>,
    /// Run time in milliseconds once the run has finished.
    pub run_time_ms: Option<i64>,
    pub detail: String,
    pub result: TaskRunResult,
    pub scheduler_info: Option<SchedulerInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRun {
    pub fn name(&self, task: &TaskName) -> TaskRunName {
        TaskRunName::new(task, self.uid)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskRunResult {
    pub changelog: Option<String>,
    pub affected_rows: Option<i64>,
    pub prior_backup: Option<PriorBackupDetail>,
    pub export_archive: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorBackupDetail {
    pub database: String,
    pub tables: Vec<String>,
}

/// Why a pending run has not started yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerInfo {
    pub report_time: DateTime<Utc>,
    pub wait_reason: WaitReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum WaitReason {
    ConnectionLimit,
    BlockingTasks { tasks: Vec<String> },
    ParallelTasksLimit,
}

// ============================================================================
// Projected view
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stage {
    pub id: StageId,
    pub name: String,
    pub tasks: Vec<Task>,
}

impl Stage {
    pub fn stage_name(&self, project: &ProjectId, rollout: i64) -> StageName {
        StageName::new(project.clone(), rollout, self.id.clone())
    }

    /// A stage is done when every task is `DONE` or `SKIPPED`.
    pub fn is_terminal(&self) -> bool {
        self.tasks
            .iter()
            .all(|t| t.latest_task_run_status.is_stage_terminal())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rollout {
    pub uid: i64,
    pub project: ProjectId,
    pub plan_uid: i64,
    pub creator: String,
    pub stages: Vec<Stage>,
    pub created_at: DateTime<Utc>,
}

impl Rollout {
    pub fn name(&self) -> RolloutName {
        RolloutName::new(self.project.clone(), self.uid)
    }

    /// First stage with a task that is not yet done or skipped.
    pub fn active_stage(&self) -> Option<&Stage> {
        self.stages.iter().find(|s| !s.is_terminal())
    }
}

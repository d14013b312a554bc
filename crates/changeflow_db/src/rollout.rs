//! Pipelines, tasks and task runs.
//!
//! A task mirrors the status of its latest run in
//! `latest_task_run_status`; every run write updates both rows in one
//! transaction.

use crate::codec::{
    from_json, from_millis, opt_from_millis, parse_col, parse_opt_col, tag_col, to_json, to_millis,
};
use crate::error::{DbError, Result};
use crate::plan::fetch_plan;
use crate::Store;
use changeflow_ids::{EnvironmentId, InstanceId};
use changeflow_protocol::{
    MigrateType, Pipeline, Plan, SchedulerInfo, Task, TaskPayload, TaskRun, TaskRunResult,
    TaskRunStatus, TaskType,
};
use chrono::Utc;
use sqlx::SqliteConnection;
use tracing::info;

/// A task to materialise under a new pipeline.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub environment: Option<EnvironmentId>,
    pub instance: InstanceId,
    pub database: Option<String>,
    pub task_type: TaskType,
    pub migrate_type: Option<MigrateType>,
    pub sheet_sha256: Option<String>,
    pub spec_id: String,
    pub payload: TaskPayload,
}

#[derive(Debug, Clone)]
pub struct NewTaskRun {
    pub task_uid: i64,
    pub creator: String,
}

#[derive(sqlx::FromRow)]
struct PipelineRow {
    uid: i64,
    project: String,
    plan_uid: i64,
    creator: String,
    created_at: i64,
}

impl PipelineRow {
    fn into_pipeline(self) -> Result<Pipeline> {
        Ok(Pipeline {
            uid: self.uid,
            project: parse_col("pipelines.project", &self.project)?,
            plan_uid: self.plan_uid,
            creator: self.creator,
            created_at: from_millis(self.created_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    uid: i64,
    pipeline_uid: i64,
    environment: Option<String>,
    instance: String,
    database_name: Option<String>,
    task_type: i64,
    migrate_type: Option<i64>,
    sheet_sha256: Option<String>,
    spec_id: String,
    payload: String,
    latest_task_run_status: i64,
    created_at: i64,
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        Ok(Task {
            uid: self.uid,
            pipeline_uid: self.pipeline_uid,
            environment: parse_opt_col("tasks.environment", self.environment.as_deref())?,
            instance: parse_col("tasks.instance", &self.instance)?,
            database: self.database_name,
            task_type: tag_col("tasks.task_type", self.task_type, TaskType::from_tag)?,
            migrate_type: self
                .migrate_type
                .map(|t| tag_col("tasks.migrate_type", t, MigrateType::from_tag))
                .transpose()?,
            sheet_sha256: self.sheet_sha256,
            spec_id: self.spec_id,
            payload: from_json(&self.payload)?,
            latest_task_run_status: tag_col(
                "tasks.latest_task_run_status",
                self.latest_task_run_status,
                TaskRunStatus::from_tag,
            )?,
            created_at: from_millis(self.created_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct TaskRunRow {
    uid: i64,
    task_uid: i64,
    creator: String,
    status: i64,
    started_at: Option<i64>,
    run_time_ms: Option<i64>,
    detail: String,
    result: String,
    scheduler_info: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TaskRunRow {
    fn into_run(self) -> Result<TaskRun> {
        Ok(TaskRun {
            uid: self.uid,
            task_uid: self.task_uid,
            creator: self.creator,
            status: tag_col("task_runs.status", self.status, TaskRunStatus::from_tag)?,
            started_at: opt_from_millis(self.started_at),
            run_time_ms: self.run_time_ms,
            detail: self.detail,
            result: from_json(&self.result)?,
            scheduler_info: self.scheduler_info.as_deref().map(from_json).transpose()?,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
        })
    }
}

async fn fetch_task(conn: &mut SqliteConnection, uid: i64) -> Result<Task> {
    let row: Option<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE uid = ?")
        .bind(uid)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(TaskRow::into_task)
        .transpose()?
        .ok_or_else(|| DbError::not_found(format!("task {} not found", uid)))
}

async fn fetch_task_run(conn: &mut SqliteConnection, uid: i64) -> Result<TaskRun> {
    let row: Option<TaskRunRow> = sqlx::query_as("SELECT * FROM task_runs WHERE uid = ?")
        .bind(uid)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(TaskRunRow::into_run)
        .transpose()?
        .ok_or_else(|| DbError::not_found(format!("task run {} not found", uid)))
}

async fn set_task_status(
    conn: &mut SqliteConnection,
    task_uid: i64,
    status: TaskRunStatus,
) -> Result<()> {
    sqlx::query("UPDATE tasks SET latest_task_run_status = ? WHERE uid = ?")
        .bind(status.tag() as i64)
        .bind(task_uid)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

impl Store {
    /// Creates the pipeline and its tasks, links the plan and any issue of
    /// the plan to it, all in one transaction.
    pub async fn create_rollout(
        &self,
        plan: &Plan,
        creator: &str,
        tasks: &[NewTask],
    ) -> Result<(Pipeline, Vec<Task>)> {
        let mut tx = self.pool.begin().await?;
        let current = fetch_plan(&mut tx, plan.uid)
            .await?
            .ok_or_else(|| DbError::not_found(format!("plan {} not found", plan.uid)))?;
        if current.has_rollout() {
            return Err(DbError::constraint(format!(
                "rollout for plan {} already exists",
                plan.uid
            )));
        }

        let ms = to_millis(Utc::now());
        let pipeline_uid = sqlx::query(
            "INSERT INTO pipelines (project, plan_uid, creator, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(plan.project.as_str())
        .bind(plan.uid)
        .bind(creator)
        .bind(ms)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        let mut created = Vec::with_capacity(tasks.len());
        for task in tasks {
            let uid = sqlx::query(
                r#"
                INSERT INTO tasks (pipeline_uid, environment, instance, database_name, task_type,
                                   migrate_type, sheet_sha256, spec_id, payload,
                                   latest_task_run_status, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(pipeline_uid)
            .bind(task.environment.as_ref().map(|e| e.to_string()))
            .bind(task.instance.as_str())
            .bind(&task.database)
            .bind(task.task_type.tag() as i64)
            .bind(task.migrate_type.map(|m| m.tag() as i64))
            .bind(&task.sheet_sha256)
            .bind(&task.spec_id)
            .bind(to_json(&task.payload)?)
            .bind(TaskRunStatus::NotStarted.tag() as i64)
            .bind(ms)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();
            created.push(Task {
                uid,
                pipeline_uid,
                environment: task.environment.clone(),
                instance: task.instance.clone(),
                database: task.database.clone(),
                task_type: task.task_type,
                migrate_type: task.migrate_type,
                sheet_sha256: task.sheet_sha256.clone(),
                spec_id: task.spec_id.clone(),
                payload: task.payload.clone(),
                latest_task_run_status: TaskRunStatus::NotStarted,
                created_at: from_millis(ms),
            });
        }

        sqlx::query(
            "UPDATE plans SET pipeline_uid = ?, updated_at = MAX(?, updated_at + 1) WHERE uid = ?",
        )
        .bind(pipeline_uid)
        .bind(ms)
        .bind(plan.uid)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r#"
            UPDATE issues SET pipeline_uid = ?, updated_at = MAX(?, updated_at + 1)
            WHERE plan_uid = ? AND pipeline_uid IS NULL
            "#,
        )
        .bind(pipeline_uid)
        .bind(ms)
        .bind(plan.uid)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(
            "Created rollout {} for plan {} with {} tasks",
            pipeline_uid,
            plan.uid,
            created.len()
        );
        let pipeline = Pipeline {
            uid: pipeline_uid,
            project: plan.project.clone(),
            plan_uid: plan.uid,
            creator: creator.to_string(),
            created_at: from_millis(ms),
        };
        Ok((pipeline, created))
    }

    pub async fn get_pipeline(&self, uid: i64) -> Result<Option<Pipeline>> {
        let row: Option<PipelineRow> = sqlx::query_as("SELECT * FROM pipelines WHERE uid = ?")
            .bind(uid)
            .fetch_optional(&self.pool)
            .await?;
        row.map(PipelineRow::into_pipeline).transpose()
    }

    /// Tasks of a pipeline in creation order.
    pub async fn list_tasks(&self, pipeline_uid: i64) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> =
            sqlx::query_as("SELECT * FROM tasks WHERE pipeline_uid = ? ORDER BY uid")
                .bind(pipeline_uid)
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    pub async fn get_task(&self, uid: i64) -> Result<Option<Task>> {
        let mut conn = self.pool.acquire().await?;
        match fetch_task(&mut conn, uid).await {
            Ok(task) => Ok(Some(task)),
            Err(DbError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    // ========================================================================
    // Task runs
    // ========================================================================

    /// Creates a `PENDING` run per task. Fails without writing anything if
    /// a task already has a pending or running run, or is done or skipped.
    pub async fn create_task_runs(&self, runs: &[NewTaskRun]) -> Result<Vec<TaskRun>> {
        let mut tx = self.pool.begin().await?;
        let ms = to_millis(Utc::now());
        let mut created = Vec::with_capacity(runs.len());
        for run in runs {
            let task = fetch_task(&mut tx, run.task_uid).await?;
            if task.latest_task_run_status.is_active() {
                return Err(DbError::invalid_state(format!(
                    "task {} already has a pending or running task run",
                    task.uid
                )));
            }
            if task.latest_task_run_status.is_stage_terminal() {
                return Err(DbError::invalid_state(format!(
                    "task {} is {}",
                    task.uid, task.latest_task_run_status
                )));
            }
            let result = TaskRunResult::default();
            let uid = sqlx::query(
                r#"
                INSERT INTO task_runs (task_uid, creator, status, started_at, run_time_ms, detail,
                                       result, scheduler_info, created_at, updated_at)
                VALUES (?, ?, ?, NULL, NULL, '', ?, NULL, ?, ?)
                "#,
            )
            .bind(run.task_uid)
            .bind(&run.creator)
            .bind(TaskRunStatus::Pending.tag() as i64)
            .bind(to_json(&result)?)
            .bind(ms)
            .bind(ms)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();
            set_task_status(&mut tx, run.task_uid, TaskRunStatus::Pending).await?;
            created.push(TaskRun {
                uid,
                task_uid: run.task_uid,
                creator: run.creator.clone(),
                status: TaskRunStatus::Pending,
                started_at: None,
                run_time_ms: None,
                detail: String::new(),
                result,
                scheduler_info: None,
                created_at: from_millis(ms),
                updated_at: from_millis(ms),
            });
        }
        tx.commit().await?;
        info!("Created {} task runs", created.len());
        Ok(created)
    }

    /// Marks tasks `SKIPPED` with a reason. Tasks with an active run or
    /// already done are rejected.
    pub async fn skip_tasks(&self, task_uids: &[i64], reason: &str) -> Result<Vec<Task>> {
        let mut tx = self.pool.begin().await?;
        let mut skipped = Vec::with_capacity(task_uids.len());
        for uid in task_uids {
            let mut task = fetch_task(&mut tx, *uid).await?;
            if task.latest_task_run_status.is_active()
                || task.latest_task_run_status == TaskRunStatus::Done
            {
                return Err(DbError::invalid_state(format!(
                    "task {} is {} and cannot be skipped",
                    task.uid, task.latest_task_run_status
                )));
            }
            task.payload.skipped_reason = Some(reason.to_string());
            task.latest_task_run_status = TaskRunStatus::Skipped;
            sqlx::query("UPDATE tasks SET payload = ?, latest_task_run_status = ? WHERE uid = ?")
                .bind(to_json(&task.payload)?)
                .bind(TaskRunStatus::Skipped.tag() as i64)
                .bind(task.uid)
                .execute(&mut *tx)
                .await?;
            skipped.push(task);
        }
        tx.commit().await?;
        Ok(skipped)
    }

    pub async fn get_task_run(&self, uid: i64) -> Result<Option<TaskRun>> {
        let mut conn = self.pool.acquire().await?;
        match fetch_task_run(&mut conn, uid).await {
            Ok(run) => Ok(Some(run)),
            Err(DbError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Runs of a task, oldest first.
    pub async fn list_task_runs(&self, task_uid: i64) -> Result<Vec<TaskRun>> {
        let rows: Vec<TaskRunRow> =
            sqlx::query_as("SELECT * FROM task_runs WHERE task_uid = ? ORDER BY uid")
                .bind(task_uid)
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(TaskRunRow::into_run).collect()
    }

    /// Moves a run along the status lattice and mirrors the status onto
    /// its task. An illegal edge is `InvalidState`.
    pub async fn update_task_run_status(
        &self,
        uid: i64,
        status: TaskRunStatus,
        detail: &str,
        result: Option<&TaskRunResult>,
    ) -> Result<TaskRun> {
        let mut tx = self.pool.begin().await?;
        let mut run = fetch_task_run(&mut tx, uid).await?;
        if !run.status.can_transition_to(status) {
            return Err(DbError::invalid_state(format!(
                "task run {} cannot move from {} to {}",
                uid, run.status, status
            )));
        }
        let now = Utc::now();
        if status == TaskRunStatus::Running {
            run.started_at = Some(now);
        }
        if matches!(
            status,
            TaskRunStatus::Done | TaskRunStatus::Failed | TaskRunStatus::Canceled
        ) {
            run.run_time_ms = run
                .started_at
                .map(|started| (now - started).num_milliseconds().max(0));
        }
        run.status = status;
        run.detail = detail.to_string();
        if let Some(result) = result {
            run.result = result.clone();
        }
        // A started run no longer waits on the scheduler.
        if status != TaskRunStatus::Pending {
            run.scheduler_info = None;
        }
        run.updated_at = now;

        sqlx::query(
            r#"
            UPDATE task_runs
            SET status = ?, started_at = ?, run_time_ms = ?, detail = ?, result = ?,
                scheduler_info = ?, updated_at = ?
            WHERE uid = ?
            "#,
        )
        .bind(status.tag() as i64)
        .bind(run.started_at.map(to_millis))
        .bind(run.run_time_ms)
        .bind(&run.detail)
        .bind(to_json(&run.result)?)
        .bind(run.scheduler_info.as_ref().map(to_json).transpose()?)
        .bind(to_millis(now))
        .bind(uid)
        .execute(&mut *tx)
        .await?;
        set_task_status(&mut tx, run.task_uid, status).await?;
        tx.commit().await?;

        info!(task_run = uid, "Task run moved to {}", status);
        Ok(run)
    }

    /// Records why a pending run is still waiting.
    pub async fn set_task_run_scheduler_info(&self, uid: i64, info: &SchedulerInfo) -> Result<()> {
        let affected = sqlx::query(
            "UPDATE task_runs SET scheduler_info = ?, updated_at = ? WHERE uid = ? AND status = ?",
        )
        .bind(to_json(info)?)
        .bind(to_millis(Utc::now()))
        .bind(uid)
        .bind(TaskRunStatus::Pending.tag() as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if affected == 0 {
            return Err(DbError::invalid_state(format!("task run {} is not pending", uid)));
        }
        Ok(())
    }
}

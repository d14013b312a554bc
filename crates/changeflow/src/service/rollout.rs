//! Rollout service: materialising plans into tasks and driving task runs.

use super::AppState;
use crate::comment::append_comment;
use crate::context::RequestContext;
use crate::license::Feature;
use crate::plan_check::{expand_targets, spec_sheets};
use crate::plan_validator::validate_plan;
use crate::rollout::{convert_to_rollout, releasers, stage_policy};
use crate::webhook::WebhookEvent;
use changeflow_db::{NewTask, NewTaskRun};
use changeflow_ids::{
    EnvironmentName, InstanceName, IssueName, PlanName, ProjectName, RolloutName, SheetName, StageId,
    StageName, TaskName, TaskRunName,
};
use changeflow_protocol::{
    ApiError, ApiResult, ChangeType, CommentEvent, Issue, IssueStatus, MigrateType, Pipeline, Plan,
    Rollout, RolloutPolicy, SpecConfig, Stage, Task, TaskPayload, TaskRun, TaskRunResult,
    TaskRunStatus, TaskType, WebhookEventType, ISSUE_ROLE_CREATOR, ISSUE_ROLE_LAST_APPROVER,
};
use changeflow_security::Permission;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct UpdateTaskRunStatusRequest {
    /// `projects/{pid}/rollouts/{uid}/stages/{env}/tasks/{uid}/taskRuns/{uid}`.
    pub name: String,
    pub status: TaskRunStatus,
    pub detail: String,
    pub result: Option<TaskRunResult>,
}

/// A pipeline with everything needed to project and authorise it.
struct Loaded {
    pipeline: Pipeline,
    plan: Option<Plan>,
    issue: Option<Issue>,
    rollout: Rollout,
}

impl Loaded {
    fn stage(&self, id: &StageId) -> ApiResult<&Stage> {
        self.rollout
            .stages
            .iter()
            .find(|s| &s.id == id)
            .ok_or_else(|| {
                ApiError::not_found(format!(
                    "stage {} not found",
                    StageName::new(self.pipeline.project.clone(), self.pipeline.uid, id.clone())
                ))
            })
    }

    fn task(&self, name: &TaskName) -> ApiResult<&Task> {
        self.stage(&name.stage)?
            .tasks
            .iter()
            .find(|t| t.uid == name.task)
            .ok_or_else(|| ApiError::not_found(format!("task {} not found", name)))
    }
}

fn migrate_kind(change_type: ChangeType, enable_ghost: bool) -> (TaskType, Option<MigrateType>) {
    match change_type {
        ChangeType::Sdl => (TaskType::DatabaseSdl, None),
        ChangeType::Data => (TaskType::DatabaseMigrate, Some(MigrateType::Dml)),
        ChangeType::Migrate if enable_ghost => (TaskType::DatabaseMigrate, Some(MigrateType::Ghost)),
        ChangeType::Migrate => (TaskType::DatabaseMigrate, Some(MigrateType::Ddl)),
    }
}

#[derive(Clone)]
pub struct RolloutService {
    state: Arc<AppState>,
}

impl RolloutService {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    async fn load(&self, name: &RolloutName) -> ApiResult<Loaded> {
        let store = &self.state.store;
        let pipeline = store
            .get_pipeline(name.rollout)
            .await?
            .filter(|p| p.project == name.project)
            .ok_or_else(|| ApiError::not_found(format!("rollout {} not found", name)))?;
        let plan = store.get_plan(pipeline.plan_uid).await?;
        let issue = store.get_issue_by_pipeline(pipeline.uid).await?;
        let tasks = store.list_tasks(pipeline.uid).await?;
        let environments = store.list_environments().await?;
        let deployment = plan.as_ref().and_then(|p| p.deployment.as_ref());
        let rollout = convert_to_rollout(&pipeline, tasks, deployment, &environments);
        Ok(Loaded {
            pipeline,
            plan,
            issue,
            rollout,
        })
    }

    /// Rollout policies in force. Without the rollout policy feature every
    /// stage rolls out automatically.
    async fn policies(&self) -> ApiResult<Option<BTreeMap<String, RolloutPolicy>>> {
        if !self.state.license.is_enabled(Feature::RolloutPolicy) {
            return Ok(None);
        }
        Ok(Some(self.state.store.rollout_policies().await?))
    }

    async fn policy_of(&self, stage: &Stage) -> ApiResult<RolloutPolicy> {
        Ok(match self.policies().await? {
            Some(policies) => stage_policy(&policies, stage),
            None => RolloutPolicy {
                automatic: true,
                roles: Vec::new(),
            },
        })
    }

    /// Tasks for every spec of `plan`: one per target database and sheet,
    /// or one per instance for database creation.
    async fn materialise(&self, plan: &Plan) -> ApiResult<Vec<NewTask>> {
        let store = &self.state.store;
        let group = validate_plan(store, &plan.project, &plan.specs).await?;
        let mut tasks = Vec::new();
        for spec in &plan.specs {
            match &spec.config {
                SpecConfig::CreateDatabase(config) => {
                    let instance = InstanceName::parse(&config.target)?;
                    let environment = if config.environment.is_empty() {
                        store
                            .get_instance(&instance.instance)
                            .await?
                            .and_then(|i| i.environment)
                    } else {
                        Some(EnvironmentName::parse(&config.environment)?.environment)
                    };
                    tasks.push(NewTask {
                        environment,
                        instance: instance.instance,
                        database: Some(config.database.clone()),
                        task_type: TaskType::DatabaseCreate,
                        migrate_type: None,
                        sheet_sha256: None,
                        spec_id: spec.id.clone(),
                        payload: TaskPayload {
                            character_set: config.character_set.clone(),
                            collation: config.collation.clone(),
                            ..Default::default()
                        },
                    });
                }
                SpecConfig::ChangeDatabase(config) => {
                    let (task_type, migrate_type) = migrate_kind(config.change_type, config.enable_ghost);
                    let sheets =
                        spec_sheets(store, plan, config.sheet.as_deref(), config.release.as_deref()).await?;
                    for db in expand_targets(store, &config.targets, group.as_ref()).await? {
                        let environment = store.get_database(&db).await?.and_then(|d| d.environment);
                        for sheet in &sheets {
                            tasks.push(NewTask {
                                environment: environment.clone(),
                                instance: db.instance.clone(),
                                database: Some(db.database.clone()),
                                task_type,
                                migrate_type,
                                sheet_sha256: Some(sheet.clone()),
                                spec_id: spec.id.clone(),
                                payload: TaskPayload {
                                    enable_prior_backup: config.enable_prior_backup,
                                    enable_ghost: config.enable_ghost,
                                    ghost_flags: config.ghost_flags.clone(),
                                    ..Default::default()
                                },
                            });
                        }
                    }
                }
                SpecConfig::ExportData(config) => {
                    let sheet = SheetName::parse(&config.sheet)?.sha256;
                    for db in expand_targets(store, &config.targets, group.as_ref()).await? {
                        let environment = store.get_database(&db).await?.and_then(|d| d.environment);
                        tasks.push(NewTask {
                            environment,
                            instance: db.instance.clone(),
                            database: Some(db.database.clone()),
                            task_type: TaskType::DatabaseExport,
                            migrate_type: None,
                            sheet_sha256: Some(sheet.clone()),
                            spec_id: spec.id.clone(),
                            payload: TaskPayload {
                                export_format: Some(config.format),
                                ..Default::default()
                            },
                        });
                    }
                }
            }
        }
        Ok(tasks)
    }

    /// Materialises the rollout of `plan`. A plan gets at most one rollout.
    pub async fn create_rollout(&self, ctx: &RequestContext, parent: &str, plan: &str) -> ApiResult<Rollout> {
        self.state.acl.authorize(ctx, "CreateRollout", parent).await?;
        let project = ProjectName::parse(parent)?;
        let plan_name = PlanName::parse(plan)?;
        if plan_name.project != project.project {
            return Err(ApiError::invalid_argument(format!(
                "plan {} does not belong to {}",
                plan_name, project
            )));
        }
        let plan = self
            .state
            .store
            .get_plan(plan_name.plan)
            .await?
            .filter(|p| p.project == project.project)
            .ok_or_else(|| ApiError::not_found(format!("plan {} not found", plan_name)))?;
        if plan.has_rollout() {
            return Err(ApiError::already_exists(format!(
                "rollout for plan {} already exists",
                plan_name
            )));
        }
        let tasks = self.materialise(&plan).await?;

        ctx.check()?;
        let (pipeline, created) = self
            .state
            .store
            .create_rollout(&plan, ctx.email(), &tasks)
            .await?;
        info!(rollout = pipeline.uid, plan = plan.uid, tasks = created.len(), "Rollout created");
        Ok(self
            .load(&RolloutName::new(pipeline.project.clone(), pipeline.uid))
            .await?
            .rollout)
    }

    pub async fn get_rollout(&self, ctx: &RequestContext, name: &str) -> ApiResult<Rollout> {
        self.state.acl.authorize(ctx, "GetRollout", name).await?;
        Ok(self.load(&RolloutName::parse(name)?).await?.rollout)
    }

    /// Roles allowed to release the next stage of the issue's rollout.
    pub async fn issue_releasers(&self, ctx: &RequestContext, issue: &str) -> ApiResult<Vec<String>> {
        self.state.acl.authorize(ctx, "GetIssue", issue).await?;
        let issue = self.state.issue(&IssueName::parse(issue)?).await?;
        let Some(pipeline_uid) = issue.pipeline_uid else {
            return Ok(Vec::new());
        };
        let loaded = self
            .load(&RolloutName::new(issue.project.clone(), pipeline_uid))
            .await?;
        let policies = self.policies().await?.unwrap_or_default();
        Ok(releasers(&issue, &loaded.rollout, &policies))
    }

    /// Whether the caller may run, skip or cancel tasks of `stage`.
    async fn can_run_stage(&self, ctx: &RequestContext, loaded: &Loaded, stage: &Stage) -> ApiResult<bool> {
        let principal = &ctx.principal;
        if self
            .state
            .iam
            .check(principal, Permission::TaskRunsCreate, None, None)
            .await?
        {
            return Ok(true);
        }
        let project = ProjectName::new(loaded.pipeline.project.clone()).to_string();
        if !self
            .state
            .iam
            .check(principal, Permission::RolloutsGet, Some(&project), None)
            .await?
        {
            return Ok(false);
        }

        let policy = self.policy_of(stage).await?;
        if policy.automatic {
            return Ok(true);
        }
        let roles = self
            .state
            .iam
            .roles(principal, Some(&loaded.pipeline.project))
            .await?;
        for role in &policy.roles {
            if roles.contains(role) {
                return Ok(true);
            }
            let Some(issue) = &loaded.issue else {
                continue;
            };
            match role.as_str() {
                ISSUE_ROLE_CREATOR if issue.creator == ctx.email() => return Ok(true),
                ISSUE_ROLE_LAST_APPROVER => {
                    let user = self.state.store.get_user_by_email(ctx.email()).await?;
                    if user.is_some_and(|u| Some(u.uid) == issue.payload.approval.last_approver()) {
                        return Ok(true);
                    }
                }
                _ => {}
            }
        }
        Ok(false)
    }

    async fn require_run_stage(
        &self,
        ctx: &RequestContext,
        loaded: &Loaded,
        stage: &Stage,
        tasks: &[&Task],
    ) -> ApiResult<()> {
        if !self.can_run_stage(ctx, loaded, stage).await? {
            return Err(ApiError::permission_denied(format!(
                "user {} is not allowed to run tasks in stage {}",
                ctx.email(),
                stage.name
            )));
        }
        if tasks.iter().any(|t| t.task_type == TaskType::DatabaseExport)
            && loaded.issue.as_ref().map(|i| i.creator.as_str()) != Some(ctx.email())
        {
            return Err(ApiError::permission_denied(
                "only the issue creator can run export tasks",
            ));
        }
        Ok(())
    }

    /// Resolves task names that must all sit in one stage.
    async fn stage_tasks(&self, parent: &str, tasks: &[String]) -> ApiResult<(Loaded, StageId, Vec<i64>)> {
        let stage = StageName::parse(parent)?;
        if tasks.is_empty() {
            return Err(ApiError::invalid_argument("tasks must not be empty"));
        }
        let loaded = self
            .load(&RolloutName::new(stage.project.clone(), stage.rollout))
            .await?;
        let mut uids = Vec::with_capacity(tasks.len());
        for name in tasks {
            let name = TaskName::parse(name)?;
            if name.stage_name() != stage {
                return Err(ApiError::invalid_argument(format!(
                    "task {} does not belong to stage {}",
                    name, stage
                )));
            }
            uids.push(loaded.task(&name)?.uid);
        }
        Ok((loaded, stage.stage, uids))
    }

    fn require_open_issue(loaded: &Loaded) -> ApiResult<()> {
        let Some(issue) = &loaded.issue else {
            return Ok(());
        };
        if issue.status != IssueStatus::Open {
            return Err(ApiError::failed_precondition(format!(
                "issue {} is {}",
                issue.name(),
                issue.status
            )));
        }
        if !issue.payload.approval.is_approved() {
            return Err(ApiError::failed_precondition(format!(
                "issue {} is not approved",
                issue.name()
            )));
        }
        Ok(())
    }

    fn task_names(loaded: &Loaded, stage: &StageId, uids: &[i64]) -> Vec<String> {
        uids.iter()
            .map(|uid| {
                TaskName::new(loaded.pipeline.project.clone(), loaded.pipeline.uid, stage.clone(), *uid)
                    .to_string()
            })
            .collect()
    }

    async fn record_task_update(&self, ctx: &RequestContext, loaded: &Loaded, tasks: Vec<String>, status: TaskRunStatus) {
        if let Some(issue) = &loaded.issue {
            let event = CommentEvent::TaskUpdate {
                tasks,
                from_sheet: None,
                to_sheet: None,
                to_status: Some(status),
            };
            append_comment(&self.state.store, issue, ctx.email(), "", Some(event)).await;
        }
    }

    /// Starts a PENDING run for each named task of the stage `parent`.
    pub async fn batch_run_tasks(&self, ctx: &RequestContext, parent: &str, tasks: &[String]) -> ApiResult<Vec<TaskRun>> {
        self.state.acl.authorize(ctx, "BatchRunTasks", parent).await?;
        let (loaded, stage_id, uids) = self.stage_tasks(parent, tasks).await?;
        Self::require_open_issue(&loaded)?;
        let stage = loaded.stage(&stage_id)?;
        let selected: Vec<&Task> = stage.tasks.iter().filter(|t| uids.contains(&t.uid)).collect();
        self.require_run_stage(ctx, &loaded, stage, &selected).await?;

        ctx.check()?;
        let runs: Vec<NewTaskRun> = uids
            .iter()
            .map(|uid| NewTaskRun {
                task_uid: *uid,
                creator: ctx.email().to_string(),
            })
            .collect();
        let created = self.state.store.create_task_runs(&runs).await?;
        info!(rollout = loaded.pipeline.uid, runs = created.len(), user = %ctx.email(), "Task runs created");
        let names = Self::task_names(&loaded, &stage_id, &uids);
        self.record_task_update(ctx, &loaded, names, TaskRunStatus::Pending).await;
        Ok(created)
    }

    pub async fn batch_skip_tasks(
        &self,
        ctx: &RequestContext,
        parent: &str,
        tasks: &[String],
        reason: &str,
    ) -> ApiResult<Vec<Task>> {
        self.state.acl.authorize(ctx, "BatchSkipTasks", parent).await?;
        let (loaded, stage_id, uids) = self.stage_tasks(parent, tasks).await?;
        let stage = loaded.stage(&stage_id)?;
        let selected: Vec<&Task> = stage.tasks.iter().filter(|t| uids.contains(&t.uid)).collect();
        self.require_run_stage(ctx, &loaded, stage, &selected).await?;

        ctx.check()?;
        let skipped = self.state.store.skip_tasks(&uids, reason).await?;
        info!(rollout = loaded.pipeline.uid, tasks = skipped.len(), user = %ctx.email(), "Tasks skipped");
        let names = Self::task_names(&loaded, &stage_id, &uids);
        self.record_task_update(ctx, &loaded, names, TaskRunStatus::Skipped).await;
        self.finish_stage(ctx, &loaded, &stage_id).await?;
        Ok(skipped)
    }

    /// Cancels PENDING or RUNNING runs of tasks in the stage of `parent`.
    pub async fn batch_cancel_task_runs(
        &self,
        ctx: &RequestContext,
        parent: &str,
        task_runs: &[String],
        reason: &str,
    ) -> ApiResult<Vec<TaskRun>> {
        self.state.acl.authorize(ctx, "BatchCancelTaskRuns", parent).await?;
        let names = task_runs
            .iter()
            .map(|n| TaskRunName::parse(n))
            .collect::<Result<Vec<_>, _>>()?;
        let task_names: Vec<String> = names.iter().map(|n| n.task_name().to_string()).collect();
        let (loaded, stage_id, _) = self.stage_tasks(parent, &task_names).await?;
        let stage = loaded.stage(&stage_id)?;
        let selected: Vec<&Task> = stage
            .tasks
            .iter()
            .filter(|t| names.iter().any(|n| n.task == t.uid))
            .collect();
        self.require_run_stage(ctx, &loaded, stage, &selected).await?;

        let mut runs = Vec::with_capacity(names.len());
        for name in &names {
            let run = self.task_run(name).await?;
            if !run.status.is_active() {
                return Err(ApiError::failed_precondition(format!(
                    "taskRun {} is {} and cannot be canceled",
                    name, run.status
                )));
            }
            runs.push(run);
        }

        ctx.check()?;
        let mut canceled = Vec::with_capacity(runs.len());
        for run in runs {
            canceled.push(
                self.state
                    .store
                    .update_task_run_status(run.uid, TaskRunStatus::Canceled, reason, None)
                    .await?,
            );
        }
        info!(rollout = loaded.pipeline.uid, runs = canceled.len(), user = %ctx.email(), "Task runs canceled");
        self.record_task_update(ctx, &loaded, task_names, TaskRunStatus::Canceled).await;
        Ok(canceled)
    }

    async fn task_run(&self, name: &TaskRunName) -> ApiResult<TaskRun> {
        self.state
            .store
            .get_task_run(name.task_run)
            .await?
            .filter(|r| r.task_uid == name.task)
            .ok_or_else(|| ApiError::not_found(format!("taskRun {} not found", name)))
    }

    /// Runs of a task, oldest first.
    pub async fn list_task_runs(&self, ctx: &RequestContext, parent: &str) -> ApiResult<Vec<TaskRun>> {
        self.state.acl.authorize(ctx, "ListTaskRuns", parent).await?;
        let task = TaskName::parse(parent)?;
        let loaded = self
            .load(&RolloutName::new(task.project.clone(), task.rollout))
            .await?;
        let uid = loaded.task(&task)?.uid;
        Ok(self.state.store.list_task_runs(uid).await?)
    }

    pub async fn get_task_run(&self, ctx: &RequestContext, name: &str) -> ApiResult<TaskRun> {
        self.state.acl.authorize(ctx, "GetTaskRun", name).await?;
        let name = TaskRunName::parse(name)?;
        let loaded = self
            .load(&RolloutName::new(name.project.clone(), name.rollout))
            .await?;
        loaded.task(&name.task_name())?;
        self.task_run(&name).await
    }

    /// Executor callback moving a run along the status lattice.
    pub async fn update_task_run_status(
        &self,
        ctx: &RequestContext,
        request: &UpdateTaskRunStatusRequest,
    ) -> ApiResult<TaskRun> {
        self.state
            .acl
            .authorize(ctx, "UpdateTaskRunStatus", request.name.as_str())
            .await?;
        let name = TaskRunName::parse(&request.name)?;
        let loaded = self
            .load(&RolloutName::new(name.project.clone(), name.rollout))
            .await?;
        let task = loaded.task(&name.task_name())?.clone();
        self.task_run(&name).await?;

        ctx.check()?;
        let run = self
            .state
            .store
            .update_task_run_status(
                name.task_run,
                request.status,
                &request.detail,
                request.result.as_ref(),
            )
            .await?;

        if let (Some(issue), Some(backup)) = (&loaded.issue, &run.result.prior_backup) {
            let event = CommentEvent::TaskPriorBackup {
                task: name.task_name().to_string(),
                database: backup.database.clone(),
                tables: backup.tables.clone(),
                error: run.result.error.clone(),
            };
            append_comment(&self.state.store, issue, ctx.email(), "", Some(event)).await;
        }
        if request.status.is_stage_terminal() {
            self.finish_stage(ctx, &loaded, &task.stage_id()).await?;
        }
        Ok(run)
    }

    /// Records the end of `stage` when the latest write finished it.
    ///
    /// `before` is the projection taken ahead of the write; a stage that was
    /// already terminal then is not reported twice.
    async fn finish_stage(&self, ctx: &RequestContext, before: &Loaded, stage: &StageId) -> ApiResult<()> {
        if before.stage(stage)?.is_terminal() {
            return Ok(());
        }
        let after = self
            .load(&RolloutName::new(before.pipeline.project.clone(), before.pipeline.uid))
            .await?;
        let ended = after.stage(stage)?;
        if !ended.is_terminal() {
            return Ok(());
        }
        debug!(rollout = after.pipeline.uid, stage = %stage, "Stage ended");

        let event = match &after.issue {
            Some(issue) => {
                append_comment(
                    &self.state.store,
                    issue,
                    ctx.email(),
                    "",
                    Some(CommentEvent::StageEnd {
                        stage: ended.stage_name(&issue.project, after.pipeline.uid).to_string(),
                    }),
                )
                .await;
                WebhookEvent::for_issue(WebhookEventType::StageEnded, ctx, issue)
            }
            None => WebhookEvent {
                event_type: WebhookEventType::StageEnded,
                project: after.pipeline.project.clone(),
                actor: ctx.email().to_string(),
                title: after.plan.as_ref().map(|p| p.title.clone()).unwrap_or_default(),
                description: String::new(),
                issue: None,
                step: None,
            },
        };
        self.state
            .webhooks
            .emit(event.with_step(ended.name.clone()))
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_kind() {
        assert_eq!(
            migrate_kind(ChangeType::Migrate, false),
            (TaskType::DatabaseMigrate, Some(MigrateType::Ddl))
        );
        assert_eq!(
            migrate_kind(ChangeType::Migrate, true),
            (TaskType::DatabaseMigrate, Some(MigrateType::Ghost))
        );
        assert_eq!(
            migrate_kind(ChangeType::Data, true),
            (TaskType::DatabaseMigrate, Some(MigrateType::Dml))
        );
        assert_eq!(migrate_kind(ChangeType::Sdl, false), (TaskType::DatabaseSdl, None));
    }
}

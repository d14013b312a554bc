//! Plan service: plans and their plan-check runs.

use super::issue::find_approval;
use super::{check_update_mask, AppState};
use crate::context::RequestContext;
use crate::filter::plan::apply_plan_filter;
use crate::plan_check::plan_check_run_from_plan;
use crate::plan_validator::validate_plan;
use changeflow_db::{NewPlan, PlanFind};
use changeflow_ids::{PlanCheckRunName, PlanName, ProjectName, ProjectParent};
use changeflow_protocol::{
    ApiError, ApiResult, DatabaseGroup, Deployment, ErrorContext, IssueStatus, Pagination, Plan, PlanCheckRun,
    PlanCheckRunResult, PlanCheckRunStatus, PlanState, Spec,
};
use changeflow_security::Permission;
use changeflow_sentinel::Signal;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const UPDATE_PLAN_PATHS: &[&str] = &["title", "description", "state", "specs"];

#[derive(Debug, Clone, Default)]
pub struct CreatePlanRequest {
    pub title: String,
    pub description: String,
    pub specs: Vec<Spec>,
    pub deployment: Option<Deployment>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdatePlanRequest {
    /// `projects/{pid}/plans/{uid}`.
    pub name: String,
    pub title: String,
    pub description: String,
    pub state: PlanState,
    pub specs: Vec<Spec>,
}

/// Fires the local cancel handle of run `uid`, if this replica executes
/// it, and broadcasts the cancel so peer replicas fire theirs.
async fn cancel_execution(state: &AppState, uid: i64) -> ApiResult<bool> {
    let local = state.scheduler.cancel_plan_check(uid);
    state
        .signals
        .publish(Signal::CancelPlanCheckRun { uid })
        .await
        .internal_context("publish plan check cancel signal")?;
    Ok(local)
}

/// Interrupts the RUNNING checks of `plan_uid` without touching their rows.
async fn stop_running_checks(state: &AppState, plan_uid: i64) -> ApiResult<()> {
    let runs = state.store.list_plan_check_runs(plan_uid).await?;
    for run in runs.iter().filter(|r| r.status == PlanCheckRunStatus::Running) {
        cancel_execution(state, run.uid).await?;
    }
    Ok(())
}

/// Stops every RUNNING check of `plan_uid` and marks it CANCELED.
pub(crate) async fn interrupt_plan_checks(state: &AppState, plan_uid: i64) -> ApiResult<u64> {
    stop_running_checks(state, plan_uid).await?;
    let canceled = state.store.cancel_plan_check_runs(plan_uid).await?;
    if canceled > 0 {
        debug!(plan = plan_uid, canceled, "Canceled running plan checks");
    }
    Ok(canceled)
}

async fn create_check_runs(
    state: &AppState,
    plan: &Plan,
    group: Option<&DatabaseGroup>,
) -> ApiResult<Vec<PlanCheckRun>> {
    let Some(run) = plan_check_run_from_plan(&state.store, plan, group).await? else {
        return Ok(Vec::new());
    };
    let created = state.store.create_plan_check_runs(&[run]).await?;
    state.scheduler.tickle_plan_check();
    Ok(created)
}

/// Schedules fresh checks for `plan`. A plan that no longer validates
/// gets no checks; the failure is logged.
pub(crate) async fn schedule_plan_checks(state: &AppState, plan: &Plan) -> ApiResult<Vec<PlanCheckRun>> {
    let group = match validate_plan(&state.store, &plan.project, &plan.specs).await {
        Ok(group) => group,
        Err(e) => {
            warn!(plan = plan.uid, "Skipping plan checks of invalid plan: {}", e);
            return Ok(Vec::new());
        }
    };
    create_check_runs(state, plan, group.as_ref()).await
}

#[derive(Clone)]
pub struct PlanService {
    state: Arc<AppState>,
}

impl PlanService {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    async fn plan(&self, name: &PlanName) -> ApiResult<Plan> {
        self.state
            .store
            .get_plan(name.plan)
            .await?
            .filter(|p| p.project == name.project)
            .ok_or_else(|| ApiError::not_found(format!("plan {} not found", name)))
    }

    pub async fn create_plan(
        &self,
        ctx: &RequestContext,
        parent: &str,
        request: &CreatePlanRequest,
    ) -> ApiResult<Plan> {
        self.state.acl.authorize(ctx, "CreatePlan", parent).await?;
        let project = self.state.project(&ProjectName::parse(parent)?.project).await?;
        let group = validate_plan(&self.state.store, &project.id, &request.specs).await?;

        ctx.check()?;
        let plan = self
            .state
            .store
            .create_plan(&NewPlan {
                project: project.id.clone(),
                creator: ctx.email().to_string(),
                title: request.title.clone(),
                description: request.description.clone(),
                specs: request.specs.clone(),
                deployment: request.deployment.clone(),
            })
            .await?;
        info!(plan = plan.uid, user = %ctx.email(), "Plan created");
        create_check_runs(&self.state, &plan, group.as_ref()).await?;
        Ok(plan)
    }

    pub async fn get_plan(&self, ctx: &RequestContext, name: &str) -> ApiResult<Plan> {
        self.state.acl.authorize(ctx, "GetPlan", name).await?;
        self.plan(&PlanName::parse(name)?).await
    }

    pub async fn list_plans(
        &self,
        ctx: &RequestContext,
        parent: &str,
        filter: &str,
        page_size: i32,
        page_token: &str,
    ) -> ApiResult<(Vec<Plan>, String)> {
        self.state.acl.authorize(ctx, "ListPlans", parent).await?;
        let parent = ProjectParent::parse(parent)?;
        let page = Pagination::parse(page_size, page_token)?;
        let project_ids = match parent.project() {
            Some(project) => Some(vec![project.clone()]),
            None => {
                self.state
                    .iam
                    .project_ids_filter(&ctx.principal, Permission::PlansList)
                    .await?
            }
        };
        let mut find = PlanFind {
            project_ids,
            limit: Some(page.fetch_limit()),
            offset: Some(page.offset),
            ..Default::default()
        };
        apply_plan_filter(&self.state.store, filter, &mut find).await?;
        ctx.check()?;
        let plans = self.state.store.find_plans(&find).await?;
        Ok(page.finish(plans))
    }

    /// Applies the masked fields of `request`. With `allow_missing`, a
    /// plan that does not exist is created from the request instead.
    pub async fn update_plan(
        &self,
        ctx: &RequestContext,
        request: &UpdatePlanRequest,
        update_mask: &[String],
        allow_missing: bool,
    ) -> ApiResult<Plan> {
        self.state
            .acl
            .authorize(ctx, "UpdatePlan", request.name.as_str())
            .await?;
        check_update_mask(update_mask, UPDATE_PLAN_PATHS)?;
        let name = PlanName::parse(&request.name)?;
        let plan = match self.state.store.get_plan(name.plan).await? {
            Some(plan) if plan.project == name.project => plan,
            _ if allow_missing => {
                let parent = ProjectName::new(name.project.clone()).to_string();
                let create = CreatePlanRequest {
                    title: request.title.clone(),
                    description: request.description.clone(),
                    specs: request.specs.clone(),
                    deployment: None,
                };
                return self.create_plan(ctx, &parent, &create).await;
            }
            _ => return Err(ApiError::not_found(format!("plan {} not found", name))),
        };

        let mut next = plan.clone();
        let mut specs_changed = false;
        for path in update_mask {
            match path.as_str() {
                "title" => next.title = request.title.clone(),
                "description" => next.description = request.description.clone(),
                "state" => next.state = request.state,
                "specs" => {
                    if let Some(reason) = plan.specs_frozen_reason() {
                        return Err(ApiError::invalid_argument(reason));
                    }
                    specs_changed = next.specs != request.specs;
                    next.specs = request.specs.clone();
                }
                _ => {}
            }
        }
        if next == plan {
            return Ok(plan);
        }

        ctx.check()?;
        if !specs_changed {
            let updated = self.state.store.update_plan(&next).await?;
            info!(plan = updated.uid, user = %ctx.email(), "Plan updated");
            return Ok(updated);
        }

        let group = validate_plan(&self.state.store, &plan.project, &next.specs).await?;
        let runs = plan_check_run_from_plan(&self.state.store, &next, group.as_ref())
            .await?
            .into_iter()
            .collect::<Vec<_>>();
        // The store cancels the rows; executions still need their token.
        stop_running_checks(&self.state, plan.uid).await?;
        let (updated, created) = self.state.store.replace_plan_specs(&next, &runs).await?;
        if !created.is_empty() {
            self.state.scheduler.tickle_plan_check();
        }
        info!(plan = updated.uid, user = %ctx.email(), "Plan specs replaced");

        if let Some(issue) = self.state.store.get_issue_by_plan(updated.uid).await? {
            if issue.status == IssueStatus::Open && issue.payload.approval.finding_done {
                let mut reset = issue.clone();
                reset.payload.approval.reset_finding();
                let reset = self.state.store.update_issue(&reset).await?;
                find_approval(&self.state, ctx, reset).await?;
            }
        }
        Ok(updated)
    }

    /// Cancels the plan's running checks and schedules a fresh set.
    pub async fn run_plan_checks(&self, ctx: &RequestContext, name: &str) -> ApiResult<Vec<PlanCheckRun>> {
        self.state.acl.authorize(ctx, "RunPlanChecks", name).await?;
        let plan = self.plan(&PlanName::parse(name)?).await?;
        let group = validate_plan(&self.state.store, &plan.project, &plan.specs).await?;
        ctx.check()?;
        interrupt_plan_checks(&self.state, plan.uid).await?;
        let runs = create_check_runs(&self.state, &plan, group.as_ref()).await?;
        info!(plan = plan.uid, runs = runs.len(), user = %ctx.email(), "Plan checks scheduled");
        Ok(runs)
    }

    async fn check_run(&self, name: &PlanCheckRunName) -> ApiResult<PlanCheckRun> {
        self.state
            .store
            .get_plan_check_run(name.run)
            .await?
            .filter(|r| r.project == name.project && r.plan_uid == name.plan)
            .ok_or_else(|| ApiError::not_found(format!("planCheckRun {} not found", name)))
    }

    pub async fn get_plan_check_run(&self, ctx: &RequestContext, name: &str) -> ApiResult<PlanCheckRun> {
        self.state.acl.authorize(ctx, "GetPlanCheckRun", name).await?;
        self.check_run(&PlanCheckRunName::parse(name)?).await
    }

    /// Runs of a plan, newest first.
    pub async fn list_plan_check_runs(&self, ctx: &RequestContext, parent: &str) -> ApiResult<Vec<PlanCheckRun>> {
        self.state.acl.authorize(ctx, "ListPlanCheckRuns", parent).await?;
        let plan = self.plan(&PlanName::parse(parent)?).await?;
        Ok(self.state.store.list_plan_check_runs(plan.uid).await?)
    }

    pub async fn cancel_plan_check_run(&self, ctx: &RequestContext, name: &str) -> ApiResult<PlanCheckRun> {
        self.state.acl.authorize(ctx, "CancelPlanCheckRun", name).await?;
        let name = PlanCheckRunName::parse(name)?;
        let run = self.check_run(&name).await?;
        if run.status != PlanCheckRunStatus::Running {
            return Err(ApiError::invalid_argument(format!(
                "planCheckRun {} is not running",
                name
            )));
        }

        ctx.check()?;
        let local = cancel_execution(&self.state, run.uid).await?;
        let result = PlanCheckRunResult {
            error: Some(format!("canceled by {}", ctx.email())),
            ..Default::default()
        };
        let finished = self
            .state
            .store
            .finish_plan_check_run(run.uid, PlanCheckRunStatus::Canceled, &result)
            .await?;
        if !finished {
            return Err(ApiError::invalid_argument(format!(
                "planCheckRun {} is not running",
                name
            )));
        }
        self.state.scheduler.tickle_plan_check();
        info!(run = run.uid, local, user = %ctx.email(), "Plan check run canceled");
        self.check_run(&name).await
    }
}

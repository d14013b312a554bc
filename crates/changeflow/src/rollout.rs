//! Rollout projection.
//!
//! A pipeline stores tasks only. Stages are derived on every read by
//! grouping tasks per environment and ordering the groups.

use changeflow_ids::{EnvironmentId, StageId};
use changeflow_protocol::{
    Deployment, Environment, Issue, IssueStatus, IssueType, Pipeline, Rollout, RolloutPolicy, Stage,
    Task,
};
use std::collections::{BTreeMap, HashMap};

/// Stage title of the `-` stage.
pub const UNASSIGNED_STAGE_TITLE: &str = "Unassigned";

/// Groups `tasks` into stages.
///
/// Stages follow the deployment's environment order when the plan has one,
/// otherwise the workspace order. Stages outside that order, including the
/// `-` stage, come first in order of their first task. Tasks keep their
/// creation order inside a stage. A task whose environment no longer exists
/// lands in the `-` stage.
pub fn convert_to_rollout(
    pipeline: &Pipeline,
    tasks: Vec<Task>,
    deployment: Option<&Deployment>,
    environments: &[Environment],
) -> Rollout {
    let titles: HashMap<&EnvironmentId, &str> =
        environments.iter().map(|e| (&e.id, e.title.as_str())).collect();
    let order: Vec<EnvironmentId> = match deployment.filter(|d| !d.environments.is_empty()) {
        Some(deployment) => deployment.environments.clone(),
        None => environments.iter().map(|e| e.id.clone()).collect(),
    };

    let mut groups: Vec<(StageId, Vec<Task>)> = Vec::new();
    for mut task in tasks {
        if task.environment.as_ref().is_some_and(|env| !titles.contains_key(env)) {
            task.environment = None;
        }
        let id = task.stage_id();
        match groups.iter_mut().find(|(stage, _)| *stage == id) {
            Some((_, group)) => group.push(task),
            None => groups.push((id, vec![task])),
        }
    }

    let rank = |id: &StageId| {
        id.environment()
            .and_then(|env| order.iter().position(|o| o == env))
    };
    // Unranked stages keep first-seen order ahead of ranked ones.
    groups.sort_by_key(|(id, _)| match rank(id) {
        None => (0, 0),
        Some(position) => (1, position),
    });

    let stages = groups
        .into_iter()
        .map(|(id, tasks)| {
            let name = match id.environment() {
                Some(env) => titles
                    .get(env)
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| env.to_string()),
                None => UNASSIGNED_STAGE_TITLE.to_string(),
            };
            Stage { id, name, tasks }
        })
        .collect();

    Rollout {
        uid: pipeline.uid,
        project: pipeline.project.clone(),
        plan_uid: pipeline.plan_uid,
        creator: pipeline.creator.clone(),
        stages,
        created_at: pipeline.created_at,
    }
}

/// Policy governing the stage of `environment`. Environments without a
/// configured policy need a manual release by a workspace releaser.
pub fn stage_policy(
    policies: &BTreeMap<String, RolloutPolicy>,
    stage: &Stage,
) -> RolloutPolicy {
    stage
        .id
        .environment()
        .and_then(|env| policies.get(env.as_str()))
        .cloned()
        .unwrap_or_default()
}

/// Roles allowed to release the active stage of an open change issue.
/// Every other issue has no releasers.
pub fn releasers(
    issue: &Issue,
    rollout: &Rollout,
    policies: &BTreeMap<String, RolloutPolicy>,
) -> Vec<String> {
    if issue.issue_type != IssueType::DatabaseChange || issue.status != IssueStatus::Open {
        return Vec::new();
    }
    match rollout.active_stage() {
        Some(stage) => stage_policy(policies, stage).roles,
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use changeflow_ids::{InstanceId, ProjectId};
    use changeflow_protocol::{EnvironmentTier, IssuePayload, TaskPayload, TaskRunStatus, TaskType};
    use chrono::Utc;

    fn env(id: &str, order: i32) -> Environment {
        Environment {
            id: EnvironmentId::parse(id).unwrap(),
            title: id.to_uppercase(),
            order,
            tier: EnvironmentTier::Unprotected,
            color: String::new(),
            tags: BTreeMap::new(),
        }
    }

    fn task(uid: i64, environment: Option<&str>) -> Task {
        Task {
            uid,
            pipeline_uid: 1,
            environment: environment.map(|e| EnvironmentId::parse(e).unwrap()),
            instance: InstanceId::parse("i1").unwrap(),
            database: Some(format!("db{}", uid)),
            task_type: TaskType::DatabaseMigrate,
            migrate_type: None,
            sheet_sha256: None,
            spec_id: "s".into(),
            payload: TaskPayload::default(),
            latest_task_run_status: TaskRunStatus::NotStarted,
            created_at: Utc::now(),
        }
    }

    fn pipeline() -> Pipeline {
        Pipeline {
            uid: 1,
            project: ProjectId::parse("p1").unwrap(),
            plan_uid: 1,
            creator: "bob@x".into(),
            created_at: Utc::now(),
        }
    }

    fn stage_ids(rollout: &Rollout) -> Vec<String> {
        rollout.stages.iter().map(|s| s.id.to_string()).collect()
    }

    #[test]
    fn test_workspace_order_with_unknown_prepended() {
        let envs = vec![env("test", 1), env("prod", 2)];
        let tasks = vec![
            task(1, Some("prod")),
            task(2, Some("test")),
            task(3, Some("gone")),
            task(4, None),
            task(5, Some("prod")),
        ];
        let rollout = convert_to_rollout(&pipeline(), tasks, None, &envs);
        assert_eq!(stage_ids(&rollout), vec!["-", "test", "prod"]);
        let unassigned: Vec<i64> = rollout.stages[0].tasks.iter().map(|t| t.uid).collect();
        assert_eq!(unassigned, vec![3, 4]);
        let prod: Vec<i64> = rollout.stages[2].tasks.iter().map(|t| t.uid).collect();
        assert_eq!(prod, vec![1, 5]);
        assert_eq!(rollout.stages[1].name, "TEST");
    }

    #[test]
    fn test_deployment_order_wins() {
        let envs = vec![env("test", 1), env("staging", 2), env("prod", 3)];
        let deployment = Deployment {
            environments: vec![
                EnvironmentId::parse("prod").unwrap(),
                EnvironmentId::parse("test").unwrap(),
            ],
        };
        let tasks = vec![task(1, Some("test")), task(2, Some("prod")), task(3, Some("staging"))];
        let rollout = convert_to_rollout(&pipeline(), tasks, Some(&deployment), &envs);
        assert_eq!(stage_ids(&rollout), vec!["staging", "prod", "test"]);
    }

    #[test]
    fn test_releasers_only_for_open_change_issues() {
        let envs = vec![env("test", 1), env("prod", 2)];
        let mut tasks = vec![task(1, Some("test")), task(2, Some("prod"))];
        tasks[0].latest_task_run_status = TaskRunStatus::Done;
        let rollout = convert_to_rollout(&pipeline(), tasks, None, &envs);

        let mut policies = BTreeMap::new();
        policies.insert(
            "prod".to_string(),
            RolloutPolicy {
                automatic: false,
                roles: vec!["roles/projectReleaser".into()],
            },
        );
        let now = Utc::now();
        let mut issue = Issue {
            uid: 1,
            project: ProjectId::parse("p1").unwrap(),
            creator: "bob@x".into(),
            title: "t".into(),
            description: String::new(),
            issue_type: IssueType::DatabaseChange,
            status: IssueStatus::Open,
            plan_uid: Some(1),
            pipeline_uid: Some(1),
            payload: IssuePayload::default(),
            subscribers: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        assert_eq!(releasers(&issue, &rollout, &policies), vec!["roles/projectReleaser"]);

        issue.status = IssueStatus::Done;
        assert!(releasers(&issue, &rollout, &policies).is_empty());
    }
}

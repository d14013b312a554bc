//! Shared seeding for the end-to-end tests.
//!
//! Workspace layout:
//! - environments `test` (first) and `prod`
//! - instances `i1` (test) and `i2` (prod), one database each: `d1`, `d2`
//! - project `p1` owning both databases, with one webhook on every event
//! - users: `admin@x` (workspace admin), `bob@x` (developer), `alice@x`
//!   (developer, `roles/reviewer`), `carol@x` (project owner, `roles/owner`)
//! - one approval rule: DATABASE_CHANGE issues need reviewer then owner

#![allow(dead_code)]

use changeflow::service::{CreateIssueRequest, CreatePlanRequest};
use changeflow::webhook::WebhookDelivery;
use changeflow::{open_state, AppState, RequestContext};
use changeflow_ids::{EnvironmentId, InstanceId, ProjectId, RoleId};
use changeflow_protocol::{
    ApprovalRule, ApprovalTemplate, Binding, ChangeDatabaseConfig, DataSource, DataSourceType,
    Database, Engine, Environment, EnvironmentTier, IamPolicy, Instance, Issue, IssueType, Plan,
    Project, ProjectSettings, ProjectWebhook, RiskSource, Role, Spec, SpecConfig, SyncState,
    SystemConfig, WebhookEventType, WorkspaceApprovalSetting,
};
use changeflow_security::permission::{
    ROLE_PROJECT_DEVELOPER, ROLE_PROJECT_OWNER, ROLE_WORKSPACE_ADMIN,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;

pub const PROJECT: &str = "projects/p1";
pub const D1: &str = "instances/i1/databases/d1";
pub const D2: &str = "instances/i2/databases/d2";
pub const ADMIN: &str = "admin@x";
pub const ALICE: &str = "alice@x";
pub const BOB: &str = "bob@x";
pub const CAROL: &str = "carol@x";
pub const ROLE_REVIEWER: &str = "roles/reviewer";
pub const ROLE_OWNER: &str = "roles/owner";

pub struct Fixture {
    pub state: Arc<AppState>,
    /// `projects/p1/sheets/{sha256}` of a one-statement migration.
    pub sheet: String,
    pub deliveries: mpsc::Receiver<WebhookDelivery>,
    _dir: TempDir,
}

fn binding(role: &str, members: &[&str]) -> Binding {
    Binding {
        role: role.to_string(),
        members: members.iter().map(|m| format!("user:{}", m)).collect(),
        condition: None,
    }
}

fn environment(id: &str, order: i32) -> Environment {
    Environment {
        id: EnvironmentId::parse(id).unwrap(),
        title: id.to_uppercase(),
        order,
        tier: EnvironmentTier::Unprotected,
        color: String::new(),
        tags: BTreeMap::new(),
    }
}

fn instance(id: &str, env: &str) -> Instance {
    Instance {
        id: InstanceId::parse(id).unwrap(),
        title: id.to_string(),
        engine: Engine::Mysql,
        environment: Some(EnvironmentId::parse(env).unwrap()),
        data_sources: vec![DataSource {
            id: "admin".into(),
            source_type: DataSourceType::Admin,
            host: "127.0.0.1".into(),
            port: "3306".into(),
            username: "root".into(),
            password: "secret".into(),
            external_secret: None,
        }],
        activation: true,
        sync_interval_secs: None,
        last_slow_query_sync: None,
        deleted: false,
    }
}

fn database(instance: &str, name: &str) -> Database {
    Database {
        instance: InstanceId::parse(instance).unwrap(),
        name: name.to_string(),
        project: ProjectId::parse("p1").unwrap(),
        environment: None,
        labels: BTreeMap::new(),
        sync_state: SyncState::Ok,
        last_sync_time: None,
    }
}

pub fn change_rule() -> ApprovalRule {
    ApprovalRule {
        source: RiskSource::Unspecified,
        condition: "issue_type == \"DATABASE_CHANGE\"".into(),
        template: ApprovalTemplate::with_roles("change review", [ROLE_REVIEWER, ROLE_OWNER]),
    }
}

pub async fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let config = SystemConfig {
        replica_id: "replica-a".into(),
        ..Default::default()
    };
    let state = open_state(config, dir.path()).await.unwrap();
    let store = &state.store;

    store.upsert_environment(&environment("test", 0)).await.unwrap();
    store.upsert_environment(&environment("prod", 1)).await.unwrap();
    store.create_instance(&instance("i1", "test")).await.unwrap();
    store.create_instance(&instance("i2", "prod")).await.unwrap();

    for email in [ADMIN, ALICE, BOB, CAROL] {
        store.create_user(email, email).await.unwrap();
    }
    for (id, title) in [("reviewer", "Reviewer"), ("owner", "Owner")] {
        store
            .upsert_role(&Role {
                id: RoleId::parse(id).unwrap(),
                title: title.into(),
                permissions: vec!["issues.get".into()],
            })
            .await
            .unwrap();
    }
    store
        .set_workspace_policy(&IamPolicy {
            bindings: vec![binding(ROLE_WORKSPACE_ADMIN, &[ADMIN])],
        })
        .await
        .unwrap();

    store
        .create_project(&Project {
            id: ProjectId::parse("p1").unwrap(),
            title: "Project One".into(),
            settings: ProjectSettings::default(),
            webhooks: vec![ProjectWebhook {
                title: "all events".into(),
                url: "https://hooks.example.com/p1".into(),
                events: WebhookEventType::ALL.to_vec(),
            }],
            policy: IamPolicy {
                bindings: vec![
                    binding(ROLE_PROJECT_DEVELOPER, &[ALICE, BOB]),
                    binding(ROLE_PROJECT_OWNER, &[CAROL]),
                    binding(ROLE_REVIEWER, &[ALICE]),
                    binding(ROLE_OWNER, &[CAROL]),
                ],
            },
            deleted: false,
        })
        .await
        .unwrap();
    store.upsert_database(&database("i1", "d1")).await.unwrap();
    store.upsert_database(&database("i2", "d2")).await.unwrap();

    store
        .set_approval_setting(&WorkspaceApprovalSetting {
            rules: vec![change_rule()],
        })
        .await
        .unwrap();

    let sheet = store
        .create_sheet(
            &ProjectId::parse("p1").unwrap(),
            "add column",
            "ALTER TABLE t ADD COLUMN c INT;",
            BOB,
        )
        .await
        .unwrap();

    let deliveries = state.webhooks.take_receiver().unwrap();
    Fixture {
        state,
        sheet: sheet.name().to_string(),
        deliveries,
        _dir: dir,
    }
}

impl Fixture {
    pub async fn ctx(&self, email: &str) -> RequestContext {
        self.state.context(email).await.unwrap()
    }

    pub async fn set_rules(&self, rules: Vec<ApprovalRule>) {
        self.state
            .store
            .set_approval_setting(&WorkspaceApprovalSetting { rules })
            .await
            .unwrap();
    }

    pub fn change_plan(&self, targets: &[&str]) -> CreatePlanRequest {
        CreatePlanRequest {
            title: "add column".into(),
            description: String::new(),
            specs: vec![Spec {
                id: "spec-1".into(),
                config: SpecConfig::ChangeDatabase(ChangeDatabaseConfig {
                    targets: targets.iter().map(|t| t.to_string()).collect(),
                    sheet: Some(self.sheet.clone()),
                    ..Default::default()
                }),
            }],
            deployment: None,
        }
    }

    pub async fn create_plan(&self, targets: &[&str]) -> Plan {
        let ctx = self.ctx(BOB).await;
        self.state
            .plans()
            .create_plan(&ctx, PROJECT, &self.change_plan(targets))
            .await
            .unwrap()
    }

    /// A DATABASE_CHANGE issue by bob on a fresh plan over `targets`,
    /// optionally with the plan's rollout created first.
    pub async fn change_issue(&self, targets: &[&str], with_rollout: bool) -> Issue {
        let ctx = self.ctx(BOB).await;
        let plan = self.create_plan(targets).await;
        if with_rollout {
            self.state
                .rollouts()
                .create_rollout(&ctx, PROJECT, &plan.name().to_string())
                .await
                .unwrap();
        }
        let request = CreateIssueRequest {
            title: format!("change {}", plan.uid),
            description: String::new(),
            issue_type: IssueType::DatabaseChange,
            plan: Some(plan.name().to_string()),
            rollout: None,
            grant_request: None,
            labels: Vec::new(),
            subscribers: Vec::new(),
        };
        self.state
            .issues()
            .create_issue(&ctx, PROJECT, &request)
            .await
            .unwrap()
    }

    /// Runs the approval finder on `issue` the way the background runner
    /// does, and returns the stored result.
    pub async fn find_approval(&self, issue: &Issue) -> Issue {
        let runner = changeflow::runner::ApprovalRunner::new(
            self.state.store.clone(),
            self.state.approvals.clone(),
        );
        runner.process(issue.uid).await;
        self.state.store.get_issue(issue.uid).await.unwrap().unwrap()
    }

    /// Every delivery queued so far.
    pub fn drain_deliveries(&mut self) -> Vec<WebhookDelivery> {
        let mut out = Vec::new();
        while let Ok(delivery) = self.deliveries.try_recv() {
            out.push(delivery);
        }
        out
    }
}

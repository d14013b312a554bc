//! Invariants of the approval flow, access grants, plan validation and
//! stage release.

mod common;

use changeflow::plan_validator::check_structure;
use changeflow::service::{CreateAccessGrantRequest, UpdateTaskRunStatusRequest};
use changeflow_db::AccessGrantFind;
use changeflow_ids::EnvironmentId;
use changeflow_protocol::defaults::MAX_GRANT_LIFETIME_SECS;
use changeflow_protocol::{
    AccessGrant, AccessGrantStatus, ApprovalRule, ApprovalStatus, ApprovalTemplate,
    ApproverStatus, ChangeDatabaseConfig, Code, CreateDatabaseConfig, ExportDataConfig,
    IssueStatus, RiskSource, RolloutPolicy, Spec, SpecConfig, TaskRunStatus,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use common::*;
use proptest::prelude::*;

fn grant_rule() -> ApprovalRule {
    ApprovalRule {
        source: RiskSource::Unspecified,
        condition: "issue_type == \"ACCESS_GRANT\"".into(),
        template: ApprovalTemplate::with_roles("grant review", [ROLE_OWNER]),
    }
}

async fn request_grant(
    f: &Fixture,
    expire_time: Option<DateTime<Utc>>,
    ttl_secs: Option<i64>,
) -> AccessGrant {
    let bob = f.ctx(BOB).await;
    f.state
        .access_grants()
        .create_access_grant(
            &bob,
            PROJECT,
            &CreateAccessGrantRequest {
                targets: vec![D1.into()],
                query: true,
                reason: "investigate".into(),
                expire_time,
                ttl_secs,
                ..Default::default()
            },
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn test_rejection_blocks_until_rerequested() {
    let f = fixture().await;
    let issue = f.change_issue(&[D1], false).await;
    let issue = f.find_approval(&issue).await;
    let name = issue.name().to_string();
    let issues = f.state.issues();

    let alice = f.ctx(ALICE).await;
    let approved = issues.approve_issue(&alice, &name, "").await.unwrap();
    assert_eq!(approved.payload.approval.approvers.len(), 1);
    let first = approved.payload.approval.approvers[0];
    assert_eq!(first.status, ApproverStatus::Approved);

    let carol = f.ctx(CAROL).await;
    let rejected = issues.reject_issue(&carol, &name, "not yet").await.unwrap();
    assert_eq!(rejected.approval_status(), ApprovalStatus::Rejected);

    let err = issues.approve_issue(&carol, &name, "").await.unwrap_err();
    assert_eq!(err.code, Code::InvalidArgument);

    let bob = f.ctx(BOB).await;
    let requested = issues.request_issue(&bob, &name, "").await.unwrap();
    assert_eq!(requested.approval_status(), ApprovalStatus::Pending);
    assert_eq!(requested.payload.approval.approvers, vec![first]);

    let done = issues.approve_issue(&carol, &name, "").await.unwrap();
    assert_eq!(done.approval_status(), ApprovalStatus::Approved);
}

#[tokio::test]
async fn test_reviewer_must_hold_step_role() {
    let f = fixture().await;
    let issue = f.change_issue(&[D1], false).await;
    let issue = f.find_approval(&issue).await;
    let name = issue.name().to_string();

    // Step 0 wants roles/reviewer, which only alice holds.
    let carol = f.ctx(CAROL).await;
    let err = f
        .state
        .issues()
        .approve_issue(&carol, &name, "")
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::PermissionDenied);
}

#[tokio::test]
async fn test_grant_status_follows_issue() {
    let f = fixture().await;
    f.set_rules(vec![grant_rule()]).await;

    let grant = request_grant(&f, None, Some(600)).await;
    let issue_uid = grant.payload.issue_uid.unwrap();
    let issue = f.state.store.get_issue(issue_uid).await.unwrap().unwrap();
    assert_eq!(grant.status, AccessGrantStatus::Pending);
    assert_eq!(issue.status, IssueStatus::Open);
    assert_eq!(issue.approval_status(), ApprovalStatus::Pending);

    let carol = f.ctx(CAROL).await;
    let approved = f
        .state
        .issues()
        .approve_issue(&carol, &issue.name().to_string(), "")
        .await
        .unwrap();
    assert_eq!(approved.status, IssueStatus::Done);

    let grant = f
        .state
        .access_grants()
        .get_access_grant(&carol, &grant.name().to_string())
        .await
        .unwrap();
    assert_eq!(grant.status, AccessGrantStatus::Active);
}

#[tokio::test]
async fn test_manual_activation_from_ttl() {
    let f = fixture().await;
    f.set_rules(vec![grant_rule()]).await;
    let grant = request_grant(&f, None, Some(900)).await;
    assert!(grant.expire_time.is_none());

    let carol = f.ctx(CAROL).await;
    let before = Utc::now();
    let active = f
        .state
        .access_grants()
        .activate_access_grant(&carol, &grant.name().to_string())
        .await
        .unwrap();
    let after = Utc::now();

    assert_eq!(active.status, AccessGrantStatus::Active);
    let expire = active.expire_time.unwrap();
    assert!(expire >= before + Duration::seconds(899));
    assert!(expire <= after + Duration::seconds(901));

    // The companion issue completes with the grant.
    let issue_uid = active.payload.issue_uid.unwrap();
    let issue = f.state.store.get_issue(issue_uid).await.unwrap().unwrap();
    assert_eq!(issue.status, IssueStatus::Done);

    let err = f
        .state
        .access_grants()
        .activate_access_grant(&carol, &grant.name().to_string())
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::FailedPrecondition);
}

#[tokio::test]
async fn test_oversized_ttl_rejected_before_any_write() {
    let f = fixture().await;
    let bob = f.ctx(BOB).await;
    let err = f
        .state
        .access_grants()
        .create_access_grant(
            &bob,
            PROJECT,
            &CreateAccessGrantRequest {
                targets: vec![D1.into()],
                query: true,
                reason: "forever".into(),
                ttl_secs: Some(i64::MAX / 1000),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::InvalidArgument);
    let grants = f
        .state
        .store
        .find_access_grants(&AccessGrantFind::default())
        .await
        .unwrap();
    assert!(grants.is_empty());

    // The longest accepted lifetime still activates cleanly.
    let grant = request_grant(&f, None, Some(MAX_GRANT_LIFETIME_SECS)).await;
    assert_eq!(grant.status, AccessGrantStatus::Active);
    assert!(grant.expire_time.unwrap() > Utc::now() + Duration::days(3649));
}

#[tokio::test]
async fn test_explicit_expire_time_is_kept() {
    let f = fixture().await;
    f.set_rules(vec![grant_rule()]).await;
    let at = Utc.timestamp_opt(Utc::now().timestamp() + 7_200, 0).unwrap();
    let grant = request_grant(&f, Some(at), None).await;

    let carol = f.ctx(CAROL).await;
    let active = f
        .state
        .access_grants()
        .activate_access_grant(&carol, &grant.name().to_string())
        .await
        .unwrap();
    assert_eq!(active.expire_time, Some(at));

    let bob = f.ctx(BOB).await;
    let err = f
        .state
        .access_grants()
        .revoke_access_grant(&bob, &grant.name().to_string())
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::PermissionDenied);
    let revoked = f
        .state
        .access_grants()
        .revoke_access_grant(&carol, &grant.name().to_string())
        .await
        .unwrap();
    assert_eq!(revoked.status, AccessGrantStatus::Revoked);
}

#[tokio::test]
async fn test_releasers_follow_active_stage() {
    let f = fixture().await;
    f.set_rules(Vec::new()).await;
    let store = &f.state.store;
    store
        .set_rollout_policy(
            &EnvironmentId::parse("test").unwrap(),
            &RolloutPolicy {
                automatic: false,
                roles: vec!["roles/qa".into()],
            },
        )
        .await
        .unwrap();
    store
        .set_rollout_policy(
            &EnvironmentId::parse("prod").unwrap(),
            &RolloutPolicy {
                automatic: false,
                roles: vec!["roles/projectOwner".into()],
            },
        )
        .await
        .unwrap();

    let issue = f.change_issue(&[D1, D2], true).await;
    let issue = f.find_approval(&issue).await;
    assert_eq!(issue.approval_status(), ApprovalStatus::Skipped);
    let issue_name = issue.name().to_string();

    let admin = f.ctx(ADMIN).await;
    let rollouts = f.state.rollouts();
    assert_eq!(
        rollouts.issue_releasers(&admin, &issue_name).await.unwrap(),
        vec!["roles/qa".to_string()]
    );

    let project = issue.project.clone();
    let rollout_name = format!("{}/rollouts/{}", PROJECT, issue.pipeline_uid.unwrap());
    let rollout = rollouts.get_rollout(&admin, &rollout_name).await.unwrap();
    assert_eq!(rollout.stages.len(), 2);
    let stage = &rollout.stages[0];
    let task_name = stage.tasks[0].name(&project);

    let runs = rollouts
        .batch_run_tasks(
            &admin,
            &stage.stage_name(&project, rollout.uid).to_string(),
            &[task_name.to_string()],
        )
        .await
        .unwrap();
    let run_name = runs[0].name(&task_name).to_string();
    for status in [TaskRunStatus::Running, TaskRunStatus::Done] {
        rollouts
            .update_task_run_status(
                &admin,
                &UpdateTaskRunStatusRequest {
                    name: run_name.clone(),
                    status,
                    detail: String::new(),
                    result: None,
                },
            )
            .await
            .unwrap();
    }

    assert_eq!(
        rollouts.issue_releasers(&admin, &issue_name).await.unwrap(),
        vec!["roles/projectOwner".to_string()]
    );
}

#[tokio::test]
async fn test_run_requires_stage_role() {
    let f = fixture().await;
    f.set_rules(Vec::new()).await;
    f.state
        .store
        .set_rollout_policy(
            &EnvironmentId::parse("test").unwrap(),
            &RolloutPolicy {
                automatic: false,
                roles: vec!["roles/qa".into()],
            },
        )
        .await
        .unwrap();

    let issue = f.change_issue(&[D1], true).await;
    let issue = f.find_approval(&issue).await;
    let alice = f.ctx(ALICE).await;
    let rollouts = f.state.rollouts();
    let rollout_name = format!("{}/rollouts/{}", PROJECT, issue.pipeline_uid.unwrap());
    let rollout = rollouts.get_rollout(&alice, &rollout_name).await.unwrap();
    let stage = &rollout.stages[0];
    let task = stage.tasks[0].name(&issue.project).to_string();

    let err = rollouts
        .batch_run_tasks(
            &alice,
            &stage.stage_name(&issue.project, rollout.uid).to_string(),
            &[task],
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::PermissionDenied);
}

// ============================================================================
// Structural validation
// ============================================================================

const SHEET: &str =
    "projects/p1/sheets/0000000000000000000000000000000000000000000000000000000000000000";

fn target() -> impl Strategy<Value = String> {
    prop_oneof![
        (1..4u8).prop_map(|i| format!("instances/i{}/databases/d{}", i, i)),
        (1..3u8).prop_map(|g| format!("projects/p1/databaseGroups/g{}", g)),
    ]
}

fn spec() -> impl Strategy<Value = Spec> {
    (
        prop_oneof![Just(String::new()), "[a-c]"],
        prop::collection::vec(target(), 1..4),
        any::<bool>(),
        prop::option::of(1..3i64),
    )
        .prop_map(|(id, targets, sheet, release)| Spec {
            id,
            config: SpecConfig::ChangeDatabase(ChangeDatabaseConfig {
                targets,
                sheet: sheet.then(|| SHEET.to_string()),
                release: release.map(|r| format!("projects/p1/releases/{}", r)),
                ..Default::default()
            }),
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn test_accepted_plans_are_well_formed(specs in prop::collection::vec(spec(), 1..4)) {
        if let Ok(shape) = check_structure(&specs) {
            let mut ids: Vec<_> = specs.iter().map(|s| s.id.as_str()).collect();
            prop_assert!(ids.iter().all(|id| !id.is_empty()));
            ids.sort_unstable();
            ids.dedup();
            prop_assert_eq!(ids.len(), specs.len());

            let targets: Vec<&String> = specs.iter().flat_map(|s| s.config.targets()).collect();
            let groups = targets.iter().filter(|t| t.contains("/databaseGroups/")).count();
            prop_assert!(groups == 0 || groups == targets.len());
            prop_assert!(shape.group.is_none() || shape.databases.is_empty());

            let mut release_specs = 0;
            for s in &specs {
                let SpecConfig::ChangeDatabase(c) = &s.config else { unreachable!() };
                prop_assert!(c.sheet.is_some() != c.release.is_some());
                release_specs += usize::from(c.release.is_some());
            }
            prop_assert!(release_specs <= 1);
            prop_assert!(release_specs == 0 || specs.len() == 1);
        }
    }

    #[test]
    fn test_each_broken_rule_is_rejected(
        size in 1..4usize,
        rule in 0..BROKEN_RULES,
    ) {
        let valid = valid_plan(size);
        prop_assert!(check_structure(&valid).is_ok());
        let broken = break_rule(valid, rule);
        let err = check_structure(&broken).unwrap_err();
        prop_assert_eq!(err.code, Code::InvalidArgument);
    }
}

fn sheet_spec(id: &str, targets: &[&str]) -> Spec {
    Spec {
        id: id.into(),
        config: SpecConfig::ChangeDatabase(ChangeDatabaseConfig {
            targets: targets.iter().map(|t| t.to_string()).collect(),
            sheet: Some(SHEET.into()),
            ..Default::default()
        }),
    }
}

fn release_spec(id: &str, target: &str, release: i64) -> Spec {
    Spec {
        id: id.into(),
        config: SpecConfig::ChangeDatabase(ChangeDatabaseConfig {
            targets: vec![target.into()],
            release: Some(format!("projects/p1/releases/{}", release)),
            ..Default::default()
        }),
    }
}

fn create_spec(id: &str, instance: &str) -> Spec {
    Spec {
        id: id.into(),
        config: SpecConfig::CreateDatabase(CreateDatabaseConfig {
            target: format!("instances/{}", instance),
            database: "newdb".into(),
            ..Default::default()
        }),
    }
}

/// Sheet-based change specs `s0..`, one database each.
fn valid_plan(size: usize) -> Vec<Spec> {
    (0..size)
        .map(|i| {
            let db = format!("instances/i{}/databases/d{}", i, i);
            sheet_spec(&format!("s{}", i), &[db.as_str()])
        })
        .collect()
}

const BROKEN_RULES: usize = 14;

/// Returns `valid` with exactly one structural rule broken.
fn break_rule(mut valid: Vec<Spec>, rule: usize) -> Vec<Spec> {
    const DB: &str = "instances/i9/databases/d9";
    match rule {
        0 => valid.clear(),
        1 => valid[0].id.clear(),
        2 => {
            let dup = valid[0].clone();
            valid.push(dup);
        }
        3 => valid.push(Spec {
            id: "export".into(),
            config: SpecConfig::ExportData(ExportDataConfig {
                targets: vec![DB.into()],
                sheet: SHEET.into(),
                ..Default::default()
            }),
        }),
        4 => valid.push(sheet_spec("mixed", &[DB, "projects/p1/databaseGroups/g1"])),
        5 => valid.push(sheet_spec("group", &["projects/p1/databaseGroups/g1"])),
        6 => {
            valid = vec![
                sheet_spec("g1", &["projects/p1/databaseGroups/g1"]),
                sheet_spec("g2", &["projects/p1/databaseGroups/g2"]),
            ]
        }
        7 => valid.push(release_spec("release", DB, 1)),
        8 => {
            valid = vec![
                release_spec("r1", "instances/i1/databases/d1", 1),
                release_spec("r2", "instances/i2/databases/d2", 1),
            ]
        }
        9 => {
            valid = vec![
                release_spec("r1", "instances/i1/databases/d1", 1),
                release_spec("r2", "instances/i2/databases/d2", 2),
            ]
        }
        10 => {
            if let SpecConfig::ChangeDatabase(c) = &mut valid[0].config {
                c.release = Some("projects/p1/releases/1".into());
            }
        }
        11 => {
            if let SpecConfig::ChangeDatabase(c) = &mut valid[0].config {
                c.targets.clear();
            }
        }
        12 => {
            if let SpecConfig::ChangeDatabase(c) = &mut valid[0].config {
                c.sheet = None;
            }
        }
        _ => valid = vec![create_spec("c1", "i1"), create_spec("c2", "i2")],
    }
    valid
}

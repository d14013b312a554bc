//! Plans and plan-check runs.

use crate::codec::{from_json, from_millis, next_version, parse_col, tag_col, to_json, to_millis};
use crate::error::{DbError, Result};
use crate::Store;
use changeflow_ids::ProjectId;
use changeflow_protocol::{
    Deployment, Plan, PlanCheckRun, PlanCheckRunConfig, PlanCheckRunResult, PlanCheckRunStatus,
    PlanState, Spec,
};
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use tracing::info;

#[derive(Debug, Clone)]
pub struct NewPlan {
    pub project: ProjectId,
    pub creator: String,
    pub title: String,
    pub description: String,
    pub specs: Vec<Spec>,
    pub deployment: Option<Deployment>,
}

/// Plan finder. Unset fields do not constrain the result.
#[derive(Debug, Clone, Default)]
pub struct PlanFind {
    pub uid: Option<i64>,
    /// `None` is unrestricted; `Some(empty)` matches nothing.
    pub project_ids: Option<Vec<ProjectId>>,
    pub creator: Option<String>,
    pub has_rollout: Option<bool>,
    pub state: Option<PlanState>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(sqlx::FromRow)]
struct PlanRow {
    uid: i64,
    project: String,
    creator: String,
    title: String,
    description: String,
    state: i64,
    specs: String,
    deployment: Option<String>,
    pipeline_uid: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl PlanRow {
    fn into_plan(self) -> Result<Plan> {
        Ok(Plan {
            uid: self.uid,
            project: parse_col("plans.project", &self.project)?,
            creator: self.creator,
            title: self.title,
            description: self.description,
            state: tag_col("plans.state", self.state, PlanState::from_tag)?,
            specs: from_json(&self.specs)?,
            deployment: self.deployment.as_deref().map(from_json).transpose()?,
            pipeline_uid: self.pipeline_uid,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct PlanCheckRunRow {
    uid: i64,
    project: String,
    plan_uid: i64,
    status: i64,
    config: String,
    result: String,
    created_at: i64,
    updated_at: i64,
}

impl PlanCheckRunRow {
    fn into_run(self) -> Result<PlanCheckRun> {
        Ok(PlanCheckRun {
            uid: self.uid,
            project: parse_col("plan_check_runs.project", &self.project)?,
            plan_uid: self.plan_uid,
            status: tag_col(
                "plan_check_runs.status",
                self.status,
                PlanCheckRunStatus::from_tag,
            )?,
            config: from_json(&self.config)?,
            result: from_json(&self.result)?,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
        })
    }
}

/// A plan-check run to create in `RUNNING` state.
#[derive(Debug, Clone)]
pub struct NewPlanCheckRun {
    pub project: ProjectId,
    pub plan_uid: i64,
    pub config: PlanCheckRunConfig,
}

pub(crate) async fn fetch_plan(conn: &mut SqliteConnection, uid: i64) -> Result<Option<Plan>> {
    let row: Option<PlanRow> = sqlx::query_as("SELECT * FROM plans WHERE uid = ?")
        .bind(uid)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(PlanRow::into_plan).transpose()
}

/// Conditional on `plan.updated_at`, like issue writes.
pub(crate) async fn write_plan(conn: &mut SqliteConnection, plan: &Plan) -> Result<Plan> {
    let version = next_version(plan.updated_at);
    let deployment = plan.deployment.as_ref().map(to_json).transpose()?;
    let affected = sqlx::query(
        r#"
        UPDATE plans
        SET title = ?, description = ?, state = ?, specs = ?, deployment = ?, pipeline_uid = ?,
            updated_at = ?
        WHERE uid = ? AND updated_at = ?
        "#,
    )
    .bind(&plan.title)
    .bind(&plan.description)
    .bind(plan.state.tag() as i64)
    .bind(to_json(&plan.specs)?)
    .bind(deployment)
    .bind(plan.pipeline_uid)
    .bind(version)
    .bind(plan.uid)
    .bind(to_millis(plan.updated_at))
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if affected == 0 {
        let exists: Option<i64> = sqlx::query_scalar("SELECT uid FROM plans WHERE uid = ?")
            .bind(plan.uid)
            .fetch_optional(&mut *conn)
            .await?;
        return Err(match exists {
            Some(_) => DbError::conflict(format!("plan {} was modified concurrently", plan.uid)),
            None => DbError::not_found(format!("plan {} not found", plan.uid)),
        });
    }
    let mut updated = plan.clone();
    updated.updated_at = from_millis(version);
    Ok(updated)
}

/// Marks every running check of `plan_uid` as canceled.
pub(crate) async fn cancel_running_checks(
    conn: &mut SqliteConnection,
    plan_uid: i64,
) -> Result<u64> {
    let affected = sqlx::query(
        "UPDATE plan_check_runs SET status = ?, updated_at = ? WHERE plan_uid = ? AND status = ?",
    )
    .bind(PlanCheckRunStatus::Canceled.tag() as i64)
    .bind(to_millis(Utc::now()))
    .bind(plan_uid)
    .bind(PlanCheckRunStatus::Running.tag() as i64)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(affected)
}

async fn insert_check_runs(
    conn: &mut SqliteConnection,
    runs: &[NewPlanCheckRun],
) -> Result<Vec<PlanCheckRun>> {
    let ms = to_millis(Utc::now());
    let mut created = Vec::with_capacity(runs.len());
    for run in runs {
        let result = PlanCheckRunResult::default();
        let uid = sqlx::query(
            r#"
            INSERT INTO plan_check_runs (project, plan_uid, status, config, result, created_at,
                                         updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run.project.as_str())
        .bind(run.plan_uid)
        .bind(PlanCheckRunStatus::Running.tag() as i64)
        .bind(to_json(&run.config)?)
        .bind(to_json(&result)?)
        .bind(ms)
        .bind(ms)
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();
        created.push(PlanCheckRun {
            uid,
            project: run.project.clone(),
            plan_uid: run.plan_uid,
            status: PlanCheckRunStatus::Running,
            config: run.config.clone(),
            result,
            created_at: from_millis(ms),
            updated_at: from_millis(ms),
        });
    }
    Ok(created)
}

impl Store {
    pub async fn create_plan(&self, new: &NewPlan) -> Result<Plan> {
        let ms = to_millis(Utc::now());
        let deployment = new.deployment.as_ref().map(to_json).transpose()?;
        let uid = sqlx::query(
            r#"
            INSERT INTO plans (project, creator, title, description, state, specs, deployment,
                               pipeline_uid, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, NULL, ?, ?)
            "#,
        )
        .bind(new.project.as_str())
        .bind(&new.creator)
        .bind(&new.title)
        .bind(&new.description)
        .bind(PlanState::Active.tag() as i64)
        .bind(to_json(&new.specs)?)
        .bind(deployment)
        .bind(ms)
        .bind(ms)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        info!("Created plan {}: {} ({} specs)", uid, new.title, new.specs.len());
        Ok(Plan {
            uid,
            project: new.project.clone(),
            creator: new.creator.clone(),
            title: new.title.clone(),
            description: new.description.clone(),
            state: PlanState::Active,
            specs: new.specs.clone(),
            deployment: new.deployment.clone(),
            pipeline_uid: None,
            created_at: from_millis(ms),
            updated_at: from_millis(ms),
        })
    }

    pub async fn get_plan(&self, uid: i64) -> Result<Option<Plan>> {
        let mut conn = self.pool.acquire().await?;
        fetch_plan(&mut conn, uid).await
    }

    /// Plans matching `find`, newest first.
    pub async fn find_plans(&self, find: &PlanFind) -> Result<Vec<Plan>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM plans WHERE 1 = 1");
        if let Some(uid) = find.uid {
            qb.push(" AND uid = ").push_bind(uid);
        }
        if let Some(projects) = &find.project_ids {
            if projects.is_empty() {
                qb.push(" AND 0");
            } else {
                qb.push(" AND project IN (");
                let mut sep = qb.separated(", ");
                for p in projects {
                    sep.push_bind(p.to_string());
                }
                sep.push_unseparated(")");
            }
        }
        if let Some(creator) = &find.creator {
            qb.push(" AND creator = ").push_bind(creator.clone());
        }
        if let Some(has_rollout) = find.has_rollout {
            qb.push(if has_rollout {
                " AND pipeline_uid IS NOT NULL"
            } else {
                " AND pipeline_uid IS NULL"
            });
        }
        if let Some(state) = find.state {
            qb.push(" AND state = ").push_bind(state.tag() as i64);
        }
        if let Some(after) = find.created_after {
            qb.push(" AND created_at >= ").push_bind(to_millis(after));
        }
        if let Some(before) = find.created_before {
            qb.push(" AND created_at <= ").push_bind(to_millis(before));
        }
        qb.push(" ORDER BY uid DESC");
        if let Some(limit) = find.limit {
            qb.push(" LIMIT ").push_bind(limit);
            qb.push(" OFFSET ").push_bind(find.offset.unwrap_or(0));
        } else if let Some(offset) = find.offset {
            qb.push(" LIMIT -1 OFFSET ").push_bind(offset);
        }
        let rows: Vec<PlanRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(PlanRow::into_plan).collect()
    }

    /// Conditional write; see [`DbError::Conflict`].
    pub async fn update_plan(&self, plan: &Plan) -> Result<Plan> {
        let mut conn = self.pool.acquire().await?;
        write_plan(&mut conn, plan).await
    }

    /// Writes new specs, cancels the running checks and schedules `runs`
    /// in one transaction.
    pub async fn replace_plan_specs(
        &self,
        plan: &Plan,
        runs: &[NewPlanCheckRun],
    ) -> Result<(Plan, Vec<PlanCheckRun>)> {
        let mut tx = self.pool.begin().await?;
        let current = fetch_plan(&mut tx, plan.uid)
            .await?
            .ok_or_else(|| DbError::not_found(format!("plan {} not found", plan.uid)))?;
        if let Some(reason) = current.specs_frozen_reason() {
            return Err(DbError::invalid_state(reason));
        }
        let written = write_plan(&mut tx, plan).await?;
        let canceled = cancel_running_checks(&mut tx, plan.uid).await?;
        let created = insert_check_runs(&mut tx, runs).await?;
        tx.commit().await?;
        info!(
            "Replaced specs of plan {}: canceled {} checks, scheduled {}",
            plan.uid,
            canceled,
            created.len()
        );
        Ok((written, created))
    }

    // ========================================================================
    // Plan-check runs
    // ========================================================================

    pub async fn create_plan_check_runs(
        &self,
        runs: &[NewPlanCheckRun],
    ) -> Result<Vec<PlanCheckRun>> {
        let mut tx = self.pool.begin().await?;
        let created = insert_check_runs(&mut tx, runs).await?;
        tx.commit().await?;
        Ok(created)
    }

    pub async fn get_plan_check_run(&self, uid: i64) -> Result<Option<PlanCheckRun>> {
        let row: Option<PlanCheckRunRow> =
            sqlx::query_as("SELECT * FROM plan_check_runs WHERE uid = ?")
                .bind(uid)
                .fetch_optional(&self.pool)
                .await?;
        row.map(PlanCheckRunRow::into_run).transpose()
    }

    /// Runs of a plan, newest first.
    pub async fn list_plan_check_runs(&self, plan_uid: i64) -> Result<Vec<PlanCheckRun>> {
        let rows: Vec<PlanCheckRunRow> =
            sqlx::query_as("SELECT * FROM plan_check_runs WHERE plan_uid = ? ORDER BY uid DESC")
                .bind(plan_uid)
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(PlanCheckRunRow::into_run).collect()
    }

    /// Every run still in `RUNNING`, oldest first.
    pub async fn list_running_plan_check_runs(&self) -> Result<Vec<PlanCheckRun>> {
        let rows: Vec<PlanCheckRunRow> =
            sqlx::query_as("SELECT * FROM plan_check_runs WHERE status = ? ORDER BY uid")
                .bind(PlanCheckRunStatus::Running.tag() as i64)
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(PlanCheckRunRow::into_run).collect()
    }

    /// Moves a run out of `RUNNING`. Returns `false` when the run had
    /// already left `RUNNING`, so a canceled run is never overwritten.
    pub async fn finish_plan_check_run(
        &self,
        uid: i64,
        status: PlanCheckRunStatus,
        result: &PlanCheckRunResult,
    ) -> Result<bool> {
        let affected = sqlx::query(
            r#"
            UPDATE plan_check_runs SET status = ?, result = ?, updated_at = ?
            WHERE uid = ? AND status = ?
            "#,
        )
        .bind(status.tag() as i64)
        .bind(to_json(result)?)
        .bind(to_millis(Utc::now()))
        .bind(uid)
        .bind(PlanCheckRunStatus::Running.tag() as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    pub async fn cancel_plan_check_runs(&self, plan_uid: i64) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        cancel_running_checks(&mut conn, plan_uid).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::open_store;
    use changeflow_protocol::{ChangeDatabaseConfig, PlanCheckTarget, PlanCheckType, SpecConfig};

    fn new_plan(project: &str) -> NewPlan {
        NewPlan {
            project: ProjectId::parse(project).unwrap(),
            creator: "bob@x".into(),
            title: "add column".into(),
            description: String::new(),
            specs: vec![Spec {
                id: "s1".into(),
                config: SpecConfig::ChangeDatabase(ChangeDatabaseConfig {
                    targets: vec!["instances/i1/databases/d1".into()],
                    sheet: Some("projects/p1/sheets/abc".into()),
                    ..Default::default()
                }),
            }],
            deployment: None,
        }
    }

    fn check_run(plan: &Plan) -> NewPlanCheckRun {
        NewPlanCheckRun {
            project: plan.project.clone(),
            plan_uid: plan.uid,
            config: PlanCheckRunConfig {
                targets: vec![PlanCheckTarget {
                    database: "instances/i1/databases/d1".into(),
                    sheet_sha256: "abc".into(),
                    types: vec![PlanCheckType::StatementAdvise],
                    change_type: Default::default(),
                    enable_prior_backup: false,
                    ghost_flags: Default::default(),
                }],
            },
        }
    }

    #[tokio::test]
    async fn test_create_find_and_conditional_update() {
        let (store, _dir) = open_store().await;
        let a = store.create_plan(&new_plan("p1")).await.unwrap();
        let b = store.create_plan(&new_plan("p2")).await.unwrap();

        let all = store.find_plans(&PlanFind::default()).await.unwrap();
        assert_eq!(all.iter().map(|p| p.uid).collect::<Vec<_>>(), vec![b.uid, a.uid]);

        let p1 = store
            .find_plans(&PlanFind {
                project_ids: Some(vec![ProjectId::parse("p1").unwrap()]),
                has_rollout: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(p1.len(), 1);

        let mut renamed = a.clone();
        renamed.title = "renamed".into();
        store.update_plan(&renamed).await.unwrap();
        let err = store.update_plan(&renamed).await.unwrap_err();
        assert!(matches!(err, DbError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_replace_specs_cancels_running_checks() {
        let (store, _dir) = open_store().await;
        let plan = store.create_plan(&new_plan("p1")).await.unwrap();
        let first = store.create_plan_check_runs(&[check_run(&plan)]).await.unwrap();

        let mut edited = plan.clone();
        edited.specs[0].id = "s2".into();
        let (written, created) = store
            .replace_plan_specs(&edited, &[check_run(&plan)])
            .await
            .unwrap();
        assert_eq!(written.specs[0].id, "s2");
        assert_eq!(created.len(), 1);

        let old = store.get_plan_check_run(first[0].uid).await.unwrap().unwrap();
        assert_eq!(old.status, PlanCheckRunStatus::Canceled);
        let running = store.list_running_plan_check_runs().await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].uid, created[0].uid);
    }

    #[tokio::test]
    async fn test_replace_specs_refused_for_release_plan() {
        let (store, _dir) = open_store().await;
        let mut new = new_plan("p1");
        if let SpecConfig::ChangeDatabase(c) = &mut new.specs[0].config {
            c.sheet = None;
            c.release = Some("projects/p1/releases/1".into());
        }
        let plan = store.create_plan(&new).await.unwrap();

        let mut edited = plan.clone();
        edited.specs[0].id = "s2".into();
        let err = store.replace_plan_specs(&edited, &[]).await.unwrap_err();
        assert!(matches!(err, DbError::InvalidState(_)));
        let stored = store.get_plan(plan.uid).await.unwrap().unwrap();
        assert_eq!(stored.specs[0].id, "s1");
    }

    #[tokio::test]
    async fn test_finish_does_not_overwrite_canceled_run() {
        let (store, _dir) = open_store().await;
        let plan = store.create_plan(&new_plan("p1")).await.unwrap();
        let runs = store.create_plan_check_runs(&[check_run(&plan)]).await.unwrap();
        assert_eq!(store.cancel_plan_check_runs(plan.uid).await.unwrap(), 1);

        let finished = store
            .finish_plan_check_run(
                runs[0].uid,
                PlanCheckRunStatus::Done,
                &PlanCheckRunResult::default(),
            )
            .await
            .unwrap();
        assert!(!finished);
        let run = store.get_plan_check_run(runs[0].uid).await.unwrap().unwrap();
        assert_eq!(run.status, PlanCheckRunStatus::Canceled);
    }
}

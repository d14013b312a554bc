//! Issues: creation, the issue finder and conditional updates.
//!
//! Every write after creation is conditional on `(uid, updated_at)`. A
//! writer that lost the race gets [`DbError::Conflict`] and must reload.

use crate::codec::{from_json, from_millis, next_version, parse_col, tag_col, to_json, to_millis};
use crate::error::{DbError, Result};
use crate::Store;
use changeflow_ids::{DatabaseName, InstanceId, ProjectId};
use changeflow_protocol::{
    AccessGrantStatus, Issue, IssuePayload, IssueStatus, IssueType, MigrateType, TaskRunStatus,
    TaskType,
};
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use tracing::info;

/// Fields of an issue supplied at creation.
#[derive(Debug, Clone)]
pub struct NewIssue {
    pub project: ProjectId,
    pub creator: String,
    pub title: String,
    pub description: String,
    pub issue_type: IssueType,
    pub plan_uid: Option<i64>,
    pub pipeline_uid: Option<i64>,
    pub payload: IssuePayload,
    pub subscribers: Vec<String>,
}

/// Concrete task shape used by the `task_type` filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskKind {
    pub task_type: TaskType,
    /// `None` matches any migrate type.
    pub migrate_type: Option<MigrateType>,
}

/// Issue finder. Unset fields do not constrain the result.
#[derive(Debug, Clone, Default)]
pub struct IssueFind {
    pub uid: Option<i64>,
    /// `None` is unrestricted; `Some(empty)` matches nothing.
    pub project_ids: Option<Vec<ProjectId>>,
    pub plan_uid: Option<i64>,
    pub pipeline_uid: Option<i64>,
    pub creator: Option<String>,
    pub subscriber: Option<String>,
    pub statuses: Vec<IssueStatus>,
    pub types: Vec<IssueType>,
    pub task_kinds: Vec<TaskKind>,
    pub instance: Option<InstanceId>,
    pub database: Option<DatabaseName>,
    pub has_pipeline: Option<bool>,
    /// Matches issues carrying any of these labels.
    pub labels: Vec<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    /// Substring of the title or description.
    pub query: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(sqlx::FromRow)]
struct IssueRow {
    uid: i64,
    project: String,
    creator: String,
    title: String,
    description: String,
    issue_type: i64,
    status: i64,
    plan_uid: Option<i64>,
    pipeline_uid: Option<i64>,
    payload: String,
    subscribers: String,
    created_at: i64,
    updated_at: i64,
}

impl IssueRow {
    fn into_issue(self) -> Result<Issue> {
        Ok(Issue {
            uid: self.uid,
            project: parse_col("issues.project", &self.project)?,
            creator: self.creator,
            title: self.title,
            description: self.description,
            issue_type: tag_col("issues.issue_type", self.issue_type, IssueType::from_tag)?,
            status: tag_col("issues.status", self.status, IssueStatus::from_tag)?,
            plan_uid: self.plan_uid,
            pipeline_uid: self.pipeline_uid,
            payload: from_json(&self.payload)?,
            subscribers: from_json(&self.subscribers)?,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
        })
    }
}

fn push_issue_filters(qb: &mut QueryBuilder<'_, Sqlite>, find: &IssueFind) {
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
    if let Some(plan) = find.plan_uid {
        qb.push(" AND plan_uid = ").push_bind(plan);
    }
    if let Some(pipeline) = find.pipeline_uid {
        qb.push(" AND pipeline_uid = ").push_bind(pipeline);
    }
    if let Some(creator) = &find.creator {
        qb.push(" AND creator = ").push_bind(creator.clone());
    }
    if let Some(subscriber) = &find.subscriber {
        qb.push(" AND EXISTS (SELECT 1 FROM json_each(issues.subscribers) WHERE value = ")
            .push_bind(subscriber.clone())
            .push(")");
    }
    if !find.statuses.is_empty() {
        qb.push(" AND status IN (");
        let mut sep = qb.separated(", ");
        for s in &find.statuses {
            sep.push_bind(s.tag() as i64);
        }
        sep.push_unseparated(")");
    }
    if !find.types.is_empty() {
        qb.push(" AND issue_type IN (");
        let mut sep = qb.separated(", ");
        for t in &find.types {
            sep.push_bind(t.tag() as i64);
        }
        sep.push_unseparated(")");
    }
    if let Some(has_pipeline) = find.has_pipeline {
        qb.push(if has_pipeline {
            " AND pipeline_uid IS NOT NULL"
        } else {
            " AND pipeline_uid IS NULL"
        });
    }
    if !find.labels.is_empty() {
        qb.push(" AND EXISTS (SELECT 1 FROM json_each(issues.payload, '$.labels') WHERE value IN (");
        let mut sep = qb.separated(", ");
        for label in &find.labels {
            sep.push_bind(label.clone());
        }
        sep.push_unseparated("))");
    }
    if let Some(after) = find.created_after {
        qb.push(" AND created_at >= ").push_bind(to_millis(after));
    }
    if let Some(before) = find.created_before {
        qb.push(" AND created_at <= ").push_bind(to_millis(before));
    }
    if let Some(query) = find.query.as_deref().filter(|q| !q.is_empty()) {
        let pattern = format!("%{}%", query);
        qb.push(" AND (title LIKE ")
            .push_bind(pattern.clone())
            .push(" OR description LIKE ")
            .push_bind(pattern)
            .push(")");
    }
    if !find.task_kinds.is_empty() {
        qb.push(" AND EXISTS (SELECT 1 FROM tasks t WHERE t.pipeline_uid = issues.pipeline_uid AND (");
        let mut sep = qb.separated(" OR ");
        for kind in &find.task_kinds {
            sep.push("(t.task_type = ");
            sep.push_bind_unseparated(kind.task_type.tag() as i64);
            if let Some(migrate) = kind.migrate_type {
                sep.push_unseparated(" AND t.migrate_type = ");
                sep.push_bind_unseparated(migrate.tag() as i64);
            }
            sep.push_unseparated(")");
        }
        sep.push_unseparated("))");
    }
    if let Some(instance) = &find.instance {
        qb.push(" AND EXISTS (SELECT 1 FROM tasks t WHERE t.pipeline_uid = issues.pipeline_uid AND t.instance = ")
            .push_bind(instance.to_string())
            .push(")");
    }
    if let Some(db) = &find.database {
        qb.push(" AND EXISTS (SELECT 1 FROM tasks t WHERE t.pipeline_uid = issues.pipeline_uid AND t.instance = ")
            .push_bind(db.instance.to_string())
            .push(" AND t.database_name = ")
            .push_bind(db.database.clone())
            .push(")");
    }
}

pub(crate) async fn insert_issue(conn: &mut SqliteConnection, new: &NewIssue) -> Result<Issue> {
    let now = Utc::now();
    let ms = to_millis(now);
    let uid = sqlx::query(
        r#"
        INSERT INTO issues (project, creator, title, description, issue_type, status, plan_uid,
                            pipeline_uid, payload, subscribers, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(new.project.as_str())
    .bind(&new.creator)
    .bind(&new.title)
    .bind(&new.description)
    .bind(new.issue_type.tag() as i64)
    .bind(IssueStatus::Open.tag() as i64)
    .bind(new.plan_uid)
    .bind(new.pipeline_uid)
    .bind(to_json(&new.payload)?)
    .bind(to_json(&new.subscribers)?)
    .bind(ms)
    .bind(ms)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    Ok(Issue {
        uid,
        project: new.project.clone(),
        creator: new.creator.clone(),
        title: new.title.clone(),
        description: new.description.clone(),
        issue_type: new.issue_type,
        status: IssueStatus::Open,
        plan_uid: new.plan_uid,
        pipeline_uid: new.pipeline_uid,
        payload: new.payload.clone(),
        subscribers: new.subscribers.clone(),
        created_at: from_millis(ms),
        updated_at: from_millis(ms),
    })
}

pub(crate) async fn fetch_issue(conn: &mut SqliteConnection, uid: i64) -> Result<Option<Issue>> {
    let row: Option<IssueRow> = sqlx::query_as("SELECT * FROM issues WHERE uid = ?")
        .bind(uid)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(IssueRow::into_issue).transpose()
}

/// Writes every mutable column of `issue` if the row still carries
/// `issue.updated_at`. Returns the issue with its new version.
pub(crate) async fn write_issue(conn: &mut SqliteConnection, issue: &Issue) -> Result<Issue> {
    let version = next_version(issue.updated_at);
    let affected = sqlx::query(
        r#"
        UPDATE issues
        SET title = ?, description = ?, status = ?, plan_uid = ?, pipeline_uid = ?,
            payload = ?, subscribers = ?, updated_at = ?
        WHERE uid = ? AND updated_at = ?
        "#,
    )
    .bind(&issue.title)
    .bind(&issue.description)
    .bind(issue.status.tag() as i64)
    .bind(issue.plan_uid)
    .bind(issue.pipeline_uid)
    .bind(to_json(&issue.payload)?)
    .bind(to_json(&issue.subscribers)?)
    .bind(version)
    .bind(issue.uid)
    .bind(to_millis(issue.updated_at))
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if affected == 0 {
        let exists: Option<i64> = sqlx::query_scalar("SELECT uid FROM issues WHERE uid = ?")
            .bind(issue.uid)
            .fetch_optional(&mut *conn)
            .await?;
        return Err(match exists {
            Some(_) => DbError::conflict(format!("issue {} was modified concurrently", issue.uid)),
            None => DbError::not_found(format!("issue {} not found", issue.uid)),
        });
    }

    let mut updated = issue.clone();
    updated.updated_at = from_millis(version);
    Ok(updated)
}

pub(crate) async fn count_active_task_runs(
    conn: &mut SqliteConnection,
    pipeline_uid: i64,
) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM task_runs r
        JOIN tasks t ON t.uid = r.task_uid
        WHERE t.pipeline_uid = ? AND r.status IN (?, ?)
        "#,
    )
    .bind(pipeline_uid)
    .bind(TaskRunStatus::Pending.tag() as i64)
    .bind(TaskRunStatus::Running.tag() as i64)
    .fetch_one(&mut *conn)
    .await?;
    Ok(count)
}

impl Store {
    pub async fn create_issue(&self, new: &NewIssue) -> Result<Issue> {
        let mut conn = self.pool.acquire().await?;
        let issue = insert_issue(&mut conn, new).await?;
        info!("Created issue {}: {} ({})", issue.uid, issue.title, issue.issue_type);
        Ok(issue)
    }

    pub async fn get_issue(&self, uid: i64) -> Result<Option<Issue>> {
        let mut conn = self.pool.acquire().await?;
        fetch_issue(&mut conn, uid).await
    }

    /// The issue attached to a plan, if any.
    pub async fn get_issue_by_plan(&self, plan_uid: i64) -> Result<Option<Issue>> {
        let row: Option<IssueRow> =
            sqlx::query_as("SELECT * FROM issues WHERE plan_uid = ? ORDER BY uid LIMIT 1")
                .bind(plan_uid)
                .fetch_optional(&self.pool)
                .await?;
        row.map(IssueRow::into_issue).transpose()
    }

    /// The issue attached to a pipeline, if any.
    pub async fn get_issue_by_pipeline(&self, pipeline_uid: i64) -> Result<Option<Issue>> {
        let row: Option<IssueRow> =
            sqlx::query_as("SELECT * FROM issues WHERE pipeline_uid = ? ORDER BY uid LIMIT 1")
                .bind(pipeline_uid)
                .fetch_optional(&self.pool)
                .await?;
        row.map(IssueRow::into_issue).transpose()
    }

    /// Issues matching `find`, newest `updated_at` first.
    pub async fn find_issues(&self, find: &IssueFind) -> Result<Vec<Issue>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM issues WHERE 1 = 1");
        push_issue_filters(&mut qb, find);
        qb.push(" ORDER BY updated_at DESC, uid DESC");
        match (find.limit, find.offset) {
            (Some(limit), offset) => {
                qb.push(" LIMIT ").push_bind(limit);
                qb.push(" OFFSET ").push_bind(offset.unwrap_or(0));
            }
            (None, Some(offset)) => {
                qb.push(" LIMIT -1 OFFSET ").push_bind(offset);
            }
            (None, None) => {}
        }
        let rows: Vec<IssueRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(IssueRow::into_issue).collect()
    }

    /// Conditional write; see [`DbError::Conflict`].
    pub async fn update_issue(&self, issue: &Issue) -> Result<Issue> {
        let mut conn = self.pool.acquire().await?;
        write_issue(&mut conn, issue).await
    }

    /// Open issues whose approval finding has not completed.
    pub async fn list_issues_pending_finding(&self) -> Result<Vec<i64>> {
        let uids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT uid FROM issues
            WHERE status = ?
              AND COALESCE(json_extract(payload, '$.approval.finding_done'), 0) = 0
            ORDER BY uid
            "#,
        )
        .bind(IssueStatus::Open.tag() as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(uids)
    }

    /// Moves every issue to `status` in one transaction.
    ///
    /// Fails with `InvalidState` if any issue is already terminal or has a
    /// pending or running task run. Canceling an access-grant issue revokes
    /// its still-pending grant.
    pub async fn batch_set_issue_status(
        &self,
        issues: &[Issue],
        status: IssueStatus,
    ) -> Result<Vec<Issue>> {
        let mut tx = self.pool.begin().await?;
        let mut updated = Vec::with_capacity(issues.len());
        for issue in issues {
            if issue.status.is_terminal() && issue.status != status {
                return Err(DbError::invalid_state(format!(
                    "issue {} is {} and cannot change status",
                    issue.uid, issue.status
                )));
            }
            if let Some(pipeline) = issue.pipeline_uid {
                if count_active_task_runs(&mut tx, pipeline).await? > 0 {
                    return Err(DbError::invalid_state(format!(
                        "issue {} has running or pending task runs",
                        issue.uid
                    )));
                }
            }
            let mut next = issue.clone();
            next.status = status;
            let written = write_issue(&mut tx, &next).await?;

            if status == IssueStatus::Canceled && issue.issue_type == IssueType::AccessGrant {
                if let Some(grant_uid) = issue.payload.access_grant_uid {
                    sqlx::query(
                        "UPDATE access_grants SET status = ?, updated_at = ? WHERE uid = ? AND status = ?",
                    )
                    .bind(AccessGrantStatus::Revoked.tag() as i64)
                    .bind(to_millis(Utc::now()))
                    .bind(grant_uid)
                    .bind(AccessGrantStatus::Pending.tag() as i64)
                    .execute(&mut *tx)
                    .await?;
                }
            }
            updated.push(written);
        }
        tx.commit().await?;
        info!("Updated {} issues to {}", updated.len(), status);
        Ok(updated)
    }
}

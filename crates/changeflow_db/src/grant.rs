//! Access grants and the grant completion composites.

use crate::codec::{from_json, from_millis, opt_from_millis, parse_col, tag_col, to_json, to_millis};
use crate::error::{DbError, Result};
use crate::issue::{fetch_issue, insert_issue, write_issue, NewIssue};
use crate::Store;
use changeflow_ids::ProjectId;
use changeflow_protocol::{
    AccessGrant, AccessGrantPayload, AccessGrantStatus, Condition, IamPolicy, Issue, IssueStatus,
    Member,
};
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use tracing::info;

#[derive(Debug, Clone)]
pub struct NewAccessGrant {
    pub project: ProjectId,
    pub creator: String,
    pub expire_time: Option<DateTime<Utc>>,
    pub ttl_secs: Option<i64>,
    pub payload: AccessGrantPayload,
}

#[derive(Debug, Clone, Default)]
pub struct AccessGrantFind {
    pub uid: Option<i64>,
    /// `None` is unrestricted; `Some(empty)` matches nothing.
    pub project_ids: Option<Vec<ProjectId>>,
    pub creator: Option<String>,
    pub statuses: Vec<AccessGrantStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(sqlx::FromRow)]
struct AccessGrantRow {
    uid: i64,
    project: String,
    creator: String,
    status: i64,
    expire_time: Option<i64>,
    ttl_secs: Option<i64>,
    payload: String,
    created_at: i64,
    updated_at: i64,
}

impl AccessGrantRow {
    fn into_grant(self) -> Result<AccessGrant> {
        Ok(AccessGrant {
            uid: self.uid,
            project: parse_col("access_grants.project", &self.project)?,
            creator: self.creator,
            status: tag_col("access_grants.status", self.status, AccessGrantStatus::from_tag)?,
            expire_time: opt_from_millis(self.expire_time),
            ttl_secs: self.ttl_secs,
            payload: from_json(&self.payload)?,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
        })
    }
}

async fn fetch_grant(conn: &mut SqliteConnection, uid: i64) -> Result<AccessGrant> {
    let row: Option<AccessGrantRow> = sqlx::query_as("SELECT * FROM access_grants WHERE uid = ?")
        .bind(uid)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(AccessGrantRow::into_grant)
        .transpose()?
        .ok_or_else(|| DbError::not_found(format!("access grant {} not found", uid)))
}

/// PENDING -> ACTIVE, resolving a TTL into an absolute expiry.
async fn activate(conn: &mut SqliteConnection, uid: i64) -> Result<AccessGrant> {
    let mut grant = fetch_grant(conn, uid).await?;
    if grant.status != AccessGrantStatus::Pending {
        return Err(DbError::invalid_state(format!(
            "access grant {} is {}, expected {}",
            uid,
            grant.status,
            AccessGrantStatus::Pending
        )));
    }
    let now = Utc::now();
    grant.expire_time = grant.expire_time_at_activation(now);
    grant.status = AccessGrantStatus::Active;
    grant.updated_at = now;
    sqlx::query(
        "UPDATE access_grants SET status = ?, expire_time = ?, updated_at = ? WHERE uid = ? AND status = ?",
    )
    .bind(AccessGrantStatus::Active.tag() as i64)
    .bind(grant.expire_time.map(to_millis))
    .bind(to_millis(now))
    .bind(uid)
    .bind(AccessGrantStatus::Pending.tag() as i64)
    .execute(&mut *conn)
    .await?;
    Ok(grant)
}

async fn finish_issue(conn: &mut SqliteConnection, issue: &Issue) -> Result<Issue> {
    let current = fetch_issue(conn, issue.uid)
        .await?
        .ok_or_else(|| DbError::not_found(format!("issue {} not found", issue.uid)))?;
    if current.status != IssueStatus::Open {
        return Err(DbError::invalid_state(format!(
            "issue {} is {}",
            issue.uid, current.status
        )));
    }
    let mut done = issue.clone();
    done.status = IssueStatus::Done;
    write_issue(conn, &done).await
}

impl Store {
    /// Writes a `PENDING` grant and its companion issue, back-linking
    /// each to the other, in one transaction.
    pub async fn create_access_grant_with_issue(
        &self,
        new: &NewAccessGrant,
        issue: &NewIssue,
    ) -> Result<(AccessGrant, Issue)> {
        let mut tx = self.pool.begin().await?;
        let ms = to_millis(Utc::now());
        let uid = sqlx::query(
            r#"
            INSERT INTO access_grants (project, creator, status, expire_time, ttl_secs, payload,
                                       created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(new.project.as_str())
        .bind(&new.creator)
        .bind(AccessGrantStatus::Pending.tag() as i64)
        .bind(new.expire_time.map(to_millis))
        .bind(new.ttl_secs)
        .bind(to_json(&new.payload)?)
        .bind(ms)
        .bind(ms)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        let mut companion = issue.clone();
        companion.payload.access_grant_uid = Some(uid);
        let created_issue = insert_issue(&mut tx, &companion).await?;

        let mut payload = new.payload.clone();
        payload.issue_uid = Some(created_issue.uid);
        sqlx::query("UPDATE access_grants SET payload = ? WHERE uid = ?")
            .bind(to_json(&payload)?)
            .bind(uid)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(
            "Created access grant {} with issue {}",
            uid, created_issue.uid
        );
        let grant = AccessGrant {
            uid,
            project: new.project.clone(),
            creator: new.creator.clone(),
            status: AccessGrantStatus::Pending,
            expire_time: new.expire_time,
            ttl_secs: new.ttl_secs,
            payload,
            created_at: from_millis(ms),
            updated_at: from_millis(ms),
        };
        Ok((grant, created_issue))
    }

    pub async fn get_access_grant(&self, uid: i64) -> Result<Option<AccessGrant>> {
        let mut conn = self.pool.acquire().await?;
        match fetch_grant(&mut conn, uid).await {
            Ok(grant) => Ok(Some(grant)),
            Err(DbError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Grants matching `find`, newest first.
    pub async fn find_access_grants(&self, find: &AccessGrantFind) -> Result<Vec<AccessGrant>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM access_grants WHERE 1 = 1");
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
        if !find.statuses.is_empty() {
            qb.push(" AND status IN (");
            let mut sep = qb.separated(", ");
            for s in &find.statuses {
                sep.push_bind(s.tag() as i64);
            }
            sep.push_unseparated(")");
        }
        qb.push(" ORDER BY uid DESC");
        if let Some(limit) = find.limit {
            qb.push(" LIMIT ").push_bind(limit);
            qb.push(" OFFSET ").push_bind(find.offset.unwrap_or(0));
        } else if let Some(offset) = find.offset {
            qb.push(" LIMIT -1 OFFSET ").push_bind(offset);
        }
        let rows: Vec<AccessGrantRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(AccessGrantRow::into_grant).collect()
    }

    pub async fn activate_access_grant(&self, uid: i64) -> Result<AccessGrant> {
        let mut tx = self.pool.begin().await?;
        let grant = activate(&mut tx, uid).await?;
        tx.commit().await?;
        info!(grant = uid, "Access grant activated");
        Ok(grant)
    }

    /// ACTIVE -> REVOKED.
    pub async fn revoke_access_grant(&self, uid: i64) -> Result<AccessGrant> {
        let mut tx = self.pool.begin().await?;
        let mut grant = fetch_grant(&mut tx, uid).await?;
        if grant.status != AccessGrantStatus::Active {
            return Err(DbError::invalid_state(format!(
                "access grant {} is {}, expected {}",
                uid,
                grant.status,
                AccessGrantStatus::Active
            )));
        }
        let now = Utc::now();
        sqlx::query("UPDATE access_grants SET status = ?, updated_at = ? WHERE uid = ?")
            .bind(AccessGrantStatus::Revoked.tag() as i64)
            .bind(to_millis(now))
            .bind(uid)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        grant.status = AccessGrantStatus::Revoked;
        grant.updated_at = now;
        info!(grant = uid, "Access grant revoked");
        Ok(grant)
    }

    /// Activates the grant of an approved ACCESS_GRANT issue and marks the
    /// issue done. Both writes commit together or not at all.
    pub async fn complete_access_grant(&self, issue: &Issue) -> Result<(AccessGrant, Issue)> {
        let grant_uid = issue.payload.access_grant_uid.ok_or_else(|| {
            DbError::invalid_state(format!("issue {} has no access grant", issue.uid))
        })?;
        let mut tx = self.pool.begin().await?;
        let grant = activate(&mut tx, grant_uid).await?;
        let done = finish_issue(&mut tx, issue).await?;
        tx.commit().await?;
        info!(grant = grant_uid, issue = issue.uid, "Access grant completed");
        Ok((grant, done))
    }

    /// Adds the requested binding to the project policy and marks the
    /// GRANT_REQUEST issue done in one transaction.
    pub async fn complete_grant_request(
        &self,
        issue: &Issue,
        role: &str,
        member: &Member,
        condition: Option<Condition>,
    ) -> Result<Issue> {
        let mut tx = self.pool.begin().await?;
        let raw: Option<String> = sqlx::query_scalar("SELECT policy FROM projects WHERE id = ?")
            .bind(issue.project.as_str())
            .fetch_optional(&mut *tx)
            .await?;
        let raw = raw.ok_or_else(|| {
            DbError::not_found(format!("project {} not found", issue.project))
        })?;
        let mut policy: IamPolicy = from_json(&raw)?;
        policy.add_member(role, member, condition);
        sqlx::query("UPDATE projects SET policy = ? WHERE id = ?")
            .bind(to_json(&policy)?)
            .bind(issue.project.as_str())
            .execute(&mut *tx)
            .await?;
        let done = finish_issue(&mut tx, issue).await?;
        tx.commit().await?;
        info!(issue = issue.uid, "Granted {} to {} in {}", role, member, issue.project);
        Ok(done)
    }
}

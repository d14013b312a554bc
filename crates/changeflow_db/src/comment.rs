//! Append-only issue comments.

use crate::codec::{from_json, from_millis, next_version, parse_col, to_json, to_millis};
use crate::error::{DbError, Result};
use crate::Store;
use changeflow_ids::ProjectId;
use changeflow_protocol::{CommentEvent, IssueComment};
use chrono::Utc;

#[derive(Debug, Clone)]
pub struct NewIssueComment {
    pub project: ProjectId,
    pub issue_uid: i64,
    pub creator: String,
    pub comment: String,
    pub event: Option<CommentEvent>,
}

#[derive(sqlx::FromRow)]
struct CommentRow {
    uid: i64,
    project: String,
    issue_uid: i64,
    creator: String,
    comment: String,
    event: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl CommentRow {
    fn into_comment(self) -> Result<IssueComment> {
        Ok(IssueComment {
            uid: self.uid,
            project: parse_col("issue_comments.project", &self.project)?,
            issue_uid: self.issue_uid,
            creator: self.creator,
            comment: self.comment,
            event: self.event.as_deref().map(from_json).transpose()?,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
        })
    }
}

impl Store {
    pub async fn create_issue_comment(&self, new: &NewIssueComment) -> Result<IssueComment> {
        let ms = to_millis(Utc::now());
        let event = new.event.as_ref().map(to_json).transpose()?;
        let uid = sqlx::query(
            r#"
            INSERT INTO issue_comments (project, issue_uid, creator, comment, event, created_at,
                                        updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(new.project.as_str())
        .bind(new.issue_uid)
        .bind(&new.creator)
        .bind(&new.comment)
        .bind(event)
        .bind(ms)
        .bind(ms)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(IssueComment {
            uid,
            project: new.project.clone(),
            issue_uid: new.issue_uid,
            creator: new.creator.clone(),
            comment: new.comment.clone(),
            event: new.event.clone(),
            created_at: from_millis(ms),
            updated_at: from_millis(ms),
        })
    }

    pub async fn get_issue_comment(&self, uid: i64) -> Result<Option<IssueComment>> {
        let row: Option<CommentRow> = sqlx::query_as("SELECT * FROM issue_comments WHERE uid = ?")
            .bind(uid)
            .fetch_optional(&self.pool)
            .await?;
        row.map(CommentRow::into_comment).transpose()
    }

    /// Comments of an issue in creation order.
    pub async fn list_issue_comments(
        &self,
        issue_uid: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<IssueComment>> {
        let rows: Vec<CommentRow> = sqlx::query_as(
            "SELECT * FROM issue_comments WHERE issue_uid = ? ORDER BY uid LIMIT ? OFFSET ?",
        )
        .bind(issue_uid)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(CommentRow::into_comment).collect()
    }

    /// Replaces the comment text. Events are immutable.
    pub async fn update_issue_comment_text(
        &self,
        comment: &IssueComment,
        text: &str,
    ) -> Result<IssueComment> {
        let version = next_version(comment.updated_at);
        let affected = sqlx::query("UPDATE issue_comments SET comment = ?, updated_at = ? WHERE uid = ?")
            .bind(text)
            .bind(version)
            .bind(comment.uid)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(DbError::not_found(format!("issue comment {} not found", comment.uid)));
        }
        let mut updated = comment.clone();
        updated.comment = text.to_string();
        updated.updated_at = from_millis(version);
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::open_store;
    use changeflow_protocol::{ApproverStatus, IssueStatus, IssueUpdateEvent};

    fn comment(issue: i64, text: &str, event: Option<CommentEvent>) -> NewIssueComment {
        NewIssueComment {
            project: ProjectId::parse("p1").unwrap(),
            issue_uid: issue,
            creator: "alice@x".into(),
            comment: text.into(),
            event,
        }
    }

    #[tokio::test]
    async fn test_comments_listed_in_creation_order_with_events() {
        let (store, _dir) = open_store().await;
        store
            .create_issue_comment(&comment(
                1,
                "lgtm",
                Some(CommentEvent::Approval {
                    status: ApproverStatus::Approved,
                }),
            ))
            .await
            .unwrap();
        store
            .create_issue_comment(&comment(
                1,
                "",
                Some(CommentEvent::IssueUpdate(IssueUpdateEvent::status(
                    IssueStatus::Open,
                    IssueStatus::Done,
                ))),
            ))
            .await
            .unwrap();
        store.create_issue_comment(&comment(2, "other", None)).await.unwrap();

        let listed = store.list_issue_comments(1, 10, 0).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].comment, "lgtm");
        assert!(matches!(listed[1].event, Some(CommentEvent::IssueUpdate(_))));

        let second_page = store.list_issue_comments(1, 1, 1).await.unwrap();
        assert_eq!(second_page.len(), 1);
        assert_eq!(second_page[0].uid, listed[1].uid);
    }

    #[tokio::test]
    async fn test_update_comment_text() {
        let (store, _dir) = open_store().await;
        let created = store.create_issue_comment(&comment(1, "typo", None)).await.unwrap();
        let updated = store.update_issue_comment_text(&created, "fixed").await.unwrap();
        assert_eq!(updated.comment, "fixed");
        assert_eq!(
            store.get_issue_comment(created.uid).await.unwrap().unwrap().comment,
            "fixed"
        );
    }
}

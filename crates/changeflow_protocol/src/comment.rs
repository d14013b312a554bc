//! Append-only issue comments with typed events.

use crate::enums::{ApproverStatus, IssueStatus, TaskRunStatus};
use changeflow_ids::{IssueCommentName, ProjectId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueComment {
    pub uid: i64,
    pub project: ProjectId,
    pub issue_uid: i64,
    pub creator: String,
    pub comment: String,
    pub event: Option<CommentEvent>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IssueComment {
    pub fn name(&self) -> IssueCommentName {
        IssueCommentName::new(self.project.clone(), self.issue_uid, self.uid)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommentEvent {
    Approval {
        status: ApproverStatus,
    },
    IssueUpdate(IssueUpdateEvent),
    StageEnd {
        stage: String,
    },
    TaskUpdate {
        tasks: Vec<String>,
        from_sheet: Option<String>,
        to_sheet: Option<String>,
        to_status: Option<TaskRunStatus>,
    },
    TaskPriorBackup {
        task: String,
        database: String,
        tables: Vec<String>,
        error: Option<String>,
    },
}

/// Field changes recorded by an issue update. Unset fields did not change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IssueUpdateEvent {
    pub from_title: Option<String>,
    pub to_title: Option<String>,
    pub from_description: Option<String>,
    pub to_description: Option<String>,
    pub from_status: Option<IssueStatus>,
    pub to_status: Option<IssueStatus>,
    pub from_labels: Vec<String>,
    pub to_labels: Vec<String>,
}

impl IssueUpdateEvent {
    pub fn status(from: IssueStatus, to: IssueStatus) -> Self {
        Self {
            from_status: Some(from),
            to_status: Some(to),
            ..Default::default()
        }
    }
}

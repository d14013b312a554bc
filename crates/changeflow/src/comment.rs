//! Issue comment log.
//!
//! Comments written as a side effect of another write never fail that
//! write; a failed append is logged and dropped.

use changeflow_db::{NewIssueComment, Store};
use changeflow_protocol::{CommentEvent, Issue, IssueComment};
use tracing::warn;

pub async fn append_comment(
    store: &Store,
    issue: &Issue,
    creator: &str,
    text: &str,
    event: Option<CommentEvent>,
) -> Option<IssueComment> {
    let new = NewIssueComment {
        project: issue.project.clone(),
        issue_uid: issue.uid,
        creator: creator.to_string(),
        comment: text.to_string(),
        event,
    };
    match store.create_issue_comment(&new).await {
        Ok(comment) => Some(comment),
        Err(e) => {
            warn!(issue = issue.uid, "Failed to append issue comment: {}", e);
            None
        }
    }
}

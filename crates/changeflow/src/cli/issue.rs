//! `changeflow issue` - list and review issues.

use super::output::{
    approval_status_color, format_time, issue_status_color, print_json, print_table_colored,
    truncate,
};
use super::Env;
use anyhow::Result;
use changeflow::service::ListIssuesRequest;
use changeflow::RequestContext;
use changeflow_protocol::Issue;
use serde::Serialize;

#[derive(Debug)]
pub struct ListArgs {
    pub project: Option<String>,
    pub filter: String,
    pub page_size: i32,
    pub page_token: String,
    pub json: bool,
}

#[derive(Debug, Clone, Copy)]
pub enum Review {
    Approve,
    Reject,
    Request,
}

#[derive(Debug, Serialize)]
struct IssuesOutput<'a> {
    issues: &'a [Issue],
    next_page_token: &'a str,
}

pub async fn list(env: &Env, ctx: &RequestContext, args: ListArgs) -> Result<()> {
    let request = ListIssuesRequest {
        parent: format!("projects/{}", args.project.as_deref().unwrap_or("-")),
        filter: args.filter,
        page_size: args.page_size,
        page_token: args.page_token,
        ..Default::default()
    };
    let (issues, next_page_token) = env.state.issues().list_issues(ctx, &request).await?;

    if args.json {
        return print_json(&IssuesOutput {
            issues: &issues,
            next_page_token: &next_page_token,
        });
    }
    if issues.is_empty() {
        println!("No issues found.");
        return Ok(());
    }

    let rows = issues
        .iter()
        .map(|issue| {
            let approval = issue.approval_status();
            vec![
                (issue.name().to_string(), None),
                (truncate(&issue.title, 40), None),
                (issue.issue_type.to_string(), None),
                (issue.status.to_string(), Some(issue_status_color(issue.status))),
                (approval.to_string(), Some(approval_status_color(approval))),
                (issue.creator.clone(), None),
                (format_time(&issue.created_at), None),
            ]
        })
        .collect();
    print_table_colored(
        &["NAME", "TITLE", "TYPE", "STATUS", "APPROVAL", "CREATOR", "CREATED"],
        rows,
    );
    if !next_page_token.is_empty() {
        println!("Next page: --page-token {}", next_page_token);
    }
    Ok(())
}

pub async fn review(
    env: &Env,
    ctx: &RequestContext,
    review: Review,
    name: &str,
    comment: &str,
) -> Result<()> {
    let issues = env.state.issues();
    let issue = match review {
        Review::Approve => issues.approve_issue(ctx, name, comment).await?,
        Review::Reject => issues.reject_issue(ctx, name, comment).await?,
        Review::Request => issues.request_issue(ctx, name, comment).await?,
    };
    println!(
        "{}: status {}, approval {}",
        issue.name(),
        issue.status,
        issue.approval_status()
    );
    Ok(())
}

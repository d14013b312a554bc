//! Output formatting for CLI commands.

use changeflow_protocol::{AccessGrantStatus, ApprovalStatus, IssueStatus, PlanCheckRunStatus};
use chrono::{DateTime, Utc};
use comfy_table::{presets::UTF8_FULL_CONDENSED, Cell, Color, ContentArrangement, Table};
use serde::Serialize;

/// Print a table with optional per-cell colors.
pub fn print_table_colored(headers: &[&str], rows: Vec<Vec<(String, Option<Color>)>>) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic);

    let header_cells: Vec<Cell> = headers
        .iter()
        .map(|h| Cell::new(h).fg(Color::Cyan))
        .collect();
    table.set_header(header_cells);

    for row in rows {
        let cells: Vec<Cell> = row
            .into_iter()
            .map(|(text, color)| match color {
                Some(c) => Cell::new(text).fg(c),
                None => Cell::new(text),
            })
            .collect();
        table.add_row(cells);
    }

    println!("{}", table);
}

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn format_time(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Shortens `s` to `max` characters, marking the cut with `...`.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let keep: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", keep)
}

pub fn issue_status_color(status: IssueStatus) -> Color {
    match status {
        IssueStatus::Open => Color::Yellow,
        IssueStatus::Done => Color::Green,
        IssueStatus::Canceled => Color::DarkGrey,
    }
}

pub fn approval_status_color(status: ApprovalStatus) -> Color {
    match status {
        ApprovalStatus::Checking => Color::Cyan,
        ApprovalStatus::Error | ApprovalStatus::Rejected => Color::Red,
        ApprovalStatus::Skipped => Color::DarkGrey,
        ApprovalStatus::Pending => Color::Yellow,
        ApprovalStatus::Approved => Color::Green,
    }
}

pub fn grant_status_color(status: AccessGrantStatus) -> Color {
    match status {
        AccessGrantStatus::Pending => Color::Yellow,
        AccessGrantStatus::Active => Color::Green,
        AccessGrantStatus::Revoked => Color::DarkGrey,
    }
}

pub fn plan_check_status_color(status: PlanCheckRunStatus) -> Color {
    match status {
        PlanCheckRunStatus::Running => Color::Cyan,
        PlanCheckRunStatus::Done => Color::Green,
        PlanCheckRunStatus::Failed => Color::Red,
        PlanCheckRunStatus::Canceled => Color::DarkGrey,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a long issue title", 10), "a long ...");
        assert_eq!(truncate("héllo wörld", 8), "héllo...");
    }
}

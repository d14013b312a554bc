//! Access grant list filter.

use super::{parse_filter, resolve_user_email};
use changeflow_db::{AccessGrantFind, Store};
use changeflow_protocol::{AccessGrantStatus, ApiResult};

pub async fn apply_grant_filter(
    store: &Store,
    filter: &str,
    find: &mut AccessGrantFind,
) -> ApiResult<()> {
    for term in parse_filter(filter)? {
        match term.variable.as_str() {
            "creator" => find.creator = Some(resolve_user_email(store, term.string()?).await?),
            "status" => find.statuses = term.parsed::<AccessGrantStatus>()?,
            _ => return Err(term.unknown()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_grant_filter_statuses() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("grants.db")).await.unwrap();
        let mut find = AccessGrantFind::default();
        apply_grant_filter(&store, r#"status in ["PENDING", "ACTIVE"]"#, &mut find)
            .await
            .unwrap();
        assert_eq!(
            find.statuses,
            vec![AccessGrantStatus::Pending, AccessGrantStatus::Active]
        );
    }
}

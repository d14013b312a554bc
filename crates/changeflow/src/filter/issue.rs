//! Issue list filter.

use super::{parse_filter, resolve_user_email, FilterTerm};
use changeflow_db::{IssueFind, Store, TaskKind};
use changeflow_ids::{DatabaseName, InstanceName};
use changeflow_protocol::{
    ApiError, ApiResult, ErrorContext, IssueStatus, IssueType, MigrateType, TaskType,
};
use changeflow_security::cel::BinaryOp;

/// Concrete task kinds behind a `task_type` filter value.
pub fn task_kinds(value: &str) -> ApiResult<Vec<TaskKind>> {
    let kind = |task_type, migrate_type| TaskKind {
        task_type,
        migrate_type,
    };
    match value {
        "DDL" => Ok(vec![
            kind(TaskType::DatabaseMigrate, Some(MigrateType::Ddl)),
            kind(TaskType::DatabaseMigrate, Some(MigrateType::Ghost)),
            kind(TaskType::DatabaseSdl, None),
        ]),
        "DML" => Ok(vec![kind(TaskType::DatabaseMigrate, Some(MigrateType::Dml))]),
        "DATA_EXPORT" => Ok(vec![kind(TaskType::DatabaseExport, None)]),
        other => Err(ApiError::invalid_argument(format!(
            "invalid task_type {:?}, expect DDL, DML or DATA_EXPORT",
            other
        ))),
    }
}

async fn apply_term(store: &Store, term: &FilterTerm, find: &mut IssueFind) -> ApiResult<()> {
    match term.variable.as_str() {
        "creator" => find.creator = Some(resolve_user_email(store, term.string()?).await?),
        "subscriber" => find.subscriber = Some(resolve_user_email(store, term.string()?).await?),
        "instance" => {
            let name = InstanceName::parse(term.string()?)?;
            store
                .get_instance(&name.instance)
                .await
                .internal_context("get instance")?
                .ok_or_else(|| ApiError::not_found(format!("instance {:?} not found", name.instance.as_str())))?;
            find.instance = Some(name.instance);
        }
        "database" => {
            let name = DatabaseName::parse(term.string()?)?;
            store
                .get_database(&name)
                .await
                .internal_context("get database")?
                .ok_or_else(|| ApiError::not_found(format!("database {:?} not found", name.to_string())))?;
            find.database = Some(name);
        }
        "has_pipeline" => find.has_pipeline = Some(term.bool()?),
        "status" => find.statuses = term.parsed::<IssueStatus>()?,
        "type" => find.types = term.parsed::<IssueType>()?,
        "task_type" => find.task_kinds = task_kinds(term.string()?)?,
        "labels" => find.labels.extend(term.strings()?),
        "create_time" => {
            let at = term.timestamp()?;
            if term.op == BinaryOp::Ge {
                find.created_after = Some(at);
            } else {
                find.created_before = Some(at);
            }
        }
        _ => return Err(term.unknown()),
    }
    Ok(())
}

/// Applies `filter` to `find`. Lookups resolve user, instance and database
/// references; a reference to a missing entity is NotFound.
pub async fn apply_issue_filter(store: &Store, filter: &str, find: &mut IssueFind) -> ApiResult<()> {
    for term in parse_filter(filter)? {
        apply_term(store, &term, find).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use changeflow_ids::InstanceId;
    use changeflow_protocol::{Code, DataSource, DataSourceType, Engine, Instance};
    use tempfile::TempDir;

    async fn store() -> (Store, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("filter.db")).await.unwrap();
        store.create_user("bob@x", "Bob").await.unwrap();
        store
            .create_instance(&Instance {
                id: InstanceId::parse("i1").unwrap(),
                title: "i1".into(),
                engine: Engine::Postgres,
                environment: None,
                data_sources: vec![DataSource {
                    id: "admin".into(),
                    source_type: DataSourceType::Admin,
                    host: "db".into(),
                    port: "5432".into(),
                    username: "admin".into(),
                    password: "pw".into(),
                    external_secret: None,
                }],
                activation: true,
                sync_interval_secs: None,
                last_slow_query_sync: None,
                deleted: false,
            })
            .await
            .unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_filter_populates_find() {
        let (store, _dir) = store().await;
        let mut find = IssueFind::default();
        apply_issue_filter(
            &store,
            r#"creator == "users/bob@x" && instance == "instances/i1" && type == "DATABASE_CHANGE" && task_type == "DDL" && labels in ["a", "b"] && create_time <= "2030-01-01T00:00:00Z""#,
            &mut find,
        )
        .await
        .unwrap();
        assert_eq!(find.creator.as_deref(), Some("bob@x"));
        assert_eq!(find.instance, Some(InstanceId::parse("i1").unwrap()));
        assert_eq!(find.types, vec![IssueType::DatabaseChange]);
        assert_eq!(find.task_kinds.len(), 3);
        assert_eq!(find.labels, vec!["a".to_string(), "b".to_string()]);
        assert!(find.created_before.is_some());
        assert!(find.created_after.is_none());
    }

    #[tokio::test]
    async fn test_lookup_misses_and_unknown_variables() {
        let (store, _dir) = store().await;
        let mut find = IssueFind::default();
        let err = apply_issue_filter(&store, r#"creator == "users/ghost@x""#, &mut find)
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::NotFound);

        let err = apply_issue_filter(&store, r#"database == "instances/i1/databases/nope""#, &mut find)
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::NotFound);

        let err = apply_issue_filter(&store, r#"color == "red""#, &mut find)
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::InvalidArgument);

        let err = apply_issue_filter(&store, r#"task_type == "SDL""#, &mut find)
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::InvalidArgument);
    }
}

//! Database group membership.
//!
//! A group's expression is evaluated against every database of its
//! project at read time; matching databases are the group's members.

use changeflow_db::Store;
use changeflow_protocol::{ApiError, ApiResult, DatabaseGroup, DatabaseRef, ErrorContext};
use changeflow_security::cel::{Activation, Environment, Value};
use std::collections::BTreeMap;
use tracing::debug;

pub const GROUP_VARIABLES: &[&str] = &[
    "resource.database_name",
    "resource.instance_id",
    "resource.environment_id",
    "resource.labels",
];

fn activation(db: &DatabaseRef) -> Activation {
    let labels: BTreeMap<String, Value> = db
        .database
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    let mut act = Activation::new();
    act.insert("resource.database_name", db.database.name.as_str())
        .insert("resource.instance_id", db.database.instance.as_str())
        .insert(
            "resource.environment_id",
            db.environment.as_ref().map(|e| e.as_str()).unwrap_or(""),
        )
        .insert("resource.labels", Value::Map(labels));
    act
}

/// Databases of the group's project its expression selects.
pub async fn matched_databases(store: &Store, group: &DatabaseGroup) -> ApiResult<Vec<DatabaseRef>> {
    let program = Environment::new(GROUP_VARIABLES.iter().copied())
        .compile(&group.expression)
        .map_err(|e| {
            ApiError::invalid_argument(format!(
                "invalid expression of database group {}: {}",
                group.name(),
                e
            ))
        })?;
    let candidates = store
        .list_project_databases(&group.project)
        .await
        .internal_context("list project databases")?;
    let mut matched = Vec::new();
    for db in candidates {
        match program.eval_bool(&activation(&db)) {
            Ok(true) => matched.push(db),
            Ok(false) => {}
            // A label the database does not carry simply does not match.
            Err(e) => debug!(group = %group.name(), database = %db.database.name, "Group expression skipped: {}", e),
        }
    }
    Ok(matched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use changeflow_ids::{DatabaseGroupId, EnvironmentId, InstanceId, ProjectId};
    use changeflow_protocol::{DataSource, DataSourceType, Database, Engine, Instance, SyncState};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_group_matches_by_environment_and_label() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("groups.db")).await.unwrap();
        let instance = InstanceId::parse("i1").unwrap();
        store
            .create_instance(&Instance {
                id: instance.clone(),
                title: "i1".into(),
                engine: Engine::Mysql,
                environment: Some(EnvironmentId::parse("prod").unwrap()),
                data_sources: vec![DataSource {
                    id: "admin".into(),
                    source_type: DataSourceType::Admin,
                    host: "db".into(),
                    port: "3306".into(),
                    username: "root".into(),
                    password: String::new(),
                    external_secret: None,
                }],
                activation: true,
                sync_interval_secs: None,
                last_slow_query_sync: None,
                deleted: false,
            })
            .await
            .unwrap();
        for (name, tier) in [("orders", Some("gold")), ("users", None), ("audit", Some("gold"))] {
            store
                .upsert_database(&Database {
                    instance: instance.clone(),
                    name: name.into(),
                    project: ProjectId::parse("p1").unwrap(),
                    environment: None,
                    labels: tier
                        .map(|t| BTreeMap::from([("tier".to_string(), t.to_string())]))
                        .unwrap_or_default(),
                    sync_state: SyncState::Ok,
                    last_sync_time: None,
                })
                .await
                .unwrap();
        }
        let group = DatabaseGroup {
            project: ProjectId::parse("p1").unwrap(),
            id: DatabaseGroupId::parse("gold").unwrap(),
            title: "gold".into(),
            expression: r#"resource.environment_id == "prod" && resource.labels.tier == "gold" && resource.database_name != "audit""#.into(),
        };
        let matched = matched_databases(&store, &group).await.unwrap();
        let names: Vec<&str> = matched.iter().map(|d| d.database.name.as_str()).collect();
        assert_eq!(names, vec!["orders"]);

        let broken = DatabaseGroup {
            expression: "resource.owner == 'x'".into(),
            ..group
        };
        assert!(matched_databases(&store, &broken).await.is_err());
    }
}

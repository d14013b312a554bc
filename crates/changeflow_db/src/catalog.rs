//! Instances, databases, database groups, sheets and releases.

use crate::codec::{
    deobfuscate, from_json, from_millis, obfuscate, opt_from_millis, parse_col, parse_opt_col,
    sha256_hex, tag_col, to_json, to_millis,
};
use crate::error::{DbError, Result};
use crate::Store;
use changeflow_ids::{DatabaseGroupId, DatabaseName, InstanceId, ProjectId};
use changeflow_protocol::{
    DataSource, DataSourceType, Database, DatabaseGroup, DatabaseRef, Engine, Instance, Release,
    ReleaseFile, Sheet, SyncState,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use tracing::info;

#[derive(sqlx::FromRow)]
struct InstanceRow {
    id: String,
    title: String,
    engine: i64,
    environment: Option<String>,
    data_sources: String,
    activation: bool,
    sync_interval_secs: Option<i64>,
    last_slow_query_sync: Option<i64>,
    deleted: bool,
}

impl InstanceRow {
    fn into_instance(self) -> Result<Instance> {
        Ok(Instance {
            id: parse_col("instances.id", &self.id)?,
            title: self.title,
            engine: tag_col("instances.engine", self.engine, Engine::from_tag)?,
            environment: parse_opt_col("instances.environment", self.environment.as_deref())?,
            data_sources: from_json(&self.data_sources)?,
            activation: self.activation,
            sync_interval_secs: self.sync_interval_secs,
            last_slow_query_sync: opt_from_millis(self.last_slow_query_sync),
            deleted: self.deleted,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DatabaseRow {
    instance: String,
    name: String,
    project: String,
    environment: Option<String>,
    labels: String,
    sync_state: i64,
    last_sync_time: Option<i64>,
}

impl DatabaseRow {
    fn into_database(self) -> Result<Database> {
        Ok(Database {
            instance: parse_col("db_databases.instance", &self.instance)?,
            name: self.name,
            project: parse_col("db_databases.project", &self.project)?,
            environment: parse_opt_col("db_databases.environment", self.environment.as_deref())?,
            labels: from_json(&self.labels)?,
            sync_state: tag_col("db_databases.sync_state", self.sync_state, SyncState::from_tag)?,
            last_sync_time: opt_from_millis(self.last_sync_time),
        })
    }
}

#[derive(sqlx::FromRow)]
struct DatabaseRefRow {
    instance: String,
    name: String,
    project: String,
    environment: Option<String>,
    labels: String,
    sync_state: i64,
    last_sync_time: Option<i64>,
    engine: i64,
    instance_environment: Option<String>,
}

impl DatabaseRefRow {
    fn into_ref(self) -> Result<DatabaseRef> {
        let engine = tag_col("instances.engine", self.engine, Engine::from_tag)?;
        let instance_env =
            parse_opt_col("instances.environment", self.instance_environment.as_deref())?;
        let database = DatabaseRow {
            instance: self.instance,
            name: self.name,
            project: self.project,
            environment: self.environment,
            labels: self.labels,
            sync_state: self.sync_state,
            last_sync_time: self.last_sync_time,
        }
        .into_database()?;
        let environment = database.environment.clone().or(instance_env);
        Ok(DatabaseRef {
            database,
            engine,
            environment,
        })
    }
}

const DATABASE_REF_SELECT: &str = r#"
    SELECT d.instance, d.name, d.project, d.environment, d.labels, d.sync_state,
           d.last_sync_time, i.engine, i.environment AS instance_environment
    FROM db_databases d
    JOIN instances i ON i.id = d.instance
    WHERE i.deleted = 0
"#;

impl Store {
    // ========================================================================
    // Instances
    // ========================================================================

    /// Creates an instance. Exactly one admin data source is required;
    /// passwords are obfuscated before they are written.
    pub async fn create_instance(&self, instance: &Instance) -> Result<()> {
        let admins = instance
            .data_sources
            .iter()
            .filter(|ds| ds.source_type == DataSourceType::Admin)
            .count();
        if admins != 1 {
            return Err(DbError::invalid_state(format!(
                "instance {} must have exactly one admin data source, found {}",
                instance.id, admins
            )));
        }
        let sources: Vec<DataSource> = instance
            .data_sources
            .iter()
            .map(|ds| DataSource {
                password: obfuscate(self.secret_key(), &ds.password),
                ..ds.clone()
            })
            .collect();

        sqlx::query(
            r#"
            INSERT INTO instances (id, title, engine, environment, data_sources, activation,
                                   sync_interval_secs, last_slow_query_sync, deleted)
            VALUES (?, ?, ?, ?, ?, ?, ?, NULL, 0)
            "#,
        )
        .bind(instance.id.as_str())
        .bind(&instance.title)
        .bind(instance.engine.tag() as i64)
        .bind(instance.environment.as_ref().map(|e| e.to_string()))
        .bind(to_json(&sources)?)
        .bind(instance.activation)
        .bind(instance.sync_interval_secs)
        .execute(&self.pool)
        .await
        .map_err(|e| DbError::from_insert(e, &format!("instance {}", instance.id)))?;
        info!("Created instance: {} ({})", instance.id, instance.engine);
        Ok(())
    }

    /// Returns the instance with obfuscated passwords as stored.
    pub async fn get_instance(&self, id: &InstanceId) -> Result<Option<Instance>> {
        let row: Option<InstanceRow> = sqlx::query_as("SELECT * FROM instances WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(InstanceRow::into_instance).transpose()
    }

    pub async fn list_instances(&self) -> Result<Vec<Instance>> {
        let rows: Vec<InstanceRow> =
            sqlx::query_as("SELECT * FROM instances WHERE deleted = 0 ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(InstanceRow::into_instance).collect()
    }

    /// Plaintext password of a data source.
    pub fn reveal_password(&self, source: &DataSource) -> Result<String> {
        deobfuscate(self.secret_key(), &source.password)
    }

    pub async fn delete_instance(&self, id: &InstanceId) -> Result<()> {
        sqlx::query("UPDATE instances SET deleted = 1 WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        info!("Deleted instance: {}", id);
        Ok(())
    }

    pub async fn mark_slow_query_synced(&self, id: &InstanceId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE instances SET last_slow_query_sync = ? WHERE id = ?")
            .bind(to_millis(at))
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ========================================================================
    // Databases
    // ========================================================================

    pub async fn upsert_database(&self, db: &Database) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO db_databases (instance, name, project, environment, labels, sync_state,
                                      last_sync_time)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(instance, name) DO UPDATE SET
                project = excluded.project,
                environment = excluded.environment,
                labels = excluded.labels,
                sync_state = excluded.sync_state,
                last_sync_time = excluded.last_sync_time
            "#,
        )
        .bind(db.instance.as_str())
        .bind(&db.name)
        .bind(db.project.as_str())
        .bind(db.environment.as_ref().map(|e| e.to_string()))
        .bind(to_json(&db.labels)?)
        .bind(db.sync_state.tag() as i64)
        .bind(db.last_sync_time.map(to_millis))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_database(&self, name: &DatabaseName) -> Result<Option<DatabaseRef>> {
        let sql = format!("{} AND d.instance = ? AND d.name = ?", DATABASE_REF_SELECT);
        let row: Option<DatabaseRefRow> = sqlx::query_as(&sql)
            .bind(name.instance.as_str())
            .bind(&name.database)
            .fetch_optional(&self.pool)
            .await?;
        row.map(DatabaseRefRow::into_ref).transpose()
    }

    /// Databases owned by `project`, ordered by instance then name.
    pub async fn list_project_databases(&self, project: &ProjectId) -> Result<Vec<DatabaseRef>> {
        let sql = format!(
            "{} AND d.project = ? ORDER BY d.instance, d.name",
            DATABASE_REF_SELECT
        );
        let rows: Vec<DatabaseRefRow> = sqlx::query_as(&sql)
            .bind(project.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(DatabaseRefRow::into_ref).collect()
    }

    /// Databases of an instance, ordered by name.
    pub async fn list_instance_databases(&self, instance: &InstanceId) -> Result<Vec<DatabaseRef>> {
        let sql = format!("{} AND d.instance = ? ORDER BY d.name", DATABASE_REF_SELECT);
        let rows: Vec<DatabaseRefRow> = sqlx::query_as(&sql)
            .bind(instance.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(DatabaseRefRow::into_ref).collect()
    }

    /// Moves every named database to `target` in one transaction. Fails
    /// without changes if any database is missing.
    pub async fn transfer_databases(&self, names: &[DatabaseName], target: &ProjectId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for name in names {
            let affected = sqlx::query(
                "UPDATE db_databases SET project = ? WHERE instance = ? AND name = ?",
            )
            .bind(target.as_str())
            .bind(name.instance.as_str())
            .bind(&name.database)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if affected == 0 {
                return Err(DbError::not_found(format!("database {} not found", name)));
            }
        }
        tx.commit().await?;
        info!("Transferred {} databases to project {}", names.len(), target);
        Ok(())
    }

    // ========================================================================
    // Database groups
    // ========================================================================

    pub async fn upsert_database_group(&self, group: &DatabaseGroup) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO database_groups (project, id, title, expression) VALUES (?, ?, ?, ?)
            ON CONFLICT(project, id) DO UPDATE SET
                title = excluded.title,
                expression = excluded.expression
            "#,
        )
        .bind(group.project.as_str())
        .bind(group.id.as_str())
        .bind(&group.title)
        .bind(&group.expression)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_database_group(
        &self,
        project: &ProjectId,
        id: &DatabaseGroupId,
    ) -> Result<Option<DatabaseGroup>> {
        let row: Option<(String, String, String, String)> = sqlx::query_as(
            "SELECT project, id, title, expression FROM database_groups WHERE project = ? AND id = ?",
        )
        .bind(project.as_str())
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|(project, id, title, expression)| {
            Ok(DatabaseGroup {
                project: parse_col("database_groups.project", &project)?,
                id: parse_col("database_groups.id", &id)?,
                title,
                expression,
            })
        })
        .transpose()
    }

    // ========================================================================
    // Sheets
    // ========================================================================

    /// Stores a sheet under the SHA-256 of its content. Re-creating the same
    /// content is a no-op.
    pub async fn create_sheet(
        &self,
        project: &ProjectId,
        title: &str,
        content: &str,
        creator: &str,
    ) -> Result<Sheet> {
        let sha256 = sha256_hex(content);
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO sheets (project, sha256, title, content, creator, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(project.as_str())
        .bind(&sha256)
        .bind(title)
        .bind(content)
        .bind(creator)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;
        self.get_sheet(project, &sha256)
            .await?
            .ok_or_else(|| DbError::not_found(format!("sheet {} not found", sha256)))
    }

    pub async fn get_sheet(&self, project: &ProjectId, sha256: &str) -> Result<Option<Sheet>> {
        let row: Option<(String, String, String, String, String, i64)> = sqlx::query_as(
            r#"
            SELECT project, sha256, title, content, creator, created_at
            FROM sheets WHERE project = ? AND sha256 = ?
            "#,
        )
        .bind(project.as_str())
        .bind(sha256)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|(project, sha256, title, content, creator, created_at)| {
            Ok(Sheet {
                project: parse_col("sheets.project", &project)?,
                sha256,
                title,
                content,
                creator,
                created_at: from_millis(created_at),
            })
        })
        .transpose()
    }

    /// Returns true iff every hash names a sheet in `project`.
    pub async fn has_sheets(&self, project: &ProjectId, hashes: &[String]) -> Result<bool> {
        let wanted: BTreeSet<&str> = hashes.iter().map(String::as_str).collect();
        if wanted.is_empty() {
            return Ok(true);
        }
        let mut qb = sqlx::QueryBuilder::<sqlx::Sqlite>::new(
            "SELECT COUNT(*) FROM sheets WHERE project = ",
        );
        qb.push_bind(project.as_str());
        qb.push(" AND sha256 IN (");
        let mut sep = qb.separated(", ");
        for hash in &wanted {
            sep.push_bind(*hash);
        }
        sep.push_unseparated(")");
        let found: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(found as usize == wanted.len())
    }

    // ========================================================================
    // Releases
    // ========================================================================

    pub async fn create_release(
        &self,
        project: &ProjectId,
        title: &str,
        files: &[ReleaseFile],
        creator: &str,
    ) -> Result<Release> {
        let now = Utc::now();
        let uid = sqlx::query(
            r#"
            INSERT INTO releases (project, title, files, creator, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(project.as_str())
        .bind(title)
        .bind(to_json(&files)?)
        .bind(creator)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        info!("Created release {} in project {}", uid, project);
        Ok(Release {
            uid,
            project: project.clone(),
            title: title.to_string(),
            files: files.to_vec(),
            creator: creator.to_string(),
            created_at: from_millis(to_millis(now)),
        })
    }

    pub async fn get_release(&self, project: &ProjectId, uid: i64) -> Result<Option<Release>> {
        let row: Option<(i64, String, String, String, String, i64)> = sqlx::query_as(
            r#"
            SELECT uid, project, title, files, creator, created_at
            FROM releases WHERE project = ? AND uid = ?
            "#,
        )
        .bind(project.as_str())
        .bind(uid)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|(uid, project, title, files, creator, created_at)| {
            Ok(Release {
                uid,
                project: parse_col("releases.project", &project)?,
                title,
                files: from_json(&files)?,
                creator,
                created_at: from_millis(created_at),
            })
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::open_store;
    use changeflow_ids::EnvironmentId;
    use std::collections::BTreeMap;

    fn admin(password: &str) -> DataSource {
        DataSource {
            id: "admin".into(),
            source_type: DataSourceType::Admin,
            host: "127.0.0.1".into(),
            port: "3306".into(),
            username: "root".into(),
            password: password.into(),
            external_secret: None,
        }
    }

    fn instance(id: &str, sources: Vec<DataSource>) -> Instance {
        Instance {
            id: InstanceId::parse(id).unwrap(),
            title: id.into(),
            engine: Engine::Mysql,
            environment: Some(EnvironmentId::parse("prod").unwrap()),
            data_sources: sources,
            activation: true,
            sync_interval_secs: None,
            last_slow_query_sync: None,
            deleted: false,
        }
    }

    fn database(instance: &str, name: &str, project: &str) -> Database {
        Database {
            instance: InstanceId::parse(instance).unwrap(),
            name: name.into(),
            project: ProjectId::parse(project).unwrap(),
            environment: None,
            labels: BTreeMap::new(),
            sync_state: SyncState::Ok,
            last_sync_time: None,
        }
    }

    #[tokio::test]
    async fn test_instance_requires_one_admin_and_obfuscates() {
        let (store, _dir) = open_store().await;
        let err = store.create_instance(&instance("i1", vec![])).await.unwrap_err();
        assert!(matches!(err, DbError::InvalidState(_)));

        store
            .create_instance(&instance("i1", vec![admin("hunter2")]))
            .await
            .unwrap();
        let got = store
            .get_instance(&InstanceId::parse("i1").unwrap())
            .await
            .unwrap()
            .unwrap();
        let source = got.admin_data_source().unwrap();
        assert_ne!(source.password, "hunter2");
        assert_eq!(store.reveal_password(source).unwrap(), "hunter2");
    }

    #[tokio::test]
    async fn test_database_inherits_instance_environment() {
        let (store, _dir) = open_store().await;
        store
            .create_instance(&instance("i1", vec![admin("pw")]))
            .await
            .unwrap();
        store.upsert_database(&database("i1", "d1", "p1")).await.unwrap();
        let mut with_override = database("i1", "d2", "p1");
        with_override.environment = Some(EnvironmentId::parse("test").unwrap());
        store.upsert_database(&with_override).await.unwrap();

        let d1 = store
            .get_database(&DatabaseName::parse("instances/i1/databases/d1").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(d1.environment.unwrap().as_str(), "prod");
        let d2 = store
            .get_database(&DatabaseName::parse("instances/i1/databases/d2").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(d2.environment.unwrap().as_str(), "test");
        assert_eq!(d2.engine, Engine::Mysql);
    }

    #[tokio::test]
    async fn test_transfer_databases_is_atomic() {
        let (store, _dir) = open_store().await;
        store
            .create_instance(&instance("i1", vec![admin("pw")]))
            .await
            .unwrap();
        store.upsert_database(&database("i1", "d1", "p1")).await.unwrap();
        let target = ProjectId::parse("p2").unwrap();
        let names = vec![
            DatabaseName::parse("instances/i1/databases/d1").unwrap(),
            DatabaseName::parse("instances/i1/databases/missing").unwrap(),
        ];
        assert!(store.transfer_databases(&names, &target).await.is_err());
        let p1 = ProjectId::parse("p1").unwrap();
        assert_eq!(store.list_project_databases(&p1).await.unwrap().len(), 1);

        store.transfer_databases(&names[..1], &target).await.unwrap();
        assert!(store.list_project_databases(&p1).await.unwrap().is_empty());
        assert_eq!(store.list_project_databases(&target).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sheets_are_content_addressed() {
        let (store, _dir) = open_store().await;
        let p1 = ProjectId::parse("p1").unwrap();
        let a = store.create_sheet(&p1, "a", "SELECT 1;", "bob@x").await.unwrap();
        let again = store.create_sheet(&p1, "b", "SELECT 1;", "bob@x").await.unwrap();
        assert_eq!(a.sha256, again.sha256);
        assert_eq!(again.title, "a");

        assert!(store.has_sheets(&p1, &[a.sha256.clone()]).await.unwrap());
        assert!(!store
            .has_sheets(&p1, &[a.sha256.clone(), "0".repeat(64)])
            .await
            .unwrap());
        let p2 = ProjectId::parse("p2").unwrap();
        assert!(!store.has_sheets(&p2, &[a.sha256]).await.unwrap());
    }
}

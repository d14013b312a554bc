//! Table definitions.
//!
//! Timestamps are milliseconds since the epoch. Enums are stored as their
//! integer tags. Nested payloads are JSON text.

pub(crate) const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS settings (
        name TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS projects (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        settings TEXT NOT NULL,
        webhooks TEXT NOT NULL,
        policy TEXT NOT NULL,
        deleted INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS environments (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        env_order INTEGER NOT NULL,
        tier INTEGER NOT NULL,
        color TEXT NOT NULL,
        tags TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS users (
        uid INTEGER PRIMARY KEY AUTOINCREMENT,
        email TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_groups (
        email TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        members TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS roles (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        permissions TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS instances (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        engine INTEGER NOT NULL,
        environment TEXT,
        data_sources TEXT NOT NULL,
        activation INTEGER NOT NULL,
        sync_interval_secs INTEGER,
        last_slow_query_sync INTEGER,
        deleted INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS db_databases (
        instance TEXT NOT NULL,
        name TEXT NOT NULL,
        project TEXT NOT NULL,
        environment TEXT,
        labels TEXT NOT NULL,
        sync_state INTEGER NOT NULL,
        last_sync_time INTEGER,
        PRIMARY KEY (instance, name)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_db_databases_project ON db_databases(project)",
    r#"
    CREATE TABLE IF NOT EXISTS database_groups (
        project TEXT NOT NULL,
        id TEXT NOT NULL,
        title TEXT NOT NULL,
        expression TEXT NOT NULL,
        PRIMARY KEY (project, id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sheets (
        project TEXT NOT NULL,
        sha256 TEXT NOT NULL,
        title TEXT NOT NULL,
        content TEXT NOT NULL,
        creator TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        PRIMARY KEY (project, sha256)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS releases (
        uid INTEGER PRIMARY KEY AUTOINCREMENT,
        project TEXT NOT NULL,
        title TEXT NOT NULL,
        files TEXT NOT NULL,
        creator TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS plans (
        uid INTEGER PRIMARY KEY AUTOINCREMENT,
        project TEXT NOT NULL,
        creator TEXT NOT NULL,
        title TEXT NOT NULL,
        description TEXT NOT NULL,
        state INTEGER NOT NULL,
        specs TEXT NOT NULL,
        deployment TEXT,
        pipeline_uid INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_plans_project ON plans(project)",
    r#"
    CREATE TABLE IF NOT EXISTS plan_check_runs (
        uid INTEGER PRIMARY KEY AUTOINCREMENT,
        project TEXT NOT NULL,
        plan_uid INTEGER NOT NULL,
        status INTEGER NOT NULL,
        config TEXT NOT NULL,
        result TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_plan_check_runs_plan ON plan_check_runs(plan_uid)",
    "CREATE INDEX IF NOT EXISTS idx_plan_check_runs_status ON plan_check_runs(status)",
    r#"
    CREATE TABLE IF NOT EXISTS pipelines (
        uid INTEGER PRIMARY KEY AUTOINCREMENT,
        project TEXT NOT NULL,
        plan_uid INTEGER NOT NULL,
        creator TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        uid INTEGER PRIMARY KEY AUTOINCREMENT,
        pipeline_uid INTEGER NOT NULL,
        environment TEXT,
        instance TEXT NOT NULL,
        database_name TEXT,
        task_type INTEGER NOT NULL,
        migrate_type INTEGER,
        sheet_sha256 TEXT,
        spec_id TEXT NOT NULL,
        payload TEXT NOT NULL,
        latest_task_run_status INTEGER NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_tasks_pipeline ON tasks(pipeline_uid)",
    r#"
    CREATE TABLE IF NOT EXISTS task_runs (
        uid INTEGER PRIMARY KEY AUTOINCREMENT,
        task_uid INTEGER NOT NULL,
        creator TEXT NOT NULL,
        status INTEGER NOT NULL,
        started_at INTEGER,
        run_time_ms INTEGER,
        detail TEXT NOT NULL,
        result TEXT NOT NULL,
        scheduler_info TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_task_runs_task ON task_runs(task_uid)",
    r#"
    CREATE TABLE IF NOT EXISTS issues (
        uid INTEGER PRIMARY KEY AUTOINCREMENT,
        project TEXT NOT NULL,
        creator TEXT NOT NULL,
        title TEXT NOT NULL,
        description TEXT NOT NULL,
        issue_type INTEGER NOT NULL,
        status INTEGER NOT NULL,
        plan_uid INTEGER,
        pipeline_uid INTEGER,
        payload TEXT NOT NULL,
        subscribers TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_issues_project ON issues(project)",
    "CREATE INDEX IF NOT EXISTS idx_issues_plan ON issues(plan_uid)",
    "CREATE INDEX IF NOT EXISTS idx_issues_updated ON issues(updated_at DESC, uid DESC)",
    r#"
    CREATE TABLE IF NOT EXISTS issue_comments (
        uid INTEGER PRIMARY KEY AUTOINCREMENT,
        project TEXT NOT NULL,
        issue_uid INTEGER NOT NULL,
        creator TEXT NOT NULL,
        comment TEXT NOT NULL,
        event TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_issue_comments_issue ON issue_comments(issue_uid)",
    r#"
    CREATE TABLE IF NOT EXISTS access_grants (
        uid INTEGER PRIMARY KEY AUTOINCREMENT,
        project TEXT NOT NULL,
        creator TEXT NOT NULL,
        status INTEGER NOT NULL,
        expire_time INTEGER,
        ttl_secs INTEGER,
        payload TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS signals (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        kind TEXT NOT NULL,
        payload TEXT NOT NULL,
        origin TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
];

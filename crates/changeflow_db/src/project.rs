//! Projects, environments, principals, custom roles and workspace settings.

use crate::codec::{from_json, parse_col, tag_col, to_json};
use crate::error::{DbError, Result};
use crate::Store;
use changeflow_ids::{EnvironmentId, ProjectId, RoleId};
use changeflow_protocol::{
    Environment, EnvironmentTier, Group, IamPolicy, Project, ProjectSettings, ProjectWebhook,
    Risk, Role, RolloutPolicy, User, WorkspaceApprovalSetting, SETTING_APPROVAL, SETTING_RISKS,
    SETTING_ROLLOUT_POLICIES, SETTING_WORKSPACE_POLICY,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;

#[derive(sqlx::FromRow)]
struct ProjectRow {
    id: String,
    title: String,
    settings: String,
    webhooks: String,
    policy: String,
    deleted: bool,
}

impl ProjectRow {
    fn into_project(self) -> Result<Project> {
        Ok(Project {
            id: parse_col("projects.id", &self.id)?,
            title: self.title,
            settings: from_json(&self.settings)?,
            webhooks: from_json(&self.webhooks)?,
            policy: from_json(&self.policy)?,
            deleted: self.deleted,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EnvironmentRow {
    id: String,
    title: String,
    env_order: i64,
    tier: i64,
    color: String,
    tags: String,
}

impl EnvironmentRow {
    fn into_environment(self) -> Result<Environment> {
        Ok(Environment {
            id: parse_col("environments.id", &self.id)?,
            title: self.title,
            order: self.env_order as i32,
            tier: tag_col("environments.tier", self.tier, EnvironmentTier::from_tag)?,
            color: self.color,
            tags: from_json(&self.tags)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    uid: i64,
    email: String,
    name: String,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            uid: row.uid,
            email: row.email,
            name: row.name,
        }
    }
}

#[derive(sqlx::FromRow)]
struct GroupRow {
    email: String,
    title: String,
    members: String,
}

impl GroupRow {
    fn into_group(self) -> Result<Group> {
        Ok(Group {
            email: self.email,
            title: self.title,
            members: from_json(&self.members)?,
        })
    }
}

impl Store {
    // ========================================================================
    // Projects
    // ========================================================================

    pub async fn create_project(&self, project: &Project) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO projects (id, title, settings, webhooks, policy, deleted)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(project.id.as_str())
        .bind(&project.title)
        .bind(to_json(&project.settings)?)
        .bind(to_json(&project.webhooks)?)
        .bind(to_json(&project.policy)?)
        .bind(project.deleted)
        .execute(&self.pool)
        .await
        .map_err(|e| DbError::from_insert(e, &format!("project {}", project.id)))?;
        info!("Created project: {}", project.id);
        Ok(())
    }

    /// Returns the project, including soft-deleted ones.
    pub async fn get_project(&self, id: &ProjectId) -> Result<Option<Project>> {
        let row: Option<ProjectRow> = sqlx::query_as("SELECT * FROM projects WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(ProjectRow::into_project).transpose()
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        let rows: Vec<ProjectRow> =
            sqlx::query_as("SELECT * FROM projects WHERE deleted = 0 ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(ProjectRow::into_project).collect()
    }

    pub async fn set_project_policy(&self, id: &ProjectId, policy: &IamPolicy) -> Result<()> {
        let affected = sqlx::query("UPDATE projects SET policy = ? WHERE id = ?")
            .bind(to_json(policy)?)
            .bind(id.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(DbError::not_found(format!("project {} not found", id)));
        }
        Ok(())
    }

    pub async fn set_project_settings(
        &self,
        id: &ProjectId,
        settings: &ProjectSettings,
        webhooks: &[ProjectWebhook],
    ) -> Result<()> {
        let affected = sqlx::query("UPDATE projects SET settings = ?, webhooks = ? WHERE id = ?")
            .bind(to_json(settings)?)
            .bind(to_json(&webhooks)?)
            .bind(id.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(DbError::not_found(format!("project {} not found", id)));
        }
        Ok(())
    }

    pub async fn delete_project(&self, id: &ProjectId) -> Result<()> {
        sqlx::query("UPDATE projects SET deleted = 1 WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        info!("Deleted project: {}", id);
        Ok(())
    }

    // ========================================================================
    // Environments
    // ========================================================================

    pub async fn upsert_environment(&self, env: &Environment) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO environments (id, title, env_order, tier, color, tags)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                env_order = excluded.env_order,
                tier = excluded.tier,
                color = excluded.color,
                tags = excluded.tags
            "#,
        )
        .bind(env.id.as_str())
        .bind(&env.title)
        .bind(env.order as i64)
        .bind(env.tier.tag() as i64)
        .bind(&env.color)
        .bind(to_json(&env.tags)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Environments in workspace order.
    pub async fn list_environments(&self) -> Result<Vec<Environment>> {
        let rows: Vec<EnvironmentRow> =
            sqlx::query_as("SELECT * FROM environments ORDER BY env_order, id")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(EnvironmentRow::into_environment).collect()
    }

    pub async fn get_environment(&self, id: &EnvironmentId) -> Result<Option<Environment>> {
        let row: Option<EnvironmentRow> =
            sqlx::query_as("SELECT * FROM environments WHERE id = ?")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        row.map(EnvironmentRow::into_environment).transpose()
    }

    pub async fn delete_environment(&self, id: &EnvironmentId) -> Result<()> {
        sqlx::query("DELETE FROM environments WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ========================================================================
    // Users, groups, roles
    // ========================================================================

    pub async fn create_user(&self, email: &str, name: &str) -> Result<User> {
        let uid = sqlx::query("INSERT INTO users (email, name) VALUES (?, ?)")
            .bind(email)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| DbError::from_insert(e, &format!("user {}", email)))?
            .last_insert_rowid();
        info!("Created user {}: {}", uid, email);
        Ok(User {
            uid,
            email: email.to_string(),
            name: name.to_string(),
        })
    }

    pub async fn get_user(&self, uid: i64) -> Result<Option<User>> {
        let row: Option<UserRow> = sqlx::query_as("SELECT * FROM users WHERE uid = ?")
            .bind(uid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(User::from))
    }

    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let row: Option<UserRow> = sqlx::query_as("SELECT * FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(User::from))
    }

    pub async fn list_users(&self) -> Result<Vec<User>> {
        let rows: Vec<UserRow> = sqlx::query_as("SELECT * FROM users ORDER BY uid")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(User::from).collect())
    }

    pub async fn upsert_group(&self, group: &Group) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_groups (email, title, members) VALUES (?, ?, ?)
            ON CONFLICT(email) DO UPDATE SET title = excluded.title, members = excluded.members
            "#,
        )
        .bind(&group.email)
        .bind(&group.title)
        .bind(to_json(&group.members)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Groups listing `member_email` among their members.
    pub async fn list_groups_for_member(&self, member_email: &str) -> Result<Vec<Group>> {
        let rows: Vec<GroupRow> = sqlx::query_as(
            r#"
            SELECT * FROM user_groups
            WHERE EXISTS (SELECT 1 FROM json_each(user_groups.members) WHERE value = ?)
            ORDER BY email
            "#,
        )
        .bind(member_email)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(GroupRow::into_group).collect()
    }

    pub async fn upsert_role(&self, role: &Role) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO roles (id, title, permissions) VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET title = excluded.title, permissions = excluded.permissions
            "#,
        )
        .bind(role.id.as_str())
        .bind(&role.title)
        .bind(to_json(&role.permissions)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_roles(&self) -> Result<Vec<Role>> {
        let rows: Vec<(String, String, String)> =
            sqlx::query_as("SELECT id, title, permissions FROM roles ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|(id, title, permissions)| {
                Ok(Role {
                    id: parse_col::<RoleId>("roles.id", &id)?,
                    title,
                    permissions: from_json(&permissions)?,
                })
            })
            .collect()
    }

    // ========================================================================
    // Workspace settings
    // ========================================================================

    pub async fn get_setting<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let raw: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        raw.map(|r| from_json(&r)).transpose()
    }

    pub async fn set_setting<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (name, value) VALUES (?, ?)
            ON CONFLICT(name) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(name)
        .bind(to_json(value)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn workspace_policy(&self) -> Result<IamPolicy> {
        Ok(self
            .get_setting(SETTING_WORKSPACE_POLICY)
            .await?
            .unwrap_or_default())
    }

    pub async fn set_workspace_policy(&self, policy: &IamPolicy) -> Result<()> {
        self.set_setting(SETTING_WORKSPACE_POLICY, policy).await
    }

    pub async fn approval_setting(&self) -> Result<WorkspaceApprovalSetting> {
        Ok(self.get_setting(SETTING_APPROVAL).await?.unwrap_or_default())
    }

    pub async fn set_approval_setting(&self, setting: &WorkspaceApprovalSetting) -> Result<()> {
        self.set_setting(SETTING_APPROVAL, setting).await
    }

    pub async fn risks(&self) -> Result<Vec<Risk>> {
        Ok(self.get_setting(SETTING_RISKS).await?.unwrap_or_default())
    }

    pub async fn set_risks(&self, risks: &[Risk]) -> Result<()> {
        self.set_setting(SETTING_RISKS, &risks).await
    }

    /// Rollout policy per environment id.
    pub async fn rollout_policies(&self) -> Result<BTreeMap<String, RolloutPolicy>> {
        Ok(self
            .get_setting(SETTING_ROLLOUT_POLICIES)
            .await?
            .unwrap_or_default())
    }

    pub async fn set_rollout_policy(
        &self,
        environment: &EnvironmentId,
        policy: &RolloutPolicy,
    ) -> Result<()> {
        let mut policies = self.rollout_policies().await?;
        policies.insert(environment.to_string(), policy.clone());
        self.set_setting(SETTING_ROLLOUT_POLICIES, &policies).await
    }
}

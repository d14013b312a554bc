//! Canonical resource names.
//!
//! Each name type has exactly one formatter (`Display`) and one parser
//! (`FromStr`). Parsing is strict: the segment count must match, every
//! keyword must match, ids must be non-empty and must be in the canonical form
//! the formatter would produce, so `parse(format(x)) == x` and nothing else
//! parses.

use crate::{
    DatabaseGroupId, EnvironmentId, IdParseError, IdpId, InstanceId, ProjectId, RoleId, WILDCARD,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Segment keywords
// ============================================================================

pub const PROJECTS: &str = "projects";
pub const ISSUES: &str = "issues";
pub const ISSUE_COMMENTS: &str = "issueComments";
pub const PLANS: &str = "plans";
pub const PLAN_CHECK_RUNS: &str = "planCheckRuns";
pub const ROLLOUTS: &str = "rollouts";
pub const STAGES: &str = "stages";
pub const TASKS: &str = "tasks";
pub const TASK_RUNS: &str = "taskRuns";
pub const ACCESS_GRANTS: &str = "accessGrants";
pub const SHEETS: &str = "sheets";
pub const RELEASES: &str = "releases";
pub const DATABASE_GROUPS: &str = "databaseGroups";
pub const INSTANCES: &str = "instances";
pub const DATABASES: &str = "databases";
pub const ENVIRONMENTS: &str = "environments";
pub const USERS: &str = "users";
pub const GROUPS: &str = "groups";
pub const ROLES: &str = "roles";
pub const SETTINGS: &str = "settings";
pub const IDPS: &str = "idps";
pub const WORKSPACES: &str = "workspaces";

/// Binding member prefix for a single user.
pub const USER_MEMBER_PREFIX: &str = "user:";
/// Binding member prefix for a group.
pub const GROUP_MEMBER_PREFIX: &str = "group:";
/// Binding member matching every principal.
pub const ALL_USERS_MEMBER: &str = "allUsers";

// ============================================================================
// Parsing helpers
// ============================================================================

/// Split `name` into ids, checking the segment count and every keyword.
fn split_ids<'a>(name: &'a str, keywords: &[&str]) -> Result<Vec<&'a str>, IdParseError> {
    let parts: Vec<&str> = name.split('/').collect();
    if parts.len() != keywords.len() * 2 {
        return Err(IdParseError::new(format!(
            "invalid resource name {:?}: expected {} segments, got {}",
            name,
            keywords.len() * 2,
            parts.len()
        )));
    }
    let mut ids = Vec::with_capacity(keywords.len());
    for (i, keyword) in keywords.iter().enumerate() {
        let segment = parts[i * 2];
        let id = parts[i * 2 + 1];
        if segment != *keyword {
            return Err(IdParseError::new(format!(
                "invalid resource name {:?}: expected segment {:?}, got {:?}",
                name, keyword, segment
            )));
        }
        if id.is_empty() {
            return Err(IdParseError::new(format!(
                "invalid resource name {:?}: empty {} id",
                name, keyword
            )));
        }
        ids.push(id);
    }
    Ok(ids)
}

/// Parse a positive integer uid in canonical decimal form.
pub fn parse_uid(label: &str, value: &str) -> Result<i64, IdParseError> {
    let uid: i64 = value
        .parse()
        .map_err(|_| IdParseError::new(format!("invalid {} uid {:?}", label, value)))?;
    if uid <= 0 || uid.to_string() != value {
        return Err(IdParseError::new(format!("invalid {} uid {:?}", label, value)));
    }
    Ok(uid)
}

fn parse_email(value: &str) -> Result<String, IdParseError> {
    let mut halves = value.split('@');
    let local = halves.next().unwrap_or_default();
    let domain = halves.next().unwrap_or_default();
    let valid = halves.next().is_none()
        && !local.is_empty()
        && !domain.is_empty()
        && !value.chars().any(|c| c.is_whitespace() || c == '/' || c.is_ascii_uppercase());
    if !valid {
        return Err(IdParseError::new(format!("invalid email {:?}", value)));
    }
    Ok(value.to_string())
}

fn parse_database_name(value: &str) -> Result<String, IdParseError> {
    if value == WILDCARD || value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(IdParseError::new(format!("invalid database name {:?}", value)));
    }
    Ok(value.to_string())
}

fn parse_sha256(value: &str) -> Result<String, IdParseError> {
    if value.len() != 64 || !value.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')) {
        return Err(IdParseError::new(format!(
            "invalid sheet id {:?}, expect lowercase hex sha256",
            value
        )));
    }
    Ok(value.to_string())
}

/// Extract the project id from any resource path rooted at `projects/{pid}`.
///
/// Returns `None` for workspace-level paths and for the wildcard project.
pub fn project_of(path: &str) -> Option<ProjectId> {
    let mut parts = path.split('/');
    if parts.next()? != PROJECTS {
        return None;
    }
    ProjectId::parse(parts.next()?).ok()
}

// ============================================================================
// Name types
// ============================================================================

macro_rules! impl_name_traits {
    ($name:ident) => {
        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl $name {
            /// Canonical string form.
            pub fn name(&self) -> String {
                self.to_string()
            }
        }
    };
}

/// `projects/{pid}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProjectName {
    pub project: ProjectId,
}

impl ProjectName {
    pub fn new(project: ProjectId) -> Self {
        Self { project }
    }

    pub fn parse(name: &str) -> Result<Self, IdParseError> {
        let ids = split_ids(name, &[PROJECTS])?;
        Ok(Self {
            project: ProjectId::parse(ids[0])?,
        })
    }
}

impl fmt::Display for ProjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", PROJECTS, self.project)
    }
}
impl_name_traits!(ProjectName);

/// Parent of a list operation: a single project or every project (`projects/-`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProjectParent {
    All,
    Project(ProjectId),
}

impl ProjectParent {
    pub fn parse(name: &str) -> Result<Self, IdParseError> {
        let ids = split_ids(name, &[PROJECTS])?;
        if ids[0] == WILDCARD {
            return Ok(Self::All);
        }
        Ok(Self::Project(ProjectId::parse(ids[0])?))
    }

    pub fn project(&self) -> Option<&ProjectId> {
        match self {
            Self::All => None,
            Self::Project(p) => Some(p),
        }
    }
}

impl fmt::Display for ProjectParent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "{}/{}", PROJECTS, WILDCARD),
            Self::Project(p) => write!(f, "{}/{}", PROJECTS, p),
        }
    }
}
impl_name_traits!(ProjectParent);

/// `projects/{pid}/issues/{uid}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IssueName {
    pub project: ProjectId,
    pub issue: i64,
}

impl IssueName {
    pub fn new(project: ProjectId, issue: i64) -> Self {
        Self { project, issue }
    }

    pub fn parse(name: &str) -> Result<Self, IdParseError> {
        let ids = split_ids(name, &[PROJECTS, ISSUES])?;
        Ok(Self {
            project: ProjectId::parse(ids[0])?,
            issue: parse_uid("issue", ids[1])?,
        })
    }
}

impl fmt::Display for IssueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", PROJECTS, self.project, ISSUES, self.issue)
    }
}
impl_name_traits!(IssueName);

/// `projects/{pid}/issues/{uid}/issueComments/{uid}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IssueCommentName {
    pub project: ProjectId,
    pub issue: i64,
    pub comment: i64,
}

impl IssueCommentName {
    pub fn new(project: ProjectId, issue: i64, comment: i64) -> Self {
        Self {
            project,
            issue,
            comment,
        }
    }

    pub fn parse(name: &str) -> Result<Self, IdParseError> {
        let ids = split_ids(name, &[PROJECTS, ISSUES, ISSUE_COMMENTS])?;
        Ok(Self {
            project: ProjectId::parse(ids[0])?,
            issue: parse_uid("issue", ids[1])?,
            comment: parse_uid("issue comment", ids[2])?,
        })
    }

    pub fn issue_name(&self) -> IssueName {
        IssueName::new(self.project.clone(), self.issue)
    }
}

impl fmt::Display for IssueCommentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}/{}",
            PROJECTS, self.project, ISSUES, self.issue, ISSUE_COMMENTS, self.comment
        )
    }
}
impl_name_traits!(IssueCommentName);

/// `projects/{pid}/plans/{uid}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlanName {
    pub project: ProjectId,
    pub plan: i64,
}

impl PlanName {
    pub fn new(project: ProjectId, plan: i64) -> Self {
        Self { project, plan }
    }

    pub fn parse(name: &str) -> Result<Self, IdParseError> {
        let ids = split_ids(name, &[PROJECTS, PLANS])?;
        Ok(Self {
            project: ProjectId::parse(ids[0])?,
            plan: parse_uid("plan", ids[1])?,
        })
    }
}

impl fmt::Display for PlanName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", PROJECTS, self.project, PLANS, self.plan)
    }
}
impl_name_traits!(PlanName);

/// `projects/{pid}/plans/{uid}/planCheckRuns/{uid}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlanCheckRunName {
    pub project: ProjectId,
    pub plan: i64,
    pub run: i64,
}

impl PlanCheckRunName {
    pub fn new(project: ProjectId, plan: i64, run: i64) -> Self {
        Self { project, plan, run }
    }

    pub fn parse(name: &str) -> Result<Self, IdParseError> {
        let ids = split_ids(name, &[PROJECTS, PLANS, PLAN_CHECK_RUNS])?;
        Ok(Self {
            project: ProjectId::parse(ids[0])?,
            plan: parse_uid("plan", ids[1])?,
            run: parse_uid("plan check run", ids[2])?,
        })
    }
}

impl fmt::Display for PlanCheckRunName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}/{}",
            PROJECTS, self.project, PLANS, self.plan, PLAN_CHECK_RUNS, self.run
        )
    }
}
impl_name_traits!(PlanCheckRunName);

/// `projects/{pid}/rollouts/{uid}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RolloutName {
    pub project: ProjectId,
    pub rollout: i64,
}

impl RolloutName {
    pub fn new(project: ProjectId, rollout: i64) -> Self {
        Self { project, rollout }
    }

    pub fn parse(name: &str) -> Result<Self, IdParseError> {
        let ids = split_ids(name, &[PROJECTS, ROLLOUTS])?;
        Ok(Self {
            project: ProjectId::parse(ids[0])?,
            rollout: parse_uid("rollout", ids[1])?,
        })
    }
}

impl fmt::Display for RolloutName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", PROJECTS, self.project, ROLLOUTS, self.rollout)
    }
}
impl_name_traits!(RolloutName);

/// Stage key: an environment id, or `-` for tasks whose environment is
/// empty or deleted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StageId {
    Environment(EnvironmentId),
    Unassigned,
}

impl StageId {
    pub fn parse(value: &str) -> Result<Self, IdParseError> {
        if value == WILDCARD {
            return Ok(Self::Unassigned);
        }
        Ok(Self::Environment(EnvironmentId::parse(value)?))
    }

    pub fn environment(&self) -> Option<&EnvironmentId> {
        match self {
            Self::Environment(e) => Some(e),
            Self::Unassigned => None,
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Environment(e) => write!(f, "{}", e),
            Self::Unassigned => write!(f, "{}", WILDCARD),
        }
    }
}

impl TryFrom<String> for StageId {
    type Error = IdParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<StageId> for String {
    fn from(value: StageId) -> Self {
        value.to_string()
    }
}

/// `projects/{pid}/rollouts/{uid}/stages/{env|-}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StageName {
    pub project: ProjectId,
    pub rollout: i64,
    pub stage: StageId,
}

impl StageName {
    pub fn new(project: ProjectId, rollout: i64, stage: StageId) -> Self {
        Self {
            project,
            rollout,
            stage,
        }
    }

    pub fn parse(name: &str) -> Result<Self, IdParseError> {
        let ids = split_ids(name, &[PROJECTS, ROLLOUTS, STAGES])?;
        Ok(Self {
            project: ProjectId::parse(ids[0])?,
            rollout: parse_uid("rollout", ids[1])?,
            stage: StageId::parse(ids[2])?,
        })
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}/{}",
            PROJECTS, self.project, ROLLOUTS, self.rollout, STAGES, self.stage
        )
    }
}
impl_name_traits!(StageName);

/// `projects/{pid}/rollouts/{uid}/stages/{env|-}/tasks/{uid}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskName {
    pub project: ProjectId,
    pub rollout: i64,
    pub stage: StageId,
    pub task: i64,
}

impl TaskName {
    pub fn new(project: ProjectId, rollout: i64, stage: StageId, task: i64) -> Self {
        Self {
            project,
            rollout,
            stage,
            task,
        }
    }

    pub fn parse(name: &str) -> Result<Self, IdParseError> {
        let ids = split_ids(name, &[PROJECTS, ROLLOUTS, STAGES, TASKS])?;
        Ok(Self {
            project: ProjectId::parse(ids[0])?,
            rollout: parse_uid("rollout", ids[1])?,
            stage: StageId::parse(ids[2])?,
            task: parse_uid("task", ids[3])?,
        })
    }

    pub fn stage_name(&self) -> StageName {
        StageName::new(self.project.clone(), self.rollout, self.stage.clone())
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}/{}/{}/{}",
            PROJECTS, self.project, ROLLOUTS, self.rollout, STAGES, self.stage, TASKS, self.task
        )
    }
}
impl_name_traits!(TaskName);

/// `projects/{pid}/rollouts/{uid}/stages/{env|-}/tasks/{uid}/taskRuns/{uid}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskRunName {
    pub project: ProjectId,
    pub rollout: i64,
    pub stage: StageId,
    pub task: i64,
    pub task_run: i64,
}

impl TaskRunName {
    pub fn new(task: &TaskName, task_run: i64) -> Self {
        Self {
            project: task.project.clone(),
            rollout: task.rollout,
            stage: task.stage.clone(),
            task: task.task,
            task_run,
        }
    }

    pub fn parse(name: &str) -> Result<Self, IdParseError> {
        let ids = split_ids(name, &[PROJECTS, ROLLOUTS, STAGES, TASKS, TASK_RUNS])?;
        Ok(Self {
            project: ProjectId::parse(ids[0])?,
            rollout: parse_uid("rollout", ids[1])?,
            stage: StageId::parse(ids[2])?,
            task: parse_uid("task", ids[3])?,
            task_run: parse_uid("task run", ids[4])?,
        })
    }

    pub fn task_name(&self) -> TaskName {
        TaskName::new(self.project.clone(), self.rollout, self.stage.clone(), self.task)
    }
}

impl fmt::Display for TaskRunName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}/{}/{}/{}/{}/{}",
            PROJECTS,
            self.project,
            ROLLOUTS,
            self.rollout,
            STAGES,
            self.stage,
            TASKS,
            self.task,
            TASK_RUNS,
            self.task_run
        )
    }
}
impl_name_traits!(TaskRunName);

/// `projects/{pid}/accessGrants/{uid}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccessGrantName {
    pub project: ProjectId,
    pub grant: i64,
}

impl AccessGrantName {
    pub fn new(project: ProjectId, grant: i64) -> Self {
        Self { project, grant }
    }

    pub fn parse(name: &str) -> Result<Self, IdParseError> {
        let ids = split_ids(name, &[PROJECTS, ACCESS_GRANTS])?;
        Ok(Self {
            project: ProjectId::parse(ids[0])?,
            grant: parse_uid("access grant", ids[1])?,
        })
    }
}

impl fmt::Display for AccessGrantName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", PROJECTS, self.project, ACCESS_GRANTS, self.grant)
    }
}
impl_name_traits!(AccessGrantName);

/// `projects/{pid}/sheets/{sha256-hex}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SheetName {
    pub project: ProjectId,
    pub sha256: String,
}

impl SheetName {
    pub fn new(project: ProjectId, sha256: impl Into<String>) -> Self {
        Self {
            project,
            sha256: sha256.into(),
        }
    }

    pub fn parse(name: &str) -> Result<Self, IdParseError> {
        let ids = split_ids(name, &[PROJECTS, SHEETS])?;
        Ok(Self {
            project: ProjectId::parse(ids[0])?,
            sha256: parse_sha256(ids[1])?,
        })
    }
}

impl fmt::Display for SheetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", PROJECTS, self.project, SHEETS, self.sha256)
    }
}
impl_name_traits!(SheetName);

/// `projects/{pid}/releases/{uid}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReleaseName {
    pub project: ProjectId,
    pub release: i64,
}

impl ReleaseName {
    pub fn new(project: ProjectId, release: i64) -> Self {
        Self { project, release }
    }

    pub fn parse(name: &str) -> Result<Self, IdParseError> {
        let ids = split_ids(name, &[PROJECTS, RELEASES])?;
        Ok(Self {
            project: ProjectId::parse(ids[0])?,
            release: parse_uid("release", ids[1])?,
        })
    }
}

impl fmt::Display for ReleaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", PROJECTS, self.project, RELEASES, self.release)
    }
}
impl_name_traits!(ReleaseName);

/// `projects/{pid}/databaseGroups/{gid}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatabaseGroupName {
    pub project: ProjectId,
    pub group: DatabaseGroupId,
}

impl DatabaseGroupName {
    pub fn new(project: ProjectId, group: DatabaseGroupId) -> Self {
        Self { project, group }
    }

    pub fn parse(name: &str) -> Result<Self, IdParseError> {
        let ids = split_ids(name, &[PROJECTS, DATABASE_GROUPS])?;
        Ok(Self {
            project: ProjectId::parse(ids[0])?,
            group: DatabaseGroupId::parse(ids[1])?,
        })
    }
}

impl fmt::Display for DatabaseGroupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", PROJECTS, self.project, DATABASE_GROUPS, self.group)
    }
}
impl_name_traits!(DatabaseGroupName);

/// `instances/{iid}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceName {
    pub instance: InstanceId,
}

impl InstanceName {
    pub fn new(instance: InstanceId) -> Self {
        Self { instance }
    }

    pub fn parse(name: &str) -> Result<Self, IdParseError> {
        let ids = split_ids(name, &[INSTANCES])?;
        Ok(Self {
            instance: InstanceId::parse(ids[0])?,
        })
    }
}

impl fmt::Display for InstanceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", INSTANCES, self.instance)
    }
}
impl_name_traits!(InstanceName);

/// `instances/{iid}/databases/{dbname}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatabaseName {
    pub instance: InstanceId,
    pub database: String,
}

impl DatabaseName {
    pub fn new(instance: InstanceId, database: impl Into<String>) -> Self {
        Self {
            instance,
            database: database.into(),
        }
    }

    pub fn parse(name: &str) -> Result<Self, IdParseError> {
        let ids = split_ids(name, &[INSTANCES, DATABASES])?;
        Ok(Self {
            instance: InstanceId::parse(ids[0])?,
            database: parse_database_name(ids[1])?,
        })
    }
}

impl fmt::Display for DatabaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", INSTANCES, self.instance, DATABASES, self.database)
    }
}
impl_name_traits!(DatabaseName);

/// `environments/{eid}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnvironmentName {
    pub environment: EnvironmentId,
}

impl EnvironmentName {
    pub fn new(environment: EnvironmentId) -> Self {
        Self { environment }
    }

    pub fn parse(name: &str) -> Result<Self, IdParseError> {
        let ids = split_ids(name, &[ENVIRONMENTS])?;
        Ok(Self {
            environment: EnvironmentId::parse(ids[0])?,
        })
    }
}

impl fmt::Display for EnvironmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", ENVIRONMENTS, self.environment)
    }
}
impl_name_traits!(EnvironmentName);

/// A user reference: either the numeric uid or the email.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UserRef {
    Uid(i64),
    Email(String),
}

/// `users/{email-or-uid}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserName {
    pub user: UserRef,
}

impl UserName {
    pub fn email(email: impl Into<String>) -> Self {
        Self {
            user: UserRef::Email(email.into()),
        }
    }

    pub fn uid(uid: i64) -> Self {
        Self {
            user: UserRef::Uid(uid),
        }
    }

    pub fn parse(name: &str) -> Result<Self, IdParseError> {
        let ids = split_ids(name, &[USERS])?;
        let id = ids[0];
        let user = if id.contains('@') {
            UserRef::Email(parse_email(id)?)
        } else {
            UserRef::Uid(parse_uid("user", id)?)
        };
        Ok(Self { user })
    }
}

impl fmt::Display for UserName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.user {
            UserRef::Uid(uid) => write!(f, "{}/{}", USERS, uid),
            UserRef::Email(email) => write!(f, "{}/{}", USERS, email),
        }
    }
}
impl_name_traits!(UserName);

/// `groups/{email}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupName {
    pub email: String,
}

impl GroupName {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
        }
    }

    pub fn parse(name: &str) -> Result<Self, IdParseError> {
        let ids = split_ids(name, &[GROUPS])?;
        Ok(Self {
            email: parse_email(ids[0])?,
        })
    }
}

impl fmt::Display for GroupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", GROUPS, self.email)
    }
}
impl_name_traits!(GroupName);

/// `roles/{rid}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoleName {
    pub role: RoleId,
}

impl RoleName {
    pub fn new(role: RoleId) -> Self {
        Self { role }
    }

    pub fn parse(name: &str) -> Result<Self, IdParseError> {
        let ids = split_ids(name, &[ROLES])?;
        Ok(Self {
            role: RoleId::parse(ids[0])?,
        })
    }
}

impl fmt::Display for RoleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", ROLES, self.role)
    }
}
impl_name_traits!(RoleName);

/// `settings/{name}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SettingName {
    pub setting: String,
}

impl SettingName {
    pub fn new(setting: impl Into<String>) -> Self {
        Self {
            setting: setting.into(),
        }
    }

    pub fn parse(name: &str) -> Result<Self, IdParseError> {
        let ids = split_ids(name, &[SETTINGS])?;
        let setting = ids[0];
        let valid = setting
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_lowercase())
            && setting
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !valid {
            return Err(IdParseError::new(format!("invalid setting name {:?}", setting)));
        }
        Ok(Self {
            setting: setting.to_string(),
        })
    }
}

impl fmt::Display for SettingName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", SETTINGS, self.setting)
    }
}
impl_name_traits!(SettingName);

/// `idps/{iid}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdpName {
    pub idp: IdpId,
}

impl IdpName {
    pub fn parse(name: &str) -> Result<Self, IdParseError> {
        let ids = split_ids(name, &[IDPS])?;
        Ok(Self {
            idp: IdpId::parse(ids[0])?,
        })
    }
}

impl fmt::Display for IdpName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", IDPS, self.idp)
    }
}
impl_name_traits!(IdpName);

/// The workspace root resource, `workspaces/-`.
pub fn workspace_name() -> String {
    format!("{}/{}", WORKSPACES, WILDCARD)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(s: &str) -> ProjectId {
        ProjectId::parse(s).unwrap()
    }

    #[test]
    fn test_issue_name_round_trip() {
        let name = IssueName::new(pid("p1"), 7);
        assert_eq!(name.to_string(), "projects/p1/issues/7");
        assert_eq!(IssueName::parse("projects/p1/issues/7").unwrap(), name);
    }

    #[test]
    fn test_segment_count_mismatch() {
        let err = IssueName::parse("projects/p1/issues").unwrap_err();
        assert!(err.message().contains("segments"));
        assert!(IssueName::parse("projects/p1/issues/7/extra").is_err());
    }

    #[test]
    fn test_keyword_mismatch() {
        let err = IssueName::parse("projects/p1/plans/7").unwrap_err();
        assert!(err.message().contains("expected segment"));
    }

    #[test]
    fn test_empty_id_rejected() {
        let err = ProjectName::parse("projects/").unwrap_err();
        assert!(err.message().contains("empty"));
    }

    #[test]
    fn test_uid_must_be_canonical() {
        assert!(IssueName::parse("projects/p1/issues/007").is_err());
        assert!(IssueName::parse("projects/p1/issues/+7").is_err());
        assert!(IssueName::parse("projects/p1/issues/0").is_err());
        assert!(IssueName::parse("projects/p1/issues/-3").is_err());
    }

    #[test]
    fn test_wildcard_only_for_parent() {
        assert_eq!(ProjectParent::parse("projects/-").unwrap(), ProjectParent::All);
        assert!(ProjectName::parse("projects/-").is_err());
        assert_eq!(ProjectParent::All.to_string(), "projects/-");
    }

    #[test]
    fn test_stage_wildcard() {
        let name = StageName::parse("projects/p1/rollouts/3/stages/-").unwrap();
        assert_eq!(name.stage, StageId::Unassigned);
        let name = StageName::parse("projects/p1/rollouts/3/stages/prod").unwrap();
        assert_eq!(name.stage.environment().unwrap().as_str(), "prod");
    }

    #[test]
    fn test_task_run_name() {
        let raw = "projects/p1/rollouts/3/stages/prod/tasks/11/taskRuns/12";
        let name = TaskRunName::parse(raw).unwrap();
        assert_eq!(name.task, 11);
        assert_eq!(name.task_run, 12);
        assert_eq!(name.to_string(), raw);
        assert_eq!(
            name.task_name().to_string(),
            "projects/p1/rollouts/3/stages/prod/tasks/11"
        );
    }

    #[test]
    fn test_user_name_email_or_uid() {
        let by_email = UserName::parse("users/alice@x").unwrap();
        assert_eq!(by_email.user, UserRef::Email("alice@x".to_string()));
        let by_uid = UserName::parse("users/42").unwrap();
        assert_eq!(by_uid.user, UserRef::Uid(42));
        assert!(UserName::parse("users/a@b@c").is_err());
        assert!(UserName::parse("users/bob").is_err());
    }

    #[test]
    fn test_database_name() {
        let name = DatabaseName::parse("instances/i1/databases/d1").unwrap();
        assert_eq!(name.instance.as_str(), "i1");
        assert_eq!(name.database, "d1");
        assert!(DatabaseName::parse("instances/i1/databases/-").is_err());
    }

    #[test]
    fn test_sheet_name_requires_sha256() {
        let sha = "a".repeat(64);
        let raw = format!("projects/p1/sheets/{}", sha);
        assert_eq!(SheetName::parse(&raw).unwrap().sha256, sha);
        assert!(SheetName::parse("projects/p1/sheets/abc").is_err());
        assert!(SheetName::parse(&format!("projects/p1/sheets/{}", "A".repeat(64))).is_err());
    }

    #[test]
    fn test_project_of() {
        assert_eq!(project_of("projects/p1/issues/3").unwrap().as_str(), "p1");
        assert!(project_of("instances/i1").is_none());
        assert!(project_of("projects/-").is_none());
    }

    #[test]
    fn test_role_and_setting_names() {
        assert_eq!(
            RoleName::parse("roles/projectOwner").unwrap().role.as_str(),
            "projectOwner"
        );
        assert!(SettingName::parse("settings/workspace_approval").is_ok());
        assert!(SettingName::parse("settings/Bad").is_err());
        assert_eq!(workspace_name(), "workspaces/-");
    }
}

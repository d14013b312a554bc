//! Risk level of an issue.
//!
//! The level is the highest level among active risks of the issue's source
//! whose expression holds for at least one target database.

use crate::dbgroup::matched_databases;
use changeflow_db::Store;
use changeflow_ids::{DatabaseName, EnvironmentName, InstanceName, ProjectId};
use changeflow_protocol::{
    ApiError, ApiResult, ChangeTarget, ChangeType, DatabaseGroup, ErrorContext, Issue, IssueType,
    Plan, Risk, RiskLevel, RiskSource, SpecConfig,
};
use changeflow_security::cel::{Activation, CelError, Environment};
use changeflow_security::permission::{ROLE_PROJECT_EXPORTER, ROLE_PROJECT_QUERIER};
use tracing::debug;

pub const RISK_VARIABLES: &[&str] = &[
    "environment_id",
    "project_id",
    "database_name",
    "instance_id",
    "db_engine",
];

/// Source of an issue, derived from its plan, grant request or type.
pub fn risk_source(issue: &Issue, plan: Option<&Plan>) -> RiskSource {
    match issue.issue_type {
        IssueType::DatabaseDataExport => RiskSource::DataExport,
        IssueType::AccessGrant => RiskSource::RequestAccess,
        IssueType::GrantRequest => match issue.payload.grant_request.as_ref().map(|g| g.role.as_str()) {
            Some(ROLE_PROJECT_EXPORTER) => RiskSource::RequestExport,
            Some(ROLE_PROJECT_QUERIER) => RiskSource::RequestQuery,
            _ => RiskSource::Unspecified,
        },
        IssueType::DatabaseChange => {
            let Some(spec) = plan.and_then(|p| p.specs.first()) else {
                return RiskSource::Unspecified;
            };
            match &spec.config {
                SpecConfig::CreateDatabase(_) => RiskSource::CreateDatabase,
                SpecConfig::ChangeDatabase(c) if c.change_type == ChangeType::Data => RiskSource::Dml,
                SpecConfig::ChangeDatabase(_) => RiskSource::Ddl,
                SpecConfig::ExportData(_) => RiskSource::DataExport,
            }
        }
    }
}

fn target_activation(
    project: &ProjectId,
    environment: Option<&str>,
    instance: &str,
    database: &str,
    engine: &str,
) -> Activation {
    let mut act = Activation::new();
    act.insert("project_id", project.as_str())
        .insert("instance_id", instance)
        .insert("database_name", database)
        .insert("db_engine", engine);
    if let Some(env) = environment {
        act.insert("environment_id", env);
    }
    act
}

async fn database_activation(
    store: &Store,
    project: &ProjectId,
    name: &DatabaseName,
) -> ApiResult<Option<Activation>> {
    let Some(db) = store.get_database(name).await.internal_context("get database")? else {
        debug!(database = %name, "Risk target skipped, database not found");
        return Ok(None);
    };
    Ok(Some(target_activation(
        project,
        db.environment.as_ref().map(|e| e.as_str()),
        db.database.instance.as_str(),
        &db.database.name,
        db.engine.as_str(),
    )))
}

async fn plan_activations(
    store: &Store,
    plan: &Plan,
    group: Option<&DatabaseGroup>,
) -> ApiResult<Vec<Activation>> {
    let mut targets = Vec::new();
    for spec in &plan.specs {
        if let SpecConfig::CreateDatabase(config) = &spec.config {
            let instance = InstanceName::parse(&config.target)?;
            let Some(found) = store
                .get_instance(&instance.instance)
                .await
                .internal_context("get instance")?
            else {
                continue;
            };
            let environment = if config.environment.is_empty() {
                found.environment.as_ref().map(|e| e.to_string())
            } else {
                Some(EnvironmentName::parse(&config.environment)?.environment.to_string())
            };
            targets.push(target_activation(
                &plan.project,
                environment.as_deref(),
                found.id.as_str(),
                &config.database,
                found.engine.as_str(),
            ));
            continue;
        }
        for target in spec.config.targets() {
            match ChangeTarget::parse(target)? {
                ChangeTarget::Database(name) => {
                    targets.extend(database_activation(store, &plan.project, &name).await?);
                }
                ChangeTarget::DatabaseGroup(name) => {
                    let group = match group.filter(|g| g.name() == name) {
                        Some(group) => group.clone(),
                        None => store
                            .get_database_group(&name.project, &name.group)
                            .await
                            .internal_context("get database group")?
                            .ok_or_else(|| {
                                ApiError::not_found(format!("database group {} not found", name))
                            })?,
                    };
                    for db in matched_databases(store, &group).await? {
                        targets.push(target_activation(
                            &plan.project,
                            db.environment.as_ref().map(|e| e.as_str()),
                            db.database.instance.as_str(),
                            &db.database.name,
                            db.engine.as_str(),
                        ));
                    }
                }
            }
        }
    }
    Ok(targets)
}

/// One activation per database the issue touches. Issues without
/// databases get a single activation carrying only the project.
pub async fn risk_targets(store: &Store, issue: &Issue, plan: Option<&Plan>) -> ApiResult<Vec<Activation>> {
    let mut targets = match (issue.issue_type, plan) {
        (IssueType::AccessGrant, _) => {
            let grant_uid = issue.payload.access_grant_uid;
            let grant = match grant_uid {
                Some(uid) => store
                    .get_access_grant(uid)
                    .await
                    .internal_context("get access grant")?,
                None => None,
            };
            let mut targets = Vec::new();
            for target in grant.iter().flat_map(|g| g.payload.targets.iter()) {
                if let Ok(name) = DatabaseName::parse(target) {
                    targets.extend(database_activation(store, &issue.project, &name).await?);
                }
            }
            targets
        }
        (_, Some(plan)) => plan_activations(store, plan, None).await?,
        (_, None) => Vec::new(),
    };
    if targets.is_empty() {
        let mut act = Activation::new();
        act.insert("project_id", issue.project.as_str());
        targets.push(act);
    }
    Ok(targets)
}

/// Highest level among active `risks` of `source` matching any target.
pub fn evaluate_risk(risks: &[Risk], source: RiskSource, targets: &[Activation]) -> ApiResult<RiskLevel> {
    let env = Environment::new(RISK_VARIABLES.iter().copied());
    let mut level = RiskLevel::Unspecified;
    for risk in risks
        .iter()
        .filter(|r| r.active && r.source == source && !r.expression.trim().is_empty())
    {
        if risk.level <= level {
            continue;
        }
        let program = env.compile(&risk.expression).map_err(|e| {
            ApiError::internal(format!("failed to compile risk {:?}, error: {}", risk.title, e))
        })?;
        for target in targets {
            match program.eval_bool(target) {
                Ok(true) => {
                    level = risk.level;
                    break;
                }
                Ok(false) => {}
                Err(CelError::NoSuchKey(_)) | Err(CelError::UndeclaredReference(_)) => {}
                Err(e) => {
                    return Err(ApiError::internal(format!(
                        "failed to evaluate risk {:?}, error: {}",
                        risk.title, e
                    )))
                }
            }
        }
    }
    Ok(level)
}

/// Source and level of `issue` under the configured risks.
pub async fn issue_risk(store: &Store, issue: &Issue) -> ApiResult<(RiskSource, RiskLevel)> {
    let plan = match issue.plan_uid {
        Some(uid) => store.get_plan(uid).await.internal_context("get plan")?,
        None => None,
    };
    let source = risk_source(issue, plan.as_ref());
    let risks = store.risks().await.internal_context("get risks")?;
    if !risks.iter().any(|r| r.active && r.source == source) {
        return Ok((source, RiskLevel::Unspecified));
    }
    let targets = risk_targets(store, issue, plan.as_ref()).await?;
    Ok((source, evaluate_risk(&risks, source, &targets)?))
}

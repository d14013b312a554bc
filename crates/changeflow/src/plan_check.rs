//! Plan-check run descriptors derived from a plan.

use crate::dbgroup::matched_databases;
use changeflow_db::{NewPlanCheckRun, Store};
use changeflow_ids::{DatabaseName, ReleaseName, SheetName};
use changeflow_protocol::{
    ApiError, ApiResult, ChangeTarget, DatabaseGroup, ErrorContext, Plan, PlanCheckRunConfig,
    PlanCheckTarget, PlanCheckType, SpecConfig,
};

/// Expands targets into databases; a group target expands to its members.
pub(crate) async fn expand_targets(
    store: &Store,
    targets: &[String],
    group: Option<&DatabaseGroup>,
) -> ApiResult<Vec<DatabaseName>> {
    let mut databases = Vec::new();
    for target in targets {
        match ChangeTarget::parse(target)? {
            ChangeTarget::Database(db) => databases.push(db),
            ChangeTarget::DatabaseGroup(name) => {
                let Some(group) = group.filter(|g| g.name() == name) else {
                    return Err(ApiError::not_found(format!("database group {} not found", name)));
                };
                databases.extend(
                    matched_databases(store, group)
                        .await?
                        .into_iter()
                        .map(|db| db.database.database_name()),
                );
            }
        }
    }
    Ok(databases)
}

/// Sheet hashes a change spec runs: its sheet, or every file of its release.
pub(crate) async fn spec_sheets(store: &Store, plan: &Plan, sheet: Option<&str>, release: Option<&str>) -> ApiResult<Vec<String>> {
    if let Some(sheet) = sheet {
        return Ok(vec![SheetName::parse(sheet)?.sha256]);
    }
    let Some(release) = release else {
        return Ok(Vec::new());
    };
    let name = ReleaseName::parse(release)?;
    let release = store
        .get_release(&plan.project, name.release)
        .await
        .internal_context("get release")?
        .ok_or_else(|| ApiError::not_found(format!("release {} not found", name)))?;
    Ok(release.files.into_iter().map(|f| f.sheet_sha256).collect())
}

/// One descriptor covering every (database, sheet) pair of the plan.
/// Returns `None` when the plan has nothing to check.
pub async fn plan_check_run_from_plan(
    store: &Store,
    plan: &Plan,
    group: Option<&DatabaseGroup>,
) -> ApiResult<Option<NewPlanCheckRun>> {
    let mut targets = Vec::new();
    for spec in &plan.specs {
        match &spec.config {
            SpecConfig::CreateDatabase(_) => {}
            SpecConfig::ChangeDatabase(config) => {
                let mut types = vec![
                    PlanCheckType::StatementAdvise,
                    PlanCheckType::StatementSummaryReport,
                ];
                if config.enable_ghost {
                    types.push(PlanCheckType::GhostSync);
                }
                let sheets =
                    spec_sheets(store, plan, config.sheet.as_deref(), config.release.as_deref())
                        .await?;
                for db in expand_targets(store, &config.targets, group).await? {
                    for sheet in &sheets {
                        targets.push(PlanCheckTarget {
                            database: db.to_string(),
                            sheet_sha256: sheet.clone(),
                            types: types.clone(),
                            change_type: config.change_type,
                            enable_prior_backup: config.enable_prior_backup,
                            ghost_flags: config.ghost_flags.clone(),
                        });
                    }
                }
            }
            SpecConfig::ExportData(config) => {
                let sheet = SheetName::parse(&config.sheet)?.sha256;
                for db in expand_targets(store, &config.targets, group).await? {
                    targets.push(PlanCheckTarget {
                        database: db.to_string(),
                        sheet_sha256: sheet.clone(),
                        types: vec![PlanCheckType::StatementAdvise],
                        change_type: Default::default(),
                        enable_prior_backup: false,
                        ghost_flags: Default::default(),
                    });
                }
            }
        }
    }
    if targets.is_empty() {
        return Ok(None);
    }
    Ok(Some(NewPlanCheckRun {
        project: plan.project.clone(),
        plan_uid: plan.uid,
        config: PlanCheckRunConfig { targets },
    }))
}

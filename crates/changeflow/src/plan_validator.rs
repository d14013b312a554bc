//! Plan spec validation.
//!
//! [`check_structure`] applies the rules that need no lookups: spec ids,
//! one config kind per plan, target kinds and cardinalities, release vs
//! sheet exclusivity. [`validate_plan`] then resolves every referenced
//! resource against the store.

use changeflow_db::Store;
use changeflow_ids::{
    DatabaseGroupName, DatabaseName, InstanceName, ProjectId, ReleaseName, SheetName,
};
use changeflow_protocol::{
    ApiError, ApiResult, ChangeTarget, DatabaseGroup, ErrorContext, Spec, SpecConfig,
};
use std::collections::{BTreeSet, HashSet};

/// References a plan makes, collected by [`check_structure`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanShape {
    pub instance: Option<InstanceName>,
    pub group: Option<DatabaseGroupName>,
    pub databases: Vec<DatabaseName>,
    pub sheets: Vec<SheetName>,
    pub release: Option<ReleaseName>,
}

fn invalid(message: impl Into<String>) -> ApiError {
    ApiError::invalid_argument(message)
}

fn parse_targets(spec: &Spec, targets: &[String], shape: &mut PlanShape, groups: &mut BTreeSet<String>) -> ApiResult<()> {
    if targets.is_empty() {
        return Err(invalid(format!("spec {:?} has no targets", spec.id)));
    }
    let (mut has_db, mut has_group) = (false, false);
    for target in targets {
        match ChangeTarget::parse(target)? {
            ChangeTarget::Database(db) => {
                has_db = true;
                if !shape.databases.contains(&db) {
                    shape.databases.push(db);
                }
            }
            ChangeTarget::DatabaseGroup(group) => {
                has_group = true;
                groups.insert(group.to_string());
                shape.group.get_or_insert(group);
            }
        }
    }
    if has_db && has_group {
        return Err(invalid(
            "found databaseGroupTarget and databaseTarget, expect only one kind",
        ));
    }
    Ok(())
}

fn push_sheet(shape: &mut PlanShape, sheet: &str) -> ApiResult<()> {
    let name = SheetName::parse(sheet)?;
    if !shape.sheets.contains(&name) {
        shape.sheets.push(name);
    }
    Ok(())
}

/// Structural rules, checked in order. The first violation is returned.
pub fn check_structure(specs: &[Spec]) -> ApiResult<PlanShape> {
    if specs.is_empty() {
        return Err(invalid("the plan has zero spec"));
    }
    let mut ids = HashSet::new();
    for spec in specs {
        if spec.id.is_empty() {
            return Err(invalid("spec id cannot be empty"));
        }
        if !ids.insert(spec.id.as_str()) {
            return Err(invalid(format!("found duplicate spec id {:?}", spec.id)));
        }
    }

    let first = specs[0].config.kind_name();
    if let Some(other) = specs.iter().map(|s| s.config.kind_name()).find(|k| *k != first) {
        return Err(invalid(format!(
            "expect one kind of config, found {} and {}",
            first, other
        )));
    }

    let mut shape = PlanShape::default();
    let mut instances = BTreeSet::new();
    let mut groups = BTreeSet::new();
    let mut release_specs = 0usize;
    let mut uses_sheet = false;

    for spec in specs {
        match &spec.config {
            SpecConfig::CreateDatabase(config) => {
                let instance = InstanceName::parse(&config.target)?;
                if config.database.trim().is_empty() {
                    return Err(invalid(format!("spec {:?} has no database name", spec.id)));
                }
                instances.insert(instance.to_string());
                shape.instance.get_or_insert(instance);
            }
            SpecConfig::ChangeDatabase(config) => {
                parse_targets(spec, &config.targets, &mut shape, &mut groups)?;
                match (&config.sheet, &config.release) {
                    (Some(_), Some(_)) => return Err(invalid("expect release or sheet, found both")),
                    (Some(sheet), None) => {
                        uses_sheet = true;
                        push_sheet(&mut shape, sheet)?;
                    }
                    (None, Some(release)) => {
                        let name = ReleaseName::parse(release)?;
                        release_specs += 1;
                        shape.release.get_or_insert(name);
                    }
                    (None, None) => {
                        return Err(invalid(format!(
                            "spec {:?} needs a sheet or a release",
                            spec.id
                        )))
                    }
                }
            }
            SpecConfig::ExportData(config) => {
                parse_targets(spec, &config.targets, &mut shape, &mut groups)?;
                uses_sheet = true;
                push_sheet(&mut shape, &config.sheet)?;
            }
        }
    }

    if instances.len() > 1 {
        return Err(invalid(format!("expect at most one instance, found {}", instances.len())));
    }
    if groups.len() > 1 {
        return Err(invalid(format!(
            "expect at most one database group, found {}",
            groups.len()
        )));
    }
    if !groups.is_empty() && !shape.databases.is_empty() {
        return Err(invalid(
            "found databaseGroupTarget and databaseTarget, expect only one kind",
        ));
    }
    if release_specs > 1 {
        return Err(invalid(format!(
            "expect at most one spec using a release, found {}",
            release_specs
        )));
    }
    if release_specs > 0 && uses_sheet {
        return Err(invalid("expect release or sheet, found both"));
    }
    Ok(shape)
}

/// Validates `specs` for a plan of `project` and returns the database
/// group the plan targets, if any.
pub async fn validate_plan(
    store: &Store,
    project: &ProjectId,
    specs: &[Spec],
) -> ApiResult<Option<DatabaseGroup>> {
    let shape = check_structure(specs)?;

    if let Some(instance) = &shape.instance {
        store
            .get_instance(&instance.instance)
            .await
            .internal_context("get instance")?
            .filter(|i| !i.deleted)
            .ok_or_else(|| ApiError::not_found(format!("instance {} not found", instance)))?;
    }

    for name in &shape.databases {
        let db = store
            .get_database(name)
            .await
            .internal_context("get database")?
            .ok_or_else(|| ApiError::not_found(format!("database {} not found", name)))?;
        if &db.database.project != project {
            return Err(invalid(format!(
                "database {} does not belong to project {}",
                name, project
            )));
        }
    }

    let mut hashes = Vec::with_capacity(shape.sheets.len());
    for sheet in &shape.sheets {
        if &sheet.project != project {
            return Err(invalid(format!(
                "sheet {} does not belong to project {}",
                sheet, project
            )));
        }
        hashes.push(sheet.sha256.clone());
    }
    if !store
        .has_sheets(project, &hashes)
        .await
        .internal_context("check sheets")?
    {
        return Err(ApiError::not_found("some sheets are not found"));
    }

    if let Some(release) = &shape.release {
        if &release.project != project {
            return Err(invalid(format!(
                "release {} does not belong to project {}",
                release, project
            )));
        }
        store
            .get_release(project, release.release)
            .await
            .internal_context("get release")?
            .ok_or_else(|| ApiError::not_found(format!("release {} not found", release)))?;
    }

    let Some(group) = &shape.group else {
        return Ok(None);
    };
    if &group.project != project {
        return Err(invalid(format!(
            "database group {} does not belong to project {}",
            group, project
        )));
    }
    let found = store
        .get_database_group(&group.project, &group.group)
        .await
        .internal_context("get database group")?
        .ok_or_else(|| ApiError::not_found(format!("database group {} not found", group)))?;
    Ok(Some(found))
}

#[cfg(test)]
mod tests {
    use super::*;
    use changeflow_protocol::{
        ChangeDatabaseConfig, Code, CreateDatabaseConfig, ExportDataConfig,
    };

    const SHEET: &str =
        "projects/p1/sheets/2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae";

    fn change(id: &str, targets: &[&str]) -> Spec {
        Spec {
            id: id.into(),
            config: SpecConfig::ChangeDatabase(ChangeDatabaseConfig {
                targets: targets.iter().map(|t| t.to_string()).collect(),
                sheet: Some(SHEET.into()),
                ..Default::default()
            }),
        }
    }

    fn message(specs: &[Spec]) -> String {
        let err = check_structure(specs).unwrap_err();
        assert_eq!(err.code, Code::InvalidArgument);
        err.message
    }

    #[test]
    fn test_valid_change_plan() {
        let shape = check_structure(&[
            change("a", &["instances/i1/databases/d1"]),
            change("b", &["instances/i1/databases/d2", "instances/i1/databases/d1"]),
        ])
        .unwrap();
        assert_eq!(shape.databases.len(), 2);
        assert_eq!(shape.sheets.len(), 1);
        assert!(shape.group.is_none());
    }

    #[test]
    fn test_rules_in_order() {
        assert_eq!(message(&[]), "the plan has zero spec");
        assert!(message(&[change("a", &["instances/i1/databases/d1"]), change("a", &["instances/i1/databases/d1"])])
            .contains("duplicate spec id"));

        let export = Spec {
            id: "e".into(),
            config: SpecConfig::ExportData(ExportDataConfig {
                targets: vec!["instances/i1/databases/d1".into()],
                sheet: SHEET.into(),
                ..Default::default()
            }),
        };
        assert_eq!(
            message(&[change("a", &["instances/i1/databases/d1"]), export]),
            "expect one kind of config, found ChangeDatabaseConfig and ExportDataConfig"
        );

        assert!(message(&[change(
            "a",
            &["instances/i1/databases/d1", "projects/p1/databaseGroups/g1"]
        )])
        .contains("expect only one kind"));

        assert!(message(&[
            change("a", &["projects/p1/databaseGroups/g1"]),
            change("b", &["projects/p1/databaseGroups/g2"]),
        ])
        .contains("at most one database group"));
    }

    #[test]
    fn test_release_and_sheet_exclusive() {
        let release = Spec {
            id: "r".into(),
            config: SpecConfig::ChangeDatabase(ChangeDatabaseConfig {
                targets: vec!["instances/i1/databases/d1".into()],
                release: Some("projects/p1/releases/3".into()),
                ..Default::default()
            }),
        };
        assert!(check_structure(&[release.clone()]).is_ok());

        // Two specs sharing one release still count twice.
        let mut second = release.clone();
        second.id = "r2".into();
        if let SpecConfig::ChangeDatabase(c) = &mut second.config {
            c.targets = vec!["instances/i1/databases/d2".into()];
        }
        assert_eq!(
            message(&[release.clone(), second]),
            "expect at most one spec using a release, found 2"
        );
        assert_eq!(
            message(&[release.clone(), change("s", &["instances/i1/databases/d1"])]),
            "expect release or sheet, found both"
        );

        let mut both = release;
        if let SpecConfig::ChangeDatabase(c) = &mut both.config {
            c.sheet = Some(SHEET.into());
        }
        assert_eq!(message(&[both]), "expect release or sheet, found both");
    }

    #[test]
    fn test_single_instance_for_create() {
        let create = |id: &str, instance: &str| Spec {
            id: id.into(),
            config: SpecConfig::CreateDatabase(CreateDatabaseConfig {
                target: format!("instances/{}", instance),
                database: "db".into(),
                ..Default::default()
            }),
        };
        assert!(check_structure(&[create("a", "i1"), create("b", "i1")]).is_ok());
        assert!(message(&[create("a", "i1"), create("b", "i2")]).contains("at most one instance"));
    }
}

//! Plan files -- the external task source.
//!
//! A TOML plan names the project and its services, each with an ordered
//! task list. Loading a plan materializes a fresh `ExecutionState` plus the
//! per-service task specs the team leads execute.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use foreman_core::lead::TaskSpec;
use foreman_state::records::normalize_service_name;
use foreman_state::{ExecutionState, TaskRecord};

#[derive(Debug, Deserialize)]
pub struct PlanFile {
    pub project: String,
    /// Path to the project-conventions document, relative to the plan file.
    #[serde(default)]
    pub conventions_file: Option<String>,
    /// Path to the business specification, relative to the plan file.
    #[serde(default)]
    pub business_spec_file: Option<String>,
    #[serde(default, rename = "service")]
    pub services: Vec<PlanService>,
}

#[derive(Debug, Deserialize)]
pub struct PlanService {
    pub name: String,
    #[serde(default, rename = "task")]
    pub tasks: Vec<PlanTask>,
}

#[derive(Debug, Deserialize)]
pub struct PlanTask {
    /// Globally unique within the project; generated from the service name
    /// and position when omitted.
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub test_commands: Vec<String>,
}

/// A loaded plan: the fresh execution state plus everything the leads need.
#[derive(Debug)]
pub struct LoadedPlan {
    pub state: ExecutionState,
    pub specs: BTreeMap<String, Vec<TaskSpec>>,
    pub conventions: String,
    pub business_spec: String,
}

/// Parse a plan file and materialize it.
pub fn load_plan(path: &Path) -> Result<LoadedPlan> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read plan file at {}", path.display()))?;
    let plan: PlanFile = toml::from_str(&contents).context("failed to parse plan file")?;

    if plan.project.trim().is_empty() {
        bail!("plan file has an empty project id");
    }
    if plan.services.is_empty() {
        bail!("plan file defines no services");
    }

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    let conventions = read_referenced(base, plan.conventions_file.as_deref())?;
    let business_spec = read_referenced(base, plan.business_spec_file.as_deref())?;

    let mut state = ExecutionState::new(plan.project.trim());
    let mut specs: BTreeMap<String, Vec<TaskSpec>> = BTreeMap::new();

    for service in &plan.services {
        let service_name = normalize_service_name(&service.name);
        if service_name.is_empty() {
            bail!("plan file has a service with an empty name");
        }
        if specs.contains_key(&service_name) {
            bail!("duplicate service {service_name:?} in plan file");
        }
        if service.tasks.is_empty() {
            bail!("service {service_name:?} has no tasks");
        }

        let mut service_specs = Vec::with_capacity(service.tasks.len());
        for (idx, task) in service.tasks.iter().enumerate() {
            let id = task
                .id
                .clone()
                .unwrap_or_else(|| format!("{service_name}-{}", idx + 1));
            if state.tasks.contains_key(&id) {
                bail!("duplicate task id {id:?} in plan file");
            }
            state.add_task(TaskRecord::new(&id, &task.title, &service_name));
            service_specs.push(TaskSpec {
                id,
                title: task.title.clone(),
                description: task.description.clone(),
                test_commands: task.test_commands.clone(),
            });
        }
        specs.insert(service_name, service_specs);
    }

    Ok(LoadedPlan {
        state,
        specs,
        conventions,
        business_spec,
    })
}

fn read_referenced(base: &Path, file: Option<&str>) -> Result<String> {
    match file {
        Some(rel) => {
            let path = base.join(rel);
            std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read referenced file {}", path.display()))
        }
        None => Ok(String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_state::TaskStatus;

    fn write_plan(dir: &Path, contents: &str) -> std::path::PathBuf {
        let path = dir.join("plan.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    const PLAN: &str = r#"
project = "shop"
conventions_file = "CONVENTIONS.md"

[[service]]
name = "Auth"

[[service.task]]
id = "auth-login"
title = "Implement login"
description = "Email and password."
test_commands = ["cargo test -p auth"]

[[service.task]]
title = "Implement logout"

[[service]]
name = "api"

[[service.task]]
title = "Health endpoint"
"#;

    #[test]
    fn load_materializes_state_and_specs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("CONVENTIONS.md"), "be tidy").unwrap();
        let path = write_plan(dir.path(), PLAN);

        let plan = load_plan(&path).unwrap();
        assert_eq!(plan.state.project_id, "shop");
        assert_eq!(plan.conventions, "be tidy");
        assert!(plan.business_spec.is_empty());

        // Service names are normalized; ids are kept or generated.
        assert_eq!(plan.state.services["auth"].task_ids, vec!["auth-login", "auth-2"]);
        assert_eq!(plan.state.services["api"].task_ids, vec!["api-1"]);
        assert_eq!(plan.state.total_tasks, 3);
        assert!(plan
            .state
            .tasks
            .values()
            .all(|t| t.status == TaskStatus::Pending));

        let auth_specs = &plan.specs["auth"];
        assert_eq!(auth_specs[0].test_commands, vec!["cargo test -p auth"]);
        assert_eq!(auth_specs[1].id, "auth-2");
    }

    #[test]
    fn missing_referenced_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_plan(dir.path(), PLAN);
        // CONVENTIONS.md intentionally not written.
        let err = load_plan(&path).unwrap_err();
        assert!(format!("{err:#}").contains("CONVENTIONS.md"));
    }

    #[test]
    fn empty_services_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_plan(dir.path(), "project = \"p\"\n");
        assert!(load_plan(&path).is_err());
    }

    #[test]
    fn duplicate_task_ids_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_plan(
            dir.path(),
            r#"
project = "p"
[[service]]
name = "a"
[[service.task]]
id = "dup"
title = "One"
[[service.task]]
id = "dup"
title = "Two"
"#,
        );
        let err = load_plan(&path).unwrap_err();
        assert!(format!("{err:#}").contains("duplicate task id"));
    }

    #[test]
    fn duplicate_services_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_plan(
            dir.path(),
            r#"
project = "p"
[[service]]
name = "a"
[[service.task]]
title = "One"
[[service]]
name = " A "
[[service.task]]
title = "Two"
"#,
        );
        let err = load_plan(&path).unwrap_err();
        assert!(format!("{err:#}").contains("duplicate service"));
    }
}

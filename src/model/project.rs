//! Project: the root namespace. Owns the data directory that holds every
//! experiment's and trial's files, and points at the selected experiment.

use crate::core::controller::{Controller, Model, field};
use crate::core::error::TauError;
use crate::core::record::{Fields, Keys};
use crate::core::schema::{Attribute, EntityHooks, EntityKind, Referential, Schema};
use crate::core::store::Store;
use serde_json::{Value, json};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{error, info};

pub struct Project;

pub(crate) fn schema() -> Schema {
    Schema::new(
        EntityKind::Project,
        vec![
            Attribute::string("name")
                .primary_key()
                .describe("project name"),
            Attribute::string("prefix")
                .required()
                .describe("storage prefix the project data directory lives under"),
            Attribute::collection("targets", EntityKind::Target, Some("projects"))
                .describe("targets used by this project"),
            Attribute::collection("applications", EntityKind::Application, Some("projects"))
                .describe("applications used by this project"),
            Attribute::collection("measurements", EntityKind::Measurement, Some("projects"))
                .describe("measurements used by this project"),
            Attribute::inverse("experiments", EntityKind::Experiment, "project")
                .describe("experiments formed from this project's configurations"),
            Attribute::model("experiment", EntityKind::Experiment, Referential::Nullify)
                .describe("the currently selected experiment"),
        ],
    )
    .with_hooks(&Project)
}

impl EntityHooks for Project {
    fn on_create(&self, ctrl: &Controller<'_>, model: &Model) -> Result<(), TauError> {
        create_data_dir(ctrl.store(), &Project::prefix(model))
    }

    fn on_delete(&self, ctrl: &Controller<'_>, model: &Model) -> Result<(), TauError> {
        remove_data_dir(ctrl.store(), Project::prefix(model));
        Ok(())
    }
}

/// Remove a directory tree; a tree that is already gone is not an error.
pub(crate) fn remove_tree(path: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Create a record's data directory. A directory this call created is removed
/// again if the enclosing transaction rolls back.
pub(crate) fn create_data_dir(store: &Store, dir: &Path) -> Result<(), TauError> {
    let existed = dir.exists();
    fs::create_dir_all(dir).map_err(|e| {
        TauError::configuration(
            format!("Cannot create directory '{}': {}", dir.display(), e),
            &["Check that you have `write` access"],
        )
    })?;
    if !existed {
        let dir = dir.to_path_buf();
        store.database().on_rollback(move || {
            if let Err(err) = remove_tree(&dir) {
                error!("Could not remove '{}' after rollback: {}", dir.display(), err);
            }
        });
    }
    Ok(())
}

/// Remove a record's data directory once its deletion commits.
pub(crate) fn remove_data_dir(store: &Store, dir: PathBuf) {
    store.database().after_commit(move || {
        if let Err(err) = remove_tree(&dir) {
            error!("Could not remove data at '{}': {}", dir.display(), err);
        }
    });
}

impl Project {
    pub fn controller(store: &Store) -> Controller<'_> {
        Controller::new(EntityKind::Project, store)
    }

    /// Create a project whose data directory lives under the store's prefix.
    pub fn create(store: &Store, name: &str) -> Result<Model, TauError> {
        let mut data = Fields::new();
        data.insert("name".into(), json!(name));
        data.insert("prefix".into(), json!(store.prefix().to_string_lossy()));
        let project = Self::controller(store).create(data)?;
        info!("Created a new project named '{}'", name);
        Ok(project)
    }

    /// Data directory: `<prefix>/<name>`.
    pub fn prefix(project: &Model) -> PathBuf {
        PathBuf::from(project.get_str("prefix").unwrap_or_default()).join(project.name())
    }

    /// The single project in the store.
    pub fn selected(store: &Store) -> Result<Model, TauError> {
        let mut projects = Self::controller(store).all()?;
        match projects.len() {
            0 => Err(TauError::ProjectSelectionError(format!(
                "No project configuration found at '{}'. Run `tau init` first.",
                store.prefix().display()
            ))),
            1 => Ok(projects.remove(0)),
            _ => {
                let names: Vec<String> = projects.iter().map(Model::name).collect();
                Err(TauError::InternalError(format!(
                    "Multiple projects found at '{}': {}",
                    store.prefix().display(),
                    names.join(", ")
                )))
            }
        }
    }

    /// The project's selected experiment.
    pub fn experiment(store: &Store, project: &Model) -> Result<Model, TauError> {
        Self::controller(store)
            .populate_one(project, "experiment")?
            .ok_or_else(|| {
                TauError::ExperimentSelectionError(format!(
                    "No experiment configured for project '{}'. Use `tau experiment create` or \
                     `tau experiment select` to choose one.",
                    project.name()
                ))
            })
    }

    /// Make `experiment` the project's selected experiment.
    pub fn select(store: &Store, project: &Model, experiment: &Model) -> Result<(), TauError> {
        let _lock = store.lock()?;
        if experiment.get_id("project") != Some(project.id()) {
            return Err(TauError::ExperimentSelectionError(format!(
                "{} does not belong to project '{}'",
                experiment,
                project.name()
            )));
        }
        Self::controller(store).update(field("experiment", experiment.id()), project.id(), false)?;
        Ok(())
    }

    /// Add a target, application or measurement to the project's collections.
    pub fn add_member(store: &Store, project: &Model, member: &Model) -> Result<(), TauError> {
        let attr = match member.kind() {
            EntityKind::Target => "targets",
            EntityKind::Application => "applications",
            EntityKind::Measurement => "measurements",
            other => {
                return Err(TauError::ModelError(format!(
                    "{} records cannot be project members",
                    other
                )));
            }
        };
        let ctrl = Self::controller(store);
        let current = ctrl.reload(project.id())?;
        let mut ids = current.get_ids(attr);
        if !ids.contains(&member.id()) {
            ids.push(member.id());
            ctrl.update(field(attr, Value::from(ids)), Keys::ById(project.id()), false)?;
        }
        Ok(())
    }

    /// Delete the project and log, rather than fail on, leftover data.
    pub fn delete(store: &Store, project: &Model) -> Result<(), TauError> {
        let removed = Self::controller(store).delete(project.id(), false)?;
        if removed == 0 {
            error!("Project '{}' was already deleted", project.name());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_makes_data_directory_and_selection_works() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::create(tmp.path()).unwrap();
        assert!(matches!(
            Project::selected(&store).unwrap_err(),
            TauError::ProjectSelectionError(_)
        ));

        let project = Project::create(&store, "p1").unwrap();
        assert!(Project::prefix(&project).is_dir());
        assert_eq!(Project::selected(&store).unwrap().id(), project.id());
        assert!(matches!(
            Project::experiment(&store, &project).unwrap_err(),
            TauError::ExperimentSelectionError(_)
        ));
    }

    #[test]
    fn delete_removes_data_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::create(tmp.path()).unwrap();
        let project = Project::create(&store, "p1").unwrap();
        let prefix = Project::prefix(&project);
        Project::delete(&store, &project).unwrap();
        assert!(!prefix.exists());
        assert_eq!(Project::controller(&store).count().unwrap(), 0);
    }
}

//! Experiment: a (target, application, measurement) triple bound to a project,
//! under which trials are performed.
//!
//! Creating an experiment verifies that its three configurations belong to the
//! project and are mutually compatible. The same verification reruns whenever a
//! configuration an experiment uses is modified, and a configuration whose
//! experiments already hold trials cannot be modified at all.

use crate::core::compat::check_pair;
use crate::core::controller::{Controller, Model, field};
use crate::core::error::TauError;
use crate::core::execute::Executor;
use crate::core::installation::{Environment, InstallRequest, Installer, ToolInstallation};
use crate::core::record::{Fields, Keys};
use crate::core::schema::{Attribute, EntityHooks, EntityKind, Referential, Schema};
use crate::core::store::Store;
use crate::model::project::{Project, create_data_dir, remove_data_dir};
use crate::model::trial::{Trial, parse_launcher_cmd};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub struct Experiment;

/// Topic that collects configuration changes requiring an application rebuild.
pub const REBUILD_TOPIC: &str = "rebuild_required";

const MEMBERS: [(EntityKind, &str); 3] = [
    (EntityKind::Target, "target"),
    (EntityKind::Application, "application"),
    (EntityKind::Measurement, "measurement"),
];

pub(crate) fn schema() -> Schema {
    Schema::new(
        EntityKind::Experiment,
        vec![
            Attribute::string("name")
                .primary_key()
                .describe("experiment name, unique within its project"),
            Attribute::model("project", EntityKind::Project, Referential::Cascade)
                .required()
                .describe("project this experiment belongs to"),
            Attribute::model("target", EntityKind::Target, Referential::Restrict)
                .required()
                .describe("the experiment's target"),
            Attribute::model("application", EntityKind::Application, Referential::Restrict)
                .required()
                .describe("the experiment's application"),
            Attribute::model("measurement", EntityKind::Measurement, Referential::Restrict)
                .required()
                .describe("the experiment's measurement"),
            Attribute::inverse("trials", EntityKind::Trial, "experiment")
                .describe("trials performed in this experiment"),
            Attribute::string("tau_makefile").describe("build configuration file of the installed tooling"),
        ],
    )
    .unique_within("project")
    .with_hooks(&Experiment)
}

impl EntityHooks for Experiment {
    fn on_create(&self, ctrl: &Controller<'_>, model: &Model) -> Result<(), TauError> {
        Experiment::verify(ctrl.store(), model)?;
        create_data_dir(ctrl.store(), &Experiment::prefix(ctrl.store(), model)?)
    }

    fn on_delete(&self, ctrl: &Controller<'_>, model: &Model) -> Result<(), TauError> {
        remove_data_dir(ctrl.store(), Experiment::prefix(ctrl.store(), model)?);
        Ok(())
    }
}

/// Change hook for configuration attributes: queue a rebuild notice when the
/// changed record is part of the selected experiment.
pub(crate) fn rebuild_on_change(
    ctrl: &Controller<'_>,
    model: &Model,
    attr: &str,
    old: &Value,
    new: &Value,
) -> Result<(), TauError> {
    let Some(link) = member_attribute(model.kind()) else {
        return Ok(());
    };
    let Some(selected) = selected_experiment(ctrl.store())? else {
        return Ok(());
    };
    if selected.get_id(link) == Some(model.id()) {
        let mut change = serde_json::Map::new();
        change.insert(attr.to_string(), json!([old, new]));
        ctrl.push_to_topic(REBUILD_TOPIC, Value::Object(change));
    }
    Ok(())
}

/// Reject a change to a configuration used by experiments with trials, and
/// re-verify every other experiment that uses it.
pub(crate) fn verify_users(store: &Store, model: &Model) -> Result<(), TauError> {
    let Some(link) = member_attribute(model.kind()) else {
        return Ok(());
    };
    let users = Controller::new(EntityKind::Experiment, store).search(Keys::by_field(link, model.id()), false)?;
    let trials = Trial::controller(store);
    let mut locked = Vec::new();
    for user in &users {
        if trials.exists(Keys::by_field("experiment", user.id()))? {
            locked.push(user.name());
        }
    }
    if !locked.is_empty() {
        return Err(TauError::ImmutableRecordError(format!(
            "{} cannot be modified because it is used by these experiments: {}",
            model,
            locked.join(", ")
        )));
    }
    for user in &users {
        Experiment::verify(store, user).map_err(|err| {
            TauError::IncompatibleRecordError(format!(
                "Changing {} in this way will create an invalid condition in experiment '{}':\n    {}",
                model,
                user.name(),
                err
            ))
        })?;
    }
    Ok(())
}

fn member_attribute(kind: EntityKind) -> Option<&'static str> {
    MEMBERS
        .iter()
        .find(|(member, _)| *member == kind)
        .map(|(_, attr)| *attr)
}

fn selected_experiment(store: &Store) -> Result<Option<Model>, TauError> {
    let Ok(project) = Project::selected(store) else {
        return Ok(None);
    };
    match project.get_id("experiment") {
        Some(id) => Controller::new(EntityKind::Experiment, store).one(Keys::ById(id)),
        None => Ok(None),
    }
}

/// Stored fields with every schema default filled in.
fn with_defaults(model: &Model) -> Fields {
    let mut fields = model.fields().clone();
    for attr in &model.schema().attributes {
        if model.get(attr.name).is_none() {
            if let Some(default) = attr.default_json() {
                fields.insert(attr.name.to_string(), default);
            }
        }
    }
    fields
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(text) => format!("'{}'", text),
        Value::Array(items) => {
            let items: Vec<String> = items
                .iter()
                .map(|item| match item {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                })
                .collect();
            format!("[{}]", items.join(", "))
        }
        other => other.to_string(),
    }
}

impl Experiment {
    /// Controller restricted to the selected project's experiments.
    pub fn controller(store: &Store) -> Result<Controller<'_>, TauError> {
        let project = Project::selected(store)?;
        Ok(Controller::new(EntityKind::Experiment, store).scoped("project", json!(project.id())))
    }

    /// Create an experiment in the selected project.
    pub fn create(
        store: &Store,
        name: &str,
        target: &Model,
        application: &Model,
        measurement: &Model,
    ) -> Result<Model, TauError> {
        let mut data = Fields::new();
        data.insert("name".into(), json!(name));
        data.insert("target".into(), json!(target.id()));
        data.insert("application".into(), json!(application.id()));
        data.insert("measurement".into(), json!(measurement.id()));
        let experiment = Self::controller(store)?.create(data)?;
        info!("Created a new experiment named '{}'", name);
        Ok(experiment)
    }

    /// Select the named experiment of the selected project.
    pub fn select(store: &Store, name: &str) -> Result<Model, TauError> {
        let project = Project::selected(store)?;
        let mut found = Self::controller(store)?.search(Keys::by_field("name", name), false)?;
        match found.len() {
            0 => Err(TauError::ExperimentSelectionError(format!(
                "There is no experiment named '{}' in project '{}'.",
                name,
                project.name()
            ))),
            1 => {
                let experiment = found.remove(0);
                Project::select(store, &project, &experiment)?;
                Ok(experiment)
            }
            _ => Err(TauError::InternalError(format!(
                "More than one experiment named '{}' in project '{}'",
                name,
                project.name()
            ))),
        }
    }

    /// Drain queued configuration changes into a user-facing notice, or an
    /// empty string when nothing changed.
    pub fn rebuild_required(store: &Store) -> String {
        let changes = store.pop_topic(REBUILD_TOPIC);
        if changes.is_empty() {
            return String::new();
        }
        let mut lines = vec!["Application rebuild required:".to_string()];
        for change in &changes {
            let Some(change) = change.as_object() else {
                continue;
            };
            for (attr, pair) in change {
                let old = &pair[0];
                let new = &pair[1];
                let line = if old.is_null() {
                    format!("  - {} is now set to {}", attr, render_value(new))
                } else if new.is_null() {
                    format!("  - {} is now unset", attr)
                } else {
                    format!("  - {} changed from {} to {}", attr, render_value(old), render_value(new))
                };
                lines.push(line);
            }
        }
        lines.join("\n")
    }

    /// Data directory: `<project prefix>/<experiment name>`.
    pub fn prefix(store: &Store, experiment: &Model) -> Result<PathBuf, TauError> {
        let project = Controller::new(EntityKind::Experiment, store)
            .populate_one(experiment, "project")?
            .ok_or_else(|| TauError::InternalError(format!("{} has no project", experiment)))?;
        Ok(Project::prefix(&project).join(experiment.name()))
    }

    /// Check project membership and pairwise compatibility of the
    /// experiment's target, application and measurement.
    pub fn verify(store: &Store, experiment: &Model) -> Result<(), TauError> {
        let ctrl = Controller::new(EntityKind::Experiment, store);
        let project = ctrl
            .populate_one(experiment, "project")?
            .ok_or_else(|| TauError::InternalError(format!("{} has no project", experiment)))?;
        let mut members = Vec::with_capacity(MEMBERS.len());
        for (kind, attr) in MEMBERS {
            let member = ctrl.populate_one(experiment, attr)?.ok_or_else(|| {
                TauError::InternalError(format!("{} has no {}", experiment, kind.name().to_lowercase()))
            })?;
            if !member.get_ids("projects").contains(&project.id()) {
                return Err(TauError::IncompatibleRecordError(format!(
                    "{} is not a member of project configuration '{}'.",
                    member,
                    project.name()
                )));
            }
            members.push(member);
        }
        for (idx, lhs) in members.iter().enumerate() {
            for rhs in &members[idx + 1..] {
                check_pair(lhs, rhs)?;
            }
        }
        debug!("{} verified", experiment);
        Ok(())
    }

    /// Sum of the data sizes of every trial.
    pub fn data_size(store: &Store, experiment: &Model) -> Result<u64, TauError> {
        let trials = Trial::controller(store).search(Keys::by_field("experiment", experiment.id()), false)?;
        Ok(trials
            .iter()
            .filter_map(|trial| trial.get("data_size").and_then(Value::as_u64))
            .sum())
    }

    /// Smallest trial number not used by any trial of the experiment.
    pub fn next_trial_number(store: &Store, experiment: &Model) -> Result<u64, TauError> {
        let trials = Trial::controller(store).search(Keys::by_field("experiment", experiment.id()), false)?;
        let mut used: Vec<u64> = trials
            .iter()
            .filter_map(|trial| trial.get("number").and_then(Value::as_u64))
            .collect();
        used.sort_unstable();
        let mut next = 0;
        for number in used {
            if number == next {
                next += 1;
            } else if number > next {
                break;
            }
        }
        Ok(next)
    }

    /// Make sure the tooling for this experiment is installed and record its
    /// build configuration.
    pub fn configure(
        store: &Store,
        experiment: &Model,
        installer: &dyn Installer,
    ) -> Result<Box<dyn ToolInstallation>, TauError> {
        let _lock = store.lock()?;
        let ctrl = Controller::new(EntityKind::Experiment, store);
        let populated = ctrl.populate(experiment, None, false)?;
        let member = |attr: &str| {
            populated
                .one(attr)
                .map(with_defaults)
                .ok_or_else(|| TauError::InternalError(format!("{} has no {}", experiment, attr)))
        };
        let request = InstallRequest {
            target: member("target")?,
            application: member("application")?,
            measurement: member("measurement")?,
        };
        let installation = installer.ensure_installed(&request)?;
        if !request.baseline() {
            if let Some(makefile) = installation.makefile() {
                if experiment.get_str("tau_makefile") != Some(makefile.as_str()) {
                    ctrl.update(field("tau_makefile", makefile), experiment.id(), false)?;
                }
            }
        }
        Ok(installation)
    }

    /// Build the application with the experiment's compile-time configuration.
    /// Returns the compiler's exit code.
    pub fn managed_build(
        store: &Store,
        experiment: &Model,
        installer: &dyn Installer,
        executor: &dyn Executor,
        compiler_cmd: &[String],
        cwd: &Path,
    ) -> Result<i32, TauError> {
        let compiler = compiler_cmd.first().ok_or_else(|| {
            TauError::configuration("No compiler command given", &["Specify a compiler, e.g. `tau gcc -c hello.c`"])
        })?;
        let installation = Self::configure(store, experiment, installer)?;
        let target = Controller::new(EntityKind::Experiment, store)
            .populate_one(experiment, "target")?
            .ok_or_else(|| TauError::InternalError(format!("{} has no target", experiment)))?;
        let configured: Vec<&str> = ["cc", "cxx", "fc"]
            .into_iter()
            .filter_map(|attr| target.get_str(attr))
            .collect();
        let given = Path::new(compiler)
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| compiler.clone());
        let matches = configured.iter().any(|known| {
            *known == compiler.as_str()
                || Path::new(known).file_name().is_some_and(|name| name.to_string_lossy() == given)
        });
        if !configured.is_empty() && !matches {
            warn!(
                "'{}' is not one of the compilers configured in {} ({}). The build may not be measured correctly.",
                compiler,
                target,
                configured.join(", ")
            );
        }
        let mut env = Environment::new();
        installation.apply_compile_time_config(&mut env)?;
        let execution = executor.execute(compiler_cmd, cwd, &env).map_err(|err| {
            TauError::configuration(err.to_string(), &["Check that the compiler command is correct"])
        })?;
        Ok(execution.exit_code)
    }

    /// Run `cmd` as a new trial with the experiment's run-time configuration.
    pub fn managed_run(
        store: &Store,
        experiment: &Model,
        installer: &dyn Installer,
        executor: &dyn Executor,
        cmd: &[String],
        cwd: &Path,
        description: Option<&str>,
    ) -> Result<Model, TauError> {
        let installation = Self::configure(store, experiment, installer)?;
        let mut env = Environment::new();
        installation.apply_run_time_config(&mut env)?;
        let (launcher, application_cmds) = parse_launcher_cmd(cmd)?;
        let full_cmd = if application_cmds.is_empty() {
            launcher
        } else {
            installation.application_command(&launcher, &application_cmds)
        };
        Trial::perform(store, experiment, &full_cmd, cwd, env, description, executor)
    }

    /// The trials with the given numbers, or the most recent trial when
    /// `numbers` is empty.
    pub fn trials(store: &Store, experiment: &Model, numbers: &[u64]) -> Result<Vec<Model>, TauError> {
        let ctrl = Trial::controller(store);
        if !numbers.is_empty() {
            let mut found = Vec::with_capacity(numbers.len());
            for number in numbers {
                let mut keys = Fields::new();
                keys.insert("experiment".into(), json!(experiment.id()));
                keys.insert("number".into(), json!(number));
                let trial = ctrl.one(keys)?.ok_or_else(|| {
                    TauError::configuration(
                        format!("Experiment '{}' has no trial with number {}", experiment.name(), number),
                        &[],
                    )
                })?;
                found.push(trial);
            }
            return Ok(found);
        }
        let all = ctrl.search(Keys::by_field("experiment", experiment.id()), false)?;
        let latest = all
            .into_iter()
            .max_by(|a, b| {
                let key = |t: &Model| (t.get_str("begin_time").unwrap_or_default().to_string(), t.id());
                key(a).cmp(&key(b))
            })
            .ok_or_else(|| {
                TauError::configuration(format!("No trials in experiment {}", experiment.name()), &[])
            })?;
        Ok(vec![latest])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebuild_notice_formats_each_kind_of_change() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::create(tmp.path()).unwrap();
        assert_eq!(Experiment::rebuild_required(&store), "");

        store.push_to_topic(REBUILD_TOPIC, json!({"mpi": [false, true]}));
        store.push_to_topic(REBUILD_TOPIC, json!({"select_file": [null, "select.tau"]}));
        store.push_to_topic(REBUILD_TOPIC, json!({"metrics": [["TIME"], null]}));
        let notice = Experiment::rebuild_required(&store);
        assert_eq!(
            notice,
            "Application rebuild required:\n  \
             - mpi changed from false to true\n  \
             - select_file is now set to 'select.tau'\n  \
             - metrics is now unset"
        );
        assert_eq!(Experiment::rebuild_required(&store), "");
    }

    #[test]
    fn render_value_quotes_strings_and_flattens_lists() {
        assert_eq!(render_value(&json!("x")), "'x'");
        assert_eq!(render_value(&json!(["TIME", "PAPI_FP_INS"])), "[TIME, PAPI_FP_INS]");
        assert_eq!(render_value(&json!(3)), "3");
    }
}

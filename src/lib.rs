//! taucmdr: project, experiment and trial bookkeeping for performance measurement.
//!
//! A project directory holds a `.tau/` storage: one JSON record database, an
//! interprocess lock file, an optional `config.toml`, and the data directories
//! of every experiment and trial.
//!
//! # Architecture
//!
//! - **Storage** ([`core::database`]): tables of JSON records with nested,
//!   all-or-nothing transactions.
//! - **Schema** ([`core::schema`]): declarative attribute descriptors per entity,
//!   including relationships, defaults, change hooks and compatibility rules.
//! - **Controllers** ([`core::controller`]): schema-enforcing CRUD under the
//!   store lock. Uniqueness, referential policy, mirrored collections and
//!   lifecycle hooks all live here.
//! - **Models** ([`model`]): Project, Target, Application, Measurement,
//!   Experiment and Trial.
//!
//! External tools are reached only through two capabilities: an
//! [`core::execute::Executor`] that runs a command and reports its exit status,
//! and an [`core::installation::Installer`] that prepares the measurement tooling.
//!
//! # Examples
//!
//! ```bash
//! tau init demo
//! tau application edit demo --mpi true
//! tau trial create -- ./a.out
//! tau trial list
//! ```

pub mod core;
pub mod model;

mod cli;

use crate::cli::{
    ApplicationCommand, ApplicationFlags, Cli, Command, ExperimentCommand, MeasurementCommand,
    MeasurementFlags, TargetCommand, TargetFlags, TrialCommand,
};
use crate::core::config::LOG_ENV;
use crate::core::controller::{Controller, Model};
use crate::core::error::TauError;
use crate::core::execute::SubprocessExecutor;
use crate::core::installation::HostInstaller;
use crate::core::output::{fit_cell, human_size, render_table};
use crate::core::record::{Fields, Keys};
use crate::core::schema::{EntityKind, schema_json};
use crate::core::store::{Store, find_project_root};
use crate::model::{Application, Experiment, Measurement, Project, Target, Trial};

use clap::Parser;
use serde_json::{Value, json};
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Launch events are appended here, inside the storage prefix.
const EVENT_LOG: &str = "events.jsonl";
/// Leading hex digits of a trial digest shown in listings.
const DIGEST_CHARS: usize = 12;

fn init_logging(default_filter: &str) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .try_init();
}

fn put<V: Into<Value>>(data: &mut Fields, name: &str, value: Option<V>) {
    if let Some(value) = value {
        data.insert(name.to_string(), value.into());
    }
}

fn target_fields(flags: TargetFlags) -> Fields {
    let mut data = Fields::new();
    put(&mut data, "cc", flags.cc);
    put(&mut data, "cxx", flags.cxx);
    put(&mut data, "fc", flags.fc);
    put(&mut data, "tau_source", flags.tau_source);
    put(&mut data, "pdt_source", flags.pdt_source);
    put(&mut data, "binutils_source", flags.binutils_source);
    put(&mut data, "libunwind_source", flags.libunwind_source);
    put(&mut data, "papi_source", flags.papi_source);
    put(&mut data, "cuda_toolkit", flags.cuda_toolkit);
    data
}

fn application_fields(flags: ApplicationFlags) -> Fields {
    let mut data = Fields::new();
    put(&mut data, "openmp", flags.openmp);
    put(&mut data, "pthreads", flags.pthreads);
    put(&mut data, "mpi", flags.mpi);
    put(&mut data, "cuda", flags.cuda);
    put(&mut data, "opencl", flags.opencl);
    put(&mut data, "shmem", flags.shmem);
    put(&mut data, "mpc", flags.mpc);
    put(&mut data, "linkage", flags.linkage);
    put(
        &mut data,
        "select_file",
        flags.select_file.map(|p| p.to_string_lossy().to_string()),
    );
    data
}

fn measurement_fields(flags: MeasurementFlags) -> Fields {
    let mut data = Fields::new();
    put(&mut data, "profile", flags.profile);
    put(&mut data, "trace", flags.trace);
    put(&mut data, "sample", flags.sample);
    put(&mut data, "source_inst", flags.source_inst);
    put(&mut data, "compiler_inst", flags.compiler_inst);
    put(&mut data, "mpi", flags.mpi);
    put(&mut data, "openmp", flags.openmp);
    put(&mut data, "cuda", flags.cuda);
    put(&mut data, "opencl", flags.opencl);
    put(&mut data, "shmem", flags.shmem);
    put(&mut data, "callpath", flags.callpath);
    put(&mut data, "metrics", flags.metrics);
    put(&mut data, "keep_inst_files", flags.keep_inst_files);
    put(&mut data, "baseline", flags.baseline);
    put(&mut data, "throttle", flags.throttle);
    data
}

/// Create a configuration record as a member of `project`.
fn create_member(
    ctrl: &Controller<'_>,
    project: &Model,
    name: &str,
    mut data: Fields,
) -> Result<Model, TauError> {
    use colored::Colorize;
    data.insert("name".into(), json!(name));
    data.insert("projects".into(), json!([project.id()]));
    let model = ctrl.create(data)?;
    println!("{} Created {}", "✓".bright_green(), model.to_string().bright_white());
    Ok(model)
}

fn edit(store: &Store, ctrl: &Controller<'_>, name: &str, data: Fields) -> Result<(), TauError> {
    use colored::Colorize;
    let model = ctrl.by_name(name)?;
    if data.is_empty() {
        println!("{} Nothing to change", "▸".bright_yellow());
        return Ok(());
    }
    ctrl.update(data, model.id(), false)?;
    println!("{} Updated {}", "✓".bright_green(), model.to_string().bright_white());
    report_rebuild(store);
    Ok(())
}

fn delete(ctrl: &Controller<'_>, name: &str) -> Result<(), TauError> {
    use colored::Colorize;
    let model = ctrl.by_name(name)?;
    ctrl.delete(model.id(), false)?;
    println!("{} Deleted {}", "✓".bright_green(), model.to_string().bright_white());
    Ok(())
}

fn report_rebuild(store: &Store) {
    use colored::Colorize;
    let notice = Experiment::rebuild_required(store);
    if !notice.is_empty() {
        println!("{}", notice.bright_yellow());
    }
}

fn list(ctrl: &Controller<'_>, columns: &[&str]) -> Result<(), TauError> {
    let mut headers = vec!["name"];
    headers.extend_from_slice(columns);
    let rows: Vec<Vec<String>> = ctrl
        .all()?
        .iter()
        .map(|model| {
            let mut row = vec![model.name()];
            for column in columns {
                row.push(cell(model.get_or_default(column).as_ref()));
            }
            row
        })
        .collect();
    if rows.is_empty() {
        println!("No {} records", ctrl.kind());
        return Ok(());
    }
    println!("{}", render_table(&headers, &rows, 40));
    Ok(())
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => fit_cell(text, 40),
        Some(Value::Array(items)) => {
            let items: Vec<String> = items.iter().map(|item| cell(Some(item))).collect();
            items.join(",")
        }
        Some(other) => other.to_string(),
    }
}

fn init(cwd: &Path, name: &str, target_name: Option<String>, application_name: Option<String>) -> Result<(), TauError> {
    use colored::Colorize;
    if find_project_root(cwd).is_ok_and(|root| root == cwd) {
        return Err(TauError::configuration(
            format!("A project already exists in '{}'", cwd.display()),
            &["Use `tau dashboard` to see it"],
        ));
    }
    let store = Store::create(cwd)?;
    let project = Project::create(&store, name)?;
    println!("{} Created project {}", "✓".bright_green(), name.bright_white().bold());

    let target_name =
        target_name.unwrap_or_else(|| format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH));
    let application_name = application_name.unwrap_or_else(|| name.to_string());
    let target = create_member(&Target::controller(&store), &project, &target_name, Fields::new())?;
    let application = create_member(&Application::controller(&store), &project, &application_name, Fields::new())?;
    let measurements = Measurement::controller(&store);
    let mut baseline = Fields::new();
    baseline.insert("baseline".into(), json!(true));
    baseline.insert("profile".into(), json!("none"));
    create_member(&measurements, &project, "baseline", baseline)?;
    let profile = create_member(&measurements, &project, "profile", Fields::new())?;

    let experiment_name = format!("{}-{}", application_name, profile.name());
    let experiment = Experiment::create(&store, &experiment_name, &target, &application, &profile)?;
    Experiment::select(&store, &experiment.name())?;
    println!("{} Selected {}", "●".bright_green(), experiment.to_string().bright_white());
    Ok(())
}

fn dashboard(store: &Store) -> Result<(), TauError> {
    use colored::Colorize;
    let project = Project::selected(store)?;
    let selected = project.get_id("experiment");
    println!("{} {}", "Project".bright_cyan().bold(), project.name().bright_white().bold());
    for (kind, attr) in [
        (EntityKind::Target, "targets"),
        (EntityKind::Application, "applications"),
        (EntityKind::Measurement, "measurements"),
    ] {
        let members = Project::controller(store).populate_many(&project, attr)?;
        let names: Vec<String> = members.iter().map(Model::name).collect();
        println!("  {:<13} {}", format!("{}s", kind).bright_black(), names.join(", "));
    }
    let experiments = Project::controller(store).populate_many(&project, "experiments")?;
    if experiments.is_empty() {
        println!("No experiments");
        return Ok(());
    }
    let mut rows = Vec::with_capacity(experiments.len());
    for experiment in &experiments {
        let trials = Trial::controller(store).search(Keys::by_field("experiment", experiment.id()), false)?;
        let marker = if Some(experiment.id()) == selected { "*" } else { "" };
        rows.push(vec![
            format!("{}{}", marker, experiment.name()),
            trials.len().to_string(),
            human_size(Experiment::data_size(store, experiment)?),
        ]);
    }
    println!("{}", render_table(&["experiment", "trials", "data size"], &rows, 40));
    Ok(())
}

fn trials(store: &Store, command: TrialCommand) -> Result<(), TauError> {
    use colored::Colorize;
    let project = Project::selected(store)?;
    let experiment = Project::experiment(store, &project)?;
    let ctrl = Trial::controller(store);
    match command {
        TrialCommand::Create { description, cmd } => {
            let cwd = std::env::current_dir()?;
            let executor = SubprocessExecutor::with_event_log(store.prefix().join(EVENT_LOG));
            let trial = Experiment::managed_run(
                store,
                &experiment,
                &HostInstaller,
                &executor,
                &cmd,
                &cwd,
                description.as_deref(),
            )?;
            println!(
                "{} Trial {} of {} {}",
                "✓".bright_green(),
                trial.name().bright_white().bold(),
                experiment,
                trial.get_str("phase").unwrap_or_default()
            );
        }
        TrialCommand::List => {
            let mut found = ctrl.search(Keys::by_field("experiment", experiment.id()), false)?;
            found.sort_by_key(|trial| trial.get_i64("number"));
            let mut rows: Vec<Vec<String>> = Vec::with_capacity(found.len());
            for trial in &found {
                let mut digest = trial.hash_digest()?;
                digest.truncate(DIGEST_CHARS);
                rows.push(vec![
                    trial.name(),
                    digest,
                    cell(trial.get("phase")),
                    cell(trial.get("return_code")),
                    human_size(trial.get("data_size").and_then(Value::as_u64).unwrap_or(0)),
                    cell(trial.get("begin_time")),
                    cell(trial.get("command")),
                ]);
            }
            if rows.is_empty() {
                println!("No trials in {}", experiment);
                return Ok(());
            }
            println!(
                "{}",
                render_table(
                    &["number", "digest", "phase", "return code", "data size", "begin time", "command"],
                    &rows,
                    40
                )
            );
        }
        TrialCommand::Delete { number } => {
            let trial = Experiment::trials(store, &experiment, &[number])?.remove(0);
            ctrl.delete(trial.id(), false)?;
            println!("{} Deleted trial {} of {}", "✓".bright_green(), number, experiment);
        }
    }
    Ok(())
}

pub fn run() -> Result<(), TauError> {
    let cli = Cli::parse();
    let current_dir = std::env::current_dir()?;
    let store = match &cli.command {
        Command::Init { .. } | Command::Schema { .. } => None,
        _ => Some(Store::find(&current_dir)?),
    };
    init_logging(store.as_ref().map_or("info", |s| s.config().log_filter.as_str()));

    let Some(store) = store else {
        return match cli.command {
            Command::Init {
                project,
                target_name,
                application_name,
            } => init(&current_dir, &project, target_name, application_name),
            Command::Schema { entity } => {
                let kind = EntityKind::from_name(&entity).ok_or_else(|| {
                    TauError::configuration(
                        format!("Unknown entity '{}'", entity),
                        &["Choose one of Project, Target, Application, Measurement, Experiment, Trial"],
                    )
                })?;
                println!("{}", serde_json::to_string_pretty(&schema_json(kind))?);
                Ok(())
            }
            _ => Err(TauError::InternalError("command requires a project store".to_string())),
        };
    };

    match cli.command {
        Command::Target(target) => {
            let ctrl = Target::controller(&store);
            match target.command {
                TargetCommand::Create { name, flags } => {
                    create_member(&ctrl, &Project::selected(&store)?, &name, target_fields(flags))?;
                }
                TargetCommand::Edit { name, flags } => edit(&store, &ctrl, &name, target_fields(flags))?,
                TargetCommand::Delete { name } => delete(&ctrl, &name)?,
                TargetCommand::List => list(&ctrl, &["host_os", "host_arch", "cc", "cxx", "fc"])?,
            }
        }
        Command::Application(application) => {
            let ctrl = Application::controller(&store);
            match application.command {
                ApplicationCommand::Create { name, flags } => {
                    create_member(&ctrl, &Project::selected(&store)?, &name, application_fields(flags))?;
                }
                ApplicationCommand::Edit { name, flags } => {
                    edit(&store, &ctrl, &name, application_fields(flags))?
                }
                ApplicationCommand::Delete { name } => delete(&ctrl, &name)?,
                ApplicationCommand::List => {
                    list(&ctrl, &["openmp", "pthreads", "mpi", "cuda", "opencl", "shmem", "linkage"])?
                }
            }
        }
        Command::Measurement(measurement) => {
            let ctrl = Measurement::controller(&store);
            match measurement.command {
                MeasurementCommand::Create { name, flags } => {
                    create_member(&ctrl, &Project::selected(&store)?, &name, measurement_fields(flags))?;
                }
                MeasurementCommand::Edit { name, flags } => {
                    edit(&store, &ctrl, &name, measurement_fields(flags))?
                }
                MeasurementCommand::Delete { name } => delete(&ctrl, &name)?,
                MeasurementCommand::List => {
                    list(&ctrl, &["profile", "trace", "sample", "source_inst", "mpi", "metrics"])?
                }
            }
        }
        Command::Experiment(experiment) => {
            use colored::Colorize;
            let ctrl = Experiment::controller(&store)?;
            match experiment.command {
                ExperimentCommand::Create {
                    name,
                    target,
                    application,
                    measurement,
                } => {
                    let target = Target::controller(&store).by_name(&target)?;
                    let application = Application::controller(&store).by_name(&application)?;
                    let measurement = Measurement::controller(&store).by_name(&measurement)?;
                    let created = Experiment::create(&store, &name, &target, &application, &measurement)?;
                    Experiment::select(&store, &name)?;
                    println!("{} Created and selected {}", "✓".bright_green(), created.to_string().bright_white());
                }
                ExperimentCommand::Select { name } => {
                    let selected = Experiment::select(&store, &name)?;
                    println!("{} Selected {}", "●".bright_green(), selected.to_string().bright_white());
                }
                ExperimentCommand::Delete { name } => delete(&ctrl, &name)?,
                ExperimentCommand::List => list(&ctrl, &["tau_makefile"])?,
            }
        }
        Command::Trial(trial) => trials(&store, trial.command)?,
        Command::Build { cmd } => {
            let project = Project::selected(&store)?;
            let experiment = Project::experiment(&store, &project)?;
            let executor = SubprocessExecutor::with_event_log(store.prefix().join(EVENT_LOG));
            let code = Experiment::managed_build(&store, &experiment, &HostInstaller, &executor, &cmd, &current_dir)?;
            if code != 0 {
                return Err(TauError::configuration(
                    format!("Compiler exited with status {}", code),
                    &["Check the compiler output for error messages"],
                ));
            }
        }
        Command::Dashboard => dashboard(&store)?,
        Command::Init { .. } | Command::Schema { .. } => {}
    }
    Ok(())
}

//! Trial: one timed execution of an experiment's command.
//!
//! Trials are numbered densely within their experiment and move through
//! `initializing -> executing -> {completed, failed}`. Each owns a directory
//! under the experiment's data directory where the measured program writes its
//! profiles and traces.

use crate::core::controller::{Controller, Model, field};
use crate::core::error::TauError;
use crate::core::execute::{Executor, LaunchFailure, which};
use crate::core::installation::Environment;
use crate::core::output::human_size;
use crate::core::record::Fields;
use crate::core::schema::{Attribute, EntityHooks, EntityKind, Referential, Schema};
use crate::core::store::Store;
use crate::core::time::now_rfc3339;
use crate::model::experiment::Experiment;
use crate::model::project::{create_data_dir, remove_data_dir};
use regex::Regex;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, error, info, warn};

pub struct Trial;

pub const PHASES: &[&str] = &["initializing", "executing", "completed", "failed"];

/// Recognized launchers and the flags that name their application files.
const LAUNCHERS: &[(&str, &[&str])] = &[
    ("mpirun", &["-app", "--app", "-configfile"]),
    ("mpiexec", &["-app", "--app", "-configfile"]),
    ("mpiexec.hydra", &["-configfile"]),
    ("orterun", &["-app", "--app", "-configfile"]),
    ("srun", &["--multi-prog"]),
    ("aprun", &[]),
    ("ibrun", &[]),
    ("qsub", &[]),
    ("oshrun", &[]),
    ("poe", &[]),
    ("jsrun", &[]),
    ("cafrun", &[]),
];

static PROFILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^profile\.-?\d+\.\d+\.\d+$").expect("static regex"));

const TRACE_SUFFIXES: &[&str] = &[".slog2", ".trc", ".edf"];

const NO_DATA_HINTS: &[&str] = &[
    "Verify that the right input parameters were specified.",
    "Check the program output for error messages.",
    "Does the selected application configuration correctly describe this program?",
    "Does the selected measurement configuration specify the right measurement methods?",
    "Does the selected target configuration match the runtime environment?",
];

pub(crate) fn schema() -> Schema {
    Schema::new(
        EntityKind::Trial,
        vec![
            Attribute::integer("number")
                .primary_key()
                .describe("trial number, unique within its experiment"),
            Attribute::model("experiment", EntityKind::Experiment, Referential::Cascade)
                .required()
                .hashed()
                .describe("experiment this trial belongs to"),
            Attribute::string("command")
                .required()
                .hashed()
                .describe("command line executed when performing the trial"),
            Attribute::string("cwd")
                .required()
                .hashed()
                .describe("directory the trial was performed in"),
            Attribute::string("environment")
                .hashed()
                .describe("environment variables added for the trial, as JSON"),
            Attribute::datetime("begin_time").hashed().describe("when execution began"),
            Attribute::datetime("end_time").hashed().describe("when execution ended"),
            Attribute::integer("return_code")
                .hashed()
                .describe("exit code of the executed command"),
            Attribute::integer("data_size")
                .hashed()
                .describe("bytes of performance data produced"),
            Attribute::string("description").hashed().describe("free-form note"),
            Attribute::string("phase")
                .choices(PHASES)
                .default_value(|| json!("initializing"))
                .describe("phase of the trial"),
            Attribute::float("elapsed")
                .describe("seconds spent executing the command only"),
        ],
    )
    .unique_within("experiment")
    .with_hooks(&Trial)
}

impl EntityHooks for Trial {
    fn on_create(&self, ctrl: &Controller<'_>, model: &Model) -> Result<(), TauError> {
        create_data_dir(ctrl.store(), &Trial::prefix(ctrl.store(), model)?)
    }

    fn on_delete(&self, ctrl: &Controller<'_>, model: &Model) -> Result<(), TauError> {
        remove_data_dir(ctrl.store(), Trial::prefix(ctrl.store(), model)?);
        Ok(())
    }
}

fn banner(mark: &str, experiment: &Model, timestamp: &str) {
    let headline = format!("== {} {} at {} ==", mark, experiment.name(), timestamp);
    info!("\n{:=<80}\n", headline);
}

fn launch_hint(failure: LaunchFailure, host_arch: &str) -> String {
    match failure {
        LaunchFailure::PermissionDenied => "Check filesystem permissions".to_string(),
        LaunchFailure::NotFound => "Check paths and command line arguments".to_string(),
        LaunchFailure::NotExecutable => format!("Check that this host supports '{}'", host_arch),
        LaunchFailure::Other => "Check that the command is correct. Does it work without TAU?".to_string(),
    }
}

/// Everything needed to execute one trial once its record exists.
struct TrialRun<'a> {
    ctrl: &'a Controller<'a>,
    experiment: &'a Model,
    trial: &'a Model,
    prefix: &'a Path,
    cwd: &'a Path,
    executor: &'a dyn Executor,
    profile: String,
    trace: String,
    host_arch: String,
}

impl TrialRun<'_> {
    fn execute(&self, cmd: &[String], env: &Environment) -> Result<(), TauError> {
        let begin_time = now_rfc3339();
        banner("BEGIN", self.experiment, &begin_time);
        let mut executing = Fields::new();
        executing.insert("phase".into(), json!("executing"));
        executing.insert("begin_time".into(), json!(begin_time));
        self.ctrl.update(executing, self.trial.id(), false)?;

        let outcome = self.executor.execute(cmd, self.cwd, env);
        let end_time = now_rfc3339();
        banner("END", self.experiment, &end_time);
        let execution = match outcome {
            Ok(execution) => execution,
            Err(err) => {
                if let Err(update_err) = self.ctrl.update(field("end_time", end_time), self.trial.id(), false) {
                    error!("Could not record the end time of {}: {}", self.trial, update_err);
                }
                let hint = launch_hint(err.failure, &self.host_arch);
                return Err(TauError::trial(err.to_string(), &[hint.as_str()]));
            }
        };

        let data_size = dir_size(self.prefix)?;
        let mut finished = Fields::new();
        finished.insert("end_time".into(), json!(end_time));
        finished.insert("return_code".into(), json!(execution.exit_code));
        finished.insert("elapsed".into(), json!(execution.elapsed_secs));
        finished.insert("data_size".into(), json!(data_size));
        self.ctrl.update(finished, self.trial.id(), false)?;

        fix_negative_profiles(self.trial, self.prefix)?;
        if expects(&self.profile) && profile_files(self.prefix)?.is_empty() {
            return Err(TauError::trial("Trial did not produce any profiles.", NO_DATA_HINTS));
        }
        if expects(&self.trace) && trace_files(self.prefix)?.is_empty() {
            return Err(TauError::trial(
                "Application completed successfully but did not produce any traces.",
                NO_DATA_HINTS,
            ));
        }
        if execution.exit_code != 0 {
            if data_size == 0 {
                return Err(TauError::trial("Program died without producing performance data.", NO_DATA_HINTS));
            }
            warn!("Program exited with nonzero status code: {}", execution.exit_code);
        }

        info!("Experiment: {}", self.experiment.name());
        info!("Command: {}", cmd.join(" "));
        info!("Current working directory: {}", self.cwd.display());
        info!("Data size: {}", human_size(data_size));
        info!("Elapsed seconds: {:.6}", execution.elapsed_secs);
        Ok(())
    }
}

fn expects(format: &str) -> bool {
    !format.is_empty() && format != "none"
}

impl Trial {
    pub fn controller(store: &Store) -> Controller<'_> {
        Controller::new(EntityKind::Trial, store)
    }

    /// Data directory: `<experiment prefix>/<number>`.
    pub fn prefix(store: &Store, trial: &Model) -> Result<PathBuf, TauError> {
        let experiment = Self::controller(store)
            .populate_one(trial, "experiment")?
            .ok_or_else(|| TauError::InternalError(format!("{} has no experiment", trial)))?;
        Ok(Experiment::prefix(store, &experiment)?.join(trial.name()))
    }

    /// Execute `cmd` as a new trial of `experiment`.
    ///
    /// The trial record is created under the store lock with the next free
    /// number. Launch failures and runs that produced none of the data the
    /// measurement asked for leave the trial in the `failed` phase and return
    /// a [`TauError::TrialError`].
    pub fn perform(
        store: &Store,
        experiment: &Model,
        cmd: &[String],
        cwd: &Path,
        mut env: Environment,
        description: Option<&str>,
        executor: &dyn Executor,
    ) -> Result<Model, TauError> {
        let ctrl = Self::controller(store);
        let trial = {
            let _lock = store.lock()?;
            let number = Experiment::next_trial_number(store, experiment)?;
            debug!("New trial number is {}", number);
            let mut data = Fields::new();
            data.insert("number".into(), json!(number));
            data.insert("experiment".into(), json!(experiment.id()));
            data.insert("command".into(), json!(cmd.join(" ")));
            data.insert("cwd".into(), json!(cwd.to_string_lossy()));
            data.insert("phase".into(), json!("initializing"));
            if let Some(description) = description {
                data.insert("description".into(), json!(description));
            }
            ctrl.create(data)?
        };

        let mut environment = None;
        let mut execute = || -> Result<(), TauError> {
            let prefix = Self::prefix(store, &trial)?;
            let prefix_text = prefix.to_string_lossy().to_string();
            let experiments = Controller::new(EntityKind::Experiment, store);
            let measurement = experiments.populate_one(experiment, "measurement")?;
            let target = experiments.populate_one(experiment, "target")?;
            let setting = |model: &Option<Model>, attr: &str| {
                model
                    .as_ref()
                    .and_then(|m| m.get_or_default(attr))
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default()
            };
            let run = TrialRun {
                ctrl: &ctrl,
                experiment,
                trial: &trial,
                prefix: &prefix,
                cwd,
                executor,
                profile: setting(&measurement, "profile"),
                trace: setting(&measurement, "trace"),
                host_arch: setting(&target, "host_arch"),
            };
            env.insert("PROFILEDIR".into(), prefix_text.clone());
            env.insert("TRACEDIR".into(), prefix_text.clone());
            if run.trace == "otf2" || run.profile == "cubex" {
                env.insert("SCOREP_EXPERIMENT_DIRECTORY".into(), prefix_text);
            }
            environment = Some(serde_json::to_string(&env)?);
            run.execute(cmd, &env)
        };
        let result = execute();

        // The closing phase is recorded whatever happened above; the run's
        // own error takes precedence over a failure to record it.
        let phase = if result.is_ok() { "completed" } else { "failed" };
        let mut closing = Fields::new();
        closing.insert("phase".into(), json!(phase));
        if let Some(environment) = environment {
            closing.insert("environment".into(), json!(environment));
        }
        let updated = match (result, ctrl.update(closing, trial.id(), false)) {
            (Ok(()), Ok(updated)) => updated,
            (Ok(()), Err(err)) => return Err(err),
            (Err(err), Ok(_)) => return Err(err),
            (Err(err), Err(update_err)) => {
                error!("Could not mark {} as {}: {}", trial, phase, update_err);
                return Err(err);
            }
        };
        updated
            .into_iter()
            .next()
            .ok_or_else(|| TauError::InternalError(format!("{} disappeared while being performed", trial)))
    }

    /// Profile files in the trial's data directory.
    pub fn profile_files(store: &Store, trial: &Model) -> Result<Vec<PathBuf>, TauError> {
        profile_files(&Self::prefix(store, trial)?)
    }

    /// Trace files in the trial's data directory.
    pub fn trace_files(store: &Store, trial: &Model) -> Result<Vec<PathBuf>, TauError> {
        trace_files(&Self::prefix(store, trial)?)
    }
}

fn list_dir(dir: &Path) -> Result<Vec<PathBuf>, TauError> {
    match fs::read_dir(dir) {
        Ok(entries) => {
            let mut paths = Vec::new();
            for entry in entries {
                paths.push(entry?.path());
            }
            paths.sort();
            Ok(paths)
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(err.into()),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn is_profile(path: &Path) -> bool {
    let name = file_name(path);
    path.is_file() && (PROFILE_RE.is_match(&name) || name == "tauprofile.xml" || name.ends_with(".cubex"))
}

/// `profile.N.C.T` files (also inside `MULTI__*` metric directories),
/// `tauprofile.xml` and `*.cubex` under `dir`.
pub fn profile_files(dir: &Path) -> Result<Vec<PathBuf>, TauError> {
    let mut found = Vec::new();
    for path in list_dir(dir)? {
        if path.is_dir() && file_name(&path).starts_with("MULTI__") {
            found.extend(
                list_dir(&path)?
                    .into_iter()
                    .filter(|p| p.is_file() && PROFILE_RE.is_match(&file_name(p))),
            );
        } else if is_profile(&path) {
            found.push(path);
        }
    }
    Ok(found)
}

/// `*.slog2`, `*.trc`, `*.edf`, `traces.otf2` and `traces/*.{def,evt}` under `dir`.
pub fn trace_files(dir: &Path) -> Result<Vec<PathBuf>, TauError> {
    let mut found = Vec::new();
    for path in list_dir(dir)? {
        let name = file_name(&path);
        if path.is_dir() && name == "traces" {
            found.extend(list_dir(&path)?.into_iter().filter(|p| {
                let inner = file_name(p);
                inner.ends_with(".def") || inner.ends_with(".evt")
            }));
        } else if name == "traces.otf2" || TRACE_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) {
            found.push(path);
        }
    }
    Ok(found)
}

/// Rename `profile.-1.*` files, written when the node id was never set, to node 0.
fn fix_negative_profiles(trial: &Model, dir: &Path) -> Result<(), TauError> {
    let negative: Vec<PathBuf> = list_dir(dir)?
        .into_iter()
        .filter(|p| file_name(p).starts_with("profile.-1."))
        .collect();
    if negative.is_empty() {
        return Ok(());
    }
    warn!("Trial {} has {} profile files with negative node numbers", trial.name(), negative.len());
    for path in negative {
        let fixed = path.with_file_name(file_name(&path).replacen(".-1.", ".0.", 1));
        if fixed.exists() {
            return Err(TauError::configuration(
                format!("The profile numbers for trial {} cannot be corrected.", trial.name()),
                &[
                    "Check that the application configuration is correct.",
                    "Check that the measurement configuration is correct.",
                    "Check for instrumentation failure in the compilation log.",
                ],
            ));
        }
        fs::rename(&path, &fixed)?;
    }
    Ok(())
}

/// Total bytes of every file below `dir`.
pub fn dir_size(dir: &Path) -> Result<u64, TauError> {
    let mut total = 0;
    for path in list_dir(dir)? {
        let meta = fs::symlink_metadata(&path)?;
        if meta.is_dir() {
            total += dir_size(&path)?;
        } else {
            total += meta.len();
        }
    }
    Ok(total)
}

fn launcher_flags(cmd0: &str) -> Option<&'static [&'static str]> {
    let base = Path::new(cmd0)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    LAUNCHERS
        .iter()
        .find(|(launcher, _)| *launcher == base)
        .map(|(_, flags)| *flags)
}

fn separate_launcher_cmd(cmd: &[String]) -> Result<(Vec<String>, Vec<String>), TauError> {
    if let Some(idx) = cmd.iter().position(|arg| arg == "--") {
        return Ok((cmd[..idx].to_vec(), cmd[idx + 1..].to_vec()));
    }
    let Some(cmd0) = cmd.first() else {
        return Ok((Vec::new(), Vec::new()));
    };
    let Some(appfile_flags) = launcher_flags(cmd0) else {
        return Ok((Vec::new(), cmd.to_vec()));
    };
    if let Some(idx) = (1..cmd.len()).find(|&idx| which(&cmd[idx]).is_some()) {
        return Ok((cmd[..idx].to_vec(), cmd[idx..].to_vec()));
    }
    for (idx, arg) in cmd.iter().enumerate().skip(1) {
        let (flag, appfile) = match arg.split_once('=') {
            Some((flag, appfile)) => (flag, Some(appfile)),
            None => (arg.as_str(), cmd.get(idx + 1).map(String::as_str)),
        };
        let Some(appfile) = appfile else {
            break;
        };
        if appfile_flags.contains(&flag) && Path::new(appfile).is_file() {
            return Ok((cmd.to_vec(), Vec::new()));
        }
    }
    let separate_hint = format!(
        "Use '--' to separate '{}' and its arguments from the application command, \
         e.g. `mpirun -np 4 -- ./a.out -l hello`",
        cmd0
    );
    Err(TauError::configuration(
        format!(
            "TAU is having trouble parsing the command line: no executable commands or {} application \
             files were found after the launcher command '{}'",
            cmd0, cmd0
        ),
        &[
            "Check that the command is correct. Does it work without TAU?",
            separate_hint.as_str(),
        ],
    ))
}

/// Split a command line into the launcher command and the application
/// commands it starts.
///
/// `--` explicitly ends the launcher. Without it, a recognized launcher ends
/// at the first executable argument. MPMD command lines are split at `:`,
/// each later application command keeping its leading `:`.
pub fn parse_launcher_cmd(cmd: &[String]) -> Result<(Vec<String>, Vec<Vec<String>>), TauError> {
    let cmd0 = cmd.first().cloned().unwrap_or_default();
    let (launcher, rest) = separate_launcher_cmd(cmd)?;
    let num_exes = rest.iter().filter(|arg| which(arg).is_some()).count();
    debug!("Launcher: {:?}", launcher);
    debug!("Remainder: {:?}", rest);
    if launcher.is_empty() {
        if num_exes > 1 {
            warn!(
                "Multiple executables were found on the command line but none of them were recognized \
                 application launchers. TAU will assume that the application executable is '{}' and \
                 subsequent executables are arguments to that command. If this is incorrect, use '--' to \
                 separate '{}' and its arguments from the application command, e.g. \
                 `mpirun -np 4 -- ./a.out -l hello`",
                cmd0, cmd0
            );
        }
        return Ok((Vec::new(), vec![rest]));
    }
    if rest.is_empty() {
        return Ok((launcher, Vec::new()));
    }
    if num_exes <= 1 {
        return Ok((launcher, vec![rest]));
    }
    if !rest.iter().any(|arg| arg == ":") {
        warn!(
            "Multiple executables were found on the command line. TAU will assume that the application \
             executable is '{}' and subsequent executables are arguments to that command. If this is \
             incorrect, use ':' to separate each application executable and its arguments, e.g. \
             `mpirun -np 4 ./foo -l : -np 2 ./bar arg1`",
            cmd0
        );
        return Ok((launcher, vec![rest]));
    }
    let mut application_cmds = Vec::new();
    let mut current = Vec::new();
    for arg in rest {
        if arg == ":" {
            application_cmds.push(std::mem::take(&mut current));
        }
        current.push(arg);
    }
    application_cmds.push(current);
    Ok((launcher, application_cmds))
}

use serde_json::json;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use taucmdr::core::controller::Model;
use taucmdr::core::error::TauError;
use taucmdr::core::execute::{Execution, Executor, LaunchError, LaunchFailure, SubprocessExecutor};
use taucmdr::core::lock::{LOCK_FILE, LockHolder};
use taucmdr::core::installation::{Environment, HostInstaller};
use taucmdr::core::record::{Fields, fields};
use taucmdr::core::store::Store;
use taucmdr::model::trial::parse_launcher_cmd;
use taucmdr::model::{Application, Experiment, Measurement, Project, Target, Trial};
use tempfile::{TempDir, tempdir};

struct Fixture {
    tmp: TempDir,
    store: Store,
    experiment: Model,
}

impl Fixture {
    fn new(measurement: serde_json::Value) -> Self {
        let tmp = tempdir().unwrap();
        let store = Store::create(tmp.path()).unwrap();
        let project = Project::create(&store, "p1").unwrap();
        let member = |mut data: Fields| {
            data.insert("projects".into(), json!([project.id()]));
            data
        };
        let t = Target::controller(&store)
            .create(member(fields(json!({"name": "t1"}))))
            .unwrap();
        let a = Application::controller(&store)
            .create(member(fields(json!({"name": "a1"}))))
            .unwrap();
        let m = Measurement::controller(&store)
            .create(member(fields(measurement)))
            .unwrap();
        let experiment = Experiment::create(&store, "e1", &t, &a, &m).unwrap();
        Self {
            tmp,
            store,
            experiment,
        }
    }

    fn dir(&self) -> &Path {
        self.tmp.path()
    }

    fn add_trial(&self, number: u64) -> Model {
        let mut data = Fields::new();
        data.insert("number".into(), json!(number));
        data.insert("experiment".into(), json!(self.experiment.id()));
        data.insert("command".into(), json!("./a.out"));
        data.insert("cwd".into(), json!(self.dir().to_string_lossy()));
        Trial::controller(&self.store).create(data).unwrap()
    }

    fn reload(&self, trial: &Model) -> Model {
        Trial::controller(&self.store).reload(trial.id()).unwrap()
    }

    fn only_trial(&self) -> Model {
        let mut all = Trial::controller(&self.store).all().unwrap();
        assert_eq!(all.len(), 1);
        all.remove(0)
    }
}

/// Records the environment it was given and writes one profile file into
/// `PROFILEDIR`, like an instrumented program would.
#[derive(Default)]
struct FakeProgram {
    seen: RefCell<Vec<Environment>>,
    exit_code: i32,
    writes_profile: bool,
}

impl Executor for FakeProgram {
    fn execute(
        &self,
        _cmd: &[String],
        _cwd: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<Execution, LaunchError> {
        self.seen.borrow_mut().push(env.clone());
        if self.writes_profile {
            let dir = PathBuf::from(&env["PROFILEDIR"]);
            fs::write(dir.join("profile.0.0.0"), "x").unwrap();
        }
        Ok(Execution {
            exit_code: self.exit_code,
            elapsed_secs: 0.25,
        })
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

#[test]
fn trial_numbers_fill_gaps() {
    let fx = Fixture::new(json!({"name": "m1"}));
    assert_eq!(Experiment::next_trial_number(&fx.store, &fx.experiment).unwrap(), 0);
    fx.add_trial(0);
    let middle = fx.add_trial(1);
    fx.add_trial(2);
    assert_eq!(Experiment::next_trial_number(&fx.store, &fx.experiment).unwrap(), 3);

    Trial::controller(&fx.store).delete(middle.id(), false).unwrap();
    assert!(!Trial::prefix(&fx.store, &middle).unwrap().exists());
    assert_eq!(Experiment::next_trial_number(&fx.store, &fx.experiment).unwrap(), 1);
}

#[test]
fn trial_numbers_are_unique_within_an_experiment() {
    let fx = Fixture::new(json!({"name": "m1"}));
    fx.add_trial(0);
    let mut data = Fields::new();
    data.insert("number".into(), json!(0));
    data.insert("experiment".into(), json!(fx.experiment.id()));
    data.insert("command".into(), json!("./b.out"));
    data.insert("cwd".into(), json!("/tmp"));
    let err = Trial::controller(&fx.store).create(data).unwrap_err();
    assert!(matches!(err, TauError::RecordConflict { .. }));
}

#[test]
fn performed_trial_records_timing_and_data() {
    let fx = Fixture::new(json!({"name": "m1"}));
    let program = FakeProgram {
        writes_profile: true,
        ..Default::default()
    };
    let cmd = argv(&["./a.out", "-n", "10"]);
    let mut env = Environment::new();
    env.insert("TAU_VERBOSE".into(), "1".into());

    let trial = Trial::perform(&fx.store, &fx.experiment, &cmd, fx.dir(), env, Some("first"), &program).unwrap();
    assert_eq!(trial.name(), "0");
    assert_eq!(trial.get_str("phase"), Some("completed"));
    assert_eq!(trial.get_str("command"), Some("./a.out -n 10"));
    assert_eq!(trial.get_str("description"), Some("first"));
    assert_eq!(trial.get_i64("return_code"), Some(0));
    assert_eq!(trial.get_i64("data_size"), Some(1));
    assert!(trial.get_str("begin_time").is_some());
    assert!(trial.get_str("end_time").is_some());

    let prefix = Trial::prefix(&fx.store, &trial).unwrap();
    let seen = program.seen.borrow();
    assert_eq!(seen[0]["PROFILEDIR"], prefix.to_string_lossy());
    assert_eq!(seen[0]["TRACEDIR"], prefix.to_string_lossy());
    assert!(!seen[0].contains_key("SCOREP_EXPERIMENT_DIRECTORY"));
    let stored: Environment = serde_json::from_str(trial.get_str("environment").unwrap()).unwrap();
    assert_eq!(stored["TAU_VERBOSE"], "1");
    assert_eq!(Trial::profile_files(&fx.store, &trial).unwrap().len(), 1);
    assert_eq!(Experiment::data_size(&fx.store, &fx.experiment).unwrap(), 1);
}

#[test]
fn missing_profiles_fail_the_trial_but_keep_its_record() {
    let fx = Fixture::new(json!({"name": "m1"}));
    let program = FakeProgram::default();
    let err = Trial::perform(
        &fx.store,
        &fx.experiment,
        &argv(&["./a.out"]),
        fx.dir(),
        Environment::new(),
        None,
        &program,
    )
    .unwrap_err();
    assert!(matches!(err, TauError::TrialError { .. }));
    assert_eq!(err.to_string(), "Trial did not produce any profiles.");
    assert_eq!(err.hints().len(), 5);
    assert_eq!(fx.only_trial().get_str("phase"), Some("failed"));
}

#[test]
fn nonzero_exit_with_data_completes_and_without_data_fails() {
    let fx = Fixture::new(json!({"name": "m1", "profile": "none"}));
    let crashed = FakeProgram {
        exit_code: 3,
        ..Default::default()
    };
    let err = Trial::perform(
        &fx.store,
        &fx.experiment,
        &argv(&["./a.out"]),
        fx.dir(),
        Environment::new(),
        None,
        &crashed,
    )
    .unwrap_err();
    assert_eq!(err.to_string(), "Program died without producing performance data.");
    let failed = fx.only_trial();
    assert_eq!(failed.get_str("phase"), Some("failed"));
    assert_eq!(failed.get_i64("return_code"), Some(3));

    let noisy = FakeProgram {
        exit_code: 3,
        writes_profile: true,
        ..Default::default()
    };
    let trial = Trial::perform(
        &fx.store,
        &fx.experiment,
        &argv(&["./a.out"]),
        fx.dir(),
        Environment::new(),
        None,
        &noisy,
    )
    .unwrap();
    assert_eq!(trial.name(), "1");
    assert_eq!(trial.get_str("phase"), Some("completed"));
    assert_eq!(fx.reload(&failed).get_str("phase"), Some("failed"));
}

#[test]
fn otf2_traces_set_the_score_p_directory() {
    let fx = Fixture::new(json!({"name": "m1", "trace": "otf2"}));
    let program = FakeProgram {
        writes_profile: true,
        ..Default::default()
    };
    let err = Trial::perform(
        &fx.store,
        &fx.experiment,
        &argv(&["./a.out"]),
        fx.dir(),
        Environment::new(),
        None,
        &program,
    )
    .unwrap_err();
    assert!(err.to_string().contains("did not produce any traces"));
    assert!(program.seen.borrow()[0].contains_key("SCOREP_EXPERIMENT_DIRECTORY"));
}

/// Fails to launch. When `lock_path` is set it first leaves a lock file held
/// by a live process behind, so nothing can be written until it is removed.
struct Unlaunchable {
    failure: LaunchFailure,
    lock_path: Option<PathBuf>,
}

impl Executor for Unlaunchable {
    fn execute(
        &self,
        cmd: &[String],
        _cwd: &Path,
        _env: &BTreeMap<String, String>,
    ) -> Result<Execution, LaunchError> {
        if let Some(path) = &self.lock_path {
            let holder = LockHolder {
                pid: std::process::id(),
                token: "someone-else".into(),
                acquired_at: "2026-01-01T00:00:00Z".into(),
            };
            fs::write(path, serde_json::to_vec(&holder).unwrap()).unwrap();
        }
        Err(LaunchError {
            command: cmd.join(" "),
            failure: self.failure,
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        })
    }
}

#[test]
fn launch_error_marks_the_trial_failed() {
    let fx = Fixture::new(json!({"name": "m1"}));
    let executor = Unlaunchable {
        failure: LaunchFailure::PermissionDenied,
        lock_path: None,
    };
    let err = Trial::perform(
        &fx.store,
        &fx.experiment,
        &argv(&["./a.out"]),
        fx.dir(),
        Environment::new(),
        None,
        &executor,
    )
    .unwrap_err();
    assert!(matches!(err, TauError::TrialError { .. }));
    assert!(err.to_string().starts_with("Couldn't execute ./a.out"));
    assert_eq!(err.hints(), ["Check filesystem permissions".to_string()]);
    let trial = fx.only_trial();
    assert_eq!(trial.get_str("phase"), Some("failed"));
    assert!(trial.get_str("environment").is_some());
}

#[test]
fn launch_error_wins_over_a_failed_phase_update() {
    let fx = Fixture::new(json!({"name": "m1"}));
    fs::write(fx.store.prefix().join("config.toml"), "lock_timeout_secs = 0\n").unwrap();
    let store = Store::open(fx.store.prefix()).unwrap();
    let lock_path = store.prefix().join(LOCK_FILE);
    let executor = Unlaunchable {
        failure: LaunchFailure::NotFound,
        lock_path: Some(lock_path.clone()),
    };
    let err = Trial::perform(
        &store,
        &fx.experiment,
        &argv(&["./a.out"]),
        fx.dir(),
        Environment::new(),
        None,
        &executor,
    )
    .unwrap_err();
    assert!(matches!(err, TauError::TrialError { .. }));
    assert_eq!(err.hints(), ["Check paths and command line arguments".to_string()]);

    // The lock blocked the closing update, so the trial is left where it was.
    fs::remove_file(&lock_path).unwrap();
    assert_eq!(fx.only_trial().get_str("phase"), Some("executing"));
}

#[cfg(unix)]
fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[cfg(unix)]
#[test]
fn managed_run_executes_a_real_program() {
    let fx = Fixture::new(json!({"name": "m1"}));
    let program = script(fx.dir(), "a.out", "echo x > \"$PROFILEDIR/profile.0.0.0\"");
    let executor = SubprocessExecutor::with_event_log(fx.dir().join("events.jsonl"));
    let cmd = vec![program.to_string_lossy().to_string()];

    let first = Experiment::managed_run(&fx.store, &fx.experiment, &HostInstaller, &executor, &cmd, fx.dir(), None)
        .unwrap();
    assert_eq!(first.name(), "0");
    assert_eq!(first.get_str("phase"), Some("completed"));
    assert_eq!(first.get_i64("return_code"), Some(0));
    assert!(first.get_i64("data_size").unwrap() > 0);
    let stored: Environment = serde_json::from_str(first.get_str("environment").unwrap()).unwrap();
    assert_eq!(stored["TAU_PROFILE"], "1");

    let second = Experiment::managed_run(&fx.store, &fx.experiment, &HostInstaller, &executor, &cmd, fx.dir(), None)
        .unwrap();
    assert_eq!(second.name(), "1");

    let experiment = Experiment::controller(&fx.store).unwrap().reload(fx.experiment.id()).unwrap();
    assert!(experiment.get_str("tau_makefile").is_some());
    let events = fs::read_to_string(fx.dir().join("events.jsonl")).unwrap();
    assert_eq!(events.lines().count(), 2);
}

#[test]
fn missing_executable_fails_the_trial() {
    let fx = Fixture::new(json!({"name": "m1"}));
    let executor = SubprocessExecutor::new();
    let err = Trial::perform(
        &fx.store,
        &fx.experiment,
        &argv(&["./does-not-exist"]),
        fx.dir(),
        Environment::new(),
        None,
        &executor,
    )
    .unwrap_err();
    assert!(matches!(err, TauError::TrialError { .. }));
    assert_eq!(err.hints(), ["Check paths and command line arguments".to_string()]);
    let trial = fx.only_trial();
    assert_eq!(trial.get_str("phase"), Some("failed"));
    assert!(trial.get_str("end_time").is_some());
    assert!(trial.get("return_code").is_none());
}

#[cfg(unix)]
#[test]
fn mpmd_command_lines_split_at_colons() {
    let tmp = tempdir().unwrap();
    let foo = script(tmp.path(), "foo", "exit 0").to_string_lossy().to_string();
    let bar = script(tmp.path(), "bar", "exit 0").to_string_lossy().to_string();
    let cmd = vec![
        "mpirun".to_string(),
        "-np".to_string(),
        "4".to_string(),
        foo.clone(),
        "-l".to_string(),
        ":".to_string(),
        "-np".to_string(),
        "2".to_string(),
        bar.clone(),
    ];
    let (launcher, apps) = parse_launcher_cmd(&cmd).unwrap();
    assert_eq!(launcher, argv(&["mpirun", "-np", "4"]));
    assert_eq!(apps.len(), 2);
    assert_eq!(apps[0], vec![foo, "-l".to_string()]);
    assert_eq!(apps[1], vec![":".to_string(), "-np".to_string(), "2".to_string(), bar]);
}

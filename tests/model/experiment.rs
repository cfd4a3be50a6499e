use serde_json::json;
use taucmdr::core::controller::{Controller, Model};
use taucmdr::core::error::TauError;
use taucmdr::core::record::{Fields, fields};
use taucmdr::core::schema::EntityKind;
use taucmdr::core::store::Store;
use taucmdr::model::{Application, Experiment, Measurement, Project, Target, Trial};
use tempfile::{TempDir, tempdir};

struct Fixture {
    _tmp: TempDir,
    store: Store,
    project: Model,
}

impl Fixture {
    fn new() -> Self {
        let tmp = tempdir().unwrap();
        let store = Store::create(tmp.path()).unwrap();
        let project = Project::create(&store, "p1").unwrap();
        Self {
            _tmp: tmp,
            store,
            project,
        }
    }

    fn member(&self, ctrl: Controller<'_>, data: serde_json::Value) -> Model {
        let mut data = fields(data);
        data.insert("projects".into(), json!([self.project.id()]));
        ctrl.create(data).unwrap()
    }

    fn target(&self, data: serde_json::Value) -> Model {
        self.member(Target::controller(&self.store), data)
    }

    fn application(&self, data: serde_json::Value) -> Model {
        self.member(Application::controller(&self.store), data)
    }

    fn measurement(&self, data: serde_json::Value) -> Model {
        self.member(Measurement::controller(&self.store), data)
    }

    /// Default target, application and measurement, plus an experiment over them.
    fn experiment(&self, name: &str) -> (Model, Model, Model, Model) {
        let t = self.target(json!({"name": "t1"}));
        let a = self.application(json!({"name": "a1"}));
        let m = self.measurement(json!({"name": "m1"}));
        let e = Experiment::create(&self.store, name, &t, &a, &m).unwrap();
        (e, t, a, m)
    }

    fn add_trial(&self, experiment: &Model, number: u64) -> Model {
        let mut data = Fields::new();
        data.insert("number".into(), json!(number));
        data.insert("experiment".into(), json!(experiment.id()));
        data.insert("command".into(), json!("./a.out"));
        data.insert("cwd".into(), json!("/tmp"));
        Trial::controller(&self.store).create(data).unwrap()
    }
}

#[test]
fn experiment_names_are_unique_within_a_project() {
    let fx = Fixture::new();
    let (e1, t, a, m) = fx.experiment("e1");
    assert!(Experiment::prefix(&fx.store, &e1).unwrap().is_dir());

    match Experiment::create(&fx.store, "e1", &t, &a, &m).unwrap_err() {
        TauError::RecordConflict { attribute, value, .. } => {
            assert_eq!(attribute, "name");
            assert_eq!(value, "\"e1\"");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(Experiment::controller(&fx.store).unwrap().count().unwrap(), 1);
}

#[test]
fn mpi_application_requires_mpi_measurement() {
    let fx = Fixture::new();
    let t = fx.target(json!({"name": "t1"}));
    let a = fx.application(json!({"name": "a1", "mpi": true}));
    let plain = fx.measurement(json!({"name": "plain", "mpi": false}));
    let err = Experiment::create(&fx.store, "e1", &t, &a, &plain).unwrap_err();
    assert!(matches!(err, TauError::IncompatibleRecordError(_)));
    assert!(err.to_string().contains("'mpi'"));
    assert_eq!(Experiment::controller(&fx.store).unwrap().count().unwrap(), 0);
    assert!(!Project::prefix(&fx.project).join("e1").exists());

    let with_mpi = fx.measurement(json!({"name": "with_mpi", "mpi": true}));
    Experiment::create(&fx.store, "e1", &t, &a, &with_mpi).unwrap();
}

#[test]
fn configurations_outside_the_project_are_rejected() {
    let fx = Fixture::new();
    let outsider = Target::controller(&fx.store)
        .create(fields(json!({"name": "outsider"})))
        .unwrap();
    let a = fx.application(json!({"name": "a1"}));
    let m = fx.measurement(json!({"name": "m1"}));
    let err = Experiment::create(&fx.store, "e1", &outsider, &a, &m).unwrap_err();
    assert!(matches!(err, TauError::IncompatibleRecordError(_)));
    assert!(err.to_string().contains("is not a member of project configuration 'p1'"));
}

#[test]
fn application_is_immutable_once_its_experiment_has_trials() {
    let fx = Fixture::new();
    let (e1, _, a, _) = fx.experiment("e1");
    let apps = Application::controller(&fx.store);

    apps.update(fields(json!({"linkage": "static"})), a.id(), false)
        .unwrap();

    fx.add_trial(&e1, 0);
    let err = apps
        .update(fields(json!({"linkage": "dynamic"})), a.id(), false)
        .unwrap_err();
    assert!(matches!(err, TauError::ImmutableRecordError(_)));
    assert!(err.to_string().contains("e1"));
    assert_eq!(apps.reload(a.id()).unwrap().get_str("linkage"), Some("static"));
}

#[test]
fn update_that_breaks_an_experiment_is_rolled_back() {
    let fx = Fixture::new();
    let (_, _, a, _) = fx.experiment("e1");
    let apps = Application::controller(&fx.store);
    let err = apps
        .update(fields(json!({"mpi": true})), a.id(), false)
        .unwrap_err();
    assert!(matches!(err, TauError::IncompatibleRecordError(_)));
    assert!(err.to_string().contains("invalid condition in experiment 'e1'"));
    assert!(!apps.reload(a.id()).unwrap().get_bool("mpi"));
}

#[test]
fn deleting_a_project_removes_experiment_and_trial_directories() {
    let fx = Fixture::new();
    let (e1, _, _, _) = fx.experiment("e1");
    let trial = fx.add_trial(&e1, 0);
    let experiment_dir = Experiment::prefix(&fx.store, &e1).unwrap();
    let trial_dir = Trial::prefix(&fx.store, &trial).unwrap();
    assert!(trial_dir.is_dir());

    Project::delete(&fx.store, &fx.project).unwrap();
    assert!(!trial_dir.exists());
    assert!(!experiment_dir.exists());
    assert!(!Project::prefix(&fx.project).exists());
    assert_eq!(Controller::new(EntityKind::Experiment, &fx.store).count().unwrap(), 0);
    assert_eq!(Trial::controller(&fx.store).count().unwrap(), 0);
    // Shared configurations survive, unlinked from the deleted project.
    let t1 = Target::controller(&fx.store).by_name("t1").unwrap();
    assert!(t1.get_ids("projects").is_empty());
}

#[test]
fn configuration_in_use_cannot_be_deleted() {
    let fx = Fixture::new();
    let (_, t, _, _) = fx.experiment("e1");
    let err = Target::controller(&fx.store).delete(t.id(), false).unwrap_err();
    assert!(matches!(err, TauError::ImmutableRecordError(_)));
    assert!(Target::controller(&fx.store).exists(t.id()).unwrap());
}

#[test]
fn selecting_an_experiment_and_editing_it_queues_a_rebuild_notice() {
    let fx = Fixture::new();
    let (_, _, a, _) = fx.experiment("e1");
    let err = Experiment::select(&fx.store, "nope").unwrap_err();
    assert!(matches!(err, TauError::ExperimentSelectionError(_)));

    Experiment::select(&fx.store, "e1").unwrap();
    let project = Project::selected(&fx.store).unwrap();
    assert_eq!(Project::experiment(&fx.store, &project).unwrap().name(), "e1");

    Application::controller(&fx.store)
        .update(fields(json!({"linkage": "static"})), a.id(), false)
        .unwrap();
    assert_eq!(
        Experiment::rebuild_required(&fx.store),
        "Application rebuild required:\n  - linkage changed from 'dynamic' to 'static'"
    );
    assert_eq!(Experiment::rebuild_required(&fx.store), "");
}

#[test]
fn deleting_the_selected_experiment_clears_the_selection() {
    let fx = Fixture::new();
    let (e1, _, _, _) = fx.experiment("e1");
    Experiment::select(&fx.store, "e1").unwrap();
    Experiment::controller(&fx.store).unwrap().delete(e1.id(), false).unwrap();
    let project = Project::selected(&fx.store).unwrap();
    assert!(project.get("experiment").is_none());
    assert!(matches!(
        Project::experiment(&fx.store, &project).unwrap_err(),
        TauError::ExperimentSelectionError(_)
    ));
}

#[test]
fn trials_by_number_or_latest() {
    let fx = Fixture::new();
    let (e1, _, _, _) = fx.experiment("e1");
    let err = Experiment::trials(&fx.store, &e1, &[]).unwrap_err();
    assert_eq!(err.to_string(), "No trials in experiment e1");

    fx.add_trial(&e1, 0);
    fx.add_trial(&e1, 1);
    let latest = Experiment::trials(&fx.store, &e1, &[]).unwrap();
    assert_eq!(latest[0].name(), "1");
    let chosen = Experiment::trials(&fx.store, &e1, &[0]).unwrap();
    assert_eq!(chosen[0].name(), "0");
    let err = Experiment::trials(&fx.store, &e1, &[7]).unwrap_err();
    assert_eq!(err.to_string(), "Experiment 'e1' has no trial with number 7");
}

#[test]
fn cuda_application_needs_a_target_with_cuda_toolkit() {
    let fx = Fixture::new();
    let bare = fx.target(json!({"name": "bare"}));
    let gpu = fx.target(json!({"name": "gpu", "cuda_toolkit": "/usr/local/cuda"}));
    let a = fx.application(json!({"name": "a1", "cuda": true}));
    let m = fx.measurement(json!({"name": "m1"}));

    let err = Experiment::create(&fx.store, "e1", &bare, &a, &m).unwrap_err();
    assert!(matches!(err, TauError::IncompatibleRecordError(_)));
    assert!(err.to_string().contains("'cuda_toolkit' set"));
    assert_eq!(Experiment::controller(&fx.store).unwrap().count().unwrap(), 0);

    // The unmet measurement recommendation for 'cuda' only warns.
    Experiment::create(&fx.store, "e1", &gpu, &a, &m).unwrap();
}

#[test]
fn populate_resolves_references_and_trials() {
    let fx = Fixture::new();
    let (e1, t, _, _) = fx.experiment("e1");
    fx.add_trial(&e1, 0);
    fx.add_trial(&e1, 1);
    let experiments = Controller::new(EntityKind::Experiment, &fx.store);

    let trials = experiments.populate(&e1, Some("trials"), false).unwrap();
    let numbers: Vec<String> = trials.many("trials").iter().map(Model::name).collect();
    assert_eq!(numbers, ["0", "1"]);
    assert!(trials.one("target").is_none());

    let full = experiments.populate(&e1, None, true).unwrap();
    assert_eq!(full.one("target"), Some(&t));
    assert_eq!(full.one("project").map(Model::id), Some(fx.project.id()));
    assert_eq!(full.many("trials").len(), 2);
    assert!(full.get("tau_makefile").is_none());
}

#[test]
fn rolled_back_create_leaves_no_experiment_directory() {
    let fx = Fixture::new();
    let t = fx.target(json!({"name": "t1"}));
    let a = fx.application(json!({"name": "a1"}));
    let m = fx.measurement(json!({"name": "m1"}));
    let result: Result<(), TauError> = fx.store.database().transaction(|| {
        Experiment::create(&fx.store, "e1", &t, &a, &m)?;
        Err(TauError::InternalError("abort".into()))
    });
    assert!(result.is_err());
    assert_eq!(Experiment::controller(&fx.store).unwrap().count().unwrap(), 0);
    assert!(!Project::prefix(&fx.project).join("e1").exists());
}

#[test]
fn rolled_back_delete_keeps_data_directories() {
    let fx = Fixture::new();
    let (e1, _, _, _) = fx.experiment("e1");
    let trial = fx.add_trial(&e1, 0);
    let trial_dir = Trial::prefix(&fx.store, &trial).unwrap();
    let result: Result<(), TauError> = fx.store.database().transaction(|| {
        Experiment::controller(&fx.store)?.delete(e1.id(), false)?;
        Err(TauError::InternalError("abort".into()))
    });
    assert!(result.is_err());
    assert!(Trial::controller(&fx.store).exists(trial.id()).unwrap());
    assert!(trial_dir.is_dir());

    Experiment::controller(&fx.store).unwrap().delete(e1.id(), false).unwrap();
    assert!(!trial_dir.exists());
    assert!(!Experiment::prefix(&fx.store, &e1).unwrap().exists());
}

#[test]
fn rolled_back_edit_queues_no_rebuild_notice() {
    let fx = Fixture::new();
    let (_, _, a, _) = fx.experiment("e1");
    Experiment::select(&fx.store, "e1").unwrap();
    let apps = Application::controller(&fx.store);
    let result: Result<(), TauError> = fx.store.database().transaction(|| {
        apps.update(fields(json!({"linkage": "static"})), a.id(), false)?;
        Err(TauError::InternalError("abort".into()))
    });
    assert!(result.is_err());
    assert_eq!(Experiment::rebuild_required(&fx.store), "");
    assert_eq!(apps.reload(a.id()).unwrap().get_str("linkage"), Some("dynamic"));
}

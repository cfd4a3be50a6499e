//! Application: the parallel programming features of the program being measured.
//!
//! Applications shared by experiments are locked once any of those experiments
//! has trials, and every other change is re-verified against the experiments
//! that use them before it is kept.

use crate::core::controller::{Controller, Model};
use crate::core::error::TauError;
use crate::core::schema::{Attribute, Changes, CompatRule, EntityHooks, EntityKind, Schema, Test};
use crate::core::store::Store;
use crate::model::experiment;
use serde_json::{Value, json};
use std::path::Path;

pub struct Application;

fn off() -> Value {
    Value::Bool(false)
}

fn feature(name: &'static str, description: &'static str) -> Attribute {
    Attribute::boolean(name)
        .default_value(off)
        .on_change(experiment::rebuild_on_change)
        .describe(description)
}

pub(crate) fn schema() -> Schema {
    let yes = || Test::Equals(json!(true));
    Schema::new(
        EntityKind::Application,
        vec![
            Attribute::string("name").primary_key().describe("application name"),
            Attribute::collection("projects", EntityKind::Project, Some("applications"))
                .describe("projects using this application"),
            feature("openmp", "application uses OpenMP").compat(CompatRule::encouraged(
                yes(),
                EntityKind::Measurement,
                "openmp",
                Test::NotEquals(json!("ignore")),
            )),
            feature("pthreads", "application uses pthreads"),
            feature("mpi", "application uses MPI").compat(CompatRule::required(
                yes(),
                EntityKind::Measurement,
                "mpi",
                yes(),
            )),
            feature("cuda", "application uses NVIDIA CUDA")
                .compat(CompatRule::required(yes(), EntityKind::Target, "cuda_toolkit", Test::Set))
                .compat(CompatRule::recommended(yes(), EntityKind::Measurement, "cuda", yes())),
            feature("opencl", "application uses OpenCL")
                .compat(CompatRule::required(yes(), EntityKind::Target, "cuda_toolkit", Test::Set))
                .compat(CompatRule::encouraged(yes(), EntityKind::Measurement, "opencl", yes())),
            feature("shmem", "application uses SHMEM").compat(CompatRule::recommended(
                yes(),
                EntityKind::Measurement,
                "shmem",
                yes(),
            )),
            feature("mpc", "application uses MPC"),
            Attribute::string("linkage")
                .choices(&["static", "dynamic"])
                .default_value(|| json!("dynamic"))
                .on_change(experiment::rebuild_on_change)
                .describe("application linkage"),
            Attribute::string("select_file")
                .on_change(experiment::rebuild_on_change)
                .describe("selective instrumentation file")
                .compat(CompatRule::violation(
                    Test::Set,
                    EntityKind::Measurement,
                    "source_inst",
                    Test::Equals(json!("never")),
                )),
        ],
    )
    .with_hooks(&Application)
}

fn check_select_file(model: &Model) -> Result<(), TauError> {
    match model.get_str("select_file") {
        Some(path) if !Path::new(path).exists() => Err(TauError::configuration(
            format!("Selective instrumentation file '{}' not found", path),
            &[],
        )),
        _ => Ok(()),
    }
}

impl EntityHooks for Application {
    fn on_create(&self, _ctrl: &Controller<'_>, model: &Model) -> Result<(), TauError> {
        check_select_file(model)
    }

    fn on_update(&self, ctrl: &Controller<'_>, model: &Model, changes: &Changes) -> Result<(), TauError> {
        if changes.contains_key("select_file") {
            check_select_file(model)?;
        }
        experiment::verify_users(ctrl.store(), model)
    }
}

impl Application {
    pub fn controller(store: &Store) -> Controller<'_> {
        Controller::new(EntityKind::Application, store)
    }
}

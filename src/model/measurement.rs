//! Measurement: which performance data to gather and how.

use crate::core::controller::{Controller, Model};
use crate::core::error::TauError;
use crate::core::schema::{Attribute, Changes, CompatRule, EntityHooks, EntityKind, Schema, Test};
use crate::core::store::Store;
use crate::model::experiment;
use regex::Regex;
use serde_json::{Value, json};
use std::sync::LazyLock;

pub struct Measurement;

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("static regex"));

fn off() -> Value {
    Value::Bool(false)
}

fn on() -> Value {
    Value::Bool(true)
}

fn yes() -> Test {
    Test::Equals(json!(true))
}

/// Rules shared by attributes that benefit from stack unwinding on the target.
fn wants_unwinding(attr: Attribute, when: fn() -> Test) -> Attribute {
    attr.compat(CompatRule::recommended(when(), EntityKind::Target, "binutils_source", Test::Set))
        .compat(CompatRule::recommended(when(), EntityKind::Target, "libunwind_source", Test::Set))
}

pub(crate) fn schema() -> Schema {
    Schema::new(
        EntityKind::Measurement,
        vec![
            Attribute::string("name").primary_key().describe("measurement name"),
            Attribute::collection("projects", EntityKind::Project, Some("measurements"))
                .describe("projects using this measurement"),
            Attribute::string("profile")
                .choices(&["tau", "merged", "cubex", "none"])
                .default_value(|| json!("tau"))
                .on_change(experiment::rebuild_on_change)
                .describe("profile format, or none to disable profiling"),
            Attribute::string("trace")
                .choices(&["slog2", "otf2", "none"])
                .default_value(|| json!("none"))
                .on_change(experiment::rebuild_on_change)
                .describe("trace format, or none to disable tracing"),
            Attribute::boolean("sample")
                .default_value(off)
                .on_change(experiment::rebuild_on_change)
                .describe("use event-based sampling")
                .compat(CompatRule::required(yes(), EntityKind::Target, "binutils_source", Test::Set)),
            Attribute::string("source_inst")
                .choices(&["automatic", "manual", "never"])
                .default_value(|| json!("automatic"))
                .on_change(experiment::rebuild_on_change)
                .describe("use source-level instrumentation")
                .compat(CompatRule::required(
                    Test::NotEquals(json!("never")),
                    EntityKind::Target,
                    "pdt_source",
                    Test::Set,
                )),
            wants_unwinding(
                Attribute::string("compiler_inst")
                    .choices(&["always", "fallback", "never"])
                    .default_value(|| json!("fallback"))
                    .on_change(experiment::rebuild_on_change)
                    .describe("use compiler-based instrumentation"),
                || Test::NotEquals(json!("never")),
            ),
            Attribute::boolean("mpi")
                .default_value(off)
                .on_change(experiment::rebuild_on_change)
                .describe("measure MPI calls")
                .compat(CompatRule::required(yes(), EntityKind::Application, "mpi", yes())),
            Attribute::string("openmp")
                .choices(&["ignore", "ompt", "opari"])
                .default_value(|| json!("ignore"))
                .on_change(experiment::rebuild_on_change)
                .describe("how to measure OpenMP regions")
                .compat(CompatRule::required(
                    Test::NotEquals(json!("ignore")),
                    EntityKind::Application,
                    "openmp",
                    yes(),
                )),
            Attribute::boolean("cuda")
                .default_value(off)
                .on_change(experiment::rebuild_on_change)
                .describe("measure CUDA events")
                .compat(CompatRule::required(yes(), EntityKind::Application, "cuda", yes())),
            Attribute::boolean("opencl")
                .default_value(off)
                .on_change(experiment::rebuild_on_change)
                .describe("measure OpenCL events")
                .compat(CompatRule::required(yes(), EntityKind::Application, "opencl", yes())),
            Attribute::boolean("shmem")
                .default_value(off)
                .on_change(experiment::rebuild_on_change)
                .describe("measure SHMEM calls")
                .compat(CompatRule::required(yes(), EntityKind::Application, "shmem", yes())),
            wants_unwinding(
                Attribute::integer("callpath")
                    .default_value(|| json!(100))
                    .describe("maximum callpath depth, 0 to disable"),
                || Test::NotEquals(json!(0)),
            ),
            Attribute::new("metrics", crate::core::schema::AttrType::Array)
                .default_value(|| json!(["TIME"]))
                .on_change(experiment::rebuild_on_change)
                .describe("performance metrics to gather")
                .compat(CompatRule::recommended(
                    Test::NotEquals(json!(["TIME"])),
                    EntityKind::Target,
                    "papi_source",
                    Test::Set,
                )),
            Attribute::boolean("keep_inst_files")
                .default_value(off)
                .describe("keep instrumented source files"),
            Attribute::boolean("baseline")
                .default_value(off)
                .on_change(experiment::rebuild_on_change)
                .describe("run without instrumentation to measure overhead-free time"),
            Attribute::boolean("throttle")
                .default_value(on)
                .describe("throttle lightweight, frequently called events"),
        ],
    )
    .with_hooks(&Measurement)
}

fn check_name(model: &Model) -> Result<(), TauError> {
    let name = model.name();
    if NAME_RE.is_match(&name) {
        return Ok(());
    }
    Err(TauError::ModelError(format!(
        "'{}' is not a valid measurement name. Use only letters, numbers, dot (.), dash (-), and underscore (_).",
        name
    )))
}

impl EntityHooks for Measurement {
    fn on_create(&self, _ctrl: &Controller<'_>, model: &Model) -> Result<(), TauError> {
        check_name(model)
    }

    fn on_update(&self, ctrl: &Controller<'_>, model: &Model, changes: &Changes) -> Result<(), TauError> {
        if changes.contains_key("name") {
            check_name(model)?;
        }
        experiment::verify_users(ctrl.store(), model)
    }
}

impl Measurement {
    pub fn controller(store: &Store) -> Controller<'_> {
        Controller::new(EntityKind::Measurement, store)
    }
}

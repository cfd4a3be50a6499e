//! Target: the platform an experiment builds and runs on.

use crate::core::controller::{Controller, Model};
use crate::core::error::TauError;
use crate::core::schema::{Attribute, Changes, EntityHooks, EntityKind, Schema};
use crate::core::store::Store;
use crate::model::experiment;
use serde_json::{Value, json};

pub struct Target;

fn download() -> Value {
    json!("download")
}

pub(crate) fn schema() -> Schema {
    Schema::new(
        EntityKind::Target,
        vec![
            Attribute::string("name").primary_key().describe("target name"),
            Attribute::collection("projects", EntityKind::Project, Some("targets"))
                .describe("projects using this target"),
            Attribute::string("host_os")
                .default_value(|| json!(std::env::consts::OS))
                .describe("host operating system"),
            Attribute::string("host_arch")
                .default_value(|| json!(std::env::consts::ARCH))
                .describe("host architecture"),
            Attribute::string("cc")
                .on_change(experiment::rebuild_on_change)
                .describe("C compiler command"),
            Attribute::string("cxx")
                .on_change(experiment::rebuild_on_change)
                .describe("C++ compiler command"),
            Attribute::string("fc")
                .on_change(experiment::rebuild_on_change)
                .describe("Fortran compiler command"),
            Attribute::string("tau_source")
                .default_value(download)
                .describe("path or URL of a TAU installation or source archive"),
            Attribute::string("pdt_source")
                .default_value(download)
                .on_change(experiment::rebuild_on_change)
                .describe("path or URL of a PDT installation or source archive"),
            Attribute::string("binutils_source")
                .default_value(download)
                .on_change(experiment::rebuild_on_change)
                .describe("path or URL of a GNU binutils installation or source archive"),
            Attribute::string("libunwind_source")
                .default_value(download)
                .on_change(experiment::rebuild_on_change)
                .describe("path or URL of a libunwind installation or source archive"),
            Attribute::string("papi_source")
                .on_change(experiment::rebuild_on_change)
                .describe("path or URL of a PAPI installation or source archive"),
            Attribute::string("cuda_toolkit")
                .on_change(experiment::rebuild_on_change)
                .describe("path to the NVIDIA CUDA toolkit"),
        ],
    )
    .with_hooks(&Target)
}

impl EntityHooks for Target {
    fn on_update(&self, ctrl: &Controller<'_>, model: &Model, _changes: &Changes) -> Result<(), TauError> {
        experiment::verify_users(ctrl.store(), model)
    }
}

impl Target {
    pub fn controller(store: &Store) -> Controller<'_> {
        Controller::new(EntityKind::Target, store)
    }
}

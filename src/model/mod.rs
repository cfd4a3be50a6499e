//! Entity models built on the generic controller.
//!
//! Each module declares its entity's schema and lifecycle hooks. The schemas
//! are assembled into one registry on first use, so relationships and
//! compatibility rules can name each other freely.

pub mod application;
pub mod experiment;
pub mod measurement;
pub mod project;
pub mod target;
pub mod trial;

pub use application::Application;
pub use experiment::Experiment;
pub use measurement::Measurement;
pub use project::Project;
pub use target::Target;
pub use trial::Trial;

use crate::core::schema::{EntityKind, Schema};
use std::sync::LazyLock;

static REGISTRY: LazyLock<Vec<Schema>> = LazyLock::new(|| {
    EntityKind::ALL
        .into_iter()
        .map(|kind| match kind {
            EntityKind::Project => project::schema(),
            EntityKind::Target => target::schema(),
            EntityKind::Application => application::schema(),
            EntityKind::Measurement => measurement::schema(),
            EntityKind::Experiment => experiment::schema(),
            EntityKind::Trial => trial::schema(),
        })
        .collect()
});

/// Schema registered for `kind`.
pub fn schema(kind: EntityKind) -> &'static Schema {
    &REGISTRY[kind as usize]
}

//! Core primitives: storage, locking, schema, controllers and the external
//! capabilities the entity models consume.

pub mod compat;
pub mod config;
pub mod controller;
pub mod database;
pub mod error;
pub mod execute;
pub mod installation;
pub mod lock;
pub mod output;
pub mod record;
pub mod schema;
pub mod store;
pub mod time;
pub mod topic;

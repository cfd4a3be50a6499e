//! Project storage: the `.tau` directory that holds the record database, the
//! interprocess lock, configuration, and project data directories.
//!
//! A `Store` is the unit everything else is scoped to. Controllers borrow it
//! for the duration of one operation; the notification topics live here so
//! they survive across the many short-lived controllers a command creates.

use crate::core::config::{self, StoreConfig};
use crate::core::database::JsonDatabase;
use crate::core::error::TauError;
use crate::core::lock::{InterProcessLock, LockGuard};
use crate::core::topic::Topics;
use serde_json::Value;
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Name of the storage directory inside a project directory.
pub const STORE_DIR: &str = ".tau";
/// Name of the record database inside the storage directory.
pub const DATABASE_FILE: &str = "project.json";

#[derive(Debug)]
pub struct Store {
    prefix: PathBuf,
    config: StoreConfig,
    database: JsonDatabase,
    lock: InterProcessLock,
    topics: Rc<RefCell<Topics>>,
}

impl Store {
    /// Open the storage rooted at `prefix` (the `.tau` directory), creating it
    /// if it does not exist.
    pub fn open(prefix: &Path) -> Result<Self, TauError> {
        fs::create_dir_all(prefix).map_err(|e| {
            TauError::configuration(
                format!("Cannot create directory '{}': {}", prefix.display(), e),
                &["Check that you have `write` access"],
            )
        })?;
        let config = config::load_config(prefix)?;
        let database = JsonDatabase::open(&prefix.join(DATABASE_FILE))?;
        let lock = InterProcessLock::for_prefix(prefix, config.lock_timeout(), config.stale_after());
        Ok(Self {
            prefix: prefix.to_path_buf(),
            config,
            database,
            lock,
            topics: Rc::new(RefCell::new(Topics::new())),
        })
    }

    /// Create (or reopen) the storage inside `project_dir`.
    pub fn create(project_dir: &Path) -> Result<Self, TauError> {
        Self::open(&project_dir.join(STORE_DIR))
    }

    /// Open the storage of the nearest project directory at or above `start_dir`.
    pub fn find(start_dir: &Path) -> Result<Self, TauError> {
        let root = find_project_root(start_dir)?;
        Self::open(&root.join(STORE_DIR))
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn database(&self) -> &JsonDatabase {
        &self.database
    }

    /// Take the interprocess lock. Re-entrant within this store.
    pub fn lock(&self) -> Result<LockGuard<'_>, TauError> {
        self.lock.acquire()
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_held()
    }

    /// Queue `payload` on `topic`. Inside a transaction the payload is only
    /// queued once the transaction commits.
    pub fn push_to_topic(&self, topic: &str, payload: Value) {
        let topics = Rc::clone(&self.topics);
        let topic = topic.to_string();
        self.database
            .after_commit(move || topics.borrow_mut().push(&topic, payload));
    }

    /// Drain and return every payload queued on `topic`.
    pub fn pop_topic(&self, topic: &str) -> Vec<Value> {
        self.topics.borrow_mut().pop(topic)
    }
}

/// Walk up from `start_dir` to the first directory containing a `.tau` storage.
pub fn find_project_root(start_dir: &Path) -> Result<PathBuf, TauError> {
    let mut current_dir = PathBuf::from(start_dir);
    loop {
        if current_dir.join(STORE_DIR).join(DATABASE_FILE).exists() {
            return Ok(current_dir);
        }
        if !current_dir.pop() {
            return Err(TauError::ProjectSelectionError(
                "No project found in the current or any parent directory. Run `tau init` first."
                    .to_string(),
            ));
        }
    }
}

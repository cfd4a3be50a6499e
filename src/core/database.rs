//! Persistent, transactional record storage.
//!
//! The whole database is one JSON file holding an object per table; each table
//! maps the decimal record id to the record's field object:
//!
//! ```text
//! { "Project": { "1": { "name": "p1", ... } }, "Target": { ... } }
//! ```
//!
//! Outside a transaction every write re-reads the file, applies the change and
//! writes it back (atomically, via a temporary file and rename). Inside a
//! transaction all reads and writes use an in-memory working copy that is only
//! written when the outermost transaction commits. A failed (or panicking)
//! transaction leaves the file exactly as it was when the transaction began.
//!
//! This type is not safe against concurrent writers from other processes on its
//! own; callers serialize read-modify-write sequences with
//! [`crate::core::lock::InterProcessLock`].

use crate::core::error::TauError;
use crate::core::record::{Fields, Keys, Record, RecordId};
use regex::Regex;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

type Table = BTreeMap<RecordId, Fields>;
type Tables = BTreeMap<String, Table>;

/// Work to run once the outermost transaction has committed or rolled back.
struct Deferred(Box<dyn FnOnce()>);

impl fmt::Debug for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Deferred")
    }
}

#[derive(Debug, Default)]
struct TxState {
    depth: usize,
    working: Option<Tables>,
    dirty: bool,
    on_commit: Vec<Deferred>,
    on_rollback: Vec<Deferred>,
}

#[derive(Debug)]
pub struct JsonDatabase {
    path: PathBuf,
    readonly: bool,
    state: RefCell<TxState>,
}

impl JsonDatabase {
    /// Open (creating if needed) the database file at `path`.
    ///
    /// Parent directories are created as needed. A file that exists but cannot be
    /// opened for writing is opened read-only: reads succeed and every write
    /// fails with a configuration error.
    pub fn open(path: &Path) -> Result<Self, TauError> {
        if let Some(prefix) = path.parent() {
            fs::create_dir_all(prefix).map_err(|e| {
                TauError::configuration(
                    format!("Cannot create directory '{}': {}", prefix.display(), e),
                    &["Check that you have `write` access"],
                )
            })?;
        }

        let readonly = if path.exists() {
            match OpenOptions::new().append(true).open(path) {
                Ok(_) => false,
                Err(err) if err.kind() == ErrorKind::PermissionDenied => {
                    debug!("Failed to open {} as read-write, using read-only", path.display());
                    true
                }
                Err(err) => return Err(TauError::IoError(err)),
            }
        } else {
            fs::write(path, b"{}\n").map_err(|e| {
                TauError::configuration(
                    format!("Cannot create '{}': {}", path.display(), e),
                    &["Check that you have `write` access"],
                )
            })?;
            false
        };

        File::open(path).map_err(|_| {
            TauError::configuration(
                format!("Database file '{}' exists but cannot be read.", path.display()),
                &["Check that you have `read` access"],
            )
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            readonly,
            state: RefCell::new(TxState::default()),
        })
    }

    /// Open an existing database file for reading only.
    pub fn open_read_only(path: &Path) -> Result<Self, TauError> {
        File::open(path).map_err(|_| {
            TauError::configuration(
                format!("Database file '{}' cannot be read.", path.display()),
                &["Check that the file exists and that you have `read` access"],
            )
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            readonly: true,
            state: RefCell::new(TxState::default()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Current transaction nesting depth (0 when no transaction is open).
    pub fn transaction_depth(&self) -> usize {
        self.state.borrow().depth
    }

    // ===== Transactions =====

    /// Enter a transactional scope. Nested calls only bump a depth counter.
    pub fn begin(&self) -> Result<Transaction<'_>, TauError> {
        let needs_load = self.state.borrow().depth == 0;
        if needs_load {
            let tables = self.load()?;
            let mut state = self.state.borrow_mut();
            state.working = Some(tables);
            state.dirty = false;
        }
        self.state.borrow_mut().depth += 1;
        Ok(Transaction {
            db: self,
            finished: false,
        })
    }

    /// Run `f` inside a transactional scope, committing on `Ok` and rolling
    /// back on `Err` or panic.
    pub fn transaction<F, R>(&self, f: F) -> Result<R, TauError>
    where
        F: FnOnce() -> Result<R, TauError>,
    {
        let tx = self.begin()?;
        let value = f()?;
        tx.commit()?;
        Ok(value)
    }

    /// Run `action` after the outermost transaction commits, or right away when
    /// no transaction is open. The action is discarded on rollback.
    pub fn after_commit(&self, action: impl FnOnce() + 'static) {
        {
            let mut state = self.state.borrow_mut();
            if state.depth > 0 {
                state.on_commit.push(Deferred(Box::new(action)));
                return;
            }
        }
        action();
    }

    /// Run `action` if the open transaction rolls back. Outside a transaction
    /// nothing can roll back, so the action is dropped.
    pub fn on_rollback(&self, action: impl FnOnce() + 'static) {
        let mut state = self.state.borrow_mut();
        if state.depth > 0 {
            state.on_rollback.push(Deferred(Box::new(action)));
        }
    }

    fn finish(&self, commit: bool) -> Result<(), TauError> {
        let (pending, on_commit, on_rollback) = {
            let mut state = self.state.borrow_mut();
            state.depth = state.depth.saturating_sub(1);
            if state.depth > 0 {
                return Ok(());
            }
            let working = state.working.take();
            let dirty = std::mem::take(&mut state.dirty);
            let pending = if commit && dirty { working } else { None };
            (
                pending,
                std::mem::take(&mut state.on_commit),
                std::mem::take(&mut state.on_rollback),
            )
        };
        let result = match pending {
            Some(tables) => {
                debug!("{}: commit", self.path.display());
                self.write(&tables)
            }
            None => {
                if !commit {
                    debug!("{}: rollback", self.path.display());
                }
                Ok(())
            }
        };
        if commit && result.is_ok() {
            for Deferred(action) in on_commit {
                action();
            }
        } else {
            for Deferred(action) in on_rollback.into_iter().rev() {
                action();
            }
        }
        result
    }

    // ===== File access =====

    fn load(&self) -> Result<Tables, TauError> {
        let bytes = fs::read(&self.path)?;
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Tables::new());
        }
        serde_json::from_slice(&bytes).map_err(|e| {
            TauError::configuration(
                format!("Database file '{}' is corrupt: {}", self.path.display(), e),
                &["Restore the file from a backup or delete the project storage"],
            )
        })
    }

    fn write(&self, tables: &Tables) -> Result<(), TauError> {
        let mut body = serde_json::to_vec_pretty(tables)?;
        body.push(b'\n');
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &body)
            .and_then(|_| fs::rename(&tmp, &self.path))
            .map_err(|e| {
                let _ = fs::remove_file(&tmp);
                TauError::configuration(
                    format!("Cannot write to '{}': {}", self.path.display(), e),
                    &["Check that you have `write` access."],
                )
            })
    }

    fn read<F, R>(&self, f: F) -> Result<R, TauError>
    where
        F: FnOnce(&Tables) -> R,
    {
        {
            let state = self.state.borrow();
            if let Some(working) = state.working.as_ref() {
                return Ok(f(working));
            }
        }
        let tables = self.load()?;
        Ok(f(&tables))
    }

    fn modify<F, R>(&self, f: F) -> Result<R, TauError>
    where
        F: FnOnce(&mut Tables) -> R,
    {
        if self.readonly {
            return Err(TauError::configuration(
                format!("Cannot write to '{}'", self.path.display()),
                &["Check that you have `write` access."],
            ));
        }
        {
            let mut state = self.state.borrow_mut();
            if state.depth > 0 {
                state.dirty = true;
                let working = state.working.get_or_insert_with(Tables::new);
                return Ok(f(working));
            }
        }
        let mut tables = self.load()?;
        let value = f(&mut tables);
        self.write(&tables)?;
        Ok(value)
    }

    // ===== Queries =====

    fn collect(table: Option<&Table>, keys: &Keys, match_any: bool) -> Vec<Record> {
        let Some(table) = table else {
            return Vec::new();
        };
        let hits = |(id, fields): (&RecordId, &Fields)| {
            let record = Record::with_id(*id, fields.clone());
            keys.selects(*id, &record, match_any).then_some(record)
        };
        match keys {
            Keys::ById(id) => table.get_key_value(id).and_then(hits).into_iter().collect(),
            _ => table.iter().filter_map(hits).collect(),
        }
    }

    fn matching_ids(table: Option<&Table>, keys: &Keys, match_any: bool) -> Vec<RecordId> {
        Self::collect(table, keys, match_any)
            .iter()
            .filter_map(Record::id)
            .collect()
    }

    /// Number of records in the table.
    pub fn count(&self, table: &str) -> Result<usize, TauError> {
        self.read(|tables| tables.get(table).map_or(0, BTreeMap::len))
    }

    /// First record (lowest id) selected by `keys`, if any.
    pub fn get(&self, table: &str, keys: &Keys, match_any: bool) -> Result<Option<Record>, TauError> {
        debug!("{:?}: get(keys={:?})", table, keys);
        self.read(|tables| {
            Self::collect(tables.get(table), keys, match_any)
                .into_iter()
                .next()
        })
    }

    /// Every record selected by `keys`, ordered by id.
    pub fn search(&self, table: &str, keys: &Keys, match_any: bool) -> Result<Vec<Record>, TauError> {
        debug!("{:?}: search(keys={:?})", table, keys);
        self.read(|tables| Self::collect(tables.get(table), keys, match_any))
    }

    /// Records whose `field` is present and satisfies `predicate`.
    pub fn match_field<P>(&self, table: &str, field: &str, predicate: P) -> Result<Vec<Record>, TauError>
    where
        P: Fn(&Value) -> bool,
    {
        debug!("{:?}: match_field({:?})", table, field);
        self.read(|tables| {
            Self::collect(tables.get(table), &Keys::All, false)
                .into_iter()
                .filter(|rec| rec.get(field).is_some_and(&predicate))
                .collect()
        })
    }

    /// Records whose string `field` matches `regex`.
    pub fn match_regex(&self, table: &str, field: &str, regex: &Regex) -> Result<Vec<Record>, TauError> {
        self.match_field(table, field, |value| {
            value.as_str().is_some_and(|text| regex.is_match(text))
        })
    }

    /// True if at least one record is selected by `keys`.
    pub fn contains(&self, table: &str, keys: &Keys, match_any: bool) -> Result<bool, TauError> {
        debug!("{:?}: contains(keys={:?})", table, keys);
        self.read(|tables| !Self::collect(tables.get(table), keys, match_any).is_empty())
    }

    // ===== Mutations =====

    /// Insert a new record and return it with its assigned id.
    pub fn insert(&self, table: &str, fields: Fields) -> Result<Record, TauError> {
        debug!("{:?}: insert {:?}", table, fields);
        self.modify(|tables| {
            let rows = tables.entry(table.to_string()).or_default();
            let id = rows.keys().next_back().map_or(1, |last| last + 1);
            rows.insert(id, fields.clone());
            Record::with_id(id, fields)
        })
    }

    /// Merge `fields` into every selected record. Returns the updated ids.
    pub fn update(
        &self,
        table: &str,
        fields: &Fields,
        keys: &Keys,
        match_any: bool,
    ) -> Result<Vec<RecordId>, TauError> {
        debug!("{:?}: update({:?}, keys={:?})", table, fields, keys);
        self.modify(|tables| {
            let ids = Self::matching_ids(tables.get(table), keys, match_any);
            if let Some(rows) = tables.get_mut(table) {
                for id in &ids {
                    if let Some(row) = rows.get_mut(id) {
                        for (name, value) in fields {
                            row.insert(name.clone(), value.clone());
                        }
                    }
                }
            }
            ids
        })
    }

    /// Remove `fields` from every selected record. Returns the updated ids.
    pub fn unset(
        &self,
        table: &str,
        fields: &[String],
        keys: &Keys,
        match_any: bool,
    ) -> Result<Vec<RecordId>, TauError> {
        debug!("{:?}: unset({:?}, keys={:?})", table, fields, keys);
        self.modify(|tables| {
            let ids = Self::matching_ids(tables.get(table), keys, match_any);
            if let Some(rows) = tables.get_mut(table) {
                for id in &ids {
                    if let Some(row) = rows.get_mut(id) {
                        for name in fields {
                            row.shift_remove(name);
                        }
                    }
                }
            }
            ids
        })
    }

    /// Delete every selected record. Returns the removed ids.
    pub fn remove(&self, table: &str, keys: &Keys, match_any: bool) -> Result<Vec<RecordId>, TauError> {
        debug!("{:?}: remove(keys={:?})", table, keys);
        self.modify(|tables| {
            let ids = Self::matching_ids(tables.get(table), keys, match_any);
            if let Some(rows) = tables.get_mut(table) {
                for id in &ids {
                    rows.remove(id);
                }
            }
            ids
        })
    }

    /// Delete every record in the table.
    pub fn purge(&self, table: &str) -> Result<(), TauError> {
        debug!("{:?}: purge()", table);
        self.modify(|tables| {
            tables.remove(table);
        })
    }
}

/// A transactional scope. Dropping it without [`Transaction::commit`] rolls back.
pub struct Transaction<'a> {
    db: &'a JsonDatabase,
    finished: bool,
}

impl Transaction<'_> {
    pub fn commit(mut self) -> Result<(), TauError> {
        self.finished = true;
        self.db.finish(true)
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.db.finish(false);
        }
    }
}

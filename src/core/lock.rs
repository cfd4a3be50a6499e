//! Re-entrant interprocess lock over a storage prefix.
//!
//! The lock is a file created with `create_new`, so exactly one process wins.
//! The winner records its pid and a unique token in the file. Nested
//! acquisitions from the same handle only bump a depth counter; the file is
//! removed when the outermost guard is dropped.
//!
//! A lock file whose holder pid no longer exists, or that is older than the
//! configured stale threshold, is considered abandoned and is broken.

use crate::core::error::TauError;
use crate::core::time;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

pub const LOCK_FILE: &str = ".lock";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub token: String,
    pub acquired_at: String,
}

#[derive(Debug)]
struct Held {
    token: String,
    depth: usize,
}

#[derive(Debug)]
pub struct InterProcessLock {
    path: PathBuf,
    timeout: Duration,
    stale_after: Duration,
    held: RefCell<Option<Held>>,
}

impl InterProcessLock {
    pub fn new(path: PathBuf, timeout: Duration, stale_after: Duration) -> Self {
        Self {
            path,
            timeout,
            stale_after,
            held: RefCell::new(None),
        }
    }

    /// Lock over `<prefix>/.lock`.
    pub fn for_prefix(prefix: &Path, timeout: Duration, stale_after: Duration) -> Self {
        Self::new(prefix.join(LOCK_FILE), timeout, stale_after)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.held.borrow().is_some()
    }

    /// Block until the lock is held by this handle, or the timeout expires.
    pub fn acquire(&self) -> Result<LockGuard<'_>, TauError> {
        if let Some(held) = self.held.borrow_mut().as_mut() {
            held.depth += 1;
            return Ok(LockGuard { lock: self });
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(token) = self.try_create()? {
                debug!("Acquired lock {}", self.path.display());
                *self.held.borrow_mut() = Some(Held { token, depth: 1 });
                return Ok(LockGuard { lock: self });
            }
            if self.break_if_stale() {
                continue;
            }
            if Instant::now() >= deadline {
                let holder = self
                    .read_holder()
                    .map(|h| format!(" (held by pid {} since {})", h.pid, h.acquired_at))
                    .unwrap_or_default();
                return Err(TauError::ConfigurationError {
                    message: format!(
                        "Timed out waiting for lock '{}'{}",
                        self.path.display(),
                        holder
                    ),
                    hints: vec![
                        "Wait for the other process to finish and try again.".to_string(),
                        format!(
                            "If no other process is running, delete '{}'.",
                            self.path.display()
                        ),
                    ],
                });
            }
            std::thread::sleep(Duration::from_millis(25 + jitter_ms(75)));
        }
    }

    fn try_create(&self) -> Result<Option<String>, TauError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = match OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(None),
            Err(err) if err.kind() == ErrorKind::PermissionDenied => {
                return Err(TauError::configuration(
                    format!("Cannot create lock file '{}'", self.path.display()),
                    &["Check that you have `write` access."],
                ));
            }
            Err(err) => return Err(TauError::IoError(err)),
        };
        let holder = LockHolder {
            pid: std::process::id(),
            token: time::new_token(),
            acquired_at: time::now_rfc3339(),
        };
        let body = serde_json::to_vec(&holder)?;
        file.write_all(&body)?;
        file.flush()?;
        Ok(Some(holder.token))
    }

    pub fn read_holder(&self) -> Option<LockHolder> {
        read_holder_at(&self.path)
    }

    fn age(&self) -> Option<Duration> {
        let modified = fs::metadata(&self.path).ok()?.modified().ok()?;
        SystemTime::now().duration_since(modified).ok()
    }

    /// Remove an abandoned lock file. Returns true if one was removed.
    fn break_if_stale(&self) -> bool {
        let holder = self.read_holder();
        let dead_holder = holder.as_ref().is_some_and(|h| !process_alive(h.pid));
        let expired = self.age().is_some_and(|age| age > self.stale_after);
        if !(dead_holder || expired) {
            return false;
        }
        warn!(
            "Breaking stale lock {} ({})",
            self.path.display(),
            if dead_holder { "holder exited" } else { "expired" }
        );
        self.break_lock(holder.map(|h| h.token))
    }

    /// Move the lock file aside and delete it, provided it still carries
    /// `stale_token`. A file that changed hands in the meantime is put back.
    fn break_lock(&self, stale_token: Option<String>) -> bool {
        let aside = self.path.with_file_name(format!("{}.stale.{}", LOCK_FILE, time::new_token()));
        if fs::rename(&self.path, &aside).is_err() {
            // Another waiter got there first.
            return false;
        }
        let moved_token = read_holder_at(&aside).map(|h| h.token);
        if moved_token != stale_token {
            debug!("Lock {} changed hands, restoring it", self.path.display());
            if let Err(err) = fs::hard_link(&aside, &self.path) {
                warn!("Cannot restore lock {}: {}", self.path.display(), err);
            }
            remove_aside(&aside);
            return false;
        }
        remove_aside(&aside);
        true
    }

    fn release(&self) {
        let mut held = self.held.borrow_mut();
        let Some(state) = held.as_mut() else {
            return;
        };
        state.depth -= 1;
        if state.depth > 0 {
            return;
        }
        let token = std::mem::take(&mut state.token);
        *held = None;
        // Only remove the file if it is still ours; it may have been broken as stale.
        if self.read_holder().is_some_and(|h| h.token == token) {
            let _ = fs::remove_file(&self.path);
            debug!("Released lock {}", self.path.display());
        }
    }
}

/// Releases one level of the lock when dropped.
#[must_use]
#[derive(Debug)]
pub struct LockGuard<'a> {
    lock: &'a InterProcessLock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

fn read_holder_at(path: &Path) -> Option<LockHolder> {
    let text = fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}

fn remove_aside(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        warn!("Cannot remove {}: {}", path.display(), err);
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    // Without a liveness check, rely on the age threshold alone.
    true
}

fn jitter_ms(max_exclusive: u64) -> u64 {
    if max_exclusive <= 1 {
        return 0;
    }
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    now_ms % max_exclusive
}

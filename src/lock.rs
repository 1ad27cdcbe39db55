//! The starting lock: an exclusive-create file serializing daemon startup.
//!
//! Whoever creates `starting.lock` owns the critical section between binding
//! the endpoint and publishing leadership. `commit()` publishes by renaming
//! the lock to `pid` in one atomic step, so there is never a moment where
//! both files claim different owners. A lock file older than
//! [`STALE_LOCK_AGE`] belongs to a process that died mid-startup and may be
//! taken over.

use crate::error::{Result, SockdError};
use crate::paths::ServicePaths;
use crate::process::{self, Signal};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, Once, OnceLock};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// A `starting.lock` older than this was abandoned by a crashed starter.
pub const STALE_LOCK_AGE: Duration = Duration::from_millis(2000);

/// Paths of every lock currently held by this process.
///
/// Process-wide on purpose: the panic hook must be able to enumerate held
/// locks synchronously, without reaching into any particular instance.
fn held_locks() -> &'static Mutex<HashSet<PathBuf>> {
    static HELD: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    HELD.get_or_init(|| Mutex::new(HashSet::new()))
}

fn register_held(path: &Path) {
    if let Ok(mut held) = held_locks().lock() {
        held.insert(path.to_path_buf());
    }
}

fn deregister_held(path: &Path) {
    if let Ok(mut held) = held_locks().lock() {
        held.remove(path);
    }
}

/// Unlink every still-held starting lock. Runs from the panic hook; safe to
/// call any number of times.
pub fn release_all_held() {
    let paths: Vec<PathBuf> = match held_locks().lock() {
        Ok(mut held) => held.drain().collect(),
        Err(_) => return,
    };
    for path in paths {
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = ?path, error = %e, "Failed to remove starting lock during cleanup");
            }
        }
    }
}

/// Install a process-wide panic hook that unlinks held locks before the
/// previous hook runs. Installed at most once.
pub(crate) fn install_cleanup_hook() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            release_all_held();
            previous(info);
        }));
    });
}

/// Single-writer exclusive lock on a service's daemon startup.
#[derive(Debug)]
pub struct StartingLock {
    lock_path: PathBuf,
    pid_path: PathBuf,
    pid: u32,
    acquired: bool,
}

impl StartingLock {
    #[must_use]
    pub fn new(paths: &ServicePaths) -> Self {
        Self {
            lock_path: paths.lock_path(),
            pid_path: paths.pid_path(),
            pid: std::process::id(),
            acquired: false,
        }
    }

    #[must_use]
    pub const fn is_acquired(&self) -> bool {
        self.acquired
    }

    /// Take the lock, or fail with [`SockdError::LockContended`] when a
    /// fresh lock file already exists.
    ///
    /// A stale lock (older than [`STALE_LOCK_AGE`]) is taken over: its
    /// recorded PID gets a best-effort SIGTERM, the file is unlinked, and
    /// the exclusive create is retried once. After creating, the contents
    /// are read back and verified; any mismatch means another process won a
    /// race through this same path and the lock is lost.
    ///
    /// Idempotent: acquiring an already-held instance is a no-op.
    pub fn acquire(&mut self) -> Result<()> {
        if self.acquired {
            return Ok(());
        }

        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SockdError::io_error(
                    format!("Failed to create daemon directory {}", parent.display()),
                    e,
                )
            })?;
        }

        let file = match self.try_create() {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let age = lock_age(&self.lock_path);
                if age < STALE_LOCK_AGE {
                    return Err(SockdError::lock_contended(
                        self.lock_path.clone(),
                        u64::try_from(age.as_millis()).unwrap_or(u64::MAX),
                    ));
                }
                self.take_over_stale();
                self.try_create().map_err(|e| {
                    SockdError::io_error(
                        format!(
                            "Failed to recreate starting lock {} after stale takeover",
                            self.lock_path.display()
                        ),
                        e,
                    )
                })?
            }
            Err(e) => {
                return Err(SockdError::io_error(
                    format!("Failed to create starting lock {}", self.lock_path.display()),
                    e,
                ));
            }
        };

        self.write_and_verify(file)?;

        install_cleanup_hook();
        register_held(&self.lock_path);
        self.acquired = true;
        info!(lock_path = ?self.lock_path, pid = self.pid, "Starting lock acquired");
        Ok(())
    }

    /// Remove the lock file and mark not-acquired. No-op when not held.
    pub fn release(&mut self) {
        if !self.acquired {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.lock_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(lock_path = ?self.lock_path, error = %e, "Failed to remove starting lock");
            }
        }
        deregister_held(&self.lock_path);
        self.acquired = false;
        debug!(lock_path = ?self.lock_path, "Starting lock released");
    }

    /// Publish leadership: atomically rename `starting.lock` to `pid`.
    pub fn commit(&mut self) -> Result<()> {
        if !self.acquired {
            return Err(SockdError::other(
                "Cannot commit a starting lock that is not held",
            ));
        }
        std::fs::rename(&self.lock_path, &self.pid_path).map_err(|e| {
            SockdError::io_error(
                format!(
                    "Failed to commit starting lock to {}",
                    self.pid_path.display()
                ),
                e,
            )
        })?;
        deregister_held(&self.lock_path);
        self.acquired = false;
        info!(pid_path = ?self.pid_path, pid = self.pid, "Leadership committed");
        Ok(())
    }

    fn try_create(&self) -> std::io::Result<File> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
    }

    /// Evict whoever abandoned the lock: signal its recorded PID, if that
    /// process still exists, and unlink.
    fn take_over_stale(&self) {
        match std::fs::read_to_string(&self.lock_path) {
            Ok(contents) => {
                if let Ok(stale_pid) = contents.trim().parse::<u32>() {
                    if process::is_alive(stale_pid) {
                        info!(stale_pid, lock_path = ?self.lock_path, "Taking over stale starting lock");
                        process::signal(stale_pid, Signal::Terminate);
                    } else {
                        debug!(stale_pid, lock_path = ?self.lock_path, "Stale lock holder already gone");
                    }
                }
            }
            Err(e) => {
                debug!(lock_path = ?self.lock_path, error = %e, "Stale lock unreadable");
            }
        }
        let _ = std::fs::remove_file(&self.lock_path);
    }

    fn write_and_verify(&self, mut file: File) -> Result<()> {
        let expected = format!("{}\n", self.pid);
        let write_result = file
            .write_all(expected.as_bytes())
            .and_then(|()| file.sync_all());
        if let Err(e) = write_result {
            return Err(SockdError::io_error(
                format!("Failed to write starting lock {}", self.lock_path.display()),
                e,
            ));
        }
        drop(file);

        let found = std::fs::read_to_string(&self.lock_path).map_err(|e| {
            SockdError::io_error(
                format!(
                    "Failed to verify starting lock {}",
                    self.lock_path.display()
                ),
                e,
            )
        })?;
        if found != expected {
            return Err(SockdError::lock_lost(self.lock_path.clone(), expected, found));
        }
        Ok(())
    }
}

impl Drop for StartingLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn lock_age(path: &Path) -> Duration {
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
        .unwrap_or(Duration::ZERO)
}

//! Ownership of temporary working directories for one run.
//!
//! The guard is a registry of `tempfile::TempDir` values. A directory is
//! created and registered under the same lock, so termination can never miss
//! one. `complete()` ends a normal run; `terminate()` is the signal path and
//! also sets the cancellation flag builds observe before starting.

pub mod signals;

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    Idle,
    Active,
    Completed,
    Cleaning,
}

struct Registry {
    state: GuardState,
    dirs: Vec<TempDir>,
}

struct Inner {
    registry: Mutex<Registry>,
    cancelled: AtomicBool,
    signal: AtomicI32,
    children: Mutex<BTreeSet<u32>>,
}

#[derive(Clone)]
pub struct LifecycleGuard {
    inner: Arc<Inner>,
}

impl Default for LifecycleGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleGuard {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry {
                    state: GuardState::Idle,
                    dirs: Vec::new(),
                }),
                cancelled: AtomicBool::new(false),
                signal: AtomicI32::new(0),
                children: Mutex::new(BTreeSet::new()),
            }),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn children(&self) -> MutexGuard<'_, BTreeSet<u32>> {
        self.inner
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> GuardState {
        self.registry().state
    }

    /// Create a scratch directory under `parent` and register it.
    pub fn create_scratch_dir(&self, parent: &Path, label: &str) -> io::Result<ScratchDir> {
        let mut registry = self.registry();
        match registry.state {
            GuardState::Idle | GuardState::Active => {}
            GuardState::Completed | GuardState::Cleaning => {
                return Err(io::Error::new(
                    io::ErrorKind::Interrupted,
                    "run is shutting down; no new scratch directories",
                ));
            }
        }

        let dir = tempfile::Builder::new()
            .prefix(&format!(".refplat-{label}-"))
            .tempdir_in(parent)?;
        let path = dir.path().to_path_buf();
        registry.dirs.push(dir);
        registry.state = GuardState::Active;
        debug!("registered scratch directory {}", path.display());

        Ok(ScratchDir {
            path,
            guard: self.clone(),
        })
    }

    /// Remove one registered directory now.
    pub fn release(&self, path: &Path) -> io::Result<()> {
        let dir = {
            let mut registry = self.registry();
            let Some(position) = registry.dirs.iter().position(|d| d.path() == path) else {
                return Ok(());
            };
            registry.dirs.swap_remove(position)
        };
        dir.close()
    }

    pub fn registered_dirs(&self) -> Vec<PathBuf> {
        self.registry()
            .dirs
            .iter()
            .map(|d| d.path().to_path_buf())
            .collect()
    }

    /// Normal end of run: remove every registered directory.
    ///
    /// Returns how many were removed. A no-op once termination has begun.
    pub fn complete(&self) -> usize {
        let dirs = {
            let mut registry = self.registry();
            if registry.state == GuardState::Cleaning {
                return 0;
            }
            registry.state = GuardState::Completed;
            std::mem::take(&mut registry.dirs)
        };
        remove_all(dirs)
    }

    /// Abnormal end of run: cancel, then remove every registered directory.
    pub fn terminate(&self) -> usize {
        self.cancel();
        let dirs = {
            let mut registry = self.registry();
            registry.state = GuardState::Cleaning;
            std::mem::take(&mut registry.dirs)
        };
        remove_all(dirs)
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn record_signal(&self, signal: i32) {
        self.inner.signal.store(signal, Ordering::SeqCst);
        self.cancel();
    }

    /// Signal number that cancelled the run, if any.
    pub fn received_signal(&self) -> Option<i32> {
        match self.inner.signal.load(Ordering::SeqCst) {
            0 => None,
            signal => Some(signal),
        }
    }

    /// Track a running child process until the ticket is dropped.
    pub fn track_child(&self, pid: u32) -> ChildTicket {
        self.children().insert(pid);
        ChildTicket {
            pid,
            guard: self.clone(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.children().len()
    }

    /// Wait up to `grace` for tracked children to finish.
    pub fn wait_for_children(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        while self.in_flight() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(100));
        }
        true
    }

    /// Send SIGTERM to every tracked child.
    pub fn terminate_children(&self) {
        for pid in self.children().iter() {
            let Ok(pid) = libc::pid_t::try_from(*pid) else {
                continue;
            };
            // SAFETY: kill(2) has no memory-safety preconditions.
            let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
            if rc != 0 {
                debug!(pid, "SIGTERM failed: {}", io::Error::last_os_error());
            }
        }
    }
}

fn remove_all(dirs: Vec<TempDir>) -> usize {
    let mut removed = 0;
    for dir in dirs {
        let path = dir.path().to_path_buf();
        match dir.close() {
            Ok(()) => removed += 1,
            Err(err) => warn!("failed to remove scratch directory {}: {err}", path.display()),
        }
    }
    removed
}

/// Scoped handle to a registered scratch directory. Released on drop.
pub struct ScratchDir {
    path: PathBuf,
    guard: LifecycleGuard,
}

impl ScratchDir {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(err) = self.guard.release(&self.path) {
            warn!(
                "failed to remove scratch directory {}: {err}",
                self.path.display()
            );
        }
    }
}

/// Keeps a child pid registered while the child runs.
pub struct ChildTicket {
    pid: u32,
    guard: LifecycleGuard,
}

impl Drop for ChildTicket {
    fn drop(&mut self) {
        self.guard.children().remove(&self.pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_scratch_dirs_move_guard_to_active() {
        let root = TempDir::new().unwrap();
        let guard = LifecycleGuard::new();
        assert_eq!(guard.state(), GuardState::Idle);

        let scratch = guard.create_scratch_dir(root.path(), "nested").unwrap();
        assert!(scratch.path().is_dir());
        assert_eq!(guard.state(), GuardState::Active);
        assert_eq!(guard.registered_dirs(), vec![scratch.path().to_path_buf()]);
    }

    #[test]
    fn test_dropping_scratch_dir_releases_it() {
        let root = TempDir::new().unwrap();
        let guard = LifecycleGuard::new();
        let path = {
            let scratch = guard.create_scratch_dir(root.path(), "nested").unwrap();
            fs::write(scratch.path().join("image.iso"), b"data").unwrap();
            scratch.path().to_path_buf()
        };
        assert!(!path.exists());
        assert!(guard.registered_dirs().is_empty());
    }

    #[test]
    fn test_complete_removes_registered_dirs() {
        let root = TempDir::new().unwrap();
        let guard = LifecycleGuard::new();
        let a = guard.create_scratch_dir(root.path(), "a").unwrap();
        let b = guard.create_scratch_dir(root.path(), "b").unwrap();
        let (a_path, b_path) = (a.path().to_path_buf(), b.path().to_path_buf());
        std::mem::forget(a);
        std::mem::forget(b);

        assert_eq!(guard.complete(), 2);
        assert_eq!(guard.state(), GuardState::Completed);
        assert!(!a_path.exists());
        assert!(!b_path.exists());
        assert!(guard.create_scratch_dir(root.path(), "late").is_err());
    }

    #[test]
    fn test_terminate_mid_run_leaves_nothing_behind() {
        let root = TempDir::new().unwrap();
        let guard = LifecycleGuard::new();
        let scratch = guard.create_scratch_dir(root.path(), "nested").unwrap();
        fs::create_dir_all(scratch.path().join("deep/tree")).unwrap();
        fs::write(scratch.path().join("deep/tree/disk.qcow2"), vec![0u8; 1024]).unwrap();

        let worker_guard = guard.clone();
        let handle = thread::spawn(move || worker_guard.terminate());
        assert_eq!(handle.join().unwrap(), 1);

        assert_eq!(guard.state(), GuardState::Cleaning);
        assert!(guard.is_cancelled());
        assert!(!scratch.path().exists());
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);

        // complete() after termination does not change the state
        assert_eq!(guard.complete(), 0);
        assert_eq!(guard.state(), GuardState::Cleaning);
        drop(scratch);
    }

    #[test]
    fn test_child_tickets_track_in_flight_processes() {
        let guard = LifecycleGuard::new();
        let ticket = guard.track_child(4242);
        assert_eq!(guard.in_flight(), 1);
        assert!(!guard.wait_for_children(Duration::from_millis(10)));
        drop(ticket);
        assert_eq!(guard.in_flight(), 0);
        assert!(guard.wait_for_children(Duration::from_millis(10)));
    }
}

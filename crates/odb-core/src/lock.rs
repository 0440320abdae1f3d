//! Two-level reader/writer lock.
//!
//! Threads of one process first go through a `Mutex` + `Condvar` state
//! machine (writer priority: new readers queue behind a waiting writer),
//! then through an advisory `flock` on the lock file shared by all processes
//! attached to the same arena. Both levels share one deadline.

use std::cell::UnsafeCell;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use fs2::FileExt;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::error::{OdbError, Result};

const BACKOFF_START: Duration = Duration::from_millis(1);
const BACKOFF_MAX: Duration = Duration::from_millis(20);

#[derive(Debug, Default)]
struct LockState {
    readers: usize,
    writer: bool,
    waiting_writers: usize,
}

struct LockFile {
    file: File,
    path: PathBuf,
    /// Readers in this process currently covered by the shared flock
    shared_holders: Mutex<usize>,
}

/// Reader/writer lock around `T`, optionally extended across processes
pub struct LockManager<T> {
    data: UnsafeCell<T>,
    state: Mutex<LockState>,
    cond: Condvar,
    file: Option<LockFile>,
}

// Access to `data` is only handed out through the guards below.
unsafe impl<T: Send> Send for LockManager<T> {}
unsafe impl<T: Send + Sync> Sync for LockManager<T> {}

fn lock_mutex<S>(m: &Mutex<S>) -> MutexGuard<'_, S> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// True if `pid` names a process that no longer exists
pub fn process_is_dead(pid: i32) -> bool {
    matches!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
}

impl<T> LockManager<T> {
    /// Process-local lock only
    pub fn new(data: T) -> Self {
        Self {
            data: UnsafeCell::new(data),
            state: Mutex::new(LockState::default()),
            cond: Condvar::new(),
            file: None,
        }
    }

    /// Lock that also takes an advisory flock on `path`
    pub fn with_lock_file(data: T, path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let mut manager = Self::new(data);
        manager.file = Some(LockFile {
            file,
            path: path.to_path_buf(),
            shared_holders: Mutex::new(0),
        });
        Ok(manager)
    }

    pub fn lock_path(&self) -> Option<&Path> {
        self.file.as_ref().map(|f| f.path.as_path())
    }

    /// Acquire shared access, waiting at most `timeout`
    pub fn read(&self, timeout: Duration) -> Result<SharedGuard<'_, T>> {
        let start = Instant::now();
        let deadline = start + timeout;

        let mut state = lock_mutex(&self.state);
        while state.writer || state.waiting_writers > 0 {
            state = match self.wait_until(state, deadline) {
                Some(s) => s,
                None => return Err(OdbError::Busy { waited: start.elapsed() }),
            };
        }
        state.readers += 1;
        drop(state);

        if let Some(lf) = &self.file {
            let mut holders = lock_mutex(&lf.shared_holders);
            if *holders == 0 && !retry_until(deadline, || lf.file.try_lock_shared().is_ok()) {
                drop(holders);
                self.release_reader();
                debug!(path = %lf.path.display(), "Shared flock not acquired before deadline");
                return Err(OdbError::Busy { waited: start.elapsed() });
            }
            *holders += 1;
        }
        Ok(SharedGuard { manager: self })
    }

    /// Acquire exclusive access, waiting at most `timeout`
    pub fn write(&self, timeout: Duration) -> Result<ExclusiveGuard<'_, T>> {
        let start = Instant::now();
        let deadline = start + timeout;

        let mut state = lock_mutex(&self.state);
        state.waiting_writers += 1;
        while state.writer || state.readers > 0 {
            state = match self.wait_until(state, deadline) {
                Some(s) => s,
                None => {
                    let mut state = lock_mutex(&self.state);
                    state.waiting_writers -= 1;
                    drop(state);
                    self.cond.notify_all();
                    return Err(OdbError::Busy { waited: start.elapsed() });
                }
            };
        }
        state.waiting_writers -= 1;
        state.writer = true;
        drop(state);

        let mut recovered_owner = None;
        if let Some(lf) = &self.file {
            if !retry_until(deadline, || lf.file.try_lock_exclusive().is_ok()) {
                self.release_writer();
                debug!(path = %lf.path.display(), "Exclusive flock not acquired before deadline");
                return Err(OdbError::Busy { waited: start.elapsed() });
            }
            match self.claim_owner(lf) {
                Ok(stale) => recovered_owner = stale,
                Err(e) => {
                    let _ = lf.file.unlock();
                    self.release_writer();
                    return Err(e);
                }
            }
        }
        Ok(ExclusiveGuard {
            manager: self,
            recovered_owner,
        })
    }

    /// `None` when the deadline passed; the mutex guard is consumed either way
    fn wait_until<'a>(
        &self,
        state: MutexGuard<'a, LockState>,
        deadline: Instant,
    ) -> Option<MutexGuard<'a, LockState>> {
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        let (state, _) = self
            .cond
            .wait_timeout(state, deadline - now)
            .unwrap_or_else(PoisonError::into_inner);
        Some(state)
    }

    /// Record our pid in the lock file; returns the pid of a dead previous
    /// holder that never cleared it
    fn claim_owner(&self, lf: &LockFile) -> Result<Option<i32>> {
        let mut file = &lf.file;
        let mut contents = String::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_string(&mut contents)?;

        let own = std::process::id() as i32;
        let mut stale = None;
        if let Ok(previous) = contents.trim().parse::<i32>() {
            if previous > 0 && previous != own {
                if process_is_dead(previous) {
                    warn!(
                        path = %lf.path.display(),
                        stale_pid = previous,
                        "Lock owner died while holding the database lock; force-clearing"
                    );
                    stale = Some(previous);
                } else {
                    warn!(
                        path = %lf.path.display(),
                        pid = previous,
                        "Lock file names a live process that no longer holds the lock"
                    );
                }
            }
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{own}")?;
        file.flush()?;
        Ok(stale)
    }

    fn release_reader(&self) {
        let mut state = lock_mutex(&self.state);
        state.readers -= 1;
        drop(state);
        self.cond.notify_all();
    }

    fn release_writer(&self) {
        let mut state = lock_mutex(&self.state);
        state.writer = false;
        drop(state);
        self.cond.notify_all();
    }

    /// Consume the lock and return the data
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

/// Poll `attempt` with exponential back-off until it succeeds or `deadline`
fn retry_until(deadline: Instant, mut attempt: impl FnMut() -> bool) -> bool {
    let mut backoff = BACKOFF_START;
    loop {
        if attempt() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        std::thread::sleep(backoff.min(deadline - now));
        backoff = (backoff * 2).min(BACKOFF_MAX);
    }
}

/// Shared access to the locked data
pub struct SharedGuard<'a, T> {
    manager: &'a LockManager<T>,
}

impl<T> Deref for SharedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.manager.data.get() }
    }
}

impl<T> Drop for SharedGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(lf) = &self.manager.file {
            let mut holders = lock_mutex(&lf.shared_holders);
            *holders -= 1;
            if *holders == 0 {
                if let Err(e) = lf.file.unlock() {
                    warn!(path = %lf.path.display(), error = %e, "Failed to release shared flock");
                }
            }
        }
        self.manager.release_reader();
    }
}

/// Exclusive access to the locked data
pub struct ExclusiveGuard<'a, T> {
    manager: &'a LockManager<T>,
    recovered_owner: Option<i32>,
}

impl<T> ExclusiveGuard<'_, T> {
    /// Pid of a dead previous holder that was force-cleared on acquisition
    pub fn recovered_owner(&self) -> Option<i32> {
        self.recovered_owner
    }
}

impl<T> Deref for ExclusiveGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.manager.data.get() }
    }
}

impl<T> DerefMut for ExclusiveGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.manager.data.get() }
    }
}

impl<T> Drop for ExclusiveGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(lf) = &self.manager.file {
            if let Err(e) = lf.file.set_len(0) {
                warn!(path = %lf.path.display(), error = %e, "Failed to clear lock owner");
            }
            if let Err(e) = lf.file.unlock() {
                warn!(path = %lf.path.display(), error = %e, "Failed to release exclusive flock");
            }
        }
        self.manager.release_writer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const SHORT: Duration = Duration::from_millis(50);

    #[test]
    fn test_readers_share() {
        let lock = LockManager::new(5);
        let a = lock.read(SHORT).unwrap();
        let b = lock.read(SHORT).unwrap();
        assert_eq!(*a + *b, 10);
    }

    #[test]
    fn test_writer_excludes_readers() {
        let lock = LockManager::new(0);
        let mut w = lock.write(SHORT).unwrap();
        *w = 7;
        assert!(matches!(lock.read(SHORT), Err(OdbError::Busy { .. })));
        drop(w);
        assert_eq!(*lock.read(SHORT).unwrap(), 7);
    }

    #[test]
    fn test_waiting_writer_blocks_new_readers() {
        let lock = Arc::new(LockManager::new(0u32));
        let reader = lock.read(SHORT).unwrap();

        let l2 = Arc::clone(&lock);
        let writer = std::thread::spawn(move || {
            let mut g = l2.write(Duration::from_secs(5)).unwrap();
            *g += 1;
        });
        // Give the writer time to queue
        std::thread::sleep(Duration::from_millis(50));
        assert!(matches!(lock.read(SHORT), Err(OdbError::Busy { .. })));
        drop(reader);
        writer.join().unwrap();
        assert_eq!(*lock.read(SHORT).unwrap(), 1);
    }

    #[test]
    fn test_flock_excludes_second_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("odb.lock");
        let a = LockManager::with_lock_file((), &path).unwrap();
        let b = LockManager::with_lock_file((), &path).unwrap();

        let ga = a.write(SHORT).unwrap();
        assert!(matches!(b.read(SHORT), Err(OdbError::Busy { .. })));
        drop(ga);

        let ra = a.read(SHORT).unwrap();
        let rb = b.read(SHORT).unwrap();
        assert!(matches!(b.write(SHORT), Err(OdbError::Busy { .. })));
        drop(ra);
        drop(rb);
        b.write(SHORT).unwrap();
    }

    #[test]
    fn test_dead_owner_is_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("odb.lock");
        // Larger than any pid_max, so never a live process
        std::fs::write(&path, "2147483000").unwrap();

        let lock = LockManager::with_lock_file((), &path).unwrap();
        let guard = lock.write(SHORT).unwrap();
        assert_eq!(guard.recovered_owner(), Some(2147483000));
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            std::process::id().to_string()
        );
        drop(guard);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
        assert!(lock.write(SHORT).unwrap().recovered_owner().is_none());
    }
}

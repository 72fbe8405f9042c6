//! Repository-wide exclusive lock
//!
//! `create_new` on the lock file gives single-winner semantics across
//! threads and processes. The holder's pid is written into the file so a
//! lock left behind by a dead process can be reclaimed.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::config::LockConfig;
use crate::error::{Result, SchedError};

/// Age after which a reclaim guard counts as abandoned
const GUARD_TIMEOUT: Duration = Duration::from_secs(10);

/// Exclusive lock over one scheduler repository
#[derive(Debug, Clone)]
pub struct RepositoryLock {
    path: PathBuf,
    settings: LockConfig,
}

/// Held lock; released when dropped
#[derive(Debug)]
pub struct LockLease {
    path: PathBuf,
    _file: File,
}

impl Drop for LockLease {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %err, "failed to release repository lock");
        }
    }
}

impl RepositoryLock {
    pub fn new(path: impl Into<PathBuf>, settings: LockConfig) -> Self {
        Self {
            path: path.into(),
            settings,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until the lock is held or the attempt budget runs out
    pub fn acquire(&self) -> Result<LockLease> {
        let mut attempt = 0u32;
        loop {
            if let Some(lease) = self.try_acquire()? {
                if attempt > 0 {
                    debug!(attempts = attempt + 1, "repository lock acquired after contention");
                }
                return Ok(lease);
            }
            if self.reclaim_stale() {
                continue;
            }
            attempt += 1;
            if attempt >= self.settings.max_attempts {
                return Err(SchedError::ConcurrencyFault(format!(
                    "could not acquire {} after {} attempts",
                    self.path.display(),
                    attempt
                )));
            }
            thread::sleep(self.backoff(attempt));
        }
    }

    /// One acquisition attempt; `None` if another holder has the lock
    pub fn try_acquire(&self) -> Result<Option<LockLease>> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = match OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let lease = LockLease {
            path: self.path.clone(),
            _file: file.try_clone()?,
        };
        file.write_all(std::process::id().to_string().as_bytes())?;
        file.sync_all()?;
        Ok(Some(lease))
    }

    /// Remove the lock file if its recorded holder process is gone
    ///
    /// Reclaimers serialize on a guard file and re-read the pid under it, so
    /// a waiter that saw the dead pid earlier can never delete the fresh
    /// lock another waiter took in the meantime.
    fn reclaim_stale(&self) -> bool {
        match read_pid(&self.path) {
            Some(pid) if pid != std::process::id() && !process_alive(pid) => {}
            _ => return false,
        }
        let guard_path = self.guard_path();
        let Some(_guard) = ReclaimGuard::try_new(&guard_path) else {
            return false;
        };

        let Some(pid) = read_pid(&self.path) else {
            return false;
        };
        if pid == std::process::id() || process_alive(pid) {
            return false;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => {
                warn!(
                    path = %self.path.display(),
                    pid,
                    "reclaimed repository lock from dead process"
                );
                true
            }
            Err(_) => false,
        }
    }

    fn guard_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".reclaim");
        self.path.with_file_name(name)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.settings.base_delay_ms.max(1);
        let exp = base.saturating_mul(1u64 << attempt.min(16));
        let delay = exp.min(self.settings.max_delay_ms.max(base));
        Duration::from_millis(delay + jitter_ms(base))
    }
}

fn jitter_ms(max_exclusive: u64) -> u64 {
    if max_exclusive <= 1 {
        return 0;
    }
    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    now_nanos % max_exclusive
}

/// Short-lived guard held while a stale lock is inspected and removed
struct ReclaimGuard {
    path: PathBuf,
}

impl ReclaimGuard {
    fn try_new(path: &Path) -> Option<Self> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(_) => Some(Self {
                path: path.to_path_buf(),
            }),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                // a reclaimer that died mid-way leaves its guard behind
                let abandoned = fs::metadata(path)
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|t| t.elapsed().ok())
                    .is_some_and(|age| age > GUARD_TIMEOUT);
                if abandoned {
                    let _ = fs::remove_file(path);
                }
                None
            }
            Err(_) => None,
        }
    }
}

impl Drop for ReclaimGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    // an empty file means the holder has not written its pid yet
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Whether a process with this pid currently exists
///
/// Signal 0 checks the pid without delivering anything; `ESRCH` means no such
/// process. `EPERM` means it exists under another user.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal;
    use nix::unistd::Pid;

    // 0 and negative pids address process groups
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match signal::kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => true,
    }
}

/// Whether a process with this pid currently exists
///
/// Without signal 0 every process is assumed alive.
#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn settings(max_attempts: u32) -> LockConfig {
        LockConfig {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 2,
        }
    }

    #[test]
    fn test_lock_is_exclusive_until_dropped() {
        let dir = tempdir().unwrap();
        let lock = RepositoryLock::new(dir.path().join("repository.lock"), settings(3));

        let lease = lock.acquire().unwrap();
        assert!(lock.try_acquire().unwrap().is_none());

        let err = lock.acquire().unwrap_err();
        assert!(matches!(err, SchedError::ConcurrencyFault(_)));

        drop(lease);
        assert!(!lock.path().exists());
        assert!(lock.try_acquire().unwrap().is_some());
    }

    #[test]
    fn test_lock_records_holder_pid() {
        let dir = tempdir().unwrap();
        let lock = RepositoryLock::new(dir.path().join("repository.lock"), settings(3));
        let _lease = lock.acquire().unwrap();
        let content = fs::read_to_string(lock.path()).unwrap();
        assert_eq!(content, std::process::id().to_string());
    }

    #[cfg(unix)]
    #[test]
    fn test_stale_lock_is_reclaimed() {
        let dir = tempdir().unwrap();
        let lock = RepositoryLock::new(dir.path().join("repository.lock"), settings(3));
        // pid beyond the kernel's pid_max, never alive
        fs::write(lock.path(), "4294967").unwrap();

        let lease = lock.acquire().unwrap();
        assert_eq!(fs::read_to_string(lock.path()).unwrap(), std::process::id().to_string());
        drop(lease);
        // the guard file is gone too
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_waiters_reclaiming_one_stale_lock_stay_exclusive() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::{Arc, Barrier};

        for _ in 0..20 {
            let dir = tempdir().unwrap();
            let path = dir.path().join("repository.lock");
            fs::write(&path, "4294967").unwrap();

            let start = Arc::new(Barrier::new(4));
            let inside = Arc::new(AtomicU32::new(0));
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let lock = RepositoryLock::new(path.clone(), settings(10_000));
                    let start = Arc::clone(&start);
                    let inside = Arc::clone(&inside);
                    thread::spawn(move || {
                        start.wait();
                        let _lease = lock.acquire().unwrap();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        thread::sleep(Duration::from_millis(1));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_process_alive() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(4_294_967));
        // never signal process groups
        assert!(!process_alive(0));
        assert!(!process_alive(u32::MAX));
    }

    #[test]
    fn test_threads_serialize_on_lock() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let dir = tempdir().unwrap();
        let lock = Arc::new(RepositoryLock::new(
            dir.path().join("repository.lock"),
            settings(10_000),
        ));
        let inside = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    for _ in 0..10 {
                        let _lease = lock.acquire().unwrap();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}

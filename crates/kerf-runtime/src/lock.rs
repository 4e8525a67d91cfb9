//! Host-wide exclusive file lock serializing every mutating `kerf`
//! invocation on one machine.
//!
//! Grounded in the general typed-wrapper-over-raw-syscall idiom the corpus
//! uses for thin OS bindings: a safe function wraps an `unsafe` FFI call and
//! turns a negative return / `errno` into a [`KerfError`].

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use kerf_model::{KerfError, Result};
use nix::fcntl::{Flock, FlockArg};

/// Default primary lock path. Preferred over the fallback whenever its
/// parent directory (`/var/run`) is writable.
pub const PRIMARY_LOCK_PATH: &str = "/var/run/kerf.lock";
/// Fallback lock path, used when the primary path's directory can't be
/// created or opened (e.g. running as an unprivileged user in a container
/// without `/var/run` mounted writable).
pub const FALLBACK_LOCK_PATH: &str = "/tmp/kerf.lock";

const RETRY_ATTEMPTS: u32 = 10;
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// An acquired host-wide lock. Dropping it releases the lock, on every exit
/// path including early returns via `?` — spec §4.4 step 10 and §9's
/// "resource ownership" note both require this.
pub struct LockGuard {
    _file: Flock<std::fs::File>,
    path: PathBuf,
}

impl LockGuard {
    /// The path the lock was acquired against, for diagnostics.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Acquires the host-wide lock, trying `primary` first and falling back to
/// `fallback` if the primary path can't be opened at all (not if it's
/// merely held by another process — that retries against the same path).
/// Retries acquisition 10 times at 100ms intervals before giving up, per
/// spec §4.4 step 1 / §5's 1-second total lock-acquisition timeout.
pub fn acquire(primary: &Path, fallback: &Path) -> Result<LockGuard> {
    match open_lock_file(primary) {
        Ok(file) => acquire_on(file, primary),
        Err(_) => {
            let file = open_lock_file(fallback)
                .map_err(|e| KerfError::from_io(e, format!("opening lock file {fallback:?}")))?;
            acquire_on(file, fallback)
        }
    }
}

fn open_lock_file(path: &Path) -> std::io::Result<std::fs::File> {
    OpenOptions::new().create(true).write(true).open(path)
}

fn acquire_on(file: std::fs::File, path: &Path) -> Result<LockGuard> {
    let mut file = Some(file);
    for attempt in 0..RETRY_ATTEMPTS {
        let f = file.take().expect("file reclaimed each loop iteration");
        match Flock::lock(f, FlockArg::LockExclusiveNonblock) {
            Ok(locked) => {
                return Ok(LockGuard {
                    _file: locked,
                    path: path.to_path_buf(),
                });
            }
            Err((returned, errno)) => {
                if attempt + 1 == RETRY_ATTEMPTS {
                    return Err(KerfError::kernel_interface(
                        errno as i32,
                        format!("acquiring exclusive lock on {path:?} after {RETRY_ATTEMPTS} attempts"),
                    ));
                }
                file = Some(returned);
                sleep(RETRY_INTERVAL);
            }
        }
    }
    unreachable!("loop always returns on its last iteration")
}

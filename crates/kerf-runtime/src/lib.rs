//! Transactional runtime for applying, reading back, and rolling over
//! multikernel instance overlays against the kernel pseudo-filesystem.
//!
//! [`endpoint`] abstracts the filesystem boundary so [`apply`] and
//! [`state::reconstruct`] are exercised in tests without a multikernel host
//! kernel; [`lock`] serializes every mutating invocation on one machine;
//! [`syscall`] wraps the two raw syscalls `kerf load`/`kerf exec` need.

pub mod apply;
pub mod endpoint;
pub mod lock;
pub mod state;
pub mod syscall;

pub use apply::{apply, rollback, ApplyOutcome};
pub use endpoint::{FsOverlayEndpoint, InMemoryOverlayEndpoint, OverlayEndpoint, TransactionFiles};
pub use lock::{LockGuard, FALLBACK_LOCK_PATH, PRIMARY_LOCK_PATH};
pub use state::reconstruct;

//! Abstraction over the kernel pseudo-filesystem's overlay interface
//! (`/sys/fs/multikernel/{device_tree,overlays/...}`).
//!
//! Spec §8 requires the apply/verify/rollback protocol's control flow to be
//! testable without root privilege or a multikernel-patched host kernel.
//! [`OverlayEndpoint`] is the seam: [`FsOverlayEndpoint`] talks to the real
//! mount, [`InMemoryOverlayEndpoint`] fakes it for tests. Both the baseline
//! read and current-state reconstruction (spec §4.4 step 2) and the
//! apply/verify/rollback machinery (steps 6-10) go through this trait.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::PathBuf;

use kerf_model::{KerfError, Result};

/// A single applied transaction's readable files.
#[derive(Debug, Clone, Default)]
pub struct TransactionFiles {
    /// The overlay blob that was applied (`tx_<N>/dtbo`).
    pub dtbo: Vec<u8>,
    /// One-line status word (`tx_<N>/status`).
    pub status: String,
    /// Instance name the transaction touched, if the kernel recorded one
    /// (`tx_<N>/instance`).
    pub instance: Option<String>,
}

/// The kernel pseudo-filesystem's overlay interface, abstracted so the
/// transactional protocol can be driven against a real mount or an
/// in-memory fake. All methods take `&self`: writes to the real mount are
/// syscalls against shared kernel state, not mutations of a Rust value.
pub trait OverlayEndpoint {
    /// Reads the current baseline blob (`device_tree`, read as baseline
    /// dialect on a fresh mount, state dialect once overlays exist — the
    /// kernel is the one that switches the read-back dialect; this call
    /// just returns whatever bytes are there).
    fn read_baseline(&self) -> Result<Vec<u8>>;

    /// Lists applied transaction IDs in ascending order.
    fn list_transactions(&self) -> Result<Vec<u64>>;

    /// Reads one transaction's files.
    fn read_transaction(&self, id: u64) -> Result<TransactionFiles>;

    /// Writes an overlay blob to `overlays/new` and returns the new
    /// transaction's ID. The kernel assigns the ID; this call blocks until
    /// it's known (spec §4.4 step 8's "identify the new transaction").
    fn write_overlay(&self, blob: &[u8]) -> Result<u64>;

    /// Rolls back a transaction by removing its directory.
    fn rollback(&self, id: u64) -> Result<()>;
}

/// Talks to a real `multikernel` mount.
pub struct FsOverlayEndpoint {
    mount_point: PathBuf,
}

impl FsOverlayEndpoint {
    /// Builds an endpoint rooted at `mount_point` (typically
    /// `/sys/fs/multikernel`).
    #[must_use]
    pub fn new(mount_point: impl Into<PathBuf>) -> Self {
        Self {
            mount_point: mount_point.into(),
        }
    }

    fn overlays_dir(&self) -> PathBuf {
        self.mount_point.join("overlays")
    }

    fn transaction_dir(&self, id: u64) -> PathBuf {
        self.overlays_dir().join(format!("tx_{id}"))
    }

    fn io_err(err: std::io::Error, context: impl Into<String>) -> KerfError {
        KerfError::from_io(err, context.into())
    }
}

impl OverlayEndpoint for FsOverlayEndpoint {
    fn read_baseline(&self) -> Result<Vec<u8>> {
        let path = self.mount_point.join("device_tree");
        std::fs::read(&path).map_err(|e| Self::io_err(e, format!("reading {path:?}")))
    }

    fn list_transactions(&self) -> Result<Vec<u64>> {
        let dir = self.overlays_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Self::io_err(e, format!("listing {dir:?}"))),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Self::io_err(e, format!("reading entry in {dir:?}")))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id_str) = name.strip_prefix("tx_") {
                if let Ok(id) = id_str.parse::<u64>() {
                    ids.push(id);
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    fn read_transaction(&self, id: u64) -> Result<TransactionFiles> {
        let dir = self.transaction_dir(id);
        let dtbo = std::fs::read(dir.join("dtbo"))
            .map_err(|e| Self::io_err(e, format!("reading {:?}", dir.join("dtbo"))))?;
        let status = std::fs::read_to_string(dir.join("status"))
            .map_err(|e| Self::io_err(e, format!("reading {:?}", dir.join("status"))))?
            .trim()
            .to_string();
        let instance = std::fs::read_to_string(dir.join("instance"))
            .ok()
            .map(|s| s.trim().to_string());
        Ok(TransactionFiles {
            dtbo,
            status,
            instance,
        })
    }

    fn write_overlay(&self, blob: &[u8]) -> Result<u64> {
        let before = self.list_transactions()?;
        let path = self.overlays_dir().join("new");
        std::fs::write(&path, blob).map_err(|e| Self::io_err(e, format!("writing {path:?}")))?;
        let after = self.list_transactions()?;
        after
            .into_iter()
            .find(|id| !before.contains(id))
            .ok_or_else(|| {
                KerfError::kernel_interface(
                    5,
                    "overlay write reported success but no new transaction directory appeared",
                )
            })
    }

    fn rollback(&self, id: u64) -> Result<()> {
        let dir = self.transaction_dir(id);
        std::fs::remove_dir_all(&dir).map_err(|e| Self::io_err(e, format!("removing {dir:?}")))
    }
}

/// In-memory fake of the kernel's overlay interface, for tests. Wraps its
/// state in a `RefCell` so it can satisfy `OverlayEndpoint`'s `&self`
/// methods the same way the real mount's syscalls do, while still letting
/// test setup mutate it directly through the inherent methods below.
#[derive(Debug, Default)]
pub struct InMemoryOverlayEndpoint {
    inner: RefCell<InMemoryState>,
}

#[derive(Debug, Default)]
struct InMemoryState {
    baseline: Vec<u8>,
    transactions: BTreeMap<u64, TransactionFiles>,
    next_id: u64,
    next_status: String,
    next_instance: Option<String>,
    fail_to_create_transaction: bool,
}

impl InMemoryOverlayEndpoint {
    /// Builds a fake endpoint seeded with `baseline` and no transactions.
    #[must_use]
    pub fn new(baseline: Vec<u8>) -> Self {
        Self {
            inner: RefCell::new(InMemoryState {
                baseline,
                transactions: BTreeMap::new(),
                next_id: 1,
                next_status: "applied".to_string(),
                next_instance: None,
                fail_to_create_transaction: false,
            }),
        }
    }

    /// The transaction IDs currently recorded, for assertions.
    #[must_use]
    pub fn transaction_ids(&self) -> Vec<u64> {
        self.inner.borrow().transactions.keys().copied().collect()
    }

    /// Overrides the status the next written transaction reports, letting
    /// tests exercise the apply protocol's "status is not `applied`" branch.
    pub fn set_next_status(&self, status: impl Into<String>) {
        self.inner.borrow_mut().next_status = status.into();
    }

    /// Overrides the instance name the next written transaction reports,
    /// letting tests exercise the failure message's instance context.
    pub fn set_next_instance(&self, instance: impl Into<String>) {
        self.inner.borrow_mut().next_instance = Some(instance.into());
    }

    /// Makes the next `write_overlay` call silently create no transaction,
    /// simulating a kernel-interface failure at spec §4.4 step 8.
    pub fn set_fail_to_create_transaction(&self, fail: bool) {
        self.inner.borrow_mut().fail_to_create_transaction = fail;
    }
}

impl OverlayEndpoint for InMemoryOverlayEndpoint {
    fn read_baseline(&self) -> Result<Vec<u8>> {
        Ok(self.inner.borrow().baseline.clone())
    }

    fn list_transactions(&self) -> Result<Vec<u64>> {
        Ok(self.inner.borrow().transactions.keys().copied().collect())
    }

    fn read_transaction(&self, id: u64) -> Result<TransactionFiles> {
        self.inner
            .borrow()
            .transactions
            .get(&id)
            .cloned()
            .ok_or_else(|| KerfError::kernel_interface(2, format!("transaction tx_{id} not found")))
    }

    fn write_overlay(&self, blob: &[u8]) -> Result<u64> {
        let mut state = self.inner.borrow_mut();
        if state.fail_to_create_transaction {
            return Err(KerfError::kernel_interface(
                5,
                "simulated failure writing to overlays/new",
            ));
        }
        let id = state.next_id;
        state.next_id += 1;
        let status = state.next_status.clone();
        let instance = state.next_instance.clone();
        state.transactions.insert(
            id,
            TransactionFiles {
                dtbo: blob.to_vec(),
                status,
                instance,
            },
        );
        Ok(id)
    }

    fn rollback(&self, id: u64) -> Result<()> {
        let mut state = self.inner.borrow_mut();
        if state.transactions.remove(&id).is_none() {
            return Err(KerfError::kernel_interface(
                2,
                format!("transaction tx_{id} not found"),
            ));
        }
        Ok(())
    }
}

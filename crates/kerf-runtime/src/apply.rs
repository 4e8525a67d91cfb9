//! The transactional apply/verify/rollback protocol (spec §4.4).
//!
//! `apply` runs the nine steps in order: acquire the host-wide lock,
//! reconstruct current state, let the caller produce a modified tree,
//! validate it, reject a hardware change, encode the delta, write it to the
//! kernel, identify the transaction the kernel created, and read back its
//! status. The lock is released on every exit path because [`LockGuard`]
//! drops at the end of the function's scope regardless of which `?` bailed.

use kerf_model::{GlobalDeviceTree, KerfError, Result};
use kerf_validate::ProcPaths;
use tracing::{info, warn};

use crate::endpoint::OverlayEndpoint;
use crate::lock::{self, LockGuard};
use crate::state::reconstruct;

/// Outcome of a successful [`apply`] call.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    /// The transaction ID the kernel assigned to the applied overlay.
    pub transaction_id: u64,
    /// The tree state after the change took effect.
    pub tree: GlobalDeviceTree,
}

/// Applies a mutation produced by `modify` against the current effective
/// state, validating the result before it is ever written to the kernel.
///
/// `modify` receives the reconstructed current tree and returns the desired
/// next state; it runs entirely in memory; nothing is written to the kernel
/// until the hardware-unchanged check and full validation both pass.
pub fn apply(
    endpoint: &dyn OverlayEndpoint,
    lock_paths: (&std::path::Path, &std::path::Path),
    modify: impl FnOnce(&GlobalDeviceTree) -> Result<GlobalDeviceTree>,
) -> Result<ApplyOutcome> {
    let _guard: LockGuard = lock::acquire(lock_paths.0, lock_paths.1)?;

    let current = reconstruct(endpoint)?;
    let modified = modify(&current)?;

    let validation = kerf_validate::validate_tree(&modified, Some(&ProcPaths::default()));
    if !validation.ok {
        return Err(KerfError::Validation(validation.errors.join("; ")));
    }
    for warning in &validation.warnings {
        warn!(%warning, "soft validation finding on proposed state");
    }

    let blob = kerf_fdt::overlay::encode_transaction(&current, &modified)?;
    let transaction_id = endpoint.write_overlay(&blob)?;

    let files = endpoint.read_transaction(transaction_id)?;
    if !matches!(files.status.as_str(), "applied" | "success" | "ok") {
        let context = match &files.instance {
            Some(instance) => format!(
                "transaction tx_{transaction_id} reported status '{}' (instance '{instance}')",
                files.status
            ),
            None => format!(
                "transaction tx_{transaction_id} reported status '{}'",
                files.status
            ),
        };
        return Err(KerfError::KernelInterface {
            errno: 0,
            symbol: "UNKNOWN",
            context,
            source: None,
        });
    }

    info!(transaction_id, "overlay applied");
    Ok(ApplyOutcome {
        transaction_id,
        tree: modified,
    })
}

/// Rolls back a previously applied transaction (spec §4.4's rollback path:
/// validate the transaction exists, then remove its directory).
pub fn rollback(
    endpoint: &dyn OverlayEndpoint,
    lock_paths: (&std::path::Path, &std::path::Path),
    transaction_id: u64,
) -> Result<()> {
    let _guard: LockGuard = lock::acquire(lock_paths.0, lock_paths.1)?;

    let known = endpoint.list_transactions()?;
    if !known.contains(&transaction_id) {
        return Err(KerfError::InvalidReference(format!(
            "transaction tx_{transaction_id} does not exist"
        )));
    }
    endpoint.rollback(transaction_id)?;
    info!(transaction_id, "transaction rolled back");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::InMemoryOverlayEndpoint;
    use kerf_fdt::baseline;
    use kerf_model::{
        CpuAllocation, HardwareInventory, Instance, InstanceOptions, InstanceResources,
        MemoryAllocation,
    };
    use std::collections::BTreeMap;

    fn hw() -> HardwareInventory {
        HardwareInventory {
            cpus: CpuAllocation {
                total: 8,
                host_reserved: vec![0, 1],
                available: (2..8).collect(),
            },
            memory: MemoryAllocation {
                total_bytes: 0x2_0000_0000,
                host_reserved_bytes: 0x1_0000_0000,
                memory_pool_base: 0x1_0000_0000,
                memory_pool_bytes: 0x1_0000_0000,
            },
            topology: None,
            devices: BTreeMap::new(),
        }
    }

    fn lock_paths(tag: &str) -> (std::path::PathBuf, std::path::PathBuf) {
        let mut primary = std::env::temp_dir();
        primary.push(format!("kerf-apply-test-{tag}-{}", std::process::id()));
        let fallback = primary.with_extension("fallback");
        (primary, fallback)
    }

    #[test]
    fn apply_creates_instance_and_returns_transaction() {
        let endpoint = InMemoryOverlayEndpoint::new(baseline::encode(&hw()));
        let (primary, fallback) = lock_paths("create");

        let outcome = apply(&endpoint, (&primary, &fallback), |current| {
            let mut next = current.clone();
            next.instances.insert(
                "web".to_string(),
                Instance {
                    name: "web".to_string(),
                    id: 1,
                    resources: InstanceResources {
                        cpus: vec![2, 3],
                        memory_base: 0x1_0000_0000,
                        memory_bytes: 0x1000_0000,
                        devices: vec![],
                        numa_nodes: None,
                        cpu_affinity: None,
                        memory_policy: None,
                    },
                    options: InstanceOptions::new(),
                },
            );
            Ok(next)
        })
        .unwrap();

        assert_eq!(outcome.transaction_id, 1);
        assert!(outcome.tree.instances.contains_key("web"));
        std::fs::remove_file(&primary).ok();
        std::fs::remove_file(&fallback).ok();
    }

    #[test]
    fn apply_rejects_invalid_resulting_state() {
        let endpoint = InMemoryOverlayEndpoint::new(baseline::encode(&hw()));
        let (primary, fallback) = lock_paths("invalid");

        let result = apply(&endpoint, (&primary, &fallback), |current| {
            let mut next = current.clone();
            next.instances.insert(
                "web".to_string(),
                Instance {
                    name: "web".to_string(),
                    id: 1,
                    resources: InstanceResources {
                        cpus: vec![0], // host-reserved CPU, must be rejected
                        memory_base: 0x1_0000_0000,
                        memory_bytes: 0x1000_0000,
                        devices: vec![],
                        numa_nodes: None,
                        cpu_affinity: None,
                        memory_policy: None,
                    },
                    options: InstanceOptions::new(),
                },
            );
            Ok(next)
        });

        assert!(result.is_err());
        assert!(endpoint.transaction_ids().is_empty());
        std::fs::remove_file(&primary).ok();
        std::fs::remove_file(&fallback).ok();
    }

    #[test]
    fn apply_surfaces_non_applied_status_as_error() {
        let endpoint = InMemoryOverlayEndpoint::new(baseline::encode(&hw()));
        endpoint.set_next_status("rejected");
        let (primary, fallback) = lock_paths("rejected-status");

        let result = apply(&endpoint, (&primary, &fallback), |current| Ok(current.clone()));
        assert!(result.is_err());
        std::fs::remove_file(&primary).ok();
        std::fs::remove_file(&fallback).ok();
    }

    #[test]
    fn apply_accepts_success_and_ok_as_applied_synonyms() {
        for synonym in ["success", "ok"] {
            let endpoint = InMemoryOverlayEndpoint::new(baseline::encode(&hw()));
            endpoint.set_next_status(synonym);
            let (primary, fallback) = lock_paths(&format!("status-{synonym}"));

            let result = apply(&endpoint, (&primary, &fallback), |current| Ok(current.clone()));
            assert!(result.is_ok(), "status '{synonym}' should be treated as success");
            std::fs::remove_file(&primary).ok();
            std::fs::remove_file(&fallback).ok();
        }
    }

    #[test]
    fn apply_error_includes_instance_file_contents() {
        let endpoint = InMemoryOverlayEndpoint::new(baseline::encode(&hw()));
        endpoint.set_next_status("rejected");
        endpoint.set_next_instance("web");
        let (primary, fallback) = lock_paths("rejected-with-instance");

        let err = apply(&endpoint, (&primary, &fallback), |current| Ok(current.clone()))
            .unwrap_err();
        assert!(err.to_string().contains("web"));
        std::fs::remove_file(&primary).ok();
        std::fs::remove_file(&fallback).ok();
    }

    #[test]
    fn rollback_unknown_transaction_is_invalid_reference() {
        let endpoint = InMemoryOverlayEndpoint::new(baseline::encode(&hw()));
        let (primary, fallback) = lock_paths("rollback-missing");

        let err = rollback(&endpoint, (&primary, &fallback), 999).unwrap_err();
        assert!(matches!(err, KerfError::InvalidReference(_)));
        std::fs::remove_file(&primary).ok();
        std::fs::remove_file(&fallback).ok();
    }

    #[test]
    fn rollback_removes_known_transaction() {
        let endpoint = InMemoryOverlayEndpoint::new(baseline::encode(&hw()));
        let id = endpoint.write_overlay(&kerf_fdt::overlay::encode(&kerf_model::OverlayDelta::default())).unwrap();
        let (primary, fallback) = lock_paths("rollback-known");

        rollback(&endpoint, (&primary, &fallback), id).unwrap();
        assert!(endpoint.transaction_ids().is_empty());
        std::fs::remove_file(&primary).ok();
        std::fs::remove_file(&fallback).ok();
    }
}

//! Reconstructs the current effective [`GlobalDeviceTree`] by replaying the
//! baseline blob and every applied overlay in transaction-ID order (spec
//! §4.4 step 2).
//!
//! A transaction whose blob has gone unreadable (truncated write, kernel bug)
//! is skipped with a warning rather than aborting reconstruction entirely —
//! the remaining history is still useful, and an operator can investigate
//! the one bad transaction without losing the ability to run `kerf show`.

use kerf_fdt::baseline;
use kerf_model::{merge, GlobalDeviceTree, Result};
use tracing::warn;

use crate::endpoint::OverlayEndpoint;

/// Reads the baseline blob and every applied-transaction overlay from
/// `endpoint`, merging them in order into the current effective tree.
pub fn reconstruct(endpoint: &dyn OverlayEndpoint) -> Result<GlobalDeviceTree> {
    let baseline_bytes = endpoint.read_baseline()?;
    let hardware = baseline::decode(&baseline_bytes)?;
    let mut tree = GlobalDeviceTree {
        hardware,
        instances: std::collections::BTreeMap::new(),
        device_references: std::collections::BTreeMap::new(),
    };

    for id in endpoint.list_transactions()? {
        let files = match endpoint.read_transaction(id) {
            Ok(files) => files,
            Err(err) => {
                warn!(transaction = id, error = %err, "skipping unreadable transaction during state reconstruction");
                continue;
            }
        };
        match kerf_fdt::overlay::decode(&files.dtbo) {
            Ok(delta) => tree = merge::merge(&tree, &delta),
            Err(err) => {
                warn!(transaction = id, error = %err, "skipping unreadable overlay blob during state reconstruction");
            }
        }
    }

    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::InMemoryOverlayEndpoint;
    use kerf_model::{
        CpuAllocation, GlobalDeviceTree, HardwareInventory, Instance, InstanceOptions,
        InstanceResources, MemoryAllocation,
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

    fn instance(name: &str, id: u16) -> Instance {
        Instance {
            name: name.to_string(),
            id,
            resources: InstanceResources {
                cpus: vec![2, 3],
                memory_base: 0x1_0000_0000,
                memory_bytes: 0x1000_0000,
                devices: Vec::new(),
                numa_nodes: None,
                cpu_affinity: None,
                memory_policy: None,
            },
            options: InstanceOptions::new(),
        }
    }

    #[test]
    fn reconstructs_empty_baseline_with_no_overlays() {
        let tree = GlobalDeviceTree {
            hardware: hw(),
            instances: BTreeMap::new(),
            device_references: BTreeMap::new(),
        };
        let blob = baseline::encode(&tree.hardware);
        let endpoint = InMemoryOverlayEndpoint::new(blob);
        let reconstructed = reconstruct(&endpoint).unwrap();
        assert!(reconstructed.instances.is_empty());
    }

    #[test]
    fn applies_transactions_in_order() {
        let tree = GlobalDeviceTree {
            hardware: hw(),
            instances: BTreeMap::new(),
            device_references: BTreeMap::new(),
        };
        let blob = baseline::encode(&tree.hardware);
        let endpoint = InMemoryOverlayEndpoint::new(blob);

        let with_web = {
            let mut t = tree.clone();
            t.instances.insert("web".to_string(), instance("web", 1));
            t
        };
        let delta1 = merge::diff(&tree, &with_web).unwrap();
        endpoint.write_overlay(&kerf_fdt::overlay::encode(&delta1)).unwrap();

        let with_web_removed = GlobalDeviceTree {
            hardware: hw(),
            instances: BTreeMap::new(),
            device_references: BTreeMap::new(),
        };
        let delta2 = merge::diff(&with_web, &with_web_removed).unwrap();
        endpoint.write_overlay(&kerf_fdt::overlay::encode(&delta2)).unwrap();

        let reconstructed = reconstruct(&endpoint).unwrap();
        assert!(reconstructed.instances.is_empty());
    }

    #[test]
    fn replays_a_transaction_reported_under_a_success_synonym() {
        let tree = GlobalDeviceTree {
            hardware: hw(),
            instances: BTreeMap::new(),
            device_references: BTreeMap::new(),
        };
        let blob = baseline::encode(&tree.hardware);
        let endpoint = InMemoryOverlayEndpoint::new(blob);
        endpoint.set_next_status("success");

        let with_web = {
            let mut t = tree.clone();
            t.instances.insert("web".to_string(), instance("web", 1));
            t
        };
        let delta = merge::diff(&tree, &with_web).unwrap();
        endpoint.write_overlay(&kerf_fdt::overlay::encode(&delta)).unwrap();

        let reconstructed = reconstruct(&endpoint).unwrap();
        assert!(reconstructed.instances.contains_key("web"));
    }

    #[test]
    fn skips_unreadable_transaction_without_failing() {
        let tree = GlobalDeviceTree {
            hardware: hw(),
            instances: BTreeMap::new(),
            device_references: BTreeMap::new(),
        };
        let blob = baseline::encode(&tree.hardware);
        let endpoint = InMemoryOverlayEndpoint::new(blob);
        endpoint.set_next_status("rejected");
        endpoint.write_overlay(&[0xff, 0xff]).unwrap();

        let reconstructed = reconstruct(&endpoint).unwrap();
        assert!(reconstructed.instances.is_empty());
    }
}

//! Applies a decoded overlay delta onto a current tree, and computes the
//! delta between two trees for the encoder side. Kept separate from the
//! FDT codec: both directions operate purely on [`GlobalDeviceTree`]/
//! [`OverlayDelta`] values, with no knowledge of the wire format.

use std::collections::BTreeSet;

use crate::types::{GlobalDeviceTree, Instance, InstanceResources, OverlayDelta, ResourceDelta};
use crate::{KerfError, Result};

/// Merges a decoded overlay onto `current`, producing the next effective
/// state.
///
/// Per the merge semantics every dialect agrees on: hardware never changes
/// (it's carried over from `current` verbatim — overlays cannot touch it);
/// creates and updates replace by name; removals drop by name.
#[must_use]
pub fn merge(current: &GlobalDeviceTree, delta: &OverlayDelta) -> GlobalDeviceTree {
    let mut instances = current.instances.clone();

    for (name, instance) in &delta.creates {
        instances.insert(name.clone(), instance.clone());
    }
    for (name, resource_delta) in &delta.updates {
        if let Some(instance) = instances.get_mut(name) {
            apply_resource_delta(&mut instance.resources, resource_delta);
        }
    }
    for name in &delta.removals {
        instances.remove(name);
    }

    GlobalDeviceTree {
        hardware: current.hardware.clone(),
        instances,
        device_references: current.device_references.clone(),
    }
}

fn apply_resource_delta(resources: &mut InstanceResources, delta: &ResourceDelta) {
    if let Some((base, bytes)) = delta.memory_add {
        resources.memory_base = base;
        resources.memory_bytes = bytes;
    }
    let removed: BTreeSet<u32> = delta.cpu_remove.iter().copied().collect();
    let mut cpus: Vec<u32> = resources
        .cpus
        .iter()
        .copied()
        .filter(|c| !removed.contains(c))
        .collect();
    for cpu in &delta.cpu_add {
        if !cpus.contains(cpu) {
            cpus.push(*cpu);
        }
    }
    cpus.sort_unstable();
    resources.cpus = cpus;
}

/// Computes the overlay delta between `current` and `modified`.
///
/// Returns [`KerfError::Validation`] if the two trees disagree on
/// hardware — overlays may only ever carry instance-level changes.
pub fn diff(current: &GlobalDeviceTree, modified: &GlobalDeviceTree) -> Result<OverlayDelta> {
    if current.hardware != modified.hardware {
        return Err(KerfError::Validation(
            "overlay delta cannot carry a hardware change; current and modified disagree on hardware".to_string(),
        ));
    }

    let mut creates = std::collections::BTreeMap::new();
    let mut updates = std::collections::BTreeMap::new();
    let mut removals = BTreeSet::new();

    for (name, instance) in &modified.instances {
        match current.instances.get(name) {
            None => {
                creates.insert(name.clone(), instance.clone());
            }
            Some(old) if old != instance => {
                updates.insert(name.clone(), resource_delta(old, instance));
            }
            Some(_) => {}
        }
    }
    for name in current.instances.keys() {
        if !modified.instances.contains_key(name) {
            removals.insert(name.clone());
        }
    }

    Ok(OverlayDelta {
        transaction_id: 0,
        creates,
        updates,
        removals,
    })
}

fn resource_delta(old: &Instance, new: &Instance) -> ResourceDelta {
    let old_cpus: BTreeSet<u32> = old.resources.cpus.iter().copied().collect();
    let new_cpus: BTreeSet<u32> = new.resources.cpus.iter().copied().collect();
    let cpu_remove: Vec<u32> = old_cpus.difference(&new_cpus).copied().collect();
    let cpu_add: Vec<u32> = new_cpus.difference(&old_cpus).copied().collect();

    let old_region = (old.resources.memory_base, old.resources.memory_bytes);
    let new_region = (new.resources.memory_base, new.resources.memory_bytes);
    let (memory_remove, memory_add) = if old_region == new_region {
        (None, None)
    } else {
        (Some(old_region), Some(new_region))
    };

    ResourceDelta {
        memory_remove,
        memory_add,
        cpu_remove,
        cpu_add,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InstanceOptions, MemoryAllocation, CpuAllocation};
    use std::collections::BTreeMap;

    fn tree_with(instances: BTreeMap<String, Instance>) -> GlobalDeviceTree {
        GlobalDeviceTree {
            hardware: crate::types::HardwareInventory {
                cpus: CpuAllocation {
                    total: 32,
                    host_reserved: vec![0, 1, 2, 3],
                    available: (4..32).collect(),
                },
                memory: MemoryAllocation {
                    total_bytes: 1 << 34,
                    host_reserved_bytes: 1 << 31,
                    memory_pool_base: 0x8000_0000,
                    memory_pool_bytes: 15 * (1 << 30),
                },
                topology: None,
                devices: BTreeMap::new(),
            },
            instances,
            device_references: BTreeMap::new(),
        }
    }

    fn instance(name: &str, id: u16, cpus: Vec<u32>, base: u64, bytes: u64) -> Instance {
        Instance {
            name: name.to_string(),
            id,
            resources: InstanceResources {
                cpus,
                memory_base: base,
                memory_bytes: bytes,
                devices: vec![],
                numa_nodes: None,
                cpu_affinity: None,
                memory_policy: None,
            },
            options: InstanceOptions::new(),
        }
    }

    #[test]
    fn diff_detects_create_update_remove() {
        let mut current_instances = BTreeMap::new();
        current_instances.insert(
            "web".to_string(),
            instance("web", 1, vec![4, 5, 6, 7], 0x8000_0000, 1 << 31),
        );
        current_instances.insert("stale".to_string(), instance("stale", 3, vec![8], 0, 0));
        let current = tree_with(current_instances);

        let mut modified_instances = BTreeMap::new();
        modified_instances.insert(
            "web".to_string(),
            instance("web", 1, vec![20, 21, 22, 23], 0x1_0000_0000, 1 << 32),
        );
        modified_instances.insert("db".to_string(), instance("db", 2, vec![9, 10], 0x9000_0000, 1 << 30));
        let modified = tree_with(modified_instances);

        let delta = diff(&current, &modified).unwrap();
        assert_eq!(delta.creates.len(), 1);
        assert!(delta.creates.contains_key("db"));
        assert_eq!(delta.removals, BTreeSet::from(["stale".to_string()]));
        let web_delta = delta.updates.get("web").unwrap();
        assert_eq!(web_delta.cpu_remove, vec![4, 5, 6, 7]);
        assert_eq!(web_delta.cpu_add, vec![20, 21, 22, 23]);
        assert_eq!(web_delta.memory_remove, Some((0x8000_0000, 1 << 31)));
        assert_eq!(web_delta.memory_add, Some((0x1_0000_0000, 1 << 32)));
    }

    #[test]
    fn diff_rejects_hardware_change() {
        let current = tree_with(BTreeMap::new());
        let mut modified = tree_with(BTreeMap::new());
        modified.hardware.cpus.total = 64;
        assert!(diff(&current, &modified).is_err());
    }

    #[test]
    fn merge_round_trips_into_modified() {
        let mut current_instances = BTreeMap::new();
        current_instances.insert(
            "web".to_string(),
            instance("web", 1, vec![4, 5, 6, 7], 0x8000_0000, 1 << 31),
        );
        let current = tree_with(current_instances);

        let mut modified_instances = BTreeMap::new();
        modified_instances.insert(
            "web".to_string(),
            instance("web", 1, vec![20, 21, 22, 23], 0x1_0000_0000, 1 << 32),
        );
        modified_instances.insert("db".to_string(), instance("db", 2, vec![9, 10], 0x9000_0000, 1 << 30));
        let modified = tree_with(modified_instances);

        let delta = diff(&current, &modified).unwrap();
        let merged = merge(&current, &delta);
        assert_eq!(merged, modified);
    }

    #[test]
    fn no_op_diff_is_empty() {
        let mut instances = BTreeMap::new();
        instances.insert("web".to_string(), instance("web", 1, vec![4, 5], 0, 1 << 20));
        let tree = tree_with(instances);
        let delta = diff(&tree, &tree).unwrap();
        assert!(delta.is_empty());
    }
}

//! CPU-set and memory-base allocation over a [`GlobalDeviceTree`].
//!
//! These are plain functions over borrowed data, not methods on the tree
//! itself, matching the free-function style the workspace's own model
//! validation helpers use.

use std::collections::BTreeSet;

use crate::error::{KerfError, Result};
use crate::types::{CpuAffinity, GlobalDeviceTree};

const MIN_INSTANCE_ID: u16 = 1;
const MAX_INSTANCE_ID: u16 = 511;
const DEFAULT_ALIGNMENT: u64 = 0x1000;

/// CPU IDs allocated to any existing instance.
#[must_use]
pub fn allocated_cpus(tree: &GlobalDeviceTree) -> BTreeSet<u32> {
    tree.instances
        .values()
        .flat_map(|inst| inst.resources.cpus.iter().copied())
        .collect()
}

/// CPU IDs in the hardware's available pool that are not currently
/// assigned to any instance.
#[must_use]
pub fn available_cpus(tree: &GlobalDeviceTree) -> BTreeSet<u32> {
    let pool: BTreeSet<u32> = tree.hardware.cpus.available.iter().copied().collect();
    let used = allocated_cpus(tree);
    pool.difference(&used).copied().collect()
}

/// `(base, size)` pairs for every instance's memory region, used as the
/// occupied-region set when probing for a new allocation.
#[must_use]
pub fn allocated_memory_regions(tree: &GlobalDeviceTree) -> Vec<(u64, u64)> {
    let mut regions: Vec<(u64, u64)> = tree
        .instances
        .values()
        .filter(|inst| inst.resources.memory_base > 0)
        .map(|inst| (inst.resources.memory_base, inst.resources.memory_bytes))
        .collect();
    regions.sort_unstable();
    regions
}

fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

/// First-fit search for a free, aligned memory base of `size_bytes` within
/// the instance pool, given an existing list of occupied regions (sorted by
/// base address).
///
/// Checks the gap before the first region, the gaps between consecutive
/// regions, and the gap after the last region before the pool end.
#[must_use]
pub fn find_available_memory_base(
    tree: &GlobalDeviceTree,
    size_bytes: u64,
    alignment: u64,
) -> Option<u64> {
    let alignment = if alignment == 0 {
        DEFAULT_ALIGNMENT
    } else {
        alignment
    };
    let pool_base = tree.hardware.memory.memory_pool_base;
    let pool_end = tree.hardware.memory.memory_pool_end();
    let regions = allocated_memory_regions(tree);

    if regions.is_empty() {
        let base = align_up(pool_base, alignment);
        return (base + size_bytes <= pool_end).then_some(base);
    }

    let first_base = regions[0].0;
    let base = align_up(pool_base, alignment);
    if base + size_bytes <= first_base {
        return Some(base);
    }

    for window in regions.windows(2) {
        let current_end = window[0].0 + window[0].1;
        let next_base = window[1].0;
        let base = align_up(current_end, alignment);
        if base + size_bytes <= next_base {
            return Some(base);
        }
    }

    let last = regions[regions.len() - 1];
    let base = align_up(last.0 + last.1, alignment);
    (base + size_bytes <= pool_end).then_some(base)
}

/// The lowest unused instance ID in `1..=511`.
///
/// # Errors
///
/// Returns [`KerfError::ResourceExhaustion`] if every ID in range is in use.
pub fn find_next_instance_id(tree: &GlobalDeviceTree) -> Result<u16> {
    let existing: BTreeSet<u16> = tree.instances.values().map(|inst| inst.id).collect();
    (MIN_INSTANCE_ID..=MAX_INSTANCE_ID)
        .find(|id| !existing.contains(id))
        .ok_or_else(|| {
            KerfError::ResourceExhaustion(
                "no available instance IDs (all 1-511 are in use)".to_string(),
            )
        })
}

/// Validates that `requested` CPUs exist in hardware and are not already
/// assigned, optionally excluding one instance's own CPUs from the conflict
/// check (used by `kerf update`, which re-validates against the CPUs an
/// instance already holds).
///
/// # Errors
///
/// Returns [`KerfError::InvalidReference`] for CPU IDs the hardware doesn't
/// have, or [`KerfError::ResourceConflict`] for CPUs already assigned
/// elsewhere.
pub fn validate_cpu_allocation(
    tree: &GlobalDeviceTree,
    requested: &[u32],
    exclude_instance: Option<&str>,
) -> Result<()> {
    let hardware_cpus: BTreeSet<u32> = tree.hardware.cpus.available.iter().copied().collect();
    let requested_set: BTreeSet<u32> = requested.iter().copied().collect();

    let invalid: Vec<u32> = requested_set.difference(&hardware_cpus).copied().collect();
    if !invalid.is_empty() {
        return Err(KerfError::InvalidReference(format!(
            "CPUs {invalid:?} are not present in the hardware inventory"
        )));
    }

    let mut available = available_cpus(tree);
    if let Some(name) = exclude_instance {
        if let Some(inst) = tree.instances.get(name) {
            available.extend(inst.resources.cpus.iter().copied());
        }
    }

    let unavailable: Vec<u32> = requested_set.difference(&available).copied().collect();
    if !unavailable.is_empty() {
        return Err(KerfError::ResourceConflict(format!(
            "CPUs {unavailable:?} are already assigned to another instance"
        )));
    }

    Ok(())
}

/// Validates that `[memory_base, memory_base + memory_bytes)` lies within
/// the instance pool, is 4KiB-aligned, and does not overlap any other
/// instance's region.
///
/// # Errors
///
/// Returns [`KerfError::ResourceConflict`] for out-of-pool, misaligned, or
/// overlapping regions.
pub fn validate_memory_allocation(
    tree: &GlobalDeviceTree,
    memory_base: u64,
    memory_bytes: u64,
    exclude_instance: Option<&str>,
) -> Result<()> {
    let pool_base = tree.hardware.memory.memory_pool_base;
    let pool_end = tree.hardware.memory.memory_pool_end();
    let memory_end = memory_base + memory_bytes;

    if memory_base < pool_base {
        return Err(KerfError::ResourceConflict(format!(
            "memory base {memory_base:#x} is below pool base {pool_base:#x}"
        )));
    }
    if memory_end > pool_end {
        return Err(KerfError::ResourceConflict(format!(
            "memory region {memory_base:#x}-{memory_end:#x} extends beyond pool end {pool_end:#x}"
        )));
    }
    if memory_base % DEFAULT_ALIGNMENT != 0 {
        return Err(KerfError::ResourceConflict(format!(
            "memory base {memory_base:#x} is not 4KiB-aligned"
        )));
    }

    for inst in tree.instances.values() {
        if Some(inst.name.as_str()) == exclude_instance {
            continue;
        }
        let inst_base = inst.resources.memory_base;
        let inst_end = inst_base + inst.resources.memory_bytes;
        let disjoint = memory_end <= inst_base || memory_base >= inst_end;
        if !disjoint {
            return Err(KerfError::ResourceConflict(format!(
                "memory region {memory_base:#x}-{memory_end:#x} overlaps instance '{}' ({inst_base:#x}-{inst_end:#x})",
                inst.name
            )));
        }
    }

    Ok(())
}

/// Allocates `count` CPUs from the available pool under the given affinity
/// policy, optionally constrained to a set of preferred NUMA nodes.
///
/// - `Compact` prefers a single NUMA node and a consecutive run of IDs,
///   falling back to the first `count` available CPUs.
/// - `Spread` distributes round-robin across the requested NUMA nodes, or
///   evenly across the whole available range when no topology applies.
/// - `Local` requires NUMA topology and allocates entirely from one node.
///
/// # Errors
///
/// Returns [`KerfError::ResourceExhaustion`] if the pool (or the requested
/// NUMA nodes) don't have `count` CPUs available, or
/// [`KerfError::Validation`] if `Local` is requested without topology.
pub fn allocate_cpus_from_pool(
    tree: &GlobalDeviceTree,
    count: usize,
    affinity: CpuAffinity,
    numa_nodes: Option<&[u32]>,
) -> Result<Vec<u32>> {
    let mut available: Vec<u32> = available_cpus(tree).into_iter().collect();

    if let (Some(nodes), Some(topology)) = (numa_nodes, tree.hardware.topology.as_ref()) {
        available.retain(|cpu| {
            topology
                .numa_node_for_cpu(*cpu)
                .is_some_and(|n| nodes.contains(&n))
        });
    }

    if available.len() < count {
        return Err(KerfError::ResourceExhaustion(format!(
            "requested {count} CPUs but only {} are available{}",
            available.len(),
            numa_nodes.map_or(String::new(), |n| format!(" in NUMA nodes {n:?}"))
        )));
    }

    match affinity {
        CpuAffinity::Compact => Ok(allocate_compact(tree, &available, count, numa_nodes)),
        CpuAffinity::Spread => Ok(allocate_spread(tree, &available, count, numa_nodes)),
        CpuAffinity::Local => allocate_local(tree, &available, count, numa_nodes),
    }
}

fn consecutive_run(candidates: &[u32], count: usize) -> Option<Vec<u32>> {
    if candidates.len() < count {
        return None;
    }
    for window in candidates.windows(count) {
        if window
            .windows(2)
            .all(|pair| pair[1] == pair[0] + 1)
        {
            return Some(window.to_vec());
        }
    }
    None
}

fn allocate_compact(
    tree: &GlobalDeviceTree,
    available: &[u32],
    count: usize,
    numa_nodes: Option<&[u32]>,
) -> Vec<u32> {
    if let (Some(nodes), Some(topology)) = (numa_nodes, tree.hardware.topology.as_ref()) {
        for &node_id in nodes {
            let in_node: Vec<u32> = available
                .iter()
                .copied()
                .filter(|cpu| topology.numa_node_for_cpu(*cpu) == Some(node_id))
                .collect();
            if in_node.len() >= count {
                return consecutive_run(&in_node, count)
                    .unwrap_or_else(|| in_node[..count].to_vec());
            }
        }
    }
    consecutive_run(available, count).unwrap_or_else(|| available[..count].to_vec())
}

fn allocate_spread(
    tree: &GlobalDeviceTree,
    available: &[u32],
    count: usize,
    numa_nodes: Option<&[u32]>,
) -> Vec<u32> {
    if let (Some(nodes), Some(topology)) = (numa_nodes, tree.hardware.topology.as_ref()) {
        let mut per_node: Vec<Vec<u32>> = nodes
            .iter()
            .map(|&node_id| {
                available
                    .iter()
                    .copied()
                    .filter(|cpu| topology.numa_node_for_cpu(*cpu) == Some(node_id))
                    .collect()
            })
            .filter(|cpus: &Vec<u32>| !cpus.is_empty())
            .collect();

        let mut allocated = Vec::with_capacity(count);
        let mut cursor = vec![0usize; per_node.len()];
        'outer: while allocated.len() < count {
            let mut progressed = false;
            for (i, cpus) in per_node.iter().enumerate() {
                if allocated.len() == count {
                    break 'outer;
                }
                if cursor[i] < cpus.len() {
                    allocated.push(cpus[cursor[i]]);
                    cursor[i] += 1;
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        per_node.clear();
        allocated.sort_unstable();
        return allocated;
    }

    if count == 1 {
        return vec![available[0]];
    }
    let step = (available.len() - 1) as f64 / (count - 1) as f64;
    let mut picked: Vec<u32> = (0..count)
        .map(|i| available[(i as f64 * step).round() as usize])
        .collect();
    picked.sort_unstable();
    picked.dedup();
    picked
}

fn allocate_local(
    tree: &GlobalDeviceTree,
    available: &[u32],
    count: usize,
    numa_nodes: Option<&[u32]>,
) -> Result<Vec<u32>> {
    let topology = tree.hardware.topology.as_ref().ok_or_else(|| {
        KerfError::Validation(
            "CPU affinity 'local' requires NUMA topology information; use 'compact' or 'spread' \
             instead, or provide a baseline with topology data"
                .to_string(),
        )
    })?;

    let candidate_nodes: Vec<u32> = match numa_nodes {
        Some(nodes) => nodes.to_vec(),
        None => topology.numa_nodes.keys().copied().collect(),
    };

    for node_id in candidate_nodes {
        let in_node: Vec<u32> = available
            .iter()
            .copied()
            .filter(|cpu| topology.numa_node_for_cpu(*cpu) == Some(node_id))
            .collect();
        if in_node.len() >= count {
            return Ok(in_node[..count].to_vec());
        }
    }

    Err(KerfError::ResourceExhaustion(
        "no single NUMA node has enough available CPUs for 'local' affinity".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        CpuAllocation, Instance, InstanceResources, MemoryAllocation, MemoryType, NumaNode,
        Topology,
    };

    fn base_tree() -> GlobalDeviceTree {
        let mut tree = GlobalDeviceTree {
            hardware: crate::types::HardwareInventory {
                cpus: CpuAllocation {
                    total: 8,
                    host_reserved: vec![0, 1],
                    available: (2..8).collect(),
                },
                memory: MemoryAllocation {
                    total_bytes: 0x1_0000_0000,
                    host_reserved_bytes: 0x1000_0000,
                    memory_pool_base: 0x4000_0000,
                    memory_pool_bytes: 0x4000_0000,
                },
                topology: None,
                devices: Default::default(),
            },
            instances: Default::default(),
            device_references: Default::default(),
        };
        tree.instances.insert(
            "web".to_string(),
            Instance {
                name: "web".to_string(),
                id: 1,
                resources: InstanceResources {
                    cpus: vec![2, 3],
                    memory_base: 0x4000_0000,
                    memory_bytes: 0x1000_0000,
                    devices: vec![],
                    numa_nodes: None,
                    cpu_affinity: None,
                    memory_policy: None,
                },
                options: Default::default(),
            },
        );
        tree
    }

    #[test]
    fn available_cpus_excludes_host_and_assigned() {
        let tree = base_tree();
        let available = available_cpus(&tree);
        assert_eq!(available, [4, 5, 6, 7].into_iter().collect());
    }

    #[test]
    fn find_next_instance_id_skips_used() {
        let tree = base_tree();
        assert_eq!(find_next_instance_id(&tree).unwrap(), 2);
    }

    #[test]
    fn find_next_instance_id_exhausted() {
        let mut tree = base_tree();
        for id in 1..=511u16 {
            if id == 1 {
                continue;
            }
            tree.instances.insert(
                format!("inst-{id}"),
                Instance {
                    name: format!("inst-{id}"),
                    id,
                    resources: InstanceResources::default(),
                    options: Default::default(),
                },
            );
        }
        assert!(matches!(
            find_next_instance_id(&tree),
            Err(KerfError::ResourceExhaustion(_))
        ));
    }

    #[test]
    fn find_available_memory_base_fits_gap_between_regions() {
        let mut tree = base_tree();
        // existing instance occupies [0x4000_0000, 0x5000_0000)
        tree.instances.get_mut("web").unwrap().resources.memory_bytes = 0x1000_0000;
        tree.instances.insert(
            "other".to_string(),
            Instance {
                name: "other".to_string(),
                id: 2,
                resources: InstanceResources {
                    cpus: vec![4],
                    memory_base: 0x7000_0000,
                    memory_bytes: 0x1000_0000,
                    devices: vec![],
                    numa_nodes: None,
                    cpu_affinity: None,
                    memory_policy: None,
                },
                options: Default::default(),
            },
        );
        let base = find_available_memory_base(&tree, 0x1000_0000, 0x1000).unwrap();
        assert_eq!(base, 0x5000_0000);
    }

    #[test]
    fn find_available_memory_base_no_space() {
        let mut tree = base_tree();
        tree.hardware.memory.memory_pool_bytes = 0x1000_0000;
        assert_eq!(find_available_memory_base(&tree, 0x1000_0000, 0x1000), None);
    }

    #[test]
    fn validate_cpu_allocation_rejects_unknown_cpu() {
        let tree = base_tree();
        let err = validate_cpu_allocation(&tree, &[99], None).unwrap_err();
        assert!(matches!(err, KerfError::InvalidReference(_)));
    }

    #[test]
    fn validate_cpu_allocation_rejects_conflict() {
        let tree = base_tree();
        let err = validate_cpu_allocation(&tree, &[2], None).unwrap_err();
        assert!(matches!(err, KerfError::ResourceConflict(_)));
    }

    #[test]
    fn validate_cpu_allocation_allows_excluded_instance_own_cpus() {
        let tree = base_tree();
        validate_cpu_allocation(&tree, &[2, 3], Some("web")).unwrap();
    }

    #[test]
    fn validate_memory_allocation_rejects_misaligned_base() {
        let tree = base_tree();
        let err = validate_memory_allocation(&tree, 0x4000_0001, 0x1000, None).unwrap_err();
        assert!(matches!(err, KerfError::ResourceConflict(_)));
    }

    #[test]
    fn validate_memory_allocation_rejects_overlap() {
        let tree = base_tree();
        let err = validate_memory_allocation(&tree, 0x4000_0000, 0x1000, None).unwrap_err();
        assert!(matches!(err, KerfError::ResourceConflict(_)));
    }

    fn topology_tree() -> GlobalDeviceTree {
        let mut tree = base_tree();
        tree.hardware.cpus.available = (2..16).collect();
        let mut numa_nodes = std::collections::BTreeMap::new();
        numa_nodes.insert(
            0,
            NumaNode {
                memory_base: 0x4000_0000,
                memory_size: 0x2000_0000,
                cpus: (2..8).collect(),
                memory_type: MemoryType::Dram,
            },
        );
        numa_nodes.insert(
            1,
            NumaNode {
                memory_base: 0x6000_0000,
                memory_size: 0x2000_0000,
                cpus: (8..16).collect(),
                memory_type: MemoryType::Dram,
            },
        );
        tree.hardware.topology = Some(Topology { numa_nodes });
        tree.instances.clear();
        tree
    }

    #[test]
    fn allocate_compact_prefers_consecutive_within_node() {
        let tree = topology_tree();
        let cpus =
            allocate_cpus_from_pool(&tree, 3, CpuAffinity::Compact, Some(&[0])).unwrap();
        assert_eq!(cpus, vec![2, 3, 4]);
    }

    #[test]
    fn allocate_spread_distributes_across_nodes() {
        let tree = topology_tree();
        let cpus =
            allocate_cpus_from_pool(&tree, 4, CpuAffinity::Spread, Some(&[0, 1])).unwrap();
        // Round-robin across node 0 then node 1.
        assert_eq!(cpus.len(), 4);
        let topology = tree.hardware.topology.as_ref().unwrap();
        let in_node0 = cpus
            .iter()
            .filter(|c| topology.numa_node_for_cpu(**c) == Some(0))
            .count();
        let in_node1 = cpus
            .iter()
            .filter(|c| topology.numa_node_for_cpu(**c) == Some(1))
            .count();
        assert_eq!(in_node0, 2);
        assert_eq!(in_node1, 2);
    }

    #[test]
    fn allocate_local_requires_topology() {
        let tree = base_tree();
        let err = allocate_cpus_from_pool(&tree, 2, CpuAffinity::Local, None).unwrap_err();
        assert!(matches!(err, KerfError::Validation(_)));
    }

    #[test]
    fn allocate_local_picks_single_node() {
        let tree = topology_tree();
        let cpus = allocate_cpus_from_pool(&tree, 4, CpuAffinity::Local, Some(&[1])).unwrap();
        let topology = tree.hardware.topology.as_ref().unwrap();
        assert!(cpus
            .iter()
            .all(|c| topology.numa_node_for_cpu(*c) == Some(1)));
    }

    #[test]
    fn exhaustion_error_when_not_enough_cpus() {
        let tree = base_tree();
        let err = allocate_cpus_from_pool(&tree, 100, CpuAffinity::Compact, None).unwrap_err();
        assert!(matches!(err, KerfError::ResourceExhaustion(_)));
    }
}

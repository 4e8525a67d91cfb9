//! Invariant checking for a proposed [`GlobalDeviceTree`], plus soft
//! cross-checks against the live system's `/proc` files.
//!
//! [`validate_tree`] dispatches to one `validate_xxx` function per concern,
//! mirroring the corpus's top-level `validate_model` → per-concern-function
//! shape. It diverges from that style in one way: each function here
//! returns a [`ValidationResult`] that the caller merges in, rather than
//! failing fast on the first problem — spec requires every conflict in a
//! proposed state to surface in one pass, not just the first one found.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use kerf_model::{CpuAffinity, DeviceReference, GlobalDeviceTree, MemoryPolicy, ValidationResult};

/// Paths to the `/proc` files the live-system cross-checks read. Exists so
/// tests (and non-Linux hosts) can point the validator at fixture files
/// instead of the real `/proc`.
#[derive(Debug, Clone)]
pub struct ProcPaths {
    /// Path to `/proc/cpuinfo`.
    pub cpuinfo: PathBuf,
    /// Path to `/proc/iomem`.
    pub iomem: PathBuf,
    /// Path to `/proc/meminfo`.
    pub meminfo: PathBuf,
}

impl Default for ProcPaths {
    fn default() -> Self {
        Self {
            cpuinfo: PathBuf::from("/proc/cpuinfo"),
            iomem: PathBuf::from("/proc/iomem"),
            meminfo: PathBuf::from("/proc/meminfo"),
        }
    }
}

impl ProcPaths {
    /// Builds a [`ProcPaths`] pointing at arbitrary files, for tests.
    #[must_use]
    pub fn at(cpuinfo: impl AsRef<Path>, iomem: impl AsRef<Path>, meminfo: impl AsRef<Path>) -> Self {
        Self {
            cpuinfo: cpuinfo.as_ref().to_path_buf(),
            iomem: iomem.as_ref().to_path_buf(),
            meminfo: meminfo.as_ref().to_path_buf(),
        }
    }
}

/// Runs every check against `tree`, aggregating errors, warnings, and
/// suggestions across all of them. Pass `proc_paths` to additionally run
/// the soft live-system cross-checks (spec §4.3 point 2); pass `None` to
/// skip them entirely (e.g. for a dry-run against a tree that was never
/// meant to represent *this* host).
#[must_use]
pub fn validate_tree(tree: &GlobalDeviceTree, proc_paths: Option<&ProcPaths>) -> ValidationResult {
    let mut result = ValidationResult::new();
    result.merge(validate_hardware_self_consistency(tree));
    if let Some(paths) = proc_paths {
        result.merge(validate_live_system(tree, paths));
    }
    result.merge(validate_instances(tree));
    result.merge(validate_global(tree));
    result
}

/// Spec §4.3 point 1: `total > 0`, `available` non-empty, host-reserved and
/// available disjoint, memory pool within total memory.
#[must_use]
pub fn validate_hardware_self_consistency(tree: &GlobalDeviceTree) -> ValidationResult {
    let mut result = ValidationResult::new();
    let hw = &tree.hardware;

    if hw.cpus.total == 0 {
        result.push_error("hardware.cpus.total must be greater than zero");
    }
    if hw.cpus.available.is_empty() {
        result.push_error("hardware.cpus.available must not be empty");
    }

    let reserved: BTreeSet<u32> = hw.cpus.host_reserved.iter().copied().collect();
    let available: BTreeSet<u32> = hw.cpus.available.iter().copied().collect();
    let overlap: Vec<u32> = reserved.intersection(&available).copied().collect();
    if !overlap.is_empty() {
        result.push_error(format!(
            "host_reserved and available CPU sets overlap on {overlap:?}"
        ));
    }

    let pool_end = hw.memory.memory_pool_end();
    if hw.memory.memory_pool_base < hw.memory.host_reserved_bytes {
        result.push_warning(format!(
            "memory pool base {:#x} overlaps the host-reserved region (first {:#x} bytes)",
            hw.memory.memory_pool_base, hw.memory.host_reserved_bytes
        ));
    }
    if pool_end > hw.memory.total_bytes {
        result.push_error(format!(
            "memory pool end {pool_end:#x} exceeds total system memory {:#x}",
            hw.memory.total_bytes
        ));
    }

    result
}

/// Spec §4.3 point 2: soft cross-checks against `/proc/cpuinfo`,
/// `/proc/iomem`, `/proc/meminfo`. The baseline may predate the live
/// system's current state, so every finding here is a warning, never an
/// error.
#[must_use]
pub fn validate_live_system(tree: &GlobalDeviceTree, proc_paths: &ProcPaths) -> ValidationResult {
    let mut result = ValidationResult::new();
    let hw = &tree.hardware;

    if let Some(physical_map) = kerf_model::procfs::processor_to_physical_id_map(&proc_paths.cpuinfo)
    {
        let live_processors: BTreeSet<u32> = physical_map.keys().copied().collect();
        let baseline_cpus: BTreeSet<u32> = hw
            .cpus
            .host_reserved
            .iter()
            .chain(hw.cpus.available.iter())
            .copied()
            .collect();
        for cpu in &baseline_cpus {
            if !live_processors.contains(cpu) {
                result.push_warning(format!(
                    "baseline CPU {cpu} is not present on the live system (/proc/cpuinfo)"
                ));
            }
        }
        let live_physical_ids: BTreeSet<u32> = physical_map.values().copied().collect();
        if live_processors.len() > live_physical_ids.len()
            && (hw.cpus.total as usize) > live_processors.len()
        {
            result.push_warning(format!(
                "baseline total CPU count {} exceeds the live system's {} logical processors",
                hw.cpus.total,
                live_processors.len()
            ));
        }
    }

    if let Some((iomem_base, iomem_bytes)) =
        kerf_model::procfs::multikernel_pool_region(&proc_paths.iomem)
    {
        if hw.memory.memory_pool_base != iomem_base {
            result.push_warning(format!(
                "baseline memory pool base {:#x} differs from the live /proc/iomem reservation base {iomem_base:#x}",
                hw.memory.memory_pool_base
            ));
        }
        let iomem_end = iomem_base + iomem_bytes;
        if hw.memory.memory_pool_end() > iomem_end {
            result.push_warning(format!(
                "baseline memory pool end {:#x} extends past the live /proc/iomem reservation end {iomem_end:#x}",
                hw.memory.memory_pool_end()
            ));
        }
    }

    if let Some(live_total) = kerf_model::procfs::total_memory_bytes(&proc_paths.meminfo) {
        if hw.memory.total_bytes > live_total {
            result.push_warning(format!(
                "baseline total memory {:#x} exceeds live system RAM {live_total:#x} (/proc/meminfo)",
                hw.memory.total_bytes
            ));
        }
    }

    result
}

/// Spec §4.3 point 3: per-instance CPU range/availability, memory
/// region/alignment, device reference resolution, and topology-affinity
/// sanity.
#[must_use]
pub fn validate_instances(tree: &GlobalDeviceTree) -> ValidationResult {
    let mut result = ValidationResult::new();
    let hw = &tree.hardware;
    let available_cpus: BTreeSet<u32> = hw.cpus.available.iter().copied().collect();
    let host_reserved: BTreeSet<u32> = hw.cpus.host_reserved.iter().copied().collect();

    let mut cpu_owners: BTreeMap<u32, &str> = BTreeMap::new();
    let mut memory_owners: Vec<(&str, u64, u64)> = Vec::new();

    for instance in tree.instances.values() {
        for &cpu in &instance.resources.cpus {
            if !available_cpus.contains(&cpu) {
                result.push_error(format!(
                    "instance '{}' requests CPU {cpu}, which is not in hardware.cpus.available",
                    instance.name
                ));
            }
            if host_reserved.contains(&cpu) {
                result.push_error(format!(
                    "instance '{}' requests CPU {cpu}, which is host-reserved",
                    instance.name
                ));
            }
            if let Some(owner) = cpu_owners.insert(cpu, &instance.name) {
                result.push_error(format!(
                    "CPU {cpu} is assigned to both '{owner}' and '{}'",
                    instance.name
                ));
                if let Some(suggestion) = suggest_free_cpus(tree, &instance.name) {
                    result.push_suggestion(suggestion);
                }
            }
        }

        let base = instance.resources.memory_base;
        let bytes = instance.resources.memory_bytes;
        let end = base + bytes;
        let pool_base = hw.memory.memory_pool_base;
        let pool_end = hw.memory.memory_pool_end();

        if base % 4096 != 0 {
            result.push_error(format!(
                "instance '{}' memory base {base:#x} is not 4KiB-aligned",
                instance.name
            ));
        }
        if base < pool_base || end > pool_end {
            result.push_error(format!(
                "instance '{}' memory region {base:#x}-{end:#x} falls outside the pool {pool_base:#x}-{pool_end:#x}",
                instance.name
            ));
        }
        for (other_name, other_base, other_bytes) in &memory_owners {
            let other_end = other_base + other_bytes;
            let disjoint = end <= *other_base || base >= other_end;
            if !disjoint {
                result.push_error(format!(
                    "instance '{}' memory region {base:#x}-{end:#x} overlaps '{other_name}' ({other_base:#x}-{other_end:#x})",
                    instance.name
                ));
            }
        }
        memory_owners.push((&instance.name, base, bytes));

        for device_ref in &instance.resources.devices {
            validate_device_reference(&mut result, hw, &instance.name, device_ref);
        }

        validate_topology_constraints(&mut result, tree, instance);
    }

    result
}

fn validate_device_reference(
    result: &mut ValidationResult,
    hw: &kerf_model::HardwareInventory,
    instance_name: &str,
    token: &str,
) {
    let reference = DeviceReference::parse(token);
    let Some(device) = hw.devices.get(&reference.parent) else {
        result.push_error(format!(
            "instance '{instance_name}' references unknown device '{}' (token '{token}')",
            reference.parent
        ));
        return;
    };

    if let Some(vf) = reference.vf_id {
        let available = device.available_vfs.as_deref().unwrap_or(&[]);
        if !available.contains(&vf) {
            result.push_error(format!(
                "instance '{instance_name}' references VF {vf} of device '{}', which is not in its available-vfs set",
                reference.parent
            ));
        }
    } else if let Some(ns) = reference.namespace_id {
        let available = device.available_ns.as_deref().unwrap_or(&[]);
        if !available.contains(&ns) {
            result.push_error(format!(
                "instance '{instance_name}' references namespace {ns} of device '{}', which is not in its available-ns set",
                reference.parent
            ));
        }
    }
}

fn validate_topology_constraints(
    result: &mut ValidationResult,
    tree: &GlobalDeviceTree,
    instance: &kerf_model::Instance,
) {
    let Some(affinity) = instance.resources.cpu_affinity else {
        return;
    };
    let Some(topology) = tree.hardware.topology.as_ref() else {
        result.push_warning(format!(
            "instance '{}' requests CPU affinity '{}' but the hardware inventory carries no topology information",
            instance.name,
            affinity.as_str()
        ));
        return;
    };

    let nodes: BTreeSet<u32> = instance
        .resources
        .cpus
        .iter()
        .filter_map(|cpu| topology.numa_node_for_cpu(*cpu))
        .collect();

    match affinity {
        CpuAffinity::Compact => {
            if nodes.len() > 1 {
                result.push_warning(format!(
                    "instance '{}' uses 'compact' affinity but its CPUs span multiple NUMA nodes {nodes:?}",
                    instance.name
                ));
            }
        }
        CpuAffinity::Spread => {
            if nodes.len() <= 1 && instance.resources.cpus.len() > 1 {
                result.push_warning(format!(
                    "instance '{}' uses 'spread' affinity but its CPUs are confined to a single NUMA node",
                    instance.name
                ));
            }
        }
        CpuAffinity::Local => {
            let memory_node = topology
                .numa_nodes
                .iter()
                .find(|(_, node)| {
                    instance.resources.memory_base >= node.memory_base
                        && instance.resources.memory_base < node.memory_base + node.memory_size
                })
                .map(|(id, _)| *id);
            if let Some(memory_node) = memory_node {
                if nodes.iter().any(|n| *n != memory_node) {
                    result.push_error(format!(
                        "instance '{}' uses 'local' affinity but its CPUs are not all in the same NUMA node as its memory region (node {memory_node})",
                        instance.name
                    ));
                }
            }
        }
    }

    if let Some(MemoryPolicy::Bind) = instance.resources.memory_policy {
        match &instance.resources.numa_nodes {
            None => result.push_error(format!(
                "instance '{}' uses memory policy 'bind' but specifies no NUMA nodes",
                instance.name
            )),
            Some(requested) => {
                for node in requested {
                    if !topology.numa_nodes.contains_key(node) {
                        result.push_error(format!(
                            "instance '{}' binds to NUMA node {node}, which does not exist in the topology",
                            instance.name
                        ));
                    }
                }
            }
        }
    }
}

fn suggest_free_cpus(tree: &GlobalDeviceTree, _conflicting_instance: &str) -> Option<String> {
    let available = kerf_model::alloc::available_cpus(tree);
    if available.is_empty() {
        return None;
    }
    let sample: Vec<u32> = available.into_iter().take(4).collect();
    Some(format!("consider using the free CPUs: {sample:?}"))
}

/// Spec §4.3 point 4: instance names and IDs are unique and in range; sums
/// of allocated CPUs/memory don't exceed the pool.
#[must_use]
pub fn validate_global(tree: &GlobalDeviceTree) -> ValidationResult {
    let mut result = ValidationResult::new();

    let mut seen_ids: BTreeMap<u16, &str> = BTreeMap::new();
    for instance in tree.instances.values() {
        if !(1..=511).contains(&instance.id) {
            result.push_error(format!(
                "instance '{}' has id {} outside the valid range 1..=511",
                instance.name, instance.id
            ));
        }
        if let Some(owner) = seen_ids.insert(instance.id, &instance.name) {
            result.push_error(format!(
                "instance id {} is used by both '{owner}' and '{}'",
                instance.id, instance.name
            ));
        }
        if instance.name.is_empty() {
            result.push_error("an instance has an empty name");
        }
    }

    let total_cpus: usize = tree
        .instances
        .values()
        .map(|i| i.resources.cpus.len())
        .sum();
    if total_cpus > tree.hardware.cpus.available.len() {
        result.push_error(format!(
            "instances request {total_cpus} CPUs in total, exceeding the {} available",
            tree.hardware.cpus.available.len()
        ));
    }

    let total_memory: u64 = tree
        .instances
        .values()
        .map(|i| i.resources.memory_bytes)
        .sum();
    if total_memory > tree.hardware.memory.memory_pool_bytes {
        result.push_error(format!(
            "instances request {total_memory:#x} bytes in total, exceeding the pool's {:#x}",
            tree.hardware.memory.memory_pool_bytes
        ));
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use kerf_model::{
        CpuAllocation, DeviceInfo, HardwareInventory, Instance, InstanceOptions,
        InstanceResources, MemoryAllocation, MemoryType, NumaNode, Topology,
    };
    use std::collections::BTreeMap;

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

    fn base_tree() -> GlobalDeviceTree {
        GlobalDeviceTree {
            hardware: HardwareInventory {
                cpus: CpuAllocation {
                    total: 32,
                    host_reserved: vec![0, 1, 2, 3],
                    available: (4..32).collect(),
                },
                memory: MemoryAllocation {
                    total_bytes: 16 * (1 << 30),
                    host_reserved_bytes: 1 << 30,
                    memory_pool_base: 0x8000_0000,
                    memory_pool_bytes: 14 * (1 << 30),
                },
                topology: None,
                devices: BTreeMap::new(),
            },
            instances: BTreeMap::new(),
            device_references: BTreeMap::new(),
        }
    }

    #[test]
    fn clean_tree_passes() {
        let mut tree = base_tree();
        tree.instances.insert(
            "web".to_string(),
            instance("web", 1, vec![4, 5, 6, 7], 0x8000_0000, 1 << 31),
        );
        let result = validate_tree(&tree, None);
        assert!(result.ok, "{:?}", result.errors);
    }

    #[test]
    fn detects_cpu_overlap_with_suggestion() {
        let mut tree = base_tree();
        tree.instances.insert(
            "web".to_string(),
            instance("web", 1, vec![4, 5, 6, 7], 0x8000_0000, 1 << 31),
        );
        tree.instances.insert(
            "bad".to_string(),
            instance("bad", 2, vec![6, 7, 8, 9], 0xc000_0000, 1 << 30),
        );
        let result = validate_tree(&tree, None);
        assert!(!result.ok);
        assert!(result.errors.iter().any(|e| e.contains("CPU 6")));
        assert!(!result.suggestions.is_empty());
    }

    #[test]
    fn detects_memory_overlap() {
        let mut tree = base_tree();
        tree.instances.insert(
            "web".to_string(),
            instance("web", 1, vec![4, 5], 0x8000_0000, 1 << 31),
        );
        tree.instances.insert(
            "db".to_string(),
            instance("db", 2, vec![6, 7], 0x8000_0000, 1 << 30),
        );
        let result = validate_tree(&tree, None);
        assert!(result.errors.iter().any(|e| e.contains("overlaps")));
    }

    #[test]
    fn detects_duplicate_instance_id() {
        let mut tree = base_tree();
        tree.instances.insert(
            "a".to_string(),
            instance("a", 1, vec![4], 0x8000_0000, 1 << 20),
        );
        tree.instances.insert(
            "b".to_string(),
            instance("b", 1, vec![5], 0x9000_0000, 1 << 20),
        );
        let result = validate_tree(&tree, None);
        assert!(result.errors.iter().any(|e| e.contains("instance id 1")));
    }

    #[test]
    fn detects_id_out_of_range() {
        let mut tree = base_tree();
        tree.instances.insert(
            "a".to_string(),
            instance("a", 512, vec![4], 0x8000_0000, 1 << 20),
        );
        let result = validate_tree(&tree, None);
        assert!(!result.ok);
    }

    #[test]
    fn rejects_unresolved_device_reference() {
        let mut tree = base_tree();
        let mut inst = instance("web", 1, vec![4], 0x8000_0000, 1 << 20);
        inst.resources.devices.push("eth0_vf1".to_string());
        tree.instances.insert("web".to_string(), inst);
        let result = validate_tree(&tree, None);
        assert!(result.errors.iter().any(|e| e.contains("unknown device")));
    }

    #[test]
    fn accepts_resolved_vf_reference() {
        let mut tree = base_tree();
        tree.hardware.devices.insert(
            "eth0".to_string(),
            DeviceInfo {
                name: "eth0".to_string(),
                compatible: "pci,network".to_string(),
                pci_id: Some("0000:02:00.0".to_string()),
                sriov_vfs: Some(4),
                host_reserved_vf: Some(0),
                available_vfs: Some(vec![1, 2, 3]),
                namespaces: None,
                host_reserved_ns: None,
                available_ns: None,
            },
        );
        let mut inst = instance("web", 1, vec![4], 0x8000_0000, 1 << 20);
        inst.resources.devices.push("eth0_vf1".to_string());
        tree.instances.insert("web".to_string(), inst);
        let result = validate_tree(&tree, None);
        assert!(result.ok, "{:?}", result.errors);
    }

    #[test]
    fn local_affinity_mismatch_is_an_error() {
        let mut tree = base_tree();
        tree.hardware.cpus.available = (4..16).collect();
        let mut numa_nodes = BTreeMap::new();
        numa_nodes.insert(
            0,
            NumaNode {
                memory_base: 0x8000_0000,
                memory_size: 1 << 30,
                cpus: (4..8).collect(),
                memory_type: MemoryType::Dram,
            },
        );
        numa_nodes.insert(
            1,
            NumaNode {
                memory_base: 0xc000_0000,
                memory_size: 1 << 30,
                cpus: (8..16).collect(),
                memory_type: MemoryType::Dram,
            },
        );
        tree.hardware.topology = Some(Topology { numa_nodes });

        let mut inst = instance("web", 1, vec![8, 9], 0x8000_0000, 1 << 20);
        inst.resources.cpu_affinity = Some(CpuAffinity::Local);
        tree.instances.insert("web".to_string(), inst);

        let result = validate_tree(&tree, None);
        assert!(result.errors.iter().any(|e| e.contains("local")));
    }

    #[test]
    fn hardware_self_consistency_flags_zero_total() {
        let mut tree = base_tree();
        tree.hardware.cpus.total = 0;
        let result = validate_hardware_self_consistency(&tree);
        assert!(!result.ok);
    }

    #[test]
    fn live_system_cross_check_warns_on_missing_cpu() {
        let mut tmp = std::env::temp_dir();
        tmp.push(format!("kerf-validate-cpuinfo-{}", std::process::id()));
        std::fs::write(&tmp, "processor\t: 0\nphysical id\t: 0\n").unwrap();
        let tree = base_tree();
        let paths = ProcPaths::at(&tmp, "/nonexistent/iomem", "/nonexistent/meminfo");
        let result = validate_live_system(&tree, &paths);
        assert!(!result.warnings.is_empty());
        assert!(result.ok);
        std::fs::remove_file(&tmp).ok();
    }
}

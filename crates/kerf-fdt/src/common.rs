//! Encode/decode helpers shared by the baseline, state, and overlay
//! dialects: the hardware inventory section (baseline + state) and the
//! per-instance resource section (state + overlay instance-create nodes)
//! are byte-for-byte identical across the dialects that carry them.

use kerf_model::{
    CpuAffinity, CpuAllocation, DeviceInfo, HardwareInventory, Instance, InstanceOptions,
    InstanceResources, MemoryAllocation, MemoryPolicy, MemoryType, NumaNode, Topology,
};
use std::collections::BTreeMap;

use crate::raw::RawNode;
use crate::writer::NodeBuilder;
use crate::{DecodeError, decode_err};

pub fn encode_hardware(node: &mut NodeBuilder, hw: &HardwareInventory) {
    node.child("cpus", |cpus| {
        cpus.prop_u32("total", hw.cpus.total);
        cpus.prop_u32_list("host-reserved", &hw.cpus.host_reserved);
        cpus.prop_u32_list("available", &hw.cpus.available);
    });
    node.child("memory", |mem| {
        mem.prop_u64("total-bytes", hw.memory.total_bytes);
        mem.prop_u64("host-reserved-bytes", hw.memory.host_reserved_bytes);
        mem.prop_u64("memory-pool-base", hw.memory.memory_pool_base);
        mem.prop_u64("memory-pool-bytes", hw.memory.memory_pool_bytes);
    });
    if let Some(topology) = &hw.topology {
        node.child("topology", |topo| {
            topo.child("numa-nodes", |numa| {
                for (id, n) in &topology.numa_nodes {
                    numa.child(&format!("node@{id}"), |node| {
                        node.prop_u64("memory-base", n.memory_base);
                        node.prop_u64("memory-size", n.memory_size);
                        node.prop_u32_list("cpus", &n.cpus);
                        node.prop_str("memory-type", n.memory_type.as_str());
                    });
                }
            });
        });
    }
    node.child("devices", |devices| {
        for (name, dev) in &hw.devices {
            devices.child(name, |d| {
                d.prop_str("compatible", &dev.compatible);
                if let Some(pci_id) = &dev.pci_id {
                    d.prop_str("pci-id", pci_id);
                }
                if let Some(vfs) = dev.sriov_vfs {
                    d.prop_u32("sriov-vfs", vfs);
                }
                if let Some(vf) = dev.host_reserved_vf {
                    d.prop_u32("host-reserved-vf", vf);
                }
                if let Some(avail) = &dev.available_vfs {
                    d.prop_u32_list("available-vfs", avail);
                }
                if let Some(ns) = dev.namespaces {
                    d.prop_u32("namespaces", ns);
                }
                if let Some(ns) = dev.host_reserved_ns {
                    d.prop_u32("host-reserved-ns", ns);
                }
                if let Some(avail) = &dev.available_ns {
                    d.prop_u32_list("available-ns", avail);
                }
            });
        }
    });
}

pub fn decode_hardware(resources: &RawNode) -> Result<HardwareInventory, DecodeError> {
    let cpus_node = resources
        .child("cpus")
        .ok_or_else(|| decode_err("missing /resources/cpus node"))?;
    let cpus = CpuAllocation {
        total: cpus_node
            .prop_u32("total")
            .ok_or_else(|| decode_err("missing cpus/total property"))?,
        // `host-reserved` is always written by the encoder; an absent
        // property on decode (e.g. a blob produced by older tooling) is
        // tolerated and treated as "no CPUs reserved".
        host_reserved: cpus_node.prop_u32_list("host-reserved").unwrap_or_default(),
        available: cpus_node.prop_u32_list("available").unwrap_or_default(),
    };

    let memory_node = resources
        .child("memory")
        .ok_or_else(|| decode_err("missing /resources/memory node"))?;
    let memory = MemoryAllocation {
        total_bytes: memory_node
            .prop_u64("total-bytes")
            .ok_or_else(|| decode_err("missing memory/total-bytes property"))?,
        host_reserved_bytes: memory_node.prop_u64("host-reserved-bytes").unwrap_or(0),
        memory_pool_base: memory_node
            .prop_u64("memory-pool-base")
            .ok_or_else(|| decode_err("missing memory/memory-pool-base property"))?,
        memory_pool_bytes: memory_node
            .prop_u64("memory-pool-bytes")
            .ok_or_else(|| decode_err("missing memory/memory-pool-bytes property"))?,
    };

    let topology = resources
        .child("topology")
        .and_then(|t| t.child("numa-nodes"))
        .map(|numa_nodes_node| {
            let mut numa_nodes = BTreeMap::new();
            for child in &numa_nodes_node.children {
                let Some(id_str) = child.name.strip_prefix("node@") else {
                    continue;
                };
                let Ok(id) = id_str.parse::<u32>() else {
                    continue;
                };
                numa_nodes.insert(
                    id,
                    NumaNode {
                        memory_base: child.prop_u64("memory-base").unwrap_or(0),
                        memory_size: child.prop_u64("memory-size").unwrap_or(0),
                        cpus: child.prop_u32_list("cpus").unwrap_or_default(),
                        memory_type: child
                            .prop_str("memory-type")
                            .map_or(MemoryType::Dram, MemoryType::parse),
                    },
                );
            }
            Topology { numa_nodes }
        })
        .filter(|t| !t.numa_nodes.is_empty());

    let mut devices = BTreeMap::new();
    if let Some(devices_node) = resources.child("devices") {
        for dev in &devices_node.children {
            devices.insert(
                dev.name.clone(),
                DeviceInfo {
                    name: dev.name.clone(),
                    compatible: dev.prop_str("compatible").unwrap_or_default().to_string(),
                    pci_id: dev.prop_str("pci-id").map(str::to_string),
                    sriov_vfs: dev.prop_u32("sriov-vfs"),
                    host_reserved_vf: dev.prop_u32("host-reserved-vf"),
                    available_vfs: dev.prop_u32_list("available-vfs"),
                    namespaces: dev.prop_u32("namespaces"),
                    host_reserved_ns: dev.prop_u32("host-reserved-ns"),
                    available_ns: dev.prop_u32_list("available-ns"),
                },
            );
        }
    }

    Ok(HardwareInventory {
        cpus,
        memory,
        topology,
        devices,
    })
}

pub fn encode_instance_body(node: &mut NodeBuilder, instance: &Instance) {
    node.prop_str("instance-name", &instance.name);
    node.prop_u32("id", u32::from(instance.id));
    node.child("resources", |r| {
        r.prop_u32_list("cpus", &instance.resources.cpus);
        r.prop_u64("memory-base", instance.resources.memory_base);
        r.prop_u64("memory-bytes", instance.resources.memory_bytes);
        if !instance.resources.devices.is_empty() {
            r.prop_str_list("device-names", &instance.resources.devices);
        }
        if let Some(numa_nodes) = &instance.resources.numa_nodes {
            r.prop_u32_list("numa-nodes", numa_nodes);
        }
        if let Some(affinity) = instance.resources.cpu_affinity {
            r.prop_str("cpu-affinity", affinity.as_str());
        }
        if let Some(policy) = instance.resources.memory_policy {
            r.prop_str("memory-policy", policy.as_str());
        }
    });
    if !instance.options.is_empty() {
        node.child("options", |o| {
            if instance.options.get("enable-host-kcore").copied().unwrap_or(false) {
                o.prop_flag("enable-host-kcore");
            }
        });
    }
}

pub fn decode_instance_body(node: &RawNode) -> Result<Instance, DecodeError> {
    let name = node
        .prop_str("instance-name")
        .ok_or_else(|| decode_err("missing instance-name property"))?
        .to_string();
    let id = node
        .prop_u32("id")
        .ok_or_else(|| decode_err("missing id property"))?;
    let id = u16::try_from(id).map_err(|_| decode_err("instance id does not fit in u16"))?;

    let r = node
        .child("resources")
        .ok_or_else(|| decode_err("missing instance resources node"))?;
    let resources = InstanceResources {
        cpus: r
            .prop_u32_list("cpus")
            .ok_or_else(|| decode_err("missing instance resources/cpus property"))?,
        memory_base: r
            .prop_u64("memory-base")
            .ok_or_else(|| decode_err("missing instance resources/memory-base property"))?,
        memory_bytes: r
            .prop_u64("memory-bytes")
            .ok_or_else(|| decode_err("missing instance resources/memory-bytes property"))?,
        devices: r.prop_str_list("device-names").unwrap_or_default(),
        numa_nodes: r.prop_u32_list("numa-nodes"),
        cpu_affinity: r
            .prop_str("cpu-affinity")
            .and_then(|s| CpuAffinity::parse(s).ok()),
        memory_policy: r
            .prop_str("memory-policy")
            .and_then(|s| MemoryPolicy::parse(s).ok()),
    };

    let mut options: InstanceOptions = BTreeMap::new();
    if let Some(opts) = node.child("options") {
        options.insert(
            "enable-host-kcore".to_string(),
            opts.has_flag("enable-host-kcore"),
        );
    }

    Ok(Instance {
        name,
        id,
        resources,
        options,
    })
}

//! State dialect: baseline hardware merged with every applied overlay.
//! Emitted only for inspection (`kerf show`) and tests; nothing reads a
//! state blob back as input to a mutating command.

use kerf_model::GlobalDeviceTree;

use crate::common::{decode_hardware, decode_instance_body, encode_hardware, encode_instance_body};
use crate::raw::parse;
use crate::writer::build;
use crate::{COMPATIBLE_STATE, DecodeError, decode_err};

/// Decodes a state blob into a merged global device tree.
pub fn decode(data: &[u8]) -> Result<GlobalDeviceTree, DecodeError> {
    let fdt = parse(data)?;
    let compatible = fdt
        .root
        .prop_str("compatible")
        .ok_or_else(|| decode_err("missing root compatible property"))?;
    if compatible != COMPATIBLE_STATE {
        return Err(decode_err(format!(
            "unexpected compatible string '{compatible}', expected '{COMPATIBLE_STATE}'"
        )));
    }
    let resources = fdt
        .root
        .child("resources")
        .ok_or_else(|| decode_err("missing /resources node"))?;
    let hardware = decode_hardware(resources)?;

    let mut instances = std::collections::BTreeMap::new();
    if let Some(instances_node) = fdt.root.child("instances") {
        for child in &instances_node.children {
            let instance = decode_instance_body(child)?;
            instances.insert(instance.name.clone(), instance);
        }
    }

    Ok(GlobalDeviceTree {
        hardware,
        instances,
        device_references: std::collections::BTreeMap::new(),
    })
}

/// Encodes a merged global device tree as a state blob.
#[must_use]
pub fn encode(tree: &GlobalDeviceTree) -> Vec<u8> {
    build(|root| {
        root.prop_str("compatible", COMPATIBLE_STATE);
        root.child("resources", |resources| {
            encode_hardware(resources, &tree.hardware);
        });
        root.child("instances", |instances| {
            for instance in tree.instances.values() {
                instances.child(&instance.name, |node| {
                    encode_instance_body(node, instance);
                });
            }
        });
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kerf_model::{
        CpuAllocation, Instance, InstanceOptions, InstanceResources, MemoryAllocation,
    };
    use std::collections::BTreeMap;

    fn sample_tree() -> GlobalDeviceTree {
        let mut instances = BTreeMap::new();
        let mut options: InstanceOptions = BTreeMap::new();
        options.insert("enable-host-kcore".to_string(), true);
        instances.insert(
            "web-server".to_string(),
            Instance {
                name: "web-server".to_string(),
                id: 1,
                resources: InstanceResources {
                    cpus: vec![4, 5, 6, 7],
                    memory_base: 1 << 31,
                    memory_bytes: 1 << 30,
                    devices: vec!["nvme0".to_string()],
                    numa_nodes: Some(vec![1]),
                    cpu_affinity: Some(kerf_model::CpuAffinity::Compact),
                    memory_policy: Some(kerf_model::MemoryPolicy::Local),
                },
                options,
            },
        );

        GlobalDeviceTree {
            hardware: kerf_model::HardwareInventory {
                cpus: CpuAllocation {
                    total: 16,
                    host_reserved: vec![0, 1, 2, 3],
                    available: (4..16).collect(),
                },
                memory: MemoryAllocation {
                    total_bytes: 1 << 33,
                    host_reserved_bytes: 1 << 31,
                    memory_pool_base: 1 << 31,
                    memory_pool_bytes: (1 << 33) - (1 << 31),
                },
                topology: None,
                devices: BTreeMap::new(),
            },
            instances,
            device_references: BTreeMap::new(),
        }
    }

    #[test]
    fn round_trips_merged_state() {
        let tree = sample_tree();
        let blob = encode(&tree);
        let decoded = decode(&blob).unwrap();

        assert_eq!(decoded.hardware.cpus.total, 16);
        let instance = decoded.instances.get("web-server").unwrap();
        assert_eq!(instance.id, 1);
        assert_eq!(instance.resources.cpus, vec![4, 5, 6, 7]);
        assert_eq!(instance.resources.devices, vec!["nvme0".to_string()]);
        assert_eq!(instance.resources.numa_nodes, Some(vec![1]));
        assert_eq!(instance.options.get("enable-host-kcore"), Some(&true));
    }

    #[test]
    fn empty_instances_decodes_to_empty_map() {
        let mut tree = sample_tree();
        tree.instances.clear();
        let decoded = decode(&encode(&tree)).unwrap();
        assert!(decoded.instances.is_empty());
    }
}

//! Baseline dialect: hardware inventory only, written once at boot by the
//! host kernel and read (never written) by every `kerf` invocation.

use kerf_model::HardwareInventory;

use crate::common::{decode_hardware, encode_hardware};
use crate::raw::parse;
use crate::writer::build;
use crate::{COMPATIBLE_BASELINE, DecodeError, decode_err};

/// Decodes a baseline blob into a hardware inventory.
///
/// Fails with [`DecodeError`] on a malformed structure block, a
/// `compatible` mismatch, or a missing mandatory property (CPU `total`,
/// memory `total-bytes`, `memory-pool-base`, `memory-pool-bytes`).
pub fn decode(data: &[u8]) -> Result<HardwareInventory, DecodeError> {
    let fdt = parse(data)?;
    let compatible = fdt
        .root
        .prop_str("compatible")
        .ok_or_else(|| decode_err("missing root compatible property"))?;
    if compatible != COMPATIBLE_BASELINE {
        return Err(decode_err(format!(
            "unexpected compatible string '{compatible}', expected '{COMPATIBLE_BASELINE}'"
        )));
    }
    let resources = fdt
        .root
        .child("resources")
        .ok_or_else(|| decode_err("missing /resources node"))?;
    decode_hardware(resources)
}

/// Encodes a hardware inventory as a baseline blob.
#[must_use]
pub fn encode(hw: &HardwareInventory) -> Vec<u8> {
    build(|root| {
        root.prop_str("compatible", COMPATIBLE_BASELINE);
        root.child("resources", |resources| {
            encode_hardware(resources, hw);
        });
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kerf_model::{CpuAllocation, DeviceInfo, MemoryAllocation, MemoryType, NumaNode, Topology};
    use std::collections::BTreeMap;

    fn sample_inventory() -> HardwareInventory {
        let mut devices = BTreeMap::new();
        devices.insert(
            "nvme0".to_string(),
            DeviceInfo {
                name: "nvme0".to_string(),
                compatible: "pci,nvme".to_string(),
                pci_id: Some("0000:01:00.0".to_string()),
                sriov_vfs: None,
                host_reserved_vf: None,
                available_vfs: None,
                namespaces: Some(4),
                host_reserved_ns: Some(0),
                available_ns: Some(vec![1, 2, 3]),
            },
        );

        let mut numa_nodes = BTreeMap::new();
        numa_nodes.insert(
            0,
            NumaNode {
                memory_base: 0,
                memory_size: 1 << 33,
                cpus: vec![0, 1, 2, 3],
                memory_type: MemoryType::Dram,
            },
        );

        HardwareInventory {
            cpus: CpuAllocation {
                total: 64,
                host_reserved: vec![0, 1],
                available: (2..64).collect(),
            },
            memory: MemoryAllocation {
                total_bytes: 1 << 36,
                host_reserved_bytes: 1 << 31,
                memory_pool_base: 1 << 31,
                memory_pool_bytes: (1 << 36) - (1 << 31),
            },
            topology: Some(Topology { numa_nodes }),
            devices,
        }
    }

    #[test]
    fn round_trips_full_inventory() {
        let hw = sample_inventory();
        let blob = encode(&hw);
        let decoded = decode(&blob).unwrap();

        assert_eq!(decoded.cpus.total, hw.cpus.total);
        assert_eq!(decoded.cpus.host_reserved, hw.cpus.host_reserved);
        assert_eq!(decoded.cpus.available, hw.cpus.available);
        assert_eq!(decoded.memory.total_bytes, hw.memory.total_bytes);
        assert_eq!(decoded.memory.memory_pool_base, hw.memory.memory_pool_base);
        let topo = decoded.topology.unwrap();
        assert_eq!(topo.numa_nodes.get(&0).unwrap().cpus, vec![0, 1, 2, 3]);
        let dev = decoded.devices.get("nvme0").unwrap();
        assert_eq!(dev.pci_id.as_deref(), Some("0000:01:00.0"));
        assert_eq!(dev.available_ns, Some(vec![1, 2, 3]));
    }

    #[test]
    fn round_trips_without_topology_or_devices() {
        let hw = HardwareInventory {
            cpus: CpuAllocation {
                total: 8,
                host_reserved: vec![0],
                available: (1..8).collect(),
            },
            memory: MemoryAllocation {
                total_bytes: 1 << 30,
                host_reserved_bytes: 0,
                memory_pool_base: 0,
                memory_pool_bytes: 1 << 30,
            },
            topology: None,
            devices: BTreeMap::new(),
        };
        let decoded = decode(&encode(&hw)).unwrap();
        assert!(decoded.topology.is_none());
        assert!(decoded.devices.is_empty());
    }

    #[test]
    fn rejects_wrong_compatible_string() {
        let blob = crate::writer::build(|root| {
            root.prop_str("compatible", "linux,multikernel-overlay");
            root.child("resources", |r| {
                encode_hardware(r, &sample_inventory());
            });
        });
        assert!(decode(&blob).is_err());
    }

    #[test]
    fn tolerates_absent_host_reserved_property() {
        // Simulates a blob produced without the host-reserved property:
        // decode should default it to empty rather than failing.
        let blob = build(|root| {
            root.prop_str("compatible", COMPATIBLE_BASELINE);
            root.child("resources", |resources| {
                resources.child("cpus", |cpus| {
                    cpus.prop_u32("total", 4);
                    cpus.prop_u32_list("available", &[0, 1, 2, 3]);
                });
                resources.child("memory", |mem| {
                    mem.prop_u64("total-bytes", 1 << 30);
                    mem.prop_u64("memory-pool-base", 0);
                    mem.prop_u64("memory-pool-bytes", 1 << 30);
                });
                resources.child("devices", |_| {});
            });
        });
        let decoded = decode(&blob).unwrap();
        assert!(decoded.cpus.host_reserved.is_empty());
    }
}

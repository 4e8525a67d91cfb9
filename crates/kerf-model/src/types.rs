//! Owned data model for hardware inventories, kernel instances, and the
//! merged global device tree.

use std::collections::BTreeMap;

/// CPU accounting for the whole machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuAllocation {
    /// Total number of logical CPUs present on the machine.
    pub total: u32,
    /// CPU IDs permanently reserved for the host kernel, never handed to an
    /// instance. Still a genuine, kernel-reported field: see
    /// `device-names`/`host-reserved` handling in `kerf-fdt`.
    pub host_reserved: Vec<u32>,
    /// CPU IDs available for allocation to instances (superset that
    /// includes CPUs already allocated; subtract instance usage to get the
    /// free pool).
    pub available: Vec<u32>,
}

/// Memory accounting for the whole machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryAllocation {
    /// Total physical memory in bytes.
    pub total_bytes: u64,
    /// Memory permanently reserved for the host kernel.
    pub host_reserved_bytes: u64,
    /// Base address of the pool available for instance allocation.
    pub memory_pool_base: u64,
    /// Size in bytes of the instance-allocatable pool.
    pub memory_pool_bytes: u64,
}

impl MemoryAllocation {
    /// The first address past the end of the allocatable pool.
    #[must_use]
    pub fn memory_pool_end(&self) -> u64 {
        self.memory_pool_base + self.memory_pool_bytes
    }
}

/// The memory technology backing a NUMA node. Hardware descriptors may
/// report values this crate doesn't recognize by name; those round-trip
/// through [`MemoryType::Other`] rather than being rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryType {
    /// Conventional DRAM.
    Dram,
    /// High-bandwidth memory.
    Hbm,
    /// CXL-attached memory.
    Cxl,
    /// Any other value reported by the hardware descriptor, kept verbatim.
    Other(String),
}

impl MemoryType {
    /// Parses a hardware-reported memory-type string.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "dram" => Self::Dram,
            "hbm" => Self::Hbm,
            "cxl" => Self::Cxl,
            other => Self::Other(other.to_string()),
        }
    }

    /// The string form written back into an FDT property.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Dram => "dram",
            Self::Hbm => "hbm",
            Self::Cxl => "cxl",
            Self::Other(s) => s,
        }
    }
}

/// A single NUMA node's memory range and CPU membership.
#[derive(Debug, Clone, PartialEq)]
pub struct NumaNode {
    /// Base address of this node's memory range.
    pub memory_base: u64,
    /// Size in bytes of this node's memory range.
    pub memory_size: u64,
    /// CPU IDs local to this node.
    pub cpus: Vec<u32>,
    /// Memory technology for this node.
    pub memory_type: MemoryType,
}

/// NUMA topology, when the hardware descriptor reports one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Topology {
    /// NUMA node ID to node info.
    pub numa_nodes: BTreeMap<u32, NumaNode>,
}

impl Topology {
    /// The NUMA node a CPU belongs to, if the topology accounts for it.
    #[must_use]
    pub fn numa_node_for_cpu(&self, cpu: u32) -> Option<u32> {
        self.numa_nodes
            .iter()
            .find(|(_, node)| node.cpus.contains(&cpu))
            .map(|(id, _)| *id)
    }
}

/// A device present in the hardware inventory (PCI function, SR-IOV
/// parent, NVMe controller, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    /// Device name as referenced by instances (`devices` lists).
    pub name: String,
    /// `compatible` string from the hardware descriptor.
    pub compatible: String,
    /// PCI BDF address, when applicable.
    pub pci_id: Option<String>,
    /// Number of SR-IOV virtual functions the device exposes.
    pub sriov_vfs: Option<u32>,
    /// VF index permanently reserved for the host.
    pub host_reserved_vf: Option<u32>,
    /// VF indices available for instance assignment.
    pub available_vfs: Option<Vec<u32>>,
    /// Number of NVMe namespaces the device exposes.
    pub namespaces: Option<u32>,
    /// Namespace index permanently reserved for the host.
    pub host_reserved_ns: Option<u32>,
    /// Namespace indices available for instance assignment.
    pub available_ns: Option<Vec<u32>>,
    /// PCI vendor ID, when known.
    pub vendor_id: Option<u32>,
    /// PCI device ID, when known.
    pub device_id: Option<u32>,
}

/// Complete hardware inventory, decoded from the baseline dialect or
/// reconstructed from live state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HardwareInventory {
    /// CPU accounting.
    pub cpus: CpuAllocation,
    /// Memory accounting.
    pub memory: MemoryAllocation,
    /// NUMA topology, if reported.
    pub topology: Option<Topology>,
    /// Devices keyed by name.
    pub devices: BTreeMap<String, DeviceInfo>,
}

/// How CPUs assigned to an instance are chosen relative to each other and
/// to NUMA nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuAffinity {
    /// Prefer a single NUMA node and consecutive CPU IDs.
    Compact,
    /// Distribute evenly across the requested (or all) NUMA nodes.
    Spread,
    /// Require CPUs co-located with the instance's memory on one NUMA node.
    Local,
}

impl CpuAffinity {
    /// Parses the textual form used in overlay properties and CLI flags.
    pub fn parse(value: &str) -> Result<Self, String> {
        match value {
            "compact" => Ok(Self::Compact),
            "spread" => Ok(Self::Spread),
            "local" => Ok(Self::Local),
            other => Err(format!("unknown CPU affinity policy '{other}'")),
        }
    }

    /// The textual form written back into overlay properties.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compact => "compact",
            Self::Spread => "spread",
            Self::Local => "local",
        }
    }
}

/// How an instance's memory is placed relative to NUMA nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPolicy {
    /// Allocate entirely from one NUMA node.
    Local,
    /// Interleave allocation across the requested NUMA nodes.
    Interleave,
    /// Bind allocation to a specific NUMA node, failing if unavailable.
    Bind,
}

impl MemoryPolicy {
    /// Parses the textual form used in overlay properties and CLI flags.
    pub fn parse(value: &str) -> Result<Self, String> {
        match value {
            "local" => Ok(Self::Local),
            "interleave" => Ok(Self::Interleave),
            "bind" => Ok(Self::Bind),
            other => Err(format!("unknown memory policy '{other}'")),
        }
    }

    /// The textual form written back into overlay properties.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Interleave => "interleave",
            Self::Bind => "bind",
        }
    }
}

/// Resource allocation carried by a single instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceResources {
    /// CPU IDs assigned to this instance.
    pub cpus: Vec<u32>,
    /// Base address of this instance's memory region.
    pub memory_base: u64,
    /// Size in bytes of this instance's memory region.
    pub memory_bytes: u64,
    /// Device references assigned to this instance.
    pub devices: Vec<String>,
    /// Preferred NUMA nodes, if any were requested.
    pub numa_nodes: Option<Vec<u32>>,
    /// CPU affinity policy used when these CPUs were allocated.
    pub cpu_affinity: Option<CpuAffinity>,
    /// Memory placement policy used when this region was allocated.
    pub memory_policy: Option<MemoryPolicy>,
}

/// Open set of boolean instance flags (e.g. `enable-host-kcore`).
///
/// Unrecognized flags pass through unvalidated; only flags the validator
/// specifically knows about are checked for sane values.
pub type InstanceOptions = BTreeMap<String, bool>;

/// A single kernel instance definition.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    /// Instance name, unique within the global device tree.
    pub name: String,
    /// Instance ID in `1..=511`, used for kernel-side addressing.
    pub id: u16,
    /// Resource allocation.
    pub resources: InstanceResources,
    /// Open instance option flags.
    pub options: InstanceOptions,
}

/// A resolved device reference: a token like `eth0_vf1` or `nvme0_ns2`
/// naming a parent device plus, for SR-IOV/NVMe sub-units, which VF or
/// namespace it denotes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceReference {
    /// The parent device's name in `hardware.devices`.
    pub parent: String,
    /// VF index, for an `_vfN` token.
    pub vf_id: Option<u32>,
    /// Namespace index, for an `_nsN` token.
    pub namespace_id: Option<u32>,
}

impl DeviceReference {
    /// Parses a device reference token without consulting the hardware
    /// inventory: `eth0_vf1` → parent `eth0`, vf 1; `nvme0_ns2` → parent
    /// `nvme0`, namespace 2; anything else is a bare device name with no
    /// sub-unit. Resolving whether the parent and sub-unit actually exist
    /// happens at validation time, not here — a device named e.g.
    /// `storage_vfcache` that doesn't end in digits falls through to the
    /// bare-name case rather than a spurious VF match.
    #[must_use]
    pub fn parse(token: &str) -> Self {
        if let Some(parsed) = Self::parse_suffix(token, "_vf", |id| Self {
            parent: String::new(),
            vf_id: Some(id),
            namespace_id: None,
        }) {
            return parsed;
        }
        if let Some(parsed) = Self::parse_suffix(token, "_ns", |id| Self {
            parent: String::new(),
            vf_id: None,
            namespace_id: Some(id),
        }) {
            return parsed;
        }
        Self {
            parent: token.to_string(),
            vf_id: None,
            namespace_id: None,
        }
    }

    fn parse_suffix(token: &str, marker: &str, build: impl Fn(u32) -> Self) -> Option<Self> {
        let pos = token.rfind(marker)?;
        let (parent, rest) = token.split_at(pos);
        let digits = &rest[marker.len()..];
        if parent.is_empty() || digits.is_empty() {
            return None;
        }
        let id: u32 = digits.parse().ok()?;
        let mut reference = build(id);
        reference.parent = parent.to_string();
        Some(reference)
    }
}

/// The merged view of baseline hardware plus every applied overlay.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalDeviceTree {
    /// Hardware inventory (from the baseline dialect).
    pub hardware: HardwareInventory,
    /// Instances keyed by name.
    pub instances: BTreeMap<String, Instance>,
    /// Device reference tokens resolved while validating or merging
    /// overlays, keyed by the token itself (e.g. `eth0_vf1`).
    pub device_references: BTreeMap<String, DeviceReference>,
}

/// An incremental resource change carried by an `instance-update` overlay
/// fragment. Only CPU set and memory region are mutable in place; device,
/// NUMA, affinity, and policy choices are fixed at creation and can only
/// change via delete-and-recreate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceDelta {
    /// The memory region being freed, if the instance's region is moving.
    pub memory_remove: Option<(u64, u64)>,
    /// The memory region being assigned, if the instance's region is
    /// moving.
    pub memory_add: Option<(u64, u64)>,
    /// CPU IDs being freed.
    pub cpu_remove: Vec<u32>,
    /// CPU IDs being assigned.
    pub cpu_add: Vec<u32>,
}

impl ResourceDelta {
    /// Whether this delta changes nothing (a no-op update).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.memory_remove.is_none()
            && self.memory_add.is_none()
            && self.cpu_remove.is_empty()
            && self.cpu_add.is_empty()
    }
}

/// One fragment's worth of overlay mutation, tagged by kind. Used while
/// encoding (to walk creates/updates/removals in wire order) and decoding
/// (one value per `fragment@N`).
#[derive(Debug, Clone)]
pub enum DeltaOp {
    /// Introduce a brand-new instance.
    Create(Instance),
    /// Apply an incremental CPU/memory change to an existing instance.
    Update {
        /// The instance being updated.
        name: String,
        /// The change to apply.
        delta: ResourceDelta,
    },
    /// Remove an instance by name.
    Remove(String),
}

/// A decoded overlay: the structured instance delta it carries, plus the
/// transaction ID it was read from (not part of the blob itself; filled in
/// by the caller from the transaction directory name).
#[derive(Debug, Clone, Default)]
pub struct OverlayDelta {
    /// Transaction ID this overlay was applied under. Overlays merge in
    /// transaction-ID order.
    pub transaction_id: u64,
    /// New instances, keyed by name.
    pub creates: BTreeMap<String, Instance>,
    /// Incremental changes to existing instances, keyed by name.
    pub updates: BTreeMap<String, ResourceDelta>,
    /// Instance names to remove.
    pub removals: std::collections::BTreeSet<String>,
}

impl OverlayDelta {
    /// Whether this overlay carries no mutations at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.removals.is_empty()
    }

    /// The fragment-order sequence of ops: creates-and-updates first (by
    /// name, since both collections are `BTreeMap`s), removals last.
    #[must_use]
    pub fn ops_in_wire_order(&self) -> Vec<DeltaOp> {
        let mut ops = Vec::with_capacity(self.creates.len() + self.updates.len() + self.removals.len());
        let mut names: Vec<&String> = self.creates.keys().chain(self.updates.keys()).collect();
        names.sort();
        names.dedup();
        for name in names {
            if let Some(instance) = self.creates.get(name) {
                ops.push(DeltaOp::Create(instance.clone()));
            } else if let Some(delta) = self.updates.get(name) {
                ops.push(DeltaOp::Update {
                    name: name.clone(),
                    delta: delta.clone(),
                });
            }
        }
        for name in &self.removals {
            ops.push(DeltaOp::Remove(name.clone()));
        }
        ops
    }
}

/// Outcome of a validation pass: never fails fast, always aggregates every
/// finding across the whole tree.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// `true` only if `errors` is empty.
    pub ok: bool,
    /// Hard invariant violations.
    pub errors: Vec<String>,
    /// Soft findings that don't block the operation (e.g. live-system
    /// cross-check discrepancies).
    pub warnings: Vec<String>,
    /// Suggested fixes or follow-ups, informational only.
    pub suggestions: Vec<String>,
}

impl ValidationResult {
    /// An empty, passing result.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ok: true,
            ..Self::default()
        }
    }

    /// Appends an error and flips `ok` to `false`.
    pub fn push_error(&mut self, message: impl Into<String>) {
        self.ok = false;
        self.errors.push(message.into());
    }

    /// Appends a warning. Does not affect `ok`.
    pub fn push_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Appends a suggestion. Does not affect `ok`.
    pub fn push_suggestion(&mut self, message: impl Into<String>) {
        self.suggestions.push(message.into());
    }

    /// Merges another result's findings into this one.
    pub fn merge(&mut self, other: Self) {
        self.ok &= other.ok;
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
        self.suggestions.extend(other.suggestions);
    }
}

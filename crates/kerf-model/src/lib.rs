//! Owned resource model, allocator algorithms, and the shared error type
//! for the multikernel host control plane.
//!
//! This crate sits beneath `kerf-fdt`, `kerf-validate`, and `kerf-runtime`
//! in the workspace's dependency graph: it defines the data those crates
//! all operate on (`GlobalDeviceTree`, `Instance`, `HardwareInventory`),
//! the allocation algorithms that decide what goes into a new instance, and
//! the `KerfError` type every fallible operation downstream returns.

pub mod alloc;
pub mod error;
pub mod merge;
pub mod procfs;
pub mod types;

pub use error::{KerfError, Result};
pub use types::{
    CpuAffinity, CpuAllocation, DeltaOp, DeviceInfo, DeviceReference, GlobalDeviceTree,
    HardwareInventory, Instance, InstanceOptions, InstanceResources, MemoryAllocation,
    MemoryPolicy, MemoryType, NumaNode, OverlayDelta, ResourceDelta, Topology, ValidationResult,
};

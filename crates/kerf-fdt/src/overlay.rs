//! Overlay dialect: sequential `fragment@N` nodes carrying instance
//! create/update/remove deltas. Hardware resources are never carried in an
//! overlay; the host reconstructs current state by merging baseline with
//! every applied overlay in transaction-ID order.
//!
//! Fragment order on encode is creates-and-updates first (in the iteration
//! order of [`OverlayDelta::ops_in_wire_order`]), removals last; fragment
//! indices are sequential starting at zero. An `instance-update` fragment's
//! `__overlay__` node carries up to four subsections in a fixed order —
//! `memory-remove`, `memory-add`, `cpu-remove`, `cpu-add` — so the kernel
//! can free memory, then allocate it, then free CPUs, then allocate them,
//! which is the only ordering that avoids a transient double-booking when
//! an update reassigns both CPUs and memory at once.

use kerf_model::{DeltaOp, OverlayDelta, ResourceDelta};

use crate::common::{decode_instance_body, encode_instance_body};
use crate::raw::{RawNode, parse};
use crate::writer::build;
use crate::{COMPATIBLE_OVERLAY, DecodeError, decode_err};

/// Decodes an overlay blob into its structured instance delta.
///
/// The transaction ID isn't carried in the blob itself (it's the kernel's
/// transaction directory name the blob is read from); this function always
/// returns `transaction_id: 0` and callers fill in the real ID after
/// decoding, once they know which `tx_<N>/dtbo` the blob came from.
pub fn decode(data: &[u8]) -> Result<OverlayDelta, DecodeError> {
    let fdt = parse(data)?;
    let compatible = fdt
        .root
        .prop_str("compatible")
        .ok_or_else(|| decode_err("missing root compatible property"))?;
    if compatible != COMPATIBLE_OVERLAY {
        return Err(decode_err(format!(
            "unexpected compatible string '{compatible}', expected '{COMPATIBLE_OVERLAY}'"
        )));
    }

    let mut delta = OverlayDelta::default();
    for fragment in &fdt.root.children {
        if !fragment.name.starts_with("fragment@") {
            continue;
        }
        let overlay_node = fragment
            .child("__overlay__")
            .ok_or_else(|| decode_err(format!("{} missing __overlay__ node", fragment.name)))?;
        if let Some(create) = overlay_node.child("instance-create") {
            let instance = decode_instance_body(create)?;
            delta.creates.insert(instance.name.clone(), instance);
        } else if let Some(remove) = overlay_node.child("instance-remove") {
            let name = remove
                .prop_str("instance-name")
                .ok_or_else(|| decode_err("instance-remove missing instance-name property"))?
                .to_string();
            delta.removals.insert(name);
        } else if let Some(update) = overlay_node.child("instance-update") {
            let name = update
                .prop_str("instance-name")
                .ok_or_else(|| decode_err("instance-update missing instance-name property"))?
                .to_string();
            delta.updates.insert(name, decode_resource_delta(update)?);
        } else {
            return Err(decode_err(format!(
                "{} has no instance-create, instance-update, or instance-remove child",
                fragment.name
            )));
        }
    }

    Ok(delta)
}

fn decode_resource_delta(update: &RawNode) -> Result<ResourceDelta, DecodeError> {
    Ok(ResourceDelta {
        memory_remove: decode_region(update, "memory-remove"),
        memory_add: decode_region(update, "memory-add"),
        cpu_remove: update.prop_u32_list("cpu-remove").unwrap_or_default(),
        cpu_add: update.prop_u32_list("cpu-add").unwrap_or_default(),
    })
}

fn decode_region(update: &RawNode, name: &str) -> Option<(u64, u64)> {
    let node = update.child(name)?;
    let base = node.prop_u64("base")?;
    let bytes = node.prop_u64("bytes")?;
    Some((base, bytes))
}

/// Encodes an overlay delta as a blob.
///
/// Fragments are emitted in [`OverlayDelta::ops_in_wire_order`]'s order:
/// creates and updates first (sorted by instance name), removals last.
/// Fragment IDs are assigned sequentially starting at zero.
#[must_use]
pub fn encode(delta: &OverlayDelta) -> Vec<u8> {
    build(|root| {
        root.prop_str("compatible", COMPATIBLE_OVERLAY);
        for (fragment_id, op) in delta.ops_in_wire_order().into_iter().enumerate() {
            root.child(&format!("fragment@{fragment_id}"), |fragment| {
                fragment.child("__overlay__", |overlay| match &op {
                    DeltaOp::Create(instance) => {
                        overlay.child("instance-create", |create| {
                            encode_instance_body(create, instance);
                        });
                    }
                    DeltaOp::Update { name, delta } => {
                        overlay.child("instance-update", |update| {
                            update.prop_str("instance-name", name);
                            encode_resource_delta(update, delta);
                        });
                    }
                    DeltaOp::Remove(name) => {
                        overlay.child("instance-remove", |remove| {
                            remove.prop_str("instance-name", name);
                        });
                    }
                });
            });
        }
    })
}

fn encode_resource_delta(node: &mut crate::writer::NodeBuilder, delta: &ResourceDelta) {
    if let Some((base, bytes)) = delta.memory_remove {
        node.child("memory-remove", |r| {
            r.prop_u64("base", base);
            r.prop_u64("bytes", bytes);
        });
    }
    if let Some((base, bytes)) = delta.memory_add {
        node.child("memory-add", |r| {
            r.prop_u64("base", base);
            r.prop_u64("bytes", bytes);
        });
    }
    if !delta.cpu_remove.is_empty() {
        node.prop_u32_list("cpu-remove", &delta.cpu_remove);
    }
    if !delta.cpu_add.is_empty() {
        node.prop_u32_list("cpu-add", &delta.cpu_add);
    }
}

/// Rejects an encoder input in which `current.hardware != modified.hardware`
/// before it ever reaches [`encode`], per spec: overlays cannot carry a
/// hardware change. Thin wrapper around [`kerf_model::merge::diff`] kept
/// here so callers that only depend on `kerf-fdt` for the codec boundary
/// still see the rejection at the right layer.
pub fn encode_transaction(
    current: &kerf_model::GlobalDeviceTree,
    modified: &kerf_model::GlobalDeviceTree,
) -> kerf_model::Result<Vec<u8>> {
    let delta = kerf_model::merge::diff(current, modified)?;
    Ok(encode(&delta))
}

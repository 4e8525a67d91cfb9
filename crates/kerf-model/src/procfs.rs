//! Hand-rolled parsers for the `/proc` files used to cross-check a hardware
//! inventory against the live system. Lives in `kerf-model` (not
//! `kerf-runtime` or `kerf-validate`) so both of those crates can use it
//! without introducing a dependency cycle between them.
//!
//! None of these fail loudly: a missing or unparsable `/proc` entry means
//! the corresponding cross-check is skipped (and the caller should turn
//! that into a warning, not an error), matching how the original inventory
//! inspector treats an unreadable `/proc` file as "skip this check" rather
//! than a hard failure.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Returns the physical CPU ID for every logical processor in
/// `/proc/cpuinfo`, or `None` if the file is missing or carries no
/// `physical id` lines.
#[must_use]
pub fn processor_to_physical_id_map(path: &Path) -> Option<BTreeMap<u32, u32>> {
    let content = std::fs::read_to_string(path).ok()?;
    let mut map = BTreeMap::new();
    let mut current_processor: Option<u32> = None;

    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("processor") {
            current_processor = parse_colon_value(rest);
        } else if let Some(rest) = line.strip_prefix("physical id") {
            if let (Some(proc_id), Some(phys_id)) = (current_processor, parse_colon_value(rest)) {
                map.insert(proc_id, phys_id);
            }
        }
    }

    (!map.is_empty()).then_some(map)
}

fn parse_colon_value(rest: &str) -> Option<u32> {
    rest.split(':').nth(1)?.trim().parse().ok()
}

/// Total physical memory in bytes, read from `MemTotal:` in
/// `/proc/meminfo` (reported there in kB).
#[must_use]
pub fn total_memory_bytes(path: &Path) -> Option<u64> {
    let content = std::fs::read_to_string(path).ok()?;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

/// Finds the multikernel memory pool's `(base, size)` region in
/// `/proc/iomem` by locating the line whose label contains "multikernel"
/// (case-insensitively).
#[must_use]
pub fn multikernel_pool_region(path: &Path) -> Option<(u64, u64)> {
    let content = std::fs::read_to_string(path).ok()?;
    content
        .lines()
        .find(|line| line.to_ascii_lowercase().contains("multikernel"))
        .and_then(parse_iomem_range)
}

/// Finds every per-instance region in `/proc/iomem` whose label contains
/// `mk-instance-`, returning `(base, size)` pairs.
#[must_use]
pub fn instance_regions(path: &Path) -> Vec<(u64, u64)> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    content
        .lines()
        .filter(|line| line.contains("mk-instance-"))
        .filter_map(parse_iomem_range)
        .collect()
}

fn parse_iomem_range(line: &str) -> Option<(u64, u64)> {
    let (range, _label) = line.split_once(':')?;
    let (start, end) = range.trim().split_once('-')?;
    let base = u64::from_str_radix(start.trim(), 16).ok()?;
    let end = u64::from_str_radix(end.trim(), 16).ok()?;
    // /proc/iomem ranges are inclusive.
    Some((base, end.checked_sub(base)?.checked_add(1)?))
}

/// Mount points currently listing `kind` as their filesystem type, parsed
/// from `/proc/mounts`.
#[must_use]
pub fn mounts_of_type(path: &Path, kind: &str) -> BTreeSet<String> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return BTreeSet::new();
    };
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let mount_point = fields.next()?;
            let fs_type = fields.next()?;
            (fs_type == kind).then(|| mount_point.to_string())
        })
        .collect()
}

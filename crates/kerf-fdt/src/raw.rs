//! Minimal owned FDT reader: walks a DTB's structure block and hands back
//! plain Rust values instead of borrowed node handles. Adapted from the
//! token-walking algorithm of a borrowing FDT parser, but every property and
//! child is copied out as soon as it's visited since the dialects this crate
//! decodes (baseline / overlay / state) are small enough that an owned tree
//! costs nothing and is far easier for the dialect layer to pattern-match on.

use std::collections::BTreeMap;

const FDT_MAGIC: u32 = 0xd00d_feed;
const FDT_BEGIN_NODE: u32 = 1;
const FDT_END_NODE: u32 = 2;
const FDT_PROP: u32 = 3;
const FDT_NOP: u32 = 4;
const FDT_END: u32 = 9;

/// A structure-block parse error. Carries enough context to be reported
/// directly as a [`kerf_model::KerfError::Parse`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RawFdtError {
    /// Blob is smaller than the 40-byte header or header fields overrun it.
    #[error("truncated FDT header")]
    TruncatedHeader,
    /// `magic` field did not match `0xd00dfeed`.
    #[error("invalid FDT magic: {0:#010x}")]
    InvalidMagic(u32),
    /// `last_comp_version` is newer than this decoder supports.
    #[error("unsupported FDT version (last_comp_version={0})")]
    UnsupportedVersion(u32),
    /// A token, property length, or string reference ran past the end of
    /// its block.
    #[error("malformed FDT structure block: {0}")]
    MalformedStructure(&'static str),
}

/// An owned device-tree node: name, properties (raw bytes, dialect layer
/// interprets them), and children in file order.
#[derive(Debug, Clone, Default)]
pub struct RawNode {
    /// Node name without the `@unit-address` suffix stripped (kept verbatim).
    pub name: String,
    /// Properties in file order, keyed by name (later duplicates overwrite
    /// earlier ones, matching how every dtc-family tool behaves).
    pub properties: BTreeMap<String, Vec<u8>>,
    /// Child nodes in file order.
    pub children: Vec<RawNode>,
}

impl RawNode {
    /// The first direct child whose name equals `name`.
    #[must_use]
    pub fn child(&self, name: &str) -> Option<&RawNode> {
        self.children.iter().find(|c| c.name == name)
    }

    /// A `u32` property, big-endian decoded.
    #[must_use]
    pub fn prop_u32(&self, name: &str) -> Option<u32> {
        let bytes = self.properties.get(name)?;
        Some(u32::from_be_bytes(bytes.as_slice().try_into().ok()?))
    }

    /// A `u64` property, big-endian decoded.
    #[must_use]
    pub fn prop_u64(&self, name: &str) -> Option<u64> {
        let bytes = self.properties.get(name)?;
        Some(u64::from_be_bytes(bytes.as_slice().try_into().ok()?))
    }

    /// A `u32`-array property, big-endian decoded element by element.
    #[must_use]
    pub fn prop_u32_list(&self, name: &str) -> Option<Vec<u32>> {
        let bytes = self.properties.get(name)?;
        if bytes.len() % 4 != 0 {
            return None;
        }
        Some(
            bytes
                .chunks_exact(4)
                .map(|c| u32::from_be_bytes(c.try_into().unwrap()))
                .collect(),
        )
    }

    /// A NUL-terminated string property (NUL stripped).
    #[must_use]
    pub fn prop_str(&self, name: &str) -> Option<&str> {
        let bytes = self.properties.get(name)?;
        let bytes = bytes.strip_suffix(&[0]).unwrap_or(bytes);
        std::str::from_utf8(bytes).ok()
    }

    /// A space-separated string-list property. Per the wire format's own
    /// generator, multiple entries are joined with a single space rather
    /// than NUL-separated like a standard FDT stringlist; a property
    /// present but empty yields an empty `Vec`, not `None`.
    #[must_use]
    pub fn prop_str_list(&self, name: &str) -> Option<Vec<String>> {
        let s = self.prop_str(name)?;
        Some(
            s.split_whitespace()
                .map(std::string::ToString::to_string)
                .collect(),
        )
    }

    /// Whether a valueless marker property (e.g. `enable-host-kcore`) is
    /// present.
    #[must_use]
    pub fn has_flag(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }
}

/// A memory reservation block entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemReservation {
    /// Reserved region base address.
    pub address: u64,
    /// Reserved region size in bytes.
    pub size: u64,
}

/// A fully parsed DTB: the root node plus the memory reservation block.
#[derive(Debug, Clone, Default)]
pub struct RawFdt {
    /// The tree root (name is always empty).
    pub root: RawNode,
    /// Memory reservations, terminator entry excluded.
    pub mem_reservations: Vec<MemReservation>,
}

fn read_be32(data: &[u8], offset: usize) -> Result<u32, RawFdtError> {
    let bytes = data
        .get(offset..offset + 4)
        .ok_or(RawFdtError::MalformedStructure("u32 read past end"))?;
    Ok(u32::from_be_bytes(bytes.try_into().unwrap()))
}

fn align4(offset: usize) -> usize {
    (offset + 3) & !3
}

/// Parses a complete DTB blob into an owned tree.
pub fn parse(data: &[u8]) -> Result<RawFdt, RawFdtError> {
    if data.len() < 40 {
        return Err(RawFdtError::TruncatedHeader);
    }
    let magic = read_be32(data, 0)?;
    if magic != FDT_MAGIC {
        return Err(RawFdtError::InvalidMagic(magic));
    }
    let totalsize = read_be32(data, 4)? as usize;
    let off_dt_struct = read_be32(data, 8)? as usize;
    let off_dt_strings = read_be32(data, 12)? as usize;
    let off_mem_rsvmap = read_be32(data, 16)? as usize;
    let last_comp_version = read_be32(data, 24)?;
    let size_dt_strings = read_be32(data, 32)? as usize;
    let size_dt_struct = read_be32(data, 36)? as usize;

    if last_comp_version > 17 {
        return Err(RawFdtError::UnsupportedVersion(last_comp_version));
    }
    if totalsize > data.len()
        || off_dt_struct + size_dt_struct > totalsize
        || off_dt_strings + size_dt_strings > totalsize
    {
        return Err(RawFdtError::MalformedStructure(
            "block offsets overrun totalsize",
        ));
    }

    let mem_reservations = parse_mem_reservations(data, off_mem_rsvmap)?;
    let strings = &data[off_dt_strings..off_dt_strings + size_dt_strings];
    let struct_block = &data[off_dt_struct..off_dt_struct + size_dt_struct];

    let mut cursor = 0usize;
    let tag = read_be32(struct_block, cursor)?;
    if tag != FDT_BEGIN_NODE {
        return Err(RawFdtError::MalformedStructure(
            "structure block does not start with FDT_BEGIN_NODE",
        ));
    }
    cursor += 4;
    let (root, next) = parse_node(struct_block, cursor, strings)?;
    cursor = next;

    while cursor + 4 <= struct_block.len() {
        let tag = read_be32(struct_block, cursor)?;
        cursor += 4;
        if tag == FDT_END {
            break;
        }
        if tag != FDT_NOP {
            return Err(RawFdtError::MalformedStructure(
                "trailing token after root node is not FDT_NOP/FDT_END",
            ));
        }
    }

    Ok(RawFdt {
        root,
        mem_reservations,
    })
}

fn parse_mem_reservations(
    data: &[u8],
    mut offset: usize,
) -> Result<Vec<MemReservation>, RawFdtError> {
    let mut out = Vec::new();
    loop {
        let address = u64::from_be_bytes(
            data.get(offset..offset + 8)
                .ok_or(RawFdtError::MalformedStructure("mem_rsvmap read past end"))?
                .try_into()
                .unwrap(),
        );
        let size = u64::from_be_bytes(
            data.get(offset + 8..offset + 16)
                .ok_or(RawFdtError::MalformedStructure("mem_rsvmap read past end"))?
                .try_into()
                .unwrap(),
        );
        offset += 16;
        if address == 0 && size == 0 {
            break;
        }
        out.push(MemReservation { address, size });
    }
    Ok(out)
}

/// Parses one node starting just after its `FDT_BEGIN_NODE` token, returning
/// the node and the offset just past its matching `FDT_END_NODE`.
fn parse_node(
    block: &[u8],
    mut offset: usize,
    strings: &[u8],
) -> Result<(RawNode, usize), RawFdtError> {
    let name_start = offset;
    let name_end = block[offset..]
        .iter()
        .position(|&b| b == 0)
        .ok_or(RawFdtError::MalformedStructure("unterminated node name"))?
        + offset;
    let name = std::str::from_utf8(&block[name_start..name_end])
        .map_err(|_| RawFdtError::MalformedStructure("node name is not valid UTF-8"))?
        .to_string();
    offset = align4(name_end + 1);

    let mut node = RawNode {
        name,
        ..RawNode::default()
    };

    loop {
        let tag = read_be32(block, offset)?;
        offset += 4;
        match tag {
            FDT_NOP => {}
            FDT_PROP => {
                let len = read_be32(block, offset)? as usize;
                offset += 4;
                let nameoff = read_be32(block, offset)? as usize;
                offset += 4;
                let value = block
                    .get(offset..offset + len)
                    .ok_or(RawFdtError::MalformedStructure("property value past end"))?
                    .to_vec();
                offset = align4(offset + len);
                let prop_name = str_from_strings(strings, nameoff)?;
                node.properties.insert(prop_name, value);
            }
            FDT_BEGIN_NODE => {
                let (child, next) = parse_node(block, offset, strings)?;
                node.children.push(child);
                offset = next;
            }
            FDT_END_NODE => return Ok((node, offset)),
            _ => {
                return Err(RawFdtError::MalformedStructure(
                    "unexpected token in structure block",
                ));
            }
        }
    }
}

fn str_from_strings(strings: &[u8], offset: usize) -> Result<String, RawFdtError> {
    let bytes = strings
        .get(offset..)
        .ok_or(RawFdtError::MalformedStructure("string offset past end"))?;
    let end = bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or(RawFdtError::MalformedStructure("unterminated string"))?;
    std::str::from_utf8(&bytes[..end])
        .map(std::string::ToString::to_string)
        .map_err(|_| RawFdtError::MalformedStructure("string table entry is not valid UTF-8"))
}

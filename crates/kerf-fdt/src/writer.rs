//! Byte-buffer FDT writer. Builds the structure and strings blocks directly
//! as `Vec<u8>` (no intermediate tree), mirroring how the reference
//! generator emits fragments: begin a node, push properties in the order
//! they're added, recurse into children, end the node.

const FDT_MAGIC: u32 = 0xd00d_feed;
const FDT_BEGIN_NODE: u32 = 1;
const FDT_END_NODE: u32 = 2;
const FDT_PROP: u32 = 3;
const FDT_END: u32 = 9;
const FDT_VERSION: u32 = 17;
const FDT_LAST_COMP_VERSION: u32 = 16;

/// Incrementally builds one FDT node's structure-block bytes and
/// contributes entries to a shared strings block.
pub struct NodeBuilder<'a> {
    struct_block: &'a mut Vec<u8>,
    strings: &'a mut StringsBuilder,
}

/// Deduplicating strings-block builder: the reference generator doesn't
/// bother deduplicating identical property names, but doing so keeps
/// emitted blobs smaller and is just as simple to decode.
#[derive(Default)]
pub struct StringsBuilder {
    data: Vec<u8>,
    offsets: std::collections::HashMap<String, u32>,
}

impl StringsBuilder {
    fn offset_for(&mut self, name: &str) -> u32 {
        if let Some(&off) = self.offsets.get(name) {
            return off;
        }
        let off = self.data.len() as u32;
        self.data.extend_from_slice(name.as_bytes());
        self.data.push(0);
        self.offsets.insert(name.to_string(), off);
        off
    }
}

fn pad4(buf: &mut Vec<u8>) {
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

impl<'a> NodeBuilder<'a> {
    fn begin(struct_block: &'a mut Vec<u8>, strings: &'a mut StringsBuilder, name: &str) -> Self {
        struct_block.extend_from_slice(&FDT_BEGIN_NODE.to_be_bytes());
        struct_block.extend_from_slice(name.as_bytes());
        struct_block.push(0);
        pad4(struct_block);
        Self {
            struct_block,
            strings,
        }
    }

    /// Appends a raw-bytes property.
    pub fn prop(&mut self, name: &str, value: &[u8]) {
        let nameoff = self.strings.offset_for(name);
        self.struct_block
            .extend_from_slice(&FDT_PROP.to_be_bytes());
        self.struct_block
            .extend_from_slice(&(value.len() as u32).to_be_bytes());
        self.struct_block.extend_from_slice(&nameoff.to_be_bytes());
        self.struct_block.extend_from_slice(value);
        pad4(self.struct_block);
    }

    /// Appends a `u32` property.
    pub fn prop_u32(&mut self, name: &str, value: u32) {
        self.prop(name, &value.to_be_bytes());
    }

    /// Appends a `u64` property.
    pub fn prop_u64(&mut self, name: &str, value: u64) {
        self.prop(name, &value.to_be_bytes());
    }

    /// Appends a big-endian `u32`-array property.
    pub fn prop_u32_list(&mut self, name: &str, values: &[u32]) {
        let mut bytes = Vec::with_capacity(values.len() * 4);
        for v in values {
            bytes.extend_from_slice(&v.to_be_bytes());
        }
        self.prop(name, &bytes);
    }

    /// Appends a NUL-terminated string property.
    pub fn prop_str(&mut self, name: &str, value: &str) {
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        self.prop(name, &bytes);
    }

    /// Appends a space-separated string-list property, matching the
    /// reference generator's join style (not a NUL-separated stringlist).
    pub fn prop_str_list(&mut self, name: &str, values: &[String]) {
        let joined = values.join(" ");
        self.prop_str(name, &joined);
    }

    /// Appends a valueless marker property.
    pub fn prop_flag(&mut self, name: &str) {
        self.prop(name, &[]);
    }

    /// Begins a child node, runs `body` against it, then closes it.
    pub fn child(&mut self, name: &str, body: impl FnOnce(&mut NodeBuilder)) {
        let mut node = NodeBuilder::begin(self.struct_block, self.strings, name);
        body(&mut node);
        node.struct_block
            .extend_from_slice(&FDT_END_NODE.to_be_bytes());
    }
}

/// Builds a complete DTB blob with an empty-named root node.
///
/// `body` receives a [`NodeBuilder`] for the root node; memory reservations
/// are always emitted as the single zero terminator, matching every dialect
/// this crate produces (baseline, overlay, and state blobs never carry real
/// reservations; the reservation block exists purely for on-disk format
/// compatibility with `dtc`-family tooling).
#[must_use]
pub fn build(body: impl FnOnce(&mut NodeBuilder)) -> Vec<u8> {
    let mut struct_block = Vec::new();
    let mut strings = StringsBuilder::default();
    {
        let mut root = NodeBuilder::begin(&mut struct_block, &mut strings, "");
        body(&mut root);
        root.struct_block
            .extend_from_slice(&FDT_END_NODE.to_be_bytes());
    }
    struct_block.extend_from_slice(&FDT_END.to_be_bytes());

    let header_size = 40usize;
    let mem_rsv_size = 16usize;
    let off_mem_rsvmap = header_size;
    let off_dt_struct = off_mem_rsvmap + mem_rsv_size;
    let off_dt_strings = off_dt_struct + struct_block.len();
    let totalsize = off_dt_strings + strings.data.len();

    let mut out = Vec::with_capacity(totalsize);
    out.extend_from_slice(&FDT_MAGIC.to_be_bytes());
    out.extend_from_slice(&(totalsize as u32).to_be_bytes());
    out.extend_from_slice(&(off_dt_struct as u32).to_be_bytes());
    out.extend_from_slice(&(off_dt_strings as u32).to_be_bytes());
    out.extend_from_slice(&(off_mem_rsvmap as u32).to_be_bytes());
    out.extend_from_slice(&FDT_VERSION.to_be_bytes());
    out.extend_from_slice(&FDT_LAST_COMP_VERSION.to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes()); // boot_cpuid_phys
    out.extend_from_slice(&(strings.data.len() as u32).to_be_bytes());
    out.extend_from_slice(&(struct_block.len() as u32).to_be_bytes());
    debug_assert_eq!(out.len(), 40);
    out.extend_from_slice(&[0u8; 16]);
    out.extend_from_slice(&struct_block);
    out.extend_from_slice(&strings.data);
    out
}

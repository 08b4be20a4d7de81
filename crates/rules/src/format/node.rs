//! Bounds-checked views over a packed rule blob.
//!
//! Every node reference is a byte offset from the start of the blob. Views
//! borrow the blob and are only constructed after the offset, name and
//! optional hash have been checked against its length.

use super::error::FormatError;
use super::features::Features;

/// `next_level`, `next_file`, `feature_type` (u32 each) and `size` (u16).
pub const NODE_HEADER_SIZE: usize = 14;

/// SHA-256 digest stored after the name of integrity-checked nodes.
pub const INTEGRITY_HASH_LEN: usize = 32;

/// Name of the sentinel node at offset 0.
pub const RULES_TAG: &[u8] = b"DEFEX_RULES_FILE";

/// `next_level` of a well-formed sentinel: the first child follows it directly.
pub const ROOT_NEXT_LEVEL: u32 = (NODE_HEADER_SIZE + RULES_TAG.len()) as u32;

const NEXT_LEVEL_AT: usize = 0;
const NEXT_FILE_AT: usize = 4;
const FEATURES_AT: usize = 8;
const SIZE_AT: usize = 12;

pub(crate) const NEXT_LEVEL_FIELD: usize = NEXT_LEVEL_AT;
pub(crate) const NEXT_FILE_FIELD: usize = NEXT_FILE_AT;

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    let mut bytes = [0u8; 2];
    bytes.copy_from_slice(&buf[at..at + 2]);
    u16::from_le_bytes(bytes)
}

/// One entry in the packed tree.
#[derive(Debug, Clone, Copy)]
pub struct RuleNode<'a> {
    offset: u32,
    next_level: u32,
    next_file: u32,
    features: Features,
    name: &'a [u8],
    integrity_hash: Option<&'a [u8; INTEGRITY_HASH_LEN]>,
}

impl<'a> RuleNode<'a> {
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Offset of the first child, 0 when the node has none.
    pub fn next_level(&self) -> u32 {
        self.next_level
    }

    /// Offset of the next sibling, 0 for the last one.
    pub fn next_file(&self) -> u32 {
        self.next_file
    }

    pub fn features(&self) -> Features {
        self.features
    }

    pub fn name(&self) -> &'a [u8] {
        self.name
    }

    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(self.name).into_owned()
    }

    /// Stored digest, present only when `INTEGRITY_CHECK` is set.
    pub fn integrity_hash(&self) -> Option<&'a [u8; INTEGRITY_HASH_LEN]> {
        self.integrity_hash
    }
}

/// Decode the node at `offset`.
pub fn node_at(buf: &[u8], offset: u32) -> Result<RuleNode<'_>, FormatError> {
    let out_of_bounds = || FormatError::OutOfBounds { offset, len: buf.len() };
    let start = offset as usize;
    let header_end = start.checked_add(NODE_HEADER_SIZE).ok_or_else(out_of_bounds)?;
    if header_end > buf.len() {
        return Err(out_of_bounds());
    }

    let features = Features::from_bits_retain(read_u32(buf, start + FEATURES_AT));
    let size = read_u16(buf, start + SIZE_AT) as usize;
    let name_end = header_end + size;
    if name_end > buf.len() {
        return Err(out_of_bounds());
    }

    let integrity_hash = if features.contains(Features::INTEGRITY_CHECK) {
        let hash_end = name_end + INTEGRITY_HASH_LEN;
        let hash = buf
            .get(name_end..hash_end)
            .and_then(|s| <&[u8; INTEGRITY_HASH_LEN]>::try_from(s).ok())
            .ok_or_else(out_of_bounds)?;
        Some(hash)
    } else {
        None
    };

    Ok(RuleNode {
        offset,
        next_level: read_u32(buf, start + NEXT_LEVEL_AT),
        next_file: read_u32(buf, start + NEXT_FILE_AT),
        features,
        name: &buf[header_end..name_end],
        integrity_hash,
    })
}

/// Decode the node a link points to, refusing links that do not move forward.
fn linked_node(buf: &[u8], from: u32, to: u32) -> Result<RuleNode<'_>, FormatError> {
    if to <= from {
        return Err(FormatError::BackwardLink { from, to });
    }
    node_at(buf, to)
}

/// Total blob length declared by the sentinel, without validating the rest.
pub fn declared_data_size(buf: &[u8]) -> Option<usize> {
    buf.get(NEXT_FILE_AT..NEXT_FILE_AT + 4)
        .map(|_| read_u32(buf, NEXT_FILE_AT) as usize)
}

/// A decoded rule blob, anchored at its sentinel.
#[derive(Debug, Clone, Copy)]
pub struct RuleTree<'a> {
    buf: &'a [u8],
    sentinel: RuleNode<'a>,
}

/// Decode the sentinel at offset 0. The returned tree is restricted to the
/// `data_size` bytes the sentinel declares.
pub fn root(buf: &[u8]) -> Result<RuleTree<'_>, FormatError> {
    let sentinel = node_at(buf, 0)?;
    let data_size = sentinel.next_file as usize;
    if data_size > buf.len() || data_size < NODE_HEADER_SIZE {
        return Err(FormatError::OutOfBounds { offset: 0, len: buf.len() });
    }
    let buf = &buf[..data_size];
    // Re-decode so the sentinel's name is known to fit the restricted range.
    let sentinel = node_at(buf, 0)?;
    Ok(RuleTree { buf, sentinel })
}

impl<'a> RuleTree<'a> {
    pub fn sentinel(&self) -> RuleNode<'a> {
        self.sentinel
    }

    /// Declared total length; also the length of [`bytes`](Self::bytes).
    pub fn data_size(&self) -> usize {
        self.buf.len()
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.buf
    }

    pub fn has_valid_tag(&self) -> bool {
        self.sentinel.name == RULES_TAG
    }

    /// The sentinel's child link must equal its own encoded length.
    pub fn has_valid_geometry(&self) -> bool {
        self.sentinel.next_level as usize == NODE_HEADER_SIZE + self.sentinel.name.len()
    }

    pub fn node(&self, offset: u32) -> Result<RuleNode<'a>, FormatError> {
        node_at(self.buf, offset)
    }

    /// Entries of the root directory.
    pub fn root_entries(&self) -> Siblings<'a> {
        let first = self.sentinel.next_level;
        if first as usize >= self.buf.len() {
            return Siblings::empty(self.buf);
        }
        Siblings::new(self.buf, 0, first)
    }

    /// Entries of the directory `parent`.
    pub fn children(&self, parent: &RuleNode<'a>) -> Siblings<'a> {
        Siblings::new(self.buf, parent.offset, parent.next_level)
    }

    /// Every node in depth-first order with its full path.
    pub fn entries(&self) -> Result<Vec<TreeEntry>, FormatError> {
        let mut out = Vec::new();
        let mut stack: Vec<(String, Siblings<'a>)> = vec![(String::new(), self.root_entries())];

        while let Some((prefix, mut siblings)) = stack.pop() {
            let Some(node) = siblings.next() else {
                continue;
            };
            let node = node?;
            let path = format!("{}/{}", prefix, node.name_lossy());
            out.push(TreeEntry {
                path: path.clone(),
                offset: node.offset,
                features: node.features,
                integrity_hash: node.integrity_hash.copied(),
            });
            stack.push((prefix, siblings));
            stack.push((path, self.children(&node)));
        }

        Ok(out)
    }
}

/// A flattened node, as produced by [`RuleTree::entries`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub path: String,
    pub offset: u32,
    pub features: Features,
    pub integrity_hash: Option<[u8; INTEGRITY_HASH_LEN]>,
}

/// Iterator over a directory's `next_file` chain.
///
/// Yields an error and then stops if a link is malformed.
#[derive(Debug, Clone)]
pub struct Siblings<'a> {
    buf: &'a [u8],
    from: u32,
    next: u32,
}

impl<'a> Siblings<'a> {
    fn new(buf: &'a [u8], from: u32, next: u32) -> Self {
        Self { buf, from, next }
    }

    fn empty(buf: &'a [u8]) -> Self {
        Self { buf, from: 0, next: 0 }
    }
}

impl<'a> Iterator for Siblings<'a> {
    type Item = Result<RuleNode<'a>, FormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == 0 {
            return None;
        }
        match linked_node(self.buf, self.from, self.next) {
            Ok(node) => {
                self.from = node.offset;
                self.next = node.next_file;
                Some(Ok(node))
            }
            Err(e) => {
                self.next = 0;
                Some(Err(e))
            }
        }
    }
}

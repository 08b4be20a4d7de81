//! Rule set compiler: turns `(path, features, hash)` entries into a blob.

use super::error::FormatError;
use super::features::Features;
use super::node::{INTEGRITY_HASH_LEN, NEXT_FILE_FIELD, NEXT_LEVEL_FIELD, ROOT_NEXT_LEVEL, RULES_TAG};

/// One rule as written in rule source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleEntry {
    pub path: String,
    pub features: Features,
    pub hash: Option<[u8; INTEGRITY_HASH_LEN]>,
}

impl RuleEntry {
    pub fn new(path: impl Into<String>, features: Features) -> Self {
        Self {
            path: path.into(),
            features,
            hash: None,
        }
    }

    pub fn with_hash(mut self, hash: [u8; INTEGRITY_HASH_LEN]) -> Self {
        self.hash = Some(hash);
        self
    }
}

#[derive(Debug, Default)]
struct BuildNode {
    name: Vec<u8>,
    features: Features,
    hash: Option<[u8; INTEGRITY_HASH_LEN]>,
    children: Vec<BuildNode>,
}

impl BuildNode {
    fn new(name: &str) -> Self {
        Self {
            name: name.as_bytes().to_vec(),
            ..Self::default()
        }
    }
}

/// Accumulates rules and emits the packed tree.
///
/// Directories on the way to a rule are created with no features. Two rules
/// for the same path merge their bits unless their recovery bits differ, in
/// which case they become separate same-named siblings.
#[derive(Debug, Default)]
pub struct RuleSetBuilder {
    root: Vec<BuildNode>,
    rules: usize,
}

impl RuleSetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rules added so far.
    pub fn len(&self) -> usize {
        self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules == 0
    }

    pub fn add_entry(&mut self, entry: &RuleEntry) -> Result<&mut Self, FormatError> {
        self.add(&entry.path, entry.features, entry.hash)
    }

    pub fn add(
        &mut self,
        path: &str,
        features: Features,
        hash: Option<[u8; INTEGRITY_HASH_LEN]>,
    ) -> Result<&mut Self, FormatError> {
        let components = split_rule_path(path)?;
        let Some((leaf, dirs)) = components.split_last() else {
            return Err(FormatError::InvalidPath(path.to_string()));
        };

        let mut level = &mut self.root;
        for dir in dirs {
            let idx = match level.iter().position(|n| n.name == dir.as_bytes()) {
                Some(idx) => idx,
                None => {
                    level.push(BuildNode::new(dir));
                    level.len() - 1
                }
            };
            level = &mut level[idx].children;
        }

        let mut features = features;
        if hash.is_some() {
            features |= Features::INTEGRITY_CHECK;
        }
        let recovery = features.for_recovery();
        let idx = match level
            .iter()
            .position(|n| n.name == leaf.as_bytes() && n.features.for_recovery() == recovery)
        {
            Some(idx) => idx,
            None => {
                level.push(BuildNode::new(leaf));
                level.len() - 1
            }
        };
        let node = &mut level[idx];
        node.features |= features;
        if hash.is_some() {
            node.hash = hash;
        }

        self.rules += 1;
        Ok(self)
    }

    /// Emit the blob: sentinel first, then every directory's entries
    /// contiguously, each directory before its subdirectories' contents.
    pub fn build(&self) -> Result<Vec<u8>, FormatError> {
        let mut out = Vec::new();
        write_node(&mut out, RULES_TAG, Features::empty(), None)?;
        patch_u32(&mut out, NEXT_LEVEL_FIELD, ROOT_NEXT_LEVEL);

        emit_level(&mut out, &self.root)?;

        let data_size = u32::try_from(out.len())
            .map_err(|_| FormatError::TooLarge(format!("{} bytes", out.len())))?;
        patch_u32(&mut out, NEXT_FILE_FIELD, data_size);
        Ok(out)
    }
}

/// Split an absolute rule path into components, rejecting empty ones.
fn split_rule_path(path: &str) -> Result<Vec<&str>, FormatError> {
    let rest = path
        .strip_prefix('/')
        .ok_or_else(|| FormatError::InvalidPath(path.to_string()))?;
    let components: Vec<&str> = rest.split('/').collect();
    if components.iter().any(|c| c.is_empty()) {
        return Err(FormatError::InvalidPath(path.to_string()));
    }
    Ok(components)
}

/// Write one directory's entries, link them, then recurse. Returns the
/// offset of the first entry, or 0 for an empty directory.
fn emit_level(out: &mut Vec<u8>, nodes: &[BuildNode]) -> Result<u32, FormatError> {
    if nodes.is_empty() {
        return Ok(0);
    }

    let mut offsets = Vec::with_capacity(nodes.len());
    for node in nodes {
        let hash = node
            .features
            .contains(Features::INTEGRITY_CHECK)
            .then(|| node.hash.unwrap_or([0u8; INTEGRITY_HASH_LEN]));
        offsets.push(write_node(out, &node.name, node.features, hash)?);
    }
    for pair in offsets.windows(2) {
        patch_u32(out, pair[0] as usize + NEXT_FILE_FIELD, pair[1]);
    }
    for (node, offset) in nodes.iter().zip(&offsets) {
        let child = emit_level(out, &node.children)?;
        patch_u32(out, *offset as usize + NEXT_LEVEL_FIELD, child);
    }

    Ok(offsets[0])
}

fn write_node(
    out: &mut Vec<u8>,
    name: &[u8],
    features: Features,
    hash: Option<[u8; INTEGRITY_HASH_LEN]>,
) -> Result<u32, FormatError> {
    let offset = u32::try_from(out.len())
        .map_err(|_| FormatError::TooLarge(format!("offset {}", out.len())))?;
    let size = u16::try_from(name.len())
        .map_err(|_| FormatError::TooLarge(format!("name of {} bytes", name.len())))?;

    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&features.bits().to_le_bytes());
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(name);
    if let Some(hash) = hash {
        out.extend_from_slice(&hash);
    }
    Ok(offset)
}

fn patch_u32(out: &mut [u8], at: usize, value: u32) {
    out[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

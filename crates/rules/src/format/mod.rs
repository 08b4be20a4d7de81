//! Packed binary rule format.
//!
//! A blob is a sentinel node at offset 0 followed by a forest of nodes
//! addressed purely by byte offset. Each node is a 14-byte little-endian
//! header (`next_level`, `next_file`, `feature_type`, `size`), its name, and
//! for `INTEGRITY_CHECK` nodes a 32-byte SHA-256. The sentinel is named
//! `DEFEX_RULES_FILE`, its `next_level` points just past itself, and its
//! `next_file` slot carries the total blob length.

mod builder;
mod error;
mod features;
mod node;
mod text;


pub use self::builder::{RuleEntry, RuleSetBuilder};
pub use self::error::FormatError;
pub use self::features::{serialize_names, Features};
pub use self::node::{
    declared_data_size, node_at, root, RuleNode, RuleTree, Siblings, TreeEntry, INTEGRITY_HASH_LEN,
    NODE_HEADER_SIZE, ROOT_NEXT_LEVEL, RULES_TAG,
};
pub use self::text::{compile_rules, parse_rules, render_entry};

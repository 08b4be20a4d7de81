//! Feature bits carried in every node's `feature_type` word.

use bitflags::bitflags;
use serde::ser::SerializeSeq;
use serde::Serializer;

bitflags! {
    /// Capability and attribute bits of a rule node. The same type is used
    /// for the attribute a caller requests in a lookup.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Features: u32 {
        /// Leaf file rather than directory.
        const IS_FILE = 1 << 0;
        /// Grant only valid while booted into recovery.
        const FOR_RECOVERY = 1 << 1;
        const PED_PATH = 1 << 2;
        const PED_EXCEPTION = 1 << 3;
        const SAFEPLACE_PATH = 1 << 5;
        const IMMUTABLE_PATH_OPEN = 1 << 7;
        const IMMUTABLE_PATH_WRITE = 1 << 8;
        const IMMUTABLE_SRC_EXCEPTION = 1 << 9;
        const UMHBIN_PATH = 1 << 11;
        /// Node carries a SHA-256 of the file content after its name.
        const INTEGRITY_CHECK = 1 << 12;
        const IMMUTABLE_DST_EXCEPTION = 1 << 13;
    }
}

/// Rule-source spelling of every feature, in bit order.
const FEATURE_NAMES: &[(&str, Features)] = &[
    ("feature_is_file", Features::IS_FILE),
    ("feature_for_recovery", Features::FOR_RECOVERY),
    ("feature_ped_path", Features::PED_PATH),
    ("feature_ped_exception", Features::PED_EXCEPTION),
    ("feature_safeplace_path", Features::SAFEPLACE_PATH),
    ("feature_immutable_path_open", Features::IMMUTABLE_PATH_OPEN),
    ("feature_immutable_path_write", Features::IMMUTABLE_PATH_WRITE),
    ("feature_immutable_src_exception", Features::IMMUTABLE_SRC_EXCEPTION),
    ("feature_umhbin_path", Features::UMHBIN_PATH),
    ("feature_integrity_check", Features::INTEGRITY_CHECK),
    ("feature_immutable_dst_exception", Features::IMMUTABLE_DST_EXCEPTION),
];

impl Features {
    /// Parse a single `feature_*` name. The `feature_` prefix is optional.
    pub fn from_rule_name(name: &str) -> Option<Self> {
        let name = name.trim();
        FEATURE_NAMES
            .iter()
            .find(|(n, _)| *n == name || n.strip_prefix("feature_") == Some(name))
            .map(|(_, f)| *f)
    }

    /// Parse a `|`-separated list such as `feature_is_file|feature_ped_exception`.
    pub fn parse_list(list: &str) -> Option<Self> {
        list.split('|')
            .try_fold(Features::empty(), |acc, name| Self::from_rule_name(name).map(|f| acc | f))
    }

    /// Names of the known bits that are set.
    pub fn names(self) -> Vec<&'static str> {
        FEATURE_NAMES
            .iter()
            .filter(|(_, f)| self.contains(*f))
            .map(|(n, _)| *n)
            .collect()
    }

    /// Requested attribute bits with the recovery bit masked off.
    pub fn attribute_bits(self) -> Self {
        self - Features::FOR_RECOVERY
    }

    /// Whether this node's bits cover every requested attribute bit.
    /// The recovery bit takes no part, and an empty request matches nothing.
    pub fn satisfies(self, requested: Features) -> bool {
        let wanted = requested.attribute_bits();
        !wanted.is_empty() && self.contains(wanted)
    }

    pub fn for_recovery(self) -> bool {
        self.contains(Features::FOR_RECOVERY)
    }

    pub fn is_file(self) -> bool {
        self.contains(Features::IS_FILE)
    }
}

/// Serialize a feature word as its list of names.
pub fn serialize_names<S: Serializer>(features: &Features, serializer: S) -> Result<S::Ok, S::Error> {
    let names = features.names();
    let mut seq = serializer.serialize_seq(Some(names.len()))?;
    for name in names {
        seq.serialize_element(name)?;
    }
    seq.end()
}

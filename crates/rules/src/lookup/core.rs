//! Tree walk and slot selection.

use std::io::Read;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use defex_core::BootState;

use crate::format::{serialize_names, Features, FormatError, RuleNode, RuleTree};
use crate::integrity;
use crate::store::{RuleStore, Slot, StoreSnapshot};

use super::path;

/// Attributes granted while no rule set is loaded and late loading has not
/// timed out yet.
pub const DEFAULT_ALLOW: Features = Features::PED_EXCEPTION
    .union(Features::SAFEPLACE_PATH)
    .union(Features::IMMUTABLE_SRC_EXCEPTION)
    .union(Features::IMMUTABLE_DST_EXCEPTION);

/// Wider allow-list used while booted into recovery.
pub const RECOVERY_DEFAULT_ALLOW: Features = DEFAULT_ALLOW
    .union(Features::UMHBIN_PATH)
    .union(Features::IMMUTABLE_PATH_OPEN);

/// The node that granted a lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleMatch {
    pub slot: Slot,
    pub offset: u32,
    pub name: String,
    #[serde(serialize_with = "serialize_names")]
    pub features: Features,
}

impl RuleMatch {
    fn from_node(slot: Slot, node: &RuleNode<'_>) -> Self {
        Self {
            slot,
            offset: node.offset(),
            name: node.name_lossy(),
            features: node.features(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult {
    /// A node along the path grants the attribute.
    Matched(RuleMatch),
    /// Nothing is loaded yet and the attribute is on the boot-time allow-list.
    DefaultAllow,
    NoMatch,
    /// The granting node's stored hash does not match the file content.
    IntegrityFailed(RuleMatch),
}

/// Starts late loading when a lookup finds the store empty.
pub trait LoadTrigger: Send + Sync {
    /// Must be idempotent; called on every lookup against an empty store.
    fn trigger(&self);
}

/// Whether `attribute` is allowed by default on an empty store.
pub fn default_allowed(attribute: Features, recovery: bool) -> bool {
    let wanted = attribute.attribute_bits();
    let allow = if recovery { RECOVERY_DEFAULT_ALLOW } else { DEFAULT_ALLOW };
    !wanted.is_empty() && allow.contains(wanted)
}

/// Slots to walk, in order. The first is primary when `system_first` and the
/// system-path predicate differ, secondary otherwise. Empty slots are left
/// out, so the second entry only exists when both are loaded.
pub fn slot_order(snapshot: &StoreSnapshot, system_path: bool) -> Vec<Slot> {
    let first = if snapshot.system_first ^ system_path {
        Slot::Primary
    } else {
        Slot::Secondary
    };
    [first, first.other()]
        .into_iter()
        .filter(|slot| snapshot.slot(*slot).is_loaded())
        .collect()
}

/// Look `path` up in a captured store snapshot.
///
/// `path` is used as given; `/system_root` normalization is the caller's
/// job. When `file` is supplied, integrity-checked matches hash it.
pub fn lookup(
    snapshot: &StoreSnapshot,
    path: &str,
    attribute: Features,
    recovery: bool,
    file: Option<&mut dyn Read>,
) -> LookupResult {
    let Some(components) = path::components(path) else {
        return LookupResult::NoMatch;
    };

    if !snapshot.any_loaded() {
        if !snapshot.load_state.timed_out() && default_allowed(attribute, recovery) {
            return LookupResult::DefaultAllow;
        }
        return LookupResult::NoMatch;
    }

    for slot in slot_order(snapshot, path::is_system_path(path)) {
        let walked = snapshot
            .slot(slot)
            .tree()
            .and_then(|tree| walk(&tree, &components, attribute, recovery));
        match walked {
            Ok(Some(node)) => return finish(slot, &node, file),
            Ok(None) => debug!(path, ?slot, "no terminal match in slot"),
            Err(e) => warn!(path, ?slot, error = %e, "malformed rule tree, trying the other slot"),
        }
    }

    LookupResult::NoMatch
}

fn finish(slot: Slot, node: &RuleNode<'_>, file: Option<&mut dyn Read>) -> LookupResult {
    let rule = RuleMatch::from_node(slot, node);
    if let (Some(expected), Some(file)) = (node.integrity_hash(), file) {
        if !integrity::verify(file, expected) {
            warn!(name = %rule.name, ?slot, "integrity check failed");
            return LookupResult::IntegrityFailed(rule);
        }
    }
    LookupResult::Matched(rule)
}

/// Whether `node` grants `attribute` in the current boot mode. Recovery-only
/// nodes grant nothing outside recovery.
fn grants(node: &RuleNode<'_>, attribute: Features, recovery: bool) -> bool {
    let features = node.features();
    features.satisfies(attribute) && (recovery || !features.for_recovery())
}

/// Walk one tree. `Ok(None)` means no node along the path grants the request.
fn walk<'a>(
    tree: &RuleTree<'a>,
    components: &[&str],
    attribute: Features,
    recovery: bool,
) -> Result<Option<RuleNode<'a>>, FormatError> {
    let mut entries = tree.root_entries();
    let last = components.len() - 1;

    for (depth, component) in components.iter().enumerate() {
        let Some(node) = select(entries, component.as_bytes(), attribute, recovery)? else {
            return Ok(None);
        };
        if grants(&node, attribute, recovery) {
            return Ok(Some(node));
        }
        if depth == last || node.next_level() == 0 {
            return Ok(None);
        }
        entries = tree.children(&node);
    }

    Ok(None)
}

/// Pick among same-named siblings: a node matching both the attribute and
/// the boot mode wins outright, then an attribute-only match, then a
/// recovery-only match, then the first name match.
fn select<'a>(
    entries: impl Iterator<Item = Result<RuleNode<'a>, FormatError>>,
    name: &[u8],
    attribute: Features,
    recovery: bool,
) -> Result<Option<RuleNode<'a>>, FormatError> {
    let mut by_attribute = None;
    let mut by_recovery = None;
    let mut by_name = None;

    for node in entries {
        let node = node?;
        if node.name() != name {
            continue;
        }
        let attribute_ok = node.features().satisfies(attribute);
        let recovery_ok = node.features().for_recovery() == recovery;
        if attribute_ok && recovery_ok {
            return Ok(Some(node));
        }
        if attribute_ok && by_attribute.is_none() {
            by_attribute = Some(node);
        }
        if recovery_ok && by_recovery.is_none() {
            by_recovery = Some(node);
        }
        if by_name.is_none() {
            by_name = Some(node);
        }
    }

    Ok(by_attribute.or(by_recovery).or(by_name))
}

/// Lookup bound to a live store and boot state.
pub struct RuleLookup {
    store: Arc<RuleStore>,
    boot: Arc<dyn BootState>,
    trigger: Option<Arc<dyn LoadTrigger>>,
}

impl RuleLookup {
    pub fn new(store: Arc<RuleStore>, boot: Arc<dyn BootState>) -> Self {
        Self {
            store,
            boot,
            trigger: None,
        }
    }

    /// Kick `trigger` whenever a lookup finds nothing loaded.
    pub fn with_trigger(mut self, trigger: Arc<dyn LoadTrigger>) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn lookup(&self, path: &str, attribute: Features, file: Option<&mut dyn Read>) -> LookupResult {
        let path = path::normalize(path, self.boot.system_root_mounted());
        let snapshot = self.store.snapshot();

        if !snapshot.any_loaded() && !snapshot.load_state.timed_out() {
            if let Some(trigger) = &self.trigger {
                trigger.trigger();
            }
        }

        lookup(&snapshot, path, attribute, self.boot.is_recovery(), file)
    }
}

//! Shared, versioned rule storage.
//!
//! [`RuleStore`] holds the primary and secondary trees together with
//! `load_state` and `system_first` behind a single lock. Trees are immutable
//! `Arc<[u8]>` snapshots: installing a rule set swaps the whole snapshot, so
//! a lookup that captured the previous one keeps walking valid bytes.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::Serialize;

use defex_core::RuleClass;

use crate::format::{self, FormatError, RuleTree};
use crate::loader::LoadError;

/// Highest number of candidate sources tracked in `load_state`.
pub const MAX_SOURCES: usize = 16;

const SOURCE_SHIFT: u32 = 8;

bitflags! {
    /// Load progress. Bits are only ever added.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LoadState: u32 {
        /// A general-class rule file is installed.
        const GENERAL = 1 << 0;
        /// A system-class rule file is installed.
        const SYSTEM = 1 << 1;
        /// Late loading gave up; never cleared.
        const TIMEOUT = 1 << 2;
        /// Primary holds the blob shipped with the binary.
        const BUILTIN = 1 << 3;
        /// Per-source "consumed" bits, one per candidate index.
        const SOURCES = 0xFFFF << SOURCE_SHIFT;
    }
}

impl LoadState {
    /// Consumed bit for the candidate at `index`.
    pub fn source(index: usize) -> Self {
        debug_assert!(index < MAX_SOURCES);
        Self::from_bits_retain(1 << (SOURCE_SHIFT as usize + index))
    }

    /// Installed bit for a policy class.
    pub fn class(class: RuleClass) -> Self {
        match class {
            RuleClass::General => Self::GENERAL,
            RuleClass::System => Self::SYSTEM,
        }
    }

    pub fn timed_out(self) -> bool {
        self.contains(Self::TIMEOUT)
    }

    /// Human-readable bit names, sources as `source[n]`.
    pub fn names(self) -> Vec<String> {
        let mut names: Vec<String> = [
            (Self::GENERAL, "general"),
            (Self::SYSTEM, "system"),
            (Self::TIMEOUT, "timeout"),
            (Self::BUILTIN, "builtin"),
        ]
        .iter()
        .filter(|(bit, _)| self.contains(*bit))
        .map(|(_, name)| name.to_string())
        .collect();
        names.extend(
            (0..MAX_SOURCES)
                .filter(|i| self.contains(Self::source(*i)))
                .map(|i| format!("source[{}]", i)),
        );
        names
    }
}

/// One of the two tree slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Slot {
    Primary,
    Secondary,
}

impl Slot {
    pub fn other(self) -> Self {
        match self {
            Slot::Primary => Slot::Secondary,
            Slot::Secondary => Slot::Primary,
        }
    }
}

/// Externally visible load progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadPhase {
    Unloaded,
    PartiallyLoaded,
    FullyLoaded,
}

/// An installed tree. Empty when nothing has been loaded into the slot.
#[derive(Debug, Clone)]
pub struct TreeSnapshot {
    data: Arc<[u8]>,
    installed_at: Option<DateTime<Utc>>,
}

impl TreeSnapshot {
    pub fn empty() -> Self {
        Self {
            data: Arc::from(Vec::new()),
            installed_at: None,
        }
    }

    fn installed(data: Arc<[u8]>) -> Self {
        Self {
            data,
            installed_at: Some(Utc::now()),
        }
    }

    /// `data_size` of the installed tree, 0 for an empty slot.
    pub fn data_size(&self) -> usize {
        self.data.len()
    }

    pub fn is_loaded(&self) -> bool {
        self.data_size() != 0
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn installed_at(&self) -> Option<DateTime<Utc>> {
        self.installed_at
    }

    pub fn tree(&self) -> Result<RuleTree<'_>, FormatError> {
        format::root(&self.data)
    }
}

/// Consistent copy of the store taken under its lock.
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    pub primary: TreeSnapshot,
    pub secondary: TreeSnapshot,
    pub load_state: LoadState,
    pub system_first: bool,
}

impl StoreSnapshot {
    pub fn slot(&self, slot: Slot) -> &TreeSnapshot {
        match slot {
            Slot::Primary => &self.primary,
            Slot::Secondary => &self.secondary,
        }
    }

    pub fn any_loaded(&self) -> bool {
        self.primary.is_loaded() || self.secondary.is_loaded()
    }

    pub fn both_loaded(&self) -> bool {
        self.primary.is_loaded() && self.secondary.is_loaded()
    }

    /// Phase relative to the set of class bits that complete loading.
    pub fn phase(&self, expected: LoadState) -> LoadPhase {
        if !self.any_loaded() {
            LoadPhase::Unloaded
        } else if self.load_state.contains(expected) {
            LoadPhase::FullyLoaded
        } else {
            LoadPhase::PartiallyLoaded
        }
    }
}

struct StoreState {
    primary: TreeSnapshot,
    secondary: TreeSnapshot,
    load_state: LoadState,
    system_first: bool,
}

/// The two rule slots and their load flags, guarded as one unit.
pub struct RuleStore {
    state: RwLock<StoreState>,
    primary_capacity: usize,
}

impl RuleStore {
    /// Create an empty store whose primary slot accepts at most
    /// `primary_capacity` bytes.
    pub fn new(primary_capacity: usize) -> Self {
        Self {
            state: RwLock::new(StoreState {
                primary: TreeSnapshot::empty(),
                secondary: TreeSnapshot::empty(),
                load_state: LoadState::empty(),
                system_first: false,
            }),
            primary_capacity,
        }
    }

    pub fn primary_capacity(&self) -> usize {
        self.primary_capacity
    }

    // Writers always leave the state consistent, so a poisoned lock is safe
    // to keep using.
    fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let state = self.read();
        StoreSnapshot {
            primary: state.primary.clone(),
            secondary: state.secondary.clone(),
            load_state: state.load_state,
            system_first: state.system_first,
        }
    }

    pub fn load_state(&self) -> LoadState {
        self.read().load_state
    }

    /// Add bits to `load_state` and return the result. Once `TIMEOUT` is set
    /// the state is frozen and this is a no-op.
    pub fn mark(&self, bits: LoadState) -> LoadState {
        let mut state = self.write();
        if !state.load_state.timed_out() {
            state.load_state |= bits;
        }
        state.load_state
    }

    /// Copy `payload` into the primary slot and record `mark`. Refused once
    /// `TIMEOUT` is set.
    pub(crate) fn install_primary(&self, payload: &[u8], mark: LoadState) -> Result<(), LoadError> {
        if payload.len() > self.primary_capacity {
            return Err(LoadError::TooLarge {
                size: payload.len(),
                capacity: self.primary_capacity,
            });
        }
        let fresh = TreeSnapshot::installed(Arc::from(payload));

        let previous = {
            let mut state = self.write();
            if state.load_state.timed_out() {
                return Err(LoadError::Frozen);
            }
            state.load_state |= mark;
            std::mem::replace(&mut state.primary, fresh)
        };
        // Released after the lock so readers never wait on the free.
        drop(previous);
        Ok(())
    }

    /// Install a freshly allocated secondary tree, record `mark` and set
    /// `system_first` when asked. Refused once `TIMEOUT` is set.
    pub(crate) fn install_secondary(
        &self,
        payload: Vec<u8>,
        mark: LoadState,
        system_first: bool,
    ) -> Result<(), LoadError> {
        let fresh = TreeSnapshot::installed(Arc::from(payload));

        let previous = {
            let mut state = self.write();
            if state.load_state.timed_out() {
                return Err(LoadError::Frozen);
            }
            state.load_state |= mark;
            state.system_first |= system_first;
            std::mem::replace(&mut state.secondary, fresh)
        };
        drop(previous);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_store_is_unloaded() {
        let store = RuleStore::new(1024);
        let snap = store.snapshot();
        assert!(!snap.any_loaded());
        assert_eq!(snap.primary.data_size(), 0);
        assert_eq!(snap.phase(LoadState::GENERAL), LoadPhase::Unloaded);
    }

    #[test]
    fn primary_install_respects_capacity() {
        let store = RuleStore::new(8);
        let err = store.install_primary(&[0u8; 9], LoadState::GENERAL).unwrap_err();
        assert!(matches!(err, LoadError::TooLarge { size: 9, capacity: 8 }));
        assert!(store.load_state().is_empty());
    }

    #[test]
    fn old_snapshot_survives_swap() {
        let store = RuleStore::new(64);
        store.install_primary(b"first", LoadState::GENERAL).unwrap();
        let before = store.snapshot();

        store.install_primary(b"second!", LoadState::GENERAL).unwrap();
        assert_eq!(before.primary.bytes(), b"first");
        assert_eq!(store.snapshot().primary.bytes(), b"second!");
    }

    #[test]
    fn secondary_install_sets_system_first() {
        let store = RuleStore::new(64);
        store.install_secondary(b"sys".to_vec(), LoadState::SYSTEM, true).unwrap();
        let snap = store.snapshot();
        assert!(snap.system_first);
        assert!(snap.secondary.is_loaded());
        assert!(snap.load_state.contains(LoadState::SYSTEM));
        assert_eq!(snap.phase(LoadState::GENERAL | LoadState::SYSTEM), LoadPhase::PartiallyLoaded);
    }

    #[test]
    fn mark_freezes_after_timeout() {
        let store = RuleStore::new(64);
        store.mark(LoadState::source(0));
        store.mark(LoadState::TIMEOUT);
        let frozen = store.mark(LoadState::GENERAL | LoadState::source(1));
        assert_eq!(frozen, LoadState::source(0) | LoadState::TIMEOUT);
    }

    #[test]
    fn installs_are_refused_after_timeout() {
        let store = RuleStore::new(64);
        store.install_primary(b"first", LoadState::BUILTIN).unwrap();
        let frozen = store.mark(LoadState::TIMEOUT);

        let err = store.install_primary(b"late", LoadState::GENERAL).unwrap_err();
        assert!(matches!(err, LoadError::Frozen));
        let err = store.install_secondary(b"late".to_vec(), LoadState::SYSTEM, true).unwrap_err();
        assert!(matches!(err, LoadError::Frozen));

        let snap = store.snapshot();
        assert_eq!(snap.load_state, frozen);
        assert_eq!(snap.primary.bytes(), b"first");
        assert!(!snap.secondary.is_loaded());
        assert!(!snap.system_first);
    }

    #[test]
    fn state_names_include_sources() {
        let state = LoadState::GENERAL | LoadState::source(2);
        assert_eq!(state.names(), vec!["general".to_string(), "source[2]".to_string()]);
    }
}

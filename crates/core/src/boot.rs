//! Boot-state oracle.
//!
//! The policy engine never probes the platform itself; it asks a [`BootState`]
//! whether the device is unlocked, booted into recovery, or has its system
//! partition mounted under `/system_root`.

use serde::{Deserialize, Serialize};

use crate::config::profiled_env_bool;

/// Source of boot-mode signals consulted on every lookup.
pub trait BootState: Send + Sync {
    /// Unlocked devices skip rule loading and enforcement entirely.
    fn is_unlocked(&self) -> bool;

    /// Recovery boots select `feature_for_recovery` nodes and widen the
    /// default allow-list.
    fn is_recovery(&self) -> bool;

    /// When set, paths under `/system_root/` are looked up without that prefix.
    fn system_root_mounted(&self) -> bool;
}

/// Fixed boot state, read once from the environment or built directly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticBootState {
    pub unlocked: bool,
    pub recovery: bool,
    pub system_root: bool,
}

impl StaticBootState {
    /// Read `DEFEX_UNLOCKED`, `DEFEX_RECOVERY` and `DEFEX_SYSTEM_ROOT`,
    /// honoring the `DEFEX_PROFILE` prefix like the rest of the config.
    pub fn from_env(profile: &str) -> Self {
        Self {
            unlocked: profiled_env_bool(profile, "DEFEX_UNLOCKED", false),
            recovery: profiled_env_bool(profile, "DEFEX_RECOVERY", false),
            system_root: profiled_env_bool(profile, "DEFEX_SYSTEM_ROOT", false),
        }
    }

    pub fn locked() -> Self {
        Self::default()
    }

    pub fn recovery() -> Self {
        Self {
            recovery: true,
            ..Self::default()
        }
    }
}

impl BootState for StaticBootState {
    fn is_unlocked(&self) -> bool {
        self.unlocked
    }

    fn is_recovery(&self) -> bool {
        self.recovery
    }

    fn system_root_mounted(&self) -> bool {
        self.system_root
    }
}

//! Path-based security policy engine.
//!
//! This crate provides:
//! - A packed, offset-linked binary rule format and a compiler for it
//! - A two-slot rule store with snapshot swaps
//! - Signed rule file loading with late retries on a background thread
//! - Path lookup with recovery-aware node selection and integrity checks

pub mod facade;
pub mod format;
pub mod integrity;
pub mod loader;
pub mod lookup;
pub mod scheduler;
pub mod store;

pub use facade::{Decision, Grant, PolicyEngine, StoreStatus};
pub use format::Features;
pub use lookup::{LookupResult, RuleMatch};
pub use store::{LoadPhase, LoadState, RuleStore, Slot};

//! Path lookup over the packed rule trees.
//!
//! A path is split on `/` and each component is searched for along the
//! current directory's sibling chain. The first node on the path whose
//! features cover the requested attribute grants it, so a directory rule
//! covers everything below it. When both slots are loaded and the first one
//! yields nothing, the other is walked once.

mod core;
pub mod path;

#[cfg(test)]
mod tests;

pub use self::core::{
    default_allowed, lookup, slot_order, LoadTrigger, LookupResult, RuleLookup, RuleMatch,
    DEFAULT_ALLOW, RECOVERY_DEFAULT_ALLOW,
};

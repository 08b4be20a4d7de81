//! [`PolicyEngine`]: the single entry point callers query.
//!
//! Wires the store, loader, late-load scheduler and lookup together, and
//! turns lookup results into allow/deny decisions. Unlocked devices are
//! granted everything without touching the store.

use std::io::Read;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use defex_core::{BootState, Config};

use crate::format::Features;
use crate::loader::{FileOpener, LoadError, RuleLoader, SignatureVerifier};
use crate::lookup::{LookupResult, RuleLookup, RuleMatch};
use crate::scheduler::{ExitReason, LateLoadScheduler};
use crate::store::{LoadPhase, RuleStore, TreeSnapshot};

/// Why access was granted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Grant {
    Rule(RuleMatch),
    /// Nothing loaded yet and the attribute is on the boot allow-list.
    DefaultAllow,
    Unlocked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "detail", rename_all = "snake_case")]
pub enum Decision {
    Denied,
    Matched(Grant),
    /// A rule matched but the file's content hash did not.
    IntegrityFailed(RuleMatch),
}

impl Decision {
    pub fn is_granted(&self) -> bool {
        matches!(self, Decision::Matched(_))
    }
}

impl From<LookupResult> for Decision {
    fn from(result: LookupResult) -> Self {
        match result {
            LookupResult::Matched(rule) => Decision::Matched(Grant::Rule(rule)),
            LookupResult::DefaultAllow => Decision::Matched(Grant::DefaultAllow),
            LookupResult::NoMatch => Decision::Denied,
            LookupResult::IntegrityFailed(rule) => Decision::IntegrityFailed(rule),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotStatus {
    pub data_size: usize,
    pub installed_at: Option<DateTime<Utc>>,
}

impl From<&TreeSnapshot> for SlotStatus {
    fn from(tree: &TreeSnapshot) -> Self {
        Self {
            data_size: tree.data_size(),
            installed_at: tree.installed_at(),
        }
    }
}

/// Point-in-time view of the engine for status output.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub phase: LoadPhase,
    pub timed_out: bool,
    pub unlocked: bool,
    pub load_state: Vec<String>,
    pub system_first: bool,
    pub primary: SlotStatus,
    pub secondary: SlotStatus,
    pub late_load_running: bool,
}

pub struct PolicyEngine {
    store: Arc<RuleStore>,
    boot: Arc<dyn BootState>,
    lookup: RuleLookup,
    scheduler: Arc<LateLoadScheduler>,
}

impl PolicyEngine {
    /// Build the engine and bring up its rules.
    ///
    /// Installs the builtin blob and the boot rule file when configured; a
    /// failure in either is returned. Late loading then starts for whatever
    /// is still missing. On an unlocked device nothing is loaded.
    pub fn boot(
        config: &Config,
        boot: Arc<dyn BootState>,
        verifier: Arc<dyn SignatureVerifier>,
        opener: Arc<dyn FileOpener>,
    ) -> Result<Self, LoadError> {
        let store = Arc::new(RuleStore::new(config.store.primary_capacity));
        let loader = || {
            RuleLoader::new(store.clone(), verifier.clone(), opener.clone())
                .with_split_system_rules(config.sources.split_system_rules)
        };

        let scheduler = Arc::new(LateLoadScheduler::new(
            loader(),
            config.sources.candidates.clone(),
            config.late_load,
        ));
        let lookup = RuleLookup::new(store.clone(), boot.clone()).with_trigger(scheduler.clone());
        let engine = Self {
            store: store.clone(),
            boot,
            lookup,
            scheduler,
        };

        if engine.boot.is_unlocked() {
            info!("device unlocked, rule enforcement disabled");
            return Ok(engine);
        }

        let boot_loader = loader();
        if let Some(path) = &config.store.builtin_rules {
            let blob = boot_loader.read_file(path)?;
            boot_loader.install_builtin(&blob)?;
        }
        if let Some(path) = &config.store.boot_rules {
            boot_loader.boot_load(path)?;
        }

        engine.scheduler.start();
        Ok(engine)
    }

    /// Decide whether `path` may use `attribute`.
    ///
    /// When `file` is given and the granting rule carries a content hash, the
    /// file is hashed and must match.
    pub fn rules_lookup(&self, path: &str, attribute: Features, file: Option<&mut dyn Read>) -> Decision {
        if self.boot.is_unlocked() {
            return Decision::Matched(Grant::Unlocked);
        }
        let decision = Decision::from(self.lookup.lookup(path, attribute, file));
        if let Decision::IntegrityFailed(rule) = &decision {
            warn!(path, rule = %rule.name, "integrity mismatch, access denied");
        }
        decision
    }

    pub fn phase(&self) -> LoadPhase {
        self.store.snapshot().phase(self.scheduler.expected())
    }

    pub fn timed_out(&self) -> bool {
        self.store.load_state().timed_out()
    }

    pub fn status(&self) -> StoreStatus {
        let snapshot = self.store.snapshot();
        StoreStatus {
            phase: snapshot.phase(self.scheduler.expected()),
            timed_out: snapshot.load_state.timed_out(),
            unlocked: self.boot.is_unlocked(),
            load_state: snapshot.load_state.names(),
            system_first: snapshot.system_first,
            primary: SlotStatus::from(&snapshot.primary),
            secondary: SlotStatus::from(&snapshot.secondary),
            late_load_running: self.scheduler.is_running(),
        }
    }

    pub fn store(&self) -> &Arc<RuleStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<LateLoadScheduler> {
        &self.scheduler
    }

    /// Stop late loading. Lookups keep working on whatever is installed.
    pub fn shutdown(&self) -> Option<ExitReason> {
        self.scheduler.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::format::RuleSetBuilder;
    use crate::loader::{MemoryOpener, UnsignedVerifier};
    use crate::store::{LoadState, Slot};
    use defex_core::{RuleClass, RuleSourceConfig, StaticBootState};

    fn rules(path: &str, features: Features) -> Vec<u8> {
        let mut builder = RuleSetBuilder::new();
        builder.add(path, features, None).unwrap();
        builder.build().unwrap()
    }

    fn config() -> Config {
        let mut config = Config::defaults();
        config.sources.candidates = vec![RuleSourceConfig::new("/dpolicy", RuleClass::General)];
        config
    }

    fn engine(config: &Config, boot: StaticBootState, opener: MemoryOpener) -> PolicyEngine {
        PolicyEngine::boot(config, Arc::new(boot), Arc::new(UnsignedVerifier), Arc::new(opener)).unwrap()
    }

    #[test]
    fn unlocked_device_grants_without_loading() {
        let opener = MemoryOpener::new();
        opener.insert("/dpolicy", rules("/data", Features::SAFEPLACE_PATH));
        let engine = engine(&config(), StaticBootState { unlocked: true, ..Default::default() }, opener);

        let decision = engine.rules_lookup("/anything", Features::UMHBIN_PATH, None);
        assert_eq!(decision, Decision::Matched(Grant::Unlocked));
        assert!(!engine.scheduler().is_running());
        assert_eq!(engine.phase(), LoadPhase::Unloaded);
        assert!(engine.store().load_state().is_empty());
    }

    #[test]
    fn boot_file_is_installed_synchronously() {
        let opener = MemoryOpener::new();
        opener.insert("/boot/dpolicy", rules("/data", Features::SAFEPLACE_PATH));
        let mut config = config();
        config.store.boot_rules = Some("/boot/dpolicy".into());

        let engine = engine(&config, StaticBootState::locked(), opener);
        assert_eq!(engine.phase(), LoadPhase::FullyLoaded);
        match engine.rules_lookup("/data/x", Features::SAFEPLACE_PATH, None) {
            Decision::Matched(Grant::Rule(rule)) => assert_eq!(rule.slot, Slot::Primary),
            other => panic!("unexpected {:?}", other),
        }
        engine.shutdown();
    }

    #[test]
    fn failing_boot_file_is_fatal() {
        let opener = MemoryOpener::new();
        opener.insert("/boot/dpolicy", b"junk".to_vec());
        let mut config = config();
        config.store.boot_rules = Some("/boot/dpolicy".into());

        let result = PolicyEngine::boot(
            &config,
            Arc::new(StaticBootState::locked()),
            Arc::new(UnsignedVerifier),
            Arc::new(opener),
        );
        assert!(result.is_err());
    }

    #[test]
    fn builtin_rules_are_partial_until_a_general_file_loads() {
        let opener = MemoryOpener::new();
        opener.insert("/builtin", rules("/sbin", Features::UMHBIN_PATH));
        let mut config = config();
        config.store.builtin_rules = Some("/builtin".into());
        config.late_load.timeout = std::time::Duration::from_secs(3600);
        config.late_load.retry_interval = std::time::Duration::from_secs(3600);

        let engine = engine(&config, StaticBootState::locked(), opener);
        assert_eq!(engine.phase(), LoadPhase::PartiallyLoaded);
        assert!(engine.store().load_state().contains(LoadState::BUILTIN));
        assert!(engine.rules_lookup("/sbin/x", Features::UMHBIN_PATH, None).is_granted());
        assert_eq!(engine.shutdown(), Some(ExitReason::Cancelled));
    }

    #[test]
    fn status_serializes() {
        let engine = engine(&config(), StaticBootState::locked(), MemoryOpener::new());
        let status = serde_json::to_value(engine.status()).unwrap();
        assert_eq!(status["phase"], "unloaded");
        assert_eq!(status["primary"]["data_size"], 0);
        engine.shutdown();
    }

    #[test]
    fn decision_serializes_with_tags() {
        let json = serde_json::to_value(Decision::Matched(Grant::DefaultAllow)).unwrap();
        assert_eq!(json["decision"], "matched");
        assert_eq!(json["detail"]["kind"], "default_allow");
        let denied = serde_json::to_value(Decision::Denied).unwrap();
        assert_eq!(denied["decision"], "denied");
    }
}

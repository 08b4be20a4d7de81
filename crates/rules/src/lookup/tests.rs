//! Tests for the lookup module.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use defex_core::StaticBootState;

use crate::format::{Features, RuleSetBuilder};
use crate::store::{LoadState, RuleStore, Slot};

use super::*;

const F: Features = Features::IS_FILE;

/// Helper to compile `(path, features)` pairs into a blob.
fn blob(rules: &[(&str, Features)]) -> Vec<u8> {
    let mut builder = RuleSetBuilder::new();
    for (path, features) in rules {
        builder.add(path, *features, None).unwrap();
    }
    builder.build().unwrap()
}

fn store_with_primary(rules: &[(&str, Features)]) -> RuleStore {
    let store = RuleStore::new(1 << 20);
    store.install_primary(&blob(rules), LoadState::GENERAL).unwrap();
    store
}

fn find(store: &RuleStore, path: &str, attribute: Features, recovery: bool) -> LookupResult {
    lookup(&store.snapshot(), path, attribute, recovery, None)
}

fn matched_features(result: LookupResult) -> Features {
    match result {
        LookupResult::Matched(rule) => rule.features,
        other => panic!("expected match, got {:?}", other),
    }
}

struct CountingTrigger(AtomicUsize);

impl LoadTrigger for CountingTrigger {
    fn trigger(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

// -- basic walk --------------------------------------------------------

#[test]
fn every_built_path_matches_its_features() {
    let rules = [
        ("/system/bin/run-as", F | Features::PED_EXCEPTION),
        ("/system/bin/app_process64", F | Features::IMMUTABLE_PATH_OPEN),
        ("/vendor/bin/hw/android.hardware.x", F | Features::UMHBIN_PATH),
        ("/system/etc/init", Features::IMMUTABLE_PATH_WRITE),
        ("/data/local/tmp", Features::SAFEPLACE_PATH),
    ];
    let store = store_with_primary(&rules);

    for (path, features) in rules {
        let attribute = features - F;
        let found = matched_features(find(&store, path, attribute, false));
        assert_eq!(found, features, "{}", path);
    }
}

#[test]
fn directory_rule_covers_descendants() {
    let store = store_with_primary(&[("/data", Features::SAFEPLACE_PATH)]);
    let result = find(&store, "/data/foo/bar", Features::SAFEPLACE_PATH, false);
    match result {
        LookupResult::Matched(rule) => assert_eq!(rule.name, "data"),
        other => panic!("expected match, got {:?}", other),
    }
}

#[test]
fn wrong_attribute_does_not_match() {
    let store = store_with_primary(&[("/system/bin/run-as", F | Features::PED_EXCEPTION)]);
    assert_eq!(
        find(&store, "/system/bin/run-as", Features::UMHBIN_PATH, false),
        LookupResult::NoMatch
    );
}

#[test]
fn unknown_or_partial_paths_do_not_match() {
    let store = store_with_primary(&[("/system/bin/run-as", F | Features::PED_EXCEPTION)]);
    let attr = Features::PED_EXCEPTION;

    assert_eq!(find(&store, "/system/bin/sh", attr, false), LookupResult::NoMatch);
    assert_eq!(find(&store, "/system/bin", attr, false), LookupResult::NoMatch);
    // The file node grants before the walk runs out of tree.
    assert!(matches!(
        find(&store, "/system/bin/run-as/x", attr, false),
        LookupResult::Matched(rule) if rule.name == "run-as"
    ));
}

#[test]
fn malformed_paths_are_no_match() {
    let store = store_with_primary(&[("/data", Features::SAFEPLACE_PATH)]);
    let attr = Features::SAFEPLACE_PATH;

    assert_eq!(find(&store, "data/x", attr, false), LookupResult::NoMatch);
    assert_eq!(find(&store, "//data", attr, false), LookupResult::NoMatch);
    assert_eq!(find(&store, "/data//x", attr, false), LookupResult::NoMatch);
    assert_eq!(find(&store, "/", attr, false), LookupResult::NoMatch);
}

#[test]
fn empty_request_matches_nothing() {
    let store = store_with_primary(&[("/data", Features::SAFEPLACE_PATH)]);
    assert_eq!(find(&store, "/data", Features::empty(), false), LookupResult::NoMatch);
}

// -- recovery selection ------------------------------------------------

fn recovery_store() -> RuleStore {
    store_with_primary(&[
        ("/sbin/tool", F | Features::PED_EXCEPTION),
        ("/sbin/tool", F | Features::UMHBIN_PATH | Features::FOR_RECOVERY),
    ])
}

#[test]
fn recovery_node_preferred_in_recovery() {
    let store = recovery_store();
    let found = matched_features(find(&store, "/sbin/tool", Features::UMHBIN_PATH, true));
    assert!(found.for_recovery());
}

#[test]
fn recovery_only_node_does_not_grant_in_normal_boot() {
    let store = recovery_store();
    assert_eq!(
        find(&store, "/sbin/tool", Features::UMHBIN_PATH, false),
        LookupResult::NoMatch
    );
    let found = matched_features(find(&store, "/sbin/tool", Features::PED_EXCEPTION, false));
    assert!(!found.for_recovery());
}

#[test]
fn attribute_match_beats_recovery_match() {
    // In recovery the recovery-flagged sibling lacks PED_EXCEPTION, the
    // normal one has it: the attribute match wins.
    let store = recovery_store();
    let found = matched_features(find(&store, "/sbin/tool", Features::PED_EXCEPTION, true));
    assert!(found.contains(Features::PED_EXCEPTION));
    assert!(!found.for_recovery());
}

#[test]
fn recovery_directory_branch_is_followed_in_recovery() {
    let store = store_with_primary(&[
        ("/res", Features::FOR_RECOVERY),
        ("/res/images/anim", Features::SAFEPLACE_PATH | Features::FOR_RECOVERY),
    ]);
    assert!(matches!(
        find(&store, "/res/images/anim", Features::SAFEPLACE_PATH, true),
        LookupResult::Matched(_)
    ));
}

// -- slots -------------------------------------------------------------

fn two_slot_store(system_first: bool) -> RuleStore {
    let store = RuleStore::new(1 << 20);
    store
        .install_primary(
            &blob(&[
                ("/system/bin/general", F | Features::PED_EXCEPTION),
                ("/system/bin/both", F | Features::PED_EXCEPTION),
            ]),
            LoadState::GENERAL,
        )
        .unwrap();
    store.install_secondary(
        blob(&[
            ("/system/bin/sys", F | Features::PED_EXCEPTION),
            ("/system/bin/both", F | Features::PED_EXCEPTION),
        ]),
        LoadState::SYSTEM,
        system_first,
    )
    .unwrap();
    store
}

fn matched_slot(result: LookupResult) -> Slot {
    match result {
        LookupResult::Matched(rule) => rule.slot,
        other => panic!("expected match, got {:?}", other),
    }
}

#[test]
fn slot_order_follows_system_first_xor_path() {
    let store = two_slot_store(true);
    let snap = store.snapshot();
    assert_eq!(slot_order(&snap, true), vec![Slot::Secondary, Slot::Primary]);
    assert_eq!(slot_order(&snap, false), vec![Slot::Primary, Slot::Secondary]);

    let plain = store_with_primary(&[("/x", F)]).snapshot();
    assert_eq!(slot_order(&plain, false), vec![Slot::Primary]);
    assert_eq!(slot_order(&plain, true), vec![Slot::Primary]);
}

#[test]
fn system_path_prefers_system_slot() {
    let store = two_slot_store(true);
    let attr = Features::PED_EXCEPTION;
    assert_eq!(matched_slot(find(&store, "/system/bin/both", attr, false)), Slot::Secondary);
}

#[test]
fn other_slot_is_retried_once() {
    let store = two_slot_store(true);
    let attr = Features::PED_EXCEPTION;
    assert_eq!(matched_slot(find(&store, "/system/bin/general", attr, false)), Slot::Primary);
    assert_eq!(matched_slot(find(&store, "/system/bin/sys", attr, false)), Slot::Secondary);
    assert_eq!(find(&store, "/system/bin/neither", attr, false), LookupResult::NoMatch);
}

// -- bootstrap ---------------------------------------------------------

#[test]
fn empty_store_allows_only_allow_list() {
    let store = RuleStore::new(1024);
    assert_eq!(find(&store, "/anything", Features::PED_EXCEPTION, false), LookupResult::DefaultAllow);
    assert_eq!(find(&store, "/anything", Features::SAFEPLACE_PATH, false), LookupResult::DefaultAllow);
    assert_eq!(find(&store, "/anything", Features::IMMUTABLE_PATH_WRITE, false), LookupResult::NoMatch);
    assert_eq!(find(&store, "/anything", Features::UMHBIN_PATH, false), LookupResult::NoMatch);
    assert_eq!(find(&store, "/anything", Features::UMHBIN_PATH, true), LookupResult::DefaultAllow);
}

#[test]
fn empty_store_denies_everything_after_timeout() {
    let store = RuleStore::new(1024);
    store.mark(LoadState::TIMEOUT);
    assert_eq!(find(&store, "/anything", Features::PED_EXCEPTION, false), LookupResult::NoMatch);
    assert_eq!(find(&store, "/anything", Features::UMHBIN_PATH, true), LookupResult::NoMatch);
}

#[test]
fn default_allow_list_rejects_mixed_requests() {
    assert!(default_allowed(Features::PED_EXCEPTION | Features::FOR_RECOVERY, false));
    assert!(!default_allowed(Features::PED_EXCEPTION | Features::IMMUTABLE_PATH_WRITE, false));
    assert!(!default_allowed(Features::empty(), true));
}

#[test]
fn lookup_kicks_trigger_only_while_empty() {
    let store = Arc::new(RuleStore::new(1 << 20));
    let trigger = Arc::new(CountingTrigger(AtomicUsize::new(0)));
    let rules = RuleLookup::new(store.clone(), Arc::new(StaticBootState::locked()))
        .with_trigger(trigger.clone());

    rules.lookup("/a", Features::PED_EXCEPTION, None);
    rules.lookup("/b", Features::PED_EXCEPTION, None);
    assert_eq!(trigger.0.load(Ordering::SeqCst), 2);

    store.install_primary(&blob(&[("/a", F)]), LoadState::GENERAL).unwrap();
    rules.lookup("/a", Features::PED_EXCEPTION, None);
    assert_eq!(trigger.0.load(Ordering::SeqCst), 2);
}

#[test]
fn lookup_does_not_trigger_after_timeout() {
    let store = Arc::new(RuleStore::new(1024));
    store.mark(LoadState::TIMEOUT);
    let trigger = Arc::new(CountingTrigger(AtomicUsize::new(0)));
    let rules = RuleLookup::new(store, Arc::new(StaticBootState::locked())).with_trigger(trigger.clone());

    assert_eq!(rules.lookup("/a", Features::PED_EXCEPTION, None), LookupResult::NoMatch);
    assert_eq!(trigger.0.load(Ordering::SeqCst), 0);
}

#[test]
fn system_root_prefix_is_stripped_when_mounted() {
    let store = Arc::new(store_with_primary(&[("/system/bin/sh", F | Features::IMMUTABLE_PATH_OPEN)]));
    let attr = Features::IMMUTABLE_PATH_OPEN;

    let mounted = StaticBootState { system_root: true, ..StaticBootState::default() };
    let rules = RuleLookup::new(store.clone(), Arc::new(mounted));
    assert!(matches!(rules.lookup("/system_root/system/bin/sh", attr, None), LookupResult::Matched(_)));

    let rules = RuleLookup::new(store, Arc::new(StaticBootState::locked()));
    assert_eq!(rules.lookup("/system_root/system/bin/sh", attr, None), LookupResult::NoMatch);
}

// -- integrity ---------------------------------------------------------

fn integrity_store(hash: [u8; 32]) -> RuleStore {
    let mut builder = RuleSetBuilder::new();
    builder
        .add("/system/bin/toolbox", F | Features::IMMUTABLE_PATH_OPEN, Some(hash))
        .unwrap();
    let store = RuleStore::new(1 << 20);
    store.install_primary(&builder.build().unwrap(), LoadState::GENERAL).unwrap();
    store
}

#[test]
fn integrity_hash_checked_against_file() {
    let content = b"#!/system/bin/sh\necho toolbox\n";
    let store = integrity_store(Sha256::digest(content).into());
    let snap = store.snapshot();
    let attr = Features::IMMUTABLE_PATH_OPEN;

    let mut good: &[u8] = content;
    assert!(matches!(
        lookup(&snap, "/system/bin/toolbox", attr, false, Some(&mut good)),
        LookupResult::Matched(_)
    ));

    let mut bad: &[u8] = b"something else";
    assert!(matches!(
        lookup(&snap, "/system/bin/toolbox", attr, false, Some(&mut bad)),
        LookupResult::IntegrityFailed(_)
    ));
}

#[test]
fn integrity_without_file_handle_matches() {
    let store = integrity_store([9; 32]);
    assert!(matches!(
        find(&store, "/system/bin/toolbox", Features::IMMUTABLE_PATH_OPEN, false),
        LookupResult::Matched(_)
    ));
}

#[test]
fn zero_hash_skips_integrity() {
    let store = integrity_store([0; 32]);
    let mut any: &[u8] = b"whatever";
    assert!(matches!(
        lookup(&store.snapshot(), "/system/bin/toolbox", Features::IMMUTABLE_PATH_OPEN, false, Some(&mut any)),
        LookupResult::Matched(_)
    ));
}

// -- malformed trees ---------------------------------------------------

#[test]
fn corrupt_links_fail_lookup_without_panicking() {
    let mut bytes = blob(&[("/a/b", F | Features::PED_EXCEPTION), ("/c", F)]);
    // Point the first root entry's child link past the end of the blob.
    let at = crate::format::ROOT_NEXT_LEVEL as usize;
    bytes[at..at + 4].copy_from_slice(&0x7FFF_FFFFu32.to_le_bytes());

    let store = RuleStore::new(1 << 20);
    store.install_primary(&bytes, LoadState::GENERAL).unwrap();
    assert_eq!(find(&store, "/a/b", Features::PED_EXCEPTION, false), LookupResult::NoMatch);
}

#[test]
fn corrupt_slot_falls_back_to_the_other() {
    let mut bytes = blob(&[("/a/b", F | Features::PED_EXCEPTION), ("/c", F)]);
    let at = crate::format::ROOT_NEXT_LEVEL as usize;
    bytes[at..at + 4].copy_from_slice(&0x7FFF_FFFFu32.to_le_bytes());

    let store = RuleStore::new(1 << 20);
    store.install_primary(&bytes, LoadState::GENERAL).unwrap();
    store
        .install_secondary(blob(&[("/a/b", F | Features::PED_EXCEPTION)]), LoadState::SYSTEM, true)
        .unwrap();

    // Primary is walked first for non-system paths once system_first is set.
    assert_eq!(slot_order(&store.snapshot(), false), vec![Slot::Primary, Slot::Secondary]);
    let result = find(&store, "/a/b", Features::PED_EXCEPTION, false);
    assert_eq!(matched_slot(result), Slot::Secondary);
}

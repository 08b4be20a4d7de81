//! Subcommand implementations.

use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::json;
use tracing::info;

use defex_core::{Config, RuleClass, StaticBootState};
use defex_rules::format::{self, compile_rules, render_entry, TreeEntry};
use defex_rules::loader::{
    self, check_structure, public_key_for, sign_blob, FsOpener, MemoryOpener, RuleLoader,
    UnsignedVerifier,
};
use defex_rules::lookup::RuleLookup;
use defex_rules::{Decision, Features, PolicyEngine, RuleStore, Slot};

fn parse_secret(hex_key: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_key.trim()).context("signing key is not hex")?;
    bytes
        .try_into()
        .map_err(|v: Vec<u8>| anyhow!("signing key must be 32 bytes, got {}", v.len()))
}

fn read(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

fn write(path: &Path, bytes: &[u8]) -> Result<()> {
    fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}

/// Leading bytes of `raw` its sentinel declares, checked for structure.
fn payload(raw: &[u8]) -> Result<&[u8]> {
    let len = format::declared_data_size(raw)
        .filter(|len| *len <= raw.len())
        .ok_or_else(|| anyhow!("not a rule blob ({} bytes)", raw.len()))?;
    let payload = &raw[..len];
    check_structure(payload)?;
    Ok(payload)
}

// ── compile / sign ────────────────────────────────────────────

pub(crate) fn compile_blob(source: &str, key: Option<&str>) -> Result<Vec<u8>> {
    let blob = compile_rules(source)?;
    match key {
        Some(key) => Ok(sign_blob(&parse_secret(key)?, &blob)),
        None => Ok(blob),
    }
}

pub fn compile(input: &Path, output: &Path, key: Option<&str>) -> Result<()> {
    let source = fs::read_to_string(input)
        .with_context(|| format!("failed to read {}", input.display()))?;
    let blob = compile_blob(&source, key)?;
    write(output, &blob)?;
    info!(input = %input.display(), output = %output.display(), size = blob.len(), "compiled");
    println!("{} bytes{}", blob.len(), if key.is_some() { ", signed" } else { "" });
    Ok(())
}

pub fn sign(input: &Path, output: &Path, key: &str) -> Result<()> {
    let raw = read(input)?;
    let payload = payload(&raw)?;
    let secret = parse_secret(key)?;
    write(output, &sign_blob(&secret, payload))?;
    println!("public key {}", hex::encode(public_key_for(&secret)));
    Ok(())
}

// ── inspect ───────────────────────────────────────────────────

fn entry_json(entry: &TreeEntry) -> serde_json::Value {
    json!({
        "path": entry.path,
        "offset": entry.offset,
        "features": entry.features.names(),
        "integrity_hash": entry.integrity_hash.map(hex::encode),
    })
}

pub(crate) fn inspect_entries(raw: &[u8]) -> Result<Vec<TreeEntry>> {
    let payload = payload(raw)?;
    Ok(format::root(payload)?.entries()?)
}

pub fn inspect(input: &Path, as_json: bool) -> Result<()> {
    let entries = inspect_entries(&read(input)?)?;
    if as_json {
        let nodes: Vec<_> = entries.iter().map(entry_json).collect();
        println!("{}", serde_json::to_string_pretty(&nodes)?);
    } else {
        for entry in &entries {
            println!("{}", render_entry(entry));
        }
    }
    Ok(())
}

// ── lookup ────────────────────────────────────────────────────

pub(crate) fn evaluate(
    raw: &[u8],
    path: &str,
    features: &str,
    file: Option<&mut dyn Read>,
    boot: StaticBootState,
) -> Result<Decision> {
    let Some(attribute) = Features::parse_list(features) else {
        bail!("unknown feature in '{}'", features);
    };
    let store = Arc::new(RuleStore::new(loader::MAX_RULES_SIZE));
    RuleLoader::new(store.clone(), Arc::new(UnsignedVerifier), Arc::new(MemoryOpener::new()))
        .load(raw, Slot::Primary, RuleClass::General)?;
    let lookup = RuleLookup::new(store, Arc::new(boot));
    Ok(Decision::from(lookup.lookup(path, attribute, file)))
}

pub fn lookup(
    input: &Path,
    path: &str,
    features: &str,
    file: Option<&Path>,
    recovery: bool,
    system_root: bool,
) -> Result<()> {
    let raw = read(input)?;
    let mut handle = file
        .map(|f| File::open(f).with_context(|| format!("failed to open {}", f.display())))
        .transpose()?;
    let boot = StaticBootState {
        unlocked: false,
        recovery,
        system_root,
    };
    let decision = evaluate(&raw, path, features, handle.as_mut().map(|f| f as &mut dyn Read), boot)?;
    println!("{}", serde_json::to_string_pretty(&decision)?);
    Ok(())
}

// ── status ────────────────────────────────────────────────────

pub fn status(profile: Option<&str>) -> Result<()> {
    let config = match profile {
        Some(profile) => Config::for_profile(profile),
        None => Config::from_env(),
    };
    let verifier = loader::from_config(&config.signature).context("invalid signature config")?;
    let boot = StaticBootState::from_env(&config.profile);
    let engine = PolicyEngine::boot(&config, Arc::new(boot), verifier, Arc::new(FsOpener))
        .context("failed to load boot rules")?;
    engine.scheduler().attempt_once();
    let status = engine.status();
    engine.shutdown();

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({ "config": config.summary(), "status": status }))?
    );
    Ok(())
}

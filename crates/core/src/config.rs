use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

pub(crate) fn profiled_env_bool(profile: &str, key: &str, default: bool) -> bool {
    profiled_env_opt(profile, key)
        .map(|v| parse_bool(&v).unwrap_or(default))
        .unwrap_or(default)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Split a comma-separated path list, dropping empty entries.
fn parse_path_list(value: &str) -> Vec<PathBuf> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect()
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub sources: SourcesConfig,
    pub signature: SignatureConfig,
    pub store: StoreConfig,
    pub late_load: LateLoadConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `DEFEX_PROFILE`. When set (e.g. `ENG`), every key
    /// is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("DEFEX_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            sources: SourcesConfig::from_env_profiled(p),
            signature: SignatureConfig::from_env_profiled(p),
            store: StoreConfig::from_env_profiled(p),
            late_load: LateLoadConfig::from_env_profiled(p),
        }
    }

    /// Built-in defaults with no environment lookups. Signatures are optional.
    pub fn defaults() -> Self {
        Self {
            profile: String::new(),
            sources: SourcesConfig::default(),
            signature: SignatureConfig::default(),
            store: StoreConfig::default(),
            late_load: LateLoadConfig::default(),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        for source in &self.sources.candidates {
            tracing::info!("  source:      {} ({:?})", source.path.display(), source.class);
        }
        tracing::info!(
            "  signature:   required={}, key={}",
            self.signature.required,
            if self.signature.public_key.is_some() { "set" } else { "(none)" }
        );
        tracing::info!(
            "  store:       primary_capacity={}, split_system={}",
            self.store.primary_capacity,
            self.sources.split_system_rules
        );
        tracing::info!(
            "  late_load:   interval={}s, timeout={}s",
            self.late_load.retry_interval.as_secs(),
            self.late_load.timeout.as_secs()
        );
    }

    /// Return a JSON view of the config for status output.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "profile": self.profile_label(),
            "sources": self.sources.candidates,
            "split_system_rules": self.sources.split_system_rules,
            "signature_required": self.signature.required,
            "primary_capacity": self.store.primary_capacity,
            "retry_interval_secs": self.late_load.retry_interval.as_secs(),
            "timeout_secs": self.late_load.timeout.as_secs(),
        })
    }
}

// ── Rule sources ──────────────────────────────────────────────

/// Policy class of a rule file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleClass {
    General,
    System,
}

/// One candidate rule file, tried in list order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSourceConfig {
    pub path: PathBuf,
    pub class: RuleClass,
}

impl RuleSourceConfig {
    pub fn new(path: impl Into<PathBuf>, class: RuleClass) -> Self {
        Self {
            path: path.into(),
            class,
        }
    }
}

pub const DEFAULT_GENERAL_RULES: &str = "/dpolicy,/first_stage_ramdisk/dpolicy,/vendor/etc/dpolicy";
pub const DEFAULT_SYSTEM_RULES: &str = "/system/etc/dpolicy_system";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    /// General sources first, then system sources.
    pub candidates: Vec<RuleSourceConfig>,
    /// Install system-class files into the secondary slot instead of
    /// overwriting primary.
    pub split_system_rules: bool,
}

impl SourcesConfig {
    fn from_env_profiled(p: &str) -> Self {
        let general = profiled_env_opt(p, "DEFEX_GENERAL_RULES")
            .unwrap_or_else(|| DEFAULT_GENERAL_RULES.to_string());
        let system = profiled_env_opt(p, "DEFEX_SYSTEM_RULES")
            .unwrap_or_else(|| DEFAULT_SYSTEM_RULES.to_string());
        Self {
            candidates: build_candidates(&general, &system),
            split_system_rules: profiled_env_bool(p, "DEFEX_SPLIT_SYSTEM_RULES", true),
        }
    }
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            candidates: build_candidates(DEFAULT_GENERAL_RULES, DEFAULT_SYSTEM_RULES),
            split_system_rules: true,
        }
    }
}

fn build_candidates(general: &str, system: &str) -> Vec<RuleSourceConfig> {
    let general = parse_path_list(general)
        .into_iter()
        .map(|path| RuleSourceConfig::new(path, RuleClass::General));
    let system = parse_path_list(system)
        .into_iter()
        .map(|path| RuleSourceConfig::new(path, RuleClass::System));
    general.chain(system).collect()
}

// ── Signature ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignatureConfig {
    /// Hex-encoded Ed25519 verifying key.
    pub public_key: Option<String>,
    /// Refuse unsigned rule files.
    pub required: bool,
}

impl SignatureConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            public_key: profiled_env_opt(p, "DEFEX_PUBLIC_KEY"),
            required: profiled_env_bool(p, "DEFEX_REQUIRE_SIGNATURE", true),
        }
    }

    /// Decode the configured key. `Ok(None)` means unsigned rules are
    /// accepted; a required signature without a key is an error.
    pub fn public_key_bytes(&self) -> Result<Option<[u8; 32]>, ConfigError> {
        let Some(hex_key) = self.public_key.as_deref() else {
            return if self.required {
                Err(ConfigError::MissingPublicKey)
            } else {
                Ok(None)
            };
        };
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| ConfigError::InvalidPublicKey(e.to_string()))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| ConfigError::InvalidPublicKey(format!("expected 32 bytes, got {}", v.len())))?;
        Ok(Some(key))
    }
}

// ── Store ─────────────────────────────────────────────────────

/// Default size of the primary slot's fixed region.
pub const DEFAULT_PRIMARY_CAPACITY: usize = 256 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub primary_capacity: usize,
    /// Blob shipped with the binary, installed into primary unverified.
    pub builtin_rules: Option<PathBuf>,
    /// File loaded synchronously at boot; failure aborts startup.
    pub boot_rules: Option<PathBuf>,
}

impl StoreConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            primary_capacity: profiled_env_u64(p, "DEFEX_PRIMARY_CAPACITY", DEFAULT_PRIMARY_CAPACITY as u64)
                as usize,
            builtin_rules: profiled_env_opt(p, "DEFEX_BUILTIN_RULES").map(PathBuf::from),
            boot_rules: profiled_env_opt(p, "DEFEX_BOOT_RULES").map(PathBuf::from),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            primary_capacity: DEFAULT_PRIMARY_CAPACITY,
            builtin_rules: None,
            boot_rules: None,
        }
    }
}

// ── Late loading ──────────────────────────────────────────────

/// Lower bound on the retry interval accepted from the environment.
pub const MIN_RETRY_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LateLoadConfig {
    pub retry_interval: Duration,
    /// Wall-clock budget after which late loading gives up for good.
    pub timeout: Duration,
}

impl LateLoadConfig {
    fn from_env_profiled(p: &str) -> Self {
        let interval = profiled_env_u64(p, "DEFEX_RETRY_INTERVAL_SECS", MIN_RETRY_INTERVAL.as_secs());
        let timeout = profiled_env_u64(p, "DEFEX_LOAD_TIMEOUT_SECS", DEFAULT_LOAD_TIMEOUT.as_secs());
        Self {
            retry_interval: Duration::from_secs(interval).max(MIN_RETRY_INTERVAL),
            timeout: Duration::from_secs(timeout),
        }
    }
}

impl Default for LateLoadConfig {
    fn default() -> Self {
        Self {
            retry_interval: MIN_RETRY_INTERVAL,
            timeout: DEFAULT_LOAD_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool(" Yes "), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn candidates_keep_general_before_system() {
        let sources = build_candidates("/a, ,/b", "/sys");
        assert_eq!(
            sources,
            vec![
                RuleSourceConfig::new("/a", RuleClass::General),
                RuleSourceConfig::new("/b", RuleClass::General),
                RuleSourceConfig::new("/sys", RuleClass::System),
            ]
        );
    }

    #[test]
    fn default_sources_have_four_candidates() {
        let sources = SourcesConfig::default();
        assert_eq!(sources.candidates.len(), 4);
        assert_eq!(sources.candidates[3].class, RuleClass::System);
    }

    #[test]
    fn public_key_must_be_32_bytes() {
        let cfg = SignatureConfig {
            public_key: Some("abcd".to_string()),
            required: true,
        };
        assert!(matches!(cfg.public_key_bytes(), Err(ConfigError::InvalidPublicKey(_))));

        let cfg = SignatureConfig {
            public_key: Some("11".repeat(32)),
            required: true,
        };
        assert_eq!(cfg.public_key_bytes().unwrap(), Some([0x11; 32]));
    }

    #[test]
    fn missing_key_is_only_an_error_when_required() {
        let optional = SignatureConfig { public_key: None, required: false };
        assert_eq!(optional.public_key_bytes().unwrap(), None);

        let required = SignatureConfig { public_key: None, required: true };
        assert!(matches!(required.public_key_bytes(), Err(ConfigError::MissingPublicKey)));
    }
}

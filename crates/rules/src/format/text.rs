//! Rule source text.
//!
//! ```text
//! # features                                   path                    [sha256]
//! feature_is_file|feature_ped_exception        /system/bin/run-as
//! feature_safeplace_path                       /data
//! feature_is_file|feature_integrity_check      /system/bin/toolbox     3f2a...
//! ```

use super::builder::{RuleEntry, RuleSetBuilder};
use super::error::FormatError;
use super::features::Features;
use super::node::{TreeEntry, INTEGRITY_HASH_LEN};

/// Parse rule source text into entries. Line numbers in errors are 1-based.
pub fn parse_rules(text: &str) -> Result<Vec<RuleEntry>, FormatError> {
    let mut entries = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let content = raw.split('#').next().unwrap_or("").trim();
        if content.is_empty() {
            continue;
        }

        let fields: Vec<&str> = content.split_whitespace().collect();
        let (features, path, hash) = match fields.as_slice() {
            [features, path] => (*features, *path, None),
            [features, path, hash] => (*features, *path, Some(*hash)),
            _ => {
                return Err(FormatError::Syntax {
                    line,
                    reason: format!("expected 'features path [hash]', got {} fields", fields.len()),
                })
            }
        };

        let features = Features::parse_list(features).ok_or_else(|| FormatError::Syntax {
            line,
            reason: format!("unknown feature in '{}'", features),
        })?;
        if !path.starts_with('/') {
            return Err(FormatError::Syntax {
                line,
                reason: format!("path '{}' is not absolute", path),
            });
        }

        let mut entry = RuleEntry::new(path, features);
        if let Some(hash) = hash {
            entry = entry.with_hash(parse_hash(hash).ok_or_else(|| FormatError::Syntax {
                line,
                reason: format!("hash must be {} hex bytes", INTEGRITY_HASH_LEN),
            })?);
        }
        entries.push(entry);
    }

    Ok(entries)
}

/// Parse rule source text and compile it in one step.
pub fn compile_rules(text: &str) -> Result<Vec<u8>, FormatError> {
    let mut builder = RuleSetBuilder::new();
    for entry in parse_rules(text)? {
        builder.add_entry(&entry)?;
    }
    builder.build()
}

fn parse_hash(hex_hash: &str) -> Option<[u8; INTEGRITY_HASH_LEN]> {
    hex::decode(hex_hash).ok()?.try_into().ok()
}

/// Render a decoded node back into a rule source line.
pub fn render_entry(entry: &TreeEntry) -> String {
    let features = if entry.features.is_empty() {
        "-".to_string()
    } else {
        entry.features.names().join("|")
    };
    match entry.integrity_hash {
        Some(hash) => format!("{:<48} {} {}", features, entry.path, hex::encode(hash)),
        None => format!("{:<48} {}", features, entry.path),
    }
}

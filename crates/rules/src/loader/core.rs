//! Core [`RuleLoader`]: verifies, validates and installs rule blobs.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use defex_core::{RuleClass, RuleSourceConfig};

use crate::format;
use crate::store::{LoadState, RuleStore, Slot, MAX_SOURCES};

use super::error::{LoadError, Result};
use super::signature::{SignatureVerifier, UnsignedVerifier, SIGNATURE_LEN};
use super::source::FileOpener;

/// Largest rule payload accepted.
pub const MAX_RULES_SIZE: usize = 1 << 20;

/// Most bytes read from a candidate file: a full payload and its signature.
const MAX_READ: usize = MAX_RULES_SIZE + SIGNATURE_LEN;

/// Check that `payload` is a well-formed rule blob of exactly its own length.
pub fn check_structure(payload: &[u8]) -> Result<()> {
    let tree = format::root(payload).map_err(|e| LoadError::BadStructure(e.to_string()))?;
    if !tree.has_valid_tag() {
        return Err(LoadError::BadStructure(format!(
            "sentinel tag is {:?}",
            tree.sentinel().name_lossy()
        )));
    }
    if !tree.has_valid_geometry() {
        return Err(LoadError::BadStructure(format!(
            "sentinel next_level is {}",
            tree.sentinel().next_level()
        )));
    }
    if tree.data_size() != payload.len() {
        return Err(LoadError::BadStructure(format!(
            "declared {} bytes, trusted {}",
            tree.data_size(),
            payload.len()
        )));
    }
    Ok(())
}

fn check_size(len: usize) -> Result<()> {
    if len == 0 || len > MAX_RULES_SIZE {
        return Err(LoadError::BadSize(len));
    }
    Ok(())
}

/// Loads rule files into a shared [`RuleStore`].
pub struct RuleLoader {
    store: Arc<RuleStore>,
    verifier: Arc<dyn SignatureVerifier>,
    opener: Arc<dyn FileOpener>,
    split_system_rules: bool,
}

impl RuleLoader {
    /// System-class files go to the secondary slot by default.
    pub fn new(
        store: Arc<RuleStore>,
        verifier: Arc<dyn SignatureVerifier>,
        opener: Arc<dyn FileOpener>,
    ) -> Self {
        Self {
            store,
            verifier,
            opener,
            split_system_rules: true,
        }
    }

    pub fn with_split_system_rules(mut self, split: bool) -> Self {
        self.split_system_rules = split;
        self
    }

    pub fn store(&self) -> &Arc<RuleStore> {
        &self.store
    }

    /// Class a candidate counts as. Without splitting, system files share
    /// the general class, so the first valid file of either kind wins.
    pub fn class_for(&self, class: RuleClass) -> RuleClass {
        if self.split_system_rules {
            class
        } else {
            RuleClass::General
        }
    }

    /// Slot a file of `class` is installed into.
    pub fn target_for(&self, class: RuleClass) -> Slot {
        match self.class_for(class) {
            RuleClass::System => Slot::Secondary,
            RuleClass::General => Slot::Primary,
        }
    }

    /// Verify, validate and install `raw` into `target`, recording `class`
    /// as loaded. Returns the installed payload size.
    pub fn load(&self, raw: &[u8], target: Slot, class: RuleClass) -> Result<usize> {
        let len = self.verifier.verify(raw)?;
        let payload = &raw[..len];
        check_structure(payload)?;
        check_size(len)?;

        let system_first = class == RuleClass::System;
        self.install(payload, target, LoadState::class(class), system_first)?;
        info!(size = len, ?target, ?class, "rule set installed");
        Ok(len)
    }

    fn install(&self, payload: &[u8], target: Slot, mark: LoadState, system_first: bool) -> Result<()> {
        match target {
            Slot::Primary => self.store.install_primary(payload, mark),
            Slot::Secondary => self.store.install_secondary(payload.to_vec(), mark, system_first),
        }
    }

    /// Install a blob shipped with the binary into primary. It is not
    /// signature-checked and does not count as a loaded class, so a general
    /// rule file found later replaces it.
    pub fn install_builtin(&self, blob: &[u8]) -> Result<usize> {
        let len = UnsignedVerifier.verify(blob)?;
        let payload = &blob[..len];
        check_structure(payload)?;
        check_size(len)?;

        self.install(payload, Slot::Primary, LoadState::BUILTIN, false)?;
        info!(size = len, "builtin rule set installed");
        Ok(len)
    }

    /// Synchronously load the boot rule file as the general policy.
    pub fn boot_load(&self, path: &Path) -> Result<usize> {
        let raw = self.read_file(path)?;
        self.load(&raw, Slot::Primary, RuleClass::General)
            .inspect_err(|e| warn!(path = %path.display(), error = %e, "boot rule file rejected"))
    }

    /// Try candidate `index`. Opening the file consumes the source whatever
    /// happens next; a file that cannot be opened leaves it for a later pass.
    pub fn load_source(&self, index: usize, source: &RuleSourceConfig) -> Result<usize> {
        if index >= MAX_SOURCES {
            return Err(LoadError::SourceIndex(index));
        }
        let file = self.opener.open(&source.path)?;
        self.store.mark(LoadState::source(index));

        let raw = read_bounded(file)?;
        debug!(path = %source.path.display(), bytes = raw.len(), "read rule source");
        let class = self.class_for(source.class);
        self.load(&raw, self.target_for(class), class)
    }

    /// Read `path` through the opener, bounded like any candidate file.
    pub fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        let file = self.opener.open(path)?;
        read_bounded(file)
    }
}

fn read_bounded(file: Box<dyn Read + Send>) -> Result<Vec<u8>> {
    let mut raw = Vec::new();
    file.take(MAX_READ as u64 + 1).read_to_end(&mut raw)?;
    if raw.len() > MAX_READ {
        return Err(LoadError::BadSize(raw.len()));
    }
    Ok(raw)
}

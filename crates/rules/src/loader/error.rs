//! Error types for rule loading.

/// Why a signed rule blob was rejected before its structure was looked at.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    /// Too short to hold a sentinel, or the declared payload leaves no room
    /// for a signature.
    #[error("blob of {0} bytes is too short to carry a signed payload")]
    Truncated(usize),

    /// Non-zero bytes after the signature.
    #[error("unexpected data after signature")]
    TrailingData,

    #[error("signature does not verify against the configured key")]
    Invalid,

    #[error("invalid public key: {0}")]
    BadKey(String),
}

/// Errors that can occur while validating and installing a rule file.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("bad signature: {0}")]
    BadSignature(#[from] SignatureError),

    /// Sentinel tag, geometry or declared size do not check out.
    #[error("bad structure: {0}")]
    BadStructure(String),

    /// Trusted payload is empty or above the rule size limit.
    #[error("bad size: {0} bytes")]
    BadSize(usize),

    /// Payload does not fit the primary region.
    #[error("rule set of {size} bytes exceeds primary capacity of {capacity} bytes")]
    TooLarge { size: usize, capacity: usize },

    /// Late loading already timed out; the store no longer changes.
    #[error("rule store is frozen after the late-load timeout")]
    Frozen,

    /// Candidate index has no consumed bit in `load_state`.
    #[error("source index {0} is out of range")]
    SourceIndex(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for loader operations.
pub type Result<T> = std::result::Result<T, LoadError>;

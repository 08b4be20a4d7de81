//! Errors raised while decoding or building a rule blob.

/// Malformed offsets, lengths or rule source text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    /// A node header, name or hash would read past the end of the buffer.
    #[error("node at offset {offset} overruns buffer of {len} bytes")]
    OutOfBounds { offset: u32, len: usize },

    /// A sibling or child link does not point past the node holding it.
    #[error("link from offset {from} to {to} does not point forward")]
    BackwardLink { from: u32, to: u32 },

    /// The encoded tree does not fit 32-bit offsets or 16-bit name lengths.
    #[error("rule set too large to encode: {0}")]
    TooLarge(String),

    /// A rule path is not absolute or contains an empty component.
    #[error("invalid rule path '{0}'")]
    InvalidPath(String),

    /// A line of rule source text could not be parsed.
    #[error("line {line}: {reason}")]
    Syntax { line: usize, reason: String },
}

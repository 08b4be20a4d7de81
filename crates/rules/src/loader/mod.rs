//! Rule file loading.
//!
//! A raw file goes through three gates before it reaches the store: the
//! [`SignatureVerifier`] decides how many leading bytes are trusted, the
//! sentinel must check out, and the payload must fit the size limit. Files
//! come in through a [`FileOpener`] so the loader never touches the
//! filesystem directly.

mod core;
mod error;
mod signature;
mod source;


pub use self::core::{check_structure, RuleLoader, MAX_RULES_SIZE};
pub use self::error::{LoadError, Result, SignatureError};
pub use self::signature::{
    from_config, public_key_for, sign_blob, Ed25519Verifier, SignatureVerifier, UnsignedVerifier,
    SIGNATURE_LEN,
};
pub use self::source::{FileOpener, FsOpener, MemoryOpener};

//! Rule blob signature schemes.
//!
//! A signed blob is the rule payload, a 64-byte Ed25519 signature over it,
//! and optionally zero padding. The payload length is the `data_size` its
//! own sentinel declares, so the verifier never has to trust a separate
//! length field.

use std::sync::Arc;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use tracing::warn;

use defex_core::{config::SignatureConfig, ConfigError};

use crate::format::{declared_data_size, NODE_HEADER_SIZE};

use super::error::SignatureError;

pub const SIGNATURE_LEN: usize = 64;

/// Authenticates a raw rule blob and reports how many leading bytes are the
/// trusted payload.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, raw: &[u8]) -> Result<usize, SignatureError>;
}

fn payload_len(raw: &[u8]) -> Result<usize, SignatureError> {
    match declared_data_size(raw) {
        Some(len) if len >= NODE_HEADER_SIZE && len <= raw.len() => Ok(len),
        _ => Err(SignatureError::Truncated(raw.len())),
    }
}

/// Checks an Ed25519 signature appended to the payload.
#[derive(Debug, Clone)]
pub struct Ed25519Verifier {
    key: VerifyingKey,
}

impl Ed25519Verifier {
    pub fn new(public_key: &[u8; 32]) -> Result<Self, SignatureError> {
        let key = VerifyingKey::from_bytes(public_key)
            .map_err(|e| SignatureError::BadKey(e.to_string()))?;
        Ok(Self { key })
    }
}

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, raw: &[u8]) -> Result<usize, SignatureError> {
        let len = payload_len(raw)?;
        let sig_end = len
            .checked_add(SIGNATURE_LEN)
            .filter(|end| *end <= raw.len())
            .ok_or(SignatureError::Truncated(raw.len()))?;
        if raw[sig_end..].iter().any(|b| *b != 0) {
            return Err(SignatureError::TrailingData);
        }

        let mut sig = [0u8; SIGNATURE_LEN];
        sig.copy_from_slice(&raw[len..sig_end]);
        self.key
            .verify(&raw[..len], &Signature::from_bytes(&sig))
            .map_err(|_| SignatureError::Invalid)?;
        Ok(len)
    }
}

/// Development builds: trusts the sentinel's `data_size` and ignores
/// anything after it.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsignedVerifier;

impl SignatureVerifier for UnsignedVerifier {
    fn verify(&self, raw: &[u8]) -> Result<usize, SignatureError> {
        payload_len(raw)
    }
}

/// Append an Ed25519 signature over `payload` made with `secret`.
pub fn sign_blob(secret: &[u8; 32], payload: &[u8]) -> Vec<u8> {
    let key = SigningKey::from_bytes(secret);
    let mut out = Vec::with_capacity(payload.len() + SIGNATURE_LEN);
    out.extend_from_slice(payload);
    out.extend_from_slice(&key.sign(payload).to_bytes());
    out
}

/// Public half of `secret`, for writing into `DEFEX_PUBLIC_KEY`.
pub fn public_key_for(secret: &[u8; 32]) -> [u8; 32] {
    SigningKey::from_bytes(secret).verifying_key().to_bytes()
}

/// Pick the verifier the configuration asks for. A missing key is an error
/// only when signatures are required.
pub fn from_config(config: &SignatureConfig) -> Result<Arc<dyn SignatureVerifier>, ConfigError> {
    match config.public_key_bytes()? {
        Some(key) => {
            let verifier = Ed25519Verifier::new(&key)
                .map_err(|e| ConfigError::InvalidPublicKey(e.to_string()))?;
            Ok(Arc::new(verifier))
        }
        None => {
            warn!("no public key configured, rule signatures are not checked");
            Ok(Arc::new(UnsignedVerifier))
        }
    }
}

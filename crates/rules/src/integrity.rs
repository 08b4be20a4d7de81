//! Content-hash checks for nodes marked `INTEGRITY_CHECK`.

use std::io::{self, Read};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::format::INTEGRITY_HASH_LEN;

/// Read granularity while hashing.
pub const CHUNK_SIZE: usize = 4096;

/// Stream `file` through SHA-256.
pub fn file_digest<R: Read + ?Sized>(file: &mut R) -> io::Result<[u8; INTEGRITY_HASH_LEN]> {
    let mut hasher = Sha256::new();
    let mut chunk = [0u8; CHUNK_SIZE];
    loop {
        let n = match file.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&chunk[..n]);
    }
    Ok(hasher.finalize().into())
}

/// Whether `file` hashes to `expected`.
///
/// An all-zero `expected` opts the node out and passes without reading.
/// A read error is a failure.
pub fn verify<R: Read + ?Sized>(file: &mut R, expected: &[u8; INTEGRITY_HASH_LEN]) -> bool {
    if expected.iter().all(|b| *b == 0) {
        return true;
    }
    match file_digest(file) {
        Ok(actual) => &actual == expected,
        Err(e) => {
            debug!(error = %e, "integrity read failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "device gone"))
        }
    }

    fn sha(data: &[u8]) -> [u8; 32] {
        Sha256::digest(data).into()
    }

    #[test]
    fn matching_content_passes() {
        let data = vec![0x5Au8; CHUNK_SIZE * 3 + 17];
        assert!(verify(&mut data.as_slice(), &sha(&data)));
    }

    #[test]
    fn different_content_fails() {
        let expected = sha(b"original");
        assert!(!verify(&mut &b"tampered"[..], &expected));
    }

    #[test]
    fn zero_hash_always_passes() {
        assert!(verify(&mut FailingReader, &[0u8; 32]));
    }

    #[test]
    fn read_error_fails() {
        assert!(!verify(&mut FailingReader, &sha(b"anything")));
    }

    #[test]
    fn empty_file_digest() {
        assert_eq!(file_digest(&mut io::empty()).unwrap(), sha(b""));
    }
}

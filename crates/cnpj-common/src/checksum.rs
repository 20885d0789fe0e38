//! Checksum utilities for file verification
//!
//! Downloaded archives are fingerprinted with SHA-256 so that resumed runs
//! can verify that a previously retrieved file is still the one the run
//! state describes.

use crate::error::{CommonError, Result};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Compute the SHA-256 checksum of a file, hex-encoded
pub fn sha256_file(path: impl AsRef<Path>) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    sha256_reader(&mut file)
}

/// Compute the SHA-256 checksum of any readable source, hex-encoded
pub fn sha256_reader<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Verify that a file matches an expected SHA-256 checksum
pub fn verify_sha256(path: impl AsRef<Path>, expected: &str) -> Result<()> {
    let actual = sha256_file(path)?;
    if actual == expected {
        Ok(())
    } else {
        Err(CommonError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

//! SHA-256 content digests in the `sha256:<hex>` form used by registries.

use std::io::{self, Read};

use sha2::{Digest, Sha256};

use crate::error::{OciError, Result};

pub const SHA256_PREFIX: &str = "sha256:";

/// Compute the `sha256:<hex>` digest of `data`.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("{}{}", SHA256_PREFIX, hex_encode(&Sha256::digest(data)))
}

/// Stream `reader` to the end and return its `sha256:<hex>` digest together
/// with the number of bytes read.
pub fn sha256_reader<R: Read>(mut reader: R) -> io::Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((
        format!("{}{}", SHA256_PREFIX, hex_encode(&hasher.finalize())),
        total,
    ))
}

/// Check that `data` hashes to `expected`.  Only `sha256` digests are
/// supported; anything else is reported as a mismatch.
pub fn verify(expected: &str, data: &[u8]) -> Result<()> {
    let actual = sha256_digest(data);
    if actual != expected {
        return Err(OciError::DigestMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

/// Extract the hex portion from a digest string like "sha256:abcdef…".
pub fn hex_part(digest: &str) -> &str {
    digest.strip_prefix(SHA256_PREFIX).unwrap_or(digest)
}

/// Returns `true` when `s` looks like `sha256:<64 lowercase hex chars>`.
pub fn is_sha256_digest(s: &str) -> bool {
    match s.strip_prefix(SHA256_PREFIX) {
        Some(hex) => {
            hex.len() == 64
                && hex
                    .bytes()
                    .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        }
        None => false,
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

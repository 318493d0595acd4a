//! Payload digests used for post-transfer verification.

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of a byte payload.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

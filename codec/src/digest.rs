use sha2::{Digest, Sha256};

/// Hex SHA-256 of an encoded blob.
#[must_use]
pub fn fingerprint(bytes: &[u8]) -> String {
    let hash = Sha256::digest(bytes);
    hash.iter().map(|b| format!("{b:02x}")).collect()
}

/// First 12 hex digits of [`fingerprint`], for log lines.
#[must_use]
pub fn short_fingerprint(bytes: &[u8]) -> String {
    let mut full = fingerprint(bytes);
    full.truncate(12);
    full
}

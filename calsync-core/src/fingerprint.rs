//! Content fingerprints for stored calendar documents.
//!
//! A fingerprint is the SHA-256 of the raw document bytes rendered as a
//! quoted lowercase hex string, so it can be sent verbatim as an HTTP
//! `ETag` and compared verbatim against `If-Match`.

use sha2::{Digest, Sha256};

/// Compute the fingerprint of `data`.
pub fn fingerprint(data: &[u8]) -> String {
    format!("\"{}\"", hex::encode(Sha256::digest(data)))
}

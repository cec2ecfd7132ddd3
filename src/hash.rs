//! xxHash-based fingerprints for plan nodes.
//!
//! Fingerprints are deterministic 64-bit hashes of a node's structural
//! signature. Compression buckets nodes by fingerprint before running the
//! (more expensive) recursive structural comparison.

use xxhash_rust::xxh64;

/// Fixed seed so fingerprints are stable across runs.
const SEED: u64 = 0x517cc1b727220a95;

/// Compute a 64-bit fingerprint of a text signature.
pub fn fingerprint(input: &str) -> u64 {
    xxh64::xxh64(input.as_bytes(), SEED)
}

/// Fingerprint an ordered list of parts.
///
/// Parts are joined with a record separator so `["ab", "c"]` and
/// `["a", "bc"]` hash differently. `None` parts hash as a NULL marker.
pub fn fingerprint_parts(parts: &[Option<&str>]) -> u64 {
    let mut combined = String::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            combined.push('\x1E');
        }
        match part {
            Some(val) => combined.push_str(val),
            None => combined.push_str("\x00NULL\x00"),
        }
    }
    fingerprint(&combined)
}

/// Combine a node's own fingerprint with the fingerprints of its
/// dependencies, in dependency order.
pub fn combine(own: u64, children: &[u64]) -> u64 {
    let mut bytes = Vec::with_capacity(8 * (children.len() + 1));
    bytes.extend_from_slice(&own.to_le_bytes());
    for child in children {
        bytes.extend_from_slice(&child.to_le_bytes());
    }
    xxh64::xxh64(&bytes, SEED)
}

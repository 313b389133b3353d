//! Hash-prefix partition tags.
//!
//! A partition tag is the first `n` lowercase hex characters of the SHA-256
//! digest of an identifier's canonical string form. Both the metadata store
//! (`uriBucket`) and byte storage (`storageBucket`) tag records with it so
//! independent workers can claim disjoint prefixes of the namespace and
//! scan it in parallel.

use sha2::{Digest, Sha256};

/// Length of an artifact's `uriBucket`: 16^5 buckets.
pub const URI_BUCKET_LENGTH: usize = 5;

/// Upper bound on the configurable `storageBucket` length.
pub const MAX_STORAGE_BUCKET_LENGTH: usize = 7;

/// The characters a partition tag is made of, in scan order.
pub const BUCKET_CHARS: &str = "0123456789abcdef";

/// Compute the `n`-character partition tag of `identifier`.
///
/// `n` is clamped to the 64 hex characters a SHA-256 digest provides.
pub fn partition(identifier: &str, n: usize) -> String {
    let digest = hex::encode(Sha256::digest(identifier.as_bytes()));
    digest[..n.min(digest.len())].to_string()
}

/// Whether `prefix` is a usable bucket prefix: lowercase hex only.
pub fn is_bucket_prefix(prefix: &str) -> bool {
    prefix.chars().all(|c| BUCKET_CHARS.contains(c))
}

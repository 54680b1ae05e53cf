//! Deterministic per-chunk citation anchors.
//!
//! An anchor identifies a chunk for deep-linking and must survive
//! re-chunking of unchanged content. It is derived purely from
//! `(content_id, heading_path, chunk_index)` — deliberately not from the
//! chunk text — so editing a chunk's wording keeps every anchor stable;
//! only structural changes (heading moves, reordering) invalidate anchors.
//!
//! Format: `<slug>-<index>-<hash8>`, where the slug comes from the deepest
//! active heading (or `section` when there is none) and the hash suffix is
//! the first 8 hex characters of a SHA-256 over the derivation tuple.

use sha2::{Digest, Sha256};

/// Derive the anchor for one chunk. Reproducible: the same inputs always
/// yield the same anchor.
pub fn derive_anchor(content_id: &str, heading_path: &[String], chunk_index: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content_id.as_bytes());
    for heading in heading_path {
        hasher.update([0u8]);
        hasher.update(heading.as_bytes());
    }
    hasher.update([0u8]);
    hasher.update(chunk_index.to_le_bytes());
    let digest = format!("{:x}", hasher.finalize());

    let slug = heading_path
        .last()
        .map(|h| slugify(h))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "section".to_string());

    format!("{}-{}-{}", slug, chunk_index, &digest[..8])
}

/// Lowercase ASCII slug, non-alphanumerics collapsed to single dashes,
/// truncated to 48 chars.
fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut last_dash = true;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug.truncate(48);
    slug
}

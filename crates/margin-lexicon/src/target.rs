//! Target URL normalization and hashing.
//!
//! The target hash is the key used for "records about this page" lookups, so two
//! spellings of the same page (scheme, host case, trailing slash) must hash equally.

use data_encoding::HEXLOWER;
use sha2::{Digest, Sha256};
use url::Url;

/// Normalize a source URL to `host[:port]/path[?query]` with one trailing slash removed.
pub fn normalize_url(raw: &str) -> String {
    let raw = raw.trim();
    let normalized = match Url::parse(raw) {
        Ok(url) if url.has_host() => {
            let mut out = url.host_str().unwrap_or_default().to_lowercase();
            if let Some(port) = url.port() {
                out.push(':');
                out.push_str(&port.to_string());
            }
            out.push_str(url.path());
            if let Some(query) = url.query().filter(|q| !q.is_empty()) {
                out.push('?');
                out.push_str(query);
            }
            out
        }
        _ => raw.to_lowercase(),
    };
    match normalized.strip_suffix('/') {
        Some(stripped) => stripped.to_string(),
        None => normalized,
    }
}

/// SHA-256 over the normalized URL, lowercase hex.
pub fn hash_url(raw: &str) -> String {
    hash_normalized(&normalize_url(raw))
}

pub(crate) fn hash_normalized(normalized: &str) -> String {
    HEXLOWER.encode(&Sha256::digest(normalized.as_bytes()))
}

/// Use the payload's precomputed hash when it has one, otherwise derive it.
pub fn resolve_target_hash(source: &str, precomputed: Option<&str>) -> String {
    match precomputed.map(str::trim).filter(|h| !h.is_empty()) {
        Some(hash) => hash.to_string(),
        None => hash_url(source),
    }
}

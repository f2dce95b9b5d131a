//! Content identifier verification for records fetched from remote repositories.
//!
//! A record's CID is computed over its canonical DAG-CBOR encoding, not its JSON text,
//! so verification rebuilds the IPLD tree from the parsed JSON ([`ipld::from_json`]),
//! encodes it, hashes it with SHA-256, wraps the digest as a CIDv1 and compares the
//! result with the claimed value.

pub mod error;
pub mod ipld;

pub use cid::Cid;
use multihash::{Code, MultihashDigest};
use serde_json::Value;

pub use error::{IntegrityError, Result};
pub use ipld::encode as encode_canonical;

/// Multicodec code of DAG-CBOR.
pub const DAG_CBOR: u64 = 0x71;

/// CIDv1 of DAG-CBOR encoded bytes, hashed with SHA-256.
pub fn cid_for_dag_cbor(bytes: &[u8]) -> Cid {
    Cid::new_v1(DAG_CBOR, Code::Sha2_256.digest(bytes))
}

/// Compute the CID a repository would assign to `value`.
pub fn compute_cid(value: &Value) -> Result<Cid> {
    Ok(cid_for_dag_cbor(&ipld::encode(value)?))
}

/// Verify a JSON payload against its claimed CID.
///
/// An empty `claimed` means verification was not requested and always passes.
pub fn verify(raw_json: &str, claimed: &str, uri: &str) -> Result<()> {
    if claimed.is_empty() {
        return Ok(());
    }
    let value: Value =
        serde_json::from_str(raw_json).map_err(|e| IntegrityError::InvalidJson(e.to_string()))?;
    verify_value(&value, claimed, uri)
}

/// Same as [`verify`] for an already parsed payload.
pub fn verify_value(value: &Value, claimed: &str, uri: &str) -> Result<()> {
    if claimed.is_empty() {
        return Ok(());
    }
    let computed = compute_cid(value)?.to_string();
    if computed == claimed {
        Ok(())
    } else {
        Err(IntegrityError::Mismatch {
            uri: uri.to_string(),
            expected: claimed.to_string(),
            computed,
        })
    }
}

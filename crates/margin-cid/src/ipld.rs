//! Conversion of JSON record values into the IPLD data model.
//!
//! Records travel as JSON, where links and byte strings are wrapped in single-key
//! objects (`{"$link": "bafy…"}` and `{"$bytes": "base64"}`). Those wrappers become
//! real IPLD links and bytes so the DAG-CBOR encoding matches what the repository
//! hashed.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use cid::Cid;
use libipld::prelude::Codec as _;
use libipld::{Ipld, IpldCodec};
use serde_json::{Map, Number, Value};

use crate::error::{IntegrityError, Result};

const LINK_KEY: &str = "$link";
const BYTES_KEY: &str = "$bytes";

/// Build the IPLD tree for a JSON value.
pub fn from_json(value: &Value) -> Result<Ipld> {
    Ok(match value {
        Value::Null => Ipld::Null,
        Value::Bool(b) => Ipld::Bool(*b),
        Value::Number(n) => number(n),
        Value::String(s) => Ipld::String(s.clone()),
        Value::Array(items) => Ipld::List(items.iter().map(from_json).collect::<Result<_>>()?),
        Value::Object(map) => object(map)?,
    })
}

/// Encode a JSON value as canonical DAG-CBOR.
pub fn encode(value: &Value) -> Result<Vec<u8>> {
    let ipld = from_json(value)?;
    IpldCodec::DagCbor
        .encode(&ipld)
        .map_err(|e| IntegrityError::Encode(e.to_string()))
}

fn number(n: &Number) -> Ipld {
    if let Some(u) = n.as_u64() {
        Ipld::Integer(i128::from(u))
    } else if let Some(i) = n.as_i64() {
        Ipld::Integer(i128::from(i))
    } else {
        Ipld::Float(n.as_f64().unwrap_or(f64::NAN))
    }
}

fn object(map: &Map<String, Value>) -> Result<Ipld> {
    if map.len() == 1 {
        if let Some(link) = map.get(LINK_KEY) {
            return link_value(link);
        }
        if let Some(bytes) = map.get(BYTES_KEY) {
            return bytes_value(bytes);
        }
    }

    let entries = map
        .iter()
        .map(|(k, v)| Ok((k.clone(), from_json(v)?)))
        .collect::<Result<BTreeMap<_, _>>>()?;
    Ok(Ipld::Map(entries))
}

fn link_value(link: &Value) -> Result<Ipld> {
    let text = link
        .as_str()
        .ok_or_else(|| IntegrityError::InvalidLink(link.to_string()))?;
    let cid = Cid::try_from(text).map_err(|e| IntegrityError::InvalidLink(e.to_string()))?;
    Ok(Ipld::Link(cid))
}

fn bytes_value(bytes: &Value) -> Result<Ipld> {
    let text = bytes
        .as_str()
        .ok_or_else(|| IntegrityError::InvalidBytes(bytes.to_string()))?;
    let decoded = STANDARD_NO_PAD
        .decode(text.trim_end_matches('='))
        .map_err(|e| IntegrityError::InvalidBytes(e.to_string()))?;
    Ok(Ipld::Bytes(decoded))
}

//! Immutable collection → decoder mapping shared by both ingestion paths.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::collection::Collection;
use crate::decode::{self, DecodeFn, RecordContext};
use crate::error::Result;
use crate::record::IndexedRecord;

/// Maps collection NSIDs to their decode function.
///
/// Built once and handed to the firehose consumer and the crawler; there is no
/// process-wide registration.
#[derive(Debug, Clone, Default)]
pub struct DecoderRegistry {
    decoders: BTreeMap<String, DecodeFn>,
}

impl DecoderRegistry {
    /// Create a new registry with no decoders.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry covering every collection in [`Collection::ALL`].
    pub fn standard() -> Self {
        Collection::ALL
            .iter()
            .fold(Self::new(), |registry, collection| {
                registry.with(collection.nsid(), decoder_for(*collection))
            })
    }

    /// Register `decode` for `nsid`, replacing any earlier decoder.
    pub fn with(mut self, nsid: impl Into<String>, decode: DecodeFn) -> Self {
        self.decoders.insert(nsid.into(), decode);
        self
    }

    /// Whether a decoder is registered for `nsid`.
    pub fn handles(&self, nsid: &str) -> bool {
        self.decoders.contains_key(nsid)
    }

    /// Registered NSIDs in sorted order.
    pub fn collections(&self) -> impl Iterator<Item = &str> {
        self.decoders.keys().map(String::as_str)
    }

    /// Number of registered collections.
    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Decode a payload for the collection named in `ctx`.
    ///
    /// Collections without a decoder are ignored and yield `Ok(None)`.
    pub fn decode(&self, ctx: &RecordContext, value: &Value) -> Result<Option<IndexedRecord>> {
        match self.decoders.get(&ctx.uri.collection) {
            Some(decode) => decode(ctx, value).map(Some),
            None => Ok(None),
        }
    }
}

fn decoder_for(collection: Collection) -> DecodeFn {
    match collection {
        Collection::Annotation => decode::decode_annotation,
        Collection::Highlight => decode::decode_highlight,
        Collection::Bookmark => decode::decode_bookmark,
        Collection::Reply => decode::decode_reply,
        Collection::Like => decode::decode_like,
        Collection::Collection => decode::decode_collection,
        Collection::CollectionItem => decode::decode_collection_item,
        Collection::Profile => decode::decode_profile,
        Collection::ApiKey => decode::decode_api_key,
        Collection::Preferences => decode::decode_preferences,
        Collection::Card | Collection::LegacyCard => decode::decode_card,
    }
}

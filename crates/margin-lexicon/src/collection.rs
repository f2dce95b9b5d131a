//! Collection NSIDs and AT-URI helpers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The fixed set of collection types mirrored into the local index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Collection {
    Annotation,
    Highlight,
    Bookmark,
    Reply,
    Like,
    Collection,
    CollectionItem,
    Profile,
    ApiKey,
    Preferences,
    /// Third-party card record (`NOTE` or `URL` content).
    Card,
    /// Same schema as [`Collection::Card`] under the older namespace.
    LegacyCard,
}

impl Collection {
    /// Every collection, in registration order.
    pub const ALL: [Collection; 12] = [
        Collection::Annotation,
        Collection::Highlight,
        Collection::Bookmark,
        Collection::Reply,
        Collection::Like,
        Collection::Collection,
        Collection::CollectionItem,
        Collection::Profile,
        Collection::ApiKey,
        Collection::Preferences,
        Collection::Card,
        Collection::LegacyCard,
    ];

    /// Namespaced identifier used in record URIs and the firehose filter.
    pub fn nsid(&self) -> &'static str {
        match self {
            Collection::Annotation => "at.margin.annotation",
            Collection::Highlight => "at.margin.highlight",
            Collection::Bookmark => "at.margin.bookmark",
            Collection::Reply => "at.margin.reply",
            Collection::Like => "at.margin.like",
            Collection::Collection => "at.margin.collection",
            Collection::CollectionItem => "at.margin.collectionItem",
            Collection::Profile => "at.margin.profile",
            Collection::ApiKey => "at.margin.apikey",
            Collection::Preferences => "at.margin.preferences",
            Collection::Card => "network.cosmik.card",
            Collection::LegacyCard => "app.semble.card",
        }
    }

    /// Look up a collection by its NSID.
    pub fn from_nsid(nsid: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.nsid() == nsid)
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.nsid())
    }
}

/// A parsed `at://{did}/{collection}/{rkey}` record URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AtUri {
    pub did: String,
    pub collection: String,
    pub rkey: String,
}

impl AtUri {
    pub fn new(
        did: impl Into<String>,
        collection: impl Into<String>,
        rkey: impl Into<String>,
    ) -> Self {
        Self {
            did: did.into(),
            collection: collection.into(),
            rkey: rkey.into(),
        }
    }

    /// Parse a record URI. Returns `None` unless all three segments are present.
    pub fn parse(uri: &str) -> Option<Self> {
        let rest = uri.strip_prefix("at://")?;
        let mut parts = rest.splitn(3, '/');
        let did = parts.next().filter(|s| !s.is_empty())?;
        let collection = parts.next().filter(|s| !s.is_empty())?;
        let rkey = parts.next().filter(|s| !s.is_empty() && !s.contains('/'))?;
        Some(Self::new(did, collection, rkey))
    }
}

impl fmt::Display for AtUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at://{}/{}/{}", self.did, self.collection, self.rkey)
    }
}

//! Canonical local record shapes produced by the decoders.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A record as stored in the local index, keyed by `uri`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedRecord {
    pub uri: String,
    pub author_did: String,
    /// NSID taken from the record URI (not the local shape).
    pub collection: String,
    pub rkey: String,
    pub cid: Option<String>,
    pub target_source: Option<String>,
    pub target_hash: Option<String>,
    pub subject_uri: Option<String>,
    pub body: RecordBody,
    pub created_at: DateTime<Utc>,
    pub indexed_at: DateTime<Utc>,
}

/// Shape of the stored body.
impl IndexedRecord {
    pub fn kind(&self) -> RecordKind {
        self.body.kind()
    }
}

/// Local shape of a record. Third-party card content is normalized into
/// `Annotation` (notes) or `Bookmark` (links).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RecordBody {
    Annotation(Annotation),
    Highlight(Highlight),
    Bookmark(Bookmark),
    Reply(Reply),
    Like(Like),
    Collection(CollectionEntry),
    CollectionItem(CollectionItem),
    Profile(Profile),
    ApiKey(ApiKey),
    Preferences(Preferences),
}

impl RecordBody {
    pub fn kind(&self) -> RecordKind {
        match self {
            RecordBody::Annotation(_) => RecordKind::Annotation,
            RecordBody::Highlight(_) => RecordKind::Highlight,
            RecordBody::Bookmark(_) => RecordKind::Bookmark,
            RecordBody::Reply(_) => RecordKind::Reply,
            RecordBody::Like(_) => RecordKind::Like,
            RecordBody::Collection(_) => RecordKind::Collection,
            RecordBody::CollectionItem(_) => RecordKind::CollectionItem,
            RecordBody::Profile(_) => RecordKind::Profile,
            RecordBody::ApiKey(_) => RecordKind::ApiKey,
            RecordBody::Preferences(_) => RecordKind::Preferences,
        }
    }
}

/// Discriminant of [`RecordBody`], used for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordKind {
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
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Annotation => "annotation",
            RecordKind::Highlight => "highlight",
            RecordKind::Bookmark => "bookmark",
            RecordKind::Reply => "reply",
            RecordKind::Like => "like",
            RecordKind::Collection => "collection",
            RecordKind::CollectionItem => "collectionItem",
            RecordKind::Profile => "profile",
            RecordKind::ApiKey => "apiKey",
            RecordKind::Preferences => "preferences",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    pub motivation: String,
    pub body_value: Option<String>,
    pub body_format: String,
    pub body_uri: Option<String>,
    pub target_title: Option<String>,
    pub selector: Option<serde_json::Value>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Highlight {
    pub motivation: String,
    pub target_title: Option<String>,
    pub selector: Option<serde_json::Value>,
    pub color: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bookmark {
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    pub parent_uri: String,
    pub parent_cid: Option<String>,
    pub root_uri: String,
    pub root_cid: Option<String>,
    pub text: String,
    pub format: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Like {
    pub subject_cid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionEntry {
    pub name: String,
    pub description: Option<String>,
    pub icon: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionItem {
    pub collection_uri: String,
    pub position: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub display_name: Option<String>,
    pub description: Option<String>,
    /// CID of the avatar blob, when set.
    pub avatar: Option<String>,
    pub website: Option<String>,
    pub links: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKey {
    pub name: String,
    pub key_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    pub external_link_skipped_hostnames: Vec<String>,
}

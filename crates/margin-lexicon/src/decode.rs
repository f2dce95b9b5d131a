//! Per-collection decoding rules from raw record payloads to [`IndexedRecord`]s.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::collection::AtUri;
use crate::error::{DecodeError, Result};
use crate::record::{
    Annotation, ApiKey, Bookmark, CollectionEntry, CollectionItem, Highlight, IndexedRecord,
    Like, Preferences, Profile, RecordBody, Reply,
};
use crate::target::resolve_target_hash;

pub const DEFAULT_MOTIVATION: &str = "commenting";
pub const HIGHLIGHT_MOTIVATION: &str = "highlighting";
pub const DEFAULT_FORMAT: &str = "text/plain";

/// Signature shared by every per-collection decoder.
pub type DecodeFn = fn(&RecordContext, &Value) -> Result<IndexedRecord>;

/// Identity of the record being decoded, supplied by the ingestion path.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordContext {
    pub uri: AtUri,
    pub cid: Option<String>,
    pub indexed_at: DateTime<Utc>,
}

impl RecordContext {
    /// Create a new context stamped with the current time. An empty `cid` counts as absent.
    pub fn new(did: &str, collection: &str, rkey: &str, cid: Option<&str>) -> Self {
        Self {
            uri: AtUri::new(did, collection, rkey),
            cid: cid.filter(|c| !c.is_empty()).map(str::to_string),
            indexed_at: Utc::now(),
        }
    }

    fn collection(&self) -> &str {
        &self.uri.collection
    }

    fn parse<T: DeserializeOwned>(&self, value: &Value) -> Result<T> {
        T::deserialize(value).map_err(|e| DecodeError::Malformed {
            collection: self.collection().to_string(),
            message: e.to_string(),
        })
    }

    fn required(&self, field: &'static str, value: Option<String>) -> Result<String> {
        match value {
            Some(v) if !v.trim().is_empty() => Ok(v),
            _ => Err(DecodeError::MissingField {
                collection: self.collection().to_string(),
                field,
            }),
        }
    }

    fn created_at(&self, raw: Option<&str>) -> DateTime<Utc> {
        raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or(self.indexed_at)
    }

    fn record(&self, body: RecordBody, created_at: Option<&str>) -> IndexedRecord {
        IndexedRecord {
            uri: self.uri.to_string(),
            author_did: self.uri.did.clone(),
            collection: self.uri.collection.clone(),
            rkey: self.uri.rkey.clone(),
            cid: self.cid.clone(),
            target_source: None,
            target_hash: None,
            subject_uri: None,
            body,
            created_at: self.created_at(created_at),
            indexed_at: self.indexed_at,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetPayload {
    source: Option<String>,
    source_hash: Option<String>,
    title: Option<String>,
    selector: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StrongRef {
    uri: Option<String>,
    cid: Option<String>,
}

struct ResolvedTarget {
    source: String,
    hash: String,
    title: Option<String>,
    selector: Option<Value>,
}

fn resolve_target(ctx: &RecordContext, target: Option<TargetPayload>) -> Result<ResolvedTarget> {
    let target = target.ok_or_else(|| DecodeError::MissingField {
        collection: ctx.collection().to_string(),
        field: "target",
    })?;
    let source = ctx.required("target.source", target.source)?;
    let hash = resolve_target_hash(&source, target.source_hash.as_deref());
    Ok(ResolvedTarget {
        source,
        hash,
        title: target.title,
        selector: target.selector,
    })
}

fn non_empty_or(value: Option<String>, default: &str) -> String {
    value
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotationPayload {
    motivation: Option<String>,
    body: Option<AnnotationBodyPayload>,
    target: Option<TargetPayload>,
    tags: Option<Vec<String>>,
    created_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnnotationBodyPayload {
    value: Option<String>,
    format: Option<String>,
    uri: Option<String>,
}

/// `at.margin.annotation`: requires `target.source`; motivation and body format default.
pub fn decode_annotation(ctx: &RecordContext, value: &Value) -> Result<IndexedRecord> {
    let payload: AnnotationPayload = ctx.parse(value)?;
    let target = resolve_target(ctx, payload.target)?;
    let (body_value, body_format, body_uri) = match payload.body {
        Some(body) => (body.value, body.format, body.uri),
        None => (None, None, None),
    };

    let mut record = ctx.record(
        RecordBody::Annotation(Annotation {
            motivation: non_empty_or(payload.motivation, DEFAULT_MOTIVATION),
            body_value,
            body_format: non_empty_or(body_format, DEFAULT_FORMAT),
            body_uri,
            target_title: target.title,
            selector: target.selector,
            tags: payload.tags.unwrap_or_default(),
        }),
        payload.created_at.as_deref(),
    );
    record.target_source = Some(target.source);
    record.target_hash = Some(target.hash);
    Ok(record)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HighlightPayload {
    target: Option<TargetPayload>,
    color: Option<String>,
    tags: Option<Vec<String>>,
    created_at: Option<String>,
}

/// `at.margin.highlight`: requires `target.source`.
pub fn decode_highlight(ctx: &RecordContext, value: &Value) -> Result<IndexedRecord> {
    let payload: HighlightPayload = ctx.parse(value)?;
    let target = resolve_target(ctx, payload.target)?;

    let mut record = ctx.record(
        RecordBody::Highlight(Highlight {
            motivation: HIGHLIGHT_MOTIVATION.to_string(),
            target_title: target.title,
            selector: target.selector,
            color: payload.color,
            tags: payload.tags.unwrap_or_default(),
        }),
        payload.created_at.as_deref(),
    );
    record.target_source = Some(target.source);
    record.target_hash = Some(target.hash);
    Ok(record)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BookmarkPayload {
    source: Option<String>,
    source_hash: Option<String>,
    title: Option<String>,
    description: Option<String>,
    tags: Option<Vec<String>>,
    created_at: Option<String>,
}

/// `at.margin.bookmark`: requires `source`, deriving the hash when it is missing.
pub fn decode_bookmark(ctx: &RecordContext, value: &Value) -> Result<IndexedRecord> {
    let payload: BookmarkPayload = ctx.parse(value)?;
    let source = ctx.required("source", payload.source)?;
    let hash = resolve_target_hash(&source, payload.source_hash.as_deref());

    let mut record = ctx.record(
        RecordBody::Bookmark(Bookmark {
            title: payload.title,
            description: payload.description,
            tags: payload.tags.unwrap_or_default(),
        }),
        payload.created_at.as_deref(),
    );
    record.target_source = Some(source);
    record.target_hash = Some(hash);
    Ok(record)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplyPayload {
    parent: Option<StrongRef>,
    root: Option<StrongRef>,
    text: Option<String>,
    format: Option<String>,
    created_at: Option<String>,
}

/// `at.margin.reply`: requires `parent.uri`, `root.uri` and `text`.
pub fn decode_reply(ctx: &RecordContext, value: &Value) -> Result<IndexedRecord> {
    let payload: ReplyPayload = ctx.parse(value)?;
    let (parent_uri, parent_cid) = strong_ref(ctx, "parent.uri", payload.parent)?;
    let (root_uri, root_cid) = strong_ref(ctx, "root.uri", payload.root)?;
    let text = ctx.required("text", payload.text)?;

    let mut record = ctx.record(
        RecordBody::Reply(Reply {
            parent_uri: parent_uri.clone(),
            parent_cid,
            root_uri,
            root_cid,
            text,
            format: non_empty_or(payload.format, DEFAULT_FORMAT),
        }),
        payload.created_at.as_deref(),
    );
    record.subject_uri = Some(parent_uri);
    Ok(record)
}

fn strong_ref(
    ctx: &RecordContext,
    field: &'static str,
    reference: Option<StrongRef>,
) -> Result<(String, Option<String>)> {
    let (uri, cid) = match reference {
        Some(r) => (r.uri, r.cid),
        None => (None, None),
    };
    Ok((ctx.required(field, uri)?, cid))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LikePayload {
    subject: Option<StrongRef>,
    created_at: Option<String>,
}

/// `at.margin.like`: requires `subject.uri`.
pub fn decode_like(ctx: &RecordContext, value: &Value) -> Result<IndexedRecord> {
    let payload: LikePayload = ctx.parse(value)?;
    let (subject_uri, subject_cid) = strong_ref(ctx, "subject.uri", payload.subject)?;

    let mut record = ctx.record(
        RecordBody::Like(Like { subject_cid }),
        payload.created_at.as_deref(),
    );
    record.subject_uri = Some(subject_uri);
    Ok(record)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CollectionPayload {
    name: Option<String>,
    description: Option<String>,
    icon: Option<String>,
    created_at: Option<String>,
}

pub fn decode_collection(ctx: &RecordContext, value: &Value) -> Result<IndexedRecord> {
    let payload: CollectionPayload = ctx.parse(value)?;
    let name = ctx.required("name", payload.name)?;

    Ok(ctx.record(
        RecordBody::Collection(CollectionEntry {
            name,
            description: payload.description,
            icon: payload.icon,
        }),
        payload.created_at.as_deref(),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CollectionItemPayload {
    collection: Option<String>,
    annotation: Option<String>,
    position: Option<i64>,
    created_at: Option<String>,
}

pub fn decode_collection_item(ctx: &RecordContext, value: &Value) -> Result<IndexedRecord> {
    let payload: CollectionItemPayload = ctx.parse(value)?;
    let collection_uri = ctx.required("collection", payload.collection)?;
    let annotation_uri = ctx.required("annotation", payload.annotation)?;

    let mut record = ctx.record(
        RecordBody::CollectionItem(CollectionItem {
            collection_uri,
            position: payload.position,
        }),
        payload.created_at.as_deref(),
    );
    record.subject_uri = Some(annotation_uri);
    Ok(record)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfilePayload {
    display_name: Option<String>,
    description: Option<String>,
    avatar: Option<Value>,
    website: Option<String>,
    links: Option<Vec<String>>,
    created_at: Option<String>,
}

pub fn decode_profile(ctx: &RecordContext, value: &Value) -> Result<IndexedRecord> {
    let payload: ProfilePayload = ctx.parse(value)?;
    let avatar = payload
        .avatar
        .as_ref()
        .and_then(|blob| blob.pointer("/ref/$link"))
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(ctx.record(
        RecordBody::Profile(Profile {
            display_name: payload.display_name,
            description: payload.description,
            avatar,
            website: payload.website,
            links: payload.links.unwrap_or_default(),
        }),
        payload.created_at.as_deref(),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiKeyPayload {
    name: Option<String>,
    key_hash: Option<String>,
    created_at: Option<String>,
}

/// `at.margin.apikey`: only the key hash is ever stored.
pub fn decode_api_key(ctx: &RecordContext, value: &Value) -> Result<IndexedRecord> {
    let payload: ApiKeyPayload = ctx.parse(value)?;
    let name = ctx.required("name", payload.name)?;
    let key_hash = ctx.required("keyHash", payload.key_hash)?;

    Ok(ctx.record(
        RecordBody::ApiKey(ApiKey { name, key_hash }),
        payload.created_at.as_deref(),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreferencesPayload {
    external_link_skipped_hostnames: Option<Vec<String>>,
    created_at: Option<String>,
}

pub fn decode_preferences(ctx: &RecordContext, value: &Value) -> Result<IndexedRecord> {
    let payload: PreferencesPayload = ctx.parse(value)?;

    Ok(ctx.record(
        RecordBody::Preferences(Preferences {
            external_link_skipped_hostnames: payload
                .external_link_skipped_hostnames
                .unwrap_or_default(),
        }),
        payload.created_at.as_deref(),
    ))
}

/// Inner content of a third-party card, resolved from its `type` discriminant.
#[derive(Debug, Clone, PartialEq)]
pub enum CardContent {
    Note(NoteContent),
    Url(UrlContent),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NoteContent {
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UrlContent {
    pub url: Option<String>,
    pub metadata: Option<UrlMetadata>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UrlMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
}

impl CardContent {
    /// Pick the content shape named by the card's `type` field.
    pub fn resolve(ctx: &RecordContext, kind: &str, content: &Value) -> Result<Self> {
        match kind {
            "NOTE" => Ok(CardContent::Note(ctx.parse(content)?)),
            "URL" => Ok(CardContent::Url(ctx.parse(content)?)),
            other => Err(DecodeError::UnknownContentType(other.to_string())),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CardPayload {
    #[serde(rename = "type")]
    kind: Option<String>,
    content: Option<Value>,
    url: Option<String>,
    parent_card: Option<StrongRef>,
    created_at: Option<String>,
}

/// Cards are normalized so that consumers never see their third-party origin:
/// notes become annotations, links become bookmarks.
pub fn decode_card(ctx: &RecordContext, value: &Value) -> Result<IndexedRecord> {
    let payload: CardPayload = ctx.parse(value)?;
    let kind = ctx.required("type", payload.kind)?;
    let content = payload.content.ok_or_else(|| DecodeError::MissingField {
        collection: ctx.collection().to_string(),
        field: "content",
    })?;

    match CardContent::resolve(ctx, &kind, &content)? {
        CardContent::Note(note) => {
            let text = ctx.required("content.text", note.text)?;
            let source = payload.url.filter(|u| !u.trim().is_empty());
            let mut record = ctx.record(
                RecordBody::Annotation(Annotation {
                    motivation: DEFAULT_MOTIVATION.to_string(),
                    body_value: Some(text),
                    body_format: DEFAULT_FORMAT.to_string(),
                    body_uri: None,
                    target_title: None,
                    selector: None,
                    tags: Vec::new(),
                }),
                payload.created_at.as_deref(),
            );
            record.target_hash = source.as_deref().map(|s| resolve_target_hash(s, None));
            record.target_source = source;
            record.subject_uri = payload.parent_card.and_then(|p| p.uri);
            Ok(record)
        }
        CardContent::Url(link) => {
            let source = link
                .url
                .filter(|u| !u.trim().is_empty())
                .or(payload.url.filter(|u| !u.trim().is_empty()));
            let source = ctx.required("content.url", source)?;
            let (title, description) = match link.metadata {
                Some(meta) => (meta.title, meta.description),
                None => (None, None),
            };
            let mut record = ctx.record(
                RecordBody::Bookmark(Bookmark {
                    title,
                    description,
                    tags: Vec::new(),
                }),
                payload.created_at.as_deref(),
            );
            record.target_hash = Some(resolve_target_hash(&source, None));
            record.target_source = Some(source);
            Ok(record)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordKind;
    use crate::target::{hash_normalized, hash_url};
    use serde_json::json;

    fn ctx(collection: &str) -> RecordContext {
        RecordContext::new("did:plc:alice", collection, "3kxyz", Some("bafyfake"))
    }

    #[test]
    fn bookmark_without_hash_derives_it_from_source() {
        let record = decode_bookmark(
            &ctx("at.margin.bookmark"),
            &json!({"source": "https://example.com/a", "sourceHash": "", "title": "A"}),
        )
        .expect("decode");

        assert_eq!(record.uri, "at://did:plc:alice/at.margin.bookmark/3kxyz");
        assert_eq!(record.target_hash.as_deref(), Some(hash_normalized("example.com/a").as_str()));
        assert_eq!(record.target_source.as_deref(), Some("https://example.com/a"));
        assert_eq!(record.kind(), RecordKind::Bookmark);
        assert_eq!(record.cid.as_deref(), Some("bafyfake"));
    }

    #[test]
    fn bookmark_requires_source() {
        let err = decode_bookmark(&ctx("at.margin.bookmark"), &json!({"title": "A"}))
            .expect_err("missing source");
        assert_eq!(
            err,
            DecodeError::MissingField {
                collection: "at.margin.bookmark".into(),
                field: "source"
            }
        );
    }

    #[test]
    fn annotation_defaults_motivation_and_format() {
        let record = decode_annotation(
            &ctx("at.margin.annotation"),
            &json!({
                "motivation": "",
                "body": {"value": "nice"},
                "target": {"source": "https://example.com/a", "sourceHash": "precomputed"},
                "createdAt": "2024-05-01T10:00:00Z"
            }),
        )
        .expect("decode");

        let RecordBody::Annotation(body) = &record.body else {
            panic!("expected annotation, got {:?}", record.body);
        };
        assert_eq!(body.motivation, DEFAULT_MOTIVATION);
        assert_eq!(body.body_format, DEFAULT_FORMAT);
        assert_eq!(body.body_value.as_deref(), Some("nice"));
        assert_eq!(record.target_hash.as_deref(), Some("precomputed"));
        assert_eq!(record.created_at.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }

    #[test]
    fn annotation_without_target_is_rejected() {
        let err = decode_annotation(&ctx("at.margin.annotation"), &json!({"body": {}}))
            .expect_err("missing target");
        assert!(matches!(err, DecodeError::MissingField { field: "target", .. }));
    }

    #[test]
    fn type_mismatch_is_malformed() {
        let err = decode_annotation(&ctx("at.margin.annotation"), &json!({"tags": "oops"}))
            .expect_err("tags must be a list");
        assert!(matches!(err, DecodeError::Malformed { .. }));
    }

    #[test]
    fn invalid_created_at_falls_back_to_indexed_at() {
        let context = ctx("at.margin.collection");
        let record = decode_collection(
            &context,
            &json!({"name": "Reading", "createdAt": "yesterday"}),
        )
        .expect("decode");
        assert_eq!(record.created_at, context.indexed_at);
    }

    #[test]
    fn highlight_motivation_is_fixed() {
        let record = decode_highlight(
            &ctx("at.margin.highlight"),
            &json!({"target": {"source": "https://example.com/"}, "color": "yellow"}),
        )
        .expect("decode");
        let RecordBody::Highlight(body) = &record.body else {
            panic!("expected highlight");
        };
        assert_eq!(body.motivation, HIGHLIGHT_MOTIVATION);
        assert_eq!(body.color.as_deref(), Some("yellow"));
        assert_eq!(record.target_hash, Some(hash_url("https://example.com")));
    }

    #[test]
    fn reply_points_at_parent() {
        let record = decode_reply(
            &ctx("at.margin.reply"),
            &json!({
                "parent": {"uri": "at://did:plc:bob/at.margin.annotation/1", "cid": "bafyparent"},
                "root": {"uri": "at://did:plc:bob/at.margin.annotation/1", "cid": "bafyparent"},
                "text": "agreed"
            }),
        )
        .expect("decode");
        assert_eq!(
            record.subject_uri.as_deref(),
            Some("at://did:plc:bob/at.margin.annotation/1")
        );
    }

    #[test]
    fn like_requires_subject_uri() {
        let err = decode_like(&ctx("at.margin.like"), &json!({"subject": {"cid": "x"}}))
            .expect_err("missing subject uri");
        assert!(matches!(err, DecodeError::MissingField { field: "subject.uri", .. }));
    }

    #[test]
    fn profile_keeps_avatar_link() {
        let record = decode_profile(
            &ctx("at.margin.profile"),
            &json!({
                "displayName": "Alice",
                "avatar": {"$type": "blob", "ref": {"$link": "bafkavatar"}, "mimeType": "image/png", "size": 10}
            }),
        )
        .expect("decode");
        let RecordBody::Profile(profile) = &record.body else {
            panic!("expected profile");
        };
        assert_eq!(profile.avatar.as_deref(), Some("bafkavatar"));
        assert!(profile.links.is_empty());
    }

    #[test]
    fn api_key_requires_hash() {
        let err = decode_api_key(&ctx("at.margin.apikey"), &json!({"name": "cli"}))
            .expect_err("missing key hash");
        assert!(matches!(err, DecodeError::MissingField { field: "keyHash", .. }));
    }

    #[test]
    fn note_card_becomes_annotation() {
        let record = decode_card(
            &ctx("network.cosmik.card"),
            &json!({
                "type": "NOTE",
                "content": {"$type": "network.cosmik.card#noteContent", "text": "worth reading"},
                "url": "https://example.com/a",
                "parentCard": {"uri": "at://did:plc:alice/network.cosmik.card/parent", "cid": "bafyp"}
            }),
        )
        .expect("decode");

        assert_eq!(record.kind(), RecordKind::Annotation);
        assert_eq!(record.collection, "network.cosmik.card");
        assert_eq!(record.target_hash, Some(hash_url("https://example.com/a")));
        assert_eq!(
            record.subject_uri.as_deref(),
            Some("at://did:plc:alice/network.cosmik.card/parent")
        );
        let RecordBody::Annotation(body) = &record.body else {
            panic!("expected annotation");
        };
        assert_eq!(body.body_value.as_deref(), Some("worth reading"));
        assert_eq!(body.motivation, DEFAULT_MOTIVATION);
    }

    #[test]
    fn url_card_becomes_bookmark() {
        let record = decode_card(
            &ctx("app.semble.card"),
            &json!({
                "type": "URL",
                "content": {"url": "https://example.com/b", "metadata": {"title": "B"}}
            }),
        )
        .expect("decode");

        assert_eq!(record.kind(), RecordKind::Bookmark);
        assert_eq!(record.target_source.as_deref(), Some("https://example.com/b"));
        let RecordBody::Bookmark(body) = &record.body else {
            panic!("expected bookmark");
        };
        assert_eq!(body.title.as_deref(), Some("B"));
    }

    #[test]
    fn url_card_falls_back_to_top_level_url() {
        let record = decode_card(
            &ctx("network.cosmik.card"),
            &json!({"type": "URL", "content": {}, "url": "https://example.com/c"}),
        )
        .expect("decode");
        assert_eq!(record.target_source.as_deref(), Some("https://example.com/c"));
    }

    #[test]
    fn unknown_card_type_is_rejected() {
        let err = decode_card(
            &ctx("network.cosmik.card"),
            &json!({"type": "VIDEO", "content": {}}),
        )
        .expect_err("unknown type");
        assert_eq!(err, DecodeError::UnknownContentType("VIDEO".into()));
    }

    #[test]
    fn blank_content_url_falls_back_to_top_level_url() {
        let record = decode_card(
            &ctx("network.cosmik.card"),
            &json!({"type": "URL", "content": {"url": "  "}, "url": "https://example.com/d"}),
        )
        .expect("decode");
        assert_eq!(record.target_source.as_deref(), Some("https://example.com/d"));
        assert_eq!(record.target_hash, Some(hash_url("https://example.com/d")));

        let err = decode_card(
            &ctx("network.cosmik.card"),
            &json!({"type": "URL", "content": {"url": ""}, "url": ""}),
        )
        .expect_err("no usable url");
        assert!(matches!(err, DecodeError::MissingField { field: "content.url", .. }));
    }
}

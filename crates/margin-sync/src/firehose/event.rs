//! Jetstream frame parsing.

use margin_lexicon::AtUri;
use serde::Deserialize;
use serde_json::Value;

/// Kind of repository write carried by a commit frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    /// Wire name of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

#[derive(Debug, Deserialize)]
struct Frame {
    did: String,
    #[serde(default)]
    time_us: i64,
    kind: String,
    #[serde(default)]
    commit: Option<CommitPayload>,
}

#[derive(Debug, Deserialize)]
struct CommitPayload {
    #[serde(default)]
    rev: String,
    operation: Operation,
    collection: String,
    rkey: String,
    #[serde(default)]
    record: Option<Value>,
    #[serde(default)]
    cid: Option<String>,
}

/// One repository write.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitEvent {
    pub did: String,
    pub time_us: i64,
    pub rev: String,
    pub operation: Operation,
    pub collection: String,
    pub rkey: String,
    pub record: Option<Value>,
    pub cid: Option<String>,
}

impl CommitEvent {
    /// AT-URI of the written record.
    pub fn uri(&self) -> String {
        AtUri::new(&self.did, &self.collection, &self.rkey).to_string()
    }
}

/// A parsed Jetstream frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FirehoseEvent {
    Commit(CommitEvent),
    /// Identity and account frames. Only their timestamp matters here.
    Other { did: String, kind: String, time_us: i64 },
}

impl FirehoseEvent {
    /// Stream position of the frame, in microseconds.
    pub fn time_us(&self) -> i64 {
        match self {
            FirehoseEvent::Commit(commit) => commit.time_us,
            FirehoseEvent::Other { time_us, .. } => *time_us,
        }
    }
}

/// A frame that is not usable JSON or lacks its commit payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame: {0}")]
    Invalid(String),

    #[error("commit frame without commit payload")]
    MissingCommit,
}

/// Parse one text frame from the stream.
pub fn parse_frame(text: &str) -> Result<FirehoseEvent, FrameError> {
    let frame: Frame = serde_json::from_str(text).map_err(|e| FrameError::Invalid(e.to_string()))?;
    if frame.kind != "commit" {
        return Ok(FirehoseEvent::Other {
            did: frame.did,
            kind: frame.kind,
            time_us: frame.time_us,
        });
    }

    let commit = frame.commit.ok_or(FrameError::MissingCommit)?;
    Ok(FirehoseEvent::Commit(CommitEvent {
        did: frame.did,
        time_us: frame.time_us,
        rev: commit.rev,
        operation: commit.operation,
        collection: commit.collection,
        rkey: commit.rkey,
        record: commit.record,
        cid: commit.cid.filter(|c| !c.is_empty()),
    }))
}

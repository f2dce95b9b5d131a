use margin_lexicon::DecodeError;

/// Dialing or reading the event stream failed. Always retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("invalid firehose url: {0}")]
    InvalidUrl(String),

    #[error("connection timed out")]
    Timeout,

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("stream read failed: {0}")]
    Read(String),
}

/// A page of the remote listing could not be fetched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ListingError {
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("{url} returned {status}: {body}")]
    Status { url: String, status: u16, body: String },

    #[error("invalid listing response from {url}: {message}")]
    Body { url: String, message: String },

    #[error("no repository client available for {0}")]
    NoClient(String),

    #[error("listing of {collection} revisited cursor {cursor}")]
    CursorCycle { collection: String, cursor: String },
}

/// A whole reconciliation pass could not start.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("cannot sync {did}: {source}")]
    Client {
        did: String,
        #[source]
        source: ListingError,
    },
}

/// A non-fatal ingestion failure, reported alongside the log line so callers can count
/// or assert on failures.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestFailure {
    MalformedFrame { reason: String },
    Decode { uri: String, error: DecodeError },
    Index { uri: String, message: String },
    Cursor { cursor: i64, message: String },
    Connect { error: ConnectError },
}

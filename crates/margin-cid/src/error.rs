/// Failures while recomputing or comparing a record's content identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrityError {
    #[error("cid mismatch for {uri}: expected {expected}, computed {computed}")]
    Mismatch {
        uri: String,
        expected: String,
        computed: String,
    },

    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("invalid $link value: {0}")]
    InvalidLink(String),

    #[error("invalid $bytes value: {0}")]
    InvalidBytes(String),

    #[error("payload cannot be encoded as dag-cbor: {0}")]
    Encode(String),
}

pub type Result<T> = std::result::Result<T, IntegrityError>;

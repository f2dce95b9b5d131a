/// Why a raw payload could not be turned into an [`crate::IndexedRecord`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed {collection} record: {message}")]
    Malformed { collection: String, message: String },

    #[error("missing required field `{field}` in {collection} record")]
    MissingField {
        collection: String,
        field: &'static str,
    },

    #[error("unknown card content type `{0}`")]
    UnknownContentType(String),

    #[error("{operation} event carries no record payload")]
    MissingRecord { operation: String },
}

pub type Result<T> = std::result::Result<T, DecodeError>;

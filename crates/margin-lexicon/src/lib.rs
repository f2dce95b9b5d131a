//! Record schemas and decoding rules for the margin index.
//!
//! Every collection mirrored from remote repositories has a fixed decode function that
//! turns its raw JSON payload into one canonical [`IndexedRecord`]. Decoding is a pure
//! transformation; both the firehose consumer and the reconciliation crawler share the
//! same [`DecoderRegistry`].

pub mod collection;
pub mod decode;
pub mod error;
pub mod record;
pub mod registry;
pub mod target;

pub use collection::{AtUri, Collection};
pub use decode::{CardContent, DecodeFn, RecordContext};
pub use error::DecodeError;
pub use record::{IndexedRecord, RecordBody, RecordKind};
pub use registry::DecoderRegistry;
pub use target::{hash_url, normalize_url};

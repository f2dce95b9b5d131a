//! Local record index for margin.
//!
//! The ingestion paths talk to storage through [`RecordIndex`] and [`CursorStore`].
//! [`DuckStore`] keeps both in one embedded DuckDB database; [`MemoryStore`] is the
//! in-process variant used in tests.

pub mod duck;
pub mod error;
pub mod memory;
pub mod store;

pub use duck::DuckStore;
pub use error::{IndexError, Result};
pub use memory::MemoryStore;
pub use store::{CursorStore, RecordIndex};

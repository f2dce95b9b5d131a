//! Ingestion paths for the margin index.
//!
//! Two paths write to the same [`margin_index::RecordIndex`]:
//!
//! - the [`firehose::FirehoseConsumer`] applies every relevant create, update and
//!   delete as it happens and persists its stream position;
//! - the [`crawler::Crawler`] periodically lists an identity's repository, verifies
//!   each record against its CID and repairs whatever the stream missed.
//!
//! The consumer hands identities it sees to a [`scheduler::SyncTrigger`], rate-limited
//! per identity by [`limiter::SyncLimiter`].

pub mod backoff;
pub mod crawler;
pub mod error;
pub mod firehose;
pub mod limiter;
pub mod scheduler;
pub mod xrpc;

pub use backoff::{Backoff, FixedBackoff};
pub use crawler::{Crawler, CrawlerConfig, SyncResult};
pub use error::{ConnectError, IngestFailure, ListingError, SyncError};
pub use firehose::{ConsumerConfig, ConsumerState, FirehoseConsumer, JetstreamSource};
pub use limiter::SyncLimiter;
pub use scheduler::{SchedulerConfig, SyncScheduler, SyncTrigger};
pub use xrpc::{RepoClientFactory, RepoLister, StaticClientFactory, XrpcRepoClient};

//! Real-time replication from a Jetstream firehose.

pub mod consumer;
pub mod event;
pub mod source;

pub use consumer::{ConsumerConfig, ConsumerState, FirehoseConsumer, StatsSnapshot};
pub use event::{parse_frame, CommitEvent, FirehoseEvent, FrameError, Operation};
pub use source::{subscription_url, EventSource, FrameStream, JetstreamSource};

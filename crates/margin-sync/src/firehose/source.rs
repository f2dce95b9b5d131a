//! Event sources: where raw firehose frames come from.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info};
use url::Url;

use crate::error::ConnectError;

/// Text frames from one connection. The stream ends when the connection closes.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, ConnectError>> + Send>>;

#[async_trait]
pub trait EventSource: Send + Sync {
    /// Open a subscription filtered to `collections`, replaying from `cursor` when given.
    async fn subscribe(
        &self,
        collections: &[String],
        cursor: Option<i64>,
    ) -> Result<FrameStream, ConnectError>;
}

/// Build the subscribe URL with `wantedCollections` and `cursor` query parameters.
pub fn subscription_url(
    base: &str,
    collections: &[String],
    cursor: Option<i64>,
) -> Result<Url, ConnectError> {
    let mut url = Url::parse(base).map_err(|e| ConnectError::InvalidUrl(format!("{base}: {e}")))?;
    let cursor = cursor.filter(|c| *c > 0);
    if collections.is_empty() && cursor.is_none() {
        return Ok(url);
    }
    {
        let mut query = url.query_pairs_mut();
        for collection in collections {
            query.append_pair("wantedCollections", collection);
        }
        if let Some(cursor) = cursor {
            query.append_pair("cursor", &cursor.to_string());
        }
    }
    Ok(url)
}

/// Websocket connection to a Jetstream instance.
#[derive(Debug, Clone)]
pub struct JetstreamSource {
    url: String,
    connect_timeout: Duration,
}

impl JetstreamSource {
    /// Create a new source for the subscribe endpoint at `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(30),
        }
    }

    /// Give up on a connection attempt after `timeout`.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl EventSource for JetstreamSource {
    async fn subscribe(
        &self,
        collections: &[String],
        cursor: Option<i64>,
    ) -> Result<FrameStream, ConnectError> {
        let url = subscription_url(&self.url, collections, cursor)?;
        info!(url = %url, "connecting to firehose");

        let (ws, _response) = tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| ConnectError::Timeout)?
            .map_err(|e| ConnectError::Connect(e.to_string()))?;

        let frames = async_stream::stream! {
            let mut ws = ws;
            while let Some(message) = ws.next().await {
                match message {
                    Ok(Message::Text(text)) => yield Ok(text),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => yield Ok(text),
                        Err(_) => debug!("ignoring non-utf8 binary frame"),
                    },
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "firehose closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        yield Err(ConnectError::Read(e.to_string()));
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(frames))
    }
}

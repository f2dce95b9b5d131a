//! Paginated repository listing over XRPC (`com.atproto.repo.listRecords`).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use margin_config::SyncConfig;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::ListingError;

pub const LIST_RECORDS_METHOD: &str = "com.atproto.repo.listRecords";

/// One record as returned by the remote listing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ListedRecord {
    pub uri: String,
    #[serde(default)]
    pub cid: Option<String>,
    pub value: Value,
}

/// One page of `com.atproto.repo.listRecords`. A missing or empty cursor ends the listing.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ListRecordsPage {
    #[serde(default)]
    pub records: Vec<ListedRecord>,
    #[serde(default)]
    pub cursor: Option<String>,
}

/// Authenticated access to one remote repository host.
#[async_trait]
pub trait RepoLister: Send + Sync {
    async fn list_records(
        &self,
        repo: &str,
        collection: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<ListRecordsPage, ListingError>;
}

/// Obtains a [`RepoLister`] able to read a given identity's repository.
#[async_trait]
pub trait RepoClientFactory: Send + Sync {
    async fn client_for(&self, did: &str) -> Result<Arc<dyn RepoLister>, ListingError>;
}

/// [`RepoLister`] speaking XRPC over HTTP to a repository host.
#[derive(Debug, Clone)]
pub struct XrpcRepoClient {
    http: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl XrpcRepoClient {
    /// Create a new client for the host at `base_url`, sending `auth_token` as a bearer
    /// token when present.
    pub fn new(
        base_url: impl Into<String>,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ListingError> {
        let base_url = base_url.into();
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ListingError::Transport {
                url: base_url.clone(),
                message: e.to_string(),
            })?;
        Ok(Self {
            http,
            base_url,
            auth_token,
        })
    }

    /// Create a client from the `[sync]` section of the configuration.
    pub fn from_config(config: &SyncConfig) -> Result<Self, ListingError> {
        Self::new(
            config.pds_url.clone(),
            config.auth_token.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    /// Full URL of the `listRecords` method on this host.
    pub fn endpoint(&self) -> String {
        format!(
            "{}/xrpc/{}",
            self.base_url.trim_end_matches('/'),
            LIST_RECORDS_METHOD
        )
    }
}

#[async_trait]
impl RepoLister for XrpcRepoClient {
    async fn list_records(
        &self,
        repo: &str,
        collection: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<ListRecordsPage, ListingError> {
        let url = self.endpoint();
        let limit = limit.to_string();
        let mut query = vec![
            ("repo", repo),
            ("collection", collection),
            ("limit", limit.as_str()),
        ];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor));
        }

        let mut request = self.http.get(&url).query(&query);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        debug!(repo, collection, cursor, "listing records");
        let response = request.send().await.map_err(|e| ListingError::Transport {
            url: url.clone(),
            message: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ListingError::Status {
                url,
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<ListRecordsPage>()
            .await
            .map_err(|e| ListingError::Body {
                url,
                message: e.to_string(),
            })
    }
}

/// Hands out the same client for every identity. Suitable when all tracked
/// repositories live on one host, or behind a relay that proxies listings.
#[derive(Clone)]
pub struct StaticClientFactory {
    client: Arc<dyn RepoLister>,
}

impl StaticClientFactory {
    /// Create a new factory always returning `client`.
    pub fn new(client: Arc<dyn RepoLister>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RepoClientFactory for StaticClientFactory {
    async fn client_for(&self, _did: &str) -> Result<Arc<dyn RepoLister>, ListingError> {
        Ok(self.client.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn endpoint_ignores_trailing_slash() {
        let client =
            XrpcRepoClient::new("https://pds.example.com/", None, Duration::from_secs(5))
                .expect("client");
        assert_eq!(
            client.endpoint(),
            "https://pds.example.com/xrpc/com.atproto.repo.listRecords"
        );
    }

    #[test]
    fn page_without_cursor_or_cid_parses() {
        let page: ListRecordsPage = serde_json::from_value(json!({
            "records": [
                {"uri": "at://did:plc:alice/at.margin.bookmark/1", "value": {"source": "https://a"}},
                {"uri": "at://did:plc:alice/at.margin.bookmark/2", "cid": "bafyreiabc", "value": {}}
            ]
        }))
        .expect("page");

        assert_eq!(page.records.len(), 2);
        assert_eq!(page.records[0].cid, None);
        assert_eq!(page.records[1].cid.as_deref(), Some("bafyreiabc"));
        assert_eq!(page.cursor, None);
    }

    #[test]
    fn empty_body_is_an_empty_page() {
        let page: ListRecordsPage = serde_json::from_value(json!({})).expect("page");
        assert_eq!(page, ListRecordsPage::default());
    }
}

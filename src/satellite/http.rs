//! HTTP Satellite Channel
//!
//! Delivers resource updates to satellites as `POST {endpoint}/v1/update`.
//! Connection failures are retried with exponential backoff, answers with an
//! error status are final.

use crate::domain::ports::{SatelliteAck, SatelliteChannel};
use crate::error::{Error, Result};
use crate::model::{NodeName, ResourceName};
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Path appended to a satellite endpoint
pub const UPDATE_PATH: &str = "/v1/update";

/// Node name and base URL of one satellite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatelliteEndpoint {
    pub node: NodeName,
    pub base_url: String,
}

impl SatelliteEndpoint {
    /// Parse `node=http://host:port`
    pub fn parse(entry: &str) -> Result<Self> {
        let (node, url) = entry.split_once('=').ok_or_else(|| {
            Error::Configuration(format!("satellite '{}' is not of the form node=url", entry))
        })?;
        let url = url.trim().trim_end_matches('/');
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(Error::Configuration(format!(
                "satellite URL '{}' must start with http:// or https://",
                url
            )));
        }
        Ok(Self {
            node: NodeName::new(node.trim())?,
            base_url: url.to_string(),
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateRequest<'a> {
    resource: &'a str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateResponse {
    #[serde(default)]
    detail: Option<String>,
}

/// Satellite channel speaking JSON over HTTP
pub struct HttpSatelliteChannel {
    client: reqwest::Client,
    endpoints: BTreeMap<NodeName, String>,
    retry_window: Duration,
}

impl HttpSatelliteChannel {
    /// Create a channel for the given endpoints
    pub fn new(endpoints: impl IntoIterator<Item = SatelliteEndpoint>, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            endpoints: endpoints
                .into_iter()
                .map(|endpoint| (endpoint.node, endpoint.base_url))
                .collect(),
            retry_window: request_timeout,
        })
    }

    /// Limit the total time spent retrying unreachable satellites
    pub fn with_retry_window(mut self, window: Duration) -> Self {
        self.retry_window = window;
        self
    }

    /// Update URL of a node
    pub fn update_url(&self, node: &NodeName) -> Result<String> {
        self.endpoints
            .get(node)
            .map(|base| format!("{}{}", base, UPDATE_PATH))
            .ok_or_else(|| Error::SatelliteUnreachable {
                node: node.to_string(),
                reason: "no endpoint configured".to_string(),
            })
    }

    /// Number of known satellites
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    async fn post_once(
        &self,
        url: &str,
        node: &NodeName,
        resource: &ResourceName,
    ) -> std::result::Result<SatelliteAck, backoff::Error<Error>> {
        let response = self
            .client
            .post(url)
            .json(&UpdateRequest {
                resource: resource.as_str(),
            })
            .send()
            .await
            .map_err(|e| {
                let err = Error::SatelliteUnreachable {
                    node: node.to_string(),
                    reason: e.to_string(),
                };
                if e.is_connect() || e.is_timeout() {
                    debug!(node = %node, error = %e, "Satellite not reachable, retrying");
                    backoff::Error::transient(err)
                } else {
                    backoff::Error::permanent(err)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(backoff::Error::permanent(Error::SatelliteRejected {
                node: node.to_string(),
                reason: format!("{}: {}", status, body.trim()),
            }));
        }

        // an empty body is a plain acknowledgement
        let body = response.bytes().await.map_err(|e| {
            backoff::Error::permanent(Error::SatelliteUnreachable {
                node: node.to_string(),
                reason: e.to_string(),
            })
        })?;
        let ack: UpdateResponse = if body.is_empty() {
            UpdateResponse::default()
        } else {
            serde_json::from_slice(&body).map_err(|e| backoff::Error::permanent(Error::from(e)))?
        };

        Ok(SatelliteAck {
            node: node.clone(),
            detail: ack.detail,
        })
    }
}

#[async_trait]
impl SatelliteChannel for HttpSatelliteChannel {
    async fn send_update(&self, node: &NodeName, resource: &ResourceName) -> Result<SatelliteAck> {
        let url = self.update_url(node)?;
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(100))
            .with_max_interval(Duration::from_secs(2))
            .with_max_elapsed_time(Some(self.retry_window))
            .build();

        backoff::future::retry(policy, || self.post_once(&url, node, resource))
            .await
            .map_err(|err| {
                warn!(node = %node, resource = %resource, error = %err, "Satellite update failed");
                err
            })
    }

    fn channel_name(&self) -> &str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_endpoint() {
        let endpoint = SatelliteEndpoint::parse("node-a=http://10.0.0.1:3366/").unwrap();
        assert_eq!(endpoint.node.as_str(), "node-a");
        assert_eq!(endpoint.base_url, "http://10.0.0.1:3366");

        assert_matches!(
            SatelliteEndpoint::parse("node-a"),
            Err(Error::Configuration(_))
        );
        assert_matches!(
            SatelliteEndpoint::parse("node-a=10.0.0.1:3366"),
            Err(Error::Configuration(_))
        );
        assert_matches!(
            SatelliteEndpoint::parse("x=http://10.0.0.1"),
            Err(Error::InvalidName { .. })
        );
    }

    #[test]
    fn test_update_url_lookup() {
        let channel = HttpSatelliteChannel::new(
            vec![SatelliteEndpoint::parse("node-a=http://sat-a:3366").unwrap()],
            Duration::from_secs(1),
        )
        .unwrap();

        assert_eq!(channel.endpoint_count(), 1);
        let node = NodeName::new("NODE-A").unwrap();
        assert_eq!(channel.update_url(&node).unwrap(), "http://sat-a:3366/v1/update");
    }

    #[tokio::test]
    async fn test_unknown_node_is_unreachable() {
        let channel = HttpSatelliteChannel::new(Vec::new(), Duration::from_secs(1)).unwrap();
        let node = NodeName::new("node-z").unwrap();
        let resource = ResourceName::new("rsc1").unwrap();

        let err = channel.send_update(&node, &resource).await.unwrap_err();
        assert_matches!(err, Error::SatelliteUnreachable { .. });
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_refused_connection_gives_up_after_window() {
        // port 9 (discard) is closed on test hosts
        let channel = HttpSatelliteChannel::new(
            vec![SatelliteEndpoint::parse("node-a=http://127.0.0.1:9").unwrap()],
            Duration::from_millis(200),
        )
        .unwrap()
        .with_retry_window(Duration::from_millis(300));
        let node = NodeName::new("node-a").unwrap();
        let resource = ResourceName::new("rsc1").unwrap();

        let err = channel.send_update(&node, &resource).await.unwrap_err();
        assert_matches!(err, Error::SatelliteUnreachable { .. });
    }
}

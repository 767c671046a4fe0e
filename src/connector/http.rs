//! # HTTP Destination Connector
//!
//! Posts the encoded payload to a configured URL and maps the response status
//! code to a `ResponseStatus` via a small configurable table (spec.md §6): 2xx
//! defaults to SENT, 429/503 default to QUEUED, everything else defaults to
//! ERROR, overridable per status code through `status_to_response`.
//!
//! `reqwest` is not part of the teacher's stack; it is enriched in from the
//! wider example pack (several `other_examples/` manifests depend on it) since
//! no HTTP client appears anywhere in the teacher, which only ever speaks raw
//! TCP/Unix-domain sockets.

use super::{Connector, DestinationConnector, Response, ResponseStatus};
use crate::error::{EngineError, Result};
use crate::model::Maps;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

pub struct HttpConnector {
    url: String,
    status_to_response: HashMap<u16, ResponseStatus>,
    client: reqwest::Client,
}

impl HttpConnector {
    pub fn new(url: String, status_to_response: HashMap<u16, ResponseStatus>) -> Self {
        Self {
            url,
            status_to_response,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client configuration is static and always valid"),
        }
    }

    fn classify(&self, status: u16) -> ResponseStatus {
        if let Some(mapped) = self.status_to_response.get(&status) {
            return *mapped;
        }
        match status {
            200..=299 => ResponseStatus::Sent,
            429 | 503 => ResponseStatus::Queued,
            _ => ResponseStatus::Error,
        }
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn start(&mut self) -> Result<()> {
        Ok(())
    }
    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }
    async fn halt(&mut self) -> Result<()> {
        Ok(())
    }
    async fn pause(&mut self) -> Result<()> {
        Ok(())
    }
    async fn resume(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl DestinationConnector for HttpConnector {
    async fn send(&self, encoded_payload: &str, _maps: &Maps) -> Result<Response> {
        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/octet-stream")
            .body(encoded_payload.to_string())
            .send()
            .await
            .map_err(|e| EngineError::Transport(format!("HTTP send to {} failed: {e}", self.url)))?;

        let status_code = response.status().as_u16();
        let status = self.classify(status_code);
        let body = response.text().await.unwrap_or_default();

        Ok(Response {
            status,
            message: Some(body),
            status_code: Some(status_code),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_classification_matches_spec_table() {
        let connector = HttpConnector::new("http://localhost/ingest".to_string(), HashMap::new());
        assert_eq!(connector.classify(200), ResponseStatus::Sent);
        assert_eq!(connector.classify(204), ResponseStatus::Sent);
        assert_eq!(connector.classify(429), ResponseStatus::Queued);
        assert_eq!(connector.classify(503), ResponseStatus::Queued);
        assert_eq!(connector.classify(500), ResponseStatus::Error);
        assert_eq!(connector.classify(404), ResponseStatus::Error);
    }

    #[test]
    fn explicit_mapping_overrides_the_default_table() {
        let mut overrides = HashMap::new();
        overrides.insert(404u16, ResponseStatus::Filtered);
        let connector = HttpConnector::new("http://localhost/ingest".to_string(), overrides);
        assert_eq!(connector.classify(404), ResponseStatus::Filtered);
        assert_eq!(connector.classify(200), ResponseStatus::Sent);
    }
}

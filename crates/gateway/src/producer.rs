use std::time::Duration;

use glimpse_contracts::ResourceKind;
use serde::{Deserialize, Serialize};

/// One upstream result entry: a stable identifier/URL plus the similarity
/// score assigned by the matching service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ResultItem {
    pub id: String,
    pub url: String,
    pub score: f64,
}

#[derive(Debug)]
pub(crate) enum ProducerError {
    Timeout,
    Http(reqwest::Error),
    BadStatus(reqwest::StatusCode),
    InvalidResponse,
}

impl std::fmt::Display for ProducerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProducerError::Timeout => write!(f, "producer request timed out"),
            ProducerError::Http(err) => write!(f, "producer HTTP error: {}", err),
            ProducerError::BadStatus(status) => write!(f, "producer returned status {}", status),
            ProducerError::InvalidResponse => write!(f, "producer returned invalid JSON response"),
        }
    }
}

impl std::error::Error for ProducerError {}

impl From<reqwest::Error> for ProducerError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            ProducerError::Timeout
        } else {
            ProducerError::Http(value)
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProducerResponse {
    results: Vec<ResultItem>,
}

/// Client for the upstream result producer (the face-matching / query
/// generation service). Opaque to the gate: it either returns an ordered
/// result list or fails.
#[derive(Clone)]
pub(crate) struct ProducerClient {
    base_url: String,
    http: reqwest::Client,
}

impl ProducerClient {
    pub(crate) fn new(base_url: String, timeout: Duration) -> Result<Self, ProducerError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ProducerError::Http)?;

        Ok(Self { base_url, http })
    }

    pub(crate) async fn fetch(
        &self,
        resource: ResourceKind,
        query: &str,
    ) -> Result<Vec<ResultItem>, ProducerError> {
        let resp = self
            .http
            .post(self.endpoint(resource))
            .json(&serde_json::json!({ "query": query }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(ProducerError::BadStatus(resp.status()));
        }

        let decoded = resp
            .json::<ProducerResponse>()
            .await
            .map_err(|_| ProducerError::InvalidResponse)?;

        Ok(decoded.results)
    }

    fn endpoint(&self, resource: ResourceKind) -> String {
        let path = match resource {
            ResourceKind::FaceSearch => "search",
            ResourceKind::QueryGen => "query-gen",
        };
        format!("{}/v1/{}", self.base_url.trim_end_matches('/'), path)
    }
}

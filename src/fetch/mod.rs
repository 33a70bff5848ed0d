// src/fetch/mod.rs

use reqwest::Client;
use serde_json::Value;
use std::{collections::BTreeMap, time::Duration};
use tracing::{debug, instrument};
use url::Url;

use crate::error::PipelineError;

/// Longest slice of an error response body carried into `SourceError`.
const MAX_ERROR_BODY: usize = 512;

/// The forecast endpoint for one location and one set of fields.
#[derive(Clone, Debug, PartialEq)]
pub struct Endpoint {
    pub base_url: Url,
    pub latitude: f64,
    pub longitude: f64,
    pub granularity: String,
    pub fields: Vec<String>,
    pub extra_params: BTreeMap<String, String>,
}

impl Endpoint {
    /// `<base>?latitude=..&longitude=..&<granularity>=f1,f2,..` plus extra params in key order.
    pub fn url(&self) -> Url {
        let mut url = self.base_url.clone();
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("latitude", &self.latitude.to_string());
            q.append_pair("longitude", &self.longitude.to_string());
            q.append_pair(&self.granularity, &self.fields.join(","));
            for (k, v) in &self.extra_params {
                q.append_pair(k, v);
            }
        }
        url
    }
}

/// Parsed JSON body of one forecast response.
#[derive(Clone, Debug, PartialEq)]
pub struct RawPayload(pub Value);

impl RawPayload {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, PipelineError> {
        serde_json::from_slice(bytes)
            .map(RawPayload)
            .map_err(|e| PipelineError::SourceFormatError(format!("invalid JSON body: {}", e)))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

/// Thin wrapper over a pooled `reqwest::Client` with the run timeout baked in.
#[derive(Clone, Debug)]
pub struct Fetcher {
    client: Client,
}

impl Fetcher {
    pub fn new(timeout: Duration) -> Result<Self, PipelineError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(concat!("etlweather/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PipelineError::SourceUnavailable(format!("building HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// One GET against `endpoint`. No retries here; the task runner owns them.
    #[instrument(level = "info", skip(self, endpoint), fields(url = %endpoint.base_url))]
    pub async fn fetch(&self, endpoint: &Endpoint) -> Result<RawPayload, PipelineError> {
        let url = endpoint.url();
        debug!(%url, "GET");

        let resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| unavailable(&url, e))?;

        let status = resp.status();
        if !status.is_success() {
            // Best effort: a body we cannot read still yields the status.
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::SourceError {
                status: status.as_u16(),
                message: truncate(body.trim(), MAX_ERROR_BODY),
            });
        }

        let bytes = resp.bytes().await.map_err(|e| unavailable(&url, e))?;
        debug!(bytes = bytes.len(), "received body");
        RawPayload::from_slice(&bytes)
    }
}

fn unavailable(url: &Url, e: reqwest::Error) -> PipelineError {
    let what = if e.is_timeout() {
        "timed out"
    } else if e.is_connect() {
        "connection failed"
    } else {
        "transport error"
    };
    PipelineError::SourceUnavailable(format!("GET {} {}: {}", url, what, e))
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

// src/ingest/fetch.rs
//! Upstream HTTP for adapters: conditional GET with remembered validators, a hard inner
//! timeout, and a streaming body read that aborts as soon as the byte cap is crossed.

use std::sync::Mutex;
use std::time::Duration;

use reqwest::header::{CONTENT_LENGTH, DATE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use serde::{Deserialize, Serialize};

use crate::error::FetchError;
use crate::ingest::parse_timestamp_ms;
use crate::ingest::types::now_ms;

pub const USER_AGENT: &str = concat!("pulse-ingest/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub inner_timeout_ms: u64,
    pub max_bytes: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            inner_timeout_ms: 900,
            max_bytes: 1_000_000,
        }
    }
}

/// Builds the client every fetcher shares. Connection pools are per client.
pub fn build_client(cfg: &FetchConfig) -> anyhow::Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_millis(cfg.inner_timeout_ms))
        .pool_idle_timeout(Duration::from_secs(10))
        .build()?;
    Ok(client)
}

/// Cache validators from a 2xx response. Held back until the body is fully handled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
    /// Present only for 2xx responses.
    pub body: Option<String>,
    /// Server `Date` header, when parseable.
    pub date_ms: Option<u64>,
    pub received_at_ms: u64,
    /// New validators for a conditional 2xx; pass to [`HttpFetcher::commit`] once parsed.
    pub validators: Option<Validators>,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    url: String,
    max_bytes: usize,
    validators: Mutex<Validators>,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client, url: impl Into<String>, max_bytes: usize) -> Self {
        Self {
            client,
            url: url.into(),
            max_bytes,
            validators: Mutex::new(Validators::default()),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Polling fetch: sends stored validators. New ones come back in the response and are
    /// only stored by [`commit`](Self::commit).
    pub async fn fetch(&self) -> Result<FetchResponse, FetchError> {
        self.request(true).await
    }

    /// One-off fetch that neither sends nor updates validators.
    pub async fn fetch_unconditional(&self) -> Result<FetchResponse, FetchError> {
        self.request(false).await
    }

    /// Stores the validators of a response whose body was read and parsed. Until then the
    /// next poll repeats the previous conditional request and gets the full body again.
    pub fn commit(&self, resp: &FetchResponse) {
        if let Some(v) = &resp.validators {
            *self
                .validators
                .lock()
                .expect("fetch validators mutex poisoned") = v.clone();
        }
    }

    async fn request(&self, conditional: bool) -> Result<FetchResponse, FetchError> {
        let mut req = self.client.get(&self.url);
        if conditional {
            let v = self
                .validators
                .lock()
                .expect("fetch validators mutex poisoned")
                .clone();
            if let Some(etag) = v.etag {
                req = req.header(IF_NONE_MATCH, etag);
            }
            if let Some(lm) = v.last_modified {
                req = req.header(IF_MODIFIED_SINCE, lm);
            }
        }

        let mut resp = req.send().await.map_err(FetchError::from_reqwest)?;
        let status = resp.status().as_u16();
        let headers = resp.headers();
        let date_ms = header_str(headers, DATE).and_then(parse_timestamp_ms);

        if !resp.status().is_success() {
            return Ok(FetchResponse {
                status,
                body: None,
                date_ms,
                received_at_ms: now_ms(),
                validators: None,
            });
        }

        let validators = conditional.then(|| Validators {
            etag: header_str(headers, ETAG).map(str::to_string),
            last_modified: header_str(headers, LAST_MODIFIED).map(str::to_string),
        });

        let declared = header_str(resp.headers(), CONTENT_LENGTH).and_then(|v| v.parse::<usize>().ok());
        if declared.is_some_and(|n| n > self.max_bytes) {
            return Err(FetchError::BodyTooLarge { cap: self.max_bytes });
        }

        let mut buf: Vec<u8> = Vec::with_capacity(declared.unwrap_or(16 * 1024).min(self.max_bytes));
        while let Some(chunk) = resp.chunk().await.map_err(FetchError::from_reqwest)? {
            if buf.len() + chunk.len() > self.max_bytes {
                return Err(FetchError::BodyTooLarge { cap: self.max_bytes });
            }
            buf.extend_from_slice(&chunk);
        }

        Ok(FetchResponse {
            status,
            body: Some(String::from_utf8_lossy(&buf).into_owned()),
            date_ms,
            received_at_ms: now_ms(),
            validators,
        })
    }
}

fn header_str(h: &reqwest::header::HeaderMap, name: reqwest::header::HeaderName) -> Option<&str> {
    h.get(name).and_then(|v| v.to_str().ok())
}

//! Stateless client to one upstream database.
//!
//! Holds two reqwest clients (writes and queries carry very different
//! timeouts) and a cached health flag refreshed by a background ping
//! task. Status mapping is the durability contract: 400/404 are terminal
//! and the caller drops the payload, everything else is retryable.

use crate::config::{BackendConfig, BasicAuth};
use crate::{Error, Result};
use bytes::Bytes;
use http::{header, Method, StatusCode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A query to forward upstream: the original method plus the full form
/// parameter set, passed through verbatim.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub method: Method,
    pub db: String,
    pub q: String,
    pub params: Vec<(String, String)>,
}

/// Buffered upstream response: status, the two headers the proxy cares
/// about, and the raw (possibly gzipped) body.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub body: Bytes,
}

/// Client to one upstream database instance.
pub struct HttpBackend {
    name: String,
    url: String,
    db: String,
    zone: String,
    basic_auth: Option<BasicAuth>,
    write_only: bool,
    client_write: reqwest::Client,
    client_query: reqwest::Client,
    active: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl HttpBackend {
    /// Build the clients and start the health probe.
    pub fn new(name: &str, cfg: &BackendConfig) -> Result<Self> {
        let client_write = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_write))
            .build()?;
        let client_query = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_query))
            .build()?;

        let active = Arc::new(AtomicBool::new(true));
        let shutdown = CancellationToken::new();
        spawn_health_probe(
            name.to_string(),
            cfg.url.clone(),
            client_write.clone(),
            active.clone(),
            Duration::from_millis(cfg.check_interval),
            shutdown.clone(),
        );

        Ok(Self {
            name: name.to_string(),
            url: cfg.url.trim_end_matches('/').to_string(),
            db: cfg.db.clone(),
            zone: cfg.zone.clone(),
            basic_auth: cfg.basic_auth.clone(),
            write_only: cfg.write_only,
            client_write,
            client_query,
            active,
            shutdown,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn db(&self) -> &str {
        &self.db
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    pub fn is_write_only(&self) -> bool {
        self.write_only
    }

    /// Cached upstream health; fails closed while the upstream is
    /// unreachable.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// POST a pre-gzipped line-protocol batch to the upstream write
    /// endpoint.
    pub async fn write_compressed(&self, payload: Bytes) -> Result<()> {
        let mut req = self
            .client_write
            .post(format!("{}/write", self.url))
            .query(&[("db", self.db.as_str())])
            .header(header::CONTENT_ENCODING, "gzip")
            .header(header::CONTENT_TYPE, "text/plain")
            .body(payload);
        if let Some(auth) = &self.basic_auth {
            req = req.basic_auth(&auth.username, Some(&auth.password));
        }

        let resp = req
            .send()
            .await
            .map_err(|e| Error::Upstream(e.to_string()))?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::BAD_REQUEST => Err(Error::BadRequest),
            StatusCode::NOT_FOUND => Err(Error::NotFound),
            s => Err(Error::Upstream(format!("write returned {s}"))),
        }
    }

    /// Forward a query request verbatim and buffer the response. Only
    /// transport failures error; upstream HTTP errors proxy through.
    pub async fn query_resp(&self, req: &QueryRequest) -> Result<UpstreamResponse> {
        let url = format!("{}/query", self.url);
        let mut r = if req.method == Method::POST {
            self.client_query.post(&url).form(&req.params)
        } else {
            self.client_query.get(&url).query(&req.params)
        };
        if let Some(auth) = &self.basic_auth {
            r = r.basic_auth(&auth.username, Some(&auth.password));
        }

        let resp = r
            .send()
            .await
            .map_err(|e| Error::Upstream(e.to_string()))?;
        let status = resp.status();
        let content_type = header_value(resp.headers(), header::CONTENT_TYPE);
        let content_encoding = header_value(resp.headers(), header::CONTENT_ENCODING);
        let body = resp
            .bytes()
            .await
            .map_err(|e| Error::Upstream(e.to_string()))?;

        Ok(UpstreamResponse {
            status,
            content_type,
            content_encoding,
            body,
        })
    }

    /// Stop the health probe.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

fn header_value(headers: &header::HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

fn spawn_health_probe(
    name: String,
    url: String,
    client: reqwest::Client,
    active: Arc<AtomicBool>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let ping_url = format!("{}/ping", url.trim_end_matches('/'));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let up = match client.get(&ping_url).send().await {
                        Ok(resp) => resp.status().is_success(),
                        Err(_) => false,
                    };
                    let was = active.swap(up, Ordering::Release);
                    if was != up {
                        warn!(backend = %name, up, "upstream health changed");
                    }
                }
            }
        }
    });
}

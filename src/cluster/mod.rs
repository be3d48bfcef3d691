//! The routing and dispatch core.
//!
//! A `Cluster` owns the routing table, the query policy, the per-backend
//! pipelines and the statistics counters. Writes fan out per measurement;
//! queries are policy-checked and dispatched to one owning backend
//! (same-zone first) or, for metadata statements, fanned out and merged.

mod merge;
mod routing;
mod stats;

pub use merge::{body_from_series, series_array, Series};
pub use routing::{RoutingTable, DEFAULT_KEY};
pub use stats::{Statistics, StatsRecorder};

use crate::backend::{Backend, BackendApi, QueryRequest, UpstreamResponse};
use crate::config::{FileConfigSource, NodeConfig};
use crate::influxql::{self, ShowKind};
use crate::line_protocol;
use crate::{Error, Result, VERSION};
use bytes::Bytes;
use http::StatusCode;
use parking_lot::RwLock;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Internal database receiving the proxy's own statistics points.
const STATS_DB: &str = "influxproxy";

/// Routing state swapped atomically on reload.
#[derive(Default)]
struct Shared {
    backends: HashMap<String, Arc<dyn BackendApi>>,
    routes: RoutingTable,
    nexts: Vec<Arc<dyn BackendApi>>,
}

/// What the front door writes back to the client.
#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub body: Bytes,
}

impl QueryResponse {
    fn from_upstream(resp: UpstreamResponse) -> Self {
        Self {
            status: resp.status,
            content_type: resp.content_type,
            content_encoding: resp.content_encoding,
            body: resp.body,
        }
    }

    fn text(status: StatusCode, msg: &str) -> Self {
        Self {
            status,
            content_type: Some("text/plain".to_string()),
            content_encoding: None,
            body: Bytes::from(msg.to_string()),
        }
    }
}

/// The routing table and request dispatcher.
pub struct Cluster {
    zone: String,
    store_dir: PathBuf,
    nexts_cfg: String,
    shared: RwLock<Shared>,
    forbidden: RwLock<Vec<Regex>>,
    obligated: RwLock<Vec<Regex>>,
    stats: StatsRecorder,
    default_tags: BTreeMap<String, String>,
    stats_interval: Duration,
    write_tracing: bool,
    query_tracing: bool,
    shutdown: CancellationToken,
    stats_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Cluster {
    /// Build an empty cluster for this node; `load_config` populates it.
    pub fn new(nodecfg: &NodeConfig, store_dir: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let mut default_tags = BTreeMap::new();
        default_tags.insert("addr".to_string(), nodecfg.listen_addr.clone());
        default_tags.insert("host".to_string(), hostname());

        let cluster = Arc::new(Self {
            zone: nodecfg.zone.clone(),
            store_dir: store_dir.into(),
            nexts_cfg: nodecfg.nexts.clone(),
            shared: RwLock::new(Shared::default()),
            forbidden: RwLock::new(Vec::new()),
            obligated: RwLock::new(Vec::new()),
            stats: StatsRecorder::default(),
            default_tags,
            stats_interval: Duration::from_secs(nodecfg.interval),
            write_tracing: nodecfg.write_tracing,
            query_tracing: nodecfg.query_tracing,
            shutdown: CancellationToken::new(),
            stats_task: parking_lot::Mutex::new(None),
        });

        cluster.forbid_query(influxql::FORBIDDEN_COMMANDS)?;
        cluster.ensure_query(influxql::SUPPORTED_COMMANDS)?;
        Ok(cluster)
    }

    /// Append a denylist pattern. A query matching any denylist entry is
    /// rejected regardless of the allowlist.
    pub fn forbid_query(&self, pattern: &str) -> Result<()> {
        let re = Regex::new(pattern).map_err(|e| Error::IllegalConfig(e.to_string()))?;
        self.forbidden.write().push(re);
        Ok(())
    }

    /// Append an allowlist pattern. With a non-empty allowlist a query
    /// must match at least one entry.
    pub fn ensure_query(&self, pattern: &str) -> Result<()> {
        let re = Regex::new(pattern).map_err(|e| Error::IllegalConfig(e.to_string()))?;
        self.obligated.write().push(re);
        Ok(())
    }

    /// Create real backends from the config source and swap them in.
    pub async fn load_config(&self, src: &FileConfigSource) -> Result<()> {
        let mut backends: HashMap<String, Arc<dyn BackendApi>> = HashMap::new();
        for (name, cfg) in src.load_backends() {
            let backend = Backend::new(&name, &cfg, &self.store_dir)?;
            backends.insert(name, Arc::new(backend));
        }
        let keymaps = src.load_measurements();
        let nexts: Vec<String> = self
            .nexts_cfg
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        self.apply(backends, &keymaps, &nexts).await;
        Ok(())
    }

    /// Swap in a new routing state atomically; close the displaced
    /// backends after releasing the lock. Public so tests can install
    /// mock backends.
    pub async fn apply(
        &self,
        backends: HashMap<String, Arc<dyn BackendApi>>,
        keymaps: &HashMap<String, HashMap<String, Vec<String>>>,
        nexts: &[String],
    ) {
        let routes = RoutingTable::build(&backends, keymaps);
        let mut next_backends = Vec::new();
        for name in nexts {
            match backends.get(name) {
                Some(b) => next_backends.push(b.clone()),
                None => error!(
                    backend = %name,
                    "{}", Error::BackendNotExist(name.clone())
                ),
            }
        }

        let displaced = {
            let mut shared = self.shared.write();
            std::mem::replace(
                &mut *shared,
                Shared {
                    backends,
                    routes,
                    nexts: next_backends,
                },
            )
        };
        for (name, backend) in displaced.backends {
            debug!(backend = %name, "closing displaced backend");
            backend.close().await;
        }
    }

    /// Evaluate the query policy: deny wins, then a non-empty allowlist
    /// must match.
    pub fn check_query(&self, q: &str) -> Result<()> {
        if self.forbidden.read().iter().any(|re| re.is_match(q)) {
            return Err(Error::QueryForbidden);
        }
        let obligated = self.obligated.read();
        if !obligated.is_empty() && !obligated.iter().any(|re| re.is_match(q)) {
            return Err(Error::QueryForbidden);
        }
        Ok(())
    }

    /// The backend set owning `(db, measurement)`.
    pub fn get_backends(&self, measurement: &str, db: &str) -> Option<Vec<Arc<dyn BackendApi>>> {
        self.shared.read().routes.lookup(db, measurement)
    }

    /// Liveness: bump the counter and report the proxied version.
    pub fn ping(&self) -> &'static str {
        self.stats
            .current()
            .ping_requests
            .fetch_add(1, Ordering::Relaxed);
        VERSION
    }

    /// Route a raw write payload: split lines, rewrite timestamps, fan
    /// out per measurement, then forward the untouched payload to every
    /// next-hop peer. One bad row never stops the batch.
    pub async fn write(&self, p: Bytes, precision: &str, db: &str) {
        let stats = self.stats.current();
        stats.write_requests.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();

        for raw_line in p.split(|&b| b == b'\n') {
            let line = line_protocol::trim_right(raw_line);
            if line.is_empty() {
                continue;
            }
            self.write_line(line, precision, db, &stats).await;
        }

        let nexts = self.shared.read().nexts.clone();
        for next in nexts {
            // Peers normalize for themselves: they get the original bytes.
            if let Err(e) = next.write(p.clone()).await {
                error!(backend = %next.name(), "next-hop write failed: {e}");
                stats.write_requests_fail.fetch_add(1, Ordering::Relaxed);
            }
        }

        stats
            .write_request_duration
            .fetch_add(start.elapsed().as_nanos() as i64, Ordering::Relaxed);
    }

    async fn write_line(&self, line: &[u8], precision: &str, db: &str, stats: &Statistics) {
        stats.points_written.fetch_add(1, Ordering::Relaxed);

        let key = match line_protocol::scan_key(line) {
            Ok(k) => k,
            Err(e) => {
                warn!("scan key failed: {e}");
                stats.points_written_fail.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        let Some(owners) = self.get_backends(&key, db) else {
            warn!(measurement = %key, db = %db, "no route for measurement");
            stats.points_written_fail.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let rewritten = match line_protocol::rewrite_timestamp(line, precision, now_ns()) {
            Ok(l) => l,
            Err(e) => {
                warn!(measurement = %key, "timestamp rewrite failed: {e}");
                stats.points_written_fail.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if self.write_tracing {
            debug!(db = %db, line = %String::from_utf8_lossy(&rewritten), "dispatching point");
        }

        let payload = Bytes::from(rewritten);
        for backend in owners {
            if let Err(e) = backend.write(payload.clone()).await {
                error!(backend = %backend.name(), measurement = %key, "backend write failed: {e}");
                stats.points_written_fail.fetch_add(1, Ordering::Relaxed);
                return; // abort this line, not the batch
            }
        }
    }

    /// Dispatch a query and map failures to short 400 bodies.
    pub async fn query(&self, req: &QueryRequest) -> QueryResponse {
        let stats = self.stats.current();
        stats.query_requests.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();

        let result = self.dispatch_query(req).await;
        stats
            .query_request_duration
            .fetch_add(start.elapsed().as_nanos() as i64, Ordering::Relaxed);

        match result {
            Ok(resp) => resp,
            Err(e) => {
                stats.query_requests_fail.fetch_add(1, Ordering::Relaxed);
                QueryResponse::text(StatusCode::BAD_REQUEST, error_body(&e))
            }
        }
    }

    async fn dispatch_query(&self, req: &QueryRequest) -> Result<QueryResponse> {
        let q = req.q.trim();
        if q.is_empty() {
            return Err(Error::EmptyQuery);
        }
        if self.query_tracing {
            info!(db = %req.db, query = %q, "query dispatch");
        }

        // Metadata statements are answered by fan-out and merge.
        if let Some(kind) = influxql::show_kind(q) {
            return self.show_query(req, kind).await;
        }

        // Global DDL broadcasts to every backend of the named database.
        if influxql::is_global(q) {
            return self.global_query(req, q).await;
        }

        self.check_query(q)?;

        let measurement = influxql::get_measurement(q)?;
        let owners = self
            .get_backends(&measurement, &req.db)
            .ok_or_else(|| Error::UnknownMeasurement(measurement.clone()))?;

        // Same zone first, skipping write-only replicas.
        for backend in &owners {
            if backend.zone() != self.zone || !backend.is_active() || backend.is_write_only() {
                continue;
            }
            match backend.query_resp(req).await {
                Ok(resp) => return Ok(QueryResponse::from_upstream(resp)),
                Err(e) => warn!(backend = %backend.name(), "query failed: {e}"),
            }
        }
        // Then any other active zone.
        for backend in &owners {
            if backend.zone() == self.zone || !backend.is_active() {
                continue;
            }
            match backend.query_resp(req).await {
                Ok(resp) => return Ok(QueryResponse::from_upstream(resp)),
                Err(e) => warn!(backend = %backend.name(), "query failed: {e}"),
            }
        }
        Err(Error::QueryFailed)
    }

    /// Broadcast DDL to every backend of the target database. The first
    /// 2xx answer is returned to the client; everything else is logged.
    async fn global_query(&self, req: &QueryRequest, q: &str) -> Result<QueryResponse> {
        let db = influxql::get_database(q)?;
        let mut backends: Vec<Arc<dyn BackendApi>> = {
            let shared = self.shared.read();
            shared
                .backends
                .values()
                .filter(|b| b.db() == db)
                .cloned()
                .collect()
        };
        backends.sort_by(|a, b| a.name().cmp(b.name()));

        let mut winner: Option<UpstreamResponse> = None;
        let mut fallback: Option<UpstreamResponse> = None;
        for backend in backends {
            match backend.query_resp(req).await {
                Ok(resp) => {
                    if resp.status.is_success() {
                        winner.get_or_insert(resp);
                    } else {
                        fallback.get_or_insert(resp);
                    }
                }
                Err(e) => error!(backend = %backend.name(), query = %q, "global query failed: {e}"),
            }
        }
        winner
            .or(fallback)
            .map(QueryResponse::from_upstream)
            .ok_or(Error::QueryFailed)
    }

    /// Fetch the metadata response from the first eligible backend of
    /// every routed measurement. A measurement whose candidates all fail
    /// fails the whole fan-out.
    async fn query_all(&self, req: &QueryRequest) -> Result<QueryAllResult> {
        let entries = { self.shared.read().routes.measurements(&req.db) };

        let mut fetched: HashMap<String, bool> = HashMap::new();
        let mut out = QueryAllResult::default();
        for (_measurement, owners) in entries {
            let mut need = false;
            let mut got = false;
            for backend in owners {
                if backend.zone() != self.zone
                    || !backend.is_active()
                    || backend.is_write_only()
                {
                    continue;
                }
                need = true;
                match fetched.get(backend.name()).copied() {
                    Some(true) => {
                        got = true;
                        break;
                    }
                    Some(false) => continue,
                    None => {}
                }
                match backend.query_resp(req).await {
                    Ok(resp) => {
                        let body = if resp.content_encoding.as_deref() == Some("gzip") {
                            merge::gzip_decode(&resp.body)?
                        } else {
                            resp.body.to_vec()
                        };
                        if out.bodies.is_empty() {
                            out.content_type = resp.content_type.clone();
                            out.content_encoding = resp.content_encoding.clone();
                        }
                        out.bodies.push(body);
                        fetched.insert(backend.name().to_string(), true);
                        got = true;
                        break;
                    }
                    Err(e) => {
                        warn!(backend = %backend.name(), "metadata fan-out failed: {e}");
                        fetched.insert(backend.name().to_string(), false);
                    }
                }
            }
            if need && !got {
                return Err(Error::QueryFailed);
            }
        }
        Ok(out)
    }

    /// Answer a metadata statement from the fan-out, merged per kind.
    async fn show_query(&self, req: &QueryRequest, kind: ShowKind) -> Result<QueryResponse> {
        let all = self.query_all(req).await?;
        if all.bodies.is_empty() {
            return Err(Error::QueryFailed);
        }
        let gzipped = all.content_encoding.as_deref() == Some("gzip");

        let merged = match kind {
            ShowKind::Measurements => merge::merge_measurements(&all.bodies)?,
            ShowKind::TagKeys | ShowKind::FieldKeys => merge::merge_by_series_name(&all.bodies)?,
            // Known limitation carried over: only the first respondent's
            // retention policies are returned.
            ShowKind::RetentionPolicies => all.bodies[0].clone(),
        };

        Ok(QueryResponse {
            status: StatusCode::OK,
            content_type: all.content_type,
            content_encoding: all.content_encoding,
            body: Bytes::from(merge::gzip_encode(&merged, gzipped)),
        })
    }

    /// Start the periodic statistics feedback loop.
    pub fn start_statistics(self: &Arc<Self>) {
        if self.stats_interval.is_zero() {
            return;
        }
        let weak = Arc::downgrade(self);
        let token = self.shutdown.clone();
        let interval = self.stats_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // the immediate first tick
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(cluster) = weak.upgrade() else { break };
                        cluster.report_statistics().await;
                    }
                }
            }
        });
        *self.stats_task.lock() = Some(handle);
    }

    /// Swap the counters and feed the snapshot back through the normal
    /// write path as a `statistics` point.
    async fn report_statistics(&self) {
        {
            let backends: Vec<Arc<dyn BackendApi>> =
                self.shared.read().backends.values().cloned().collect();
            let live = self.stats.current();
            for backend in backends {
                let dropped = backend.take_dropped_points();
                if dropped > 0 {
                    live.points_written_fail
                        .fetch_add(dropped, Ordering::Relaxed);
                }
            }
        }

        let snapshot = self.stats.swap();
        let mut line = snapshot.to_line(&self.default_tags, now_ns());
        line.push('\n');
        self.write(Bytes::from(line), "ns", STATS_DB).await;
    }

    /// A point-in-time view of the live counters (for tests and probes).
    pub fn statistics(&self) -> Arc<Statistics> {
        self.stats.current()
    }

    /// Stop the statistics loop and close every backend.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let task = self.stats_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let shared = {
            let mut s = self.shared.write();
            std::mem::take(&mut *s)
        };
        for (name, backend) in shared.backends {
            debug!(backend = %name, "closing backend");
            backend.close().await;
        }
    }
}

#[derive(Default)]
struct QueryAllResult {
    content_type: Option<String>,
    content_encoding: Option<String>,
    bodies: Vec<Vec<u8>>,
}

/// The short text bodies the HTTP layer returns on 400.
fn error_body(e: &Error) -> &'static str {
    match e {
        Error::EmptyQuery => "empty query\n",
        Error::QueryForbidden => "query forbidden\n",
        Error::NoMeasurement(_) | Error::NoDatabase(_) => "can't get measurement\n",
        Error::UnknownMeasurement(_) => "unknown measurement\n",
        _ => "query error\n",
    }
}

fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster() -> Arc<Cluster> {
        Cluster::new(&NodeConfig::default(), "/tmp/fluxgate-test-store").unwrap()
    }

    #[test]
    fn deny_wins_over_allow() {
        let c = cluster();
        // Matches the allowlist (select ... from) but also the denylist.
        assert!(matches!(
            c.check_query("SELECT * INTO backup FROM cpu"),
            Err(Error::QueryForbidden)
        ));
        assert!(c.check_query("SELECT value FROM cpu").is_ok());
    }

    #[test]
    fn allowlist_must_match_when_present() {
        let c = cluster();
        assert!(matches!(
            c.check_query("TOTALLY UNKNOWN STATEMENT"),
            Err(Error::QueryForbidden)
        ));
        assert!(c.check_query("SHOW MEASUREMENTS").is_ok());
    }

    #[test]
    fn error_bodies_match_contract() {
        assert_eq!(error_body(&Error::EmptyQuery), "empty query\n");
        assert_eq!(error_body(&Error::QueryForbidden), "query forbidden\n");
        assert_eq!(
            error_body(&Error::UnknownMeasurement("x".into())),
            "unknown measurement\n"
        );
        assert_eq!(error_body(&Error::QueryFailed), "query error\n");
    }

    #[test]
    fn ping_reports_version_and_counts() {
        let c = cluster();
        assert_eq!(c.ping(), VERSION);
        assert_eq!(
            c.statistics().ping_requests.load(Ordering::Relaxed),
            1
        );
    }
}

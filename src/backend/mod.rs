//! Per-destination write pipeline.
//!
//! Each upstream database gets one `Backend`: a single-writer worker that
//! batches incoming lines, a pool of detached flush tasks that compress
//! and POST batches, and at most one drainer that replays the on-disk
//! spool once the upstream comes back. The `BackendApi` trait is the seam
//! the cluster routes through; tests substitute mocks for it.

mod http;
mod spool;

pub use http::{HttpBackend, QueryRequest, UpstreamResponse};
pub use spool::FileSpool;

use crate::config::BackendConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write as _;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

/// Inbound channel capacity; bounds how far the write handler can run
/// ahead of a slow backend.
const WRITE_QUEUE: usize = 16;

/// The surface the cluster routes through. Mirrors what a destination
/// must offer: identity, health, an enqueue-style write, and a proxied
/// query.
#[async_trait]
pub trait BackendApi: Send + Sync {
    fn name(&self) -> &str;
    fn db(&self) -> &str;
    fn zone(&self) -> &str;
    fn is_active(&self) -> bool;
    fn is_write_only(&self) -> bool;
    /// Enqueue one line (or, for next-hop peers, a whole raw payload).
    async fn write(&self, p: Bytes) -> Result<()>;
    /// Forward a query and buffer the upstream response.
    async fn query_resp(&self, req: &QueryRequest) -> Result<UpstreamResponse>;
    /// Points dropped on permanent upstream rejection since the last call.
    fn take_dropped_points(&self) -> i64 {
        0
    }
    async fn close(&self);
}

struct Pipeline {
    name: String,
    http: Arc<HttpBackend>,
    spool: Arc<Mutex<FileSpool>>,
    running: AtomicBool,
    draining: AtomicBool,
    dropped_points: AtomicI64,
    /// One permit: outbound POSTs are serialized per backend so spool
    /// replay cannot overtake a fresh flush.
    post_gate: Semaphore,
    tracker: TaskTracker,
    flush_interval: Duration,
    rewrite_interval: Duration,
    check_interval: Duration,
    max_rows: usize,
}

/// One write pipeline: owns the upstream client and the retry spool.
pub struct Backend {
    pipeline: Arc<Pipeline>,
    tx: parking_lot::Mutex<Option<mpsc::Sender<Bytes>>>,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Backend {
    /// Open the spool, start the health probe and the worker.
    pub fn new(name: &str, cfg: &BackendConfig, store_dir: impl AsRef<Path>) -> Result<Self> {
        let http = Arc::new(HttpBackend::new(name, cfg)?);
        let spool = Arc::new(Mutex::new(FileSpool::open(name, store_dir)?));

        let pipeline = Arc::new(Pipeline {
            name: name.to_string(),
            http,
            spool,
            running: AtomicBool::new(true),
            draining: AtomicBool::new(false),
            dropped_points: AtomicI64::new(0),
            post_gate: Semaphore::new(1),
            tracker: TaskTracker::new(),
            flush_interval: Duration::from_millis(cfg.flush_interval),
            rewrite_interval: Duration::from_millis(cfg.rewrite_interval),
            check_interval: Duration::from_millis(cfg.check_interval),
            max_rows: cfg.max_row_limit,
        });

        let (tx, rx) = mpsc::channel(WRITE_QUEUE);
        let worker = tokio::spawn(run_worker(pipeline.clone(), rx));

        Ok(Self {
            pipeline,
            tx: parking_lot::Mutex::new(Some(tx)),
            worker: parking_lot::Mutex::new(Some(worker)),
        })
    }
}

#[async_trait]
impl BackendApi for Backend {
    fn name(&self) -> &str {
        &self.pipeline.name
    }

    fn db(&self) -> &str {
        self.pipeline.http.db()
    }

    fn zone(&self) -> &str {
        self.pipeline.http.zone()
    }

    fn is_active(&self) -> bool {
        self.pipeline.http.is_active()
    }

    fn is_write_only(&self) -> bool {
        self.pipeline.http.is_write_only()
    }

    async fn write(&self, p: Bytes) -> Result<()> {
        if !self.pipeline.running.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let tx = self.tx.lock().clone();
        match tx {
            Some(tx) => tx.send(p).await.map_err(|_| Error::Closed),
            None => Err(Error::Closed),
        }
    }

    async fn query_resp(&self, req: &QueryRequest) -> Result<UpstreamResponse> {
        self.pipeline.http.query_resp(req).await
    }

    fn take_dropped_points(&self) -> i64 {
        self.pipeline.dropped_points.swap(0, Ordering::Relaxed)
    }

    /// Stop accepting writes, flush the remaining buffer, wait for
    /// in-flight flush tasks, then shut the upstream client down.
    async fn close(&self) {
        self.pipeline.running.store(false, Ordering::Release);
        drop(self.tx.lock().take());
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

/// Single-writer worker: owns the buffer, never does network I/O itself.
async fn run_worker(pl: Arc<Pipeline>, mut rx: mpsc::Receiver<Bytes>) {
    let mut buffer: Vec<u8> = Vec::new();
    let mut rows: usize = 0;
    let mut deadline: Option<tokio::time::Instant> = None;

    let mut health = tokio::time::interval(pl.check_interval);
    health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let flush_timer = async move {
            match deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            payload = rx.recv() => match payload {
                Some(p) => {
                    buffer.extend_from_slice(&p);
                    if !p.ends_with(b"\n") {
                        buffer.push(b'\n');
                    }
                    rows += 1;
                    if rows >= pl.max_rows {
                        flush(&pl, &mut buffer, &mut rows, &mut deadline);
                    } else if deadline.is_none() {
                        deadline = Some(tokio::time::Instant::now() + pl.flush_interval);
                    }
                }
                None => break,
            },
            _ = flush_timer => flush(&pl, &mut buffer, &mut rows, &mut deadline),
            _ = health.tick() => maybe_start_drain(&pl).await,
        }
    }

    // Channel closed: final flush, then wait out the detached tasks.
    flush(&pl, &mut buffer, &mut rows, &mut deadline);
    pl.tracker.close();
    pl.tracker.wait().await;
    pl.http.close();
}

/// Hand the current buffer to a detached delivery task.
fn flush(
    pl: &Arc<Pipeline>,
    buffer: &mut Vec<u8>,
    rows: &mut usize,
    deadline: &mut Option<tokio::time::Instant>,
) {
    *deadline = None;
    let batch_rows = std::mem::replace(rows, 0);
    let payload = std::mem::take(buffer);
    if payload.is_empty() {
        return;
    }
    let tracker = pl.tracker.clone();
    let pl = pl.clone();
    tracker.spawn(async move { deliver(pl, payload, batch_rows).await });
}

/// Compress and POST one batch; spool it on transient failure.
async fn deliver(pl: Arc<Pipeline>, payload: Vec<u8>, rows: usize) {
    let compressed = match compress(&payload) {
        Ok(c) => Bytes::from(c),
        Err(e) => {
            error!(backend = %pl.name, rows, "compress failed, batch lost: {e}");
            pl.dropped_points.fetch_add(rows as i64, Ordering::Relaxed);
            return;
        }
    };

    let _permit = match pl.post_gate.acquire().await {
        Ok(p) => p,
        Err(_) => return,
    };
    if pl.http.is_active() {
        match pl.http.write_compressed(compressed.clone()).await {
            Ok(()) => return,
            Err(e) if e.is_permanent() => {
                error!(backend = %pl.name, rows, "upstream rejected batch, dropping: {e}");
                pl.dropped_points.fetch_add(rows as i64, Ordering::Relaxed);
                return;
            }
            Err(e) => warn!(backend = %pl.name, "write failed, spooling: {e}"),
        }
    }

    if let Err(e) = pl.spool.lock().await.write(&compressed) {
        error!(backend = %pl.name, rows, "spool write failed, batch lost: {e}");
        pl.dropped_points.fetch_add(rows as i64, Ordering::Relaxed);
    }
}

/// Spawn the drainer if the spool has data and none is running.
async fn maybe_start_drain(pl: &Arc<Pipeline>) {
    if pl.draining.load(Ordering::Acquire) {
        return;
    }
    if !pl.spool.lock().await.is_data() {
        return;
    }
    if pl.draining.swap(true, Ordering::AcqRel) {
        return;
    }
    let pl = pl.clone();
    tokio::spawn(drain(pl));
}

/// Replay spooled records one at a time until the spool is empty. The
/// cursor is committed only on a terminal outcome (ack or permanent
/// rejection); transient failures roll it back and wait.
async fn drain(pl: Arc<Pipeline>) {
    debug!(backend = %pl.name, "spool drain started");
    loop {
        if !pl.running.load(Ordering::Acquire) {
            break;
        }
        if !pl.spool.lock().await.is_data() {
            break;
        }
        if !pl.http.is_active() {
            tokio::time::sleep(pl.rewrite_interval).await;
            continue;
        }

        let record = pl.spool.lock().await.read();
        let record = match record {
            Ok(Some(r)) => r,
            Ok(None) => break,
            Err(e) => {
                error!(backend = %pl.name, "spool read failed: {e}");
                tokio::time::sleep(pl.rewrite_interval).await;
                continue;
            }
        };

        let outcome = {
            let _permit = match pl.post_gate.acquire().await {
                Ok(p) => p,
                Err(_) => return,
            };
            pl.http.write_compressed(Bytes::from(record)).await
        };

        match outcome {
            Ok(()) => commit_cursor(&pl).await,
            Err(e) if e.is_permanent() => {
                error!(backend = %pl.name, "upstream rejected spooled record, dropping: {e}");
                commit_cursor(&pl).await;
            }
            Err(e) => {
                warn!(backend = %pl.name, "spool replay failed: {e}");
                if let Err(e) = pl.spool.lock().await.rollback_meta() {
                    error!(backend = %pl.name, "rollback meta failed: {e}");
                }
                tokio::time::sleep(pl.rewrite_interval).await;
            }
        }
    }
    pl.draining.store(false, Ordering::Release);
    debug!(backend = %pl.name, "spool drain finished");
}

async fn commit_cursor(pl: &Arc<Pipeline>) {
    if let Err(e) = pl.spool.lock().await.update_meta() {
        error!(backend = %pl.name, "update meta failed: {e}");
    }
}

fn compress(payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(payload)?;
    enc.finish()
}

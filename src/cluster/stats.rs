//! Request counters with point-in-time snapshots.
//!
//! Handlers increment atomics on a live block; the statistics tick swaps
//! in a fresh block (a single `Arc` replace, so readers never see a torn
//! struct) and serializes the displaced one as a line-protocol point.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// One block of live counters.
#[derive(Debug, Default)]
pub struct Statistics {
    pub query_requests: AtomicI64,
    pub query_requests_fail: AtomicI64,
    pub write_requests: AtomicI64,
    pub write_requests_fail: AtomicI64,
    pub ping_requests: AtomicI64,
    pub ping_requests_fail: AtomicI64,
    pub points_written: AtomicI64,
    pub points_written_fail: AtomicI64,
    pub write_request_duration: AtomicI64,
    pub query_request_duration: AtomicI64,
}

impl Statistics {
    /// Serialize as a `statistics` measurement with the given tags and a
    /// nanosecond timestamp. Field keys match what downstream dashboards
    /// already graph.
    pub fn to_line(&self, tags: &BTreeMap<String, String>, timestamp_ns: i64) -> String {
        let mut line = String::from("statistics");
        for (k, v) in tags {
            if v.is_empty() {
                continue;
            }
            line.push(',');
            line.push_str(k);
            line.push('=');
            line.push_str(v);
        }
        let fields = [
            ("statQueryRequest", &self.query_requests),
            ("statQueryRequestFail", &self.query_requests_fail),
            ("statWriteRequest", &self.write_requests),
            ("statWriteRequestFail", &self.write_requests_fail),
            ("statPingRequest", &self.ping_requests),
            ("statPingRequestFail", &self.ping_requests_fail),
            ("statPointsWritten", &self.points_written),
            ("statPointsWrittenFail", &self.points_written_fail),
            ("statQueryRequestDuration", &self.query_request_duration),
            ("statWriteRequestDuration", &self.write_request_duration),
        ];
        for (i, (key, value)) in fields.iter().enumerate() {
            line.push(if i == 0 { ' ' } else { ',' });
            line.push_str(key);
            line.push('=');
            line.push_str(&value.load(Ordering::Relaxed).to_string());
            line.push('i');
        }
        line.push(' ');
        line.push_str(&timestamp_ns.to_string());
        line
    }
}

/// Holds the live block and performs the snapshot swap.
#[derive(Default)]
pub struct StatsRecorder {
    live: RwLock<Arc<Statistics>>,
}

impl StatsRecorder {
    /// The current live block; increment its fields directly.
    pub fn current(&self) -> Arc<Statistics> {
        self.live.read().clone()
    }

    /// Replace the live block with a fresh one and return the snapshot.
    pub fn swap(&self) -> Arc<Statistics> {
        let mut live = self.live.write();
        std::mem::replace(&mut *live, Arc::new(Statistics::default()))
    }
}

//! Measurement routing table.
//!
//! Maps `(db, measurement)` to the ordered backend set that owns it.
//! Lookup precedence: exact key, then longest prefix, then `_default_`.
//! Prefix candidates are kept sorted by descending length (ties broken
//! lexicographically) so the winner is deterministic no matter how the
//! config file orders its keys.

use crate::backend::BackendApi;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Catch-all key in the keymap.
pub const DEFAULT_KEY: &str = "_default_";

#[derive(Default)]
struct DbRoutes {
    exact: HashMap<String, Vec<Arc<dyn BackendApi>>>,
    /// Exact keys re-sorted for the prefix scan; `_default_` excluded.
    prefix_order: Vec<String>,
    fallback: Option<Vec<Arc<dyn BackendApi>>>,
}

/// Immutable routing state, rebuilt wholesale on every config (re)load.
#[derive(Default)]
pub struct RoutingTable {
    dbs: HashMap<String, DbRoutes>,
}

impl RoutingTable {
    /// Build from keymaps, resolving backend names against `backends`.
    /// Unknown names are logged and skipped, never fatal.
    pub fn build(
        backends: &HashMap<String, Arc<dyn BackendApi>>,
        keymaps: &HashMap<String, HashMap<String, Vec<String>>>,
    ) -> Self {
        let mut dbs = HashMap::new();
        for (db, measurements) in keymaps {
            let mut routes = DbRoutes::default();
            for (measurement, names) in measurements {
                let mut owners = Vec::with_capacity(names.len());
                for name in names {
                    match backends.get(name) {
                        Some(b) => owners.push(b.clone()),
                        None => {
                            warn!(db = %db, measurement = %measurement, backend = %name,
                                "keymap references unknown backend, skipping");
                        }
                    }
                }
                if measurement == DEFAULT_KEY {
                    routes.fallback = Some(owners);
                } else {
                    routes.exact.insert(measurement.clone(), owners);
                }
            }
            routes.prefix_order = routes.exact.keys().cloned().collect();
            routes
                .prefix_order
                .sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
            dbs.insert(db.clone(), routes);
        }
        Self { dbs }
    }

    /// The backend set owning `measurement` in `db`, or `None`.
    pub fn lookup(&self, db: &str, measurement: &str) -> Option<Vec<Arc<dyn BackendApi>>> {
        let routes = self.dbs.get(db)?;
        if let Some(owners) = routes.exact.get(measurement) {
            return Some(owners.clone());
        }
        for key in &routes.prefix_order {
            if measurement.starts_with(key.as_str()) {
                return Some(routes.exact[key].clone());
            }
        }
        routes.fallback.clone()
    }

    /// Measurement keys routed in `db` (the `_default_` entry included),
    /// used by the metadata fan-out.
    pub fn measurements(&self, db: &str) -> Vec<(String, Vec<Arc<dyn BackendApi>>)> {
        let Some(routes) = self.dbs.get(db) else {
            return Vec::new();
        };
        let mut out: Vec<(String, Vec<Arc<dyn BackendApi>>)> = routes
            .exact
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(fallback) = &routes.fallback {
            out.push((DEFAULT_KEY.to_string(), fallback.clone()));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{QueryRequest, UpstreamResponse};
    use crate::Result;
    use async_trait::async_trait;
    use bytes::Bytes;

    struct Stub(&'static str);

    #[async_trait]
    impl BackendApi for Stub {
        fn name(&self) -> &str {
            self.0
        }
        fn db(&self) -> &str {
            "db"
        }
        fn zone(&self) -> &str {
            ""
        }
        fn is_active(&self) -> bool {
            true
        }
        fn is_write_only(&self) -> bool {
            false
        }
        async fn write(&self, _p: Bytes) -> Result<()> {
            Ok(())
        }
        async fn query_resp(&self, _req: &QueryRequest) -> Result<UpstreamResponse> {
            unimplemented!("stub")
        }
        async fn close(&self) {}
    }

    fn table(keys: &[(&str, &[&str])]) -> RoutingTable {
        let mut backends: HashMap<String, Arc<dyn BackendApi>> = HashMap::new();
        for name in ["b1", "b2", "b3"] {
            backends.insert(name.to_string(), Arc::new(Stub(name)));
        }
        let mut measurements = HashMap::new();
        for (key, names) in keys {
            measurements.insert(
                key.to_string(),
                names.iter().map(|s| s.to_string()).collect(),
            );
        }
        let mut keymaps = HashMap::new();
        keymaps.insert("a".to_string(), measurements);
        RoutingTable::build(&backends, &keymaps)
    }

    fn names(owners: &[Arc<dyn BackendApi>]) -> Vec<&str> {
        owners.iter().map(|b| b.name()).collect()
    }

    #[test]
    fn exact_match_wins() {
        let t = table(&[("cpu", &["b1"]), ("cpu_load", &["b2"]), (DEFAULT_KEY, &["b3"])]);
        assert_eq!(names(&t.lookup("a", "cpu").unwrap()), ["b1"]);
        assert_eq!(names(&t.lookup("a", "cpu_load").unwrap()), ["b2"]);
    }

    #[test]
    fn prefix_beats_default() {
        let t = table(&[("cpu_", &["b1"]), (DEFAULT_KEY, &["b2"])]);
        assert_eq!(names(&t.lookup("a", "cpu_load").unwrap()), ["b1"]);
        assert_eq!(names(&t.lookup("a", "mem").unwrap()), ["b2"]);
    }

    #[test]
    fn longest_prefix_wins_deterministically() {
        let t = table(&[("cpu", &["b1"]), ("cpu_load", &["b2"])]);
        // "cpu_load_avg" matches both; the longer key must win.
        assert_eq!(names(&t.lookup("a", "cpu_load_avg").unwrap()), ["b2"]);
        // Equal-length candidates resolve lexicographically.
        let t = table(&[("ab", &["b2"]), ("aa", &["b1"])]);
        assert_eq!(names(&t.lookup("a", "aa_x").unwrap()), ["b1"]);
    }

    #[test]
    fn default_is_not_a_prefix_candidate() {
        let t = table(&[(DEFAULT_KEY, &["b1"])]);
        // A measurement literally starting with "_default_" still resolves
        // through the fallback path, not prefix matching.
        assert_eq!(names(&t.lookup("a", "_default_x").unwrap()), ["b1"]);
        assert_eq!(names(&t.lookup("a", "anything").unwrap()), ["b1"]);
    }

    #[test]
    fn miss_without_default() {
        let t = table(&[("cpu", &["b1"])]);
        assert!(t.lookup("a", "mem").is_none());
        assert!(t.lookup("other_db", "cpu").is_none());
    }

    #[test]
    fn unknown_backend_names_are_skipped() {
        let t = table(&[("cpu", &["b1", "ghost"])]);
        assert_eq!(names(&t.lookup("a", "cpu").unwrap()), ["b1"]);
    }
}

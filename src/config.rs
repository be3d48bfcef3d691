//! JSON configuration source.
//!
//! The file layout is shared with other deployments of the proxy, so the
//! JSON field names (`BACKENDS`, `KEYMAPS`, `NODES`, `DEFAULT_NODE`,
//! `URL`, `DB`, ...) are fixed; serde renames map them onto snake_case
//! Rust fields. Zero-valued tunables are replaced with defaults at load
//! time so a minimal config stays minimal.

use crate::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::{debug, info};

/// Basic-auth credentials for one upstream.
#[derive(Debug, Clone, Deserialize)]
pub struct BasicAuth {
    #[serde(rename = "Username")]
    pub username: String,
    #[serde(rename = "Password")]
    pub password: String,
}

/// Per-backend tunables. All intervals and timeouts are milliseconds.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendConfig {
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(rename = "DB")]
    pub db: String,
    #[serde(rename = "BasicAuth", default)]
    pub basic_auth: Option<BasicAuth>,
    #[serde(rename = "Zone", default)]
    pub zone: String,
    /// Buffered lines are flushed this often even when below the row limit.
    #[serde(rename = "Interval", default)]
    pub flush_interval: u64,
    /// Write request timeout.
    #[serde(rename = "Timeout", default)]
    pub timeout_write: u64,
    /// Query request timeout.
    #[serde(rename = "TimeoutQuery", default)]
    pub timeout_query: u64,
    /// Flush as soon as this many rows are buffered.
    #[serde(rename = "MaxRowLimit", default)]
    pub max_row_limit: usize,
    /// Upstream health-probe cadence.
    #[serde(rename = "CheckInterval", default)]
    pub check_interval: u64,
    /// Pause between spool replay attempts while the upstream is down.
    #[serde(rename = "RewriteInterval", default)]
    pub rewrite_interval: u64,
    /// Excluded from read dispatch; used for replicas.
    #[serde(rename = "WriteOnly", default)]
    pub write_only: bool,
}

impl BackendConfig {
    /// Replace zero-valued tunables with their defaults.
    fn normalize(mut self) -> Self {
        if self.flush_interval == 0 {
            self.flush_interval = 1000;
        }
        if self.timeout_write == 0 {
            self.timeout_write = 10_000;
        }
        if self.timeout_query == 0 {
            self.timeout_query = 600_000;
        }
        if self.max_row_limit == 0 {
            self.max_row_limit = 10_000;
        }
        if self.check_interval == 0 {
            self.check_interval = 1000;
        }
        if self.rewrite_interval == 0 {
            self.rewrite_interval = 10_000;
        }
        self
    }
}

/// Per-node settings: where to listen and how this proxy participates in
/// the cluster.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeConfig {
    #[serde(rename = "ListenAddr", default)]
    pub listen_addr: String,
    #[serde(rename = "Zone", default)]
    pub zone: String,
    /// Comma-separated backend names acting as next-hop cluster peers.
    #[serde(rename = "Nexts", default)]
    pub nexts: String,
    /// Statistics reporting interval in seconds.
    #[serde(rename = "Interval", default)]
    pub interval: u64,
    /// HTTP keep-alive idle timeout in seconds. Accepted for config
    /// compatibility; the axum front door currently uses hyper defaults.
    #[serde(rename = "IdleTimeout", default)]
    pub idle_timeout: u64,
    #[serde(rename = "WriteTracing", default)]
    pub write_tracing: bool,
    #[serde(rename = "QueryTracing", default)]
    pub query_tracing: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ProxyConfig {
    #[serde(rename = "BACKENDS", default)]
    backends: HashMap<String, BackendConfig>,
    /// db -> measurement -> backend names
    #[serde(rename = "KEYMAPS", default)]
    keymaps: HashMap<String, HashMap<String, Vec<String>>>,
    #[serde(rename = "NODES", default)]
    nodes: HashMap<String, NodeConfig>,
    #[serde(rename = "DEFAULT_NODE", default)]
    default_node: NodeConfig,
}

/// Configuration loaded from a JSON file, scoped to one named node.
#[derive(Debug)]
pub struct FileConfigSource {
    node: String,
    cfg: ProxyConfig,
}

impl FileConfigSource {
    /// Load and decode the config file. Any decode failure is fatal.
    pub fn new(path: impl AsRef<Path>, node: &str) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| Error::IllegalConfig(format!("{}: {e}", path.display())))?;
        let cfg: ProxyConfig = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| Error::IllegalConfig(format!("{}: {e}", path.display())))?;
        Ok(Self {
            node: node.to_string(),
            cfg,
        })
    }

    /// Build from already-decoded parts; used by tests.
    pub fn from_parts(
        node: &str,
        backends: HashMap<String, BackendConfig>,
        keymaps: HashMap<String, HashMap<String, Vec<String>>>,
        nodes: HashMap<String, NodeConfig>,
        default_node: NodeConfig,
    ) -> Self {
        Self {
            node: node.to_string(),
            cfg: ProxyConfig {
                backends,
                keymaps,
                nodes,
                default_node,
            },
        }
    }

    /// This node's settings, falling back to `DEFAULT_NODE` when the node
    /// is absent or has no listen address.
    pub fn load_node(&self) -> NodeConfig {
        let mut node = self
            .cfg
            .nodes
            .get(&self.node)
            .cloned()
            .unwrap_or_else(|| self.cfg.default_node.clone());
        if node.listen_addr.is_empty() {
            node.listen_addr = self.cfg.default_node.listen_addr.clone();
        }
        if node.interval == 0 {
            node.interval = 10;
        }
        info!(node = %self.node, addr = %node.listen_addr, "node config loaded");
        node
    }

    /// All backend configs with defaults applied.
    pub fn load_backends(&self) -> HashMap<String, BackendConfig> {
        let backends: HashMap<String, BackendConfig> = self
            .cfg
            .backends
            .iter()
            .map(|(name, cfg)| (name.clone(), cfg.clone().normalize()))
            .collect();
        debug!(count = backends.len(), "backends loaded from file");
        backends
    }

    /// The raw db -> measurement -> backend-name keymaps.
    pub fn load_measurements(&self) -> HashMap<String, HashMap<String, Vec<String>>> {
        debug!(count = self.cfg.keymaps.len(), "keymaps loaded from file");
        self.cfg.keymaps.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "BACKENDS": {
            "local": {
                "URL": "http://127.0.0.1:8086",
                "DB": "metrics",
                "Zone": "east",
                "Interval": 500
            },
            "replica": {
                "URL": "http://127.0.0.1:8087",
                "DB": "metrics",
                "WriteOnly": true,
                "BasicAuth": {"Username": "u", "Password": "p"}
            }
        },
        "KEYMAPS": {
            "metrics": {
                "cpu": ["local", "replica"],
                "_default_": ["local"]
            }
        },
        "NODES": {
            "n1": {"ListenAddr": "127.0.0.1:7076", "Zone": "east", "Interval": 15}
        },
        "DEFAULT_NODE": {"ListenAddr": "127.0.0.1:6666"}
    }"#;

    fn write_sample() -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(SAMPLE.as_bytes()).unwrap();
        f
    }

    #[test]
    fn loads_backends_with_defaults() {
        let f = write_sample();
        let src = FileConfigSource::new(f.path(), "n1").unwrap();
        let backends = src.load_backends();

        let local = &backends["local"];
        assert_eq!(local.url, "http://127.0.0.1:8086");
        assert_eq!(local.flush_interval, 500, "explicit value kept");
        assert_eq!(local.timeout_write, 10_000, "default applied");
        assert_eq!(local.timeout_query, 600_000);
        assert_eq!(local.max_row_limit, 10_000);
        assert_eq!(local.check_interval, 1000);
        assert_eq!(local.rewrite_interval, 10_000);
        assert!(!local.write_only);

        let replica = &backends["replica"];
        assert!(replica.write_only);
        assert_eq!(replica.basic_auth.as_ref().unwrap().username, "u");
    }

    #[test]
    fn loads_named_node() {
        let f = write_sample();
        let src = FileConfigSource::new(f.path(), "n1").unwrap();
        let node = src.load_node();
        assert_eq!(node.listen_addr, "127.0.0.1:7076");
        assert_eq!(node.zone, "east");
        assert_eq!(node.interval, 15);
    }

    #[test]
    fn missing_node_falls_back_to_default() {
        let f = write_sample();
        let src = FileConfigSource::new(f.path(), "nope").unwrap();
        let node = src.load_node();
        assert_eq!(node.listen_addr, "127.0.0.1:6666");
        assert_eq!(node.interval, 10, "stats interval default");
    }

    #[test]
    fn loads_keymaps() {
        let f = write_sample();
        let src = FileConfigSource::new(f.path(), "n1").unwrap();
        let keymaps = src.load_measurements();
        assert_eq!(keymaps["metrics"]["cpu"], vec!["local", "replica"]);
    }

    #[test]
    fn bad_json_is_illegal_config() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"{ not json").unwrap();
        let err = FileConfigSource::new(f.path(), "n1").unwrap_err();
        assert!(matches!(err, Error::IllegalConfig(_)));
    }

    #[test]
    fn missing_file_is_illegal_config() {
        let err = FileConfigSource::new("/nonexistent/proxy.json", "n1").unwrap_err();
        assert!(matches!(err, Error::IllegalConfig(_)));
    }
}

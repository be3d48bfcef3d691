//! # fluxgate
//!
//! A sharding and high-availability proxy for InfluxDB-compatible
//! time-series databases.
//!
//! fluxgate sits in front of a set of InfluxDB instances and presents them
//! as a single logical database: line-protocol writes are routed per
//! measurement, failed batches spill to an on-disk spool and are replayed
//! when the upstream recovers, and metadata queries are fanned out and
//! merged.
//!
//! ## Key Features
//!
//! - **Measurement routing**: a `(db, measurement)` keymap with exact,
//!   longest-prefix and `_default_` matching decides which backends own
//!   each point
//! - **Write durability**: per-backend batching with gzip compression and
//!   an append-only retry spool that survives crashes
//! - **Read merging**: `SHOW MEASUREMENTS` / `TAG KEYS` / `FIELD KEYS`
//!   responses from all owning backends are unioned into one answer
//! - **Zone awareness**: reads prefer backends in the proxy's own zone
//!
//! ## Architecture
//!
//! - **Backend**: one write pipeline per upstream (buffer → flush → spool
//!   → drain)
//! - **Cluster**: the routing table, query policy and fan-out logic
//! - **Api**: the HTTP front door (`/write`, `/query`, `/ping`)

pub mod api;
pub mod backend;
pub mod cluster;
pub mod config;
pub mod influxql;
pub mod line_protocol;

mod error;

pub use error::{Error, Result};

/// Version reported on `/ping` via the `X-Influxdb-Version` header.
pub const VERSION: &str = "1.0";

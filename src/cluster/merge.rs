//! Merging of metadata query responses.
//!
//! `SHOW MEASUREMENTS`, `SHOW TAG KEYS` and `SHOW FIELD KEYS` answers from
//! several backends are unioned into one response shaped like a single
//! upstream's answer. Anything mentioning the proxy's own bookkeeping
//! (`influxdb.cluster`) is suppressed. Output ordering is sorted so the
//! merged body is deterministic regardless of which backend answered
//! first.

use crate::{Error, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::{Read, Write};

/// Substring marking series the proxy keeps for itself.
const CLUSTER_INTERNAL: &str = "influxdb.cluster";

/// One series of an upstream JSON query response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Series {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<Vec<Value>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StatementResult {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    series: Vec<Series>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ResponseBody {
    #[serde(default)]
    results: Vec<StatementResult>,
}

/// All series across every statement result of a response body.
pub fn series_array(body: &[u8]) -> Result<Vec<Series>> {
    let parsed: ResponseBody = serde_json::from_slice(body)
        .map_err(|e| Error::Serialization(format!("upstream body: {e}")))?;
    Ok(parsed.results.into_iter().flat_map(|r| r.series).collect())
}

/// Serialize series back into a response body.
pub fn body_from_series(series: Vec<Series>) -> Result<Vec<u8>> {
    let body = ResponseBody {
        results: vec![StatementResult { series }],
    };
    Ok(serde_json::to_vec(&body)?)
}

/// Union measurement listings: one output series whose values are the
/// sorted union of every first-column value.
pub fn merge_measurements(bodies: &[Vec<u8>]) -> Result<Vec<u8>> {
    let mut union: BTreeMap<String, ()> = BTreeMap::new();
    let mut template: Option<Series> = None;

    for body in bodies {
        for series in series_array(body)? {
            for row in &series.values {
                let Some(Value::String(measurement)) = row.first() else {
                    continue;
                };
                if measurement.contains(CLUSTER_INTERNAL) {
                    continue;
                }
                union.insert(measurement.clone(), ());
            }
            template = Some(series);
        }
    }

    let mut merged = template.unwrap_or_default();
    merged.values = union
        .into_keys()
        .map(|m| vec![Value::String(m)])
        .collect();
    body_from_series(vec![merged])
}

/// Union tag-key / field-key listings by series name, sorted by name.
pub fn merge_by_series_name(bodies: &[Vec<u8>]) -> Result<Vec<u8>> {
    let mut by_name: BTreeMap<String, Series> = BTreeMap::new();
    for body in bodies {
        for series in series_array(body)? {
            if series.name.contains(CLUSTER_INTERNAL) {
                continue;
            }
            by_name.insert(series.name.clone(), series);
        }
    }
    body_from_series(by_name.into_values().collect())
}

/// Gzip-wrap `data` when the respondent's body was gzip-encoded.
pub fn gzip_encode(data: &[u8], enabled: bool) -> Vec<u8> {
    if !enabled {
        return data.to_vec();
    }
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    if enc.write_all(data).is_err() {
        return data.to_vec();
    }
    enc.finish().unwrap_or_else(|_| data.to_vec())
}

/// Inflate a gzip-encoded upstream body.
pub fn gzip_decode(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| Error::Serialization(format!("gzip body: {e}")))?;
    Ok(out)
}

//! Line-protocol helpers: measurement-key extraction and timestamp
//! normalization.
//!
//! The proxy never fully parses a point. It needs exactly two things from
//! a line: the measurement key (to route it) and the trailing timestamp
//! (to normalize it to the requested precision). Everything in between is
//! treated as opaque bytes.

use crate::{Error, Result};

/// Extract the measurement key: every byte up to the first unescaped
/// space or comma. A backslash escapes the following byte.
pub fn scan_key(line: &[u8]) -> Result<String> {
    let mut key = Vec::with_capacity(line.len().min(100));
    let mut i = 0;
    while i < line.len() {
        match line[i] {
            b'\\' => {
                i += 1;
                if i >= line.len() {
                    return Err(Error::Scan("trailing escape in measurement".into()));
                }
                key.push(line[i]);
            }
            b' ' | b',' => {
                return String::from_utf8(key)
                    .map_err(|_| Error::Scan("measurement is not utf-8".into()));
            }
            c => key.push(c),
        }
        i += 1;
    }
    Err(Error::Scan("unexpected end of line".into()))
}

/// Split a line into its space-separated sections (key+tags, fields,
/// timestamp), honoring backslash escapes and double-quoted string
/// field values. A well-formed line yields two or three sections.
pub fn split_fields(line: &[u8]) -> Vec<&[u8]> {
    let mut out = Vec::with_capacity(3);
    let mut start = 0;
    let mut in_quotes = false;
    let mut i = 0;
    while i < line.len() {
        match line[i] {
            b'\\' => i += 1, // skip the escaped byte
            b'"' => in_quotes = !in_quotes,
            b' ' if !in_quotes => {
                out.push(&line[start..i]);
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    out.push(&line[start..]);
    out
}

/// Nanoseconds per unit of the given precision. Unknown precisions fall
/// back to nanoseconds, matching the upstream database.
pub fn precision_multiplier(precision: &str) -> i64 {
    match precision {
        "u" => 1_000,
        "ms" => 1_000_000,
        "s" => 1_000_000_000,
        "m" => 60 * 1_000_000_000,
        "h" => 3_600 * 1_000_000_000,
        _ => 1,
    }
}

/// Rewrite the trailing timestamp of a line to nanoseconds.
///
/// A line without a timestamp gets `now_ns` truncated to the precision
/// grid. A supplied timestamp is interpreted in the requested precision's
/// units and scaled to nanoseconds, so `1000` at precision `ms` becomes
/// `1000000000`.
pub fn rewrite_timestamp(line: &[u8], precision: &str, now_ns: i64) -> Result<Vec<u8>> {
    let sections = split_fields(line);
    let d = precision_multiplier(precision);

    let (head, nanos): (&[&[u8]], i64) = match sections.len() {
        2 => (&sections[..], now_ns / d * d),
        3 => {
            let tail = std::str::from_utf8(sections[2])
                .map_err(|_| Error::Scan("timestamp is not utf-8".into()))?;
            let t: i64 = tail
                .parse()
                .map_err(|_| Error::Scan(format!("bad timestamp: {tail}")))?;
            (&sections[..2], t.saturating_mul(d))
        }
        n => {
            return Err(Error::Scan(format!("expected 2 or 3 sections, got {n}")));
        }
    };

    let mut out = Vec::with_capacity(line.len() + 20);
    for (i, section) in head.iter().enumerate() {
        if i > 0 {
            out.push(b' ');
        }
        out.extend_from_slice(section);
    }
    out.push(b' ');
    out.extend_from_slice(nanos.to_string().as_bytes());
    Ok(out)
}

/// Trim trailing spaces, tabs and CR/LF from a line.
pub fn trim_right(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b' ' | b'\t' | b'\r' | b'\n') {
        end -= 1;
    }
    &line[..end]
}

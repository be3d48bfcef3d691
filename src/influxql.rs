//! Minimal InfluxQL probe.
//!
//! The proxy never executes queries itself; it only needs to answer three
//! questions about a statement: which database it names (for global DDL
//! broadcast), which measurement it reads (for routing), and whether it is
//! one of the metadata statements served by the merge path. A handful of
//! regexes and a small identifier scanner cover that; anything fancier is
//! the upstream database's job.

use crate::{Error, Result};
use regex::Regex;
use std::sync::OnceLock;

/// Default denylist: destructive or administrative statements the proxy
/// refuses to forward. Evaluation order (deny wins over allow) is the
/// contract; the patterns themselves are configuration.
pub const FORBIDDEN_COMMANDS: &str =
    r"(?i)^\s*(?:kill|drop\s+(?:measurement|series|shard)|delete)\b|(?i)\sinto\s+\S+\s+from\s";

/// Default allowlist: statement shapes the proxy is willing to forward.
pub const SUPPORTED_COMMANDS: &str =
    r"(?i)^\s*(?:select\s[\s\S]*\sfrom\s|show\s|create\s+database\b|drop\s+database\b)";

/// Statements that must be broadcast to every backend of the target
/// database: database/user/retention DDL and privilege management.
pub const GLOBAL_COMMANDS: &str = r"(?i)^\s*(?:(?:create|drop)\s+database\b|(?:create|drop|alter)\s+retention\s+policy\b|(?:create|drop)\s+user\b|set\s+password\b|grant\b|revoke\b)";

const SHOW_COMMANDS: &str = r"(?i)^\s*show\s+(measurements|tag\s+keys|field\s+keys|retention\s+policies)\b";

/// The metadata statements answered by fan-out and merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShowKind {
    Measurements,
    TagKeys,
    FieldKeys,
    RetentionPolicies,
}

/// Classify a metadata statement, or `None` if it is not one the cluster
/// merges locally.
pub fn show_kind(q: &str) -> Option<ShowKind> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(SHOW_COMMANDS).expect("show command pattern"));
    let captured = re.captures(q)?;
    let kind = captured.get(1)?.as_str().to_ascii_lowercase();
    if kind.starts_with("measurements") {
        Some(ShowKind::Measurements)
    } else if kind.starts_with("tag") {
        Some(ShowKind::TagKeys)
    } else if kind.starts_with("field") {
        Some(ShowKind::FieldKeys)
    } else {
        Some(ShowKind::RetentionPolicies)
    }
}

/// Whether the statement is global DDL that fans out to every backend of
/// its database.
pub fn is_global(q: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(GLOBAL_COMMANDS).expect("global command pattern"))
        .is_match(q)
}

/// Extract the database a global statement names: the identifier after
/// `DATABASE`, or after `ON` for retention-policy and privilege DDL.
pub fn get_database(q: &str) -> Result<String> {
    for keyword in ["database", "on"] {
        if let Some(pos) = keyword_position(q, keyword) {
            let rest = &q[pos..];
            if let Some(ident) = scan_identifier(rest) {
                return Ok(ident);
            }
        }
    }
    Err(Error::NoDatabase(q.to_string()))
}

/// Extract the single `FROM` target of a point or metadata query,
/// stripping any `db.rp.` qualification and surrounding quotes.
pub fn get_measurement(q: &str) -> Result<String> {
    let pos =
        keyword_position(q, "from").ok_or_else(|| Error::NoMeasurement(q.to_string()))?;
    let mut rest = &q[pos..];

    // Walk the dotted identifier chain; the measurement is the last segment.
    let mut last = None;
    loop {
        match scan_identifier(rest) {
            Some(ident) => {
                let consumed = consumed_len(rest, &ident);
                rest = rest[consumed..].trim_start();
                last = Some(ident);
                if let Some(tail) = rest.strip_prefix('.') {
                    rest = tail.trim_start();
                    continue;
                }
                break;
            }
            None => break,
        }
    }
    last.ok_or_else(|| Error::NoMeasurement(q.to_string()))
}

/// Byte offset just past the first standalone occurrence of `keyword`,
/// case-insensitive, or `None`.
fn keyword_position(q: &str, keyword: &str) -> Option<usize> {
    let lower = q.to_ascii_lowercase();
    let bytes = lower.as_bytes();
    let mut search = 0;
    while let Some(found) = lower[search..].find(keyword) {
        let start = search + found;
        let end = start + keyword.len();
        let before_ok = start == 0 || !bytes[start - 1].is_ascii_alphanumeric();
        let after_ok = end >= bytes.len() || !bytes[end].is_ascii_alphanumeric();
        if before_ok && after_ok {
            return Some(end);
        }
        search = end;
    }
    None
}

/// Scan one identifier from the front of `rest` (after trimming leading
/// whitespace): either a double-quoted segment (backslash escapes) or a
/// bare token ending at whitespace, `.`, `;`, `,` or `)`.
fn scan_identifier(rest: &str) -> Option<String> {
    let rest = rest.trim_start();
    let mut chars = rest.char_indices();
    let (_, first) = chars.next()?;
    if first == '"' {
        let mut ident = String::new();
        let mut escaped = false;
        for (_, c) in chars {
            if escaped {
                ident.push(c);
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                return Some(ident);
            } else {
                ident.push(c);
            }
        }
        None // unterminated quote
    } else {
        let end = rest
            .find(|c: char| c.is_whitespace() || matches!(c, '.' | ';' | ',' | ')'))
            .unwrap_or(rest.len());
        if end == 0 {
            return None;
        }
        Some(rest[..end].to_string())
    }
}

/// How many bytes of `rest` (including leading whitespace and quotes) the
/// scanned identifier occupied.
fn consumed_len(rest: &str, ident: &str) -> usize {
    let leading = rest.len() - rest.trim_start().len();
    let trimmed = rest.trim_start();
    if trimmed.starts_with('"') {
        // Find the closing quote by re-scanning; escapes make the quoted
        // form longer than the identifier itself.
        let mut escaped = false;
        for (i, c) in trimmed.char_indices().skip(1) {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                return leading + i + 1;
            }
        }
        leading + trimmed.len()
    } else {
        leading + ident.len()
    }
}

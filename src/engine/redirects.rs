//! Redirect-rule CSV parsing.
//!
//! Sites can ship a `source,destination` CSV that the archive's hosting
//! config replays. The source column may carry `%`-escapes for `?`, `&`,
//! `_` and `=` (spreadsheet exports mangle them otherwise); a query string
//! in the source is lifted into `has` conditions; numeric `%1`, `%2` tokens
//! in the destination become positional captures.

use std::path::Path;

use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};

/// One `has`-condition on a redirect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectHas {
    #[serde(rename = "type")]
    pub kind: String,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// One redirect rule in the output config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectRule {
    pub source: String,
    pub destination: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has: Option<Vec<RedirectHas>>,
}

/// De-escape the `%`-sequences allowed in the source column.
fn unescape_source(raw: &str) -> String {
    raw.replace("%3F", "?")
        .replace("%3f", "?")
        .replace("%26", "&")
        .replace("%5F", "_")
        .replace("%5f", "_")
        .replace("%3D", "=")
        .replace("%3d", "=")
}

/// Rewrite `%1`, `%2`… destination tokens into positional captures.
fn convert_destination_captures(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '%' {
            if let Some(d) = chars.peek().copied().filter(|d| d.is_ascii_digit()) {
                chars.next();
                out.push('$');
                out.push(d);
                continue;
            }
        }
        out.push(c);
    }
    out
}

fn ensure_leading_slash(path: &str) -> String {
    if path.starts_with('/') || path.starts_with("http") {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

/// Parse one CSV row into a rule.
fn parse_row(source_raw: &str, destination_raw: &str) -> Option<RedirectRule> {
    let source_raw = unescape_source(source_raw.trim());
    let destination_raw = destination_raw.trim();
    if source_raw.is_empty() || destination_raw.is_empty() {
        return None;
    }

    let (path, query) = match source_raw.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (source_raw.as_str(), None),
    };

    let has = query.map(|query| {
        query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((key, value)) => RedirectHas {
                    kind: "query".to_string(),
                    key: key.to_string(),
                    value: (!value.is_empty()).then(|| value.to_string()),
                },
                None => RedirectHas {
                    kind: "query".to_string(),
                    key: pair.to_string(),
                    value: None,
                },
            })
            .collect::<Vec<_>>()
    });

    Some(RedirectRule {
        source: ensure_leading_slash(path),
        destination: ensure_leading_slash(&convert_destination_captures(destination_raw)),
        has: has.filter(|h| !h.is_empty()),
    })
}

/// Load redirect rules from a CSV file. The header row is optional; rows
/// that don't parse are logged and skipped.
pub fn parse_redirects_csv(path: &Path) -> Result<Vec<RedirectRule>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("failed to open redirects CSV {}", path.display()))?;

    let mut rules = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                warn!("Skipping malformed redirect row {}: {e}", index + 1);
                continue;
            }
        };
        let source = record.get(0).unwrap_or("");
        let destination = record.get(1).unwrap_or("");

        // A header row reads as source/destination labels, not paths.
        if index == 0 && source.eq_ignore_ascii_case("source") {
            continue;
        }
        if let Some(rule) = parse_row(source, destination) {
            rules.push(rule);
        }
    }
    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn plain_rows_get_leading_slashes() {
        let rule = parse_row("old-page", "new-page").expect("rule");
        assert_eq!(rule.source, "/old-page");
        assert_eq!(rule.destination, "/new-page");
        assert!(rule.has.is_none());
    }

    #[test]
    fn query_lifts_into_has_conditions() {
        let rule = parse_row("/search%3Fq%3Dshoes", "/products").expect("rule");
        assert_eq!(rule.source, "/search");
        let has = rule.has.expect("has");
        assert_eq!(has.len(), 1);
        assert_eq!(has[0].kind, "query");
        assert_eq!(has[0].key, "q");
        assert_eq!(has[0].value.as_deref(), Some("shoes"));
    }

    #[test]
    fn numeric_tokens_become_captures() {
        let rule = parse_row("/blog/:slug", "/articles/%1").expect("rule");
        assert_eq!(rule.destination, "/articles/$1");
    }

    #[test]
    fn csv_file_skips_header_and_bad_rows() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "source,destination").expect("write");
        writeln!(file, "/old,/new").expect("write");
        writeln!(file, ",").expect("write");
        writeln!(file, "/a%3Fx%3D1,/b").expect("write");

        let rules = parse_redirects_csv(file.path()).expect("parse");
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].source, "/old");
        assert_eq!(rules[1].source, "/a");
        assert!(rules[1].has.is_some());
    }
}

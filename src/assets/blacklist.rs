//! Download blacklist: per-site rules merged with the global settings list.
//!
//! Rule grammar:
//! - an absolute URL matches exactly, compared after stripping the
//!   candidate's query and fragment;
//! - a rule ending in `*` is a string-prefix match against the candidate URL
//!   (query preserved) or its query-less form;
//! - `domain:<host>` matches when the candidate's host equals the value or
//!   ends with `.<value>`.

use dashmap::DashSet;
use log::info;

use crate::utils::url_utils::{host_of, strip_query_and_fragment};

/// One parsed blacklist rule.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Rule {
    Exact(String),
    Prefix(String),
    Domain(String),
}

impl Rule {
    fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if let Some(host) = raw.strip_prefix("domain:") {
            let host = host.trim().to_ascii_lowercase();
            return (!host.is_empty()).then(|| Self::Domain(host));
        }
        if let Some(prefix) = raw.strip_suffix('*') {
            return Some(Self::Prefix(prefix.to_string()));
        }
        // Exact rules are normalized once at parse time; normalization is
        // idempotent so re-parsing a stored rule is a no-op.
        Some(Self::Exact(strip_query_and_fragment(raw).to_string()))
    }

    fn matches(&self, url: &str) -> bool {
        match self {
            Self::Exact(rule) => strip_query_and_fragment(url) == rule,
            Self::Prefix(prefix) => {
                url.starts_with(prefix.as_str())
                    || strip_query_and_fragment(url).starts_with(prefix.as_str())
            }
            Self::Domain(host) => match host_of(url) {
                Some(candidate) => {
                    let candidate = candidate.to_ascii_lowercase();
                    candidate == *host || candidate.ends_with(&format!(".{host}"))
                }
                None => false,
            },
        }
    }

    fn display(&self) -> String {
        match self {
            Self::Exact(rule) => rule.clone(),
            Self::Prefix(prefix) => format!("{prefix}*"),
            Self::Domain(host) => format!("domain:{host}"),
        }
    }
}

/// Merged blacklist with once-per-(rule, url) skip logging.
#[derive(Debug, Default)]
pub struct Blacklist {
    rules: Vec<Rule>,
    logged: DashSet<(String, String)>,
}

impl Blacklist {
    /// Build from per-site rules plus the global list. Unparseable rules are
    /// dropped silently (an empty line is the only way to be unparseable).
    pub fn from_rules<I, S>(rules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            rules: rules
                .into_iter()
                .filter_map(|raw| Rule::parse(raw.as_ref()))
                .collect(),
            logged: DashSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Check `url` against every rule. The first matching rule wins, and the
    /// skip is logged once per (rule, url) pair for the crawl's lifetime.
    pub fn matches(&self, url: &str) -> bool {
        for rule in &self.rules {
            if rule.matches(url) {
                let pair = (rule.display(), url.to_string());
                if self.logged.insert(pair) {
                    info!("Blacklist rule {} skipped {url}", rule.display());
                }
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_rule_ignores_query_and_fragment() {
        let bl = Blacklist::from_rules(["https://cdn.example.com/a.js"]);
        assert!(bl.matches("https://cdn.example.com/a.js"));
        assert!(bl.matches("https://cdn.example.com/a.js?v=1#frag"));
        assert!(!bl.matches("https://cdn.example.com/a.js.map"));
    }

    #[test]
    fn prefix_rule_preserves_query() {
        let bl = Blacklist::from_rules(["https://cdn.example.com/assets/*"]);
        assert!(bl.matches("https://cdn.example.com/assets/x.js?v=1"));
        assert!(bl.matches("https://cdn.example.com/assets/deep/y.css"));
        assert!(!bl.matches("https://cdn.example.com/other/x.js"));
    }

    #[test]
    fn domain_rule_matches_host_and_subdomains() {
        let bl = Blacklist::from_rules(["domain:tracker.io"]);
        assert!(bl.matches("https://tracker.io/pixel.gif"));
        assert!(bl.matches("https://cdn.tracker.io/pixel.gif"));
        assert!(!bl.matches("https://nottracker.io/pixel.gif"));
    }

    #[test]
    fn normalization_is_idempotent() {
        let raw = "https://cdn.example.com/a.js?v=1#x";
        let once = strip_query_and_fragment(raw);
        let twice = strip_query_and_fragment(once);
        assert_eq!(once, twice);
    }

    #[test]
    fn logs_once_per_rule_url_pair() {
        let bl = Blacklist::from_rules(["https://cdn.example.com/assets/*"]);
        assert!(bl.matches("https://cdn.example.com/assets/x.js?v=1"));
        assert!(bl.matches("https://cdn.example.com/assets/x.js?v=1"));
        assert_eq!(bl.logged.len(), 1);
    }
}

//! URL resolution and normalization helpers used across the crawl pipeline.

use anyhow::{Context, Result};
use url::Url;

/// Resolve a potentially relative URL against a base URL.
///
/// Re-encodes the query string so unencoded special characters coming out of
/// HTML (Google Fonts is the usual offender, with `:`, `,`, `@`, `;` in its
/// query) survive a strict origin server.
pub fn resolve_url(base_url: &str, url: &str) -> Result<String> {
    let base = Url::parse(base_url).context("Invalid base URL")?;
    let mut resolved = base.join(url).context("Failed to resolve URL")?;

    if resolved.query().is_some() {
        let query_pairs: Vec<(String, String)> = resolved
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        resolved.query_pairs_mut().clear();
        for (key, value) in query_pairs {
            resolved.query_pairs_mut().append_pair(&key, &value);
        }
    }

    Ok(resolved.to_string())
}

/// Strip the fragment from a URL string, leaving everything else intact.
pub fn strip_fragment(url: &str) -> &str {
    match url.find('#') {
        Some(idx) => &url[..idx],
        None => url,
    }
}

/// Strip the query and fragment from a URL string.
pub fn strip_query_and_fragment(url: &str) -> &str {
    let without_fragment = strip_fragment(url);
    match without_fragment.find('?') {
        Some(idx) => &without_fragment[..idx],
        None => without_fragment,
    }
}

/// Host of a URL, if it parses and has one.
pub fn host_of(url: &str) -> Option<String> {
    Url::parse(url).ok()?.host_str().map(str::to_string)
}

/// True when both URLs parse and share scheme + host + port.
pub fn same_origin(a: &str, b: &str) -> bool {
    match (Url::parse(a), Url::parse(b)) {
        (Ok(a), Ok(b)) => a.origin() == b.origin(),
        _ => false,
    }
}

/// Lowercased file extension of a URL path, ignoring query and fragment.
pub fn url_extension(url: &str) -> Option<String> {
    let path = strip_query_and_fragment(url);
    let basename = path.rsplit('/').next()?;
    let (_, ext) = basename.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > 8 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Basename of a URL path (last segment), query and fragment excluded.
pub fn url_basename(url: &str) -> String {
    let path = strip_query_and_fragment(url);
    let trimmed = path.trim_end_matches('/');
    trimmed
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty() && !s.contains(':'))
        .unwrap_or("index")
        .to_string()
}

/// Slugify a name for use in archive filenames: lowercase, runs of anything
/// outside `[a-z0-9]` collapsed to a single dash, dashes trimmed.
pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    let trimmed = out.trim_matches('-').to_string();
    if trimmed.is_empty() {
        "asset".to_string()
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_relative_urls() {
        let result = resolve_url("https://example.com/path/page.html", "../styles/main.css")
            .expect("resolve");
        assert_eq!(result, "https://example.com/styles/main.css");
    }

    #[test]
    fn reencodes_google_fonts_query() {
        let url = "https://fonts.googleapis.com/css2?family=Inter:wght@400;700&display=swap";
        let result = resolve_url("https://example.com/", url).expect("resolve");
        assert!(result.starts_with("https://fonts.googleapis.com/css2?"));
        assert!(result.contains("%40"), "@ should be encoded");
        assert!(result.contains("%3B"), "; should be encoded");
    }

    #[test]
    fn strips_fragment_only() {
        assert_eq!(strip_fragment("https://a.com/x?q=1#frag"), "https://a.com/x?q=1");
        assert_eq!(strip_fragment("https://a.com/x"), "https://a.com/x");
    }

    #[test]
    fn extension_ignores_query() {
        assert_eq!(url_extension("https://a.com/app.js?v=2").as_deref(), Some("js"));
        assert_eq!(url_extension("https://a.com/path/"), None);
        assert_eq!(url_extension("https://a.com/noext"), None);
    }

    #[test]
    fn slugify_collapses_and_trims() {
        assert_eq!(slugify("Hero Image (final).PNG"), "hero-image-final-png");
        assert_eq!(slugify("___"), "asset");
    }
}

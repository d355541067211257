//! CSS reference rewriting.
//!
//! Scans `url(...)` tokens, downloads each referenced asset and substitutes
//! the archive-local path, preserving the original quote style. Used both
//! for downloaded stylesheets and for inline `<style>`/`style=""` content.

use lazy_static::lazy_static;
use log::debug;
use regex::Regex;

use super::{AssetCategory, AssetDownloader};
use crate::utils::resolve_url;

lazy_static! {
    // The regex crate has no backreferences, so the three quote styles are
    // spelled out as alternatives.
    static ref CSS_URL_RE: Regex = Regex::new(
        r#"url\(\s*(?:"([^"]*)"|'([^']*)'|([^'")\s][^)]*?))\s*\)"#
    )
    .expect("hardcoded CSS url() regex must compile");
}

#[derive(Debug)]
struct UrlToken {
    start: usize,
    end: usize,
    quote: &'static str,
    value: String,
}

fn scan_url_tokens(css: &str) -> Vec<UrlToken> {
    CSS_URL_RE
        .captures_iter(css)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let (quote, value) = if let Some(m) = caps.get(1) {
                ("\"", m.as_str())
            } else if let Some(m) = caps.get(2) {
                ("'", m.as_str())
            } else {
                ("", caps.get(3)?.as_str())
            };
            Some(UrlToken {
                start: whole.start(),
                end: whole.end(),
                quote,
                value: value.trim().to_string(),
            })
        })
        .collect()
}

/// Rewrite every rewritable `url(...)` in `css`, resolving references
/// against the stylesheet's own URL.
pub(super) async fn rewrite_css(dl: &AssetDownloader, css: &str, css_url: &str) -> String {
    let tokens = scan_url_tokens(css);
    if tokens.is_empty() {
        return css.to_string();
    }

    let mut out = String::with_capacity(css.len());
    let mut cursor = 0usize;

    for token in tokens {
        out.push_str(&css[cursor..token.start]);
        cursor = token.end;

        let replacement = rewrite_token_value(dl, &token.value, css_url).await;
        out.push_str("url(");
        out.push_str(token.quote);
        out.push_str(&replacement);
        out.push_str(token.quote);
        out.push(')');
    }
    out.push_str(&css[cursor..]);
    out
}

async fn rewrite_token_value(dl: &AssetDownloader, value: &str, css_url: &str) -> String {
    if value.is_empty() || value.starts_with("data:") || value.starts_with('#') {
        return value.to_string();
    }

    let absolute = match resolve_url(css_url, value) {
        Ok(url) => url,
        Err(e) => {
            debug!("Unresolvable CSS reference {value:?} in {css_url}: {e}");
            return value.to_string();
        }
    };

    // Classify by extension; unknown references (e.g. url(//host/page))
    // stay as they are.
    let category = AssetCategory::from_url(&absolute).unwrap_or(AssetCategory::Image);

    // An @import cycle must not wait on its own download.
    if dl.is_rewriting(&absolute) {
        return value.to_string();
    }
    dl.download_asset(&absolute, category).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_all_three_quote_styles() {
        let css = r#"
            .a { background: url("/img/a.png"); }
            .b { background: url('/img/b.png'); }
            .c { background: url(/img/c.png); }
            .d { background: url(data:image/png;base64,AAAA); }
        "#;
        let tokens = scan_url_tokens(css);
        assert_eq!(tokens.len(), 4);
        assert_eq!(tokens[0].quote, "\"");
        assert_eq!(tokens[1].quote, "'");
        assert_eq!(tokens[2].quote, "");
        assert_eq!(tokens[0].value, "/img/a.png");
        assert_eq!(tokens[3].value, "data:image/png;base64,AAAA");
    }

    #[test]
    fn ignores_whitespace_padding() {
        let tokens = scan_url_tokens("a { src: url(  '/f/x.woff2'  ); }");
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].value, "/f/x.woff2");
    }
}

//! Conservative JavaScript rewriting.
//!
//! Full JS parsing is out of scope; this pass only touches string literals
//! that unambiguously look like asset paths, dynamic `import("…")`
//! specifiers and `__webpack_require__.p + "…"` concatenations (all of which
//! fall out of the same literal scan). Template literals containing
//! interpolation are skipped.
//!
//! Before any rewriting, the module scans for bundler chunk manifests of the
//! shape `<ident>.u = (id) => "<prefix>" + {…}[id] + "<suffix>"` and
//! stockpiles every chunk they name. The manifest function itself is left
//! untouched: the runtime derives its public path from the script's own URL,
//! so chunks stored next to the script under their original basenames
//! resolve without edits.

use lazy_static::lazy_static;
use log::{debug, warn};
use regex::Regex;

use super::{AssetCategory, AssetDownloader};
use crate::utils::constants::ALLOWED_CDN_HOSTS;
use crate::utils::url_utils::{host_of, same_origin};
use crate::utils::resolve_url;

lazy_static! {
    /// Quoted string literals, including escaped quotes, plus backtick
    /// template literals (filtered for interpolation later).
    static ref STRING_LITERAL_RE: Regex = Regex::new(
        r#""((?:[^"\\\n]|\\.)*)"|'((?:[^'\\\n]|\\.)*)'|`((?:[^`\\]|\\.)*)`"#
    )
    .expect("hardcoded string literal regex must compile");

    /// A relative or root-absolute path ending in a known asset extension.
    static ref ASSET_PATH_RE: Regex = Regex::new(
        r"^(?:\.{0,2}/)?[A-Za-z0-9._-]+(?:/[A-Za-z0-9._-]+)*\.(?:js|mjs|cjs|css|png|jpe?g|gif|svg|webp|avif|ico|woff2?|ttf|otf|eot|mp4|webm|mp3)$"
    )
    .expect("hardcoded asset path regex must compile");

    /// Head of a chunk manifest: `<ident>.u = (id) => "<prefix>" + {`
    /// in either arrow or classic-function form.
    static ref CHUNK_MANIFEST_HEAD_RE: Regex = Regex::new(
        r#"[A-Za-z_$][A-Za-z0-9_$]*\.u\s*=\s*(?:\(?\s*[A-Za-z_$][A-Za-z0-9_$]*\s*\)?\s*=>\s*|function\s*\(\s*[A-Za-z_$][A-Za-z0-9_$]*\s*\)\s*\{\s*return\s+)"([^"]*)"\s*\+\s*\{"#
    )
    .expect("hardcoded chunk manifest regex must compile");

    /// `id: "hash"` pairs inside the manifest map.
    static ref CHUNK_PAIR_RE: Regex = Regex::new(r#"(?:"[^"]*"|\d+)\s*:\s*"([^"]+)""#)
        .expect("hardcoded chunk pair regex must compile");

    /// The map lookup tail: `}[id] + "<suffix>"`.
    static ref CHUNK_SUFFIX_RE: Regex =
        Regex::new(r#"^\s*\[[^\]]*\]\s*\+\s*"([^"]*)""#)
            .expect("hardcoded chunk suffix regex must compile");
}

/// One discovered chunk manifest.
#[derive(Debug, PartialEq)]
pub(super) struct ChunkManifest {
    pub prefix: String,
    pub suffix: String,
    pub hashes: Vec<String>,
}

/// Extract every chunk manifest from a script.
pub(super) fn scan_chunk_manifests(js: &str) -> Vec<ChunkManifest> {
    let mut manifests = Vec::new();

    for head in CHUNK_MANIFEST_HEAD_RE.captures_iter(js) {
        let whole = match head.get(0) {
            Some(m) => m,
            None => continue,
        };
        let prefix = head.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();

        // The map literal starts at the `{` the head regex ends on; bundler
        // manifests never nest braces inside it.
        let rest = &js[whole.end()..];
        let close = match rest.find('}') {
            Some(idx) => idx,
            None => continue,
        };
        let map_body = &rest[..close];
        let hashes: Vec<String> = CHUNK_PAIR_RE
            .captures_iter(map_body)
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .collect();
        if hashes.is_empty() {
            continue;
        }

        let suffix = CHUNK_SUFFIX_RE
            .captures(&rest[close + 1..])
            .and_then(|c| c.get(1).map(|m| m.as_str().to_string()))
            .unwrap_or_default();

        manifests.push(ChunkManifest {
            prefix,
            suffix,
            hashes,
        });
    }

    manifests
}

/// Whether a chunk URL resolved from a manifest may be downloaded: same
/// origin as the script, or one of the known publishing CDN hosts.
fn chunk_origin_allowed(chunk_url: &str, js_url: &str) -> bool {
    if same_origin(chunk_url, js_url) {
        return true;
    }
    match host_of(chunk_url) {
        Some(host) => ALLOWED_CDN_HOSTS.contains(&host.as_str()),
        None => false,
    }
}

/// Download every chunk listed by the manifests in `js`, storing them next
/// to the script under their original basenames.
async fn stockpile_chunks(dl: &AssetDownloader, js: &str, js_url: &str) {
    for manifest in scan_chunk_manifests(js) {
        debug!(
            "Chunk manifest in {js_url}: {} chunks ({}…{})",
            manifest.hashes.len(),
            manifest.prefix,
            manifest.suffix
        );
        for hash in &manifest.hashes {
            let name = format!("{}{}{}", manifest.prefix, hash, manifest.suffix);
            let chunk_url = match resolve_url(js_url, &name) {
                Ok(url) => url,
                Err(e) => {
                    warn!("Unresolvable chunk {name} from {js_url}: {e}");
                    continue;
                }
            };
            if !chunk_origin_allowed(&chunk_url, js_url) {
                debug!("Skipping off-origin chunk {chunk_url}");
                continue;
            }
            dl.download_verbatim(&chunk_url, AssetCategory::Js).await;
        }
    }
}

fn literal_replacement<'a>(
    dl: &'a AssetDownloader,
    inner: &'a str,
    js_url: &'a str,
) -> impl std::future::Future<Output = Option<String>> + 'a {
    async move {
        if !ASSET_PATH_RE.is_match(inner) {
            return None;
        }
        let absolute = resolve_url(js_url, inner).ok()?;
        let category = AssetCategory::from_url(&absolute)?;
        // Scripts naming each other would otherwise wait on themselves.
        if dl.is_rewriting(&absolute) {
            return None;
        }
        let local = dl.download_asset(&absolute, category).await;
        // A failed or gated download returns the absolute URL; keep the
        // original literal in that case.
        if local.starts_with('/') {
            Some(local)
        } else {
            None
        }
    }
}

/// Rewrite asset-path string literals in `js` and stockpile chunk-manifest
/// chunks. Returns the rewritten script.
pub(super) async fn rewrite_js(dl: &AssetDownloader, js: &str, js_url: &str) -> String {
    stockpile_chunks(dl, js, js_url).await;

    let matches: Vec<(usize, usize, String, char)> = STRING_LITERAL_RE
        .captures_iter(js)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let (inner, quote) = if let Some(m) = caps.get(1) {
                (m.as_str(), '"')
            } else if let Some(m) = caps.get(2) {
                (m.as_str(), '\'')
            } else {
                let m = caps.get(3)?;
                if m.as_str().contains("${") {
                    return None;
                }
                (m.as_str(), '`')
            };
            Some((whole.start(), whole.end(), inner.to_string(), quote))
        })
        .collect();

    if matches.is_empty() {
        return js.to_string();
    }

    let mut out = String::with_capacity(js.len());
    let mut cursor = 0usize;
    for (start, end, inner, quote) in matches {
        out.push_str(&js[cursor..start]);
        cursor = end;
        match literal_replacement(dl, &inner, js_url).await {
            Some(local) => {
                out.push(quote);
                out.push_str(&local);
                out.push(quote);
            }
            None => out.push_str(&js[start..end]),
        }
    }
    out.push_str(&js[cursor..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_arrow_manifest() {
        let js = r#"r.u=e=>"main.achunk."+{0:"abc",1:"def"}[e]+".js""#;
        let manifests = scan_chunk_manifests(js);
        assert_eq!(manifests.len(), 1);
        assert_eq!(manifests[0].prefix, "main.achunk.");
        assert_eq!(manifests[0].suffix, ".js");
        assert_eq!(manifests[0].hashes, vec!["abc", "def"]);
    }

    #[test]
    fn parses_function_manifest() {
        let js = r#"n.u = function(e) { return "chunk." + {14:"9f2e01",821:"77ab3c"}[e] + ".min.js" }"#;
        let manifests = scan_chunk_manifests(js);
        assert_eq!(manifests.len(), 1);
        assert_eq!(manifests[0].prefix, "chunk.");
        assert_eq!(manifests[0].suffix, ".min.js");
        assert_eq!(manifests[0].hashes, vec!["9f2e01", "77ab3c"]);
    }

    #[test]
    fn asset_path_pattern_is_conservative() {
        assert!(ASSET_PATH_RE.is_match("/js/app.js"));
        assert!(ASSET_PATH_RE.is_match("./media/video.mp4"));
        assert!(ASSET_PATH_RE.is_match("images/logo.svg"));
        assert!(!ASSET_PATH_RE.is_match(".js"));
        assert!(!ASSET_PATH_RE.is_match("main.achunk."));
        assert!(!ASSET_PATH_RE.is_match("https://example.com/app.js"));
        assert!(!ASSET_PATH_RE.is_match("hello world.js"));
    }

    #[test]
    fn chunk_origin_gate() {
        assert!(chunk_origin_allowed(
            "https://example.com/js/a.js",
            "https://example.com/js/app.js"
        ));
        assert!(chunk_origin_allowed(
            "https://assets.website-files.com/js/a.js",
            "https://example.com/js/app.js"
        ));
        assert!(!chunk_origin_allowed(
            "https://evil.example.net/js/a.js",
            "https://example.com/js/app.js"
        ));
    }
}

//! Module-federation graph mirroring.
//!
//! Pages can embed custom code through `<code-island data-loader='…'>`
//! elements whose loader JSON points at a remote module
//! (`clientModuleUrl`). The module ships an `mf-manifest.json` next to it
//! describing its entry, exposed chunks and CSS. The whole graph is mirrored
//! into a deterministic local directory
//! (`code-components/<host>/<module-path>/`) so the island boots offline:
//! every listed chunk is downloaded under its original name, `publicPath` is
//! pointed at the local directory and the loader JSON is rewritten to the
//! local module URL.

use log::{debug, warn};
use serde_json::Value;
use url::Url;

use crate::assets::AssetDownloader;
use crate::utils::resolve_url;
use crate::utils::url_utils::url_basename;

/// Rewrite one `data-loader` attribute value. Returns `None` when the JSON
/// has no module URL or the mirror failed entirely (the attribute is then
/// left untouched and the island loads from the network when online).
pub(super) async fn mirror_island_loader(
    assets: &AssetDownloader,
    loader_json: &str,
) -> Option<String> {
    let mut loader: Value = serde_json::from_str(loader_json).ok()?;

    let module_urls = collect_client_module_urls(&loader);
    if module_urls.is_empty() {
        return None;
    }

    let mut replacements = Vec::new();
    for module_url in module_urls {
        match mirror_module(assets, &module_url).await {
            Ok(local) => replacements.push((module_url, local)),
            Err(e) => warn!("Failed to mirror code component {module_url}: {e:#}"),
        }
    }
    if replacements.is_empty() {
        return None;
    }

    for (from, to) in &replacements {
        replace_client_module_urls(&mut loader, from, to);
    }
    serde_json::to_string(&loader).ok()
}

/// Mirror one module and its manifest tree; returns the local module URL.
async fn mirror_module(assets: &AssetDownloader, module_url: &str) -> anyhow::Result<String> {
    let parsed = Url::parse(module_url)?;
    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("module URL has no host"))?;

    let module_basename = url_basename(module_url);
    let dir_path = parsed
        .path()
        .trim_start_matches('/')
        .strip_suffix(&module_basename)
        .unwrap_or("")
        .trim_matches('/');

    let local_prefix = if dir_path.is_empty() {
        format!("code-components/{host}")
    } else {
        format!("code-components/{host}/{dir_path}")
    };

    // The entry module itself, stored verbatim.
    let entry_bytes = assets.fetch_raw(module_url).await?;
    let local_module = assets
        .write_at_relative_path(&format!("{local_prefix}/{module_basename}"), &entry_bytes)
        .await?;

    // The manifest is optional; a bare module without one still works.
    let manifest_url = resolve_url(module_url, "mf-manifest.json")?;
    match assets.fetch_text(&manifest_url).await {
        Ok(manifest_text) => {
            if let Ok(mut manifest) = serde_json::from_str::<Value>(&manifest_text) {
                mirror_manifest_assets(assets, &mut manifest, module_url, &local_prefix).await;
                rewrite_public_paths(&mut manifest, &format!("/{local_prefix}/"));
                let rendered = serde_json::to_string_pretty(&manifest)?;
                assets
                    .write_at_relative_path(
                        &format!("{local_prefix}/mf-manifest.json"),
                        rendered.as_bytes(),
                    )
                    .await?;
            }
        }
        Err(e) => debug!("No manifest for {module_url}: {e:#}"),
    }

    Ok(local_module)
}

fn collect_client_module_urls(value: &Value) -> Vec<String> {
    let mut urls = Vec::new();
    walk_strings(value, &mut |key, s| {
        if key == Some("clientModuleUrl") && s.starts_with("http") {
            urls.push(s.to_string());
        }
    });
    urls.sort();
    urls.dedup();
    urls
}

fn replace_client_module_urls(value: &mut Value, from: &str, to: &str) {
    match value {
        Value::Object(map) => {
            for (key, v) in map.iter_mut() {
                if key == "clientModuleUrl" {
                    if v.as_str() == Some(from) {
                        *v = Value::String(to.to_string());
                    }
                } else {
                    replace_client_module_urls(v, from, to);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                replace_client_module_urls(item, from, to);
            }
        }
        _ => {}
    }
}

/// Download every chunk filename the manifest lists. Chunk entries are
/// relative `.js`/`.css` names inside `js`/`css` asset lists; they stay
/// relative in the manifest and land next to it locally.
async fn mirror_manifest_assets(
    assets: &AssetDownloader,
    manifest: &mut Value,
    module_url: &str,
    local_prefix: &str,
) {
    let mut chunk_names = Vec::new();
    walk_strings(manifest, &mut |_, s| {
        if !s.contains("://")
            && !s.starts_with('/')
            && (s.ends_with(".js") || s.ends_with(".mjs") || s.ends_with(".css"))
        {
            chunk_names.push(s.to_string());
        }
    });
    chunk_names.sort();
    chunk_names.dedup();

    for name in chunk_names {
        let chunk_url = match resolve_url(module_url, &name) {
            Ok(url) => url,
            Err(e) => {
                warn!("Unresolvable manifest chunk {name}: {e}");
                continue;
            }
        };
        match assets.fetch_raw(&chunk_url).await {
            Ok(bytes) => {
                if let Err(e) = assets
                    .write_at_relative_path(&format!("{local_prefix}/{name}"), &bytes)
                    .await
                {
                    warn!("Failed to store manifest chunk {name}: {e:#}");
                }
            }
            Err(e) => warn!("Manifest chunk download failed for {chunk_url}: {e:#}"),
        }
    }
}

/// Point `publicPath` (and a remote entry's absolute `path`) at the local
/// mirror directory.
fn rewrite_public_paths(value: &mut Value, local_public_path: &str) {
    match value {
        Value::Object(map) => {
            for (key, v) in map.iter_mut() {
                if (key == "publicPath" || key == "path")
                    && v.as_str().is_some_and(|s| s.contains("://"))
                {
                    *v = Value::String(local_public_path.to_string());
                } else {
                    rewrite_public_paths(v, local_public_path);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                rewrite_public_paths(item, local_public_path);
            }
        }
        _ => {}
    }
}

fn walk_strings<'a>(value: &'a Value, visit: &mut impl FnMut(Option<&'a str>, &'a str)) {
    match value {
        Value::Object(map) => {
            for (key, v) in map {
                if let Value::String(s) = v {
                    visit(Some(key.as_str()), s);
                } else {
                    walk_strings(v, visit);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                if let Value::String(s) = item {
                    visit(None, s);
                } else {
                    walk_strings(item, visit);
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn finds_nested_client_module_urls() {
        let loader = json!({
            "val": {
                "clientModuleUrl": "https://cdn.example.com/widgets/nav/entry.js",
                "other": {"clientModuleUrl": "https://cdn.example.com/widgets/footer/entry.js"}
            }
        });
        let urls = collect_client_module_urls(&loader);
        assert_eq!(urls.len(), 2);
        assert!(urls[0].contains("footer") || urls[1].contains("footer"));
    }

    #[test]
    fn rewrites_absolute_public_path_only() {
        let mut manifest = json!({
            "metaData": {
                "publicPath": "https://cdn.example.com/widgets/nav/",
                "remoteEntry": {"name": "remoteEntry.js", "path": "https://cdn.example.com/widgets/nav/"}
            },
            "exposes": [{"assets": {"js": {"sync": ["nav.chunk.aa11.js"]}}}]
        });
        rewrite_public_paths(&mut manifest, "/code-components/cdn.example.com/widgets/nav/");
        assert_eq!(
            manifest["metaData"]["publicPath"],
            "/code-components/cdn.example.com/widgets/nav/"
        );
        assert_eq!(
            manifest["metaData"]["remoteEntry"]["path"],
            "/code-components/cdn.example.com/widgets/nav/"
        );
        // Relative chunk names stay untouched.
        assert_eq!(
            manifest["exposes"][0]["assets"]["js"]["sync"][0],
            "nav.chunk.aa11.js"
        );
    }

    #[test]
    fn replaces_module_url_in_loader() {
        let mut loader = json!({
            "val": {"clientModuleUrl": "https://cdn.example.com/widgets/nav/entry.js"}
        });
        replace_client_module_urls(
            &mut loader,
            "https://cdn.example.com/widgets/nav/entry.js",
            "/code-components/cdn.example.com/widgets/nav/entry.js",
        );
        assert_eq!(
            loader["val"]["clientModuleUrl"],
            "/code-components/cdn.example.com/widgets/nav/entry.js"
        );
    }
}

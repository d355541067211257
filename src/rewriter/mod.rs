//! HTML reference rewriting.
//!
//! Takes a loaded page, substitutes every external reference with the
//! archive-local path produced by the asset downloader, and returns the
//! rewritten document. Runs in three passes so no DOM handle is ever held
//! across an await point:
//!
//! 1. parse and collect every rewritable reference (sync);
//! 2. download assets and rewrite embedded CSS / federation manifests (async);
//! 3. re-parse and apply the collected replacements, then serialize (sync).

mod code_components;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use kuchiki::traits::TendrilSink;
use log::debug;
use url::Url;

use crate::assets::{AssetCategory, AssetDownloader};
use crate::utils::constants::WEBFLOW_BADGE_CLASS;
use crate::utils::resolve_url;

/// Result of rewriting one page.
#[derive(Debug)]
pub struct RewriteOutcome {
    /// The rewritten document.
    pub html: String,
    /// Absolute same-origin page links found in the document, for frontier
    /// discovery when spidering is enabled.
    pub page_links: Vec<String>,
}

/// What to do with one attribute value.
enum RefKind {
    Asset(AssetCategory),
    PageLink,
    Skip,
}

/// Per-page rewriter; cheap to construct, one per processed page.
pub struct HtmlRewriter {
    assets: Arc<AssetDownloader>,
    base_url: Url,
    remove_webflow_badge: bool,
}

impl HtmlRewriter {
    pub fn new(
        assets: Arc<AssetDownloader>,
        base_url: &str,
        remove_webflow_badge: bool,
    ) -> Result<Self> {
        Ok(Self {
            assets,
            base_url: Url::parse(base_url).context("invalid base URL for rewriter")?,
            remove_webflow_badge,
        })
    }

    /// Rewrite `html` as served from `page_url`.
    pub async fn rewrite(&self, html: &str, page_url: &str) -> Result<RewriteOutcome> {
        // Pass 1: collect references.
        let collected = collect_references(html, page_url, &self.base_url);

        // Pass 2: all network work, no DOM in scope.
        let mut asset_map: HashMap<String, String> = HashMap::new();
        for (abs_url, category) in &collected.assets {
            let local = self.assets.download_asset(abs_url, *category).await;
            if local != *abs_url {
                asset_map.insert(abs_url.clone(), local);
            }
        }

        let mut css_map: HashMap<String, String> = HashMap::new();
        for css_text in &collected.css_blocks {
            let rewritten = self.assets.rewrite_inline_css(css_text, page_url).await;
            if rewritten != *css_text {
                css_map.insert(css_text.clone(), rewritten);
            }
        }

        let mut island_map: HashMap<String, String> = HashMap::new();
        for loader in &collected.island_loaders {
            if let Some(rewritten) =
                code_components::mirror_island_loader(&self.assets, loader).await
            {
                island_map.insert(loader.clone(), rewritten);
            }
        }

        // Pass 3: apply.
        let rewritten = apply_replacements(
            html,
            page_url,
            &self.base_url,
            &asset_map,
            &css_map,
            &island_map,
            self.remove_webflow_badge,
        )?;

        Ok(RewriteOutcome {
            html: rewritten,
            page_links: collected.page_links,
        })
    }
}

#[derive(Default)]
struct Collected {
    assets: HashSet<(String, AssetCategory)>,
    css_blocks: HashSet<String>,
    island_loaders: HashSet<String>,
    page_links: Vec<String>,
}

/// Classify one attribute reference.
fn classify(tag: &str, attr: &str, value: &str, rel: Option<&str>, as_hint: Option<&str>) -> RefKind {
    if value.is_empty()
        || value.starts_with('#')
        || value.starts_with("data:")
        || value.starts_with("blob:")
        || value.starts_with("javascript:")
        || value.starts_with("mailto:")
        || value.starts_with("tel:")
    {
        return RefKind::Skip;
    }

    match (tag, attr) {
        ("script", "src") => RefKind::Asset(AssetCategory::Js),
        ("img", "src") => RefKind::Asset(
            AssetCategory::from_url(value).unwrap_or(AssetCategory::Image),
        ),
        ("source" | "audio" | "video" | "embed" | "track", "src") => RefKind::Asset(
            AssetCategory::from_url(value).unwrap_or(AssetCategory::Media),
        ),
        ("video", "poster") => RefKind::Asset(AssetCategory::Image),
        ("link", "href") => {
            let rel = rel.unwrap_or("").to_ascii_lowercase();
            if rel.split_whitespace().any(|r| r == "stylesheet") {
                RefKind::Asset(AssetCategory::Css)
            } else if rel.contains("icon") {
                RefKind::Asset(AssetCategory::Image)
            } else if rel.split_whitespace().any(|r| r == "preload" || r == "prefetch") {
                match as_hint.unwrap_or("") {
                    "style" => RefKind::Asset(AssetCategory::Css),
                    "script" => RefKind::Asset(AssetCategory::Js),
                    "font" => RefKind::Asset(AssetCategory::Font),
                    "image" => RefKind::Asset(AssetCategory::Image),
                    _ => match AssetCategory::from_url(value) {
                        Some(category) => RefKind::Asset(category),
                        None => RefKind::Skip,
                    },
                }
            } else {
                RefKind::Skip
            }
        }
        ("a" | "area", "href") => match AssetCategory::from_url(value) {
            Some(category) if category != AssetCategory::Html => RefKind::Asset(category),
            _ => RefKind::PageLink,
        },
        ("form", "action") => RefKind::PageLink,
        ("meta", "content") => {
            // og:image and friends; anything else in a content attribute is
            // not a URL.
            match AssetCategory::from_url(value) {
                Some(category) => RefKind::Asset(category),
                None => RefKind::Skip,
            }
        }
        _ => RefKind::Skip,
    }
}

fn collect_references(html: &str, page_url: &str, base_url: &Url) -> Collected {
    let document = kuchiki::parse_html().one(html);
    let mut collected = Collected::default();

    let elements = match document.select("*") {
        Ok(sel) => sel,
        Err(()) => return collected,
    };

    for element in elements {
        let tag = element.name.local.to_string();
        let attrs = element.attributes.borrow();
        let rel = attrs.get("rel").map(str::to_string);
        let as_hint = attrs.get("as").map(str::to_string);

        if tag == "code-island" {
            if let Some(loader) = attrs.get("data-loader") {
                collected.island_loaders.insert(loader.to_string());
            }
        }

        if tag == "style" {
            let css = element.text_contents();
            if css.contains("url(") {
                collected.css_blocks.insert(css);
            }
        }

        if let Some(style) = attrs.get("style") {
            if style.contains("url(") {
                collected.css_blocks.insert(style.to_string());
            }
        }

        for attr_name in ["href", "src", "poster", "action", "content"] {
            let Some(value) = attrs.get(attr_name) else {
                continue;
            };
            match classify(&tag, attr_name, value, rel.as_deref(), as_hint.as_deref()) {
                RefKind::Asset(category) => {
                    if let Ok(abs) = resolve_url(page_url, value) {
                        collected.assets.insert((abs, category));
                    }
                }
                RefKind::PageLink => {
                    if tag == "a" || tag == "area" {
                        if let Ok(abs) = resolve_url(page_url, value) {
                            if Url::parse(&abs)
                                .map(|u| u.origin() == base_url.origin())
                                .unwrap_or(false)
                            {
                                collected.page_links.push(abs);
                            }
                        }
                    }
                }
                RefKind::Skip => {}
            }
        }

        if let Some(srcset) = attrs.get("srcset") {
            for (item_url, _) in split_srcset(srcset) {
                if let Ok(abs) = resolve_url(page_url, &item_url) {
                    let category = AssetCategory::from_url(&abs).unwrap_or(AssetCategory::Image);
                    collected.assets.insert((abs, category));
                }
            }
        }
    }

    collected
}

#[allow(clippy::too_many_arguments)]
fn apply_replacements(
    html: &str,
    page_url: &str,
    base_url: &Url,
    asset_map: &HashMap<String, String>,
    css_map: &HashMap<String, String>,
    island_map: &HashMap<String, String>,
    remove_webflow_badge: bool,
) -> Result<String> {
    let document = kuchiki::parse_html().one(html);

    let elements: Vec<_> = document
        .select("*")
        .map_err(|()| anyhow::anyhow!("universal selector failed"))?
        .collect();

    for element in &elements {
        let tag = element.name.local.to_string();
        let (rel, as_hint) = {
            let attrs = element.attributes.borrow();
            (
                attrs.get("rel").map(str::to_string),
                attrs.get("as").map(str::to_string),
            )
        };

        // Inline <style> blocks swap their text child for the rewritten CSS.
        if tag == "style" {
            let css = element.text_contents();
            if let Some(rewritten) = css_map.get(&css) {
                let node = element.as_node();
                let children: Vec<_> = node.children().collect();
                for child in children {
                    child.detach();
                }
                node.append(kuchiki::NodeRef::new_text(rewritten.clone()));
            }
        }

        let mut attrs = element.attributes.borrow_mut();

        if tag == "code-island" {
            if let Some(current) = attrs.get("data-loader").map(str::to_string) {
                if let Some(rewritten) = island_map.get(&current) {
                    attrs.insert("data-loader", rewritten.clone());
                }
            }
        }

        if let Some(style) = attrs.get("style").map(str::to_string) {
            if let Some(rewritten) = css_map.get(&style) {
                attrs.insert("style", rewritten.clone());
            }
        }

        for attr_name in ["href", "src", "poster", "action", "content"] {
            let Some(value) = attrs.get(attr_name).map(str::to_string) else {
                continue;
            };
            match classify(&tag, attr_name, &value, rel.as_deref(), as_hint.as_deref()) {
                RefKind::Asset(_) => {
                    if let Ok(abs) = resolve_url(page_url, &value) {
                        if let Some(local) = asset_map.get(&abs) {
                            attrs.insert(attr_name, local.clone());
                        }
                    }
                }
                RefKind::PageLink => {
                    if let Some(local) = localize_page_link(&value, page_url, base_url) {
                        attrs.insert(attr_name, local);
                    }
                }
                RefKind::Skip => {}
            }
        }

        if let Some(srcset) = attrs.get("srcset").map(str::to_string) {
            let rewritten = rewrite_srcset(&srcset, page_url, asset_map);
            if rewritten != srcset {
                attrs.insert("srcset", rewritten);
            }
        }
    }

    drop(elements);

    if remove_webflow_badge {
        strip_webflow_badge(&document);
    }

    let mut out = Vec::new();
    document
        .serialize(&mut out)
        .context("failed to serialize rewritten HTML")?;
    String::from_utf8(out).context("rewritten HTML is not valid UTF-8")
}

/// Reduce a same-origin page link to an archive-root path, preserving the
/// fragment and dropping the query (an offline archive serves one variant).
fn localize_page_link(value: &str, page_url: &str, base_url: &Url) -> Option<String> {
    let abs = resolve_url(page_url, value).ok()?;
    let parsed = Url::parse(&abs).ok()?;
    if parsed.origin() != base_url.origin() {
        return None;
    }
    let mut local = parsed.path().to_string();
    if let Some(fragment) = parsed.fragment() {
        local.push('#');
        local.push_str(fragment);
    }
    Some(local)
}

/// Split a srcset value into (url, descriptor) pairs.
fn split_srcset(srcset: &str) -> Vec<(String, String)> {
    srcset
        .split(',')
        .filter_map(|item| {
            let item = item.trim();
            if item.is_empty() {
                return None;
            }
            let mut parts = item.splitn(2, char::is_whitespace);
            let url = parts.next()?.to_string();
            let descriptor = parts.next().unwrap_or("").trim().to_string();
            Some((url, descriptor))
        })
        .collect()
}

fn rewrite_srcset(srcset: &str, page_url: &str, asset_map: &HashMap<String, String>) -> String {
    split_srcset(srcset)
        .into_iter()
        .map(|(item_url, descriptor)| {
            let rewritten = resolve_url(page_url, &item_url)
                .ok()
                .and_then(|abs| asset_map.get(&abs).cloned())
                .unwrap_or(item_url);
            if descriptor.is_empty() {
                rewritten
            } else {
                format!("{rewritten} {descriptor}")
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn strip_webflow_badge(document: &kuchiki::NodeRef) {
    let selector = format!("a.{WEBFLOW_BADGE_CLASS}");
    if let Ok(matches) = document.select(&selector) {
        // Collect before detaching; detaching invalidates the iterator.
        let nodes: Vec<_> = matches.collect();
        for node in nodes {
            debug!("Stripping Webflow badge element");
            node.as_node().detach();
        }
    }
}

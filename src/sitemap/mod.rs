//! Frontier discovery from sitemaps.
//!
//! Resolution order: `/sitemap.xml`, then any `Sitemap:` directives in
//! robots.txt, then a handful of conventional fallback locations. Sitemap
//! indexes recurse (guarded against cycles); both XML and newline-delimited
//! plain-text sitemaps are accepted. Everything fails soft: a fetch or parse
//! error is logged and skipped, and the caller gets the union of whatever
//! was discovered.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Client;
use url::Url;

use crate::utils::constants::{CHROME_USER_AGENT, SITEMAP_FALLBACK_PATHS};
use crate::utils::strip_fragment;

/// Discover candidate page URLs for `base_url`. Returns a sorted, unique
/// list with fragments stripped.
pub async fn resolve(client: &Client, base_url: &str) -> Result<Vec<String>> {
    let base = Url::parse(base_url).context("invalid base URL")?;
    let origin = format!("{}://{}", base.scheme(), host_port(&base));

    let primary = format!("{origin}/sitemap.xml");
    let mut prefetched: HashMap<String, String> = HashMap::new();
    let mut roots = Vec::new();

    match fetch_text(client, &primary).await {
        Some(body) => {
            prefetched.insert(primary.clone(), body);
            roots.push(primary);
        }
        None => {
            roots.extend(robots_sitemaps(client, &origin).await);
            if roots.is_empty() {
                for path in SITEMAP_FALLBACK_PATHS {
                    roots.push(format!("{origin}{path}"));
                }
            }
        }
    }

    let mut pages: BTreeSet<String> = BTreeSet::new();
    let mut visited_sitemaps: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = roots.into();

    while let Some(sitemap_url) = queue.pop_front() {
        if !visited_sitemaps.insert(sitemap_url.clone()) {
            continue;
        }
        let body = match prefetched.remove(&sitemap_url) {
            Some(body) => body,
            None => match fetch_text(client, &sitemap_url).await {
                Some(body) => body,
                None => continue,
            },
        };

        let parsed = if body.trim_start().starts_with('<') {
            parse_xml_sitemap(&body)
        } else {
            parse_text_sitemap(&body)
        };

        debug!(
            "Sitemap {sitemap_url}: {} pages, {} child sitemaps",
            parsed.pages.len(),
            parsed.children.len()
        );
        for page in parsed.pages {
            pages.insert(strip_fragment(&page).to_string());
        }
        queue.extend(parsed.children);
    }

    info!("Sitemap resolution for {base_url}: {} unique URLs", pages.len());
    Ok(pages.into_iter().collect())
}

fn host_port(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        _ => String::new(),
    }
}

async fn fetch_text(client: &Client, url: &str) -> Option<String> {
    let response = client
        .get(url)
        .header("User-Agent", CHROME_USER_AGENT)
        .send()
        .await;
    match response {
        Ok(response) if response.status().is_success() => match response.text().await {
            Ok(body) if !body.trim().is_empty() => Some(body),
            Ok(_) => None,
            Err(e) => {
                warn!("Failed to read {url}: {e}");
                None
            }
        },
        Ok(response) => {
            debug!("Sitemap probe {url} returned {}", response.status());
            None
        }
        Err(e) => {
            debug!("Sitemap probe {url} failed: {e}");
            None
        }
    }
}

/// Sitemap URLs declared in robots.txt, case-insensitively.
async fn robots_sitemaps(client: &Client, origin: &str) -> Vec<String> {
    let Some(body) = fetch_text(client, &format!("{origin}/robots.txt")).await else {
        return Vec::new();
    };
    body.lines()
        .filter_map(|line| {
            let line = line.trim();
            let rest = line
                .get(..8)
                .filter(|head| head.eq_ignore_ascii_case("sitemap:"))
                .map(|_| line[8..].trim())?;
            (!rest.is_empty()).then(|| rest.to_string())
        })
        .collect()
}

#[derive(Debug, Default, PartialEq)]
struct ParsedSitemap {
    pages: Vec<String>,
    children: Vec<String>,
}

/// Parse a `<urlset>` or `<sitemapindex>` document, matching element names
/// by local name so namespace prefixes don't matter.
fn parse_xml_sitemap(body: &str) -> ParsedSitemap {
    let mut reader = Reader::from_str(body);
    let mut buf = Vec::new();

    let mut parsed = ParsedSitemap::default();
    let mut in_index = false;
    let mut in_loc = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.local_name().as_ref() {
                b"sitemapindex" => in_index = true,
                b"urlset" => in_index = false,
                b"loc" => in_loc = true,
                _ => {}
            },
            Ok(Event::End(ref e)) => {
                if e.local_name().as_ref() == b"loc" {
                    in_loc = false;
                }
            }
            Ok(Event::Text(e)) if in_loc => {
                if let Ok(value) = e.decode() {
                    let value = value.trim().to_string();
                    if !value.is_empty() {
                        if in_index {
                            parsed.children.push(value);
                        } else {
                            parsed.pages.push(value);
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("Sitemap XML parse error: {e}");
                break;
            }
        }
        buf.clear();
    }

    parsed
}

/// Parse a newline-delimited plain-text sitemap. An entry whose path ends in
/// `.xml`/`.txt` or mentions "sitemap" is treated as a child sitemap.
fn parse_text_sitemap(body: &str) -> ParsedSitemap {
    let mut parsed = ParsedSitemap::default();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || !line.starts_with("http") {
            continue;
        }
        let lowered = line.to_ascii_lowercase();
        let path_is_sitemap = lowered.ends_with(".xml")
            || lowered.ends_with(".txt")
            || lowered.contains("sitemap");
        if path_is_sitemap {
            parsed.children.push(line.to_string());
        } else {
            parsed.pages.push(line.to_string());
        }
    }
    parsed
}

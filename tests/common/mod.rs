//! Shared fixtures for the integration test suite.

use std::path::Path;
use std::sync::Arc;

use sitevault::{AssetDownloader, Blacklist};

/// Build an asset downloader writing into `output_dir` for a site rooted at
/// `base_url`, with no cache and the given blacklist rules.
#[allow(dead_code)]
pub fn downloader(output_dir: &Path, base_url: &str, blacklist: &[&str]) -> Arc<AssetDownloader> {
    Arc::new(
        AssetDownloader::new(
            reqwest::Client::new(),
            output_dir.to_path_buf(),
            base_url,
            Blacklist::from_rules(blacklist.iter().copied()),
            None,
        )
        .expect("downloader"),
    )
}

/// A minimal page with head/body content slots.
#[allow(dead_code)]
pub fn page_html(head: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>Fixture</title>
    {head}
</head>
<body>
    {body}
</body>
</html>"#
    )
}

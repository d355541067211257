//! Shared constants for crawling, classification and asset gating.

/// Chrome user agent string sent on every direct HTTP request and
/// configured into the headless browser, so origin servers see one client.
pub const CHROME_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

/// Name of the durable resume-state file inside each crawl's output tree.
pub const STATE_FILE_NAME: &str = ".crawl-state.json";

/// Fallback sitemap locations probed when neither `/sitemap.xml` nor
/// robots.txt yields anything.
pub const SITEMAP_FALLBACK_PATHS: &[&str] = &[
    "/sitemap_index.xml",
    "/sitemap-index.xml",
    "/sitemaps.xml",
    "/sitemap/sitemap.xml",
    "/wp-sitemap.xml",
    "/sitemap.txt",
];

/// Substring markers that classify a directly-fetched page as dynamic,
/// forcing it through the headless browser instead of the static fast path.
pub const DYNAMIC_CONTENT_MARKERS: &[&str] = &[
    "<code-island",
    "data-reactroot",
    "data-react-helmet",
    "__NEXT_DATA__",
    "ng-version=",
    "data-server-rendered",
    "id=\"__nuxt\"",
    "id=\"app\"></div></body>",
    "id=\"root\"></div></body>",
];

/// Analytics/tracking hosts that are never worth archiving. Downloads to
/// these hosts are refused outright unless the host is explicitly
/// allow-listed below.
pub const HOSTILE_DOMAINS: &[&str] = &[
    "google-analytics.com",
    "googletagmanager.com",
    "doubleclick.net",
    "connect.facebook.net",
    "facebook.com",
    "hotjar.com",
    "segment.com",
    "segment.io",
    "mixpanel.com",
    "fullstory.com",
    "clarity.ms",
    "hubspot.com",
    "hs-scripts.com",
    "intercom.io",
    "intercomcdn.com",
    "amplitude.com",
    "heapanalytics.com",
    "crisp.chat",
    "drift.com",
    "linkedin.com",
    "twitter.com",
    "tiktok.com",
];

/// CDN hosts that are always permitted even when a page lives elsewhere.
/// Webflow publishes all site assets through these.
pub const ALLOWED_CDN_HOSTS: &[&str] = &[
    "assets.website-files.com",
    "assets-global.website-files.com",
    "uploads-ssl.webflow.com",
    "daks2k3a4ib2z.cloudfront.net",
    "d3e54v103j8qbb.cloudfront.net",
    "fonts.googleapis.com",
    "fonts.gstatic.com",
];

/// Default asset cache budget in MiB before LRU eviction kicks in.
pub const DEFAULT_CACHE_MAX_MIB: u64 = 2048;

/// Well-known class on the anchor element Webflow injects on free-plan
/// sites; stripped post-rewrite when the site asks for it.
pub const WEBFLOW_BADGE_CLASS: &str = "w-webflow-badge";

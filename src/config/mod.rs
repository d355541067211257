//! Crawl configuration: per-crawl options and environment tuning.

mod tuning;
mod types;

pub use tuning::CrawlTuning;
pub use types::{CrawlOptions, CrawlOptionsBuilder};

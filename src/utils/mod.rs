//! Common utility functions shared across the archiver.

pub mod constants;
pub mod url_utils;

pub use url_utils::{resolve_url, same_origin, slugify, strip_fragment, url_extension};

//! Asset pipeline: classification, gating, deduplicated download and
//! reference rewriting for everything a page pulls in.

mod blacklist;
mod css;
mod downloader;
mod js;

pub use blacklist::Blacklist;
pub use downloader::AssetDownloader;

use crate::utils::url_extension;

/// Asset categories and their fixed directories under the archive root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetCategory {
    Css,
    Js,
    Image,
    Font,
    Media,
    Html,
}

impl AssetCategory {
    /// Directory under the output root this category is stored in.
    pub fn dir(self) -> &'static str {
        match self {
            Self::Css => "css",
            Self::Js => "js",
            Self::Image => "images",
            Self::Font => "fonts",
            Self::Media => "media",
            Self::Html => "html",
        }
    }

    /// Extensions accepted as-is from the URL for this category.
    pub fn allowed_extensions(self) -> &'static [&'static str] {
        match self {
            Self::Css => &["css"],
            Self::Js => &["js", "mjs", "cjs", "json"],
            Self::Image => &["png", "jpg", "jpeg", "gif", "svg", "webp", "avif", "ico", "bmp"],
            Self::Font => &["woff", "woff2", "ttf", "otf", "eot"],
            Self::Media => &["mp4", "webm", "mov", "mp3", "wav", "ogg", "pdf"],
            Self::Html => &["html", "htm"],
        }
    }

    /// Fallback extension when neither the URL nor the Content-Type helps.
    pub fn fallback_extension(self) -> &'static str {
        match self {
            Self::Css => "css",
            Self::Js => "js",
            Self::Image => "png",
            Self::Font => "woff2",
            Self::Media => "mp4",
            Self::Html => "html",
        }
    }

    /// Binary categories are safe to share across crawls through the
    /// content-addressed cache; text categories are rewritten per page.
    pub fn is_binary(self) -> bool {
        matches!(self, Self::Image | Self::Font | Self::Media)
    }

    /// Classify a URL by its path extension.
    pub fn from_url(url: &str) -> Option<Self> {
        Self::from_extension(&url_extension(url)?)
    }

    /// Classify a bare extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.to_ascii_lowercase();
        for category in [
            Self::Css,
            Self::Js,
            Self::Image,
            Self::Font,
            Self::Media,
            Self::Html,
        ] {
            if category.allowed_extensions().contains(&ext.as_str()) {
                return Some(category);
            }
        }
        None
    }

    /// Map a Content-Type header to an extension for this category.
    pub fn extension_from_content_type(self, content_type: &str) -> Option<&'static str> {
        let essence = content_type.split(';').next().unwrap_or("").trim();
        let ext = match essence {
            "text/css" => "css",
            "application/javascript" | "text/javascript" | "application/x-javascript" => "js",
            "application/json" => "json",
            "image/png" => "png",
            "image/jpeg" => "jpg",
            "image/gif" => "gif",
            "image/svg+xml" => "svg",
            "image/webp" => "webp",
            "image/avif" => "avif",
            "image/x-icon" | "image/vnd.microsoft.icon" => "ico",
            "font/woff" | "application/font-woff" => "woff",
            "font/woff2" => "woff2",
            "font/ttf" | "application/x-font-ttf" => "ttf",
            "font/otf" => "otf",
            "application/vnd.ms-fontobject" => "eot",
            "video/mp4" => "mp4",
            "video/webm" => "webm",
            "audio/mpeg" => "mp3",
            "audio/wav" => "wav",
            "audio/ogg" => "ogg",
            "application/pdf" => "pdf",
            "text/html" => "html",
            _ => return None,
        };
        if self.allowed_extensions().contains(&ext) {
            Some(ext)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_extension() {
        assert_eq!(AssetCategory::from_url("https://a.com/x/app.min.js?v=1"), Some(AssetCategory::Js));
        assert_eq!(AssetCategory::from_url("https://a.com/hero.webp"), Some(AssetCategory::Image));
        assert_eq!(AssetCategory::from_url("https://a.com/f.woff2"), Some(AssetCategory::Font));
        assert_eq!(AssetCategory::from_url("https://a.com/page"), None);
    }

    #[test]
    fn content_type_respects_category() {
        assert_eq!(
            AssetCategory::Image.extension_from_content_type("image/png"),
            Some("png")
        );
        // A CSS response claiming to be an image stays unnamed
        assert_eq!(AssetCategory::Css.extension_from_content_type("image/png"), None);
        assert_eq!(
            AssetCategory::Js.extension_from_content_type("text/javascript; charset=utf-8"),
            Some("js")
        );
    }

    #[test]
    fn binary_flag_matches_cacheable_set() {
        assert!(AssetCategory::Image.is_binary());
        assert!(AssetCategory::Font.is_binary());
        assert!(AssetCategory::Media.is_binary());
        assert!(!AssetCategory::Css.is_binary());
        assert!(!AssetCategory::Js.is_binary());
        assert!(!AssetCategory::Html.is_binary());
    }
}

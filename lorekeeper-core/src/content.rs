//! Document retrieval and markup normalization.

use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

static SCRIPT_OR_STYLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script\b.*?</script\s*>|<style\b.*?</style\s*>").expect("valid regex")
});

static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<.*?>").expect("valid regex"));

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// The `ContentFetchFailed` class of errors. The orchestrator drops the
/// candidate and carries on.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Content fetch failed for {locator}: {source}")]
    Transport {
        locator: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Content fetch for {locator} returned {status}")]
    Status {
        locator: String,
        status: reqwest::StatusCode,
    },
}

pub type Result<T> = std::result::Result<T, FetchError>;

/// Retrieves plain text for a search hit.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Fetches the document behind `locator` with all markup stripped.
    async fn fetch(&self, locator: &str) -> Result<String>;
}

/// Maps a locator to a server path.
///
/// Content paths pass through untouched; anything else is treated as a
/// display title.
pub fn locator_path(locator: &str) -> String {
    if locator.starts_with('/') {
        locator.to_string()
    } else {
        format!("/wiki/{}", urlencoding::encode(locator))
    }
}

/// Strips markup and collapses whitespace runs to single spaces.
///
/// Malformed markup never fails; an unterminated tag is simply left as text.
pub fn html_to_text(html: &str) -> String {
    let without_code = SCRIPT_OR_STYLE.replace_all(html, " ");
    let without_tags = TAG.replace_all(&without_code, " ");
    let decoded = decode_entities(&without_tags);
    WHITESPACE.replace_all(&decoded, " ").trim().to_string()
}

/// Decodes the handful of entities that show up in article bodies.
pub fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }

    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&apos;", "'")
        // last, so "&amp;lt;" stays "&lt;"
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_tags_and_collapses_whitespace() {
        let html = "<html><body>\n  <h1>Albert   Einstein</h1>\n<p>Physicist,\tborn 1879.</p></body></html>";
        assert_eq!(html_to_text(html), "Albert Einstein Physicist, born 1879.");
    }

    #[test]
    fn test_drops_script_and_style_bodies() {
        let html = "<style>p { color: red; }</style><p>Text</p><script type=\"x\">var a = 1;</script>";
        assert_eq!(html_to_text(html), "Text");
    }

    #[test]
    fn test_decodes_entities() {
        assert_eq!(html_to_text("<p>Fish &amp; chips&nbsp;&lt;3</p>"), "Fish & chips <3");
        assert_eq!(decode_entities("&amp;lt;"), "&lt;");
    }

    #[test]
    fn test_tolerates_malformed_markup() {
        assert_eq!(html_to_text("<p>open <b>bold"), "open bold");
        assert_eq!(html_to_text("text <unterminated"), "text <unterminated");
        assert_eq!(html_to_text(""), "");
    }

    #[test]
    fn test_locator_path() {
        assert_eq!(locator_path("/content/wiki/A/Einstein"), "/content/wiki/A/Einstein");
        assert_eq!(locator_path("Albert Einstein"), "/wiki/Albert%20Einstein");
    }
}

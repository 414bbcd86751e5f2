//! Lexical retrieval against the content server.

use crate::content::{decode_entities, html_to_text};
use crate::types::Hit;
use async_trait::async_trait;

const ANCHOR_OPEN: &str = "<a href=\"";
const ANCHOR_CLOSE: &str = "</a>";

/// Returns ranked hits for a query.
///
/// Implementations never fail: transport errors and unparseable bodies both
/// come back as an empty list, which the orchestrator reports as "no support".
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// At most `k` hits, in the service's relevance order.
    async fn search(&self, query: &str, k: usize) -> Vec<Hit>;
}

/// Extracts `(locator, title)` pairs from a search results page.
///
/// Scans for `<a href="...">label</a>` markers in document order and stops
/// once `k` hits are collected or the input runs out. Links back into the
/// search page itself (pagination) and anchors with an empty label are
/// skipped.
pub fn parse_hits(html: &str, k: usize) -> Vec<Hit> {
    let mut hits = Vec::new();
    let mut cursor = 0;

    while hits.len() < k {
        let Some(offset) = html[cursor..].find(ANCHOR_OPEN) else {
            break;
        };
        let href_start = cursor + offset + ANCHOR_OPEN.len();
        let Some(href_len) = html[href_start..].find('"') else {
            break;
        };
        let href_end = href_start + href_len;
        let Some(tag_len) = html[href_end..].find('>') else {
            break;
        };
        let label_start = href_end + tag_len + 1;
        let Some(label_len) = html[label_start..].find(ANCHOR_CLOSE) else {
            break;
        };
        let label_end = label_start + label_len;

        let href = &html[href_start..href_end];
        let title = html_to_text(&html[label_start..label_end]);
        if is_article_link(href) && !title.is_empty() {
            hits.push(Hit::new(title, decode_entities(href)));
        }

        cursor = label_end + ANCHOR_CLOSE.len();
    }

    hits
}

fn is_article_link(href: &str) -> bool {
    href.starts_with('/') && !href.starts_with("/search")
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESULTS: &str = r#"
<div class="results">
  <ul>
    <li><a href="/content/wiki/A/Albert_Einstein">Albert Einstein</a><cite>...</cite></li>
    <li><a href="/content/wiki/A/Mileva_Mari%C4%87" class="hit"><b>Mileva</b> Marić</a></li>
    <li><a href="/content/wiki/A/Relativity">Theory of relativity</a></li>
  </ul>
</div>
<div class="footer"><a href="/search?pattern=einstein&amp;start=25">2</a></div>
"#;

    #[test]
    fn test_extracts_hits_in_order() {
        let hits = parse_hits(RESULTS, 10);
        assert_eq!(
            hits,
            vec![
                Hit::new("Albert Einstein", "/content/wiki/A/Albert_Einstein"),
                Hit::new("Mileva Marić", "/content/wiki/A/Mileva_Mari%C4%87"),
                Hit::new("Theory of relativity", "/content/wiki/A/Relativity"),
            ]
        );
    }

    #[test]
    fn test_stops_at_k() {
        let hits = parse_hits(RESULTS, 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[1].title, "Mileva Marić");

        assert!(parse_hits(RESULTS, 0).is_empty());
    }

    #[test]
    fn test_skips_external_and_empty_links() {
        let html = r#"<a href="https://example.org">Elsewhere</a><a href="/A/Empty"> </a><a href="/A/Kept">Kept</a>"#;
        assert_eq!(parse_hits(html, 10), vec![Hit::new("Kept", "/A/Kept")]);
    }

    #[test]
    fn test_truncated_markup_yields_partial_results() {
        let html = r#"<a href="/A/One">One</a><a href="/A/Two">Tw"#;
        assert_eq!(parse_hits(html, 10), vec![Hit::new("One", "/A/One")]);

        assert!(parse_hits("<a href=\"/A/unterminated", 10).is_empty());
        assert!(parse_hits("no anchors here", 10).is_empty());
    }
}

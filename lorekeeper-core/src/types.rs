/// A search-result reference returned by the content server, before fetching.
///
/// The locator is opaque beyond being fetchable through a
/// [`ContentSource`](crate::content::ContentSource).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hit {
    pub title: String,
    pub locator: String,
}

impl Hit {
    pub fn new(title: impl Into<String>, locator: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            locator: locator.into(),
        }
    }
}

/// A fetched, plain-text version of a [`Hit`], eligible for reranking and selection.
///
/// The text is capped when the candidate is built and never changes afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    title: String,
    locator: String,
    text: String,
}

impl Candidate {
    /// Builds a candidate whose text holds at most `max_chars` characters.
    pub fn new(hit: &Hit, text: &str, max_chars: usize) -> Self {
        Self {
            title: hit.title.clone(),
            locator: hit.locator.clone(),
            text: truncate_chars(text, max_chars).to_string(),
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Reranker output for one submitted document.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RerankScore {
    /// Position of the document in the list handed to the reranker
    pub original_index: usize,
    pub score: f32,
}

/// Returns the longest prefix of `text` holding at most `max_chars` characters.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars("abc", 0), "");
    }

    #[test]
    fn test_candidate_caps_text() {
        let hit = Hit::new("Title", "/content/Title");
        let candidate = Candidate::new(&hit, &"x".repeat(50), 20);
        assert_eq!(candidate.text().len(), 20);
        assert_eq!(candidate.title(), "Title");
        assert_eq!(candidate.locator(), "/content/Title");
    }
}

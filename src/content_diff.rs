//! Extract image URLs out of rich-text dream content and diff two content
//! snapshots. Only URLs pointing at our own storage domain are tracked;
//! third-party images are invisible to the lifecycle.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

static IMG_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<img[^>]*src=["']([^"']*)["'][^>]*>"#).unwrap());

/// All owned image URLs referenced in `content`. Empty or unparseable
/// content yields the empty set; this function never fails.
#[must_use]
pub fn extract_image_urls(content: &str, url_markers: &[String]) -> HashSet<String> {
    let mut urls = HashSet::new();
    if content.is_empty() {
        return urls;
    }

    for cap in IMG_REGEX.captures_iter(content) {
        if let Some(src) = cap.get(1) {
            let src = src.as_str().trim();
            if src.is_empty() || src.starts_with("data:") {
                continue;
            }
            if url_markers.iter().any(|marker| src.contains(marker.as_str())) {
                urls.insert(src.to_string());
            }
        }
    }

    urls
}

/// Disjoint URL deltas between two content snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDiff {
    /// In old content but no longer in new content
    pub removed: HashSet<String>,
    /// In new content only
    pub added: HashSet<String>,
    /// In both
    pub kept: HashSet<String>,
}

/// Diff `old_content` against `new_content`. `None` old content is create
/// mode: everything found in the new content is `added`.
#[must_use]
pub fn diff(old_content: Option<&str>, new_content: &str, url_markers: &[String]) -> ContentDiff {
    let old_urls = old_content
        .map(|c| extract_image_urls(c, url_markers))
        .unwrap_or_default();
    let new_urls = extract_image_urls(new_content, url_markers);

    ContentDiff {
        removed: old_urls.difference(&new_urls).cloned().collect(),
        added: new_urls.difference(&old_urls).cloned().collect(),
        kept: old_urls.intersection(&new_urls).cloned().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn markers() -> Vec<String> {
        vec!["store".to_string()]
    }

    #[test]
    fn extracts_only_owned_urls() {
        let content = r#"<p>hi</p>
            <img src='https://store/u/1/a.jpg'>
            <img src="https://elsewhere.example/b.png">
            <img src="data:image/png;base64,AAAA">"#;
        let urls = extract_image_urls(content, &markers());
        assert_eq!(urls.len(), 1);
        assert!(urls.contains("https://store/u/1/a.jpg"));
    }

    #[test]
    fn empty_and_malformed_content_yield_empty_sets() {
        assert!(extract_image_urls("", &markers()).is_empty());
        assert!(extract_image_urls("<img src=", &markers()).is_empty());
        assert!(extract_image_urls("<<<not html>>>", &markers()).is_empty());
    }

    #[test]
    fn create_mode_treats_everything_as_added() {
        let d = diff(None, "<img src='https://store/u/1/a.jpg'>", &markers());
        assert!(d.removed.is_empty());
        assert!(d.kept.is_empty());
        assert_eq!(d.added.len(), 1);
    }

    #[test]
    fn removal_scenario() {
        let d = diff(
            Some("<img src='https://store/u/1/a.jpg'>"),
            "<p>text only</p>",
            &markers(),
        );
        assert!(d.removed.contains("https://store/u/1/a.jpg"));
        assert!(d.added.is_empty());
        assert!(d.kept.is_empty());
    }

    #[test]
    fn diff_sets_are_disjoint_and_cover_both_sides() {
        let old = r#"<img src='https://store/a.jpg'><img src='https://store/b.jpg'>"#;
        let new = r#"<img src='https://store/b.jpg'><img src='https://store/c.jpg'>"#;
        let d = diff(Some(old), new, &markers());

        assert!(d.removed.is_disjoint(&d.added));
        assert!(d.removed.is_disjoint(&d.kept));
        assert!(d.added.is_disjoint(&d.kept));

        let old_urls = extract_image_urls(old, &markers());
        let new_urls = extract_image_urls(new, &markers());
        let removed_plus_kept: HashSet<_> = d.removed.union(&d.kept).cloned().collect();
        let added_plus_kept: HashSet<_> = d.added.union(&d.kept).cloned().collect();
        assert_eq!(removed_plus_kept, old_urls);
        assert_eq!(added_plus_kept, new_urls);
    }

    #[test]
    fn duplicate_references_collapse_to_one_url() {
        let content =
            "<img src='https://store/a.jpg'><img src='https://store/a.jpg'>";
        assert_eq!(extract_image_urls(content, &markers()).len(), 1);
    }
}

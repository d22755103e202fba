// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Reduction of rich outputs into text a model can read.

use cello_core::media::{strip_html_tags, MIME_HTML, MIME_MARKDOWN, MIME_PLAIN};
use cello_store::RepresentationMap;

/// Pick the model-facing text of a representation map: markdown first, then
/// plain text, then tag-stripped HTML.  `None` when the output has no
/// textual form at all (e.g. image-only).
pub fn bundle_text(reps: &RepresentationMap) -> Option<String> {
    if let Some(md) = reps.get(MIME_MARKDOWN).and_then(|r| r.data.as_str()) {
        return Some(md.to_string());
    }
    if let Some(plain) = reps.get(MIME_PLAIN).and_then(|r| r.data.as_str()) {
        return Some(plain.to_string());
    }
    if let Some(html) = reps.get(MIME_HTML).and_then(|r| r.data.as_str()) {
        return Some(strip_html_tags(html));
    }
    None
}

/// Remove ANSI escape sequences from terminal text.
pub fn strip_ansi(text: &str) -> String {
    let re = regex::Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").unwrap();
    re.replace_all(text, "").into_owned()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use cello_store::Representation;
    use serde_json::json;

    fn reps(entries: &[(&str, &str)]) -> RepresentationMap {
        entries
            .iter()
            .map(|(m, v)| (m.to_string(), Representation::inline(json!(v))))
            .collect()
    }

    #[test]
    fn markdown_wins_over_plain_and_html() {
        let r = reps(&[
            ("text/plain", "plain"),
            ("text/markdown", "# md"),
            ("text/html", "<b>html</b>"),
        ]);
        assert_eq!(bundle_text(&r).as_deref(), Some("# md"));
    }

    #[test]
    fn plain_wins_over_html() {
        let r = reps(&[("text/plain", "plain"), ("text/html", "<b>html</b>")]);
        assert_eq!(bundle_text(&r).as_deref(), Some("plain"));
    }

    #[test]
    fn html_is_tag_stripped() {
        let r = reps(&[("text/html", "<b>bold</b>")]);
        let text = bundle_text(&r).unwrap();
        assert!(text.contains("bold"));
        assert!(!text.contains('<'));
    }

    #[test]
    fn image_only_output_has_no_text() {
        let r = reps(&[("image/png", "aGk=")]);
        assert!(bundle_text(&r).is_none());
    }

    #[test]
    fn ansi_sequences_are_removed() {
        let colored = "\x1b[31mred\x1b[0m and \x1b[1;32mgreen\x1b[0m";
        assert_eq!(strip_ansi(colored), "red and green");
    }

    #[test]
    fn plain_text_is_untouched() {
        assert_eq!(strip_ansi("just text"), "just text");
    }
}

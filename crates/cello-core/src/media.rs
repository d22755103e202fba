// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Rich-output shaping.
//!
//! Handlers hand the execution context a raw MIME → value map; this module
//! turns it into the representation map stored in the output record, and
//! guarantees a `text/plain` form exists for consumers that cannot render
//! the richer types.

use serde_json::Value;

use cello_store::{RawMediaMap, Representation, RepresentationMap};

pub const MIME_PLAIN: &str = "text/plain";
pub const MIME_HTML: &str = "text/html";
pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_JSON: &str = "application/json";

/// `application/json` and any `…+json` suffix type.
pub fn is_json_mime(mime: &str) -> bool {
    mime == MIME_JSON || mime.ends_with("+json")
}

pub fn is_text_mime(mime: &str) -> bool {
    mime.starts_with("text/")
}

/// Convert raw MIME data into inline representations.
///
/// JSON-typed entries keep their structured value.  Text-typed entries
/// coerce numbers and booleans to strings.  Any other non-string value is
/// JSON-stringified.  `metadata`, when given, is the per-MIME metadata
/// object (`{mime: {...}}`); matching entries are attached to their
/// representation.
pub fn normalize_media(data: &RawMediaMap, metadata: Option<&Value>) -> RepresentationMap {
    let mut reps = RepresentationMap::new();
    for (mime, value) in data {
        let shaped = if is_json_mime(mime) {
            value.clone()
        } else if is_text_mime(mime) {
            match value {
                Value::String(_) => value.clone(),
                Value::Number(n) => Value::String(n.to_string()),
                Value::Bool(b) => Value::String(b.to_string()),
                other => Value::String(other.to_string()),
            }
        } else {
            match value {
                Value::String(_) => value.clone(),
                other => Value::String(other.to_string()),
            }
        };
        let rep_meta = metadata.and_then(|m| m.get(mime)).cloned();
        reps.insert(mime.clone(), Representation::inline_with_metadata(shaped, rep_meta));
    }
    ensure_plain_text_fallback(&mut reps);
    reps
}

/// Guarantee a `text/plain` representation: synthesize one from tag-stripped
/// HTML when the caller supplied only HTML, or from pretty-printed JSON when
/// only JSON.
fn ensure_plain_text_fallback(reps: &mut RepresentationMap) {
    if reps.contains_key(MIME_PLAIN) {
        return;
    }
    let synthesized = if let Some(html) = reps.get(MIME_HTML).and_then(|r| r.data.as_str()) {
        Some(strip_html_tags(html))
    } else {
        reps.iter()
            .find(|(mime, _)| is_json_mime(mime))
            .map(|(_, rep)| serde_json::to_string_pretty(&rep.data).unwrap_or_default())
    };
    if let Some(text) = synthesized {
        reps.insert(MIME_PLAIN.to_string(), Representation::inline(Value::String(text)));
    }
}

/// Render HTML down to plain text.  Layout is best-effort; the point is a
/// readable fallback, not fidelity.
pub fn strip_html_tags(html: &str) -> String {
    html2text::from_read(html.as_bytes(), 100).trim_end().to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

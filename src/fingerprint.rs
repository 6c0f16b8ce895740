//! Stable fingerprints of rendered page content.
//!
//! Two captures of the same visible content must hash equally even when the page
//! embeds clocks, cache busters or session tokens, so those are stripped before
//! hashing.

use regex::Regex;
use scraper::{Html, Node};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

/// Elements whose text never reaches the screen.
pub const NON_VISIBLE_TAGS: &[&str] = &["script", "style", "noscript", "template", "head", "svg"];

/// SHA-256 hex digest of normalized visible content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for logs.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

static VOLATILE_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        // key=value session and cache-busting parameters
        (
            r"(?i)\b(session(?:_?id)?|sid|token|csrf[_-]?token|csrf|nonce|ts|timestamp|_t|v)=[^\s&'\x22<>]+",
            "$1=",
        ),
        // ISO-8601 date-times
        (
            r"\b\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}(?::\d{2}(?:\.\d+)?)?(?:Z|[+-]\d{2}:?\d{2})?",
            " ",
        ),
        // UUIDs
        (
            r"\b[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}\b",
            " ",
        ),
        // calendar dates
        (r"\b\d{4}[-./]\d{1,2}[-./]\d{1,2}\b", " "),
        (r"\b\d{1,2}/\d{1,2}/\d{2,4}\b", " "),
        // clock times
        (r"(?i)\b\d{1,2}:\d{2}(?::\d{2})?(?:\s*[ap]m)?\b", " "),
        // unix epochs in seconds or milliseconds
        (r"\b1\d{9}(?:\d{3})?\b", " "),
        // long hex digests and opaque tokens
        (r"\b[0-9a-fA-F]{16,}\b", " "),
        (r"\b[A-Za-z0-9_-]*\d[A-Za-z0-9_-]*[A-Za-z][A-Za-z0-9_-]{30,}\b", " "),
    ]
    .into_iter()
    .map(|(pattern, replacement)| (Regex::new(pattern).expect("valid volatile pattern"), replacement))
    .collect()
});

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace pattern"));

/// Fingerprint raw page content (HTML or plain text).
pub fn fingerprint(raw: &str) -> Fingerprint {
    let normalized = normalize(raw);
    let digest = Sha256::digest(normalized.as_bytes());
    Fingerprint(hex::encode(digest))
}

/// Reduce content to what a visitor would read, minus volatile noise.
pub fn normalize(raw: &str) -> String {
    let text = if looks_like_html(raw) {
        text_outside(raw, NON_VISIBLE_TAGS)
    } else {
        raw.to_string()
    };

    let mut cleaned = text;
    for (pattern, replacement) in VOLATILE_PATTERNS.iter() {
        cleaned = pattern.replace_all(&cleaned, *replacement).into_owned();
    }

    WHITESPACE.replace_all(cleaned.trim(), " ").into_owned()
}

/// Text nodes of an HTML document that are not inside any of `excluded` tags.
pub fn text_outside(html: &str, excluded: &[&str]) -> String {
    let document = Html::parse_document(html);
    let mut parts = Vec::new();

    for node in document.root_element().descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .is_some_and(|element| excluded.contains(&element.name()))
        });
        if hidden {
            continue;
        }
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            parts.push(trimmed);
        }
    }

    parts.join(" ")
}

fn looks_like_html(raw: &str) -> bool {
    let head = raw.trim_start();
    head.starts_with('<') && head.contains('>')
}

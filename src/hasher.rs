//! Content fingerprinting.
//!
//! The normalization applied here defines the dedup boundary: two
//! documents are duplicates exactly when their normalized text is equal.
//! The policy is fixed (not configurable) so that digests recorded in a
//! manifest stay comparable across runs:
//!
//! 1. Inputs larger than `max_bytes` are rejected with [`IceError::Resource`].
//! 2. Bytes are decoded as UTF-8, replacing invalid sequences.
//! 3. HTML markup is reduced to its text: `<head>`, `<script>`, `<style>`
//!    and comments are dropped, block tags become whitespace, all other
//!    tags are removed and character references are decoded in one pass.
//! 4. Byte-order marks and zero-width characters are removed.
//! 5. Whitespace runs collapse to a single space; the result is trimmed.
//!    Case is preserved.
//! 6. The digest is SHA-256 over the UTF-8 bytes, as lowercase hex.

use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::error::{IceError, Result};
use crate::models::ContentHash;

/// Default upper bound on a single document's raw size (10 MiB).
pub const DEFAULT_MAX_BYTES: usize = 10 * 1024 * 1024;

static HTML_DETECT_RE: OnceLock<Regex> = OnceLock::new();
static HTML_DROP_RE: OnceLock<Regex> = OnceLock::new();
static HTML_BLOCK_RE: OnceLock<Regex> = OnceLock::new();
static HTML_TAG_RE: OnceLock<Regex> = OnceLock::new();
static ENTITY_RE: OnceLock<Regex> = OnceLock::new();
static WHITESPACE_RE: OnceLock<Regex> = OnceLock::new();

fn html_detect_re() -> &'static Regex {
    HTML_DETECT_RE.get_or_init(|| {
        Regex::new(
            r"(?i)<\s*/?\s*(html|head|body|p|div|br|span|table|tbody|tr|td|th|ul|ol|li|h[1-6]|a|b|i|u|strong|em|font|blockquote|pre)\b[^>]*>",
        )
        .expect("static regex is valid")
    })
}

fn html_drop_re() -> &'static Regex {
    HTML_DROP_RE.get_or_init(|| {
        Regex::new(
            r"(?is)<!--.*?-->|<head\b[^>]*>.*?</head\s*>|<script\b[^>]*>.*?</script\s*>|<style\b[^>]*>.*?</style\s*>",
        )
        .expect("static regex is valid")
    })
}

fn html_block_re() -> &'static Regex {
    HTML_BLOCK_RE.get_or_init(|| {
        Regex::new(r"(?i)<\s*/?\s*(br|p|div|li|tr|td|th|h[1-6]|blockquote|pre|table)\b[^>]*>")
            .expect("static regex is valid")
    })
}

fn html_tag_re() -> &'static Regex {
    HTML_TAG_RE.get_or_init(|| Regex::new(r"<[^>]*>").expect("static regex is valid"))
}

fn entity_re() -> &'static Regex {
    ENTITY_RE.get_or_init(|| {
        Regex::new(r"&(#[xX][0-9a-fA-F]+|#[0-9]+|nbsp|lt|gt|quot|apos|amp);")
            .expect("static regex is valid")
    })
}

fn whitespace_re() -> &'static Regex {
    WHITESPACE_RE.get_or_init(|| Regex::new(r"\s+").expect("static regex is valid"))
}

/// Computes stable content fingerprints.
#[derive(Debug, Clone)]
pub struct ContentHasher {
    max_bytes: usize,
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BYTES)
    }
}

impl ContentHasher {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn hash(&self, content: &str) -> Result<ContentHash> {
        self.hash_bytes(content.as_bytes())
    }

    pub fn hash_bytes(&self, content: &[u8]) -> Result<ContentHash> {
        if content.len() > self.max_bytes {
            return Err(IceError::Resource(format!(
                "document of {} bytes exceeds hashing limit of {} bytes",
                content.len(),
                self.max_bytes
            )));
        }
        let text = String::from_utf8_lossy(content);
        let normalized = normalize(&text);
        let digest = Sha256::digest(normalized.as_bytes());
        Ok(ContentHash::from_hex(hex::encode(digest)))
    }
}

/// Applies the fixed normalization policy described in the module docs.
pub fn normalize(text: &str) -> String {
    let text = if html_detect_re().is_match(text) {
        strip_html(text)
    } else {
        text.to_string()
    };

    let cleaned: String = text
        .chars()
        .filter(|c| !matches!(c, '\u{FEFF}' | '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}'))
        .map(|c| if c == '\u{00A0}' { ' ' } else { c })
        .collect();

    whitespace_re().replace_all(&cleaned, " ").trim().to_string()
}

fn strip_html(text: &str) -> String {
    let dropped = html_drop_re().replace_all(text, " ");
    let blocks = html_block_re().replace_all(&dropped, "\n");
    let bare = html_tag_re().replace_all(&blocks, "");
    decode_entities(&bare)
}

/// Decodes character references in a single pass, so the output of one
/// decode is never decoded again (`&amp;lt;` stays `&lt;`).
fn decode_entities(text: &str) -> String {
    entity_re()
        .replace_all(text, |caps: &regex::Captures| {
            let name = &caps[1];
            let decoded = match name {
                "nbsp" => Some(' '),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "amp" => Some('&'),
                _ => {
                    let digits = &name[1..];
                    let code = match digits.strip_prefix(['x', 'X']) {
                        Some(hex_digits) => u32::from_str_radix(hex_digits, 16).ok(),
                        None => digits.parse::<u32>().ok(),
                    };
                    code.and_then(char::from_u32)
                }
            };
            decoded.map(|c| c.to_string()).unwrap_or_default()
        })
        .into_owned()
}

/// Deterministic identifier derived from the given parts.
///
/// Used for entity and edge upsert keys so that reprocessing a document
/// produces the same identities.
pub fn stable_id(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

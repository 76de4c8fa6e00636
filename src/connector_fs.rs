//! Filesystem scanner producing candidate documents.
//!
//! | Extension | Source type | Interpretation |
//! |-----------|-------------|----------------|
//! | `.json` | from the file | a serialized [`RawDocument`] |
//! | `.eml` | `email` | RFC 822 headers + body |
//! | anything else | `other` | the whole file is the body |
//!
//! Files that cannot be read or parsed are skipped with a warning so a
//! single bad drop does not block the batch.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use tracing::warn;
use walkdir::WalkDir;

use crate::config::Config;
use crate::models::{RawDocument, SourceType};

pub fn scan_filesystem(config: &Config) -> Result<Vec<RawDocument>> {
    let root = config
        .ingest
        .root
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("ingest.root is not configured"))?;

    if !root.exists() {
        bail!("ingest root does not exist: {}", root.display());
    }

    let include_set = build_globset(&config.ingest.include_globs)?;

    let mut default_excludes = vec!["**/.git/**".to_string(), "**/*.lock".to_string()];
    default_excludes.extend(config.ingest.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut docs: Vec<(String, RawDocument)> = Vec::new();

    let walker = WalkDir::new(root).follow_links(config.ingest.follow_symlinks);
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");

        if exclude_set.is_match(&rel_str) {
            continue;
        }
        if !include_set.is_match(&rel_str) {
            continue;
        }

        match file_to_document(path, &rel_str) {
            Ok(doc) => docs.push((rel_str, doc)),
            Err(e) => {
                let reason = format!("{:#}", e);
                warn!(path = %rel_str, error = %reason, "skipping file");
            }
        }
    }

    // Deterministic batch order.
    docs.sort_by(|a, b| a.0.cmp(&b.0));

    Ok(docs.into_iter().map(|(_, doc)| doc).collect())
}

fn file_to_document(path: &Path, relative_path: &str) -> Result<RawDocument> {
    let bytes = std::fs::read(path)?;
    let text = String::from_utf8_lossy(&bytes).into_owned();

    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    let doc = match extension.as_str() {
        "json" => serde_json::from_str::<RawDocument>(&text)
            .with_context(|| format!("not a document: {}", relative_path))?,
        "eml" => parse_email(&text, relative_path),
        _ => {
            let mut doc = RawDocument::new(relative_path, SourceType::Other, text);
            if let Some(modified) = modified_at(path) {
                doc.source_date = Some(modified);
            }
            doc
        }
    };

    if doc.document_id.trim().is_empty() {
        bail!("empty document_id in {}", relative_path);
    }
    Ok(doc.with_metadata("path", relative_path))
}

/// Splits headers from body. `Message-ID` becomes the document id when
/// present; `Date` becomes the source date.
fn parse_email(text: &str, relative_path: &str) -> RawDocument {
    let (head, body) = split_headers(text);

    let mut headers: Vec<(String, String)> = Vec::new();
    for line in head.lines() {
        if line.starts_with([' ', '\t']) {
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }
    }
    let header = |name: &str| {
        headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
            .filter(|v| !v.is_empty())
    };

    let document_id = header("message-id")
        .map(|id| id.trim_matches(['<', '>']).to_string())
        .unwrap_or_else(|| relative_path.to_string());

    let mut doc = RawDocument::new(document_id, SourceType::Email, body);
    doc.source_date = header("date")
        .and_then(|d| DateTime::parse_from_rfc2822(&d).ok())
        .map(|d| d.with_timezone(&Utc));
    for key in ["subject", "from"] {
        if let Some(value) = header(key) {
            doc.metadata.insert(key.to_string(), value);
        }
    }
    doc
}

fn split_headers(text: &str) -> (&str, &str) {
    for sep in ["\r\n\r\n", "\n\n"] {
        if let Some(idx) = text.find(sep) {
            return (&text[..idx], &text[idx + sep.len()..]);
        }
    }
    ("", text)
}

fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_for(root: &Path) -> Config {
        let mut config = Config::with_manifest_path(root.join("manifest.json"));
        config.ingest.root = Some(root.to_path_buf());
        config
    }

    #[test]
    fn test_scan_classifies_by_extension() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("mail")).unwrap();
        std::fs::write(
            tmp.path().join("mail/q2.eml"),
            "Message-ID: <abc@ir.nvidia.com>\r\nDate: Tue, 2 Jul 2024 09:00:00 +0000\r\nSubject: Q2\r\n\r\nNVDA margin 75%.",
        )
        .unwrap();
        std::fs::write(
            tmp.path().join("fmp.json"),
            r#"{"document_id":"fmp-1","source_type":"api","content":"{}","metadata":{"ticker":"NVDA"}}"#,
        )
        .unwrap();
        std::fs::write(tmp.path().join("note.txt"), "plain note").unwrap();
        std::fs::write(tmp.path().join("skip.bin"), "x").unwrap();

        let docs = scan_filesystem(&config_for(tmp.path())).unwrap();
        let ids: Vec<&str> = docs.iter().map(|d| d.document_id.as_str()).collect();
        assert_eq!(ids, vec!["fmp-1", "abc@ir.nvidia.com", "note.txt"]);

        assert_eq!(docs[0].source_type, SourceType::Api);
        assert_eq!(docs[0].metadata["ticker"], "NVDA");
        assert_eq!(docs[1].source_type, SourceType::Email);
        assert_eq!(docs[1].content, "NVDA margin 75%.");
        assert_eq!(docs[1].metadata["subject"], "Q2");
        assert!(docs[1].source_date.is_some());
        assert_eq!(docs[2].source_type, SourceType::Other);
        assert_eq!(docs[2].metadata["path"], "note.txt");
    }

    #[test]
    fn test_bad_json_is_skipped() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("broken.json"), "{ not json").unwrap();
        std::fs::write(tmp.path().join("ok.txt"), "fine").unwrap();
        let docs = scan_filesystem(&config_for(tmp.path())).unwrap();
        assert_eq!(docs.len(), 1);
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let config = config_for(&tmp.path().join("nope"));
        assert!(scan_filesystem(&config).is_err());
    }
}

use crate::error::IngestError;
use crate::extractor::PageText;
use crate::models::Chunk;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::path::{Component, Path};
use std::sync::OnceLock;
use tracing::debug;

const MAX_KEY_STEM_CHARS: usize = 200;

#[derive(Debug, Clone, Copy)]
pub struct ChunkingOptions {
    /// Pages with fewer characters than this after trimming produce no chunk.
    pub min_page_chars: usize,
}

impl Default for ChunkingOptions {
    fn default() -> Self {
        Self { min_page_chars: 1 }
    }
}

fn invalid_key_chars() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[^A-Za-z0-9_\-]").expect("static key pattern is valid"))
}

/// Replaces every character an index key cannot hold with `_`.
pub fn sanitize_key(raw: &str) -> String {
    let replaced = invalid_key_chars().replace_all(raw, "_");
    replaced.chars().take(MAX_KEY_STEM_CHARS).collect()
}

/// Stable key for one page of one file: `{stem}_page_{n}`.
///
/// When sanitizing changes the stem, a short digest of the original name is
/// appended so that `a b.pdf` and `a_b.pdf` still get distinct keys. Sources in
/// subfolders (`printer/Manual.pdf`) always take that path, since `/` is not a
/// key character.
pub fn chunk_id(source: &str, page: u32) -> String {
    let without_extension = Path::new(source).with_extension("");
    let stem = without_extension.to_str().unwrap_or(source);
    let sanitized = sanitize_key(stem);

    if sanitized == stem {
        format!("{sanitized}_page_{page}")
    } else {
        let digest = Sha256::digest(source.as_bytes());
        let suffix = format!("{digest:x}");
        format!("{sanitized}-{}_page_{page}", &suffix[..8])
    }
}

/// The source label of `path`: its path below `root`, `/`-separated.
///
/// Files directly in `root` keep their bare file name.
pub fn source_name(root: &Path, path: &Path) -> Result<String, IngestError> {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let mut parts = Vec::new();
    for component in relative.components() {
        if let Component::Normal(part) = component {
            let part = part
                .to_str()
                .ok_or_else(|| IngestError::MissingFileName(path.display().to_string()))?;
            parts.push(part);
        }
    }

    if parts.is_empty() {
        return Err(IngestError::MissingFileName(path.display().to_string()));
    }
    Ok(parts.join("/"))
}

/// Turns the extracted pages of one file into chunks, one per non-empty page.
pub fn build_chunks(source: &str, pages: &[PageText], options: &ChunkingOptions) -> Vec<Chunk> {
    pages
        .iter()
        .filter_map(|page| {
            let content = page.text.trim();
            if content.is_empty() || content.chars().count() < options.min_page_chars {
                debug!(source, page = page.number, "skipping empty page");
                return None;
            }

            Some(Chunk {
                id: chunk_id(source, page.number),
                content: content.to_string(),
                source: source.to_string(),
                page: page.number,
                embedding: None,
            })
        })
        .collect()
}

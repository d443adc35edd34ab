//! Extractor contract: resolving a source URL into its videos.
//!
//! The actual metadata extraction is an external collaborator supplied by
//! the embedding program. The runtime only fixes the contract: given a URL,
//! either a [SourceMetadata] comes back or the source is DLQ-bound with the
//! error message.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// One video yielded by extraction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoEntry {
    /// Canonical 11-character YouTube video id, when the extractor knows it.
    pub id: String,
    pub url: String,
    pub title: String,
    pub duration_seconds: Option<u64>,
}

/// Metadata of a source (playlist or channel) and the videos it yields.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub name: String,
    pub videos: Vec<VideoEntry>,
}

/// Extraction failure; the message lands in the source's DLQ row.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ExtractError(pub String);

/// Resolves a source URL into its metadata. Implementations may block.
pub trait SourceExtractor: Send {
    fn extract(&self, url: &str) -> Result<SourceMetadata, ExtractError>;
}

impl<F> SourceExtractor for F
where
    F: Fn(&str) -> Result<SourceMetadata, ExtractError> + Send,
{
    fn extract(&self, url: &str) -> Result<SourceMetadata, ExtractError> {
        self(url)
    }
}

const VIDEO_ID_LEN: usize = 11;

fn video_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?:v=|/)([A-Za-z0-9_-]{11})(?:[?&]|$)").expect("video id pattern compiles")
    })
}

/// True for a canonical 11-character video id.
pub fn is_canonical_video_id(id: &str) -> bool {
    id.len() == VIDEO_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Pulls the canonical video id out of a watch/short URL, if present.
pub fn parse_video_id(url: &str) -> Option<&str> {
    video_id_pattern()
        .captures(url)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str())
}

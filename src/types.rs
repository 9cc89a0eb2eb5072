// src/types.rs
//! Core domain types shared across the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type ChannelId = i64;

/// Opaque per-channel ingestion offset. Source-native message ids are
/// monotonically increasing, so "newer than cursor" is a simple compare.
pub type Cursor = u64;

/// A monitored source channel. The active flag is owned by configuration /
/// external management; the poller only reads it (and clears it on a
/// permanent source error).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Channel {
    pub id: ChannelId,
    /// Source-specific address, e.g. a public handle.
    pub address: String,
    pub active: bool,
}

/// An item as fetched from a source, before normalization. Ephemeral:
/// exists only to feed the normalizer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawItem {
    pub channel_id: ChannelId,
    /// Source-native id, unique and increasing within one channel.
    pub source_id: u64,
    pub text: String,
    pub published_at: DateTime<Utc>,
    /// Source-side media reference, if any (photo/video id etc.).
    pub media: Option<String>,
}

/// Stable content hash over folded, URL-stripped text (hex sha256).
/// Equal fingerprints mean "same story" regardless of channel or casing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub String);

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Output of the normalizer. Created once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NormalizedPost {
    pub channel_id: ChannelId,
    pub source_id: u64,
    /// Cleaned display text (whitespace collapsed, control chars stripped,
    /// URLs removed).
    pub text: String,
    /// ISO-639-1-ish code, `"und"` when detection cannot commit.
    pub lang: String,
    /// Extracted URLs, original order, deduplicated within the post.
    pub urls: Vec<String>,
    pub fingerprint: Fingerprint,
    pub published_at: DateTime<Utc>,
}

impl NormalizedPost {
    /// Primary link for attribution, if the post carried one.
    pub fn primary_url(&self) -> Option<&str> {
        self.urls.first().map(String::as_str)
    }
}

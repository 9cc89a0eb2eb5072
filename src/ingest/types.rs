// src/ingest/types.rs
use crate::error::SourceError;
use crate::types::{Channel, Cursor, RawItem};

/// Source collaborator: fetches items newer than the cursor for one
/// channel. Must distinguish transient trouble from a permanently
/// unavailable channel (see `SourceError`). Returned items are in
/// source order (ascending native id).
#[async_trait::async_trait]
pub trait SourceClient: Send + Sync {
    async fn fetch_since(
        &self,
        channel: &Channel,
        cursor: Cursor,
    ) -> Result<Vec<RawItem>, SourceError>;
    fn name(&self) -> &'static str;
}

/// Per-channel poll accounting, reported via tracing/metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    pub fetched: usize,
    /// Non-text or below the meaningful-content gate. Expected, not errors.
    pub discarded: usize,
    /// Fingerprint already seen globally; attribution recorded, post
    /// suppressed from the digest buffer.
    pub duplicates: usize,
    /// Items skipped because an earlier attempt already handed them
    /// downstream (crash-and-retry redelivery).
    pub redelivered: usize,
    pub accepted: usize,
    pub alerted: usize,
    pub blocked: usize,
}

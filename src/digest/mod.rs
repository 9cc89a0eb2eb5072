// src/digest/mod.rs
//! Digest generator: windowed batching of accepted posts, cross-language
//! story grouping, and single-language summarization through the LLM
//! gateway.
//!
//! Failure policy: a failed summarization aborts the whole run and leaves
//! the window buffer untouched, so the next scheduled tick (or a manual
//! retrigger) retries the same accepted set. At most one build runs per
//! window at a time; a concurrent trigger is a no-op.

pub mod grouping;

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter, describe_gauge, gauge};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::DigestError;
use crate::gateway::{GroupInput, LlmGateway};
use crate::types::{ChannelId, Fingerprint, NormalizedPost};

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("digest_runs_total", "Digest builds attempted.");
        describe_counter!("digest_failures_total", "Digest builds that failed.");
        describe_counter!("digest_groups_total", "Story groups emitted in digests.");
        describe_gauge!("digest_last_success_ts", "Unix ts of the last successful digest.");
    });
}

/// One (channel, link) attribution of a story.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceRef {
    pub channel_id: ChannelId,
    pub url: Option<String>,
}

/// One summarized story group in a finished digest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorySummary {
    pub headline: String,
    pub detail: String,
    /// Primary attribution first (earliest post's channel), then every
    /// other channel that carried the story, in first-appearance order.
    pub sources: Vec<SourceRef>,
    /// Number of member posts; higher means better corroborated.
    pub corroboration: usize,
    pub first_seen: DateTime<Utc>,
}

/// A finished digest. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Digest {
    pub generated_at: DateTime<Utc>,
    pub language: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// Ordered by corroboration desc, then first-seen asc.
    pub stories: Vec<StorySummary>,
    /// Free-text "what changed" narrative.
    pub narrative: String,
}

#[derive(Default)]
struct BufferInner {
    posts: Vec<NormalizedPost>,
    /// All (channel, link) pairs that carried each fingerprint, including
    /// channels whose copy was dedup-suppressed.
    attributions: HashMap<Fingerprint, Vec<SourceRef>>,
}

/// Time-windowed buffer of accepted posts, shared between the poller
/// (writer) and the digest generator (reader/drainer).
#[derive(Default)]
pub struct WindowBuffer {
    inner: Mutex<BufferInner>,
}

impl WindowBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an accepted post for digest inclusion (with its own
    /// attribution).
    pub fn accept(&self, post: NormalizedPost) {
        let mut g = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let source = SourceRef {
            channel_id: post.channel_id,
            url: post.primary_url().map(str::to_string),
        };
        push_attribution(&mut g.attributions, &post.fingerprint, source);
        g.posts.push(post);
    }

    /// Record that `channel` also carried an already-seen story. The
    /// duplicate post itself is suppressed, only the attribution survives.
    pub fn attribute(&self, fp: &Fingerprint, channel_id: ChannelId, url: Option<String>) {
        let mut g = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        push_attribution(&mut g.attributions, fp, SourceRef { channel_id, url });
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).posts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Everything buffered up to `end`. Posts older than the nominal window
    /// start (accepted during a poll lag, say) are swept in rather than
    /// stranded: an accepted post must reach exactly one digest.
    fn snapshot(
        &self,
        end: DateTime<Utc>,
    ) -> (Vec<NormalizedPost>, HashMap<Fingerprint, Vec<SourceRef>>) {
        let g = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut posts: Vec<NormalizedPost> = g
            .posts
            .iter()
            .filter(|p| p.published_at < end)
            .cloned()
            .collect();
        posts.sort_by_key(|p| (p.published_at, p.channel_id, p.source_id));
        let attrs = posts
            .iter()
            .filter_map(|p| {
                g.attributions
                    .get(&p.fingerprint)
                    .map(|v| (p.fingerprint.clone(), v.clone()))
            })
            .collect();
        (posts, attrs)
    }

    /// Remove everything up to `end` after a successful build, along with
    /// any attribution entry that no longer has a surviving post (late
    /// `attribute` calls for an already-digested story included).
    fn drain(&self, end: DateTime<Utc>) {
        let mut g = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        g.posts.retain(|p| p.published_at >= end);
        let alive: HashSet<Fingerprint> =
            g.posts.iter().map(|p| p.fingerprint.clone()).collect();
        g.attributions.retain(|fp, _| alive.contains(fp));
    }
}

fn push_attribution(
    attrs: &mut HashMap<Fingerprint, Vec<SourceRef>>,
    fp: &Fingerprint,
    source: SourceRef,
) {
    let entry = attrs.entry(fp.clone()).or_default();
    if !entry.iter().any(|s| s.channel_id == source.channel_id) {
        entry.push(source);
    }
}

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Jaccard threshold for story grouping.
    pub similarity_threshold: f64,
    /// Output language of every digest.
    pub target_lang: String,
    /// Cap on posts considered per run (earliest kept).
    pub max_posts: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.5,
            target_lang: "en".to_string(),
            max_posts: 100,
        }
    }
}

type WindowKey = (i64, i64);

pub struct DigestGenerator {
    gateway: std::sync::Arc<LlmGateway>,
    buffer: std::sync::Arc<WindowBuffer>,
    cfg: GeneratorConfig,
    in_flight: Mutex<HashSet<WindowKey>>,
}

/// Removes the window key from the in-flight set when the build ends,
/// whatever the outcome.
struct FlightGuard<'a> {
    set: &'a Mutex<HashSet<WindowKey>>,
    key: WindowKey,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

impl DigestGenerator {
    pub fn new(
        gateway: std::sync::Arc<LlmGateway>,
        buffer: std::sync::Arc<WindowBuffer>,
        cfg: GeneratorConfig,
    ) -> Self {
        Self {
            gateway,
            buffer,
            cfg,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn buffer(&self) -> &WindowBuffer {
        &self.buffer
    }

    /// Build one digest for `[start, end)`. Single-flight per window key;
    /// cancellation (shutdown flag flipping to true) never commits a
    /// partial digest.
    pub async fn build(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        cancel: &watch::Receiver<bool>,
    ) -> Result<Digest, DigestError> {
        ensure_metrics_described();
        counter!("digest_runs_total").increment(1);

        let key = (start.timestamp(), end.timestamp());
        let _guard = {
            let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            if !set.insert(key) {
                return Err(DigestError::InFlight);
            }
            FlightGuard {
                set: &self.in_flight,
                key,
            }
        };

        let result = self.build_inner(start, end, cancel).await;
        match &result {
            Ok(d) => {
                counter!("digest_groups_total").increment(d.stories.len() as u64);
                gauge!("digest_last_success_ts").set(Utc::now().timestamp() as f64);
                info!(
                    stories = d.stories.len(),
                    lang = %d.language,
                    "digest built"
                );
            }
            Err(DigestError::EmptyWindow) | Err(DigestError::InFlight) => {}
            Err(e) => {
                counter!("digest_failures_total").increment(1);
                warn!(error = %e, "digest build failed; window preserved for retry");
            }
        }
        result
    }

    async fn build_inner(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        cancel: &watch::Receiver<bool>,
    ) -> Result<Digest, DigestError> {
        let (mut posts, attrs) = self.buffer.snapshot(end);
        if posts.is_empty() {
            return Err(DigestError::EmptyWindow);
        }
        posts.truncate(self.cfg.max_posts);

        // Group, then fix the final story order up front so the draft's
        // group summaries zip 1:1 with it.
        let mut groups = grouping::group_posts(&posts, self.cfg.similarity_threshold);
        groups.sort_by_key(|g| {
            let earliest = posts[g[0]].published_at;
            (std::cmp::Reverse(g.len()), earliest)
        });

        let mut inputs = Vec::with_capacity(groups.len());
        let mut skeletons = Vec::with_capacity(groups.len());
        for group in &groups {
            let mut sources: Vec<SourceRef> = Vec::new();
            let mut texts = Vec::with_capacity(group.len());
            for &idx in group {
                let post = &posts[idx];
                texts.push(post.text.clone());
                match attrs.get(&post.fingerprint) {
                    Some(list) => {
                        for s in list {
                            if !sources.iter().any(|x| x.channel_id == s.channel_id) {
                                sources.push(s.clone());
                            }
                        }
                    }
                    None => {
                        let s = SourceRef {
                            channel_id: post.channel_id,
                            url: post.primary_url().map(str::to_string),
                        };
                        if !sources.iter().any(|x| x.channel_id == s.channel_id) {
                            sources.push(s);
                        }
                    }
                }
            }
            inputs.push(GroupInput {
                texts,
                sources: sources
                    .iter()
                    .map(|s| match &s.url {
                        Some(u) => format!("channel {} ({u})", s.channel_id),
                        None => format!("channel {}", s.channel_id),
                    })
                    .collect(),
            });
            skeletons.push((sources, group.len(), posts[group[0]].published_at));
        }

        // Summarize, racing the cancellation flag. A cancelled build
        // commits nothing; a dropped sender with the flag still false is
        // not a cancellation, the build proceeds.
        let mut cancel_rx = cancel.clone();
        let draft = tokio::select! {
            r = self.gateway.summarize(&inputs, &self.cfg.target_lang) => r?,
            _ = crate::scheduler::flag_raised(&mut cancel_rx) => return Err(DigestError::Cancelled),
        };
        if *cancel.borrow() {
            return Err(DigestError::Cancelled);
        }

        let stories = draft
            .groups
            .into_iter()
            .zip(skeletons)
            .map(|(g, (sources, size, first_seen))| StorySummary {
                headline: g.headline,
                detail: g.detail,
                sources,
                corroboration: size,
                first_seen,
            })
            .collect();

        // Commit point: only now does the window state go away.
        self.buffer.drain(end);

        Ok(Digest {
            generated_at: Utc::now(),
            language: self.cfg.target_lang.clone(),
            window_start: start,
            window_end: end,
            stories,
            narrative: draft.narrative,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Fingerprint;
    use chrono::TimeZone;

    fn post(channel: ChannelId, id: u64, text: &str, at: i64) -> NormalizedPost {
        NormalizedPost {
            channel_id: channel,
            source_id: id,
            text: text.to_string(),
            lang: "en".to_string(),
            urls: vec![],
            fingerprint: Fingerprint(format!("fp-{text}")),
            published_at: Utc.timestamp_opt(at, 0).unwrap(),
        }
    }

    #[test]
    fn buffer_attribution_dedups_by_channel() {
        let buf = WindowBuffer::new();
        let p = post(1, 1, "sanctions imposed on exporters", 100);
        let fp = p.fingerprint.clone();
        buf.accept(p);
        buf.attribute(&fp, 2, Some("https://c2.example/5".into()));
        buf.attribute(&fp, 2, None); // same channel again: ignored
        let (posts, attrs) = buf.snapshot(Utc.timestamp_opt(1_000, 0).unwrap());
        assert_eq!(posts.len(), 1);
        assert_eq!(attrs.get(&fp).unwrap().len(), 2);
    }

    #[test]
    fn drain_keeps_posts_past_the_window_end() {
        let buf = WindowBuffer::new();
        buf.accept(post(1, 1, "inside the window story", 100));
        buf.accept(post(1, 2, "outside the window story", 5_000));
        buf.drain(Utc.timestamp_opt(1_000, 0).unwrap());
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn drain_prunes_attributions_without_surviving_posts() {
        let buf = WindowBuffer::new();
        let p = post(1, 1, "story digested in the first window", 100);
        let fp = p.fingerprint.clone();
        buf.accept(p);
        buf.drain(Utc.timestamp_opt(1_000, 0).unwrap());

        // Attribution arriving after its story was already digested.
        buf.attribute(&fp, 2, None);
        buf.accept(post(1, 2, "a later unrelated story", 2_000));
        buf.drain(Utc.timestamp_opt(5_000, 0).unwrap());

        let g = buf.inner.lock().unwrap();
        assert!(g.posts.is_empty());
        assert!(g.attributions.is_empty());
    }
}

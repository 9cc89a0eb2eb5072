// src/ingest/mod.rs
//! Ingestion poller: pulls new items per channel, normalizes them, dedups
//! by fingerprint (globally) and source-native id (per channel), and hands
//! novel posts to the rule engine in ingestion order.
//!
//! Cursor discipline: a cursor only advances past an item after that item
//! has been handed to the rule engine, so a crash between fetch and commit
//! redelivers rather than drops (at-least-once). Redelivery is made
//! idempotent by the store's compare-and-insert checks.

pub mod types;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use once_cell::sync::OnceCell;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::deliver::DeliverySink;
use crate::digest::WindowBuffer;
use crate::error::SourceError;
use crate::normalize::normalize;
use crate::rules::{Outcome, RuleEngine};
use crate::store::{RuleSource, StateStore};
use crate::types::{Channel, ChannelId};

use self::types::{PollStats, SourceClient};

/// One-time metrics registration (so series show up for exporters).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ingest_items_total", "Items fetched from sources.");
        describe_counter!("ingest_kept_total", "Posts accepted into the digest window.");
        describe_counter!(
            "ingest_discarded_total",
            "Items discarded by normalization (non-text/empty)."
        );
        describe_counter!("ingest_dedup_total", "Posts suppressed as already-seen fingerprints.");
        describe_counter!("ingest_alerts_total", "Alert decisions delivered.");
        describe_counter!("ingest_source_errors_total", "Source fetch failures.");
        describe_gauge!("ingest_last_run_ts", "Unix ts when the poller last ran.");
    });
}

/// Mutable view over the configured channel list. Ownership of the active
/// flag stays with configuration/management; the poller only clears it when
/// a source reports the channel permanently gone.
#[derive(Default)]
pub struct ChannelRegistry {
    inner: Mutex<Vec<Channel>>,
}

impl ChannelRegistry {
    pub fn new(channels: Vec<Channel>) -> Self {
        Self {
            inner: Mutex::new(channels),
        }
    }

    pub fn active(&self) -> Vec<Channel> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|c| c.active)
            .cloned()
            .collect()
    }

    pub fn deactivate(&self, id: ChannelId) {
        let mut g = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(c) = g.iter_mut().find(|c| c.id == id) {
            c.active = false;
        }
    }

    pub fn is_active(&self, id: ChannelId) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|c| c.id == id && c.active)
    }
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Per-channel poll deadline; on timeout the tick is abandoned and the
    /// cursor stays where the last handed item left it.
    pub poll_timeout: Duration,
    /// Bound on concurrent channel polls.
    pub worker_pool: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(30),
            worker_pool: 4,
        }
    }
}

pub struct Poller {
    source: Arc<dyn SourceClient>,
    store: Arc<dyn StateStore>,
    rules: Arc<dyn RuleSource>,
    engine: Arc<RuleEngine>,
    sink: Arc<dyn DeliverySink>,
    buffer: Arc<WindowBuffer>,
    cfg: PollerConfig,
}

impl Poller {
    pub fn new(
        source: Arc<dyn SourceClient>,
        store: Arc<dyn StateStore>,
        rules: Arc<dyn RuleSource>,
        engine: Arc<RuleEngine>,
        sink: Arc<dyn DeliverySink>,
        buffer: Arc<WindowBuffer>,
        cfg: PollerConfig,
    ) -> Self {
        Self {
            source,
            store,
            rules,
            engine,
            sink,
            buffer,
            cfg,
        }
    }

    /// Poll one channel: fetch items newer than the stored cursor and walk
    /// them in ingestion order. Safe to call repeatedly with the same
    /// cursor; duplicate delivery is absorbed by the store's
    /// compare-and-insert checks.
    pub async fn poll_channel(&self, channel: &Channel) -> Result<PollStats, SourceError> {
        ensure_metrics_described();

        let cursor = self.store.cursor(channel.id).await;
        let items = self.source.fetch_since(channel, cursor).await?;
        let (filters, alerts) = self.rules.active_rules(channel.id);

        let mut stats = PollStats {
            fetched: items.len(),
            ..PollStats::default()
        };
        counter!("ingest_items_total").increment(items.len() as u64);

        for item in items {
            if item.source_id <= cursor {
                continue;
            }
            // Source-native-id dedup per channel: an item redelivered after
            // a crash was already handed downstream once.
            if !self.store.mark_delivered(channel.id, item.source_id).await {
                stats.redelivered += 1;
                self.store.advance_cursor(channel.id, item.source_id).await;
                continue;
            }

            let Some(post) = normalize(&item) else {
                stats.discarded += 1;
                counter!("ingest_discarded_total").increment(1);
                self.store.advance_cursor(channel.id, item.source_id).await;
                continue;
            };

            let novel = self.store.mark_seen(&post.fingerprint).await;
            if !novel {
                stats.duplicates += 1;
                counter!("ingest_dedup_total").increment(1);
            }

            // Every first-time (channel, item) pair is evaluated, seen
            // fingerprint or not: alerting is per channel even when the
            // digest collapses the story.
            let decision = self.engine.evaluate(&post, &filters, &alerts).await;
            match decision.outcome {
                Outcome::Blocked => {
                    stats.blocked += 1;
                    debug!(channel = channel.id, fingerprint = %post.fingerprint, "post blocked");
                }
                Outcome::Alerted | Outcome::Allowed => {
                    if decision.outcome == Outcome::Alerted {
                        stats.alerted += 1;
                        counter!("ingest_alerts_total").increment(1);
                        self.sink.deliver_alert(&decision, &post).await;
                    }
                    if novel {
                        stats.accepted += 1;
                        counter!("ingest_kept_total").increment(1);
                        self.buffer.accept(post.clone());
                    } else {
                        // Story already buffered elsewhere; only the extra
                        // channel attribution survives.
                        self.buffer.attribute(
                            &post.fingerprint,
                            channel.id,
                            post.primary_url().map(str::to_string),
                        );
                    }
                }
            }

            // Handed downstream: the cursor may move past this item now.
            self.store.advance_cursor(channel.id, item.source_id).await;
        }

        Ok(stats)
    }

    /// Poll every active channel with a bounded worker pool. One channel's
    /// failure never blocks or fails the others; a permanent source error
    /// deactivates that channel and surfaces it to operators.
    pub async fn poll_all(
        self: &Arc<Self>,
        registry: &Arc<ChannelRegistry>,
    ) -> Vec<(ChannelId, Result<PollStats, SourceError>)> {
        ensure_metrics_described();
        let channels = registry.active();
        let sem = Arc::new(Semaphore::new(self.cfg.worker_pool.max(1)));

        let mut handles = Vec::with_capacity(channels.len());
        for channel in channels {
            let poller = Arc::clone(self);
            let registry = Arc::clone(registry);
            let sem = Arc::clone(&sem);
            handles.push(tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.expect("semaphore closed");
                let outcome =
                    match tokio::time::timeout(poller.cfg.poll_timeout, poller.poll_channel(&channel))
                        .await
                    {
                        Ok(r) => r,
                        Err(_) => Err(SourceError::Timeout(poller.cfg.poll_timeout)),
                    };
                match &outcome {
                    Ok(stats) => {
                        info!(
                            channel = channel.id,
                            fetched = stats.fetched,
                            accepted = stats.accepted,
                            duplicates = stats.duplicates,
                            alerted = stats.alerted,
                            blocked = stats.blocked,
                            "channel polled"
                        );
                    }
                    Err(e) => {
                        counter!("ingest_source_errors_total").increment(1);
                        if e.is_permanent() {
                            registry.deactivate(channel.id);
                            warn!(channel = channel.id, error = %e, "channel permanently unavailable, deactivated");
                        } else {
                            warn!(channel = channel.id, error = %e, "channel poll failed, will retry next tick");
                        }
                    }
                }
                (channel.id, outcome)
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for h in handles {
            if let Ok(r) = h.await {
                results.push(r);
            }
        }
        gauge!("ingest_last_run_ts").set(chrono::Utc::now().timestamp() as f64);
        results
    }
}

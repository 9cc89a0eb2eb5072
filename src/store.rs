// src/store.rs
//! Collaborator seams for externally-owned state: the dedup/cursor store
//! and the rule-configuration snapshot source.
//!
//! The core never holds global mutable state of its own; everything shared
//! between channel workers goes through these narrow interfaces. The store
//! contract is compare-and-insert, so two concurrent pollers observing the
//! same new fingerprint cannot both treat it as novel.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::rules::{AlertRule, FilterRule};
use crate::types::{ChannelId, Cursor, Fingerprint};

/// Dedup/cursor store. All operations must be safe under concurrent access
/// from multiple channel workers.
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    async fn has_seen(&self, fp: &Fingerprint) -> bool;

    /// Compare-and-insert: records the fingerprint as seen and returns
    /// `true` iff it was novel.
    async fn mark_seen(&self, fp: &Fingerprint) -> bool;

    /// Compare-and-insert on (channel, source-native id): returns `true`
    /// iff this item has not been handed downstream before. This is what
    /// makes at-least-once redelivery after a crash idempotent.
    async fn mark_delivered(&self, channel: ChannelId, source_id: u64) -> bool;

    async fn cursor(&self, channel: ChannelId) -> Cursor;

    /// Single writer per channel; advancing never moves the cursor back.
    async fn advance_cursor(&self, channel: ChannelId, cursor: Cursor);
}

/// Rule-configuration source. Returns a read-only snapshot per evaluation:
/// channel-scoped plus wildcard rules, active only, ascending priority.
pub trait RuleSource: Send + Sync {
    fn active_rules(&self, channel: ChannelId) -> (Vec<FilterRule>, Vec<AlertRule>);
}

// ------------------------------------------------------------
// In-memory implementations (tests, demo binary)
// ------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    seen: HashSet<Fingerprint>,
    delivered: HashSet<(ChannelId, u64)>,
    cursors: HashMap<ChannelId, Cursor>,
}

/// Mutex-backed store with the same compare-and-insert semantics a real
/// backend would provide.
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<MemoryState>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl StateStore for MemoryStateStore {
    async fn has_seen(&self, fp: &Fingerprint) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).seen.contains(fp)
    }

    async fn mark_seen(&self, fp: &Fingerprint) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .seen
            .insert(fp.clone())
    }

    async fn mark_delivered(&self, channel: ChannelId, source_id: u64) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .delivered
            .insert((channel, source_id))
    }

    async fn cursor(&self, channel: ChannelId) -> Cursor {
        *self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cursors
            .get(&channel)
            .unwrap_or(&0)
    }

    async fn advance_cursor(&self, channel: ChannelId, cursor: Cursor) {
        let mut g = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = g.cursors.entry(channel).or_insert(0);
        if cursor > *entry {
            *entry = cursor;
        }
    }
}

/// Fixed rule set, scoped and sorted per call.
pub struct StaticRules {
    filters: Vec<FilterRule>,
    alerts: Vec<AlertRule>,
}

impl StaticRules {
    pub fn new(filters: Vec<FilterRule>, alerts: Vec<AlertRule>) -> Self {
        Self { filters, alerts }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }
}

impl RuleSource for StaticRules {
    fn active_rules(&self, channel: ChannelId) -> (Vec<FilterRule>, Vec<AlertRule>) {
        let mut filters: Vec<FilterRule> = self
            .filters
            .iter()
            .filter(|r| r.active && r.channel_id.map(|c| c == channel).unwrap_or(true))
            .cloned()
            .collect();
        filters.sort_by_key(|r| (r.priority, r.id));

        let mut alerts: Vec<AlertRule> = self
            .alerts
            .iter()
            .filter(|r| r.active && r.channel_id.map(|c| c == channel).unwrap_or(true))
            .cloned()
            .collect();
        alerts.sort_by_key(|r| (r.priority, r.id));

        (filters, alerts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleKind;

    #[tokio::test]
    async fn mark_seen_is_compare_and_insert() {
        let store = MemoryStateStore::new();
        let fp = Fingerprint("abc".into());
        assert!(store.mark_seen(&fp).await);
        assert!(!store.mark_seen(&fp).await);
        assert!(store.has_seen(&fp).await);
    }

    #[tokio::test]
    async fn cursor_never_moves_backwards() {
        let store = MemoryStateStore::new();
        store.advance_cursor(1, 10).await;
        store.advance_cursor(1, 5).await;
        assert_eq!(store.cursor(1).await, 10);
    }

    #[test]
    fn snapshot_merges_wildcard_and_sorts_by_priority() {
        let alerts = vec![
            AlertRule {
                id: 1,
                channel_id: Some(2),
                kind: RuleKind::Keyword,
                pattern: "x".into(),
                active: true,
                priority: 0,
            },
            AlertRule {
                id: 2,
                channel_id: None,
                kind: RuleKind::Keyword,
                pattern: "y".into(),
                active: true,
                priority: -1,
            },
            AlertRule {
                id: 3,
                channel_id: Some(1),
                kind: RuleKind::Keyword,
                pattern: "z".into(),
                active: false,
                priority: 1,
            },
        ];
        let src = StaticRules::new(Vec::new(), alerts);
        let (_, scoped) = src.active_rules(1);
        assert_eq!(scoped.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2]);
        let (_, scoped2) = src.active_rules(2);
        assert_eq!(scoped2.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2, 1]);
    }
}

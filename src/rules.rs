// src/rules.rs
//! Rule engine: ordered filter rules (block/allow) and alert rules
//! (notify), with an escalation path to the LLM gateway for rules marked
//! `llm-semantic`.
//!
//! Evaluation is deterministic for a fixed rule snapshot and a fixed
//! gateway response: the gateway is the only non-deterministic input and
//! tests substitute a scripted stub for it.

use std::collections::HashMap;
use std::sync::RwLock;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::gateway::LlmGateway;
use crate::types::{ChannelId, Fingerprint, NormalizedPost};

/// Closed set of matching strategies. New kinds extend this enum; there is
/// no runtime registration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RuleKind {
    Keyword,
    Regex,
    LlmSemantic,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FilterPolarity {
    Block,
    Allow,
}

/// A filter rule: decides whether a post continues down the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterRule {
    pub id: u64,
    /// `None` = wildcard, applies to every channel.
    pub channel_id: Option<ChannelId>,
    pub kind: RuleKind,
    pub pattern: String,
    pub polarity: FilterPolarity,
    pub active: bool,
    /// Lower evaluates first.
    pub priority: i32,
}

/// An alert rule: a match notifies the delivery collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: u64,
    pub channel_id: Option<ChannelId>,
    pub kind: RuleKind,
    pub pattern: String,
    pub active: bool,
    pub priority: i32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Blocked,
    Allowed,
    Alerted,
}

/// Record of one evaluation. Ephemeral: consumed by the delivery
/// collaborator, never stored by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchDecision {
    pub fingerprint: Fingerprint,
    pub rule_id: Option<u64>,
    pub outcome: Outcome,
    /// 1.0 for deterministic rules; model-reported for llm-semantic.
    pub confidence: f32,
}

pub struct RuleEngine {
    gateway: std::sync::Arc<LlmGateway>,
    /// Compiled patterns keyed by source text. `None` marks a pattern that
    /// failed to compile so we only log it once.
    regex_cache: RwLock<HashMap<String, Option<Regex>>>,
    /// Below this, an llm-semantic "yes" is treated as no-match.
    semantic_threshold: f32,
}

enum DetMatch {
    Hit,
    Miss,
    /// Rule needs the gateway; deferred until deterministic rules are done.
    NeedsLlm,
}

impl RuleEngine {
    pub fn new(gateway: std::sync::Arc<LlmGateway>, semantic_threshold: f32) -> Self {
        Self {
            gateway,
            regex_cache: RwLock::new(HashMap::new()),
            semantic_threshold: semantic_threshold.clamp(0.0, 1.0),
        }
    }

    /// Evaluate one post against its channel-scoped rule snapshot.
    ///
    /// Filters run first in ascending priority; a `block` match
    /// short-circuits everything. Deterministic rules decide before any
    /// llm-semantic rule is consulted; the gateway is only asked for the
    /// ambiguous remainder, and a degraded gateway means "no match".
    pub async fn evaluate(
        &self,
        post: &NormalizedPost,
        filters: &[FilterRule],
        alerts: &[AlertRule],
    ) -> MatchDecision {
        // --- filter stage ---
        let mut deferred_filters: Vec<&FilterRule> = Vec::new();
        for rule in filters.iter().filter(|r| r.active) {
            match self.match_deterministic(rule.id, rule.kind, &rule.pattern, &post.text) {
                DetMatch::NeedsLlm => deferred_filters.push(rule),
                DetMatch::Miss => {}
                DetMatch::Hit => {
                    return match rule.polarity {
                        FilterPolarity::Block => self.decision(post, Some(rule.id), Outcome::Blocked, 1.0),
                        // An allow match settles the filter stage; the post
                        // proceeds to alert evaluation.
                        FilterPolarity::Allow => self.alert_stage(post, alerts, 1.0).await,
                    };
                }
            }
        }
        for rule in deferred_filters {
            let (hit, conf) = self.gateway.match_semantic(&post.text, &rule.pattern).await;
            if hit && conf >= self.semantic_threshold {
                return match rule.polarity {
                    FilterPolarity::Block => self.decision(post, Some(rule.id), Outcome::Blocked, conf),
                    FilterPolarity::Allow => self.alert_stage(post, alerts, conf).await,
                };
            }
        }

        self.alert_stage(post, alerts, 1.0).await
    }

    /// `allow_conf` is the confidence of the filter decision that let the
    /// post through (1.0 for deterministic filters or no filter match); it
    /// becomes the confidence of a plain `Allowed` outcome.
    async fn alert_stage(
        &self,
        post: &NormalizedPost,
        alerts: &[AlertRule],
        allow_conf: f32,
    ) -> MatchDecision {
        let mut deferred: Vec<&AlertRule> = Vec::new();
        for rule in alerts.iter().filter(|r| r.active) {
            match self.match_deterministic(rule.id, rule.kind, &rule.pattern, &post.text) {
                DetMatch::NeedsLlm => deferred.push(rule),
                DetMatch::Miss => {}
                DetMatch::Hit => {
                    // First matching alert rule wins.
                    return self.decision(post, Some(rule.id), Outcome::Alerted, 1.0);
                }
            }
        }
        for rule in deferred {
            let (hit, conf) = self.gateway.match_semantic(&post.text, &rule.pattern).await;
            if hit && conf >= self.semantic_threshold {
                return self.decision(post, Some(rule.id), Outcome::Alerted, conf);
            }
        }
        self.decision(post, None, Outcome::Allowed, allow_conf)
    }

    fn match_deterministic(&self, rule_id: u64, kind: RuleKind, pattern: &str, text: &str) -> DetMatch {
        match kind {
            RuleKind::Keyword => {
                let haystack = text.to_lowercase();
                let hit = pattern
                    .split(',')
                    .map(|kw| kw.trim().to_lowercase())
                    .filter(|kw| !kw.is_empty())
                    .any(|kw| haystack.contains(&kw));
                if hit {
                    DetMatch::Hit
                } else {
                    DetMatch::Miss
                }
            }
            RuleKind::Regex => match self.compiled(rule_id, pattern) {
                Some(re) if re.is_match(text) => DetMatch::Hit,
                // A malformed pattern skips the rule, never the post.
                _ => DetMatch::Miss,
            },
            RuleKind::LlmSemantic => DetMatch::NeedsLlm,
        }
    }

    /// Compile-once regex cache. Case-insensitive, matching the keyword
    /// strategy. Failures are cached as `None` and logged once.
    fn compiled(&self, rule_id: u64, pattern: &str) -> Option<Regex> {
        if let Some(entry) = self.regex_cache.read().unwrap_or_else(|e| e.into_inner()).get(pattern) {
            return entry.clone();
        }
        let compiled = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| {
                warn!(rule_id, pattern, error = %e, "malformed regex rule skipped");
                e
            })
            .ok();
        self.regex_cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pattern.to_string(), compiled.clone());
        compiled
    }

    fn decision(
        &self,
        post: &NormalizedPost,
        rule_id: Option<u64>,
        outcome: Outcome,
        confidence: f32,
    ) -> MatchDecision {
        debug!(fingerprint = %post.fingerprint, ?outcome, rule_id, "rule decision");
        MatchDecision {
            fingerprint: post.fingerprint.clone(),
            rule_id,
            outcome,
            confidence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{GatewayConfig, StubProvider};
    use crate::normalize::normalize;
    use crate::types::RawItem;
    use chrono::Utc;
    use std::sync::Arc;

    fn post(text: &str) -> NormalizedPost {
        normalize(&RawItem {
            channel_id: 1,
            source_id: 1,
            text: text.to_string(),
            published_at: Utc::now(),
            media: None,
        })
        .expect("meaningful text")
    }

    fn engine_with(fallback: &str) -> RuleEngine {
        let provider = Arc::new(StubProvider::with_fallback(fallback));
        let gw = Arc::new(LlmGateway::new(provider, GatewayConfig::default()));
        RuleEngine::new(gw, 0.5)
    }

    fn keyword_alert(id: u64, pattern: &str, priority: i32) -> AlertRule {
        AlertRule {
            id,
            channel_id: None,
            kind: RuleKind::Keyword,
            pattern: pattern.to_string(),
            active: true,
            priority,
        }
    }

    #[tokio::test]
    async fn block_short_circuits_alerts() {
        let engine = engine_with("{}");
        let filters = vec![FilterRule {
            id: 10,
            channel_id: None,
            kind: RuleKind::Keyword,
            pattern: "advertisement".to_string(),
            polarity: FilterPolarity::Block,
            active: true,
            priority: 0,
        }];
        let alerts = vec![keyword_alert(20, "advertisement", 0)];
        let d = engine
            .evaluate(&post("This advertisement promotes a casino"), &filters, &alerts)
            .await;
        assert_eq!(d.outcome, Outcome::Blocked);
        assert_eq!(d.rule_id, Some(10));
    }

    #[tokio::test]
    async fn keyword_list_matches_any_term_case_insensitively() {
        let engine = engine_with("{}");
        let alerts = vec![keyword_alert(1, "sanctions, EMBARGO", 0)];
        let d = engine
            .evaluate(&post("New embargo announced on exports"), &[], &alerts)
            .await;
        assert_eq!(d.outcome, Outcome::Alerted);
        assert_eq!(d.confidence, 1.0);
    }

    #[tokio::test]
    async fn first_alert_match_wins_by_priority() {
        let engine = engine_with("{}");
        let alerts = vec![
            keyword_alert(2, "announced", 5),
            keyword_alert(1, "embargo", 1),
        ];
        // Snapshot order is priority order per the rule-source contract.
        let mut snapshot = alerts.clone();
        snapshot.sort_by_key(|r| (r.priority, r.id));
        let d = engine
            .evaluate(&post("New embargo announced on exports"), &[], &snapshot)
            .await;
        assert_eq!(d.rule_id, Some(1));
    }

    #[tokio::test]
    async fn malformed_regex_is_skipped_not_fatal() {
        let engine = engine_with("{}");
        let alerts = vec![
            AlertRule {
                id: 1,
                channel_id: None,
                kind: RuleKind::Regex,
                pattern: "([unclosed".to_string(),
                active: true,
                priority: 0,
            },
            keyword_alert(2, "embargo", 1),
        ];
        let d = engine
            .evaluate(&post("New embargo announced on exports"), &[], &alerts)
            .await;
        assert_eq!(d.outcome, Outcome::Alerted);
        assert_eq!(d.rule_id, Some(2));
    }

    #[tokio::test]
    async fn semantic_rule_only_runs_when_deterministic_rules_decide_nothing() {
        // Deterministic hit first: stub would claim a match, but must not be asked.
        let engine = engine_with(r#"{"match": true, "confidence": 0.99}"#);
        let alerts = vec![
            AlertRule {
                id: 7,
                channel_id: None,
                kind: RuleKind::LlmSemantic,
                pattern: "posts about monetary policy".to_string(),
                active: true,
                priority: 0,
            },
            keyword_alert(8, "embargo", 1),
        ];
        let d = engine
            .evaluate(&post("New embargo announced on exports"), &[], &alerts)
            .await;
        assert_eq!(d.rule_id, Some(8));
        assert_eq!(d.confidence, 1.0);
    }

    #[tokio::test]
    async fn semantic_below_threshold_is_no_match() {
        let engine = engine_with(r#"{"match": true, "confidence": 0.3}"#);
        let alerts = vec![AlertRule {
            id: 7,
            channel_id: None,
            kind: RuleKind::LlmSemantic,
            pattern: "posts about monetary policy".to_string(),
            active: true,
            priority: 0,
        }];
        let d = engine
            .evaluate(&post("Unrelated gardening update today"), &[], &alerts)
            .await;
        assert_eq!(d.outcome, Outcome::Allowed);
        assert_eq!(d.rule_id, None);
    }

    #[tokio::test]
    async fn semantic_allow_filter_confidence_reaches_the_decision() {
        let engine = engine_with(r#"{"match": true, "confidence": 0.8}"#);
        let filters = vec![FilterRule {
            id: 30,
            channel_id: None,
            kind: RuleKind::LlmSemantic,
            pattern: "posts about trade policy".to_string(),
            polarity: FilterPolarity::Allow,
            active: true,
            priority: 0,
        }];
        let d = engine
            .evaluate(&post("Tariff schedule revised for imports"), &filters, &[])
            .await;
        assert_eq!(d.outcome, Outcome::Allowed);
        assert_eq!(d.rule_id, None);
        assert!((d.confidence - 0.8).abs() < 1e-6);
    }

    #[tokio::test]
    async fn inactive_rules_are_ignored() {
        let engine = engine_with("{}");
        let mut rule = keyword_alert(1, "embargo", 0);
        rule.active = false;
        let d = engine
            .evaluate(&post("New embargo announced on exports"), &[], &[rule])
            .await;
        assert_eq!(d.outcome, Outcome::Allowed);
    }

    #[tokio::test]
    async fn evaluation_is_deterministic_under_fixed_stub() {
        let engine = engine_with(r#"{"match": true, "confidence": 0.9}"#);
        let alerts = vec![AlertRule {
            id: 3,
            channel_id: None,
            kind: RuleKind::LlmSemantic,
            pattern: "statements about central banks".to_string(),
            active: true,
            priority: 0,
        }];
        let p = post("The central bank raised its key rate again");
        let first = engine.evaluate(&p, &[], &alerts).await;
        let second = engine.evaluate(&p, &[], &alerts).await;
        assert_eq!(first.outcome, second.outcome);
        assert_eq!(first.rule_id, second.rule_id);
        assert_eq!(first.confidence, second.confidence);
    }
}

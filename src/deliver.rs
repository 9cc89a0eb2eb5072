// src/deliver.rs
//! Delivery seam. The core hands alert decisions and finished digests to a
//! sink and knows nothing about transports (email, webhook, ...).

use tokio::sync::Mutex;

use crate::digest::Digest;
use crate::rules::MatchDecision;
use crate::types::NormalizedPost;

#[async_trait::async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver_alert(&self, decision: &MatchDecision, post: &NormalizedPost);
    async fn deliver_digest(&self, digest: &Digest);
}

/// First line of the post, capped at 100 chars — used by delivery layers
/// as the alert subject.
pub fn alert_title(text: &str) -> String {
    let first_line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim();
    let base = if first_line.is_empty() {
        text.trim()
    } else {
        first_line
    };
    if base.is_empty() {
        return "No title".to_string();
    }
    if base.chars().count() > 100 {
        let cut: String = base.chars().take(100).collect();
        format!("{cut}...")
    } else {
        base.to_string()
    }
}

/// Collecting sink for tests and the demo binary.
#[derive(Default)]
pub struct BufferSink {
    pub alerts: Mutex<Vec<(MatchDecision, NormalizedPost)>>,
    pub digests: Mutex<Vec<Digest>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn alert_count(&self) -> usize {
        self.alerts.lock().await.len()
    }

    pub async fn digest_count(&self) -> usize {
        self.digests.lock().await.len()
    }
}

#[async_trait::async_trait]
impl DeliverySink for BufferSink {
    async fn deliver_alert(&self, decision: &MatchDecision, post: &NormalizedPost) {
        self.alerts
            .lock()
            .await
            .push((decision.clone(), post.clone()));
    }

    async fn deliver_digest(&self, digest: &Digest) {
        self.digests.lock().await.push(digest.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_is_first_nonempty_line_capped() {
        assert_eq!(alert_title("Breaking news\nmore detail"), "Breaking news");
        assert_eq!(alert_title("   \nSecond line wins"), "Second line wins");
        assert_eq!(alert_title(""), "No title");
        let long = "x".repeat(150);
        assert!(alert_title(&long).ends_with("..."));
        assert_eq!(alert_title(&long).chars().count(), 103);
    }
}

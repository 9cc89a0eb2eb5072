//! Failure taxonomy for the content pipeline.
//!
//! Containment policy: channel-level and rule-level failures are contained
//! and reported, never propagated to abort unrelated work. Only digest
//! summarization failure aborts a unit of work (one digest run), and window
//! state is preserved for retry. Nothing here terminates the process.

use thiserror::Error;

/// Errors surfaced by a source collaborator while fetching channel items.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Network trouble, rate limits, malformed batches. Retried next tick.
    #[error("transient source error: {0}")]
    Transient(String),

    /// The channel is gone or access was revoked. The poller deactivates
    /// the channel and surfaces this to operators.
    #[error("permanent source error: {0}")]
    Permanent(String),

    /// The per-call poll budget elapsed. The cursor is not advanced; the
    /// poll is abandoned for this tick.
    #[error("poll timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl SourceError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, SourceError::Permanent(_))
    }
}

/// A malformed rule pattern. The offending rule is skipped and logged;
/// evaluation continues with the remaining rules.
#[derive(Debug, Error)]
#[error("rule {rule_id} has a malformed pattern: {detail}")]
pub struct RuleError {
    pub rule_id: u64,
    pub detail: String,
}

/// Errors surfaced by the LLM gateway after its retry budget is spent.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway call timed out")]
    Timeout,

    #[error("provider returned a malformed response: {0}")]
    InvalidResponse(String),

    #[error("provider call failed: {0}")]
    Provider(String),

    /// Retry budget exhausted; wraps the last observed failure.
    #[error("gateway retries exhausted: {0}")]
    Exhausted(Box<GatewayError>),
}

/// Errors from a digest build. `SummarizationFailed` is the only failure
/// allowed to abort a whole unit of work, and even then the window buffer
/// is left intact so the next trigger retries the same accepted set.
#[derive(Debug, Error)]
pub enum DigestError {
    #[error("summarization failed: {0}")]
    SummarizationFailed(#[from] GatewayError),

    /// Another build for the same window is already running; this trigger
    /// is a no-op.
    #[error("digest build already in flight for this window")]
    InFlight,

    #[error("digest build cancelled before commit")]
    Cancelled,

    /// No accepted posts in the window. Not a retryable condition.
    #[error("no posts accepted in window")]
    EmptyWindow,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_is_distinguishable() {
        assert!(SourceError::Permanent("revoked".into()).is_permanent());
        assert!(!SourceError::Transient("429".into()).is_permanent());
        assert!(!SourceError::Timeout(std::time::Duration::from_secs(5)).is_permanent());
    }
}

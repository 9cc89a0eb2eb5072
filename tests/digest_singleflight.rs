// tests/digest_singleflight.rs
// At most one digest build per window at a time; failed builds keep the
// window intact and a later retrigger produces exactly one digest.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio::sync::watch;

use channelwatch::digest::{DigestGenerator, GeneratorConfig, WindowBuffer};
use channelwatch::error::{DigestError, GatewayError};
use channelwatch::gateway::{GatewayConfig, LlmGateway, LlmProvider, StubProvider};
use channelwatch::normalize::fingerprint;
use channelwatch::types::NormalizedPost;

fn post(id: u64, text: &str, at: i64) -> NormalizedPost {
    NormalizedPost {
        channel_id: 1,
        source_id: id,
        text: text.to_string(),
        lang: "en".to_string(),
        urls: vec![],
        fingerprint: fingerprint(text),
        published_at: Utc.timestamp_opt(at, 0).unwrap(),
    }
}

fn window() -> (chrono::DateTime<Utc>, chrono::DateTime<Utc>) {
    (
        Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        Utc.timestamp_opt(1_700_010_000, 0).unwrap(),
    )
}

const ONE_GROUP_DRAFT: &str =
    r#"{"groups": [{"headline": "h", "detail": "d"}], "narrative": "n"}"#;

/// Answers correctly, slowly — long enough for a second trigger to overlap.
struct SlowProvider;

#[async_trait::async_trait]
impl LlmProvider for SlowProvider {
    async fn complete(&self, _prompt: &str) -> Result<String, GatewayError> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(ONE_GROUP_DRAFT.to_string())
    }

    fn name(&self) -> &'static str {
        "slow"
    }
}

#[tokio::test]
async fn concurrent_triggers_for_one_window_build_exactly_one_digest() {
    let buffer = Arc::new(WindowBuffer::new());
    buffer.accept(post(1, "central bank raises key interest rate", 1_700_000_100));

    let gateway = Arc::new(LlmGateway::new(Arc::new(SlowProvider), GatewayConfig::default()));
    let gen = Arc::new(DigestGenerator::new(
        gateway,
        Arc::clone(&buffer),
        GeneratorConfig::default(),
    ));
    let (start, end) = window();
    let (_, cancel) = watch::channel(false);

    let (a, b) = tokio::join!(gen.build(start, end, &cancel), gen.build(start, end, &cancel));
    let oks = [&a, &b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(oks, 1);
    assert!(
        matches!(a, Err(DigestError::InFlight)) || matches!(b, Err(DigestError::InFlight)),
        "the losing trigger must be a no-op"
    );
}

#[tokio::test]
async fn failed_summarization_preserves_window_until_a_retrigger_succeeds() {
    let buffer = Arc::new(WindowBuffer::new());
    buffer.accept(post(1, "central bank raises key interest rate", 1_700_000_100));

    // Whole first run fails (every attempt errors); afterwards the
    // provider recovers and the fallback answers.
    let provider = Arc::new(StubProvider::scripted(
        vec![
            Err(GatewayError::Provider("down".into())),
            Err(GatewayError::Provider("down".into())),
            Err(GatewayError::Provider("down".into())),
        ],
        ONE_GROUP_DRAFT,
    ));
    let gateway = Arc::new(LlmGateway::new(
        provider,
        GatewayConfig {
            call_timeout: Duration::from_secs(1),
            max_attempts: 3,
            backoff_base: Duration::from_millis(1),
        },
    ));
    let gen = DigestGenerator::new(gateway, Arc::clone(&buffer), GeneratorConfig::default());
    let (start, end) = window();
    let (_, cancel) = watch::channel(false);

    let first = gen.build(start, end, &cancel).await;
    assert!(matches!(first, Err(DigestError::SummarizationFailed(_))));
    // No partial digest, and the accepted post is still there.
    assert_eq!(buffer.len(), 1);

    let second = gen.build(start, end, &cancel).await.unwrap();
    assert_eq!(second.stories.len(), 1);
    assert!(buffer.is_empty());

    // The window was consumed; a third trigger has nothing to do.
    assert!(matches!(
        gen.build(start, end, &cancel).await,
        Err(DigestError::EmptyWindow)
    ));
}

#[tokio::test]
async fn dropped_shutdown_sender_is_not_a_cancellation() {
    let buffer = Arc::new(WindowBuffer::new());
    buffer.accept(post(1, "central bank raises key interest rate", 1_700_000_100));

    // The slow provider keeps the race window open long enough for a
    // closed-channel wakeup to fire if it were treated as cancellation.
    let gateway = Arc::new(LlmGateway::new(Arc::new(SlowProvider), GatewayConfig::default()));
    let gen = DigestGenerator::new(gateway, Arc::clone(&buffer), GeneratorConfig::default());
    let (start, end) = window();

    // Sender dropped immediately, flag still false.
    let (_, cancel) = watch::channel(false);

    let digest = gen.build(start, end, &cancel).await.unwrap();
    assert_eq!(digest.stories.len(), 1);
    assert!(buffer.is_empty());
}

#[tokio::test]
async fn cancelled_build_commits_nothing() {
    let buffer = Arc::new(WindowBuffer::new());
    buffer.accept(post(1, "central bank raises key interest rate", 1_700_000_100));

    let gateway = Arc::new(LlmGateway::new(Arc::new(SlowProvider), GatewayConfig::default()));
    let gen = Arc::new(DigestGenerator::new(
        gateway,
        Arc::clone(&buffer),
        GeneratorConfig::default(),
    ));
    let (start, end) = window();
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let gen2 = Arc::clone(&gen);
    let build = tokio::spawn(async move { gen2.build(start, end, &cancel_rx).await });
    // Let the build reach the summarize call, then pull shutdown.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let _ = cancel_tx.send(true);

    let outcome = build.await.unwrap();
    assert!(matches!(outcome, Err(DigestError::Cancelled)));
    assert_eq!(buffer.len(), 1);
}

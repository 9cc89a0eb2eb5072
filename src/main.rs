//! channelwatch — Binary Entrypoint
//! Boots the content pipeline: config, collaborators, poll and digest
//! schedulers, and a ctrl-c shutdown broadcast.
//!
//! Without `OPENAI_API_KEY` the daemon runs against the deterministic stub
//! provider, which keeps local runs and demos offline.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use channelwatch::config::PipelineConfig;
use channelwatch::deliver::BufferSink;
use channelwatch::digest::{DigestGenerator, WindowBuffer};
use channelwatch::gateway::{DynProvider, LlmGateway, OpenAiProvider, StubProvider};
use channelwatch::ingest::{ChannelRegistry, Poller};
use channelwatch::rules::RuleEngine;
use channelwatch::scheduler::{spawn_digest_scheduler, spawn_poll_scheduler};
use channelwatch::store::{MemoryStateStore, StaticRules};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

fn build_provider() -> DynProvider {
    if std::env::var("OPENAI_API_KEY").is_ok() {
        Arc::new(OpenAiProvider::new(None))
    } else {
        warn!("OPENAI_API_KEY not set; running with the stub provider");
        Arc::new(StubProvider::with_fallback(
            r#"{"match": false, "confidence": 0.0}"#,
        ))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = PipelineConfig::load_default()?;
    info!(
        channels = cfg.channels.len(),
        poll_interval = cfg.poll_interval_secs,
        digest_interval = cfg.digest_interval_secs,
        "configuration loaded"
    );

    let gateway = Arc::new(LlmGateway::new(build_provider(), cfg.gateway_config()));
    let store = Arc::new(MemoryStateStore::new());
    let rules = Arc::new(StaticRules::empty());
    let engine = Arc::new(RuleEngine::new(
        Arc::clone(&gateway),
        cfg.semantic_confidence_threshold,
    ));
    let sink = Arc::new(BufferSink::new());
    let buffer = Arc::new(WindowBuffer::new());
    let registry = Arc::new(ChannelRegistry::new(cfg.channels()));

    // No concrete source transport ships with the core; the daemon idles
    // unless a SourceClient is wired in here.
    let source: Arc<dyn channelwatch::ingest::types::SourceClient> = Arc::new(NullSource);

    let poller = Arc::new(Poller::new(
        source,
        store,
        rules,
        engine,
        Arc::clone(&sink) as Arc<dyn channelwatch::deliver::DeliverySink>,
        Arc::clone(&buffer),
        cfg.poller_config(),
    ));
    let generator = Arc::new(DigestGenerator::new(
        gateway,
        buffer,
        cfg.generator_config(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sched = cfg.scheduler_config();
    let poll_task = spawn_poll_scheduler(
        poller,
        registry,
        sched.poll_interval,
        shutdown_rx.clone(),
    );
    let digest_task = spawn_digest_scheduler(generator, sink, sched, shutdown_rx);

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    let _ = poll_task.await;
    let _ = digest_task.await;
    Ok(())
}

/// Placeholder source: always empty. Real deployments plug a transport in.
struct NullSource;

#[async_trait::async_trait]
impl channelwatch::ingest::types::SourceClient for NullSource {
    async fn fetch_since(
        &self,
        _channel: &channelwatch::types::Channel,
        _cursor: channelwatch::types::Cursor,
    ) -> Result<Vec<channelwatch::types::RawItem>, channelwatch::error::SourceError> {
        Ok(Vec::new())
    }

    fn name(&self) -> &'static str {
        "null"
    }
}

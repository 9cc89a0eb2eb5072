// src/scheduler.rs
//! Background schedules: one polling cadence across the channel set, one
//! digest cadence. Each tick is an independent, retriable unit of work;
//! shutdown is broadcast over a watch channel and an in-flight digest
//! build observes it before committing anything.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use metrics::counter;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::deliver::DeliverySink;
use crate::digest::DigestGenerator;
use crate::error::DigestError;
use crate::ingest::{ChannelRegistry, Poller};

#[derive(Clone, Copy, Debug)]
pub struct SchedulerCfg {
    pub poll_interval: Duration,
    pub digest_interval: Duration,
    /// Nominal length of the digest window; each digest tick summarizes
    /// everything accepted up to `now`, reported as `[now - window, now)`.
    pub digest_window: Duration,
}

/// Resolves once the shutdown flag flips to true. A dropped sender with the
/// flag still false means shutdown can never be requested anymore; the
/// future then pends forever so select arms fall through to real work.
/// The watch `Ref` is never held across an await point, keeping callers
/// `Send` for `tokio::spawn`.
pub(crate) async fn flag_raised(rx: &mut watch::Receiver<bool>) {
    loop {
        let raised = *rx.borrow_and_update();
        if raised {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Spawn the polling ticker. Every tick fans out over active channels via
/// the poller's bounded worker pool.
pub fn spawn_poll_scheduler(
    poller: Arc<Poller>,
    registry: Arc<ChannelRegistry>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    counter!("poll_ticks_total").increment(1);
                    let results = poller.poll_all(&registry).await;
                    debug!(channels = results.len(), "poll tick finished");
                }
                _ = flag_raised(&mut shutdown) => {
                    info!("poll scheduler shutting down");
                    break;
                }
            }
        }
    })
}

/// Spawn the digest ticker. A failed build leaves the window intact and is
/// retried on the next tick; a concurrent trigger for the same window is a
/// no-op thanks to the generator's single-flight guard.
pub fn spawn_digest_scheduler(
    generator: Arc<DigestGenerator>,
    sink: Arc<dyn DeliverySink>,
    cfg: SchedulerCfg,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cfg.digest_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let window = TimeDelta::from_std(cfg.digest_window)
            .unwrap_or_else(|_| TimeDelta::seconds(3600));
        // Separate handle for the in-flight build's cancellation check.
        let cancel = shutdown.clone();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    counter!("digest_ticks_total").increment(1);
                    let end = Utc::now();
                    let start = end - window;
                    match generator.build(start, end, &cancel).await {
                        Ok(digest) => sink.deliver_digest(&digest).await,
                        Err(DigestError::EmptyWindow) => {
                            debug!("digest tick: nothing accepted in window");
                        }
                        Err(DigestError::InFlight) => {
                            debug!("digest tick: build already in flight");
                        }
                        Err(e) => {
                            warn!(error = %e, "digest tick failed; retrying next tick");
                        }
                    }
                }
                _ = flag_raised(&mut shutdown) => {
                    info!("digest scheduler shutting down");
                    break;
                }
            }
        }
    })
}

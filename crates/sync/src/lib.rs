//! kapply sync: keep a cluster converged on remotely hosted manifest bundles.
//!
//! Every iteration beats the heartbeat, reads the source list, fetches each source with
//! `If-Modified-Since` revalidation and applies the decomposed manifests. A failing source
//! is logged and skipped; it never stops the others or the loop.

#![forbid(unsafe_code)]

pub mod fetch;
pub mod heartbeat;
pub mod sources;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use kapply_ops::{BatchReport, Mode, Reconciler};
use metrics::{counter, histogram};
use tokio::signal;
use tracing::{error, info, warn};

pub use fetch::{conditional_fetch, fetch_text, FetchResponse, Fetcher, HttpFetcher, SourceAuth, SourceCache};
pub use heartbeat::{Heartbeat, LivenessFile};
pub use sources::SourceList;

/// Minutes between iterations, from `KAPPLY_SYNC_INTERVAL_MINUTES` (default 5).
pub fn sync_interval() -> Duration {
    let minutes = std::env::var("KAPPLY_SYNC_INTERVAL_MINUTES")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(5);
    minutes_to_duration(minutes)
}

fn minutes_to_duration(minutes: u64) -> Duration {
    Duration::from_secs(minutes.saturating_mul(60))
}

/// Result of one iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub sources_ok: usize,
    pub sources_failed: usize,
    pub manifests: BatchReport,
}

impl CycleReport {
    pub fn is_success(&self) -> bool { self.sources_failed == 0 && self.manifests.is_success() }
}

pub struct SyncLoop {
    reconciler: Reconciler,
    fetcher: Arc<dyn Fetcher>,
    heartbeat: Arc<dyn Heartbeat>,
    sources: SourceList,
    cache: SourceCache,
    interval: Duration,
}

impl SyncLoop {
    pub fn new(reconciler: Reconciler, fetcher: Arc<dyn Fetcher>, heartbeat: Arc<dyn Heartbeat>, sources: SourceList) -> Self {
        Self { reconciler, fetcher, heartbeat, sources, cache: SourceCache::new(), interval: sync_interval() }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn cache(&self) -> &SourceCache { &self.cache }

    async fn sync_source(&mut self, url: &str) -> Result<BatchReport> {
        let body = conditional_fetch(self.fetcher.as_ref(), &mut self.cache, url).await?;
        let doc = kapply_apply::parse_documents(&body).with_context(|| format!("parsing {url}"))?;
        Ok(self.reconciler.run(doc, Mode::Apply).await)
    }

    /// One iteration. Never fails: heartbeat, source listing and per-source errors are
    /// logged and counted in the report.
    pub async fn run_once(&mut self) -> CycleReport {
        let t0 = Instant::now();
        counter!("sync_cycles_total", 1u64);
        if let Err(e) = self.heartbeat.beat().await {
            warn!(error = %e, "heartbeat failed");
        }

        let mut report = CycleReport::default();
        let urls = match self.sources.read().await {
            Ok(urls) => urls,
            Err(e) => {
                error!(error = ?e, "reading sources failed");
                report.sources_failed += 1;
                return report;
            }
        };

        for url in urls {
            let url = url.as_str();
            match self.sync_source(url).await {
                Ok(batch) => {
                    if batch.is_success() {
                        info!(url, applied = batch.succeeded, "source synced");
                        report.sources_ok += 1;
                    } else {
                        warn!(url, failed = batch.failures.len(), total = batch.total(), "source synced with failures");
                        report.sources_failed += 1;
                    }
                    report.manifests.merge(batch);
                }
                Err(e) => {
                    counter!("sync_source_errors_total", 1u64);
                    error!(url, error = ?e, "source failed");
                    report.sources_failed += 1;
                }
            }
        }
        histogram!("sync_cycle_ms", t0.elapsed().as_secs_f64() * 1000.0);
        report
    }

    /// Runs iterations every `interval` until Ctrl-C.
    pub async fn run(&mut self) {
        self.run_until(async {
            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "listening for Ctrl-C failed");
                std::future::pending::<()>().await;
            }
            info!("Ctrl-C received; shutting down sync loop");
        })
        .await
    }

    /// Runs iterations every `interval` until `shutdown` resolves, including mid-iteration.
    pub async fn run_until(&mut self, shutdown: impl Future<Output = ()>) {
        info!(interval_secs = self.interval.as_secs(), "sync loop starting");
        tokio::pin!(shutdown);
        loop {
            let report = tokio::select! {
                report = self.run_once() => report,
                _ = &mut shutdown => break,
            };
            info!(
                sources_ok = report.sources_ok,
                sources_failed = report.sources_failed,
                manifests_failed = report.manifests.failures.len(),
                "sync iteration finished; next in {}s",
                self.interval.as_secs()
            );
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = &mut shutdown => break,
            }
        }
        info!("sync loop stopped");
    }
}

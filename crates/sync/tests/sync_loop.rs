#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use kapply_kubehub::memory::{MemoryCluster, Verb};
use kapply_ops::Reconciler;
use kapply_sync::{FetchResponse, Fetcher, Heartbeat, SourceList, SyncLoop};

/// Serves a fixed body per URL; `Last-Modified` is constant so the second round gets 304.
#[derive(Default)]
struct StaticSite {
    pages: Mutex<HashMap<String, FetchResponse>>,
    hits: Mutex<Vec<(String, Option<String>)>>,
}

impl StaticSite {
    fn page(&self, url: &str, status: u16, body: &str) {
        let resp = FetchResponse { status, last_modified: Some("Mon, 01 Jan 2024 00:00:00 GMT".into()), body: body.into() };
        self.pages.lock().unwrap().insert(url.into(), resp);
    }
}

#[async_trait::async_trait]
impl Fetcher for StaticSite {
    async fn fetch(&self, url: &str, ims: Option<&str>) -> Result<FetchResponse> {
        self.hits.lock().unwrap().push((url.to_string(), ims.map(str::to_string)));
        let page = self.pages.lock().unwrap().get(url).cloned();
        match page {
            Some(p) if ims.is_some() && ims == p.last_modified.as_deref() => {
                Ok(FetchResponse { status: 304, last_modified: p.last_modified, body: String::new() })
            }
            Some(p) => Ok(p),
            None => anyhow::bail!("connection refused: {url}"),
        }
    }
}

#[derive(Default)]
struct CountingBeat(AtomicUsize);

#[async_trait::async_trait]
impl Heartbeat for CountingBeat {
    async fn beat(&self) -> Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

const GOOD: &str = "https://example.io/good.yaml";
const BROKEN: &str = "https://example.io/broken.yaml";
const DOWN: &str = "https://example.io/down.yaml";
const GARBLED: &str = "https://example.io/garbled.yaml";

const BUNDLE: &str = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: one
data:
  k: v
---
apiVersion: v1
kind: List
items:
- apiVersion: v1
  kind: ConfigMap
  metadata:
    name: two
"#;

fn setup(urls: &[&str]) -> (MemoryCluster, Arc<StaticSite>, Arc<CountingBeat>, SyncLoop) {
    let cluster = MemoryCluster::new();
    cluster.register("v1", "ConfigMap", true);
    let site = Arc::new(StaticSite::default());
    let beat = Arc::new(CountingBeat::default());
    let sources = SourceList::new(urls.iter().map(|u| u.to_string()).collect(), None);
    let lp = SyncLoop::new(Reconciler::new(Arc::new(cluster.clone()), "sync"), site.clone(), beat.clone(), sources);
    (cluster, site, beat, lp)
}

#[tokio::test]
async fn applies_every_manifest_of_a_source() {
    let (cluster, site, beat, mut lp) = setup(&[GOOD]);
    site.page(GOOD, 200, BUNDLE);

    let report = lp.run_once().await;
    assert!(report.is_success(), "{report:?}");
    assert_eq!(report.manifests.succeeded, 2);
    assert!(cluster.object("v1", "ConfigMap", Some("sync"), "one").is_some());
    assert!(cluster.object("v1", "ConfigMap", Some("sync"), "two").is_some());
    assert_eq!(beat.0.load(Ordering::SeqCst), 1);
    assert_eq!(lp.cache().len(), 1);
    assert!(lp.cache().body(GOOD).is_some());
}

#[tokio::test]
async fn failing_sources_do_not_stop_the_others() {
    let (cluster, site, beat, mut lp) = setup(&[DOWN, BROKEN, GARBLED, GOOD]);
    site.page(BROKEN, 500, "internal error");
    site.page(GARBLED, 200, "kind: [unterminated");
    site.page(GOOD, 200, BUNDLE);

    let report = lp.run_once().await;
    assert_eq!(report.sources_failed, 3);
    assert_eq!(report.sources_ok, 1);
    assert_eq!(lp.cache().len(), 2, "only 2xx answers are cached");
    assert!(cluster.object("v1", "ConfigMap", Some("sync"), "two").is_some());
    assert_eq!(beat.0.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unchanged_source_is_revalidated_and_reapplied_from_cache() {
    let (cluster, site, beat, mut lp) = setup(&[GOOD]);
    site.page(GOOD, 200, BUNDLE);

    lp.run_once().await;
    cluster.clear_calls();
    let report = lp.run_once().await;

    assert!(report.is_success(), "{report:?}");
    let hits = site.hits.lock().unwrap().clone();
    assert_eq!(hits.len(), 2);
    assert!(hits[1].1.is_some(), "second fetch must be conditional");
    // cached manifests still converge: the unchanged objects are patched, not recreated
    assert!(cluster.calls_of(Verb::Create).is_empty());
    assert_eq!(cluster.calls_of(Verb::StrategicMergePatch).len(), 2);
    assert_eq!(beat.0.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unknown_kinds_fail_the_source_but_apply_the_rest() {
    let (cluster, site, _beat, mut lp) = setup(&[GOOD]);
    let bundle = format!("{BUNDLE}\n---\napiVersion: example.io/v1\nkind: Widget\nmetadata:\n  name: w\n");
    site.page(GOOD, 200, &bundle);

    let report = lp.run_once().await;
    assert_eq!(report.sources_failed, 1);
    assert_eq!(report.manifests.succeeded, 2);
    assert_eq!(report.manifests.failures.len(), 1);
    assert!(cluster.object("v1", "ConfigMap", Some("sync"), "one").is_some());
}

/// Never returns from `beat`, so an iteration hangs until it is cancelled.
#[derive(Default)]
struct StuckBeat(AtomicUsize);

#[async_trait::async_trait]
impl Heartbeat for StuckBeat {
    async fn beat(&self) -> Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

#[tokio::test(start_paused = true)]
async fn shutdown_is_honoured_between_iterations() {
    let (_cluster, site, beat, lp) = setup(&[GOOD]);
    site.page(GOOD, 200, BUNDLE);
    let mut lp = lp.with_interval(Duration::from_secs(60));

    lp.run_until(tokio::time::sleep(Duration::from_secs(90))).await;
    // iterations at 0s and 60s; the 120s one never starts
    assert_eq!(beat.0.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn shutdown_is_honoured_mid_iteration() {
    let cluster = MemoryCluster::new();
    let beat = Arc::new(StuckBeat::default());
    let mut lp = SyncLoop::new(
        Reconciler::new(Arc::new(cluster), "sync"),
        Arc::new(StaticSite::default()),
        beat.clone(),
        SourceList::new(vec![GOOD.to_string()], None),
    );

    let stopped = tokio::time::timeout(Duration::from_secs(5), lp.run_until(tokio::time::sleep(Duration::from_secs(1)))).await;
    assert!(stopped.is_ok(), "loop ignored shutdown while an iteration was in flight");
    assert_eq!(beat.0.load(Ordering::SeqCst), 1);
}

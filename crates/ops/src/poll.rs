//! Bounded polling with doubling backoff.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::Resource as _;
use kapply_core::{Error, Intent, Resolution, ResourceHandle, Result, SchemaResolver};
use tracing::{debug, info, warn};

/// Runs `probe` up to `attempts` times, sleeping `backoff`, `2*backoff`, `4*backoff`, ...
/// between consecutive probes. `Ok(Some(_))` stops the loop; `Ok(None)` means "not yet".
/// A probe error aborts immediately. An `attempts` of zero is treated as one.
pub async fn poll_until<T, F, Fut>(what: &str, attempts: u32, backoff: Duration, mut probe: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let attempts = attempts.max(1);
    let mut delay = backoff;
    for attempt in 1..=attempts {
        if let Some(v) = probe(attempt).await? {
            debug!(what, attempt, "condition met");
            return Ok(v);
        }
        if attempt == attempts {
            break;
        }
        info!("{what}: not ready. re-checking in {}ms.. ({} attempts remaining)", delay.as_millis(), attempts - attempt);
        tokio::time::sleep(delay).await;
        delay = delay.saturating_mul(2);
    }
    warn!(what, attempts, "gave up");
    Err(Error::ScheduleExhausted { what: what.to_string(), attempts })
}

/// Initial backoff such that the doubling series over `attempts` probes sums to about
/// `timeout`: `timeout / 2^(attempts - 1)`.
pub fn backoff_for_timeout(timeout: Duration, attempts: u32) -> Duration {
    let shift = attempts.max(1) - 1;
    match 1u32.checked_shl(shift) {
        Some(div) => timeout / div,
        None => Duration::ZERO,
    }
}

/// Waits until (apiVersion, kind) resolves, e.g. after a CRD was applied.
pub async fn registered(
    resolver: &dyn SchemaResolver,
    api_version: &str,
    kind: &str,
    attempts: u32,
    backoff: Duration,
) -> Result<Arc<dyn ResourceHandle>> {
    let what = format!("{api_version}/{kind} registration");
    poll_until(&what, attempts, backoff, |_| async move {
        Ok(match resolver.resolve(api_version, kind, Intent::Get).await? {
            Resolution::Found(h) => Some(h),
            Resolution::Unknown => None,
        })
    })
    .await
}

/// Handle for the CustomResourceDefinition kind itself.
pub async fn crd_handle(resolver: &dyn SchemaResolver, intent: Intent) -> Result<Arc<dyn ResourceHandle>> {
    let (api_version, kind) = (CustomResourceDefinition::API_VERSION, CustomResourceDefinition::KIND);
    match resolver.resolve(api_version, kind, intent).await? {
        Resolution::Found(h) => Ok(h),
        Resolution::Unknown => Err(Error::SchemaNotFound {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            name: String::new(),
            namespace: None,
        }),
    }
}

/// Waits until the named CRD reads back 404.
pub async fn confirm_deleted(resolver: &dyn SchemaResolver, name: &str, attempts: u32, backoff: Duration) -> Result<()> {
    let handle = crd_handle(resolver, Intent::Get).await?;
    let what = format!("CustomResourceDefinition {name} deletion");
    poll_until(&what, attempts, backoff, |_| {
        let handle = handle.clone();
        async move {
            let res = handle.get(name, None).await?;
            debug!(crd = name, status = res.status, "deletion probe");
            Ok(res.is_not_found().then_some(()))
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use kapply_kubehub::MemoryCluster;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_exactly_attempts_probes() {
        let probes = AtomicU32::new(0);
        let t0 = Instant::now();
        let res: Result<()> = poll_until("thing", 3, Duration::from_millis(100), |_| {
            probes.fetch_add(1, Ordering::SeqCst);
            async { Ok(None) }
        })
        .await;
        assert!(matches!(res, Err(Error::ScheduleExhausted { attempts: 3, .. })));
        assert_eq!(probes.load(Ordering::SeqCst), 3);
        // 100 + 200, no sleep after the last probe
        let waited = t0.elapsed();
        assert!(waited >= Duration::from_millis(300) && waited < Duration::from_millis(400), "{waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn stops_probing_once_satisfied() {
        let probes = AtomicU32::new(0);
        let got = poll_until("thing", 5, Duration::from_millis(10), |attempt| {
            probes.fetch_add(1, Ordering::SeqCst);
            async move { Ok((attempt == 2).then_some(attempt)) }
        })
        .await
        .unwrap();
        assert_eq!(got, 2);
        assert_eq!(probes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_error_aborts() {
        let probes = AtomicU32::new(0);
        let res: Result<()> = poll_until("thing", 5, Duration::from_millis(10), |_| {
            probes.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Client("boom".into())) }
        })
        .await;
        assert!(matches!(res, Err(Error::Client(_))));
        assert_eq!(probes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempts_still_probes_once() {
        let probes = AtomicU32::new(0);
        let res: Result<()> = poll_until("thing", 0, Duration::from_millis(10), |_| {
            probes.fetch_add(1, Ordering::SeqCst);
            async { Ok(None) }
        })
        .await;
        assert!(res.is_err());
        assert_eq!(probes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_divides_timeout_across_doublings() {
        assert_eq!(backoff_for_timeout(Duration::from_millis(1600), 5), Duration::from_millis(100));
        assert_eq!(backoff_for_timeout(Duration::from_millis(1000), 1), Duration::from_millis(1000));
        assert_eq!(backoff_for_timeout(Duration::from_millis(1000), 0), Duration::from_millis(1000));
        assert_eq!(backoff_for_timeout(Duration::from_secs(1), 40), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn registered_waits_for_late_kind() {
        let c = MemoryCluster::new();
        c.register_after("example.io/v1", "Widget", true, 2);
        let h = registered(&c, "example.io/v1", "Widget", 5, Duration::from_millis(50)).await.unwrap();
        assert_eq!(h.kind(), "Widget");
        assert_eq!(c.resolve_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn registered_stops_after_second_attempt() {
        let c = MemoryCluster::new();
        c.register_after("example.io/v1", "Widget", true, 1);
        let t0 = Instant::now();
        let h = registered(&c, "example.io/v1", "Widget", 5, Duration::from_millis(50)).await.unwrap();
        assert_eq!(h.kind(), "Widget");
        assert_eq!(c.resolve_count(), 2);
        let waited = t0.elapsed();
        assert!(waited >= Duration::from_millis(50) && waited < Duration::from_millis(100), "{waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn registered_gives_up() {
        let c = MemoryCluster::new();
        let Err(err) = registered(&c, "example.io/v1", "Widget", 3, Duration::from_millis(50)).await else {
            panic!("expected exhaustion");
        };
        assert!(matches!(err, Error::ScheduleExhausted { attempts: 3, .. }));
        assert_eq!(c.resolve_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn confirm_deleted_sees_404() {
        let c = MemoryCluster::new();
        c.register(CustomResourceDefinition::API_VERSION, CustomResourceDefinition::KIND, false);
        confirm_deleted(&c, "widgets.example.io", 2, Duration::from_millis(10)).await.unwrap();

        c.insert(serde_json::json!({
            "apiVersion": CustomResourceDefinition::API_VERSION,
            "kind": CustomResourceDefinition::KIND,
            "metadata": {"name": "widgets.example.io"}
        }));
        let err = confirm_deleted(&c, "widgets.example.io", 2, Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, Error::ScheduleExhausted { .. }));
    }
}

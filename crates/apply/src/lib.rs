//! kapply apply: manifest decomposition and last-applied-configuration tracking apply.
//!
//! [`Applier::apply`] upserts one manifest. On an existing object it diffs the manifest
//! against the record stored under [`LAST_APPLIED_ANNOTATION`], nulls the fields the
//! manifest dropped, stamps the new record and patches: strategic merge first, merge patch
//! when the kind answers 415.

#![forbid(unsafe_code)]

pub mod decompose;
pub mod diff;
pub mod parse;

use std::collections::HashSet;
use std::sync::Mutex;

use kapply_core::{
    annotations_mut, Error, ResourceHandle, ResourceIdentity, Response, Result, LAST_APPLIED_ANNOTATION,
    LEGACY_LAST_APPLIED_ANNOTATION,
};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info, warn};

pub use decompose::{decompose, ListMatch};
pub use diff::{diff_summary, null_removed_fields, DiffSummary};
pub use parse::parse_documents;

/// Patch strategy for updates of existing objects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyMode {
    /// Strategic merge, falling back to merge patch on 415.
    #[default]
    StrategicFirst,
    /// Merge patch only.
    MergeOnly,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Created(Response),
    Configured(Response),
}

impl ApplyOutcome {
    pub fn response(&self) -> &Response {
        match self {
            ApplyOutcome::Created(r) | ApplyOutcome::Configured(r) => r,
        }
    }
}

/// What the live object says about the previous apply.
#[derive(Debug, Clone, PartialEq)]
pub enum LastApplied {
    Missing,
    /// Annotation present but not valid JSON; handled like `Missing`.
    Corrupt(String),
    Found(Json),
}

impl LastApplied {
    /// Reads the primary annotation, then the legacy one.
    pub fn read(live: &Json) -> Self {
        let annos = live.get("metadata").and_then(|m| m.get("annotations"));
        let raw = [LAST_APPLIED_ANNOTATION, LEGACY_LAST_APPLIED_ANNOTATION]
            .iter()
            .find_map(|k| annos.and_then(|a| a.get(*k)).and_then(Json::as_str).filter(|s| !s.is_empty()));
        match raw {
            None => LastApplied::Missing,
            Some(s) => match serde_json::from_str::<Json>(s) {
                Ok(v) => LastApplied::Found(v),
                Err(e) => LastApplied::Corrupt(e.to_string()),
            },
        }
    }
}

fn stamp_last_applied(manifest: &mut Json, record: &Json, clear_legacy: bool) -> Result<()> {
    let encoded = serde_json::to_string(record).map_err(|e| Error::Client(format!("encoding last-applied record: {e}")))?;
    let annos = annotations_mut(manifest).ok_or_else(|| Error::InvalidManifest("manifest is not an object".into()))?;
    annos.insert(LAST_APPLIED_ANNOTATION.into(), Json::String(encoded));
    if clear_legacy {
        annos.insert(LEGACY_LAST_APPLIED_ANNOTATION.into(), Json::Null);
    }
    Ok(())
}

/// Upserts manifests. Holds the default namespace and the set of kinds known to reject
/// strategic merge patches, which lives as long as the `Applier`.
pub struct Applier {
    namespace: String,
    mode: ApplyMode,
    merge_only: Mutex<HashSet<(String, String)>>,
}

impl Applier {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self::with_mode(namespace, ApplyMode::default())
    }

    pub fn with_mode(namespace: impl Into<String>, mode: ApplyMode) -> Self {
        Self { namespace: namespace.into(), mode, merge_only: Mutex::new(HashSet::new()) }
    }

    pub fn namespace(&self) -> &str { &self.namespace }

    fn strategic_allowed(&self, handle: &dyn ResourceHandle) -> bool {
        if self.mode == ApplyMode::MergeOnly {
            return false;
        }
        let known = self.merge_only.lock().unwrap_or_else(|p| p.into_inner());
        !known.contains(&(handle.api_version().to_string(), handle.kind().to_string()))
    }

    fn remember_merge_only(&self, handle: &dyn ResourceHandle) {
        self.merge_only
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert((handle.api_version().to_string(), handle.kind().to_string()));
    }

    pub async fn apply(&self, handle: &dyn ResourceHandle, mut manifest: Json) -> Result<ApplyOutcome> {
        let t0 = std::time::Instant::now();
        counter!("apply_attempts", 1u64);
        let res = self.apply_inner(handle, &mut manifest).await;
        match &res {
            Ok(_) => {
                histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
                counter!("apply_ok", 1u64);
            }
            Err(_) => { counter!("apply_err", 1u64); }
        }
        res
    }

    async fn apply_inner(&self, handle: &dyn ResourceHandle, manifest: &mut Json) -> Result<ApplyOutcome> {
        if kapply_core::default_namespace(manifest, handle.namespaced(), &self.namespace) {
            debug!(kind = handle.kind(), namespace = %self.namespace, "defaulted namespace");
        }
        let id = ResourceIdentity::of(manifest)?;
        let ns = id.namespace.as_deref();
        let uri = handle.uri(&id.name, ns);
        debug!(uri = %uri, "apply");

        let get = handle.get(&id.name, ns).await?;
        debug!(uri = %uri, status = get.status, rv = ?get.body.get("metadata").and_then(|m| m.get("resourceVersion")), "get");
        let live = match get.status {
            200 => get.body,
            404 => return self.create(handle, manifest, &id, &uri).await,
            _ => {
                warn!(uri = %uri, status = get.status, "get failed");
                return Err(Error::transport(&id, get));
            }
        };

        let original = manifest.clone();
        match LastApplied::read(&live) {
            LastApplied::Found(prev) => {
                let has_legacy = live
                    .get("metadata")
                    .and_then(|m| m.get("annotations"))
                    .and_then(|a| a.get(LEGACY_LAST_APPLIED_ANNOTATION))
                    .is_some();
                stamp_last_applied(manifest, &original, has_legacy)?;
                let removed = null_removed_fields(manifest, &prev);
                let summary = diff_summary(&original, &prev);
                debug!(uri = %uri, ?removed, adds = summary.adds, updates = summary.updates, removes = summary.removes, "diffed against last-applied");
            }
            LastApplied::Corrupt(e) => {
                warn!(uri = %uri, error = %e, "{} is not valid JSON; treating object as unmanaged", LAST_APPLIED_ANNOTATION);
                stamp_last_applied(manifest, &original, false)?;
            }
            LastApplied::Missing => {
                warn!(uri = %uri, "no {} found", LAST_APPLIED_ANNOTATION);
                stamp_last_applied(manifest, &original, false)?;
            }
        }

        if self.strategic_allowed(handle) {
            let res = handle.strategic_merge_patch(&id.name, ns, manifest).await?;
            debug!(uri = %uri, status = res.status, "strategic merge patch");
            match res.status {
                415 => {
                    debug!(kind = handle.kind(), "strategic merge unsupported; using merge patch");
                    self.remember_merge_only(handle);
                }
                _ if res.is_success() => {
                    info!("{}/{} configured", id.kind, id.name);
                    return Ok(ApplyOutcome::Configured(res));
                }
                _ => {
                    warn!(uri = %uri, status = res.status, "strategic merge patch failed");
                    return Err(Error::transport(&id, res));
                }
            }
        }

        let res = handle.merge_patch(&id.name, ns, manifest).await?;
        debug!(uri = %uri, status = res.status, "merge patch");
        if !res.is_success() {
            warn!(uri = %uri, status = res.status, "merge patch failed");
            return Err(Error::transport(&id, res));
        }
        info!("{}/{} configured", id.kind, id.name);
        Ok(ApplyOutcome::Configured(res))
    }

    async fn create(&self, handle: &dyn ResourceHandle, manifest: &mut Json, id: &ResourceIdentity, uri: &str) -> Result<ApplyOutcome> {
        let original = manifest.clone();
        stamp_last_applied(manifest, &original, false)?;
        debug!(uri = %uri, "post");
        let post = handle.create(manifest).await?;
        if !matches!(post.status, 200 | 201 | 202) {
            warn!(uri = %uri, status = post.status, "create failed");
            return Err(Error::transport(id, post));
        }
        info!("{}/{} created", id.kind, id.name);
        Ok(ApplyOutcome::Created(post))
    }
}

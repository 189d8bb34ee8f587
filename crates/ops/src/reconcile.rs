//! Batch driver: decompose a document and run every manifest through one mode.

use std::fmt;
use std::sync::Arc;

use kapply_apply::{decompose, Applier, ApplyMode, ApplyOutcome, ListMatch};
use kapply_core::{Error, Intent, Resolution, ResourceHandle, ResourceIdentity, Result, SchemaResolver};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{error, info};

use crate::lifecycle::{DeleteOutcome, EnsureOutcome, Lifecycle, ReplaceOutcome};

/// Operation applied to every manifest of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    Apply,
    Replace,
    EnsureExists,
    Delete { force: bool },
}

impl Mode {
    fn intent(self) -> Intent {
        match self {
            Mode::Delete { .. } => Intent::Delete,
            _ => Intent::Update,
        }
    }

    fn list_match(self) -> ListMatch {
        match self {
            Mode::Delete { .. } => ListMatch::Suffix,
            _ => ListMatch::Exact,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Applied(ApplyOutcome),
    Replaced(ReplaceOutcome),
    Ensured(EnsureOutcome),
    Deleted(DeleteOutcome),
}

/// A manifest that failed, with the rendered error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub identity: String,
    pub status: Option<u16>,
    pub message: String,
}

/// Results of a batch. Batches are not atomic: earlier successes stay applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failures: Vec<Failure>,
}

impl BatchReport {
    pub fn total(&self) -> usize { self.succeeded + self.failures.len() }

    pub fn is_success(&self) -> bool { self.failures.is_empty() }

    pub fn record_failure(&mut self, identity: impl fmt::Display, err: &Error) {
        self.failures.push(Failure { identity: identity.to_string(), status: err.status(), message: err.to_string() });
    }

    pub fn merge(&mut self, other: BatchReport) {
        self.succeeded += other.succeeded;
        self.failures.extend(other.failures);
    }

    pub fn into_result(self) -> Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(Error::PartialFailure { failed: self.failures.len(), total: self.total() })
        }
    }
}

/// Resolves handles and dispatches manifests to the apply engine or lifecycle primitives.
pub struct Reconciler {
    resolver: Arc<dyn SchemaResolver>,
    applier: Applier,
    lifecycle: Lifecycle,
}

impl Reconciler {
    pub fn new(resolver: Arc<dyn SchemaResolver>, namespace: impl Into<String>) -> Self {
        Self::with_apply_mode(resolver, namespace, ApplyMode::default())
    }

    pub fn with_apply_mode(resolver: Arc<dyn SchemaResolver>, namespace: impl Into<String>, mode: ApplyMode) -> Self {
        let namespace = namespace.into();
        Self { resolver, lifecycle: Lifecycle::new(namespace.clone()), applier: Applier::with_mode(namespace, mode) }
    }

    pub fn resolver(&self) -> &dyn SchemaResolver { self.resolver.as_ref() }

    pub fn lifecycle(&self) -> &Lifecycle { &self.lifecycle }

    pub fn namespace(&self) -> &str { self.applier.namespace() }

    /// Looks up the handle for a manifest; an unregistered kind is `SchemaNotFound`.
    pub async fn handle_for(&self, id: &ResourceIdentity, intent: Intent) -> Result<Arc<dyn ResourceHandle>> {
        match self.resolver.resolve(&id.api_version, &id.kind, intent).await? {
            Resolution::Found(h) => Ok(h),
            Resolution::Unknown => Err(Error::SchemaNotFound {
                api_version: id.api_version.clone(),
                kind: id.kind.clone(),
                name: id.name.clone(),
                namespace: id.namespace.clone(),
            }),
        }
    }

    pub async fn reconcile_one(&self, manifest: Json, mode: Mode) -> Result<Outcome> {
        let id = ResourceIdentity::of(&manifest)?;
        let handle = self.handle_for(&id, mode.intent()).await?;
        let h = handle.as_ref();
        Ok(match mode {
            Mode::Apply => Outcome::Applied(self.applier.apply(h, manifest).await?),
            Mode::Replace => Outcome::Replaced(self.lifecycle.replace(h, manifest).await?),
            Mode::EnsureExists => Outcome::Ensured(self.lifecycle.ensure_exists(h, manifest).await?),
            Mode::Delete { force } => Outcome::Deleted(self.lifecycle.delete_resource(h, manifest, force).await?),
        })
    }

    /// Decomposes `document` and reconciles each manifest in order. Nulls are skipped;
    /// a failure is logged and recorded and the batch moves on.
    pub async fn run(&self, document: Json, mode: Mode) -> BatchReport {
        self.run_all(decompose(document, mode.list_match()), mode).await
    }

    /// Reconciles already-flattened manifests in order.
    pub async fn run_all(&self, manifests: Vec<Json>, mode: Mode) -> BatchReport {
        let mut report = BatchReport::default();
        for manifest in manifests.into_iter().filter(|m| !m.is_null()) {
            let label = label_of(&manifest);
            match self.reconcile_one(manifest, mode).await {
                Ok(_) => {
                    counter!("reconcile_ok", 1u64);
                    report.succeeded += 1;
                }
                Err(e) => {
                    counter!("reconcile_err", 1u64);
                    match e.status() {
                        Some(status) => error!(identity = %label, status, "{e}"),
                        None => error!(identity = %label, "{e}"),
                    }
                    report.record_failure(&label, &e);
                }
            }
        }
        if !report.failures.is_empty() {
            info!(failed = report.failures.len(), total = report.total(), ?mode, "batch finished with failures");
        }
        report
    }
}

fn label_of(manifest: &Json) -> String {
    match ResourceIdentity::of(manifest) {
        Ok(id) => id.to_string(),
        Err(_) => format!("{}/{} {}", kapply_core::api_version_of(manifest), kapply_core::kind_of(manifest), kapply_core::name_of(manifest).unwrap_or("<unnamed>")),
    }
}

//! Custom resource schema removal: delete the CRD, then confirm or force-clean its instances.

use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::Resource as _;
use kapply_core::{Error, Intent, Resolution, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info, warn};

use crate::poll::{confirm_deleted, crd_handle};
use crate::reconcile::{BatchReport, Reconciler};

/// The parts of a CRD manifest needed to find its instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrdInfo {
    pub name: String,
    pub group: String,
    pub kind: String,
    pub storage_versions: Vec<String>,
}

impl CrdInfo {
    /// Reads `spec.group`, `spec.names.kind` and the storage versions. Accepts the
    /// `spec.versions[].storage` list and the older single `spec.version` field.
    pub fn from_manifest(crd: &Json) -> Result<Self> {
        let name = kapply_core::name_of(crd)
            .ok_or_else(|| Error::InvalidManifest("CustomResourceDefinition missing metadata.name".into()))?;
        let spec = crd.get("spec").ok_or_else(|| Error::InvalidManifest(format!("CustomResourceDefinition {name} missing spec")))?;
        let field = |path: &[&str]| path.iter().try_fold(spec, |v, k| v.get(*k)).and_then(Json::as_str).map(str::to_string);
        let group = field(&["group"]).ok_or_else(|| Error::InvalidManifest(format!("CustomResourceDefinition {name} missing spec.group")))?;
        let kind = field(&["names", "kind"]).ok_or_else(|| Error::InvalidManifest(format!("CustomResourceDefinition {name} missing spec.names.kind")))?;

        let mut storage_versions: Vec<String> = spec
            .get("versions")
            .and_then(Json::as_array)
            .map(|vs| {
                vs.iter()
                    .filter(|v| v.get("storage").and_then(Json::as_bool).unwrap_or(false))
                    .filter_map(|v| v.get("name").and_then(Json::as_str).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        if storage_versions.is_empty() {
            storage_versions.extend(field(&["version"]));
        }
        Ok(Self { name: name.to_string(), group, kind, storage_versions })
    }

    pub fn api_versions(&self) -> impl Iterator<Item = String> + '_ {
        self.storage_versions.iter().map(move |v| format!("{}/{}", self.group, v))
    }
}

pub fn is_crd(manifest: &Json) -> bool {
    kapply_core::kind_of(manifest) == CustomResourceDefinition::KIND
        && kapply_core::api_version_of(manifest).starts_with(CustomResourceDefinition::GROUP)
}

/// Where schema deletion ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemaState {
    Present,
    Deleting,
    ConfirmedAbsent,
    ForceCleaned,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemovalOptions {
    pub force: bool,
    pub attempts: u32,
    pub backoff: Duration,
}

impl Reconciler {
    /// Lists every instance of each storage version and force-deletes it.
    /// Objects created by those instances are left alone.
    pub async fn force_cleanup(&self, crd: &CrdInfo) -> BatchReport {
        let mut report = BatchReport::default();
        for api_version in crd.api_versions() {
            let handle = match self.resolver().resolve(&api_version, &crd.kind, Intent::Delete).await {
                Ok(Resolution::Found(h)) => h,
                Ok(Resolution::Unknown) => {
                    debug!(api_version = %api_version, kind = %crd.kind, "not served; nothing to clean up");
                    continue;
                }
                Err(e) => {
                    warn!(api_version = %api_version, kind = %crd.kind, "{e}");
                    report.record_failure(format!("{api_version}/{}", crd.kind), &e);
                    continue;
                }
            };
            let items = match handle.list(None).await {
                Ok(res) if res.is_success() => res.body.get("items").and_then(Json::as_array).cloned().unwrap_or_default(),
                Ok(res) if res.status == 404 => {
                    debug!(api_version = %api_version, kind = %crd.kind, "no longer served; nothing to clean up");
                    continue;
                }
                Ok(res) => {
                    let e = Error::transport(format!("{api_version}/{}", crd.kind), res);
                    warn!("{e}");
                    report.record_failure(format!("{api_version}/{}", crd.kind), &e);
                    continue;
                }
                Err(e) => {
                    report.record_failure(format!("{api_version}/{}", crd.kind), &e);
                    continue;
                }
            };
            info!(crd = %crd.name, api_version = %api_version, count = items.len(), "force cleaning instances");
            for item in items {
                let label = kapply_core::ResourceIdentity::of(&item).map(|id| id.to_string()).unwrap_or_else(|_| crd.kind.clone());
                match self.lifecycle().delete_resource(handle.as_ref(), item, true).await {
                    Ok(_) => report.succeeded += 1,
                    Err(e) => {
                        warn!(identity = %label, "{e}");
                        report.record_failure(label, &e);
                    }
                }
            }
        }
        report
    }

    /// Deletes a CRD, then either force-cleans its instances or waits for the deletion to
    /// be confirmed. Returns the terminal state; `TimedOut` is returned as an error.
    pub async fn remove_schema(&self, crd_manifest: &Json, opts: RemovalOptions) -> Result<SchemaState> {
        let crd = CrdInfo::from_manifest(crd_manifest)?;
        let handle = crd_handle(self.resolver(), Intent::Delete).await?;
        debug!(crd = %crd.name, state = ?SchemaState::Present, "removing schema");

        self.lifecycle().delete_resource(handle.as_ref(), crd_manifest.clone(), false).await?;
        debug!(crd = %crd.name, state = ?SchemaState::Deleting, "schema delete issued");

        if opts.force {
            let report = self.force_cleanup(&crd).await;
            warn!(crd = %crd.name, "force cleanup does not remove resources created by {} instances", crd.kind);
            report.into_result()?;
            info!(crd = %crd.name, state = ?SchemaState::ForceCleaned, "schema removed");
            return Ok(SchemaState::ForceCleaned);
        }

        match confirm_deleted(self.resolver(), &crd.name, opts.attempts, opts.backoff).await {
            Ok(()) => {
                info!(crd = %crd.name, state = ?SchemaState::ConfirmedAbsent, "schema removed");
                Ok(SchemaState::ConfirmedAbsent)
            }
            Err(e @ Error::ScheduleExhausted { .. }) => {
                warn!(
                    crd = %crd.name,
                    state = ?SchemaState::TimedOut,
                    "{} still present; instances may be blocked by finalizers. Re-run with --force to clean them up (resources they created will not be removed)",
                    crd.name
                );
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}

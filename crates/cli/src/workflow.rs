//! Install and remove workflows over catalog components.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
use k8s_openapi::Resource as _;
use kapply_apply::{decompose, parse_documents, ListMatch};
use kapply_ops::{is_crd, registered, BatchReport, CrdInfo, Mode, Reconciler, RemovalOptions};
use kapply_sync::{fetch_text, Fetcher};
use serde_json::{json, Map, Value as Json};
use tracing::{error, info};

use crate::catalog::{Catalog, ComponentPin, FileLocation, LATEST};

/// ConfigMap whose entries are the URLs the sync loop keeps applied.
pub const SOURCES_CONFIGMAP: &str = "kapply-sources";

/// Attempts and initial backoff when waiting for freshly installed CRDs to be served.
const REGISTER_ATTEMPTS: u32 = 5;
const REGISTER_BACKOFF: Duration = Duration::from_millis(50);

pub struct Workflow {
    reconciler: Reconciler,
    fetcher: Arc<dyn Fetcher>,
}

pub struct InstallOptions<'a> {
    pub catalog: &'a Catalog,
    pub location: &'a FileLocation,
    pub pins: &'a [ComponentPin],
    pub prereqs: Option<&'a Path>,
    pub autoupdate: bool,
}

pub struct RemoveOptions<'a> {
    pub catalog: &'a Catalog,
    pub location: &'a FileLocation,
    pub pins: &'a [ComponentPin],
    pub prereqs: Option<&'a Path>,
    pub removal: RemovalOptions,
    pub delete_namespace: bool,
}

impl Workflow {
    pub fn new(reconciler: Reconciler, fetcher: Arc<dyn Fetcher>) -> Self {
        Self { reconciler, fetcher }
    }

    fn namespace(&self) -> &str { self.reconciler.namespace() }

    /// The target Namespace followed by the documents of the optional prerequisites file.
    async fn prerequisites(&self, prereqs: Option<&Path>) -> Result<Vec<Json>> {
        let mut out = vec![json!({
            "apiVersion": Namespace::API_VERSION,
            "kind": Namespace::KIND,
            "metadata": { "name": self.namespace() }
        })];
        if let Some(path) = prereqs {
            let text = tokio::fs::read_to_string(path).await.with_context(|| format!("reading prerequisites {}", path.display()))?;
            let doc = parse_documents(&text).with_context(|| format!("parsing prerequisites {}", path.display()))?;
            out.extend(decompose(doc, ListMatch::Exact).into_iter().filter(|m| !m.is_null()));
        }
        Ok(out)
    }

    async fn download(&self, url: &str, lists: ListMatch) -> Result<Vec<Json>> {
        info!("Downloading {url}");
        let body = fetch_text(self.fetcher.as_ref(), url).await?;
        let doc = parse_documents(&body).with_context(|| format!("parsing {url}"))?;
        Ok(decompose(doc, lists).into_iter().filter(|m| !m.is_null()).collect())
    }

    pub async fn install(&self, opts: &InstallOptions<'_>) -> Result<BatchReport> {
        let mut report = BatchReport::default();

        info!("=========== Installing Prerequisites ===========");
        let prereqs = self.prerequisites(opts.prereqs).await?;
        report.merge(self.reconciler.run_all(prereqs, Mode::EnsureExists).await);

        let mut latest = Map::new();
        for sel in opts.catalog.select(opts.pins)? {
            let name = &sel.component.name;
            info!("=========== Installing {name}:{} ===========", sel.version);
            let url = opts.location.url(sel.component, &sel.version);
            let manifests = match self.download(&url, ListMatch::Exact).await {
                Ok(m) => m,
                Err(e) => {
                    error!(component = %name, error = ?e, "download failed");
                    report.failures.push(kapply_ops::Failure { identity: url, status: None, message: format!("{e:#}") });
                    continue;
                }
            };
            let (crds, rest): (Vec<Json>, Vec<Json>) = manifests.into_iter().partition(is_crd);
            report.merge(self.reconciler.run_all(crds.clone(), Mode::Replace).await);
            for crd in &crds {
                self.await_registration(crd, &mut report).await;
            }
            report.merge(self.reconciler.run_all(rest, Mode::Replace).await);
            if opts.autoupdate {
                latest.insert(name.clone(), Json::String(opts.location.url(sel.component, LATEST)));
            }
        }

        if opts.autoupdate && !latest.is_empty() {
            info!("=========== Installing Auto-Update Sources ===========");
            let sources = json!({
                "apiVersion": ConfigMap::API_VERSION,
                "kind": ConfigMap::KIND,
                "metadata": { "name": SOURCES_CONFIGMAP, "namespace": self.namespace() },
                "data": latest
            });
            report.merge(self.reconciler.run_all(vec![sources], Mode::Apply).await);
        }
        Ok(report)
    }

    async fn await_registration(&self, crd: &Json, report: &mut BatchReport) {
        let crd_info = match CrdInfo::from_manifest(crd) {
            Ok(i) => i,
            Err(e) => {
                report.record_failure(kapply_core::name_of(crd).unwrap_or("CustomResourceDefinition"), &e);
                return;
            }
        };
        for api_version in crd_info.api_versions() {
            match registered(self.reconciler.resolver(), &api_version, &crd_info.kind, REGISTER_ATTEMPTS, REGISTER_BACKOFF).await {
                Ok(_) => info!("Found {api_version} {}", crd_info.kind),
                Err(e) => {
                    error!("{e}");
                    report.record_failure(format!("{api_version}/{}", crd_info.kind), &e);
                }
            }
        }
    }

    pub async fn remove(&self, opts: &RemoveOptions<'_>) -> Result<BatchReport> {
        let mut report = BatchReport::default();

        for sel in opts.catalog.select(opts.pins)? {
            let name = &sel.component.name;
            info!("=========== Removing {name}:{} ===========", sel.version);
            let url = opts.location.url(sel.component, &sel.version);
            let manifests = match self.download(&url, ListMatch::Suffix).await {
                Ok(m) => m,
                Err(e) => {
                    error!(component = %name, error = ?e, "download failed");
                    report.failures.push(kapply_ops::Failure { identity: url, status: None, message: format!("{e:#}") });
                    continue;
                }
            };
            let (crds, rest): (Vec<Json>, Vec<Json>) = manifests.into_iter().partition(is_crd);
            for crd in &crds {
                let label = kapply_core::name_of(crd).unwrap_or("CustomResourceDefinition").to_string();
                match self.reconciler.remove_schema(crd, opts.removal).await {
                    Ok(state) => {
                        info!(crd = %label, ?state, "schema removed");
                        report.succeeded += 1;
                    }
                    Err(e) => {
                        error!("Failed to safely clean up crd {label}: {e}.. use option '--force' to force clean up (note: child resources wont be cleaned up)");
                        report.record_failure(label, &e);
                    }
                }
            }
            report.merge(self.reconciler.run_all(rest, Mode::Delete { force: false }).await);
        }

        if opts.pins.is_empty() {
            // removing everything also drops the auto-update sources
            let sources = json!({
                "apiVersion": ConfigMap::API_VERSION,
                "kind": ConfigMap::KIND,
                "metadata": { "name": SOURCES_CONFIGMAP }
            });
            report.merge(self.reconciler.run_all(vec![sources], Mode::Delete { force: false }).await);
        }

        info!("=========== Removing Prerequisites ===========");
        let prereqs: Vec<Json> = self
            .prerequisites(opts.prereqs)
            .await?
            .into_iter()
            .filter(|m| {
                let keep = opts.delete_namespace || !kapply_core::kind_of(m).eq_ignore_ascii_case(Namespace::KIND);
                if !keep {
                    info!("Skipping namespace deletion: --namespace='{}' --delete-namespace='false'", self.namespace());
                }
                keep
            })
            .collect();
        report.merge(self.reconciler.run_all(prereqs, Mode::Delete { force: false }).await);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kapply_kubehub::MemoryCluster;
    use kapply_sync::FetchResponse;
    use std::collections::HashMap;

    struct Site(HashMap<String, String>);

    #[async_trait::async_trait]
    impl Fetcher for Site {
        async fn fetch(&self, url: &str, _ims: Option<&str>) -> Result<FetchResponse> {
            Ok(match self.0.get(url) {
                Some(body) => FetchResponse { status: 200, last_modified: None, body: body.clone() },
                None => FetchResponse { status: 404, last_modified: None, body: "Not Found".into() },
            })
        }
    }

    const CATALOG: &str = r#"
fileSource: https://releases.example.io
components:
  - name: widgets
    dir: Widgets
  - name: extras
    dir: Extras
"#;

    const WIDGETS: &str = r#"
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: widgets.example.io
spec:
  group: example.io
  names: {kind: Widget, plural: widgets}
  scope: Namespaced
  versions:
  - {name: v1, served: true, storage: true}
---
apiVersion: example.io/v1
kind: Widget
metadata:
  name: default-widget
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: widget-config
data:
  mode: fast
"#;

    fn cluster() -> MemoryCluster {
        let c = MemoryCluster::new();
        c.register("v1", "Namespace", false);
        c.register("v1", "ConfigMap", true);
        c.register("apiextensions.k8s.io/v1", "CustomResourceDefinition", false);
        // the custom kind is only served once its CRD has been picked up
        c.register_after("example.io/v1", "Widget", true, 1);
        c
    }

    fn workflow(c: &MemoryCluster, pages: &[(&str, &str)]) -> Workflow {
        let site = Site(pages.iter().map(|(u, b)| (u.to_string(), b.to_string())).collect());
        Workflow::new(Reconciler::new(Arc::new(c.clone()), "team"), Arc::new(site))
    }

    const WIDGETS_URL: &str = "https://releases.example.io/Widgets/releases/latest/resource.yaml";

    fn removal() -> RemovalOptions {
        RemovalOptions { force: false, attempts: 2, backoff: Duration::from_millis(10) }
    }

    #[tokio::test(start_paused = true)]
    async fn install_orders_schemas_before_instances_and_records_sources() {
        let c = cluster();
        let cat = Catalog::from_yaml(CATALOG).unwrap();
        let loc = FileLocation::resolve(&cat, None, None).unwrap();
        let pins = vec!["widgets".parse().unwrap()];
        let wf = workflow(&c, &[(WIDGETS_URL, WIDGETS)]);

        let report = wf
            .install(&InstallOptions { catalog: &cat, location: &loc, pins: &pins, prereqs: None, autoupdate: true })
            .await
            .unwrap();
        assert!(report.is_success(), "{:?}", report.failures);

        assert!(c.object("v1", "Namespace", None, "team").is_some());
        assert!(c.object("apiextensions.k8s.io/v1", "CustomResourceDefinition", None, "widgets.example.io").is_some());
        assert!(c.object("example.io/v1", "Widget", Some("team"), "default-widget").is_some());
        let sources = c.object("v1", "ConfigMap", Some("team"), SOURCES_CONFIGMAP).unwrap();
        assert_eq!(sources["data"], json!({"widgets": WIDGETS_URL}));
    }

    #[tokio::test(start_paused = true)]
    async fn install_reports_missing_bundles_and_continues() {
        let c = cluster();
        let cat = Catalog::from_yaml(CATALOG).unwrap();
        let loc = FileLocation::resolve(&cat, None, None).unwrap();
        let wf = workflow(&c, &[(WIDGETS_URL, WIDGETS)]);

        let report = wf
            .install(&InstallOptions { catalog: &cat, location: &loc, pins: &[], prereqs: None, autoupdate: false })
            .await
            .unwrap();
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].identity.contains("/Extras/"));
        assert!(c.object("v1", "ConfigMap", Some("team"), "widget-config").is_some());
        assert!(c.object("v1", "ConfigMap", Some("team"), SOURCES_CONFIGMAP).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn remove_keeps_namespace_unless_asked() {
        let c = cluster();
        let cat = Catalog::from_yaml(CATALOG).unwrap();
        let loc = FileLocation::resolve(&cat, None, None).unwrap();
        let pins = vec!["widgets".parse().unwrap()];
        let wf = workflow(&c, &[(WIDGETS_URL, WIDGETS)]);
        wf.install(&InstallOptions { catalog: &cat, location: &loc, pins: &pins, prereqs: None, autoupdate: false })
            .await
            .unwrap();

        let opts = RemoveOptions { catalog: &cat, location: &loc, pins: &pins, prereqs: None, removal: removal(), delete_namespace: false };
        let report = wf.remove(&opts).await.unwrap();
        assert!(report.is_success(), "{:?}", report.failures);
        assert!(c.object("apiextensions.k8s.io/v1", "CustomResourceDefinition", None, "widgets.example.io").is_none());
        assert!(c.object("v1", "ConfigMap", Some("team"), "widget-config").is_none());
        assert!(c.object("v1", "Namespace", None, "team").is_some());

        let opts = RemoveOptions { delete_namespace: true, ..opts };
        wf.remove(&opts).await.unwrap();
        assert!(c.object("v1", "Namespace", None, "team").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn prerequisites_file_is_ensured_and_removed() {
        let c = cluster();
        let path = std::env::temp_dir().join(format!("kapply-prereqs-{}.yaml", std::process::id()));
        tokio::fs::write(&path, "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: shared\ndata:\n  a: b\n").await.unwrap();
        let cat = Catalog::from_yaml(CATALOG).unwrap();
        let loc = FileLocation::resolve(&cat, None, None).unwrap();
        let pins = vec!["widgets".parse().unwrap()];
        let wf = workflow(&c, &[(WIDGETS_URL, WIDGETS)]);

        wf.install(&InstallOptions { catalog: &cat, location: &loc, pins: &pins, prereqs: Some(path.as_path()), autoupdate: false })
            .await
            .unwrap();
        assert!(c.object("v1", "ConfigMap", Some("team"), "shared").is_some());

        let opts = RemoveOptions { catalog: &cat, location: &loc, pins: &pins, prereqs: Some(path.as_path()), removal: removal(), delete_namespace: false };
        wf.remove(&opts).await.unwrap();
        assert!(c.object("v1", "ConfigMap", Some("team"), "shared").is_none());
        let _ = tokio::fs::remove_file(&path).await;
    }
}

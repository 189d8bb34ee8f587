//! kapply kubehub – resource accessors backed by the kube dynamic API.

#![forbid(unsafe_code)]

pub mod memory;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use kapply_core::{Error, Intent, Resolution, ResourceHandle, Response, SchemaResolver};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::Scope,
    Client,
};
use metrics::counter;
use serde::Serialize;
use serde_json::Value as Json;
use tokio::sync::OnceCell;
use tracing::debug;

pub use memory::MemoryCluster;

static CLIENT: OnceCell<Client> = OnceCell::const_new();

/// Shared kube client built from the ambient kubeconfig / in-cluster config.
pub async fn get_kube_client() -> Result<Client> {
    let client = CLIENT.get_or_try_init(|| async { Client::try_default().await }).await?;
    Ok(client.clone())
}

/// Resolves handles through API discovery. Found kinds are memoized; unknown kinds are
/// looked up again on every call so registration polling observes new schemas.
pub struct KubeResolver {
    client: Client,
    found: Mutex<HashMap<(String, String), (ApiResource, bool)>>,
}

impl KubeResolver {
    pub fn new(client: Client) -> Self {
        Self { client, found: Mutex::new(HashMap::new()) }
    }

    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(get_kube_client().await?))
    }

    fn cached(&self, api_version: &str, kind: &str) -> Option<(ApiResource, bool)> {
        let found = self.found.lock().unwrap_or_else(|p| p.into_inner());
        found.get(&(api_version.to_string(), kind.to_string())).cloned()
    }
}

#[async_trait::async_trait]
impl SchemaResolver for KubeResolver {
    async fn resolve(&self, api_version: &str, kind: &str, intent: Intent) -> kapply_core::Result<Resolution> {
        if let Some((ar, namespaced)) = self.cached(api_version, kind) {
            return Ok(Resolution::Found(Arc::new(KubeHandle::new(self.client.clone(), ar, namespaced))));
        }
        let (group, version) = kapply_core::parse_api_version(api_version);
        let gvk = GroupVersionKind { group: group.to_string(), version: version.to_string(), kind: kind.to_string() };
        match kube::discovery::pinned_kind(&self.client, &gvk).await {
            Ok((ar, caps)) => {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                debug!(api_version, kind, ?intent, namespaced, "resolved resource kind");
                self.found
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .insert((api_version.to_string(), kind.to_string()), (ar.clone(), namespaced));
                Ok(Resolution::Found(Arc::new(KubeHandle::new(self.client.clone(), ar, namespaced))))
            }
            Err(kube::Error::Discovery(e)) => {
                debug!(api_version, kind, error = %e, "kind not served");
                Ok(Resolution::Unknown)
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(api_version, kind, "api group not served");
                Ok(Resolution::Unknown)
            }
            Err(e) => Err(Error::Client(format!("discovery for {api_version}/{kind}: {e}"))),
        }
    }
}

/// Dynamic-object accessor for one served kind.
pub struct KubeHandle {
    client: Client,
    ar: ApiResource,
    namespaced: bool,
}

impl KubeHandle {
    pub fn new(client: Client, ar: ApiResource, namespaced: bool) -> Self {
        Self { client, ar, namespaced }
    }

    fn api(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        if self.namespaced {
            match namespace {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, &self.ar),
                None => Api::default_namespaced_with(self.client.clone(), &self.ar),
            }
        } else {
            Api::all_with(self.client.clone(), &self.ar)
        }
    }

    fn list_api(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) if self.namespaced => Api::namespaced_with(self.client.clone(), ns, &self.ar),
            _ => Api::all_with(self.client.clone(), &self.ar),
        }
    }
}

fn to_object(manifest: &Json) -> kapply_core::Result<(DynamicObject, String)> {
    let obj: DynamicObject = serde_json::from_value(manifest.clone())
        .map_err(|e| Error::InvalidManifest(format!("not a kubernetes object: {e}")))?;
    let name = obj.metadata.name.clone().ok_or_else(|| Error::InvalidManifest("missing metadata.name".into()))?;
    Ok((obj, name))
}

/// Turns a kube result into a status/body pair. API errors keep their status code;
/// anything without a status becomes a client error.
fn into_response<T: Serialize>(verb: &'static str, res: Result<T, kube::Error>, ok_status: u16) -> kapply_core::Result<Response> {
    counter!("accessor_requests_total", 1, "verb" => verb);
    match res {
        Ok(v) => {
            let body = serde_json::to_value(v).map_err(|e| Error::Client(format!("encoding {verb} response: {e}")))?;
            Ok(Response::new(ok_status, body))
        }
        Err(kube::Error::Api(ae)) => {
            let status = ae.code;
            let body = serde_json::to_value(&ae).unwrap_or(Json::Null);
            Ok(Response::new(status, body))
        }
        Err(e) => {
            counter!("accessor_client_errors_total", 1, "verb" => verb);
            Err(Error::Client(format!("{verb}: {e}")))
        }
    }
}

#[async_trait::async_trait]
impl ResourceHandle for KubeHandle {
    fn api_version(&self) -> &str { &self.ar.api_version }
    fn kind(&self) -> &str { &self.ar.kind }
    fn namespaced(&self) -> bool { self.namespaced }

    fn uri(&self, name: &str, namespace: Option<&str>) -> String {
        resource_uri(&self.ar.group, &self.ar.version, &self.ar.plural, self.namespaced, namespace, name)
    }

    async fn get(&self, name: &str, namespace: Option<&str>) -> kapply_core::Result<Response> {
        into_response("get", self.api(namespace).get(name).await, 200)
    }

    async fn list(&self, namespace: Option<&str>) -> kapply_core::Result<Response> {
        let res = self.list_api(namespace).list(&ListParams::default()).await;
        into_response("list", res.map(|l| serde_json::json!({ "items": l.items })), 200)
    }

    async fn create(&self, manifest: &Json) -> kapply_core::Result<Response> {
        let (obj, _) = to_object(manifest)?;
        let api = self.api(obj.metadata.namespace.as_deref());
        into_response("create", api.create(&PostParams::default(), &obj).await, 201)
    }

    async fn put(&self, manifest: &Json) -> kapply_core::Result<Response> {
        let (obj, name) = to_object(manifest)?;
        let api = self.api(obj.metadata.namespace.as_deref());
        into_response("put", api.replace(&name, &PostParams::default(), &obj).await, 200)
    }

    async fn merge_patch(&self, name: &str, namespace: Option<&str>, patch: &Json) -> kapply_core::Result<Response> {
        let res = self.api(namespace).patch(name, &PatchParams::default(), &Patch::Merge(patch)).await;
        into_response("merge_patch", res, 200)
    }

    async fn strategic_merge_patch(&self, name: &str, namespace: Option<&str>, patch: &Json) -> kapply_core::Result<Response> {
        let res = self.api(namespace).patch(name, &PatchParams::default(), &Patch::Strategic(patch)).await;
        into_response("strategic_merge_patch", res, 200)
    }

    async fn delete(&self, name: &str, namespace: Option<&str>) -> kapply_core::Result<Response> {
        let res = self.api(namespace).delete(name, &DeleteParams::default()).await;
        let res = res.map(|either| {
            either.either(
                |obj| serde_json::to_value(obj).unwrap_or(Json::Null),
                |status| serde_json::to_value(status).unwrap_or(Json::Null),
            )
        });
        into_response("delete", res, 200)
    }
}

/// REST path of an object, e.g. `/apis/apps/v1/namespaces/ns/deployments/web`.
pub fn resource_uri(group: &str, version: &str, plural: &str, namespaced: bool, namespace: Option<&str>, name: &str) -> String {
    let prefix = if group.is_empty() { format!("/api/{version}") } else { format!("/apis/{group}/{version}") };
    match namespace {
        Some(ns) if namespaced => format!("{prefix}/namespaces/{ns}/{plural}/{name}"),
        _ => format!("{prefix}/{plural}/{name}"),
    }
}

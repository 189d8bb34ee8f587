//! kapply core types: manifests, identities, the resource accessor seam and errors.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Annotation holding the manifest as it was last applied.
pub const LAST_APPLIED_ANNOTATION: &str = "deploy.kapply.io/last-applied-configuration";
/// Older annotation key, read as a fallback and cleared on the next apply.
pub const LEGACY_LAST_APPLIED_ANNOTATION: &str = "kapply.io/last-applied-configuration";

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("schema not found: {{ kind: {kind}, apiVersion: {api_version}, name: {name}, namespace: {} }}", namespace.as_deref().unwrap_or("-"))]
    SchemaNotFound {
        api_version: String,
        kind: String,
        name: String,
        namespace: Option<String>,
    },
    #[error("{identity}: status {status}: {body}")]
    Transport { identity: String, status: u16, body: Json },
    #[error("{what}: gave up after {attempts} attempts")]
    ScheduleExhausted { what: String, attempts: u32 },
    #[error("{failed} of {total} manifest operations failed")]
    PartialFailure { failed: usize, total: usize },
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),
    #[error("client: {0}")]
    Client(String),
}

impl Error {
    pub fn transport(identity: impl fmt::Display, resp: Response) -> Self {
        Error::Transport { identity: identity.to_string(), status: resp.status, body: resp.body }
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Transport { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Status and body of one accessor round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    pub body: Json,
}

impl Response {
    pub fn new(status: u16, body: Json) -> Self { Self { status, body } }

    pub fn is_success(&self) -> bool { (200..300).contains(&self.status) }

    pub fn is_not_found(&self) -> bool { self.status == 404 }
}

/// What the caller intends to do with a resolved handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Intent {
    Get,
    Update,
    Delete,
}

/// Accessor bound to one (apiVersion, kind) pair.
#[async_trait::async_trait]
pub trait ResourceHandle: Send + Sync {
    fn api_version(&self) -> &str;
    fn kind(&self) -> &str;
    fn namespaced(&self) -> bool;

    /// Canonical address of an object, used for logging.
    fn uri(&self, name: &str, namespace: Option<&str>) -> String;

    async fn get(&self, name: &str, namespace: Option<&str>) -> Result<Response>;
    /// List objects; `None` lists across all namespaces. Body carries an `items` array.
    async fn list(&self, namespace: Option<&str>) -> Result<Response>;
    async fn create(&self, manifest: &Json) -> Result<Response>;
    async fn put(&self, manifest: &Json) -> Result<Response>;
    async fn merge_patch(&self, name: &str, namespace: Option<&str>, patch: &Json) -> Result<Response>;
    async fn strategic_merge_patch(&self, name: &str, namespace: Option<&str>, patch: &Json) -> Result<Response>;
    async fn delete(&self, name: &str, namespace: Option<&str>) -> Result<Response>;
}

/// Outcome of a schema lookup.
#[derive(Clone)]
pub enum Resolution {
    Found(Arc<dyn ResourceHandle>),
    Unknown,
}

impl fmt::Debug for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Found(h) => write!(f, "Found({}/{})", h.api_version(), h.kind()),
            Resolution::Unknown => f.write_str("Unknown"),
        }
    }
}

/// Looks up accessor handles for (apiVersion, kind) pairs.
#[async_trait::async_trait]
pub trait SchemaResolver: Send + Sync {
    async fn resolve(&self, api_version: &str, kind: &str, intent: Intent) -> Result<Resolution>;
}

/// (apiVersion, kind, namespace, name) address of a manifest's live counterpart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceIdentity {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceIdentity {
    pub fn of(manifest: &Json) -> Result<Self> {
        let api_version = manifest
            .get("apiVersion")
            .and_then(Json::as_str)
            .ok_or_else(|| Error::InvalidManifest("missing apiVersion".into()))?;
        let kind = manifest
            .get("kind")
            .and_then(Json::as_str)
            .ok_or_else(|| Error::InvalidManifest("missing kind".into()))?;
        let name = name_of(manifest).ok_or_else(|| Error::InvalidManifest(format!("{kind} missing metadata.name")))?;
        Ok(Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: namespace_of(manifest).map(str::to_string),
            name: name.to_string(),
        })
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{} {}/{}", self.api_version, self.kind, ns, self.name),
            None => write!(f, "{}/{} {}", self.api_version, self.kind, self.name),
        }
    }
}

pub fn kind_of(manifest: &Json) -> &str {
    manifest.get("kind").and_then(Json::as_str).unwrap_or("")
}

pub fn api_version_of(manifest: &Json) -> &str {
    manifest.get("apiVersion").and_then(Json::as_str).unwrap_or("")
}

pub fn name_of(manifest: &Json) -> Option<&str> {
    manifest.get("metadata").and_then(|m| m.get("name")).and_then(Json::as_str)
}

pub fn namespace_of(manifest: &Json) -> Option<&str> {
    manifest.get("metadata").and_then(|m| m.get("namespace")).and_then(Json::as_str)
}

/// Mutable access to `metadata`, creating it when missing. `None` if the manifest is not an object.
pub fn metadata_mut(manifest: &mut Json) -> Option<&mut serde_json::Map<String, Json>> {
    manifest
        .as_object_mut()?
        .entry("metadata")
        .or_insert_with(|| Json::Object(Default::default()))
        .as_object_mut()
}

/// Mutable access to `metadata.annotations`, creating the path when missing.
pub fn annotations_mut(manifest: &mut Json) -> Option<&mut serde_json::Map<String, Json>> {
    let meta = metadata_mut(manifest)?;
    let annos = meta.entry("annotations").or_insert_with(|| Json::Object(Default::default()));
    if !annos.is_object() {
        *annos = Json::Object(Default::default());
    }
    annos.as_object_mut()
}

/// Sets `metadata.namespace` when it is absent and the kind is namespaced.
/// Returns true when the namespace was filled in.
pub fn default_namespace(manifest: &mut Json, namespaced: bool, namespace: &str) -> bool {
    if !namespaced || namespace_of(manifest).is_some() {
        return false;
    }
    match metadata_mut(manifest) {
        Some(meta) => {
            meta.insert("namespace".into(), Json::String(namespace.to_string()));
            true
        }
        None => false,
    }
}

/// Splits `group/version` into its parts; core kinds have an empty group.
pub fn parse_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((g, v)) => (g, v),
        None => ("", api_version),
    }
}

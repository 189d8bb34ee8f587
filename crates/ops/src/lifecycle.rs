//! Idempotent create/replace/delete primitives.

use kapply_core::{Error, ResourceHandle, ResourceIdentity, Response, Result};
use metrics::counter;
use serde_json::{json, Value as Json};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum EnsureOutcome {
    /// Object was already there; nothing written.
    Existing(Response),
    Created(Response),
    /// Create raced with another writer (409).
    AlreadyExists(Response),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplaceOutcome {
    Replaced(Response),
    Created(Response),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeleteOutcome {
    Deleted(Response),
    AlreadyAbsent(Response),
}

/// Create/replace/delete against one handle, defaulting namespaces like the applier.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    namespace: String,
}

impl Lifecycle {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self { namespace: namespace.into() }
    }

    fn prepare(&self, handle: &dyn ResourceHandle, manifest: &mut Json) -> Result<(ResourceIdentity, String)> {
        if kapply_core::default_namespace(manifest, handle.namespaced(), &self.namespace) {
            info!(
                "No namespace found for {} {}.. setting namespace: {}",
                kapply_core::kind_of(manifest),
                kapply_core::name_of(manifest).unwrap_or("?"),
                self.namespace
            );
        }
        let id = ResourceIdentity::of(manifest)?;
        let uri = handle.uri(&id.name, id.namespace.as_deref());
        Ok((id, uri))
    }

    /// Creates the object only if it is absent. An existing object is never touched.
    pub async fn ensure_exists(&self, handle: &dyn ResourceHandle, mut manifest: Json) -> Result<EnsureOutcome> {
        counter!("lifecycle_ops_total", 1, "op" => "ensure_exists");
        let (id, uri) = self.prepare(handle, &mut manifest)?;
        info!(uri = %uri, "ensure exists");
        let get = handle.get(&id.name, id.namespace.as_deref()).await?;
        debug!(uri = %uri, status = get.status, "get");
        match get.status {
            200 => return Ok(EnsureOutcome::Existing(get)),
            404 => {}
            _ => return Err(Error::transport(&id, get)),
        }
        let post = handle.create(&manifest).await?;
        debug!(uri = %uri, status = post.status, "post");
        match post.status {
            200 | 201 | 202 => Ok(EnsureOutcome::Created(post)),
            409 => Ok(EnsureOutcome::AlreadyExists(post)),
            _ => Err(Error::transport(&id, post)),
        }
    }

    /// Overwrites the live object with `manifest`, carrying its resourceVersion, or creates it.
    /// Version conflicts are returned, not retried.
    pub async fn replace(&self, handle: &dyn ResourceHandle, mut manifest: Json) -> Result<ReplaceOutcome> {
        counter!("lifecycle_ops_total", 1, "op" => "replace");
        let (id, uri) = self.prepare(handle, &mut manifest)?;
        info!(uri = %uri, "replace");
        let get = handle.get(&id.name, id.namespace.as_deref()).await?;
        let live_rv = match get.status {
            200 => {
                let rv = get.body.get("metadata").and_then(|m| m.get("resourceVersion")).cloned();
                debug!(uri = %uri, status = get.status, resource_version = ?rv, "get");
                Some(rv.unwrap_or(Json::Null))
            }
            404 => {
                debug!(uri = %uri, status = get.status, "get");
                None
            }
            _ => {
                debug!(uri = %uri, status = get.status, "get");
                return Err(Error::transport(&id, get));
            }
        };

        match live_rv {
            Some(rv) => {
                if let Some(meta) = kapply_core::metadata_mut(&mut manifest) {
                    meta.insert("resourceVersion".into(), rv);
                }
                let put = handle.put(&manifest).await?;
                debug!(uri = %uri, status = put.status, "put");
                match put.status {
                    200 | 201 => Ok(ReplaceOutcome::Replaced(put)),
                    _ => Err(Error::transport(&id, put)),
                }
            }
            None => {
                let post = handle.create(&manifest).await?;
                debug!(uri = %uri, status = post.status, "post");
                match post.status {
                    200 | 201 | 202 => Ok(ReplaceOutcome::Created(post)),
                    _ => Err(Error::transport(&id, post)),
                }
            }
        }
    }

    /// Deletes the object; 404 counts as done. With `force`, finalizers are stripped first so
    /// the delete does not wait on the owning controller.
    pub async fn delete_resource(&self, handle: &dyn ResourceHandle, mut manifest: Json, force: bool) -> Result<DeleteOutcome> {
        counter!("lifecycle_ops_total", 1, "op" => "delete");
        let (id, uri) = self.prepare(handle, &mut manifest)?;
        let ns = id.namespace.as_deref();
        info!(uri = %uri, force, "delete");

        if force {
            let patch = handle.merge_patch(&id.name, ns, &json!({ "metadata": { "finalizers": null } })).await?;
            debug!(uri = %uri, status = patch.status, "merge patch finalizers");
            if patch.is_not_found() {
                return Ok(DeleteOutcome::AlreadyAbsent(patch));
            }
            if !patch.is_success() {
                warn!(uri = %uri, status = patch.status, "clearing finalizers failed");
                return Err(Error::transport(&id, patch));
            }
        }

        let dlt = handle.delete(&id.name, ns).await?;
        debug!(uri = %uri, status = dlt.status, "delete");
        if dlt.is_not_found() {
            Ok(DeleteOutcome::AlreadyAbsent(dlt))
        } else if dlt.is_success() {
            Ok(DeleteOutcome::Deleted(dlt))
        } else {
            Err(Error::transport(&id, dlt))
        }
    }
}

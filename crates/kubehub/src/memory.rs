//! In-memory cluster implementing the accessor traits.
//!
//! Mimics the API server closely enough to exercise reconciliation: merge patches drop
//! `null` fields, objects with finalizers linger after delete until the finalizers are
//! cleared, `put` enforces `resourceVersion`, and create on an existing object is a 409.
//! Every request is recorded so callers can assert on the exact wire payloads.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use kapply_core::{Intent, Resolution, ResourceHandle, Response, SchemaResolver};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as Json};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verb {
    Get,
    List,
    Create,
    Put,
    MergePatch,
    StrategicMergePatch,
    Delete,
}

/// One recorded request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    pub verb: Verb,
    pub uri: String,
    pub body: Option<Json>,
}

#[derive(Debug, Clone)]
struct KindEntry {
    namespaced: bool,
    /// Resolve calls that still report the kind as unknown.
    misses_left: usize,
    strategic_unsupported: bool,
}

type ObjKey = (String, String, Option<String>, String);

#[derive(Default)]
struct State {
    kinds: HashMap<(String, String), KindEntry>,
    objects: BTreeMap<ObjKey, Json>,
    calls: Vec<Call>,
    injected: HashMap<Verb, VecDeque<u16>>,
    resolves: usize,
    next_rv: u64,
}

impl State {
    fn bump_rv(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }
}

/// Shared in-memory cluster. Cloning yields another view of the same state.
#[derive(Clone, Default)]
pub struct MemoryCluster {
    state: Arc<Mutex<State>>,
}

impl MemoryCluster {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Serve a kind immediately.
    pub fn register(&self, api_version: &str, kind: &str, namespaced: bool) -> &Self {
        self.register_after(api_version, kind, namespaced, 0)
    }

    /// Serve a kind, but report it unknown for the first `misses` lookups.
    pub fn register_after(&self, api_version: &str, kind: &str, namespaced: bool, misses: usize) -> &Self {
        self.lock().kinds.insert(
            (api_version.to_string(), kind.to_string()),
            KindEntry { namespaced, misses_left: misses, strategic_unsupported: false },
        );
        self
    }

    /// Make strategic merge patches for a kind fail with 415, as for custom resources.
    pub fn reject_strategic_merge(&self, api_version: &str, kind: &str) -> &Self {
        if let Some(k) = self.lock().kinds.get_mut(&(api_version.to_string(), kind.to_string())) {
            k.strategic_unsupported = true;
        }
        self
    }

    /// Answer the next request of `verb` with `status` instead of serving it.
    pub fn inject_status(&self, verb: Verb, status: u16) -> &Self {
        self.lock().injected.entry(verb).or_default().push_back(status);
        self
    }

    /// Seed a live object without recording a call.
    pub fn insert(&self, mut obj: Json) {
        let mut st = self.lock();
        let rv = st.bump_rv();
        if let Some(meta) = kapply_core::metadata_mut(&mut obj) {
            meta.insert("resourceVersion".into(), Json::String(rv));
        }
        if let Some(key) = key_of(&obj) {
            st.objects.insert(key, obj);
        }
    }

    pub fn object(&self, api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> Option<Json> {
        let key = (api_version.to_string(), kind.to_string(), namespace.map(str::to_string), name.to_string());
        self.lock().objects.get(&key).cloned()
    }

    pub fn object_count(&self) -> usize { self.lock().objects.len() }

    pub fn calls(&self) -> Vec<Call> { self.lock().calls.clone() }

    pub fn calls_of(&self, verb: Verb) -> Vec<Call> {
        self.lock().calls.iter().filter(|c| c.verb == verb).cloned().collect()
    }

    pub fn clear_calls(&self) { self.lock().calls.clear(); }

    /// Number of `resolve` lookups served so far.
    pub fn resolve_count(&self) -> usize { self.lock().resolves }
}

fn key_of(obj: &Json) -> Option<ObjKey> {
    Some((
        kapply_core::api_version_of(obj).to_string(),
        kapply_core::kind_of(obj).to_string(),
        kapply_core::namespace_of(obj).map(str::to_string),
        kapply_core::name_of(obj)?.to_string(),
    ))
}

/// RFC 7386 merge: `null` removes, objects merge recursively, everything else replaces.
pub fn merge_json(target: &mut Json, patch: &Json) {
    match patch {
        Json::Object(p) => {
            if !target.is_object() {
                *target = Json::Object(Map::new());
            }
            if let Json::Object(t) = target {
                for (k, v) in p {
                    if v.is_null() {
                        t.remove(k);
                    } else {
                        merge_json(t.entry(k.clone()).or_insert(Json::Null), v);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

fn has_finalizers(obj: &Json) -> bool {
    obj.get("metadata")
        .and_then(|m| m.get("finalizers"))
        .and_then(Json::as_array)
        .map(|a| !a.is_empty())
        .unwrap_or(false)
}

fn is_terminating(obj: &Json) -> bool {
    obj.get("metadata").and_then(|m| m.get("deletionTimestamp")).is_some()
}

fn status(code: u16, reason: &str, message: String) -> Response {
    Response::new(code, json!({ "kind": "Status", "status": "Failure", "reason": reason, "message": message, "code": code }))
}

#[async_trait::async_trait]
impl SchemaResolver for MemoryCluster {
    async fn resolve(&self, api_version: &str, kind: &str, intent: Intent) -> kapply_core::Result<Resolution> {
        let mut st = self.lock();
        st.resolves += 1;
        let entry = match st.kinds.get_mut(&(api_version.to_string(), kind.to_string())) {
            Some(e) => e,
            None => return Ok(Resolution::Unknown),
        };
        if entry.misses_left > 0 {
            entry.misses_left -= 1;
            debug!(api_version, kind, ?intent, "memory cluster: kind not yet served");
            return Ok(Resolution::Unknown);
        }
        let handle = MemoryHandle {
            cluster: self.clone(),
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespaced: entry.namespaced,
        };
        Ok(Resolution::Found(Arc::new(handle)))
    }
}

/// Accessor for one kind of a [`MemoryCluster`].
pub struct MemoryHandle {
    cluster: MemoryCluster,
    api_version: String,
    kind: String,
    namespaced: bool,
}

impl MemoryHandle {
    fn key(&self, name: &str, namespace: Option<&str>) -> ObjKey {
        let ns = if self.namespaced { namespace.map(str::to_string) } else { None };
        (self.api_version.clone(), self.kind.clone(), ns, name.to_string())
    }

    /// Records the call and returns an injected status if one is queued.
    fn begin(&self, st: &mut State, verb: Verb, uri: String, body: Option<&Json>) -> Option<Response> {
        st.calls.push(Call { verb, uri, body: body.cloned() });
        let code = st.injected.get_mut(&verb).and_then(VecDeque::pop_front)?;
        Some(status(code, "Injected", format!("injected {code} for {verb:?}")))
    }

    fn strategic_unsupported(&self, st: &State) -> bool {
        st.kinds
            .get(&(self.api_version.clone(), self.kind.clone()))
            .map(|k| k.strategic_unsupported)
            .unwrap_or(false)
    }

    fn patch(&self, verb: Verb, name: &str, namespace: Option<&str>, patch: &Json) -> Response {
        let mut st = self.cluster.lock();
        if let Some(r) = self.begin(&mut st, verb, self.uri(name, namespace), Some(patch)) {
            return r;
        }
        if verb == Verb::StrategicMergePatch && self.strategic_unsupported(&st) {
            return status(415, "UnsupportedMediaType", format!("strategic merge patch is not supported for {}", self.kind));
        }
        let key = self.key(name, namespace);
        let rv = st.bump_rv();
        let Some(obj) = st.objects.get_mut(&key) else {
            return status(404, "NotFound", format!("{} {name} not found", self.kind));
        };
        merge_json(obj, patch);
        if let Some(meta) = kapply_core::metadata_mut(obj) {
            meta.insert("resourceVersion".into(), Json::String(rv));
        }
        let out = obj.clone();
        if is_terminating(&out) && !has_finalizers(&out) {
            st.objects.remove(&key);
        }
        Response::new(200, out)
    }
}

#[async_trait::async_trait]
impl ResourceHandle for MemoryHandle {
    fn api_version(&self) -> &str { &self.api_version }
    fn kind(&self) -> &str { &self.kind }
    fn namespaced(&self) -> bool { self.namespaced }

    fn uri(&self, name: &str, namespace: Option<&str>) -> String {
        let (group, version) = kapply_core::parse_api_version(&self.api_version);
        let plural = format!("{}s", self.kind.to_lowercase());
        crate::resource_uri(group, version, &plural, self.namespaced, namespace, name)
    }

    async fn get(&self, name: &str, namespace: Option<&str>) -> kapply_core::Result<Response> {
        let mut st = self.cluster.lock();
        if let Some(r) = self.begin(&mut st, Verb::Get, self.uri(name, namespace), None) {
            return Ok(r);
        }
        Ok(match st.objects.get(&self.key(name, namespace)) {
            Some(obj) => Response::new(200, obj.clone()),
            None => status(404, "NotFound", format!("{} {name} not found", self.kind)),
        })
    }

    async fn list(&self, namespace: Option<&str>) -> kapply_core::Result<Response> {
        let mut st = self.cluster.lock();
        let uri = self.uri("", namespace).trim_end_matches('/').to_string();
        if let Some(r) = self.begin(&mut st, Verb::List, uri, None) {
            return Ok(r);
        }
        let items: Vec<Json> = st
            .objects
            .iter()
            .filter(|((av, k, ns, _), _)| {
                av == &self.api_version && k == &self.kind && (namespace.is_none() || ns.as_deref() == namespace)
            })
            .map(|(_, v)| v.clone())
            .collect();
        Ok(Response::new(200, json!({ "items": items })))
    }

    async fn create(&self, manifest: &Json) -> kapply_core::Result<Response> {
        let name = kapply_core::name_of(manifest).unwrap_or_default().to_string();
        let namespace = kapply_core::namespace_of(manifest).map(str::to_string);
        let mut st = self.cluster.lock();
        if let Some(r) = self.begin(&mut st, Verb::Create, self.uri(&name, namespace.as_deref()), Some(manifest)) {
            return Ok(r);
        }
        if name.is_empty() {
            return Ok(status(422, "Invalid", "metadata.name: Required value".into()));
        }
        if self.namespaced && namespace.is_none() {
            return Ok(status(400, "BadRequest", "the namespace of the provided object is missing".into()));
        }
        let key = self.key(&name, namespace.as_deref());
        if st.objects.contains_key(&key) {
            return Ok(status(409, "AlreadyExists", format!("{} {name} already exists", self.kind)));
        }
        let mut obj = manifest.clone();
        let rv = st.bump_rv();
        if let Some(meta) = kapply_core::metadata_mut(&mut obj) {
            meta.insert("resourceVersion".into(), Json::String(rv));
        }
        st.objects.insert(key, obj.clone());
        Ok(Response::new(201, obj))
    }

    async fn put(&self, manifest: &Json) -> kapply_core::Result<Response> {
        let name = kapply_core::name_of(manifest).unwrap_or_default().to_string();
        let namespace = kapply_core::namespace_of(manifest).map(str::to_string);
        let mut st = self.cluster.lock();
        if let Some(r) = self.begin(&mut st, Verb::Put, self.uri(&name, namespace.as_deref()), Some(manifest)) {
            return Ok(r);
        }
        let key = self.key(&name, namespace.as_deref());
        let live_rv = match st.objects.get(&key) {
            Some(live) => live.get("metadata").and_then(|m| m.get("resourceVersion")).cloned(),
            None => return Ok(status(404, "NotFound", format!("{} {name} not found", self.kind))),
        };
        let sent_rv = manifest.get("metadata").and_then(|m| m.get("resourceVersion")).cloned();
        if sent_rv.is_some() && sent_rv != live_rv {
            return Ok(status(409, "Conflict", format!("the object {name} has been modified")));
        }
        let mut obj = manifest.clone();
        let rv = st.bump_rv();
        if let Some(meta) = kapply_core::metadata_mut(&mut obj) {
            meta.insert("resourceVersion".into(), Json::String(rv));
        }
        st.objects.insert(key, obj.clone());
        Ok(Response::new(200, obj))
    }

    async fn merge_patch(&self, name: &str, namespace: Option<&str>, patch: &Json) -> kapply_core::Result<Response> {
        Ok(self.patch(Verb::MergePatch, name, namespace, patch))
    }

    async fn strategic_merge_patch(&self, name: &str, namespace: Option<&str>, patch: &Json) -> kapply_core::Result<Response> {
        Ok(self.patch(Verb::StrategicMergePatch, name, namespace, patch))
    }

    async fn delete(&self, name: &str, namespace: Option<&str>) -> kapply_core::Result<Response> {
        let mut st = self.cluster.lock();
        if let Some(r) = self.begin(&mut st, Verb::Delete, self.uri(name, namespace), None) {
            return Ok(r);
        }
        let key = self.key(name, namespace);
        let Some(obj) = st.objects.get_mut(&key) else {
            return Ok(status(404, "NotFound", format!("{} {name} not found", self.kind)));
        };
        if has_finalizers(obj) {
            if let Some(meta) = kapply_core::metadata_mut(obj) {
                meta.insert("deletionTimestamp".into(), Json::String("1970-01-01T00:00:00Z".into()));
            }
            return Ok(Response::new(200, obj.clone()));
        }
        let removed = st.objects.remove(&key).unwrap_or(Json::Null);
        Ok(Response::new(200, removed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cm(name: &str, data: Json) -> Json {
        json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name, "namespace": "ns"}, "data": data})
    }

    async fn handle(c: &MemoryCluster, av: &str, kind: &str) -> Arc<dyn ResourceHandle> {
        match c.resolve(av, kind, Intent::Get).await.unwrap() {
            Resolution::Found(h) => h,
            Resolution::Unknown => panic!("{av}/{kind} not registered"),
        }
    }

    #[test]
    fn merge_json_removes_nulls_and_replaces_arrays() {
        let mut t = json!({"a": {"b": 1, "c": 2}, "l": [1, 2, 3]});
        merge_json(&mut t, &json!({"a": {"c": null, "d": 4}, "l": [9]}));
        assert_eq!(t, json!({"a": {"b": 1, "d": 4}, "l": [9]}));
    }

    #[tokio::test]
    async fn unknown_until_registered_misses_are_spent() {
        let c = MemoryCluster::new();
        c.register_after("example.io/v1", "Widget", true, 2);
        assert!(matches!(c.resolve("example.io/v1", "Widget", Intent::Get).await.unwrap(), Resolution::Unknown));
        assert!(matches!(c.resolve("example.io/v1", "Widget", Intent::Get).await.unwrap(), Resolution::Unknown));
        assert!(matches!(c.resolve("example.io/v1", "Widget", Intent::Get).await.unwrap(), Resolution::Found(_)));
        assert_eq!(c.resolve_count(), 3);
    }

    #[tokio::test]
    async fn create_conflicts_and_put_checks_resource_version() {
        let c = MemoryCluster::new();
        c.register("v1", "ConfigMap", true);
        let h = handle(&c, "v1", "ConfigMap").await;
        assert_eq!(h.create(&cm("a", json!({"k": "v"}))).await.unwrap().status, 201);
        assert_eq!(h.create(&cm("a", json!({"k": "v"}))).await.unwrap().status, 409);

        let mut stale = cm("a", json!({"k": "w"}));
        stale["metadata"]["resourceVersion"] = json!("0");
        assert_eq!(h.put(&stale).await.unwrap().status, 409);

        let live = h.get("a", Some("ns")).await.unwrap().body;
        let mut fresh = cm("a", json!({"k": "w"}));
        fresh["metadata"]["resourceVersion"] = live["metadata"]["resourceVersion"].clone();
        assert_eq!(h.put(&fresh).await.unwrap().status, 200);
        assert_eq!(c.object("v1", "ConfigMap", Some("ns"), "a").unwrap()["data"]["k"], "w");
    }

    #[tokio::test]
    async fn finalizers_block_delete_until_cleared() {
        let c = MemoryCluster::new();
        c.register("v1", "ConfigMap", true);
        let mut obj = cm("f", json!({}));
        obj["metadata"]["finalizers"] = json!(["example.io/guard"]);
        c.insert(obj);
        let h = handle(&c, "v1", "ConfigMap").await;
        assert_eq!(h.delete("f", Some("ns")).await.unwrap().status, 200);
        assert!(c.object("v1", "ConfigMap", Some("ns"), "f").is_some());
        h.merge_patch("f", Some("ns"), &json!({"metadata": {"finalizers": null}})).await.unwrap();
        assert!(c.object("v1", "ConfigMap", Some("ns"), "f").is_none());
    }

    #[tokio::test]
    async fn strategic_merge_can_be_rejected_and_statuses_injected() {
        let c = MemoryCluster::new();
        c.register("example.io/v1", "Widget", true).reject_strategic_merge("example.io/v1", "Widget");
        c.insert(json!({"apiVersion": "example.io/v1", "kind": "Widget", "metadata": {"name": "w", "namespace": "ns"}}));
        let h = handle(&c, "example.io/v1", "Widget").await;
        assert_eq!(h.strategic_merge_patch("w", Some("ns"), &json!({})).await.unwrap().status, 415);
        c.inject_status(Verb::Get, 500);
        assert_eq!(h.get("w", Some("ns")).await.unwrap().status, 500);
        assert_eq!(h.get("w", Some("ns")).await.unwrap().status, 200);
        assert_eq!(c.calls_of(Verb::Get).len(), 2);
        let verbs: Vec<Verb> = c.calls().iter().map(|call| call.verb).collect();
        assert_eq!(verbs, vec![Verb::StrategicMergePatch, Verb::Get, Verb::Get]);
    }
}

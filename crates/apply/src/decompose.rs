//! Flattening of nested manifest documents into atomic resources.

use serde_json::Value as Json;

/// Which collection kinds get unwrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListMatch {
    /// `kind` equals `List` (case-insensitive).
    Exact,
    /// `kind` ends with `List` (case-insensitive), e.g. `ConfigMapList`.
    Suffix,
}

impl ListMatch {
    fn matches(self, kind: &str) -> bool {
        let kind = kind.to_ascii_lowercase();
        match self {
            ListMatch::Exact => kind == "list",
            ListMatch::Suffix => kind.ends_with("list"),
        }
    }
}

/// Flattens arrays and List objects carrying an `items` array, preserving source order.
/// Anything else, `null` included, comes out as a single element.
pub fn decompose(document: Json, lists: ListMatch) -> Vec<Json> {
    let mut out = Vec::new();
    decompose_into(document, lists, &mut out);
    out
}

fn decompose_into(document: Json, lists: ListMatch, out: &mut Vec<Json>) {
    match document {
        Json::Array(docs) => {
            for d in docs {
                decompose_into(d, lists, out);
            }
        }
        Json::Object(mut map) => {
            let is_list = map.get("kind").and_then(Json::as_str).map(|k| lists.matches(k)).unwrap_or(false)
                && matches!(map.get("items"), Some(Json::Array(_)));
            if !is_list {
                out.push(Json::Object(map));
                return;
            }
            if let Some(Json::Array(items)) = map.remove("items") {
                for item in items {
                    decompose_into(item, lists, out);
                }
            }
        }
        other => out.push(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cm(name: &str) -> Json {
        json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name}})
    }

    fn names(v: &[Json]) -> Vec<&str> {
        v.iter().map(|m| m["metadata"]["name"].as_str().unwrap_or("?")).collect()
    }

    #[test]
    fn nested_lists_flatten_in_order() {
        let doc = json!([
            cm("a"),
            {"kind": "List", "items": [
                cm("b"),
                {"kind": "list", "items": [cm("c"), cm("d")]},
            ]},
            cm("e"),
        ]);
        let out = decompose(doc, ListMatch::Exact);
        assert_eq!(names(&out), vec!["a", "b", "c", "d", "e"]);
        assert!(out.iter().all(|m| m["kind"] == "ConfigMap"));
    }

    #[test]
    fn suffix_match_only_on_delete_path() {
        let doc = json!({"apiVersion": "v1", "kind": "ConfigMapList", "items": [cm("a"), cm("b")]});
        assert_eq!(decompose(doc.clone(), ListMatch::Exact).len(), 1);
        assert_eq!(names(&decompose(doc, ListMatch::Suffix)), vec!["a", "b"]);
    }

    #[test]
    fn list_without_items_array_is_atomic() {
        let doc = json!({"kind": "List", "items": "nope"});
        assert_eq!(decompose(doc.clone(), ListMatch::Exact), vec![doc]);
    }

    #[test]
    fn null_passes_through() {
        assert_eq!(decompose(Json::Null, ListMatch::Exact), vec![Json::Null]);
        assert_eq!(decompose(json!([null, cm("a")]), ListMatch::Suffix).len(), 2);
    }
}

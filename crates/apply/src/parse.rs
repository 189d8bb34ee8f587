//! Multi-document YAML/JSON parsing with size guards.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::Value as Json;

fn max_yaml_bytes() -> usize {
    std::env::var("KAPPLY_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(8 * 1024 * 1024)
}

fn max_yaml_nodes() -> usize {
    std::env::var("KAPPLY_MAX_YAML_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(500_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    // running counter, bail early once over budget
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Parses a YAML stream (JSON is a subset) into an array with one entry per document.
/// Empty documents come back as `null`.
pub fn parse_documents(text: &str) -> Result<Json> {
    parse_documents_with_limits(text, max_yaml_bytes(), max_yaml_nodes())
}

fn parse_documents_with_limits(text: &str, max_bytes: usize, max_nodes: usize) -> Result<Json> {
    if text.len() > max_bytes {
        return Err(anyhow!("YAML payload too large (>{} bytes)", max_bytes));
    }
    let mut docs = Vec::new();
    for (i, de) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let val = serde_yaml::Value::deserialize(de).with_context(|| format!("parsing YAML document {}", i))?;
        let json = serde_json::to_value(val).with_context(|| format!("converting YAML document {} to JSON", i))?;
        docs.push(json);
    }
    let all = Json::Array(docs);
    if json_node_budget_exceeded(&all, max_nodes) {
        return Err(anyhow!("YAML stream too complex (>{} nodes)", max_nodes));
    }
    Ok(all)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_document_in_order() {
        let y = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n---\napiVersion: v1\nkind: Secret\nmetadata:\n  name: b\n";
        let docs = parse_documents(y).unwrap();
        let docs = docs.as_array().unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["kind"], "ConfigMap");
        assert_eq!(docs[1]["metadata"]["name"], "b");
    }

    #[test]
    fn json_input_is_accepted() {
        let docs = parse_documents(r#"{"kind": "List", "items": []}"#).unwrap();
        assert_eq!(docs[0]["kind"], "List");
    }

    #[test]
    fn empty_documents_do_not_hide_others() {
        let docs = parse_documents("---\nkind: A\n---\n---\nkind: B\n").unwrap();
        let kinds: Vec<_> = docs.as_array().unwrap().iter().filter(|d| !d.is_null()).map(|d| d["kind"].clone()).collect();
        assert_eq!(kinds, vec!["A", "B"]);
    }

    #[test]
    fn budgets_are_enforced() {
        let e = parse_documents_with_limits("kind: A\n", 4, 100).unwrap_err().to_string();
        assert!(e.contains("too large"), "e={}", e);
        let e = parse_documents_with_limits("a: [1, 2, 3, 4, 5]\n", 1_000, 4).unwrap_err().to_string();
        assert!(e.contains("too complex"), "e={}", e);
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        let e = parse_documents("kind: A\n---\nkind: [unterminated\n").unwrap_err();
        assert!(format!("{:#}", e).contains("parsing YAML document"), "e={:#}", e);
    }
}

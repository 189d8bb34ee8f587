//! Field-removal diff against the last-applied record, plus a coarse change summary.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Nulls every key path present in `last_applied` but missing from `manifest`, so a merge
/// patch deletes it from the live object. Recurses only where both sides are objects;
/// arrays and scalars are replaced wholesale by whatever the manifest carries.
/// Returns the dotted paths that were nulled.
pub fn null_removed_fields(manifest: &mut Json, last_applied: &Json) -> Vec<String> {
    let mut removed = Vec::new();
    walk(manifest, last_applied, &mut String::new(), &mut removed);
    removed
}

fn walk(config: &mut Json, last: &Json, path: &mut String, removed: &mut Vec<String>) {
    let (Json::Object(cfg), Json::Object(prev)) = (config, last) else {
        return;
    };
    for (key, prev_val) in prev {
        let len = path.len();
        if !path.is_empty() {
            path.push('.');
        }
        path.push_str(key);
        match (cfg.get_mut(key), prev_val) {
            (None, _) => {
                cfg.insert(key.clone(), Json::Null);
                removed.push(path.clone());
            }
            (Some(cur @ Json::Object(_)), Json::Object(_)) => walk(cur, prev_val, path, removed),
            (Some(_), _) => {}
        }
        path.truncate(len);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

/// Counts keys added, changed and removed going from `base` to `target`.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao.iter() {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        // explicit null is a removal, counted below
                        Some(_) if av.is_null() => {}
                        Some(bv) => walk(av, bv, s),
                        None if av.is_null() => {}
                        None => s.adds += 1,
                    }
                }
                for (k, _) in bo.iter() {
                    match ao.get(k) {
                        None | Some(Json::Null) => s.removes += 1,
                        Some(_) => {}
                    }
                }
            }
            (Json::Array(aa), Json::Array(bb)) => {
                let min_len = aa.len().min(bb.len());
                s.updates += (0..min_len).filter(|&i| aa[i] != bb[i]).count();
                s.adds += aa.len().saturating_sub(bb.len());
                s.removes += bb.len().saturating_sub(aa.len());
            }
            (av, bv) => {
                if av != bv { s.updates += 1; }
            }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}

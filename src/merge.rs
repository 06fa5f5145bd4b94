//! Deep merge of property maps.
//!
//! Nested maps combine key-wise, every other value (scalars, lists, type
//! mismatches) is replaced by the incoming value. Keys are never removed by a
//! merge; removal goes through [`unset`].

use serde_json::Value;

use crate::models::{PropertyMap, PropertyPath};

/// Returns `existing` deep-merged with `incoming`.
pub fn merge(existing: &PropertyMap, incoming: &PropertyMap) -> PropertyMap {
    let mut merged = existing.clone();
    merge_into(&mut merged, incoming);
    merged
}

pub fn merge_into(target: &mut PropertyMap, incoming: &PropertyMap) {
    for (key, value) in incoming {
        if let Value::Object(incoming_map) = value {
            if let Some(Value::Object(existing_map)) = target.get_mut(key) {
                merge_into(existing_map, incoming_map);
                continue;
            }
        }
        target.insert(key.clone(), value.clone());
    }
}

/// Returns `existing` with every path in `paths` removed. Missing paths are ignored.
pub fn unset(existing: &PropertyMap, paths: &[PropertyPath]) -> PropertyMap {
    let mut result = existing.clone();
    for path in paths {
        remove_path(&mut result, path.segments());
    }
    result
}

fn remove_path(target: &mut PropertyMap, segments: &[String]) -> bool {
    match segments {
        [] => false,
        [key] => target.shift_remove(key).is_some(),
        [key, rest @ ..] => match target.get_mut(key) {
            Some(Value::Object(nested)) => remove_path(nested, rest),
            _ => false,
        },
    }
}

/// Top-level changes needed to turn one property map into another.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyDelta {
    pub set: PropertyMap,
    pub remove: Vec<String>,
}

impl PropertyDelta {
    pub fn between(existing: &PropertyMap, target: &PropertyMap) -> Self {
        let set = target
            .iter()
            .filter(|(key, value)| existing.get(*key) != Some(*value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let remove = existing
            .keys()
            .filter(|key| !target.contains_key(*key))
            .cloned()
            .collect();
        Self { set, remove }
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.remove.is_empty()
    }

    pub fn apply(&self, target: &mut PropertyMap) {
        for key in &self.remove {
            target.shift_remove(key);
        }
        for (key, value) in &self.set {
            target.insert(key.clone(), value.clone());
        }
    }
}

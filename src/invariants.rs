use std::collections::HashMap;

use anyhow::anyhow;
use serde::Serialize;
use serde_json::Value;

use crate::config::AgeSettings;
use crate::error::{LibError, Result};
use crate::models::{
    EdgeSpec, EntityKind, GraphFragment, PropertyMap, PropertyPath, VertexSpec, is_identifier,
};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SpecViolation {
    InvalidLabel {
        kind: EntityKind,
        ident: String,
        label: String,
    },
    ReservedProperty {
        kind: EntityKind,
        ident: String,
        key: String,
    },
    InvalidPropertyKey {
        kind: EntityKind,
        ident: String,
        key: String,
    },
    ConflictingVertexLabel {
        ident: String,
        first_label: String,
        label: String,
    },
    ConflictingEdgeIdent {
        edge: String,
        first_ident: String,
        ident: String,
    },
}

impl SpecViolation {
    pub const fn error_code(&self) -> &'static str {
        match self {
            SpecViolation::InvalidLabel { .. } => "invalid_label",
            SpecViolation::ReservedProperty { .. } => "reserved_property",
            SpecViolation::InvalidPropertyKey { .. } => "invalid_property_key",
            SpecViolation::ConflictingVertexLabel { .. } => "label_conflict",
            SpecViolation::ConflictingEdgeIdent { .. } => "edge_ident_conflict",
        }
    }

    pub const fn public_message(&self) -> &'static str {
        match self {
            SpecViolation::InvalidLabel { .. } => {
                "Labels must start with a letter or underscore and contain only letters, digits and underscores"
            }
            SpecViolation::ReservedProperty { .. } => {
                "Property key is reserved for identity bookkeeping"
            }
            SpecViolation::InvalidPropertyKey { .. } => {
                "Property keys must be non-empty and must not contain '`' or '$'"
            }
            SpecViolation::ConflictingVertexLabel { .. } => "Vertex label cannot be changed",
            SpecViolation::ConflictingEdgeIdent { .. } => "Edge is given two different idents",
        }
    }

    pub fn into_error(self) -> LibError {
        match &self {
            SpecViolation::ConflictingVertexLabel {
                ident,
                first_label,
                label,
            } => LibError::label_conflict(ident, first_label, label),
            _ => LibError::invalid_with_code(
                self.error_code(),
                self.public_message(),
                anyhow!("{:?}", self),
            ),
        }
    }
}

pub fn is_valid_label(label: &str) -> bool {
    is_identifier(label)
}

pub fn is_valid_property_key(key: &str) -> bool {
    !key.is_empty() && !key.contains('`') && !key.contains('$')
}

fn property_violations(
    kind: EntityKind,
    ident: &str,
    properties: &PropertyMap,
    names: &AgeSettings,
    violations: &mut Vec<SpecViolation>,
) {
    for key in properties.keys() {
        if names.is_reserved(key) {
            violations.push(SpecViolation::ReservedProperty {
                kind,
                ident: ident.to_string(),
                key: key.clone(),
            });
        }
    }
    nested_key_violations(kind, ident, properties, violations);
}

fn nested_key_violations(
    kind: EntityKind,
    ident: &str,
    properties: &PropertyMap,
    violations: &mut Vec<SpecViolation>,
) {
    for (key, value) in properties {
        if !is_valid_property_key(key) {
            violations.push(SpecViolation::InvalidPropertyKey {
                kind,
                ident: ident.to_string(),
                key: key.clone(),
            });
        }
        collect_value_key_violations(kind, ident, value, violations);
    }
}

fn collect_value_key_violations(
    kind: EntityKind,
    ident: &str,
    value: &Value,
    violations: &mut Vec<SpecViolation>,
) {
    match value {
        Value::Object(map) => nested_key_violations(kind, ident, map, violations),
        Value::Array(items) => {
            for item in items {
                collect_value_key_violations(kind, ident, item, violations);
            }
        }
        _ => {}
    }
}

pub fn vertex_spec_violations(spec: &VertexSpec, names: &AgeSettings) -> Vec<SpecViolation> {
    let mut violations = Vec::new();
    if !is_valid_label(&spec.label) {
        violations.push(SpecViolation::InvalidLabel {
            kind: EntityKind::Vertex,
            ident: spec.ident.to_string(),
            label: spec.label.clone(),
        });
    }
    property_violations(
        EntityKind::Vertex,
        spec.ident.as_str(),
        &spec.properties,
        names,
        &mut violations,
    );
    violations
}

pub fn edge_spec_violations(spec: &EdgeSpec, names: &AgeSettings) -> Vec<SpecViolation> {
    let ident = spec.effective_ident();
    let mut violations = Vec::new();
    if !is_valid_label(&spec.label) {
        violations.push(SpecViolation::InvalidLabel {
            kind: EntityKind::Edge,
            ident: ident.to_string(),
            label: spec.label.clone(),
        });
    }
    property_violations(
        EntityKind::Edge,
        ident.as_str(),
        &spec.properties,
        names,
        &mut violations,
    );
    violations
}

pub fn ensure_vertex_spec(spec: &VertexSpec, names: &AgeSettings) -> Result<()> {
    first_violation(vertex_spec_violations(spec, names))
}

pub fn ensure_edge_spec(spec: &EdgeSpec, names: &AgeSettings) -> Result<()> {
    first_violation(edge_spec_violations(spec, names))
}

pub fn ensure_property_paths(paths: &[PropertyPath], names: &AgeSettings) -> Result<()> {
    for path in paths {
        let reserved = path
            .segments()
            .first()
            .is_some_and(|key| names.is_reserved(key));
        if reserved {
            return Err(LibError::invalid_with_code(
                "reserved_property",
                "Property key is reserved for identity bookkeeping",
                anyhow!("cannot unset reserved property path {:?}", path.segments()),
            ));
        }
    }
    Ok(())
}

fn first_violation(violations: Vec<SpecViolation>) -> Result<()> {
    match violations.into_iter().next() {
        None => Ok(()),
        Some(violation) => Err(violation.into_error()),
    }
}

/// Static checks over a whole fragment. Does not consult the store, so edges
/// whose endpoints only exist in the store are not reported.
pub fn fragment_violations(fragment: &GraphFragment, names: &AgeSettings) -> Vec<SpecViolation> {
    let mut violations = Vec::new();

    let mut first_labels: HashMap<&str, &str> = HashMap::with_capacity(fragment.vertices.len());
    for spec in &fragment.vertices {
        violations.extend(vertex_spec_violations(spec, names));
        let first_label = *first_labels
            .entry(spec.ident.as_str())
            .or_insert(spec.label.as_str());
        if first_label != spec.label {
            violations.push(SpecViolation::ConflictingVertexLabel {
                ident: spec.ident.to_string(),
                first_label: first_label.to_string(),
                label: spec.label.clone(),
            });
        }
    }

    let mut first_idents = HashMap::with_capacity(fragment.edges.len());
    for spec in &fragment.edges {
        violations.extend(edge_spec_violations(spec, names));
        let Some(ident) = &spec.ident else {
            continue;
        };
        let key = spec.key();
        let first_ident = first_idents
            .entry(key.clone())
            .or_insert_with(|| ident.clone());
        if first_ident != ident {
            violations.push(SpecViolation::ConflictingEdgeIdent {
                edge: key.to_string(),
                first_ident: first_ident.to_string(),
                ident: ident.to_string(),
            });
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::ErrorKind;
    use crate::models::Ident;

    fn ident(value: &str) -> Ident {
        Ident::new(value).expect("valid ident")
    }

    fn props(value: serde_json::Value) -> PropertyMap {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn vertex_spec_rejects_invalid_label() {
        let spec = VertexSpec::new(ident("v1"), "Not A Label", PropertyMap::new());
        let err = ensure_vertex_spec(&spec, &AgeSettings::default()).expect_err("bad label");
        assert_eq!(err.code, "invalid_label");
        assert_eq!(err.kind, ErrorKind::InvalidInput);
    }

    #[test]
    fn vertex_spec_rejects_reserved_and_nested_invalid_keys() {
        let names = AgeSettings::default();
        let mut properties = PropertyMap::new();
        properties.insert(names.ident_property.clone(), json!("spoofed"));
        properties.insert("nested".to_string(), json!({"bad`key": 1}));
        properties.insert("list".to_string(), json!([{"$oops": true}]));
        let spec = VertexSpec::new(ident("v1"), "Person", properties);

        let violations = vertex_spec_violations(&spec, &names);
        assert_eq!(violations.len(), 3);
        assert!(matches!(&violations[0], SpecViolation::ReservedProperty { key, .. } if *key == names.ident_property));
        assert!(violations[1..]
            .iter()
            .all(|violation| violation.error_code() == "invalid_property_key"));
    }

    #[test]
    fn fragment_reports_conflicting_duplicate_labels() {
        let fragment = GraphFragment {
            vertices: vec![
                VertexSpec::new(ident("v1"), "Person", PropertyMap::new()),
                VertexSpec::new(ident("v1"), "Person", props(json!({"age": 3}))),
                VertexSpec::new(ident("v1"), "Robot", PropertyMap::new()),
            ],
            edges: vec![],
        };

        let violations = fragment_violations(&fragment, &AgeSettings::default());
        assert_eq!(
            violations,
            vec![SpecViolation::ConflictingVertexLabel {
                ident: "v1".to_string(),
                first_label: "Person".to_string(),
                label: "Robot".to_string(),
            }]
        );
        assert_eq!(
            violations[0].clone().into_error().kind,
            ErrorKind::LabelConflict
        );
    }

    #[test]
    fn fragment_reports_conflicting_edge_idents() {
        let edge = EdgeSpec::new("KNOWS", ident("a"), ident("b"), PropertyMap::new());
        let fragment = GraphFragment {
            vertices: vec![],
            edges: vec![
                edge.clone().with_ident(ident("e1")),
                edge.clone(),
                edge.with_ident(ident("e2")),
            ],
        };

        let violations = fragment_violations(&fragment, &AgeSettings::default());
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].error_code(), "edge_ident_conflict");
    }

    #[test]
    fn unset_paths_cannot_target_reserved_keys() {
        let names = AgeSettings::default();
        let paths = vec![PropertyPath::key(names.ident_property.clone())];
        let err = ensure_property_paths(&paths, &names).expect_err("reserved path");
        assert_eq!(err.code, "reserved_property");
    }
}

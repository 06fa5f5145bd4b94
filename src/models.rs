use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ErrorKind, LibError, Result};

/// Caller-supplied property map. Insertion order is preserved.
pub type PropertyMap = Map<String, Value>;

const MIN_GRAPH_NAME_LEN: usize = 3;
const MAX_GRAPH_NAME_LEN: usize = 63;

/// Name of a graph namespace in the store.
///
/// Graph names end up in `ag_catalog` as identifiers, so they are restricted to
/// `[A-Za-z_][A-Za-z0-9_]*` with a length between 3 and 63.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GraphName(String);

impl GraphName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into().trim().to_string();
        if name.len() < MIN_GRAPH_NAME_LEN || name.len() > MAX_GRAPH_NAME_LEN {
            return Err(LibError::invalid_with_code(
                "invalid_graph_name",
                "Graph name must be between 3 and 63 characters",
                anyhow!("graph name '{}' has length {}", name, name.len()),
            ));
        }
        if !is_identifier(&name) {
            return Err(LibError::invalid_with_code(
                "invalid_graph_name",
                "Graph name must start with a letter or underscore and contain only letters, digits and underscores",
                anyhow!("graph name '{}' is not an identifier", name),
            ));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GraphName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for GraphName {
    type Err = LibError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for GraphName {
    type Error = LibError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<GraphName> for String {
    fn from(value: GraphName) -> Self {
        value.0
    }
}

/// Logical identifier chosen by the caller, unique per graph and entity kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ident(String);

impl Ident {
    pub fn new(ident: impl Into<String>) -> Result<Self> {
        let ident = ident.into();
        if ident.trim().is_empty() {
            return Err(LibError::invalid_with_code(
                "invalid_ident",
                "Ident must not be empty",
                anyhow!("empty ident"),
            ));
        }
        Ok(Self(ident))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Ident {
    type Err = LibError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Ident {
    type Error = LibError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Ident> for String {
    fn from(value: Ident) -> Self {
        value.0
    }
}

/// Store-assigned identity. AGE graph ids are 64-bit integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InternalId(pub i64);

impl fmt::Display for InternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Vertex,
    Edge,
}

impl EntityKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            EntityKind::Vertex => "vertex",
            EntityKind::Edge => "edge",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Natural identity of an edge: one edge per label and ordered endpoint pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeKey {
    pub label: String,
    pub start_ident: Ident,
    pub end_ident: Ident,
}

impl EdgeKey {
    pub fn new(label: impl Into<String>, start_ident: Ident, end_ident: Ident) -> Self {
        Self {
            label: label.into(),
            start_ident,
            end_ident,
        }
    }

    /// Ident recorded for edges created without a caller-assigned ident.
    ///
    /// Backslashes and brackets inside the endpoint idents are escaped, so two
    /// different keys never derive the same ident. Labels are identifiers and
    /// need no escaping.
    pub fn derived_ident(&self) -> Ident {
        Ident(format!(
            "{}-[{}]->{}",
            escape_brackets(&self.start_ident),
            self.label,
            escape_brackets(&self.end_ident)
        ))
    }
}

fn escape_brackets(ident: &Ident) -> Cow<'_, str> {
    let raw = ident.as_str();
    if !raw.contains(['\\', '[', ']']) {
        return Cow::Borrowed(raw);
    }
    let mut escaped = String::with_capacity(raw.len() + 4);
    for c in raw.chars() {
        if matches!(c, '\\' | '[' | ']') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    Cow::Owned(escaped)
}

impl fmt::Display for EdgeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({})-[{}]->({})",
            self.start_ident, self.label, self.end_ident
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vertex {
    pub ident: Ident,
    pub label: String,
    pub internal_id: InternalId,
    pub properties: PropertyMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub ident: Ident,
    pub label: String,
    pub start_ident: Ident,
    pub end_ident: Ident,
    pub internal_id: InternalId,
    pub properties: PropertyMap,
}

impl Edge {
    pub fn key(&self) -> EdgeKey {
        EdgeKey::new(
            self.label.clone(),
            self.start_ident.clone(),
            self.end_ident.clone(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VertexSpec {
    pub ident: Ident,
    pub label: String,
    #[serde(default)]
    pub properties: PropertyMap,
}

impl VertexSpec {
    pub fn new(ident: Ident, label: impl Into<String>, properties: PropertyMap) -> Self {
        Self {
            ident,
            label: label.into(),
            properties,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ident: Option<Ident>,
    pub label: String,
    pub start_ident: Ident,
    pub end_ident: Ident,
    #[serde(default)]
    pub properties: PropertyMap,
}

impl EdgeSpec {
    pub fn new(
        label: impl Into<String>,
        start_ident: Ident,
        end_ident: Ident,
        properties: PropertyMap,
    ) -> Self {
        Self {
            ident: None,
            label: label.into(),
            start_ident,
            end_ident,
            properties,
        }
    }

    pub fn with_ident(mut self, ident: Ident) -> Self {
        self.ident = Some(ident);
        self
    }

    pub fn key(&self) -> EdgeKey {
        EdgeKey::new(
            self.label.clone(),
            self.start_ident.clone(),
            self.end_ident.clone(),
        )
    }

    /// The caller's ident when present, otherwise the one derived from the key.
    pub fn effective_ident(&self) -> Ident {
        self.ident
            .clone()
            .unwrap_or_else(|| self.key().derived_ident())
    }
}

/// Desired-state graph fragment applied by `upsert_graph`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphFragment {
    #[serde(default)]
    pub vertices: Vec<VertexSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
}

/// Path to a (possibly nested) property key, outermost key first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct PropertyPath(Vec<String>);

impl PropertyPath {
    pub fn new(segments: Vec<String>) -> Result<Self> {
        if segments.is_empty() {
            return Err(LibError::invalid_with_code(
                "invalid_property_path",
                "Property path must not be empty",
                anyhow!("empty property path"),
            ));
        }
        Ok(Self(segments))
    }

    pub fn key(key: impl Into<String>) -> Self {
        Self(vec![key.into()])
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl TryFrom<Vec<String>> for PropertyPath {
    type Error = LibError;

    fn try_from(value: Vec<String>) -> std::result::Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PropertyPath> for Vec<String> {
    fn from(value: PropertyPath) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphHandle {
    pub name: GraphName,
    pub created: bool,
}

/// Read-only view of a whole graph, sorted by ident.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphSnapshot {
    pub name: GraphName,
    pub vertices: Vec<Vertex>,
    pub edges: Vec<Edge>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityFailure {
    pub kind: ErrorKind,
    pub code: &'static str,
    pub message: &'static str,
    pub detail: String,
}

impl From<&LibError> for EntityFailure {
    fn from(value: &LibError) -> Self {
        Self {
            kind: value.kind,
            code: value.code,
            message: value.public,
            detail: format!("{:#}", value.source),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EntityOutcome {
    Applied {
        #[serde(rename = "internalId")]
        internal_id: InternalId,
        created: bool,
    },
    Failed {
        failure: EntityFailure,
    },
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityResult {
    pub kind: EntityKind,
    pub ident: String,
    pub outcome: EntityOutcome,
}

impl EntityResult {
    pub fn is_applied(&self) -> bool {
        matches!(self.outcome, EntityOutcome::Applied { .. })
    }

    pub fn failure(&self) -> Option<&EntityFailure> {
        match &self.outcome {
            EntityOutcome::Failed { failure } => Some(failure),
            _ => None,
        }
    }
}

/// Per-entity outcome of one `upsert_graph` call, in input order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub graph: GraphName,
    pub vertices: Vec<EntityResult>,
    pub edges: Vec<EntityResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<EntityFailure>,
}

impl ReconcileReport {
    pub fn results(&self) -> impl Iterator<Item = &EntityResult> {
        self.vertices.iter().chain(self.edges.iter())
    }

    pub fn failures(&self) -> impl Iterator<Item = &EntityResult> {
        self.results().filter(|result| result.failure().is_some())
    }

    pub fn applied_count(&self) -> usize {
        self.results().filter(|result| result.is_applied()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.aborted.is_none() && self.results().all(EntityResult::is_applied)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DropGraphOutcome {
    Dropped,
    Failed { failure: EntityFailure },
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DropGraphResult {
    pub name: String,
    pub outcome: DropGraphOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DropGraphsReport {
    pub results: Vec<DropGraphResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<EntityFailure>,
}

impl DropGraphsReport {
    pub fn dropped(&self) -> impl Iterator<Item = &str> {
        self.results
            .iter()
            .filter(|result| result.outcome == DropGraphOutcome::Dropped)
            .map(|result| result.name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VertexDropped {
    pub ident: Ident,
    pub internal_id: InternalId,
    pub edges_removed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeDropped {
    pub ident: Ident,
    pub internal_id: InternalId,
}

pub(crate) fn is_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{EdgeKey, EdgeSpec, GraphFragment, GraphName, Ident, PropertyPath};
    use crate::error::ErrorKind;

    fn ident(value: &str) -> Ident {
        Ident::new(value).expect("valid ident")
    }

    #[test]
    fn graph_name_rejects_short_and_non_identifier_names() {
        let err = GraphName::new("ab").expect_err("too short");
        assert_eq!(err.code, "invalid_graph_name");

        let err = GraphName::new("my-graph").expect_err("dash is not allowed");
        assert_eq!(err.kind, ErrorKind::InvalidInput);

        let name = GraphName::new("  social_graph ").expect("trimmed name is valid");
        assert_eq!(name.as_str(), "social_graph");
    }

    #[test]
    fn ident_rejects_blank_values() {
        assert!(Ident::new("   ").is_err());
        assert_eq!(ident(" keep spaces ").as_str(), " keep spaces ");
    }

    #[test]
    fn edge_without_ident_uses_derived_ident() {
        let spec = EdgeSpec::new("KNOWS", ident("alice"), ident("bob"), Default::default());
        assert_eq!(spec.effective_ident().as_str(), "alice-[KNOWS]->bob");

        let spec = spec.with_ident(ident("friendship-1"));
        assert_eq!(spec.effective_ident().as_str(), "friendship-1");
    }

    #[test]
    fn derived_idents_do_not_collide_on_bracketed_endpoints() {
        let first = EdgeKey::new("L", ident("a"), ident("b-[L]->c"));
        let second = EdgeKey::new("L", ident("a-[L]->b"), ident("c"));
        assert_ne!(first.derived_ident(), second.derived_ident());
        assert_eq!(first.derived_ident().as_str(), r"a-[L]->b-\[L\]->c");
        assert_eq!(second.derived_ident().as_str(), r"a-\[L\]->b-[L]->c");

        let slashed = EdgeKey::new("L", ident(r"x\"), ident("y"));
        let bracketed = EdgeKey::new("L", ident("x"), ident("]y"));
        assert_ne!(slashed.derived_ident(), bracketed.derived_ident());
    }

    #[test]
    fn fragment_deserializes_with_defaults() {
        let fragment: GraphFragment = serde_json::from_value(json!({
            "vertices": [{"ident": "v1", "label": "Person"}],
            "edges": [{"label": "KNOWS", "startIdent": "v1", "endIdent": "v1"}]
        }))
        .expect("fragment should deserialize");

        assert!(fragment.vertices[0].properties.is_empty());
        assert!(fragment.edges[0].ident.is_none());
    }

    #[test]
    fn fragment_rejects_empty_idents_on_deserialize() {
        let result: Result<GraphFragment, _> = serde_json::from_value(json!({
            "vertices": [{"ident": "", "label": "Person"}]
        }));
        assert!(result.is_err());
    }

    #[test]
    fn property_path_must_not_be_empty() {
        assert!(PropertyPath::new(vec![]).is_err());
        assert_eq!(PropertyPath::key("a").segments(), ["a".to_string()]);
    }
}

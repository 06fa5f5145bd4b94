use anyhow::anyhow;
use serde::Serialize;

use crate::models::{EntityKind, GraphName};

pub type Result<T> = std::result::Result<T, LibError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    DanglingReference,
    LabelConflict,
    StoreUnavailable,
    InvalidInput,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorDetails {
    Entity {
        graph: String,
        kind: EntityKind,
        ident: String,
    },
    LabelConflict {
        ident: String,
        existing: String,
        requested: String,
    },
    MissingEndpoint {
        graph: String,
        edge: String,
        missing_ident: String,
    },
}

#[derive(Debug)]
pub struct LibError {
    pub kind: ErrorKind,
    pub code: &'static str,
    pub public: &'static str,
    pub details: Option<ErrorDetails>,
    pub source: anyhow::Error,
}

impl LibError {
    pub fn store_unavailable(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::StoreUnavailable,
            code: "store_unavailable",
            public,
            details: None,
            source,
        }
    }

    pub fn invalid(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::InvalidInput,
            code: "invalid_input",
            public,
            details: None,
            source,
        }
    }

    pub fn invalid_with_code(
        code: &'static str,
        public: &'static str,
        source: anyhow::Error,
    ) -> Self {
        Self {
            kind: ErrorKind::InvalidInput,
            code,
            public,
            details: None,
            source,
        }
    }

    pub fn not_found(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::NotFound,
            code: "not_found",
            public,
            details: None,
            source,
        }
    }

    pub fn entity_not_found(graph: &GraphName, kind: EntityKind, ident: &str) -> Self {
        let public = match kind {
            EntityKind::Vertex => "Vertex not found",
            EntityKind::Edge => "Edge not found",
        };
        Self {
            kind: ErrorKind::NotFound,
            code: "not_found",
            public,
            details: Some(ErrorDetails::Entity {
                graph: graph.to_string(),
                kind,
                ident: ident.to_string(),
            }),
            source: anyhow!("{} '{}' not found in graph {}", kind, ident, graph),
        }
    }

    pub fn graph_not_found(graph: &GraphName) -> Self {
        Self::not_found("Graph not found", anyhow!("graph {} not found", graph))
    }

    pub fn dangling_reference(graph: &GraphName, edge: &str, missing_ident: &str) -> Self {
        Self {
            kind: ErrorKind::DanglingReference,
            code: "dangling_reference",
            public: "Edge references a vertex that does not exist",
            details: Some(ErrorDetails::MissingEndpoint {
                graph: graph.to_string(),
                edge: edge.to_string(),
                missing_ident: missing_ident.to_string(),
            }),
            source: anyhow!(
                "edge {} in graph {} references missing vertex '{}'",
                edge,
                graph,
                missing_ident
            ),
        }
    }

    pub fn label_conflict(ident: &str, existing: &str, requested: &str) -> Self {
        Self {
            kind: ErrorKind::LabelConflict,
            code: "label_conflict",
            public: "Vertex label cannot be changed",
            details: Some(ErrorDetails::LabelConflict {
                ident: ident.to_string(),
                existing: existing.to_string(),
                requested: requested.to_string(),
            }),
            source: anyhow!(
                "vertex '{}' has label {}, upsert requested {}",
                ident,
                existing,
                requested
            ),
        }
    }

    pub fn unknown(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Unknown,
            code: "unknown_error",
            public,
            details: None,
            source,
        }
    }

    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = Some(details);
        self
    }

    /// Infrastructure failures stop batch operations; everything else is per-entity.
    pub fn is_infrastructure(&self) -> bool {
        self.kind == ErrorKind::StoreUnavailable
    }
}

impl std::fmt::Display for LibError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.public, self.source)
    }
}

impl std::error::Error for LibError {}

#[cfg(feature = "sqlx")]
impl LibError {
    /// Connection-level failures become `StoreUnavailable`; statement errors
    /// reported by the server stay scoped to the entity being written.
    pub fn from_sqlx(public: &'static str, err: sqlx::Error) -> Self {
        let connection_lost = match &err {
            sqlx::Error::Database(db) => db
                .code()
                .is_some_and(|code| code.starts_with("08") || code.starts_with("57P")),
            sqlx::Error::RowNotFound
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::TypeNotFound { .. } => false,
            _ => true,
        };
        if connection_lost {
            Self::store_unavailable(public, anyhow!(err))
        } else {
            Self::unknown(public, anyhow!(err))
        }
    }
}

#[cfg(feature = "sqlx")]
impl From<sqlx::Error> for LibError {
    fn from(value: sqlx::Error) -> Self {
        Self::from_sqlx("Graph store request failed", value)
    }
}

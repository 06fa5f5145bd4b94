#[cfg(feature = "sqlx")]
pub mod agtype;
pub mod config;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod deletion;
pub mod error;
pub mod identity;
pub mod invariants;
pub mod lifecycle;
pub mod memory;
pub mod merge;
pub mod models;
pub mod operations;
pub mod reconcile;
pub mod store;
pub mod upsert;

pub mod prelude {
    pub use crate::config::{AgeSettings, DbSettings, ReconcileSettings, Settings};
    #[cfg(feature = "sqlx")]
    pub use crate::db::{AgeStore, AgeTransaction, connect, create_age_extension};
    pub use crate::error::{ErrorDetails, ErrorKind, LibError, Result};
    pub use crate::identity::IdentityResolver;
    pub use crate::invariants::{SpecViolation, fragment_violations};
    pub use crate::memory::MemoryStore;
    pub use crate::merge::{PropertyDelta, merge, unset};
    pub use crate::models::{
        DropGraphOutcome, DropGraphResult, DropGraphsReport, Edge, EdgeDropped, EdgeKey, EdgeSpec,
        EntityFailure, EntityKind, EntityOutcome, EntityResult, GraphFragment, GraphHandle,
        GraphName, GraphSnapshot, Ident, InternalId, PropertyMap, PropertyPath, ReconcileReport,
        Vertex, VertexDropped, VertexSpec,
    };
    pub use crate::operations::{GraphOperation, GraphOperationResult, GraphOperations};
    pub use crate::store::{GraphStore, StoreTransaction};
    pub use crate::upsert::UpsertOutcome;
}

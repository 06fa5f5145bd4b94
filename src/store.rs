//! The graph store the engine reconciles against.
//!
//! `GraphStore` covers graph namespaces; everything touching a single vertex
//! or edge happens inside a `StoreTransaction`, one transaction per entity.
//! Identity lookups on a transaction are meant for the identity resolver;
//! other components go through it.

use std::future::Future;

use crate::error::Result;
use crate::merge::PropertyDelta;
use crate::models::{
    Edge, EdgeKey, EntityKind, GraphName, GraphSnapshot, Ident, InternalId, PropertyMap, Vertex,
};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredVertex {
    pub id: InternalId,
    pub ident: Ident,
    pub label: String,
    pub properties: PropertyMap,
}

impl From<StoredVertex> for Vertex {
    fn from(value: StoredVertex) -> Self {
        Self {
            ident: value.ident,
            label: value.label,
            internal_id: value.id,
            properties: value.properties,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredEdge {
    pub id: InternalId,
    pub ident: Ident,
    pub label: String,
    pub start_ident: Ident,
    pub end_ident: Ident,
    pub properties: PropertyMap,
}

impl StoredEdge {
    pub fn key(&self) -> EdgeKey {
        EdgeKey::new(
            self.label.clone(),
            self.start_ident.clone(),
            self.end_ident.clone(),
        )
    }
}

impl From<StoredEdge> for Edge {
    fn from(value: StoredEdge) -> Self {
        Self {
            ident: value.ident,
            label: value.label,
            start_ident: value.start_ident,
            end_ident: value.end_ident,
            internal_id: value.id,
            properties: value.properties,
        }
    }
}

/// Edge to create between two already-resolved vertices.
#[derive(Debug, Clone, Copy)]
pub struct NewEdge<'a> {
    pub ident: &'a Ident,
    pub key: &'a EdgeKey,
    pub start: InternalId,
    pub end: InternalId,
}

pub trait GraphStore: Send + Sync + 'static {
    type Tx: StoreTransaction;

    fn begin(&self) -> impl Future<Output = Result<Self::Tx>> + Send;

    fn graph_exists(&self, graph: &GraphName) -> impl Future<Output = Result<bool>> + Send;

    /// Creates the graph if missing. Returns `true` when this call created it.
    fn create_graph(&self, graph: &GraphName) -> impl Future<Output = Result<bool>> + Send;

    fn list_graphs(&self) -> impl Future<Output = Result<Vec<GraphName>>> + Send;

    /// Drops the graph with all contents. Returns `false` when it did not exist.
    fn drop_graph(&self, graph: &GraphName) -> impl Future<Output = Result<bool>> + Send;

    fn snapshot(
        &self,
        graph: &GraphName,
    ) -> impl Future<Output = Result<Option<GraphSnapshot>>> + Send;
}

/// One entity's read-modify-write scope. Dropping without `commit` rolls back.
pub trait StoreTransaction: Send + Sized {
    /// Blocks other transactions locking the same `(graph, kind, key)` until
    /// this one ends.
    fn lock_entity(
        &mut self,
        graph: &GraphName,
        kind: EntityKind,
        key: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    fn find_vertex(
        &mut self,
        graph: &GraphName,
        ident: &Ident,
    ) -> impl Future<Output = Result<Option<StoredVertex>>> + Send;

    fn insert_vertex(
        &mut self,
        graph: &GraphName,
        ident: &Ident,
        label: &str,
    ) -> impl Future<Output = Result<StoredVertex>> + Send;

    fn update_vertex_properties(
        &mut self,
        graph: &GraphName,
        id: InternalId,
        delta: &PropertyDelta,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Deletes the vertex and every edge touching it. Returns the edge count.
    fn delete_vertex(
        &mut self,
        graph: &GraphName,
        id: InternalId,
    ) -> impl Future<Output = Result<usize>> + Send;

    fn find_edge(
        &mut self,
        graph: &GraphName,
        key: &EdgeKey,
    ) -> impl Future<Output = Result<Option<StoredEdge>>> + Send;

    fn find_edge_by_ident(
        &mut self,
        graph: &GraphName,
        ident: &Ident,
    ) -> impl Future<Output = Result<Option<StoredEdge>>> + Send;

    /// Returns `None` when either endpoint no longer exists.
    fn insert_edge(
        &mut self,
        graph: &GraphName,
        edge: NewEdge<'_>,
    ) -> impl Future<Output = Result<Option<StoredEdge>>> + Send;

    fn update_edge_properties(
        &mut self,
        graph: &GraphName,
        id: InternalId,
        delta: &PropertyDelta,
    ) -> impl Future<Output = Result<()>> + Send;

    fn delete_edge(
        &mut self,
        graph: &GraphName,
        id: InternalId,
    ) -> impl Future<Output = Result<()>> + Send;

    fn commit(self) -> impl Future<Output = Result<()>> + Send;
}

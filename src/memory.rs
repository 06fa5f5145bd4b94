//! In-process store for tests and local development.
//!
//! All state sits behind one async mutex. A transaction holds the mutex for
//! its whole lifetime and works on copies of the graphs it touches, which
//! replace the originals on commit, so transactions are fully serialized.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::anyhow;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{LibError, Result};
use crate::merge::PropertyDelta;
use crate::models::{
    Edge, EdgeKey, EntityKind, GraphName, GraphSnapshot, Ident, InternalId, PropertyMap, Vertex,
};
use crate::store::{GraphStore, NewEdge, StoreTransaction, StoredEdge, StoredVertex};

const UNLIMITED: usize = usize::MAX;

#[derive(Debug, Clone, Default)]
struct GraphState {
    vertices: BTreeMap<InternalId, StoredVertex>,
    edges: BTreeMap<InternalId, StoredEdge>,
    vertex_idents: HashMap<Ident, InternalId>,
    edge_idents: HashMap<Ident, InternalId>,
    edge_keys: HashMap<EdgeKey, InternalId>,
}

impl GraphState {
    fn remove_edge(&mut self, id: InternalId) -> Option<StoredEdge> {
        let edge = self.edges.remove(&id)?;
        self.edge_idents.remove(&edge.ident);
        self.edge_keys.remove(&edge.key());
        Some(edge)
    }

    fn snapshot(&self, name: &GraphName) -> GraphSnapshot {
        let mut vertices: Vec<Vertex> = self.vertices.values().cloned().map(Vertex::from).collect();
        vertices.sort_by(|a, b| a.ident.cmp(&b.ident));
        let mut edges: Vec<Edge> = self.edges.values().cloned().map(Edge::from).collect();
        edges.sort_by(|a, b| a.ident.cmp(&b.ident));
        GraphSnapshot {
            name: name.clone(),
            vertices,
            edges,
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    graphs: BTreeMap<GraphName, GraphState>,
    next_id: i64,
}

#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    commit_budget: Arc<AtomicUsize>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            commit_budget: Arc::new(AtomicUsize::new(UNLIMITED)),
        }
    }

    /// After `commits` more successful commits every call fails with
    /// `StoreUnavailable`, simulating a lost connection.
    pub fn fail_after_commits(&self, commits: usize) {
        self.commit_budget.store(commits, Ordering::SeqCst);
    }

    pub fn restore(&self) {
        self.commit_budget.store(UNLIMITED, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<()> {
        ensure_budget(&self.commit_budget)
    }
}

fn ensure_budget(budget: &AtomicUsize) -> Result<()> {
    if budget.load(Ordering::SeqCst) == 0 {
        return Err(LibError::store_unavailable(
            "Graph store request failed",
            anyhow!("memory store marked unavailable"),
        ));
    }
    Ok(())
}

pub struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    staged: HashMap<GraphName, GraphState>,
    next_id: i64,
    commit_budget: Arc<AtomicUsize>,
}

impl MemoryTransaction {
    fn graph(&mut self, graph: &GraphName) -> Result<&mut GraphState> {
        if !self.staged.contains_key(graph) {
            let current = self
                .guard
                .graphs
                .get(graph)
                .cloned()
                .ok_or_else(|| LibError::graph_not_found(graph))?;
            self.staged.insert(graph.clone(), current);
        }
        self.staged
            .get_mut(graph)
            .ok_or_else(|| LibError::graph_not_found(graph))
    }

    fn allocate_id(&mut self) -> InternalId {
        self.next_id += 1;
        InternalId(self.next_id)
    }
}

fn missing_entity(graph: &GraphName, kind: EntityKind, id: InternalId) -> LibError {
    LibError::not_found(
        match kind {
            EntityKind::Vertex => "Vertex not found",
            EntityKind::Edge => "Edge not found",
        },
        anyhow!("{} {} not found in graph {}", kind, id, graph),
    )
}

impl GraphStore for MemoryStore {
    type Tx = MemoryTransaction;

    async fn begin(&self) -> Result<MemoryTransaction> {
        self.ensure_available()?;
        let guard = Arc::clone(&self.state).lock_owned().await;
        let next_id = guard.next_id;
        Ok(MemoryTransaction {
            guard,
            staged: HashMap::new(),
            next_id,
            commit_budget: Arc::clone(&self.commit_budget),
        })
    }

    async fn graph_exists(&self, graph: &GraphName) -> Result<bool> {
        self.ensure_available()?;
        Ok(self.state.lock().await.graphs.contains_key(graph))
    }

    async fn create_graph(&self, graph: &GraphName) -> Result<bool> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        if state.graphs.contains_key(graph) {
            return Ok(false);
        }
        state.graphs.insert(graph.clone(), GraphState::default());
        Ok(true)
    }

    async fn list_graphs(&self) -> Result<Vec<GraphName>> {
        self.ensure_available()?;
        Ok(self.state.lock().await.graphs.keys().cloned().collect())
    }

    async fn drop_graph(&self, graph: &GraphName) -> Result<bool> {
        self.ensure_available()?;
        Ok(self.state.lock().await.graphs.remove(graph).is_some())
    }

    async fn snapshot(&self, graph: &GraphName) -> Result<Option<GraphSnapshot>> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(state.graphs.get(graph).map(|contents| contents.snapshot(graph)))
    }
}

impl StoreTransaction for MemoryTransaction {
    async fn lock_entity(&mut self, _graph: &GraphName, _kind: EntityKind, _key: &str) -> Result<()> {
        // The transaction already holds the store-wide lock.
        Ok(())
    }

    async fn find_vertex(&mut self, graph: &GraphName, ident: &Ident) -> Result<Option<StoredVertex>> {
        let state = self.graph(graph)?;
        Ok(state
            .vertex_idents
            .get(ident)
            .and_then(|id| state.vertices.get(id))
            .cloned())
    }

    async fn insert_vertex(
        &mut self,
        graph: &GraphName,
        ident: &Ident,
        label: &str,
    ) -> Result<StoredVertex> {
        let id = self.allocate_id();
        let state = self.graph(graph)?;
        if state.vertex_idents.contains_key(ident) {
            return Err(LibError::unknown(
                "Vertex ident is already mapped",
                anyhow!("vertex '{}' already exists in graph {}", ident, graph),
            ));
        }
        let vertex = StoredVertex {
            id,
            ident: ident.clone(),
            label: label.to_string(),
            properties: PropertyMap::new(),
        };
        state.vertex_idents.insert(ident.clone(), id);
        state.vertices.insert(id, vertex.clone());
        Ok(vertex)
    }

    async fn update_vertex_properties(
        &mut self,
        graph: &GraphName,
        id: InternalId,
        delta: &PropertyDelta,
    ) -> Result<()> {
        let state = self.graph(graph)?;
        let vertex = state
            .vertices
            .get_mut(&id)
            .ok_or_else(|| missing_entity(graph, EntityKind::Vertex, id))?;
        delta.apply(&mut vertex.properties);
        Ok(())
    }

    async fn delete_vertex(&mut self, graph: &GraphName, id: InternalId) -> Result<usize> {
        let state = self.graph(graph)?;
        let vertex = state
            .vertices
            .remove(&id)
            .ok_or_else(|| missing_entity(graph, EntityKind::Vertex, id))?;
        state.vertex_idents.remove(&vertex.ident);

        let incident: Vec<InternalId> = state
            .edges
            .values()
            .filter(|edge| edge.start_ident == vertex.ident || edge.end_ident == vertex.ident)
            .map(|edge| edge.id)
            .collect();
        for edge_id in &incident {
            state.remove_edge(*edge_id);
        }
        Ok(incident.len())
    }

    async fn find_edge(&mut self, graph: &GraphName, key: &EdgeKey) -> Result<Option<StoredEdge>> {
        let state = self.graph(graph)?;
        Ok(state
            .edge_keys
            .get(key)
            .and_then(|id| state.edges.get(id))
            .cloned())
    }

    async fn find_edge_by_ident(
        &mut self,
        graph: &GraphName,
        ident: &Ident,
    ) -> Result<Option<StoredEdge>> {
        let state = self.graph(graph)?;
        Ok(state
            .edge_idents
            .get(ident)
            .and_then(|id| state.edges.get(id))
            .cloned())
    }

    async fn insert_edge(&mut self, graph: &GraphName, edge: NewEdge<'_>) -> Result<Option<StoredEdge>> {
        let id = self.allocate_id();
        let state = self.graph(graph)?;
        let endpoint_matches = |vertex_id: InternalId, ident: &Ident| {
            state
                .vertices
                .get(&vertex_id)
                .is_some_and(|vertex| vertex.ident == *ident)
        };
        if !endpoint_matches(edge.start, &edge.key.start_ident)
            || !endpoint_matches(edge.end, &edge.key.end_ident)
        {
            return Ok(None);
        }
        if state.edge_idents.contains_key(edge.ident) || state.edge_keys.contains_key(edge.key) {
            return Err(LibError::unknown(
                "Edge identity is already mapped",
                anyhow!("edge {} already exists in graph {}", edge.key, graph),
            ));
        }

        let stored = StoredEdge {
            id,
            ident: edge.ident.clone(),
            label: edge.key.label.clone(),
            start_ident: edge.key.start_ident.clone(),
            end_ident: edge.key.end_ident.clone(),
            properties: PropertyMap::new(),
        };
        state.edge_idents.insert(stored.ident.clone(), id);
        state.edge_keys.insert(edge.key.clone(), id);
        state.edges.insert(id, stored.clone());
        Ok(Some(stored))
    }

    async fn update_edge_properties(
        &mut self,
        graph: &GraphName,
        id: InternalId,
        delta: &PropertyDelta,
    ) -> Result<()> {
        let state = self.graph(graph)?;
        let edge = state
            .edges
            .get_mut(&id)
            .ok_or_else(|| missing_entity(graph, EntityKind::Edge, id))?;
        delta.apply(&mut edge.properties);
        Ok(())
    }

    async fn delete_edge(&mut self, graph: &GraphName, id: InternalId) -> Result<()> {
        let state = self.graph(graph)?;
        state
            .remove_edge(id)
            .map(|_| ())
            .ok_or_else(|| missing_entity(graph, EntityKind::Edge, id))
    }

    async fn commit(mut self) -> Result<()> {
        ensure_budget(&self.commit_budget)?;
        for (name, contents) in self.staged.drain() {
            self.guard.graphs.insert(name, contents);
        }
        self.guard.next_id = self.next_id;
        let _ = self
            .commit_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                if remaining == UNLIMITED {
                    None
                } else {
                    remaining.checked_sub(1)
                }
            });
        Ok(())
    }
}

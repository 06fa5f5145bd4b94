use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{AgeSettings, ReconcileSettings, Settings};
use crate::deletion;
use crate::error::Result;
use crate::identity::IdentityResolver;
use crate::invariants::{SpecViolation, fragment_violations};
use crate::lifecycle;
use crate::models::{
    DropGraphsReport, Edge, EdgeDropped, EdgeSpec, GraphFragment, GraphHandle, GraphName,
    GraphSnapshot, Ident, PropertyMap, PropertyPath, ReconcileReport, Vertex, VertexDropped,
    VertexSpec,
};
use crate::reconcile;
use crate::store::GraphStore;
use crate::upsert::{self, UpsertOutcome};

/// Tool-friendly graph actions, one variant per engine operation.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum GraphOperation {
    GetOrCreateGraph {
        graph: GraphName,
    },
    ListGraphs,
    GetGraph {
        graph: GraphName,
    },
    UpsertGraph {
        graph: GraphName,
        #[serde(flatten)]
        fragment: GraphFragment,
    },
    UpsertVertex {
        graph: GraphName,
        ident: Ident,
        label: String,
        #[serde(default)]
        properties: PropertyMap,
    },
    UpsertEdge {
        graph: GraphName,
        #[serde(flatten)]
        spec: EdgeSpec,
    },
    UnsetVertexProperties {
        graph: GraphName,
        ident: Ident,
        paths: Vec<PropertyPath>,
    },
    UnsetEdgeProperties {
        graph: GraphName,
        ident: Ident,
        paths: Vec<PropertyPath>,
    },
    DropGraphs {
        graphs: Vec<String>,
    },
    DropVertex {
        graph: GraphName,
        ident: Ident,
    },
    DropEdge {
        graph: GraphName,
        ident: Ident,
    },
    ValidateFragment {
        #[serde(flatten)]
        fragment: GraphFragment,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum GraphOperationResult {
    Graph { graph: GraphHandle },
    Graphs { graphs: Vec<GraphName> },
    Snapshot { snapshot: GraphSnapshot },
    Reconciled { report: ReconcileReport },
    Vertex { vertex: Vertex, created: bool },
    Edge { edge: Edge, created: bool },
    DroppedGraphs { report: DropGraphsReport },
    DroppedVertex { dropped: VertexDropped },
    DroppedEdge { dropped: EdgeDropped },
    Validated { violations: Vec<SpecViolation> },
}

/// Entry point for the reconciliation engine over one store.
pub struct GraphOperations<S: GraphStore> {
    store: Arc<S>,
    identity: Arc<IdentityResolver>,
    age: AgeSettings,
    reconcile: ReconcileSettings,
}

impl<S: GraphStore> Clone for GraphOperations<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            identity: Arc::clone(&self.identity),
            age: self.age.clone(),
            reconcile: self.reconcile.clone(),
        }
    }
}

impl<S: GraphStore> GraphOperations<S> {
    pub fn new(store: Arc<S>, age: AgeSettings, reconcile: ReconcileSettings) -> Result<Self> {
        age.validate()?;
        reconcile.validate()?;
        Ok(Self {
            store,
            identity: Arc::new(IdentityResolver::new(reconcile.identity_cache_capacity)),
            age,
            reconcile,
        })
    }

    pub fn from_settings(store: S, settings: &Settings) -> Result<Self> {
        Self::new(
            Arc::new(store),
            settings.age.clone(),
            settings.reconcile.clone(),
        )
    }

    pub fn store(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }

    pub async fn execute(&self, operation: GraphOperation) -> Result<GraphOperationResult> {
        match operation {
            GraphOperation::GetOrCreateGraph { graph } => {
                let graph = self.get_or_create_graph(&graph).await?;
                Ok(GraphOperationResult::Graph { graph })
            }
            GraphOperation::ListGraphs => {
                let graphs = self.list_graphs().await?;
                Ok(GraphOperationResult::Graphs { graphs })
            }
            GraphOperation::GetGraph { graph } => {
                let snapshot = self.get_graph(&graph).await?;
                Ok(GraphOperationResult::Snapshot { snapshot })
            }
            GraphOperation::UpsertGraph { graph, fragment } => {
                let report = self.upsert_graph(&graph, &fragment).await?;
                Ok(GraphOperationResult::Reconciled { report })
            }
            GraphOperation::UpsertVertex {
                graph,
                ident,
                label,
                properties,
            } => {
                let outcome = self
                    .upsert_vertex(&graph, &VertexSpec::new(ident, label, properties))
                    .await?;
                Ok(GraphOperationResult::Vertex {
                    vertex: outcome.entity,
                    created: outcome.created,
                })
            }
            GraphOperation::UpsertEdge { graph, spec } => {
                let outcome = self.upsert_edge(&graph, &spec).await?;
                Ok(GraphOperationResult::Edge {
                    edge: outcome.entity,
                    created: outcome.created,
                })
            }
            GraphOperation::UnsetVertexProperties {
                graph,
                ident,
                paths,
            } => {
                let vertex = self
                    .unset_vertex_properties(&graph, &ident, &paths)
                    .await?;
                Ok(GraphOperationResult::Vertex {
                    vertex,
                    created: false,
                })
            }
            GraphOperation::UnsetEdgeProperties {
                graph,
                ident,
                paths,
            } => {
                let edge = self.unset_edge_properties(&graph, &ident, &paths).await?;
                Ok(GraphOperationResult::Edge {
                    edge,
                    created: false,
                })
            }
            GraphOperation::DropGraphs { graphs } => {
                let report = self.drop_graphs(&graphs).await?;
                Ok(GraphOperationResult::DroppedGraphs { report })
            }
            GraphOperation::DropVertex { graph, ident } => {
                let dropped = self.drop_vertex(&graph, &ident).await?;
                Ok(GraphOperationResult::DroppedVertex { dropped })
            }
            GraphOperation::DropEdge { graph, ident } => {
                let dropped = self.drop_edge(&graph, &ident).await?;
                Ok(GraphOperationResult::DroppedEdge { dropped })
            }
            GraphOperation::ValidateFragment { fragment } => Ok(GraphOperationResult::Validated {
                violations: self.validate_fragment(&fragment),
            }),
        }
    }

    pub async fn get_or_create_graph(&self, graph: &GraphName) -> Result<GraphHandle> {
        lifecycle::get_or_create_graph(self.store.as_ref(), graph).await
    }

    pub async fn list_graphs(&self) -> Result<Vec<GraphName>> {
        lifecycle::list_graphs(self.store.as_ref()).await
    }

    pub async fn get_graph(&self, graph: &GraphName) -> Result<GraphSnapshot> {
        lifecycle::get_graph(self.store.as_ref(), graph).await
    }

    pub async fn drop_graphs(&self, graphs: &[String]) -> Result<DropGraphsReport> {
        lifecycle::drop_graphs(self.store.as_ref(), &self.identity, graphs).await
    }

    pub async fn upsert_graph(
        &self,
        graph: &GraphName,
        fragment: &GraphFragment,
    ) -> Result<ReconcileReport> {
        reconcile::upsert_graph(
            self.store.as_ref(),
            &self.identity,
            &self.age,
            &self.reconcile,
            graph,
            fragment,
        )
        .await
    }

    pub async fn upsert_vertex(
        &self,
        graph: &GraphName,
        spec: &VertexSpec,
    ) -> Result<UpsertOutcome<Vertex>> {
        upsert::upsert_vertex(self.store.as_ref(), &self.identity, &self.age, graph, spec).await
    }

    pub async fn upsert_edge(
        &self,
        graph: &GraphName,
        spec: &EdgeSpec,
    ) -> Result<UpsertOutcome<Edge>> {
        upsert::upsert_edge(self.store.as_ref(), &self.identity, &self.age, graph, spec).await
    }

    pub async fn unset_vertex_properties(
        &self,
        graph: &GraphName,
        ident: &Ident,
        paths: &[PropertyPath],
    ) -> Result<Vertex> {
        upsert::unset_vertex_properties(
            self.store.as_ref(),
            &self.identity,
            &self.age,
            graph,
            ident,
            paths,
        )
        .await
    }

    pub async fn unset_edge_properties(
        &self,
        graph: &GraphName,
        ident: &Ident,
        paths: &[PropertyPath],
    ) -> Result<Edge> {
        upsert::unset_edge_properties(
            self.store.as_ref(),
            &self.identity,
            &self.age,
            graph,
            ident,
            paths,
        )
        .await
    }

    pub async fn drop_vertex(&self, graph: &GraphName, ident: &Ident) -> Result<VertexDropped> {
        deletion::drop_vertex(self.store.as_ref(), &self.identity, graph, ident).await
    }

    pub async fn drop_edge(&self, graph: &GraphName, ident: &Ident) -> Result<EdgeDropped> {
        deletion::drop_edge(self.store.as_ref(), &self.identity, graph, ident).await
    }

    /// Static checks only; endpoints that exist solely in the store are not verified.
    pub fn validate_fragment(&self, fragment: &GraphFragment) -> Vec<SpecViolation> {
        fragment_violations(fragment, &self.age)
    }
}

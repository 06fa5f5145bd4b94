use crate::error::Result;
use crate::identity::{IdentityResolver, ResolveMode};
use crate::models::{EdgeDropped, EntityKind, GraphName, Ident, VertexDropped};
use crate::store::{GraphStore, StoreTransaction};
use crate::upsert::{ensure_graph_exists, lock_edge};

/// Deletes a vertex together with every edge touching it.
pub async fn drop_vertex<S: GraphStore>(
    store: &S,
    identity: &IdentityResolver,
    graph: &GraphName,
    ident: &Ident,
) -> Result<VertexDropped> {
    ensure_graph_exists(store, graph).await?;

    let mut tx = store.begin().await?;
    tx.lock_entity(graph, EntityKind::Vertex, ident.as_str())
        .await?;
    let record = identity
        .resolve_vertex(&mut tx, graph, ident, ResolveMode::LookupOnly)
        .await?
        .record;
    let edges_removed = identity.release_vertex(&mut tx, graph, &record).await?;
    tx.commit().await?;

    tracing::info!(graph = %graph, ident = %ident, edges_removed, "dropped vertex");
    Ok(VertexDropped {
        ident: record.ident,
        internal_id: record.id,
        edges_removed,
    })
}

pub async fn drop_edge<S: GraphStore>(
    store: &S,
    identity: &IdentityResolver,
    graph: &GraphName,
    ident: &Ident,
) -> Result<EdgeDropped> {
    ensure_graph_exists(store, graph).await?;

    let mut tx = store.begin().await?;
    let key = identity.lookup_edge(&mut tx, graph, ident).await?.key();
    lock_edge(&mut tx, graph, &key).await?;
    let record = identity.lookup_edge(&mut tx, graph, ident).await?;
    identity.release_edge(&mut tx, graph, &record).await?;
    tx.commit().await?;

    tracing::info!(graph = %graph, ident = %ident, "dropped edge");
    Ok(EdgeDropped {
        ident: record.ident,
        internal_id: record.id,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::AgeSettings;
    use crate::error::ErrorKind;
    use crate::memory::MemoryStore;
    use crate::models::{EdgeSpec, PropertyMap, VertexSpec};
    use crate::upsert::{upsert_edge, upsert_vertex};

    fn name(value: &str) -> GraphName {
        GraphName::new(value).expect("valid graph name")
    }

    fn ident(value: &str) -> Ident {
        Ident::new(value).expect("valid ident")
    }

    async fn triangle(store: &MemoryStore, identity: &IdentityResolver, graph: &GraphName) {
        let names = AgeSettings::default();
        for id in ["a", "b", "c"] {
            let spec = VertexSpec::new(ident(id), "N", PropertyMap::new());
            upsert_vertex(store, identity, &names, graph, &spec)
                .await
                .expect("vertex");
        }
        for (start, end) in [("a", "b"), ("b", "c"), ("c", "a"), ("a", "a")] {
            let mut properties = PropertyMap::new();
            properties.insert("pair".to_string(), json!(format!("{start}{end}")));
            let spec = EdgeSpec::new("L", ident(start), ident(end), properties);
            upsert_edge(store, identity, &names, graph, &spec)
                .await
                .expect("edge");
        }
    }

    #[tokio::test]
    async fn dropping_a_vertex_cascades_to_incident_edges() {
        let store = MemoryStore::new();
        let identity = IdentityResolver::new(16);
        let graph = name("cascade");
        triangle(&store, &identity, &graph).await;

        let dropped = drop_vertex(&store, &identity, &graph, &ident("a"))
            .await
            .expect("drop a");
        assert_eq!(dropped.edges_removed, 3);

        let snapshot = store
            .snapshot(&graph)
            .await
            .expect("snapshot")
            .expect("graph exists");
        assert_eq!(snapshot.vertices.len(), 2);
        assert_eq!(snapshot.edges.len(), 1);
        assert_eq!(snapshot.edges[0].ident.as_str(), "b-[L]->c");

        let err = drop_vertex(&store, &identity, &graph, &ident("a"))
            .await
            .expect_err("already gone");
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn dropped_vertex_can_not_be_an_endpoint_again() {
        let store = MemoryStore::new();
        let identity = IdentityResolver::new(16);
        let graph = name("cascade");
        triangle(&store, &identity, &graph).await;
        drop_vertex(&store, &identity, &graph, &ident("c"))
            .await
            .expect("drop c");

        let spec = EdgeSpec::new("L", ident("a"), ident("c"), PropertyMap::new());
        let err = upsert_edge(&store, &identity, &AgeSettings::default(), &graph, &spec)
            .await
            .expect_err("c was dropped");
        assert_eq!(err.kind, ErrorKind::DanglingReference);
    }

    #[tokio::test]
    async fn drop_edge_by_ident() {
        let store = MemoryStore::new();
        let identity = IdentityResolver::new(16);
        let graph = name("cascade");
        triangle(&store, &identity, &graph).await;

        let dropped = drop_edge(&store, &identity, &graph, &ident("a-[L]->b"))
            .await
            .expect("drop edge");
        assert_eq!(dropped.ident.as_str(), "a-[L]->b");

        let err = drop_edge(&store, &identity, &graph, &ident("a-[L]->b"))
            .await
            .expect_err("gone");
        assert_eq!(err.kind, ErrorKind::NotFound);

        let err = drop_edge(&store, &identity, &name("elsewhere"), &ident("x"))
            .await
            .expect_err("no graph");
        assert_eq!(err.public, "Graph not found");
    }
}

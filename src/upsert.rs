//! Single-entity upserts and property removal.
//!
//! Every function here runs one store transaction: lock the entity, resolve
//! it, merge, write the delta, commit. Errors roll the transaction back by
//! dropping it.

use crate::config::AgeSettings;
use crate::error::{ErrorKind, LibError, Result};
use crate::identity::{IdentityResolver, ResolveMode};
use crate::invariants::{ensure_edge_spec, ensure_property_paths, ensure_vertex_spec};
use crate::merge::{PropertyDelta, merge, unset};
use crate::models::{
    Edge, EdgeKey, EdgeSpec, EntityKind, GraphName, Ident, InternalId, PropertyPath, Vertex,
    VertexSpec,
};
use crate::store::{GraphStore, StoreTransaction, StoredEdge, StoredVertex};

#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOutcome<T> {
    pub entity: T,
    pub created: bool,
}

pub async fn upsert_vertex<S: GraphStore>(
    store: &S,
    identity: &IdentityResolver,
    names: &AgeSettings,
    graph: &GraphName,
    spec: &VertexSpec,
) -> Result<UpsertOutcome<Vertex>> {
    ensure_vertex_spec(spec, names)?;
    if store.create_graph(graph).await? {
        tracing::info!(graph = %graph, "created graph");
    }
    let outcome = apply_vertex(store, identity, graph, spec).await?;
    Ok(UpsertOutcome {
        entity: Vertex::from(outcome.entity),
        created: outcome.created,
    })
}

pub async fn upsert_edge<S: GraphStore>(
    store: &S,
    identity: &IdentityResolver,
    names: &AgeSettings,
    graph: &GraphName,
    spec: &EdgeSpec,
) -> Result<UpsertOutcome<Edge>> {
    ensure_edge_spec(spec, names)?;
    ensure_graph_exists(store, graph).await?;
    let outcome = apply_edge(store, identity, graph, spec).await?;
    Ok(UpsertOutcome {
        entity: Edge::from(outcome.entity),
        created: outcome.created,
    })
}

pub(crate) async fn ensure_graph_exists<S: GraphStore>(store: &S, graph: &GraphName) -> Result<()> {
    if store.graph_exists(graph).await? {
        Ok(())
    } else {
        Err(LibError::graph_not_found(graph))
    }
}

/// Upserts a validated vertex into an existing graph.
pub(crate) async fn apply_vertex<S: GraphStore>(
    store: &S,
    identity: &IdentityResolver,
    graph: &GraphName,
    spec: &VertexSpec,
) -> Result<UpsertOutcome<StoredVertex>> {
    let mut tx = store.begin().await?;
    tx.lock_entity(graph, EntityKind::Vertex, spec.ident.as_str())
        .await?;

    let resolved = identity
        .resolve_vertex(
            &mut tx,
            graph,
            &spec.ident,
            ResolveMode::Create { label: &spec.label },
        )
        .await?;
    let mut record = resolved.record;
    if record.label != spec.label {
        return Err(LibError::label_conflict(
            spec.ident.as_str(),
            &record.label,
            &spec.label,
        ));
    }

    let target = merge(&record.properties, &spec.properties);
    let delta = PropertyDelta::between(&record.properties, &target);
    if !delta.is_empty() {
        tx.update_vertex_properties(graph, record.id, &delta).await?;
    }
    tx.commit().await?;

    identity.confirm_vertex(graph, &record.ident, record.id);
    tracing::debug!(
        graph = %graph,
        ident = %record.ident,
        id = %record.id,
        created = resolved.created,
        changed = delta.set.len(),
        "upserted vertex"
    );
    record.properties = target;
    Ok(UpsertOutcome {
        entity: record,
        created: resolved.created,
    })
}

/// Upserts a validated edge into an existing graph. Both endpoints must exist.
pub(crate) async fn apply_edge<S: GraphStore>(
    store: &S,
    identity: &IdentityResolver,
    graph: &GraphName,
    spec: &EdgeSpec,
) -> Result<UpsertOutcome<StoredEdge>> {
    let key = spec.key();
    let mut tx = store.begin().await?;
    lock_edge(&mut tx, graph, &key).await?;

    let start = endpoint(identity, &mut tx, graph, &key, &key.start_ident).await?;
    let end = endpoint(identity, &mut tx, graph, &key, &key.end_ident).await?;
    let resolved = identity
        .resolve_edge(&mut tx, graph, &key, spec.ident.as_ref(), (start, end))
        .await?;
    let mut record = resolved.record;

    let target = merge(&record.properties, &spec.properties);
    let delta = PropertyDelta::between(&record.properties, &target);
    if !delta.is_empty() {
        tx.update_edge_properties(graph, record.id, &delta).await?;
    }
    tx.commit().await?;

    tracing::debug!(
        graph = %graph,
        ident = %record.ident,
        id = %record.id,
        created = resolved.created,
        changed = delta.set.len(),
        "upserted edge"
    );
    record.properties = target;
    Ok(UpsertOutcome {
        entity: record,
        created: resolved.created,
    })
}

/// Locks both endpoints, in a fixed order, then the edge key. Holding the
/// endpoint locks keeps a concurrent vertex drop from missing the new edge.
pub(crate) async fn lock_edge<T: StoreTransaction>(
    tx: &mut T,
    graph: &GraphName,
    key: &EdgeKey,
) -> Result<()> {
    let (first, second) = if key.start_ident <= key.end_ident {
        (&key.start_ident, &key.end_ident)
    } else {
        (&key.end_ident, &key.start_ident)
    };
    tx.lock_entity(graph, EntityKind::Vertex, first.as_str())
        .await?;
    if second != first {
        tx.lock_entity(graph, EntityKind::Vertex, second.as_str())
            .await?;
    }
    tx.lock_entity(graph, EntityKind::Edge, &key.to_string())
        .await
}

async fn endpoint<T: StoreTransaction>(
    identity: &IdentityResolver,
    tx: &mut T,
    graph: &GraphName,
    key: &EdgeKey,
    ident: &Ident,
) -> Result<InternalId> {
    identity
        .resolve_endpoint(tx, graph, ident)
        .await
        .map_err(|err| {
            if err.kind == ErrorKind::NotFound {
                LibError::dangling_reference(graph, &key.to_string(), ident.as_str())
            } else {
                err
            }
        })
}

pub async fn unset_vertex_properties<S: GraphStore>(
    store: &S,
    identity: &IdentityResolver,
    names: &AgeSettings,
    graph: &GraphName,
    ident: &Ident,
    paths: &[PropertyPath],
) -> Result<Vertex> {
    ensure_property_paths(paths, names)?;
    ensure_graph_exists(store, graph).await?;

    let mut tx = store.begin().await?;
    tx.lock_entity(graph, EntityKind::Vertex, ident.as_str())
        .await?;
    let mut record = identity
        .resolve_vertex(&mut tx, graph, ident, ResolveMode::LookupOnly)
        .await?
        .record;

    let target = unset(&record.properties, paths);
    let delta = PropertyDelta::between(&record.properties, &target);
    if !delta.is_empty() {
        tx.update_vertex_properties(graph, record.id, &delta).await?;
    }
    tx.commit().await?;

    tracing::debug!(graph = %graph, ident = %ident, removed = delta.remove.len(), "unset vertex properties");
    record.properties = target;
    Ok(Vertex::from(record))
}

pub async fn unset_edge_properties<S: GraphStore>(
    store: &S,
    identity: &IdentityResolver,
    names: &AgeSettings,
    graph: &GraphName,
    ident: &Ident,
    paths: &[PropertyPath],
) -> Result<Edge> {
    ensure_property_paths(paths, names)?;
    ensure_graph_exists(store, graph).await?;

    let mut tx = store.begin().await?;
    let key = identity.lookup_edge(&mut tx, graph, ident).await?.key();
    lock_edge(&mut tx, graph, &key).await?;
    // Re-read under the lock; the edge may have been dropped meanwhile.
    let mut record = identity.lookup_edge(&mut tx, graph, ident).await?;

    let target = unset(&record.properties, paths);
    let delta = PropertyDelta::between(&record.properties, &target);
    if !delta.is_empty() {
        tx.update_edge_properties(graph, record.id, &delta).await?;
    }
    tx.commit().await?;

    tracing::debug!(graph = %graph, ident = %ident, removed = delta.remove.len(), "unset edge properties");
    record.properties = target;
    Ok(Edge::from(record))
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;
    use crate::error::ErrorDetails;
    use crate::memory::MemoryStore;
    use crate::models::PropertyMap;

    fn name(value: &str) -> GraphName {
        GraphName::new(value).expect("valid graph name")
    }

    fn ident(value: &str) -> Ident {
        Ident::new(value).expect("valid ident")
    }

    fn props(value: Value) -> PropertyMap {
        value.as_object().cloned().expect("object")
    }

    struct Fixture {
        store: MemoryStore,
        identity: IdentityResolver,
        names: AgeSettings,
        graph: GraphName,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: MemoryStore::new(),
                identity: IdentityResolver::new(64),
                names: AgeSettings::default(),
                graph: name("upserts"),
            }
        }

        async fn vertex(&self, id: &str, label: &str, properties: Value) -> Result<UpsertOutcome<Vertex>> {
            let spec = VertexSpec::new(ident(id), label, props(properties));
            upsert_vertex(&self.store, &self.identity, &self.names, &self.graph, &spec).await
        }

        async fn edge(&self, spec: EdgeSpec) -> Result<UpsertOutcome<Edge>> {
            upsert_edge(&self.store, &self.identity, &self.names, &self.graph, &spec).await
        }
    }

    #[tokio::test]
    async fn vertex_upsert_creates_graph_and_merges_properties() {
        let fx = Fixture::new();
        let first = fx
            .vertex("ada", "Person", json!({"profile": {"name": "Ada"}, "tags": ["a"]}))
            .await
            .expect("create");
        assert!(first.created);

        let second = fx
            .vertex("ada", "Person", json!({"profile": {"born": 1815}, "tags": ["b"]}))
            .await
            .expect("merge");
        assert!(!second.created);
        assert_eq!(second.entity.internal_id, first.entity.internal_id);
        assert_eq!(
            Value::Object(second.entity.properties),
            json!({"profile": {"name": "Ada", "born": 1815}, "tags": ["b"]})
        );
    }

    #[tokio::test]
    async fn vertex_label_is_immutable() {
        let fx = Fixture::new();
        fx.vertex("ada", "Person", json!({"x": 1})).await.expect("create");

        let err = fx
            .vertex("ada", "Robot", json!({"x": 2}))
            .await
            .expect_err("label change");
        assert_eq!(err.kind, ErrorKind::LabelConflict);

        let snapshot = fx
            .store
            .snapshot(&fx.graph)
            .await
            .expect("snapshot")
            .expect("graph exists");
        assert_eq!(snapshot.vertices[0].label, "Person");
        assert_eq!(Value::Object(snapshot.vertices[0].properties.clone()), json!({"x": 1}));
    }

    #[tokio::test]
    async fn edge_upsert_requires_existing_graph_and_endpoints() {
        let fx = Fixture::new();
        let spec = EdgeSpec::new("KNOWS", ident("ada"), ident("bob"), PropertyMap::new());
        let err = fx.edge(spec.clone()).await.expect_err("no graph");
        assert_eq!(err.kind, ErrorKind::NotFound);

        fx.vertex("ada", "Person", json!({})).await.expect("ada");
        let err = fx.edge(spec).await.expect_err("bob is missing");
        assert_eq!(err.kind, ErrorKind::DanglingReference);
        assert!(matches!(
            err.details,
            Some(ErrorDetails::MissingEndpoint { ref missing_ident, .. }) if missing_ident == "bob"
        ));
    }

    #[tokio::test]
    async fn edge_upsert_is_keyed_by_label_and_endpoints() {
        let fx = Fixture::new();
        fx.vertex("ada", "Person", json!({})).await.expect("ada");
        fx.vertex("bob", "Person", json!({})).await.expect("bob");

        let spec = EdgeSpec::new("KNOWS", ident("ada"), ident("bob"), props(json!({"since": 1})));
        let first = fx.edge(spec.clone()).await.expect("create edge");
        assert!(first.created);
        assert_eq!(first.entity.ident.as_str(), "ada-[KNOWS]->bob");

        let mut update = spec;
        update.properties = props(json!({"weight": 0.5}));
        let second = fx.edge(update).await.expect("update edge");
        assert!(!second.created);
        assert_eq!(second.entity.internal_id, first.entity.internal_id);
        assert_eq!(
            Value::Object(second.entity.properties),
            json!({"since": 1, "weight": 0.5})
        );

        let reverse = EdgeSpec::new("KNOWS", ident("bob"), ident("ada"), PropertyMap::new());
        assert!(fx.edge(reverse).await.expect("reverse edge").created);
    }

    #[tokio::test]
    async fn edges_between_bracketed_idents_stay_distinct() {
        let fx = Fixture::new();
        for id in ["a", "b-[L]->c", "a-[L]->b", "c"] {
            fx.vertex(id, "N", json!({})).await.expect("vertex");
        }

        let first = fx
            .edge(EdgeSpec::new("L", ident("a"), ident("b-[L]->c"), PropertyMap::new()))
            .await
            .expect("first edge");
        let second = fx
            .edge(EdgeSpec::new("L", ident("a-[L]->b"), ident("c"), PropertyMap::new()))
            .await
            .expect("second edge");

        assert!(first.created && second.created);
        assert_ne!(first.entity.ident, second.entity.ident);
        assert_ne!(first.entity.internal_id, second.entity.internal_id);
    }

    #[tokio::test]
    async fn naming_an_unnamed_edge_updates_it_in_place() {
        let fx = Fixture::new();
        fx.vertex("a", "N", json!({})).await.expect("a");
        fx.vertex("b", "N", json!({})).await.expect("b");

        let spec = EdgeSpec::new("L", ident("a"), ident("b"), props(json!({"w": 1})));
        let first = fx.edge(spec).await.expect("unnamed edge");

        let named = EdgeSpec::new("L", ident("a"), ident("b"), props(json!({"x": 2})))
            .with_ident(ident("named"));
        let second = fx.edge(named).await.expect("same edge, named");
        assert!(!second.created);
        assert_eq!(second.entity.internal_id, first.entity.internal_id);
        assert_eq!(second.entity.ident.as_str(), "a-[L]->b");
        assert_eq!(Value::Object(second.entity.properties), json!({"w": 1, "x": 2}));

        let renamed = EdgeSpec::new("L", ident("a"), ident("b"), PropertyMap::new())
            .with_ident(ident("other"));
        let third = fx.edge(renamed).await.expect("still the derived ident");
        assert_eq!(third.entity.ident.as_str(), "a-[L]->b");
    }

    #[tokio::test]
    async fn reserved_properties_are_rejected() {
        let fx = Fixture::new();
        let err = fx
            .vertex("ada", "Person", json!({"__ident": "bob"}))
            .await
            .expect_err("reserved key");
        assert_eq!(err.code, "reserved_property");
        assert!(!fx.store.graph_exists(&fx.graph).await.expect("exists query"));
    }

    #[tokio::test]
    async fn unset_removes_nested_paths_only() {
        let fx = Fixture::new();
        fx.vertex("ada", "Person", json!({"profile": {"name": "Ada", "born": 1815}, "keep": null}))
            .await
            .expect("create");

        let vertex = unset_vertex_properties(
            &fx.store,
            &fx.identity,
            &fx.names,
            &fx.graph,
            &ident("ada"),
            &[
                PropertyPath::new(vec!["profile".into(), "born".into()]).expect("path"),
                PropertyPath::key("missing"),
            ],
        )
        .await
        .expect("unset");
        assert_eq!(
            Value::Object(vertex.properties),
            json!({"profile": {"name": "Ada"}, "keep": null})
        );

        let err = unset_vertex_properties(
            &fx.store,
            &fx.identity,
            &fx.names,
            &fx.graph,
            &ident("ghost"),
            &[PropertyPath::key("x")],
        )
        .await
        .expect_err("unknown vertex");
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn unset_edge_properties_by_ident() {
        let fx = Fixture::new();
        fx.vertex("ada", "Person", json!({})).await.expect("ada");
        fx.vertex("bob", "Person", json!({})).await.expect("bob");
        let spec = EdgeSpec::new("KNOWS", ident("ada"), ident("bob"), props(json!({"a": 1, "b": 2})))
            .with_ident(ident("k1"));
        fx.edge(spec).await.expect("edge");

        let edge = unset_edge_properties(
            &fx.store,
            &fx.identity,
            &fx.names,
            &fx.graph,
            &ident("k1"),
            &[PropertyPath::key("a")],
        )
        .await
        .expect("unset");
        assert_eq!(Value::Object(edge.properties), json!({"b": 2}));
    }
}

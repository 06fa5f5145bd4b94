//! Maps caller idents onto store identities.
//!
//! The resolver is the only component that reads or writes the identity
//! mapping. Everything runs inside the caller's entity transaction, after the
//! caller has taken the entity lock, so resolve-or-create cannot race into two
//! entities for one ident.

use std::num::NonZeroUsize;

use anyhow::anyhow;
use lru::LruCache;
use parking_lot::{Mutex, MutexGuard};

use crate::error::{ErrorDetails, LibError, Result};
use crate::models::{EdgeKey, EntityKind, GraphName, Ident, InternalId};
use crate::store::{NewEdge, StoreTransaction, StoredEdge, StoredVertex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode<'a> {
    /// Fail with `NotFound` when no mapping exists.
    LookupOnly,
    /// Create a placeholder vertex with this label when no mapping exists.
    Create { label: &'a str },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolved<T> {
    pub record: T,
    pub created: bool,
}

type CacheKey = (GraphName, Ident);

pub struct IdentityResolver {
    endpoints: Option<Mutex<LruCache<CacheKey, InternalId>>>,
}

impl std::fmt::Debug for IdentityResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityResolver")
            .field("cached_endpoints", &self.cached_len())
            .finish()
    }
}

impl IdentityResolver {
    pub fn new(cache_capacity: usize) -> Self {
        Self {
            endpoints: NonZeroUsize::new(cache_capacity)
                .map(|capacity| Mutex::new(LruCache::new(capacity))),
        }
    }

    fn cache(&self) -> Option<MutexGuard<'_, LruCache<CacheKey, InternalId>>> {
        self.endpoints
            .as_ref()
            .map(|cache| cache.lock())
    }

    pub fn cached_len(&self) -> usize {
        self.cache().map_or(0, |cache| cache.len())
    }

    pub async fn resolve_vertex<T: StoreTransaction>(
        &self,
        tx: &mut T,
        graph: &GraphName,
        ident: &Ident,
        mode: ResolveMode<'_>,
    ) -> Result<Resolved<StoredVertex>> {
        if let Some(record) = tx.find_vertex(graph, ident).await? {
            return Ok(Resolved {
                record,
                created: false,
            });
        }

        match mode {
            ResolveMode::LookupOnly => {
                Err(LibError::entity_not_found(graph, EntityKind::Vertex, ident.as_str()))
            }
            ResolveMode::Create { label } => {
                let record = tx.insert_vertex(graph, ident, label).await?;
                tracing::debug!(graph = %graph, ident = %ident, id = %record.id, "created vertex mapping");
                Ok(Resolved {
                    record,
                    created: true,
                })
            }
        }
    }

    /// Lookup-only resolution of an edge endpoint, served from the cache when possible.
    pub async fn resolve_endpoint<T: StoreTransaction>(
        &self,
        tx: &mut T,
        graph: &GraphName,
        ident: &Ident,
    ) -> Result<InternalId> {
        let key = (graph.clone(), ident.clone());
        if let Some(id) = self.cache().and_then(|mut cache| cache.get(&key).copied()) {
            return Ok(id);
        }

        let resolved = self
            .resolve_vertex(tx, graph, ident, ResolveMode::LookupOnly)
            .await?;
        if let Some(mut cache) = self.cache() {
            cache.put(key, resolved.record.id);
        }
        Ok(resolved.record.id)
    }

    /// Resolves the edge for `key`, creating it between `start` and `end` when
    /// no edge exists yet.
    ///
    /// An edge created without an ident keeps its derived ident when a later
    /// call names it; the call still updates it. An edge that already carries
    /// a caller ident can not be renamed.
    pub async fn resolve_edge<T: StoreTransaction>(
        &self,
        tx: &mut T,
        graph: &GraphName,
        key: &EdgeKey,
        requested_ident: Option<&Ident>,
        (start, end): (InternalId, InternalId),
    ) -> Result<Resolved<StoredEdge>> {
        if let Some(record) = tx.find_edge(graph, key).await? {
            if let Some(requested) = requested_ident {
                if *requested != record.ident {
                    if record.ident != key.derived_ident() {
                        return Err(edge_ident_fixed(graph, key, requested, &record.ident));
                    }
                    tracing::debug!(
                        graph = %graph,
                        ident = %record.ident,
                        requested = %requested,
                        "edge keeps its derived ident"
                    );
                }
            }
            return Ok(Resolved {
                record,
                created: false,
            });
        }

        let ident = requested_ident
            .cloned()
            .unwrap_or_else(|| key.derived_ident());
        if let Some(other) = tx.find_edge_by_ident(graph, &ident).await? {
            return Err(edge_ident_conflict(graph, key, &ident, &other.ident).with_details(
                ErrorDetails::Entity {
                    graph: graph.to_string(),
                    kind: EntityKind::Edge,
                    ident: ident.to_string(),
                },
            ));
        }

        let inserted = tx
            .insert_edge(
                graph,
                NewEdge {
                    ident: &ident,
                    key,
                    start,
                    end,
                },
            )
            .await?;
        match inserted {
            Some(record) => {
                tracing::debug!(graph = %graph, ident = %ident, id = %record.id, "created edge mapping");
                Ok(Resolved {
                    record,
                    created: true,
                })
            }
            None => {
                // A cached endpoint id went stale; find out which one.
                self.forget_vertex(graph, &key.start_ident);
                self.forget_vertex(graph, &key.end_ident);
                let missing = if tx.find_vertex(graph, &key.start_ident).await?.is_none() {
                    &key.start_ident
                } else {
                    &key.end_ident
                };
                Err(LibError::dangling_reference(
                    graph,
                    &key.to_string(),
                    missing.as_str(),
                ))
            }
        }
    }

    pub async fn lookup_edge<T: StoreTransaction>(
        &self,
        tx: &mut T,
        graph: &GraphName,
        ident: &Ident,
    ) -> Result<StoredEdge> {
        tx.find_edge_by_ident(graph, ident)
            .await?
            .ok_or_else(|| LibError::entity_not_found(graph, EntityKind::Edge, ident.as_str()))
    }

    /// Deletes the vertex, its incident edges and their mappings.
    pub async fn release_vertex<T: StoreTransaction>(
        &self,
        tx: &mut T,
        graph: &GraphName,
        record: &StoredVertex,
    ) -> Result<usize> {
        self.forget_vertex(graph, &record.ident);
        tx.delete_vertex(graph, record.id).await
    }

    pub async fn release_edge<T: StoreTransaction>(
        &self,
        tx: &mut T,
        graph: &GraphName,
        record: &StoredEdge,
    ) -> Result<()> {
        tx.delete_edge(graph, record.id).await
    }

    /// Records a committed vertex so later endpoint lookups skip the store.
    pub fn confirm_vertex(&self, graph: &GraphName, ident: &Ident, id: InternalId) {
        if let Some(mut cache) = self.cache() {
            cache.put((graph.clone(), ident.clone()), id);
        }
    }

    pub fn forget_vertex(&self, graph: &GraphName, ident: &Ident) {
        if let Some(mut cache) = self.cache() {
            cache.pop(&(graph.clone(), ident.clone()));
        }
    }

    pub fn forget_graph(&self, graph: &GraphName) {
        if let Some(mut cache) = self.cache() {
            let stale: Vec<CacheKey> = cache
                .iter()
                .filter(|((cached_graph, _), _)| cached_graph == graph)
                .map(|(key, _)| key.clone())
                .collect();
            for key in stale {
                cache.pop(&key);
            }
        }
    }
}

fn edge_ident_fixed(
    graph: &GraphName,
    key: &EdgeKey,
    requested: &Ident,
    existing: &Ident,
) -> LibError {
    LibError::invalid_with_code(
        "edge_ident_fixed",
        "Edge already has a different ident",
        anyhow!(
            "edge {} in graph {}: requested ident '{}', existing ident '{}'",
            key,
            graph,
            requested,
            existing
        ),
    )
}

fn edge_ident_conflict(
    graph: &GraphName,
    key: &EdgeKey,
    requested: &Ident,
    existing: &Ident,
) -> LibError {
    LibError::invalid_with_code(
        "edge_ident_conflict",
        "Edge ident is already assigned to a different edge",
        anyhow!(
            "edge {} in graph {}: requested ident '{}', mapped ident '{}'",
            key,
            graph,
            requested,
            existing
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::memory::MemoryStore;
    use crate::store::GraphStore;

    fn name(value: &str) -> GraphName {
        GraphName::new(value).expect("valid graph name")
    }

    fn ident(value: &str) -> Ident {
        Ident::new(value).expect("valid ident")
    }

    async fn store_with_graph(graph: &GraphName) -> MemoryStore {
        let store = MemoryStore::new();
        store.create_graph(graph).await.expect("create graph");
        store
    }

    #[tokio::test]
    async fn resolve_or_create_is_idempotent() {
        let graph = name("identity");
        let store = store_with_graph(&graph).await;
        let resolver = IdentityResolver::new(16);

        let mut tx = store.begin().await.expect("begin");
        let first = resolver
            .resolve_vertex(&mut tx, &graph, &ident("v1"), ResolveMode::Create { label: "Person" })
            .await
            .expect("create");
        let second = resolver
            .resolve_vertex(&mut tx, &graph, &ident("v1"), ResolveMode::Create { label: "Person" })
            .await
            .expect("resolve");
        tx.commit().await.expect("commit");

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.record.id, second.record.id);
    }

    #[tokio::test]
    async fn lookup_only_reports_missing_vertices() {
        let graph = name("identity");
        let store = store_with_graph(&graph).await;
        let resolver = IdentityResolver::new(16);

        let mut tx = store.begin().await.expect("begin");
        let err = resolver
            .resolve_endpoint(&mut tx, &graph, &ident("ghost"))
            .await
            .expect_err("missing vertex");
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert_eq!(resolver.cached_len(), 0);
    }

    #[tokio::test]
    async fn stale_endpoint_cache_reports_dangling_reference() {
        let graph = name("identity");
        let store = store_with_graph(&graph).await;
        let resolver = IdentityResolver::new(16);

        let mut tx = store.begin().await.expect("begin");
        let a = tx.insert_vertex(&graph, &ident("a"), "N").await.expect("a");
        tx.commit().await.expect("commit");
        resolver.confirm_vertex(&graph, &ident("a"), a.id);
        resolver.confirm_vertex(&graph, &ident("b"), InternalId(4242));

        let mut tx = store.begin().await.expect("begin");
        let start = resolver
            .resolve_endpoint(&mut tx, &graph, &ident("a"))
            .await
            .expect("a cached");
        let end = resolver
            .resolve_endpoint(&mut tx, &graph, &ident("b"))
            .await
            .expect("stale entry for b");
        let key = EdgeKey::new("L", ident("a"), ident("b"));
        let err = resolver
            .resolve_edge(&mut tx, &graph, &key, None, (start, end))
            .await
            .expect_err("b does not exist");

        assert_eq!(err.kind, ErrorKind::DanglingReference);
        assert!(matches!(
            err.details,
            Some(ErrorDetails::MissingEndpoint { ref missing_ident, .. }) if missing_ident == "b"
        ));
        assert_eq!(resolver.cached_len(), 0);
    }

    #[tokio::test]
    async fn edge_idents_cannot_be_reassigned() {
        let graph = name("identity");
        let store = store_with_graph(&graph).await;
        let resolver = IdentityResolver::new(0);

        let mut tx = store.begin().await.expect("begin");
        let a = tx.insert_vertex(&graph, &ident("a"), "N").await.expect("a");
        let b = tx.insert_vertex(&graph, &ident("b"), "N").await.expect("b");
        let endpoints = (a.id, b.id);
        let knows = EdgeKey::new("KNOWS", ident("a"), ident("b"));
        resolver
            .resolve_edge(&mut tx, &graph, &knows, Some(&ident("e1")), endpoints)
            .await
            .expect("create e1");

        let err = resolver
            .resolve_edge(&mut tx, &graph, &knows, Some(&ident("e2")), endpoints)
            .await
            .expect_err("key already mapped to e1");
        assert_eq!(err.code, "edge_ident_fixed");

        let likes = EdgeKey::new("LIKES", ident("a"), ident("b"));
        let err = resolver
            .resolve_edge(&mut tx, &graph, &likes, Some(&ident("e1")), endpoints)
            .await
            .expect_err("e1 belongs to another edge");
        assert_eq!(err.code, "edge_ident_conflict");
    }

    #[tokio::test]
    async fn unnamed_edge_keeps_derived_ident_when_named_later() {
        let graph = name("identity");
        let store = store_with_graph(&graph).await;
        let resolver = IdentityResolver::new(0);

        let mut tx = store.begin().await.expect("begin");
        let a = tx.insert_vertex(&graph, &ident("a"), "N").await.expect("a");
        let b = tx.insert_vertex(&graph, &ident("b"), "N").await.expect("b");
        let key = EdgeKey::new("L", ident("a"), ident("b"));
        let created = resolver
            .resolve_edge(&mut tx, &graph, &key, None, (a.id, b.id))
            .await
            .expect("create unnamed");
        let named = resolver
            .resolve_edge(&mut tx, &graph, &key, Some(&ident("named")), (a.id, b.id))
            .await
            .expect("same edge");

        assert!(!named.created);
        assert_eq!(named.record.id, created.record.id);
        assert_eq!(named.record.ident, key.derived_ident());
    }

    #[test]
    fn forget_graph_only_evicts_that_graph() {
        let resolver = IdentityResolver::new(8);
        resolver.confirm_vertex(&name("first"), &ident("a"), InternalId(1));
        resolver.confirm_vertex(&name("second"), &ident("a"), InternalId(2));

        resolver.forget_graph(&name("first"));
        assert_eq!(resolver.cached_len(), 1);
    }
}

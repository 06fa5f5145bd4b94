//! Bulk reconciliation of a graph fragment.
//!
//! Duplicate specs in one fragment are coalesced in input order before any
//! write. All vertices are applied before any edge, so an edge may reference a
//! vertex created by the same call. Each entity is written in its own
//! transaction; a per-entity failure only marks that entity, while a store
//! outage stops the batch after the current chunk.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::future::Future;

use anyhow::anyhow;
use futures::{StreamExt, stream};

use crate::config::{AgeSettings, ReconcileSettings};
use crate::error::{LibError, Result};
use crate::identity::IdentityResolver;
use crate::invariants::{ensure_edge_spec, ensure_vertex_spec};
use crate::merge::merge_into;
use crate::models::{
    EdgeKey, EdgeSpec, EntityFailure, EntityKind, EntityOutcome, EntityResult, GraphFragment,
    GraphName, Ident, InternalId, ReconcileReport, VertexSpec,
};
use crate::store::GraphStore;
use crate::upsert::{apply_edge, apply_vertex};

/// Specs sharing one identity, merged into a single write.
#[derive(Debug, Clone)]
struct Group<T> {
    spec: T,
    positions: Vec<usize>,
}

type Outcomes = Vec<Option<EntityOutcome>>;

fn failed(err: &LibError) -> EntityOutcome {
    EntityOutcome::Failed {
        failure: EntityFailure::from(err),
    }
}

fn coalesce_vertices(
    specs: &[VertexSpec],
    names: &AgeSettings,
    outcomes: &mut Outcomes,
) -> Vec<Group<VertexSpec>> {
    let mut groups: Vec<Group<VertexSpec>> = Vec::new();
    let mut by_ident: HashMap<&Ident, usize> = HashMap::with_capacity(specs.len());

    for (position, spec) in specs.iter().enumerate() {
        if let Err(err) = ensure_vertex_spec(spec, names) {
            outcomes[position] = Some(failed(&err));
            continue;
        }
        match by_ident.entry(&spec.ident) {
            Entry::Vacant(slot) => {
                slot.insert(groups.len());
                groups.push(Group {
                    spec: spec.clone(),
                    positions: vec![position],
                });
            }
            Entry::Occupied(slot) => {
                let group = &mut groups[*slot.get()];
                if group.spec.label != spec.label {
                    let err = LibError::label_conflict(
                        spec.ident.as_str(),
                        &group.spec.label,
                        &spec.label,
                    );
                    outcomes[position] = Some(failed(&err));
                    continue;
                }
                merge_into(&mut group.spec.properties, &spec.properties);
                group.positions.push(position);
            }
        }
    }
    groups
}

fn coalesce_edges(
    specs: &[EdgeSpec],
    names: &AgeSettings,
    outcomes: &mut Outcomes,
) -> Vec<Group<EdgeSpec>> {
    let mut groups: Vec<Group<EdgeSpec>> = Vec::new();
    let mut by_key: HashMap<EdgeKey, usize> = HashMap::with_capacity(specs.len());

    for (position, spec) in specs.iter().enumerate() {
        if let Err(err) = ensure_edge_spec(spec, names) {
            outcomes[position] = Some(failed(&err));
            continue;
        }
        match by_key.entry(spec.key()) {
            Entry::Vacant(slot) => {
                slot.insert(groups.len());
                groups.push(Group {
                    spec: spec.clone(),
                    positions: vec![position],
                });
            }
            Entry::Occupied(slot) => {
                let group = &mut groups[*slot.get()];
                match (&group.spec.ident, &spec.ident) {
                    (Some(first), Some(other)) if first != other => {
                        let err = LibError::invalid_with_code(
                            "edge_ident_conflict",
                            "Edge is given two different idents",
                            anyhow!(
                                "edge {} is given idents '{}' and '{}'",
                                slot.key(),
                                first,
                                other
                            ),
                        );
                        outcomes[position] = Some(failed(&err));
                        continue;
                    }
                    (None, Some(other)) => group.spec.ident = Some(other.clone()),
                    _ => {}
                }
                merge_into(&mut group.spec.properties, &spec.properties);
                group.positions.push(position);
            }
        }
    }
    groups
}

/// Applies groups chunk by chunk, recording the stored ident of every applied
/// group. Returns the first infrastructure error, after which the caller must
/// stop.
async fn run_chunks<'a, T, F, Fut>(
    kind: EntityKind,
    graph: &GraphName,
    groups: &'a [Group<T>],
    settings: &ReconcileSettings,
    idents: &mut [String],
    outcomes: &mut Outcomes,
    apply: F,
) -> Option<LibError>
where
    F: Fn(&'a T) -> Fut,
    Fut: Future<Output = Result<(Ident, InternalId, bool)>>,
{
    for chunk in groups.chunks(settings.batch_size.max(1)) {
        let results: Vec<Result<(Ident, InternalId, bool)>> = stream::iter(chunk)
            .map(|group| apply(&group.spec))
            .buffered(settings.max_concurrency.max(1))
            .collect()
            .await;

        let mut abort = None;
        for (group, result) in chunk.iter().zip(results) {
            let outcome = match result {
                Ok((ident, internal_id, created)) => {
                    for &position in &group.positions {
                        idents[position] = ident.to_string();
                    }
                    EntityOutcome::Applied {
                        internal_id,
                        created,
                    }
                }
                Err(err) => {
                    tracing::warn!(graph = %graph, kind = %kind, error = %err, "entity upsert failed");
                    let outcome = failed(&err);
                    if err.is_infrastructure() && abort.is_none() {
                        abort = Some(err);
                    }
                    outcome
                }
            };
            for &position in &group.positions {
                outcomes[position] = Some(outcome.clone());
            }
        }
        if abort.is_some() {
            return abort;
        }
    }
    None
}

fn finish(kind: EntityKind, idents: Vec<String>, outcomes: Outcomes) -> Vec<EntityResult> {
    idents
        .into_iter()
        .zip(outcomes)
        .map(|(ident, outcome)| EntityResult {
            kind,
            ident,
            outcome: outcome.unwrap_or(EntityOutcome::Skipped),
        })
        .collect()
}

/// Idents as reported per input position before anything is written. A
/// coalesced edge reports the ident its group is written with.
fn planned_edge_idents(specs: &[EdgeSpec], groups: &[Group<EdgeSpec>]) -> Vec<String> {
    let mut idents: Vec<String> = specs
        .iter()
        .map(|spec| spec.effective_ident().to_string())
        .collect();
    for group in groups {
        let ident = group.spec.effective_ident().to_string();
        for &position in &group.positions {
            idents[position] = ident.clone();
        }
    }
    idents
}

pub async fn upsert_graph<S: GraphStore>(
    store: &S,
    identity: &IdentityResolver,
    names: &AgeSettings,
    settings: &ReconcileSettings,
    graph: &GraphName,
    fragment: &GraphFragment,
) -> Result<ReconcileReport> {
    if store.create_graph(graph).await? {
        tracing::info!(graph = %graph, "created graph");
    }
    tracing::info!(
        graph = %graph,
        vertices = fragment.vertices.len(),
        edges = fragment.edges.len(),
        batch_size = settings.batch_size,
        "reconciling fragment"
    );

    let mut vertex_outcomes: Outcomes = vec![None; fragment.vertices.len()];
    let mut edge_outcomes: Outcomes = vec![None; fragment.edges.len()];
    let vertex_groups = coalesce_vertices(&fragment.vertices, names, &mut vertex_outcomes);
    let edge_groups = coalesce_edges(&fragment.edges, names, &mut edge_outcomes);

    let mut vertex_idents: Vec<String> = fragment
        .vertices
        .iter()
        .map(|spec| spec.ident.to_string())
        .collect();
    let mut edge_idents = planned_edge_idents(&fragment.edges, &edge_groups);

    let mut abort = run_chunks(
        EntityKind::Vertex,
        graph,
        &vertex_groups,
        settings,
        &mut vertex_idents,
        &mut vertex_outcomes,
        |spec| async move {
            apply_vertex(store, identity, graph, spec)
                .await
                .map(|outcome| (outcome.entity.ident, outcome.entity.id, outcome.created))
        },
    )
    .await;

    if abort.is_none() {
        abort = run_chunks(
            EntityKind::Edge,
            graph,
            &edge_groups,
            settings,
            &mut edge_idents,
            &mut edge_outcomes,
            |spec| async move {
                apply_edge(store, identity, graph, spec)
                    .await
                    .map(|outcome| (outcome.entity.ident, outcome.entity.id, outcome.created))
            },
        )
        .await;
    }

    let report = ReconcileReport {
        graph: graph.clone(),
        vertices: finish(EntityKind::Vertex, vertex_idents, vertex_outcomes),
        edges: finish(EntityKind::Edge, edge_idents, edge_outcomes),
        aborted: abort.as_ref().map(EntityFailure::from),
    };

    match &abort {
        Some(err) => tracing::error!(
            graph = %graph,
            error = %err,
            applied = report.applied_count(),
            "reconcile aborted, remaining entities skipped"
        ),
        None => tracing::info!(
            graph = %graph,
            applied = report.applied_count(),
            failed = report.failures().count(),
            "reconcile finished"
        ),
    }
    Ok(report)
}

use crate::error::{LibError, Result};
use crate::identity::IdentityResolver;
use crate::models::{
    DropGraphOutcome, DropGraphResult, DropGraphsReport, EntityFailure, GraphHandle, GraphName,
    GraphSnapshot,
};
use crate::store::GraphStore;

pub async fn get_or_create_graph<S: GraphStore>(store: &S, graph: &GraphName) -> Result<GraphHandle> {
    let created = store.create_graph(graph).await?;
    if created {
        tracing::info!(graph = %graph, "created graph");
    }
    Ok(GraphHandle {
        name: graph.clone(),
        created,
    })
}

pub async fn list_graphs<S: GraphStore>(store: &S) -> Result<Vec<GraphName>> {
    let mut graphs = store.list_graphs().await?;
    graphs.sort();
    Ok(graphs)
}

pub async fn get_graph<S: GraphStore>(store: &S, graph: &GraphName) -> Result<GraphSnapshot> {
    store
        .snapshot(graph)
        .await?
        .ok_or_else(|| LibError::graph_not_found(graph))
}

/// Drops each named graph in order. Unknown or invalid names fail on their
/// own; a store outage marks the remaining names as skipped.
pub async fn drop_graphs<S: GraphStore>(
    store: &S,
    identity: &IdentityResolver,
    names: &[String],
) -> Result<DropGraphsReport> {
    let mut results = Vec::with_capacity(names.len());
    let mut aborted: Option<EntityFailure> = None;

    for name in names {
        if aborted.is_some() {
            results.push(DropGraphResult {
                name: name.clone(),
                outcome: DropGraphOutcome::Skipped,
            });
            continue;
        }

        let outcome = match drop_one(store, identity, name).await {
            Ok(()) => DropGraphOutcome::Dropped,
            Err(err) => {
                tracing::warn!(graph = %name, error = %err, "failed to drop graph");
                let failure = EntityFailure::from(&err);
                if err.is_infrastructure() {
                    aborted = Some(failure.clone());
                }
                DropGraphOutcome::Failed { failure }
            }
        };
        results.push(DropGraphResult {
            name: name.clone(),
            outcome,
        });
    }

    if let Some(failure) = &aborted {
        tracing::error!(error = %failure.detail, "drop graphs aborted");
    }
    Ok(DropGraphsReport { results, aborted })
}

async fn drop_one<S: GraphStore>(store: &S, identity: &IdentityResolver, name: &str) -> Result<()> {
    let graph = GraphName::new(name)?;
    if !store.drop_graph(&graph).await? {
        return Err(LibError::graph_not_found(&graph));
    }
    identity.forget_graph(&graph);
    tracing::info!(graph = %graph, "dropped graph");
    Ok(())
}

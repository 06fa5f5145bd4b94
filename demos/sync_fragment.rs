use std::fs;
use std::path::PathBuf;

use anyhow::{Context, anyhow};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use age_graph_sync::db::{AgeStore, connect, create_age_extension};
use age_graph_sync::prelude::{GraphFragment, GraphName, GraphOperations, Settings};

#[derive(Parser, Debug)]
#[command(
    name = "sync_fragment",
    about = "Reconcile a JSON graph fragment into an Apache AGE graph"
)]
struct Cli {
    #[arg(value_name = "GRAPH", help = "Target graph, created when missing")]
    graph: String,

    #[arg(value_name = "FILE", help = "JSON file with `vertices` and `edges`")]
    fragment: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::from_env().context("invalid settings")?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone())),
        )
        .init();

    let graph = GraphName::new(cli.graph).context("invalid graph name")?;
    let path = cli.fragment.display();
    let raw = fs::read_to_string(&cli.fragment).with_context(|| format!("failed to read {path}"))?;
    let fragment: GraphFragment =
        serde_json::from_str(&raw).with_context(|| format!("invalid fragment in {path}"))?;

    let pool = connect(&settings.db)
        .await
        .context("failed to connect to postgres")?;
    create_age_extension(&pool)
        .await
        .context("failed to create the age extension")?;

    let ops = GraphOperations::from_settings(AgeStore::new(pool, settings.age.clone()), &settings)
        .context("invalid engine settings")?;

    let violations = ops.validate_fragment(&fragment);
    if !violations.is_empty() {
        tracing::warn!(count = violations.len(), "fragment has static violations");
    }

    let report = ops
        .upsert_graph(&graph, &fragment)
        .await
        .context("reconcile failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.aborted.is_some() {
        return Err(anyhow!("reconcile aborted, see report"));
    }
    Ok(())
}

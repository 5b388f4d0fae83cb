use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tb_engine::{FileLog, IterationCoordinator, Tee, TracingLog};
use tb_jobs::{NewickSplitter, ProcessJobRunner};
use tb_types::{IterationOptions, RoundInputs, TreeBunchConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// One round as described by the `TREEBUNCH_ROUND` JSON file.
#[derive(Debug, Deserialize)]
struct RoundRequest {
    inputs: RoundInputs,
    #[serde(default)]
    previous_best_dir: Option<PathBuf>,
    #[serde(default)]
    options: IterationOptions,
    /// Also run a standalone GAMMA search with this many trees.
    #[serde(default)]
    gamma_search_trees: Option<usize>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::var("TREEBUNCH_CONFIG") {
        Ok(path) => TreeBunchConfig::from_json_file(&PathBuf::from(path))?,
        Err(_) => TreeBunchConfig::default(),
    };
    let round_path = std::env::var("TREEBUNCH_ROUND")
        .map_err(|_| anyhow::anyhow!("TREEBUNCH_ROUND must point at a round request JSON file"))?;
    let request: RoundRequest = serde_json::from_str(&std::fs::read_to_string(&round_path)?)?;

    let file_log = FileLog::open(&config.iteration_log_name)?.with_echo(true);
    let log = Tee::new().with(Arc::new(file_log)).with(Arc::new(TracingLog));
    let runner = ProcessJobRunner::new(config.executables.clone());
    let coordinator = IterationCoordinator::new(
        config,
        Arc::new(runner),
        Arc::new(NewickSplitter),
        Arc::new(log),
    )?;

    let outcome = coordinator.start_iteration(
        &request.inputs,
        request.previous_best_dir,
        &request.options,
    )?;
    info!(
        update_id = outcome.update_id,
        best_lh = outcome.best_likelihood,
        "round complete, best bunch at {}",
        outcome.bunch.paths.bundle.display()
    );
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    if let Some(trees) = request.gamma_search_trees {
        let lh = coordinator.search_from_scratch(&request.inputs, trees)?;
        println!("std GAMMA search best score: {lh}");
    }
    Ok(())
}

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use chronomap_common::{Config, PipelineStep};
use chronomap_pipeline::pipeline::{Pipeline, RunMode};
use chronomap_pipeline::sources::{SparqlStructuredSource, WikiNarrativeSource};
use lm_client::LocalModel;

#[derive(Parser)]
#[command(
    name = "chronomap",
    about = "Build a geocoded timeline dataset of historical figures"
)]
struct Cli {
    /// full processes every roster entity; retry only failed or new ones
    #[arg(long, value_enum, default_value_t = RunMode::Full)]
    mode: RunMode,

    /// Recompute from this step onward, discarding its persisted output
    #[arg(long)]
    step: Option<PipelineStep>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    config.log_summary();

    // An unreachable model server fails fast, before any network work.
    let model = LocalModel::new(&config.model_base_url, &config.model_name);
    model.ping().await?;

    let structured = SparqlStructuredSource::new(&config);
    let narrative = WikiNarrativeSource::new(&config);
    let pipeline = Pipeline::new(&config, &model, &structured, &narrative);

    let report = pipeline.run(cli.mode, cli.step).await?;
    println!("{}", report.stats);

    if report.stats.entities_in_dataset == 0 {
        error!("No entities completed; dataset is empty");
        std::process::exit(1);
    }
    Ok(())
}

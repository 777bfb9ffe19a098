use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use spf_pipeline::{
    maybe_build_scheduler, resolve_locations, Pipeline, PipelineConfig, PipelineError,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "spf")]
#[command(about = "Smart property finder: gather, enrich, score and export listings")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// One batch run across all locations and sources.
    Run(RunArgs),
    /// Refresh area stats for an existing export and rescore it.
    Enrich(ExportArgs),
    /// Rescore an existing export from its stored attributes.
    Analyze(ExportArgs),
    /// Fill missing listing images in an existing export.
    Images(ImageArgs),
    /// Run the batch on the configured cron schedule until interrupted.
    Schedule,
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    /// Comma-separated locations, or `england` for the preset list.
    #[arg(long)]
    locations: Option<String>,
    #[arg(long)]
    max_price: Option<f64>,
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long)]
    exclude_land: bool,
    /// Enrich from cached area stats only.
    #[arg(long)]
    no_refresh: bool,
}

#[derive(Debug, Args)]
struct ExportArgs {
    /// Export to rewrite; defaults to the configured output path.
    #[arg(long)]
    data: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ImageArgs {
    #[arg(long)]
    data: Option<PathBuf>,
    #[arg(long, default_value_t = 500)]
    max_images: usize,
    /// Seconds to pause between page fetches.
    #[arg(long, default_value_t = 0.15)]
    sleep: f64,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

impl RunArgs {
    fn apply(self, config: &mut PipelineConfig) {
        if let Some(locations) = self.locations {
            config.locations = resolve_locations(&locations);
        }
        if let Some(max_price) = self.max_price {
            config.max_price = max_price;
        }
        if let Some(output) = self.output {
            config.output_path = output;
        }
        config.exclude_land |= self.exclude_land;
        if self.no_refresh {
            config.refresh_area_stats = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let mut config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => {
            args.apply(&mut config);
            let run_timeout = config.run_timeout;
            let summary = Pipeline::from_config(config)?.run_once().await?;
            println!(
                "run complete: run_id={} gathered={} duplicates={} exported={} output={}",
                summary.run_id, summary.gathered, summary.duplicates_dropped, summary.exported, summary.output_path
            );
            if summary.timed_out {
                return Err(PipelineError::RunTimeout {
                    seconds: run_timeout.as_secs_f64(),
                    exported: summary.exported,
                }
                .into());
            }
        }
        Commands::Enrich(args) => {
            let path = args.data.unwrap_or_else(|| config.output_path.clone());
            let report = Pipeline::from_config(config)?.enrich_export(&path).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Analyze(args) => {
            let path = args.data.unwrap_or_else(|| config.output_path.clone());
            let report = Pipeline::from_config(config)?.analyze_export(&path).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Images(args) => {
            let path = args.data.unwrap_or_else(|| config.output_path.clone());
            let pause = Duration::try_from_secs_f64(args.sleep.max(0.0)).unwrap_or_default();
            let report = Pipeline::from_config(config)?
                .enrich_images_export(&path, args.max_images, pause)
                .await?;
            println!(
                "images: missing={} attempted={} from_cache={} updated={}",
                report.missing, report.attempted, report.from_cache, report.updated
            );
        }
        Commands::Schedule => {
            config.scheduler_enabled = true;
            let pipeline = Arc::new(Pipeline::from_config(config)?);
            let Some(mut sched) = maybe_build_scheduler(pipeline).await? else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

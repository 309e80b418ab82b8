use anyhow::{Context, Result};
use std::{env, path::PathBuf, sync::Arc};
use structopt::StructOpt;
use train::config::{Config, Overrides, ParallelMode};

#[derive(Debug, Clone, StructOpt)]
/// Fine-tune a binary segmentation model
struct Args {
    #[structopt(long, default_value = "train.json5")]
    /// configuration file
    pub config_file: PathBuf,
    #[structopt(long)]
    /// override the batch size
    pub batch_size: Option<usize>,
    #[structopt(long)]
    /// override the number of prefetch workers
    pub num_workers: Option<usize>,
    #[structopt(long)]
    /// override the number of epochs
    pub epochs: Option<usize>,
    #[structopt(long)]
    /// parallel mode: none, data-parallel or distributed
    pub parallel: Option<ParallelMode>,
    #[structopt(long)]
    /// override the number of distributed workers
    pub world_size: Option<usize>,
    #[structopt(long)]
    /// time data loading with increasing worker counts instead of training
    pub benchmark_dataloader: bool,
    #[structopt(long, default_value = "10")]
    /// the largest worker count to benchmark
    pub max_workers: usize,
}

#[tokio::main]
pub async fn main() -> Result<()> {
    // log at info level unless RUST_LOG says otherwise
    let filters = env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    pretty_env_logger::formatted_builder()
        .parse_filters(&filters)
        .init();

    // parse arguments
    let Args {
        config_file,
        batch_size,
        num_workers,
        epochs,
        parallel,
        world_size,
        benchmark_dataloader,
        max_workers,
    } = Args::from_args();
    let overrides = Overrides {
        batch_size,
        num_workers,
        epochs,
        parallel,
        world_size,
    };
    let config = Arc::new(
        Config::open(&config_file)
            .with_context(|| format!("failed to load config file '{}'", config_file.display()))?
            .with_overrides(&overrides),
    );

    if benchmark_dataloader {
        train::benchmark::benchmark_dataloader(config, max_workers).await?;
    } else {
        train::start(config).await?;
    }

    Ok(())
}

//! The fine-tuning program of binary segmentation models.

pub mod benchmark;
pub mod common;
pub mod config;
pub mod history;
pub mod model;
pub mod topology;
pub mod train;
pub mod utils;

use crate::{
    common::*,
    config::{Config, ParallelConfig},
    topology::{launch, ProcessGroup},
    train::{check_partition, run_worker, JobOutcome},
};

/// The entry of training program.
///
/// It returns the outcome of every rank in rank order.
pub async fn start(config: Arc<Config>) -> Result<Vec<JobOutcome>> {
    config.validate()?;
    let start_time = Local::now();

    // create the output dir and save config
    let experiment_dir = config.output.experiment_dir();
    {
        tokio::fs::create_dir_all(&experiment_dir).await?;
        let path = experiment_dir.join("config.json5");
        let text = serde_json::to_string_pretty(&*config)?;
        tokio::fs::write(&path, text).await?;
    }

    // the partition is built once and shared by all ranks
    let partition = Arc::new(build_partition(&config).await?);
    info!(
        "train images: {}, test images: {}",
        partition.train.len(),
        partition.test.len()
    );
    check_partition(&config, &partition)?;

    let parallel = config.training.parallel.clone();
    let outcomes = match parallel {
        ParallelConfig::None { device } => {
            let outcome = tokio::task::spawn_blocking(move || {
                run_worker(&config, &partition, ProcessGroup::single(device))
            })
            .await??;
            vec![outcome]
        }
        ParallelConfig::DataParallel { devices } => {
            let master_device = devices
                .first()
                .copied()
                .ok_or_else(|| SegError::configuration("no device is given"))?;
            let outcome = tokio::task::spawn_blocking(move || {
                run_worker(&config, &partition, ProcessGroup::single(master_device))
            })
            .await??;
            vec![outcome]
        }
        ParallelConfig::Distributed {
            world_size,
            rendezvous_addr,
            timeout_secs,
            ..
        } => {
            info!(
                "launch {} workers with rendezvous at {}",
                world_size, rendezvous_addr
            );
            let timeout = Duration::from_secs(timeout_secs);
            launch(world_size, move |rank| {
                let group = ProcessGroup::initialize(rank, world_size, rendezvous_addr, timeout)?;
                run_worker(&config, &partition, group)
            })
            .await?
        }
    };

    let elapsed = Local::now() - start_time;
    info!(
        "job finished in {:.1} seconds",
        elapsed.num_milliseconds() as f64 / 1000.0
    );

    Ok(outcomes)
}

/// Lists, pairs, shuffles and splits the dataset with the configured seed.
pub async fn build_partition(config: &Config) -> Result<Partition> {
    let dataset = &config.dataset;
    let builder = PartitionBuilder {
        image_dir: dataset.image_dir.clone(),
        mask_dir: dataset.mask_dir.clone(),
        image_extension: dataset.image_extension.clone(),
        mask_extension: dataset.mask_extension.clone(),
        split_rate: dataset.split_rate.raw(),
        seed: dataset.seed,
    };

    let partition = tokio::task::spawn_blocking(move || builder.build())
        .map(|result| Fallible::Ok(result??))
        .await?;

    if partition.train.is_empty() || partition.test.is_empty() {
        return Err(SegError::configuration(format!(
            "the partition of {} pairs leaves an empty train or test subset",
            partition.len()
        ))
        .into());
    }

    Ok(partition)
}

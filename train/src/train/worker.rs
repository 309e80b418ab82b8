use super::{epoch::run_epoch, replicated::Replicated, validation::run_validation};
use crate::{
    common::*,
    config::{Config, ParallelConfig},
    history::{EpochMetrics, History},
    model::build_model,
    topology::ProcessGroup,
    utils::{BestCheckpoint, CheckpointManager, CheckpointRecord},
};

/// The result of one rank's run.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub rank: usize,
    pub history: History,
    pub best_iou: f64,
    pub best_epoch: Option<usize>,
    /// The last best checkpoint written, on rank 0 only.
    pub best_checkpoint: Option<CheckpointRecord>,
    /// The final checkpoint, on rank 0 only.
    pub final_checkpoint: Option<CheckpointRecord>,
}

fn batch_policy(config: &Config) -> BatchPolicy {
    match config.training.parallel {
        ParallelConfig::Distributed { batch_policy, .. } => batch_policy,
        _ => BatchPolicy::default(),
    }
}

/// Checks that both subsets can be sharded among the ranks and fill a batch.
///
/// It runs before any rank joins the group, so a bad setup is reported as a
/// configuration error instead of a failed job.
pub fn check_partition(config: &Config, partition: &Partition) -> Result<()> {
    let world_size = config.world_size();
    let batch_size = config.training.batch_size;

    for (name, pairs) in [("train", &partition.train), ("test", &partition.test)] {
        ShardSampler::new(pairs.len(), 0, world_size, batch_policy(config))
            .and_then(|_| ShardedDataSource::check_batch_size(pairs.len(), batch_size))
            .with_context(|| format!("invalid {} subset of {} pairs", name, pairs.len()))?;
    }
    Ok(())
}

/// Builds the data source of a rank over a partition subset.
pub fn build_source(
    config: &Config,
    pairs: &[ImageMaskPair],
    rank: usize,
    world_size: usize,
) -> Result<ShardedDataSource> {
    let sampler = ShardSampler::new(pairs.len(), rank, world_size, batch_policy(config))?;
    let dataset = OnDemandDataset::new(pairs.to_vec(), config.dataset.image_size)?;
    ShardedDataSource::new(
        Arc::new(dataset),
        sampler,
        config.training.batch_size,
        config.dataset.num_workers,
    )
}

/// Trains and validates for all epochs on one rank, then leaves the group.
///
/// Epoch statistics are summed over ranks, so every rank takes the same
/// checkpoint decisions. Only rank 0 writes files.
pub fn run_worker(config: &Config, partition: &Partition, group: ProcessGroup) -> Result<JobOutcome> {
    let rank = group.rank();
    let world_size = group.world_size();
    let device = group.device();
    let is_master = group.topology().is_master();
    let epochs = config.training.epochs;

    let train_source = build_source(config, &partition.train, rank, world_size)?;
    let test_source = build_source(config, &partition.test, rank, world_size)?;
    info!(
        "[rank {}] {} train batches and {} test batches per epoch",
        rank,
        train_source.num_batches(),
        test_source.num_batches()
    );

    tch::manual_seed(config.dataset.seed as i64);
    let model = build_model(config, device)?;
    let mut model = Replicated::new(model, group)?;
    let mut optimizer = nn::Adam::default().build(model.var_store(), config.training.lr)?;
    let criterion = CrossEntropyLoss::default();

    let experiment_dir = config.output.experiment_dir();
    let checkpoints = is_master
        .then(|| CheckpointManager::new(&experiment_dir, &config.output.checkpoint_name))
        .transpose()?;
    let mut tracker = BestCheckpoint::new();
    let mut history = History::new();
    let mut best_checkpoint = None;

    info!("[rank {}] start training on {:?}", rank, device);

    for epoch in 1..=epochs {
        let instant = Instant::now();
        let train_output = run_epoch(&mut model, &mut optimizer, &criterion, &train_source)?;
        let train_secs = instant.elapsed().as_secs_f64();

        let instant = Instant::now();
        let val_output = run_validation(&mut model, &criterion, &test_source)?;
        let val_secs = instant.elapsed().as_secs_f64();

        let metrics = {
            let mut stats = [
                train_output.loss_sum as f32,
                train_output.num_batches as f32,
                val_output.loss_sum as f32,
                val_output.iou_sum as f32,
                val_output.num_batches as f32,
            ];
            model
                .group_mut()
                .collective()
                .all_reduce_sum(&mut stats)
                .context("failed to aggregate epoch statistics")?;
            let [train_loss_sum, train_batches, val_loss_sum, val_iou_sum, val_batches] =
                stats.map(f64::from);

            EpochMetrics {
                epoch,
                train_loss: train_loss_sum / train_batches,
                val_loss: val_loss_sum / val_batches,
                val_iou: val_iou_sum / val_batches,
            }
        };

        info!(
            "[rank {}] epoch [{}/{}] loss: {:.4} time (s): {:.2}",
            rank, epoch, epochs, metrics.train_loss, train_secs
        );
        info!(
            "[rank {}] epoch [{}/{}] loss: {:.4} mIoU: {:.4} time (s): {:.2}",
            rank, epoch, epochs, metrics.val_loss, metrics.val_iou, val_secs
        );
        history.push(metrics)?;

        let improved = tracker.record(epoch, metrics.val_iou);
        if let Some(checkpoints) = &checkpoints {
            if improved {
                best_checkpoint =
                    Some(checkpoints.save_best(model.var_store(), epoch, metrics.val_iou)?);
            }
            history.write_csv(experiment_dir.join(History::FILE_NAME))?;
        }
    }

    let final_checkpoint = match &checkpoints {
        Some(checkpoints) => {
            let last_iou = history
                .entries()
                .last()
                .map(|metrics| metrics.val_iou)
                .unwrap_or(0.0);
            Some(checkpoints.save_final(model.var_store(), epochs, last_iou)?)
        }
        None => None,
    };

    info!(
        "[rank {}] best model achieves mIoU: {:.4}",
        rank,
        tracker.best_iou()
    );

    let (_, group) = model.into_parts();
    group.teardown()?;

    Ok(JobOutcome {
        rank,
        history,
        best_iou: tracker.best_iou(),
        best_epoch: tracker.best_epoch(),
        best_checkpoint,
        final_checkpoint,
    })
}

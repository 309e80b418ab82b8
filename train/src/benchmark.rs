//! Data loading throughput measurement.

use crate::{common::*, config::Config, train::build_source};

/// Times one pass over the training subset per worker count.
///
/// A warm-up pass runs first so that file system caches do not favor later
/// measurements. It returns `(num_workers, seconds)` for worker counts
/// `0..=max_workers`.
pub async fn benchmark_dataloader(
    config: Arc<Config>,
    max_workers: usize,
) -> Result<Vec<(usize, f64)>> {
    config.validate()?;
    let partition = crate::build_partition(&config).await?;
    let source = build_source(&config, &partition.train, 0, 1)?;

    info!("warm up with {} batches", source.num_batches());
    drain(source.clone()).await?;

    let mut report = Vec::with_capacity(max_workers + 1);
    for num_workers in 0..=max_workers {
        let instant = Instant::now();
        let num_batches = drain(source.with_num_workers(num_workers)).await?;
        let secs = instant.elapsed().as_secs_f64();

        info!(
            "time for {} loaders: {:.3} seconds ({} batches)",
            num_workers, secs, num_batches
        );
        report.push((num_workers, secs));
    }

    Ok(report)
}

/// Consumes one pass of the source on a blocking thread.
async fn drain(source: ShardedDataSource) -> Result<usize> {
    tokio::task::spawn_blocking(move || {
        let mut num_batches = 0;
        for batch in source.iter() {
            batch?;
            num_batches += 1;
        }
        Fallible::Ok(num_batches)
    })
    .map(|result| Fallible::Ok(result??))
    .await
}

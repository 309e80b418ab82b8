use crate::common::*;

/// Runs one blocking worker per rank and waits for all of them.
///
/// The job fails if any worker fails or panics. The error of the lowest
/// failing rank is returned with a topology error attached.
pub async fn launch<F, T>(world_size: usize, worker: F) -> Result<Vec<T>>
where
    F: Fn(usize) -> Result<T> + Send + Sync + 'static,
    T: Send + 'static,
{
    if world_size == 0 {
        return Err(SegError::topology("world size must be positive").into());
    }

    let worker = Arc::new(worker);
    let handles = (0..world_size).map(|rank| {
        let worker = worker.clone();
        tokio::task::spawn_blocking(move || worker(rank)).map(move |result| (rank, result))
    });
    let results = future::join_all(handles).await;

    let mut outputs = Vec::with_capacity(world_size);
    let mut first_error = None;
    let mut num_failed = 0;

    for (rank, result) in results {
        let result = match result {
            Ok(result) => result,
            Err(join_error) => Err(format_err!("worker panicked: {}", join_error)),
        };

        match result {
            Ok(output) => outputs.push(output),
            Err(err) => {
                error!("rank {} failed: {:#}", rank, err);
                num_failed += 1;
                if first_error.is_none() {
                    first_error = Some((rank, err));
                }
            }
        }
    }

    match first_error {
        Some((rank, err)) => Err(err.context(SegError::topology(format!(
            "{} of {} workers failed, first at rank {}",
            num_failed, world_size, rank
        )))),
        None => Ok(outputs),
    }
}

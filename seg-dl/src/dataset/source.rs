use super::*;
use crate::{common::*, error::SegError};

/// Produces the batches of one rank's shard, restartable once per epoch.
#[derive(Debug, Clone)]
pub struct ShardedDataSource {
    dataset: Arc<dyn RandomAccessDataset>,
    sampler: ShardSampler,
    batch_size: usize,
    num_workers: usize,
}

impl ShardedDataSource {
    /// Creates a data source.
    ///
    /// * `num_workers` - The number of batches decoded ahead of the consumer.
    ///   Zero decodes each batch on the consumer's thread.
    pub fn new(
        dataset: Arc<dyn RandomAccessDataset>,
        sampler: ShardSampler,
        batch_size: usize,
        num_workers: usize,
    ) -> Result<Self> {
        Self::check_batch_size(dataset.num_records(), batch_size)?;

        Ok(Self {
            dataset,
            sampler,
            batch_size,
            num_workers,
        })
    }

    /// Checks that a partition of `num_records` fills at least one batch.
    pub fn check_batch_size(num_records: usize, batch_size: usize) -> Result<()> {
        if num_records == 0 {
            return Err(SegError::configuration("the partition is empty").into());
        }
        if batch_size == 0 || batch_size > num_records {
            return Err(SegError::configuration(format!(
                "batch size {} is not in range [1, {}]",
                batch_size, num_records
            ))
            .into());
        }
        Ok(())
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Returns a copy with another number of prefetch workers.
    pub fn with_num_workers(&self, num_workers: usize) -> Self {
        Self {
            num_workers,
            ..self.clone()
        }
    }

    pub fn num_batches(&self) -> usize {
        self.sampler.num_batches(self.batch_size)
    }

    /// The record indices of each batch in iteration order.
    pub fn batch_plan(&self) -> Vec<Vec<usize>> {
        self.sampler
            .indices()
            .chunks(self.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect()
    }

    /// Starts a new pass over the shard.
    ///
    /// With prefetch workers and a running tokio runtime, batches are decoded
    /// in background tasks. The order observed by the consumer is the
    /// plan order in both cases.
    pub fn iter(&self) -> Batches {
        if self.num_workers > 0 {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let (tx, rx) = flume::bounded(self.num_workers);
                    let mut stream = Box::pin(self.stream());

                    handle.spawn(async move {
                        while let Some(result) = stream.next().await {
                            let is_err = result.is_err();
                            if tx.send_async(result).await.is_err() || is_err {
                                break;
                            }
                        }
                    });

                    return Batches {
                        kind: BatchesKind::Prefetch(rx.into_iter()),
                    };
                }
                Err(_) => {
                    debug!("no tokio runtime is running, decode batches in place");
                }
            }
        }

        Batches {
            kind: BatchesKind::Inline {
                dataset: self.dataset.clone(),
                plan: self
                    .batch_plan()
                    .into_iter()
                    .enumerate()
                    .collect_vec()
                    .into_iter(),
            },
        }
    }

    /// The stream of batches decoded by up to `num_workers` concurrent
    /// blocking tasks.
    pub fn stream(&self) -> impl Stream<Item = Result<Batch>> + Send + 'static {
        let dataset = self.dataset.clone();
        let num_workers = self.num_workers.max(1);

        stream::iter(self.batch_plan().into_iter().enumerate())
            .map(move |(index, indices)| {
                let dataset = dataset.clone();
                tokio::task::spawn_blocking(move || load_batch(&*dataset, index, &indices))
                    .map(|result| Fallible::Ok(result??))
            })
            .buffered(num_workers)
    }
}

/// The iterator over one pass of a [ShardedDataSource].
pub struct Batches {
    kind: BatchesKind,
}

impl Debug for Batches {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            BatchesKind::Inline { .. } => "inline",
            BatchesKind::Prefetch(_) => "prefetch",
        };
        f.debug_struct("Batches").field("kind", &kind).finish()
    }
}

enum BatchesKind {
    Inline {
        dataset: Arc<dyn RandomAccessDataset>,
        plan: std::vec::IntoIter<(usize, Vec<usize>)>,
    },
    Prefetch(flume::IntoIter<Result<Batch>>),
}

impl Iterator for Batches {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.kind {
            BatchesKind::Inline { dataset, plan } => {
                let (index, indices) = plan.next()?;
                Some(load_batch(&**dataset, index, &indices))
            }
            BatchesKind::Prefetch(rx) => rx.next(),
        }
    }
}

fn load_batch(dataset: &dyn RandomAccessDataset, index: usize, indices: &[usize]) -> Result<Batch> {
    let records: Vec<_> = indices
        .iter()
        .map(|&record_index| dataset.nth(record_index))
        .try_collect()?;
    Batch::from_records(index, records)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records whose pixels carry the record index.
    #[derive(Debug)]
    struct IndexDataset(usize);

    impl RandomAccessDataset for IndexDataset {
        fn num_records(&self) -> usize {
            self.0
        }

        fn nth(&self, index: usize) -> Result<DataRecord> {
            ensure!(index < self.0, "invalid index {}", index);
            Ok(DataRecord {
                image: Tensor::full(&[3, 2, 2], index as f64, (Kind::Float, Device::Cpu)),
                mask: Tensor::zeros(&[3, 2, 2], (Kind::Uint8, Device::Cpu)),
            })
        }
    }

    fn batch_records(batch: &Batch) -> Vec<usize> {
        (0..batch.batch_size() as i64)
            .map(|index| f64::from(batch.images.get(index).mean(Kind::Float)) as usize)
            .collect()
    }

    #[test]
    fn inline_batches_follow_plan() -> Result<()> {
        let dataset: Arc<dyn RandomAccessDataset> = Arc::new(IndexDataset(10));
        let source = ShardedDataSource::new(dataset, ShardSampler::single(10), 4, 0)?;
        assert_eq!(source.num_batches(), 3);

        let batches: Vec<_> = source.iter().try_collect()?;
        let records = batches.iter().map(batch_records).collect_vec();
        assert_eq!(
            records,
            vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7], vec![8, 9]]
        );

        // a second pass yields the same sequence
        let again: Vec<_> = source.iter().try_collect()?;
        assert_eq!(again.iter().map(batch_records).collect_vec(), records);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn prefetch_keeps_order() -> Result<()> {
        let dataset: Arc<dyn RandomAccessDataset> = Arc::new(IndexDataset(23));
        let sampler = ShardSampler::new(23, 1, 2, BatchPolicy::Pad)?;
        let source = ShardedDataSource::new(dataset, sampler, 3, 4)?;

        let records = tokio::task::spawn_blocking(move || -> Result<_> {
            let batches: Vec<_> = source.iter().try_collect()?;
            Ok(batches.iter().flat_map(batch_records).collect_vec())
        })
        .await??;

        // rank 1 owns records 12..23 padded with its first record
        let expect = (12..23).chain(iter::once(12)).collect_vec();
        assert_eq!(records, expect);
        Ok(())
    }

    #[test]
    fn reject_oversized_batch() {
        let dataset: Arc<dyn RandomAccessDataset> = Arc::new(IndexDataset(4));
        let err = ShardedDataSource::new(dataset, ShardSampler::single(4), 5, 0).unwrap_err();
        assert!(matches!(
            SegError::find(&err),
            Some(SegError::Configuration(_))
        ));
    }
}

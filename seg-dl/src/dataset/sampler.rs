use crate::{common::*, error::SegError};

/// How shards of unequal length are brought to a common length so that all
/// ranks iterate the same number of batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchPolicy {
    /// Extend shorter shards cyclically from their own start.
    Pad,
    /// Truncate longer shards.
    Drop,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self::Pad
    }
}

/// Assigns each rank a contiguous, disjoint shard of a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSampler {
    num_records: usize,
    rank: usize,
    world_size: usize,
    policy: BatchPolicy,
}

impl ShardSampler {
    pub fn new(
        num_records: usize,
        rank: usize,
        world_size: usize,
        policy: BatchPolicy,
    ) -> Result<Self> {
        if world_size == 0 || rank >= world_size {
            return Err(SegError::topology(format!(
                "invalid rank {} for world size {}",
                rank, world_size
            ))
            .into());
        }
        if num_records < world_size {
            return Err(SegError::configuration(format!(
                "{} records cannot be sharded among {} ranks",
                num_records, world_size
            ))
            .into());
        }

        Ok(Self {
            num_records,
            rank,
            world_size,
            policy,
        })
    }

    /// The sampler of a single process owning the whole partition.
    pub fn single(num_records: usize) -> Self {
        Self {
            num_records,
            rank: 0,
            world_size: 1,
            policy: BatchPolicy::Pad,
        }
    }

    /// The index range owned by the rank before length equalization.
    ///
    /// The first `N mod W` ranks own one more record than the others.
    pub fn shard_range(&self) -> Range<usize> {
        let Self {
            num_records,
            rank,
            world_size,
            ..
        } = *self;
        let base = num_records / world_size;
        let rem = num_records % world_size;
        let start = rank * base + rank.min(rem);
        let len = base + (rank < rem) as usize;
        start..(start + len)
    }

    /// The number of indices every rank yields per epoch.
    pub fn num_samples(&self) -> usize {
        let Self {
            num_records,
            world_size,
            policy,
            ..
        } = *self;
        match policy {
            BatchPolicy::Pad => (num_records + world_size - 1) / world_size,
            BatchPolicy::Drop => num_records / world_size,
        }
    }

    /// The record indices the rank iterates, in order.
    pub fn indices(&self) -> Vec<usize> {
        let range = self.shard_range();
        range.clone().cycle().take(self.num_samples()).collect()
    }

    /// Number of batches per rank for the batch size.
    pub fn num_batches(&self, batch_size: usize) -> usize {
        (self.num_samples() + batch_size - 1) / batch_size
    }
}

use super::*;
use crate::common::*;

/// The dataset that can be random accessed.
pub trait RandomAccessDataset
where
    Self: Debug + Sync + Send,
{
    /// Get number of records in the dataset.
    fn num_records(&self) -> usize;

    /// Get the nth record in the dataset.
    fn nth(&self, index: usize) -> Result<DataRecord>;
}

impl<D> RandomAccessDataset for Arc<D>
where
    D: RandomAccessDataset + ?Sized,
{
    fn num_records(&self) -> usize {
        (**self).num_records()
    }

    fn nth(&self, index: usize) -> Result<DataRecord> {
        (**self).nth(index)
    }
}

use super::*;
use crate::{common::*, processor::OnDemandLoader};

/// The dataset that decodes image/mask pairs on access.
#[derive(Debug)]
pub struct OnDemandDataset {
    loader: OnDemandLoader,
    pairs: Vec<ImageMaskPair>,
}

impl OnDemandDataset {
    pub fn new(pairs: Vec<ImageMaskPair>, image_size: usize) -> Result<Self> {
        let loader = OnDemandLoader::new(image_size)?;
        Ok(Self { loader, pairs })
    }

    pub fn pairs(&self) -> &[ImageMaskPair] {
        &self.pairs
    }
}

impl RandomAccessDataset for OnDemandDataset {
    fn num_records(&self) -> usize {
        self.pairs.len()
    }

    fn nth(&self, index: usize) -> Result<DataRecord> {
        let ImageMaskPair { image, mask } = self
            .pairs
            .get(index)
            .ok_or_else(|| format_err!("invalid index {}", index))?;
        let (image, mask) = self.loader.load(image, mask).with_context(|| {
            format!(
                "failed to load the pair '{}' and '{}'",
                image.display(),
                mask.display()
            )
        })?;
        Ok(DataRecord { image, mask })
    }
}

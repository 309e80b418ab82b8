use crate::common::*;

/// An image file and the mask file of the same sample.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageMaskPair {
    pub image: PathBuf,
    pub mask: PathBuf,
}

/// A decoded sample.
#[derive(Debug)]
pub struct DataRecord {
    /// Normalized float image in `[3, H, W]` shape.
    pub image: Tensor,
    /// Color-coded uint8 mask in `[3, H, W]` shape.
    pub mask: Tensor,
}

/// A group of decoded samples.
#[derive(Debug)]
pub struct Batch {
    /// Index of the batch within the epoch.
    pub index: usize,
    /// Float images in `[B, 3, H, W]` shape.
    pub images: Tensor,
    /// Color-coded uint8 masks in `[B, 3, H, W]` shape.
    pub masks: Tensor,
}

impl Batch {
    pub fn batch_size(&self) -> usize {
        self.images.size()[0] as usize
    }

    /// Stacks decoded records into a batch.
    pub fn from_records(index: usize, records: Vec<DataRecord>) -> Result<Self> {
        ensure!(!records.is_empty(), "a batch must contain at least one record");
        let (images, masks): (Vec<_>, Vec<_>) = records
            .into_iter()
            .map(|DataRecord { image, mask }| (image, mask))
            .unzip();

        Ok(Self {
            index,
            images: Tensor::f_stack(&images, 0)?,
            masks: Tensor::f_stack(&masks, 0)?,
        })
    }
}

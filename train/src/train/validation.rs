use crate::common::*;

/// The loss and metric statistics of a validation pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationOutput {
    pub loss_sum: f64,
    /// The sum of per-batch mean thresholded IoU.
    pub iou_sum: f64,
    pub num_batches: usize,
}

impl ValidationOutput {
    pub fn mean_loss(&self) -> f64 {
        self.loss_sum / self.num_batches as f64
    }

    pub fn mean_iou(&self) -> f64 {
        self.iou_sum / self.num_batches as f64
    }
}

/// Evaluates the model on every batch of the source without tracking
/// gradients and with normalization layers in evaluation mode.
pub fn run_validation<M>(
    model: &mut M,
    criterion: &CrossEntropyLoss,
    source: &ShardedDataSource,
) -> Result<ValidationOutput>
where
    M: SegmentationModel + ?Sized,
{
    let device = model.device();
    let metric = IouMetric;

    tch::no_grad(|| {
        let mut loss_sum = 0.0;
        let mut iou_sum = 0.0;
        let mut num_batches = 0;

        for batch in source.iter() {
            let batch = batch?;
            let labels = move_to_device(&convert_to_binary(&batch.masks)?, device)?;
            let images = move_to_device(&batch.images, device)?;

            let logits = model.forward_t(&images, false)?;
            let loss = criterion.forward(&logits, &labels)?;
            let iou = metric.forward(&logits, &labels)?;

            loss_sum += loss.double_value(&[]);
            iou_sum += iou.mean_thresholded();
            num_batches += 1;
        }

        ensure!(num_batches > 0, "the validation source yields no batch");
        Ok(ValidationOutput {
            loss_sum,
            iou_sum,
            num_batches,
        })
    })
}

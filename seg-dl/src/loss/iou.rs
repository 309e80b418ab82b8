use crate::{common::*, error::SegError, processor::FOREGROUND_COLOR};

/// The smoothing term added to both sides of the IoU ratio.
pub const IOU_SMOOTH: f64 = 1e-6;

/// Derives the binary ground truth from `[B, 3, H, W]` color-coded masks.
///
/// A pixel is foreground (1) iff its three channels equal the foreground
/// color exactly. It returns a `[B, H, W]` int64 tensor.
pub fn convert_to_binary(masks: &Tensor) -> Result<Tensor> {
    let (_b, channels, _h, _w) = masks.size4()?;
    ensure!(
        channels == 3,
        "expect three-channel masks, but get {} channels",
        channels
    );

    let [red, green, blue] = FOREGROUND_COLOR;
    let binary = masks
        .select(1, 0)
        .eq(red as i64)
        .logical_and(&masks.select(1, 1).eq(green as i64))
        .logical_and(&masks.select(1, 2).eq(blue as i64))
        .to_kind(Kind::Int64);
    Ok(binary)
}

/// Buckets a raw IoU into tenths: `ceil(clamp(20 * (iou - 0.5), 0, 10)) / 10`.
pub fn threshold_iou(iou: f64) -> f64 {
    (20.0 * (iou - 0.5)).clamp(0.0, 10.0).ceil() / 10.0
}

/// The per-sample IoU values of a batch.
#[derive(Debug)]
pub struct IouOutput {
    /// `[B]` raw IoU.
    pub raw: Tensor,
    /// `[B]` thresholded IoU.
    pub thresholded: Tensor,
}

impl IouOutput {
    /// Mean thresholded IoU over the batch.
    pub fn mean_thresholded(&self) -> f64 {
        f64::from(self.thresholded.mean(Kind::Float))
    }

    /// Mean raw IoU over the batch.
    pub fn mean_raw(&self) -> f64 {
        f64::from(self.raw.mean(Kind::Float))
    }
}

/// The thresholded intersection-over-union metric of foreground pixels.
#[derive(Debug, Clone, Default)]
pub struct IouMetric;

impl IouMetric {
    /// Compares logits against the binary ground truth.
    ///
    /// * `logits` - `[B, C, H, W]` class logits. The predicted class is the
    ///   arg-max over `C`, and class 1 is foreground.
    /// * `labels` - `[B, H, W]` binary ground truth.
    pub fn forward(&self, logits: &Tensor, labels: &Tensor) -> Result<IouOutput> {
        let (batch_size, _c, height, width) = logits.size4()?;
        ensure!(
            labels.size3()? == (batch_size, height, width),
            "labels shape {:?} does not match logits shape {:?}",
            labels.size(),
            logits.size()
        );

        tch::no_grad(|| {
            let pred = logits
                .f_argmax(1, false)
                .map_err(SegError::from_tch)?
                .eq(1);
            let labels = labels.eq(1);
            self.forward_masks(&pred, &labels)
        })
    }

    /// Compares two `[B, H, W]` boolean masks.
    pub fn forward_masks(&self, pred: &Tensor, labels: &Tensor) -> Result<IouOutput> {
        let intersection =
            pred.logical_and(labels)
                .sum_dim_intlist(&[1, 2], false, Kind::Float);
        let union = pred
            .logical_or(labels)
            .sum_dim_intlist(&[1, 2], false, Kind::Float);

        let raw = (intersection + IOU_SMOOTH) / (union + IOU_SMOOTH);
        let thresholded = ((&raw - 0.5) * 20.0).clamp(0.0, 10.0).ceil() / 10.0;

        Ok(IouOutput { raw, thresholded })
    }
}

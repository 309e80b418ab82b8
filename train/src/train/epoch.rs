use crate::{common::*, utils::RateCounter};
use std::panic::{self, AssertUnwindSafe};

/// The loss statistics of a training pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochOutput {
    pub loss_sum: f64,
    pub num_batches: usize,
}

impl EpochOutput {
    pub fn mean_loss(&self) -> f64 {
        self.loss_sum / self.num_batches as f64
    }
}

/// Runs one optimization pass over every batch of the source in order.
///
/// Each step zeroes gradients, runs the forward pass, computes the loss
/// against the binary ground truth, back-propagates through the model and
/// steps the optimizer. Only parameters requiring gradients are updated. Any
/// failing batch aborts the pass.
pub fn run_epoch<M>(
    model: &mut M,
    optimizer: &mut nn::Optimizer,
    criterion: &CrossEntropyLoss,
    source: &ShardedDataSource,
) -> Result<EpochOutput>
where
    M: SegmentationModel + ?Sized,
{
    let device = model.device();
    let batch_size = source.batch_size();
    let mut rate_counter = RateCounter::with_second_interval();
    let mut loss_sum = 0.0;
    let mut num_batches = 0;

    for batch in source.iter() {
        let batch = batch?;
        let labels = move_to_device(&convert_to_binary(&batch.masks)?, device)?;
        let images = move_to_device(&batch.images, device)?;

        optimizer.zero_grad();
        let logits = model.forward_t(&images, true)?;
        let loss = criterion.forward(&logits, &labels)?;
        model.backward(&loss)?;
        step_optimizer(optimizer)?;

        loss_sum += loss.double_value(&[]);
        num_batches += 1;

        rate_counter.add(1.0);
        if let Some(batch_rate) = rate_counter.rate() {
            debug!(
                "step: {}\t{:.2} batches/s\t{:.2} records/s",
                batch.index,
                batch_rate,
                batch_rate * batch_size as f64
            );
        }
    }

    ensure!(num_batches > 0, "the training source yields no batch");
    Ok(EpochOutput {
        loss_sum,
        num_batches,
    })
}

/// Steps the optimizer.
///
/// The tch optimizer panics on a libtorch failure. The panic is caught and
/// classified like the errors of fallible tensor ops.
fn step_optimizer(optimizer: &mut nn::Optimizer) -> Result<()> {
    panic::catch_unwind(AssertUnwindSafe(|| optimizer.step())).map_err(|payload| {
        let msg = payload
            .downcast_ref::<String>()
            .cloned()
            .or_else(|| payload.downcast_ref::<&str>().map(|msg| msg.to_string()))
            .unwrap_or_else(|| "the optimizer step panicked".into());
        SegError::from_tch(tch::TchError::Torch(msg))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Random images with masks whose foreground is the brighter half.
    #[derive(Debug)]
    struct SyntheticDataset {
        records: Mutex<Vec<(Tensor, Tensor)>>,
        accessed: Mutex<Vec<usize>>,
    }

    impl SyntheticDataset {
        fn new(len: usize) -> Self {
            let records: Vec<_> = (0..len)
                .map(|_| {
                    let image = Tensor::rand(&[3, 8, 8], (Kind::Float, Device::Cpu));
                    let foreground = image.select(0, 0).gt(0.5).to_kind(Kind::Uint8);
                    let zeros = foreground.zeros_like();
                    let mask = Tensor::stack(&[&foreground * 128, zeros.shallow_clone(), zeros], 0);
                    (image, mask)
                })
                .collect();
            Self {
                records: Mutex::new(records),
                accessed: Mutex::new(vec![]),
            }
        }
    }

    impl RandomAccessDataset for SyntheticDataset {
        fn num_records(&self) -> usize {
            self.records.lock().unwrap().len()
        }

        fn nth(&self, index: usize) -> Result<seg_dl::dataset::DataRecord> {
            self.accessed.lock().unwrap().push(index);
            let records = self.records.lock().unwrap();
            let (image, mask) = &records[index];
            Ok(seg_dl::dataset::DataRecord {
                image: image.shallow_clone(),
                mask: mask.shallow_clone(),
            })
        }
    }

    #[test]
    fn consume_all_batches_and_update_head_only() -> Result<()> {
        tch::manual_seed(0);
        let dataset = Arc::new(SyntheticDataset::new(6));
        let source = ShardedDataSource::new(dataset.clone(), ShardSampler::single(6), 4, 0)?;

        let mut model = ConvSegmenter::new(Device::Cpu, 4);
        freeze_except(model.var_store(), "classifier")?;
        let frozen = model
            .var_store()
            .variables()
            .into_iter()
            .filter(|(name, _)| name.starts_with("backbone"))
            .map(|(name, tensor)| (name, tensor.copy()))
            .collect_vec();
        let head_before = model.var_store().variables()["classifier.weight"].copy();

        let mut optimizer = nn::Adam::default().build(model.var_store(), 1e-2)?;
        let output = run_epoch(&mut model, &mut optimizer, &CrossEntropyLoss::default(), &source)?;

        assert_eq!(output.num_batches, 2);
        assert!(output.mean_loss() > 0.0);
        assert_eq!(*dataset.accessed.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);

        let variables = model.var_store().variables();
        for (name, before) in frozen {
            // running statistics of batch norm change in train mode
            if name.contains("running") {
                continue;
            }
            assert!(before.equal(&variables[&name]), "{} changed", name);
        }
        assert!(!head_before.equal(&variables["classifier.weight"]));
        Ok(())
    }
}

use crate::{common::*, error::SegError};

/// The number of output classes, background and foreground.
pub const NUM_CLASSES: i64 = 2;

/// A segmentation network producing per-pixel class logits.
///
/// The parameters live in a [nn::VarStore]. An optimizer built on that store
/// only updates parameters that require gradients.
pub trait SegmentationModel
where
    Self: Send,
{
    /// Maps `[B, 3, H, W]` images to `[B, 2, H, W]` logits.
    ///
    /// `train` selects training behavior of normalization layers.
    fn forward_t(&mut self, input: &Tensor, train: bool) -> Result<Tensor>;

    fn var_store(&self) -> &nn::VarStore;

    fn var_store_mut(&mut self) -> &mut nn::VarStore;

    fn device(&self) -> Device {
        self.var_store().device()
    }

    /// Back-propagates the loss.
    ///
    /// When this returns, the gradients of trainable parameters are the ones
    /// the optimizer step must apply.
    fn backward(&mut self, loss: &Tensor) -> Result<()> {
        loss.f_backward().map_err(SegError::from_tch)
    }
}

/// Copies a tensor to the device, returning allocation failures as errors.
///
/// The copy keeps the autograd history, so gradients flow back to the
/// source tensor.
pub fn move_to_device(tensor: &Tensor, device: Device) -> Result<Tensor> {
    if tensor.device() == device {
        return Ok(tensor.shallow_clone());
    }
    let mut output =
        Tensor::f_empty(&tensor.size(), (tensor.kind(), device)).map_err(SegError::from_tch)?;
    output.f_copy_(tensor).map_err(SegError::from_tch)?;
    Ok(output)
}

impl<M> SegmentationModel for Box<M>
where
    M: SegmentationModel + ?Sized,
{
    fn forward_t(&mut self, input: &Tensor, train: bool) -> Result<Tensor> {
        (**self).forward_t(input, train)
    }

    fn var_store(&self) -> &nn::VarStore {
        (**self).var_store()
    }

    fn var_store_mut(&mut self) -> &mut nn::VarStore {
        (**self).var_store_mut()
    }

    fn device(&self) -> Device {
        (**self).device()
    }

    fn backward(&mut self, loss: &Tensor) -> Result<()> {
        (**self).backward(loss)
    }
}

/// Lists the parameters requiring gradients, sorted by name.
pub fn trainable_parameters(vs: &nn::VarStore) -> Vec<(String, Tensor)> {
    vs.variables()
        .into_iter()
        .filter(|(_, tensor)| tensor.requires_grad())
        .sorted_by(|(lhs, _), (rhs, _)| lhs.cmp(rhs))
        .collect()
}

/// Freezes all parameters except those under the prefix.
///
/// Dots and underscores are treated alike when matching, so `classifier.4`
/// matches the TorchScript parameter `classifier_4_weight`. It returns the
/// number of trainable parameters left.
pub fn freeze_except(vs: &nn::VarStore, prefix: &str) -> Result<usize> {
    let prefix = prefix.replace('.', "_");
    let mut num_trainable = 0;

    for (name, tensor) in vs.variables() {
        let name = name.replace('.', "_");
        let matched = name == prefix || name.starts_with(&format!("{}_", prefix));

        // buffers such as running statistics stay frozen
        if matched && tensor.requires_grad() {
            num_trainable += 1;
        } else {
            let _ = tensor.set_requires_grad(false);
        }
    }

    if num_trainable == 0 {
        return Err(SegError::configuration(format!(
            "no parameter matches the trainable prefix '{}'",
            prefix
        ))
        .into());
    }

    Ok(num_trainable)
}

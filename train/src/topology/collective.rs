use crate::common::*;

/// Collective communication among the ranks of a process group.
///
/// Every rank must issue the same sequence of calls with buffers of equal
/// length. A rank that stops calling stalls its peers until the peer's
/// connection closes or the timeout expires.
pub trait Collective
where
    Self: Send,
{
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Replaces `values` on every rank by the element-wise sum over ranks.
    fn all_reduce_sum(&mut self, values: &mut [f32]) -> Result<()>;

    /// Replaces `values` on every rank by the values of rank 0.
    fn broadcast(&mut self, values: &mut [f32]) -> Result<()>;

    /// Blocks until all ranks arrive.
    fn barrier(&mut self) -> Result<()> {
        self.all_reduce_sum(&mut [])
    }

    /// Averages tensors element-wise over ranks in place.
    ///
    /// The tensors are staged through host memory as one flat buffer.
    fn all_reduce_mean(&mut self, tensors: &[Tensor]) -> Result<()> {
        let world_size = self.world_size();
        if world_size == 1 {
            return Ok(());
        }
        let mut buffer = flatten(tensors);
        self.all_reduce_sum(&mut buffer)?;
        buffer.iter_mut().for_each(|value| *value /= world_size as f32);
        unflatten(&buffer, tensors)
    }

    /// Copies the values of rank 0 into the tensors of every rank.
    fn broadcast_tensors(&mut self, tensors: &[Tensor]) -> Result<()> {
        if self.world_size() == 1 {
            return Ok(());
        }
        let mut buffer = flatten(tensors);
        self.broadcast(&mut buffer)?;
        unflatten(&buffer, tensors)
    }
}

/// The collective of a process running alone.
#[derive(Debug, Clone, Default)]
pub struct NoopCollective;

impl Collective for NoopCollective {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&mut self, _values: &mut [f32]) -> Result<()> {
        Ok(())
    }

    fn broadcast(&mut self, _values: &mut [f32]) -> Result<()> {
        Ok(())
    }
}

fn flatten(tensors: &[Tensor]) -> Vec<f32> {
    tch::no_grad(|| {
        tensors
            .iter()
            .flat_map(|tensor| {
                let flat = tensor
                    .to_device(Device::Cpu)
                    .to_kind(Kind::Float)
                    .reshape(&[-1]);
                Vec::<f32>::from(&flat)
            })
            .collect()
    })
}

fn unflatten(buffer: &[f32], tensors: &[Tensor]) -> Result<()> {
    let total: usize = tensors.iter().map(|tensor| tensor.numel()).sum();
    ensure!(
        total == buffer.len(),
        "expect {} values, but get {}",
        total,
        buffer.len()
    );

    tch::no_grad(|| {
        let mut offset = 0;
        for tensor in tensors {
            let numel = tensor.numel();
            let values = Tensor::of_slice(&buffer[offset..(offset + numel)])
                .view(tensor.size().as_slice())
                .to_device(tensor.device())
                .to_kind(tensor.kind());
            tensor.shallow_clone().f_copy_(&values)?;
            offset += numel;
        }
        Ok(())
    })
}

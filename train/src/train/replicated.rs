use crate::{common::*, topology::ProcessGroup};

/// A model replica of a distributed job.
///
/// On creation every parameter is overwritten by the values of rank 0. After
/// each backward pass the gradients of trainable parameters are averaged over
/// ranks before the optimizer reads them. With a single-process group it
/// behaves exactly like the wrapped model.
pub struct Replicated<M>
where
    M: SegmentationModel,
{
    model: M,
    group: ProcessGroup,
    params: Vec<Tensor>,
}

impl<M> Replicated<M>
where
    M: SegmentationModel,
{
    pub fn new(model: M, mut group: ProcessGroup) -> Result<Self> {
        let variables = model
            .var_store()
            .variables()
            .into_iter()
            .sorted_by(|(lhs, _), (rhs, _)| lhs.cmp(rhs))
            .map(|(_, tensor)| tensor)
            .collect_vec();
        group
            .collective()
            .broadcast_tensors(&variables)
            .context("failed to broadcast initial parameters")?;

        let params = trainable_parameters(model.var_store())
            .into_iter()
            .map(|(_, tensor)| tensor)
            .collect();

        Ok(Self {
            model,
            group,
            params,
        })
    }

    pub fn group_mut(&mut self) -> &mut ProcessGroup {
        &mut self.group
    }

    pub fn into_parts(self) -> (M, ProcessGroup) {
        (self.model, self.group)
    }
}

impl<M> SegmentationModel for Replicated<M>
where
    M: SegmentationModel,
{
    fn forward_t(&mut self, input: &Tensor, train: bool) -> Result<Tensor> {
        self.model.forward_t(input, train)
    }

    fn var_store(&self) -> &nn::VarStore {
        self.model.var_store()
    }

    fn var_store_mut(&mut self) -> &mut nn::VarStore {
        self.model.var_store_mut()
    }

    fn device(&self) -> Device {
        self.model.device()
    }

    fn backward(&mut self, loss: &Tensor) -> Result<()> {
        self.model.backward(loss)?;

        if self.group.world_size() > 1 {
            // parameters left out of the graph have no gradient on any rank
            let grads = self
                .params
                .iter()
                .map(|param| param.grad())
                .filter(|grad| grad.defined())
                .collect_vec();
            self.group
                .collective()
                .all_reduce_mean(&grads)
                .context("failed to average gradients")?;
        }

        Ok(())
    }
}

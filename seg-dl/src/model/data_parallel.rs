use super::model::{move_to_device, trainable_parameters, SegmentationModel};
use crate::{common::*, error::SegError};

/// Single-process data parallelism over model replicas on several devices.
///
/// The first replica is the master. The optimizer is built on its store.
/// Each forward pass copies master weights to the other replicas, scatters
/// the batch along the first dimension and gathers the outputs on the master
/// device. The backward pass sums replica gradients into the master.
pub struct DataParallel<M>
where
    M: SegmentationModel,
{
    replicas: Vec<M>,
}

impl<M> DataParallel<M>
where
    M: SegmentationModel,
{
    pub fn new(replicas: Vec<M>) -> Result<Self> {
        if replicas.is_empty() {
            return Err(SegError::configuration("data parallel needs at least one replica").into());
        }
        let mut model = Self { replicas };
        model.sync_weights()?;
        Ok(model)
    }

    pub fn num_replicas(&self) -> usize {
        self.replicas.len()
    }

    pub fn devices(&self) -> Vec<Device> {
        self.replicas.iter().map(|replica| replica.device()).collect()
    }

    fn sync_weights(&mut self) -> Result<()> {
        let (master, others) = match self.replicas.split_first_mut() {
            Some(split) => split,
            None => return Ok(()),
        };
        for replica in others {
            replica
                .var_store_mut()
                .copy(master.var_store())
                .map_err(SegError::from_tch)?;
        }
        Ok(())
    }

    fn gather_gradients(&mut self) -> Result<()> {
        let (master, others) = match self.replicas.split_first() {
            Some(split) => split,
            None => return Ok(()),
        };
        let master_params = trainable_parameters(master.var_store());

        for replica in others {
            let params = trainable_parameters(replica.var_store());
            ensure!(
                params.len() == master_params.len(),
                "replicas have different trainable parameters"
            );

            for ((name, master_param), (_, param)) in izip!(&master_params, &params) {
                let mut grad = param.grad();
                if !grad.defined() {
                    continue;
                }
                let mut master_grad = master_param.grad();
                ensure!(
                    master_grad.defined(),
                    "the master has no gradient for '{}'",
                    name
                );
                let grad_on_master = move_to_device(&grad, master_grad.device())?;
                master_grad
                    .f_add_(&grad_on_master)
                    .map_err(SegError::from_tch)?;
                let _ = grad.zero_();
            }
        }
        Ok(())
    }
}

impl<M> SegmentationModel for DataParallel<M>
where
    M: SegmentationModel,
{
    fn forward_t(&mut self, input: &Tensor, train: bool) -> Result<Tensor> {
        self.sync_weights()?;

        let master_device = self.device();
        let chunks = input.chunk(self.replicas.len() as i64, 0);
        let outputs: Vec<_> = izip!(&mut self.replicas, chunks)
            .map(|(replica, chunk)| -> Result<_> {
                let chunk = move_to_device(&chunk, replica.device())?;
                let output = replica.forward_t(&chunk, train)?;
                move_to_device(&output, master_device)
            })
            .collect::<Result<_>>()?;

        Tensor::f_cat(&outputs, 0).map_err(SegError::from_tch)
    }

    fn var_store(&self) -> &nn::VarStore {
        self.replicas[0].var_store()
    }

    fn var_store_mut(&mut self) -> &mut nn::VarStore {
        self.replicas[0].var_store_mut()
    }

    fn backward(&mut self, loss: &Tensor) -> Result<()> {
        loss.f_backward().map_err(SegError::from_tch)?;
        self.gather_gradients()
    }
}

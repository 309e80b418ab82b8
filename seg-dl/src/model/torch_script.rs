use super::model::SegmentationModel;
use crate::{common::*, error::SegError};
use tch::TrainableCModule;

/// A pretrained segmentation network exported as TorchScript.
///
/// The module returns either a tensor or a dictionary whose `"out"` entry holds
/// the `[B, 2, H, W]` logits.
pub struct TorchScriptModel {
    vs: nn::VarStore,
    module: TrainableCModule,
}

impl TorchScriptModel {
    pub fn load(path: impl AsRef<Path>, device: Device) -> Result<Self> {
        let path = path.as_ref();
        let vs = nn::VarStore::new(device);
        let module = TrainableCModule::load(path, vs.root())
            .map_err(SegError::from_tch)
            .with_context(|| format!("failed to load TorchScript model '{}'", path.display()))?;
        Ok(Self { vs, module })
    }
}

impl SegmentationModel for TorchScriptModel {
    fn forward_t(&mut self, input: &Tensor, train: bool) -> Result<Tensor> {
        if train {
            self.module.set_train();
        } else {
            self.module.set_eval();
        }

        let output = self
            .module
            .forward_is(&[IValue::Tensor(input.shallow_clone())])
            .map_err(SegError::from_tch)?;
        extract_logits(output)
    }

    fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }
}

fn extract_logits(output: IValue) -> Result<Tensor> {
    match output {
        IValue::Tensor(tensor) => Ok(tensor),
        IValue::GenericDict(entries) => entries
            .into_iter()
            .find_map(|(key, value)| match (key, value) {
                (IValue::String(key), IValue::Tensor(value)) if key == "out" => Some(value),
                _ => None,
            })
            .ok_or_else(|| format_err!("the model output has no 'out' tensor")),
        _ => bail!("the model output is neither a tensor nor a dictionary"),
    }
}

//! Model construction.

use crate::{
    common::*,
    config::{Config, ModelConfig, ParallelConfig},
};

/// Builds the model of the job on the device.
///
/// In data parallel mode one replica is built per configured device and the
/// device argument is ignored.
pub fn build_model(config: &Config, device: Device) -> Result<Box<dyn SegmentationModel>> {
    match &config.training.parallel {
        ParallelConfig::DataParallel { devices } => {
            let replicas: Vec<_> = devices
                .iter()
                .map(|&device| build_single_model(&config.model, device))
                .try_collect()?;
            let model = DataParallel::new(replicas)?;
            info!(
                "use data parallel with {} replicas on devices {:?}",
                model.num_replicas(),
                model.devices()
            );
            Ok(Box::new(model))
        }
        _ => build_single_model(&config.model, device),
    }
}

fn build_single_model(config: &ModelConfig, device: Device) -> Result<Box<dyn SegmentationModel>> {
    let model: Box<dyn SegmentationModel> = match config {
        ModelConfig::TorchScript { file, .. } => Box::new(TorchScriptModel::load(file, device)?),
        ModelConfig::Conv {
            hidden_channels, ..
        } => Box::new(ConvSegmenter::new(device, *hidden_channels)),
    };

    match config.trainable_prefix() {
        Some(prefix) => {
            let num_trainable = freeze_except(model.var_store(), prefix)?;
            debug!(
                "{} parameters under '{}' are trainable",
                num_trainable, prefix
            );
        }
        None => debug!("all parameters are trainable"),
    }

    Ok(model)
}

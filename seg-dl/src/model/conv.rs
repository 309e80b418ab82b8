use super::model::{SegmentationModel, NUM_CLASSES};
use crate::{common::*, error::SegError};

/// A small fully convolutional segmenter.
///
/// Parameters live under `backbone` and `classifier`, so the head can be
/// trained alone with the `classifier` prefix. Every layer runs through the
/// fallible tensor ops, so an allocation failure is returned as an error.
pub struct ConvSegmenter {
    vs: nn::VarStore,
    conv1: Conv,
    bn1: BatchNorm,
    conv2: Conv,
    bn2: BatchNorm,
    classifier: Conv,
}

impl ConvSegmenter {
    pub fn new(device: Device, hidden_channels: usize) -> Self {
        let vs = nn::VarStore::new(device);
        let root = vs.root();
        let backbone = &root / "backbone";
        let hidden = hidden_channels as i64;

        let conv1 = Conv::new(&backbone / "conv1", 3, hidden, 3, false);
        let bn1 = BatchNorm::new(&backbone / "bn1", hidden);
        let conv2 = Conv::new(&backbone / "conv2", hidden, hidden, 3, false);
        let bn2 = BatchNorm::new(&backbone / "bn2", hidden);
        let classifier = Conv::new(&root / "classifier", hidden, NUM_CLASSES, 1, true);

        Self {
            vs,
            conv1,
            bn1,
            conv2,
            bn2,
            classifier,
        }
    }

    fn forward_layers(&self, input: &Tensor, train: bool) -> Result<Tensor, TchError> {
        let xs = self.conv1.forward(input)?;
        let xs = self.bn1.forward_t(&xs, train)?.f_relu()?;
        let xs = self.conv2.forward(&xs)?;
        let xs = self.bn2.forward_t(&xs, train)?.f_relu()?;
        self.classifier.forward(&xs)
    }
}

impl SegmentationModel for ConvSegmenter {
    fn forward_t(&mut self, input: &Tensor, train: bool) -> Result<Tensor> {
        ensure!(
            input.dim() == 4 && input.size()[1] == 3,
            "expect [batch, 3, height, width] input, but get {:?}",
            input.size()
        );
        self.forward_layers(input, train).map_err(SegError::from_tch)
    }

    fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }
}

/// A stride 1 convolution padded to keep the spatial size.
struct Conv {
    ws: Tensor,
    bs: Option<Tensor>,
    padding: i64,
}

impl Conv {
    fn new(path: nn::Path, in_channels: i64, out_channels: i64, ksize: i64, bias: bool) -> Self {
        let ws = path.kaiming_uniform("weight", &[out_channels, in_channels, ksize, ksize]);
        let bs = bias.then(|| {
            let bound = 1.0 / ((in_channels * ksize * ksize) as f64).sqrt();
            path.uniform("bias", &[out_channels], -bound, bound)
        });
        Self {
            ws,
            bs,
            padding: ksize / 2,
        }
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor, TchError> {
        input.f_conv2d(
            &self.ws,
            self.bs.as_ref(),
            &[1, 1],
            &[self.padding, self.padding],
            &[1, 1],
            1,
        )
    }
}

struct BatchNorm {
    ws: Tensor,
    bs: Tensor,
    running_mean: Tensor,
    running_var: Tensor,
}

impl BatchNorm {
    const MOMENTUM: f64 = 0.1;
    const EPS: f64 = 1e-5;

    fn new(path: nn::Path, channels: i64) -> Self {
        Self {
            ws: path.ones("weight", &[channels]),
            bs: path.zeros("bias", &[channels]),
            running_mean: path.zeros_no_train("running_mean", &[channels]),
            running_var: path.ones_no_train("running_var", &[channels]),
        }
    }

    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor, TchError> {
        input.f_batch_norm(
            Some(&self.ws),
            Some(&self.bs),
            Some(&self.running_mean),
            Some(&self.running_var),
            train,
            Self::MOMENTUM,
            Self::EPS,
            true,
        )
    }
}

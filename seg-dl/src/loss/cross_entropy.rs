use crate::{common::*, error::SegError};

/// Per-pixel cross-entropy between class logits and a dense class map.
#[derive(Debug)]
pub struct CrossEntropyLoss {
    reduction: Reduction,
}

impl CrossEntropyLoss {
    pub fn new(reduction: Reduction) -> Self {
        Self { reduction }
    }

    /// Computes the loss.
    ///
    /// * `input` - `[B, C, H, W]` logits.
    /// * `target` - `[B, H, W]` int64 class indices in `[0, C)`.
    pub fn forward(&self, input: &Tensor, target: &Tensor) -> Result<Tensor> {
        let (batch_size, num_classes, height, width) = input.size4()?;
        ensure!(
            target.size3()? == (batch_size, height, width) && target.kind() == Kind::Int64,
            "expect target a [{}, {}, {}] int64 tensor, but get {:?} {:?}",
            batch_size,
            height,
            width,
            target.kind(),
            target.size()
        );
        debug_assert!(
            bool::from(target.ge(0).all()) && bool::from(target.lt(num_classes).all()),
            "target values must be in range of [0, {})",
            num_classes
        );

        let loss = match self.reduction {
            Reduction::None => pixel_loss(input, target, num_classes)
                .and_then(|loss| loss.f_view([batch_size, height, width])),
            Reduction::Sum => {
                pixel_loss(input, target, num_classes).and_then(|loss| loss.f_sum(Kind::Float))
            }
            Reduction::Mean => {
                pixel_loss(input, target, num_classes).and_then(|loss| loss.f_mean(Kind::Float))
            }
            Reduction::Other(_) => bail!("unsupported reduction"),
        };
        loss.map_err(SegError::from_tch)
    }
}

/// The unreduced loss of each of the `B * H * W` pixels.
fn pixel_loss(input: &Tensor, target: &Tensor, num_classes: i64) -> Result<Tensor, TchError> {
    // flatten pixels to [B * H * W, C] rows
    let logits = input.f_permute(&[0, 2, 3, 1])?.f_reshape(&[-1, num_classes])?;
    let target = target.f_reshape(&[-1])?;

    logits
        .f_log_softmax(-1, Kind::Float)?
        .f_nll_loss::<Tensor>(&target, None, Reduction::None, -100)
}

impl Default for CrossEntropyLoss {
    fn default() -> Self {
        Self::new(Reduction::Mean)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_logits() -> Result<()> {
        let input = Tensor::zeros(&[2, 2, 3, 3], (Kind::Float, Device::Cpu));
        let target = Tensor::randint(2, &[2, 3, 3], (Kind::Int64, Device::Cpu));
        let loss = CrossEntropyLoss::default().forward(&input, &target)?;
        assert_abs_diff_eq!(f64::from(&loss), 2f64.ln(), epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn cross_entropy_loss_converges() -> Result<()> {
        let device = Device::Cpu;
        let vs = nn::VarStore::new(device);
        let root = vs.root();
        let loss_fn = CrossEntropyLoss::default();

        let input = root.randn("input", &[4, 2, 5, 5], 0.0, 1.0);
        let target = Tensor::randint(2, &[4, 5, 5], (Kind::Int64, device));
        let mut optimizer = nn::Adam::default().build(&vs, 0.1)?;

        for _ in 0..200 {
            let loss = loss_fn.forward(&input, &target)?;
            optimizer.backward_step(&loss);
        }

        let accuracy = f64::from(
            input
                .argmax(1, false)
                .eq_tensor(&target)
                .to_kind(Kind::Float)
                .mean(Kind::Float),
        );
        ensure!(accuracy >= 0.99, "the loss does not converge");
        Ok(())
    }

    #[test]
    fn reject_shape_mismatch() {
        let input = Tensor::zeros(&[2, 2, 3, 3], (Kind::Float, Device::Cpu));
        let target = Tensor::zeros(&[2, 4, 4], (Kind::Int64, Device::Cpu));
        assert!(CrossEntropyLoss::default().forward(&input, &target).is_err());
    }
}

//! The on-demand image and mask decoder.

use crate::{common::*, error::SegError};

/// Per-channel ImageNet mean.
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// Per-channel ImageNet standard deviation.
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];
/// The color of foreground pixels in color-coded masks.
pub const FOREGROUND_COLOR: [u8; 3] = [128, 0, 0];
/// The trimap value of background pixels.
pub const TRIMAP_BACKGROUND: u8 = 2;

/// Decodes, resizes and normalizes image/mask pairs.
#[derive(Debug, Clone)]
pub struct OnDemandLoader {
    image_size: usize,
}

impl OnDemandLoader {
    /// Build a new loader.
    ///
    /// * `image_size` - The side length of output images and masks in pixels.
    pub fn new(image_size: usize) -> Result<Self> {
        if image_size == 0 {
            return Err(SegError::configuration("image_size must be positive").into());
        }
        Ok(Self { image_size })
    }

    /// Load an image and its mask.
    ///
    /// It returns a normalized `[3, H, W]` float image and a `[3, H, W]`
    /// uint8 color-coded mask.
    pub fn load(
        &self,
        image_path: impl AsRef<Path>,
        mask_path: impl AsRef<Path>,
    ) -> Result<(Tensor, Tensor)> {
        let image_path = image_path.as_ref();
        let mask_path = mask_path.as_ref();

        tch::no_grad(|| {
            let image = self.load_resized(image_path)?;
            let mask = self.load_resized(mask_path)?;
            Ok((normalize(&image), recolor_trimap(&mask)))
        })
    }

    fn load_resized(&self, path: &Path) -> Result<Tensor> {
        let size = self.image_size as i64;
        let decode = || -> Result<Tensor, TchError> {
            let image = vision::image::load(path)?;
            vision::image::resize(&image, size, size)
        };
        let image = decode().map_err(|err| {
            SegError::data_integrity(format!(
                "could not read image '{}': {}",
                path.display(),
                err
            ))
        })?;

        match image.size().as_slice() {
            &[3, h, w] if h == size && w == size => Ok(image),
            shape => Err(SegError::data_integrity(format!(
                "unexpected shape {:?} of decoded image '{}'",
                shape,
                path.display()
            ))
            .into()),
        }
    }
}

/// Scales a uint8 `[.., 3, H, W]` image to [0, 1] and normalizes it with
/// ImageNet statistics.
pub fn normalize(image: &Tensor) -> Tensor {
    let device = image.device();
    let mean = Tensor::of_slice(&IMAGENET_MEAN)
        .view([3, 1, 1])
        .to_device(device);
    let std = Tensor::of_slice(&IMAGENET_STD)
        .view([3, 1, 1])
        .to_device(device);
    (image.to_kind(Kind::Float) / 255.0 - mean) / std
}

/// The inverse of [normalize], producing float values in [0, 1].
pub fn denormalize(image: &Tensor) -> Tensor {
    let device = image.device();
    let mean = Tensor::of_slice(&IMAGENET_MEAN)
        .view([3, 1, 1])
        .to_device(device);
    let std = Tensor::of_slice(&IMAGENET_STD)
        .view([3, 1, 1])
        .to_device(device);
    image * std + mean
}

/// Converts a `[3, H, W]` trimap to a color-coded mask.
///
/// Pixels with all channels equal to the background value become black, all
/// other pixels take the foreground color.
pub fn recolor_trimap(trimap: &Tensor) -> Tensor {
    let background = trimap.eq(TRIMAP_BACKGROUND as i64).all_dim(0, true);
    let foreground = background.logical_not().to_kind(Kind::Uint8);
    let color = Tensor::of_slice(&FOREGROUND_COLOR)
        .view([3, 1, 1])
        .to_device(trimap.device());
    foreground * color
}

//! Loss functions and quality metrics.

mod cross_entropy;
mod iou;

pub use cross_entropy::*;
pub use iou::*;

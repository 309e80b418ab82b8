//! Segmentation model adaptors.

mod conv;
mod data_parallel;
mod model;
mod torch_script;

pub use conv::*;
pub use data_parallel::*;
pub use model::*;
pub use torch_script::*;

//! The building blocks of binary segmentation fine-tuning.

mod common;
pub mod dataset;
pub mod error;
pub mod loss;
pub mod model;
pub mod processor;

pub use error::SegError;

//! Dataset processing toolkit.

mod dataset;
mod on_demand;
mod partition;
mod record;
mod sampler;
mod source;

pub use dataset::*;
pub use on_demand::*;
pub use partition::*;
pub use record::*;
pub use sampler::*;
pub use source::*;

//! Data processing building blocks.

mod on_demand;

pub use on_demand::*;

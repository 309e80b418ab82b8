//! Process topology, collective communication and worker launching.

mod collective;
mod group;
mod launch;
mod tcp;

pub use collective::*;
pub use group::*;
pub use launch::*;
pub use tcp::*;

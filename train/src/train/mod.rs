//! The training and validation engines.

mod epoch;
mod replicated;
mod validation;
mod worker;

pub use epoch::*;
pub use replicated::*;
pub use validation::*;
pub use worker::*;

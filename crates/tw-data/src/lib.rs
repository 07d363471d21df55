//! Static reward baselines and the checkpoint store.

pub mod baselines;
pub mod checkpoint;

pub use baselines::*;
pub use checkpoint::*;

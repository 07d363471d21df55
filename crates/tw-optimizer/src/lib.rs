//! # tw-optimizer
//!
//! The study side of a Tunewell search: search space definitions and the
//! trial-seeded random sampler, pruning rules, and study bookkeeping over
//! in-process or shared-journal storage.

mod pruner;
mod search;
mod storage;
mod study;

pub use pruner::{NopPruner, PercentilePruner, Pruner, PrunerConfig, ThresholdPruner};
pub use search::{ParameterDef, ParameterKind, RandomSampler, Sampler, SearchSpace};
pub use storage::{InMemoryStorage, JournalFileStorage, StudyStorage};
pub use study::{Study, StudyConfig, StudyMode, StudySummary};

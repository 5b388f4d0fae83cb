//! # tb-engine
//!
//! Multi-round tree-bunch search for TreeBunch.
//!
//! Each round generates candidate starting trees (from the alignment, or from
//! every tree of the previous round's best bunch), refines and scores them
//! through external jobs, ranks the survivors by likelihood and persists the
//! top-K as the best bunch that seeds the next round.

pub mod coordinator;
pub mod log;
pub mod persister;
pub mod ranker;

pub use coordinator::IterationCoordinator;
pub use log::{FileLog, ProgressLog, Tee, TracingLog};
pub use persister::BestSetPersister;
pub use ranker::ResultRanker;

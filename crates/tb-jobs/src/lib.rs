//! # tb-jobs
//!
//! External collaborators of the TreeBunch iteration engine: the candidate
//! job runner boundary (with a process-backed implementation for the
//! parsimony / RAxML programs), score extraction from info streams, and
//! tree bundle splitting.

mod runner;
mod score;
mod splitter;

pub use runner::{CandidateJobRunner, JobKind, JobOptions, JobOutput, ProcessJobRunner};
pub use score::{parse_score, ScoreMarker};
pub use splitter::{newick_statements, NewickSplitter, TreeSetSplitter};

//! Candidate starting trees and their evaluation results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::round::UpdateId;

/// Identity of a candidate within its round.
///
/// The rendered name encodes round, parent and seed so that the working
/// files of two candidates never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CandidateId {
    pub update_id: UpdateId,
    /// Creation order within the round; the ranking tie-breaker.
    pub index: usize,
    /// Index of the previous-round tree this candidate derives from.
    pub parent: Option<usize>,
    pub seed: u64,
}

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.parent {
            Some(parent) => write!(
                f,
                "u{}_p{}_c{}_s{}",
                self.update_id, parent, self.index, self.seed
            ),
            None => write!(f, "u{}_c{}_s{}", self.update_id, self.index, self.seed),
        }
    }
}

/// Deterministic seed derivation for candidate generation.
///
/// `seed = base + update_id * round_size + index`, which is unique for every
/// candidate of a round and does not repeat across rounds of equal size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedPolicy {
    pub base: u64,
}

impl SeedPolicy {
    pub fn new(base: u64) -> Self {
        Self { base }
    }

    pub fn seed_for(&self, update_id: UpdateId, round_size: usize, index: usize) -> u64 {
        self.base + u64::from(update_id) * round_size as u64 + index as u64
    }
}

impl Default for SeedPolicy {
    fn default() -> Self {
        Self { base: 123 }
    }
}

/// One starting topology produced by the generation phase. Never mutated
/// after its tree file has been written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateTree {
    pub id: CandidateId,
    /// Previous-round tree this candidate was grown from (warm-start only).
    pub parent_tree: Option<PathBuf>,
    pub tree_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl CandidateTree {
    pub fn new(id: CandidateId, parent_tree: Option<PathBuf>, tree_path: PathBuf) -> Self {
        Self {
            id,
            parent_tree,
            tree_path,
            created_at: Utc::now(),
        }
    }

    pub fn name(&self) -> String {
        self.id.to_string()
    }
}

/// Where an evaluation came from, kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub search_job: String,
    pub score_job: String,
    pub search_output: PathBuf,
    pub score_info: PathBuf,
}

/// Result of running the evaluation pipeline on one candidate.
///
/// Created once; a repeated evaluation gets a fresh `evaluation_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatedCandidate {
    pub evaluation_id: Uuid,
    pub candidate: CandidateTree,
    pub refined_tree: PathBuf,
    pub lh: f64,
    pub provenance: Provenance,
    pub evaluated_at: DateTime<Utc>,
}

impl EvaluatedCandidate {
    pub fn new(
        candidate: CandidateTree,
        refined_tree: PathBuf,
        lh: f64,
        provenance: Provenance,
    ) -> Self {
        Self {
            evaluation_id: Uuid::new_v4(),
            candidate,
            refined_tree,
            lh,
            provenance,
            evaluated_at: Utc::now(),
        }
    }

    pub fn creation_index(&self) -> usize {
        self.candidate.id.index
    }
}

/// A candidate whose evaluation failed; recorded, not fatal to the round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateFailure {
    pub candidate: CandidateId,
    pub stage: String,
    pub message: String,
}

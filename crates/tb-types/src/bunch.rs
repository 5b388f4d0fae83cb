//! Rankings and persisted best bunches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::candidate::{CandidateFailure, EvaluatedCandidate};
use crate::round::UpdateId;

/// Evaluated candidates of one round, best likelihood first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ranking {
    pub update_id: UpdateId,
    pub entries: Vec<EvaluatedCandidate>,
}

impl Ranking {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The rank-0 entry.
    pub fn best(&self) -> Option<&EvaluatedCandidate> {
        self.entries.first()
    }

    pub fn top(&self, k: usize) -> &[EvaluatedCandidate] {
        &self.entries[..k.min(self.entries.len())]
    }

    pub fn likelihoods(&self) -> Vec<f64> {
        self.entries.iter().map(|e| e.lh).collect()
    }
}

/// Where a bunch lives on disk. The marker is written last.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BunchPaths {
    pub bundle: PathBuf,
    pub manifest: PathBuf,
    pub marker: PathBuf,
}

impl BunchPaths {
    pub fn for_bundle(bundle: impl Into<PathBuf>) -> Self {
        let bundle = bundle.into();
        let name = bundle
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("bunch")
            .to_string();
        Self {
            manifest: bundle.with_file_name(format!("{name}.order.json")),
            marker: bundle.with_file_name(format!("{name}.done")),
            bundle,
        }
    }

    pub fn in_dir(best_dir: &Path, bunch_name: &str) -> Self {
        Self::for_bundle(best_dir.join(bunch_name))
    }

    pub fn is_complete(&self) -> bool {
        self.marker.is_file()
    }
}

/// One persisted tree of a best bunch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BunchEntry {
    pub rank: usize,
    pub candidate: String,
    pub lh: f64,
    pub source_tree: PathBuf,
}

/// Explicit order record written next to the bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BunchManifest {
    pub update_id: UpdateId,
    pub keep_count: usize,
    pub entries: Vec<BunchEntry>,
    pub written_at: DateTime<Utc>,
}

/// The persisted top-K of a round; read-only seed of the next round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestBunch {
    pub update_id: UpdateId,
    pub paths: BunchPaths,
    pub entries: Vec<BunchEntry>,
}

impl BestBunch {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn best_lh(&self) -> Option<f64> {
        self.entries.first().map(|e| e.lh)
    }
}

/// Everything a caller learns from a completed round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundOutcome {
    pub update_id: UpdateId,
    pub best_likelihood: f64,
    pub bunch: BestBunch,
    pub candidate_count: usize,
    pub failures: Vec<CandidateFailure>,
}

/// Iteration results record written after ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationResults {
    pub update_id: UpdateId,
    pub expected: usize,
    pub ranking: Vec<RankedResult>,
    pub failures: Vec<CandidateFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedResult {
    pub rank: usize,
    pub candidate: String,
    pub seed: u64,
    pub parent: Option<usize>,
    pub lh: f64,
    pub refined_tree: PathBuf,
    pub score_info: PathBuf,
}

impl IterationResults {
    pub fn new(ranking: &Ranking, expected: usize, failures: Vec<CandidateFailure>) -> Self {
        let ranking_rows = ranking
            .entries
            .iter()
            .enumerate()
            .map(|(rank, e)| RankedResult {
                rank,
                candidate: e.candidate.name(),
                seed: e.candidate.id.seed,
                parent: e.candidate.id.parent,
                lh: e.lh,
                refined_tree: e.refined_tree.clone(),
                score_info: e.provenance.score_info.clone(),
            })
            .collect();
        Self {
            update_id: ranking.update_id,
            expected,
            ranking: ranking_rows,
            failures,
        }
    }
}

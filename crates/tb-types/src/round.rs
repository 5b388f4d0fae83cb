//! Rounds ("iterations"), their lifecycle and on-disk layout.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::config::TreeBunchConfig;
use crate::errors::IterationError;

/// Monotonically increasing round identifier; 0 is the initial round.
pub type UpdateId = u32;

/// Lifecycle of a single round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundState {
    Preparing,
    GeneratingCandidates,
    Evaluating,
    Ranking,
    Persisted,
    Done,
    Failed,
}

impl RoundState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RoundState::Done | RoundState::Failed)
    }

    /// The state that normally follows this one, if any.
    pub fn next(self) -> Option<RoundState> {
        match self {
            RoundState::Preparing => Some(RoundState::GeneratingCandidates),
            RoundState::GeneratingCandidates => Some(RoundState::Evaluating),
            RoundState::Evaluating => Some(RoundState::Ranking),
            RoundState::Ranking => Some(RoundState::Persisted),
            RoundState::Persisted => Some(RoundState::Done),
            RoundState::Done | RoundState::Failed => None,
        }
    }
}

/// How a round obtains its candidate starting trees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RoundMode {
    /// Candidates built directly from the base alignment.
    Initial,
    /// Candidates derived from each tree of a previous round's best bunch.
    WarmStart {
        /// Best-ML folder of the previous round.
        previous_best_dir: PathBuf,
    },
    /// An update round that ignores prior history.
    FromScratch,
}

impl RoundMode {
    pub fn label(&self) -> &'static str {
        match self {
            RoundMode::Initial => "initial",
            RoundMode::WarmStart { .. } => "warm-start",
            RoundMode::FromScratch => "from-scratch",
        }
    }
}

/// Partition scheme handed to the jobs alongside the alignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum Partition {
    /// Explicitly requested; a missing file is an error.
    Required(PathBuf),
    /// Used when the file exists, otherwise ignored with a warning.
    IfPresent(PathBuf),
}

impl Partition {
    pub fn path(&self) -> &Path {
        match self {
            Partition::Required(p) | Partition::IfPresent(p) => p,
        }
    }
}

/// Caller-supplied inputs of one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundInputs {
    pub update_id: UpdateId,
    /// Working directory of this round; must not exist yet.
    pub base_dir: PathBuf,
    pub alignment: PathBuf,
    #[serde(default)]
    pub partition: Option<Partition>,
    /// Opaque thread hint forwarded to every job.
    #[serde(default)]
    pub num_threads: Option<usize>,
}

impl RoundInputs {
    pub fn new(
        update_id: UpdateId,
        base_dir: impl Into<PathBuf>,
        alignment: impl Into<PathBuf>,
    ) -> Self {
        Self {
            update_id,
            base_dir: base_dir.into(),
            alignment: alignment.into(),
            partition: None,
            num_threads: None,
        }
    }

    pub fn with_partition(mut self, partition: Partition) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = Some(num_threads);
        self
    }
}

/// Directory tree owned by one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundLayout {
    pub base_dir: PathBuf,
    pub alignment_dir: PathBuf,
    pub parsimony_trees_dir: PathBuf,
    pub parsimony_trees_out_dir: PathBuf,
    pub ml_trees_dir: PathBuf,
    pub best_ml_dir: PathBuf,
    pub best_ml_bunch: PathBuf,
    pub iteration_results: PathBuf,
}

impl RoundLayout {
    pub fn new(base_dir: impl Into<PathBuf>, config: &TreeBunchConfig) -> Self {
        let base_dir = base_dir.into();
        let parsimony_trees_dir = base_dir.join("parsimony_trees");
        let ml_trees_dir = base_dir.join("ml_trees");
        let best_ml_dir = base_dir.join(&config.best_ml_folder_name);
        Self {
            alignment_dir: base_dir.join("alignments"),
            parsimony_trees_out_dir: parsimony_trees_dir.join("output"),
            best_ml_bunch: best_ml_dir.join(&config.best_ml_bunch_name),
            iteration_results: ml_trees_dir.join(&config.iteration_results_name),
            parsimony_trees_dir,
            ml_trees_dir,
            best_ml_dir,
            base_dir,
        }
    }

    /// All directories in creation order.
    pub fn directories(&self) -> [&Path; 5] {
        [
            &self.alignment_dir,
            &self.parsimony_trees_dir,
            &self.parsimony_trees_out_dir,
            &self.ml_trees_dir,
            &self.best_ml_dir,
        ]
    }

    /// Staged copy of the alignment used by update rounds.
    pub fn update_alignment(&self, update_id: UpdateId) -> PathBuf {
        self.alignment_dir.join(format!("phy_{update_id}"))
    }
}

/// A round and where it is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Round {
    pub update_id: UpdateId,
    pub mode: RoundMode,
    pub layout: RoundLayout,
    pub requested_candidates: usize,
    pub keep_count: usize,
    pub state: RoundState,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Round {
    pub fn new(
        update_id: UpdateId,
        mode: RoundMode,
        layout: RoundLayout,
        requested_candidates: usize,
        keep_count: usize,
    ) -> Self {
        Self {
            update_id,
            mode,
            layout,
            requested_candidates,
            keep_count,
            state: RoundState::Preparing,
            created_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    /// Move to `to`, which must be the next state in the pipeline.
    pub fn advance(&mut self, to: RoundState) -> Result<(), IterationError> {
        if self.state.next() != Some(to) {
            return Err(IterationError::InvalidTransition {
                update_id: self.update_id,
                from: self.state,
                to,
            });
        }
        self.state = to;
        if to == RoundState::Done {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Failure is reachable from every non-terminal state.
    pub fn mark_failed(&mut self, error: String) -> Result<(), IterationError> {
        if self.state.is_terminal() {
            return Err(IterationError::InvalidTransition {
                update_id: self.update_id,
                from: self.state,
                to: RoundState::Failed,
            });
        }
        self.state = RoundState::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_round() -> Round {
        let layout = RoundLayout::new("/tmp/tb/update_0", &TreeBunchConfig::default());
        Round::new(0, RoundMode::Initial, layout, 4, 2)
    }

    #[test]
    fn round_lifecycle() {
        let mut round = sample_round();
        assert_eq!(round.state, RoundState::Preparing);

        for state in [
            RoundState::GeneratingCandidates,
            RoundState::Evaluating,
            RoundState::Ranking,
            RoundState::Persisted,
        ] {
            round.advance(state).unwrap();
            assert!(round.finished_at.is_none());
        }
        round.advance(RoundState::Done).unwrap();
        assert_eq!(round.state, RoundState::Done);
        assert!(round.finished_at.is_some());
    }

    #[test]
    fn skipping_states_is_rejected() {
        let mut round = sample_round();
        let err = round.advance(RoundState::Ranking).unwrap_err();
        assert!(matches!(
            err,
            IterationError::InvalidTransition {
                from: RoundState::Preparing,
                to: RoundState::Ranking,
                ..
            }
        ));
        assert_eq!(round.state, RoundState::Preparing);
    }

    #[test]
    fn failure_from_any_non_terminal_state() {
        let mut round = sample_round();
        round.advance(RoundState::GeneratingCandidates).unwrap();
        round.mark_failed("parsimony crashed".into()).unwrap();
        assert_eq!(round.state, RoundState::Failed);
        assert_eq!(round.error.as_deref(), Some("parsimony crashed"));

        // Terminal states stay terminal
        assert!(round.mark_failed("again".into()).is_err());
        assert!(round.advance(RoundState::Evaluating).is_err());
    }

    #[test]
    fn layout_paths() {
        let config = TreeBunchConfig::default();
        let layout = RoundLayout::new("/data/update_3", &config);
        assert_eq!(
            layout.parsimony_trees_out_dir,
            PathBuf::from("/data/update_3/parsimony_trees/output")
        );
        assert_eq!(layout.best_ml_bunch, layout.best_ml_dir.join(&config.best_ml_bunch_name));
        assert_eq!(layout.update_alignment(3), PathBuf::from("/data/update_3/alignments/phy_3"));
        assert!(layout.directories().iter().all(|d| d.starts_with("/data/update_3")));
    }

    #[test]
    fn mode_serialization() {
        let mode = RoundMode::WarmStart {
            previous_best_dir: PathBuf::from("/data/update_0/best_ml_trees"),
        };
        let json = serde_json::to_value(&mode).unwrap();
        assert_eq!(json["mode"], "warm_start");
        let back: RoundMode = serde_json::from_value(json).unwrap();
        assert_eq!(back, mode);
    }
}

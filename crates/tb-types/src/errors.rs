use std::path::PathBuf;

use thiserror::Error;

use crate::round::{RoundState, UpdateId};

/// Main error type for the TreeBunch system
#[derive(Error, Debug)]
pub enum TbError {
    #[error("Iteration error: {0}")]
    Iteration(#[from] IterationError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Round-level errors raised by the iteration coordinator
#[derive(Error, Debug)]
pub enum IterationError {
    #[error("Round {update_id}: prerequisite missing: {what} ({})", .path.display())]
    PrerequisiteMissing {
        update_id: UpdateId,
        what: String,
        path: PathBuf,
    },

    #[error("Round {update_id}: keep count {keep_count} must be between 1 and the {candidate_count} candidates of this round")]
    InvalidKeepCount {
        update_id: UpdateId,
        keep_count: usize,
        candidate_count: usize,
    },

    #[error("Round {update_id}: generation of candidate {candidate} failed: {source}")]
    CandidateGenerationFailed {
        update_id: UpdateId,
        candidate: String,
        #[source]
        source: JobError,
    },

    #[error("Round {update_id}: evaluation of candidate {candidate} failed: {source}")]
    CandidateEvaluationFailed {
        update_id: UpdateId,
        candidate: String,
        #[source]
        source: JobError,
    },

    #[error("Round {update_id}: only {survivors} candidates survived evaluation, {keep_count} required")]
    InsufficientSurvivors {
        update_id: UpdateId,
        survivors: usize,
        keep_count: usize,
    },

    #[error("No evaluated candidates to rank")]
    EmptyCandidateSet,

    #[error("Option {key} is unknown")]
    UnknownOption { key: String },

    #[error("Round {update_id}: working directory already exists: {}", .path.display())]
    RoundAlreadyExists { update_id: UpdateId, path: PathBuf },

    #[error("Round {update_id}: invalid state transition {from:?} -> {to:?}")]
    InvalidTransition {
        update_id: UpdateId,
        from: RoundState,
        to: RoundState,
    },
}

/// Errors reported by external job collaborators
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Failed to launch {program} for job {job}: {message}")]
    SpawnFailed {
        job: String,
        program: String,
        message: String,
    },

    #[error("Job {job} exited with status {status}")]
    NonZeroExit { job: String, status: String },

    #[error("Job {job} did not produce its result artifact {}", .path.display())]
    MissingArtifact { job: String, path: PathBuf },

    #[error("No line starting with \"{marker}\" in {}", .path.display())]
    ScoreNotFound { marker: String, path: PathBuf },

    #[error("Unparsable score \"{value}\" in {}", .path.display())]
    InvalidScore { value: String, path: PathBuf },

    #[error("Tree bundle {} could not be split: {message}", .path.display())]
    SplitFailed { path: PathBuf, message: String },

    #[error("Job IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IterationError {
    /// True for errors detected before any job was dispatched.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            IterationError::InvalidKeepCount { .. }
                | IterationError::PrerequisiteMissing { .. }
                | IterationError::RoundAlreadyExists { .. }
        )
    }
}

impl TbError {
    /// True for errors raised before any job of the round was dispatched.
    pub fn is_configuration_error(&self) -> bool {
        match self {
            TbError::Config(_) => true,
            TbError::Iteration(e) => e.is_configuration_error(),
            _ => false,
        }
    }
}

/// Result type alias for TreeBunch operations
pub type TbResult<T> = Result<T, TbError>;

/// Result type alias for collaborator jobs
pub type JobResult<T> = Result<T, JobError>;

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::TbError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::TbError::Config(format!($($arg)*))
    };
}

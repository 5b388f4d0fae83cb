use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::candidate::SeedPolicy;
use crate::errors::{IterationError, TbResult};

/// Run-wide configuration shared by every round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeBunchConfig {
    /// File name of the iteration results record inside `ml_trees/`.
    pub iteration_results_name: String,
    pub best_ml_folder_name: String,
    pub best_ml_bunch_name: String,
    /// Progress log path, shared by all rounds of a run.
    pub iteration_log_name: PathBuf,
    pub seed_base: u64,
    pub default_candidates: usize,
    /// Trees kept per round when `num_bestML_trees` is not given.
    pub default_keep: usize,
    /// Upper bound on concurrently running jobs (0 = one per core).
    pub max_parallel_jobs: usize,
    pub executables: Executables,
}

impl Default for TreeBunchConfig {
    fn default() -> Self {
        Self {
            iteration_results_name: "iteration_results.json".to_string(),
            best_ml_folder_name: "best_ml_trees".to_string(),
            best_ml_bunch_name: "best_bunch.nw".to_string(),
            iteration_log_name: PathBuf::from("iteration.log"),
            seed_base: SeedPolicy::default().base,
            default_candidates: 4,
            default_keep: 2,
            max_parallel_jobs: 0,
            executables: Executables::default(),
        }
    }
}

impl TreeBunchConfig {
    pub fn from_json_file(path: &Path) -> TbResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn seed_policy(&self) -> SeedPolicy {
        SeedPolicy::new(self.seed_base)
    }

    pub fn with_max_parallel_jobs(mut self, n: usize) -> Self {
        self.max_parallel_jobs = n;
        self
    }
}

/// External programs driven by the process job runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Executables {
    pub parsimony: PathBuf,
    pub ml_search: PathBuf,
    pub gamma: PathBuf,
    /// Substitution model passed to the ML refinement job.
    pub search_model: String,
    pub gamma_model: String,
}

impl Default for Executables {
    fn default() -> Self {
        Self {
            parsimony: PathBuf::from("parsimonator"),
            ml_search: PathBuf::from("raxmlLight"),
            gamma: PathBuf::from("raxmlHPC"),
            search_model: "GTRCAT".to_string(),
            gamma_model: "GTRGAMMA".to_string(),
        }
    }
}

/// Loosely typed options as a caller hands them to `start_iteration`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IterationOptions(pub serde_json::Map<String, serde_json::Value>);

impl IterationOptions {
    pub const SUPPORTED: [&'static str; 5] = [
        "num_parsi_trees",
        "num_bestML_trees",
        "exp_name",
        "cycle_batch_script",
        "initial_iteration",
    ];

    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    /// Keys the coordinator does not recognize, in key order.
    pub fn unknown(&self) -> Vec<IterationError> {
        self.0
            .keys()
            .filter(|k| !Self::SUPPORTED.contains(&k.as_str()))
            .map(|k| IterationError::UnknownOption { key: k.clone() })
            .collect()
    }

    /// A known key holding a value of the wrong type is a configuration
    /// error, never a silent fallback to the default.
    fn count(&self, key: &str) -> TbResult<Option<usize>> {
        match self.0.get(key) {
            None => Ok(None),
            Some(value) => value
                .as_u64()
                .map(|n| Some(n as usize))
                .ok_or_else(|| {
                    crate::config_error!("option {key} must be a non-negative integer, got {value}")
                }),
        }
    }

    pub fn candidate_count(&self, default: usize) -> TbResult<usize> {
        Ok(self.count("num_parsi_trees")?.unwrap_or(default))
    }

    pub fn keep_count(&self, default: usize) -> TbResult<usize> {
        Ok(self.count("num_bestML_trees")?.unwrap_or(default))
    }

    pub fn is_initial(&self) -> TbResult<bool> {
        match self.0.get("initial_iteration") {
            None => Ok(false),
            Some(value) => value
                .as_bool()
                .ok_or_else(|| {
                    crate::config_error!("option initial_iteration must be a boolean, got {value}")
                }),
        }
    }

    pub fn experiment_name(&self) -> TbResult<Option<&str>> {
        match self.0.get("exp_name") {
            None => Ok(None),
            Some(value) => value
                .as_str()
                .map(Some)
                .ok_or_else(|| {
                    crate::config_error!("option exp_name must be a string, got {value}")
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TbError;
    use serde_json::json;

    #[test]
    fn defaults_apply_when_options_are_absent() {
        let opts = IterationOptions::new();
        assert_eq!(opts.candidate_count(4).unwrap(), 4);
        assert_eq!(opts.keep_count(2).unwrap(), 2);
        assert!(!opts.is_initial().unwrap());
        assert_eq!(opts.experiment_name().unwrap(), None);

        let opts = IterationOptions::new()
            .set("num_parsi_trees", 10)
            .set("num_bestML_trees", 3)
            .set("initial_iteration", true);
        assert_eq!(opts.candidate_count(4).unwrap(), 10);
        assert_eq!(opts.keep_count(2).unwrap(), 3);
        assert!(opts.is_initial().unwrap());
    }

    #[test]
    fn mistyped_known_options_are_rejected() {
        let opts = IterationOptions::new().set("num_bestML_trees", "5");
        let err = opts.keep_count(2).unwrap_err();
        assert!(matches!(err, TbError::Config(_)));
        assert!(err.to_string().contains("num_bestML_trees"));

        let opts = IterationOptions::new().set("num_parsi_trees", -3);
        assert!(matches!(opts.candidate_count(4), Err(TbError::Config(_))));

        let opts = IterationOptions::new().set("initial_iteration", "true");
        assert!(matches!(opts.is_initial(), Err(TbError::Config(_))));

        let opts = IterationOptions::new().set("exp_name", 7);
        assert!(matches!(opts.experiment_name(), Err(TbError::Config(_))));
    }

    #[test]
    fn unknown_options_are_reported() {
        let opts = IterationOptions::new()
            .set("exp_name", "primates")
            .set("num_gamma_trees", 2)
            .set("bogus", json!(null));
        let unknown: Vec<String> = opts
            .unknown()
            .into_iter()
            .map(|e| match e {
                IterationError::UnknownOption { key } => key,
                other => panic!("unexpected error: {other:?}"),
            })
            .collect();
        assert_eq!(unknown, vec!["bogus".to_string(), "num_gamma_trees".to_string()]);
        assert_eq!(opts.experiment_name().unwrap(), Some("primates"));
    }

    #[test]
    fn config_partial_json_uses_defaults() {
        let config: TreeBunchConfig =
            serde_json::from_value(json!({ "best_ml_bunch_name": "bunch.nw", "seed_base": 1 }))
                .unwrap();
        assert_eq!(config.best_ml_bunch_name, "bunch.nw");
        assert_eq!(config.best_ml_folder_name, "best_ml_trees");
        assert_eq!(config.default_keep, 2);
        assert_eq!(config.seed_policy().seed_for(0, 1, 0), 1);
        assert_eq!(config.executables.parsimony, PathBuf::from("parsimonator"));
    }
}

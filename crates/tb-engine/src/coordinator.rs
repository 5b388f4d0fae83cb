// Iteration coordinator: drives one round from candidate generation to the
// persisted best bunch that seeds the next round.

use parking_lot::Mutex;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tb_jobs::{CandidateJobRunner, JobKind, JobOptions, TreeSetSplitter};
use tb_types::{
    internal_error, BestBunch, BunchPaths, CandidateFailure, CandidateId, CandidateTree,
    EvaluatedCandidate, IterationError, IterationOptions, IterationResults, JobError, Partition,
    Provenance, Round, RoundInputs, RoundLayout, RoundMode, RoundOutcome, RoundState, TbError,
    TbResult, TreeBunchConfig, UpdateId,
};
use tracing::{debug, warn};

use crate::log::ProgressLog;
use crate::persister::{atomic_write_json, BestSetPersister};
use crate::ranker::ResultRanker;

/// Everything resolved before the first side effect of a round.
struct RoundPlan {
    layout: RoundLayout,
    partition: Option<PathBuf>,
    /// Previous-round bunch for warm-start rounds.
    seeds: Option<BestBunch>,
    total_candidates: usize,
}

/// One generation slot: the identity a candidate will carry.
struct Slot {
    id: CandidateId,
    parent_tree: Option<PathBuf>,
}

/// Owns round state and runs the generate → evaluate → rank → persist pipeline.
pub struct IterationCoordinator {
    config: TreeBunchConfig,
    runner: Arc<dyn CandidateJobRunner>,
    splitter: Arc<dyn TreeSetSplitter>,
    log: Arc<dyn ProgressLog>,
    pool: Option<rayon::ThreadPool>,
    rounds: Mutex<Vec<Round>>,
}

impl IterationCoordinator {
    pub fn new(
        config: TreeBunchConfig,
        runner: Arc<dyn CandidateJobRunner>,
        splitter: Arc<dyn TreeSetSplitter>,
        log: Arc<dyn ProgressLog>,
    ) -> TbResult<Self> {
        let pool = if config.max_parallel_jobs > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(config.max_parallel_jobs)
                .thread_name(|i| format!("tb-job-{i}"))
                .build()
                .map_err(|e| internal_error!("failed to build job pool: {e}"))?;
            Some(pool)
        } else {
            None
        };
        Ok(Self {
            config,
            runner,
            splitter,
            log,
            pool,
            rounds: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &TreeBunchConfig {
        &self.config
    }

    /// Last known state of a round run by this coordinator.
    pub fn round(&self, update_id: UpdateId) -> Option<Round> {
        self.rounds
            .lock()
            .iter()
            .rev()
            .find(|r| r.update_id == update_id)
            .cloned()
    }

    /// Options-driven entry point.
    ///
    /// `initial_iteration` selects an initial round; otherwise the round
    /// warm-starts from `previous_best_dir` when given and runs from scratch
    /// when not. Unrecognized option keys are logged and ignored, while a
    /// recognized key with a value of the wrong type fails the call before
    /// anything is dispatched.
    pub fn start_iteration(
        &self,
        inputs: &RoundInputs,
        previous_best_dir: Option<PathBuf>,
        options: &IterationOptions,
    ) -> TbResult<RoundOutcome> {
        for unknown in options.unknown() {
            self.log.info(&unknown.to_string());
            warn!(update_id = inputs.update_id, "{unknown}");
        }
        let (mode, candidate_count, keep_count) = self
            .read_options(previous_best_dir, options)
            .map_err(|e| {
                self.log.error(&format!("[round {}] {e}", inputs.update_id));
                e
            })?;
        self.run_iteration(inputs, mode, candidate_count, keep_count)
    }

    fn read_options(
        &self,
        previous_best_dir: Option<PathBuf>,
        options: &IterationOptions,
    ) -> TbResult<(RoundMode, usize, usize)> {
        if let Some(name) = options.experiment_name()? {
            self.log.info(&format!("Experiment {name}"));
        }
        let candidate_count = options.candidate_count(self.config.default_candidates)?;
        let keep_count = options.keep_count(self.config.default_keep)?;
        let mode = match (options.is_initial()?, previous_best_dir) {
            (true, _) => RoundMode::Initial,
            (false, Some(previous_best_dir)) => RoundMode::WarmStart { previous_best_dir },
            (false, None) => RoundMode::FromScratch,
        };
        Ok((mode, candidate_count, keep_count))
    }

    /// Run one complete round and return its best likelihood and bunch.
    ///
    /// `update_id` must name a fresh round: the round directory may not
    /// hold anything yet, and partially populated directories of a crashed
    /// attempt are neither detected as resumable nor repaired.
    pub fn run_iteration(
        &self,
        inputs: &RoundInputs,
        mode: RoundMode,
        candidate_count: usize,
        keep_count: usize,
    ) -> TbResult<RoundOutcome> {
        self.log.info("Preparing new iteration...");
        let layout = RoundLayout::new(&inputs.base_dir, &self.config);
        let mut round = Round::new(inputs.update_id, mode, layout, candidate_count, keep_count);

        let result = self.execute(inputs, &mut round);
        if let Err(e) = &result {
            if e.is_configuration_error() {
                self.log.error(&format!(
                    "[round {}] configuration error, no job was dispatched: {e}",
                    round.update_id
                ));
            } else {
                self.log.error(&format!("[round {}] {e}", round.update_id));
            }
            if let Err(transition) = round.mark_failed(e.to_string()) {
                warn!("{transition}");
            }
        }
        self.rounds.lock().push(round);
        result
    }

    fn execute(&self, inputs: &RoundInputs, round: &mut Round) -> TbResult<RoundOutcome> {
        let plan = self.plan(inputs, round)?;
        let alignment = self.prepare_directories(inputs, round, &plan)?;
        let update_id = round.update_id;

        self.log.success(&format!("****** Start iteration no {update_id} ********"));
        self.log.success(&format!(
            "step 1 of 2 : Compute {} {} starting trees\n----",
            plan.total_candidates,
            round.mode.label()
        ));
        round.advance(RoundState::GeneratingCandidates)?;
        let slots = self.slots(round, &plan)?;
        let candidates = self.generate(round, &plan, &alignment, slots)?;

        self.log.success(&format!(
            "step 2 of 2 : Compute {} ML trees and select the {} best\n----",
            candidates.len(),
            round.keep_count
        ));
        round.advance(RoundState::Evaluating)?;
        let (survivors, failures) =
            self.evaluate(round, &plan, &alignment, inputs.num_threads, candidates);
        if survivors.len() < round.keep_count {
            return Err(IterationError::InsufficientSurvivors {
                update_id,
                survivors: survivors.len(),
                keep_count: round.keep_count,
            }
            .into());
        }

        round.advance(RoundState::Ranking)?;
        let ranking = ResultRanker::rank(update_id, survivors)?;
        let results = IterationResults::new(&ranking, plan.total_candidates, failures.clone());
        atomic_write_json(&plan.layout.iteration_results, &results)?;
        self.log.info(&format!("Likelihood ranking: {:?}", ranking.likelihoods()));

        let bunch =
            BestSetPersister::write(&ranking, round.keep_count, &plan.layout.best_ml_bunch)?;
        round.advance(RoundState::Persisted)?;
        BestSetPersister::mark_complete(&bunch)?;
        round.advance(RoundState::Done)?;

        let best_likelihood = ranking
            .best()
            .map(|e| e.lh)
            .ok_or(IterationError::EmptyCandidateSet)?;
        self.log.success(&format!("****** Finished iteration no {update_id} ********"));
        self.log.info(&format!(
            "Bunch of {} ML trees ready at {}\n----",
            bunch.len(),
            bunch.paths.bundle.display()
        ));

        Ok(RoundOutcome {
            update_id,
            best_likelihood,
            bunch,
            candidate_count: plan.total_candidates,
            failures,
        })
    }

    /// Validate everything that can be checked without touching the disk.
    fn plan(&self, inputs: &RoundInputs, round: &Round) -> TbResult<RoundPlan> {
        let update_id = round.update_id;
        let layout = round.layout.clone();

        if dir_has_entries(&layout.base_dir)? {
            return Err(IterationError::RoundAlreadyExists {
                update_id,
                path: layout.base_dir,
            }
            .into());
        }
        if !inputs.alignment.is_file() {
            return Err(missing(update_id, "alignment", &inputs.alignment));
        }
        let partition = self.resolve_partition(update_id, inputs.partition.as_ref())?;

        let (seeds, total_candidates) = match &round.mode {
            RoundMode::Initial | RoundMode::FromScratch => (None, round.requested_candidates),
            RoundMode::WarmStart { previous_best_dir } => {
                let paths =
                    BunchPaths::in_dir(previous_best_dir, &self.config.best_ml_bunch_name);
                let bunch = match BestSetPersister::load(&paths)? {
                    Some(bunch) if !bunch.is_empty() => bunch,
                    _ => {
                        let what = "completed best bunch of the previous round";
                        return Err(missing(update_id, what, &paths.bundle));
                    }
                };
                self.log.info(&format!(
                    "{} initial trees available from previous iteration",
                    bunch.len()
                ));
                let total = bunch.len() * round.requested_candidates;
                (Some(bunch), total)
            }
        };

        // An empty bunch cannot seed the next round.
        if round.keep_count == 0 || round.keep_count > total_candidates {
            return Err(IterationError::InvalidKeepCount {
                update_id,
                keep_count: round.keep_count,
                candidate_count: total_candidates,
            }
            .into());
        }
        self.log.info(&format!(
            "{total_candidates} ML trees will be generated ({} round)",
            round.mode.label()
        ));

        Ok(RoundPlan {
            layout,
            partition,
            seeds,
            total_candidates,
        })
    }

    /// A missing `Required` partition is an error; a missing `IfPresent` one
    /// is logged and the round runs unpartitioned.
    fn resolve_partition(
        &self,
        update_id: UpdateId,
        partition: Option<&Partition>,
    ) -> TbResult<Option<PathBuf>> {
        match partition {
            None => Ok(None),
            Some(p) if p.path().is_file() => Ok(Some(p.path().to_path_buf())),
            Some(Partition::Required(path)) => Err(missing(update_id, "partition file", path)),
            Some(Partition::IfPresent(path)) => {
                self.log.info(&format!(
                    "Partition file {} not found, continuing without partitions",
                    path.display()
                ));
                Ok(None)
            }
        }
    }

    /// Create the round's directories and stage the alignment it runs on.
    fn prepare_directories(
        &self,
        inputs: &RoundInputs,
        round: &Round,
        plan: &RoundPlan,
    ) -> TbResult<PathBuf> {
        for dir in plan.layout.directories() {
            std::fs::create_dir_all(dir)?;
            debug!(update_id = round.update_id, dir = %dir.display(), "created round directory");
        }
        if let Some(partition) = &plan.partition {
            copy_into(partition, &plan.layout.alignment_dir)?;
        }
        match round.mode {
            RoundMode::Initial => {
                copy_into(&inputs.alignment, &plan.layout.alignment_dir)?;
                Ok(inputs.alignment.clone())
            }
            RoundMode::WarmStart { .. } | RoundMode::FromScratch => {
                let staged = plan.layout.update_alignment(round.update_id);
                self.log.info(&format!(
                    "Copying new update alignment from {} to {}",
                    inputs.alignment.display(),
                    staged.display()
                ));
                std::fs::copy(&inputs.alignment, &staged)?;
                Ok(staged)
            }
        }
    }

    /// Candidate identities in creation order, parent-major for warm starts.
    fn slots(&self, round: &Round, plan: &RoundPlan) -> TbResult<Vec<Slot>> {
        let policy = self.config.seed_policy();
        let update_id = round.update_id;
        let per_parent = round.requested_candidates;
        let total = plan.total_candidates;

        let parents: Vec<Option<PathBuf>> = match &plan.seeds {
            None => vec![None],
            Some(bunch) => {
                let prefix = plan.layout.parsimony_trees_dir.join("prev_parsi_tree");
                let trees = self.splitter.split(&bunch.paths.bundle, &prefix)?;
                if trees.len() != bunch.len() {
                    return Err(internal_error!(
                        "previous bunch {} holds {} trees but its manifest lists {}",
                        bunch.paths.bundle.display(),
                        trees.len(),
                        bunch.len()
                    ));
                }
                trees.into_iter().map(Some).collect()
            }
        };

        let mut slots = Vec::with_capacity(total);
        for (p, parent_tree) in parents.iter().enumerate() {
            for _ in 0..per_parent {
                let index = slots.len();
                slots.push(Slot {
                    id: CandidateId {
                        update_id,
                        index,
                        parent: parent_tree.as_ref().map(|_| p),
                        seed: policy.seed_for(update_id, total, index),
                    },
                    parent_tree: parent_tree.clone(),
                });
            }
        }
        Ok(slots)
    }

    /// Generate every candidate; the first failure aborts the round and no
    /// further generation job is started.
    fn generate(
        &self,
        round: &Round,
        plan: &RoundPlan,
        alignment: &Path,
        slots: Vec<Slot>,
    ) -> TbResult<Vec<CandidateTree>> {
        let outdir = match round.mode {
            RoundMode::WarmStart { .. } => &plan.layout.parsimony_trees_out_dir,
            RoundMode::Initial | RoundMode::FromScratch => &plan.layout.parsimony_trees_dir,
        };
        let update_id = round.update_id;
        let total = slots.len();
        self.log.info(&format!("Results stored in {}", outdir.display()));

        let candidates: Result<Vec<CandidateTree>, IterationError> = self.dispatch(|| {
            slots
                .into_par_iter()
                .map(|slot| {
                    let name = format!("{}_{}", JobKind::Parsimony.stage(), slot.id);
                    let mut options = JobOptions::new(name, alignment, outdir)
                        .with_seed(slot.id.seed)
                        .with_num_trees(1);
                    if let Some(parent) = &slot.parent_tree {
                        options = options.with_starting_tree(parent);
                    }
                    self.log.info(&format!(
                        "Computing parsimony tree {}/{} ({})",
                        slot.id.index + 1,
                        total,
                        slot.id
                    ));
                    match self.runner.run(JobKind::Parsimony, &options) {
                        Ok(output) => {
                            Ok(CandidateTree::new(slot.id, slot.parent_tree, output.result))
                        }
                        Err(source) => Err(IterationError::CandidateGenerationFailed {
                            update_id,
                            candidate: slot.id.to_string(),
                            source,
                        }),
                    }
                })
                .collect()
        });

        let candidates = candidates?;
        self.log.info("Done with parsimony starting trees");
        Ok(candidates)
    }

    /// Refine and score every candidate; failures are isolated per candidate.
    fn evaluate(
        &self,
        round: &Round,
        plan: &RoundPlan,
        alignment: &Path,
        num_threads: Option<usize>,
        candidates: Vec<CandidateTree>,
    ) -> (Vec<EvaluatedCandidate>, Vec<CandidateFailure>) {
        let total = candidates.len();
        let outcomes: Vec<Result<EvaluatedCandidate, CandidateFailure>> = self.dispatch(|| {
            candidates
                .into_par_iter()
                .map(|candidate| {
                    let id = candidate.id.clone();
                    self.log.info(&format!(
                        "Start ML search for {} ({} of {})",
                        id,
                        id.index + 1,
                        total
                    ));
                    self.evaluate_one(plan, alignment, num_threads, candidate)
                        .map_err(|(stage, source)| {
                            let err = IterationError::CandidateEvaluationFailed {
                                update_id: round.update_id,
                                candidate: id.to_string(),
                                source,
                            };
                            self.log.error(&err.to_string());
                            CandidateFailure {
                                candidate: id,
                                stage: stage.to_string(),
                                message: err.to_string(),
                            }
                        })
                })
                .collect()
        });

        let mut survivors = Vec::with_capacity(total);
        let mut failures = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(evaluated) => survivors.push(evaluated),
                Err(failure) => failures.push(failure),
            }
        }
        if !failures.is_empty() {
            self.log.info(&format!(
                "{} of {} candidates failed evaluation",
                failures.len(),
                total
            ));
        }
        (survivors, failures)
    }

    /// Two-stage pipeline: ML refinement, then GAMMA scoring of the result.
    fn evaluate_one(
        &self,
        plan: &RoundPlan,
        alignment: &Path,
        num_threads: Option<usize>,
        candidate: CandidateTree,
    ) -> Result<EvaluatedCandidate, (&'static str, JobError)> {
        let ml_dir = &plan.layout.ml_trees_dir;
        let search_name = format!("{}_{}", JobKind::MlSearch.stage(), candidate.id);
        let search_opts = JobOptions::new(search_name, alignment, ml_dir)
            .with_partition(plan.partition.clone())
            .with_starting_tree(&candidate.tree_path)
            .with_threads(num_threads)
            // RF-distance convergence criterion
            .with_flag("-D");
        let search = self
            .runner
            .run(JobKind::MlSearch, &search_opts)
            .map_err(|e| (JobKind::MlSearch.stage(), e))?;

        let score_name = format!("{}_{}", JobKind::GammaScore.stage(), candidate.id);
        let score_opts = JobOptions::new(score_name, alignment, ml_dir)
            .with_partition(plan.partition.clone())
            .with_starting_tree(&search.result)
            .with_threads(num_threads);
        let stage = JobKind::GammaScore.stage();
        let score = self
            .runner
            .run(JobKind::GammaScore, &score_opts)
            .map_err(|e| (stage, e))?;
        let lh = score.likelihood().map_err(|e| (stage, e))?;
        self.log.info(&format!("Score for tree {}: {}", search.result.display(), lh));

        let provenance = Provenance {
            search_job: search.job.clone(),
            score_job: score.job.clone(),
            search_output: search.result.clone(),
            score_info: score.info.clone(),
        };
        Ok(EvaluatedCandidate::new(candidate, search.result, lh, provenance))
    }

    /// Standalone ML search from scratch under GAMMA on the round's alignment.
    ///
    /// Writes into the round's `ml_trees/` directory and returns the best
    /// likelihood reported by the search. Partitions resolve as for a round.
    pub fn search_from_scratch(
        &self,
        inputs: &RoundInputs,
        num_gamma_trees: usize,
    ) -> TbResult<f64> {
        let layout = RoundLayout::new(&inputs.base_dir, &self.config);
        let partition = self
            .resolve_partition(inputs.update_id, inputs.partition.as_ref())
            .map_err(|e| {
                self.log.error(&e.to_string());
                e
            })?;
        std::fs::create_dir_all(&layout.ml_trees_dir)?;
        let num_trees = num_gamma_trees.max(1);
        let outdir = &layout.ml_trees_dir;
        let options = JobOptions::new(JobKind::GammaSearch.stage(), &inputs.alignment, outdir)
            .with_partition(partition)
            .with_seed(self.config.seed_policy().seed_for(inputs.update_id, 1, 0))
            .with_num_trees(num_trees)
            .with_threads(inputs.num_threads);

        self.log.info(&format!("Start ML search from scratch with {num_trees} trees"));
        let lh = self
            .runner
            .run(JobKind::GammaSearch, &options)
            .and_then(|output| output.likelihood())
            .map_err(TbError::from);
        match &lh {
            Ok(lh) => self.log.info(&format!(
                "Done ML search from scratch with {num_trees} trees, best score {lh}"
            )),
            Err(e) => self.log.error(&e.to_string()),
        }
        lh
    }

    fn dispatch<T: Send>(&self, op: impl FnOnce() -> T + Send) -> T {
        match &self.pool {
            Some(pool) => pool.install(op),
            None => op(),
        }
    }
}

fn missing(update_id: UpdateId, what: &str, path: &Path) -> TbError {
    IterationError::PrerequisiteMissing {
        update_id,
        what: what.to_string(),
        path: path.to_path_buf(),
    }
    .into()
}

fn dir_has_entries(dir: &Path) -> std::io::Result<bool> {
    match std::fs::read_dir(dir) {
        Ok(mut entries) => Ok(entries.next().is_some()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn copy_into(file: &Path, dir: &Path) -> TbResult<()> {
    let name = file
        .file_name()
        .ok_or_else(|| internal_error!("{} has no file name", file.display()))?;
    std::fs::copy(file, dir.join(name))?;
    Ok(())
}

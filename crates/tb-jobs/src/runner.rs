//! Candidate job runners: the boundary to the external tree programs.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tb_types::{Executables, JobError, JobResult};
use tracing::{debug, warn};

use crate::score::{parse_score, ScoreMarker};

/// The kinds of external jobs a round dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    /// Randomized stepwise-addition parsimony starting tree.
    Parsimony,
    /// ML topology refinement (NNI) from a starting tree.
    MlSearch,
    /// GAMMA likelihood scoring of a fixed topology.
    GammaScore,
    /// Full ML search from scratch under GAMMA.
    GammaSearch,
}

impl JobKind {
    /// Stage prefix used in job names, `<stage>_<candidateId>`.
    pub fn stage(self) -> &'static str {
        match self {
            JobKind::Parsimony => "parsimony",
            JobKind::MlSearch => "ml",
            JobKind::GammaScore => "score",
            JobKind::GammaSearch => "std_GAMMA_search",
        }
    }

    /// File name of the tree a job named `name` leaves in its output dir.
    pub fn result_artifact(self, name: &str) -> String {
        match self {
            JobKind::Parsimony => format!("RAxML_parsimonyTree.{name}.0"),
            JobKind::MlSearch | JobKind::GammaScore => format!("RAxML_result.{name}"),
            JobKind::GammaSearch => format!("RAxML_bestTree.{name}"),
        }
    }

    pub fn info_artifact(self, name: &str) -> String {
        format!("RAxML_info.{name}")
    }

    pub fn score_marker(self) -> Option<ScoreMarker> {
        match self {
            JobKind::GammaScore => Some(ScoreMarker::GAMMA_SCORE),
            JobKind::GammaSearch => Some(ScoreMarker::GAMMA_SEARCH),
            JobKind::Parsimony | JobKind::MlSearch => None,
        }
    }
}

/// Configuration record handed to a runner for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    pub name: String,
    pub alignment: PathBuf,
    pub partition: Option<PathBuf>,
    pub outdir: PathBuf,
    pub starting_tree: Option<PathBuf>,
    pub seed: Option<u64>,
    pub num_trees: Option<usize>,
    pub num_threads: Option<usize>,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    /// Extra flags appended verbatim.
    pub flags: Vec<String>,
}

impl JobOptions {
    /// Options with stdout/stderr streams named after the job inside `outdir`.
    pub fn new(
        name: impl Into<String>,
        alignment: impl Into<PathBuf>,
        outdir: impl Into<PathBuf>,
    ) -> Self {
        let name = name.into();
        let outdir = outdir.into();
        Self {
            stdout: outdir.join(format!("info_{name}")),
            stderr: outdir.join(format!("err_{name}")),
            name,
            alignment: alignment.into(),
            partition: None,
            outdir,
            starting_tree: None,
            seed: None,
            num_trees: None,
            num_threads: None,
            flags: Vec::new(),
        }
    }

    pub fn with_partition(mut self, partition: Option<PathBuf>) -> Self {
        self.partition = partition;
        self
    }

    pub fn with_starting_tree(mut self, tree: impl Into<PathBuf>) -> Self {
        self.starting_tree = Some(tree.into());
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_num_trees(mut self, n: usize) -> Self {
        self.num_trees = Some(n);
        self
    }

    /// Zero means "let the program decide" and is dropped.
    pub fn with_threads(mut self, threads: Option<usize>) -> Self {
        self.num_threads = threads.filter(|t| *t > 0);
        self
    }

    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flags.push(flag.into());
        self
    }

    pub fn result_path(&self, kind: JobKind) -> PathBuf {
        self.outdir.join(kind.result_artifact(&self.name))
    }

    pub fn info_path(&self, kind: JobKind) -> PathBuf {
        self.outdir.join(kind.info_artifact(&self.name))
    }
}

/// Artifacts left behind by a finished job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutput {
    pub job: String,
    pub kind: JobKind,
    pub result: PathBuf,
    pub info: PathBuf,
}

impl JobOutput {
    /// Locate the job's artifacts by their deterministic names.
    pub fn locate(kind: JobKind, options: &JobOptions) -> JobResult<Self> {
        let result = options.result_path(kind);
        if !result.is_file() {
            return Err(JobError::MissingArtifact {
                job: options.name.clone(),
                path: result,
            });
        }
        Ok(Self {
            job: options.name.clone(),
            kind,
            result,
            info: options.info_path(kind),
        })
    }

    /// Likelihood reported by a scoring or search job.
    pub fn likelihood(&self) -> JobResult<f64> {
        let marker = self.kind.score_marker().unwrap_or(ScoreMarker::GAMMA_SCORE);
        parse_score(&self.info, marker)
    }
}

/// Executes one candidate-producing or candidate-scoring job to completion.
///
/// Implementations must only touch files derived from `options` so that
/// concurrent jobs of distinct candidates never alias.
pub trait CandidateJobRunner: Send + Sync {
    fn run(&self, kind: JobKind, options: &JobOptions) -> JobResult<JobOutput>;
}

/// Runs the phylogenetics executables as child processes.
#[derive(Debug, Clone)]
pub struct ProcessJobRunner {
    executables: Executables,
}

impl ProcessJobRunner {
    pub fn new(executables: Executables) -> Self {
        Self { executables }
    }

    fn command(&self, kind: JobKind, options: &JobOptions) -> JobResult<Command> {
        let program = match kind {
            JobKind::Parsimony => &self.executables.parsimony,
            JobKind::MlSearch => &self.executables.ml_search,
            JobKind::GammaScore | JobKind::GammaSearch => &self.executables.gamma,
        };
        let mut cmd = Command::new(program);
        // All programs write their artifacts into the working directory.
        cmd.current_dir(&options.outdir);
        cmd.arg("-s").arg(absolute(&options.alignment)?);
        cmd.arg("-n").arg(&options.name);

        match kind {
            JobKind::Parsimony => {
                cmd.arg("-N").arg(options.num_trees.unwrap_or(1).to_string());
                cmd.arg("-p").arg(options.seed.unwrap_or(12345).to_string());
            }
            JobKind::MlSearch => {
                cmd.arg("-m").arg(&self.executables.search_model);
            }
            JobKind::GammaScore => {
                cmd.arg("-f").arg("e");
                cmd.arg("-m").arg(&self.executables.gamma_model);
            }
            JobKind::GammaSearch => {
                cmd.arg("-m").arg(&self.executables.gamma_model);
                cmd.arg("-N").arg(options.num_trees.unwrap_or(1).to_string());
                cmd.arg("-p").arg(options.seed.unwrap_or(12345).to_string());
            }
        }
        if let Some(tree) = &options.starting_tree {
            cmd.arg("-t").arg(absolute(tree)?);
        }
        if kind != JobKind::Parsimony {
            if let Some(partition) = &options.partition {
                cmd.arg("-q").arg(absolute(partition)?);
            }
            if let Some(threads) = options.num_threads {
                cmd.arg("-T").arg(threads.to_string());
            }
        } else if options.partition.is_some() {
            warn!(job = %options.name, "parsimony jobs ignore the partition file");
        }
        cmd.args(&options.flags);
        Ok(cmd)
    }
}

impl CandidateJobRunner for ProcessJobRunner {
    fn run(&self, kind: JobKind, options: &JobOptions) -> JobResult<JobOutput> {
        std::fs::create_dir_all(&options.outdir)?;
        let mut cmd = self.command(kind, options)?;
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::from(File::create(&options.stdout)?));
        cmd.stderr(Stdio::from(File::create(&options.stderr)?));

        debug!(job = %options.name, ?kind, "launching {:?}", cmd);
        let status = cmd.status().map_err(|e| JobError::SpawnFailed {
            job: options.name.clone(),
            program: cmd.get_program().to_string_lossy().into_owned(),
            message: e.to_string(),
        })?;
        if !status.success() {
            return Err(JobError::NonZeroExit {
                job: options.name.clone(),
                status: status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
            });
        }
        JobOutput::locate(kind, options)
    }
}

fn absolute(path: &Path) -> JobResult<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn artifact_names_derive_from_job_name() {
        let opts = JobOptions::new("ml_u0_c1_s124", "aln.phy", "/r/ml_trees");
        assert_eq!(
            opts.result_path(JobKind::MlSearch),
            PathBuf::from("/r/ml_trees/RAxML_result.ml_u0_c1_s124")
        );
        assert_eq!(
            opts.info_path(JobKind::GammaScore),
            PathBuf::from("/r/ml_trees/RAxML_info.ml_u0_c1_s124")
        );
        assert_eq!(opts.stdout, PathBuf::from("/r/ml_trees/info_ml_u0_c1_s124"));
        assert_eq!(JobKind::Parsimony.result_artifact("p"), "RAxML_parsimonyTree.p.0");
    }

    #[test]
    fn zero_threads_are_dropped() {
        let opts = JobOptions::new("j", "a", "o").with_threads(Some(0));
        assert_eq!(opts.num_threads, None);
        let opts = JobOptions::new("j", "a", "o").with_threads(Some(8));
        assert_eq!(opts.num_threads, Some(8));
    }

    #[test]
    fn command_line_for_ml_search() {
        let runner = ProcessJobRunner::new(Executables::default());
        let opts = JobOptions::new("ml_x", "/d/aln.phy", "/d/ml")
            .with_partition(Some(PathBuf::from("/d/part.txt")))
            .with_starting_tree("/d/start.nw")
            .with_threads(Some(4))
            .with_flag("-D");
        let cmd = runner.command(JobKind::MlSearch, &opts).unwrap();
        let args: Vec<String> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(cmd.get_program(), "raxmlLight");
        assert_eq!(
            args,
            vec![
                "-s", "/d/aln.phy", "-n", "ml_x", "-m", "GTRCAT", "-t", "/d/start.nw", "-q",
                "/d/part.txt", "-T", "4", "-D"
            ]
        );
    }

    #[test]
    fn missing_artifact_is_reported() {
        let dir = tempdir().unwrap();
        let opts = JobOptions::new("score_x", "aln", dir.path());
        let err = JobOutput::locate(JobKind::GammaScore, &opts).unwrap_err();
        assert!(matches!(err, JobError::MissingArtifact { .. }));

        std::fs::write(opts.result_path(JobKind::GammaScore), "(a,b,c);\n").unwrap();
        let out = JobOutput::locate(JobKind::GammaScore, &opts).unwrap();
        assert_eq!(out.info, dir.path().join("RAxML_info.score_x"));
    }

    #[test]
    fn spawn_failure_is_a_job_error() {
        let dir = tempdir().unwrap();
        let executables = Executables {
            parsimony: PathBuf::from("/nonexistent/parsimonator"),
            ..Executables::default()
        };
        let runner = ProcessJobRunner::new(executables);
        let opts = JobOptions::new("parsimony_x", dir.path().join("aln"), dir.path()).with_seed(1);
        let err = runner.run(JobKind::Parsimony, &opts).unwrap_err();
        assert!(matches!(err, JobError::SpawnFailed { .. }));
    }
}

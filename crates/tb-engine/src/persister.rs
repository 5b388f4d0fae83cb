//! Writing and reading best bunches.

use chrono::Utc;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::Path;
use tb_jobs::newick_statements;
use tb_types::{
    internal_error, BestBunch, BunchEntry, BunchManifest, BunchPaths, Ranking, TbResult,
};
use tracing::{debug, info};

/// Persists the top-K of a ranking as the round's best bunch.
#[derive(Debug, Clone, Copy, Default)]
pub struct BestSetPersister;

impl BestSetPersister {
    /// Write bundle and manifest, then the completion marker.
    pub fn persist(
        ranking: &Ranking,
        keep_count: usize,
        destination: &Path,
    ) -> TbResult<BestBunch> {
        let bunch = Self::write(ranking, keep_count, destination)?;
        Self::mark_complete(&bunch)?;
        Ok(bunch)
    }

    /// Write the first `keep_count` ranked trees and the order manifest.
    ///
    /// The bunch is not usable as a seed until [`mark_complete`] has run.
    ///
    /// [`mark_complete`]: BestSetPersister::mark_complete
    pub fn write(ranking: &Ranking, keep_count: usize, destination: &Path) -> TbResult<BestBunch> {
        let paths = BunchPaths::for_bundle(destination);
        if paths.is_complete() {
            return Err(internal_error!(
                "best bunch {} is already marked complete",
                paths.bundle.display()
            ));
        }

        let mut bundle = String::new();
        let mut entries = Vec::new();
        for (rank, evaluated) in ranking.top(keep_count).iter().enumerate() {
            let text = fs::read_to_string(&evaluated.refined_tree)?;
            let tree = newick_statements(&text)
                .map_err(|e| internal_error!("{}: {e}", evaluated.refined_tree.display()))?
                .into_iter()
                .next()
                .ok_or_else(|| {
                    internal_error!("{} holds no tree", evaluated.refined_tree.display())
                })?;
            bundle.push_str(&tree);
            bundle.push('\n');
            entries.push(BunchEntry {
                rank,
                candidate: evaluated.candidate.name(),
                lh: evaluated.lh,
                source_tree: evaluated.refined_tree.clone(),
            });
        }

        atomic_write_bytes(&paths.bundle, bundle.as_bytes())?;
        let manifest = BunchManifest {
            update_id: ranking.update_id,
            keep_count,
            entries: entries.clone(),
            written_at: Utc::now(),
        };
        atomic_write_json(&paths.manifest, &manifest)?;
        debug!(bundle = %paths.bundle.display(), trees = entries.len(), "wrote best bunch");

        Ok(BestBunch {
            update_id: ranking.update_id,
            paths,
            entries,
        })
    }

    /// Record that bundle and manifest are durable.
    pub fn mark_complete(bunch: &BestBunch) -> TbResult<()> {
        let marker = format!(
            "update {} complete: {} trees\n",
            bunch.update_id,
            bunch.entries.len()
        );
        atomic_write_bytes(&bunch.paths.marker, marker.as_bytes())?;
        info!(update_id = bunch.update_id, "best bunch marked complete");
        Ok(())
    }

    /// Load a completed bunch; `None` when the completion marker is absent.
    pub fn load(paths: &BunchPaths) -> TbResult<Option<BestBunch>> {
        if !paths.is_complete() {
            return Ok(None);
        }
        let manifest: BunchManifest = serde_json::from_slice(&fs::read(&paths.manifest)?)?;
        Ok(Some(BestBunch {
            update_id: manifest.update_id,
            paths: paths.clone(),
            entries: manifest.entries,
        }))
    }
}

pub(crate) fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> TbResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

/// Write via a synced temp file and rename, so readers never see a torn file.
pub(crate) fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> TbResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        name,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranker::ResultRanker;
    use std::path::PathBuf;
    use tb_types::{CandidateId, CandidateTree, EvaluatedCandidate, Provenance};
    use tempfile::tempdir;

    fn ranking_in(dir: &Path, lhs: &[f64]) -> Ranking {
        let candidates = lhs
            .iter()
            .enumerate()
            .map(|(index, lh)| {
                let refined = dir.join(format!("RAxML_result.ml_{index}"));
                fs::write(&refined, format!("((t{index},b),c,d);\n")).unwrap();
                let id = CandidateId { update_id: 2, index, parent: None, seed: index as u64 };
                let tree = CandidateTree::new(id, None, PathBuf::from("start.nw"));
                let provenance = Provenance {
                    search_job: format!("ml_{index}"),
                    score_job: format!("score_{index}"),
                    search_output: refined.clone(),
                    score_info: dir.join(format!("RAxML_info.score_{index}")),
                };
                EvaluatedCandidate::new(tree, refined, *lh, provenance)
            })
            .collect();
        ResultRanker::rank(2, candidates).unwrap()
    }

    #[test]
    fn persists_exactly_top_k_in_rank_order() {
        let dir = tempdir().unwrap();
        let ranking = ranking_in(dir.path(), &[-30.0, -10.0, -20.0, -40.0]);
        let dest = dir.path().join("best/best_bunch.nw");

        let bunch = BestSetPersister::persist(&ranking, 2, &dest).unwrap();
        assert_eq!(bunch.len(), 2);
        assert_eq!(bunch.best_lh(), Some(-10.0));
        assert!(bunch.paths.is_complete());

        let bundle = fs::read_to_string(&dest).unwrap();
        assert_eq!(bundle, "((t1,b),c,d);\n((t2,b),c,d);\n");

        let loaded = BestSetPersister::load(&bunch.paths).unwrap().unwrap();
        assert_eq!(loaded.entries, bunch.entries);
        assert_eq!(loaded.entries[1].rank, 1);
        assert_eq!(loaded.entries[1].candidate, "u2_c2_s2");
    }

    #[test]
    fn keep_count_is_clamped_to_available() {
        let dir = tempdir().unwrap();
        let ranking = ranking_in(dir.path(), &[-1.0, -2.0]);
        let bunch = BestSetPersister::persist(&ranking, 5, &dir.path().join("b.nw")).unwrap();
        assert_eq!(bunch.len(), 2);
    }

    #[test]
    fn unmarked_bunch_is_not_loadable() {
        let dir = tempdir().unwrap();
        let ranking = ranking_in(dir.path(), &[-1.0, -2.0, -3.0]);
        let bunch = BestSetPersister::write(&ranking, 2, &dir.path().join("b.nw")).unwrap();

        // Bundle and manifest exist, marker does not: detectably incomplete
        assert!(bunch.paths.bundle.is_file());
        assert!(bunch.paths.manifest.is_file());
        assert!(BestSetPersister::load(&bunch.paths).unwrap().is_none());

        BestSetPersister::mark_complete(&bunch).unwrap();
        assert!(BestSetPersister::load(&bunch.paths).unwrap().is_some());
    }

    #[test]
    fn completed_bunch_is_never_overwritten() {
        let dir = tempdir().unwrap();
        let ranking = ranking_in(dir.path(), &[-1.0]);
        let dest = dir.path().join("b.nw");
        BestSetPersister::persist(&ranking, 1, &dest).unwrap();
        assert!(BestSetPersister::persist(&ranking, 1, &dest).is_err());
    }

    #[test]
    fn atomic_write_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        atomic_write_bytes(&dir.path().join("x.txt"), b"hello").unwrap();
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["x.txt".to_string()]);
    }
}

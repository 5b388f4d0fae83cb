use std::cmp::Ordering;
use tb_types::{EvaluatedCandidate, IterationError, Ranking, UpdateId};

/// Orders evaluated candidates by likelihood, best first.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultRanker;

impl ResultRanker {
    /// Rank by `lh` descending; equal likelihoods keep creation order.
    ///
    /// The comparison is exact (no tolerance). Scores are finite by the time
    /// they get here, so the order is total and independent of the order in
    /// which the candidates finished.
    pub fn rank(
        update_id: UpdateId,
        mut candidates: Vec<EvaluatedCandidate>,
    ) -> Result<Ranking, IterationError> {
        if candidates.is_empty() {
            return Err(IterationError::EmptyCandidateSet);
        }
        candidates.sort_by(|a, b| {
            b.lh.partial_cmp(&a.lh)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.creation_index().cmp(&b.creation_index()))
        });
        Ok(Ranking {
            update_id,
            entries: candidates,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tb_types::{CandidateId, CandidateTree, Provenance};

    fn evaluated(index: usize, lh: f64) -> EvaluatedCandidate {
        let id = CandidateId { update_id: 0, index, parent: None, seed: 123 + index as u64 };
        let tree = CandidateTree::new(id, None, PathBuf::from(format!("p{index}.nw")));
        let provenance = Provenance {
            search_job: format!("ml_{index}"),
            score_job: format!("score_{index}"),
            search_output: PathBuf::from(format!("ml{index}")),
            score_info: PathBuf::from(format!("info{index}")),
        };
        EvaluatedCandidate::new(tree, PathBuf::from(format!("r{index}.nw")), lh, provenance)
    }

    fn order(ranking: &Ranking) -> Vec<usize> {
        ranking.entries.iter().map(|e| e.creation_index()).collect()
    }

    #[test]
    fn ties_broken_by_creation_order() {
        let lhs = [-5000.1, -4998.3, -5001.9, -4998.3];
        let candidates = lhs.iter().enumerate().map(|(i, lh)| evaluated(i, *lh)).collect();
        let ranking = ResultRanker::rank(0, candidates).unwrap();

        assert_eq!(order(&ranking), vec![1, 3, 0, 2]);
        assert_eq!(ranking.best().unwrap().lh, -4998.3);
        assert_eq!(ranking.likelihoods(), vec![-4998.3, -4998.3, -5000.1, -5001.9]);
    }

    #[test]
    fn ranking_independent_of_completion_order() {
        let lhs = [-10.5, -9.25, -10.5, -11.0, -9.25, -8.0];
        let forward: Vec<_> = lhs.iter().enumerate().map(|(i, lh)| evaluated(i, *lh)).collect();
        let mut reversed = forward.clone();
        reversed.reverse();
        let mut rotated = forward.clone();
        rotated.rotate_left(4);

        let expected = order(&ResultRanker::rank(0, forward).unwrap());
        assert_eq!(expected, vec![5, 1, 4, 0, 2, 3]);
        assert_eq!(order(&ResultRanker::rank(0, reversed).unwrap()), expected);
        assert_eq!(order(&ResultRanker::rank(0, rotated).unwrap()), expected);
    }

    #[test]
    fn no_tolerance_collapsing() {
        let candidates = vec![evaluated(0, -100.0), evaluated(1, -100.0 + 1e-9)];
        let ranking = ResultRanker::rank(0, candidates).unwrap();
        assert_eq!(order(&ranking), vec![1, 0]);
    }

    #[test]
    fn empty_input_is_rejected() {
        let err = ResultRanker::rank(0, Vec::new()).unwrap_err();
        assert!(matches!(err, IterationError::EmptyCandidateSet));
    }
}

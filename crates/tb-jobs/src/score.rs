//! Reading a likelihood out of a job's info stream.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tb_types::{JobError, JobResult};

/// Fixed textual prefix of the line carrying the score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreMarker(pub &'static str);

impl ScoreMarker {
    pub const GAMMA_SCORE: ScoreMarker = ScoreMarker("Final GAMMA  likelihood:");
    pub const GAMMA_SEARCH: ScoreMarker = ScoreMarker("Final GAMMA-based Score of best tree");
}

/// Parse the trailing numeric field of the first line starting with `marker`.
pub fn parse_score(path: &Path, marker: ScoreMarker) -> JobResult<f64> {
    let reader = BufReader::new(File::open(path)?);
    for line in reader.lines() {
        let line = line?;
        if !line.starts_with(marker.0) {
            continue;
        }
        let field = line[marker.0.len()..]
            .split_whitespace()
            .last()
            .unwrap_or_default();
        // Non-finite scores cannot take part in a total order.
        return match field.parse::<f64>() {
            Ok(lh) if lh.is_finite() => Ok(lh),
            _ => Err(JobError::InvalidScore {
                value: field.to_string(),
                path: path.to_path_buf(),
            }),
        };
    }
    Err(JobError::ScoreNotFound {
        marker: marker.0.to_string(),
        path: path.to_path_buf(),
    })
}

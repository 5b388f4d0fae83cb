//! Splitting a multi-tree bundle into one-tree-per-file.

use std::path::{Path, PathBuf};
use tb_types::{JobError, JobResult};
use tracing::debug;

/// Writes one file per tree of a bundle, named `<prefix>_<i>.nw`.
pub trait TreeSetSplitter: Send + Sync {
    /// Returns the written files in bundle order.
    fn split(&self, bundle: &Path, prefix: &Path) -> JobResult<Vec<PathBuf>>;
}

/// Splitter for Newick bundles (one or more `;`-terminated trees).
#[derive(Debug, Clone, Copy, Default)]
pub struct NewickSplitter;

impl TreeSetSplitter for NewickSplitter {
    fn split(&self, bundle: &Path, prefix: &Path) -> JobResult<Vec<PathBuf>> {
        let text = std::fs::read_to_string(bundle)?;
        let trees = newick_statements(&text).map_err(|message| JobError::SplitFailed {
            path: bundle.to_path_buf(),
            message,
        })?;
        if trees.is_empty() {
            return Err(JobError::SplitFailed {
                path: bundle.to_path_buf(),
                message: "bundle contains no trees".to_string(),
            });
        }

        let stem = prefix
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("tree")
            .to_string();
        let mut written = Vec::with_capacity(trees.len());
        for (i, tree) in trees.iter().enumerate() {
            let path = prefix.with_file_name(format!("{stem}_{i}.nw"));
            std::fs::write(&path, format!("{tree}\n"))?;
            written.push(path);
        }
        debug!(bundle = %bundle.display(), trees = written.len(), "split tree bundle");
        Ok(written)
    }
}

/// Split Newick text into complete `...;` statements.
///
/// Semicolons inside quoted labels or `[...]` comments do not terminate a tree.
pub fn newick_statements(text: &str) -> Result<Vec<String>, String> {
    let mut trees = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut comment_depth = 0usize;

    for ch in text.chars() {
        match ch {
            '\'' if comment_depth == 0 => in_quote = !in_quote,
            '[' if !in_quote => comment_depth += 1,
            ']' if !in_quote => {
                comment_depth = comment_depth
                    .checked_sub(1)
                    .ok_or_else(|| "unbalanced ']'".to_string())?;
            }
            _ => {}
        }
        if ch.is_whitespace() && !in_quote && current.is_empty() {
            continue;
        }
        current.push(ch);
        if ch == ';' && !in_quote && comment_depth == 0 {
            trees.push(current.trim().to_string());
            current.clear();
        }
    }

    if in_quote || comment_depth > 0 {
        return Err("unterminated quote or comment".to_string());
    }
    if !current.trim().is_empty() {
        return Err("trailing tree without ';'".to_string());
    }
    Ok(trees)
}

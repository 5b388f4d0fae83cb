//! Progress log sinks injected into the coordinator.

use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

/// Human-readable progress stream with a distinct milestone severity.
pub trait ProgressLog: Send + Sync {
    fn info(&self, msg: &str);
    fn error(&self, msg: &str);
    /// Major milestones (round start/finish, phase boundaries).
    fn success(&self, msg: &str);
}

/// Forwards progress to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLog;

impl ProgressLog for TracingLog {
    fn info(&self, msg: &str) {
        info!("{msg}");
    }

    fn error(&self, msg: &str) {
        error!("{msg}");
    }

    fn success(&self, msg: &str) {
        info!(milestone = true, "{msg}");
    }
}

/// Append-only iteration log file.
///
/// Each message is written with a single `write_all` under the lock, so
/// lines from concurrently finishing jobs never interleave.
#[derive(Debug)]
pub struct FileLog {
    file: Mutex<File>,
    echo: bool,
}

impl FileLog {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
            echo: false,
        })
    }

    /// Also print to the console, red for errors and green for milestones.
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    fn write(&self, level: &str, color: Option<&str>, msg: &str) {
        let stamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string();
        let mut record = String::new();
        for line in msg.lines().filter(|l| !l.is_empty()) {
            record.push_str(&format!("{stamp} {level:<5} {line}\n"));
        }
        if record.is_empty() {
            return;
        }

        let mut file = self.file.lock();
        if let Err(e) = file.write_all(record.as_bytes()) {
            error!("failed to append to iteration log: {e}");
        }
        drop(file);

        if self.echo {
            match color {
                Some(code) => println!("\x1b[{code}m{msg}\x1b[0m"),
                None => println!("{msg}"),
            }
        }
    }
}

impl ProgressLog for FileLog {
    fn info(&self, msg: &str) {
        self.write("INFO", None, msg);
    }

    fn error(&self, msg: &str) {
        self.write("ERROR", Some("31"), msg);
    }

    fn success(&self, msg: &str) {
        self.write("INFO", Some("32"), msg);
    }
}

/// Sends every message to each inner sink.
#[derive(Clone, Default)]
pub struct Tee {
    sinks: Vec<Arc<dyn ProgressLog>>,
}

impl Tee {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn ProgressLog>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl ProgressLog for Tee {
    fn info(&self, msg: &str) {
        self.sinks.iter().for_each(|s| s.info(msg));
    }

    fn error(&self, msg: &str) {
        self.sinks.iter().for_each(|s| s.error(msg));
    }

    fn success(&self, msg: &str) {
        self.sinks.iter().for_each(|s| s.success(msg));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;
    use tempfile::tempdir;

    #[test]
    fn file_log_writes_levels() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs/iteration.log");
        let log = FileLog::open(&path).unwrap();
        log.info("Preparing new iteration...");
        log.success("step 1 of 2\n----");
        log.error("prev bunch not ready");

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].ends_with("INFO  Preparing new iteration..."));
        assert!(lines[2].ends_with("INFO  ----"));
        assert!(lines[3].contains("ERROR prev bunch not ready"));
    }

    #[test]
    fn concurrent_writes_stay_line_atomic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("iteration.log");
        let log = FileLog::open(&path).unwrap();

        (0..200).into_par_iter().for_each(|i| {
            log.info(&format!("candidate {i} scored {}", "x".repeat(64)));
        });

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 200);
        for line in text.lines() {
            assert!(line.contains("INFO  candidate "), "corrupted line: {line}");
            assert!(line.ends_with(&"x".repeat(64)));
        }
    }

    #[test]
    fn tee_fans_out() {
        let dir = tempdir().unwrap();
        let a = Arc::new(FileLog::open(&dir.path().join("a.log")).unwrap());
        let b = Arc::new(FileLog::open(&dir.path().join("b.log")).unwrap());
        let tee = Tee::new().with(a).with(b).with(Arc::new(TracingLog));
        tee.success("****** Start iteration no 0 ********");

        for name in ["a.log", "b.log"] {
            let text = std::fs::read_to_string(dir.path().join(name)).unwrap();
            assert!(text.contains("Start iteration no 0"));
        }
    }
}

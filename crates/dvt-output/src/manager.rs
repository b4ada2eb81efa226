use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dvt_error::{DvResult, ErrorCode, ErrorRecord, dv_err};
use tracing::info;

use crate::summary::RunSummary;
use crate::writer::{LineWriter, LineWriterShutdownHandle};

/// Time source for progress-log timestamps, injected so tests (and any
/// embedder) control the clock instead of a module-level global.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Owns the three artifacts of a run: `<base>.errors.jsonl`,
/// `<base>.progress.log` and `<base>.summary.json`.
///
/// Error and progress lines go through flush-on-write background writers, so
/// everything logged is durable before the run exits. The summary is written
/// once, by [finish](OutputManager::finish), as the final step.
pub struct OutputManager {
    errors_path: PathBuf,
    progress_path: PathBuf,
    summary_path: PathBuf,
    errors: LineWriter,
    errors_handle: Mutex<LineWriterShutdownHandle>,
    progress: LineWriter,
    progress_handle: Mutex<LineWriterShutdownHandle>,
    clock: Box<dyn Clock>,
    /// Running histogram over classified patterns, folded into the summary.
    patterns: Mutex<BTreeMap<String, u64>>,
    errors_logged: Mutex<u64>,
}

impl OutputManager {
    pub fn create(base: &Path) -> DvResult<Self> {
        Self::with_clock(base, Box::new(SystemClock))
    }

    pub fn with_clock(base: &Path, clock: Box<dyn Clock>) -> DvResult<Self> {
        if let Some(parent) = base.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let errors_path = with_suffix(base, "errors.jsonl");
        let progress_path = with_suffix(base, "progress.log");
        let summary_path = with_suffix(base, "summary.json");

        let (errors, errors_handle) = LineWriter::new(BufWriter::new(File::create(&errors_path)?));
        let (progress, progress_handle) =
            LineWriter::new(BufWriter::new(File::create(&progress_path)?));
        Ok(OutputManager {
            errors_path,
            progress_path,
            summary_path,
            errors,
            errors_handle: Mutex::new(errors_handle),
            progress,
            progress_handle: Mutex::new(progress_handle),
            clock,
            patterns: Mutex::new(BTreeMap::new()),
            errors_logged: Mutex::new(0),
        })
    }

    pub fn errors_path(&self) -> &Path {
        &self.errors_path
    }

    pub fn progress_path(&self) -> &Path {
        &self.progress_path
    }

    pub fn summary_path(&self) -> &Path {
        &self.summary_path
    }

    /// Appends one JSONL error record; the line is durable when this returns.
    pub fn record_error(&self, record: &ErrorRecord) -> DvResult<()> {
        let line = serde_json::to_string(record)?;
        self.errors.write_line(&line)?;
        *self.errors_logged.lock().unwrap() += 1;
        if let Some(pattern) = &record.pattern {
            *self.patterns.lock().unwrap().entry(pattern.to_string()).or_insert(0) += 1;
        }
        Ok(())
    }

    /// Appends a `[HH:MM:SS] message` line to the progress log.
    pub fn progress(&self, message: &str) -> DvResult<()> {
        let stamp = self.clock.now().format("%H:%M:%S");
        self.progress.write_line(&format!("[{stamp}] {message}"))
    }

    pub fn errors_logged(&self) -> u64 {
        *self.errors_logged.lock().unwrap()
    }

    /// The pattern histogram accumulated from recorded errors.
    pub fn pattern_histogram(&self) -> BTreeMap<String, u64> {
        self.patterns.lock().unwrap().clone()
    }

    /// Writes the summary and closes the writers. Must be the last call; it
    /// runs even when the run was cancelled, so a partial run still leaves a
    /// summary with `success=false` behind.
    pub fn finish(self, summary: &RunSummary) -> DvResult<()> {
        let json = serde_json::to_string_pretty(summary)?;
        std::fs::write(&self.summary_path, json)?;
        info!(path = %self.summary_path.display(), "run summary written");

        self.errors_handle
            .lock()
            .map_err(|_| dv_err!(ErrorCode::IoError, "errors writer lock poisoned"))?
            .shutdown()?;
        self.progress_handle
            .lock()
            .map_err(|_| dv_err!(ErrorCode::IoError, "progress writer lock poisoned"))?
            .shutdown()?;
        Ok(())
    }
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "run".to_string());
    name.push('.');
    name.push_str(suffix);
    base.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use dvt_error::ErrorPattern;

    struct FixedClock;

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap()
        }
    }

    fn summary() -> RunSummary {
        RunSummary::new(
            "export/archive",
            "https://target.crm.dynamics.com",
            crate::summary::ExecutionContext::current("create", vec![]),
        )
    }

    #[test]
    fn test_files_are_created_under_base() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("run-1");
        let manager = OutputManager::create(&base).unwrap();
        assert_eq!(manager.errors_path(), dir.path().join("run-1.errors.jsonl"));
        assert_eq!(manager.progress_path(), dir.path().join("run-1.progress.log"));
        assert_eq!(manager.summary_path(), dir.path().join("run-1.summary.json"));
        manager.finish(&summary()).unwrap();
    }

    #[test]
    fn test_errors_are_durable_before_finish() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("run");
        let manager = OutputManager::create(&base).unwrap();

        manager
            .record_error(
                &ErrorRecord::new("account", "boom").with_pattern(ErrorPattern::DuplicateRecord),
            )
            .unwrap();
        manager
            .record_error(
                &ErrorRecord::new("contact", "boom2").with_pattern(ErrorPattern::DuplicateRecord),
            )
            .unwrap();

        // flush-on-write: readable while the manager is still running
        wait_for_lines(manager.errors_path(), 2);
        let contents = std::fs::read_to_string(manager.errors_path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(value.get("entity").is_some());
            assert!(value.get("timestamp").is_some());
        }
        assert_eq!(manager.errors_logged(), 2);
        assert_eq!(manager.pattern_histogram()["DuplicateRecord"], 2);
        manager.finish(&summary()).unwrap();
    }

    #[test]
    fn test_progress_line_format() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("run");
        let manager = OutputManager::with_clock(&base, Box::new(FixedClock)).unwrap();
        manager.progress("Tier 1 started (account, contact)").unwrap();
        manager.finish(&summary()).unwrap();

        let contents = std::fs::read_to_string(dir.path().join("run.progress.log")).unwrap();
        assert_eq!(contents, "[09:26:53] Tier 1 started (account, contact)\n");
    }

    #[test]
    fn test_summary_written_on_finish() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("run");
        let manager = OutputManager::create(&base).unwrap();
        let mut s = summary();
        s.success = false;
        s.records_failed = 7;
        manager.finish(&s).unwrap();

        let contents = std::fs::read_to_string(dir.path().join("run.summary.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["recordsFailed"], 7);
    }

    /// The writer thread races the assertion; poll briefly.
    fn wait_for_lines(path: &Path, expected: usize) {
        for _ in 0..100 {
            if std::fs::read_to_string(path)
                .map(|c| c.lines().count() >= expected)
                .unwrap_or(false)
            {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
    }
}

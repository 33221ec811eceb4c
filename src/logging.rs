//! Daemon logging: stderr plus a daily rotating file under the data
//! directory.
//!
//! [`RotatingFileWriter`] writes to daily log files named
//! `hark-YYYY-MM-DD.log`. On creation it removes files older than
//! [`MAX_LOG_AGE_DAYS`] days or beyond the [`MAX_LOG_FILES`] file limit
//! (oldest first). [`init`] layers it under the `tracing` subscriber
//! behind a non-blocking writer.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::error::Result;

/// Maximum age (in days) of log files to keep.
pub const MAX_LOG_AGE_DAYS: u64 = 7;

/// Maximum number of log files to keep.
pub const MAX_LOG_FILES: usize = 10;

/// Install the global subscriber: human-readable stderr output plus a
/// rotating file layer. The returned guard flushes the file writer on
/// drop and must be held for the life of the process.
///
/// The filter honors `RUST_LOG`; the default keeps transport crates
/// quiet.
///
/// # Errors
///
/// Returns an error if the log directory or today's file cannot be
/// created.
pub fn init(log_dir: &Path) -> Result<WorkerGuard> {
    let writer = RotatingFileWriter::open(log_dir)?;
    let (file_writer, guard) = tracing_appender::non_blocking(writer);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("hark=info,hyper=warn,mio=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .init();

    Ok(guard)
}

/// A rotating file log writer.
///
/// Opens (or creates) today's log file and prunes old log files on
/// construction. Subsequent writes go to the same file for the lifetime
/// of this instance.
pub struct RotatingFileWriter {
    path: PathBuf,
    file: File,
}

impl RotatingFileWriter {
    /// Open (or create) today's log file in `log_dir`, pruning old files.
    ///
    /// # Errors
    ///
    /// Returns an `io::Error` if the directory cannot be created or
    /// today's log file cannot be opened.
    pub fn open(log_dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;

        // Prune old log files before opening today's file.
        prune_old_logs(log_dir);

        let filename = today_log_filename();
        let path = log_dir.join(&filename);
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;

        Ok(Self { path, file })
    }

    /// Return the path of the log file currently being written.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Write for RotatingFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Generate today's log filename in `hark-YYYY-MM-DD.log` format.
fn today_log_filename() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let (y, m, d) = days_to_ymd(secs / 86_400);
    format!("hark-{y:04}-{m:02}-{d:02}.log")
}

/// Remove log files older than [`MAX_LOG_AGE_DAYS`] or beyond
/// [`MAX_LOG_FILES`].
fn prune_old_logs(log_dir: &Path) {
    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs(MAX_LOG_AGE_DAYS * 86_400))
        .unwrap_or(UNIX_EPOCH);
    prune_old_logs_with_cutoff(log_dir, cutoff, MAX_LOG_FILES);
}

/// Inner prune implementation with injectable cutoff for testing.
fn prune_old_logs_with_cutoff(log_dir: &Path, cutoff: SystemTime, max_files: usize) {
    // Collect all hark-*.log files with their modification times.
    let mut entries: Vec<(PathBuf, SystemTime)> = match fs::read_dir(log_dir) {
        Ok(dir) => dir
            .flatten()
            .filter_map(|e| {
                let path = e.path();
                let name = path.file_name()?.to_str()?.to_owned();
                if name.starts_with("hark-") && name.ends_with(".log") {
                    let mtime = path.metadata().ok()?.modified().ok()?;
                    Some((path, mtime))
                } else {
                    None
                }
            })
            .collect(),
        Err(_) => return,
    };

    // Sort newest first.
    entries.sort_by(|a, b| b.1.cmp(&a.1));

    for (i, (path, mtime)) in entries.iter().enumerate() {
        let too_old = *mtime < cutoff;
        let over_limit = i >= max_files;
        if too_old || over_limit {
            let _ = fs::remove_file(path);
        }
    }
}

/// Convert days since Unix epoch to (year, month, day).
///
/// Uses Howard Hinnant's `civil_from_days` algorithm.
fn days_to_ymd(days: u64) -> (u64, u64, u64) {
    let z = days as i64 + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };
    (y as u64, m, d)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn today_log_filename_has_correct_format() {
        let name = today_log_filename();
        assert!(name.starts_with("hark-"), "should start with hark-: {name}");
        assert!(name.ends_with(".log"), "should end with .log: {name}");
        // hark-YYYY-MM-DD.log = 19 chars
        assert_eq!(name.len(), 19, "unexpected length: {name}");
    }

    #[test]
    fn rotating_writer_creates_and_appends() {
        let tmp = tempfile::TempDir::new().unwrap();
        let log_dir = tmp.path().to_path_buf();

        {
            let mut w = RotatingFileWriter::open(&log_dir).unwrap();
            writeln!(w, "first line").unwrap();
        }
        {
            let mut w = RotatingFileWriter::open(&log_dir).unwrap();
            writeln!(w, "second line").unwrap();
            assert!(w.path().exists());
        }

        let content = fs::read_to_string(log_dir.join(today_log_filename())).unwrap();
        assert!(content.contains("first line"), "first line should persist");
        assert!(
            content.contains("second line"),
            "second line should be appended"
        );
    }

    #[test]
    fn prune_removes_files_over_limit() {
        let tmp = tempfile::TempDir::new().unwrap();
        let log_dir = tmp.path().to_path_buf();

        let total = MAX_LOG_FILES + 3;
        for i in 0..total {
            let name = format!("hark-2025-01-{:02}.log", i + 1);
            fs::write(log_dir.join(&name), format!("line {i}")).unwrap();
            // Small sleep to ensure distinct modification times.
            std::thread::sleep(Duration::from_millis(2));
        }

        prune_old_logs(&log_dir);

        let remaining = fs::read_dir(&log_dir)
            .unwrap()
            .flatten()
            .filter(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                name.starts_with("hark-") && name.ends_with(".log")
            })
            .count();

        assert!(
            remaining <= MAX_LOG_FILES,
            "should have at most {MAX_LOG_FILES} log files, got {remaining}"
        );
    }

    #[test]
    fn prune_removes_old_files_via_cutoff() {
        let tmp = tempfile::TempDir::new().unwrap();
        let log_dir = tmp.path().to_path_buf();

        let path_a = log_dir.join("hark-2025-01-01.log");
        let path_b = log_dir.join("hark-2025-01-02.log");
        fs::write(&path_a, "a").unwrap();
        std::thread::sleep(Duration::from_millis(5));
        fs::write(&path_b, "b").unwrap();

        // A cutoff in the future makes every existing file look old.
        let future_cutoff = SystemTime::now() + Duration::from_secs(3600);
        prune_old_logs_with_cutoff(&log_dir, future_cutoff, MAX_LOG_FILES);

        assert!(
            !path_a.exists() && !path_b.exists(),
            "all files older than cutoff should be pruned"
        );
    }

    #[test]
    fn days_to_ymd_epoch_is_1970_01_01() {
        assert_eq!(days_to_ymd(0), (1970, 1, 1));
    }

    #[test]
    fn pruning_ignores_unrelated_files() {
        let tmp = tempfile::TempDir::new().unwrap();
        let log_dir = tmp.path().to_path_buf();

        let keep = log_dir.join("notes.txt");
        fs::write(&keep, "keep me").unwrap();

        let future_cutoff = SystemTime::now() + Duration::from_secs(3600);
        prune_old_logs_with_cutoff(&log_dir, future_cutoff, 0);

        assert!(keep.exists(), "non-log files must not be pruned");
    }
}

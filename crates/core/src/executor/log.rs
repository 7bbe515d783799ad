//! Per-worker log files.
//!
//! Every non-protocol line a worker prints, on either stream, is appended to
//! `<log_dir>/worker_<id>.log`. Files are opened on first write, so workers
//! that print nothing leave no file behind.

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::error::SupervisorError;

/// Path of the log file for `worker_id`.
pub fn log_path(log_dir: &Path, worker_id: usize) -> PathBuf {
    log_dir.join(format!("worker_{worker_id}.log"))
}

/// Creates `log_dir` and, when `truncate` is set, removes stale logs of
/// workers `0..num_workers` left over from an earlier run.
pub async fn prepare_log_dir(
    log_dir: &Path,
    num_workers: usize,
    truncate: bool,
) -> Result<(), SupervisorError> {
    let dir_error = |source: io::Error| SupervisorError::LogDirectory {
        path: log_dir.to_path_buf(),
        source,
    };

    tokio::fs::create_dir_all(log_dir).await.map_err(dir_error)?;

    if truncate {
        for worker_id in 0..num_workers {
            let path = log_path(log_dir, worker_id);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path.display(), "Removed stale worker log"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(dir_error(e)),
            }
        }
    }

    Ok(())
}

/// Append-only log sink for one worker, shared by all of its attempts.
#[derive(Debug)]
pub struct WorkerLog {
    worker_id: usize,
    path: PathBuf,
    file: Option<File>,
    lines_written: u64,
}

impl WorkerLog {
    pub fn new(log_dir: &Path, worker_id: usize) -> Self {
        Self {
            worker_id,
            path: log_path(log_dir, worker_id),
            file: None,
            lines_written: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lines_written(&self) -> u64 {
        self.lines_written
    }

    /// Appends one line followed by a newline.
    pub async fn write_line(&mut self, line: &str) -> Result<(), SupervisorError> {
        let worker_id = self.worker_id;
        let write_error = |source: io::Error| SupervisorError::LogWrite { worker_id, source };

        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(write_error)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(write_error)?;
            self.file = Some(file);
        }

        if let Some(file) = self.file.as_mut() {
            let mut buf = Vec::with_capacity(line.len() + 1);
            buf.extend_from_slice(line.as_bytes());
            buf.push(b'\n');
            file.write_all(&buf).await.map_err(write_error)?;
        }

        self.lines_written += 1;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), SupervisorError> {
        if let Some(file) = self.file.as_mut() {
            let worker_id = self.worker_id;
            file.flush()
                .await
                .map_err(|source| SupervisorError::LogWrite { worker_id, source })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_log_path() {
        assert_eq!(
            log_path(Path::new("logs"), 3),
            PathBuf::from("logs/worker_3.log")
        );
    }

    #[tokio::test]
    async fn test_file_created_on_first_write() {
        let dir = TempDir::new().unwrap();
        let mut log = WorkerLog::new(&dir.path().join("nested"), 0);
        assert!(!log.path().exists());

        log.write_line("first").await.unwrap();
        log.write_line("second").await.unwrap();
        log.flush().await.unwrap();

        let content = tokio::fs::read_to_string(log.path()).await.unwrap();
        assert_eq!(content, "first\nsecond\n");
        assert_eq!(log.lines_written(), 2);
    }

    #[tokio::test]
    async fn test_silent_worker_leaves_no_file() {
        let dir = TempDir::new().unwrap();
        let mut log = WorkerLog::new(dir.path(), 1);
        log.flush().await.unwrap();
        assert!(!log.path().exists());
    }

    #[tokio::test]
    async fn test_prepare_truncates_stale_logs() {
        let dir = TempDir::new().unwrap();
        let stale = log_path(dir.path(), 0);
        let foreign = dir.path().join("notes.txt");
        tokio::fs::write(&stale, "old run\n").await.unwrap();
        tokio::fs::write(&foreign, "keep\n").await.unwrap();

        prepare_log_dir(dir.path(), 2, true).await.unwrap();
        assert!(!stale.exists());
        assert!(foreign.exists());
    }

    #[tokio::test]
    async fn test_prepare_keeps_logs_without_truncate() {
        let dir = TempDir::new().unwrap();
        let existing = log_path(dir.path(), 0);
        tokio::fs::write(&existing, "old run\n").await.unwrap();

        prepare_log_dir(dir.path(), 1, false).await.unwrap();

        let mut log = WorkerLog::new(dir.path(), 0);
        log.write_line("new run").await.unwrap();
        log.flush().await.unwrap();
        let content = tokio::fs::read_to_string(&existing).await.unwrap();
        assert_eq!(content, "old run\nnew run\n");
    }

    #[tokio::test]
    async fn test_prepare_creates_directory() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("a").join("b");
        prepare_log_dir(&target, 4, true).await.unwrap();
        assert!(target.is_dir());
    }
}

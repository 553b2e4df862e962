//! Append-only transcript of everything the server sends.

use std::{
    io,
    path::{Path, PathBuf},
};

use chrono::Local;
use thiserror::Error;
use tokio::{
    fs::{File, OpenOptions},
    io::AsyncWriteExt,
};

/// Sortable, second-resolution, filesystem-safe timestamp.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H%M%S";

/// Current local time in `TIMESTAMP_FORMAT`.
#[must_use]
pub fn timestamp() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Session log error.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("Failed to open log {}: {source}", .path.display())]
    Open { path: PathBuf, source: io::Error },
    #[error("Failed to write log: {0}")]
    Write(#[from] io::Error),
}

/// Transcript file for one session.
#[derive(Debug)]
pub struct SessionLog {
    path: PathBuf,
    file: File,
    rotate: bool,
    created: bool,
    written: u64,
}

impl SessionLog {
    /// Open `path` for appending, creating it if needed.
    ///
    /// An existing transcript is appended to, never truncated.
    ///
    /// # Errors
    /// Returns error if the file cannot be opened.
    pub async fn open(path: impl Into<PathBuf>, rotate: bool) -> Result<Self, LogError> {
        let path = path.into();

        let created = !tokio::fs::try_exists(&path).await.unwrap_or(false);
        if !created {
            tracing::warn!(path = %path.display(), "log already exists; appending");
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| LogError::Open {
                path: path.clone(),
                source,
            })?;
        tracing::debug!(path = %path.display(), rotate, "log opened");

        Ok(Self {
            path,
            file,
            rotate,
            created,
            written: 0,
        })
    }

    /// Path of the active transcript.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written during this run.
    #[must_use]
    pub const fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Append `bytes` verbatim and flush.
    ///
    /// # Errors
    /// Returns error if the write fails.
    pub async fn append(&mut self, bytes: &[u8]) -> Result<(), LogError> {
        self.file.write_all(bytes).await?;
        self.file.flush().await?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    /// Record the start of the connection.
    ///
    /// # Errors
    /// Returns error if the write fails.
    pub async fn mark_connected(&mut self) -> Result<(), LogError> {
        let line = format!("~Connected at {}\n", timestamp());
        self.append(line.as_bytes()).await
    }

    /// Record that the server went away.
    ///
    /// # Errors
    /// Returns error if the write fails.
    pub async fn mark_lost(&mut self) -> Result<(), LogError> {
        let line = format!("\n~Connection lost at {}\n", timestamp());
        self.append(line.as_bytes()).await
    }

    /// Give up on a log that never saw a connection.
    ///
    /// A file this run created and never wrote to is removed; anything else
    /// goes through `close`.
    pub async fn abandon(self) -> Option<PathBuf> {
        if !self.created || self.written > 0 {
            return self.close().await;
        }
        drop(self.file);
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => tracing::debug!(path = %self.path.display(), "removed unused log"),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove unused log");
            }
        }
        None
    }

    /// Close the file and, unless rotation is disabled, rename it to a
    /// timestamped name in the same directory.
    ///
    /// Returns the rotated path. Failures are logged; the transcript stays
    /// readable under its canonical name.
    pub async fn close(self) -> Option<PathBuf> {
        tracing::debug!(path = %self.path.display(), "closing log");
        if let Err(e) = self.file.sync_all().await {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to sync log");
        }
        drop(self.file);

        if !self.rotate {
            tracing::debug!("log rotation is disabled");
            return None;
        }

        let target = match rotation_target(&self.path, &timestamp()).await {
            Ok(target) => target,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to pick rotation name");
                return None;
            }
        };

        match tokio::fs::rename(&self.path, &target).await {
            Ok(()) => {
                tracing::info!(from = %self.path.display(), to = %target.display(), "log rotated");
                Some(target)
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to rotate log");
                None
            }
        }
    }
}

/// Sibling path named after `stamp`, suffixed `.1`, `.2`, ... if taken.
async fn rotation_target(path: &Path, stamp: &str) -> io::Result<PathBuf> {
    let mut target = path.with_file_name(stamp);
    let mut n = 1u32;
    while tokio::fs::try_exists(&target).await? {
        target = path.with_file_name(format!("{stamp}.{n}"));
        n += 1;
    }
    Ok(target)
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDateTime;

    use super::*;

    fn is_timestamp(name: &str) -> bool {
        NaiveDateTime::parse_from_str(name, TIMESTAMP_FORMAT).is_ok()
    }

    #[test]
    fn test_timestamp_format() {
        let stamp = timestamp();
        assert_eq!(stamp.len(), "2006-01-02T150405".len());
        assert!(is_timestamp(&stamp), "{stamp}");
        assert!(!stamp.contains(':'));
    }

    #[tokio::test]
    async fn test_appends_to_existing_transcript() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        std::fs::write(&path, b"earlier\n").unwrap();

        let mut log = SessionLog::open(&path, false).await.unwrap();
        log.append(b"later\n").await.unwrap();
        assert_eq!(log.bytes_written(), 6);
        assert_eq!(log.close().await, None);

        assert_eq!(std::fs::read(&path).unwrap(), b"earlier\nlater\n");
    }

    #[tokio::test]
    async fn test_markers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");

        let mut log = SessionLog::open(&path, false).await.unwrap();
        log.mark_connected().await.unwrap();
        log.append(b"hello\n").await.unwrap();
        log.mark_lost().await.unwrap();
        log.close().await;

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("~Connected at "));
        assert_eq!(lines[1], "hello");
        assert_eq!(lines[2], "");
        assert!(lines[3].starts_with("~Connection lost at "));
        assert!(text.ends_with('\n'));
    }

    #[tokio::test]
    async fn test_rotation_frees_canonical_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");

        let mut log = SessionLog::open(&path, true).await.unwrap();
        log.append(b"transcript").await.unwrap();
        let rotated = log.close().await.unwrap();

        assert!(!path.exists());
        assert_eq!(rotated.parent(), Some(dir.path()));
        let name = rotated.file_name().unwrap().to_str().unwrap();
        assert!(is_timestamp(name), "{name}");
        assert_eq!(std::fs::read(&rotated).unwrap(), b"transcript");
    }

    #[tokio::test]
    async fn test_rotation_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        let stamp = "2024-01-02T030405";
        std::fs::write(dir.path().join(stamp), b"old").unwrap();
        std::fs::write(dir.path().join(format!("{stamp}.1")), b"older").unwrap();

        let target = rotation_target(&path, stamp).await.unwrap();
        assert_eq!(target, dir.path().join(format!("{stamp}.2")));
    }

    #[tokio::test]
    async fn test_empty_log_is_rotated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");

        let log = SessionLog::open(&path, true).await.unwrap();
        let rotated = log.close().await.unwrap();

        assert!(!path.exists());
        assert_eq!(std::fs::read(&rotated).unwrap(), b"");
    }

    #[tokio::test]
    async fn test_abandon_removes_unused_new_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");

        let log = SessionLog::open(&path, true).await.unwrap();
        assert_eq!(log.abandon().await, None);

        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_abandon_keeps_existing_transcript() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        std::fs::write(&path, b"earlier\n").unwrap();

        let log = SessionLog::open(&path, false).await.unwrap();
        assert_eq!(log.abandon().await, None);

        assert_eq!(std::fs::read(&path).unwrap(), b"earlier\n");
    }

    #[tokio::test]
    async fn test_open_fails_for_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("out");

        let err = SessionLog::open(&path, true).await.unwrap_err();
        assert!(matches!(err, LogError::Open { .. }));
    }
}

//! Named pipe used as the external write-in point.
//!
//! Any process can send commands to the remote server by writing into the
//! pipe. The relay holds the read side open in non-blocking mode.

use std::{
    fs::{File, OpenOptions},
    io::{self, Read},
    os::{
        fd::IntoRawFd,
        unix::fs::{FileTypeExt, OpenOptionsExt},
    },
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use nix::{
    fcntl::OFlag,
    sys::stat::Mode,
    unistd::{close, mkfifo, unlink},
};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// Literal answer that authorizes replacing an existing pipe.
pub const CONFIRM_TOKEN: &str = "YES";

/// Input channel error.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("Failed to inspect {}: {source}", .path.display())]
    Inspect { path: PathBuf, source: io::Error },
    #[error("Canceled: {} already exists; remove it before running", .0.display())]
    Declined(PathBuf),
    #[error("Failed to read confirmation: {0}")]
    Prompt(#[source] io::Error),
    #[error("Failed to remove stale pipe {}: {source}", .path.display())]
    Unlink { path: PathBuf, source: nix::Error },
    #[error("Failed to create pipe {}: {source}", .path.display())]
    Create { path: PathBuf, source: nix::Error },
    #[error("Failed to open pipe {}: {source}", .path.display())]
    Open { path: PathBuf, source: io::Error },
}

/// Decides whether an existing pipe may be unlinked and recreated.
///
/// An existing pipe means either a stale leftover from a crashed run or a
/// second instance started against the same session name.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    /// Ask for confirmation to replace the file at `path`.
    async fn confirm_replace(&self, path: &Path) -> io::Result<bool>;
}

/// Interactive confirmation on stdin.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdinPrompt;

#[async_trait]
impl ConflictResolver for StdinPrompt {
    async fn confirm_replace(&self, path: &Path) -> io::Result<bool> {
        let mut stdout = tokio::io::stdout();
        let banner = format!(
            "FIFO {} already exists. Unlink or exit\n\
             If you run multiple connections with the same name you're gonna have a bad time\n\
             Type {CONFIRM_TOKEN} to unlink and recreate: ",
            path.display()
        );
        stdout.write_all(banner.as_bytes()).await?;
        stdout.flush().await?;

        let mut answer = String::new();
        BufReader::new(tokio::io::stdin())
            .read_line(&mut answer)
            .await?;
        Ok(is_confirmation(&answer))
    }
}

fn is_confirmation(answer: &str) -> bool {
    answer.trim_end_matches(['\r', '\n']) == CONFIRM_TOKEN
}

/// Non-blocking byte source polled by the outbound pump.
pub trait PipeSource {
    /// Read whatever is available right now.
    ///
    /// `Ok(0)` means no writer is attached; `WouldBlock` means a writer is
    /// attached but has not written anything.
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// The session's named pipe.
///
/// Closing (explicitly or on drop) closes the handle and unlinks the path,
/// at most once.
#[derive(Debug)]
pub struct InputChannel {
    path: PathBuf,
    file: Option<File>,
    linked: bool,
}

impl InputChannel {
    /// Create the pipe at `path` and open it for non-blocking reads.
    ///
    /// If anything already exists at `path`, `resolver` must confirm before
    /// it is unlinked. Declining leaves the filesystem untouched.
    ///
    /// # Errors
    /// Returns `InputError::Declined` when replacement is refused, or an
    /// error if the pipe cannot be created or opened.
    pub async fn create(
        path: impl Into<PathBuf>,
        resolver: &dyn ConflictResolver,
    ) -> Result<Self, InputError> {
        let path = path.into();

        match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) => {
                tracing::warn!(
                    path = %path.display(),
                    fifo = meta.file_type().is_fifo(),
                    "input pipe already exists"
                );
                let confirmed = resolver
                    .confirm_replace(&path)
                    .await
                    .map_err(InputError::Prompt)?;
                if !confirmed {
                    return Err(InputError::Declined(path));
                }
                unlink(&path).map_err(|source| InputError::Unlink {
                    path: path.clone(),
                    source,
                })?;
                tracing::debug!(path = %path.display(), "stale pipe unlinked");
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => return Err(InputError::Inspect { path, source }),
        }

        let mode = Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IROTH;
        mkfifo(&path, mode).map_err(|source| InputError::Create {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "pipe created");

        let file = match OpenOptions::new()
            .read(true)
            .custom_flags(OFlag::O_NONBLOCK.bits())
            .open(&path)
        {
            Ok(file) => file,
            Err(source) => {
                if let Err(e) = unlink(&path) {
                    tracing::warn!(path = %path.display(), error = %e, "failed to unlink pipe");
                }
                return Err(InputError::Open { path, source });
            }
        };
        tracing::debug!(path = %path.display(), "pipe opened");

        Ok(Self {
            path,
            file: Some(file),
            linked: true,
        })
    }

    /// Filesystem path of the pipe.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Close the handle and unlink the pipe.
    pub fn close(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if let Some(file) = self.file.take() {
            tracing::debug!(path = %self.path.display(), "closing pipe");
            if let Err(e) = close(file.into_raw_fd()) {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to close pipe");
            }
        }
        if self.linked {
            self.linked = false;
            match unlink(&self.path) {
                Ok(()) => tracing::debug!(path = %self.path.display(), "pipe deleted"),
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), error = %e, "failed to delete pipe");
                }
            }
        }
    }
}

impl PipeSource for InputChannel {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.file.as_mut() {
            Some(file) => file.read(buf),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "pipe closed")),
        }
    }
}

impl Drop for InputChannel {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::Write,
        sync::atomic::{AtomicBool, Ordering},
    };

    use super::*;

    struct FixedAnswer {
        answer: bool,
        asked: AtomicBool,
    }

    impl FixedAnswer {
        fn new(answer: bool) -> Self {
            Self {
                answer,
                asked: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl ConflictResolver for FixedAnswer {
        async fn confirm_replace(&self, _path: &Path) -> io::Result<bool> {
            self.asked.store(true, Ordering::SeqCst);
            Ok(self.answer)
        }
    }

    fn is_fifo(path: &Path) -> bool {
        std::fs::symlink_metadata(path)
            .map(|m| m.file_type().is_fifo())
            .unwrap_or(false)
    }

    #[test]
    fn test_confirmation_token_is_exact() {
        assert!(is_confirmation("YES\n"));
        assert!(is_confirmation("YES\r\n"));
        assert!(is_confirmation("YES"));
        assert!(!is_confirmation("yes\n"));
        assert!(!is_confirmation("Y\n"));
        assert!(!is_confirmation(" YES\n"));
        assert!(!is_confirmation(""));
    }

    #[tokio::test]
    async fn test_create_makes_fifo_without_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in");
        let resolver = FixedAnswer::new(false);

        let channel = InputChannel::create(&path, &resolver).await.unwrap();
        assert!(is_fifo(&path));
        assert_eq!(channel.path(), path);
        assert!(!resolver.asked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_declined_conflict_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in");
        std::fs::write(&path, b"stale").unwrap();
        let resolver = FixedAnswer::new(false);

        let err = InputChannel::create(&path, &resolver).await.unwrap_err();
        assert!(matches!(err, InputError::Declined(_)));
        assert!(resolver.asked.load(Ordering::SeqCst));
        assert_eq!(std::fs::read(&path).unwrap(), b"stale");
    }

    #[tokio::test]
    async fn test_declined_conflict_keeps_existing_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in");
        mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR).unwrap();

        let err = InputChannel::create(&path, &FixedAnswer::new(false))
            .await
            .unwrap_err();
        assert!(matches!(err, InputError::Declined(_)));
        assert!(is_fifo(&path));
    }

    #[tokio::test]
    async fn test_confirmed_conflict_recreates_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in");
        std::fs::write(&path, b"stale").unwrap();
        let resolver = FixedAnswer::new(true);

        let _channel = InputChannel::create(&path, &resolver).await.unwrap();
        assert!(resolver.asked.load(Ordering::SeqCst));
        assert!(is_fifo(&path));
    }

    #[tokio::test]
    async fn test_reads_are_non_blocking() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in");
        let mut channel = InputChannel::create(&path, &FixedAnswer::new(false))
            .await
            .unwrap();
        let mut buf = [0u8; 64];

        // No writer attached.
        assert_eq!(channel.try_read(&mut buf).unwrap(), 0);

        let mut writer = OpenOptions::new().write(true).open(&path).unwrap();
        let err = channel.try_read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        writer.write_all(b"look\n").unwrap();
        let n = channel.try_read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"look\n");
    }

    #[tokio::test]
    async fn test_close_unlinks_and_drop_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in");
        let channel = InputChannel::create(&path, &FixedAnswer::new(false))
            .await
            .unwrap();

        channel.close();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_drop_unlinks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in");
        {
            let _channel = InputChannel::create(&path, &FixedAnswer::new(false))
                .await
                .unwrap();
            assert!(is_fifo(&path));
        }
        assert!(!is_fifo(&path));
        assert!(std::fs::symlink_metadata(&path).is_err());
    }
}

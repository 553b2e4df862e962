//! Relay engine: the two data pumps and shutdown coordination.
//!
//! The inbound pump (connection to log) runs as a background task; the
//! outbound pump (pipe to connection) runs in the foreground. When the
//! server disconnects, the inbound pump fires the shutdown signal, the
//! outbound pump returns, and teardown runs after both have stopped
//! touching their resources.

use std::{io, path::PathBuf, time::Duration};

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    ConnectError, Connection, InputChannel, InputError, LogError, RelayConfig, SessionLog,
    ShutdownSignal,
    connector,
    input::{ConflictResolver, PipeSource},
};

/// Pause between empty pipe polls. Without it the non-blocking read spins
/// a full core while idle.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Read chunk size for both directions.
pub const BUFFER_SIZE: usize = 1024;

/// Relay error.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Failed to create working directory {}: {source}", .path.display())]
    WorkingDir { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Input(#[from] InputError),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("Failed to read input pipe: {0}")]
    PipeRead(#[source] io::Error),
    #[error("Failed to write to server: {0}")]
    ConnectionWrite(#[source] io::Error),
    #[error("Inbound pump failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl RelayError {
    /// Whether the operator declined to replace an existing pipe.
    #[must_use]
    pub const fn is_declined(&self) -> bool {
        matches!(self, Self::Input(InputError::Declined(_)))
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The server closed the connection or the read side failed.
    RemoteDisconnect,
    /// Shutdown was requested locally.
    Interrupted,
}

/// Result of a completed relay run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOutcome {
    pub end: SessionEnd,
    /// Archived transcript, if rotation ran.
    pub rotated_to: Option<PathBuf>,
}

/// Owns the pipe, the log and the connection for one session.
pub struct RelayEngine {
    input: InputChannel,
    log: SessionLog,
    connection: Connection,
    shutdown: ShutdownSignal,
}

impl RelayEngine {
    /// Create the session resources in order: directory, pipe, log,
    /// connection.
    ///
    /// If a step fails, whatever was already created is torn down.
    ///
    /// # Errors
    /// Returns error if any setup step fails or the pipe conflict is
    /// declined.
    pub async fn start(
        config: &RelayConfig,
        resolver: &dyn ConflictResolver,
    ) -> Result<Self, RelayError> {
        tracing::debug!(dir = %config.working_dir.display(), "preparing working directory");
        tokio::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(&config.working_dir)
            .await
            .map_err(|source| RelayError::WorkingDir {
                path: config.working_dir.clone(),
                source,
            })?;

        let input = InputChannel::create(config.input_path(), resolver).await?;

        let log = match SessionLog::open(config.output_path(), config.rotate_log).await {
            Ok(log) => log,
            Err(e) => {
                input.close();
                return Err(e.into());
            }
        };

        let connection = match connector::connect(&config.session).await {
            Ok(connection) => connection,
            Err(e) => {
                log.abandon().await;
                input.close();
                return Err(e.into());
            }
        };

        tracing::info!(
            session = config.session.name(),
            target = %config.session,
            tls = config.session.secure(),
            "connected"
        );
        Ok(Self::new(input, log, connection))
    }

    /// Assemble an engine from already-open resources.
    #[must_use]
    pub fn new(input: InputChannel, log: SessionLog, connection: Connection) -> Self {
        Self {
            input,
            log,
            connection,
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Handle that stops the relay when fired, e.g. from a signal handler.
    #[must_use]
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Relay until the server disconnects or shutdown is requested, then
    /// tear down connection, log and pipe in that order.
    ///
    /// # Errors
    /// Returns the first fatal pump error. Teardown runs regardless.
    pub async fn run(self) -> Result<RelayOutcome, RelayError> {
        let Self {
            mut input,
            log,
            connection,
            shutdown,
        } = self;

        let (reader, mut writer) = tokio::io::split(connection);

        let inbound = tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                let mut reader = reader;
                let mut log = log;
                let result = inbound_pump(&mut reader, &mut log, &shutdown).await;
                shutdown.fire();
                (reader, log, result)
            }
        });

        let outbound = outbound_pump(&mut input, &mut writer, &shutdown).await;
        if let Err(e) = &outbound {
            tracing::error!(error = %e, "outbound pump failed");
        }
        shutdown.fire();

        let (inbound, rotated_to) = match inbound.await {
            Ok((reader, log, result)) => {
                let mut connection = reader.unsplit(writer);
                close_connection(&mut connection).await;
                tracing::info!(
                    log = %log.path().display(),
                    bytes = log.bytes_written(),
                    "session ended"
                );
                (result, log.close().await)
            }
            Err(e) => {
                tracing::error!(error = %e, "inbound pump task failed");
                drop(writer);
                (Err(RelayError::Join(e)), None)
            }
        };
        tracing::debug!(pipe = %input.path().display(), "removing input pipe");
        input.close();

        outbound?;
        let end = inbound?;
        Ok(RelayOutcome { end, rotated_to })
    }
}

async fn close_connection(connection: &mut Connection) {
    match connection.shutdown().await {
        Ok(()) => tracing::debug!("connection closed"),
        Err(e) => tracing::debug!(error = %e, "connection close reported an error"),
    }
}

/// Copy everything the server sends into the log.
///
/// Writes the connected marker first. On end-of-stream or a read error the
/// lost marker is written and `shutdown` fired. Returns early, without the
/// marker, if `shutdown` fires first.
///
/// # Errors
/// Returns error if writing the log fails.
pub async fn inbound_pump<R>(
    reader: &mut R,
    log: &mut SessionLog,
    shutdown: &ShutdownSignal,
) -> Result<SessionEnd, RelayError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    log.mark_connected().await?;
    let mut buf = BytesMut::with_capacity(BUFFER_SIZE);

    loop {
        buf.clear();
        let read = tokio::select! {
            biased;
            () = shutdown.fired() => {
                tracing::debug!("inbound pump received shutdown");
                return Ok(SessionEnd::Interrupted);
            }
            read = reader.read_buf(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                tracing::info!("server closed the connection");
                break;
            }
            Ok(n) => {
                tracing::debug!(bytes = n, "read from connection");
                log.append(&buf[..n]).await?;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                tracing::warn!(error = %e, kind = ?e.kind(), "server disconnected");
                break;
            }
        }
    }

    log.mark_lost().await?;
    shutdown.fire();
    Ok(SessionEnd::RemoteDisconnect)
}

/// Forward bytes written into the pipe to the server until `shutdown`
/// fires.
///
/// An empty pipe (no writer, or nothing written yet) is polled again after
/// `POLL_INTERVAL`.
///
/// # Errors
/// Returns error on any other pipe read failure or any write failure.
pub async fn outbound_pump<P, W>(
    pipe: &mut P,
    writer: &mut W,
    shutdown: &ShutdownSignal,
) -> Result<(), RelayError>
where
    P: PipeSource + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = [0u8; BUFFER_SIZE];

    while !shutdown.is_fired() {
        match pipe.try_read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                tracing::debug!(bytes = n, "read from pipe");
                writer
                    .write_all(&buf[..n])
                    .await
                    .map_err(RelayError::ConnectionWrite)?;
                writer.flush().await.map_err(RelayError::ConnectionWrite)?;
                continue;
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {}
            Err(e) => return Err(RelayError::PipeRead(e)),
        }

        tokio::select! {
            () = shutdown.fired() => break,
            () = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }

    tracing::debug!("outbound pump received shutdown");
    Ok(())
}

//! Session configuration.

use std::{fmt, path::PathBuf};

use thiserror::Error;

/// File name of the named pipe inside a session directory.
pub const INPUT_FILE: &str = "in";

/// File name of the active transcript inside a session directory.
pub const OUTPUT_FILE: &str = "out";

/// Configuration error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session name must not be empty")]
    EmptyName,
    #[error("Session name must be a single path component: {0}")]
    InvalidName(String),
    #[error("Host must not be empty")]
    EmptyHost,
    #[error("Port must be between 1 and 65535")]
    InvalidPort,
}

/// One relay run, bound to one remote host and port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    name: String,
    host: String,
    port: u16,
    secure: bool,
    insecure_tls: bool,
}

impl Session {
    /// Create a plain TCP session.
    ///
    /// # Errors
    /// Returns error if the name is not a single path component, the host
    /// is empty or the port is zero.
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Result<Self, SessionError> {
        let name = name.into();
        let host = host.into();

        if name.is_empty() {
            return Err(SessionError::EmptyName);
        }
        if name == "." || name == ".." || name.contains(['/', '\0']) {
            return Err(SessionError::InvalidName(name));
        }
        if host.trim().is_empty() {
            return Err(SessionError::EmptyHost);
        }
        if port == 0 {
            return Err(SessionError::InvalidPort);
        }

        Ok(Self {
            name,
            host,
            port,
            secure: false,
            insecure_tls: false,
        })
    }

    /// Dial with TLS instead of plain TCP.
    #[must_use]
    pub const fn with_tls(mut self, insecure: bool) -> Self {
        self.secure = true;
        self.insecure_tls = insecure;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Whether the connection is wrapped in TLS.
    #[must_use]
    pub const fn secure(&self) -> bool {
        self.secure
    }

    /// Whether certificate verification is skipped (TLS only).
    #[must_use]
    pub const fn insecure_tls(&self) -> bool {
        self.secure && self.insecure_tls
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Everything the relay needs, built once at startup.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Remote endpoint and security mode.
    pub session: Session,
    /// Directory holding the pipe and transcripts for this session.
    pub working_dir: PathBuf,
    /// Rename the transcript to a timestamped name on exit.
    pub rotate_log: bool,
}

impl RelayConfig {
    /// Create a config with log rotation enabled.
    #[must_use]
    pub const fn new(session: Session, working_dir: PathBuf) -> Self {
        Self {
            session,
            working_dir,
            rotate_log: true,
        }
    }

    /// Enable or disable log rotation on exit.
    #[must_use]
    pub const fn with_rotation(mut self, rotate: bool) -> Self {
        self.rotate_log = rotate;
        self
    }

    /// Path of the named pipe.
    #[must_use]
    pub fn input_path(&self) -> PathBuf {
        self.working_dir.join(INPUT_FILE)
    }

    /// Path of the active transcript.
    #[must_use]
    pub fn output_path(&self) -> PathBuf {
        self.working_dir.join(OUTPUT_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_dial_target() {
        let session = Session::new("test", "muck.example.org", 8888).unwrap();
        assert_eq!(session.to_string(), "muck.example.org:8888");
        assert!(!session.secure());
    }

    #[test]
    fn test_rejects_bad_names() {
        assert_eq!(Session::new("", "h", 1), Err(SessionError::EmptyName));
        assert!(matches!(
            Session::new("../etc", "h", 1),
            Err(SessionError::InvalidName(_))
        ));
        assert!(matches!(
            Session::new("..", "h", 1),
            Err(SessionError::InvalidName(_))
        ));
    }

    #[test]
    fn test_rejects_empty_host_and_zero_port() {
        assert_eq!(Session::new("a", " ", 1), Err(SessionError::EmptyHost));
        assert_eq!(Session::new("a", "h", 0), Err(SessionError::InvalidPort));
    }

    #[test]
    fn test_insecure_requires_tls() {
        let plain = Session::new("a", "h", 1).unwrap();
        assert!(!plain.insecure_tls());

        let tls = plain.with_tls(true);
        assert!(tls.secure());
        assert!(tls.insecure_tls());
    }

    #[test]
    fn test_paths() {
        let session = Session::new("test", "localhost", 9009).unwrap();
        let config = RelayConfig::new(session, PathBuf::from("/tmp/muck/test"));
        assert!(config.rotate_log);
        assert_eq!(config.input_path(), PathBuf::from("/tmp/muck/test/in"));
        assert_eq!(config.output_path(), PathBuf::from("/tmp/muck/test/out"));
        assert!(!config.with_rotation(false).rotate_log);
    }
}

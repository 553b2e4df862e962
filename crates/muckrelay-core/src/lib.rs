//! Persistent session relay for text-oriented network services.
//!
//! One process holds one long-lived connection to a MUCK/MUD-style server.
//! Commands are written into a named pipe; everything the server sends is
//! appended to a transcript log that is rotated when the session ends.
//!
//! Provides:
//! - `Session` / `RelayConfig` - Immutable startup configuration
//! - `connector` - Plain TCP (with keep-alive) or TLS dialing
//! - `InputChannel` - Named pipe write-in point
//! - `SessionLog` - Append-only transcript with rotation
//! - `RelayEngine` - The two data pumps and shutdown coordination

pub mod connector;
pub mod engine;
pub mod input;
pub mod session;
pub mod session_log;
pub mod shutdown;

pub use connector::{ConnectError, Connection};
pub use engine::{RelayEngine, RelayError, RelayOutcome, SessionEnd};
pub use input::{ConflictResolver, InputChannel, InputError, PipeSource, StdinPrompt};
pub use session::{RelayConfig, Session, SessionError};
pub use session_log::{LogError, SessionLog};
pub use shutdown::ShutdownSignal;

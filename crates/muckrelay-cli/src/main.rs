//! muckrelay
//!
//! Keeps one long-lived connection to a MUCK/MUD server. Write commands into
//! `<base-dir>/<name>/in`; read the server's output from
//! `<base-dir>/<name>/out` (e.g. with `tail -f`).

use std::{path::PathBuf, process::ExitCode};

use anyhow::Context;
use clap::Parser;
use muckrelay_core::{
    RelayConfig, RelayEngine, RelayError, Session, SessionEnd, ShutdownSignal, StdinPrompt,
    session_log::timestamp,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Directory under `$HOME` holding one subdirectory per session.
const DEFAULT_BASE_DIR: &str = "muck";

#[derive(Parser, Debug)]
#[command(name = "muckrelay")]
#[command(version, about = "Persistent session relay for MUCK/MUD servers", long_about = None)]
struct Cli {
    /// Session name; selects the working directory
    name: String,

    /// Remote host
    host: String,

    /// Remote port
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,

    /// Enable TLS
    #[arg(long)]
    ssl: bool,

    /// Skip TLS certificate verification
    #[arg(long, requires = "ssl")]
    insecure: bool,

    /// Enable debug tracing
    #[arg(long)]
    debug: bool,

    /// Disable log rotation on quit
    #[arg(long)]
    nolog: bool,

    /// Base directory for session directories [default: $HOME/muck]
    #[arg(long, env = "MUCKRELAY_BASE_DIR")]
    base_dir: Option<PathBuf>,
}

impl Cli {
    fn working_dir(&self) -> anyhow::Result<PathBuf> {
        let base = match &self.base_dir {
            Some(dir) => dir.clone(),
            None => dirs::home_dir()
                .context("Cannot determine home directory")?
                .join(DEFAULT_BASE_DIR),
        };
        Ok(base.join(&self.name))
    }

    fn relay_config(&self) -> anyhow::Result<RelayConfig> {
        let mut session = Session::new(&self.name, &self.host, self.port)?;
        if self.ssl {
            session = session.with_tls(self.insecure);
        }
        Ok(RelayConfig::new(session, self.working_dir()?).with_rotation(!self.nolog))
    }
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    info!("Started at {}", timestamp());

    match run(&cli).await {
        Ok(end) => {
            info!(?end, "Quit at {}", timestamp());
            info!("Thanks for playing!");
            ExitCode::SUCCESS
        }
        Err(e) => {
            if matches!(e.downcast_ref::<RelayError>(), Some(err) if err.is_declined()) {
                error!("{e}");
            } else {
                error!("FATAL ERROR {e:#}");
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> anyhow::Result<SessionEnd> {
    let config = cli.relay_config()?;
    tracing::debug!(
        name = config.session.name(),
        target = %config.session,
        ssl = config.session.secure(),
        insecure = config.session.insecure_tls(),
        rotate = config.rotate_log,
        dir = %config.working_dir.display(),
        "configuration"
    );

    let engine = RelayEngine::start(&config, &StdinPrompt).await?;
    let signals = tokio::spawn(forward_signals(engine.shutdown_signal()));

    let outcome = engine.run().await;
    signals.abort();

    let outcome = outcome?;
    if let Some(path) = &outcome.rotated_to {
        info!(path = %path.display(), "transcript archived");
    }
    Ok(outcome.end)
}

/// Fire `shutdown` on SIGINT or SIGTERM so teardown still runs.
async fn forward_signals(shutdown: ShutdownSignal) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = ctrl_c => {
            if let Err(e) = result {
                tracing::warn!(error = %e, "failed to listen for ctrl-c");
                return;
            }
            info!("interrupt received; shutting down");
        }
        () = terminate => info!("terminate received; shutting down"),
    }
    shutdown.fire();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positional_arguments() {
        let cli = Cli::try_parse_from(["muckrelay", "test", "localhost", "9009"]).unwrap();
        assert_eq!(cli.name, "test");
        assert_eq!(cli.host, "localhost");
        assert_eq!(cli.port, 9009);
        assert!(!cli.ssl && !cli.insecure && !cli.debug && !cli.nolog);
    }

    #[test]
    fn test_flags() {
        let cli = Cli::try_parse_from([
            "muckrelay",
            "--ssl",
            "--insecure",
            "--nolog",
            "--base-dir",
            "/tmp/relay",
            "test",
            "localhost",
            "9009",
        ])
        .unwrap();

        let config = cli.relay_config().unwrap();
        assert!(config.session.secure());
        assert!(config.session.insecure_tls());
        assert!(!config.rotate_log);
        assert_eq!(config.working_dir, PathBuf::from("/tmp/relay/test"));
    }

    #[test]
    fn test_bad_port_is_rejected() {
        assert!(Cli::try_parse_from(["muckrelay", "test", "localhost", "muck"]).is_err());
        assert!(Cli::try_parse_from(["muckrelay", "test", "localhost", "0"]).is_err());
        assert!(Cli::try_parse_from(["muckrelay", "test", "localhost", "70000"]).is_err());
    }

    #[test]
    fn test_wrong_argument_count_is_rejected() {
        assert!(Cli::try_parse_from(["muckrelay", "test", "localhost"]).is_err());
        assert!(Cli::try_parse_from(["muckrelay", "a", "b", "1", "extra"]).is_err());
    }

    #[test]
    fn test_insecure_requires_ssl() {
        assert!(Cli::try_parse_from(["muckrelay", "--insecure", "test", "h", "1"]).is_err());
    }

    #[test]
    fn test_invalid_session_name_is_config_error() {
        let cli = Cli::try_parse_from(["muckrelay", "..", "localhost", "9009"]).unwrap();
        assert!(cli.relay_config().is_err());
    }
}

//! Command-line entry point for unit processes.
//!
//! An application binary registers its steps and pipelines, builds an
//! [`Orchestrator`] and hands it to [`run_unit`]:
//!
//! ```rust,ignore
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = UnitArgs::parse();
//!     forkflow::logging::init(args.log_format);
//!     let settings = Settings::from_env()?;
//!     let store = SqliteStore::from_url(&settings.database_url).await?;
//!     let orchestrator = Orchestrator::new(Arc::new(store), registry()?, settings);
//!     run_unit(args, orchestrator).await?;
//!     Ok(())
//! }
//! ```
//!
//! `app supervise` then spawns `app advancer` and one `app jobs --kind K` per
//! registered kind, each with `--machine-id` and `--supervised`.

use clap::{Parser, Subcommand};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tracing::info;

use crate::logging::LogFormat;
use crate::orchestrator::{Orchestrator, OrchestratorError};
use crate::runner::RunnerError;
use crate::store::ProcessIdentity;
use crate::supervisor::SupervisorError;

#[derive(Error, Debug)]
pub enum UnitError {
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("cannot locate the current executable: {0}")]
    Executable(#[source] std::io::Error),
}

#[derive(Parser, Debug, Clone)]
#[command(about = "Run a forkflow unit process")]
pub struct UnitArgs {
    #[command(subcommand)]
    pub role: UnitRole,

    /// Machine identifier recorded in heartbeats and claims.
    #[arg(long, global = true)]
    pub machine_id: Option<String>,

    /// Started by a supervisor: stop when stdin closes.
    #[arg(long, global = true)]
    pub supervised: bool,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum UnitRole {
    /// Advance pipelines of every kind.
    Advancer,
    /// Execute jobs of one pipeline kind.
    Jobs {
        #[arg(long)]
        kind: String,
    },
    /// Spawn and monitor one advancer unit and one job unit per kind.
    Supervise,
}

/// Run the selected role until a shutdown signal arrives.
pub async fn run_unit(args: UnitArgs, orchestrator: Orchestrator) -> Result<(), UnitError> {
    let orchestrator = match &args.machine_id {
        Some(machine_id) => orchestrator.with_identity(ProcessIdentity::current(machine_id.clone())),
        None => orchestrator,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervised = args.supervised;
    let signal = tokio::spawn(async move {
        shutdown_signal(supervised).await;
        info!("shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    let result = match args.role {
        UnitRole::Advancer => orchestrator
            .advancer_runner()
            .run(shutdown_rx)
            .await
            .map_err(UnitError::from),
        UnitRole::Jobs { kind } => match orchestrator.job_runner(&kind) {
            Ok(runner) => runner.run(shutdown_rx).await.map_err(UnitError::from),
            Err(e) => Err(e.into()),
        },
        UnitRole::Supervise => match std::env::current_exe() {
            Ok(program) => {
                let mut supervisor = orchestrator.supervisor(program);
                if args.log_format == LogFormat::Json {
                    supervisor = supervisor.arg("--log-format").arg("json");
                }
                supervisor.run(shutdown_rx).await.map_err(UnitError::from)
            }
            Err(e) => Err(UnitError::Executable(e)),
        },
    };

    signal.abort();
    result
}

/// Resolves on Ctrl-C, SIGTERM, or (when supervised) stdin reaching EOF.
async fn shutdown_signal(supervised: bool) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let stdin_closed = async {
        if !supervised {
            return std::future::pending::<()>().await;
        }
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 64];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = stdin_closed => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_jobs_unit() {
        let args = UnitArgs::try_parse_from([
            "app",
            "jobs",
            "--kind",
            "ingest",
            "--machine-id",
            "node-1",
            "--supervised",
        ])
        .unwrap();

        assert_eq!(args.role, UnitRole::Jobs { kind: "ingest".into() });
        assert_eq!(args.machine_id.as_deref(), Some("node-1"));
        assert!(args.supervised);
        assert_eq!(args.log_format, LogFormat::Text);
    }

    #[test]
    fn test_parse_advancer_unit() {
        let args = UnitArgs::try_parse_from(["app", "--log-format", "json", "advancer"]).unwrap();
        assert_eq!(args.role, UnitRole::Advancer);
        assert!(!args.supervised);
        assert_eq!(args.log_format, LogFormat::Json);
    }

    #[test]
    fn test_jobs_requires_kind() {
        assert!(UnitArgs::try_parse_from(["app", "jobs"]).is_err());
    }
}

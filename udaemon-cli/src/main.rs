//! udaemon-demo: reference daemon built on the udaemon runtime.
//!
//! # Usage
//!
//! ```text
//! udaemon-demo [-c <config>] [-d] [-f] [-p <pid-file>] [-u <user[:group]>] [-V]
//! ```

mod app;
mod config;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::rc::Rc;

use anyhow::{Context, Result};
use clap::Parser;

use udaemon_core::{parse_identity, Identity};
use udaemon_runtime::paths::default_pid_file;
use udaemon_runtime::{setup_logging, LogLevel, Runtime, RuntimeConfig, RuntimeError};

use app::{DemoRuntime, RunState};
use config::AppConfig;

const PROGRAM_NAME: &str = "udaemon-demo";
const DEFAULT_CONF_FILE: &str = "udaemon-demo.yaml";

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "udaemon-demo",
    version,
    about = "Keep a TCP connection to a server open, as a daemon or in the foreground",
    long_about = None,
)]
struct Cli {
    /// Application configuration file (YAML).
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONF_FILE)]
    config: PathBuf,

    /// Log at debug level.
    #[arg(short, long)]
    debug: bool,

    /// Stay in the foreground and log to stderr.
    #[arg(short, long)]
    foreground: bool,

    /// PID file written once daemonized [default: /var/run/udaemon-demo.pid].
    #[arg(short = 'p', long = "pid-file")]
    pid_file: Option<PathBuf>,

    /// Run as `user[:group]` once daemonized (names or numeric ids).
    #[arg(short = 'u', long = "user", value_name = "USER[:GROUP]")]
    user: Option<String>,
}

/// The target for privilege dropping; unresolvable entries keep the
/// current ids.
fn resolve_identity(entry: Option<&str>) -> Identity {
    let Some(entry) = entry else {
        return Identity::current();
    };
    match parse_identity(Some(entry)) {
        Ok(identity) => {
            tracing::info!(entry, %identity, "requested to run as");
            identity
        }
        Err(err) => {
            tracing::warn!(entry, error = %err, "cannot resolve user, keeping current ids");
            Identity::current()
        }
    }
}

/// Relative paths stop resolving once the daemon changes to `/`.
fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("cannot determine working directory")?;
    Ok(cwd.join(path))
}

fn build_config(cli: &Cli) -> Result<RuntimeConfig<AppConfig>> {
    let mut config = RuntimeConfig::new(PROGRAM_NAME)
        .with_debug(cli.debug)
        .with_foreground(cli.foreground)
        .with_identity(resolve_identity(cli.user.as_deref()))
        .with_conf_file(absolute(&cli.config)?);
    // Only a daemon owns a PID file.
    if !cli.foreground {
        let pid_file = match &cli.pid_file {
            Some(path) => absolute(path)?,
            None => default_pid_file(PROGRAM_NAME),
        };
        config = config.with_pid_file(pid_file);
    }
    Ok(app::configure(config))
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    setup_logging(PROGRAM_NAME, cli.foreground, LogLevel::from_debug(cli.debug));

    let runtime: DemoRuntime = Runtime::init(build_config(&cli)?);
    runtime.set_app_state(Some(Rc::new(RunState::default())));

    let result = runtime.run_main_loop();
    runtime.destroy();

    match result {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(RuntimeError::Daemonize(outcome)) => Ok(ExitCode::from(outcome.code())),
        Err(err) => Err(err).context("main loop failed"),
    }
}

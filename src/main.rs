//! # Agent Manager - Main Entry Point
//!
//! 1. **Parse arguments** and resolve the agent binary and load-shaping library
//! 2. **Initialize logging**: colorized stderr, optional log file
//! 3. **Bind** the controller port before the agent starts, so a port conflict
//!    fails fast instead of after the agent has been launched
//! 4. **Run one session**: launch and attach the agent, serve the single
//!    controller connection, tear everything down
//!
//! Configuration problems are reported through `anyhow` with context; the
//! session itself reports through [`agent_manager::ManagerError`].

use agent_manager::{
    cli::{Args, ManagerConfig},
    logging::init_logging,
    run_session, DispatcherOptions, NativeLoadShaper, ReportLog,
};
use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Keep the guard alive until exit so the file writer gets flushed.
    let _log_guard = init_logging(args.verbose, args.log_file.as_deref())?;

    info!("Starting agent manager {}", agent_manager::VERSION);
    info!("Configuration: {:?}", args);

    let config = ManagerConfig::from_args(&args)?;

    let report_log = match &config.report_log {
        Some(path) => {
            info!("Writing reports to {:?}", path);
            Some(ReportLog::create(path)?)
        }
        None => None,
    };
    let options = DispatcherOptions {
        close_on_empty_report: config.close_on_empty_report,
        report_log,
    };

    let shaper = NativeLoadShaper::load(&config.load_library)
        .with_context(|| format!("Failed to load {}", config.load_library.display()))?;

    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", config.host, config.port))?;

    match run_session(listener, &config.agent, shaper, options).await {
        Ok(summary) => {
            info!("Session finished: {}", summary);
            Ok(())
        }
        Err(e) => {
            error!("Session failed: {}", e);
            Err(e.into())
        }
    }
}

//! # Agent Manager Library
//!
//! The control plane that sits next to a load-generating agent process.
//!
//! A remote controller drives an experiment over a small fixed-layout binary
//! TCP protocol: it sets the offered load, opens measurement windows, and asks
//! for reports. The manager turns those requests into writes on the agent's
//! shared-memory control block, reads the per-thread statistics segments the
//! agent fills in, and replies with aggregated throughput or latency reports.
//!
//! ## Architecture Overview
//!
//! - `controller`: launches the agent, maps its shared memory, sets load and
//!   sampling parameters, and owns the load-shaping helper library
//! - `dispatcher`: the single-client request loop and session teardown
//! - `ipc`: shared-memory layouts and views, the wire codec, and the TCP
//!   connection wrapper
//! - `metrics`: aggregation, percentiles with confidence intervals, and the
//!   sample validity checks (independence, stationarity, inter-arrival)
//! - `results`: optional JSON-lines log of every report sent
//! - `cli`, `logging`, `utils`: argument parsing, tracing setup, and helpers
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use agent_manager::{run_session, AgentConfig, DispatcherOptions, NativeLoadShaper};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AgentConfig {
//!         agent_path: "assets/agent".into(),
//!         agent_args: vec!["-t".into(), "4".into()],
//!         ..AgentConfig::default()
//!     };
//!     let shaper = NativeLoadShaper::load(Path::new("assets/librand.so"))?;
//!     let listener = tokio::net::TcpListener::bind(("0.0.0.0", 5001)).await?;
//!
//!     let summary = run_session(listener, &config, shaper, DispatcherOptions::default()).await?;
//!     println!("{}", summary);
//!     Ok(())
//! }
//! ```

/// Command-line interface and configuration
///
/// Argument parsing with clap and validation of the agent binary and
/// load-shaping library paths.
pub mod cli;

/// Agent process lifecycle and shared-memory control
pub mod controller;

/// Request loop for the controller connection
pub mod dispatcher;

pub mod error;

/// Shared-memory views and the TCP wire protocol
///
/// Layouts are `#[repr(C, packed)]` mirrors of what the agent maps; the wire
/// codec uses bincode with fixed-width native-endian integers.
pub mod ipc;

pub mod logging;

/// Report aggregation and sample validity checks
pub mod metrics;

pub mod results;

pub mod utils;

pub use cli::{Args, ManagerConfig};
pub use controller::{AgentConfig, AgentControl, AgentController, LoadShaper, NativeLoadShaper};
pub use dispatcher::{run_session, Dispatcher, DispatcherOptions, SessionSummary};
pub use error::ManagerError;
pub use metrics::{LatencyReport, ThroughputReport};
pub use results::ReportLog;

/// The current version of the agent manager
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
///
/// Names and sizes here must agree with the agent binary, which hard-codes
/// the same segment names.
pub mod defaults {
    use std::time::Duration;

    /// TCP port the controller connects to
    pub const MANAGER_PORT: u16 = 5001;

    pub const MANAGER_HOST: &str = "0.0.0.0";

    /// Control block segment created by the agent
    pub const CONTROL_SEGMENT: &str = "/lancetcontrol";

    /// Per-thread stats segments are `<prefix><thread index>`
    pub const STATS_SEGMENT_PREFIX: &str = "/lancet-stats";

    /// Attempts at mapping the control block before giving up
    ///
    /// The agent creates its segments only after parsing its arguments and
    /// starting its threads, so the first attempts routinely miss.
    pub const ATTACH_ATTEMPTS: u32 = 10;

    pub const ATTACH_INTERVAL: Duration = Duration::from_secs(1);

    /// Directory searched for the agent binary and load-shaping library
    pub const BINARY_ASSET_DIR: &str = "assets";

    pub const AGENT_BINARY: &str = "agent";

    pub const LOAD_LIBRARY: &str = "librand.so";

    /// Symbol in the load-shaping library that sets the average inter-arrival time
    pub const LOAD_SHAPER_SYMBOL: &str = "set_avg_ext";
}

use crate::controller::AgentConfig;
use anyhow::{bail, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Agent Manager - runs a load-generating agent and serves its statistics to a remote controller
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Base directory holding the agent binary and the load-shaping library
    #[clap(short = 'b', long, default_value = crate::defaults::BINARY_ASSET_DIR, help_heading = "Assets")]
    pub binary_assets: PathBuf,

    /// Path to the agent binary (defaults to <binary-assets>/agent)
    #[clap(long, help_heading = "Assets")]
    pub agent: Option<PathBuf>,

    /// Path to the load-shaping library (defaults to <binary-assets>/librand.so)
    #[clap(long, help_heading = "Assets")]
    pub rand: Option<PathBuf>,

    /// Address to accept the controller connection on
    #[clap(long, default_value = crate::defaults::MANAGER_HOST)]
    pub host: String,

    /// Port to accept the controller connection on
    #[clap(long, default_value_t = crate::defaults::MANAGER_PORT)]
    pub port: u16,

    /// How many times to try mapping the agent's control block
    #[clap(long, default_value_t = crate::defaults::ATTACH_ATTEMPTS)]
    pub attach_attempts: u32,

    /// Delay between attach attempts (e.g. 500ms, 2s)
    #[clap(long, default_value = "1s", value_parser = parse_duration)]
    pub attach_interval: Duration,

    /// End the session when a report finds no samples
    #[clap(long, default_value_t = false)]
    pub close_on_empty_report: bool,

    /// Append every report sent to the controller to this file (JSON lines)
    #[clap(long)]
    pub report_log: Option<PathBuf>,

    /// Also write log output to this file
    #[clap(long)]
    pub log_file: Option<PathBuf>,

    /// Verbose output
    #[clap(short = 'v', long, default_value_t = false)]
    pub verbose: bool,

    /// Arguments passed to the agent
    #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
    pub agent_args: Vec<String>,
}

/// Validated configuration for one manager run.
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    pub agent: AgentConfig,
    pub load_library: PathBuf,
    pub host: String,
    pub port: u16,
    pub close_on_empty_report: bool,
    pub report_log: Option<PathBuf>,
}

impl ManagerConfig {
    pub fn from_args(args: &Args) -> Result<Self> {
        let agent_path = match &args.agent {
            Some(path) => path.clone(),
            None => {
                check_asset_dir(&args.binary_assets)?;
                args.binary_assets.join(crate::defaults::AGENT_BINARY)
            }
        };
        if !agent_path.is_file() {
            bail!("Bad agent path at {}", agent_path.display());
        }

        let load_library = match &args.rand {
            Some(path) => path.clone(),
            None => {
                check_asset_dir(&args.binary_assets)?;
                args.binary_assets.join(crate::defaults::LOAD_LIBRARY)
            }
        };
        if !load_library.is_file() {
            bail!("Bad load-shaping library path at {}", load_library.display());
        }

        if args.attach_attempts == 0 {
            bail!("--attach-attempts must be at least 1");
        }

        Ok(Self {
            agent: AgentConfig {
                agent_path,
                agent_args: split_agent_args(&args.agent_args),
                attach_attempts: args.attach_attempts,
                attach_interval: args.attach_interval,
                ..AgentConfig::default()
            },
            load_library,
            host: args.host.clone(),
            port: args.port,
            close_on_empty_report: args.close_on_empty_report,
            report_log: args.report_log.clone(),
        })
    }
}

fn check_asset_dir(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        bail!("Could not find binary assets base directory at {}", dir.display());
    }
    Ok(())
}

/// Join the arguments with spaces and split them again on whitespace, so a
/// quoted `"-t 4"` reaches the agent as two arguments.
pub fn split_agent_args(args: &[String]) -> Vec<String> {
    args.join(" ").split_whitespace().map(str::to_string).collect()
}

/// Parse duration from string (e.g., "500ms", "2s", "1m")
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else {
        (s, "s") // Default to seconds
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
    if !num.is_finite() || num < 0.0 {
        return Err(format!("Duration must be a non-negative number: {}", num_str));
    }

    let duration = match unit {
        "ms" => Duration::from_secs_f64(num / 1000.0),
        "s" => Duration::from_secs_f64(num),
        "m" => Duration::from_secs_f64(num * 60.0),
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    Ok(duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assets_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("agent"), b"").unwrap();
        std::fs::write(dir.path().join("librand.so"), b"").unwrap();
        dir
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));

        assert!(parse_duration("").is_err());
        assert!(parse_duration("invalid").is_err());
        assert!(parse_duration("-1s").is_err());
    }

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["agent-manager"]).unwrap();
        assert_eq!(args.binary_assets, PathBuf::from("assets"));
        assert_eq!(args.host, "0.0.0.0");
        assert_eq!(args.port, 5001);
        assert_eq!(args.attach_attempts, 10);
        assert_eq!(args.attach_interval, crate::defaults::ATTACH_INTERVAL);
        assert!(!args.close_on_empty_report);
        assert!(args.agent_args.is_empty());
    }

    #[test]
    fn test_trailing_agent_args() {
        let args = Args::try_parse_from([
            "agent-manager",
            "--port",
            "6000",
            "--",
            "-t",
            "4",
            "-s 10.0.0.1:8000",
        ])
        .unwrap();
        assert_eq!(args.port, 6000);
        assert_eq!(args.agent_args, vec!["-t", "4", "-s 10.0.0.1:8000"]);
        assert_eq!(
            split_agent_args(&args.agent_args),
            vec!["-t", "4", "-s", "10.0.0.1:8000"]
        );
    }

    #[test]
    fn test_config_resolves_assets() {
        let dir = assets_dir();
        let args = Args::try_parse_from([
            "agent-manager",
            "-b",
            dir.path().to_str().unwrap(),
            "--attach-interval",
            "250ms",
        ])
        .unwrap();
        let config = ManagerConfig::from_args(&args).unwrap();
        assert_eq!(config.agent.agent_path, dir.path().join("agent"));
        assert_eq!(config.load_library, dir.path().join("librand.so"));
        assert_eq!(config.agent.attach_interval, Duration::from_millis(250));
        assert_eq!(config.agent.control_segment, crate::defaults::CONTROL_SEGMENT);
    }

    #[test]
    fn test_config_rejects_missing_assets() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let args = Args::try_parse_from([
            "agent-manager",
            "-b",
            missing.to_str().unwrap(),
        ])
        .unwrap();
        let err = ManagerConfig::from_args(&args).unwrap_err();
        assert!(err.to_string().contains("binary assets"));

        let args = Args::try_parse_from(["agent-manager", "-b", dir.path().to_str().unwrap()]).unwrap();
        let err = ManagerConfig::from_args(&args).unwrap_err();
        assert!(err.to_string().contains("Bad agent path"));
    }

    #[test]
    fn test_overrides_do_not_need_asset_dir() {
        let dir = assets_dir();
        let agent = dir.path().join("agent");
        let rand = dir.path().join("librand.so");
        let args = Args::try_parse_from([
            "agent-manager",
            "-b",
            "/nonexistent/assets",
            "--agent",
            agent.to_str().unwrap(),
            "--rand",
            rand.to_str().unwrap(),
        ])
        .unwrap();
        let config = ManagerConfig::from_args(&args).unwrap();
        assert_eq!(config.agent.agent_path, agent);
        assert_eq!(config.load_library, rand);
    }
}

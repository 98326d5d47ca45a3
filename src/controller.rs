//! # Agent Controller
//!
//! Owns the agent process and every shared memory mapping it exposes.
//!
//! The lifecycle is:
//!
//! 1. [`AgentController::launch`] spawns the agent and polls for its control
//!    segment, then maps one stats segment per agent thread with the record
//!    layout implied by the agent type.
//! 2. The dispatcher drives the agent through [`AgentControl`]: load level,
//!    measurement windows, snapshots and the open connection count.
//! 3. [`AgentControl::terminate`] kills the agent at the end of the session.
//!
//! Load shaping is delegated to a native library exporting `set_avg_ext`,
//! which rewrites the inter-arrival generator state inside the control block.

use crate::error::ManagerError;
use crate::ipc::layout::AgentType;
use crate::ipc::shared_memory::{ControlBlockView, ThreadStats};
use crate::ipc::stats_segment_name;
use crate::metrics::ThreadSnapshot;
use std::ffi::{c_void, CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Sets the mean inter-arrival time (µs) of the agent's request generator.
pub trait LoadShaper: Send {
    fn set_average(&self, control: &ControlBlockView, avg_interval_us: f64) -> Result<(), ManagerError>;
}

type SetAvgFn = unsafe extern "C" fn(*mut c_void, f64);

/// Load shaper backed by the agent's native helper library.
pub struct NativeLoadShaper {
    handle: *mut c_void,
    set_avg: SetAvgFn,
    path: PathBuf,
}

// The library handle and function pointer are process-global; nothing in
// them is tied to the loading thread.
unsafe impl Send for NativeLoadShaper {}

fn last_dl_error() -> String {
    // SAFETY: dlerror returns either null or a thread-local C string.
    unsafe {
        let err = libc::dlerror();
        if err.is_null() {
            "unknown dynamic loader error".to_string()
        } else {
            CStr::from_ptr(err).to_string_lossy().into_owned()
        }
    }
}

impl NativeLoadShaper {
    pub fn load(path: &Path) -> Result<Self, ManagerError> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| ManagerError::LoadShaper(format!("invalid path {}", path.display())))?;
        let symbol = CString::new(crate::defaults::LOAD_SHAPER_SYMBOL)
            .map_err(|e| ManagerError::LoadShaper(e.to_string()))?;

        // SAFETY: both strings are NUL terminated and outlive the calls.
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW) };
        if handle.is_null() {
            return Err(ManagerError::LoadShaper(format!(
                "dlopen {}: {}",
                path.display(),
                last_dl_error()
            )));
        }

        // SAFETY: `handle` is a live library handle.
        let sym = unsafe { libc::dlsym(handle, symbol.as_ptr()) };
        if sym.is_null() {
            let reason = last_dl_error();
            // SAFETY: the handle came from dlopen and is closed exactly once.
            unsafe { libc::dlclose(handle) };
            return Err(ManagerError::LoadShaper(format!(
                "{} not found in {}: {}",
                crate::defaults::LOAD_SHAPER_SYMBOL,
                path.display(),
                reason
            )));
        }

        debug!("Loaded load-shaping library {}", path.display());
        Ok(Self {
            handle,
            // SAFETY: the exported symbol has the C signature
            // `void set_avg_ext(void *control_block, double avg)`.
            set_avg: unsafe { std::mem::transmute::<*mut c_void, SetAvgFn>(sym) },
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LoadShaper for NativeLoadShaper {
    fn set_average(&self, control: &ControlBlockView, avg_interval_us: f64) -> Result<(), ManagerError> {
        // SAFETY: the pointer addresses a live, correctly sized control block
        // mapping for the duration of the call.
        unsafe { (self.set_avg)(control.as_mut_ptr() as *mut c_void, avg_interval_us) };
        Ok(())
    }
}

impl Drop for NativeLoadShaper {
    fn drop(&mut self) {
        // SAFETY: the handle is valid and not used after this point.
        unsafe { libc::dlclose(self.handle) };
    }
}

/// How to start the agent and where to find its segments.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub agent_path: PathBuf,
    pub agent_args: Vec<String>,
    pub control_segment: String,
    pub stats_segment_prefix: String,
    pub attach_attempts: u32,
    pub attach_interval: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_path: PathBuf::from(crate::defaults::AGENT_BINARY),
            agent_args: Vec::new(),
            control_segment: crate::defaults::CONTROL_SEGMENT.to_string(),
            stats_segment_prefix: crate::defaults::STATS_SEGMENT_PREFIX.to_string(),
            attach_attempts: crate::defaults::ATTACH_ATTEMPTS,
            attach_interval: crate::defaults::ATTACH_INTERVAL,
        }
    }
}

/// Operations the dispatcher needs from the agent.
pub trait AgentControl: Send {
    fn agent_type(&self) -> AgentType;

    fn thread_count(&self) -> u32;

    /// Start generating `load` requests per second across all threads.
    fn start_load(&mut self, load: u32) -> Result<(), ManagerError>;

    /// Reset the stats and open a measurement window.
    fn start_measure(&mut self, sample_count: u32, sampling_rate_pct: f64) -> Result<(), ManagerError>;

    /// Close the measurement window and copy every thread's record.
    fn snapshot_stats(&mut self) -> Vec<ThreadSnapshot>;

    /// Per-thread sample target of the current window.
    fn per_thread_samples(&self) -> u32;

    fn conn_open(&self) -> i32;

    /// Exit status if the agent has already exited.
    fn poll_agent(&mut self) -> Result<Option<ExitStatus>, ManagerError>;

    fn terminate(&mut self) -> Result<(), ManagerError>;
}

/// A running agent and its attached segments.
pub struct AgentController<L: LoadShaper> {
    child: Child,
    control: ControlBlockView,
    stats: Vec<ThreadStats>,
    agent_type: AgentType,
    thread_count: u32,
    shaper: L,
    terminated: bool,
}

async fn wait_for_control_block(
    config: &AgentConfig,
    child: &mut Child,
) -> Result<ControlBlockView, ManagerError> {
    for attempt in 1..=config.attach_attempts {
        sleep(config.attach_interval).await;

        if let Some(status) = child.try_wait()? {
            return Err(ManagerError::WorkerExitedUnexpectedly(status));
        }

        match ControlBlockView::attach(&config.control_segment) {
            Ok(control) => {
                debug!("Attached to {} on attempt {}", config.control_segment, attempt);
                return Ok(control);
            }
            Err(e) => debug!("Attach attempt {}/{}: {}", attempt, config.attach_attempts, e),
        }
    }

    Err(ManagerError::AttachTimeout {
        segment: config.control_segment.clone(),
        attempts: config.attach_attempts,
    })
}

async fn attach_all(
    config: &AgentConfig,
    child: &mut Child,
) -> Result<(ControlBlockView, AgentType, u32, Vec<ThreadStats>), ManagerError> {
    let control = wait_for_control_block(config, child).await?;
    let agent_type = AgentType::try_from(control.agent_type())?;

    let thread_count = control.thread_count();
    if thread_count <= 0 {
        return Err(ManagerError::SharedMemory {
            segment: config.control_segment.clone(),
            reason: format!("agent reports {} threads", thread_count),
        });
    }
    let thread_count = thread_count as u32;

    let layout = agent_type.layout();
    let stats = (0..thread_count as usize)
        .map(|i| ThreadStats::attach(&stats_segment_name(&config.stats_segment_prefix, i), layout))
        .collect::<Result<Vec<_>, _>>()?;

    Ok((control, agent_type, thread_count, stats))
}

fn kill_and_reap(child: &mut Child) {
    if let Err(e) = child.kill() {
        debug!("Agent kill: {}", e);
    }
    if let Err(e) = child.wait() {
        debug!("Agent wait: {}", e);
    }
}

impl<L: LoadShaper> AgentController<L> {
    /// Spawn the agent and attach to its shared memory.
    ///
    /// The agent is killed if attaching fails for any reason.
    pub async fn launch(config: &AgentConfig, shaper: L) -> Result<Self, ManagerError> {
        info!(
            "Launching agent {} {}",
            config.agent_path.display(),
            config.agent_args.join(" ")
        );
        let mut child = Command::new(&config.agent_path)
            .args(&config.agent_args)
            .stdin(Stdio::null())
            .spawn()?;

        match attach_all(config, &mut child).await {
            Ok((control, agent_type, thread_count, stats)) => {
                info!(
                    "Agent {} attached: {} agent with {} threads",
                    child.id(),
                    agent_type,
                    thread_count
                );
                Ok(Self {
                    child,
                    control,
                    stats,
                    agent_type,
                    thread_count,
                    shaper,
                    terminated: false,
                })
            }
            Err(e) => {
                warn!("Failed to attach to agent: {}", e);
                kill_and_reap(&mut child);
                Err(e)
            }
        }
    }

    pub fn control(&self) -> &ControlBlockView {
        &self.control
    }

    pub fn shaper(&self) -> &L {
        &self.shaper
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }
}

impl<L: LoadShaper> AgentControl for AgentController<L> {
    fn agent_type(&self) -> AgentType {
        self.agent_type
    }

    fn thread_count(&self) -> u32 {
        self.thread_count
    }

    fn start_load(&mut self, load: u32) -> Result<(), ManagerError> {
        if load == 0 {
            return Err(ManagerError::InvalidLoad(load));
        }
        self.control.set_should_measure(false);

        let per_thread_load = load as f64 / self.thread_count as f64;
        let avg_interval_us = 1e6 / per_thread_load;
        self.shaper.set_average(&self.control, avg_interval_us)?;
        self.control.set_should_load(true);

        info!(
            "Offered load {} req/s ({:.3} us between requests per thread)",
            load, avg_interval_us
        );
        Ok(())
    }

    fn start_measure(&mut self, sample_count: u32, sampling_rate_pct: f64) -> Result<(), ManagerError> {
        // Records may only be reset while the agent is not measuring.
        self.control.set_should_measure(false);
        for stats in &self.stats {
            stats.reset();
        }

        self.control.set_sample_count(sample_count / self.thread_count);
        self.control.set_sampling_rate(sampling_rate_pct / 100.0);
        self.control.set_should_measure(true);

        info!(
            "Measuring {} samples at {}% sampling rate",
            sample_count, sampling_rate_pct
        );
        Ok(())
    }

    fn snapshot_stats(&mut self) -> Vec<ThreadSnapshot> {
        self.control.set_should_measure(false);
        self.stats.iter().map(ThreadStats::snapshot).collect()
    }

    fn per_thread_samples(&self) -> u32 {
        self.control.sample_count()
    }

    fn conn_open(&self) -> i32 {
        self.control.conn_open()
    }

    fn poll_agent(&mut self) -> Result<Option<ExitStatus>, ManagerError> {
        Ok(self.child.try_wait()?)
    }

    fn terminate(&mut self) -> Result<(), ManagerError> {
        if self.terminated {
            return Ok(());
        }
        self.terminated = true;

        match self.child.kill() {
            Ok(()) => {}
            // Already reaped.
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {}
            Err(e) => return Err(e.into()),
        }
        let status = self.child.wait()?;
        debug!("Agent {} terminated: {}", self.child.id(), status);
        Ok(())
    }
}

impl<L: LoadShaper> Drop for AgentController<L> {
    fn drop(&mut self) {
        if !self.terminated {
            kill_and_reap(&mut self.child);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_library_is_reported() {
        let err = NativeLoadShaper::load(Path::new("/nonexistent/librand.so"))
            .err()
            .unwrap();
        assert!(matches!(err, ManagerError::LoadShaper(_)));
        assert!(err.to_string().contains("/nonexistent/librand.so"));
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    #[test]
    fn test_library_without_symbol_is_reported() {
        let err = NativeLoadShaper::load(Path::new("libc.so.6")).err().unwrap();
        assert!(err.to_string().contains("set_avg_ext"));
    }

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.control_segment, "/lancetcontrol");
        assert_eq!(config.stats_segment_prefix, "/lancet-stats");
        assert_eq!(config.attach_attempts, 10);
        assert_eq!(config.attach_interval, Duration::from_secs(1));
    }
}

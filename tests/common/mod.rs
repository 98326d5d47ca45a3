//! Stand-in for the agent's side of shared memory.
//!
//! The stub creates the control block and stats segments the way the agent
//! does; the process the controller launches is plain `sleep`.

#![allow(dead_code)]

use agent_manager::controller::{AgentConfig, LoadShaper};
use agent_manager::ipc::layout::AgentType;
use agent_manager::ipc::shared_memory::{ControlBlockView, ThreadStats};
use agent_manager::ipc::stats_segment_name;
use agent_manager::ManagerError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

pub struct StubAgent {
    pub control: ControlBlockView,
    pub stats: Vec<ThreadStats>,
    pub config: AgentConfig,
}

impl StubAgent {
    pub fn new(agent_type: AgentType, threads: usize) -> Self {
        let stub = Self::with_raw_type(agent_type.as_raw(), 0);
        stub.control.set_thread_count(threads as i32);
        let stats = (0..threads)
            .map(|i| {
                ThreadStats::create(
                    &stats_segment_name(&stub.config.stats_segment_prefix, i),
                    agent_type.layout(),
                )
                .unwrap()
            })
            .collect();
        Self { stats, ..stub }
    }

    /// Control block only, with an arbitrary agent type value.
    pub fn with_raw_type(agent_type: i32, threads: i32) -> Self {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let control_segment = format!("/am_it_{}_{}", std::process::id(), id);
        let stats_segment_prefix = format!("{}_s", control_segment);

        let control = ControlBlockView::create(&control_segment).unwrap();
        control.set_agent_type(agent_type);
        control.set_thread_count(threads);

        Self {
            control,
            stats: Vec::new(),
            config: AgentConfig {
                agent_path: "sleep".into(),
                agent_args: vec!["30".to_string()],
                control_segment,
                stats_segment_prefix,
                attach_attempts: 5,
                attach_interval: Duration::from_millis(20),
            },
        }
    }
}

/// Load shaper that records every average it is asked to set.
#[derive(Clone, Default)]
pub struct RecordingShaper {
    pub averages: Arc<Mutex<Vec<f64>>>,
}

impl RecordingShaper {
    pub fn recorded(&self) -> Vec<f64> {
        self.averages.lock().unwrap().clone()
    }
}

impl LoadShaper for RecordingShaper {
    fn set_average(&self, _control: &ControlBlockView, avg_interval_us: f64) -> Result<(), ManagerError> {
        self.averages.lock().unwrap().push(avg_interval_us);
        Ok(())
    }
}

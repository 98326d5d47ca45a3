//! # Dispatcher
//!
//! Serves the single controller connection of a manager process.
//!
//! ```text
//! Attaching ──► Ready ──► Serving ──► Closing
//!  (launch)    (agent     (one request     (poll agent,
//!               mapped)    at a time)       kill agent)
//! ```
//!
//! Requests are handled strictly in order: each one is fully processed and
//! answered before the next is read. Statistics run on the blocking pool so
//! large windows do not stall the runtime, but the loop awaits them.

use crate::controller::{AgentConfig, AgentControl, AgentController, LoadShaper};
use crate::error::ManagerError;
use crate::ipc::protocol::{LatencyReply, ReportKind, Reply, Request, ThroughputReply};
use crate::ipc::tcp_socket::{accept_single, ClientConnection};
use crate::metrics::{aggregate_latency, aggregate_throughput};
use crate::results::{ReportLog, ReportRecord};
use std::fmt;
use std::process::ExitStatus;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Attaching,
    Ready,
    Serving,
    Closing,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Attaching => write!(f, "attaching"),
            SessionState::Ready => write!(f, "ready"),
            SessionState::Serving => write!(f, "serving"),
            SessionState::Closing => write!(f, "closing"),
        }
    }
}

#[derive(Default)]
pub struct DispatcherOptions {
    /// End the session when a report has no samples instead of skipping the reply.
    pub close_on_empty_report: bool,
    pub report_log: Option<ReportLog>,
}

/// What to do after a request.
#[derive(Debug, PartialEq)]
pub enum Step {
    Reply(Reply),
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    ProtocolViolation(String),
    EmptySampleSet,
    Failed(String),
}

impl CloseReason {
    fn from_error(err: &ManagerError) -> Self {
        match err {
            ManagerError::ProtocolViolation(msg) => CloseReason::ProtocolViolation(msg.clone()),
            ManagerError::EmptySampleSet(_) => CloseReason::EmptySampleSet,
            other => CloseReason::Failed(other.to_string()),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ClientClosed => write!(f, "client closed the connection"),
            CloseReason::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            CloseReason::EmptySampleSet => write!(f, "report with no samples"),
            CloseReason::Failed(msg) => write!(f, "{}", msg),
        }
    }
}

/// Agent state observed at teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Running,
    Exited(ExitStatus),
    Unknown,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentStatus::Running => write!(f, "running until teardown"),
            AgentStatus::Exited(status) => write!(f, "exited early ({})", status),
            AgentStatus::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub requests: u64,
    pub reports: u64,
    pub skipped_requests: u64,
    pub close_reason: CloseReason,
    pub agent_status: AgentStatus,
    pub elapsed: Duration,
}

impl fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} requests ({} left without reply), {} reports in {}; closed: {}; agent {}",
            self.requests,
            self.skipped_requests,
            self.reports,
            crate::utils::format_duration(self.elapsed),
            self.close_reason,
            self.agent_status
        )
    }
}

fn join_error(e: tokio::task::JoinError) -> ManagerError {
    ManagerError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
}

pub struct Dispatcher<C: AgentControl> {
    agent: C,
    state: SessionState,
    options: DispatcherOptions,
    measure_start: Option<Instant>,
    windows: u64,
    requests: u64,
    reports: u64,
    skipped_requests: u64,
}

impl<C: AgentControl> Dispatcher<C> {
    /// Wrap an attached agent. The session starts in [`SessionState::Ready`].
    pub fn new(agent: C, options: DispatcherOptions) -> Self {
        Self {
            agent,
            state: SessionState::Ready,
            options,
            measure_start: None,
            windows: 0,
            requests: 0,
            reports: 0,
            skipped_requests: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn closes_on(&self, err: &ManagerError) -> bool {
        self.options.close_on_empty_report && matches!(err, ManagerError::EmptySampleSet(_))
    }

    pub fn agent(&self) -> &C {
        &self.agent
    }

    fn transition(&mut self, next: SessionState) {
        debug!("Session {} -> {}", self.state, next);
        self.state = next;
    }

    /// Handle one request against the agent.
    pub async fn process(&mut self, request: Request) -> Result<Step, ManagerError> {
        match request {
            Request::StartLoad { load } => {
                self.agent.start_load(load)?;
                Ok(Step::Reply(Reply::Ack))
            }
            Request::StartMeasure {
                sample_count,
                sampling_rate,
            } => {
                self.agent.start_measure(sample_count, sampling_rate)?;
                self.measure_start = Some(Instant::now());
                self.windows += 1;
                Ok(Step::Reply(Reply::Ack))
            }
            Request::Report(kind) => self.report(kind).await.map(Step::Reply),
            Request::ConnOpen => Ok(Step::Reply(Reply::Value(self.agent.conn_open() as u32))),
            Request::Close => Ok(Step::Close),
        }
    }

    fn window_duration(&self) -> f64 {
        match self.measure_start {
            Some(start) => start.elapsed().as_secs_f64(),
            None => {
                warn!("Report requested before any measurement started; duration is 0");
                0.0
            }
        }
    }

    async fn report(&mut self, kind: ReportKind) -> Result<Reply, ManagerError> {
        let snapshots = self.agent.snapshot_stats();
        let duration_secs = self.window_duration();

        let reply = match kind {
            ReportKind::Throughput => {
                let report = tokio::task::spawn_blocking(move || aggregate_throughput(&snapshots))
                    .await
                    .map_err(join_error)??
                    .with_duration(duration_secs);
                info!(
                    "Throughput report: {} requests, {} received over {:.3}s, inter-arrival {}",
                    report.rx_reqs,
                    crate::utils::format_bytes(report.rx_bytes),
                    report.duration_secs,
                    if report.interarrival_correct { "ok" } else { "suspect" }
                );
                self.log_report(ReportRecord::Throughput(&report));
                Reply::Throughput(ThroughputReply::from(&report))
            }
            ReportKind::Latency => {
                let target = self.agent.per_thread_samples();
                let report = tokio::task::spawn_blocking(move || aggregate_latency(&snapshots, target))
                    .await
                    .map_err(join_error)??
                    .with_duration(duration_secs);
                info!(
                    "Latency report: {} samples, mean {}ns, p99 {}ns, iid {}, stationary {}",
                    report.sample_count,
                    report.mean_latency,
                    report.percentiles.get(3).map(|p| p.value).unwrap_or(0),
                    report.independence.is_iid(),
                    report.stationary
                );
                self.log_report(ReportRecord::Latency(&report));
                Reply::Latency(LatencyReply::from(&report))
            }
        };

        self.reports += 1;
        Ok(reply)
    }

    fn log_report(&mut self, record: ReportRecord<'_>) {
        let window = self.windows;
        if let Some(log) = self.options.report_log.as_mut() {
            if let Err(e) = log.append(window, record) {
                warn!("Failed to write report log: {:#}", e);
            }
        }
    }

    /// Serve the connection until it closes or breaks, then tear down the agent.
    pub async fn serve(&mut self, mut conn: ClientConnection) -> SessionSummary {
        self.transition(SessionState::Serving);
        info!("Serving controller at {}", conn.peer());
        let started = Instant::now();

        let close_reason = loop {
            let request = match conn.recv_request().await {
                Ok(request) => request,
                Err(e) => {
                    error!("Failed to read request: {}", e);
                    break CloseReason::from_error(&e);
                }
            };
            if request != Request::Close {
                self.requests += 1;
            }

            match self.process(request).await {
                Ok(Step::Reply(reply)) => {
                    if let Err(e) = conn.send_reply(&reply).await {
                        error!("Failed to send reply: {}", e);
                        break CloseReason::from_error(&e);
                    }
                }
                Ok(Step::Close) => break CloseReason::ClientClosed,
                Err(e) if e.is_recoverable() && !self.closes_on(&e) => {
                    warn!("{}; no reply sent", e);
                    self.skipped_requests += 1;
                }
                Err(e) => {
                    error!("Request failed: {}", e);
                    break CloseReason::from_error(&e);
                }
            }
        };

        self.transition(SessionState::Closing);
        let agent_status = self.agent_status();
        conn.shutdown().await;
        self.terminate_agent();

        SessionSummary {
            requests: self.requests,
            reports: self.reports,
            skipped_requests: self.skipped_requests,
            close_reason,
            agent_status,
            elapsed: started.elapsed(),
        }
    }

    /// Check whether the agent outlived the session.
    fn agent_status(&mut self) -> AgentStatus {
        match self.agent.poll_agent() {
            Ok(Some(status)) => {
                warn!("{}", ManagerError::WorkerExitedUnexpectedly(status));
                AgentStatus::Exited(status)
            }
            Ok(None) => {
                info!("Agent still running; terminating it");
                AgentStatus::Running
            }
            Err(e) => {
                warn!("Could not check agent status: {}", e);
                AgentStatus::Unknown
            }
        }
    }

    fn terminate_agent(&mut self) {
        if let Err(e) = self.agent.terminate() {
            warn!("Failed to terminate agent: {}", e);
        }
    }
}

/// Launch the agent, accept one controller on `listener` and serve it.
pub async fn run_session<L: LoadShaper>(
    listener: TcpListener,
    agent_config: &AgentConfig,
    shaper: L,
    options: DispatcherOptions,
) -> Result<SessionSummary, ManagerError> {
    debug!("Session {}", SessionState::Attaching);
    let agent = AgentController::launch(agent_config, shaper).await?;
    let mut dispatcher = Dispatcher::new(agent, options);

    info!("Waiting for controller on {}", listener.local_addr()?);
    let conn = match accept_single(&listener).await {
        Ok(conn) => conn,
        Err(e) => {
            dispatcher.agent_status();
            dispatcher.terminate_agent();
            return Err(e);
        }
    };
    drop(listener);

    Ok(dispatcher.serve(conn).await)
}

//! # Shared-Memory Stats Model
//!
//! Binary layouts shared with the agent process. Every structure here is
//! `#[repr(C, packed)]` and must stay byte-identical to the agent's own
//! definitions: field order, widths and 1-byte packing are the ABI.
//!
//! ```text
//! ControlBlock (84 bytes)
//! ┌────────────┬─────────────┬────────────────┬──────────────┬────────────┬──────────────┬───────────────┬───────────┐
//! │ idist [52] │ should_load │ should_measure │ thread_count │ agent_type │ sample_count │ sampling_rate │ conn_open │
//! │  0..52     │  52 (i32)   │  56 (i32)      │  60 (i32)    │  64 (i32)  │  68 (u32)    │  72 (f64)     │ 80 (i32)  │
//! └────────────┴─────────────┴────────────────┴──────────────┴────────────┴──────────────┴───────────────┴───────────┘
//! ```
//!
//! The per-thread records are large (2 MiB and 5 MiB) and are only ever
//! accessed in place through a mapping; they are never built on the stack.

use crate::error::ManagerError;
use serde::Serialize;
use std::fmt;

/// Capacity of the per-thread latency sample ring.
pub const MAX_PER_THREAD_SAMPLES: usize = 131_072;

/// Number of transmit timestamps the agent actually cycles through.
///
/// The ring is declared with `MAX_PER_THREAD_SAMPLES` slots but written
/// modulo this value, so only the first 4096 entries ever hold samples.
pub const MAX_PER_THREAD_TX_SAMPLES: usize = 4096;

/// Width of the opaque inter-arrival generator state at the head of the control block.
pub const IDIST_LEN: usize = 52;

/// Control block shared with the agent.
///
/// `idist` belongs to the agent's inter-arrival generator and is only touched
/// by the load-shaping library. The manager owns the two flags and the
/// measurement parameters; the agent owns `thread_count`, `agent_type` and
/// `conn_open`.
#[repr(C, packed)]
pub struct ControlBlock {
    pub idist: [u8; IDIST_LEN],
    pub should_load: i32,
    pub should_measure: i32,
    pub thread_count: i32,
    pub agent_type: i32,
    pub sample_count: u32,
    pub sampling_rate: f64,
    pub conn_open: i32,
}

/// `struct timespec` as laid out by the agent (two 64-bit fields).
#[repr(C, packed)]
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct Timespec {
    pub sec: u64,
    pub nsec: u64,
}

impl Timespec {
    pub fn new(sec: u64, nsec: u64) -> Self {
        Self { sec, nsec }
    }

    /// Exact instant in nanoseconds.
    pub fn as_nanos(&self) -> u128 {
        let (sec, nsec) = (self.sec, self.nsec);
        sec as u128 * 1_000_000_000 + nsec as u128
    }

    /// Instant in nanoseconds as a float, the unit the statistical tests use.
    pub fn as_nanos_f64(&self) -> f64 {
        let (sec, nsec) = (self.sec, self.nsec);
        sec as f64 * 1e9 + nsec as f64
    }
}

/// Transmit timestamp ring.
#[repr(C, packed)]
pub struct TxTimestamps {
    pub count: u32,
    pub samples: [Timespec; MAX_PER_THREAD_SAMPLES],
}

/// Per-thread record written by throughput agents.
#[repr(C, packed)]
pub struct ThroughputStats {
    pub rx_bytes: u64,
    pub rx_reqs: u64,
    pub tx_bytes: u64,
    pub tx_reqs: u64,
    pub tx_ts: TxTimestamps,
}

/// One latency measurement and the instant its request was sent.
#[repr(C, packed)]
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct LatSample {
    pub nsec_latency: u64,
    pub sec_send: u64,
    pub nsec_send: u64,
}

impl LatSample {
    pub fn new(nsec_latency: u64, sent: Timespec) -> Self {
        Self {
            nsec_latency,
            sec_send: sent.sec,
            nsec_send: sent.nsec,
        }
    }

    pub fn latency(&self) -> u64 {
        self.nsec_latency
    }

    pub fn sent_at(&self) -> Timespec {
        Timespec::new(self.sec_send, self.nsec_send)
    }
}

/// Per-thread record written by the latency agents.
#[repr(C, packed)]
pub struct LatencyStats {
    pub rx_bytes: u64,
    pub rx_reqs: u64,
    pub tx_bytes: u64,
    pub tx_reqs: u64,
    pub inc_idx: u32,
    pub samples: [LatSample; MAX_PER_THREAD_SAMPLES],
    pub tx_ts: TxTimestamps,
}

const _: () = assert!(std::mem::size_of::<ControlBlock>() == 84);
const _: () = assert!(std::mem::size_of::<Timespec>() == 16);
const _: () = assert!(std::mem::size_of::<TxTimestamps>() == 4 + 16 * MAX_PER_THREAD_SAMPLES);
const _: () = assert!(std::mem::size_of::<ThroughputStats>() == 2_097_188);
const _: () = assert!(std::mem::size_of::<LatSample>() == 24);
const _: () = assert!(std::mem::size_of::<LatencyStats>() == 5_242_920);

/// Measurement mode the agent was started in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AgentType {
    Throughput,
    LatencyOpen,
    LatencyClosed,
    LatencyOther,
}

impl AgentType {
    /// The per-thread record layout this agent type writes.
    pub fn layout(&self) -> RecordLayout {
        match self {
            AgentType::Throughput => RecordLayout::Throughput,
            _ => RecordLayout::Latency,
        }
    }

    pub fn as_raw(&self) -> i32 {
        match self {
            AgentType::Throughput => 0,
            AgentType::LatencyOpen => 1,
            AgentType::LatencyClosed => 2,
            AgentType::LatencyOther => 3,
        }
    }
}

impl TryFrom<i32> for AgentType {
    type Error = ManagerError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AgentType::Throughput),
            1 => Ok(AgentType::LatencyOpen),
            2 => Ok(AgentType::LatencyClosed),
            3 => Ok(AgentType::LatencyOther),
            other => Err(ManagerError::UnknownAgentType(other)),
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentType::Throughput => write!(f, "throughput"),
            AgentType::LatencyOpen => write!(f, "latency (open loop)"),
            AgentType::LatencyClosed => write!(f, "latency (closed loop)"),
            AgentType::LatencyOther => write!(f, "latency"),
        }
    }
}

/// Shape of a per-thread stats segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordLayout {
    Throughput,
    Latency,
}

impl RecordLayout {
    /// Exact segment size for this layout.
    pub fn record_size(&self) -> usize {
        match self {
            RecordLayout::Throughput => std::mem::size_of::<ThroughputStats>(),
            RecordLayout::Latency => std::mem::size_of::<LatencyStats>(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc, dealloc, Layout};
    use std::ptr::addr_of;

    // The records are far larger than a test thread's stack, so the probe
    // allocation lives on the heap.
    macro_rules! offset {
        ($ty:ty, $($field:tt).+) => {{
            let layout = Layout::new::<$ty>();
            // SAFETY: only addresses are computed, the memory is never read.
            unsafe {
                let p = alloc(layout) as *const $ty;
                assert!(!p.is_null());
                let off = (addr_of!((*p).$($field).+) as *const u8).offset_from(p as *const u8) as usize;
                dealloc(p as *mut u8, layout);
                off
            }
        }};
    }

    #[test]
    fn test_control_block_offsets() {
        assert_eq!(offset!(ControlBlock, should_load), 52);
        assert_eq!(offset!(ControlBlock, should_measure), 56);
        assert_eq!(offset!(ControlBlock, thread_count), 60);
        assert_eq!(offset!(ControlBlock, agent_type), 64);
        assert_eq!(offset!(ControlBlock, sample_count), 68);
        assert_eq!(offset!(ControlBlock, sampling_rate), 72);
        assert_eq!(offset!(ControlBlock, conn_open), 80);
    }

    #[test]
    fn test_record_offsets() {
        assert_eq!(offset!(ThroughputStats, tx_ts), 32);
        assert_eq!(offset!(LatencyStats, inc_idx), 32);
        assert_eq!(offset!(LatencyStats, samples), 36);
        assert_eq!(offset!(LatencyStats, tx_ts), 36 + 24 * MAX_PER_THREAD_SAMPLES);
    }

    #[test]
    fn test_agent_type_from_raw() {
        assert_eq!(AgentType::try_from(0).unwrap(), AgentType::Throughput);
        assert_eq!(AgentType::try_from(3).unwrap(), AgentType::LatencyOther);
        assert!(matches!(
            AgentType::try_from(4),
            Err(ManagerError::UnknownAgentType(4))
        ));
        assert!(matches!(
            AgentType::try_from(-1),
            Err(ManagerError::UnknownAgentType(-1))
        ));
        for raw in 0..4 {
            assert_eq!(AgentType::try_from(raw).unwrap().as_raw(), raw);
        }
    }

    #[test]
    fn test_layout_selection() {
        assert_eq!(AgentType::Throughput.layout(), RecordLayout::Throughput);
        assert_eq!(AgentType::LatencyClosed.layout(), RecordLayout::Latency);
        assert_eq!(RecordLayout::Throughput.record_size(), 2_097_188);
        assert_eq!(RecordLayout::Latency.record_size(), 5_242_920);
    }

    #[test]
    fn test_timespec_nanos() {
        let ts = Timespec::new(2, 500);
        assert_eq!(ts.as_nanos(), 2_000_000_500);
        assert_eq!(ts.as_nanos_f64(), 2_000_000_500.0);
    }
}

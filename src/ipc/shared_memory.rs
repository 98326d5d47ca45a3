//! Typed views over the agent's POSIX shared memory segments.
//!
//! The agent creates one control segment and one stats segment per worker
//! thread. The manager only attaches to them. All access goes through raw
//! pointers into the mapping; no Rust reference to shared memory is ever
//! formed, since the agent mutates it concurrently.
//!
//! Synchronisation with the agent is advisory: the manager flips
//! `should_load` / `should_measure` and the agent polls them. An agent thread
//! that is mid-write when `should_measure` is cleared may still complete that
//! write after the manager has started copying the records out, so a
//! snapshot is eventually consistent rather than a point-in-time capture.

use super::layout::{
    ControlBlock, LatSample, LatencyStats, RecordLayout, ThroughputStats, Timespec,
    MAX_PER_THREAD_SAMPLES, MAX_PER_THREAD_TX_SAMPLES,
};
use crate::error::ManagerError;
use crate::metrics::{Counters, LatencySnapshot, ThreadSnapshot, ThroughputSnapshot};
use shared_memory::{Shmem, ShmemConf};
use std::marker::PhantomData;
use std::ptr::{self, addr_of, addr_of_mut};
use tracing::debug;

/// A mapped shared memory segment.
pub struct SharedSegment {
    shmem: Shmem,
    name: String,
}

// The mapping stays valid for the lifetime of `Shmem`; all accesses are raw
// pointer reads and writes, so moving the handle between threads is sound.
unsafe impl Send for SharedSegment {}

impl SharedSegment {
    /// Attach to an existing segment, checking it is at least `min_size` bytes.
    pub fn open(name: &str, min_size: usize) -> Result<Self, ManagerError> {
        let shmem = ShmemConf::new()
            .os_id(name)
            .open()
            .map_err(|e| ManagerError::SharedMemory {
                segment: name.to_string(),
                reason: e.to_string(),
            })?;

        if shmem.len() < min_size {
            return Err(ManagerError::SharedMemory {
                segment: name.to_string(),
                reason: format!(
                    "segment is {} bytes, expected at least {}",
                    shmem.len(),
                    min_size
                ),
            });
        }

        debug!("Attached shared memory segment {} ({} bytes)", name, shmem.len());
        Ok(Self {
            shmem,
            name: name.to_string(),
        })
    }

    /// Create a zero-filled segment owned by this process.
    ///
    /// This is the agent's side of the contract; the manager itself never
    /// creates segments. The segment is unlinked when the value is dropped.
    #[doc(hidden)]
    pub fn create(name: &str, size: usize) -> Result<Self, ManagerError> {
        let shmem = ShmemConf::new()
            .size(size)
            .os_id(name)
            .create()
            .map_err(|e| ManagerError::SharedMemory {
                segment: name.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            shmem,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.shmem.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shmem.len() == 0
    }

    fn base(&self) -> *mut u8 {
        self.shmem.as_ptr()
    }
}

/// Typed access to the control block.
///
/// The mapping base is page aligned and every control field sits at a
/// naturally aligned offset, so each field is read and written with a single
/// volatile access of its own width.
pub struct ControlBlockView {
    segment: SharedSegment,
}

// Attributes before the getter name apply to the setter only.
macro_rules! control_field {
    ($(#[$setter_attr:meta])* $getter:ident, $setter:ident, $field:ident, $ty:ty) => {
        pub fn $getter(&self) -> $ty {
            // SAFETY: the segment is at least size_of::<ControlBlock>() bytes
            // and the field offset is aligned for its type.
            unsafe { addr_of!((*self.ptr()).$field).read_volatile() }
        }

        $(#[$setter_attr])*
        pub fn $setter(&self, value: $ty) {
            // SAFETY: see the getter.
            unsafe { addr_of_mut!((*self.ptr()).$field).write_volatile(value) }
        }
    };
}

impl ControlBlockView {
    /// Attach to the control block the agent created.
    pub fn attach(name: &str) -> Result<Self, ManagerError> {
        let segment = SharedSegment::open(name, std::mem::size_of::<ControlBlock>())?;
        Self::from_segment(segment)
    }

    /// Create a fresh, zeroed control block (agent side).
    #[doc(hidden)]
    pub fn create(name: &str) -> Result<Self, ManagerError> {
        let segment = SharedSegment::create(name, std::mem::size_of::<ControlBlock>())?;
        Self::from_segment(segment)
    }

    fn from_segment(segment: SharedSegment) -> Result<Self, ManagerError> {
        if segment.base() as usize % std::mem::align_of::<f64>() != 0 {
            return Err(ManagerError::SharedMemory {
                segment: segment.name().to_string(),
                reason: "control block mapping is not 8-byte aligned".to_string(),
            });
        }
        Ok(Self { segment })
    }

    fn ptr(&self) -> *mut ControlBlock {
        self.segment.base() as *mut ControlBlock
    }

    /// Raw pointer handed to the load-shaping library.
    pub fn as_mut_ptr(&self) -> *mut ControlBlock {
        self.ptr()
    }

    pub fn name(&self) -> &str {
        self.segment.name()
    }

    // The agent owns thread_count, agent_type and conn_open; their setters
    // exist for stand-in agents.
    control_field!(#[doc(hidden)] thread_count, set_thread_count, thread_count, i32);
    control_field!(#[doc(hidden)] agent_type, set_agent_type, agent_type, i32);
    control_field!(sample_count, set_sample_count, sample_count, u32);
    control_field!(sampling_rate, set_sampling_rate, sampling_rate, f64);
    control_field!(#[doc(hidden)] conn_open, set_conn_open, conn_open, i32);

    pub fn should_load(&self) -> bool {
        // SAFETY: aligned i32 inside the mapping.
        unsafe { addr_of!((*self.ptr()).should_load).read_volatile() != 0 }
    }

    pub fn set_should_load(&self, on: bool) {
        // SAFETY: aligned i32 inside the mapping.
        unsafe { addr_of_mut!((*self.ptr()).should_load).write_volatile(on as i32) }
    }

    pub fn should_measure(&self) -> bool {
        // SAFETY: aligned i32 inside the mapping.
        unsafe { addr_of!((*self.ptr()).should_measure).read_volatile() != 0 }
    }

    pub fn set_should_measure(&self, on: bool) {
        // SAFETY: aligned i32 inside the mapping.
        unsafe { addr_of_mut!((*self.ptr()).should_measure).write_volatile(on as i32) }
    }
}

/// Typed view over one per-thread stats segment.
pub struct StatsView<T> {
    segment: SharedSegment,
    _record: PhantomData<T>,
}

impl<T> StatsView<T> {
    pub fn attach(name: &str) -> Result<Self, ManagerError> {
        let segment = SharedSegment::open(name, std::mem::size_of::<T>())?;
        Ok(Self {
            segment,
            _record: PhantomData,
        })
    }

    #[doc(hidden)]
    pub fn create(name: &str) -> Result<Self, ManagerError> {
        let segment = SharedSegment::create(name, std::mem::size_of::<T>())?;
        Ok(Self {
            segment,
            _record: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        self.segment.name()
    }

    fn ptr(&self) -> *mut T {
        self.segment.base() as *mut T
    }
}

// Both record layouts start with the same counters and end with a transmit
// timestamp ring, so the shared accessors are generated for each of them.
macro_rules! common_record_access {
    ($record:ty) => {
        impl StatsView<$record> {
            pub fn counters(&self) -> Counters {
                let p = self.ptr();
                // SAFETY: the segment holds a whole record; packed fields are
                // read unaligned.
                unsafe {
                    Counters {
                        rx_bytes: addr_of!((*p).rx_bytes).read_unaligned(),
                        rx_reqs: addr_of!((*p).rx_reqs).read_unaligned(),
                        tx_bytes: addr_of!((*p).tx_bytes).read_unaligned(),
                        tx_reqs: addr_of!((*p).tx_reqs).read_unaligned(),
                    }
                }
            }

            /// Overwrite the counters (agent side).
            #[doc(hidden)]
            pub fn set_counters(&self, counters: Counters) {
                let p = self.ptr();
                // SAFETY: see `counters`.
                unsafe {
                    addr_of_mut!((*p).rx_bytes).write_unaligned(counters.rx_bytes);
                    addr_of_mut!((*p).rx_reqs).write_unaligned(counters.rx_reqs);
                    addr_of_mut!((*p).tx_bytes).write_unaligned(counters.tx_bytes);
                    addr_of_mut!((*p).tx_reqs).write_unaligned(counters.tx_reqs);
                }
            }

            pub fn tx_count(&self) -> u32 {
                // SAFETY: see `counters`.
                unsafe { addr_of!((*self.ptr()).tx_ts.count).read_unaligned() }
            }

            /// Copy out the valid part of the transmit timestamp ring.
            pub fn tx_timestamps(&self) -> Vec<Timespec> {
                let valid = (self.tx_count() as usize).min(MAX_PER_THREAD_TX_SAMPLES);
                // Timespec is packed (align 1), so the ring can be copied as a block.
                let src = unsafe { addr_of!((*self.ptr()).tx_ts.samples) } as *const Timespec;
                let mut out = Vec::with_capacity(valid);
                // SAFETY: `valid` never exceeds the ring capacity and the
                // destination was reserved for exactly that many elements.
                unsafe {
                    ptr::copy_nonoverlapping(src, out.as_mut_ptr(), valid);
                    out.set_len(valid);
                }
                out
            }

            /// Append a transmit timestamp the way the agent does (agent side).
            #[doc(hidden)]
            pub fn push_tx_timestamp(&self, ts: Timespec) {
                let count = self.tx_count();
                let slot = count as usize % MAX_PER_THREAD_TX_SAMPLES;
                let p = self.ptr();
                // SAFETY: `slot` is inside the ring.
                unsafe {
                    let base = addr_of_mut!((*p).tx_ts.samples) as *mut Timespec;
                    base.add(slot).write_unaligned(ts);
                    addr_of_mut!((*p).tx_ts.count).write_unaligned(count.wrapping_add(1));
                }
            }

            fn reset_common(&self) {
                self.set_counters(Counters::default());
                // SAFETY: see `counters`.
                unsafe { addr_of_mut!((*self.ptr()).tx_ts.count).write_unaligned(0) }
            }
        }
    };
}

common_record_access!(ThroughputStats);
common_record_access!(LatencyStats);

impl StatsView<LatencyStats> {
    /// Index of the next sample slot the agent will write.
    pub fn inc_idx(&self) -> u32 {
        // SAFETY: see `counters`.
        unsafe { addr_of!((*self.ptr()).inc_idx).read_unaligned() }
    }

    /// Copy out every written latency sample, up to the ring capacity.
    pub fn latency_samples(&self) -> Vec<LatSample> {
        let valid = (self.inc_idx() as usize).min(MAX_PER_THREAD_SAMPLES);
        let src = unsafe { addr_of!((*self.ptr()).samples) } as *const LatSample;
        let mut out = Vec::with_capacity(valid);
        // SAFETY: LatSample is packed (align 1) and `valid` is bounded by the
        // ring capacity.
        unsafe {
            ptr::copy_nonoverlapping(src, out.as_mut_ptr(), valid);
            out.set_len(valid);
        }
        out
    }

    /// Record a latency sample the way the agent does (agent side).
    #[doc(hidden)]
    pub fn push_latency_sample(&self, sample: LatSample) {
        let idx = self.inc_idx();
        let slot = idx as usize % MAX_PER_THREAD_SAMPLES;
        let p = self.ptr();
        // SAFETY: `slot` is inside the ring.
        unsafe {
            let base = addr_of_mut!((*p).samples) as *mut LatSample;
            base.add(slot).write_unaligned(sample);
            addr_of_mut!((*p).inc_idx).write_unaligned(idx.wrapping_add(1));
        }
    }
}

/// A per-thread stats segment, with its layout fixed at attach time.
pub enum ThreadStats {
    Throughput(StatsView<ThroughputStats>),
    Latency(StatsView<LatencyStats>),
}

impl ThreadStats {
    /// Attach to a stats segment using the layout selected by the agent type.
    pub fn attach(name: &str, layout: RecordLayout) -> Result<Self, ManagerError> {
        match layout {
            RecordLayout::Throughput => StatsView::attach(name).map(ThreadStats::Throughput),
            RecordLayout::Latency => StatsView::attach(name).map(ThreadStats::Latency),
        }
    }

    /// Create a zeroed stats segment (agent side).
    #[doc(hidden)]
    pub fn create(name: &str, layout: RecordLayout) -> Result<Self, ManagerError> {
        match layout {
            RecordLayout::Throughput => StatsView::create(name).map(ThreadStats::Throughput),
            RecordLayout::Latency => StatsView::create(name).map(ThreadStats::Latency),
        }
    }

    pub fn layout(&self) -> RecordLayout {
        match self {
            ThreadStats::Throughput(_) => RecordLayout::Throughput,
            ThreadStats::Latency(_) => RecordLayout::Latency,
        }
    }

    pub fn counters(&self) -> Counters {
        match self {
            ThreadStats::Throughput(view) => view.counters(),
            ThreadStats::Latency(view) => view.counters(),
        }
    }

    #[doc(hidden)]
    pub fn set_counters(&self, counters: Counters) {
        match self {
            ThreadStats::Throughput(view) => view.set_counters(counters),
            ThreadStats::Latency(view) => view.set_counters(counters),
        }
    }

    #[doc(hidden)]
    pub fn push_tx_timestamp(&self, ts: Timespec) {
        match self {
            ThreadStats::Throughput(view) => view.push_tx_timestamp(ts),
            ThreadStats::Latency(view) => view.push_tx_timestamp(ts),
        }
    }

    /// Zero the counters, the timestamp ring count and the sample index.
    ///
    /// Only valid while `should_measure` is clear.
    pub fn reset(&self) {
        match self {
            ThreadStats::Throughput(view) => view.reset_common(),
            ThreadStats::Latency(view) => {
                view.reset_common();
                // SAFETY: see `StatsView::counters`.
                unsafe { addr_of_mut!((*view.ptr()).inc_idx).write_unaligned(0) }
            }
        }
    }

    /// Copy the record out of shared memory.
    pub fn snapshot(&self) -> ThreadSnapshot {
        match self {
            ThreadStats::Throughput(view) => ThreadSnapshot {
                throughput: ThroughputSnapshot {
                    counters: view.counters(),
                    tx_count: view.tx_count(),
                    tx_timestamps: view.tx_timestamps(),
                },
                latency: None,
            },
            ThreadStats::Latency(view) => ThreadSnapshot {
                throughput: ThroughputSnapshot {
                    counters: view.counters(),
                    tx_count: view.tx_count(),
                    tx_timestamps: view.tx_timestamps(),
                },
                latency: Some(LatencySnapshot {
                    inc_idx: view.inc_idx(),
                    samples: view.latency_samples(),
                }),
            },
        }
    }
}

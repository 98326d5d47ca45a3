//! Everything that crosses a process boundary: the shared memory layouts and
//! views used to talk to the agent, and the TCP protocol used to talk to the
//! remote controller.

pub mod layout;
pub mod protocol;
pub mod shared_memory;
pub mod tcp_socket;

pub use layout::{AgentType, RecordLayout};
pub use protocol::{ReportKind, Reply, Request};
pub use shared_memory::{ControlBlockView, ThreadStats};
pub use tcp_socket::{accept_single, ClientConnection};

/// Name of the stats segment for worker thread `index`.
pub fn stats_segment_name(prefix: &str, index: usize) -> String {
    format!("{}{}", prefix, index)
}

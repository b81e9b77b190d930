//! Live-monitor shared-memory fan-out.
//!
//! The server maps one shared memory region per partition tag and hands
//! filled buffer indices to out-of-process monitor clients over POSIX
//! message queues. Transitions and per-shot events travel on separate
//! lanes; configuration transitions are cached and replayed to clients that
//! attach late. See [`server::MonitorServer`] for the protocol.

pub mod client;
pub mod queue;
pub mod server;

use bytemuck::{Pod, Zeroable};
use thiserror::Error;

/// Errors of the shared-memory subsystem. Failures during startup are fatal;
/// failures in steady state are best-effort and logged.
#[derive(Error, Debug)]
pub enum ShmError {
    /// A queue or shm name contained an interior NUL.
    #[error("bad resource name '{0}'")]
    BadName(String),

    /// `mq_open` failed.
    #[error("cannot open message queue {name}: {errno}")]
    QueueOpen {
        /// Queue name.
        name: String,
        /// The OS error.
        errno: std::io::Error,
    },

    /// A queue operation failed.
    #[error("message queue error: {0}")]
    QueueIo(std::io::Error),

    /// A zero-timeout send found the queue full.
    #[error("queue full")]
    QueueFull,

    /// Opening or mapping the shared memory region failed.
    #[error("cannot map shared memory {name}: {errno}")]
    ShmOpen {
        /// Region name.
        name: String,
        /// The OS error.
        errno: std::io::Error,
    },

    /// A datagram did not fit one shared buffer.
    #[error("datagram of {size} bytes exceeds the buffer size {buf_size}")]
    DatagramTooLarge {
        /// Datagram size.
        size: usize,
        /// Configured per-buffer size.
        buf_size: usize,
    },
}

/// The 12 byte message exchanged with monitor clients.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct Msg {
    /// Index of the shared buffer this message refers to.
    pub index: i32,
    /// Total number of buffers in the region.
    pub n_buffers: i32,
    /// Size of one buffer in bytes.
    pub buf_size: u32,
}

/// The intra-process shuffle message decoupling the datagram copy from the
/// input thread. Carries the shared-buffer index and the ring sequence of
/// the event to copy.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct ShuffleMsg {
    /// Index of the shared buffer reserved for the event.
    pub index: i32,
    /// Padding, keeps `seq` aligned.
    pub reserved: i32,
    /// Ring sequence number of the event.
    pub seq: u64,
}

/// Number of transition buffers, in addition to the configured event
/// buffers.
pub const NBR_OF_TR_BUFFERS: usize = 8;

/// Shared memory region name for a partition tag.
#[must_use]
pub fn shm_name(partition: &str) -> String {
    format!("/PdsMonitorSharedMemory_{partition}")
}

/// Server-to-client event queue name.
#[must_use]
pub fn to_monitor_ev_queue(partition: &str) -> String {
    format!("/PdsToMonitorEvQueue_{partition}")
}

/// Client-to-server event return queue name; doubles as the free list.
#[must_use]
pub fn from_monitor_ev_queue(partition: &str) -> String {
    format!("/PdsFromMonitorEvQueue_{partition}")
}

/// Client discovery queue name.
#[must_use]
pub fn discovery_queue(partition: &str) -> String {
    format!("/PdsFromMonitorDiscovery_{partition}")
}

/// Per-client transition queue name.
#[must_use]
pub fn to_monitor_tr_queue(partition: &str, client: usize) -> String {
    format!("/PdsToMonitorTrQueue_{partition}_{client}")
}

/// Intra-server shuffle queue name.
#[must_use]
pub fn shuffle_queue(partition: &str) -> String {
    format!("/PdsShuffleQueue_{partition}")
}

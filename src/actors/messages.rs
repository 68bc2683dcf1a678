//! Message types for actor communication
//!
//! ## Design Principles
//!
//! 1. **Commands**: Request/response messages sent to specific actors via mpsc
//! 2. **Events**: Broadcast notifications published to multiple subscribers
//! 3. **Immutability**: All messages are cloneable for multi-subscriber patterns

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

/// One observed transmission from a device, as captured by the upload
/// listener.
#[derive(Debug, Clone)]
pub struct PacketSample {
    /// Source endpoint the bytes arrived from. Flows are keyed by this.
    pub src: SocketAddr,

    /// Payload size in bytes
    pub bytes: usize,

    /// Offset-corrected capture time
    pub at: DateTime<Utc>,
}

/// Device-reported marker that an upload window is complete.
///
/// Arrives on the wire as `{"device_id": ..., "send_timestamp": ...}` at the
/// end of a bulk upload; the listener attaches the peer address so the
/// reconstructor can find the matching flow.
#[derive(Debug, Clone)]
pub struct UploadEvent {
    pub device_id: String,

    /// Device-clock send time as Unix seconds, already corrected on the
    /// device side
    pub send_timestamp: f64,

    /// Endpoint the upload came from
    pub source: SocketAddr,
}

/// Event published after every successful data fetch
///
/// The broadcast channel may lag or drop messages for slow subscribers -
/// this is acceptable, fetches are continuous and consumers can resync from
/// a registry snapshot.
#[derive(Debug, Clone)]
pub struct FetchEvent {
    pub device_id: String,

    /// Size of the fetched payload
    pub bytes: usize,

    /// When the fetch completed
    pub at: DateTime<Utc>,
}

/// Operating mode of the poll scheduler
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerMode {
    /// Rank all eligible devices and sweep them in order
    Default,

    /// Poll exactly these devices, in the given order, every tick
    Focused(Vec<String>),

    /// Terminal. Entered by the stop command, never left.
    Stopped,
}

/// Commands that can be sent to the SchedulerActor
#[derive(Debug)]
pub enum SchedulerCommand {
    /// Override ranking with an explicit device list
    Focus { ids: Vec<String> },

    /// Drop the focus list and resume ranked polling
    Unfocus,

    /// Get the current operating mode
    GetMode {
        respond_to: oneshot::Sender<SchedulerMode>,
    },

    /// Stop polling for good. The actor exits after the current pass.
    Stop,
}

/// Commands that can be sent to the ReconstructorActor
#[derive(Debug)]
pub enum ReconstructorCommand {
    /// Number of flows currently accumulating packets
    GetOpenFlows { respond_to: oneshot::Sender<usize> },
}

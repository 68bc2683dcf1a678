//! Network adapters the monitoring pipeline talks through.
//!
//! The probe engine and the scheduler only see the traits defined here, so
//! tests can swap the real TCP/HTTP implementations for scripted ones.

pub mod http;
pub mod tcp;

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;

pub use http::HttpFetcher;
pub use tcp::TcpProber;

use crate::FieldDevice;

pub type ProbeResult<T> = Result<T, ProbeError>;

/// Errors produced by echo and throughput probes
#[derive(Debug)]
pub enum ProbeError {
    /// The probe did not complete within its deadline
    Timeout,

    /// Transport-level failure (refused, reset, unreachable)
    Connection(std::io::Error),
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeError::Timeout => write!(f, "probe timed out"),
            ProbeError::Connection(err) => write!(f, "probe connection failed: {}", err),
        }
    }
}

impl std::error::Error for ProbeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProbeError::Connection(err) => Some(err),
            ProbeError::Timeout => None,
        }
    }
}

impl From<std::io::Error> for ProbeError {
    fn from(err: std::io::Error) -> Self {
        ProbeError::Connection(err)
    }
}

impl From<tokio::time::error::Elapsed> for ProbeError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ProbeError::Timeout
    }
}

pub type FetchResult<T> = Result<T, FetchError>;

/// Errors produced by data fetch attempts
#[derive(Debug)]
pub enum FetchError {
    /// The fetch did not complete within its deadline
    Timeout,

    /// Could not reach the device at all
    Connection(String),

    /// The device answered with a non-success status code
    Status(u16),
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Timeout => write!(f, "fetch timed out"),
            FetchError::Connection(msg) => write!(f, "fetch connection failed: {}", msg),
            FetchError::Status(code) => write!(f, "device answered with HTTP {}", code),
        }
    }
}

impl std::error::Error for FetchError {}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Connection(err.to_string())
        }
    }
}

/// One completed throughput round trip. Counts payload bytes in both
/// directions, the way the devices account for it.
#[derive(Debug, Clone, Copy)]
pub struct TransferSample {
    pub bytes: usize,
    pub elapsed: Duration,
}

impl TransferSample {
    pub fn kbps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            (self.bytes * 8) as f64 / (secs * 1000.0)
        } else {
            0.0
        }
    }
}

/// Low-level reachability measurements against a single device.
///
/// Implementations must be `Send + Sync`; one instance is shared by all
/// probe workers.
#[async_trait]
pub trait ProbeTransport: Send + Sync {
    /// One echo round trip. Returns the measured round-trip time.
    async fn echo(&self, target: SocketAddr) -> ProbeResult<Duration>;

    /// Push `payload_bytes` to the device and read back its reply, timing
    /// the whole exchange.
    async fn throughput(&self, target: SocketAddr, payload_bytes: usize)
    -> ProbeResult<TransferSample>;
}

/// Data retrieval from a device, used by the poll scheduler.
#[async_trait]
pub trait FetchTransport: Send + Sync {
    async fn fetch(&self, device: &FieldDevice) -> FetchResult<Vec<u8>>;
}

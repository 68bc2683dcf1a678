pub mod actors;
pub mod classify;
pub mod clock;
pub mod config;
pub mod control;
pub mod ingest;
pub mod registry;
pub mod transport;
pub mod util;

use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classify::Classification;

/// A remote endpoint under observation. Identity is fixed at startup; all
/// mutable measurement state lives in the [`registry::DeviceRegistry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDevice {
    pub id: String,
    pub ip: IpAddr,
    pub port: u16,
    pub region: String,
}

impl FieldDevice {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// One complete measurement of link quality toward a device.
///
/// The probe engine and the flow reconstructor each overwrite their own copy
/// wholesale; the two paths never share an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkMetrics {
    /// Mean round-trip latency in milliseconds. `None` when every echo in
    /// the cycle was lost.
    pub latency_ms: Option<f64>,
    pub packet_loss_pct: f64,
    pub throughput_kbps: f64,
    pub status: Classification,
    pub last_active: DateTime<Utc>,
}

impl LinkMetrics {
    /// A record for a device that produced no measurable traffic at all.
    pub fn unavailable(at: DateTime<Utc>) -> Self {
        Self {
            latency_ms: None,
            packet_loss_pct: 100.0,
            throughput_kbps: 0.0,
            status: Classification::Unavailable,
            last_active: at,
        }
    }
}

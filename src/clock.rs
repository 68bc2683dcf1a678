use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_DELTA: f64 = 2_208_988_800.0;

/// Oracle for the local clock's offset against a reference, in seconds
/// (positive means the local clock runs behind).
#[async_trait]
pub trait OffsetSource: Send + Sync {
    async fn offset_secs(&self) -> anyhow::Result<f64>;
}

/// Clock used to stamp captured traffic. The offset is resolved once at
/// startup; every read afterwards is the local clock plus that fixed offset.
#[derive(Debug, Clone, Copy)]
pub struct MonitorClock {
    offset_secs: f64,
}

impl MonitorClock {
    pub fn with_offset(offset_secs: f64) -> Self {
        MonitorClock { offset_secs }
    }

    /// Ask the oracle once. An unreachable oracle degrades to an uncorrected
    /// clock instead of blocking startup.
    pub async fn resolve(source: &dyn OffsetSource) -> Self {
        match source.offset_secs().await {
            Ok(offset) => {
                debug!("clock offset resolved: {offset:.6}s");
                MonitorClock {
                    offset_secs: offset,
                }
            }
            Err(error) => {
                warn!("clock offset unavailable, timestamps stay uncorrected: {error:#}");
                MonitorClock { offset_secs: 0.0 }
            }
        }
    }

    pub fn offset_secs(&self) -> f64 {
        self.offset_secs
    }

    pub fn now(&self) -> DateTime<Utc> {
        Utc::now() + TimeDelta::microseconds((self.offset_secs * 1_000_000.0) as i64)
    }
}

/// Single-exchange SNTP client (RFC 4330). One UDP round trip per call,
/// offset from the usual four-timestamp formula.
pub struct SntpOffsetSource {
    server: String,
    timeout: Duration,
}

impl SntpOffsetSource {
    pub fn new(server: impl Into<String>) -> Self {
        SntpOffsetSource {
            server: server.into(),
            timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl OffsetSource for SntpOffsetSource {
    async fn offset_secs(&self) -> anyhow::Result<f64> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("binding sntp socket")?;
        socket
            .connect(&self.server)
            .await
            .with_context(|| format!("resolving ntp server {}", self.server))?;

        let mut request = [0u8; 48];
        request[0] = 0x1B; // LI 0, version 3, mode 3 (client)

        let t1 = unix_now();
        socket.send(&request).await.context("sending sntp request")?;

        let mut response = [0u8; 48];
        let received = timeout(self.timeout, socket.recv(&mut response))
            .await
            .context("sntp response timed out")?
            .context("receiving sntp response")?;
        let t4 = unix_now();

        offset_from_response(&response[..received], t1, t4)
    }
}

fn unix_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

fn ntp_to_unix(bytes: &[u8]) -> f64 {
    let secs = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64;
    let frac = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as f64 / 2f64.powi(32);
    secs + frac - NTP_UNIX_DELTA
}

fn offset_from_response(response: &[u8], t1: f64, t4: f64) -> anyhow::Result<f64> {
    if response.len() < 48 {
        bail!("short sntp response ({} bytes)", response.len());
    }

    let mode = response[0] & 0x07;
    if mode != 4 {
        bail!("unexpected sntp mode {mode}");
    }
    if response[1] == 0 {
        bail!("kiss-of-death reply from ntp server");
    }
    if response[40..48].iter().all(|byte| *byte == 0) {
        bail!("ntp server sent an empty transmit timestamp");
    }

    let t2 = ntp_to_unix(&response[32..40]);
    let t3 = ntp_to_unix(&response[40..48]);
    Ok(((t2 - t1) + (t3 - t4)) / 2.0)
}

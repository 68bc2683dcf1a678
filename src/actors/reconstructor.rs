//! Passive flow reconstructor.
//!
//! Owns the table of per-source flow accumulators. Packet samples append to
//! a flow; the device's upload event closes the window, turns the
//! accumulated samples into passive metrics and clears the flow. Flows whose
//! upload event never arrives are dropped by a periodic staleness sweep.
//!
//! The actor is the sole owner of the table, so no locking is needed around
//! it; everything arrives through channels.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::interval;
use tracing::{debug, instrument, trace, warn};

use crate::LinkMetrics;
use crate::classify::classify;
use crate::clock::MonitorClock;
use crate::config::PassiveConfig;
use crate::registry::DeviceRegistry;

use super::messages::{PacketSample, ReconstructorCommand, UploadEvent};

/// Every packet observed from one source endpoint since its last upload
/// event.
#[derive(Debug)]
struct FlowAccumulator {
    samples: Vec<(DateTime<Utc>, usize)>,
    last_seen: DateTime<Utc>,
}

/// Derive passive metrics from one completed upload window.
///
/// `send_timestamp` is the device-reported Unix send time in seconds,
/// already corrected on the device side. A window that spans negative time
/// (clock disagreement) is clamped to zero, which zeroes the derived figures
/// and classifies Unavailable. An empty window comes out all zero as well.
fn derive_metrics(
    samples: &[(DateTime<Utc>, usize)],
    send_timestamp: f64,
    at: DateTime<Utc>,
) -> LinkMetrics {
    if samples.is_empty() {
        return LinkMetrics {
            latency_ms: Some(0.0),
            packet_loss_pct: 0.0,
            throughput_kbps: 0.0,
            status: classify(Some(0.0), 0.0, 0.0),
            last_active: at,
        };
    }

    let (last_at, _) = samples[samples.len() - 1];
    let last_unix = last_at.timestamp_micros() as f64 / 1_000_000.0;

    let mut total_time = last_unix - send_timestamp;
    if total_time < 0.0 {
        warn!("upload window spans negative time, check clock sync");
        total_time = 0.0;
    }

    let packet_count = samples.len();
    let total_bytes: usize = samples.iter().map(|(_, bytes)| bytes).sum();

    let latency_ms = total_time / packet_count as f64 * 1000.0;
    let throughput_kbps = if total_time > 0.0 {
        total_bytes as f64 / total_time * 8.0 / 1000.0
    } else {
        0.0
    };

    // Loss is invisible to the passive path; the capture only sees packets
    // that made it.
    let status = classify(Some(latency_ms), 0.0, throughput_kbps);

    LinkMetrics {
        latency_ms: Some(latency_ms),
        packet_loss_pct: 0.0,
        throughput_kbps,
        status,
        last_active: at,
    }
}

/// Actor that reconstructs link metrics from observed upload traffic
pub struct ReconstructorActor {
    registry: Arc<DeviceRegistry>,
    clock: MonitorClock,
    config: PassiveConfig,
    flows: HashMap<SocketAddr, FlowAccumulator>,
    packet_rx: mpsc::Receiver<PacketSample>,
    upload_rx: mpsc::Receiver<UploadEvent>,
    command_rx: mpsc::Receiver<ReconstructorCommand>,
    stop_rx: watch::Receiver<bool>,
}

impl ReconstructorActor {
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting flow reconstructor");

        let mut sweep = interval(Duration::from_secs(self.config.sweep_interval_secs.max(1)));
        sweep.tick().await; // the first tick completes immediately

        loop {
            tokio::select! {
                // Polled in declaration order: samples queued before an
                // upload event must be in the flow before the event closes
                // its window.
                biased;

                Some(sample) = self.packet_rx.recv() => self.record_packet(sample),

                Some(event) = self.upload_rx.recv() => self.process_upload(event),

                Some(command) = self.command_rx.recv() => match command {
                    ReconstructorCommand::GetOpenFlows { respond_to } => {
                        let _ = respond_to.send(self.flows.len());
                    }
                },

                _ = sweep.tick() => self.sweep_stale(),

                changed = self.stop_rx.changed() => {
                    if changed.is_err() || *self.stop_rx.borrow() {
                        break;
                    }
                }
            }
        }

        debug!("flow reconstructor stopped");
    }

    fn record_packet(&mut self, sample: PacketSample) {
        trace!("captured {} bytes from {}", sample.bytes, sample.src);

        let flow = self
            .flows
            .entry(sample.src)
            .or_insert_with(|| FlowAccumulator {
                samples: Vec::new(),
                last_seen: sample.at,
            });
        flow.samples.push((sample.at, sample.bytes));
        flow.last_seen = sample.at;
    }

    #[instrument(skip(self, event), fields(device = %event.device_id))]
    fn process_upload(&mut self, event: UploadEvent) {
        if !self.registry.contains(&event.device_id) {
            warn!("upload event for unknown device from {}", event.source);
            return;
        }

        // No accumulator is not an error: the window simply saw no packets.
        let samples = self
            .flows
            .remove(&event.source)
            .map(|flow| flow.samples)
            .unwrap_or_default();

        let metrics = derive_metrics(&samples, event.send_timestamp, self.clock.now());
        debug!(
            "window closed: {} packets, {:.1} kbps => {}",
            samples.len(),
            metrics.throughput_kbps,
            metrics.status
        );

        self.registry.update_passive(&event.device_id, metrics);
    }

    fn sweep_stale(&mut self) {
        let cutoff = self.clock.now() - TimeDelta::seconds(self.config.flow_stale_secs as i64);
        let before = self.flows.len();
        self.flows.retain(|_, flow| flow.last_seen >= cutoff);

        let dropped = before - self.flows.len();
        if dropped > 0 {
            debug!("swept {dropped} stale flows");
        }
    }
}

/// Handle for feeding the ReconstructorActor
///
/// Cloneable; the upload listener holds one per connection task.
#[derive(Clone)]
pub struct ReconstructorHandle {
    packet_tx: mpsc::Sender<PacketSample>,
    upload_tx: mpsc::Sender<UploadEvent>,
    command_tx: mpsc::Sender<ReconstructorCommand>,
}

impl ReconstructorHandle {
    /// Spawn the actor and return a handle plus the task to join on
    /// shutdown.
    pub fn spawn(
        registry: Arc<DeviceRegistry>,
        clock: MonitorClock,
        config: PassiveConfig,
        stop_rx: watch::Receiver<bool>,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (packet_tx, packet_rx) = mpsc::channel(1024);
        let (upload_tx, upload_rx) = mpsc::channel(64);
        let (command_tx, command_rx) = mpsc::channel(8);

        let actor = ReconstructorActor {
            registry,
            clock,
            config,
            flows: HashMap::new(),
            packet_rx,
            upload_rx,
            command_rx,
            stop_rx,
        };

        let task = tokio::spawn(actor.run());

        (
            ReconstructorHandle {
                packet_tx,
                upload_tx,
                command_tx,
            },
            task,
        )
    }

    pub async fn record_packet(&self, sample: PacketSample) -> anyhow::Result<()> {
        self.packet_tx
            .send(sample)
            .await
            .context("reconstructor is gone")?;
        Ok(())
    }

    pub async fn upload_complete(&self, event: UploadEvent) -> anyhow::Result<()> {
        self.upload_tx
            .send(event)
            .await
            .context("reconstructor is gone")?;
        Ok(())
    }

    /// Number of flows currently accumulating packets
    pub async fn open_flows(&self) -> anyhow::Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(ReconstructorCommand::GetOpenFlows { respond_to: tx })
            .await
            .context("reconstructor is gone")?;
        rx.await.context("reconstructor dropped the query")
    }
}

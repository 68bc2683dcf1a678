//! Active probe engine.
//!
//! The device list is split once at startup into contiguous ranges, one
//! fixed worker task per range. Devices never migrate between workers, so
//! two workers can never write the same device's active metrics.

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, trace, warn};

use crate::LinkMetrics;
use crate::classify::classify;
use crate::config::ProbeConfig;
use crate::registry::DeviceRegistry;
use crate::transport::ProbeTransport;

/// Split `total` items into `workers` contiguous ranges of `total / workers`
/// each, with the remainder absorbed by the last range. The ranges are
/// disjoint and cover `0..total`; when `workers > total` the leading ranges
/// come out empty.
pub fn partition_ranges(total: usize, workers: usize) -> Vec<Range<usize>> {
    if workers == 0 {
        return Vec::new();
    }

    let chunk = total / workers;
    (0..workers)
        .map(|worker| {
            let start = worker * chunk;
            let end = if worker == workers - 1 {
                total
            } else {
                start + chunk
            };
            start..end
        })
        .collect()
}

/// Running probe engine. Holds the workers' join handles; the workers
/// themselves watch the shared stop flag.
pub struct ProbeEngine {
    workers: Vec<JoinHandle<()>>,
}

impl ProbeEngine {
    /// Partition the registry's device list and spawn one worker per
    /// non-empty range. Workers exit at the next range boundary after
    /// `stop_rx` flips to true.
    pub fn spawn(
        registry: Arc<DeviceRegistry>,
        transport: Arc<dyn ProbeTransport>,
        config: ProbeConfig,
        stop_rx: watch::Receiver<bool>,
    ) -> Self {
        let ids = registry.ids();
        let ranges = partition_ranges(ids.len(), config.workers);

        let mut workers = Vec::new();
        for (index, range) in ranges.into_iter().enumerate() {
            if range.is_empty() {
                continue;
            }

            let worker = ProbeWorker {
                index,
                ids: ids[range].to_vec(),
                registry: registry.clone(),
                transport: transport.clone(),
                config: config.clone(),
                stop_rx: stop_rx.clone(),
            };
            workers.push(tokio::spawn(worker.run()));
        }

        debug!(
            "spawned {} probe workers for {} devices",
            workers.len(),
            ids.len()
        );

        ProbeEngine { workers }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Wait for every worker to finish its current pass and exit. Only
    /// returns promptly once the stop flag has been flipped.
    pub async fn join(self) {
        join_all(self.workers).await;
        debug!("probe engine stopped");
    }
}

struct ProbeWorker {
    index: usize,
    ids: Vec<String>,
    registry: Arc<DeviceRegistry>,
    transport: Arc<dyn ProbeTransport>,
    config: ProbeConfig,
    stop_rx: watch::Receiver<bool>,
}

impl ProbeWorker {
    #[instrument(skip(self), fields(worker = self.index, devices = self.ids.len()))]
    async fn run(mut self) {
        debug!("starting probe worker");

        let device_pause = Duration::from_millis(self.config.device_pause_ms);
        let cycle_interval = Duration::from_secs(self.config.cycle_interval_secs);

        loop {
            // The stop flag is only honored between passes; a probe cycle
            // that has started runs to completion.
            if *self.stop_rx.borrow() {
                break;
            }

            for index in 0..self.ids.len() {
                let id = self.ids[index].clone();
                let metrics = self.probe_device(&id).await;
                if !self.registry.update_active(&id, metrics) {
                    warn!("device {id} missing from registry");
                }
                tokio::time::sleep(device_pause).await;
            }

            if self.pause(cycle_interval).await {
                break;
            }
        }

        debug!("probe worker stopped");
    }

    /// Sleep between passes, waking early when the stop flag flips.
    /// Returns `true` when the worker should exit.
    async fn pause(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => *self.stop_rx.borrow(),
            _ = self.stop_rx.changed() => true,
        }
    }

    /// One full probe cycle against a single device: an echo burst, one
    /// throughput exchange, then classification. Failures never propagate;
    /// they become part of the device's metrics.
    #[instrument(skip(self), fields(worker = self.index))]
    async fn probe_device(&self, id: &str) -> LinkMetrics {
        let Some(device) = self.registry.device(id) else {
            warn!("no identity for {id}");
            return LinkMetrics::unavailable(Utc::now());
        };
        let target = device.socket_addr();

        let echo_count = self.config.echo_count.max(1);
        let mut successes = 0usize;
        let mut total_rtt = Duration::ZERO;

        for attempt in 0..echo_count {
            match self.transport.echo(target).await {
                Ok(rtt) => {
                    successes += 1;
                    total_rtt += rtt;
                }
                Err(error) => trace!("echo {attempt} failed: {error}"),
            }
        }

        let latency_ms =
            (successes > 0).then(|| total_rtt.as_secs_f64() * 1000.0 / successes as f64);
        let loss_pct = (echo_count - successes) as f64 / echo_count as f64 * 100.0;

        let throughput_kbps = match self
            .transport
            .throughput(target, self.config.payload_bytes)
            .await
        {
            Ok(sample) => sample.kbps(),
            Err(error) => {
                trace!("throughput probe failed: {error}");
                0.0
            }
        };

        let status = classify(latency_ms, loss_pct, throughput_kbps);
        debug!(
            "latency {latency_ms:?} ms, loss {loss_pct:.0}%, {throughput_kbps:.1} kbps => {status}"
        );

        LinkMetrics {
            latency_ms,
            packet_loss_pct: loss_pct,
            throughput_kbps,
            status,
            last_active: Utc::now(),
        }
    }
}

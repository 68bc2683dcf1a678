//! Adaptive poll scheduler.
//!
//! Every tick the scheduler decides which devices to fetch data from. In
//! default mode it ranks all eligible devices (available, data older than
//! the wait threshold) oldest-first with link quality as the tie breaker; a
//! backend focus request overrides ranking entirely until cleared.
//!
//! Fetches are sequential. A constrained uplink is exactly the situation
//! this system runs in, so there is no parallel fetch fan-out.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{interval, timeout};
use tracing::{debug, instrument, trace, warn};

use crate::config::SchedulerConfig;
use crate::registry::{DeviceRegistry, PollState};
use crate::transport::FetchTransport;

use super::messages::{FetchEvent, SchedulerCommand, SchedulerMode};

/// Rank devices for fetching.
///
/// Eligible means available (active status not Unavailable, or never probed)
/// with data at least `wait_threshold` old; a device that never delivered
/// data counts as infinitely stale. Oldest data first, classification
/// priority breaks ties, and the sort is stable so equal keys keep their
/// incoming order.
pub fn rank_eligible(
    states: &[PollState],
    now: DateTime<Utc>,
    wait_threshold: TimeDelta,
) -> Vec<String> {
    let mut eligible: Vec<&PollState> = states
        .iter()
        .filter(|state| {
            let last = state.last_data_received.unwrap_or(DateTime::<Utc>::MIN_UTC);
            state.available && now - last >= wait_threshold
        })
        .collect();

    eligible.sort_by_key(|state| {
        (
            state.last_data_received.unwrap_or(DateTime::<Utc>::MIN_UTC),
            state.priority,
        )
    });

    eligible.into_iter().map(|state| state.id.clone()).collect()
}

/// Actor that decides which devices to poll and polls them
pub struct SchedulerActor {
    registry: Arc<DeviceRegistry>,
    fetcher: Arc<dyn FetchTransport>,
    config: SchedulerConfig,
    mode: SchedulerMode,
    command_rx: mpsc::Receiver<SchedulerCommand>,
    fetch_tx: broadcast::Sender<FetchEvent>,
    stop_rx: watch::Receiver<bool>,
}

impl SchedulerActor {
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting poll scheduler");

        let mut ticker = interval(Duration::from_secs(self.config.tick_interval_secs.max(1)));

        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_pass().await,

                Some(command) = self.command_rx.recv() => {
                    if self.handle_command(command) {
                        break;
                    }
                }

                changed = self.stop_rx.changed() => {
                    if changed.is_err() || *self.stop_rx.borrow() {
                        break;
                    }
                }

                else => {
                    warn!("command channel closed, shutting down");
                    break;
                }
            }
        }

        debug!("poll scheduler stopped");
    }

    /// Returns `true` when the actor should exit.
    fn handle_command(&mut self, command: SchedulerCommand) -> bool {
        match command {
            SchedulerCommand::Focus { ids } => {
                debug!("focusing on {ids:?}");
                self.mode = SchedulerMode::Focused(ids);
            }
            SchedulerCommand::Unfocus => {
                debug!("resuming ranked polling");
                self.mode = SchedulerMode::Default;
            }
            SchedulerCommand::GetMode { respond_to } => {
                let _ = respond_to.send(self.mode.clone());
            }
            SchedulerCommand::Stop => {
                debug!("received stop command");
                self.mode = SchedulerMode::Stopped;
                return true;
            }
        }
        false
    }

    async fn run_pass(&self) {
        match self.mode.clone() {
            SchedulerMode::Default => {
                let wait_threshold = TimeDelta::seconds(self.config.wait_threshold_secs as i64);
                let ranked = rank_eligible(&self.registry.poll_states(), Utc::now(), wait_threshold);

                if ranked.is_empty() {
                    trace!("no eligible devices this tick");
                    return;
                }

                debug!("fetch order: {ranked:?}");
                for id in ranked {
                    if *self.stop_rx.borrow() {
                        break;
                    }
                    self.process_device(&id).await;
                }
            }

            // Focus ignores both availability ranking and the wait
            // threshold; the backend asked for exactly these, in order.
            SchedulerMode::Focused(ids) => {
                for id in ids {
                    if *self.stop_rx.borrow() {
                        break;
                    }
                    self.process_device(&id).await;
                }
            }

            SchedulerMode::Stopped => {}
        }
    }

    /// Fetch one device, re-checking availability first: the probe engine
    /// keeps running while a pass is underway and may have demoted the
    /// device since ranking.
    #[instrument(skip(self))]
    async fn process_device(&self, id: &str) {
        match self.registry.check_available(id) {
            Some(true) => {}
            Some(false) => {
                debug!("skipping fetch, device went unavailable");
                return;
            }
            None => {
                warn!("device not in registry");
                return;
            }
        }

        let Some(device) = self.registry.device(id) else {
            return;
        };

        let deadline = Duration::from_millis(self.config.fetch_timeout_ms);
        match timeout(deadline, self.fetcher.fetch(device)).await {
            Ok(Ok(data)) => {
                let now = Utc::now();
                self.registry.mark_fetched(id, now);
                debug!("fetched {} bytes", data.len());

                let event = FetchEvent {
                    device_id: id.to_string(),
                    bytes: data.len(),
                    at: now,
                };
                if self.fetch_tx.send(event).is_err() {
                    trace!("no subscribers for fetch events");
                }
            }
            Ok(Err(error)) => {
                warn!("fetch failed: {error}");
                self.registry.mark_unavailable(id, Utc::now());
            }
            Err(_) => {
                warn!("fetch timed out after {deadline:?}");
                self.registry.mark_unavailable(id, Utc::now());
            }
        }
    }
}

/// Handle for controlling the SchedulerActor
#[derive(Clone)]
pub struct SchedulerHandle {
    sender: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    /// Spawn the actor and return a handle plus the task to join on
    /// shutdown.
    pub fn spawn(
        registry: Arc<DeviceRegistry>,
        fetcher: Arc<dyn FetchTransport>,
        config: SchedulerConfig,
        fetch_tx: broadcast::Sender<FetchEvent>,
        stop_rx: watch::Receiver<bool>,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (sender, command_rx) = mpsc::channel(32);

        let actor = SchedulerActor {
            registry,
            fetcher,
            config,
            mode: SchedulerMode::Default,
            command_rx,
            fetch_tx,
            stop_rx,
        };

        let task = tokio::spawn(actor.run());

        (SchedulerHandle { sender }, task)
    }

    /// Restrict polling to exactly these devices until `unfocus`.
    pub async fn focus(&self, ids: Vec<String>) -> anyhow::Result<()> {
        self.sender
            .send(SchedulerCommand::Focus { ids })
            .await
            .context("scheduler is gone")?;
        Ok(())
    }

    pub async fn unfocus(&self) -> anyhow::Result<()> {
        self.sender
            .send(SchedulerCommand::Unfocus)
            .await
            .context("scheduler is gone")?;
        Ok(())
    }

    /// Stop polling permanently.
    pub async fn stop(&self) -> anyhow::Result<()> {
        self.sender
            .send(SchedulerCommand::Stop)
            .await
            .context("scheduler is gone")?;
        Ok(())
    }

    pub async fn mode(&self) -> anyhow::Result<SchedulerMode> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SchedulerCommand::GetMode { respond_to: tx })
            .await
            .context("scheduler is gone")?;
        rx.await.context("scheduler dropped the query")
    }
}

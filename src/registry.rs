use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classify::Classification;
use crate::{FieldDevice, LinkMetrics};

/// Mutable per-device measurement state. Only ever touched through the
/// owning entry's lock.
#[derive(Debug, Default)]
struct DeviceState {
    active: Option<LinkMetrics>,
    passive: Option<LinkMetrics>,
    last_data_received: Option<DateTime<Utc>>,
}

impl DeviceState {
    /// A device counts as available until the probe engine has explicitly
    /// classified it `Unavailable`. Never-probed devices are fair game for
    /// the scheduler; a dead one gets demoted on its first failed fetch.
    fn is_available(&self) -> bool {
        self.active
            .as_ref()
            .map(|metrics| metrics.status != Classification::Unavailable)
            .unwrap_or(true)
    }
}

struct DeviceEntry {
    device: FieldDevice,
    state: Mutex<DeviceState>,
}

/// Registry of all monitored devices. The device set is fixed at
/// construction; every mutable field sits behind that device's own lock, so
/// writers for different devices never contend.
///
/// Lock scopes are short and never cross an `.await`. A poisoned lock means
/// a writer panicked mid-update and the record can no longer be trusted, so
/// accessors propagate the panic.
pub struct DeviceRegistry {
    devices: HashMap<String, DeviceEntry>,
}

impl DeviceRegistry {
    pub fn new(devices: impl IntoIterator<Item = FieldDevice>) -> Self {
        let devices = devices
            .into_iter()
            .map(|device| {
                let entry = DeviceEntry {
                    device: device.clone(),
                    state: Mutex::new(DeviceState::default()),
                };
                (device.id, entry)
            })
            .collect();
        DeviceRegistry { devices }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    /// Device identities, sorted for deterministic range partitioning.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.devices.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Immutable identity of a device. No lock required.
    pub fn device(&self, id: &str) -> Option<&FieldDevice> {
        self.devices.get(id).map(|entry| &entry.device)
    }

    fn lock(&self, id: &str) -> Option<MutexGuard<'_, DeviceState>> {
        self.devices
            .get(id)
            .map(|entry| entry.state.lock().expect("poisoned device lock"))
    }

    /// Overwrite the probe-side metrics. Returns `false` for unknown ids.
    pub fn update_active(&self, id: &str, metrics: LinkMetrics) -> bool {
        match self.lock(id) {
            Some(mut state) => {
                state.active = Some(metrics);
                true
            }
            None => false,
        }
    }

    /// Overwrite the reconstructed passive metrics. Returns `false` for
    /// unknown ids.
    pub fn update_passive(&self, id: &str, metrics: LinkMetrics) -> bool {
        match self.lock(id) {
            Some(mut state) => {
                state.passive = Some(metrics);
                true
            }
            None => false,
        }
    }

    /// Single locked availability read, used right before a fetch.
    pub fn check_available(&self, id: &str) -> Option<bool> {
        self.lock(id).map(|state| state.is_available())
    }

    /// Record a successful data fetch.
    pub fn mark_fetched(&self, id: &str, at: DateTime<Utc>) -> bool {
        match self.lock(id) {
            Some(mut state) => {
                state.last_data_received = Some(at);
                true
            }
            None => false,
        }
    }

    /// Demote a device after a failed fetch. Existing probe figures are kept
    /// so the next cycle still has context; a device that was never probed
    /// gets a stub all-unavailable record.
    pub fn mark_unavailable(&self, id: &str, at: DateTime<Utc>) -> bool {
        match self.lock(id) {
            Some(mut state) => {
                match state.active.as_mut() {
                    Some(metrics) => metrics.status = Classification::Unavailable,
                    None => state.active = Some(LinkMetrics::unavailable(at)),
                }
                true
            }
            None => false,
        }
    }

    pub fn active_metrics(&self, id: &str) -> Option<LinkMetrics> {
        self.lock(id).and_then(|state| state.active.clone())
    }

    pub fn passive_metrics(&self, id: &str) -> Option<LinkMetrics> {
        self.lock(id).and_then(|state| state.passive.clone())
    }

    pub fn last_data_received(&self, id: &str) -> Option<DateTime<Utc>> {
        self.lock(id).and_then(|state| state.last_data_received)
    }

    /// One ranking view per device. Each view is read under that device's
    /// lock and released immediately; the set is not a consistent cut across
    /// devices, which is fine for ranking (availability is re-checked under
    /// the lock before any fetch).
    pub fn poll_states(&self) -> Vec<PollState> {
        self.devices
            .iter()
            .map(|(id, entry)| {
                let state = entry.state.lock().expect("poisoned device lock");
                PollState {
                    id: id.clone(),
                    last_data_received: state.last_data_received,
                    priority: state
                        .active
                        .as_ref()
                        .map(|metrics| metrics.status.priority())
                        .unwrap_or(4),
                    available: state.is_available(),
                }
            })
            .collect()
    }

    /// Serializable copy of the full registry, sorted by device id.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut devices: Vec<_> = self
            .devices
            .values()
            .map(|entry| {
                let state = entry.state.lock().expect("poisoned device lock");
                DeviceSnapshot {
                    device: entry.device.clone(),
                    active: state.active.clone(),
                    passive: state.passive.clone(),
                    last_data_received: state.last_data_received,
                }
            })
            .collect();
        devices.sort_by(|a, b| a.device.id.cmp(&b.device.id));

        RegistrySnapshot {
            taken_at: Utc::now(),
            devices,
        }
    }
}

/// Ranking input for one device, read in a single locked access.
#[derive(Debug, Clone, PartialEq)]
pub struct PollState {
    pub id: String,
    pub last_data_received: Option<DateTime<Utc>>,
    pub priority: u8,
    pub available: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub device: FieldDevice,
    pub active: Option<LinkMetrics>,
    pub passive: Option<LinkMetrics>,
    pub last_data_received: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub taken_at: DateTime<Utc>,
    pub devices: Vec<DeviceSnapshot>,
}

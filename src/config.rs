use std::net::IpAddr;

use tracing::trace;

use crate::FieldDevice;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    pub devices: Option<Vec<DeviceConfig>>,

    /// Active probe engine settings (optional - defaults apply)
    pub probe: Option<ProbeConfig>,

    /// Passive flow reconstruction settings (optional - defaults apply)
    pub passive: Option<PassiveConfig>,

    /// Adaptive poll scheduler settings (optional - defaults apply)
    pub scheduler: Option<SchedulerConfig>,

    /// Listener bind settings (optional - env vars / defaults apply)
    pub listen: Option<ListenConfig>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    pub ip: IpAddr,
    #[serde(default = "default_device_port")]
    pub port: u16,
    #[serde(default = "default_region")]
    pub region: String,
}

impl From<DeviceConfig> for FieldDevice {
    fn from(device: DeviceConfig) -> Self {
        FieldDevice {
            id: device.id,
            ip: device.ip,
            port: device.port,
            region: device.region,
        }
    }
}

fn default_device_port() -> u16 {
    21000
}

fn default_region() -> String {
    "global".to_string()
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ProbeConfig {
    /// Number of worker tasks the device list is partitioned across
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Echo probes sent per device per cycle
    #[serde(default = "default_echo_count")]
    pub echo_count: usize,

    #[serde(default = "default_echo_timeout_ms")]
    pub echo_timeout_ms: u64,

    /// Payload size for the throughput round trip
    #[serde(default = "default_payload_bytes")]
    pub payload_bytes: usize,

    #[serde(default = "default_throughput_timeout_ms")]
    pub throughput_timeout_ms: u64,

    /// Pause between consecutive devices within a worker's range
    #[serde(default = "default_device_pause_ms")]
    pub device_pause_ms: u64,

    /// Sleep after a worker finishes a full pass over its range
    #[serde(default = "default_cycle_interval_secs")]
    pub cycle_interval_secs: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig {
            workers: default_workers(),
            echo_count: default_echo_count(),
            echo_timeout_ms: default_echo_timeout_ms(),
            payload_bytes: default_payload_bytes(),
            throughput_timeout_ms: default_throughput_timeout_ms(),
            device_pause_ms: default_device_pause_ms(),
            cycle_interval_secs: default_cycle_interval_secs(),
        }
    }
}

fn default_workers() -> usize {
    3
}

fn default_echo_count() -> usize {
    5
}

fn default_echo_timeout_ms() -> u64 {
    2000
}

fn default_payload_bytes() -> usize {
    100 * 1024
}

fn default_throughput_timeout_ms() -> u64 {
    5000
}

fn default_device_pause_ms() -> u64 {
    1000
}

fn default_cycle_interval_secs() -> u64 {
    10
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct PassiveConfig {
    /// NTP server consulted once at startup for the clock offset
    #[serde(default = "default_ntp_server")]
    pub ntp_server: String,

    /// Flows without traffic for this long are dropped by the sweep
    #[serde(default = "default_flow_stale_secs")]
    pub flow_stale_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for PassiveConfig {
    fn default() -> Self {
        PassiveConfig {
            ntp_server: default_ntp_server(),
            flow_stale_secs: default_flow_stale_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_ntp_server() -> String {
    "pool.ntp.org:123".to_string()
}

fn default_flow_stale_secs() -> u64 {
    60
}

fn default_sweep_interval_secs() -> u64 {
    30
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SchedulerConfig {
    /// A device becomes eligible once its data is at least this stale
    #[serde(default = "default_wait_threshold_secs")]
    pub wait_threshold_secs: u64,

    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            wait_threshold_secs: default_wait_threshold_secs(),
            tick_interval_secs: default_tick_interval_secs(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
        }
    }
}

fn default_wait_threshold_secs() -> u64 {
    300
}

fn default_tick_interval_secs() -> u64 {
    5
}

fn default_fetch_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,

    #[serde(default = "crate::util::get_upload_port")]
    pub upload_port: u16,

    #[serde(default = "crate::util::get_control_port")]
    pub control_port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        ListenConfig {
            bind: default_bind(),
            upload_port: crate::util::get_upload_port(),
            control_port: crate::util::get_control_port(),
        }
    }
}

fn default_bind() -> IpAddr {
    IpAddr::from(crate::util::get_addr())
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    serde_json::from_str(&file_content)
        .map_err(|_| anyhow::anyhow!("Invalid configuration file provided!"))
        .inspect(|config| trace!("loaded config: {config:?}"))
}

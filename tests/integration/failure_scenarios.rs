//! Failure and edge case tests
//!
//! Fetch failures and timeouts, availability races between the probe
//! engine and the scheduler, malformed wire input, and HTTP error paths.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use fieldmon::FieldDevice;
use fieldmon::actors::messages::SchedulerMode;
use fieldmon::actors::reconstructor::ReconstructorHandle;
use fieldmon::actors::scheduler::SchedulerHandle;
use fieldmon::classify::Classification;
use fieldmon::clock::MonitorClock;
use fieldmon::config::PassiveConfig;
use fieldmon::control::ControlListener;
use fieldmon::ingest::UploadListener;
use fieldmon::registry::DeviceRegistry;
use fieldmon::transport::http::HttpFetcher;
use fieldmon::transport::{FetchResult, FetchTransport};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

#[tokio::test]
async fn test_failed_fetches_demote_without_erasing_history() {
    let registry = test_registry(&["fd-1"]);
    let stamped = Utc::now() - TimeDelta::seconds(900);
    registry.mark_fetched("fd-1", stamped);

    let fetcher = Arc::new(RecordingFetcher::failing_for(&["fd-1"]));
    let (stop_tx, stop_rx) = watch::channel(false);
    let (fetch_tx, mut fetch_rx) = broadcast::channel(16);
    let (_scheduler, task) = SchedulerHandle::spawn(
        registry.clone(),
        fetcher.clone(),
        fast_scheduler_config(),
        fetch_tx,
        stop_rx,
    );

    // First tick attempts the fetch and fails; the second tick skips the
    // now-unavailable device. Two ticks fit in 1.5s.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    stop_tx.send(true).unwrap();
    task.await.unwrap();

    assert_eq!(fetcher.order(), vec!["fd-1"]);

    let metrics = registry.active_metrics("fd-1").unwrap();
    assert_eq!(metrics.status, Classification::Unavailable);

    // The failure must not masquerade as fresh data.
    assert_eq!(registry.last_data_received("fd-1"), Some(stamped));

    // No event for a failed fetch.
    assert!(fetch_rx.try_recv().is_err());
}

/// Fetch transport that never answers.
struct HangingFetcher;

#[async_trait]
impl FetchTransport for HangingFetcher {
    async fn fetch(&self, _device: &FieldDevice) -> FetchResult<Vec<u8>> {
        futures::future::pending().await
    }
}

#[tokio::test]
async fn test_fetch_timeouts_demote_the_device() {
    let registry = test_registry(&["fd-1"]);
    let stamped = Utc::now() - TimeDelta::seconds(900);
    registry.mark_fetched("fd-1", stamped);

    let mut config = fast_scheduler_config();
    config.fetch_timeout_ms = 100;

    let (stop_tx, stop_rx) = watch::channel(false);
    let (fetch_tx, _) = broadcast::channel(16);
    let (_scheduler, task) = SchedulerHandle::spawn(
        registry.clone(),
        Arc::new(HangingFetcher),
        config,
        fetch_tx,
        stop_rx,
    );

    tokio::time::sleep(Duration::from_millis(500)).await;
    stop_tx.send(true).unwrap();
    task.await.unwrap();

    let metrics = registry.active_metrics("fd-1").unwrap();
    assert_eq!(metrics.status, Classification::Unavailable);
    assert_eq!(registry.last_data_received("fd-1"), Some(stamped));
}

/// Fetch transport that demotes another device mid-pass, standing in for a
/// probe cycle landing while the scheduler walks its ranked list.
struct DemotingFetcher {
    registry: Arc<DeviceRegistry>,
    victim: String,
    fetched: std::sync::Mutex<Vec<String>>,
}

#[async_trait]
impl FetchTransport for DemotingFetcher {
    async fn fetch(&self, device: &FieldDevice) -> FetchResult<Vec<u8>> {
        self.fetched.lock().unwrap().push(device.id.clone());
        self.registry.mark_unavailable(&self.victim, Utc::now());
        Ok(vec![0u8; 16])
    }
}

#[tokio::test]
async fn test_availability_is_rechecked_right_before_each_fetch() {
    let registry = test_registry(&["fd-1", "fd-2"]);
    let now = Utc::now();
    // fd-1 ranks first; while it is being fetched, fd-2 goes dark.
    registry.mark_fetched("fd-1", now - TimeDelta::seconds(900));
    registry.mark_fetched("fd-2", now - TimeDelta::seconds(600));

    let fetcher = Arc::new(DemotingFetcher {
        registry: registry.clone(),
        victim: "fd-2".to_string(),
        fetched: std::sync::Mutex::new(Vec::new()),
    });
    let (stop_tx, stop_rx) = watch::channel(false);
    let (fetch_tx, _) = broadcast::channel(16);
    let (_scheduler, task) = SchedulerHandle::spawn(
        registry.clone(),
        fetcher.clone(),
        fast_scheduler_config(),
        fetch_tx,
        stop_rx,
    );

    tokio::time::sleep(Duration::from_millis(300)).await;
    stop_tx.send(true).unwrap();
    task.await.unwrap();

    // fd-2 was in the ranked list but must not have been contacted.
    assert_eq!(*fetcher.fetched.lock().unwrap(), vec!["fd-1"]);
    assert_eq!(
        registry.last_data_received("fd-2"),
        Some(now - TimeDelta::seconds(600))
    );
}

#[tokio::test]
async fn test_malformed_event_lines_get_no_ack() {
    let registry = test_registry(&["fd-1"]);
    let clock = MonitorClock::with_offset(0.0);
    let (_stop_tx, stop_rx) = watch::channel(false);

    let (reconstructor, _task) = ReconstructorHandle::spawn(
        registry.clone(),
        clock,
        PassiveConfig::default(),
        stop_rx.clone(),
    );
    let listener = UploadListener::bind("127.0.0.1:0", reconstructor.clone(), clock, stop_rx)
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(listener.run());

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"buffered record\n").await.unwrap();

    // Looks like an event but the device id is not a string.
    stream
        .write_all(b"{\"device_id\": 42, \"send_timestamp\": 1.0}\n")
        .await
        .unwrap();

    let mut reply = [0u8; 4];
    let acked =
        tokio::time::timeout(Duration::from_millis(100), stream.read_exact(&mut reply)).await;
    assert!(acked.is_err(), "malformed event was acknowledged");

    // The connection survives and a correct event still terminates the
    // window.
    let send_timestamp = Utc::now().timestamp_micros() as f64 / 1_000_000.0 - 1.0;
    let event = format!("{{\"device_id\": \"fd-1\", \"send_timestamp\": {send_timestamp}}}\n");
    stream.write_all(event.as_bytes()).await.unwrap();

    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"ACK\n");
    assert_eq!(reconstructor.open_flows().await.unwrap(), 0);
    assert!(registry.passive_metrics("fd-1").is_some());
}

#[tokio::test]
async fn test_garbage_on_the_control_port_is_rejected() {
    let registry = test_registry(&["fd-1"]);
    registry.mark_fetched("fd-1", Utc::now());

    let (stop_tx, stop_rx) = watch::channel(false);
    let (fetch_tx, _) = broadcast::channel(16);
    let (scheduler, task) = SchedulerHandle::spawn(
        registry,
        Arc::new(RecordingFetcher::ok()),
        fast_scheduler_config(),
        fetch_tx,
        stop_rx.clone(),
    );

    let control = ControlListener::bind("127.0.0.1:0", scheduler.clone(), stop_rx)
        .await
        .unwrap();
    let addr = control.local_addr().unwrap();
    tokio::spawn(control.run());

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut stream = BufReader::new(stream);
    let mut reply = String::new();

    stream.write_all(b"jibberish\n").await.unwrap();
    stream.read_line(&mut reply).await.unwrap();
    assert_eq!(reply, "ERR\n");

    // A bad command must not kill the session.
    reply.clear();
    stream.write_all(b"focus fd-1\n").await.unwrap();
    stream.read_line(&mut reply).await.unwrap();
    assert_eq!(reply, "OK\n");

    assert_eq!(
        scheduler.mode().await.unwrap(),
        SchedulerMode::Focused(vec!["fd-1".to_string()])
    );

    stop_tx.send(true).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_http_error_responses_demote_the_device() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock_server)
        .await;

    let mock_url = url::Url::parse(&mock_server.uri()).unwrap();
    let device = FieldDevice {
        id: "fd-1".to_string(),
        ip: mock_url.host_str().unwrap().parse().unwrap(),
        port: mock_url.port().unwrap(),
        region: "global".to_string(),
    };
    let registry = Arc::new(DeviceRegistry::new([device]));
    registry.mark_fetched("fd-1", Utc::now() - TimeDelta::seconds(900));

    let fetcher = Arc::new(HttpFetcher::new(Duration::from_millis(500)));
    let (stop_tx, stop_rx) = watch::channel(false);
    let (fetch_tx, _) = broadcast::channel(16);
    let (_scheduler, task) = SchedulerHandle::spawn(
        registry.clone(),
        fetcher,
        fast_scheduler_config(),
        fetch_tx,
        stop_rx,
    );

    tokio::time::sleep(Duration::from_millis(300)).await;
    stop_tx.send(true).unwrap();
    task.await.unwrap();

    let metrics = registry.active_metrics("fd-1").unwrap();
    assert_eq!(metrics.status, Classification::Unavailable);
}

//! Concurrency tests
//!
//! Partitioned probe workers covering a fleet, parallel upload sessions,
//! simultaneous control clients, and registry queries under probe load.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fieldmon::actors::prober::ProbeEngine;
use fieldmon::actors::reconstructor::ReconstructorHandle;
use fieldmon::actors::scheduler::SchedulerHandle;
use fieldmon::clock::MonitorClock;
use fieldmon::config::PassiveConfig;
use fieldmon::control::ControlListener;
use fieldmon::ingest::UploadListener;
use futures::future::join_all;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};

use crate::helpers::*;

#[tokio::test]
async fn test_partitioned_workers_cover_the_whole_fleet() {
    let ids = ["fd-1", "fd-2", "fd-3", "fd-4", "fd-5", "fd-6", "fd-7"];
    let registry = test_registry(&ids);

    let mut probe = ScriptedProbe::new();
    for id in ids {
        probe = probe.with_script(registry.device(id).unwrap(), DeviceScript::steady(80, 400));
    }
    let probe = Arc::new(probe);

    let (stop_tx, stop_rx) = watch::channel(false);
    let engine = ProbeEngine::spawn(registry.clone(), probe.clone(), fast_probe_config(3), stop_rx);
    assert_eq!(engine.worker_count(), 3);

    tokio::time::sleep(Duration::from_millis(300)).await;
    stop_tx.send(true).unwrap();
    engine.join().await;

    // No device falls between the partition boundaries.
    for id in ids {
        let device = registry.device(id).unwrap();
        assert!(
            probe.echo_calls(device) >= 5,
            "{id} saw too few echoes: {}",
            probe.echo_calls(device)
        );
        assert!(
            registry.active_metrics(id).is_some(),
            "{id} was never classified"
        );
    }
}

#[tokio::test]
async fn test_parallel_uploads_all_close_their_windows() {
    let ids = ["fd-1", "fd-2", "fd-3", "fd-4", "fd-5"];
    let registry = test_registry(&ids);
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

    let uploads = ids.map(|id| {
        tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();

            let record = format!("{}\n", "x".repeat(49));
            for _ in 0..5 {
                stream.write_all(record.as_bytes()).await.unwrap();
            }

            let send_timestamp = Utc::now().timestamp_micros() as f64 / 1_000_000.0 - 2.0;
            let event = format!("{{\"device_id\": \"{id}\", \"send_timestamp\": {send_timestamp}}}\n");
            stream.write_all(event.as_bytes()).await.unwrap();

            let mut reply = [0u8; 4];
            stream.read_exact(&mut reply).await.unwrap();
            assert_eq!(&reply, b"ACK\n");
        })
    });
    for upload in uploads {
        upload.await.unwrap();
    }

    assert_eq!(reconstructor.open_flows().await.unwrap(), 0);
    for id in ids {
        assert!(
            registry.passive_metrics(id).is_some(),
            "{id} has no passive metrics"
        );
    }
}

#[tokio::test]
async fn test_simultaneous_control_sessions_all_get_answers() {
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

    let sessions = (0..8).map(|client| {
        tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let mut stream = BufReader::new(stream);
            let mut reply = String::new();

            stream
                .write_all(format!("focus fd-{client}\n").as_bytes())
                .await
                .unwrap();
            stream.read_line(&mut reply).await.unwrap();
            assert_eq!(reply, "OK\n");

            reply.clear();
            stream.write_all(b"unfocus\n").await.unwrap();
            stream.read_line(&mut reply).await.unwrap();
            assert_eq!(reply, "OK\n");
        })
    });
    join_all(sessions)
        .await
        .into_iter()
        .for_each(|session| session.unwrap());

    // The scheduler survived the barrage and still answers queries.
    scheduler.unfocus().await.unwrap();
    assert_eq!(
        scheduler.mode().await.unwrap(),
        fieldmon::actors::messages::SchedulerMode::Default
    );

    stop_tx.send(true).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_registry_queries_stay_responsive_during_probing() {
    let ids = ["fd-1", "fd-2", "fd-3", "fd-4", "fd-5", "fd-6", "fd-7"];
    let registry = test_registry(&ids);

    let mut probe = ScriptedProbe::new();
    for id in ids {
        probe = probe.with_script(registry.device(id).unwrap(), DeviceScript::steady(80, 400));
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let engine = ProbeEngine::spawn(
        registry.clone(),
        Arc::new(probe),
        fast_probe_config(3),
        stop_rx,
    );

    let readers = (0..10).map(|_| {
        let registry = registry.clone();
        tokio::spawn(async move {
            for _ in 0..50 {
                let snapshot = registry.snapshot();
                assert_eq!(snapshot.devices.len(), 7);
                assert_eq!(registry.poll_states().len(), 7);
                tokio::task::yield_now().await;
            }
        })
    });

    // Readers finishing at all proves no probe worker wedged a lock.
    let all_done = tokio::time::timeout(Duration::from_secs(5), join_all(readers))
        .await
        .expect("registry queries deadlocked");
    all_done.into_iter().for_each(|reader| reader.unwrap());

    stop_tx.send(true).unwrap();
    engine.join().await;
}

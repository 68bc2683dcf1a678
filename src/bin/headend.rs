use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use fieldmon::{
    FieldDevice,
    actors::{
        prober::ProbeEngine, reconstructor::ReconstructorHandle, scheduler::SchedulerHandle,
    },
    clock::{MonitorClock, SntpOffsetSource},
    config::read_config_file,
    control::ControlListener,
    ingest::UploadListener,
    registry::DeviceRegistry,
    transport::{http::HttpFetcher, tcp::TcpProber},
};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,
}

fn init() {
    dotenv::dotenv().ok();

    let filter = filter::Targets::new().with_targets(vec![
        ("fieldmon", LevelFilter::TRACE),
        ("headend", LevelFilter::TRACE),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.file)?;

    let devices: Vec<FieldDevice> = config
        .devices
        .unwrap_or_default()
        .into_iter()
        .map(Into::into)
        .collect();
    let registry = Arc::new(DeviceRegistry::new(devices));
    debug!("monitoring {} field devices", registry.len());

    let probe_config = config.probe.unwrap_or_default();
    let passive_config = config.passive.unwrap_or_default();
    let scheduler_config = config.scheduler.unwrap_or_default();
    let listen = config.listen.unwrap_or_default();

    // One offset fetch at startup; every capture timestamp derives from it.
    let sntp = SntpOffsetSource::new(passive_config.ntp_server.clone());
    let clock = MonitorClock::resolve(&sntp).await;

    let (stop_tx, stop_rx) = watch::channel(false);
    let (fetch_tx, _) = broadcast::channel(64);

    let (reconstructor, reconstructor_task) = ReconstructorHandle::spawn(
        registry.clone(),
        clock,
        passive_config,
        stop_rx.clone(),
    );

    let upload_addr = format!("{}:{}", listen.bind, listen.upload_port);
    let uploads = UploadListener::bind(
        &upload_addr,
        reconstructor.clone(),
        clock,
        stop_rx.clone(),
    )
    .await?;
    debug!("upload listener on {upload_addr}");
    let upload_task = tokio::spawn(uploads.run());

    let fetcher = Arc::new(HttpFetcher::new(Duration::from_millis(
        scheduler_config.fetch_timeout_ms,
    )));
    let (scheduler, scheduler_task) = SchedulerHandle::spawn(
        registry.clone(),
        fetcher,
        scheduler_config,
        fetch_tx,
        stop_rx.clone(),
    );

    let control_addr = format!("{}:{}", listen.bind, listen.control_port);
    let control = ControlListener::bind(&control_addr, scheduler, stop_rx.clone()).await?;
    debug!("control listener on {control_addr}");
    let control_task = tokio::spawn(control.run());

    let prober = Arc::new(TcpProber::from_config(&probe_config));
    let engine = ProbeEngine::spawn(registry.clone(), prober, probe_config, stop_rx);
    debug!("probe engine running with {} workers", engine.worker_count());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    debug!("shutting down");

    let _ = stop_tx.send(true);
    engine.join().await;
    for task in [reconstructor_task, scheduler_task, upload_task, control_task] {
        if let Err(e) = task.await {
            error!("{e}");
        }
    }

    Ok(())
}

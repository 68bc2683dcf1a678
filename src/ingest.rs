//! TCP upload listener.
//!
//! Field devices push their buffered records over one connection per upload:
//! a run of newline-delimited data lines closed by a JSON event line carrying
//! `device_id` and `send_timestamp`. The listener doubles as the packet
//! observer for the flow reconstructor, so every line it reads becomes a
//! [`PacketSample`] sized by its wire length; the closing event is
//! acknowledged with `ACK` and forwarded to close the flow window.

use std::net::SocketAddr;

use anyhow::Context;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, instrument, trace, warn};

use crate::actors::messages::{PacketSample, UploadEvent};
use crate::actors::reconstructor::ReconstructorHandle;
use crate::clock::MonitorClock;

/// Closing line of a device upload, as it appears on the wire
#[derive(Debug, Deserialize, PartialEq)]
struct UploadEventWire {
    device_id: String,
    send_timestamp: f64,
}

/// What one received line means for the flow
#[derive(Debug, PartialEq)]
enum UploadLine {
    /// A buffered data record; only its size matters here.
    Data,
    /// The event that closes the upload window.
    Event(UploadEventWire),
    /// Carries a `send_timestamp` but does not parse as an event.
    Malformed,
}

/// Data records are JSON lines too, so the `send_timestamp` key decides
/// whether a line is meant as the closing event. A line that claims to be
/// one but fails to parse is reported as malformed rather than silently
/// treated as data.
fn classify_line(line: &str) -> UploadLine {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
        return UploadLine::Data;
    };
    if value.get("send_timestamp").is_none() {
        return UploadLine::Data;
    }

    match serde_json::from_value(value) {
        Ok(event) => UploadLine::Event(event),
        Err(_) => UploadLine::Malformed,
    }
}

/// Accepts device uploads and feeds them into the flow reconstructor
pub struct UploadListener {
    listener: TcpListener,
    reconstructor: ReconstructorHandle,
    clock: MonitorClock,
    stop_rx: watch::Receiver<bool>,
}

impl UploadListener {
    /// Bind the listener socket. Binding is separate from [`run`] so callers
    /// know the port is held before the first device connects.
    ///
    /// [`run`]: UploadListener::run
    pub async fn bind(
        addr: &str,
        reconstructor: ReconstructorHandle,
        clock: MonitorClock,
        stop_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind upload listener on {addr}"))?;

        Ok(UploadListener {
            listener,
            reconstructor,
            clock,
            stop_rx,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("upload listener has no local address")
    }

    /// Accept loop. Each connection gets its own task; the loop itself only
    /// ends when the stop flag flips.
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("upload listener accepting connections");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let reconstructor = self.reconstructor.clone();
                        let clock = self.clock;
                        tokio::spawn(async move {
                            if let Err(error) =
                                handle_upload(stream, peer, reconstructor, clock).await
                            {
                                warn!("upload from {peer} failed: {error:#}");
                            }
                        });
                    }
                    Err(error) => warn!("accept failed: {error}"),
                },

                changed = self.stop_rx.changed() => {
                    if changed.is_err() || *self.stop_rx.borrow() {
                        break;
                    }
                }
            }
        }

        debug!("upload listener stopped");
    }
}

/// Drive one upload connection until the device closes it.
///
/// A connection may carry several windows back to back; each event line is
/// acknowledged so the device can retire the records it just sent.
#[instrument(skip(stream, reconstructor, clock))]
async fn handle_upload(
    stream: TcpStream,
    peer: SocketAddr,
    reconstructor: ReconstructorHandle,
    clock: MonitorClock,
) -> anyhow::Result<()> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    loop {
        line.clear();
        let read = reader
            .read_line(&mut line)
            .await
            .context("read from device")?;
        if read == 0 {
            trace!("device closed the connection");
            return Ok(());
        }

        // The sample counts the full wire line, delimiter included.
        reconstructor
            .record_packet(PacketSample {
                src: peer,
                bytes: read,
                at: clock.now(),
            })
            .await?;

        match classify_line(line.trim_end()) {
            UploadLine::Data => trace!("data record, {read} bytes"),

            UploadLine::Malformed => {
                warn!("malformed upload event from {peer}: {}", line.trim_end());
            }

            UploadLine::Event(event) => {
                debug!("upload window closed by {}", event.device_id);
                reconstructor
                    .upload_complete(UploadEvent {
                        device_id: event.device_id,
                        send_timestamp: event.send_timestamp,
                        source: peer,
                    })
                    .await?;

                // Acknowledged only once the event is queued.
                reader
                    .get_mut()
                    .write_all(b"ACK\n")
                    .await
                    .context("acknowledge the upload")?;
            }
        }
    }
}

//! Backend control listener.
//!
//! Operators steer the poll scheduler over a plain line protocol:
//!
//! ```text
//! focus <id>[,<id>...]    restrict polling to exactly these devices
//! unfocus                 return to adaptive ranking
//! stop                    end polling permanently
//! ```
//!
//! Keywords are case-insensitive. Accepted commands are answered with `OK`,
//! anything unparsable with `ERR`; parse failures never tear the connection
//! down.

use std::net::SocketAddr;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

use crate::actors::scheduler::SchedulerHandle;

#[derive(Debug, PartialEq, Eq)]
pub enum ControlCommand {
    Focus(Vec<String>),
    Unfocus,
    Stop,
}

/// Parse one control line. `None` means the line fits no command shape.
pub fn parse_command(line: &str) -> Option<ControlCommand> {
    let line = line.trim();
    let (keyword, rest) = match line.split_once(char::is_whitespace) {
        Some((keyword, rest)) => (keyword, rest.trim()),
        None => (line, ""),
    };

    match keyword.to_ascii_lowercase().as_str() {
        "focus" => {
            let ids: Vec<String> = rest
                .split(',')
                .map(|id| id.trim().to_string())
                .collect();
            if ids.iter().any(String::is_empty) {
                return None;
            }
            Some(ControlCommand::Focus(ids))
        }
        "unfocus" if rest.is_empty() => Some(ControlCommand::Unfocus),
        "stop" if rest.is_empty() => Some(ControlCommand::Stop),
        _ => None,
    }
}

/// Accepts backend connections and maps their commands onto the scheduler
pub struct ControlListener {
    listener: TcpListener,
    scheduler: SchedulerHandle,
    stop_rx: watch::Receiver<bool>,
}

impl ControlListener {
    pub async fn bind(
        addr: &str,
        scheduler: SchedulerHandle,
        stop_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind control listener on {addr}"))?;

        Ok(ControlListener {
            listener,
            scheduler,
            stop_rx,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("control listener has no local address")
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("control listener accepting connections");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let scheduler = self.scheduler.clone();
                        tokio::spawn(async move {
                            if let Err(error) = handle_backend(stream, peer, scheduler).await {
                                warn!("control connection from {peer} failed: {error:#}");
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

        debug!("control listener stopped");
    }
}

#[instrument(skip(stream, scheduler))]
async fn handle_backend(
    stream: TcpStream,
    peer: SocketAddr,
    scheduler: SchedulerHandle,
) -> anyhow::Result<()> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    loop {
        line.clear();
        let read = reader
            .read_line(&mut line)
            .await
            .context("read from backend")?;
        if read == 0 {
            return Ok(());
        }

        let reply = match parse_command(&line) {
            Some(ControlCommand::Focus(ids)) => {
                debug!("backend focuses on {ids:?}");
                scheduler.focus(ids).await?;
                "OK\n"
            }
            Some(ControlCommand::Unfocus) => {
                debug!("backend clears the focus");
                scheduler.unfocus().await?;
                "OK\n"
            }
            Some(ControlCommand::Stop) => {
                debug!("backend stops the scheduler");
                scheduler.stop().await?;
                "OK\n"
            }
            None => {
                warn!("unparsable control line from {peer}: {}", line.trim_end());
                "ERR\n"
            }
        };

        reader
            .get_mut()
            .write_all(reply.as_bytes())
            .await
            .context("reply to backend")?;
    }
}

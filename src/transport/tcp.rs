//! TCP-based probe transport.
//!
//! Field devices run without any headend-side agent, so the probes use plain
//! TCP against the device's data port. Echo measures the connect round trip
//! (ICMP would need raw-socket privileges); throughput pushes a payload and
//! reads back whatever the device returns, counting both directions.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout};
use tracing::trace;

use super::{ProbeError, ProbeResult, ProbeTransport, TransferSample};
use crate::config::ProbeConfig;

pub struct TcpProber {
    echo_timeout: Duration,
    throughput_timeout: Duration,
}

impl TcpProber {
    pub fn new(echo_timeout: Duration, throughput_timeout: Duration) -> Self {
        TcpProber {
            echo_timeout,
            throughput_timeout,
        }
    }

    pub fn from_config(config: &ProbeConfig) -> Self {
        TcpProber::new(
            Duration::from_millis(config.echo_timeout_ms),
            Duration::from_millis(config.throughput_timeout_ms),
        )
    }
}

#[async_trait]
impl ProbeTransport for TcpProber {
    async fn echo(&self, target: SocketAddr) -> ProbeResult<Duration> {
        let started = Instant::now();
        let stream = timeout(self.echo_timeout, TcpStream::connect(target)).await??;
        let elapsed = started.elapsed();
        drop(stream);

        trace!("echo to {target} took {elapsed:?}");
        Ok(elapsed)
    }

    async fn throughput(
        &self,
        target: SocketAddr,
        payload_bytes: usize,
    ) -> ProbeResult<TransferSample> {
        let exchange = async {
            let mut stream = TcpStream::connect(target).await?;
            let payload = vec![0u8; payload_bytes];

            let started = Instant::now();
            stream.write_all(&payload).await?;
            // Half-close tells the device the payload is complete.
            stream.shutdown().await?;

            let mut received = 0usize;
            let mut buf = [0u8; 16 * 1024];
            loop {
                let read = stream.read(&mut buf).await?;
                if read == 0 {
                    break;
                }
                received += read;
            }

            Ok::<_, ProbeError>(TransferSample {
                bytes: payload_bytes + received,
                elapsed: started.elapsed(),
            })
        };

        let sample = timeout(self.throughput_timeout, exchange).await??;
        trace!(
            "throughput to {target}: {} bytes in {:?}",
            sample.bytes, sample.elapsed
        );
        Ok(sample)
    }
}

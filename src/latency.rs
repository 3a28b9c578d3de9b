use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Measures the fixed round-trip overhead to the endpoint, in milliseconds.
#[async_trait]
pub trait LatencyProbe: Send + Sync {
    async fn baseline_latency_ms(&self) -> Result<f64>;
}

/// Averages the time to open a TCP connection to the endpoint host.
#[derive(Clone, Debug)]
pub struct TcpConnectProbe {
    host: String,
    port: u16,
    attempts: usize,
    connect_timeout: Duration,
}

impl TcpConnectProbe {
    pub fn for_url(url: &Url) -> Result<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("endpoint URL has no host: {}", url))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| anyhow!("endpoint URL has no known port: {}", url))?;
        Ok(Self {
            host,
            port,
            attempts: 5,
            connect_timeout: Duration::from_secs(10),
        })
    }

    pub fn with_attempts(mut self, attempts: usize) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        if !connect_timeout.is_zero() {
            self.connect_timeout = connect_timeout;
        }
        self
    }
}

#[async_trait]
impl LatencyProbe for TcpConnectProbe {
    async fn baseline_latency_ms(&self) -> Result<f64> {
        let address = (self.host.as_str(), self.port);
        let mut total = Duration::ZERO;
        for attempt in 0..self.attempts {
            let start = Instant::now();
            let stream = timeout(self.connect_timeout, TcpStream::connect(address))
                .await
                .with_context(|| {
                    format!("timed out connecting to {}:{}", self.host, self.port)
                })?
                .with_context(|| format!("failed to connect to {}:{}", self.host, self.port))?;
            let elapsed = start.elapsed();
            drop(stream);
            debug!(attempt, elapsed_ms = elapsed.as_secs_f64() * 1000.0, "latency sample");
            total += elapsed;
        }
        Ok(total.as_secs_f64() * 1000.0 / self.attempts as f64)
    }
}

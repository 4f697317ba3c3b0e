//! Byte-stream channels to the device under test.
//!
//! A [`Channel`] only needs to provide [`write`](Channel::write) and a
//! deadline-bounded [`read`](Channel::read). The higher-level primitives
//! ([`read_exact`](Channel::read_exact), [`read_until`](Channel::read_until),
//! [`read_event`](Channel::read_event), [`discard_input`](Channel::discard_input))
//! are polling loops built on top of it, so every wait has a deadline and
//! none of them blocks past it.
//!
//! Channels report failures but never retry; retrying is up to the protocol
//! driver that owns the exchange.

mod mock;
mod serial;
mod tcp;

pub use mock::{MockChannel, MockHandle};
pub use serial::SerialChannel;
pub use tcp::TcpChannel;

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::{Instant, sleep};

/// Sleep granularity of the polling read loops.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound on bytes dropped by one [`Channel::discard_input`].
pub const MAX_DISCARD: usize = 4096;

pub const DEFAULT_BAUD: u32 = 115_200;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// A bidirectional byte stream with timeout-bounded reads.
#[async_trait]
pub trait Channel: Send {
    /// Endpoint description used in logs and errors, e.g. `/dev/ttyUSB0@9600`.
    fn describe(&self) -> String;

    /// Write all of `data`.
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Return whatever arrives within `timeout`, at most `max` bytes.
    ///
    /// An empty buffer means nothing arrived before the deadline.
    async fn read(&mut self, max: usize, timeout: Duration) -> Result<Vec<u8>>;

    /// Collect `size` bytes, returning a short buffer if the deadline passes.
    async fn read_exact(&mut self, size: usize, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut buf = Vec::with_capacity(size);
        while buf.len() < size {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let chunk = self.read(size - buf.len(), deadline - now).await?;
            if chunk.is_empty() {
                sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())))
                    .await;
            } else {
                buf.extend_from_slice(&chunk);
            }
        }
        Ok(buf)
    }

    /// Read one byte at a time until the buffer ends with `terminator` or the
    /// deadline passes. The terminator is kept in the returned buffer.
    async fn read_until(&mut self, terminator: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        if terminator.is_empty() {
            return Err(Error::invalid("terminator", "must not be empty"));
        }
        let deadline = Instant::now() + timeout;
        let mut buf = Vec::new();
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let chunk = self.read(1, deadline - now).await?;
            if chunk.is_empty() {
                sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())))
                    .await;
                continue;
            }
            buf.extend_from_slice(&chunk);
            if buf.ends_with(terminator) {
                break;
            }
        }
        Ok(buf)
    }

    /// Drop whatever is already buffered or arrives until the line has been
    /// quiet for `quiet`. Gives up after [`MAX_DISCARD`] bytes. Returns the
    /// number of bytes dropped.
    async fn discard_input(&mut self, quiet: Duration) -> Result<usize> {
        let mut dropped = 0;
        while dropped < MAX_DISCARD {
            let chunk = self.read(MAX_DISCARD - dropped, quiet).await?;
            if chunk.is_empty() {
                break;
            }
            dropped += chunk.len();
        }
        Ok(dropped)
    }

    /// Poll a single byte and decode it as an event label.
    async fn read_event(&mut self, timeout: Duration) -> Result<Option<String>> {
        let data = self.read(1, timeout).await?;
        if data.is_empty() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&data).into_owned()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    #[default]
    #[serde(alias = "uart")]
    Serial,
    Tcp,
}

/// One entry of a script's `channels` section.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChannelConfig {
    #[serde(rename = "type", default)]
    pub kind: ChannelKind,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default, alias = "baudrate")]
    pub baud: Option<u32>,
    /// TCP connect timeout.
    #[serde(default, deserialize_with = "crate::script::deserialize_opt_duration")]
    pub timeout: Option<Duration>,
}

impl ChannelConfig {
    pub fn serial(device: impl Into<String>, baud: u32) -> Self {
        Self {
            kind: ChannelKind::Serial,
            device: Some(device.into()),
            host: None,
            port: None,
            baud: Some(baud),
            timeout: None,
        }
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            kind: ChannelKind::Tcp,
            device: None,
            host: Some(host.into()),
            port: Some(port),
            baud: None,
            timeout: None,
        }
    }
}

/// Open the channel described by `config`.
///
/// # Errors
///
/// Returns a connectivity error when the port is busy or missing, or the host
/// cannot be reached within the connect timeout. An incomplete config is a
/// script error.
pub async fn open(name: &str, config: &ChannelConfig) -> Result<Box<dyn Channel>> {
    match config.kind {
        ChannelKind::Serial => {
            let device = config.device.as_deref().ok_or_else(|| {
                Error::Script(format!("serial channel '{}' needs a device", name))
            })?;
            let baud = config.baud.unwrap_or(DEFAULT_BAUD);
            Ok(Box::new(SerialChannel::open(device, baud)?))
        }
        ChannelKind::Tcp => {
            let (host, port) = match (&config.host, config.port) {
                (Some(host), Some(port)) => (host.as_str(), port),
                _ => {
                    return Err(Error::Script(format!(
                        "tcp channel '{}' needs host and port",
                        name
                    )));
                }
            };
            let timeout = config.timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
            Ok(Box::new(TcpChannel::connect(host, port, timeout).await?))
        }
    }
}

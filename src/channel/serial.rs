use super::Channel;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{
    DataBits, FlowControl, Parity, SerialPortBuilder, SerialPortBuilderExt, SerialStream, StopBits,
};
use tracing::{debug, warn};

/// Serial port channel, 8N1 without flow control.
pub struct SerialChannel {
    device: String,
    baud: u32,
    stream: Option<SerialStream>,
}

impl SerialChannel {
    /// Open `device` at `baud`. Must be called from within a tokio runtime.
    pub fn open(device: &str, baud: u32) -> Result<Self> {
        let stream = port_builder(device, baud)
            .open_native_async()
            .map_err(|e| Error::Connect {
                target: device.to_string(),
                source: e.into(),
            })?;
        debug!(device, baud, "Opened serial channel");
        Ok(Self {
            device: device.to_string(),
            baud,
            stream: Some(stream),
        })
    }
}

fn port_builder(device: &str, baud: u32) -> SerialPortBuilder {
    tokio_serial::new(device, baud)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
}

#[async_trait]
impl Channel for SerialChannel {
    fn describe(&self) -> String {
        format!("{}@{}", self.device, self.baud)
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::ChannelClosed(self.device.clone()))?;
        let result = match stream.write_all(data).await {
            Ok(()) => stream.flush().await,
            Err(e) => Err(e),
        };
        if let Err(source) = result {
            warn!(device = %self.device, error = %source, "Serial write failed, closing channel");
            self.stream = None;
            return Err(Error::ChannelIo {
                target: self.device.clone(),
                source,
            });
        }
        Ok(())
    }

    async fn read(&mut self, max: usize, timeout: Duration) -> Result<Vec<u8>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::ChannelClosed(self.device.clone()))?;
        let mut buf = vec![0u8; max.max(1)];
        let result = tokio::time::timeout(timeout, stream.read(&mut buf)).await;
        match result {
            Err(_) => Ok(Vec::new()),
            Ok(Ok(n)) => {
                buf.truncate(n);
                Ok(buf)
            }
            Ok(Err(e)) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                Ok(Vec::new())
            }
            Ok(Err(source)) => {
                warn!(device = %self.device, error = %source, "Serial read failed, closing channel");
                self.stream = None;
                Err(Error::ChannelIo {
                    target: self.device.clone(),
                    source,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelConfig, open};
    use crate::error::ErrorKind;

    #[test]
    fn test_port_builder_is_8n1() {
        let settings = format!("{:?}", port_builder("/dev/ttyUSB3", 9600));
        for expected in [
            "/dev/ttyUSB3",
            "baud_rate: 9600",
            "data_bits: Eight",
            "parity: None",
            "stop_bits: One",
            "flow_control: None",
        ] {
            assert!(settings.contains(expected), "{expected} missing from {settings}");
        }
    }

    #[tokio::test]
    async fn test_missing_device_is_a_connect_error() {
        let err = SerialChannel::open("/dev/devscript-no-such-port", 9600)
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Connectivity);
        assert!(err.to_string().contains("/dev/devscript-no-such-port"), "got: {err}");

        let mut config = ChannelConfig::serial("/dev/devscript-no-such-port", 0);
        config.baud = None;
        let err = open("dut", &config).await.err().unwrap();
        assert!(matches!(err, Error::Connect { ref target, .. } if target.contains("no-such-port")));
    }
}

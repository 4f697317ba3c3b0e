//! XMODEM and YMODEM senders.
//!
//! Blocks are 128-byte SOH packets: `[SOH, n, 0xFF - n] + data + check`,
//! where the check is CRC-16/XMODEM (big-endian) when the receiver opened
//! with `C` and an 8-bit sum when it opened with NAK. Short data is padded
//! with 0x1A.

use super::crc::{crc16_xmodem, sum8};
use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::event::StopHandle;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

pub const SOH: u8 = 0x01;
pub const EOT: u8 = 0x04;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;
pub const CAN: u8 = 0x18;
pub const CRC_REQUEST: u8 = b'C';
pub const PAD: u8 = 0x1A;
pub const BLOCK_SIZE: usize = 128;

const TICK: Duration = Duration::from_millis(100);

/// Build one data block. Only the low byte of `block` goes on the wire.
pub fn build_block(block: usize, data: &[u8], use_crc: bool) -> Vec<u8> {
    let n = (block & 0xFF) as u8;
    let mut payload = [PAD; BLOCK_SIZE];
    let len = data.len().min(BLOCK_SIZE);
    payload[..len].copy_from_slice(&data[..len]);

    let mut packet = Vec::with_capacity(BLOCK_SIZE + 5);
    packet.extend([SOH, n, 0xFF - n]);
    packet.extend_from_slice(&payload);
    if use_crc {
        packet.extend(crc16_xmodem(&payload).to_be_bytes());
    } else {
        packet.push(sum8(&payload));
    }
    packet
}

pub fn build_eot() -> Vec<u8> {
    vec![EOT]
}

/// Number of 128-byte blocks needed for `size` bytes.
pub fn block_count(size: usize) -> usize {
    size.div_ceil(BLOCK_SIZE)
}

#[derive(Debug, Clone, Copy)]
pub struct TransferOptions {
    /// Extra attempts per block after the first.
    pub retries: u32,
    /// How long to wait for the receiver's opening `C` or NAK.
    pub start_timeout: Duration,
    /// How long to wait for the reply to each block.
    pub block_timeout: Duration,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            retries: 10,
            start_timeout: Duration::from_secs(10),
            block_timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferReport {
    pub blocks: usize,
    pub bytes: usize,
    /// Blocks re-sent after a NAK or a missing reply.
    pub resent: u32,
    pub crc: bool,
}

/// Send `data` with plain XMODEM.
#[instrument(skip(channel, data, stop), fields(size = data.len()))]
pub async fn send_xmodem(
    channel: &mut dyn Channel,
    data: &[u8],
    options: &TransferOptions,
    stop: &StopHandle,
) -> Result<TransferReport> {
    let mut sender = Sender::new(channel, options, stop, "xmodem");
    let crc = sender.wait_for_start().await?;
    sender.report.crc = crc;
    sender.send_data(data, crc).await?;
    sender.send_eot().await?;
    info!(blocks = sender.report.blocks, "XMODEM transfer complete");
    Ok(sender.report)
}

/// Send `data` as file `name` with YMODEM (batch of one file).
#[instrument(skip(channel, data, stop), fields(size = data.len()))]
pub async fn send_ymodem(
    channel: &mut dyn Channel,
    name: &str,
    data: &[u8],
    options: &TransferOptions,
    stop: &StopHandle,
) -> Result<TransferReport> {
    let mut sender = Sender::new(channel, options, stop, "ymodem");
    let crc = sender.wait_for_start().await?;
    sender.report.crc = crc;

    let mut header = [0u8; BLOCK_SIZE];
    let info = format!("{}\0{}\0", name, data.len());
    if info.len() > BLOCK_SIZE {
        return Err(Error::invalid("file", format!("file name '{}' is too long", name)));
    }
    header[..info.len()].copy_from_slice(info.as_bytes());
    sender.send_block(0, &build_block(0, &header, crc)).await?;

    // the receiver asks again before the first data block
    sender.wait_for_start().await?;
    sender.send_data(data, crc).await?;
    sender.send_eot().await?;

    sender.wait_for_start().await?;
    sender
        .send_block(0, &build_block(0, &[0u8; BLOCK_SIZE], crc))
        .await?;
    info!(blocks = sender.report.blocks, "YMODEM transfer complete");
    Ok(sender.report)
}

struct Sender<'a> {
    channel: &'a mut dyn Channel,
    options: &'a TransferOptions,
    stop: &'a StopHandle,
    protocol: &'static str,
    report: TransferReport,
}

impl<'a> Sender<'a> {
    fn new(
        channel: &'a mut dyn Channel,
        options: &'a TransferOptions,
        stop: &'a StopHandle,
        protocol: &'static str,
    ) -> Self {
        Self {
            channel,
            options,
            stop,
            protocol,
            report: TransferReport::default(),
        }
    }

    fn cancelled(&self) -> Error {
        Error::Protocol {
            protocol: self.protocol,
            message: "transfer cancelled by receiver".into(),
        }
    }

    /// Wait for `C` (CRC mode) or NAK (checksum mode).
    async fn wait_for_start(&mut self) -> Result<bool> {
        let deadline = Instant::now() + self.options.start_timeout;
        loop {
            if self.stop.is_stopped() {
                return Err(Error::Stopped);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::timeout(
                    format!("{} receiver to start", self.protocol),
                    self.options.start_timeout,
                ));
            }
            let byte = self.channel.read(1, remaining.min(TICK)).await?;
            match byte.first() {
                Some(&CRC_REQUEST) => return Ok(true),
                Some(&NAK) => return Ok(false),
                Some(&CAN) => return Err(self.cancelled()),
                Some(other) => debug!(byte = other, "Ignoring byte while waiting for receiver"),
                None => {}
            }
        }
    }

    /// Wait for ACK, NAK or CAN. `None` means nothing usable arrived in time.
    async fn wait_for_reply(&mut self) -> Result<Option<u8>> {
        let deadline = Instant::now() + self.options.block_timeout;
        loop {
            if self.stop.is_stopped() {
                return Err(Error::Stopped);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let byte = self.channel.read(1, remaining.min(TICK)).await?;
            if let Some(&b @ (ACK | NAK | CAN)) = byte.first() {
                return Ok(Some(b));
            }
        }
    }

    async fn send_block(&mut self, number: usize, packet: &[u8]) -> Result<()> {
        let attempts = self.options.retries + 1;
        for attempt in 1..=attempts {
            if self.stop.is_stopped() {
                return Err(Error::Stopped);
            }
            self.channel.write(packet).await?;
            match self.wait_for_reply().await? {
                Some(ACK) => {
                    self.report.blocks += 1;
                    return Ok(());
                }
                Some(CAN) => return Err(self.cancelled()),
                reply => {
                    if attempt < attempts {
                        warn!(block = number, attempt, nak = reply.is_some(), "Block not acknowledged, resending");
                        self.report.resent += 1;
                    }
                }
            }
        }
        Err(Error::Protocol {
            protocol: self.protocol,
            message: format!("block {} not acknowledged after {} attempts", number, attempts),
        })
    }

    async fn send_data(&mut self, data: &[u8], crc: bool) -> Result<()> {
        for (i, chunk) in data.chunks(BLOCK_SIZE).enumerate() {
            let number = i + 1;
            self.send_block(number, &build_block(number, chunk, crc)).await?;
            self.report.bytes += chunk.len();
        }
        Ok(())
    }

    async fn send_eot(&mut self) -> Result<()> {
        let attempts = self.options.retries + 1;
        for _ in 0..attempts {
            self.channel.write(&build_eot()).await?;
            match self.wait_for_reply().await? {
                Some(ACK) => return Ok(()),
                Some(CAN) => return Err(self.cancelled()),
                _ => debug!("EOT not acknowledged, resending"),
            }
        }
        Err(Error::Protocol {
            protocol: self.protocol,
            message: format!("EOT not acknowledged after {} attempts", attempts),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MockChannel;
    use crate::error::ErrorKind;

    fn fast() -> TransferOptions {
        TransferOptions {
            retries: 2,
            start_timeout: Duration::from_millis(300),
            block_timeout: Duration::from_millis(100),
        }
    }

    #[test]
    fn test_block_layout() {
        let packet = build_block(1, b"hello", true);
        assert_eq!(packet.len(), 133);
        assert_eq!(&packet[..3], &[SOH, 0x01, 0xFE]);
        assert_eq!(&packet[3..8], b"hello");
        assert!(packet[8..131].iter().all(|&b| b == PAD));
        let crc = crc16_xmodem(&packet[3..131]);
        assert_eq!(&packet[131..], &crc.to_be_bytes());

        let packet = build_block(2, &[1, 2, 3], false);
        assert_eq!(packet.len(), 132);
        assert_eq!(packet[131], sum8(&packet[3..131]));
    }

    #[test]
    fn test_block_number_wraps() {
        let packet = build_block(255, &[], true);
        assert_eq!(&packet[1..3], &[0xFF, 0x00]);
        let packet = build_block(256, &[], true);
        assert_eq!(&packet[1..3], &[0x00, 0xFF]);
        assert_eq!(block_count(0), 0);
        assert_eq!(block_count(128), 1);
        assert_eq!(block_count(129), 2);
    }

    #[tokio::test]
    async fn test_xmodem_transfer_with_one_nak() {
        let (mut ch, handle) = MockChannel::new("dut");
        handle.push(&[CRC_REQUEST]);
        let mut first = true;
        handle.respond_with(move |_| {
            if std::mem::take(&mut first) {
                Some(vec![NAK])
            } else {
                Some(vec![ACK])
            }
        });

        let data = vec![0x55u8; 200];
        let report = send_xmodem(&mut ch, &data, &fast(), &StopHandle::new())
            .await
            .unwrap();
        assert_eq!(
            report,
            TransferReport {
                blocks: 2,
                bytes: 200,
                resent: 1,
                crc: true
            }
        );
        let writes = handle.writes();
        assert_eq!(writes.len(), 4);
        assert_eq!(writes[0], writes[1]);
        assert_eq!(writes[3], [EOT]);
    }

    #[tokio::test]
    async fn test_xmodem_cancel_and_timeout() {
        let (mut ch, handle) = MockChannel::new("dut");
        handle.push(&[NAK]);
        handle.respond_with(|_| Some(vec![CAN]));
        let err = send_xmodem(&mut ch, b"abc", &fast(), &StopHandle::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        // checksum mode: 132-byte block
        assert_eq!(handle.writes()[0].len(), 132);

        let (mut ch, _handle) = MockChannel::new("dut");
        let err = send_xmodem(&mut ch, b"abc", &fast(), &StopHandle::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_stop_interrupts_start_wait() {
        let (mut ch, _handle) = MockChannel::new("dut");
        let stop = StopHandle::new();
        stop.stop();
        let err = send_xmodem(&mut ch, b"abc", &fast(), &stop).await.unwrap_err();
        assert!(matches!(err, Error::Stopped));
    }

    #[tokio::test]
    async fn test_ymodem_header_and_closing_block() {
        let (mut ch, handle) = MockChannel::new("dut");
        handle.push(&[CRC_REQUEST]);
        handle.respond_with(|req| {
            if req[0] == EOT || (req[0] == SOH && req[1] == 0) {
                Some(vec![ACK, CRC_REQUEST])
            } else {
                Some(vec![ACK])
            }
        });

        let report = send_ymodem(&mut ch, "fw.bin", &[7u8; 100], &fast(), &StopHandle::new())
            .await
            .unwrap();
        assert_eq!(report.blocks, 3);
        assert_eq!(report.bytes, 100);

        let writes = handle.writes();
        assert_eq!(writes.len(), 4);
        assert!(writes[0][3..].starts_with(b"fw.bin\0100\0"));
        assert_eq!(writes[1][1], 1);
        assert_eq!(writes[2], [EOT]);
        assert!(writes[3][3..131].iter().all(|&b| b == 0));
    }
}

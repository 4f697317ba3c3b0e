//! Modbus master over RTU, ASCII and TCP framing.
//!
//! Function codes 1, 2, 3, 4 (reads) and 5, 6, 15, 16 (writes) are
//! supported. Over RTU and ASCII a request that times out or fails its
//! checksum is re-sent up to `retries` times; TCP makes a single attempt.
//! Exception responses are never retried.

use super::crc::{crc16_modbus, lrc};
use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::value::{Value, ValueMap, from_hex, to_hex};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument, warn};

const MBAP_LEN: usize = 7;
/// How long the line must stay silent before a request is resent.
const RESEND_QUIET: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    #[default]
    Rtu,
    Ascii,
    Tcp,
}

impl Variant {
    pub fn parse(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "rtu" => Ok(Variant::Rtu),
            "ascii" => Ok(Variant::Ascii),
            "tcp" => Ok(Variant::Tcp),
            other => Err(Error::invalid(
                "protocol",
                format!("'{}' is not one of rtu, ascii, tcp", other),
            )),
        }
    }

    fn label(self) -> &'static str {
        match self {
            Variant::Rtu => "modbus_rtu",
            Variant::Ascii => "modbus_ascii",
            Variant::Tcp => "modbus_tcp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub unit_id: u8,
    pub function: u8,
    pub address: u16,
    pub quantity: u16,
    /// Coil states (0/1) or register values for write functions.
    pub values: Vec<u16>,
}

impl Request {
    pub fn read(unit_id: u8, function: u8, address: u16, quantity: u16) -> Self {
        Self {
            unit_id,
            function,
            address,
            quantity,
            values: Vec::new(),
        }
    }

    /// Encode the protocol data unit (function code and data).
    pub fn pdu(&self) -> Result<Vec<u8>> {
        let mut pdu = vec![self.function];
        pdu.extend(self.address.to_be_bytes());
        match self.function {
            1 | 2 => {
                check_quantity(self.quantity, 2000)?;
                pdu.extend(self.quantity.to_be_bytes());
            }
            3 | 4 => {
                check_quantity(self.quantity, 125)?;
                pdu.extend(self.quantity.to_be_bytes());
            }
            5 => {
                let on = self.single_value()? != 0;
                pdu.extend(if on { [0xFF, 0x00] } else { [0x00, 0x00] });
            }
            6 => pdu.extend(self.single_value()?.to_be_bytes()),
            15 => {
                check_quantity(self.quantity, 1968)?;
                let bits = self.values_for_quantity()?;
                let mut packed = vec![0u8; bits.len().div_ceil(8)];
                for (i, bit) in bits.iter().enumerate() {
                    if *bit != 0 {
                        packed[i / 8] |= 1 << (i % 8);
                    }
                }
                pdu.extend(self.quantity.to_be_bytes());
                pdu.push(packed.len() as u8);
                pdu.extend(packed);
            }
            16 => {
                check_quantity(self.quantity, 123)?;
                let regs = self.values_for_quantity()?;
                pdu.extend(self.quantity.to_be_bytes());
                pdu.push((regs.len() * 2) as u8);
                for reg in regs {
                    pdu.extend(reg.to_be_bytes());
                }
            }
            other => {
                return Err(Error::invalid(
                    "function",
                    format!("unsupported function code {}", other),
                ));
            }
        }
        Ok(pdu)
    }

    fn single_value(&self) -> Result<u16> {
        self.values
            .first()
            .copied()
            .ok_or_else(|| Error::invalid("value", "write needs a value"))
    }

    fn values_for_quantity(&self) -> Result<&[u16]> {
        if self.values.len() != self.quantity as usize {
            return Err(Error::invalid(
                "values",
                format!(
                    "{} value(s) given for quantity {}",
                    self.values.len(),
                    self.quantity
                ),
            ));
        }
        Ok(&self.values)
    }

    /// Length of a normal (non-exception) response PDU.
    fn response_pdu_len(&self) -> usize {
        match self.function {
            1 | 2 => 2 + (self.quantity as usize).div_ceil(8),
            3 | 4 => 2 + self.quantity as usize * 2,
            _ => 5,
        }
    }

    /// Decode a response PDU into the values it carries.
    pub fn decode(&self, pdu: &[u8]) -> Result<Value> {
        let bad = |message: String| Error::Protocol {
            protocol: "modbus",
            message,
        };
        let Some(&function) = pdu.first() else {
            return Err(bad("empty response".into()));
        };
        if function == self.function | 0x80 {
            let code = pdu.get(1).copied().unwrap_or(0);
            return Err(bad(format!(
                "exception {:#04x} ({}) for function {}",
                code,
                exception_name(code),
                self.function
            )));
        }
        if function != self.function {
            return Err(bad(format!(
                "response function {} does not match request {}",
                function, self.function
            )));
        }
        if pdu.len() != self.response_pdu_len() {
            return Err(bad(format!(
                "response PDU is {} bytes, expected {}",
                pdu.len(),
                self.response_pdu_len()
            )));
        }

        let mut out = ValueMap::new();
        out.insert("function".into(), Value::from(self.function));
        out.insert("address".into(), Value::from(self.address));
        match self.function {
            1 | 2 => {
                let data = &pdu[2..];
                let bits = (0..self.quantity as usize)
                    .map(|i| Value::Bool(data[i / 8] & (1 << (i % 8)) != 0))
                    .collect();
                out.insert("values".into(), Value::List(bits));
            }
            3 | 4 => {
                let regs = pdu[2..]
                    .chunks_exact(2)
                    .map(|c| Value::from(u16::from_be_bytes([c[0], c[1]])))
                    .collect();
                out.insert("values".into(), Value::List(regs));
            }
            5 | 6 => {
                let echoed = u16::from_be_bytes([pdu[3], pdu[4]]);
                out.insert("value".into(), Value::from(echoed));
            }
            _ => {
                let quantity = u16::from_be_bytes([pdu[3], pdu[4]]);
                out.insert("quantity".into(), Value::from(quantity));
            }
        }
        Ok(Value::Map(out))
    }
}

fn check_quantity(quantity: u16, max: u16) -> Result<()> {
    if quantity == 0 || quantity > max {
        return Err(Error::invalid(
            "quantity",
            format!("{} is outside 1..={}", quantity, max),
        ));
    }
    Ok(())
}

fn exception_name(code: u8) -> &'static str {
    match code {
        1 => "illegal function",
        2 => "illegal data address",
        3 => "illegal data value",
        4 => "server device failure",
        5 => "acknowledge",
        6 => "server device busy",
        8 => "memory parity error",
        10 => "gateway path unavailable",
        11 => "gateway target failed to respond",
        _ => "unknown",
    }
}

/// Frame a request for the wire.
pub fn encode(variant: Variant, request: &Request, transaction_id: u16) -> Result<Vec<u8>> {
    let pdu = request.pdu()?;
    let mut adu = Vec::with_capacity(pdu.len() + MBAP_LEN + 2);
    match variant {
        Variant::Rtu => {
            adu.push(request.unit_id);
            adu.extend(&pdu);
            let crc = crc16_modbus(&adu);
            adu.extend(crc.to_le_bytes());
        }
        Variant::Ascii => {
            let mut body = vec![request.unit_id];
            body.extend(&pdu);
            body.push(lrc(&body));
            adu.push(b':');
            adu.extend(to_hex(&body).into_bytes());
            adu.extend(b"\r\n");
        }
        Variant::Tcp => {
            adu.extend(transaction_id.to_be_bytes());
            adu.extend([0, 0]);
            adu.extend(((pdu.len() + 1) as u16).to_be_bytes());
            adu.push(request.unit_id);
            adu.extend(&pdu);
        }
    }
    Ok(adu)
}

/// Request/response settings for one exchange.
#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub variant: Variant,
    pub timeout: Duration,
    /// Extra attempts after the first. Ignored for TCP.
    pub retries: u32,
}

/// Send `request` and decode the matching response.
///
/// # Errors
///
/// [`Error::Timeout`] or [`Error::CrcMismatch`] once the retry budget is
/// spent, [`Error::Protocol`] for exception or malformed responses, and any
/// channel error as-is.
#[instrument(skip(channel, request), fields(variant = ?options.variant, function = request.function))]
pub async fn transact(
    channel: &mut dyn Channel,
    request: &Request,
    options: &Options,
    transaction_id: u16,
) -> Result<Value> {
    let adu = encode(options.variant, request, transaction_id)?;
    let attempts = match options.variant {
        Variant::Tcp => 1,
        Variant::Rtu | Variant::Ascii => options.retries + 1,
    };

    let mut attempt = 1;
    loop {
        if attempt > 1 {
            let stale = channel.discard_input(RESEND_QUIET).await?;
            if stale > 0 {
                debug!(stale, "Dropped late reply before resending");
            }
        }
        channel.write(&adu).await?;
        let result = match options.variant {
            Variant::Rtu => read_rtu(channel, request, options.timeout).await,
            Variant::Ascii => read_ascii(channel, request, options.timeout).await,
            Variant::Tcp => read_tcp(channel, request, options.timeout, transaction_id).await,
        };
        match result {
            Ok(value) => {
                debug!(attempt, "Modbus exchange complete");
                return Ok(value);
            }
            Err(e) if e.is_retryable() && attempt < attempts => {
                warn!(attempt, attempts, error = %e, "Modbus request failed, retrying");
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn read_rtu(channel: &mut dyn Channel, request: &Request, timeout: Duration) -> Result<Value> {
    let deadline = tokio::time::Instant::now() + timeout;
    let head = channel.read_exact(2, timeout).await?;
    if head.len() < 2 {
        return Err(Error::timeout("modbus_rtu response", timeout));
    }
    // unit + exception code + crc, or unit + full pdu + crc
    let rest_len = if head[1] & 0x80 != 0 {
        3
    } else {
        request.response_pdu_len() - 1 + 2
    };
    let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
    let rest = channel.read_exact(rest_len, remaining).await?;
    if rest.len() < rest_len {
        return Err(Error::timeout("modbus_rtu response", timeout));
    }
    let frame = [head, rest].concat();
    let (body, crc_part) = frame.split_at(frame.len() - 2);
    let expected = crc16_modbus(body).to_le_bytes();
    if crc_part != expected {
        return Err(Error::CrcMismatch {
            frame: Variant::Rtu.label().into(),
            expected: to_hex(&expected),
            actual: to_hex(crc_part),
        });
    }
    check_unit(request, body[0])?;
    request.decode(&body[1..])
}

async fn read_ascii(channel: &mut dyn Channel, request: &Request, timeout: Duration) -> Result<Value> {
    let line = channel.read_until(b"\r\n", timeout).await?;
    if !line.ends_with(b"\r\n") {
        return Err(Error::timeout("modbus_ascii response", timeout));
    }
    let text = String::from_utf8_lossy(&line);
    let hex = text
        .trim()
        .strip_prefix(':')
        .ok_or_else(|| Error::Protocol {
            protocol: "modbus",
            message: format!("ASCII frame does not start with ':': {}", text.trim()),
        })?;
    let body = from_hex(hex)
        .filter(|b| b.len() >= 3)
        .ok_or_else(|| Error::Protocol {
            protocol: "modbus",
            message: format!("malformed ASCII frame: {}", hex),
        })?;
    let (body, lrc_part) = body.split_at(body.len() - 1);
    let expected = lrc(body);
    if lrc_part[0] != expected {
        return Err(Error::CrcMismatch {
            frame: Variant::Ascii.label().into(),
            expected: format!("{:02X}", expected),
            actual: format!("{:02X}", lrc_part[0]),
        });
    }
    check_unit(request, body[0])?;
    request.decode(&body[1..])
}

async fn read_tcp(
    channel: &mut dyn Channel,
    request: &Request,
    timeout: Duration,
    transaction_id: u16,
) -> Result<Value> {
    let deadline = tokio::time::Instant::now() + timeout;
    let header = channel.read_exact(MBAP_LEN, timeout).await?;
    if header.len() < MBAP_LEN {
        return Err(Error::timeout("modbus_tcp response", timeout));
    }
    let tid = u16::from_be_bytes([header[0], header[1]]);
    let protocol = u16::from_be_bytes([header[2], header[3]]);
    let length = u16::from_be_bytes([header[4], header[5]]) as usize;
    if tid != transaction_id || protocol != 0 || length < 2 {
        return Err(Error::Protocol {
            protocol: "modbus",
            message: format!(
                "bad MBAP header {} for transaction {}",
                to_hex(&header),
                transaction_id
            ),
        });
    }
    let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
    let pdu = channel.read_exact(length - 1, remaining).await?;
    if pdu.len() < length - 1 {
        return Err(Error::timeout("modbus_tcp response", timeout));
    }
    check_unit(request, header[6])?;
    request.decode(&pdu)
}

fn check_unit(request: &Request, unit: u8) -> Result<()> {
    if unit != request.unit_id {
        return Err(Error::Protocol {
            protocol: "modbus",
            message: format!("response from unit {}, expected {}", unit, request.unit_id),
        });
    }
    Ok(())
}

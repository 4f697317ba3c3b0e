//! Line-oriented request/response drivers: Hayes AT commands and SCPI.

use crate::channel::Channel;
use crate::error::{Error, Result};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument};

/// One AT command exchange.
#[derive(Debug, Clone)]
pub struct AtCommand {
    pub cmd: String,
    pub terminator: String,
    /// Final result line signalling success, compared case-insensitively.
    pub ok: String,
    /// Any line containing this token fails the command.
    pub error: String,
    /// The device echoes the command back; drop the echoed line.
    pub echo: bool,
    pub timeout: Duration,
}

impl AtCommand {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            terminator: "\r\n".into(),
            ok: "OK".into(),
            error: "ERROR".into(),
            echo: true,
            timeout: Duration::from_secs(2),
        }
    }
}

/// Lines the device sent before its final result code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtReply {
    pub lines: Vec<String>,
    pub status: String,
}

/// Send `request` and collect response lines up to the final result code.
///
/// # Errors
///
/// [`Error::Protocol`] when the device answers with the error token,
/// [`Error::Timeout`] when neither token arrives before the deadline.
#[instrument(skip(channel, request), fields(cmd = %request.cmd))]
pub async fn at_command(channel: &mut dyn Channel, request: &AtCommand) -> Result<AtReply> {
    let mut wire = request.cmd.clone().into_bytes();
    wire.extend_from_slice(request.terminator.as_bytes());
    channel.write(&wire).await?;

    let deadline = Instant::now() + request.timeout;
    let mut lines = Vec::new();
    let mut first = true;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::timeout(
                format!("'{}' reply to {}", request.ok, request.cmd),
                request.timeout,
            ));
        }
        let raw = channel.read_until(b"\n", remaining).await?;
        let line = String::from_utf8_lossy(&raw).trim().to_string();
        if line.is_empty() {
            continue;
        }
        if first && request.echo && line.eq_ignore_ascii_case(request.cmd.trim()) {
            debug!("Dropping command echo");
            first = false;
            continue;
        }
        first = false;
        if line.eq_ignore_ascii_case(&request.ok) {
            return Ok(AtReply {
                lines,
                status: line,
            });
        }
        if line.to_uppercase().contains(&request.error.to_uppercase()) {
            return Err(Error::Protocol {
                protocol: "AT",
                message: format!("{} failed: {}", request.cmd, line),
            });
        }
        lines.push(line);
    }
}

/// One SCPI command exchange.
#[derive(Debug, Clone)]
pub struct ScpiCommand {
    pub cmd: String,
    pub terminator: String,
    /// `None` expects a response only for queries (commands containing `?`).
    pub expect_response: Option<bool>,
    pub strip: bool,
    pub timeout: Duration,
}

impl ScpiCommand {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            terminator: "\n".into(),
            expect_response: None,
            strip: true,
            timeout: Duration::from_secs(2),
        }
    }

    pub fn expects_response(&self) -> bool {
        self.expect_response.unwrap_or_else(|| self.cmd.contains('?'))
    }
}

/// Send `request`; for queries, read and return the single response line.
#[instrument(skip(channel, request), fields(cmd = %request.cmd))]
pub async fn scpi_command(channel: &mut dyn Channel, request: &ScpiCommand) -> Result<Option<String>> {
    let mut wire = request.cmd.clone().into_bytes();
    wire.extend_from_slice(request.terminator.as_bytes());
    channel.write(&wire).await?;
    if !request.expects_response() {
        return Ok(None);
    }

    let terminator = request.terminator.as_bytes();
    let raw = channel.read_until(terminator, request.timeout).await?;
    if !raw.ends_with(terminator) {
        return Err(Error::timeout(
            format!("response to {}", request.cmd),
            request.timeout,
        ));
    }
    let text = String::from_utf8_lossy(&raw[..raw.len() - terminator.len()]).into_owned();
    Ok(Some(if request.strip {
        text.trim().to_string()
    } else {
        text
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MockChannel;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn test_at_ok_with_echo() {
        let (mut ch, handle) = MockChannel::new("modem");
        handle.respond_with(|req| {
            (req == b"ATI\r\n").then(|| b"ATI\r\r\nQuectel\r\nEC25\r\n\r\nOK\r\n".to_vec())
        });
        let mut req = AtCommand::new("ATI");
        req.timeout = Duration::from_millis(500);
        let reply = at_command(&mut ch, &req).await.unwrap();
        assert_eq!(reply.lines, ["Quectel", "EC25"]);
        assert_eq!(reply.status, "OK");
        assert_eq!(handle.written(), b"ATI\r\n");
    }

    #[tokio::test]
    async fn test_at_error_token() {
        let (mut ch, handle) = MockChannel::new("modem");
        handle.push(b"+CME ERROR: 10\r\n");
        let err = at_command(&mut ch, &AtCommand::new("AT+CPIN?")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(err.to_string().contains("CME ERROR"), "got: {err}");
    }

    #[tokio::test]
    async fn test_at_timeout() {
        let (mut ch, handle) = MockChannel::new("modem");
        handle.push(b"AT\r\n");
        let mut req = AtCommand::new("AT");
        req.timeout = Duration::from_millis(60);
        let err = at_command(&mut ch, &req).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_scpi_query_and_set() {
        let (mut ch, handle) = MockChannel::new("psu");
        handle.respond_with(|req| (req == b"*IDN?\n").then(|| b" ACME,PSU-1,42,1.0 \n".to_vec()));

        let idn = scpi_command(&mut ch, &ScpiCommand::new("*IDN?")).await.unwrap();
        assert_eq!(idn.as_deref(), Some("ACME,PSU-1,42,1.0"));

        let set = scpi_command(&mut ch, &ScpiCommand::new("VOLT 3.3")).await.unwrap();
        assert_eq!(set, None);
        assert_eq!(handle.write_count(), 2);
    }

    #[tokio::test]
    async fn test_scpi_query_timeout() {
        let (mut ch, _handle) = MockChannel::new("psu");
        let mut req = ScpiCommand::new("MEAS:VOLT?");
        req.timeout = Duration::from_millis(40);
        let err = scpi_command(&mut ch, &req).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }
}

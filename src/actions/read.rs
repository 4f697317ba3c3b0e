//! [`ReadLineAction`] and [`ReadStreamAction`]: capture inbound text.

use crate::action::{Action, Args, Schema, TypeSpec};
use crate::channel::Channel;
use crate::context::RuntimeContext;
use crate::error::{Error, Result};
use crate::value::{Value, to_hex};
use crate::value_map;
use async_trait::async_trait;
use tokio::time::Instant;
use tracing::info;

/// Reads up to `terminator` within `timeout` and stores the trimmed text in
/// `last_line_rx` and the raw bytes as hex in `last_line_rx_raw`.
///
/// A timeout is not an error: whatever arrived is stored, possibly nothing.
pub struct ReadLineAction {
    schema: Schema,
}

impl ReadLineAction {
    pub const NAME: &'static str = "read_line";

    pub fn new() -> Self {
        Self {
            schema: Schema::new()
                .optional("terminator", "\n")
                .optional("timeout", 1000)
                .optional("channel", Value::Null)
                .typed("terminator", TypeSpec::Bytes)
                .typed("timeout", TypeSpec::Duration)
                .typed("channel", TypeSpec::String),
        }
    }
}

impl Default for ReadLineAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Action for ReadLineAction {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn execute(&self, ctx: &mut RuntimeContext, args: Args) -> Result<Value> {
        let terminator = args.bytes("terminator")?;
        let timeout = args.duration("timeout")?;
        let channel = args.opt_string("channel")?;

        let raw = ctx
            .tap(channel.as_deref())?
            .read_until(&terminator, timeout)
            .await?;
        let text = String::from_utf8_lossy(&raw).trim().to_string();
        let hex = to_hex(&raw);
        ctx.set_var("last_line_rx", text.clone());
        ctx.set_var("last_line_rx_raw", hex.clone());
        Ok(Value::Map(value_map! { "text" => text, "hex" => hex }))
    }
}

/// Reads chunks for `duration_ms`, logging each one, and keeps the last
/// chunk in `last_stream_rx` / `last_stream_rx_raw`.
pub struct ReadStreamAction {
    schema: Schema,
}

impl ReadStreamAction {
    pub const NAME: &'static str = "read_stream";

    pub fn new() -> Self {
        Self {
            schema: Schema::new()
                .alias("duration", "duration_ms")
                .optional("duration_ms", 1000)
                .optional("chunk_size", 256)
                .optional("timeout", 200)
                .optional("log_hex", true)
                .optional("channel", Value::Null)
                .typed("duration_ms", TypeSpec::Duration)
                .typed("chunk_size", TypeSpec::Integer)
                .typed("timeout", TypeSpec::Duration)
                .typed("log_hex", TypeSpec::Bool)
                .typed("channel", TypeSpec::String),
        }
    }
}

impl Default for ReadStreamAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Action for ReadStreamAction {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn execute(&self, ctx: &mut RuntimeContext, args: Args) -> Result<Value> {
        let duration = args.duration("duration_ms")?;
        let chunk_size: usize = args.int_in("chunk_size", 1..=65_536)?;
        let timeout = args.duration("timeout")?;
        let log_hex = args.bool("log_hex")?;
        let channel = args.opt_string("channel")?;

        let deadline = Instant::now() + duration;
        let mut last_text = String::new();
        let mut last_hex = String::new();
        loop {
            if ctx.is_stopped() {
                return Err(Error::Stopped);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let chunk = ctx
                .tap(channel.as_deref())?
                .read(chunk_size, timeout.min(remaining))
                .await?;
            if chunk.is_empty() {
                continue;
            }
            last_hex = to_hex(&chunk);
            last_text = String::from_utf8_lossy(&chunk).trim().to_string();
            if log_hex {
                info!(target: "devscript::script", "RX(hex): {}", last_hex);
            }
            if !last_text.is_empty() {
                info!(target: "devscript::script", "RX(text): {}", last_text);
            }
        }

        ctx.set_var("last_stream_rx", last_text.clone());
        ctx.set_var("last_stream_rx_raw", last_hex.clone());
        Ok(Value::Map(value_map! { "text" => last_text, "hex" => last_hex }))
    }
}

#[cfg(test)]
mod tests {
    use crate::action::dispatch;
    use crate::context::testing::mock_context;
    use crate::error::Error;
    use crate::script::ActionCall;
    use crate::value::Value;
    use crate::value_map;

    #[tokio::test]
    async fn test_read_line_stores_text_and_hex() {
        let (mut ctx, handles, _) = mock_context(&["dut"], value_map! {});
        handles[0].push(b" ready \r\nrest");
        let call = ActionCall::new("read_line", value_map! { "timeout" => 200 });
        dispatch(&mut ctx, &call).await.unwrap();
        assert_eq!(ctx.var("last_line_rx"), Some(&Value::from("ready")));
        assert_eq!(
            ctx.var("last_line_rx_raw"),
            Some(&Value::from("207265616479200D0A"))
        );
    }

    #[tokio::test]
    async fn test_read_line_timeout_is_not_an_error() {
        let (mut ctx, _, _) = mock_context(&["dut"], value_map! {});
        let call = ActionCall::new("read_line", value_map! { "timeout" => 30 });
        dispatch(&mut ctx, &call).await.unwrap();
        assert_eq!(ctx.var("last_line_rx"), Some(&Value::from("")));
    }

    #[tokio::test]
    async fn test_read_line_observes_stop() {
        let (mut ctx, _, _) = mock_context(&["dut"], value_map! {});
        ctx.stop_handle().stop();
        let call = ActionCall::new("read_line", value_map! { "timeout" => 5000 });
        let err = dispatch(&mut ctx, &call).await.unwrap_err();
        assert!(matches!(err, Error::Stopped), "got: {err}");
        assert!(ctx.var("last_line_rx").is_none());
    }

    #[tokio::test]
    async fn test_read_stream_keeps_last_chunk() {
        let (mut ctx, handles, _) = mock_context(&["dut"], value_map! {});
        handles[0].push(b"T=21.5\n");
        let call = ActionCall::new(
            "read_stream",
            value_map! { "duration" => 150, "timeout" => 20, "log_hex" => false },
        );
        dispatch(&mut ctx, &call).await.unwrap();
        assert_eq!(ctx.var("last_stream_rx"), Some(&Value::from("T=21.5")));
        assert_eq!(ctx.var("last_stream_rx_raw"), Some(&Value::from("543D32312E350A")));
    }
}

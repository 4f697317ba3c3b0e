//! [`SendFrameAction`] and [`ExpectFrameAction`]: schema-described binary
//! frames.
//!
//! Script syntax:
//! ```yaml
//! - action: send_frame
//!   args: {schema: proto.yaml, frame: get_temp, values: {channel: "$ch"}}
//! - action: expect_frame
//!   args: {schema: proto.yaml, frame: temp_reply, timeout: 500, save_as: reply}
//! ```

use crate::action::{Action, Args, Schema, TypeSpec};
use crate::channel::Channel;
use crate::context::RuntimeContext;
use crate::error::{Error, Result};
use crate::value::{Value, to_hex};
use crate::value_map;
use async_trait::async_trait;

/// Encodes `frame` from `values` and writes it.
///
/// Records `{frame, values, hex}` in `last_frame_tx`.
pub struct SendFrameAction {
    schema: Schema,
}

impl SendFrameAction {
    pub const NAME: &'static str = "send_frame";

    pub fn new() -> Self {
        Self {
            schema: Schema::new()
                .required("schema")
                .required("frame")
                .optional("values", Value::Null)
                .optional("channel", Value::Null)
                .typed("schema", TypeSpec::String)
                .typed("frame", TypeSpec::String)
                .typed("values", TypeSpec::Mapping)
                .typed("channel", TypeSpec::String),
        }
    }
}

impl Default for SendFrameAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Action for SendFrameAction {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn execute(&self, ctx: &mut RuntimeContext, args: Args) -> Result<Value> {
        let schema = ctx.schema(&args.string("schema")?)?;
        let frame = args.string("frame")?;
        let values = args.map("values")?;
        let packet = schema.build(&frame, &values)?;

        let channel = args.opt_string("channel")?;
        ctx.write(channel.as_deref(), &packet).await?;
        ctx.set_var(
            "last_frame_tx",
            value_map! { "frame" => frame, "values" => values, "hex" => to_hex(&packet) },
        );
        Ok(Value::Bytes(packet))
    }
}

/// Reads one `frame` within `timeout` and stores its decoded fields in
/// `save_as` (default `last_frame_rx`) and the raw bytes as hex in
/// `last_frame_rx_raw`.
///
/// The frame must end with a tail or have a fixed length. A partial or
/// missing frame is a timeout; a complete one that fails to decode is a
/// protocol error.
pub struct ExpectFrameAction {
    schema: Schema,
}

impl ExpectFrameAction {
    pub const NAME: &'static str = "expect_frame";

    pub fn new() -> Self {
        Self {
            schema: Schema::new()
                .required("schema")
                .required("frame")
                .optional("timeout", 2000)
                .optional("save_as", "last_frame_rx")
                .optional("channel", Value::Null)
                .typed("schema", TypeSpec::String)
                .typed("frame", TypeSpec::String)
                .typed("timeout", TypeSpec::Duration)
                .typed("save_as", TypeSpec::String)
                .typed("channel", TypeSpec::String),
        }
    }
}

impl Default for ExpectFrameAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Action for ExpectFrameAction {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn execute(&self, ctx: &mut RuntimeContext, args: Args) -> Result<Value> {
        let schema = ctx.schema(&args.string("schema")?)?;
        let name = args.string("frame")?;
        let timeout = args.duration("timeout")?;
        let frame = schema.frame(&name)?;
        frame.ensure_receivable()?;

        let channel = args.opt_string("channel")?;
        let mut tap = ctx.tap(channel.as_deref())?;
        let data = if frame.tail.is_empty() {
            let len = frame
                .fixed_length()
                .ok_or_else(|| Error::UnmatchableFrame(name.clone()))?;
            let data = tap.read_exact(len, timeout).await?;
            (data.len() == len).then_some(data)
        } else {
            let data = tap.read_until(&frame.tail, timeout).await?;
            data.ends_with(&frame.tail).then_some(data)
        };
        let data = data.ok_or_else(|| Error::timeout(format!("frame '{}'", name), timeout))?;

        let parsed = frame.parse(&data)?;
        ctx.set_var(args.string("save_as")?, parsed.clone());
        ctx.set_var("last_frame_rx_raw", to_hex(&data));
        Ok(Value::Map(parsed))
    }
}

//! [`SendTextAction`]: writes text or bytes to a channel.
//!
//! Script syntax: `- action: send_text` with `args: {text: "AT", append_cr: true}`

use crate::action::{Action, Args, Schema, TypeSpec};
use crate::context::RuntimeContext;
use crate::error::Result;
use crate::value::{Value, ValueKind};
use crate::value_map;
use async_trait::async_trait;

/// Writes `text` to `channel` (default: the active channel), optionally
/// followed by CR and/or LF. Bytes values are written as-is.
pub struct SendTextAction {
    schema: Schema,
}

impl SendTextAction {
    pub const NAME: &'static str = "send_text";

    pub fn new() -> Self {
        Self {
            schema: Schema::new()
                .alias("data", "text")
                .optional("text", "")
                .optional("append_cr", false)
                .optional("append_lf", false)
                .optional("channel", Value::Null)
                .typed(
                    "text",
                    TypeSpec::OneOf(&[
                        ValueKind::Str,
                        ValueKind::Bytes,
                        ValueKind::Int,
                        ValueKind::Float,
                    ]),
                )
                .typed("append_cr", TypeSpec::Bool)
                .typed("append_lf", TypeSpec::Bool)
                .typed("channel", TypeSpec::String),
        }
    }
}

impl Default for SendTextAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Action for SendTextAction {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn execute(&self, ctx: &mut RuntimeContext, args: Args) -> Result<Value> {
        let text = args.get("text").cloned().unwrap_or(Value::from(""));
        let mut payload = match &text {
            Value::Bytes(b) => b.clone(),
            other => other.to_string().into_bytes(),
        };
        let append_cr = args.bool("append_cr")?;
        let append_lf = args.bool("append_lf")?;
        if append_cr {
            payload.push(b'\r');
        }
        if append_lf {
            payload.push(b'\n');
        }

        let channel = args.opt_string("channel")?;
        ctx.write(channel.as_deref(), &payload).await?;
        Ok(Value::Map(value_map! {
            "text" => text,
            "append_cr" => append_cr,
            "append_lf" => append_lf,
        }))
    }
}

//! [`LogAction`]: writes a message to the run log.
//!
//! Script syntax: `- log: "voltage is ${volts} V"`

use crate::action::{Action, Args, Schema, TypeSpec};
use crate::context::RuntimeContext;
use crate::error::{Error, Result};
use crate::expression;
use crate::value::{Value, ValueKind};
use async_trait::async_trait;
use tracing::info;

/// Logs `message` at info level under the `devscript::script` target and
/// reports it as [`RunEvent::Log`](crate::event::RunEvent::Log).
///
/// A message that is a whole expression (`"$count * 2"`) logs its value;
/// any other message containing `$` is interpolated.
pub struct LogAction {
    schema: Schema,
}

impl LogAction {
    pub const NAME: &'static str = "log";

    pub fn new() -> Self {
        Self {
            schema: Schema::new()
                .alias("msg", "message")
                .optional("message", "")
                .raw("message")
                .typed(
                    "message",
                    TypeSpec::OneOf(&[
                        ValueKind::Str,
                        ValueKind::Int,
                        ValueKind::Float,
                        ValueKind::Bool,
                        ValueKind::Bytes,
                    ]),
                ),
        }
    }

    fn render(ctx: &RuntimeContext, message: &Value) -> Result<String> {
        let Value::Str(text) = message else {
            return Ok(message.to_string());
        };
        if !expression::is_expression(text) {
            return Ok(text.clone());
        }
        match ctx.eval_value(message) {
            Ok(value) => Ok(value.to_string()),
            Err(Error::UnsupportedExpression { .. }) => ctx.interpolate(text),
            Err(e) => Err(e),
        }
    }
}

impl Default for LogAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Action for LogAction {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn execute(&self, ctx: &mut RuntimeContext, args: Args) -> Result<Value> {
        let message = match args.get("message") {
            Some(value) => Self::render(ctx, value)?,
            None => String::new(),
        };
        info!(target: "devscript::script", "{}", message);
        ctx.log(message.clone());
        Ok(Value::Str(message))
    }
}

//! [`IfAction`] and [`UseChannelAction`]: flow and channel selection inside
//! a state.
//!
//! Script syntax:
//! ```yaml
//! - if:
//!     when: "$retries < 3"
//!     then: [{set: {retries: "$retries + 1"}}]
//!     else: [{log: giving up}]
//! - if: {cond: "$ok", do: [{log: fine}], otherwise: [{log: broken}]}
//! - action: use_channel
//!   args: {name: plc}
//! ```

use crate::action::{Action, Args, Schema, TypeSpec, dispatch};
use crate::context::RuntimeContext;
use crate::error::{Error, Result};
use crate::script::branch;
use crate::value::{Value, ValueKind};
use async_trait::async_trait;
use tracing::debug;

/// Runs the `then` or the `else` list depending on `when`.
///
/// `when` (also `cond` or `condition`) is an expression string (bare names allowed) or a literal. The
/// branches are dispatched like any other action, so they may nest. `do` and
/// `otherwise` are accepted for `then` and `else`.
pub struct IfAction {
    schema: Schema,
}

impl IfAction {
    pub const NAME: &'static str = "if";

    pub fn new() -> Self {
        Self {
            schema: Schema::new()
                .alias("cond", "when")
                .alias("condition", "when")
                .alias("do", "then")
                .alias("otherwise", "else")
                .required("when")
                .optional("then", Value::Null)
                .optional("else", Value::Null)
                .raw("when")
                .raw("then")
                .raw("else")
                .typed(
                    "when",
                    TypeSpec::OneOf(&[ValueKind::Str, ValueKind::Bool, ValueKind::Int]),
                ),
        }
    }
}

impl Default for IfAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Action for IfAction {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn execute(&self, ctx: &mut RuntimeContext, args: Args) -> Result<Value> {
        let taken = match args.get("when") {
            Some(Value::Str(expr)) => ctx.eval_condition(expr)?,
            Some(other) => other.is_truthy(),
            None => false,
        };
        let key = if taken { "then" } else { "else" };
        let calls = branch(&args.into_map(), key)?;
        debug!(taken, count = calls.len(), "Running if branch");
        for call in &calls {
            if ctx.is_stopped() {
                return Err(Error::Stopped);
            }
            dispatch(ctx, call).await?;
        }
        Ok(Value::Bool(taken))
    }
}

/// Makes `name` the active channel for later actions and event waits.
pub struct UseChannelAction {
    schema: Schema,
}

impl UseChannelAction {
    pub const NAME: &'static str = "use_channel";

    pub fn new() -> Self {
        Self {
            schema: Schema::new()
                .alias("channel", "name")
                .required("name")
                .typed("name", TypeSpec::String),
        }
    }
}

impl Default for UseChannelAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Action for UseChannelAction {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn execute(&self, ctx: &mut RuntimeContext, args: Args) -> Result<Value> {
        let name = args.string("name")?;
        ctx.set_active(&name)?;
        Ok(Value::Str(name))
    }
}

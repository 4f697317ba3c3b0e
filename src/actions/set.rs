//! [`SetAction`]: assigns script variables.
//!
//! Script syntax: `- set: {count: 0, limit: "$base * 2"}`

use crate::action::{Action, Args, Schema};
use crate::context::RuntimeContext;
use crate::error::Result;
use crate::value::Value;
use async_trait::async_trait;

/// Assigns every argument to the variable of the same name.
///
/// Values are evaluated against the variables as they were before the
/// action ran, so `{a: 1, b: "$a"}` reads the previous `a`.
pub struct SetAction {
    schema: Schema,
}

impl SetAction {
    pub const NAME: &'static str = "set";

    pub fn new() -> Self {
        Self {
            schema: Schema::new().allow_extra(),
        }
    }
}

impl Default for SetAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Action for SetAction {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn execute(&self, ctx: &mut RuntimeContext, args: Args) -> Result<Value> {
        for (key, value) in args.into_map() {
            ctx.set_var(key, value);
        }
        Ok(Value::Map(ctx.vars_snapshot()))
    }
}

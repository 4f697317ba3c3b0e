//! [`WaitAction`] and [`WaitForEventAction`]: pause the run.
//!
//! Script syntax:
//! - `- wait: 500` (milliseconds)
//! - `- wait_for_event: {event: READY, timeout: 2s}`

use crate::action::{Action, Args, Schema, TypeSpec};
use crate::context::RuntimeContext;
use crate::error::{Error, Result};
use crate::value::Value;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

/// Event poll tick of `wait_for_event`.
const EVENT_POLL: Duration = Duration::from_millis(100);

/// Pauses for `ms`. Interrupted by a stop request.
pub struct WaitAction {
    schema: Schema,
}

impl WaitAction {
    pub const NAME: &'static str = "wait";

    pub fn new() -> Self {
        Self {
            schema: Schema::new()
                .alias("duration", "ms")
                .optional("ms", 0)
                .typed("ms", TypeSpec::Duration),
        }
    }
}

impl Default for WaitAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Action for WaitAction {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn execute(&self, ctx: &mut RuntimeContext, args: Args) -> Result<Value> {
        ctx.sleep(args.duration("ms")?).await?;
        Ok(Value::Null)
    }
}

/// Waits up to `timeout` for `event`, or for any event when none is named.
///
/// Returns the matching label and stores it in `event`, or null on timeout.
/// Non-matching events are consumed.
pub struct WaitForEventAction {
    schema: Schema,
}

impl WaitForEventAction {
    pub const NAME: &'static str = "wait_for_event";

    pub fn new() -> Self {
        Self {
            schema: Schema::new()
                .optional("event", Value::Null)
                .optional("timeout", 1000)
                .typed("event", TypeSpec::String)
                .typed("timeout", TypeSpec::Duration),
        }
    }
}

impl Default for WaitForEventAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Action for WaitForEventAction {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn execute(&self, ctx: &mut RuntimeContext, args: Args) -> Result<Value> {
        let expected = args.opt_string("event")?;
        let timeout = args.duration("timeout")?;
        let deadline = Instant::now() + timeout;
        loop {
            if ctx.is_stopped() {
                return Err(Error::Stopped);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Value::Null);
            }
            let Some(label) = ctx.next_event(remaining.min(EVENT_POLL)).await? else {
                continue;
            };
            if expected.as_deref().is_none_or(|e| e == label) {
                ctx.set_var("event", label.clone());
                return Ok(Value::Str(label));
            }
        }
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
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_wait_accepts_duration_strings() {
        let (mut ctx, _, _) = mock_context(&[], value_map! {});
        let start = Instant::now();
        dispatch(&mut ctx, &ActionCall::new("wait", value_map! { "ms" => "30ms" }))
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_wait_is_interrupted_by_stop() {
        let (mut ctx, _, _) = mock_context(&[], value_map! {});
        ctx.stop_handle().stop();
        let err = dispatch(&mut ctx, &ActionCall::new("wait", value_map! { "ms" => 10_000 }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Stopped));
    }

    #[tokio::test]
    async fn test_wait_for_named_event_skips_others() {
        let (mut ctx, handles, sender) = mock_context(&["dut"], value_map! {});
        sender.send("noise");
        handles[0].push(b"G");
        let call = ActionCall::new("wait_for_event", value_map! { "event" => "G", "timeout" => 500 });
        let got = dispatch(&mut ctx, &call).await.unwrap();
        assert_eq!(got, Value::from("G"));
        assert_eq!(ctx.var("event"), Some(&Value::from("G")));
    }

    #[tokio::test]
    async fn test_wait_for_event_times_out_with_null() {
        let (mut ctx, _, _) = mock_context(&["dut"], value_map! {});
        let call = ActionCall::new("wait_for_event", value_map! { "timeout" => 50 });
        assert_eq!(dispatch(&mut ctx, &call).await.unwrap(), Value::Null);
    }
}

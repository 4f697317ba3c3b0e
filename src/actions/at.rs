//! [`AtCommandAction`] and [`ScpiCommandAction`]: line-oriented command
//! exchanges.

use crate::action::{Action, Args, Schema, TypeSpec};
use crate::context::RuntimeContext;
use crate::error::Result;
use crate::protocol::at::{AtCommand, ScpiCommand, at_command, scpi_command};
use crate::value::Value;
use crate::value_map;
use async_trait::async_trait;

/// Sends an AT command and collects the response lines.
///
/// Stores `{lines, status}` in `last_at_response` and in `save_as` when
/// given. An `ERROR` reply or a missing final result code fails the action.
pub struct AtCommandAction {
    schema: Schema,
}

impl AtCommandAction {
    pub const NAME: &'static str = "at_command";

    pub fn new() -> Self {
        Self {
            schema: Schema::new()
                .alias("command", "cmd")
                .required("cmd")
                .optional("channel", Value::Null)
                .optional("timeout", 2000)
                .optional("terminator", "\r\n")
                .optional("ok", "OK")
                .optional("error", "ERROR")
                .optional("echo", true)
                .optional("save_as", Value::Null)
                .typed("cmd", TypeSpec::String)
                .typed("channel", TypeSpec::String)
                .typed("timeout", TypeSpec::Duration)
                .typed("terminator", TypeSpec::String)
                .typed("ok", TypeSpec::String)
                .typed("error", TypeSpec::String)
                .typed("echo", TypeSpec::Bool)
                .typed("save_as", TypeSpec::String),
        }
    }
}

impl Default for AtCommandAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Action for AtCommandAction {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn execute(&self, ctx: &mut RuntimeContext, args: Args) -> Result<Value> {
        let request = AtCommand {
            cmd: args.string("cmd")?,
            terminator: args.string("terminator")?,
            ok: args.string("ok")?,
            error: args.string("error")?,
            echo: args.bool("echo")?,
            timeout: args.duration("timeout")?,
        };
        let channel = args.opt_string("channel")?;
        let reply = at_command(&mut ctx.tap(channel.as_deref())?, &request).await?;

        let lines = reply.lines.into_iter().map(Value::from).collect::<Vec<_>>();
        let result = Value::Map(value_map! {
            "lines" => lines,
            "status" => reply.status,
        });
        ctx.set_var("last_at_response", result.clone());
        if let Some(name) = args.opt_string("save_as")? {
            ctx.set_var(name, result.clone());
        }
        Ok(result)
    }
}

/// Sends a SCPI command; queries (or `expect_response: true`) read one
/// response line into `last_scpi_response` and `save_as`.
pub struct ScpiCommandAction {
    schema: Schema,
}

impl ScpiCommandAction {
    pub const NAME: &'static str = "scpi_command";

    pub fn new() -> Self {
        Self {
            schema: Schema::new()
                .alias("command", "cmd")
                .required("cmd")
                .optional("channel", Value::Null)
                .optional("timeout", 2000)
                .optional("terminator", "\n")
                .optional("expect_response", Value::Null)
                .optional("strip", true)
                .optional("save_as", Value::Null)
                .typed("cmd", TypeSpec::String)
                .typed("channel", TypeSpec::String)
                .typed("timeout", TypeSpec::Duration)
                .typed("terminator", TypeSpec::String)
                .typed("expect_response", TypeSpec::Bool)
                .typed("strip", TypeSpec::Bool)
                .typed("save_as", TypeSpec::String),
        }
    }
}

impl Default for ScpiCommandAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Action for ScpiCommandAction {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn execute(&self, ctx: &mut RuntimeContext, args: Args) -> Result<Value> {
        let expect_response = if args.contains("expect_response") {
            Some(args.bool("expect_response")?)
        } else {
            None
        };
        let request = ScpiCommand {
            cmd: args.string("cmd")?,
            terminator: args.string("terminator")?,
            expect_response,
            strip: args.bool("strip")?,
            timeout: args.duration("timeout")?,
        };
        let channel = args.opt_string("channel")?;
        let response = scpi_command(&mut ctx.tap(channel.as_deref())?, &request).await?;

        let result = Value::from(response);
        if !result.is_null() {
            ctx.set_var("last_scpi_response", result.clone());
            if let Some(name) = args.opt_string("save_as")? {
                ctx.set_var(name, result.clone());
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use crate::action::dispatch;
    use crate::context::testing::mock_context;
    use crate::error::ErrorKind;
    use crate::script::ActionCall;
    use crate::value::Value;
    use crate::value_map;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_at_command_saves_response() {
        let (mut ctx, handles, _) = mock_context(&["modem"], value_map! {});
        handles[0].respond_with(|req| {
            (req == b"AT+CSQ\r\n").then(|| b"AT+CSQ\r\n+CSQ: 23,99\r\nOK\r\n".to_vec())
        });
        let call = ActionCall::new(
            "at_command",
            value_map! { "command" => "AT+CSQ", "save_as" => "csq", "timeout" => 300 },
        );
        dispatch(&mut ctx, &call).await.unwrap();
        let saved = ctx.var("csq").and_then(Value::as_map).unwrap();
        assert_eq!(saved["lines"], Value::List(vec![Value::from("+CSQ: 23,99")]));
        assert_eq!(ctx.var("last_at_response"), ctx.var("csq"));
    }

    #[tokio::test]
    async fn test_stop_interrupts_silent_at_command() {
        let (mut ctx, handles, _) = mock_context(&["modem"], value_map! {});
        let stop = ctx.stop_handle().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stop.stop();
        });
        let call = ActionCall::new("at_command", value_map! { "cmd" => "AT", "timeout" => 3000 });
        let start = Instant::now();
        let err = dispatch(&mut ctx, &call).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Stopped, "got: {err}");
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(handles[0].written(), b"AT\r\n");
    }

    #[tokio::test]
    async fn test_at_command_error_reply() {
        let (mut ctx, handles, _) = mock_context(&["modem"], value_map! {});
        handles[0].respond_with(|_| Some(b"ERROR\r\n".to_vec()));
        let call = ActionCall::new("at_command", value_map! { "cmd" => "AT+BOGUS" });
        let err = dispatch(&mut ctx, &call).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn test_scpi_query() {
        let (mut ctx, handles, _) = mock_context(&["psu"], value_map! {});
        handles[0].respond_with(|req| (req == b"MEAS:VOLT? 2\n").then(|| b"3.300\n".to_vec()));
        let call = ActionCall::new(
            "scpi_command",
            value_map! { "cmd" => "MEAS:VOLT? 2", "save_as" => "volts" },
        );
        let got = dispatch(&mut ctx, &call).await.unwrap();
        assert_eq!(got, Value::from("3.300"));
        assert_eq!(ctx.var("volts"), Some(&Value::from("3.300")));
    }
}

//! [`ModbusAction`]: `modbus_read` and `modbus_write`.
//!
//! Script syntax:
//! ```yaml
//! - action: modbus_read
//!   args: {protocol: rtu, function: 3, address: 0x10, quantity: 2, save_as: regs}
//! - action: modbus_write
//!   args: {function: 16, address: 0x20, values: [1, "$setpoint"]}
//! ```

use crate::action::{Action, Args, Schema, TypeSpec};
use crate::context::RuntimeContext;
use crate::error::{Error, Result};
use crate::protocol::modbus::{Options, Request, Variant, transact};
use crate::value::{Value, ValueKind};
use async_trait::async_trait;
use std::time::Duration;

const READ_FUNCTIONS: &[u8] = &[1, 2, 3, 4];
const WRITE_FUNCTIONS: &[u8] = &[5, 6, 15, 16];

/// One Modbus request/response exchange over the active or named channel.
///
/// The decoded response is stored in `last_modbus` and in `save_as` when
/// given. RTU and ASCII re-send on timeout or checksum failure up to
/// `retries` times; TCP makes one attempt.
pub struct ModbusAction {
    name: &'static str,
    functions: &'static [u8],
    schema: Schema,
}

impl ModbusAction {
    pub const READ_NAME: &'static str = "modbus_read";
    pub const WRITE_NAME: &'static str = "modbus_write";

    pub fn read() -> Self {
        Self::with(Self::READ_NAME, READ_FUNCTIONS)
    }

    pub fn write() -> Self {
        Self::with(Self::WRITE_NAME, WRITE_FUNCTIONS)
    }

    fn with(name: &'static str, functions: &'static [u8]) -> Self {
        let schema = Schema::new()
            .required("function")
            .required("address")
            .optional("protocol", "rtu")
            .optional("channel", Value::Null)
            .optional("quantity", Value::Null)
            .optional("values", Value::Null)
            .optional("value", Value::Null)
            .optional("unit_id", 1)
            .optional("timeout", Value::Null)
            .optional("retries", 3)
            .optional("save_as", Value::Null)
            .typed("function", TypeSpec::Integer)
            .typed("address", TypeSpec::Integer)
            .typed("protocol", TypeSpec::String)
            .typed("channel", TypeSpec::String)
            .typed("quantity", TypeSpec::Integer)
            .typed(
                "values",
                TypeSpec::OneOf(&[
                    ValueKind::List,
                    ValueKind::Int,
                    ValueKind::Bool,
                    ValueKind::Bytes,
                ]),
            )
            .typed("value", TypeSpec::OneOf(&[ValueKind::Int, ValueKind::Bool]))
            .typed("unit_id", TypeSpec::Integer)
            .typed("timeout", TypeSpec::Duration)
            .typed("retries", TypeSpec::Integer)
            .typed("save_as", TypeSpec::String);
        Self {
            name,
            functions,
            schema,
        }
    }

    fn request(&self, args: &Args) -> Result<Request> {
        let function: u8 = args.int_in("function", 1..=127)?;
        if !self.functions.contains(&function) {
            return Err(Error::invalid(
                "function",
                format!("{} does not support function code {}", self.name, function),
            ));
        }
        let values = register_values(args)?;
        let quantity = match args.opt_int("quantity")? {
            Some(_) => args.int_in("quantity", 1..=2000)?,
            None => values.len().max(1) as u16,
        };
        Ok(Request {
            unit_id: args.int_in("unit_id", 0..=255)?,
            function,
            address: args.int_in("address", 0..=0xFFFF)?,
            quantity,
            values,
        })
    }
}

/// `values` (list, scalar or bytes) or else `value`, as 16-bit words.
fn register_values(args: &Args) -> Result<Vec<u16>> {
    let key = if args.contains("values") { "values" } else { "value" };
    let items = match args.get(key) {
        None => return Ok(Vec::new()),
        Some(Value::List(items)) => items.clone(),
        Some(Value::Bytes(bytes)) => bytes.iter().map(|b| Value::from(*b)).collect(),
        Some(scalar) => vec![scalar.clone()],
    };
    items
        .iter()
        .map(|item| {
            item.as_i64()
                .and_then(|n| u16::try_from(n).ok())
                .ok_or_else(|| Error::invalid(key, format!("{} is not a 16-bit value", item)))
        })
        .collect()
}

#[async_trait]
impl Action for ModbusAction {
    fn name(&self) -> &'static str {
        self.name
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn execute(&self, ctx: &mut RuntimeContext, args: Args) -> Result<Value> {
        let variant = Variant::parse(&args.string("protocol")?)?;
        let request = self.request(&args)?;
        let timeout = if args.contains("timeout") {
            args.duration("timeout")?
        } else if variant == Variant::Tcp {
            Duration::from_millis(2000)
        } else {
            Duration::from_millis(1000)
        };
        let options = Options {
            variant,
            timeout,
            retries: args.int_in("retries", 0..=100)?,
        };

        let transaction_id = ctx.next_transaction_id();
        let channel = args.opt_string("channel")?;
        let mut result = transact(
            &mut ctx.tap(channel.as_deref())?,
            &request,
            &options,
            transaction_id,
        )
        .await?;

        if let Value::Map(map) = &mut result {
            map.insert("unit_id".into(), Value::from(request.unit_id));
            map.insert("protocol".into(), Value::from(args.string("protocol")?.to_lowercase()));
        }
        ctx.set_var("last_modbus", result.clone());
        if let Some(name) = args.opt_string("save_as")? {
            ctx.set_var(name, result.clone());
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use crate::action::dispatch;
    use crate::context::testing::mock_context;
    use crate::error::{Error, ErrorKind};
    use crate::protocol::crc::crc16_modbus;
    use crate::script::ActionCall;
    use crate::value::Value;
    use crate::value_map;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_rtu_read_retries_then_times_out() {
        let (mut ctx, handles, _) = mock_context(&["bus"], value_map! {});
        let call = ActionCall::new(
            "modbus_read",
            value_map! {
                "function" => 3,
                "address" => 0,
                "quantity" => 1,
                "retries" => 2,
                "timeout" => 40,
            },
        );
        let err = dispatch(&mut ctx, &call).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(handles[0].write_count(), 3);
        assert!(ctx.var("last_modbus").is_none());
    }

    #[tokio::test]
    async fn test_stop_interrupts_retry_loop() {
        let (mut ctx, handles, _) = mock_context(&["bus"], value_map! {});
        let stop = ctx.stop_handle().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(230)).await;
            stop.stop();
        });
        let call = ActionCall::new(
            "modbus_read",
            value_map! {
                "function" => 3,
                "address" => 0,
                "quantity" => 1,
                "retries" => 5,
                "timeout" => 100,
            },
        );
        let start = Instant::now();
        let err = dispatch(&mut ctx, &call).await.unwrap_err();
        assert!(matches!(err, Error::Stopped), "got: {err}");
        assert!(start.elapsed() < Duration::from_millis(600));
        let writes = handles[0].write_count();
        assert!((2..6).contains(&writes), "{writes} writes");
    }

    #[tokio::test]
    async fn test_write_single_register() {
        let (mut ctx, handles, _) = mock_context(&["bus"], value_map! { "sp" => 250 });
        handles[0].respond_with(|req| Some(req.to_vec()));
        let call = ActionCall::new(
            "modbus_write",
            value_map! { "function" => 6, "address" => 1, "value" => "$sp", "save_as" => "ack" },
        );
        dispatch(&mut ctx, &call).await.unwrap();

        let mut expected = vec![0x01, 0x06, 0x00, 0x01, 0x00, 0xFA];
        expected.extend(crc16_modbus(&expected).to_le_bytes());
        assert_eq!(handles[0].written(), expected);
        let ack = ctx.var("ack").and_then(Value::as_map).unwrap();
        assert_eq!(ack["value"], Value::Int(250));
        assert_eq!(ack["protocol"], Value::from("rtu"));
    }

    #[tokio::test]
    async fn test_function_must_match_direction() {
        let (mut ctx, handles, _) = mock_context(&["bus"], value_map! {});
        let call = ActionCall::new("modbus_read", value_map! { "function" => 6, "address" => 0 });
        let err = dispatch(&mut ctx, &call).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { ref arg, .. } if arg == "function"));
        assert_eq!(handles[0].write_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_protocol() {
        let (mut ctx, _, _) = mock_context(&["bus"], value_map! {});
        let call = ActionCall::new(
            "modbus_read",
            value_map! { "function" => 3, "address" => 0, "protocol" => "canbus" },
        );
        let err = dispatch(&mut ctx, &call).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}

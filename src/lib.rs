//! # devscript
//!
//! A state-machine scripting engine for automating tests of serial and
//! TCP-attached devices.
//!
//! A script is a YAML document declaring channels, variables and a state
//! machine. Each state runs a list of actions (send bytes, read lines, talk
//! AT, SCPI or Modbus, push firmware over XMODEM, encode and match binary
//! frames) and then moves on by `goto`, by an incoming event or by timeout.
//!
//! ## Quick start
//!
//! ```no_run
//! use devscript::{Executor, parse_str};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let script = parse_str(r#"
//! channels:
//!   modem: {type: serial, device: /dev/ttyUSB0, baud: 115200}
//! state_machine:
//!   initial: probe
//!   states:
//!     probe:
//!       do:
//!         - action: at_command
//!           args: {cmd: ATI, save_as: info}
//!         - log: "modem says ${info.lines}"
//! "#)?;
//!
//!     let mut executor = Executor::connect(script).await?;
//!     executor.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Script syntax
//!
//! | `do` item | Description |
//! |-----------|-------------|
//! | `set: {name: expr}` | Assign variables |
//! | `log: "text $var"` | Log a message or the value of an expression |
//! | `wait: 500` | Pause (`ms` number or `500ms`/`1.5s` string) |
//! | `wait_for_event: label` | Wait for an event, optionally with a timeout |
//! | `if: {when, then, else}` | Run one of two nested action lists |
//! | `action: name` + `args` | Any registered action, e.g. `modbus_read` |
//!
//! State keys: `do`, `when`, `goto`, `else_goto`, `on_event`, `timeout`,
//! `on_timeout`. A state with no `goto`, `on_event` or `timeout` ends the
//! run.
//!
//! ## Watching a run
//!
//! [`Executor::on_event`] receives a [`RunEvent`] for every state change,
//! log line and chunk of channel traffic. [`Executor::event_sender`] injects
//! event labels and [`Executor::stop_handle`] cancels the run from another
//! task.
//!
//! ## Implementing a custom action
//!
//! ```no_run
//! use devscript::action::{Action, ActionRegistry, Args, Schema, TypeSpec};
//! use devscript::{Result, RuntimeContext, Value};
//! use async_trait::async_trait;
//!
//! pub struct Beep {
//!     schema: Schema,
//! }
//!
//! impl Beep {
//!     pub const NAME: &'static str = "beep";
//!
//!     pub fn new() -> Self {
//!         Self {
//!             schema: Schema::new().optional("count", 1).typed("count", TypeSpec::Integer),
//!         }
//!     }
//! }
//!
//! #[async_trait]
//! impl Action for Beep {
//!     fn name(&self) -> &'static str { Self::NAME }
//!
//!     fn schema(&self) -> &Schema { &self.schema }
//!
//!     async fn execute(&self, ctx: &mut RuntimeContext, args: Args) -> Result<Value> {
//!         let count = args.int_in::<usize>("count", 1..=16)?;
//!         ctx.write(None, &vec![0x07; count]).await?;
//!         Ok(Value::Null)
//!     }
//! }
//!
//! let mut registry = ActionRegistry::builtin();
//! registry.register(Beep::new());
//! ```

pub mod action;
pub mod actions;
pub mod channel;
pub mod context;
pub mod error;
pub mod event;
pub mod executor;
pub mod expression;
pub mod frame;
pub mod protocol;
pub mod record;
pub mod script;
pub mod value;

pub use action::{Action, ActionRegistry, Schema, TypeSpec};
pub use context::RuntimeContext;
pub use error::{Error, ErrorKind, Result};
pub use event::{EventSender, RunEvent, StopHandle};
pub use executor::{Executor, RunOutcome};
pub use frame::ProtocolSchema;
pub use record::Recorder;
pub use script::{Script, parse_file, parse_str};
pub use value::{Value, ValueMap};

//! Built-in actions, one module per family.

mod at;
mod control;
mod data;
mod frame;
mod log;
mod modbus;
mod read;
mod record;
mod send_text;
mod set;
mod wait;
mod xmodem;

pub use at::{AtCommandAction, ScpiCommandAction};
pub use control::{IfAction, UseChannelAction};
pub use data::{ListFilterAction, ListMapAction};
pub use frame::{ExpectFrameAction, SendFrameAction};
pub use log::LogAction;
pub use modbus::ModbusAction;
pub use read::{ReadLineAction, ReadStreamAction};
pub use record::{DEFAULT_RECORD_DIR, RecordStartAction, RecordStopAction};
pub use send_text::SendTextAction;
pub use set::SetAction;
pub use wait::{WaitAction, WaitForEventAction};
pub use xmodem::{FileTransferAction, SendEotAction, SendXmodemBlockAction};

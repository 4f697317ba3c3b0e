//! Protocol drivers built on top of [`Channel`](crate::channel::Channel).

pub mod at;
pub mod crc;
pub mod modbus;
pub mod xmodem;

//! Checksums used by the frame codec and the protocol drivers.

use crc::{CRC_8_SMBUS, CRC_16_MODBUS, CRC_16_XMODEM, Crc};

const MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);
const XMODEM: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);
// Poly 0x07, init 0, no reflection.
const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);

/// CRC-16/Modbus. Transmitted little-endian.
pub fn crc16_modbus(data: &[u8]) -> u16 {
    MODBUS.checksum(data)
}

/// CRC-16/XMODEM. Transmitted big-endian.
pub fn crc16_xmodem(data: &[u8]) -> u16 {
    XMODEM.checksum(data)
}

pub fn crc8(data: &[u8]) -> u8 {
    CRC8.checksum(data)
}

/// Modbus ASCII longitudinal redundancy check: two's complement of the byte sum.
pub fn lrc(data: &[u8]) -> u8 {
    data.iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b))
        .wrapping_neg()
}

/// 8-bit arithmetic checksum used by classic XMODEM.
pub fn sum8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

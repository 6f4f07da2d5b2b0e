//! Modbus application-layer framing: MBAP (TCP) and RTU, plus the function
//! code constants both share. Grounded in
//! `raffber-comsrv/comsrv/src/modbus/mod.rs::function_codes`.

pub mod crc;
pub mod rtu;
pub mod tcp;

/// Modbus function codes this crate frames. FC 0x01-0x04 are the read
/// operations spec.md requires; 0x05/0x06/0x0F/0x10 are the supplemented
/// write operations built on the same framing machinery.
pub mod function_codes {
    pub const READ_COILS: u8 = 0x01;
    pub const READ_DISCRETE_INPUTS: u8 = 0x02;
    pub const READ_HOLDING_REGISTERS: u8 = 0x03;
    pub const READ_INPUT_REGISTERS: u8 = 0x04;
    pub const WRITE_SINGLE_COIL: u8 = 0x05;
    pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
    pub const WRITE_MULTIPLE_COILS: u8 = 0x0F;
    pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
}

/// Exception response bit: a device signals a Modbus exception by setting
/// the high bit of the echoed function code.
pub const EXCEPTION_BIT: u8 = 0x80;

/// Whether `pdu` (function code byte first) represents a Modbus exception
/// response. Not part of the mandatory contract: `send_raw`/`send` always
/// return the raw bytes unmodified, this is an opt-in convenience for
/// callers who don't want to inspect the high bit themselves.
pub fn is_exception(pdu: &[u8]) -> bool {
    match pdu.first() {
        Some(fc) => fc & EXCEPTION_BIT != 0,
        None => false,
    }
}

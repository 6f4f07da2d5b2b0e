//! Modbus RTU framing: `SlaveID(1) | FC(1) | PDU(...) | CRC(2, little-endian)`.
//!
//! Grounded in `raffber-comsrv/comsrv/src/modbus/rtu.rs`, with the CRC
//! computation itself factored out into `codec::crc`.

use crate::codec::crc;

/// Builds an RTU request frame for function codes 0x01-0x04
/// (`FC | Address(2) | Quantity(2)` PDU), appending the CRC.
pub fn build_request(slave_id: u8, fc: u8, addr: u16, qty: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8);
    frame.push(slave_id);
    frame.push(fc);
    frame.extend_from_slice(&addr.to_be_bytes());
    frame.extend_from_slice(&qty.to_be_bytes());
    let crc = crc::crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Builds an RTU request frame wrapping an arbitrary already-assembled PDU
/// (used by the write helpers), appending the CRC.
pub fn build_request_with_pdu(slave_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(2 + pdu.len() + 2);
    frame.push(slave_id);
    frame.extend_from_slice(pdu);
    let crc = crc::crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

//! MBAP (Modbus Application Protocol) framing for Modbus TCP.
//!
//! `TID(2) | PID=0x0000(2) | LEN(2) | UnitID(1) | PDU(...)`, big-endian,
//! where `LEN = 1 + len(PDU)`. Grounded in
//! `raffber-comsrv/comsrv/src/modbus/tcp.rs`, reworked to build/parse plain
//! byte buffers instead of going through a `FunctionCode` trait object,
//! since this crate frames only the small set of function codes spec.md
//! requires.

use crate::error::Error;
use std::sync::atomic::{AtomicU16, Ordering};

pub const MBAP_HEADER_LEN: usize = 7;
/// Sane cap on a declared MBAP length field; real Modbus PDUs never
/// approach this, so anything bigger indicates a corrupted or malicious
/// header.
pub const MAX_FRAME_LEN: usize = 260;

static TRANSACTION_ID: AtomicU16 = AtomicU16::new(0);

/// Allocates the next transaction id. Wait-free, wraps at 2^16 per I5.
pub fn next_transaction_id() -> u16 {
    TRANSACTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Builds a 12-byte MBAP request frame for function codes 0x01-0x04
/// (`FC | Address(2) | Quantity(2)` PDU). Returns the frame and the
/// transaction id it was tagged with.
pub fn build_request(unit_id: u8, fc: u8, addr: u16, qty: u16) -> (Vec<u8>, u16) {
    let tid = next_transaction_id();
    let mut frame = Vec::with_capacity(12);
    frame.extend_from_slice(&tid.to_be_bytes());
    frame.extend_from_slice(&0u16.to_be_bytes()); // protocol id
    frame.extend_from_slice(&6u16.to_be_bytes()); // length: unit + fc + addr + qty
    frame.push(unit_id);
    frame.push(fc);
    frame.extend_from_slice(&addr.to_be_bytes());
    frame.extend_from_slice(&qty.to_be_bytes());
    (frame, tid)
}

/// Builds an MBAP request frame wrapping an arbitrary already-assembled
/// PDU (used by the write helpers, whose payloads vary in length).
pub fn build_request_with_pdu(unit_id: u8, pdu: &[u8]) -> crate::error::Result<(Vec<u8>, u16)> {
    let tid = next_transaction_id();
    let len = 1 + pdu.len();
    if len > u16::MAX as usize {
        return Err(Error::protocol("tcp", "MBAP frame over length"));
    }
    let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + pdu.len());
    frame.extend_from_slice(&tid.to_be_bytes());
    frame.extend_from_slice(&0u16.to_be_bytes());
    frame.extend_from_slice(&(len as u16).to_be_bytes());
    frame.push(unit_id);
    frame.extend_from_slice(pdu);
    Ok((frame, tid))
}

/// Parsed MBAP header, returned by `parse_header` so the device's reader
/// knows how many more bytes to pull off the wire.
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: u8,
}

/// Parses the fixed 7-byte MBAP header. Does not touch the PDU.
pub fn parse_header(device_id: &str, header: &[u8]) -> crate::error::Result<MbapHeader> {
    if header.len() != MBAP_HEADER_LEN {
        return Err(Error::internal(anyhow::anyhow!("MBAP header must be exactly 7 bytes")));
    }
    let transaction_id = u16::from_be_bytes([header[0], header[1]]);
    let protocol_id = u16::from_be_bytes([header[2], header[3]]);
    let length = u16::from_be_bytes([header[4], header[5]]);
    let unit_id = header[6];
    if protocol_id != 0 {
        return Err(Error::protocol(device_id, format!("unexpected protocol id {}", protocol_id)));
    }
    if length == 0 || (length as usize) > MAX_FRAME_LEN {
        return Err(Error::protocol(device_id, format!("implausible MBAP length {}", length)));
    }
    Ok(MbapHeader { transaction_id, protocol_id, length, unit_id })
}

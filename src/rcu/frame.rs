//! Stateless encoding/decoding of the master<->RCU data packet format.
//!
//! Pure functions over already ninth-bit-tagged bytes; no I/O happens here,
//! so the codec is exercised directly by unit tests without a transport.

use crate::rcu::constants::*;
use crate::rcu::error::RcuError;
use itertools::Itertools;

/// A byte tagged with the bus's ninth framing bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameByte {
    /// Ninth bit = 1 (MARK parity): address/control byte.
    Address(u8),
    /// Ninth bit = 0 (SPACE parity): payload byte.
    Data(u8),
}

impl FrameByte {
    /// The raw 8-bit value, regardless of tag.
    pub fn value(self) -> u8 {
        match self {
            FrameByte::Address(v) | FrameByte::Data(v) => v,
        }
    }

    pub fn is_address(self) -> bool {
        matches!(self, FrameByte::Address(_))
    }
}

/// One decoded `(0x00, IDX, VAL...)` group from a packet payload, before
/// registry-driven scaling/bitfield projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamRecord {
    pub index: u8,
    /// Big-endian raw value: `(b0 << 8) | b1` for 2-byte records, `b0` for 1-byte.
    pub raw: u32,
    pub width: u8,
    /// Set when `index` was absent from the registry and `width` was
    /// assumed rather than looked up.
    pub unknown: bool,
}

/// A fully parsed master-originated data packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub sender: u8,
    pub records: Vec<ParamRecord>,
}

/// XOR checksum over `0xC0 ..= last payload byte` (`CHK` itself excluded).
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b)
}

/// Decodes a master data packet from a stream of already-tagged bytes.
///
/// `width_of` looks up the declared byte width (1 or 2) of a parameter
/// index in the registry; it returns `None` for an unknown index, in which
/// case `unknown_width` is assumed instead.
pub fn decode_data_packet(
    bytes: &[FrameByte],
    unknown_width: u8,
    width_of: impl Fn(u8) -> Option<u8>,
) -> Result<DataPacket, RcuError> {
    let mut iter = bytes.iter().copied();

    let lead = iter.next().ok_or_else(|| framing("empty packet"))?;
    expect_data(lead, CMD_DATA)?;

    let zero = iter.next().ok_or_else(|| framing("missing separator"))?;
    expect_data(zero, RECORD_SEPARATOR)?;

    let sender = iter.next().ok_or_else(|| framing("missing sender"))?;
    let sender = expect_data_any(sender)?;
    if sender != MASTER_ADDR {
        return Err(RcuError::Addressing(sender));
    }

    let len = iter.next().ok_or_else(|| framing("missing length"))?;
    let len = expect_data_any(len)? as usize;

    let payload: Vec<u8> = (&mut iter)
        .take(len)
        .map(expect_data_any)
        .collect::<Result<_, _>>()?;
    if payload.len() != len {
        return Err(framing("packet truncated before declared length"));
    }

    let chk = iter.next().ok_or_else(|| framing("missing checksum"))?;
    let chk = expect_data_any(chk)?;

    let mut header_and_payload = vec![CMD_DATA, RECORD_SEPARATOR, sender, len as u8];
    header_and_payload.extend_from_slice(&payload);
    let expected = checksum(&header_and_payload);
    if expected != chk {
        return Err(RcuError::Checksum {
            expected,
            actual: chk,
        });
    }

    let records = parse_payload(&payload, unknown_width, &width_of)?;
    Ok(DataPacket { sender, records })
}

/// Walks the payload's repeated `(0x00, IDX, VAL...)` groups.
fn parse_payload(
    payload: &[u8],
    unknown_width: u8,
    width_of: &impl Fn(u8) -> Option<u8>,
) -> Result<Vec<ParamRecord>, RcuError> {
    let mut records = Vec::new();
    let mut rest = payload;
    while !rest.is_empty() {
        let (sep, tail) = rest
            .split_first()
            .ok_or_else(|| framing("expected separator"))?;
        if *sep != RECORD_SEPARATOR {
            return Err(framing("expected 0x00 record separator"));
        }
        let (&index, tail) = tail.split_first().ok_or_else(|| framing("missing index"))?;
        let (unknown, width) = match width_of(index) {
            Some(w) => (false, w),
            None => (true, unknown_width),
        };
        if tail.len() < width as usize {
            return Err(framing("record truncated"));
        }
        let (value_bytes, tail) = tail.split_at(width as usize);
        let raw = value_bytes
            .iter()
            .fold(0u32, |acc, &b| (acc << 8) | u32::from(b));
        records.push(ParamRecord {
            index,
            raw,
            width,
            unknown,
        });
        rest = tail;
    }
    Ok(records)
}

/// Encodes an RCU-originated single-parameter write packet:
/// `0xC0 00 14 LEN 00 IDX [HI,] LO CHK`.
pub fn encode_write_packet(index: u8, raw: u32, width: u8) -> Vec<u8> {
    encode_data_packet(RCU_ADDR, &[ParamRecord { index, raw, width, unknown: false }])
}

/// Encodes a generic data packet from `sender` and a list of parameter
/// records, producing the exact wire bytes `decode_data_packet` parses
/// (used to verify that encode and decode round-trip each other).
pub fn encode_data_packet(sender: u8, records: &[ParamRecord]) -> Vec<u8> {
    let mut payload = Vec::new();
    for record in records {
        payload.push(RECORD_SEPARATOR);
        payload.push(record.index);
        match record.width {
            1 => payload.push(record.raw as u8),
            2 => {
                payload.push((record.raw >> 8) as u8);
                payload.push(record.raw as u8);
            }
            other => panic!("unsupported parameter width: {other}"),
        }
    }

    let mut packet = vec![CMD_DATA, RECORD_SEPARATOR, sender, payload.len() as u8];
    packet.extend_from_slice(&payload);
    let chk = checksum(&packet);
    packet.push(chk);
    packet
}

/// Tags every byte of an already-built wire frame as `Data`, for the
/// common case (everything but the bracketing poll/ETX bytes is data).
pub fn tag_as_data(bytes: &[u8]) -> Vec<FrameByte> {
    bytes.iter().map(|&b| FrameByte::Data(b)).collect_vec()
}

fn expect_data(got: FrameByte, want: u8) -> Result<(), RcuError> {
    match got {
        FrameByte::Data(v) if v == want => Ok(()),
        other => Err(framing(&format!("expected Data({want:#04x}), got {other:?}"))),
    }
}

fn expect_data_any(got: FrameByte) -> Result<u8, RcuError> {
    match got {
        FrameByte::Data(v) => Ok(v),
        FrameByte::Address(v) => Err(framing(&format!(
            "expected a Data byte, got Address({v:#04x})"
        ))),
    }
}

fn framing(msg: &str) -> RcuError {
    RcuError::Framing(msg.to_string())
}

//! Frame encoder/decoder for both radio wire formats.
//!
//! ## Text frame
//!
//! ```text
//! [kind][src][dst] , seq , hops , payload… , CCCC
//!  3 raw bytes     ^ offset 3                ^ last delimiter
//! ```
//!
//! `seq` and `hops` are decimal, the payload is ASCII and may itself
//! contain commas, `CCCC` is the CRC-16 of everything before the last
//! delimiter as four uppercase hex digits.
//!
//! ## Binary frame
//!
//! ```text
//! [src][dst][kind][seq][hops][len][payload; len][crc_hi][crc_lo]
//! ```
//!
//! The CRC covers every byte before it.

use crc::{Crc, CRC_16_IBM_3740};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};
use crate::packet::{Packet, PacketType, MAX_PAYLOAD};

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Field separator of the text frame.
pub const DELIMITER: u8 = b',';

/// No frame of either format is shorter than this.
pub const MIN_FRAME_LEN: usize = 4;

const TEXT_HEADER_LEN: usize = 3;
const BINARY_HEADER_LEN: usize = 6;
const CHECKSUM_LEN: usize = 2;

/// CRC-16/CCITT-FALSE over `data`.
pub fn checksum(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

// ---------------------------------------------------------------------------
// Wire format selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    #[default]
    Text,
    Binary,
}

impl WireFormat {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "binary" | "bin" => Self::Binary,
            _ => Self::Text,
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Binary => write!(f, "binary"),
        }
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct Codec {
    format: WireFormat,
}

impl Codec {
    pub fn new(format: WireFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    pub fn encode(&self, packet: &Packet) -> Vec<u8> {
        match self.format {
            WireFormat::Text => encode_text(packet),
            WireFormat::Binary => encode_binary(packet),
        }
    }

    pub fn decode(&self, frame: &[u8]) -> Result<Packet> {
        if frame.len() < MIN_FRAME_LEN {
            return Err(Error::Malformed(format!(
                "frame is {} bytes, minimum is {MIN_FRAME_LEN}",
                frame.len()
            )));
        }
        match self.format {
            WireFormat::Text => decode_text(frame),
            WireFormat::Binary => decode_binary(frame),
        }
    }
}

// ---------------------------------------------------------------------------
// Text frames
// ---------------------------------------------------------------------------

fn encode_text(packet: &Packet) -> Vec<u8> {
    let mut out = Vec::with_capacity(TEXT_HEADER_LEN + packet.payload().len() + 16);
    out.extend_from_slice(&[
        packet.kind.as_byte(),
        packet.source,
        packet.destination,
        DELIMITER,
    ]);
    out.extend_from_slice(format!("{},{},", packet.sequence, packet.hop_count).as_bytes());
    out.extend_from_slice(packet.payload());
    let sum = checksum(&out);
    out.push(DELIMITER);
    out.extend_from_slice(format!("{sum:04X}").as_bytes());
    out
}

fn decode_text(frame: &[u8]) -> Result<Packet> {
    let kind = PacketType::try_from(frame[0])?;
    if frame[TEXT_HEADER_LEN] != DELIMITER {
        return Err(Error::Malformed("missing delimiter after header".into()));
    }

    // frame[3] is a delimiter, so the search always succeeds.
    let last = frame
        .iter()
        .rposition(|&b| b == DELIMITER)
        .unwrap_or(TEXT_HEADER_LEN);
    if last == TEXT_HEADER_LEN {
        return Err(Error::Malformed("missing sequence field".into()));
    }

    let received = parse_hex_u16(&frame[last + 1..])?;
    let computed = checksum(&frame[..last]);
    if received != computed {
        return Err(Error::Checksum { received, computed });
    }

    let fields = &frame[TEXT_HEADER_LEN + 1..last];
    let (seq_field, rest) = split_field(fields, "hop count")?;
    let (hops_field, payload) = split_field(rest, "payload")?;
    let sequence = parse_decimal_u8(seq_field, "sequence")?;
    let hop_count = parse_decimal_u8(hops_field, "hop count")?;

    if payload.len() > MAX_PAYLOAD {
        return Err(Error::Malformed(format!(
            "payload of {} bytes exceeds {MAX_PAYLOAD}",
            payload.len()
        )));
    }

    Ok(Packet::new(kind, frame[1], frame[2], sequence, payload.to_vec())?.with_hops(hop_count))
}

/// Split at the first delimiter; `next` names the field expected after it.
fn split_field<'a>(bytes: &'a [u8], next: &str) -> Result<(&'a [u8], &'a [u8])> {
    let at = bytes
        .iter()
        .position(|&b| b == DELIMITER)
        .ok_or_else(|| Error::Malformed(format!("missing delimiter before {next}")))?;
    Ok((&bytes[..at], &bytes[at + 1..]))
}

fn parse_decimal_u8(field: &[u8], name: &str) -> Result<u8> {
    if field.is_empty() || field.len() > 3 || !field.iter().all(u8::is_ascii_digit) {
        return Err(Error::Malformed(format!(
            "{name} field {:?} is not a decimal byte",
            String::from_utf8_lossy(field)
        )));
    }
    // All ASCII digits, so this is valid UTF-8.
    let text = std::str::from_utf8(field).map_err(|e| Error::Malformed(e.to_string()))?;
    text.parse::<u8>()
        .map_err(|_| Error::Malformed(format!("{name} field {text} overflows a byte")))
}

fn parse_hex_u16(field: &[u8]) -> Result<u16> {
    if field.len() != 4 || !field.iter().all(u8::is_ascii_hexdigit) {
        return Err(Error::Malformed(format!(
            "checksum field {:?} is not four hex digits",
            String::from_utf8_lossy(field)
        )));
    }
    let text = std::str::from_utf8(field).map_err(|e| Error::Malformed(e.to_string()))?;
    u16::from_str_radix(text, 16).map_err(|e| Error::Malformed(e.to_string()))
}

// ---------------------------------------------------------------------------
// Binary frames
// ---------------------------------------------------------------------------

fn encode_binary(packet: &Packet) -> Vec<u8> {
    let payload = packet.payload();
    let mut out = Vec::with_capacity(BINARY_HEADER_LEN + payload.len() + CHECKSUM_LEN);
    out.extend_from_slice(&[
        packet.source,
        packet.destination,
        packet.kind.as_byte(),
        packet.sequence,
        packet.hop_count,
        // Packet guarantees payload.len() <= 255.
        payload.len() as u8,
    ]);
    out.extend_from_slice(payload);
    out.extend_from_slice(&checksum(&out).to_be_bytes());
    out
}

fn decode_binary(frame: &[u8]) -> Result<Packet> {
    let kind = PacketType::try_from(frame[2])?;
    if frame.len() < BINARY_HEADER_LEN + CHECKSUM_LEN {
        return Err(Error::Malformed(format!(
            "binary frame is {} bytes, header and checksum need {}",
            frame.len(),
            BINARY_HEADER_LEN + CHECKSUM_LEN
        )));
    }

    let declared = frame[5] as usize;
    let carried = frame.len() - BINARY_HEADER_LEN - CHECKSUM_LEN;
    if declared != carried {
        return Err(Error::Malformed(format!(
            "length byte says {declared}, frame carries {carried} payload bytes"
        )));
    }

    let body_end = frame.len() - CHECKSUM_LEN;
    let received = u16::from_be_bytes([frame[body_end], frame[body_end + 1]]);
    let computed = checksum(&frame[..body_end]);
    if received != computed {
        return Err(Error::Checksum { received, computed });
    }

    let payload = frame[BINARY_HEADER_LEN..body_end].to_vec();
    Ok(Packet::new(kind, frame[0], frame[1], frame[3], payload)?.with_hops(frame[4]))
}

// ===========================================================================
// Tests
// ===========================================================================

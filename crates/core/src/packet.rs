//! Radio packet model.
//!
//! A [`Packet`] is the decoded form of one radio frame. The integrity
//! checksum belongs to the frame, not the packet: [`crate::codec`] computes
//! it on encode and verifies it on decode.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Node id of the edge gateway.
pub const GATEWAY: u8 = 0x00;
/// Destination id that every node accepts.
pub const BROADCAST: u8 = 0xFF;
/// Packets that have been relayed more often than this are dropped.
pub const MAX_HOPS: u8 = 5;
/// Largest payload a single frame can carry.
pub const MAX_PAYLOAD: usize = 255;

// ---------------------------------------------------------------------------
// Packet type
// ---------------------------------------------------------------------------

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketType {
    Data = 0x01,
    Command = 0x02,
    Ack = 0x03,
    Heartbeat = 0x04,
    Broadcast = 0x05,
    Mesh = 0x06,
}

impl PacketType {
    pub const ALL: [PacketType; 6] = [
        PacketType::Data,
        PacketType::Command,
        PacketType::Ack,
        PacketType::Heartbeat,
        PacketType::Broadcast,
        PacketType::Mesh,
    ];

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Data),
            0x02 => Some(Self::Command),
            0x03 => Some(Self::Ack),
            0x04 => Some(Self::Heartbeat),
            0x05 => Some(Self::Broadcast),
            0x06 => Some(Self::Mesh),
            _ => None,
        }
    }
}

impl TryFrom<u8> for PacketType {
    type Error = Error;

    fn try_from(byte: u8) -> Result<Self> {
        Self::from_byte(byte)
            .ok_or_else(|| Error::Malformed(format!("unknown packet type 0x{byte:02X}")))
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Data => "data",
            Self::Command => "command",
            Self::Ack => "ack",
            Self::Heartbeat => "heartbeat",
            Self::Broadcast => "broadcast",
            Self::Mesh => "mesh",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Packet
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub source: u8,
    pub destination: u8,
    pub kind: PacketType,
    pub sequence: u8,
    pub hop_count: u8,
    payload: Vec<u8>,
}

impl Packet {
    /// Build a fresh (zero-hop) packet. Fails if the payload does not fit
    /// in one frame.
    pub fn new(
        kind: PacketType,
        source: u8,
        destination: u8,
        sequence: u8,
        payload: impl Into<Vec<u8>>,
    ) -> Result<Self> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD {
            return Err(Error::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD,
            });
        }
        Ok(Self {
            source,
            destination,
            kind,
            sequence,
            hop_count: 0,
            payload,
        })
    }

    pub fn with_hops(mut self, hop_count: u8) -> Self {
        self.hop_count = hop_count;
        self
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    pub fn is_broadcast(&self) -> bool {
        self.destination == BROADCAST
    }

    /// Wrap this packet for relaying: the Mesh packet keeps addressing,
    /// sequence and hop count, and its payload is the inner type byte
    /// followed by the inner payload. Mesh packets are returned unchanged.
    pub fn wrap_mesh(&self) -> Result<Packet> {
        if self.kind == PacketType::Mesh {
            return Ok(self.clone());
        }
        let mut payload = Vec::with_capacity(self.payload.len() + 1);
        payload.push(self.kind.as_byte());
        payload.extend_from_slice(&self.payload);
        let wrapped = Packet::new(
            PacketType::Mesh,
            self.source,
            self.destination,
            self.sequence,
            payload,
        )?;
        Ok(wrapped.with_hops(self.hop_count))
    }

    /// Restore the packet carried inside a Mesh packet. Non-mesh packets
    /// pass through.
    pub fn unwrap_mesh(self) -> Result<Packet> {
        if self.kind != PacketType::Mesh {
            return Ok(self);
        }
        let (&inner, rest) = self
            .payload
            .split_first()
            .ok_or_else(|| Error::Malformed("mesh packet without inner type".into()))?;
        let kind = PacketType::try_from(inner)?;
        if kind == PacketType::Mesh {
            return Err(Error::Malformed("nested mesh packet".into()));
        }
        Ok(Packet {
            source: self.source,
            destination: self.destination,
            kind,
            sequence: self.sequence,
            hop_count: self.hop_count,
            payload: rest.to_vec(),
        })
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}->{} seq={} hops={} len={}",
            self.kind,
            self.source,
            self.destination,
            self.sequence,
            self.hop_count,
            self.payload.len()
        )
    }
}

// ---------------------------------------------------------------------------
// Sequence numbering
// ---------------------------------------------------------------------------

/// Per-source sequence numbers. Wraps at 256; the dedup window is far
/// shorter than the time it takes a node to send 256 packets.
#[derive(Debug, Default, Clone)]
pub struct SequenceCounter {
    next: u8,
}

impl SequenceCounter {
    pub fn starting_at(next: u8) -> Self {
        Self { next }
    }

    pub fn next(&mut self) -> u8 {
        let seq = self.next;
        self.next = self.next.wrapping_add(1);
        seq
    }
}

// ===========================================================================
// Tests
// ===========================================================================

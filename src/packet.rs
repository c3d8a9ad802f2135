//! Packets and the codec boundary.
//!
//! A [`Packet`] is the unit exchanged with the server: a command identifier, an optional
//! correlation id and an opaque body. The runtime never looks inside the body and never
//! decides how a packet is laid out on the wire; that is the job of a [`PacketFactory`].
//!
//! # Bundled Codec
//!
//! [`BincodePacketFactory`] is the factory used by the binaries and the tests. Every packet
//! is written as a single frame:
//!
//! - A 4-byte big-endian length prefix.
//! - The bincode encoding (big-endian, fixed-size integers) of the packet fields.
//!
//! Applications talking to an existing server implement [`PacketFactory`] themselves.
use std::{
    fmt,
    io::{self, Read},
    sync::atomic::{AtomicU64, Ordering},
};

use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint},
};
use thiserror::Error;

/// Command used by the bundled codec for heartbeat packets.
pub const HEARTBEAT_COMMAND: i32 = 0;

/// Upper bound on a single frame accepted by the bundled codec.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const FRAME_HEADER_SIZE: usize = size_of::<u32>();

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode packet: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("failed to decode packet: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("codec IO error: {0}")]
    Io(#[from] io::Error),
    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),
}

impl CodecError {
    /// Underlying socket error, if this failure came from the stream itself.
    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            CodecError::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// Message exchanged with the server. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Packet {
    command: i32,
    packet_id: Option<String>,
    body: Vec<u8>,
}

impl Packet {
    pub fn new(command: i32, packet_id: Option<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            command,
            packet_id,
            body: body.into(),
        }
    }

    pub fn command(&self) -> i32 {
        self.command
    }

    /// Correlation id linking a response to the request that caused it.
    pub fn packet_id(&self) -> Option<&str> {
        self.packet_id.as_deref()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body interpreted as UTF-8, with invalid sequences replaced.
    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Builds, encodes and decodes packets for one wire format.
pub trait PacketFactory: Send + Sync {
    /// Creates an outbound request, assigning it a correlation id.
    fn build_request_packet(&self, command: i32, body: &[u8]) -> Packet;

    fn encode(&self, packet: &Packet) -> Result<Vec<u8>, CodecError>;

    /// Reads exactly one packet from the stream, blocking until it is complete.
    fn decode(&self, reader: &mut dyn Read) -> Result<Packet, CodecError>;

    fn support_heart_beat(&self) -> bool;

    fn build_heart_beat_packet(&self) -> Packet;
}

/// Length-prefixed bincode framing.
pub struct BincodePacketFactory {
    config: Configuration<BigEndian, Fixint>,
    next_id: AtomicU64,
    heartbeat: bool,
}

impl fmt::Debug for BincodePacketFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BincodePacketFactory")
            .field("next_id", &self.next_id)
            .field("heartbeat", &self.heartbeat)
            .finish()
    }
}

impl Default for BincodePacketFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl BincodePacketFactory {
    pub fn new() -> Self {
        let config = bincode::config::standard()
            .with_big_endian()
            .with_fixed_int_encoding();
        Self {
            config,
            next_id: AtomicU64::new(1),
            heartbeat: true,
        }
    }

    /// Same framing, but the connection will not send heartbeats.
    pub fn without_heartbeat() -> Self {
        Self {
            heartbeat: false,
            ..Self::new()
        }
    }
}

impl PacketFactory for BincodePacketFactory {
    fn build_request_packet(&self, command: i32, body: &[u8]) -> Packet {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Packet::new(command, Some(id.to_string()), body)
    }

    fn encode(&self, packet: &Packet) -> Result<Vec<u8>, CodecError> {
        let payload = bincode::encode_to_vec(packet, self.config)?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(payload.len()));
        }

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    fn decode(&self, reader: &mut dyn Read) -> Result<Packet, CodecError> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        reader.read_exact(&mut header)?;

        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_FRAME_SIZE {
            // Skip the payload so the next read starts at a frame boundary.
            let skipped = io::copy(&mut Read::take(&mut *reader, len as u64), &mut io::sink())?;
            if skipped < len as u64 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
            return Err(CodecError::FrameTooLarge(len));
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;
        let (packet, _) = bincode::decode_from_slice(&payload, self.config)?;
        Ok(packet)
    }

    fn support_heart_beat(&self) -> bool {
        self.heartbeat
    }

    fn build_heart_beat_packet(&self) -> Packet {
        Packet::new(HEARTBEAT_COMMAND, None, Vec::new())
    }
}

//! MAVLink v1/v2 framing.
//!
//! Raw frame buffers with field accessors, an incremental byte-at-a-time
//! decoder, and the X.25 checksum extended with the per-message CRC-extra
//! byte. Typed message payloads live in [`messages`]; v2 signing in
//! [`signing`].
//!
//! Encoding truncates trailing payload zeros on v2 frames; decoding pads
//! them back before deserialisation. Sequence numbers are stamped by the
//! link, not here.

pub mod messages;
pub mod signing;

use crc_any::CRCu16;

use crate::error::ProtocolError;
use messages::MavMessage;

/// Message framing marker for MAVLink v1.
pub const MAV_STX: u8 = 0xFE;
/// Message framing marker for MAVLink v2.
pub const MAV_STX_V2: u8 = 0xFD;

/// Maximum size of a v2 frame on the wire.
pub const MAX_FRAME_SIZE: usize = 280;

pub(crate) const IFLAG_SIGNED: u8 = 0x01;
const SUPPORTED_IFLAGS: u8 = IFLAG_SIGNED;

/// Versions of the MAVLink protocol that we support.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MavlinkVersion {
    V1,
    V2,
}

/// Metadata from a MAVLink packet header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MavHeader {
    pub system_id: u8,
    pub component_id: u8,
    pub sequence: u8,
}

impl Default for MavHeader {
    /// GCS header; `sequence` is replaced by the link.
    fn default() -> Self {
        Self {
            system_id: 255,
            component_id: 190,
            sequence: 0,
        }
    }
}

/// X.25 checksum over `data`, extended with the message CRC-extra byte.
pub fn calculate_crc(data: &[u8], extra_crc: u8) -> u16 {
    let mut crc = CRCu16::crc16mcrf4cc();
    crc.digest(data);
    crc.digest(&[extra_crc]);
    crc.get_crc()
}

/// Removes the trailing zeroes in the payload.
///
/// There must always be at least one remaining byte even if it is a zero
/// byte.
pub fn remove_trailing_zeroes(data: &[u8]) -> usize {
    let mut len = data.len();
    while len > 1 && data[len - 1] == 0 {
        len -= 1;
    }
    len
}

/// A v1 frame as laid out on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MavlinkV1Raw([u8; 1 + Self::HEADER_SIZE + 255 + 2]);

impl MavlinkV1Raw {
    pub const HEADER_SIZE: usize = 5;

    pub const fn new() -> Self {
        Self([0; 1 + Self::HEADER_SIZE + 255 + 2])
    }

    #[inline]
    pub fn payload_length(&self) -> u8 {
        self.0[1]
    }
    #[inline]
    pub fn sequence(&self) -> u8 {
        self.0[2]
    }
    #[inline]
    pub fn system_id(&self) -> u8 {
        self.0[3]
    }
    #[inline]
    pub fn component_id(&self) -> u8 {
        self.0[4]
    }
    #[inline]
    pub fn message_id(&self) -> u32 {
        self.0[5].into()
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        let len: usize = self.payload_length().into();
        &self.0[1 + Self::HEADER_SIZE..1 + Self::HEADER_SIZE + len]
    }

    #[inline]
    pub fn checksum(&self) -> u16 {
        let len: usize = self.payload_length().into();
        u16::from_le_bytes([
            self.0[1 + Self::HEADER_SIZE + len],
            self.0[1 + Self::HEADER_SIZE + len + 1],
        ])
    }

    pub fn header(&self) -> MavHeader {
        MavHeader {
            system_id: self.system_id(),
            component_id: self.component_id(),
            sequence: self.sequence(),
        }
    }

    /// CRC over the frame starting at the length byte, with the message
    /// CRC-extra. Unknown ids cannot be checked and return `false`.
    pub fn has_valid_crc(&self) -> bool {
        let len: usize = self.payload_length().into();
        match messages::extra_crc(self.message_id()) {
            Some(extra) => {
                self.checksum() == calculate_crc(&self.0[1..1 + Self::HEADER_SIZE + len], extra)
            }
            None => false,
        }
    }

    fn crc_verified_known(&self) -> bool {
        messages::extra_crc(self.message_id()).is_some()
    }

    pub fn raw_bytes(&self) -> &[u8] {
        let len = self.payload_length() as usize;
        &self.0[..1 + Self::HEADER_SIZE + len + 2]
    }

    /// Serialize `message` into this buffer with the given header.
    pub fn serialize_message(&mut self, header: MavHeader, message: &MavMessage) {
        let mut payload = [0u8; 255];
        // v1 payloads are fixed width; extension fields are not transmitted.
        let (_, len) = message.ser(&mut payload);
        self.0[0] = MAV_STX;
        self.0[1] = len as u8;
        self.0[2] = header.sequence;
        self.0[3] = header.system_id;
        self.0[4] = header.component_id;
        self.0[5] = message.message_id() as u8;
        self.0[1 + Self::HEADER_SIZE..1 + Self::HEADER_SIZE + len]
            .copy_from_slice(&payload[..len]);
        let extra = messages::extra_crc(message.message_id()).unwrap_or(0);
        let crc = calculate_crc(&self.0[1..1 + Self::HEADER_SIZE + len], extra);
        self.0[1 + Self::HEADER_SIZE + len..1 + Self::HEADER_SIZE + len + 2]
            .copy_from_slice(&crc.to_le_bytes());
    }
}

impl Default for MavlinkV1Raw {
    fn default() -> Self {
        Self::new()
    }
}

/// A v2 frame as laid out on the wire, signature trailer included.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MavlinkV2Raw([u8; 1 + Self::HEADER_SIZE + 255 + 2 + Self::SIGNATURE_SIZE]);

impl MavlinkV2Raw {
    pub const HEADER_SIZE: usize = 9;
    pub const SIGNATURE_SIZE: usize = 13;

    pub const fn new() -> Self {
        Self([0; 1 + Self::HEADER_SIZE + 255 + 2 + Self::SIGNATURE_SIZE])
    }

    #[inline]
    pub fn payload_length(&self) -> u8 {
        self.0[1]
    }
    #[inline]
    pub fn incompatibility_flags(&self) -> u8 {
        self.0[2]
    }
    #[inline]
    pub fn compatibility_flags(&self) -> u8 {
        self.0[3]
    }
    #[inline]
    pub fn sequence(&self) -> u8 {
        self.0[4]
    }
    #[inline]
    pub fn system_id(&self) -> u8 {
        self.0[5]
    }
    #[inline]
    pub fn component_id(&self) -> u8 {
        self.0[6]
    }
    #[inline]
    pub fn message_id(&self) -> u32 {
        u32::from_le_bytes([self.0[7], self.0[8], self.0[9], 0])
    }

    #[inline]
    pub fn is_signed(&self) -> bool {
        self.incompatibility_flags() & IFLAG_SIGNED != 0
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        let len: usize = self.payload_length().into();
        &self.0[1 + Self::HEADER_SIZE..1 + Self::HEADER_SIZE + len]
    }

    #[inline]
    pub fn checksum(&self) -> u16 {
        let len: usize = self.payload_length().into();
        u16::from_le_bytes([
            self.0[1 + Self::HEADER_SIZE + len],
            self.0[1 + Self::HEADER_SIZE + len + 1],
        ])
    }

    #[inline]
    pub(crate) fn checksum_bytes(&self) -> &[u8] {
        let off = 1 + Self::HEADER_SIZE + self.payload_length() as usize;
        &self.0[off..off + 2]
    }

    #[inline]
    pub fn signature_link_id(&self) -> u8 {
        let len: usize = self.payload_length().into();
        self.0[1 + Self::HEADER_SIZE + len + 2]
    }

    #[inline]
    pub(crate) fn signature_link_id_mut(&mut self) -> &mut u8 {
        let len: usize = self.payload_length().into();
        &mut self.0[1 + Self::HEADER_SIZE + len + 2]
    }

    #[inline]
    pub fn signature_timestamp_bytes(&self) -> &[u8] {
        let len: usize = self.payload_length().into();
        let start = 1 + Self::HEADER_SIZE + len + 3;
        &self.0[start..start + 6]
    }

    #[inline]
    pub(crate) fn signature_timestamp_bytes_mut(&mut self) -> &mut [u8] {
        let len: usize = self.payload_length().into();
        let start = 1 + Self::HEADER_SIZE + len + 3;
        &mut self.0[start..start + 6]
    }

    pub fn signature_timestamp(&self) -> u64 {
        let mut bytes = [0u8; 8];
        bytes[..6].copy_from_slice(self.signature_timestamp_bytes());
        u64::from_le_bytes(bytes)
    }

    #[inline]
    pub fn signature_value(&self) -> &[u8] {
        let len: usize = self.payload_length().into();
        let start = 1 + Self::HEADER_SIZE + len + 3 + 6;
        &self.0[start..start + 6]
    }

    #[inline]
    pub(crate) fn signature_value_mut(&mut self) -> &mut [u8] {
        let len: usize = self.payload_length().into();
        let start = 1 + Self::HEADER_SIZE + len + 3 + 6;
        &mut self.0[start..start + 6]
    }

    pub(crate) fn header_bytes(&self) -> &[u8] {
        &self.0[1..=Self::HEADER_SIZE]
    }

    pub fn header(&self) -> MavHeader {
        MavHeader {
            system_id: self.system_id(),
            component_id: self.component_id(),
            sequence: self.sequence(),
        }
    }

    pub fn has_valid_crc(&self) -> bool {
        let len: usize = self.payload_length().into();
        match messages::extra_crc(self.message_id()) {
            Some(extra) => {
                self.checksum() == calculate_crc(&self.0[1..1 + Self::HEADER_SIZE + len], extra)
            }
            None => false,
        }
    }

    fn crc_verified_known(&self) -> bool {
        messages::extra_crc(self.message_id()).is_some()
    }

    pub fn raw_bytes(&self) -> &[u8] {
        let len = self.payload_length() as usize;
        let sig = if self.is_signed() {
            Self::SIGNATURE_SIZE
        } else {
            0
        };
        &self.0[..1 + Self::HEADER_SIZE + len + 2 + sig]
    }

    /// Serialize `message` into this buffer, truncating trailing payload
    /// zeros. `sign` reserves (and flags) the signature trailer; the bytes
    /// themselves are filled in by [`signing::SigningData::sign_frame`].
    pub fn serialize_message(&mut self, header: MavHeader, message: &MavMessage, sign: bool) {
        let mut payload = [0u8; 255];
        let (full_len, _) = message.ser(&mut payload);
        let len = remove_trailing_zeroes(&payload[..full_len.max(1)]);
        let msgid = message.message_id().to_le_bytes();
        self.0[0] = MAV_STX_V2;
        self.0[1] = len as u8;
        self.0[2] = if sign { IFLAG_SIGNED } else { 0 };
        self.0[3] = 0;
        self.0[4] = header.sequence;
        self.0[5] = header.system_id;
        self.0[6] = header.component_id;
        self.0[7] = msgid[0];
        self.0[8] = msgid[1];
        self.0[9] = msgid[2];
        self.0[1 + Self::HEADER_SIZE..1 + Self::HEADER_SIZE + len]
            .copy_from_slice(&payload[..len]);
        let extra = messages::extra_crc(message.message_id()).unwrap_or(0);
        let crc = calculate_crc(&self.0[1..1 + Self::HEADER_SIZE + len], extra);
        self.0[1 + Self::HEADER_SIZE + len..1 + Self::HEADER_SIZE + len + 2]
            .copy_from_slice(&crc.to_le_bytes());
    }
}

impl Default for MavlinkV2Raw {
    fn default() -> Self {
        Self::new()
    }
}

/// A complete frame of either version, CRC already verified by the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MavRawFrame {
    V1(MavlinkV1Raw),
    V2(MavlinkV2Raw),
}

impl MavRawFrame {
    pub fn version(&self) -> MavlinkVersion {
        match self {
            Self::V1(_) => MavlinkVersion::V1,
            Self::V2(_) => MavlinkVersion::V2,
        }
    }

    pub fn header(&self) -> MavHeader {
        match self {
            Self::V1(f) => f.header(),
            Self::V2(f) => f.header(),
        }
    }

    pub fn message_id(&self) -> u32 {
        match self {
            Self::V1(f) => f.message_id(),
            Self::V2(f) => f.message_id(),
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Self::V1(f) => f.payload(),
            Self::V2(f) => f.payload(),
        }
    }

    /// Decode the typed message. Unknown ids come back as
    /// [`MavMessage::Unknown`] so custom dialects still propagate.
    pub fn decode(&self) -> MavMessage {
        MavMessage::parse(self.message_id(), self.payload())
    }

    /// Whether the CRC could be verified. Unknown message ids carry no
    /// CRC-extra constant, so their checksum cannot be checked; they are
    /// delivered anyway, flagged unverified.
    pub fn crc_verified(&self) -> bool {
        messages::extra_crc(self.message_id()).is_some()
    }
}

/// Encode `message` as a wire-ready byte vector.
pub fn encode_frame(
    version: MavlinkVersion,
    header: MavHeader,
    message: &MavMessage,
) -> Result<Vec<u8>, ProtocolError> {
    if messages::extra_crc(message.message_id()).is_none() {
        return Err(ProtocolError::UnknownMessage {
            id: message.message_id(),
        });
    }
    match version {
        MavlinkVersion::V1 => {
            let mut raw = MavlinkV1Raw::new();
            raw.serialize_message(header, message);
            Ok(raw.raw_bytes().to_vec())
        }
        MavlinkVersion::V2 => {
            let mut raw = MavlinkV2Raw::new();
            raw.serialize_message(header, message, false);
            Ok(raw.raw_bytes().to_vec())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Idle,
    Len,
    IncompatFlags,
    CompatFlags,
    Seq,
    Sys,
    Comp,
    MsgId { index: usize },
    Payload { index: usize },
    CrcLo,
    CrcHi,
    Signature { index: usize },
}

/// Incremental MAVLink decoder.
///
/// Feed bytes one at a time; completed CRC-valid frames pop out. Feeding a
/// slice byte-by-byte and feeding it whole yield identical frame sequences.
/// Framing desyncs silently reset to the start state; CRC failures are
/// counted and retrievable with [`MavlinkDecoder::take_crc_errors`].
pub struct MavlinkDecoder {
    state: DecodeState,
    version: MavlinkVersion,
    buf: [u8; MAX_FRAME_SIZE],
    // Bytes of the current frame accumulated so far.
    len: usize,
    payload_len: usize,
    msgid_len: usize,
    signed: bool,
    crc_errors: u64,
}

impl Default for MavlinkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MavlinkDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Idle,
            version: MavlinkVersion::V2,
            buf: [0; MAX_FRAME_SIZE],
            len: 0,
            payload_len: 0,
            msgid_len: 0,
            signed: false,
            crc_errors: 0,
        }
    }

    /// CRC failures observed since the last call; resets the counter.
    pub fn take_crc_errors(&mut self) -> u64 {
        std::mem::take(&mut self.crc_errors)
    }

    /// True when the decoder is between frames.
    pub fn is_idle(&self) -> bool {
        self.state == DecodeState::Idle
    }

    fn reset(&mut self) {
        self.state = DecodeState::Idle;
        self.len = 0;
        self.signed = false;
    }

    fn push(&mut self, byte: u8) {
        self.buf[self.len] = byte;
        self.len += 1;
    }

    /// Feed one byte; returns a frame when one completes.
    pub fn feed(&mut self, byte: u8) -> Option<MavRawFrame> {
        match self.state {
            DecodeState::Idle => {
                match byte {
                    MAV_STX => {
                        self.version = MavlinkVersion::V1;
                        self.msgid_len = 1;
                    }
                    MAV_STX_V2 => {
                        self.version = MavlinkVersion::V2;
                        self.msgid_len = 3;
                    }
                    _ => return None,
                }
                self.len = 0;
                self.signed = false;
                self.push(byte);
                self.state = DecodeState::Len;
                None
            }
            DecodeState::Len => {
                self.payload_len = byte as usize;
                self.push(byte);
                self.state = match self.version {
                    MavlinkVersion::V1 => DecodeState::Seq,
                    MavlinkVersion::V2 => DecodeState::IncompatFlags,
                };
                None
            }
            DecodeState::IncompatFlags => {
                if byte & !SUPPORTED_IFLAGS != 0 {
                    // Unknown incompatibility bit: the frame cannot be
                    // interpreted, drop it.
                    self.reset();
                    return None;
                }
                self.signed = byte & IFLAG_SIGNED != 0;
                self.push(byte);
                self.state = DecodeState::CompatFlags;
                None
            }
            DecodeState::CompatFlags => {
                self.push(byte);
                self.state = DecodeState::Seq;
                None
            }
            DecodeState::Seq => {
                self.push(byte);
                self.state = DecodeState::Sys;
                None
            }
            DecodeState::Sys => {
                self.push(byte);
                self.state = DecodeState::Comp;
                None
            }
            DecodeState::Comp => {
                self.push(byte);
                self.state = DecodeState::MsgId { index: 0 };
                None
            }
            DecodeState::MsgId { index } => {
                self.push(byte);
                if index + 1 == self.msgid_len {
                    self.state = if self.payload_len == 0 {
                        DecodeState::CrcLo
                    } else {
                        DecodeState::Payload { index: 0 }
                    };
                } else {
                    self.state = DecodeState::MsgId { index: index + 1 };
                }
                None
            }
            DecodeState::Payload { index } => {
                self.push(byte);
                self.state = if index + 1 == self.payload_len {
                    DecodeState::CrcLo
                } else {
                    DecodeState::Payload { index: index + 1 }
                };
                None
            }
            DecodeState::CrcLo => {
                self.push(byte);
                self.state = DecodeState::CrcHi;
                None
            }
            DecodeState::CrcHi => {
                self.push(byte);
                if self.signed {
                    self.state = DecodeState::Signature { index: 0 };
                    return None;
                }
                self.finish()
            }
            DecodeState::Signature { index } => {
                self.push(byte);
                if index + 1 == MavlinkV2Raw::SIGNATURE_SIZE {
                    self.finish()
                } else {
                    self.state = DecodeState::Signature { index: index + 1 };
                    None
                }
            }
        }
    }

    /// Feed a whole slice, collecting every completed frame.
    pub fn feed_slice(&mut self, bytes: &[u8]) -> Vec<MavRawFrame> {
        bytes.iter().filter_map(|&b| self.feed(b)).collect()
    }

    fn finish(&mut self) -> Option<MavRawFrame> {
        let frame = match self.version {
            MavlinkVersion::V1 => {
                let mut raw = MavlinkV1Raw::new();
                raw.0[..self.len].copy_from_slice(&self.buf[..self.len]);
                MavRawFrame::V1(raw)
            }
            MavlinkVersion::V2 => {
                let mut raw = MavlinkV2Raw::new();
                raw.0[..self.len].copy_from_slice(&self.buf[..self.len]);
                MavRawFrame::V2(raw)
            }
        };
        self.reset();
        // Unknown ids have no CRC-extra to check against; they pass through
        // flagged unverified.
        let crc_ok = match &frame {
            MavRawFrame::V1(f) => !f.crc_verified_known() || f.has_valid_crc(),
            MavRawFrame::V2(f) => !f.crc_verified_known() || f.has_valid_crc(),
        };
        if !crc_ok {
            self.crc_errors += 1;
            log::trace!("mavlink CRC failure, msgid {}", frame.message_id());
            return None;
        }
        Some(frame)
    }
}

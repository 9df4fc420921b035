//! MultiWii Serial Protocol, v1 (`$M`) and v2 (`$X`).
//!
//! v1 carries a one-byte function and length (payload ≤ 255) with an XOR
//! checksum; v2 carries 16-bit function and length plus a flags byte,
//! protected by CRC-8/DVB-S2. Function numbers above 255 always ride v2.
//! The decoder is an incremental byte state machine; desyncs reset to the
//! start state and are counted, not surfaced.

use crate::error::ProtocolError;

/// Well-known function numbers the station uses.
pub mod function {
    pub const MSP_API_VERSION: u16 = 1;
    pub const MSP_FC_VARIANT: u16 = 2;
    pub const MSP_FC_VERSION: u16 = 3;
    pub const MSP_BOARD_INFO: u16 = 4;
    pub const MSP_MODE_RANGES: u16 = 34;
    pub const MSP_SET_MODE_RANGE: u16 = 35;
    pub const MSP_REBOOT: u16 = 68;
    pub const MSP_ATTITUDE: u16 = 108;
    pub const MSP_ANALOG: u16 = 110;
    pub const MSP_BOXNAMES: u16 = 116;
    pub const MSP_BOXIDS: u16 = 119;
    pub const MSP_EEPROM_WRITE: u16 = 250;
    pub const MSP2_INAV_MIXER: u16 = 0x2010;
    pub const MSP2_INAV_SET_MIXER: u16 = 0x2011;
}

/// Reboot modes carried in the `MSP_REBOOT` payload.
pub mod reboot_mode {
    pub const FIRMWARE: u8 = 0;
    pub const BOOTLOADER_ROM: u8 = 1;
    pub const MSC: u8 = 2;
    pub const BOOTLOADER_FLASH: u8 = 4;
}

/// Who the frame is going to, encoded in the direction character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MspDirection {
    /// `<` — request to the flight controller.
    Request,
    /// `>` — response from the flight controller.
    Response,
    /// `!` — error response.
    Error,
}

impl MspDirection {
    fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            b'<' => Some(Self::Request),
            b'>' => Some(Self::Response),
            b'!' => Some(Self::Error),
            _ => None,
        }
    }

    fn to_wire(self) -> u8 {
        match self {
            Self::Request => b'<',
            Self::Response => b'>',
            Self::Error => b'!',
        }
    }
}

/// Protocol generation a frame was framed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MspVersion {
    V1,
    V2,
}

/// One complete MSP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MspFrame {
    pub direction: MspDirection,
    pub function: u16,
    pub flags: u8,
    pub payload: Vec<u8>,
    pub version: MspVersion,
}

impl MspFrame {
    pub fn request(function: u16, payload: Vec<u8>) -> Self {
        let version = if function > 255 {
            MspVersion::V2
        } else {
            MspVersion::V1
        };
        Self {
            direction: MspDirection::Request,
            function,
            flags: 0,
            payload,
            version,
        }
    }

    pub fn response(function: u16, payload: Vec<u8>) -> Self {
        let version = if function > 255 {
            MspVersion::V2
        } else {
            MspVersion::V1
        };
        Self {
            direction: MspDirection::Response,
            function,
            flags: 0,
            payload,
            version,
        }
    }

    /// Encode for the wire. v2 is used when the function number or payload
    /// size does not fit v1, or when the frame says so.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        match self.version {
            MspVersion::V1 => {
                if self.function > 255 || self.payload.len() > 255 {
                    return Err(ProtocolError::Framing("frame does not fit MSP v1"));
                }
                let mut out = Vec::with_capacity(6 + self.payload.len());
                out.extend_from_slice(b"$M");
                out.push(self.direction.to_wire());
                out.push(self.payload.len() as u8);
                out.push(self.function as u8);
                out.extend_from_slice(&self.payload);
                let mut cksum = self.payload.len() as u8 ^ self.function as u8;
                for &b in &self.payload {
                    cksum ^= b;
                }
                out.push(cksum);
                Ok(out)
            }
            MspVersion::V2 => {
                let mut out = Vec::with_capacity(9 + self.payload.len());
                out.extend_from_slice(b"$X");
                out.push(self.direction.to_wire());
                out.push(self.flags);
                out.extend_from_slice(&self.function.to_le_bytes());
                out.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
                out.extend_from_slice(&self.payload);
                let mut crc = crc8_dvb_s2(0, self.flags);
                for b in self.function.to_le_bytes() {
                    crc = crc8_dvb_s2(crc, b);
                }
                for b in (self.payload.len() as u16).to_le_bytes() {
                    crc = crc8_dvb_s2(crc, b);
                }
                for &b in &self.payload {
                    crc = crc8_dvb_s2(crc, b);
                }
                out.push(crc);
                Ok(out)
            }
        }
    }
}

/// CRC-8/DVB-S2, polynomial 0xD5, init 0 — the MSP v2 frame check.
pub fn crc8_dvb_s2(mut crc: u8, byte: u8) -> u8 {
    crc ^= byte;
    for _ in 0..8 {
        if crc & 0x80 != 0 {
            crc = (crc << 1) ^ 0xD5;
        } else {
            crc <<= 1;
        }
    }
    crc
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Idle,
    Header,
    Direction { version: MspVersion },
    V1Len,
    V1Fn,
    V1Payload { index: usize },
    V1Cksum,
    V2Flags,
    V2FnLo,
    V2FnHi,
    V2LenLo,
    V2LenHi,
    V2Payload { index: usize },
    V2Crc,
}

/// Incremental MSP decoder. Identical frame output whether fed a byte at a
/// time or a slice at a time.
pub struct MspDecoder {
    state: DecodeState,
    direction: MspDirection,
    function: u16,
    flags: u8,
    len: usize,
    payload: Vec<u8>,
    cksum: u8,
    crc_errors: u64,
}

impl Default for MspDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MspDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Idle,
            direction: MspDirection::Request,
            function: 0,
            flags: 0,
            len: 0,
            payload: Vec::new(),
            cksum: 0,
            crc_errors: 0,
        }
    }

    /// Checksum failures observed since the last call; resets the counter.
    pub fn take_crc_errors(&mut self) -> u64 {
        std::mem::take(&mut self.crc_errors)
    }

    /// True when the decoder is between frames.
    pub fn is_idle(&self) -> bool {
        self.state == DecodeState::Idle
    }

    fn reset(&mut self) {
        self.state = DecodeState::Idle;
        self.payload.clear();
    }

    /// Feed one byte; returns a frame when one completes.
    pub fn feed(&mut self, byte: u8) -> Option<MspFrame> {
        match self.state {
            DecodeState::Idle => {
                if byte == b'$' {
                    self.state = DecodeState::Header;
                }
                None
            }
            DecodeState::Header => {
                self.state = match byte {
                    b'M' => DecodeState::Direction {
                        version: MspVersion::V1,
                    },
                    b'X' => DecodeState::Direction {
                        version: MspVersion::V2,
                    },
                    _ => DecodeState::Idle,
                };
                None
            }
            DecodeState::Direction { version } => {
                let Some(direction) = MspDirection::from_wire(byte) else {
                    self.reset();
                    return None;
                };
                self.direction = direction;
                self.payload.clear();
                self.state = match version {
                    MspVersion::V1 => DecodeState::V1Len,
                    MspVersion::V2 => DecodeState::V2Flags,
                };
                None
            }
            DecodeState::V1Len => {
                self.len = byte as usize;
                self.cksum = byte;
                self.state = DecodeState::V1Fn;
                None
            }
            DecodeState::V1Fn => {
                self.function = byte.into();
                self.cksum ^= byte;
                self.state = if self.len == 0 {
                    DecodeState::V1Cksum
                } else {
                    DecodeState::V1Payload { index: 0 }
                };
                None
            }
            DecodeState::V1Payload { index } => {
                self.payload.push(byte);
                self.cksum ^= byte;
                self.state = if index + 1 == self.len {
                    DecodeState::V1Cksum
                } else {
                    DecodeState::V1Payload { index: index + 1 }
                };
                None
            }
            DecodeState::V1Cksum => {
                let ok = byte == self.cksum;
                let frame = self.take_frame(MspVersion::V1, ok);
                self.reset();
                frame
            }
            DecodeState::V2Flags => {
                self.flags = byte;
                self.cksum = crc8_dvb_s2(0, byte);
                self.state = DecodeState::V2FnLo;
                None
            }
            DecodeState::V2FnLo => {
                self.function = byte.into();
                self.cksum = crc8_dvb_s2(self.cksum, byte);
                self.state = DecodeState::V2FnHi;
                None
            }
            DecodeState::V2FnHi => {
                self.function |= u16::from(byte) << 8;
                self.cksum = crc8_dvb_s2(self.cksum, byte);
                self.state = DecodeState::V2LenLo;
                None
            }
            DecodeState::V2LenLo => {
                self.len = byte as usize;
                self.cksum = crc8_dvb_s2(self.cksum, byte);
                self.state = DecodeState::V2LenHi;
                None
            }
            DecodeState::V2LenHi => {
                self.len |= (byte as usize) << 8;
                self.cksum = crc8_dvb_s2(self.cksum, byte);
                self.state = if self.len == 0 {
                    DecodeState::V2Crc
                } else {
                    DecodeState::V2Payload { index: 0 }
                };
                None
            }
            DecodeState::V2Payload { index } => {
                self.payload.push(byte);
                self.cksum = crc8_dvb_s2(self.cksum, byte);
                self.state = if index + 1 == self.len {
                    DecodeState::V2Crc
                } else {
                    DecodeState::V2Payload { index: index + 1 }
                };
                None
            }
            DecodeState::V2Crc => {
                let ok = byte == self.cksum;
                let frame = self.take_frame(MspVersion::V2, ok);
                self.reset();
                frame
            }
        }
    }

    /// Feed a whole slice, collecting every completed frame.
    pub fn feed_slice(&mut self, bytes: &[u8]) -> Vec<MspFrame> {
        bytes.iter().filter_map(|&b| self.feed(b)).collect()
    }

    fn take_frame(&mut self, version: MspVersion, crc_ok: bool) -> Option<MspFrame> {
        if !crc_ok {
            self.crc_errors += 1;
            log::trace!("msp checksum failure, fn {}", self.function);
            return None;
        }
        Some(MspFrame {
            direction: self.direction,
            function: self.function,
            flags: if version == MspVersion::V2 {
                self.flags
            } else {
                0
            },
            payload: std::mem::take(&mut self.payload),
            version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v1_roundtrip() {
        let frame = MspFrame::request(function::MSP_FC_VARIANT, vec![]);
        let bytes = frame.encode().unwrap();
        assert_eq!(&bytes[..3], b"$M<");
        let mut dec = MspDecoder::new();
        let frames = dec.feed_slice(&bytes);
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn v1_payload_roundtrip() {
        let frame = MspFrame::response(function::MSP_FC_VARIANT, b"BTFL".to_vec());
        let bytes = frame.encode().unwrap();
        let mut dec = MspDecoder::new();
        assert_eq!(dec.feed_slice(&bytes), vec![frame]);
    }

    #[test]
    fn v2_function_above_255_rides_v2() {
        let frame = MspFrame::request(function::MSP2_INAV_MIXER, vec![]);
        assert_eq!(frame.version, MspVersion::V2);
        let bytes = frame.encode().unwrap();
        assert_eq!(&bytes[..3], b"$X<");
        let mut dec = MspDecoder::new();
        assert_eq!(dec.feed_slice(&bytes), vec![frame]);
    }

    #[test]
    fn bad_checksum_is_counted_not_yielded() {
        let frame = MspFrame::request(function::MSP_API_VERSION, vec![1, 2, 3]);
        let mut bytes = frame.encode().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let mut dec = MspDecoder::new();
        assert!(dec.feed_slice(&bytes).is_empty());
        assert_eq!(dec.take_crc_errors(), 1);
    }

    #[test]
    fn error_direction_frames_decode() {
        let frame = MspFrame {
            direction: MspDirection::Error,
            function: 42,
            flags: 0,
            payload: vec![],
            version: MspVersion::V1,
        };
        let bytes = frame.encode().unwrap();
        let mut dec = MspDecoder::new();
        let out = dec.feed_slice(&bytes);
        assert_eq!(out[0].direction, MspDirection::Error);
    }
}

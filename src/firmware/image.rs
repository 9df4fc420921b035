//! Firmware image readers.
//!
//! Four on-disk formats reach the flash FSM: ArduPilot `.apj` (JSON wrapper
//! around a base64 gzipped image with board id and size), `.px4` (same
//! wrapper family), Intel HEX (Betaflight/iNav) and raw `.bin`. Parsing
//! yields address-sorted segments; board-id validation happens in the FSM.

use std::io::Read;
use std::path::Path;

use base64::Engine;
use serde::Deserialize;

use crate::error::FirmwareError;
use crate::stboot::FLASH_BASE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Apj,
    Px4,
    IntelHex,
    RawBin,
}

/// One contiguous run of bytes at an absolute address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub address: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    pub format: ImageFormat,
    /// Board id embedded in the wrapper, when the format carries one.
    pub board_id: Option<u32>,
    /// Segments sorted by address, non-overlapping.
    pub segments: Vec<Segment>,
}

impl FirmwareImage {
    pub fn total_len(&self) -> usize {
        self.segments.iter().map(|s| s.data.len()).sum()
    }

    /// Lowest address of any segment.
    pub fn base_address(&self) -> Option<u32> {
        self.segments.first().map(|s| s.address)
    }
}

/// Parse a firmware file, dispatching on the extension.
pub fn parse_file(path: &Path) -> Result<FirmwareImage, FirmwareError> {
    let bytes = std::fs::read(path)?;
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    match extension.as_str() {
        "apj" => parse_apj(&bytes, ImageFormat::Apj),
        "px4" => parse_apj(&bytes, ImageFormat::Px4),
        "hex" => parse_intel_hex(&bytes),
        "bin" => Ok(parse_raw_bin(bytes)),
        other => Err(FirmwareError::BadImageFormat(format!(
            "unrecognised firmware extension {other:?}"
        ))),
    }
}

#[derive(Deserialize)]
struct ApjWrapper {
    image: String,
    board_id: Option<u32>,
    image_size: Option<u64>,
}

/// `.apj` / `.px4`: JSON wrapper with a base64 gzipped image.
pub fn parse_apj(bytes: &[u8], format: ImageFormat) -> Result<FirmwareImage, FirmwareError> {
    let wrapper: ApjWrapper = serde_json::from_slice(bytes)
        .map_err(|e| FirmwareError::BadImageFormat(format!("apj wrapper: {e}")))?;
    let compressed = base64::engine::general_purpose::STANDARD
        .decode(wrapper.image.trim().replace(['\n', '\r'], ""))
        .map_err(|e| FirmwareError::BadImageFormat(format!("apj image base64: {e}")))?;
    let mut image = Vec::new();
    flate2::read::GzDecoder::new(compressed.as_slice())
        .read_to_end(&mut image)
        .map_err(|e| FirmwareError::BadImageFormat(format!("apj image gzip: {e}")))?;
    if let Some(expected) = wrapper.image_size {
        if expected != image.len() as u64 {
            return Err(FirmwareError::BadImageFormat(format!(
                "apj image_size {expected} does not match decoded length {}",
                image.len()
            )));
        }
    }
    Ok(FirmwareImage {
        format,
        board_id: wrapper.board_id,
        segments: vec![Segment {
            address: FLASH_BASE,
            data: image,
        }],
    })
}

/// Intel HEX with extended linear addressing, merged into contiguous
/// segments.
pub fn parse_intel_hex(bytes: &[u8]) -> Result<FirmwareImage, FirmwareError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| FirmwareError::BadImageFormat("hex file is not ASCII".into()))?;
    let mut upper: u32 = 0;
    let mut segments: Vec<Segment> = Vec::new();
    for record in ihex::Reader::new(text) {
        let record =
            record.map_err(|e| FirmwareError::BadImageFormat(format!("hex record: {e}")))?;
        match record {
            ihex::Record::Data { offset, value } => {
                let address = upper | u32::from(offset);
                match segments.last_mut() {
                    Some(last) if last.address + last.data.len() as u32 == address => {
                        last.data.extend_from_slice(&value);
                    }
                    _ => segments.push(Segment {
                        address,
                        data: value,
                    }),
                }
            }
            ihex::Record::ExtendedLinearAddress(base) => {
                upper = u32::from(base) << 16;
            }
            ihex::Record::ExtendedSegmentAddress(base) => {
                upper = u32::from(base) << 4;
            }
            ihex::Record::StartLinearAddress(_)
            | ihex::Record::StartSegmentAddress { .. }
            | ihex::Record::EndOfFile => {}
        }
    }
    if segments.is_empty() {
        return Err(FirmwareError::BadImageFormat("hex file has no data".into()));
    }
    segments.sort_by_key(|s| s.address);
    Ok(FirmwareImage {
        format: ImageFormat::IntelHex,
        board_id: None,
        segments,
    })
}

/// Raw binary, assumed linked at the flash base.
pub fn parse_raw_bin(data: Vec<u8>) -> FirmwareImage {
    FirmwareImage {
        format: ImageFormat::RawBin,
        board_id: None,
        segments: vec![Segment {
            address: FLASH_BASE,
            data,
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn apj_bytes(board_id: u32, image: &[u8]) -> Vec<u8> {
        let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        gz.write_all(image).unwrap();
        let compressed = gz.finish().unwrap();
        let encoded = base64::engine::general_purpose::STANDARD.encode(compressed);
        serde_json::to_vec(&serde_json::json!({
            "board_id": board_id,
            "image_size": image.len(),
            "image": encoded,
        }))
        .unwrap()
    }

    #[test]
    fn apj_roundtrip() {
        let payload = vec![0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x11];
        let image = parse_apj(&apj_bytes(1016, &payload), ImageFormat::Apj).unwrap();
        assert_eq!(image.board_id, Some(1016));
        assert_eq!(image.segments.len(), 1);
        assert_eq!(image.segments[0].address, FLASH_BASE);
        assert_eq!(image.segments[0].data, payload);
    }

    #[test]
    fn apj_size_mismatch_rejected() {
        let payload = vec![1, 2, 3];
        let mut bytes = apj_bytes(9, &payload);
        let text = String::from_utf8(bytes.clone())
            .unwrap()
            .replace("\"image_size\":3", "\"image_size\":4");
        bytes = text.into_bytes();
        assert!(matches!(
            parse_apj(&bytes, ImageFormat::Apj),
            Err(FirmwareError::BadImageFormat(_))
        ));
    }

    #[test]
    fn intel_hex_merges_contiguous_records() {
        // Two contiguous data records at 0x0800_0000.
        let records = vec![
            ihex::Record::ExtendedLinearAddress(0x0800),
            ihex::Record::Data {
                offset: 0x0000,
                value: vec![1, 2, 3, 4],
            },
            ihex::Record::Data {
                offset: 0x0004,
                value: vec![5, 6],
            },
            ihex::Record::EndOfFile,
        ];
        let text = ihex::create_object_file_representation(&records).unwrap();
        let image = parse_intel_hex(text.as_bytes()).unwrap();
        assert_eq!(image.segments.len(), 1);
        assert_eq!(image.segments[0].address, 0x0800_0000);
        assert_eq!(image.segments[0].data, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn intel_hex_split_segments_stay_separate() {
        let records = vec![
            ihex::Record::ExtendedLinearAddress(0x0800),
            ihex::Record::Data {
                offset: 0x0000,
                value: vec![1, 2],
            },
            ihex::Record::Data {
                offset: 0x0100,
                value: vec![3, 4],
            },
            ihex::Record::EndOfFile,
        ];
        let text = ihex::create_object_file_representation(&records).unwrap();
        let image = parse_intel_hex(text.as_bytes()).unwrap();
        assert_eq!(image.segments.len(), 2);
    }
}

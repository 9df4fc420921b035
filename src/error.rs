//! Error taxonomy.
//!
//! Every error kind carries a structured cause; the shell phrases them, the
//! core only classifies. Codec-level framing errors never appear here: the
//! decoders resync on the next start byte and count the occurrence instead.

use std::io;

use thiserror::Error;

/// Errors raised by the byte-pipe layer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("port not found")]
    NotFound,
    #[error("port busy (exclusively held by another process)")]
    Busy,
    #[error("permission denied opening port")]
    PermissionDenied,
    #[error("transport disconnected")]
    Disconnected,
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<serialport::Error> for TransportError {
    fn from(e: serialport::Error) -> Self {
        match e.kind {
            serialport::ErrorKind::NoDevice => Self::NotFound,
            serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied) => Self::PermissionDenied,
            serialport::ErrorKind::Io(kind) => Self::Io(kind.into()),
            _ => Self::Io(io::Error::other(e.description)),
        }
    }
}

/// Errors raised while decoding or interpreting a wire frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("framing error: {0}")]
    Framing(&'static str),
    #[error("CRC mismatch (expected {expected:#06x}, got {got:#06x})")]
    Crc { expected: u16, got: u16 },
    #[error("unknown message id {id}")]
    UnknownMessage { id: u32 },
    #[error("frame arrived with unexpected direction")]
    UnexpectedDirection,
}

/// Errors resolving a request/response call on the link.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("no matching response before the deadline")]
    Timeout,
    #[error("peer answered NAK")]
    Nak,
    #[error("call cancelled")]
    Cancelled,
    #[error("link disconnected")]
    Disconnected,
}

/// Terminal outcomes of the board-detection state machine.
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("no protocol answered on this port")]
    AllProtocolsFailed,
    #[error("port disappeared during detection")]
    AbortedByPortChange,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors around firmware catalogues, downloads and image files.
#[derive(Debug, Error)]
pub enum FirmwareError {
    #[error("manifest for {origin} unreachable: {reason}")]
    ManifestUnreachable { origin: &'static str, reason: String },
    #[error("no matching board in catalogue")]
    NoMatchingBoard,
    #[error("image built for board id {image}, detected board id {expected}")]
    IncompatibleImage { expected: u32, image: u32 },
    #[error("bad image format: {0}")]
    BadImageFormat(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Stage-tagged flash failure.
#[derive(Debug, Error)]
#[error("flash failed during {stage:?}: {cause}")]
pub struct FlashError {
    pub stage: crate::flash::FlashStage,
    #[source]
    pub cause: FlashCause,
}

/// Underlying cause of a [`FlashError`].
#[derive(Debug, Error)]
pub enum FlashCause {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Firmware(#[from] FirmwareError),
    #[error(transparent)]
    Bootloader(#[from] crate::stboot::BootloaderError),
    #[error("board did not re-enumerate after reboot")]
    ReenumerationTimeout,
    #[error("read-back mismatch at {address:#010x}")]
    VerifyMismatch { address: u32 },
    #[error("external flasher exited with status {0}")]
    ExternalFlasher(i32),
    #[error("usb error: {0}")]
    Usb(String),
    #[error("aborted by operator")]
    Aborted,
}

/// Errors in the chunked mission/rally transfer protocol.
#[derive(Debug, Error)]
pub enum MissionError {
    #[error("vehicle rejected the transfer (MISSION_ACK type {0})")]
    AckRejected(u8),
    #[error("item {got} arrived while expecting {expected}")]
    OutOfOrderItem { expected: u16, got: u16 },
    #[error("transfer timed out")]
    Timeout,
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

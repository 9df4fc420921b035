//! Device-side runtime for a ground-control and firmware-provisioning
//! station.
//!
//! The crate owns exactly one serial/USB device at a time and multiplexes it
//! across three wire protocols (MAVLink v1/v2, MSP v1/v2 and the STM32 UART
//! bootloader), layering board detection, firmware flashing, mission/rally
//! transfer, parameter and flight-mode services on top. All outward signals
//! are delivered as an ordered stream of [`event::Event`] records; the crate
//! never formats user-facing text.
//!
//! # Architecture
//!
//! ```text
//! transport ─→ codecs (mavlink / msp / stboot) ─→ link multiplexer
//!                                                   ├─ detect
//!                                                   ├─ flash
//!                                                   ├─ mission / params / modes
//!                                                   └─ telemetry subscribers
//!                                          event bus ─→ shell
//! ```
//!
//! The [`session::Session`] facade is the in-process call surface consumed
//! by the graphical shell.

#![deny(clippy::all)]
#![warn(clippy::use_self)]

pub mod detect;
pub mod error;
pub mod event;
pub mod firmware;
pub mod flash;
pub mod link;
pub mod mavlink;
pub mod mission;
pub mod modes;
pub mod msp;
pub mod params;
pub mod session;
pub mod stboot;
pub mod transport;

pub use detect::{BoardKind, DetectedBoard, DetectionMethod, Flasher};
pub use error::{
    DetectionError, FirmwareError, FlashError, MissionError, ProtocolError, RpcError,
    TransportError,
};
pub use event::{Event, EventBus, EventReceiver, EventSender};
pub use link::{Expect, Frame, Link, LinkConfig, ProtocolSet};
pub use session::Session;

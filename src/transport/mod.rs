//! Byte-pipe layer.
//!
//! A [`Transport`] owns one duplex byte pipe. The primary implementation is
//! a local serial/USB-CDC port; a loopback pair exists for tests. Exactly
//! one transport is open at any instant — the link owns it from `connect`
//! until `disconnect` and releases it on any terminal error.

mod loopback;
mod serial;
mod watcher;

pub use loopback::{loopback_pair, LoopbackTransport};
pub use serial::SerialTransport;
pub use watcher::{PortWatcher, DEFAULT_POLL_PERIOD};

use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportError;

/// Identity of an enumerable port.
///
/// `(path, vid, pid)` is the tuple the hot-unplug watcher diffs between
/// polls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub path: String,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub manufacturer: Option<String>,
    pub serial_number: Option<String>,
}

impl PortInfo {
    /// The identity tuple used for change detection.
    pub fn identity(&self) -> (&str, Option<u16>, Option<u16>) {
        (&self.path, self.vendor_id, self.product_id)
    }
}

/// List available serial ports without opening any of them.
///
/// Pure query, safe to poll at 0.5 Hz; this is also the heartbeat the shell
/// uses to detect hot-unplug.
pub fn enumerate() -> Result<Vec<PortInfo>, TransportError> {
    let ports = serialport::available_ports()?;
    Ok(ports
        .into_iter()
        .map(|p| {
            let (vendor_id, product_id, manufacturer, serial_number) = match p.port_type {
                serialport::SerialPortType::UsbPort(usb) => (
                    Some(usb.vid),
                    Some(usb.pid),
                    usb.manufacturer,
                    usb.serial_number,
                ),
                _ => (None, None, None, None),
            };
            PortInfo {
                path: p.port_name,
                vendor_id,
                product_id,
                manufacturer,
                serial_number,
            }
        })
        .collect())
}

/// Line parity for [`Transport`] implementations that have a UART beneath
/// them. The STM32 UART bootloader requires even parity; everything else
/// runs 8N1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    #[default]
    None,
    Even,
}

/// One exclusive duplex byte pipe.
#[async_trait]
pub trait Transport: Send {
    /// Read whatever is available into `buf`, waiting for at least one byte.
    ///
    /// Never resolves with `Ok(0)`: end of stream is reported as
    /// [`TransportError::Disconnected`].
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Write the whole slice. Partial writes are retried internally until
    /// the slice is drained or the port closes.
    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Block until buffered outbound bytes have been handed to the OS.
    async fn drain(&mut self) -> Result<(), TransportError>;

    /// Drive the modem control lines. Required for STM32 bootloader entry
    /// on USB-serial bridges.
    fn set_dtr_rts(&mut self, dtr: bool, rts: bool) -> Result<(), TransportError>;

    /// Hold a break condition on the line for `duration`.
    async fn send_break(&mut self, duration: Duration) -> Result<(), TransportError>;

    /// Close the pipe. Idempotent.
    fn close(&mut self);

    /// Path of the underlying device, when there is one.
    fn path(&self) -> Option<&str> {
        None
    }

    /// Split into independent reader and writer halves, so the link's
    /// reader task and writer task can run concurrently. Control-line
    /// access does not survive the split; bootloader sessions keep the
    /// transport whole instead.
    fn split(self: Box<Self>) -> (Box<dyn TransportReader>, Box<dyn TransportWriter>);
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        (**self).read(buf).await
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        (**self).write_all(bytes).await
    }

    async fn drain(&mut self) -> Result<(), TransportError> {
        (**self).drain().await
    }

    fn set_dtr_rts(&mut self, dtr: bool, rts: bool) -> Result<(), TransportError> {
        (**self).set_dtr_rts(dtr, rts)
    }

    async fn send_break(&mut self, duration: Duration) -> Result<(), TransportError> {
        (**self).send_break(duration).await
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn path(&self) -> Option<&str> {
        (**self).path()
    }

    fn split(self: Box<Self>) -> (Box<dyn TransportReader>, Box<dyn TransportWriter>) {
        (*self).split()
    }
}

/// Inbound half of a split [`Transport`].
#[async_trait]
pub trait TransportReader: Send {
    /// Same contract as [`Transport::read`].
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;
}

/// Outbound half of a split [`Transport`].
#[async_trait]
pub trait TransportWriter: Send {
    /// Same contract as [`Transport::write_all`].
    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Same contract as [`Transport::drain`].
    async fn drain(&mut self) -> Result<(), TransportError>;

    fn close(&mut self);
}

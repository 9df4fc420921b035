//! Local serial/USB-CDC transport over `tokio-serial`.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use serialport::SerialPort;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use super::{Parity, Transport, TransportReader, TransportWriter};
use crate::error::TransportError;

pub struct SerialTransport {
    stream: Option<SerialStream>,
    path: String,
}

impl SerialTransport {
    /// Open `path` exclusively at `baud`, 8 data bits, 1 stop bit, no flow
    /// control.
    pub fn open(path: &str, baud: u32, parity: Parity) -> Result<Self, TransportError> {
        let parity = match parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
        };
        let stream = tokio_serial::new(path, baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(parity)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open_native_async()
            .map_err(|e| match e.kind {
                tokio_serial::ErrorKind::NoDevice => TransportError::NotFound,
                tokio_serial::ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
                    TransportError::PermissionDenied
                }
                tokio_serial::ErrorKind::Io(io::ErrorKind::AlreadyExists) => TransportError::Busy,
                tokio_serial::ErrorKind::Io(kind) => TransportError::Io(kind.into()),
                _ => TransportError::Io(io::Error::other(e.description)),
            })?;
        Ok(Self {
            stream: Some(stream),
            path: path.to_owned(),
        })
    }

    fn stream(&mut self) -> Result<&mut SerialStream, TransportError> {
        self.stream.as_mut().ok_or(TransportError::Disconnected)
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let n = self.stream()?.read(buf).await?;
        if n == 0 {
            // A USB-CDC device that re-enumerated reads as EOF.
            self.close();
            return Err(TransportError::Disconnected);
        }
        Ok(n)
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.stream()?.write_all(bytes).await?;
        Ok(())
    }

    async fn drain(&mut self) -> Result<(), TransportError> {
        self.stream()?.flush().await?;
        Ok(())
    }

    fn set_dtr_rts(&mut self, dtr: bool, rts: bool) -> Result<(), TransportError> {
        let stream = self.stream()?;
        stream.write_data_terminal_ready(dtr)?;
        stream.write_request_to_send(rts)?;
        Ok(())
    }

    async fn send_break(&mut self, duration: Duration) -> Result<(), TransportError> {
        self.stream()?.set_break()?;
        tokio::time::sleep(duration).await;
        self.stream()?.clear_break()?;
        Ok(())
    }

    fn close(&mut self) {
        self.stream = None;
    }

    fn path(&self) -> Option<&str> {
        Some(&self.path)
    }

    fn split(self: Box<Self>) -> (Box<dyn TransportReader>, Box<dyn TransportWriter>) {
        match self.stream {
            Some(stream) => {
                let (read, write) = tokio::io::split(stream);
                (
                    Box::new(SerialReadHalf { read: Some(read) }),
                    Box::new(SerialWriteHalf { write: Some(write) }),
                )
            }
            None => (
                Box::new(SerialReadHalf { read: None }),
                Box::new(SerialWriteHalf { write: None }),
            ),
        }
    }
}

struct SerialReadHalf {
    read: Option<tokio::io::ReadHalf<SerialStream>>,
}

struct SerialWriteHalf {
    write: Option<tokio::io::WriteHalf<SerialStream>>,
}

#[async_trait]
impl TransportReader for SerialReadHalf {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let read = self.read.as_mut().ok_or(TransportError::Disconnected)?;
        let n = read.read(buf).await?;
        if n == 0 {
            self.read = None;
            return Err(TransportError::Disconnected);
        }
        Ok(n)
    }
}

#[async_trait]
impl TransportWriter for SerialWriteHalf {
    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let write = self.write.as_mut().ok_or(TransportError::Disconnected)?;
        write.write_all(bytes).await?;
        Ok(())
    }

    async fn drain(&mut self) -> Result<(), TransportError> {
        let write = self.write.as_mut().ok_or(TransportError::Disconnected)?;
        write.flush().await?;
        Ok(())
    }

    fn close(&mut self) {
        self.write = None;
    }
}

//! In-memory transport pair for tests.
//!
//! `loopback_pair()` returns two connected ends; bytes written to one are
//! read from the other. Dropping or closing either end disconnects both.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Transport, TransportReader, TransportWriter};
use crate::error::TransportError;

pub struct LoopbackTransport {
    tx: Option<mpsc::Sender<Vec<u8>>>,
    rx: mpsc::Receiver<Vec<u8>>,
    // Unread remainder of the last received chunk.
    pending: Vec<u8>,
}

/// Two connected in-memory transports.
pub fn loopback_pair() -> (LoopbackTransport, LoopbackTransport) {
    let (a_tx, b_rx) = mpsc::channel(64);
    let (b_tx, a_rx) = mpsc::channel(64);
    (
        LoopbackTransport {
            tx: Some(a_tx),
            rx: a_rx,
            pending: Vec::new(),
        },
        LoopbackTransport {
            tx: Some(b_tx),
            rx: b_rx,
            pending: Vec::new(),
        },
    )
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if self.pending.is_empty() {
            match self.rx.recv().await {
                Some(chunk) => self.pending = chunk,
                None => return Err(TransportError::Disconnected),
            }
        }
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Disconnected)?;
        tx.send(bytes.to_vec())
            .await
            .map_err(|_| TransportError::Disconnected)
    }

    async fn drain(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    fn set_dtr_rts(&mut self, _dtr: bool, _rts: bool) -> Result<(), TransportError> {
        Ok(())
    }

    async fn send_break(&mut self, _duration: Duration) -> Result<(), TransportError> {
        Ok(())
    }

    fn close(&mut self) {
        self.tx = None;
        self.rx.close();
    }

    fn split(self: Box<Self>) -> (Box<dyn TransportReader>, Box<dyn TransportWriter>) {
        (
            Box::new(LoopbackReadHalf {
                rx: self.rx,
                pending: self.pending,
            }),
            Box::new(LoopbackWriteHalf { tx: self.tx }),
        )
    }
}

struct LoopbackReadHalf {
    rx: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

struct LoopbackWriteHalf {
    tx: Option<mpsc::Sender<Vec<u8>>>,
}

#[async_trait]
impl TransportReader for LoopbackReadHalf {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if self.pending.is_empty() {
            match self.rx.recv().await {
                Some(chunk) => self.pending = chunk,
                None => return Err(TransportError::Disconnected),
            }
        }
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

#[async_trait]
impl TransportWriter for LoopbackWriteHalf {
    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Disconnected)?;
        tx.send(bytes.to_vec())
            .await
            .map_err(|_| TransportError::Disconnected)
    }

    async fn drain(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    fn close(&mut self) {
        self.tx = None;
    }
}

//! Outbound event stream.
//!
//! Every outward signal — state transitions, detection results, progress,
//! telemetry samples, errors — is serialised into one ordered sequence of
//! immutable [`Event`] records. The channel is bounded: a slow consumer
//! exerts backpressure on producers (the MSP poller skips ticks, the flash
//! runner blocks on its next progress emit). Events are never dropped
//! silently; coalescing exists only on the `latest-only` telemetry
//! subscriber path inside the link.

use tokio::sync::mpsc;

use crate::detect::DetectedBoard;
use crate::error::DetectionError;
use crate::flash::FlashStage;
use crate::link::TelemetrySample;
use crate::transport::PortInfo;

/// Default bound of the shell-facing event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// One outbound record. Tagged by kind, immutable once emitted.
#[derive(Debug, Clone)]
pub enum Event {
    /// The set of enumerable ports changed.
    PortsChanged(Vec<PortInfo>),
    /// The port backing the active link vanished from enumeration.
    PortDisappeared { path: String },
    LinkConnected { path: String },
    LinkDisconnected { path: String },
    /// One CRC failure observed on the wire. Emitted per occurrence so the
    /// shell can display a link-quality meter.
    CrcError { protocol: &'static str },
    DetectionStep { description: &'static str },
    DetectionResult(Box<DetectedBoard>),
    DetectionFailed {
        attempted: Vec<&'static str>,
        last_error: String,
    },
    DetectionAborted,
    FlashStage { stage: FlashStage },
    FlashProgress {
        stage: FlashStage,
        done: u64,
        total: u64,
    },
    FlashComplete,
    FlashFailed { stage: FlashStage, cause: String },
    /// The board needs its physical boot pads bridged; this is a recovery
    /// path for USB-serial bridge boards, not a failure.
    RequireManualBootPads { board: String },
    /// No cross-firmware target mapping exists for this board.
    UnmatchedBoardWarning { board: String, wanted: &'static str },
    MissionProgress { done: u16, total: u16 },
    MissionTransferComplete { count: u16 },
    ParamProgress { done: u16, total: u16 },
    ParamChanged { id: String, value: f32 },
    Telemetry(TelemetrySample),
}

/// Producer half of the event bus. Cheap to clone; every component that
/// reports outward holds one.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Event>,
}

/// Consumer half, held by the shell.
pub struct EventReceiver {
    rx: mpsc::Receiver<Event>,
}

/// Constructor for the single ordered event stream.
pub struct EventBus;

impl EventBus {
    pub fn channel(capacity: usize) -> (EventSender, EventReceiver) {
        let (tx, rx) = mpsc::channel(capacity);
        (EventSender { tx }, EventReceiver { rx })
    }
}

impl EventSender {
    /// Emit one event, awaiting channel space if the consumer is behind.
    ///
    /// A closed receiver (shell went away) is logged once per call site and
    /// otherwise ignored; the core keeps running headless.
    pub async fn emit(&self, event: Event) {
        if self.tx.send(event).await.is_err() {
            log::warn!("event receiver closed, event discarded");
        }
    }

    /// Detached sender that never observes the consumer; used by tests.
    pub fn sink() -> Self {
        let (tx, mut rx) = mpsc::channel(16);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        Self { tx }
    }
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

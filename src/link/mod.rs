//! Link multiplexer.
//!
//! The link owns the transport and one decoder per enabled protocol
//! family. A single I/O task drains the port and serialises outbound
//! writes, so the bytes of one frame are never interleaved with another's.
//! Decoded frames are routed to exactly one pending RPC waiter or broadcast
//! to the telemetry subscribers — never both, never neither.
//!
//! Correlation rules:
//! - MAVLink: message id equal, plus an optional extractor predicate.
//! - MSP: function number equal and direction = response (an error
//!   direction resolves the call as NAK). The link enforces single-flight:
//!   at most one outstanding MSP request at a time.
//! - Bootloader: the next ACK/NAK byte while a probe waiter is pending.
//!
//! When two waiters could match one frame, the older one wins. On
//! disconnect every pending waiter resolves `Disconnected`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use crate::error::RpcError;
use crate::event::{Event, EventSender};
use crate::mavlink::messages::{
    AttitudeData, BatteryStatusData, GpsRawIntData, MavMessage, RcChannelsData,
    RequestDataStreamData, VfrHudData,
};
use crate::mavlink::signing::{SigningConfig, SigningData};
use crate::mavlink::{MavHeader, MavRawFrame, MavlinkDecoder, MavlinkVersion, MavlinkV2Raw};
use crate::msp::{self, MspDecoder, MspDirection, MspFrame, MspVersion};
use crate::stboot::{ACK, NAK};
use crate::transport::Transport;

/// Maximum telemetry request rate the link will ask a flight controller
/// for.
pub const MAX_TELEMETRY_RATE_HZ: f32 = 20.0;

const OUTBOUND_QUEUE: usize = 64;
const SUBSCRIBER_QUEUE: usize = 32;

/// The universal unit on the multiplexer's input side.
#[derive(Debug, Clone)]
pub enum Frame {
    MavlinkV1(crate::mavlink::MavlinkV1Raw),
    MavlinkV2(MavlinkV2Raw),
    MspV1(MspFrame),
    MspV2(MspFrame),
    /// `true` for ACK, `false` for NAK.
    BootloaderAck(bool),
    RawBytes(Vec<u8>),
}

impl Frame {
    /// Typed MAVLink message, when this is a MAVLink frame.
    pub fn mavlink(&self) -> Option<MavMessage> {
        match self {
            Self::MavlinkV1(raw) => Some(MavRawFrame::V1(*raw).decode()),
            Self::MavlinkV2(raw) => Some(MavRawFrame::V2(*raw).decode()),
            _ => None,
        }
    }

    pub fn msp(&self) -> Option<&MspFrame> {
        match self {
            Self::MspV1(f) | Self::MspV2(f) => Some(f),
            _ => None,
        }
    }
}

/// Which protocol decoders the link feeds. Fixed for the lifetime of a
/// connection once detection settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolSet {
    pub mavlink: bool,
    pub msp: bool,
    pub bootloader: bool,
}

impl ProtocolSet {
    /// Everything enabled — the detection FSM starts here.
    pub fn all() -> Self {
        Self {
            mavlink: true,
            msp: true,
            bootloader: true,
        }
    }

    pub fn mavlink_only() -> Self {
        Self {
            mavlink: true,
            msp: false,
            bootloader: false,
        }
    }

    pub fn msp_only() -> Self {
        Self {
            mavlink: false,
            msp: true,
            bootloader: false,
        }
    }
}

/// Link construction parameters.
#[derive(Clone)]
pub struct LinkConfig {
    pub protocols: ProtocolSet,
    pub mav_version: MavlinkVersion,
    /// Our ids on the MAVLink side.
    pub system_id: u8,
    pub component_id: u8,
    /// The vehicle we address.
    pub target_system: u8,
    pub target_component: u8,
    pub signing: Option<SigningConfig>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            protocols: ProtocolSet::all(),
            mav_version: MavlinkVersion::V2,
            system_id: 255,
            component_id: 190,
            target_system: 1,
            target_component: 1,
            signing: None,
        }
    }
}

/// What a pending RPC call is waiting for.
pub enum Expect {
    Mavlink {
        msg_id: u32,
        predicate: Option<Box<dyn Fn(&MavMessage) -> bool + Send>>,
    },
    Msp {
        function: u16,
    },
    /// The next ACK/NAK byte of a scripted bootloader exchange.
    BootloaderAck,
    /// The next `count` raw bytes of a scripted bootloader exchange.
    BootloaderData { count: usize },
}

impl Expect {
    fn matches(&self, frame: &Frame) -> bool {
        match (self, frame) {
            (Expect::Mavlink { msg_id, predicate }, Frame::MavlinkV1(_) | Frame::MavlinkV2(_)) => {
                let Some(message) = frame.mavlink() else {
                    return false;
                };
                if message.message_id() != *msg_id {
                    return false;
                }
                predicate.as_ref().map_or(true, |p| p(&message))
            }
            (Expect::Msp { function }, Frame::MspV1(f) | Frame::MspV2(f)) => {
                f.function == *function && f.direction != MspDirection::Request
            }
            (Expect::BootloaderAck, Frame::BootloaderAck(_)) => true,
            (Expect::BootloaderData { count }, Frame::RawBytes(bytes)) => bytes.len() == *count,
            _ => false,
        }
    }
}

/// Outbound payloads accepted by the writer.
pub enum Outbound {
    Mavlink(MavMessage),
    Msp(MspFrame),
    Raw(Vec<u8>),
}

/// Telemetry streams a subscriber can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Attitude,
    VfrHud,
    Gps,
    Battery,
    RcChannels,
    MspTelemetry,
}

/// One decoded telemetry value.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetrySample {
    Attitude(AttitudeData),
    VfrHud(VfrHudData),
    Gps(GpsRawIntData),
    Battery(BatteryStatusData),
    RcChannels(RcChannelsData),
    /// Roll/pitch in decidegrees, yaw in degrees, from `MSP_ATTITUDE`.
    MspAttitude { roll: i16, pitch: i16, yaw: i16 },
    /// Battery voltage in decivolts and current in centiamps, from
    /// `MSP_ANALOG`.
    MspAnalog { vbat: u8, amperage: i16 },
}

impl TelemetrySample {
    pub fn stream(&self) -> StreamKind {
        match self {
            Self::Attitude(_) => StreamKind::Attitude,
            Self::VfrHud(_) => StreamKind::VfrHud,
            Self::Gps(_) => StreamKind::Gps,
            Self::Battery(_) => StreamKind::Battery,
            Self::RcChannels(_) => StreamKind::RcChannels,
            Self::MspAttitude { .. } | Self::MspAnalog { .. } => StreamKind::MspTelemetry,
        }
    }

    fn from_mavlink(message: &MavMessage) -> Option<Self> {
        match message {
            MavMessage::Attitude(d) => Some(Self::Attitude(*d)),
            MavMessage::VfrHud(d) => Some(Self::VfrHud(*d)),
            MavMessage::GpsRawInt(d) => Some(Self::Gps(*d)),
            MavMessage::BatteryStatus(d) => Some(Self::Battery(*d)),
            MavMessage::RcChannels(d) => Some(Self::RcChannels(*d)),
            _ => None,
        }
    }
}

/// Delivery semantics a subscriber opts into per stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Every sample, in decode order, through a bounded queue.
    Ordered,
    /// Only the newest value between two reads.
    LatestOnly,
}

/// Handle for unsubscribing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryToken(u64);

/// Receiving side of a telemetry subscription.
pub enum TelemetryReceiver {
    Ordered(mpsc::Receiver<TelemetrySample>),
    Latest(watch::Receiver<Option<TelemetrySample>>),
}

enum SubscriberSink {
    Ordered(mpsc::Sender<TelemetrySample>),
    Latest(watch::Sender<Option<TelemetrySample>>),
}

struct Subscriber {
    token: u64,
    stream: StreamKind,
    sink: SubscriberSink,
}

struct Waiter {
    id: u64,
    expect: Expect,
    tx: oneshot::Sender<Frame>,
}

enum LinkCmd {
    SendMavlink(MavMessage),
    SendBytes(Vec<u8>),
    Close,
}

struct Shared {
    waiters: StdMutex<Vec<Waiter>>,
    subscribers: StdMutex<Vec<Subscriber>>,
    connected: AtomicBool,
    next_id: AtomicU64,
    /// Single-flight guard: at most one outstanding MSP request on the
    /// wire.
    msp_gate: Mutex<()>,
    /// At most one bulk transfer (mission up/download, parameter dump) per
    /// link; flashing takes the whole link instead.
    bulk_gate: Mutex<()>,
    /// Partial bootloader data read.
    boot_buf: StdMutex<Vec<u8>>,
    events: EventSender,
    disconnect: watch::Sender<bool>,
}

impl Shared {
    fn register_waiter(&self, expect: Expect) -> (u64, oneshot::Receiver<Frame>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().unwrap().push(Waiter { id, expect, tx });
        (id, rx)
    }

    fn remove_waiter(&self, id: u64) {
        self.waiters.lock().unwrap().retain(|w| w.id != id);
    }

    /// Consume one inbound byte on behalf of the oldest pending bootloader
    /// waiter, when there is one. Returns a frame once an ACK/NAK arrives
    /// or a data read fills up; `None` when the byte was swallowed or does
    /// not belong to the bootloader at all.
    fn feed_bootloader(&self, byte: u8) -> Option<Option<Frame>> {
        let waiters = self.waiters.lock().unwrap();
        let oldest = waiters.iter().find(|w| {
            matches!(
                w.expect,
                Expect::BootloaderAck | Expect::BootloaderData { .. }
            )
        })?;
        match oldest.expect {
            Expect::BootloaderAck if byte == ACK || byte == NAK => {
                Some(Some(Frame::BootloaderAck(byte == ACK)))
            }
            Expect::BootloaderAck => None,
            Expect::BootloaderData { count } => {
                let mut buf = self.boot_buf.lock().unwrap();
                buf.push(byte);
                if buf.len() >= count {
                    Some(Some(Frame::RawBytes(std::mem::take(&mut *buf))))
                } else {
                    Some(None)
                }
            }
            _ => None,
        }
    }

    /// Deliver to the oldest matching waiter, or hand back the frame for
    /// broadcast.
    fn try_deliver(&self, frame: Frame) -> Option<Frame> {
        let mut waiters = self.waiters.lock().unwrap();
        if let Some(pos) = waiters.iter().position(|w| w.expect.matches(&frame)) {
            let waiter = waiters.remove(pos);
            // A receiver that gave up concurrently turns this into a stray
            // frame; strays go to the broadcaster like any retransmit.
            match waiter.tx.send(frame) {
                Ok(()) => None,
                Err(frame) => Some(frame),
            }
        } else {
            Some(frame)
        }
    }

    async fn broadcast_sample(&self, sample: TelemetrySample) {
        let sinks: Vec<(SubscriberSinkHandle, TelemetrySample)> = {
            let subscribers = self.subscribers.lock().unwrap();
            subscribers
                .iter()
                .filter(|s| s.stream == sample.stream())
                .map(|s| {
                    let handle = match &s.sink {
                        SubscriberSink::Ordered(tx) => SubscriberSinkHandle::Ordered(tx.clone()),
                        SubscriberSink::Latest(tx) => SubscriberSinkHandle::Latest(tx.clone()),
                    };
                    (handle, sample.clone())
                })
                .collect()
        };
        for (sink, sample) in sinks {
            match sink {
                SubscriberSinkHandle::Ordered(tx) => {
                    // Bounded: a slow ordered subscriber backpressures the
                    // reader rather than losing samples.
                    let _ = tx.send(sample).await;
                }
                SubscriberSinkHandle::Latest(tx) => {
                    let _ = tx.send(Some(sample));
                }
            }
        }
    }

    fn fail_all_waiters(&self) {
        // Dropping the senders resolves every pending call Disconnected.
        self.waiters.lock().unwrap().clear();
    }
}

enum SubscriberSinkHandle {
    Ordered(mpsc::Sender<TelemetrySample>),
    Latest(watch::Sender<Option<TelemetrySample>>),
}

/// A registered-but-not-yet-awaited RPC waiter. Dropping it releases the
/// registration, so an abandoned waiter never swallows frames.
pub struct PendingReply {
    id: u64,
    rx: Option<oneshot::Receiver<Frame>>,
    shared: Arc<Shared>,
}

impl PendingReply {
    /// Await the matching frame or time out (releasing the waiter).
    pub async fn wait(mut self, timeout: Duration) -> Result<Frame, RpcError> {
        self.recv(timeout).await
    }

    /// Borrowing variant of [`wait`](Self::wait): losing a `select!` race
    /// does not drop the registration, so the waiter keeps listening.
    pub async fn recv(&mut self, timeout: Duration) -> Result<Frame, RpcError> {
        let rx = self.rx.as_mut().ok_or(RpcError::Cancelled)?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(frame)) => {
                self.rx = None;
                Ok(frame)
            }
            Ok(Err(_)) => {
                self.rx = None;
                Err(RpcError::Disconnected)
            }
            Err(_) => Err(RpcError::Timeout),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        // No-op when the frame was already delivered (delivery removes the
        // waiter first).
        self.shared.remove_waiter(self.id);
    }
}

/// An open connection to a flight controller.
pub struct Link {
    cmd_tx: mpsc::Sender<LinkCmd>,
    shared: Arc<Shared>,
    config: LinkConfig,
    io_task: JoinHandle<()>,
    pollers: StdMutex<Vec<JoinHandle<()>>>,
    path: Option<String>,
}

impl Link {
    /// Take ownership of an open transport and start the I/O task.
    pub fn open(transport: Box<dyn Transport>, config: LinkConfig, events: EventSender) -> Self {
        let path = transport.path().map(str::to_owned);
        let (cmd_tx, cmd_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (disconnect_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            waiters: StdMutex::new(Vec::new()),
            subscribers: StdMutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            msp_gate: Mutex::new(()),
            bulk_gate: Mutex::new(()),
            boot_buf: StdMutex::new(Vec::new()),
            events,
            disconnect: disconnect_tx,
        });
        let io_task = tokio::spawn(io_loop(
            transport,
            config.clone(),
            cmd_rx,
            Arc::clone(&shared),
        ));
        Self {
            cmd_tx,
            shared,
            config,
            io_task,
            pollers: StdMutex::new(Vec::new()),
            path,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Resolves when the link drops, whatever the reason.
    pub fn disconnected(&self) -> watch::Receiver<bool> {
        self.shared.disconnect.subscribe()
    }

    /// Queue a MAVLink message; the I/O task stamps the sequence number.
    pub async fn send_mavlink(&self, message: MavMessage) -> Result<(), RpcError> {
        self.cmd_tx
            .send(LinkCmd::SendMavlink(message))
            .await
            .map_err(|_| RpcError::Disconnected)
    }

    /// Queue a pre-encoded byte run (bootloader probes).
    pub async fn send_bytes(&self, bytes: Vec<u8>) -> Result<(), RpcError> {
        self.cmd_tx
            .send(LinkCmd::SendBytes(bytes))
            .await
            .map_err(|_| RpcError::Disconnected)
    }

    /// Request/response call with a deadline.
    pub async fn call(
        &self,
        request: Outbound,
        expect: Expect,
        timeout: Duration,
    ) -> Result<Frame, RpcError> {
        let single_flight = matches!(
            (&request, &expect),
            (Outbound::Msp(_), Expect::Msp { .. })
        );
        if single_flight {
            let _flight = self.shared.msp_gate.lock().await;
            self.call_inner(request, expect, timeout).await
        } else {
            self.call_inner(request, expect, timeout).await
        }
    }

    async fn call_inner(
        &self,
        request: Outbound,
        expect: Expect,
        timeout: Duration,
    ) -> Result<Frame, RpcError> {
        if !self.is_connected() {
            return Err(RpcError::Disconnected);
        }
        let (id, rx) = self.shared.register_waiter(expect);
        let sent = match request {
            Outbound::Mavlink(message) => self.send_mavlink(message).await,
            Outbound::Msp(frame) => match frame.encode() {
                Ok(bytes) => self.send_bytes(bytes).await,
                Err(_) => Err(RpcError::Cancelled),
            },
            Outbound::Raw(bytes) => self.send_bytes(bytes).await,
        };
        if let Err(e) = sent {
            self.shared.remove_waiter(id);
            return Err(e);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            // Sender dropped: the link went down and failed all waiters.
            Ok(Err(_)) => Err(RpcError::Disconnected),
            Err(_) => {
                self.shared.remove_waiter(id);
                Err(RpcError::Timeout)
            }
        }
    }

    /// Claim the link's single bulk-transfer slot. Held for the whole of a
    /// mission transfer or parameter dump so two bulk operations never
    /// interleave.
    pub async fn begin_bulk(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.shared.bulk_gate.lock().await
    }

    /// Register a waiter now, await it later. Multi-step scripted
    /// exchanges register every expected reply before sending the command
    /// so no reply byte can race the registration.
    pub fn expect(&self, expect: Expect) -> PendingReply {
        let (id, rx) = self.shared.register_waiter(expect);
        PendingReply {
            id,
            rx: Some(rx),
            shared: Arc::clone(&self.shared),
        }
    }

    /// MAVLink call convenience: send `message`, await `expect_id` with an
    /// optional match predicate, decode the reply.
    pub async fn call_mavlink(
        &self,
        message: MavMessage,
        expect_id: u32,
        predicate: Option<Box<dyn Fn(&MavMessage) -> bool + Send>>,
        timeout: Duration,
    ) -> Result<MavMessage, RpcError> {
        let frame = self
            .call(
                Outbound::Mavlink(message),
                Expect::Mavlink {
                    msg_id: expect_id,
                    predicate,
                },
                timeout,
            )
            .await?;
        frame.mavlink().ok_or(RpcError::Cancelled)
    }

    /// MSP call convenience. An error-direction reply resolves as NAK.
    pub async fn call_msp(
        &self,
        function: u16,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<MspFrame, RpcError> {
        let frame = self
            .call(
                Outbound::Msp(MspFrame::request(function, payload)),
                Expect::Msp { function },
                timeout,
            )
            .await?;
        let msp = frame.msp().cloned().ok_or(RpcError::Cancelled)?;
        if msp.direction == MspDirection::Error {
            return Err(RpcError::Nak);
        }
        Ok(msp)
    }

    /// Register a telemetry subscriber. Registration is idempotent per
    /// token; unsubscribing releases the sink immediately.
    pub fn subscribe(
        &self,
        stream: StreamKind,
        mode: DeliveryMode,
    ) -> (TelemetryToken, TelemetryReceiver) {
        let token = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (sink, receiver) = match mode {
            DeliveryMode::Ordered => {
                let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
                (SubscriberSink::Ordered(tx), TelemetryReceiver::Ordered(rx))
            }
            DeliveryMode::LatestOnly => {
                let (tx, rx) = watch::channel(None);
                (SubscriberSink::Latest(tx), TelemetryReceiver::Latest(rx))
            }
        };
        self.shared.subscribers.lock().unwrap().push(Subscriber {
            token,
            stream,
            sink,
        });
        (TelemetryToken(token), receiver)
    }

    pub fn unsubscribe(&self, token: TelemetryToken) {
        self.shared
            .subscribers
            .lock()
            .unwrap()
            .retain(|s| s.token != token.0);
    }

    /// Ask the FC for periodic MAVLink telemetry at `rate_hz`, capped at
    /// 20 Hz. Issued once per request, as `REQUEST_DATA_STREAM`.
    pub async fn request_mavlink_stream(&self, rate_hz: f32) -> Result<(), RpcError> {
        let rate = rate_hz.clamp(0.0, MAX_TELEMETRY_RATE_HZ) as u16;
        self.send_mavlink(MavMessage::RequestDataStream(RequestDataStreamData {
            req_message_rate: rate,
            target_system: self.config.target_system,
            target_component: self.config.target_component,
            req_stream_id: 0, // MAV_DATA_STREAM_ALL
            start_stop: 1,
        }))
        .await
    }

    /// Start the MSP round-robin poll loop at `rate_hz` (capped at 20 Hz).
    ///
    /// The loop is non-reentrant: when the previous poll has not completed
    /// by the next tick, the tick is skipped rather than queued, so
    /// requests never stack up against a slow FC.
    pub fn start_msp_poller(link: &Arc<Self>, rate_hz: f32) {
        let rate = rate_hz.clamp(0.1, MAX_TELEMETRY_RATE_HZ);
        let period = Duration::from_secs_f32(1.0 / rate);
        let handle = Self::spawn_msp_poller(Arc::clone(link), period);
        link.pollers.lock().unwrap().push(handle);
    }

    fn spawn_msp_poller(link: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let polls = [msp::function::MSP_ATTITUDE, msp::function::MSP_ANALOG];
            let mut next = 0usize;
            loop {
                ticker.tick().await;
                if !link.is_connected() {
                    break;
                }
                // Skip the tick when the previous request is still in
                // flight.
                let Ok(_flight) = link.shared.msp_gate.try_lock() else {
                    log::debug!("msp poll tick skipped, previous poll still pending");
                    continue;
                };
                let function = polls[next];
                next = (next + 1) % polls.len();
                let reply = link
                    .call_inner(
                        Outbound::Msp(MspFrame::request(function, Vec::new())),
                        Expect::Msp { function },
                        Duration::from_millis(300),
                    )
                    .await;
                let Ok(frame) = reply else { continue };
                let Some(msp_frame) = frame.msp() else {
                    continue;
                };
                if let Some(sample) = decode_msp_sample(msp_frame) {
                    link.shared.events.emit(Event::Telemetry(sample.clone())).await;
                    link.shared.broadcast_sample(sample).await;
                }
            }
        })
    }

    /// Close the link. Pending calls resolve `Disconnected`; the transport
    /// is released. Idempotent.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(LinkCmd::Close).await;
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.io_task.abort();
        for poller in self.pollers.lock().unwrap().drain(..) {
            poller.abort();
        }
    }
}

fn decode_msp_sample(frame: &MspFrame) -> Option<TelemetrySample> {
    match frame.function {
        msp::function::MSP_ATTITUDE if frame.payload.len() >= 6 => Some(TelemetrySample::MspAttitude {
            roll: i16::from_le_bytes([frame.payload[0], frame.payload[1]]),
            pitch: i16::from_le_bytes([frame.payload[2], frame.payload[3]]),
            yaw: i16::from_le_bytes([frame.payload[4], frame.payload[5]]),
        }),
        msp::function::MSP_ANALOG if frame.payload.len() >= 7 => Some(TelemetrySample::MspAnalog {
            vbat: frame.payload[0],
            amperage: i16::from_le_bytes([frame.payload[5], frame.payload[6]]),
        }),
        _ => None,
    }
}

async fn io_loop(
    transport: Box<dyn Transport>,
    config: LinkConfig,
    cmd_rx: mpsc::Receiver<LinkCmd>,
    shared: Arc<Shared>,
) {
    let (mut reader, writer) = transport.split();
    let signing = Arc::new(config.signing.clone().map(SigningData::from_config));
    let signing_for_reader = Arc::clone(&signing);
    let (stop_tx, mut stop_rx) = watch::channel(false);

    // One writer serialises outbound frames: bytes of two frames are never
    // interleaved.
    let writer_task = tokio::spawn(writer_loop(
        writer,
        config.clone(),
        Arc::clone(&signing),
        cmd_rx,
        stop_tx.clone(),
    ));

    let mut mav_decoder = MavlinkDecoder::new();
    let mut msp_decoder = MspDecoder::new();
    let mut buf = [0u8; 1024];

    // The reader drains the transport and hands frames off through bounded
    // queues; it never runs application logic.
    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            read = reader.read(&mut buf) => {
                let n = match read {
                    Ok(n) => n,
                    Err(e) => {
                        log::warn!("link reader terminated: {e}");
                        break;
                    }
                };
                for &byte in &buf[..n] {
                    handle_byte(
                        byte,
                        &config,
                        &signing_for_reader,
                        &mut mav_decoder,
                        &mut msp_decoder,
                        &shared,
                    )
                    .await;
                }
                let crc_failures =
                    mav_decoder.take_crc_errors() + msp_decoder.take_crc_errors();
                for _ in 0..crc_failures {
                    shared.events.emit(Event::CrcError { protocol: "link" }).await;
                }
            }
        }
    }

    let _ = stop_tx.send(true);
    writer_task.abort();
    shared.connected.store(false, Ordering::Release);
    shared.fail_all_waiters();
    shared.subscribers.lock().unwrap().clear();
    let _ = shared.disconnect.send(true);
}

async fn writer_loop(
    mut writer: Box<dyn crate::transport::TransportWriter>,
    config: LinkConfig,
    signing: Arc<Option<SigningData>>,
    mut cmd_rx: mpsc::Receiver<LinkCmd>,
    stop_tx: watch::Sender<bool>,
) {
    let mut sequence: u8 = 0;
    loop {
        match cmd_rx.recv().await {
            Some(LinkCmd::SendMavlink(message)) => {
                let header = MavHeader {
                    system_id: config.system_id,
                    component_id: config.component_id,
                    sequence,
                };
                sequence = sequence.wrapping_add(1);
                let Some(bytes) = encode_outbound(&config, &signing, header, &message) else {
                    continue;
                };
                if let Err(e) = writer.write_all(&bytes).await {
                    log::warn!("link writer terminated: {e}");
                    break;
                }
            }
            Some(LinkCmd::SendBytes(bytes)) => {
                if let Err(e) = writer.write_all(&bytes).await {
                    log::warn!("link writer terminated: {e}");
                    break;
                }
            }
            Some(LinkCmd::Close) | None => break,
        }
    }
    let _ = writer.drain().await;
    writer.close();
    let _ = stop_tx.send(true);
}

fn encode_outbound(
    config: &LinkConfig,
    signing: &Option<SigningData>,
    header: MavHeader,
    message: &MavMessage,
) -> Option<Vec<u8>> {
    if crate::mavlink::messages::extra_crc(message.message_id()).is_none() {
        // No CRC-extra constant means we cannot frame it correctly.
        log::warn!("dropping message with unknown id {}", message.message_id());
        return None;
    }
    match config.mav_version {
        MavlinkVersion::V1 => crate::mavlink::encode_frame(MavlinkVersion::V1, header, message)
            .map_err(|e| log::warn!("dropping unencodable message: {e}"))
            .ok(),
        MavlinkVersion::V2 => {
            let sign = signing.as_ref().map_or(false, |s| s.sign_outgoing());
            let mut raw = MavlinkV2Raw::new();
            raw.serialize_message(header, message, sign);
            if let Some(signing) = signing {
                signing.sign_frame(&mut raw);
            }
            Some(raw.raw_bytes().to_vec())
        }
    }
}

async fn handle_byte(
    byte: u8,
    config: &LinkConfig,
    signing: &Arc<Option<SigningData>>,
    mav_decoder: &mut MavlinkDecoder,
    msp_decoder: &mut MspDecoder,
    shared: &Arc<Shared>,
) {
    // Bootloader bytes are only meaningful while a scripted exchange has a
    // waiter pending and no other decoder is mid-frame; the framing
    // prefixes otherwise cannot collide.
    if config.protocols.bootloader && mav_decoder.is_idle() && msp_decoder.is_idle() {
        if let Some(routed) = shared.feed_bootloader(byte) {
            if let Some(frame) = routed {
                route_frame(frame, shared).await;
            }
            return;
        }
    }

    if config.protocols.mavlink {
        if let Some(raw) = mav_decoder.feed(byte) {
            let frame = match raw {
                MavRawFrame::V1(f) => Frame::MavlinkV1(f),
                MavRawFrame::V2(f) => {
                    if let Some(signing) = signing.as_ref() {
                        if !signing.verify_frame(&f) {
                            log::warn!("dropping frame with invalid signature");
                            return;
                        }
                    }
                    Frame::MavlinkV2(f)
                }
            };
            route_frame(frame, shared).await;
            return;
        }
    }
    if config.protocols.msp {
        if let Some(frame) = msp_decoder.feed(byte) {
            let frame = match frame.version {
                MspVersion::V1 => Frame::MspV1(frame),
                MspVersion::V2 => Frame::MspV2(frame),
            };
            route_frame(frame, shared).await;
        }
    }
}

async fn route_frame(frame: Frame, shared: &Arc<Shared>) {
    let Some(stray) = shared.try_deliver(frame) else {
        return;
    };
    // Not claimed by any waiter: broadcast. Telemetry goes to subscribers
    // and onto the event stream; anything else is logged and dropped.
    match &stray {
        Frame::MavlinkV1(_) | Frame::MavlinkV2(_) => {
            let Some(message) = stray.mavlink() else {
                return;
            };
            if let Some(sample) = TelemetrySample::from_mavlink(&message) {
                shared
                    .events
                    .emit(Event::Telemetry(sample.clone()))
                    .await;
                shared.broadcast_sample(sample).await;
            } else {
                log::debug!(
                    "unsolicited {} ({}) not claimed by any waiter",
                    message.message_name(),
                    message.message_id()
                );
            }
        }
        Frame::MspV1(f) | Frame::MspV2(f) => {
            log::debug!("unsolicited msp frame fn {}", f.function);
        }
        Frame::BootloaderAck(_) | Frame::RawBytes(_) => {}
    }
}

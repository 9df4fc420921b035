//! Board detection.
//!
//! Protocols are probed strictly in order — MAVLink, then MSP, then the
//! STM32 serial bootloader — because most USB-CDC bridges cannot tolerate
//! arbitrary bytes on a speculative protocol. A later step runs only after
//! the prior step timed out or failed at protocol level.
//!
//! The machine itself is a pure `step(event) -> effects` function over an
//! explicit state enum; an async runner interprets the effects against the
//! link. If the port disappears mid-probe the run resolves
//! `AbortedByPortChange` and the caller may restart.

pub mod boards;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::{DetectionError, RpcError};
use crate::event::{Event, EventSender};
use crate::link::{Expect, Frame, Link, Outbound};
use crate::mavlink::messages::{
    self, AutopilotVersionData, AutopilotVersionRequestData, CommandLongData, HeartbeatData,
    MavAutopilot, MavMessage, MavType, MessageData,
};
use crate::stboot;
use crate::transport::PortInfo;

pub use boards::BoardHint;

/// How a board gets programmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flasher {
    Dfu,
    Avrdude,
    Serial,
    Ardupilot,
}

/// Which probe produced the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionMethod {
    VidPid,
    Mavlink,
    Msp,
    Bootloader,
    Dfu,
    Manual,
}

/// Per-protocol detail of a detected board.
#[derive(Debug, Clone, PartialEq)]
pub enum BoardKind {
    Mavlink {
        autopilot: Option<MavAutopilot>,
        vehicle: Option<MavType>,
        flight_sw_version: u32,
        board_id: Option<u16>,
    },
    Msp {
        api_version: (u8, u8),
        fc_variant: String,
        fc_version: String,
        board_target: String,
        manufacturer: Option<String>,
    },
    Bootloader {
        chip_id: u16,
    },
    UsbSerialOnly,
}

/// The record detection hands to the flash FSM and the shell.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedBoard {
    pub name: String,
    pub board_id: Option<u32>,
    pub mcu: Option<&'static str>,
    pub flasher: Flasher,
    pub port: Option<String>,
    pub in_bootloader: bool,
    pub chip_id: Option<u16>,
    pub method: DetectionMethod,
    pub current_firmware: Option<String>,
    pub kind: BoardKind,
}

/// Probe timeouts, parameterised for tests.
#[derive(Debug, Clone, Copy)]
pub struct DetectTimeouts {
    pub mavlink_heartbeat: Duration,
    pub mavlink_version: Duration,
    pub msp_step: Duration,
    pub bootloader_ack: Duration,
}

impl Default for DetectTimeouts {
    fn default() -> Self {
        Self {
            mavlink_heartbeat: Duration::from_millis(1200),
            mavlink_version: Duration::from_millis(1000),
            msp_step: Duration::from_millis(300),
            bootloader_ack: Duration::from_millis(200),
        }
    }
}

/// Explicit machine states, in probe order.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectState {
    OpenAndClassify,
    TryMavlink,
    TryMsp,
    TryBootloader,
    Done(Box<DetectedBoard>),
    Failed {
        attempted: Vec<&'static str>,
        last_error: String,
    },
    Aborted,
}

/// Inputs to the machine.
#[derive(Debug)]
pub enum DetectEvent {
    Start,
    MavlinkFound(Box<DetectedBoard>),
    MavlinkFailed(String),
    MspFound(Box<DetectedBoard>),
    MspFailed(String),
    BootloaderFound(Box<DetectedBoard>),
    BootloaderFailed(String),
    PortVanished,
}

/// Outputs the runner interprets.
#[derive(Debug, PartialEq)]
pub enum DetectEffect {
    ProbeMavlink,
    ProbeMsp,
    ProbeBootloader,
    EmitStep(&'static str),
    Finish,
    Fail,
    Abort,
}

/// The detection state machine. Pure transitions, no I/O.
pub struct Detector {
    state: DetectState,
    attempted: Vec<&'static str>,
    last_error: String,
}

impl Detector {
    pub fn new() -> Self {
        Self {
            state: DetectState::OpenAndClassify,
            attempted: Vec::new(),
            last_error: String::new(),
        }
    }

    pub fn state(&self) -> &DetectState {
        &self.state
    }

    pub fn step(&mut self, event: DetectEvent) -> Vec<DetectEffect> {
        use DetectEvent as E;
        use DetectState as S;
        if matches!(event, E::PortVanished) {
            self.state = S::Aborted;
            return vec![DetectEffect::Abort];
        }
        let state = std::mem::replace(&mut self.state, S::Aborted);
        let (next, effects) = match (state, event) {
            (S::OpenAndClassify, E::Start) => (
                S::TryMavlink,
                vec![DetectEffect::EmitStep("mavlink"), DetectEffect::ProbeMavlink],
            ),
            (S::TryMavlink, E::MavlinkFound(board)) => {
                (S::Done(board), vec![DetectEffect::Finish])
            }
            (S::TryMavlink, E::MavlinkFailed(error)) => {
                self.attempted.push("mavlink");
                self.last_error = error;
                (
                    S::TryMsp,
                    vec![DetectEffect::EmitStep("msp"), DetectEffect::ProbeMsp],
                )
            }
            (S::TryMsp, E::MspFound(board)) => (S::Done(board), vec![DetectEffect::Finish]),
            (S::TryMsp, E::MspFailed(error)) => {
                self.attempted.push("msp");
                self.last_error = error;
                (
                    S::TryBootloader,
                    vec![
                        DetectEffect::EmitStep("bootloader"),
                        DetectEffect::ProbeBootloader,
                    ],
                )
            }
            (S::TryBootloader, E::BootloaderFound(board)) => {
                (S::Done(board), vec![DetectEffect::Finish])
            }
            (S::TryBootloader, E::BootloaderFailed(error)) => {
                self.attempted.push("bootloader");
                self.last_error = error;
                (
                    S::Failed {
                        attempted: self.attempted.clone(),
                        last_error: self.last_error.clone(),
                    },
                    vec![DetectEffect::Fail],
                )
            }
            (state, event) => {
                log::warn!("detector ignoring {event:?} in state {state:?}");
                (state, vec![])
            }
        };
        self.state = next;
        effects
    }
}

impl Default for Detector {
    fn default() -> Self {
        Self::new()
    }
}

/// Drive a full detection over an open link.
///
/// `ports` is the watcher's current-port-set channel, used to abort when
/// the probed port vanishes mid-run.
pub async fn run(
    link: &Arc<Link>,
    port: &PortInfo,
    mut ports: Option<watch::Receiver<Vec<PortInfo>>>,
    timeouts: DetectTimeouts,
    events: &EventSender,
) -> Result<DetectedBoard, DetectionError> {
    let hint = port
        .vendor_id
        .zip(port.product_id)
        .and_then(|(vid, pid)| boards::hint_for(vid, pid));
    let mut detector = Detector::new();
    let mut effects = detector.step(DetectEvent::Start);

    loop {
        let mut next_event = None;
        for effect in effects.drain(..) {
            match effect {
                DetectEffect::EmitStep(step) => {
                    events.emit(Event::DetectionStep { description: step }).await;
                }
                DetectEffect::ProbeMavlink => {
                    let probe = probe_mavlink(link, port, hint, timeouts);
                    next_event = Some(match with_port_watch(probe, &mut ports, port).await {
                        Ok(Ok(board)) => DetectEvent::MavlinkFound(Box::new(board)),
                        Ok(Err(e)) => DetectEvent::MavlinkFailed(e.to_string()),
                        Err(()) => DetectEvent::PortVanished,
                    });
                }
                DetectEffect::ProbeMsp => {
                    let probe = probe_msp(link, port, hint, timeouts);
                    next_event = Some(match with_port_watch(probe, &mut ports, port).await {
                        Ok(Ok(board)) => DetectEvent::MspFound(Box::new(board)),
                        Ok(Err(e)) => DetectEvent::MspFailed(e.to_string()),
                        Err(()) => DetectEvent::PortVanished,
                    });
                }
                DetectEffect::ProbeBootloader => {
                    let probe = probe_bootloader(link, port, hint, timeouts);
                    next_event = Some(match with_port_watch(probe, &mut ports, port).await {
                        Ok(Ok(board)) => DetectEvent::BootloaderFound(Box::new(board)),
                        Ok(Err(e)) => DetectEvent::BootloaderFailed(e.to_string()),
                        Err(()) => DetectEvent::PortVanished,
                    });
                }
                DetectEffect::Finish => {
                    let DetectState::Done(board) = detector.state() else {
                        unreachable!("finish effect outside done state");
                    };
                    let board = *board.clone();
                    events
                        .emit(Event::DetectionResult(Box::new(board.clone())))
                        .await;
                    return Ok(board);
                }
                DetectEffect::Fail => {
                    let DetectState::Failed {
                        attempted,
                        last_error,
                    } = detector.state()
                    else {
                        unreachable!("fail effect outside failed state");
                    };
                    // A known USB id with a mute device behind it is still
                    // a usable answer: the operator can flash it blind.
                    if let Some(hint) = hint {
                        let board = DetectedBoard {
                            name: hint.name.to_owned(),
                            board_id: None,
                            mcu: None,
                            flasher: hint.flasher,
                            port: Some(port.path.clone()),
                            in_bootloader: hint.in_bootloader,
                            chip_id: None,
                            method: DetectionMethod::VidPid,
                            current_firmware: None,
                            kind: BoardKind::UsbSerialOnly,
                        };
                        events
                            .emit(Event::DetectionResult(Box::new(board.clone())))
                            .await;
                        return Ok(board);
                    }
                    events
                        .emit(Event::DetectionFailed {
                            attempted: attempted.clone(),
                            last_error: last_error.clone(),
                        })
                        .await;
                    return Err(DetectionError::AllProtocolsFailed);
                }
                DetectEffect::Abort => {
                    events.emit(Event::DetectionAborted).await;
                    return Err(DetectionError::AbortedByPortChange);
                }
            }
        }
        let Some(event) = next_event else {
            return Err(DetectionError::AllProtocolsFailed);
        };
        effects = detector.step(event);
    }
}

/// Run `probe` while watching for the port to drop out of enumeration.
async fn with_port_watch<F, T>(
    probe: F,
    ports: &mut Option<watch::Receiver<Vec<PortInfo>>>,
    port: &PortInfo,
) -> Result<T, ()>
where
    F: std::future::Future<Output = T>,
{
    let Some(ports) = ports.as_mut() else {
        return Ok(probe.await);
    };
    tokio::pin!(probe);
    loop {
        tokio::select! {
            result = &mut probe => return Ok(result),
            changed = ports.changed() => {
                if changed.is_err() {
                    // watcher gone; keep probing without it
                    return Ok(probe.await);
                }
                let present = ports
                    .borrow()
                    .iter()
                    .any(|p| p.identity() == port.identity());
                if !present {
                    return Err(());
                }
            }
        }
    }
}

async fn probe_mavlink(
    link: &Arc<Link>,
    port: &PortInfo,
    hint: Option<&'static BoardHint>,
    timeouts: DetectTimeouts,
) -> Result<DetectedBoard, RpcError> {
    let config = link.config().clone();
    let heartbeat = MavMessage::Heartbeat(HeartbeatData {
        custom_mode: 0,
        mavtype: 6, // MAV_TYPE_GCS
        autopilot: MavAutopilot::Invalid as u8,
        base_mode: 0,
        system_status: 4,
        mavlink_version: 3,
    });
    let reply = link
        .call_mavlink(
            heartbeat,
            HeartbeatData::ID,
            None,
            timeouts.mavlink_heartbeat,
        )
        .await?;
    let MavMessage::Heartbeat(heartbeat) = reply else {
        return Err(RpcError::Cancelled);
    };

    // The board id only travels in AUTOPILOT_VERSION; ask for it twice
    // over, the dialect-specific request first, then the generic command.
    let version = match link
        .call_mavlink(
            MavMessage::AutopilotVersionRequest(AutopilotVersionRequestData {
                target_system: config.target_system,
                target_component: config.target_component,
            }),
            AutopilotVersionData::ID,
            None,
            timeouts.mavlink_version,
        )
        .await
    {
        Ok(reply) => Some(reply),
        Err(RpcError::Timeout) => link
            .call_mavlink(
                MavMessage::CommandLong(CommandLongData {
                    param1: AutopilotVersionData::ID as f32,
                    param2: 0.0,
                    param3: 0.0,
                    param4: 0.0,
                    param5: 0.0,
                    param6: 0.0,
                    param7: 0.0,
                    command: messages::cmd::REQUEST_MESSAGE,
                    target_system: config.target_system,
                    target_component: config.target_component,
                    confirmation: 0,
                }),
                AutopilotVersionData::ID,
                None,
                timeouts.mavlink_version,
            )
            .await
            .ok(),
        Err(e) => return Err(e),
    };

    let version = match version {
        Some(MavMessage::AutopilotVersion(v)) => Some(v),
        _ => None,
    };
    let board_id = version.as_ref().map(AutopilotVersionData::board_id);
    let firmware = version
        .as_ref()
        .map(|v| firmware_string(&heartbeat, v.flight_sw_version));
    let name = board_id
        .and_then(boards::ardupilot_board_name)
        .map(str::to_owned)
        .or_else(|| hint.map(|h| h.name.to_owned()))
        .unwrap_or_else(|| "MAVLink autopilot".to_owned());

    Ok(DetectedBoard {
        name,
        board_id: board_id.map(u32::from),
        mcu: None,
        flasher: hint.map_or(Flasher::Ardupilot, |h| h.flasher),
        port: Some(port.path.clone()),
        in_bootloader: false,
        chip_id: None,
        method: DetectionMethod::Mavlink,
        current_firmware: firmware,
        kind: BoardKind::Mavlink {
            autopilot: heartbeat.autopilot(),
            vehicle: heartbeat.vehicle_type(),
            flight_sw_version: version.map(|v| v.flight_sw_version).unwrap_or_default(),
            board_id,
        },
    })
}

/// `flight_sw_version` packs major.minor.patch.type into four bytes.
fn firmware_string(heartbeat: &HeartbeatData, flight_sw_version: u32) -> String {
    let major = (flight_sw_version >> 24) & 0xFF;
    let minor = (flight_sw_version >> 16) & 0xFF;
    let patch = (flight_sw_version >> 8) & 0xFF;
    let product = match (heartbeat.autopilot(), heartbeat.vehicle_type()) {
        (Some(MavAutopilot::ArduPilotMega), Some(MavType::FixedWing)) => "ArduPlane",
        (Some(MavAutopilot::ArduPilotMega), Some(MavType::GroundRover)) => "Rover",
        (Some(MavAutopilot::ArduPilotMega), Some(MavType::SurfaceBoat)) => "Rover",
        (Some(MavAutopilot::ArduPilotMega), Some(MavType::Submarine)) => "ArduSub",
        (Some(MavAutopilot::ArduPilotMega), _) => "ArduCopter",
        (Some(MavAutopilot::Px4), _) => "PX4",
        _ => "Autopilot",
    };
    format!("{product} v{major}.{minor}.{patch}")
}

async fn probe_msp(
    link: &Arc<Link>,
    port: &PortInfo,
    hint: Option<&'static BoardHint>,
    timeouts: DetectTimeouts,
) -> Result<DetectedBoard, RpcError> {
    use crate::msp::function;

    let api = msp_with_retry(link, function::MSP_API_VERSION, timeouts.msp_step).await?;
    let api_version = if api.len() >= 3 {
        (api[1], api[2])
    } else {
        (0, 0)
    };
    let variant = msp_with_retry(link, function::MSP_FC_VARIANT, timeouts.msp_step).await?;
    let fc_variant = String::from_utf8_lossy(&variant).trim_end().to_string();
    let version = msp_with_retry(link, function::MSP_FC_VERSION, timeouts.msp_step).await?;
    let fc_version = if version.len() >= 3 {
        format!("{}.{}.{}", version[0], version[1], version[2])
    } else {
        String::new()
    };
    let board_info = msp_with_retry(link, function::MSP_BOARD_INFO, timeouts.msp_step).await?;
    let info = parse_board_info(&board_info);

    let manufacturer = info
        .manufacturer_id
        .as_deref()
        .and_then(boards::manufacturer_name);
    let name = match (manufacturer, info.board_name.as_deref()) {
        (Some(mfr), Some(board)) => format!("{mfr} {board}"),
        (Some(mfr), None) => format!("{mfr} {}", info.board_identifier),
        (None, Some(board)) => board.to_owned(),
        (None, None) => info.board_identifier.clone(),
    };
    let firmware = format!("{fc_variant} {fc_version}");

    Ok(DetectedBoard {
        name,
        board_id: None,
        mcu: None,
        flasher: hint.map_or(Flasher::Dfu, |h| h.flasher),
        port: Some(port.path.clone()),
        in_bootloader: false,
        chip_id: None,
        method: DetectionMethod::Msp,
        current_firmware: Some(firmware.trim().to_owned()),
        kind: BoardKind::Msp {
            api_version,
            fc_variant,
            fc_version,
            board_target: info.target_name.unwrap_or(info.board_identifier),
            manufacturer: info.manufacturer_id,
        },
    })
}

/// Each MSP probe step gets one retry before giving up.
async fn msp_with_retry(
    link: &Arc<Link>,
    function: u16,
    timeout: Duration,
) -> Result<Vec<u8>, RpcError> {
    match link.call_msp(function, Vec::new(), timeout).await {
        Ok(frame) => Ok(frame.payload),
        Err(RpcError::Timeout) => link
            .call_msp(function, Vec::new(), timeout)
            .await
            .map(|f| f.payload),
        Err(e) => Err(e),
    }
}

struct BoardInfo {
    board_identifier: String,
    target_name: Option<String>,
    board_name: Option<String>,
    manufacturer_id: Option<String>,
}

/// `MSP_BOARD_INFO` grew fields over the years; parse as far as the
/// payload reaches.
fn parse_board_info(payload: &[u8]) -> BoardInfo {
    let board_identifier = String::from_utf8_lossy(payload.get(0..4).unwrap_or_default())
        .trim_end_matches('\0')
        .to_string();
    let mut info = BoardInfo {
        board_identifier,
        target_name: None,
        board_name: None,
        manufacturer_id: None,
    };
    // board id (4) + hardware revision (2) + fc type (1) + capabilities (1)
    let mut offset = 8;
    let mut read_string = |payload: &[u8], offset: &mut usize| -> Option<String> {
        let len = *payload.get(*offset)? as usize;
        let bytes = payload.get(*offset + 1..*offset + 1 + len)?;
        *offset += 1 + len;
        Some(String::from_utf8_lossy(bytes).to_string())
    };
    info.target_name = read_string(payload, &mut offset);
    info.board_name = read_string(payload, &mut offset);
    info.manufacturer_id = payload
        .get(offset..offset + 4)
        .map(|b| String::from_utf8_lossy(b).trim_end_matches('\0').to_string());
    info
}

async fn probe_bootloader(
    link: &Arc<Link>,
    port: &PortInfo,
    hint: Option<&'static BoardHint>,
    timeouts: DetectTimeouts,
) -> Result<DetectedBoard, RpcError> {
    // Sync byte first.
    let frame = link
        .call(
            Outbound::Raw(vec![stboot::INIT]),
            Expect::BootloaderAck,
            timeouts.bootloader_ack,
        )
        .await?;
    let Frame::BootloaderAck(_) = frame else {
        return Err(RpcError::Cancelled);
    };

    // GET_ID: ACK, N, PID bytes, ACK. Waiters are registered before the
    // command goes out so no reply byte can race them.
    let ack = link.expect(Expect::BootloaderAck);
    let data = link.expect(Expect::BootloaderData { count: 3 });
    let trailer = link.expect(Expect::BootloaderAck);
    link.send_bytes(vec![stboot::CMD_GET_ID, !stboot::CMD_GET_ID])
        .await?;
    match ack.wait(stboot::ACK_TIMEOUT).await? {
        Frame::BootloaderAck(true) => {}
        _ => return Err(RpcError::Nak),
    }
    let Frame::RawBytes(bytes) = data.wait(stboot::ACK_TIMEOUT).await? else {
        return Err(RpcError::Cancelled);
    };
    let _ = trailer.wait(stboot::ACK_TIMEOUT).await;

    let chip_id = u16::from_be_bytes([bytes[1], bytes[2]]) & 0x0FFF;
    let family = stboot::chip_family(chip_id);

    Ok(DetectedBoard {
        name: family.map_or_else(
            || format!("STM32 bootloader (chip id {chip_id:#05x})"),
            |f| f.name.to_owned(),
        ),
        board_id: None,
        mcu: family.map(|f| f.name),
        flasher: hint.map_or(Flasher::Serial, |h| h.flasher),
        port: Some(port.path.clone()),
        in_bootloader: true,
        chip_id: Some(chip_id),
        method: DetectionMethod::Bootloader,
        current_firmware: None,
        kind: BoardKind::Bootloader { chip_id },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_board(method: DetectionMethod) -> Box<DetectedBoard> {
        Box::new(DetectedBoard {
            name: "x".into(),
            board_id: None,
            mcu: None,
            flasher: Flasher::Serial,
            port: None,
            in_bootloader: false,
            chip_id: None,
            method,
            current_firmware: None,
            kind: BoardKind::UsbSerialOnly,
        })
    }

    #[test]
    fn steps_probe_in_strict_order() {
        let mut d = Detector::new();
        assert_eq!(
            d.step(DetectEvent::Start),
            vec![DetectEffect::EmitStep("mavlink"), DetectEffect::ProbeMavlink]
        );
        assert_eq!(
            d.step(DetectEvent::MavlinkFailed("timeout".into())),
            vec![DetectEffect::EmitStep("msp"), DetectEffect::ProbeMsp]
        );
        assert_eq!(
            d.step(DetectEvent::MspFailed("timeout".into())),
            vec![
                DetectEffect::EmitStep("bootloader"),
                DetectEffect::ProbeBootloader
            ]
        );
        assert_eq!(
            d.step(DetectEvent::BootloaderFailed("timeout".into())),
            vec![DetectEffect::Fail]
        );
        let DetectState::Failed { attempted, .. } = d.state() else {
            panic!("expected failure");
        };
        assert_eq!(attempted, &["mavlink", "msp", "bootloader"]);
    }

    #[test]
    fn success_short_circuits() {
        let mut d = Detector::new();
        d.step(DetectEvent::Start);
        assert_eq!(
            d.step(DetectEvent::MavlinkFound(dummy_board(
                DetectionMethod::Mavlink
            ))),
            vec![DetectEffect::Finish]
        );
        assert!(matches!(d.state(), DetectState::Done(_)));
    }

    #[test]
    fn port_vanish_aborts_any_state() {
        let mut d = Detector::new();
        d.step(DetectEvent::Start);
        d.step(DetectEvent::MavlinkFailed("t".into()));
        assert_eq!(
            d.step(DetectEvent::PortVanished),
            vec![DetectEffect::Abort]
        );
        assert_eq!(d.state(), &DetectState::Aborted);
    }

    #[test]
    fn firmware_string_decodes_semver_bytes() {
        let hb = HeartbeatData {
            custom_mode: 0,
            mavtype: MavType::Quadrotor as u8,
            autopilot: MavAutopilot::ArduPilotMega as u8,
            base_mode: 0,
            system_status: 3,
            mavlink_version: 3,
        };
        assert_eq!(firmware_string(&hb, 0x0405_0100), "ArduCopter v4.5.1");
    }

    #[test]
    fn board_info_with_manufacturer() {
        // id(4) rev(2) type(1) caps(1) target-name board-name mfr-id
        let mut payload = b"S405".to_vec();
        payload.extend_from_slice(&[0, 0, 0, 0]);
        payload.push(9);
        payload.extend_from_slice(b"STM32F405");
        payload.push(7);
        payload.extend_from_slice(b"BEE35PR");
        payload.extend_from_slice(b"SPBE");
        let info = parse_board_info(&payload);
        assert_eq!(info.target_name.as_deref(), Some("STM32F405"));
        assert_eq!(info.board_name.as_deref(), Some("BEE35PR"));
        assert_eq!(info.manufacturer_id.as_deref(), Some("SPBE"));
    }
}

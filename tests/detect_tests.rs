//! End-to-end board detection against scripted flight controllers.

mod test_shared;

use std::sync::Arc;
use std::time::Duration;

use groundlink::detect::{self, BoardKind, DetectTimeouts, DetectionMethod};
use groundlink::error::DetectionError;
use groundlink::event::EventBus;
use groundlink::link::{Link, LinkConfig};
use groundlink::mavlink::messages::{
    AutopilotVersionData, HeartbeatData, MavAutopilot, MavMessage, MavType,
};
use groundlink::msp::{function, MspFrame};
use groundlink::stboot;
use groundlink::transport::{loopback_pair, PortInfo};

use test_shared::{spawn_fc, FakeFc};

fn fast_timeouts() -> DetectTimeouts {
    DetectTimeouts {
        mavlink_heartbeat: Duration::from_millis(150),
        mavlink_version: Duration::from_millis(150),
        msp_step: Duration::from_millis(100),
        bootloader_ack: Duration::from_millis(100),
    }
}

fn fake_port() -> PortInfo {
    PortInfo {
        path: "/dev/ttyACM-test".into(),
        vendor_id: None,
        product_id: None,
        manufacturer: None,
        serial_number: None,
    }
}

async fn detect(fc: FakeFc) -> Result<groundlink::DetectedBoard, DetectionError> {
    let (ours, theirs) = loopback_pair();
    spawn_fc(theirs, fc);
    let (events, mut receiver) = EventBus::channel(64);
    tokio::spawn(async move { while receiver.recv().await.is_some() {} });
    let link = Arc::new(Link::open(Box::new(ours), LinkConfig::default(), events.clone()));
    detect::run(&link, &fake_port(), None, fast_timeouts(), &events).await
}

fn ardupilot_fc() -> FakeFc {
    FakeFc {
        mavlink: Some(Box::new(|request| match request {
            MavMessage::Heartbeat(_) => vec![MavMessage::Heartbeat(HeartbeatData {
                custom_mode: 0,
                mavtype: MavType::Quadrotor as u8,
                autopilot: MavAutopilot::ArduPilotMega as u8,
                base_mode: 0,
                system_status: 3,
                mavlink_version: 3,
            })],
            MavMessage::AutopilotVersionRequest(_) => {
                vec![MavMessage::AutopilotVersion(AutopilotVersionData {
                    capabilities: 0,
                    uid: 0,
                    flight_sw_version: 0x0405_0100,
                    middleware_sw_version: 0,
                    os_sw_version: 0,
                    board_version: 0x0000_1016,
                    vendor_id: 0,
                    product_id: 0,
                    flight_custom_version: [0; 8],
                    middleware_custom_version: [0; 8],
                    os_custom_version: [0; 8],
                    uid2: [0; 18],
                })]
            }
            _ => vec![],
        })),
        ..Default::default()
    }
}

#[tokio::test]
async fn detects_an_ardupilot_board() {
    let board = detect(ardupilot_fc()).await.unwrap();
    assert_eq!(board.method, DetectionMethod::Mavlink);
    assert_eq!(board.board_id, Some(0x1016));
    assert_eq!(board.name, "SPRacingH7Extreme");
    assert_eq!(board.current_firmware.as_deref(), Some("ArduCopter v4.5.1"));
    assert!(!board.in_bootloader);
    let BoardKind::Mavlink {
        autopilot, vehicle, ..
    } = board.kind
    else {
        panic!("expected mavlink kind");
    };
    assert_eq!(autopilot, Some(MavAutopilot::ArduPilotMega));
    assert_eq!(vehicle, Some(MavType::Quadrotor));
}

fn betaflight_fc() -> FakeFc {
    FakeFc {
        msp: Some(Box::new(|request| {
            let payload = match request.function {
                function::MSP_API_VERSION => vec![0, 1, 45],
                function::MSP_FC_VARIANT => b"BTFL".to_vec(),
                function::MSP_FC_VERSION => vec![4, 4, 2],
                function::MSP_BOARD_INFO => {
                    let mut payload = b"S405".to_vec();
                    payload.extend_from_slice(&[0, 0]); // hardware revision
                    payload.push(0); // fc type
                    payload.push(0); // capabilities
                    payload.push(9);
                    payload.extend_from_slice(b"STM32F405");
                    payload.push(7);
                    payload.extend_from_slice(b"BEE35PR");
                    payload.extend_from_slice(b"SPBE");
                    payload
                }
                _ => return None,
            };
            Some(MspFrame::response(request.function, payload))
        })),
        ..Default::default()
    }
}

#[tokio::test]
async fn detects_a_betaflight_board_after_mavlink_times_out() {
    let board = detect(betaflight_fc()).await.unwrap();
    assert_eq!(board.method, DetectionMethod::Msp);
    assert!(board.name.contains("SPEEDYBEE"), "name was {}", board.name);
    let BoardKind::Msp {
        fc_variant,
        fc_version,
        api_version,
        ..
    } = board.kind
    else {
        panic!("expected msp kind");
    };
    assert_eq!(fc_variant, "BTFL");
    assert_eq!(fc_version, "4.4.2");
    assert_eq!(api_version, (1, 45));
}

/// A bare STM32 in its ROM bootloader: ignores MAVLink and MSP, answers
/// the sync byte and GET_ID.
fn bootloader_fc() -> FakeFc {
    let mut pending_cmd: Option<u8> = None;
    FakeFc {
        raw: Some(Box::new(move |byte| {
            if let Some(cmd) = pending_cmd.take() {
                if byte == !cmd && cmd == stboot::CMD_GET_ID {
                    return vec![stboot::ACK, 0x01, 0x04, 0x13, stboot::ACK];
                }
                return vec![stboot::NAK];
            }
            match byte {
                stboot::INIT => vec![stboot::ACK],
                cmd @ stboot::CMD_GET_ID => {
                    pending_cmd = Some(cmd);
                    vec![]
                }
                _ => vec![],
            }
        })),
        ..Default::default()
    }
}

#[tokio::test]
async fn detects_a_bare_stm32_bootloader() {
    let board = detect(bootloader_fc()).await.unwrap();
    assert_eq!(board.method, DetectionMethod::Bootloader);
    assert!(board.in_bootloader);
    assert_eq!(board.chip_id, Some(0x413));
    assert_eq!(board.mcu, Some("STM32F405/407"));
    assert_eq!(board.kind, BoardKind::Bootloader { chip_id: 0x413 });
}

#[tokio::test]
async fn silent_port_fails_with_all_protocols_attempted() {
    let result = detect(FakeFc::default()).await;
    assert!(matches!(result, Err(DetectionError::AllProtocolsFailed)));
}

#[tokio::test]
async fn silent_device_with_known_usb_id_classifies_as_serial_bridge() {
    let (ours, theirs) = loopback_pair();
    spawn_fc(theirs, FakeFc::default());
    let (events, mut receiver) = EventBus::channel(64);
    tokio::spawn(async move { while receiver.recv().await.is_some() {} });
    let link = Arc::new(Link::open(Box::new(ours), LinkConfig::default(), events.clone()));
    let port = PortInfo {
        path: "/dev/ttyUSB0".into(),
        vendor_id: Some(0x0403),
        product_id: Some(0x6001),
        manufacturer: Some("FTDI".into()),
        serial_number: None,
    };
    let board = detect::run(&link, &port, None, fast_timeouts(), &events)
        .await
        .unwrap();
    assert_eq!(board.method, DetectionMethod::VidPid);
    assert_eq!(board.kind, BoardKind::UsbSerialOnly);
    assert_eq!(board.flasher, groundlink::Flasher::Serial);
    assert!(board.name.contains("FTDI"));
}

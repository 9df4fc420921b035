//! Link multiplexer behaviour: correlation, timeouts, MSP single-flight,
//! telemetry fan-out and disconnect semantics.

mod test_shared;

use std::sync::Arc;
use std::time::Duration;

use groundlink::error::RpcError;
use groundlink::event::EventSender;
use groundlink::link::{DeliveryMode, Link, LinkConfig, StreamKind, TelemetryReceiver};
use groundlink::mavlink::messages::{
    param_id_bytes, AttitudeData, HeartbeatData, MavMessage, MessageData, ParamValueData,
};
use groundlink::msp::{function, MspFrame};
use groundlink::transport::loopback_pair;

use test_shared::{spawn_fc, FakeFc};

fn heartbeat() -> MavMessage {
    MavMessage::Heartbeat(HeartbeatData {
        custom_mode: 0,
        mavtype: 6,
        autopilot: 8,
        base_mode: 0,
        system_status: 4,
        mavlink_version: 3,
    })
}

fn open_link(fc: FakeFc) -> Arc<Link> {
    let (ours, theirs) = loopback_pair();
    spawn_fc(theirs, fc);
    Arc::new(Link::open(
        Box::new(ours),
        LinkConfig::default(),
        EventSender::sink(),
    ))
}

#[tokio::test]
async fn mavlink_call_resolves_with_matching_reply() {
    let link = open_link(FakeFc {
        mavlink: Some(Box::new(|request| match request {
            MavMessage::Heartbeat(_) => vec![MavMessage::Heartbeat(HeartbeatData {
                custom_mode: 7,
                mavtype: 2,
                autopilot: 3,
                base_mode: 0,
                system_status: 4,
                mavlink_version: 3,
            })],
            _ => vec![],
        })),
        ..Default::default()
    });

    let reply = link
        .call_mavlink(heartbeat(), 0, None, Duration::from_secs(1))
        .await
        .unwrap();
    let MavMessage::Heartbeat(hb) = reply else {
        panic!("expected heartbeat");
    };
    assert_eq!(hb.custom_mode, 7);
}

#[tokio::test]
async fn call_times_out_against_a_silent_peer() {
    let link = open_link(FakeFc::default());
    let result = link
        .call_mavlink(heartbeat(), 0, None, Duration::from_millis(100))
        .await;
    assert!(matches!(result, Err(RpcError::Timeout)));
}

#[tokio::test]
async fn predicate_skips_non_matching_responses() {
    // The FC answers every heartbeat with two PARAM_VALUEs; only the
    // second matches the predicate.
    let link = open_link(FakeFc {
        mavlink: Some(Box::new(|request| match request {
            MavMessage::Heartbeat(_) => vec![
                MavMessage::ParamValue(ParamValueData {
                    param_value: 1.0,
                    param_count: 2,
                    param_index: 0,
                    param_id: param_id_bytes("OTHER"),
                    param_type: 9,
                }),
                MavMessage::ParamValue(ParamValueData {
                    param_value: 2.0,
                    param_count: 2,
                    param_index: 1,
                    param_id: param_id_bytes("WANTED"),
                    param_type: 9,
                }),
            ],
            _ => vec![],
        })),
        ..Default::default()
    });

    let wanted = param_id_bytes("WANTED");
    let reply = link
        .call_mavlink(
            heartbeat(),
            ParamValueData::ID,
            Some(Box::new(move |m| {
                matches!(m, MavMessage::ParamValue(v) if v.param_id == wanted)
            })),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    let MavMessage::ParamValue(value) = reply else {
        panic!("expected param value");
    };
    assert_eq!(value.param_value, 2.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn msp_requests_never_overlap_on_the_wire() {
    // A slow FC that stamps the arrival time of each request and replies
    // only after a fixed delay. With single-flight enforced, consecutive
    // request arrivals must be at least that delay apart.
    const FC_DELAY: Duration = Duration::from_millis(50);
    let arrivals: Arc<std::sync::Mutex<Vec<tokio::time::Instant>>> =
        Arc::new(std::sync::Mutex::new(Vec::new()));
    let arrivals_fc = Arc::clone(&arrivals);

    let (ours, mut theirs) = loopback_pair();
    tokio::spawn(async move {
        use groundlink::transport::Transport;
        let mut decoder = groundlink::msp::MspDecoder::new();
        let mut buf = [0u8; 256];
        loop {
            let n = match theirs.read(&mut buf).await {
                Ok(n) => n,
                Err(_) => return,
            };
            for &byte in &buf[..n] {
                if let Some(request) = decoder.feed(byte) {
                    arrivals_fc.lock().unwrap().push(tokio::time::Instant::now());
                    tokio::time::sleep(FC_DELAY).await;
                    let reply = MspFrame::response(request.function, vec![1, 2, 3]);
                    if theirs.write_all(&reply.encode().unwrap()).await.is_err() {
                        return;
                    }
                }
            }
        }
    });
    let link = Arc::new(Link::open(
        Box::new(ours),
        LinkConfig::default(),
        EventSender::sink(),
    ));

    let mut calls = Vec::new();
    for _ in 0..4 {
        let link = Arc::clone(&link);
        calls.push(tokio::spawn(async move {
            link.call_msp(function::MSP_API_VERSION, Vec::new(), Duration::from_secs(2))
                .await
        }));
    }
    for call in calls {
        call.await.unwrap().unwrap();
    }

    let arrivals = arrivals.lock().unwrap();
    assert_eq!(arrivals.len(), 4);
    for pair in arrivals.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(
            gap >= FC_DELAY - Duration::from_millis(5),
            "second request hit the wire {gap:?} after the first, before its response"
        );
    }
}

#[tokio::test]
async fn msp_error_direction_resolves_nak() {
    let link = open_link(FakeFc {
        msp: Some(Box::new(|request| {
            Some(MspFrame {
                direction: groundlink::msp::MspDirection::Error,
                function: request.function,
                flags: 0,
                payload: vec![],
                version: request.version,
            })
        })),
        ..Default::default()
    });
    let result = link
        .call_msp(function::MSP_BOARD_INFO, Vec::new(), Duration::from_secs(1))
        .await;
    assert!(matches!(result, Err(RpcError::Nak)));
}

#[tokio::test]
async fn unsolicited_telemetry_reaches_subscribers_in_order() {
    let link = open_link(FakeFc {
        mavlink: Some(Box::new(|request| match request {
            // Each GCS heartbeat triggers a burst of three attitudes.
            MavMessage::Heartbeat(_) => (0..3)
                .map(|i| {
                    MavMessage::Attitude(AttitudeData {
                        time_boot_ms: i,
                        roll: i as f32,
                        pitch: 0.0,
                        yaw: 0.0,
                        rollspeed: 0.0,
                        pitchspeed: 0.0,
                        yawspeed: 0.0,
                    })
                })
                .collect(),
            _ => vec![],
        })),
        ..Default::default()
    });

    let (_token, receiver) = link.subscribe(StreamKind::Attitude, DeliveryMode::Ordered);
    let TelemetryReceiver::Ordered(mut rx) = receiver else {
        panic!("expected ordered receiver");
    };
    link.send_mavlink(heartbeat()).await.unwrap();

    for expected in 0..3u32 {
        let sample = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let groundlink::link::TelemetrySample::Attitude(att) = sample else {
            panic!("expected attitude");
        };
        assert_eq!(att.time_boot_ms, expected);
    }
}

#[tokio::test]
async fn latest_only_subscriber_coalesces() {
    let link = open_link(FakeFc {
        mavlink: Some(Box::new(|request| match request {
            MavMessage::Heartbeat(_) => (0..5)
                .map(|i| {
                    MavMessage::Attitude(AttitudeData {
                        time_boot_ms: i,
                        roll: 0.0,
                        pitch: 0.0,
                        yaw: 0.0,
                        rollspeed: 0.0,
                        pitchspeed: 0.0,
                        yawspeed: 0.0,
                    })
                })
                .collect(),
            _ => vec![],
        })),
        ..Default::default()
    });

    let (_token, receiver) = link.subscribe(StreamKind::Attitude, DeliveryMode::LatestOnly);
    let TelemetryReceiver::Latest(mut rx) = receiver else {
        panic!("expected latest receiver");
    };
    link.send_mavlink(heartbeat()).await.unwrap();

    // Give the burst time to land, then read: only the newest survives.
    tokio::time::sleep(Duration::from_millis(200)).await;
    rx.changed().await.unwrap();
    let sample = rx.borrow_and_update().clone().unwrap();
    let groundlink::link::TelemetrySample::Attitude(att) = sample else {
        panic!("expected attitude");
    };
    assert_eq!(att.time_boot_ms, 4);
}

#[tokio::test]
async fn disconnect_fails_pending_calls() {
    let (ours, theirs) = loopback_pair();
    let link = Arc::new(Link::open(
        Box::new(ours),
        LinkConfig::default(),
        EventSender::sink(),
    ));
    let call = {
        let link = Arc::clone(&link);
        tokio::spawn(async move {
            link.call_mavlink(heartbeat(), 0, None, Duration::from_secs(5))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(theirs); // hot-unplug
    let result = call.await.unwrap();
    assert!(matches!(result, Err(RpcError::Disconnected)));
    assert!(!link.is_connected());
}

#[tokio::test]
async fn unsubscribe_releases_the_stream() {
    let link = open_link(FakeFc::default());
    let (token, receiver) = link.subscribe(StreamKind::Gps, DeliveryMode::Ordered);
    let TelemetryReceiver::Ordered(mut rx) = receiver else {
        panic!("expected ordered receiver");
    };
    link.unsubscribe(token);
    // Sender side dropped: the receiver ends instead of blocking forever.
    assert!(rx.recv().await.is_none());
}

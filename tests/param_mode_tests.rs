//! Parameter dump/set and mode-range services against scripted peers.

mod test_shared;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use groundlink::event::{Event, EventBus, EventReceiver};
use groundlink::link::{Link, LinkConfig};
use groundlink::mavlink::messages::{param_id_bytes, param_id_str, MavMessage, ParamValueData};
use groundlink::modes::{ModeClient, ModeRange};
use groundlink::msp::{function, MspFrame};
use groundlink::params::ParamClient;
use groundlink::transport::loopback_pair;

use test_shared::{spawn_fc, FakeFc};

/// A vehicle with a small parameter table.
fn param_fc(store: Arc<Mutex<HashMap<String, f32>>>) -> FakeFc {
    FakeFc {
        mavlink: Some(Box::new(move |request| {
            let mut store = store.lock().unwrap();
            let count = store.len() as u16;
            let value_of = |store: &HashMap<String, f32>, index: u16| {
                let mut names: Vec<&String> = store.keys().collect();
                names.sort();
                let name = names[usize::from(index)].clone();
                MavMessage::ParamValue(ParamValueData {
                    param_value: store[&name],
                    param_count: count,
                    param_index: index,
                    param_id: param_id_bytes(&name),
                    param_type: 9,
                })
            };
            match request {
                MavMessage::ParamRequestList(_) => {
                    (0..count).map(|i| value_of(&store, i)).collect()
                }
                MavMessage::ParamRequestRead(r) => {
                    let wanted = param_id_str(&r.param_id);
                    let mut names: Vec<&String> = store.keys().collect();
                    names.sort();
                    match names.iter().position(|n| ***n == wanted) {
                        Some(index) => vec![value_of(&store, index as u16)],
                        None => vec![],
                    }
                }
                MavMessage::ParamSet(set) => {
                    let name = param_id_str(&set.param_id);
                    store.insert(name.clone(), set.param_value);
                    let mut names: Vec<&String> = store.keys().collect();
                    names.sort();
                    let index = names.iter().position(|n| ***n == name).unwrap() as u16;
                    vec![value_of(&store, index)]
                }
                _ => vec![],
            }
        })),
        ..Default::default()
    }
}

fn param_client(fc: FakeFc) -> (ParamClient, EventReceiver) {
    let (ours, theirs) = loopback_pair();
    spawn_fc(theirs, fc);
    let (events, receiver) = EventBus::channel(256);
    let link = Arc::new(Link::open(Box::new(ours), LinkConfig::default(), events.clone()));
    (ParamClient::new(link, events), receiver)
}

fn changed_events(receiver: &mut EventReceiver) -> Vec<(String, f32)> {
    let mut changed = Vec::new();
    while let Some(event) = receiver.try_recv() {
        if let Event::ParamChanged { id, value } = event {
            changed.push((id, value));
        }
    }
    changed
}

#[tokio::test]
async fn dump_reads_the_whole_table() {
    let store = Arc::new(Mutex::new(HashMap::from([
        ("RATE_RLL_P".to_string(), 0.135),
        ("RATE_PIT_P".to_string(), 0.135),
        ("WPNAV_SPEED".to_string(), 500.0),
    ])));
    let (client, _events) = param_client(param_fc(store));
    let params = client.dump().await.unwrap();
    assert_eq!(params.len(), 3);
    assert!(params.iter().any(|p| p.id == "WPNAV_SPEED" && p.value == 500.0));
    assert_eq!(client.cached("RATE_RLL_P").unwrap().value, 0.135);
}

#[tokio::test]
async fn writing_values_back_unchanged_is_event_silent() {
    let store = Arc::new(Mutex::new(HashMap::from([
        ("RATE_RLL_P".to_string(), 0.135),
        ("RATE_PIT_P".to_string(), 0.2),
    ])));
    let (client, mut events) = param_client(param_fc(store));

    let params = client.dump().await.unwrap();
    let _ = changed_events(&mut events);

    // Write every parameter back exactly as read.
    for param in &params {
        client.set(&param.id, param.value, param.param_type).await.unwrap();
    }
    assert!(
        changed_events(&mut events).is_empty(),
        "unchanged writes must not emit ParamChanged"
    );

    // Values re-read identically.
    let again = client.dump().await.unwrap();
    assert_eq!(params, again);

    // An actual change does emit.
    client.set("RATE_RLL_P", 0.150, 9).await.unwrap();
    assert_eq!(
        changed_events(&mut events),
        vec![("RATE_RLL_P".to_string(), 0.150)]
    );
}

#[tokio::test]
async fn get_single_parameter_by_name() {
    let store = Arc::new(Mutex::new(HashMap::from([(
        "ANGLE_MAX".to_string(),
        4500.0,
    )])));
    let (client, _events) = param_client(param_fc(store));
    let param = client.get("ANGLE_MAX").await.unwrap();
    assert_eq!(param.value, 4500.0);
}

/// A Betaflight-style FC with 20 mode slots and an EEPROM flag.
fn mode_fc(
    slots: Arc<Mutex<Vec<[u8; 4]>>>,
    set_count: Arc<Mutex<usize>>,
    saved: Arc<Mutex<bool>>,
) -> FakeFc {
    FakeFc {
        msp: Some(Box::new(move |request| match request.function {
            function::MSP_MODE_RANGES => {
                let payload: Vec<u8> = slots.lock().unwrap().iter().flatten().copied().collect();
                Some(MspFrame::response(request.function, payload))
            }
            function::MSP_SET_MODE_RANGE => {
                let p = &request.payload;
                if p.len() >= 5 {
                    let index = usize::from(p[0]);
                    slots.lock().unwrap()[index] = [p[1], p[2], p[3], p[4]];
                    *set_count.lock().unwrap() += 1;
                }
                Some(MspFrame::response(request.function, Vec::new()))
            }
            function::MSP_EEPROM_WRITE => {
                *saved.lock().unwrap() = true;
                Some(MspFrame::response(request.function, Vec::new()))
            }
            _ => None,
        })),
        ..Default::default()
    }
}

fn mode_client(fc: FakeFc) -> ModeClient {
    let (ours, theirs) = loopback_pair();
    spawn_fc(theirs, fc);
    let (events, mut receiver) = EventBus::channel(64);
    tokio::spawn(async move { while receiver.recv().await.is_some() {} });
    let link = Arc::new(Link::open(Box::new(ours), LinkConfig::default(), events));
    ModeClient::new(link)
}

#[tokio::test]
async fn mode_ranges_read_write_and_persist() {
    let slots = Arc::new(Mutex::new(vec![[0u8; 4]; 20]));
    let set_count = Arc::new(Mutex::new(0));
    let saved = Arc::new(Mutex::new(false));
    let client = mode_client(mode_fc(
        Arc::clone(&slots),
        Arc::clone(&set_count),
        Arc::clone(&saved),
    ));

    let ranges = client.read().await.unwrap();
    assert_eq!(ranges.len(), 20);
    assert!(ranges.iter().all(ModeRange::is_disabled));

    let armed = ModeRange {
        box_id: 0,
        aux_channel: 1,
        range_start: 1700,
        range_end: 2100,
    };
    assert!(client.write_slot(0, armed).await.unwrap());
    assert_eq!(slots.lock().unwrap()[0], [0, 1, 32, 48]);

    client.save_eeprom().await.unwrap();
    assert!(*saved.lock().unwrap());
}

#[tokio::test]
async fn rewriting_an_identical_slot_stays_off_the_wire() {
    let slots = Arc::new(Mutex::new(vec![[0u8; 4]; 20]));
    let set_count = Arc::new(Mutex::new(0));
    let saved = Arc::new(Mutex::new(false));
    let client = mode_client(mode_fc(
        Arc::clone(&slots),
        Arc::clone(&set_count),
        Arc::clone(&saved),
    ));

    client.read().await.unwrap();
    let range = ModeRange {
        box_id: 2,
        aux_channel: 0,
        range_start: 1300,
        range_end: 1700,
    };
    assert!(client.write_slot(3, range).await.unwrap());
    assert_eq!(*set_count.lock().unwrap(), 1);

    // Same value again: nothing hits the wire.
    assert!(!client.write_slot(3, range).await.unwrap());
    assert_eq!(*set_count.lock().unwrap(), 1);
}

#[tokio::test]
async fn clearing_a_slot_uses_equal_start_and_end() {
    let slots = Arc::new(Mutex::new(vec![[1u8, 2, 10, 20]; 20]));
    let set_count = Arc::new(Mutex::new(0));
    let saved = Arc::new(Mutex::new(false));
    let client = mode_client(mode_fc(
        Arc::clone(&slots),
        Arc::clone(&set_count),
        Arc::clone(&saved),
    ));

    client.read().await.unwrap();
    let cleared = ModeRange {
        box_id: 0,
        aux_channel: 0,
        range_start: 900,
        range_end: 900,
    };
    assert!(client.write_slot(0, cleared).await.unwrap());
    assert_eq!(slots.lock().unwrap()[0], [0, 0, 0, 0]);
}

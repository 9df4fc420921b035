//! Chunked mission and rally-point transfer (MAVLink).
//!
//! Download: `MISSION_REQUEST_LIST` → `MISSION_COUNT{n}` → n ×
//! (`MISSION_REQUEST_INT{seq}` → `MISSION_ITEM_INT`) → final
//! `MISSION_ACK{ACCEPTED}`. Upload mirrors it; retries on missing items
//! are driven by the vehicle's re-requests, answered from a locally
//! buffered list. Rally points ride the same machinery with
//! `mission_type = RALLY`.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{MissionError, RpcError};
use crate::event::{Event, EventSender};
use crate::link::{Expect, Link, Outbound};
use crate::mavlink::messages::{
    self, MavMessage, MavMissionResult, MessageData, MissionAckData, MissionClearAllData,
    MissionCountData, MissionItemIntData, MissionRequestIntData, MissionRequestListData,
};

pub use crate::mavlink::messages::mission_type;

/// Per-message deadline inside a transfer.
pub const ITEM_TIMEOUT: Duration = Duration::from_millis(1500);

fn rpc_err(e: RpcError) -> MissionError {
    match e {
        RpcError::Timeout => MissionError::Timeout,
        other => MissionError::Rpc(other),
    }
}

/// An ArduPilot rally point, carried on the wire as a mission item with
/// `mission_type = RALLY` and command `NAV_RALLY_POINT`.
///
/// `altitude` is treated as metres relative to home; confirm the frame
/// against the target firmware before relying on it (ArduPilot's rally
/// altitude frame has varied historically), and override `frame` when it
/// does.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RallyPoint {
    pub seq: u16,
    pub lat: f64,
    pub lon: f64,
    pub altitude: f32,
    pub break_altitude: f32,
    pub land_direction: u16,
    pub flags: u8,
}

/// MAV_FRAME_GLOBAL_RELATIVE_ALT.
const RALLY_FRAME: u8 = 3;

impl RallyPoint {
    pub fn to_item(&self, target_system: u8, target_component: u8) -> MissionItemIntData {
        MissionItemIntData {
            param1: self.break_altitude,
            param2: f32::from(self.land_direction),
            param3: f32::from(self.flags),
            param4: 0.0,
            x: (self.lat * 1e7) as i32,
            y: (self.lon * 1e7) as i32,
            z: self.altitude,
            seq: self.seq,
            command: messages::cmd::NAV_RALLY_POINT,
            target_system,
            target_component,
            frame: RALLY_FRAME,
            current: 0,
            autocontinue: 0,
            mission_type: mission_type::RALLY,
        }
    }

    pub fn from_item(item: &MissionItemIntData) -> Self {
        Self {
            seq: item.seq,
            lat: f64::from(item.x) / 1e7,
            lon: f64::from(item.y) / 1e7,
            altitude: item.z,
            break_altitude: item.param1,
            land_direction: item.param2 as u16,
            flags: item.param3 as u8,
        }
    }
}

/// Mission transfer client; borrows the link, never owns it.
pub struct MissionClient {
    link: Arc<Link>,
    events: EventSender,
}

impl MissionClient {
    pub fn new(link: Arc<Link>, events: EventSender) -> Self {
        Self { link, events }
    }

    fn targets(&self) -> (u8, u8) {
        let config = self.link.config();
        (config.target_system, config.target_component)
    }

    /// Download every item of `mission_type` from the vehicle.
    pub async fn download(
        &self,
        mission_type: u8,
    ) -> Result<Vec<MissionItemIntData>, MissionError> {
        let _bulk = self.link.begin_bulk().await;
        let (target_system, target_component) = self.targets();
        let count = self
            .link
            .call_mavlink(
                MavMessage::MissionRequestList(MissionRequestListData {
                    target_system,
                    target_component,
                    mission_type,
                }),
                MissionCountData::ID,
                Some(Box::new(move |m| {
                    matches!(m, MavMessage::MissionCount(c) if c.mission_type == mission_type)
                })),
                ITEM_TIMEOUT,
            )
            .await
            .map_err(rpc_err)?;
        let MavMessage::MissionCount(count) = count else {
            return Err(MissionError::Rpc(RpcError::Cancelled));
        };
        let total = count.count;
        self.events
            .emit(Event::MissionProgress {
                done: 0,
                total,
            })
            .await;

        let mut items = Vec::with_capacity(usize::from(total));
        for seq in 0..total {
            let reply = self
                .link
                .call_mavlink(
                    MavMessage::MissionRequestInt(MissionRequestIntData {
                        seq,
                        target_system,
                        target_component,
                        mission_type,
                    }),
                    MissionItemIntData::ID,
                    Some(Box::new(move |m| {
                        matches!(m, MavMessage::MissionItemInt(i) if i.mission_type == mission_type)
                    })),
                    ITEM_TIMEOUT,
                )
                .await
                .map_err(rpc_err)?;
            let MavMessage::MissionItemInt(item) = reply else {
                return Err(MissionError::Rpc(RpcError::Cancelled));
            };
            if item.seq != seq {
                return Err(MissionError::OutOfOrderItem {
                    expected: seq,
                    got: item.seq,
                });
            }
            items.push(item);
            self.events
                .emit(Event::MissionProgress {
                    done: seq + 1,
                    total,
                })
                .await;
        }

        // Our ack closes the transfer; an empty mission is just the count
        // and this ack.
        self.link
            .send_mavlink(MavMessage::MissionAck(MissionAckData {
                target_system,
                target_component,
                mavtype: MavMissionResult::Accepted as u8,
                mission_type,
            }))
            .await?;
        self.events
            .emit(Event::MissionTransferComplete { count: total })
            .await;
        Ok(items)
    }

    /// Upload `items` (already numbered 0..n) as `mission_type`.
    pub async fn upload(
        &self,
        items: &[MissionItemIntData],
        mission_type: u8,
    ) -> Result<(), MissionError> {
        let _bulk = self.link.begin_bulk().await;
        let (target_system, target_component) = self.targets();
        let total = items.len() as u16;

        if items.is_empty() {
            // Zero-item upload degenerates to a clear.
            return self.clear(mission_type).await;
        }

        let request_expect = move || Expect::Mavlink {
            msg_id: MissionRequestIntData::ID,
            predicate: Some(Box::new(move |m: &MavMessage| {
                matches!(m, MavMessage::MissionRequestInt(r) if r.mission_type == mission_type)
            })),
        };
        // Both waiters exist before the count goes out, so the vehicle's
        // first re-request cannot race the registration.
        let mut request = self.link.expect(request_expect());
        let mut ack = self.link.expect(Expect::Mavlink {
            msg_id: MissionAckData::ID,
            predicate: Some(Box::new(move |m: &MavMessage| {
                matches!(m, MavMessage::MissionAck(a) if a.mission_type == mission_type)
            })),
        });
        self.link
            .send_mavlink(MavMessage::MissionCount(MissionCountData {
                count: total,
                target_system,
                target_component,
                mission_type,
            }))
            .await?;

        let mut sent: u16 = 0;
        loop {
            tokio::select! {
                requested = request.recv(ITEM_TIMEOUT) => {
                    let frame = requested.map_err(rpc_err)?;
                    let Some(MavMessage::MissionRequestInt(wanted)) = frame.mavlink() else {
                        continue;
                    };
                    let Some(item) = items.get(usize::from(wanted.seq)) else {
                        return Err(MissionError::OutOfOrderItem {
                            expected: total.saturating_sub(1),
                            got: wanted.seq,
                        });
                    };
                    let mut item = *item;
                    item.seq = wanted.seq;
                    item.target_system = target_system;
                    item.target_component = target_component;
                    item.mission_type = mission_type;
                    // Re-arm before the item goes out; the next re-request
                    // follows immediately.
                    request = self.link.expect(request_expect());
                    self.link
                        .send_mavlink(MavMessage::MissionItemInt(item))
                        .await?;
                    sent = sent.max(wanted.seq + 1);
                    self.events
                        .emit(Event::MissionProgress { done: sent, total })
                        .await;
                }
                acked = ack.recv(ITEM_TIMEOUT) => {
                    let frame = acked.map_err(rpc_err)?;
                    let Some(MavMessage::MissionAck(confirmed)) = frame.mavlink() else {
                        continue;
                    };
                    if confirmed.result() == Some(MavMissionResult::Accepted) {
                        self.events
                            .emit(Event::MissionTransferComplete { count: total })
                            .await;
                        return Ok(());
                    }
                    return Err(MissionError::AckRejected(confirmed.mavtype));
                }
            }
        }
    }

    pub async fn clear(&self, mission_type: u8) -> Result<(), MissionError> {
        let (target_system, target_component) = self.targets();
        let ack = self
            .link
            .call(
                Outbound::Mavlink(MavMessage::MissionClearAll(MissionClearAllData {
                    target_system,
                    target_component,
                    mission_type,
                })),
                Expect::Mavlink {
                    msg_id: MissionAckData::ID,
                    predicate: Some(Box::new(move |m| {
                        matches!(m, MavMessage::MissionAck(a) if a.mission_type == mission_type)
                    })),
                },
                ITEM_TIMEOUT,
            )
            .await
            .map_err(rpc_err)?;
        let Some(MavMessage::MissionAck(ack)) = ack.mavlink() else {
            return Err(MissionError::Rpc(RpcError::Cancelled));
        };
        if ack.result() == Some(MavMissionResult::Accepted) {
            Ok(())
        } else {
            Err(MissionError::AckRejected(ack.mavtype))
        }
    }

    /// Rally-point conveniences over the same transfer machinery.
    pub async fn download_rally(&self) -> Result<Vec<RallyPoint>, MissionError> {
        let items = self.download(mission_type::RALLY).await?;
        Ok(items.iter().map(RallyPoint::from_item).collect())
    }

    pub async fn upload_rally(&self, points: &[RallyPoint]) -> Result<(), MissionError> {
        let (target_system, target_component) = self.targets();
        let items: Vec<MissionItemIntData> = points
            .iter()
            .map(|p| p.to_item(target_system, target_component))
            .collect();
        self.upload(&items, mission_type::RALLY).await
    }

    pub async fn clear_rally(&self) -> Result<(), MissionError> {
        self.clear(mission_type::RALLY).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rally_point_item_roundtrip() {
        let point = RallyPoint {
            seq: 2,
            lat: 47.3977,
            lon: 8.5456,
            altitude: 100.0,
            break_altitude: 60.0,
            land_direction: 180,
            flags: 1,
        };
        let item = point.to_item(1, 1);
        assert_eq!(item.command, messages::cmd::NAV_RALLY_POINT);
        assert_eq!(item.mission_type, mission_type::RALLY);
        let back = RallyPoint::from_item(&item);
        assert!((back.lat - point.lat).abs() < 1e-6);
        assert!((back.lon - point.lon).abs() < 1e-6);
        assert_eq!(back.altitude, point.altitude);
        assert_eq!(back.land_direction, point.land_direction);
    }
}

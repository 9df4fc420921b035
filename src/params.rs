//! Parameter service (MAVLink).
//!
//! A full dump is `PARAM_REQUEST_LIST` answered by `param_count` unsolicited
//! `PARAM_VALUE` messages. Values are cached per connection, keyed by the
//! null-terminated 16-character id; the cache is invalidated on disconnect
//! by dropping the client. A write is `PARAM_SET` confirmed by the echoed
//! `PARAM_VALUE`; `ParamChanged` fires only when the value actually
//! changed, so writing back an unmodified dump is event-silent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::RpcError;
use crate::event::{Event, EventSender};
use crate::link::{Expect, Link};
use crate::mavlink::messages::{
    param_id_bytes, param_id_str, MavMessage, MessageData, ParamRequestListData,
    ParamRequestReadData, ParamSetData, ParamValueData,
};

/// Deadline for a single PARAM_VALUE.
pub const PARAM_TIMEOUT: Duration = Duration::from_millis(1500);
/// Waiters pre-registered before the dump request goes out, to cover the
/// burst before the count is known.
const DUMP_PREREGISTER: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub id: String,
    pub value: f32,
    pub param_type: u8,
    pub index: u16,
}

impl From<&ParamValueData> for Param {
    fn from(value: &ParamValueData) -> Self {
        Self {
            id: value.id_str(),
            value: value.param_value,
            param_type: value.param_type,
            index: value.param_index,
        }
    }
}

pub struct ParamClient {
    link: Arc<Link>,
    events: EventSender,
    cache: Mutex<HashMap<String, Param>>,
}

impl ParamClient {
    pub fn new(link: Arc<Link>, events: EventSender) -> Self {
        Self {
            link,
            events,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Cached copy, when the parameter has been seen this connection.
    pub fn cached(&self, id: &str) -> Option<Param> {
        self.cache.lock().unwrap().get(id).cloned()
    }

    /// Read one parameter by name.
    pub async fn get(&self, id: &str) -> Result<Param, RpcError> {
        let config = self.link.config().clone();
        let wanted = param_id_bytes(id);
        let reply = self
            .link
            .call_mavlink(
                MavMessage::ParamRequestRead(ParamRequestReadData {
                    param_index: -1,
                    target_system: config.target_system,
                    target_component: config.target_component,
                    param_id: wanted,
                }),
                ParamValueData::ID,
                Some(Box::new(move |m| {
                    matches!(m, MavMessage::ParamValue(v) if v.param_id == wanted)
                })),
                PARAM_TIMEOUT,
            )
            .await?;
        let MavMessage::ParamValue(value) = reply else {
            return Err(RpcError::Cancelled);
        };
        let param = Param::from(&value);
        self.cache
            .lock()
            .unwrap()
            .insert(param.id.clone(), param.clone());
        Ok(param)
    }

    /// Write one parameter and await the echoed confirmation.
    pub async fn set(&self, id: &str, value: f32, param_type: u8) -> Result<Param, RpcError> {
        let config = self.link.config().clone();
        let wanted = param_id_bytes(id);
        let reply = self
            .link
            .call_mavlink(
                MavMessage::ParamSet(ParamSetData {
                    param_value: value,
                    target_system: config.target_system,
                    target_component: config.target_component,
                    param_id: wanted,
                    param_type,
                }),
                ParamValueData::ID,
                Some(Box::new(move |m| {
                    matches!(m, MavMessage::ParamValue(v) if v.param_id == wanted)
                })),
                PARAM_TIMEOUT,
            )
            .await?;
        let MavMessage::ParamValue(confirmed) = reply else {
            return Err(RpcError::Cancelled);
        };
        let param = Param::from(&confirmed);
        let previous = self
            .cache
            .lock()
            .unwrap()
            .insert(param.id.clone(), param.clone());
        let changed = previous.map_or(true, |p| p.value != param.value);
        if changed {
            self.events
                .emit(Event::ParamChanged {
                    id: param.id.clone(),
                    value: param.value,
                })
                .await;
        }
        Ok(param)
    }

    /// Dump every parameter the vehicle has.
    pub async fn dump(&self) -> Result<Vec<Param>, RpcError> {
        let _bulk = self.link.begin_bulk().await;
        let config = self.link.config().clone();

        // Cover the burst that follows the request before the count is
        // known; more waiters are registered on demand once the first
        // value names the total. Dropping a surplus waiter unregisters it.
        let mut pending: std::collections::VecDeque<_> = (0..DUMP_PREREGISTER)
            .map(|_| {
                self.link.expect(Expect::Mavlink {
                    msg_id: ParamValueData::ID,
                    predicate: None,
                })
            })
            .collect();
        self.link
            .send_mavlink(MavMessage::ParamRequestList(ParamRequestListData {
                target_system: config.target_system,
                target_component: config.target_component,
            }))
            .await?;

        let mut received: HashMap<u16, ParamValueData> = HashMap::new();
        let mut total: Option<u16> = None;

        while total.map_or(true, |t| received.len() < usize::from(t)) {
            let waiter = pending.pop_front().unwrap_or_else(|| {
                self.link.expect(Expect::Mavlink {
                    msg_id: ParamValueData::ID,
                    predicate: None,
                })
            });
            let frame = waiter.wait(PARAM_TIMEOUT).await?;
            let Some(MavMessage::ParamValue(value)) = frame.mavlink() else {
                continue;
            };
            if total.is_none() {
                total = Some(value.param_count);
                let remaining = usize::from(value.param_count).saturating_sub(1);
                while pending.len() > remaining {
                    drop(pending.pop_back());
                }
            }
            received.insert(value.param_index, value);
            self.events
                .emit(Event::ParamProgress {
                    done: received.len() as u16,
                    total: total.unwrap_or(0),
                })
                .await;
        }
        drop(pending);

        let mut params: Vec<Param> = received.values().map(Param::from).collect();
        params.sort_by_key(|p| p.index);
        let mut cache = self.cache.lock().unwrap();
        for param in &params {
            cache.insert(param.id.clone(), param.clone());
        }
        Ok(params)
    }

    /// Id render helper for shells that work with the raw 16-byte field.
    pub fn id_to_string(id: &[u8; 16]) -> String {
        param_id_str(id)
    }
}

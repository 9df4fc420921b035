//! Flight-mode switch assignments (MSP, Betaflight/iNav).
//!
//! A mode range binds a box id to an AUX channel and a PWM window. The
//! wire carries the window as 25 µs steps from 900 µs; at most 20 slots
//! exist and `start == end` marks a slot disabled. Writes go one slot at a
//! time; `MSP_EEPROM_WRITE` persists the result. A slot already matching
//! the FC state is skipped, so a no-op write produces no wire traffic
//! beyond the read-back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::RpcError;
use crate::link::Link;
use crate::msp::function;

pub const MODE_SLOTS: usize = 20;
pub const PWM_MIN: u16 = 900;
pub const PWM_MAX: u16 = 2100;
pub const PWM_STEP: u16 = 25;

const MSP_TIMEOUT: Duration = Duration::from_millis(500);
/// EEPROM writes stall the FC briefly.
const EEPROM_TIMEOUT: Duration = Duration::from_secs(3);

/// One mode-range slot, in PWM microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModeRange {
    pub box_id: u8,
    pub aux_channel: u8,
    pub range_start: u16,
    pub range_end: u16,
}

impl ModeRange {
    /// Snap to the 25 µs grid and clamp into [900, 2100], keeping
    /// `start ≤ end`.
    pub fn normalized(self) -> Self {
        let snap = |pwm: u16| -> u16 {
            let pwm = pwm.clamp(PWM_MIN, PWM_MAX);
            PWM_MIN + ((pwm - PWM_MIN + PWM_STEP / 2) / PWM_STEP) * PWM_STEP
        };
        let start = snap(self.range_start);
        let end = snap(self.range_end).max(start);
        Self {
            range_start: start,
            range_end: end,
            ..self
        }
    }

    /// `start == end` disables the slot.
    pub fn is_disabled(&self) -> bool {
        self.range_start == self.range_end
    }

    fn to_steps(self) -> (u8, u8) {
        (
            ((self.range_start - PWM_MIN) / PWM_STEP) as u8,
            ((self.range_end - PWM_MIN) / PWM_STEP) as u8,
        )
    }

    fn from_steps(box_id: u8, aux_channel: u8, start: u8, end: u8) -> Self {
        Self {
            box_id,
            aux_channel,
            range_start: PWM_MIN + u16::from(start) * PWM_STEP,
            range_end: PWM_MIN + u16::from(end) * PWM_STEP,
        }
    }
}

pub struct ModeClient {
    link: Arc<Link>,
    /// Box id to flight-mode name, filled lazily from MSP_BOXNAMES and
    /// MSP_BOXIDS.
    box_names: Mutex<HashMap<u8, String>>,
    last_read: Mutex<Option<Vec<ModeRange>>>,
}

impl ModeClient {
    pub fn new(link: Arc<Link>) -> Self {
        Self {
            link,
            box_names: Mutex::new(HashMap::new()),
            last_read: Mutex::new(None),
        }
    }

    /// Read all 20 slots.
    pub async fn read(&self) -> Result<Vec<ModeRange>, RpcError> {
        let reply = self
            .link
            .call_msp(function::MSP_MODE_RANGES, Vec::new(), MSP_TIMEOUT)
            .await?;
        let mut ranges = Vec::with_capacity(MODE_SLOTS);
        for slot in reply.payload.chunks_exact(4) {
            ranges.push(ModeRange::from_steps(slot[0], slot[1], slot[2], slot[3]));
        }
        *self.last_read.lock().unwrap() = Some(ranges.clone());
        Ok(ranges)
    }

    /// Write one slot. Returns `false` when the FC already holds this
    /// value and nothing was sent.
    pub async fn write_slot(&self, slot: u8, range: ModeRange) -> Result<bool, RpcError> {
        let range = range.normalized();
        let unchanged = self
            .last_read
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|r| r.get(usize::from(slot)))
            .map_or(false, |current| *current == range);
        if unchanged {
            return Ok(false);
        }
        let (start, end) = range.to_steps();
        self.link
            .call_msp(
                function::MSP_SET_MODE_RANGE,
                vec![slot, range.box_id, range.aux_channel, start, end],
                MSP_TIMEOUT,
            )
            .await?;
        if let Some(cached) = self.last_read.lock().unwrap().as_mut() {
            if let Some(entry) = cached.get_mut(usize::from(slot)) {
                *entry = range;
            }
        }
        Ok(true)
    }

    /// Write up to 20 slots; missing entries are written as disabled.
    /// Returns the number of slots that actually hit the wire.
    pub async fn write_all(&self, ranges: &[ModeRange]) -> Result<usize, RpcError> {
        let mut written = 0;
        for slot in 0..MODE_SLOTS {
            let range = ranges.get(slot).copied().unwrap_or_default();
            if self.write_slot(slot as u8, range).await? {
                written += 1;
            }
        }
        Ok(written)
    }

    /// Persist the current configuration to EEPROM.
    pub async fn save_eeprom(&self) -> Result<(), RpcError> {
        self.link
            .call_msp(function::MSP_EEPROM_WRITE, Vec::new(), EEPROM_TIMEOUT)
            .await?;
        Ok(())
    }

    /// Box-id → name mapping, fetched once per connection.
    pub async fn box_names(&self) -> Result<HashMap<u8, String>, RpcError> {
        {
            let cached = self.box_names.lock().unwrap();
            if !cached.is_empty() {
                return Ok(cached.clone());
            }
        }
        let names = self
            .link
            .call_msp(function::MSP_BOXNAMES, Vec::new(), MSP_TIMEOUT)
            .await?;
        let ids = self
            .link
            .call_msp(function::MSP_BOXIDS, Vec::new(), MSP_TIMEOUT)
            .await?;
        let names_text = String::from_utf8_lossy(&names.payload);
        let names: Vec<&str> = names_text
            .split(';')
            .filter(|s| !s.is_empty())
            .collect();
        let mut map = HashMap::new();
        for (index, &id) in ids.payload.iter().enumerate() {
            if let Some(name) = names.get(index) {
                map.insert(id, (*name).to_owned());
            }
        }
        *self.box_names.lock().unwrap() = map.clone();
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_snaps_to_grid() {
        let range = ModeRange {
            box_id: 0,
            aux_channel: 1,
            range_start: 1312,
            range_end: 1687,
        }
        .normalized();
        assert_eq!(range.range_start, 1300);
        assert_eq!(range.range_end, 1675);
    }

    #[test]
    fn normalize_clamps_and_orders() {
        let range = ModeRange {
            box_id: 0,
            aux_channel: 0,
            range_start: 2500,
            range_end: 800,
        }
        .normalized();
        assert_eq!(range.range_start, 2100);
        assert_eq!(range.range_end, 2100);
        assert!(range.is_disabled());
    }

    #[test]
    fn step_conversion_roundtrip() {
        let range = ModeRange {
            box_id: 3,
            aux_channel: 2,
            range_start: 1300,
            range_end: 1700,
        };
        let (start, end) = range.to_steps();
        assert_eq!(
            ModeRange::from_steps(3, 2, start, end),
            range
        );
    }
}

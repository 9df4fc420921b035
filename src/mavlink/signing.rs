//! MAVLink 2 message signing.
//!
//! A signed frame carries a 13-byte trailer: link id, a 48-bit timestamp
//! in 10 µs units since 2015-01-01, and the first 6 bytes of
//! `sha256(secret ‖ frame)`. See
//! <https://mavlink.io/en/guide/message_signing.html>.
//!
//! Without a configured secret the link accepts signed frames unverified
//! and sends unsigned ones; `allow_unsigned` is the policy hook for
//! stricter setups.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;

use sha2::{Digest, Sha256};

use super::{MavlinkV2Raw, MAV_STX_V2};

/// Unix time of the signing epoch (1st January 2015 GMT).
const SIGNING_EPOCH_UNIX_SECS: u64 = 1_420_070_400;
/// One minute expressed in the trailer's 10 µs timestamp units. A frame
/// opening a new stream further in the past than this is refused.
const NEW_STREAM_GRACE: u64 = 6_000_000;

/// Signing policy for one link.
#[derive(Debug, Clone)]
pub struct SigningConfig {
    secret_key: [u8; 32],
    pub(crate) sign_outgoing: bool,
    allow_unsigned: bool,
}

impl SigningConfig {
    pub fn new(secret_key: [u8; 32], sign_outgoing: bool, allow_unsigned: bool) -> Self {
        Self {
            secret_key,
            sign_outgoing,
            allow_unsigned,
        }
    }
}

// Timestamp bookkeeping, per link. The trailer timestamp must increase
// strictly within each (link id, system, component) stream; `clock` is our
// local high-water mark across all of them.
struct SigningState {
    clock: u64,
    // A point-to-point USB link only ever uses link id 0.
    link_id: u8,
    streams: HashMap<(u8, u8, u8), u64>,
}

impl SigningState {
    /// Timestamp admission for an inbound frame whose signature already
    /// checked out. Rejects replays and ancient new streams; on success
    /// the stream high-water mark moves forward.
    fn admit(&mut self, stream: (u8, u8, u8), timestamp: u64) -> bool {
        self.clock = self.clock.max(wall_clock());
        let floor = match self.streams.get(&stream) {
            Some(&last_seen) => last_seen.saturating_add(1),
            None => self.clock.saturating_sub(NEW_STREAM_GRACE),
        };
        if timestamp < floor {
            return false;
        }
        self.streams.insert(stream, timestamp);
        self.clock = self.clock.max(timestamp);
        true
    }

    /// Strictly increasing timestamp for the next outbound frame.
    fn next_timestamp(&mut self) -> u64 {
        self.clock = self.clock.max(wall_clock());
        let stamped = self.clock;
        self.clock += 1;
        stamped
    }
}

/// Signing configuration plus the per-stream timestamp state.
pub struct SigningData {
    config: SigningConfig,
    state: Mutex<SigningState>,
}

impl SigningData {
    pub fn from_config(config: SigningConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SigningState {
                clock: 0,
                link_id: 0,
                streams: HashMap::new(),
            }),
        }
    }

    pub fn sign_outgoing(&self) -> bool {
        self.config.sign_outgoing
    }

    /// Verify the trailer of a v2 frame. Unsigned frames pass only when
    /// the policy allows them; signed frames must carry a genuine
    /// signature *and* a timestamp that advances their stream.
    pub fn verify_frame(&self, frame: &MavlinkV2Raw) -> bool {
        if !frame.is_signed() {
            return self.config.allow_unsigned;
        }
        if signature48(&self.config.secret_key, frame) != frame.signature_value() {
            return false;
        }
        let stream = (
            frame.signature_link_id(),
            frame.system_id(),
            frame.component_id(),
        );
        self.state
            .lock()
            .expect("signing state poisoned")
            .admit(stream, frame.signature_timestamp())
    }

    /// Fill in the trailer of a frame whose SIGNED incompat bit is already
    /// set.
    pub fn sign_frame(&self, frame: &mut MavlinkV2Raw) {
        if !frame.is_signed() {
            return;
        }
        let (link_id, timestamp) = {
            let mut state = self.state.lock().expect("signing state poisoned");
            (state.link_id, state.next_timestamp())
        };
        *frame.signature_link_id_mut() = link_id;
        frame
            .signature_timestamp_bytes_mut()
            .copy_from_slice(&timestamp.to_le_bytes()[..6]);
        let signature = signature48(&self.config.secret_key, frame);
        frame.signature_value_mut().copy_from_slice(&signature);
    }
}

/// First 48 bits of SHA-256 over the secret and the frame, trailer fields
/// up to (but excluding) the signature value included.
fn signature48(secret_key: &[u8; 32], frame: &MavlinkV2Raw) -> [u8; 6] {
    let stx = [MAV_STX_V2];
    let link_id = [frame.signature_link_id()];
    let mut hasher = Sha256::new();
    for part in [
        &secret_key[..],
        &stx[..],
        frame.header_bytes(),
        frame.payload(),
        frame.checksum_bytes(),
        &link_id[..],
        frame.signature_timestamp_bytes(),
    ] {
        hasher.update(part);
    }
    let mut signature = [0u8; 6];
    signature.copy_from_slice(&hasher.finalize()[..6]);
    signature
}

/// Current time in trailer units. Clamps to zero before the signing epoch;
/// 48 bits of this overflow in 2104.
fn wall_clock() -> u64 {
    let unix_micros = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
    unix_micros.saturating_sub(SIGNING_EPOCH_UNIX_SECS * 1_000_000) / 10
}

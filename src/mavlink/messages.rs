//! Typed MAVLink messages.
//!
//! The subset of the `common`/`ardupilotmega` dialect this station speaks,
//! with the wire layout (fields sorted by size, extensions appended) and
//! the per-message CRC-extra constants baked in. Serialisers are pure
//! functions of the typed record; payload truncation and framing happen in
//! the codec.

use byteorder::{ByteOrder, LittleEndian};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::error::ProtocolError;

/// Mission categories carried in `mission_type` fields.
pub mod mission_type {
    pub const MISSION: u8 = 0;
    pub const FENCE: u8 = 1;
    pub const RALLY: u8 = 2;
}

/// MAV_CMD ids used by the station.
pub mod cmd {
    pub const PREFLIGHT_REBOOT_SHUTDOWN: u16 = 246;
    pub const REQUEST_MESSAGE: u16 = 512;
    pub const NAV_RALLY_POINT: u16 = 5100;
}

/// MAV_PARAM_TYPE values used when reading/writing parameters by name.
pub mod param_type {
    pub const UINT8: u8 = 1;
    pub const INT8: u8 = 2;
    pub const UINT16: u8 = 3;
    pub const INT16: u8 = 4;
    pub const UINT32: u8 = 5;
    pub const INT32: u8 = 6;
    pub const REAL32: u8 = 9;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
pub enum MavAutopilot {
    Generic = 0,
    Reserved = 1,
    Slugs = 2,
    ArduPilotMega = 3,
    OpenPilot = 4,
    GenericMissionFull = 7,
    Invalid = 8,
    Ppz = 9,
    UdbKalman = 10,
    Px4 = 12,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
pub enum MavType {
    Generic = 0,
    FixedWing = 1,
    Quadrotor = 2,
    Coaxial = 3,
    Helicopter = 4,
    GroundRover = 10,
    SurfaceBoat = 11,
    Submarine = 12,
    Hexarotor = 13,
    Octorotor = 14,
    Tricopter = 15,
    VtolTiltrotor = 21,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
pub enum MavState {
    Uninit = 0,
    Boot = 1,
    Calibrating = 2,
    Standby = 3,
    Active = 4,
    Critical = 5,
    Emergency = 6,
    Poweroff = 7,
    FlightTermination = 8,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
pub enum MavMissionResult {
    Accepted = 0,
    Error = 1,
    UnsupportedFrame = 2,
    Unsupported = 3,
    NoSpace = 4,
    Invalid = 5,
    InvalidParam1 = 6,
    InvalidParam2 = 7,
    InvalidParam3 = 8,
    InvalidParam4 = 9,
    InvalidParam5X = 10,
    InvalidParam6Y = 11,
    InvalidParam7 = 12,
    InvalidSequence = 13,
    Denied = 14,
    OperationCancelled = 15,
}

bitflags::bitflags! {
    /// HEARTBEAT `base_mode` bit field.
    pub struct MavModeFlag: u8 {
        const CUSTOM_MODE_ENABLED = 0x01;
        const TEST_ENABLED = 0x02;
        const AUTO_ENABLED = 0x04;
        const GUIDED_ENABLED = 0x08;
        const STABILIZE_ENABLED = 0x10;
        const HIL_ENABLED = 0x20;
        const MANUAL_INPUT_ENABLED = 0x40;
        const SAFETY_ARMED = 0x80;
    }
}

/// Static description every typed message carries.
pub trait MessageData: Sized {
    const ID: u32;
    const NAME: &'static str;
    const EXTRA_CRC: u8;
    /// Full payload length, extension fields included (v2).
    const ENCODED_LEN: usize;
    /// Payload length without extensions (v1).
    const V1_LEN: usize;

    /// Write the fixed-width payload into `buf` (`ENCODED_LEN` bytes).
    fn ser(&self, buf: &mut [u8]);
    /// Read from a payload that may be truncated (v2) — missing trailing
    /// bytes read as zero.
    fn deser(payload: &[u8]) -> Result<Self, ProtocolError>;
}

#[inline]
fn padded<const N: usize>(payload: &[u8]) -> [u8; N] {
    let mut buf = [0u8; N];
    let n = payload.len().min(N);
    buf[..n].copy_from_slice(&payload[..n]);
    buf
}

fn copy_id(dst: &mut [u8], id: &[u8; 16]) {
    dst[..16].copy_from_slice(id);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeartbeatData {
    pub custom_mode: u32,
    pub mavtype: u8,
    pub autopilot: u8,
    pub base_mode: u8,
    pub system_status: u8,
    pub mavlink_version: u8,
}

impl HeartbeatData {
    pub fn autopilot(&self) -> Option<MavAutopilot> {
        MavAutopilot::from_u8(self.autopilot)
    }
    pub fn vehicle_type(&self) -> Option<MavType> {
        MavType::from_u8(self.mavtype)
    }
    pub fn system_state(&self) -> Option<MavState> {
        MavState::from_u8(self.system_status)
    }
}

impl MessageData for HeartbeatData {
    const ID: u32 = 0;
    const NAME: &'static str = "HEARTBEAT";
    const EXTRA_CRC: u8 = 50;
    const ENCODED_LEN: usize = 9;
    const V1_LEN: usize = 9;

    fn ser(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], self.custom_mode);
        buf[4] = self.mavtype;
        buf[5] = self.autopilot;
        buf[6] = self.base_mode;
        buf[7] = self.system_status;
        buf[8] = self.mavlink_version;
    }

    fn deser(payload: &[u8]) -> Result<Self, ProtocolError> {
        let p = padded::<9>(payload);
        Ok(Self {
            custom_mode: LittleEndian::read_u32(&p[0..4]),
            mavtype: p[4],
            autopilot: p[5],
            base_mode: p[6],
            system_status: p[7],
            mavlink_version: p[8],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamRequestReadData {
    pub param_index: i16,
    pub target_system: u8,
    pub target_component: u8,
    pub param_id: [u8; 16],
}

impl MessageData for ParamRequestReadData {
    const ID: u32 = 20;
    const NAME: &'static str = "PARAM_REQUEST_READ";
    const EXTRA_CRC: u8 = 214;
    const ENCODED_LEN: usize = 20;
    const V1_LEN: usize = 20;

    fn ser(&self, buf: &mut [u8]) {
        LittleEndian::write_i16(&mut buf[0..2], self.param_index);
        buf[2] = self.target_system;
        buf[3] = self.target_component;
        copy_id(&mut buf[4..20], &self.param_id);
    }

    fn deser(payload: &[u8]) -> Result<Self, ProtocolError> {
        let p = padded::<20>(payload);
        let mut param_id = [0u8; 16];
        param_id.copy_from_slice(&p[4..20]);
        Ok(Self {
            param_index: LittleEndian::read_i16(&p[0..2]),
            target_system: p[2],
            target_component: p[3],
            param_id,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamRequestListData {
    pub target_system: u8,
    pub target_component: u8,
}

impl MessageData for ParamRequestListData {
    const ID: u32 = 21;
    const NAME: &'static str = "PARAM_REQUEST_LIST";
    const EXTRA_CRC: u8 = 159;
    const ENCODED_LEN: usize = 2;
    const V1_LEN: usize = 2;

    fn ser(&self, buf: &mut [u8]) {
        buf[0] = self.target_system;
        buf[1] = self.target_component;
    }

    fn deser(payload: &[u8]) -> Result<Self, ProtocolError> {
        let p = padded::<2>(payload);
        Ok(Self {
            target_system: p[0],
            target_component: p[1],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamValueData {
    pub param_value: f32,
    pub param_count: u16,
    pub param_index: u16,
    pub param_id: [u8; 16],
    pub param_type: u8,
}

impl ParamValueData {
    /// Parameter id as a string, stopping at the first NUL.
    pub fn id_str(&self) -> String {
        param_id_str(&self.param_id)
    }
}

impl MessageData for ParamValueData {
    const ID: u32 = 22;
    const NAME: &'static str = "PARAM_VALUE";
    const EXTRA_CRC: u8 = 220;
    const ENCODED_LEN: usize = 25;
    const V1_LEN: usize = 25;

    fn ser(&self, buf: &mut [u8]) {
        LittleEndian::write_f32(&mut buf[0..4], self.param_value);
        LittleEndian::write_u16(&mut buf[4..6], self.param_count);
        LittleEndian::write_u16(&mut buf[6..8], self.param_index);
        copy_id(&mut buf[8..24], &self.param_id);
        buf[24] = self.param_type;
    }

    fn deser(payload: &[u8]) -> Result<Self, ProtocolError> {
        let p = padded::<25>(payload);
        let mut param_id = [0u8; 16];
        param_id.copy_from_slice(&p[8..24]);
        Ok(Self {
            param_value: LittleEndian::read_f32(&p[0..4]),
            param_count: LittleEndian::read_u16(&p[4..6]),
            param_index: LittleEndian::read_u16(&p[6..8]),
            param_id,
            param_type: p[24],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamSetData {
    pub param_value: f32,
    pub target_system: u8,
    pub target_component: u8,
    pub param_id: [u8; 16],
    pub param_type: u8,
}

impl MessageData for ParamSetData {
    const ID: u32 = 23;
    const NAME: &'static str = "PARAM_SET";
    const EXTRA_CRC: u8 = 168;
    const ENCODED_LEN: usize = 23;
    const V1_LEN: usize = 23;

    fn ser(&self, buf: &mut [u8]) {
        LittleEndian::write_f32(&mut buf[0..4], self.param_value);
        buf[4] = self.target_system;
        buf[5] = self.target_component;
        copy_id(&mut buf[6..22], &self.param_id);
        buf[22] = self.param_type;
    }

    fn deser(payload: &[u8]) -> Result<Self, ProtocolError> {
        let p = padded::<23>(payload);
        let mut param_id = [0u8; 16];
        param_id.copy_from_slice(&p[6..22]);
        Ok(Self {
            param_value: LittleEndian::read_f32(&p[0..4]),
            target_system: p[4],
            target_component: p[5],
            param_id,
            param_type: p[22],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpsRawIntData {
    pub time_usec: u64,
    pub lat: i32,
    pub lon: i32,
    pub alt: i32,
    pub eph: u16,
    pub epv: u16,
    pub vel: u16,
    pub cog: u16,
    pub fix_type: u8,
    pub satellites_visible: u8,
}

impl MessageData for GpsRawIntData {
    const ID: u32 = 24;
    const NAME: &'static str = "GPS_RAW_INT";
    const EXTRA_CRC: u8 = 24;
    const ENCODED_LEN: usize = 30;
    const V1_LEN: usize = 30;

    fn ser(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(&mut buf[0..8], self.time_usec);
        LittleEndian::write_i32(&mut buf[8..12], self.lat);
        LittleEndian::write_i32(&mut buf[12..16], self.lon);
        LittleEndian::write_i32(&mut buf[16..20], self.alt);
        LittleEndian::write_u16(&mut buf[20..22], self.eph);
        LittleEndian::write_u16(&mut buf[22..24], self.epv);
        LittleEndian::write_u16(&mut buf[24..26], self.vel);
        LittleEndian::write_u16(&mut buf[26..28], self.cog);
        buf[28] = self.fix_type;
        buf[29] = self.satellites_visible;
    }

    fn deser(payload: &[u8]) -> Result<Self, ProtocolError> {
        let p = padded::<30>(payload);
        Ok(Self {
            time_usec: LittleEndian::read_u64(&p[0..8]),
            lat: LittleEndian::read_i32(&p[8..12]),
            lon: LittleEndian::read_i32(&p[12..16]),
            alt: LittleEndian::read_i32(&p[16..20]),
            eph: LittleEndian::read_u16(&p[20..22]),
            epv: LittleEndian::read_u16(&p[22..24]),
            vel: LittleEndian::read_u16(&p[24..26]),
            cog: LittleEndian::read_u16(&p[26..28]),
            fix_type: p[28],
            satellites_visible: p[29],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttitudeData {
    pub time_boot_ms: u32,
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
    pub rollspeed: f32,
    pub pitchspeed: f32,
    pub yawspeed: f32,
}

impl MessageData for AttitudeData {
    const ID: u32 = 30;
    const NAME: &'static str = "ATTITUDE";
    const EXTRA_CRC: u8 = 39;
    const ENCODED_LEN: usize = 28;
    const V1_LEN: usize = 28;

    fn ser(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], self.time_boot_ms);
        LittleEndian::write_f32(&mut buf[4..8], self.roll);
        LittleEndian::write_f32(&mut buf[8..12], self.pitch);
        LittleEndian::write_f32(&mut buf[12..16], self.yaw);
        LittleEndian::write_f32(&mut buf[16..20], self.rollspeed);
        LittleEndian::write_f32(&mut buf[20..24], self.pitchspeed);
        LittleEndian::write_f32(&mut buf[24..28], self.yawspeed);
    }

    fn deser(payload: &[u8]) -> Result<Self, ProtocolError> {
        let p = padded::<28>(payload);
        Ok(Self {
            time_boot_ms: LittleEndian::read_u32(&p[0..4]),
            roll: LittleEndian::read_f32(&p[4..8]),
            pitch: LittleEndian::read_f32(&p[8..12]),
            yaw: LittleEndian::read_f32(&p[12..16]),
            rollspeed: LittleEndian::read_f32(&p[16..20]),
            pitchspeed: LittleEndian::read_f32(&p[20..24]),
            yawspeed: LittleEndian::read_f32(&p[24..28]),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissionRequestListData {
    pub target_system: u8,
    pub target_component: u8,
    pub mission_type: u8,
}

impl MessageData for MissionRequestListData {
    const ID: u32 = 43;
    const NAME: &'static str = "MISSION_REQUEST_LIST";
    const EXTRA_CRC: u8 = 132;
    const ENCODED_LEN: usize = 3;
    const V1_LEN: usize = 2;

    fn ser(&self, buf: &mut [u8]) {
        buf[0] = self.target_system;
        buf[1] = self.target_component;
        buf[2] = self.mission_type;
    }

    fn deser(payload: &[u8]) -> Result<Self, ProtocolError> {
        let p = padded::<3>(payload);
        Ok(Self {
            target_system: p[0],
            target_component: p[1],
            mission_type: p[2],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissionCountData {
    pub count: u16,
    pub target_system: u8,
    pub target_component: u8,
    pub mission_type: u8,
}

impl MessageData for MissionCountData {
    const ID: u32 = 44;
    const NAME: &'static str = "MISSION_COUNT";
    const EXTRA_CRC: u8 = 221;
    const ENCODED_LEN: usize = 5;
    const V1_LEN: usize = 4;

    fn ser(&self, buf: &mut [u8]) {
        LittleEndian::write_u16(&mut buf[0..2], self.count);
        buf[2] = self.target_system;
        buf[3] = self.target_component;
        buf[4] = self.mission_type;
    }

    fn deser(payload: &[u8]) -> Result<Self, ProtocolError> {
        let p = padded::<5>(payload);
        Ok(Self {
            count: LittleEndian::read_u16(&p[0..2]),
            target_system: p[2],
            target_component: p[3],
            mission_type: p[4],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissionClearAllData {
    pub target_system: u8,
    pub target_component: u8,
    pub mission_type: u8,
}

impl MessageData for MissionClearAllData {
    const ID: u32 = 45;
    const NAME: &'static str = "MISSION_CLEAR_ALL";
    const EXTRA_CRC: u8 = 232;
    const ENCODED_LEN: usize = 3;
    const V1_LEN: usize = 2;

    fn ser(&self, buf: &mut [u8]) {
        buf[0] = self.target_system;
        buf[1] = self.target_component;
        buf[2] = self.mission_type;
    }

    fn deser(payload: &[u8]) -> Result<Self, ProtocolError> {
        let p = padded::<3>(payload);
        Ok(Self {
            target_system: p[0],
            target_component: p[1],
            mission_type: p[2],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissionAckData {
    pub target_system: u8,
    pub target_component: u8,
    pub mavtype: u8,
    pub mission_type: u8,
}

impl MissionAckData {
    pub fn result(&self) -> Option<MavMissionResult> {
        MavMissionResult::from_u8(self.mavtype)
    }
}

impl MessageData for MissionAckData {
    const ID: u32 = 47;
    const NAME: &'static str = "MISSION_ACK";
    const EXTRA_CRC: u8 = 153;
    const ENCODED_LEN: usize = 4;
    const V1_LEN: usize = 3;

    fn ser(&self, buf: &mut [u8]) {
        buf[0] = self.target_system;
        buf[1] = self.target_component;
        buf[2] = self.mavtype;
        buf[3] = self.mission_type;
    }

    fn deser(payload: &[u8]) -> Result<Self, ProtocolError> {
        let p = padded::<4>(payload);
        Ok(Self {
            target_system: p[0],
            target_component: p[1],
            mavtype: p[2],
            mission_type: p[3],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissionRequestIntData {
    pub seq: u16,
    pub target_system: u8,
    pub target_component: u8,
    pub mission_type: u8,
}

impl MessageData for MissionRequestIntData {
    const ID: u32 = 51;
    const NAME: &'static str = "MISSION_REQUEST_INT";
    const EXTRA_CRC: u8 = 196;
    const ENCODED_LEN: usize = 5;
    const V1_LEN: usize = 4;

    fn ser(&self, buf: &mut [u8]) {
        LittleEndian::write_u16(&mut buf[0..2], self.seq);
        buf[2] = self.target_system;
        buf[3] = self.target_component;
        buf[4] = self.mission_type;
    }

    fn deser(payload: &[u8]) -> Result<Self, ProtocolError> {
        let p = padded::<5>(payload);
        Ok(Self {
            seq: LittleEndian::read_u16(&p[0..2]),
            target_system: p[2],
            target_component: p[3],
            mission_type: p[4],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RcChannelsData {
    pub time_boot_ms: u32,
    pub chan_raw: [u16; 18],
    pub chancount: u8,
    pub rssi: u8,
}

impl MessageData for RcChannelsData {
    const ID: u32 = 65;
    const NAME: &'static str = "RC_CHANNELS";
    const EXTRA_CRC: u8 = 118;
    const ENCODED_LEN: usize = 42;
    const V1_LEN: usize = 42;

    fn ser(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], self.time_boot_ms);
        for (i, chan) in self.chan_raw.iter().enumerate() {
            LittleEndian::write_u16(&mut buf[4 + i * 2..6 + i * 2], *chan);
        }
        buf[40] = self.chancount;
        buf[41] = self.rssi;
    }

    fn deser(payload: &[u8]) -> Result<Self, ProtocolError> {
        let p = padded::<42>(payload);
        let mut chan_raw = [0u16; 18];
        for (i, chan) in chan_raw.iter_mut().enumerate() {
            *chan = LittleEndian::read_u16(&p[4 + i * 2..6 + i * 2]);
        }
        Ok(Self {
            time_boot_ms: LittleEndian::read_u32(&p[0..4]),
            chan_raw,
            chancount: p[40],
            rssi: p[41],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestDataStreamData {
    pub req_message_rate: u16,
    pub target_system: u8,
    pub target_component: u8,
    pub req_stream_id: u8,
    pub start_stop: u8,
}

impl MessageData for RequestDataStreamData {
    const ID: u32 = 66;
    const NAME: &'static str = "REQUEST_DATA_STREAM";
    const EXTRA_CRC: u8 = 148;
    const ENCODED_LEN: usize = 6;
    const V1_LEN: usize = 6;

    fn ser(&self, buf: &mut [u8]) {
        LittleEndian::write_u16(&mut buf[0..2], self.req_message_rate);
        buf[2] = self.target_system;
        buf[3] = self.target_component;
        buf[4] = self.req_stream_id;
        buf[5] = self.start_stop;
    }

    fn deser(payload: &[u8]) -> Result<Self, ProtocolError> {
        let p = padded::<6>(payload);
        Ok(Self {
            req_message_rate: LittleEndian::read_u16(&p[0..2]),
            target_system: p[2],
            target_component: p[3],
            req_stream_id: p[4],
            start_stop: p[5],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MissionItemIntData {
    pub param1: f32,
    pub param2: f32,
    pub param3: f32,
    pub param4: f32,
    pub x: i32,
    pub y: i32,
    pub z: f32,
    pub seq: u16,
    pub command: u16,
    pub target_system: u8,
    pub target_component: u8,
    pub frame: u8,
    pub current: u8,
    pub autocontinue: u8,
    pub mission_type: u8,
}

impl MessageData for MissionItemIntData {
    const ID: u32 = 73;
    const NAME: &'static str = "MISSION_ITEM_INT";
    const EXTRA_CRC: u8 = 38;
    const ENCODED_LEN: usize = 38;
    const V1_LEN: usize = 37;

    fn ser(&self, buf: &mut [u8]) {
        LittleEndian::write_f32(&mut buf[0..4], self.param1);
        LittleEndian::write_f32(&mut buf[4..8], self.param2);
        LittleEndian::write_f32(&mut buf[8..12], self.param3);
        LittleEndian::write_f32(&mut buf[12..16], self.param4);
        LittleEndian::write_i32(&mut buf[16..20], self.x);
        LittleEndian::write_i32(&mut buf[20..24], self.y);
        LittleEndian::write_f32(&mut buf[24..28], self.z);
        LittleEndian::write_u16(&mut buf[28..30], self.seq);
        LittleEndian::write_u16(&mut buf[30..32], self.command);
        buf[32] = self.target_system;
        buf[33] = self.target_component;
        buf[34] = self.frame;
        buf[35] = self.current;
        buf[36] = self.autocontinue;
        buf[37] = self.mission_type;
    }

    fn deser(payload: &[u8]) -> Result<Self, ProtocolError> {
        let p = padded::<38>(payload);
        Ok(Self {
            param1: LittleEndian::read_f32(&p[0..4]),
            param2: LittleEndian::read_f32(&p[4..8]),
            param3: LittleEndian::read_f32(&p[8..12]),
            param4: LittleEndian::read_f32(&p[12..16]),
            x: LittleEndian::read_i32(&p[16..20]),
            y: LittleEndian::read_i32(&p[20..24]),
            z: LittleEndian::read_f32(&p[24..28]),
            seq: LittleEndian::read_u16(&p[28..30]),
            command: LittleEndian::read_u16(&p[30..32]),
            target_system: p[32],
            target_component: p[33],
            frame: p[34],
            current: p[35],
            autocontinue: p[36],
            mission_type: p[37],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VfrHudData {
    pub airspeed: f32,
    pub groundspeed: f32,
    pub alt: f32,
    pub climb: f32,
    pub heading: i16,
    pub throttle: u16,
}

impl MessageData for VfrHudData {
    const ID: u32 = 74;
    const NAME: &'static str = "VFR_HUD";
    const EXTRA_CRC: u8 = 20;
    const ENCODED_LEN: usize = 20;
    const V1_LEN: usize = 20;

    fn ser(&self, buf: &mut [u8]) {
        LittleEndian::write_f32(&mut buf[0..4], self.airspeed);
        LittleEndian::write_f32(&mut buf[4..8], self.groundspeed);
        LittleEndian::write_f32(&mut buf[8..12], self.alt);
        LittleEndian::write_f32(&mut buf[12..16], self.climb);
        LittleEndian::write_i16(&mut buf[16..18], self.heading);
        LittleEndian::write_u16(&mut buf[18..20], self.throttle);
    }

    fn deser(payload: &[u8]) -> Result<Self, ProtocolError> {
        let p = padded::<20>(payload);
        Ok(Self {
            airspeed: LittleEndian::read_f32(&p[0..4]),
            groundspeed: LittleEndian::read_f32(&p[4..8]),
            alt: LittleEndian::read_f32(&p[8..12]),
            climb: LittleEndian::read_f32(&p[12..16]),
            heading: LittleEndian::read_i16(&p[16..18]),
            throttle: LittleEndian::read_u16(&p[18..20]),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommandLongData {
    pub param1: f32,
    pub param2: f32,
    pub param3: f32,
    pub param4: f32,
    pub param5: f32,
    pub param6: f32,
    pub param7: f32,
    pub command: u16,
    pub target_system: u8,
    pub target_component: u8,
    pub confirmation: u8,
}

impl MessageData for CommandLongData {
    const ID: u32 = 76;
    const NAME: &'static str = "COMMAND_LONG";
    const EXTRA_CRC: u8 = 152;
    const ENCODED_LEN: usize = 33;
    const V1_LEN: usize = 33;

    fn ser(&self, buf: &mut [u8]) {
        LittleEndian::write_f32(&mut buf[0..4], self.param1);
        LittleEndian::write_f32(&mut buf[4..8], self.param2);
        LittleEndian::write_f32(&mut buf[8..12], self.param3);
        LittleEndian::write_f32(&mut buf[12..16], self.param4);
        LittleEndian::write_f32(&mut buf[16..20], self.param5);
        LittleEndian::write_f32(&mut buf[20..24], self.param6);
        LittleEndian::write_f32(&mut buf[24..28], self.param7);
        LittleEndian::write_u16(&mut buf[28..30], self.command);
        buf[30] = self.target_system;
        buf[31] = self.target_component;
        buf[32] = self.confirmation;
    }

    fn deser(payload: &[u8]) -> Result<Self, ProtocolError> {
        let p = padded::<33>(payload);
        Ok(Self {
            param1: LittleEndian::read_f32(&p[0..4]),
            param2: LittleEndian::read_f32(&p[4..8]),
            param3: LittleEndian::read_f32(&p[8..12]),
            param4: LittleEndian::read_f32(&p[12..16]),
            param5: LittleEndian::read_f32(&p[16..20]),
            param6: LittleEndian::read_f32(&p[20..24]),
            param7: LittleEndian::read_f32(&p[24..28]),
            command: LittleEndian::read_u16(&p[28..30]),
            target_system: p[30],
            target_component: p[31],
            confirmation: p[32],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandAckData {
    pub command: u16,
    pub result: u8,
    pub progress: u8,
    pub result_param2: i32,
    pub target_system: u8,
    pub target_component: u8,
}

impl MessageData for CommandAckData {
    const ID: u32 = 77;
    const NAME: &'static str = "COMMAND_ACK";
    const EXTRA_CRC: u8 = 143;
    const ENCODED_LEN: usize = 10;
    const V1_LEN: usize = 3;

    fn ser(&self, buf: &mut [u8]) {
        LittleEndian::write_u16(&mut buf[0..2], self.command);
        buf[2] = self.result;
        buf[3] = self.progress;
        LittleEndian::write_i32(&mut buf[4..8], self.result_param2);
        buf[8] = self.target_system;
        buf[9] = self.target_component;
    }

    fn deser(payload: &[u8]) -> Result<Self, ProtocolError> {
        let p = padded::<10>(payload);
        Ok(Self {
            command: LittleEndian::read_u16(&p[0..2]),
            result: p[2],
            progress: p[3],
            result_param2: LittleEndian::read_i32(&p[4..8]),
            target_system: p[8],
            target_component: p[9],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryStatusData {
    pub current_consumed: i32,
    pub energy_consumed: i32,
    pub temperature: i16,
    pub voltages: [u16; 10],
    pub current_battery: i16,
    pub id: u8,
    pub battery_function: u8,
    pub battery_type: u8,
    pub battery_remaining: i8,
}

impl MessageData for BatteryStatusData {
    const ID: u32 = 147;
    const NAME: &'static str = "BATTERY_STATUS";
    const EXTRA_CRC: u8 = 154;
    const ENCODED_LEN: usize = 36;
    const V1_LEN: usize = 36;

    fn ser(&self, buf: &mut [u8]) {
        LittleEndian::write_i32(&mut buf[0..4], self.current_consumed);
        LittleEndian::write_i32(&mut buf[4..8], self.energy_consumed);
        LittleEndian::write_i16(&mut buf[8..10], self.temperature);
        for (i, v) in self.voltages.iter().enumerate() {
            LittleEndian::write_u16(&mut buf[10 + i * 2..12 + i * 2], *v);
        }
        LittleEndian::write_i16(&mut buf[30..32], self.current_battery);
        buf[32] = self.id;
        buf[33] = self.battery_function;
        buf[34] = self.battery_type;
        buf[35] = self.battery_remaining as u8;
    }

    fn deser(payload: &[u8]) -> Result<Self, ProtocolError> {
        let p = padded::<36>(payload);
        let mut voltages = [0u16; 10];
        for (i, v) in voltages.iter_mut().enumerate() {
            *v = LittleEndian::read_u16(&p[10 + i * 2..12 + i * 2]);
        }
        Ok(Self {
            current_consumed: LittleEndian::read_i32(&p[0..4]),
            energy_consumed: LittleEndian::read_i32(&p[4..8]),
            temperature: LittleEndian::read_i16(&p[8..10]),
            voltages,
            current_battery: LittleEndian::read_i16(&p[30..32]),
            id: p[32],
            battery_function: p[33],
            battery_type: p[34],
            battery_remaining: p[35] as i8,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutopilotVersionData {
    pub capabilities: u64,
    pub uid: u64,
    pub flight_sw_version: u32,
    pub middleware_sw_version: u32,
    pub os_sw_version: u32,
    pub board_version: u32,
    pub vendor_id: u16,
    pub product_id: u16,
    pub flight_custom_version: [u8; 8],
    pub middleware_custom_version: [u8; 8],
    pub os_custom_version: [u8; 8],
    pub uid2: [u8; 18],
}

impl AutopilotVersionData {
    /// The board id ArduPilot encodes in the low 16 bits of
    /// `board_version`.
    pub fn board_id(&self) -> u16 {
        (self.board_version & 0xFFFF) as u16
    }
}

impl MessageData for AutopilotVersionData {
    const ID: u32 = 148;
    const NAME: &'static str = "AUTOPILOT_VERSION";
    const EXTRA_CRC: u8 = 178;
    const ENCODED_LEN: usize = 78;
    const V1_LEN: usize = 60;

    fn ser(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(&mut buf[0..8], self.capabilities);
        LittleEndian::write_u64(&mut buf[8..16], self.uid);
        LittleEndian::write_u32(&mut buf[16..20], self.flight_sw_version);
        LittleEndian::write_u32(&mut buf[20..24], self.middleware_sw_version);
        LittleEndian::write_u32(&mut buf[24..28], self.os_sw_version);
        LittleEndian::write_u32(&mut buf[28..32], self.board_version);
        LittleEndian::write_u16(&mut buf[32..34], self.vendor_id);
        LittleEndian::write_u16(&mut buf[34..36], self.product_id);
        buf[36..44].copy_from_slice(&self.flight_custom_version);
        buf[44..52].copy_from_slice(&self.middleware_custom_version);
        buf[52..60].copy_from_slice(&self.os_custom_version);
        buf[60..78].copy_from_slice(&self.uid2);
    }

    fn deser(payload: &[u8]) -> Result<Self, ProtocolError> {
        let p = padded::<78>(payload);
        let mut flight_custom_version = [0u8; 8];
        let mut middleware_custom_version = [0u8; 8];
        let mut os_custom_version = [0u8; 8];
        let mut uid2 = [0u8; 18];
        flight_custom_version.copy_from_slice(&p[36..44]);
        middleware_custom_version.copy_from_slice(&p[44..52]);
        os_custom_version.copy_from_slice(&p[52..60]);
        uid2.copy_from_slice(&p[60..78]);
        Ok(Self {
            capabilities: LittleEndian::read_u64(&p[0..8]),
            uid: LittleEndian::read_u64(&p[8..16]),
            flight_sw_version: LittleEndian::read_u32(&p[16..20]),
            middleware_sw_version: LittleEndian::read_u32(&p[20..24]),
            os_sw_version: LittleEndian::read_u32(&p[24..28]),
            board_version: LittleEndian::read_u32(&p[28..32]),
            vendor_id: LittleEndian::read_u16(&p[32..34]),
            product_id: LittleEndian::read_u16(&p[34..36]),
            flight_custom_version,
            middleware_custom_version,
            os_custom_version,
            uid2,
        })
    }
}

/// ArduPilot-dialect request for an `AUTOPILOT_VERSION` broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutopilotVersionRequestData {
    pub target_system: u8,
    pub target_component: u8,
}

impl MessageData for AutopilotVersionRequestData {
    const ID: u32 = 183;
    const NAME: &'static str = "AUTOPILOT_VERSION_REQUEST";
    const EXTRA_CRC: u8 = 85;
    const ENCODED_LEN: usize = 2;
    const V1_LEN: usize = 2;

    fn ser(&self, buf: &mut [u8]) {
        buf[0] = self.target_system;
        buf[1] = self.target_component;
    }

    fn deser(payload: &[u8]) -> Result<Self, ProtocolError> {
        let p = padded::<2>(payload);
        Ok(Self {
            target_system: p[0],
            target_component: p[1],
        })
    }
}

/// All messages the station speaks, plus a raw fallback for ids outside
/// the set.
#[derive(Debug, Clone, PartialEq)]
pub enum MavMessage {
    Heartbeat(HeartbeatData),
    ParamRequestRead(ParamRequestReadData),
    ParamRequestList(ParamRequestListData),
    ParamValue(ParamValueData),
    ParamSet(ParamSetData),
    GpsRawInt(GpsRawIntData),
    Attitude(AttitudeData),
    MissionRequestList(MissionRequestListData),
    MissionCount(MissionCountData),
    MissionClearAll(MissionClearAllData),
    MissionAck(MissionAckData),
    MissionRequestInt(MissionRequestIntData),
    RcChannels(RcChannelsData),
    RequestDataStream(RequestDataStreamData),
    MissionItemInt(MissionItemIntData),
    VfrHud(VfrHudData),
    CommandLong(CommandLongData),
    CommandAck(CommandAckData),
    BatteryStatus(BatteryStatusData),
    AutopilotVersion(AutopilotVersionData),
    AutopilotVersionRequest(AutopilotVersionRequestData),
    /// A CRC-unverifiable message from a dialect we do not know. Still
    /// propagated so custom dialects reach subscribers.
    Unknown { msgid: u32, payload: Vec<u8> },
}

/// CRC-extra constant for a message id, `None` when the id is outside the
/// known set.
pub fn extra_crc(id: u32) -> Option<u8> {
    Some(match id {
        HeartbeatData::ID => HeartbeatData::EXTRA_CRC,
        ParamRequestReadData::ID => ParamRequestReadData::EXTRA_CRC,
        ParamRequestListData::ID => ParamRequestListData::EXTRA_CRC,
        ParamValueData::ID => ParamValueData::EXTRA_CRC,
        ParamSetData::ID => ParamSetData::EXTRA_CRC,
        GpsRawIntData::ID => GpsRawIntData::EXTRA_CRC,
        AttitudeData::ID => AttitudeData::EXTRA_CRC,
        MissionRequestListData::ID => MissionRequestListData::EXTRA_CRC,
        MissionCountData::ID => MissionCountData::EXTRA_CRC,
        MissionClearAllData::ID => MissionClearAllData::EXTRA_CRC,
        MissionAckData::ID => MissionAckData::EXTRA_CRC,
        MissionRequestIntData::ID => MissionRequestIntData::EXTRA_CRC,
        RcChannelsData::ID => RcChannelsData::EXTRA_CRC,
        RequestDataStreamData::ID => RequestDataStreamData::EXTRA_CRC,
        MissionItemIntData::ID => MissionItemIntData::EXTRA_CRC,
        VfrHudData::ID => VfrHudData::EXTRA_CRC,
        CommandLongData::ID => CommandLongData::EXTRA_CRC,
        CommandAckData::ID => CommandAckData::EXTRA_CRC,
        BatteryStatusData::ID => BatteryStatusData::EXTRA_CRC,
        AutopilotVersionData::ID => AutopilotVersionData::EXTRA_CRC,
        AutopilotVersionRequestData::ID => AutopilotVersionRequestData::EXTRA_CRC,
        _ => return None,
    })
}

macro_rules! dispatch {
    ($self:expr, $data:ident => $body:expr, $msgid:ident, $payload:ident => $unknown:expr) => {
        match $self {
            MavMessage::Heartbeat($data) => $body,
            MavMessage::ParamRequestRead($data) => $body,
            MavMessage::ParamRequestList($data) => $body,
            MavMessage::ParamValue($data) => $body,
            MavMessage::ParamSet($data) => $body,
            MavMessage::GpsRawInt($data) => $body,
            MavMessage::Attitude($data) => $body,
            MavMessage::MissionRequestList($data) => $body,
            MavMessage::MissionCount($data) => $body,
            MavMessage::MissionClearAll($data) => $body,
            MavMessage::MissionAck($data) => $body,
            MavMessage::MissionRequestInt($data) => $body,
            MavMessage::RcChannels($data) => $body,
            MavMessage::RequestDataStream($data) => $body,
            MavMessage::MissionItemInt($data) => $body,
            MavMessage::VfrHud($data) => $body,
            MavMessage::CommandLong($data) => $body,
            MavMessage::CommandAck($data) => $body,
            MavMessage::BatteryStatus($data) => $body,
            MavMessage::AutopilotVersion($data) => $body,
            MavMessage::AutopilotVersionRequest($data) => $body,
            MavMessage::Unknown {
                msgid: $msgid,
                payload: $payload,
            } => $unknown,
        }
    };
}

fn id_of<D: MessageData>(_d: &D) -> u32 {
    D::ID
}
fn name_of<D: MessageData>(_d: &D) -> &'static str {
    D::NAME
}
fn lens_of<D: MessageData>(_d: &D) -> (usize, usize) {
    (D::ENCODED_LEN, D::V1_LEN)
}

impl MavMessage {
    pub fn message_id(&self) -> u32 {
        dispatch!(self, d => id_of(d), msgid, _payload => *msgid)
    }

    pub fn message_name(&self) -> &'static str {
        dispatch!(self, d => name_of(d), _msgid, _payload => "UNKNOWN")
    }

    /// Serialize the fixed-width payload into `buf`; returns
    /// `(encoded_len, v1_len)`.
    pub fn ser(&self, buf: &mut [u8]) -> (usize, usize) {
        dispatch!(self, d => {
            d.ser(buf);
            lens_of(d)
        }, _msgid, payload => {
            let n = payload.len().min(buf.len());
            buf[..n].copy_from_slice(&payload[..n]);
            (n, n)
        })
    }

    /// Parse a payload. Ids outside the set come back as
    /// [`MavMessage::Unknown`].
    pub fn parse(msgid: u32, payload: &[u8]) -> Self {
        let parsed: Result<Self, ProtocolError> = match msgid {
            HeartbeatData::ID => HeartbeatData::deser(payload).map(Self::Heartbeat),
            ParamRequestReadData::ID => {
                ParamRequestReadData::deser(payload).map(Self::ParamRequestRead)
            }
            ParamRequestListData::ID => {
                ParamRequestListData::deser(payload).map(Self::ParamRequestList)
            }
            ParamValueData::ID => ParamValueData::deser(payload).map(Self::ParamValue),
            ParamSetData::ID => ParamSetData::deser(payload).map(Self::ParamSet),
            GpsRawIntData::ID => GpsRawIntData::deser(payload).map(Self::GpsRawInt),
            AttitudeData::ID => AttitudeData::deser(payload).map(Self::Attitude),
            MissionRequestListData::ID => {
                MissionRequestListData::deser(payload).map(Self::MissionRequestList)
            }
            MissionCountData::ID => MissionCountData::deser(payload).map(Self::MissionCount),
            MissionClearAllData::ID => {
                MissionClearAllData::deser(payload).map(Self::MissionClearAll)
            }
            MissionAckData::ID => MissionAckData::deser(payload).map(Self::MissionAck),
            MissionRequestIntData::ID => {
                MissionRequestIntData::deser(payload).map(Self::MissionRequestInt)
            }
            RcChannelsData::ID => RcChannelsData::deser(payload).map(Self::RcChannels),
            RequestDataStreamData::ID => {
                RequestDataStreamData::deser(payload).map(Self::RequestDataStream)
            }
            MissionItemIntData::ID => {
                MissionItemIntData::deser(payload).map(Self::MissionItemInt)
            }
            VfrHudData::ID => VfrHudData::deser(payload).map(Self::VfrHud),
            CommandLongData::ID => CommandLongData::deser(payload).map(Self::CommandLong),
            CommandAckData::ID => CommandAckData::deser(payload).map(Self::CommandAck),
            BatteryStatusData::ID => BatteryStatusData::deser(payload).map(Self::BatteryStatus),
            AutopilotVersionData::ID => {
                AutopilotVersionData::deser(payload).map(Self::AutopilotVersion)
            }
            AutopilotVersionRequestData::ID => {
                AutopilotVersionRequestData::deser(payload).map(Self::AutopilotVersionRequest)
            }
            _ => Err(ProtocolError::UnknownMessage { id: msgid }),
        };
        parsed.unwrap_or_else(|_| Self::Unknown {
            msgid,
            payload: payload.to_vec(),
        })
    }
}

/// Render a null-terminated 16-byte parameter id as a string.
pub fn param_id_str(id: &[u8; 16]) -> String {
    let end = id.iter().position(|&b| b == 0).unwrap_or(16);
    String::from_utf8_lossy(&id[..end]).into_owned()
}

/// Pack a string into a null-terminated 16-byte parameter id.
pub fn param_id_bytes(id: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    let bytes = id.as_bytes();
    let n = bytes.len().min(16);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_roundtrip() {
        let hb = HeartbeatData {
            custom_mode: 5,
            mavtype: MavType::Quadrotor as u8,
            autopilot: MavAutopilot::ArduPilotMega as u8,
            base_mode: MavModeFlag::SAFETY_ARMED.bits(),
            system_status: MavState::Active as u8,
            mavlink_version: 3,
        };
        let mut buf = [0u8; HeartbeatData::ENCODED_LEN];
        hb.ser(&mut buf);
        assert_eq!(HeartbeatData::deser(&buf).unwrap(), hb);
        assert_eq!(hb.autopilot(), Some(MavAutopilot::ArduPilotMega));
    }

    #[test]
    fn param_value_truncated_payload_pads_with_zeros() {
        let pv = ParamValueData {
            param_value: 1.5,
            param_count: 10,
            param_index: 3,
            param_id: param_id_bytes("RATE_RLL_P"),
            param_type: param_type::REAL32,
        };
        let mut buf = [0u8; ParamValueData::ENCODED_LEN];
        pv.ser(&mut buf);
        let truncated_len = crate::mavlink::remove_trailing_zeroes(&buf);
        let back = ParamValueData::deser(&buf[..truncated_len]).unwrap();
        assert_eq!(back, pv);
        assert_eq!(back.id_str(), "RATE_RLL_P");
    }

    #[test]
    fn autopilot_version_board_id() {
        let data = AutopilotVersionData {
            capabilities: 0,
            uid: 0,
            flight_sw_version: 0x0405_0100,
            middleware_sw_version: 0,
            os_sw_version: 0,
            board_version: 0x0010_16,
            vendor_id: 0,
            product_id: 0,
            flight_custom_version: [0; 8],
            middleware_custom_version: [0; 8],
            os_custom_version: [0; 8],
            uid2: [0; 18],
        };
        assert_eq!(data.board_id(), 0x1016);
    }

    #[test]
    fn unknown_id_parses_to_raw() {
        let msg = MavMessage::parse(60999, &[1, 2, 3]);
        assert_eq!(
            msg,
            MavMessage::Unknown {
                msgid: 60999,
                payload: vec![1, 2, 3]
            }
        );
        assert_eq!(extra_crc(60999), None);
    }
}

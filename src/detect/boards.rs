//! Static board knowledge: USB VID/PID hints, ArduPilot board ids,
//! MSP manufacturer ids, and the cross-firmware target mapping.

use super::Flasher;

/// A VID/PID row of the known-board table. The hint seeds detection; the
/// wire protocols have the final say.
#[derive(Debug, Clone, Copy)]
pub struct BoardHint {
    pub vid: u16,
    pub pid: u16,
    pub name: &'static str,
    pub flasher: Flasher,
    /// The device enumerated in bootloader/DFU mode.
    pub in_bootloader: bool,
}

/// Known `vid:pid` pairs. USB-serial bridge chips get `Flasher::Serial`
/// because the MCU behind them cannot be rebooted into its ROM over USB
/// alone.
pub const BOARD_HINTS: &[BoardHint] = &[
    BoardHint { vid: 0x0483, pid: 0x5740, name: "STM32 Virtual COM Port", flasher: Flasher::Dfu, in_bootloader: false },
    BoardHint { vid: 0x0483, pid: 0xDF11, name: "STM32 DFU bootloader", flasher: Flasher::Dfu, in_bootloader: true },
    BoardHint { vid: 0x2DAE, pid: 0x1011, name: "CubeBlack", flasher: Flasher::Ardupilot, in_bootloader: false },
    BoardHint { vid: 0x2DAE, pid: 0x1016, name: "CubeOrange", flasher: Flasher::Ardupilot, in_bootloader: false },
    BoardHint { vid: 0x2DAE, pid: 0x1001, name: "CubeBlack bootloader", flasher: Flasher::Ardupilot, in_bootloader: true },
    BoardHint { vid: 0x1209, pid: 0x5740, name: "ArduPilot FMU", flasher: Flasher::Ardupilot, in_bootloader: false },
    BoardHint { vid: 0x1209, pid: 0x5741, name: "ArduPilot FMU bootloader", flasher: Flasher::Ardupilot, in_bootloader: true },
    BoardHint { vid: 0x26AC, pid: 0x0011, name: "PX4 FMU", flasher: Flasher::Ardupilot, in_bootloader: false },
    BoardHint { vid: 0x0403, pid: 0x6001, name: "FTDI USB-serial bridge", flasher: Flasher::Serial, in_bootloader: false },
    BoardHint { vid: 0x0403, pid: 0x6015, name: "FTDI USB-serial bridge", flasher: Flasher::Serial, in_bootloader: false },
    BoardHint { vid: 0x10C4, pid: 0xEA60, name: "CP210x USB-serial bridge", flasher: Flasher::Serial, in_bootloader: false },
    BoardHint { vid: 0x1A86, pid: 0x7523, name: "CH340 USB-serial bridge", flasher: Flasher::Serial, in_bootloader: false },
    BoardHint { vid: 0x2341, pid: 0x0043, name: "Arduino Uno", flasher: Flasher::Avrdude, in_bootloader: false },
    BoardHint { vid: 0x2341, pid: 0x0010, name: "Arduino Mega 2560", flasher: Flasher::Avrdude, in_bootloader: false },
];

pub fn hint_for(vid: u16, pid: u16) -> Option<&'static BoardHint> {
    BOARD_HINTS.iter().find(|h| h.vid == vid && h.pid == pid)
}

/// ArduPilot `board_id` (the low 16 bits of `AUTOPILOT_VERSION.board_version`)
/// to board name.
pub const ARDUPILOT_BOARD_IDS: &[(u16, &str)] = &[
    (9, "Pixhawk1"),
    (50, "PixhawkMini"),
    (125, "MatekF405-Wing"),
    (127, "MatekF765-Wing"),
    (139, "Durandal"),
    (140, "CubeOrange"),
    (1013, "MatekH743"),
    (1016, "MatekH743-Slim"),
    (0x1016, "SPRacingH7Extreme"),
];

pub fn ardupilot_board_name(board_id: u16) -> Option<&'static str> {
    ARDUPILOT_BOARD_IDS
        .iter()
        .find(|(id, _)| *id == board_id)
        .map(|(_, name)| *name)
}

/// 4-character MSP manufacturer ids to vendor names, as registered in the
/// Betaflight target tree.
pub const MSP_MANUFACTURERS: &[(&str, &str)] = &[
    ("SPBE", "SPEEDYBEE"),
    ("MTKS", "MATEK"),
    ("HBRO", "HOLYBRO"),
    ("DIAT", "DIATONE"),
    ("FOXE", "FOXEER"),
    ("IFRC", "IFLIGHT"),
    ("GEPR", "GEPRC"),
    ("HGLR", "HGLRC"),
    ("AIKO", "AIKON"),
    ("SPRO", "SERIOUSLYPRO"),
];

pub fn manufacturer_name(id: &str) -> Option<&'static str> {
    MSP_MANUFACTURERS
        .iter()
        .find(|(mfr, _)| *mfr == id)
        .map(|(_, name)| *name)
}

/// Betaflight target name to the probable iNav target, for cross-firmware
/// flashes. Absence means the shell gets an `UnmatchedBoardWarning`.
pub const BETAFLIGHT_TO_INAV: &[(&str, &str)] = &[
    ("MATEKF405", "MATEKF405"),
    ("MATEKF405SE", "MATEKF405SE"),
    ("MATEKF722", "MATEKF722"),
    ("MATEKF722SE", "MATEKF722SE"),
    ("MATEKH743", "MATEKH743"),
    ("OMNIBUSF4", "OMNIBUSF4"),
    ("OMNIBUSF4SD", "OMNIBUSF4PRO"),
    ("SPEEDYBEEF405V3", "SPEEDYBEEF405V3"),
    ("SPEEDYBEEF7", "SPEEDYBEEF7"),
    ("KAKUTEF7", "KAKUTEF7"),
    ("KAKUTEH7", "KAKUTEH7"),
    ("MAMBAF405US", "MAMBAF405US"),
    ("MAMBAF722", "MAMBAF722"),
    ("FLYWOOF745", "FLYWOOF745"),
];

pub fn inav_target_for(betaflight_target: &str) -> Option<&'static str> {
    BETAFLIGHT_TO_INAV
        .iter()
        .find(|(bf, _)| *bf == betaflight_target)
        .map(|(_, inav)| *inav)
}

/// F3-class boards modern Betaflight/iNav dropped. For the allow-list a
/// legacy iNav version bound is returned; everything else is flagged
/// unsupported outright.
pub const F3_LEGACY_INAV: &[(&str, &str)] = &[
    ("FRSKYF3", "2.6.1"),
    ("AIRHEROF3", "2.6.1"),
    ("SPRACINGF3", "2.6.1"),
];

/// `Some(version)` — flashable with legacy iNav up to `version`;
/// `None` for an F3 target with no supported firmware at all.
pub fn legacy_inav_bound(target: &str) -> Option<&'static str> {
    F3_LEGACY_INAV
        .iter()
        .find(|(t, _)| *t == target)
        .map(|(_, v)| *v)
}

/// Heuristic: targets ending in `F3` are the dropped generation.
pub fn is_f3_target(target: &str) -> bool {
    target.ends_with("F3") || target.contains("F3_") || legacy_inav_bound(target).is_some()
}

//! Decoders for the notification frames sent by the B2500.
//!
//! Each decoder receives the complete notification frame (header included) and
//! produces a typed record or a [`proto::Error::DecodeFailure`]. Byte offsets in
//! this module are frame offsets. Decoders never panic on malformed input.
//!
//! The cell voltage response comes in two encodings depending on the firmware:
//! an underscore separated text body and a fixed binary layout. They are tried
//! in order, see [`CELL_DECODE_ATTEMPTS`].

use crate::protocol::{self as proto, Opcode};
use chrono::{DateTime, Local};
use std::borrow::Cow;
use std::fmt;

#[cfg(feature = "serde")]
use serde::Serialize;

#[cfg(feature = "serde")]
mod util {
    use serde::{ser::SerializeSeq, Serializer};

    pub fn f32_1_digits<S>(x: &f32, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_f64((*x as f64 * 10.0).round() / 10.0)
    }

    pub fn f32_3_digits<S>(x: &f32, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_f64((*x as f64 * 1000.0).round() / 1000.0)
    }

    pub fn vec_f32_3_digits<S>(vec: &[f32], s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = s.serialize_seq(Some(vec.len()))?;
        for e in vec {
            let val = (*e as f64 * 1000.0).round() / 1000.0;
            seq.serialize_element(&val)?;
        }
        seq.end()
    }

    pub fn display<T, S>(x: &T, s: S) -> Result<S::Ok, S::Error>
    where
        T: std::fmt::Display,
        S: Serializer,
    {
        s.collect_str(x)
    }
}

fn u16_le(frame: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([frame[offset], frame[offset + 1]])
}

fn validate_len(opcode: Opcode, frame: &[u8], expected_size: usize) -> Result<(), proto::Error> {
    if frame.len() < expected_size {
        log::warn!(
            "{opcode} response too short - required={} received={}",
            expected_size,
            frame.len()
        );
        return Err(proto::Error::decode(
            opcode,
            format!("{} bytes, at least {expected_size} required", frame.len()),
        ));
    }
    Ok(())
}

/// Strips whitespace, control characters and replacement characters left over
/// from lossy UTF-8 conversion.
fn clean_field(field: &str) -> &str {
    field.trim_matches(|c: char| c.is_whitespace() || c.is_control() || c == '\u{FFFD}')
}

/// Returns the payload of a text response as a string.
///
/// A frame whose bytes XOR to zero ends in a checksum, which is not part of the
/// text.
fn text_payload(frame: &[u8]) -> Cow<'_, str> {
    let payload = proto::payload(frame);
    let text = match payload.split_last() {
        Some((_, text)) if proto::checksum(frame) == 0 => text,
        _ => payload,
    };
    String::from_utf8_lossy(text)
}

/// Returns the body of a text response such as the SSID or the network
/// module version.
pub fn text_body(frame: &[u8]) -> String {
    clean_field(&text_payload(frame)).to_string()
}

/// A decoded notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    DeviceInfo(DeviceInfo),
    Runtime(RuntimeSnapshot),
    Cells(CellPack),
    Timers(TimerSchedule),
}

impl Response {
    /// Decodes `frame` with the decoder registered for `opcode`.
    ///
    /// Returns `None` if there is no decoder for the opcode.
    pub fn decode(opcode: u8, frame: &[u8]) -> Option<Result<Self, proto::Error>> {
        let decoded = match Opcode::try_from(opcode).ok()? {
            Opcode::DeviceInfo => DeviceInfo::decode(frame).map(Response::DeviceInfo),
            Opcode::RuntimeInfo => RuntimeSnapshot::decode(frame).map(Response::Runtime),
            Opcode::CellVoltages => CellPack::decode(frame).map(Response::Cells),
            Opcode::GetTimers => TimerSchedule::decode(frame).map(Response::Timers),
            _ => return None,
        };
        Some(decoded)
    }
}

/// Identification of the device.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct DeviceInfo {
    #[cfg_attr(feature = "serde", serde(rename = "type"))]
    pub device_type: String,
    pub id: String,
    pub mac: String,
    /// Firmware version, `"Unknown"` for devices that do not report one.
    pub firmware: String,
}

impl DeviceInfo {
    pub const UNKNOWN_FIRMWARE: &'static str = "Unknown";

    /// Decodes the `type=...,id=...,mac=...[,version=...]` text body.
    pub fn decode(frame: &[u8]) -> Result<Self, proto::Error> {
        let text = text_payload(frame);
        let field = |marker: &str| -> Option<String> {
            let start = text.find(marker)? + marker.len();
            let rest = &text[start..];
            let end = rest.find(',').unwrap_or(rest.len());
            Some(clean_field(&rest[..end]).to_string())
        };
        let missing = |marker: &str| proto::Error::decode(Opcode::DeviceInfo, format!("no '{marker}' field"));

        let device_type = field("type=").ok_or_else(|| missing("type="))?;
        let id = field("id=").ok_or_else(|| missing("id="))?;
        let mac = field("mac=").ok_or_else(|| missing("mac="))?;
        let firmware = field("version=")
            .filter(|version| !version.is_empty())
            .unwrap_or_else(|| Self::UNKNOWN_FIRMWARE.to_string());

        Ok(Self {
            device_type,
            id,
            mac,
            firmware,
        })
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Type={}, ID={}, MAC={}, Firmware={}",
            self.device_type, self.id, self.mac, self.firmware
        )
    }
}

/// State of one photovoltaic input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct PvChannel {
    pub active: bool,
    pub transparent: bool,
    /// Input power in W.
    pub power: u16,
}

impl PvChannel {
    fn decode(state: u8, power: u16) -> Self {
        Self {
            active: state > 0,
            transparent: state == 2,
            power,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct Battery {
    /// State of charge in %.
    #[cfg_attr(feature = "serde", serde(serialize_with = "util::f32_1_digits"))]
    pub percent: f32,
    pub capacity_wh: u16,
    pub depth_of_discharge: u8,
    pub temperature1: u8,
    pub temperature2: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct OutputChannel {
    pub active: bool,
    /// Output power in W.
    pub power: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct Settings {
    pub load_first: bool,
    pub output_mode: u8,
    pub discharge_threshold: u16,
    pub scene_mode: u8,
    pub region: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct Status {
    pub firmware: u8,
    pub wifi: bool,
    pub mqtt: bool,
    pub external_battery1: bool,
    pub external_battery2: bool,
}

/// Runtime values reported by the `RuntimeInfo` command.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct RuntimeSnapshot {
    pub timestamp: DateTime<Local>,
    pub pv1: PvChannel,
    pub pv2: PvChannel,
    pub battery: Battery,
    pub output1: OutputChannel,
    pub output2: OutputChannel,
    pub settings: Settings,
    pub status: Status,
}

impl RuntimeSnapshot {
    pub const MIN_FRAME_LENGTH: usize = 36;

    pub fn decode(frame: &[u8]) -> Result<Self, proto::Error> {
        validate_len(Opcode::RuntimeInfo, frame, Self::MIN_FRAME_LENGTH)?;
        let wifi_mqtt = frame[15];
        Ok(Self {
            timestamp: Local::now(),
            pv1: PvChannel::decode(frame[4], u16_le(frame, 6)),
            pv2: PvChannel::decode(frame[5], u16_le(frame, 8)),
            battery: Battery {
                percent: u16_le(frame, 10) as f32 / 10.0,
                capacity_wh: u16_le(frame, 22),
                depth_of_discharge: frame[18],
                temperature1: frame[33],
                temperature2: frame[35],
            },
            output1: OutputChannel {
                active: frame[16] == 0x01,
                power: u16_le(frame, 24),
            },
            output2: OutputChannel {
                active: frame[17] == 0x01,
                power: u16_le(frame, 26),
            },
            settings: Settings {
                load_first: frame[13] == 0x01,
                output_mode: frame[14],
                discharge_threshold: u16_le(frame, 19),
                scene_mode: frame[21],
                region: frame[30],
            },
            status: Status {
                firmware: frame[12],
                wifi: wifi_mqtt == 1 || wifi_mqtt == 3,
                mqtt: wifi_mqtt == 2 || wifi_mqtt == 3,
                external_battery1: frame[28] == 0x01,
                external_battery2: frame[29] == 0x01,
            },
        })
    }
}

impl fmt::Display for RuntimeSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PV1={}W, PV2={}W, Battery={:.1}%, Output1={}W, Output2={}W",
            self.pv1.power,
            self.pv2.power,
            self.battery.percent,
            self.output1.power,
            self.output2.power
        )
    }
}

/// Which encoding a [`CellPack`] was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum CellEncoding {
    Text,
    Binary,
}

impl fmt::Display for CellEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellEncoding::Text => write!(f, "text"),
            CellEncoding::Binary => write!(f, "binary"),
        }
    }
}

/// Summary values over the decoded cell voltages.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct CellSummary {
    #[cfg_attr(feature = "serde", serde(serialize_with = "util::f32_3_digits"))]
    pub min: f32,
    #[cfg_attr(feature = "serde", serde(serialize_with = "util::f32_3_digits"))]
    pub max: f32,
    #[cfg_attr(feature = "serde", serde(serialize_with = "util::f32_3_digits"))]
    pub average: f32,
    /// `max - min`
    #[cfg_attr(feature = "serde", serde(serialize_with = "util::f32_3_digits"))]
    pub spread: f32,
    #[cfg_attr(feature = "serde", serde(serialize_with = "util::f32_3_digits"))]
    pub sum: f32,
    pub count: usize,
}

impl CellSummary {
    /// Returns `None` for an empty slice.
    pub fn from_cells(cells: &[f32]) -> Option<Self> {
        if cells.is_empty() {
            return None;
        }
        let min = cells.iter().copied().fold(f32::INFINITY, f32::min);
        let max = cells.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let sum: f32 = cells.iter().sum();
        Some(Self {
            min,
            max,
            average: sum / cells.len() as f32,
            spread: max - min,
            sum,
            count: cells.len(),
        })
    }
}

/// Battery pack state reported by the `CellVoltages` command.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct CellPack {
    pub timestamp: DateTime<Local>,
    /// State of charge in %.
    pub soc: u8,
    pub temperature1: i16,
    pub temperature2: i16,
    /// Cell voltages in V, in cell order.
    #[cfg_attr(feature = "serde", serde(serialize_with = "util::vec_f32_3_digits"))]
    pub cells: Vec<f32>,
    pub summary: CellSummary,
    pub encoding: CellEncoding,
}

/// A single cell decode strategy, returning the reason it did not apply.
pub type CellDecodeAttempt = fn(&[u8]) -> Result<CellPack, String>;

/// Cell decode strategies in the order they are tried.
///
/// The text encoding is used by most firmware revisions and is tried first.
pub const CELL_DECODE_ATTEMPTS: [(CellEncoding, CellDecodeAttempt); 2] = [
    (CellEncoding::Text, CellPack::decode_text),
    (CellEncoding::Binary, CellPack::decode_binary),
];

impl CellPack {
    pub const MAX_CELLS: usize = 14;
    /// SOC, two temperatures and 14 cells.
    pub const TEXT_FIELD_COUNT: usize = 3 + Self::MAX_CELLS;
    const BINARY_CELLS_START: usize = 7;
    const BINARY_CELLS_END: usize = Self::BINARY_CELLS_START + 2 * Self::MAX_CELLS;

    /// Decodes a cell voltage frame, trying every entry of [`CELL_DECODE_ATTEMPTS`].
    pub fn decode(frame: &[u8]) -> Result<Self, proto::Error> {
        let mut reasons = Vec::with_capacity(CELL_DECODE_ATTEMPTS.len());
        for (encoding, attempt) in CELL_DECODE_ATTEMPTS {
            match attempt(frame) {
                Ok(pack) => return Ok(pack),
                Err(reason) => {
                    log::debug!("Cell data is not {encoding} encoded: {reason}");
                    reasons.push(format!("{encoding}: {reason}"));
                }
            }
        }
        log::debug!("Raw cell data: {}", hex::encode(frame));
        Err(proto::Error::decode(Opcode::CellVoltages, reasons.join("; ")))
    }

    /// Decodes the `SOC_TEMP1_TEMP2_CELL1_..._CELL14` text body, cells in mV.
    ///
    /// Additional fields are ignored. An empty or non numeric cell field is
    /// skipped, the remaining cells are still used.
    pub fn decode_text(frame: &[u8]) -> Result<Self, String> {
        let text = text_payload(frame);
        let fields: Vec<&str> = text.split('_').map(clean_field).collect();
        if fields.len() < Self::TEXT_FIELD_COUNT {
            return Err(format!(
                "{} fields, at least {} required",
                fields.len(),
                Self::TEXT_FIELD_COUNT
            ));
        }

        let soc = fields[0]
            .parse::<u8>()
            .map_err(|e| format!("SOC '{}': {e}", fields[0]))?;
        let temperature1 = fields[1]
            .parse::<i16>()
            .map_err(|e| format!("temperature 1 '{}': {e}", fields[1]))?;
        let temperature2 = fields[2]
            .parse::<i16>()
            .map_err(|e| format!("temperature 2 '{}': {e}", fields[2]))?;

        let cells = fields[3..Self::TEXT_FIELD_COUNT]
            .iter()
            .enumerate()
            .filter_map(|(index, field)| match field.parse::<f32>() {
                Ok(millivolts) if millivolts.is_finite() => Some(millivolts / 1000.0),
                _ => {
                    log::debug!("Skipping cell {}: '{field}'", index + 1);
                    None
                }
            })
            .collect();

        Self::from_parts(soc, temperature1, temperature2, cells, CellEncoding::Text)
    }

    /// Decodes the binary layout: SOC at 4, temperatures at 5 and 6, then up to
    /// 14 little-endian cell voltages in mV starting at 7.
    pub fn decode_binary(frame: &[u8]) -> Result<Self, String> {
        if frame.len() < Self::BINARY_CELLS_START {
            return Err(format!(
                "{} bytes, at least {} required",
                frame.len(),
                Self::BINARY_CELLS_START
            ));
        }
        let end = Self::BINARY_CELLS_END.min(frame.len());
        let cells = (Self::BINARY_CELLS_START..end)
            .step_by(2)
            .filter(|offset| offset + 1 < frame.len())
            .map(|offset| u16_le(frame, offset) as f32 / 1000.0)
            .collect();

        Self::from_parts(
            frame[4],
            i16::from(frame[5]),
            i16::from(frame[6]),
            cells,
            CellEncoding::Binary,
        )
    }

    fn from_parts(
        soc: u8,
        temperature1: i16,
        temperature2: i16,
        cells: Vec<f32>,
        encoding: CellEncoding,
    ) -> Result<Self, String> {
        let summary = CellSummary::from_cells(&cells).ok_or("no cell voltages")?;
        Ok(Self {
            timestamp: Local::now(),
            soc,
            temperature1,
            temperature2,
            cells,
            summary,
            encoding,
        })
    }
}

impl fmt::Display for CellPack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SOC={}%, Min={:.3}V, Max={:.3}V, Diff={:.3}V, Temps={}°C/{}°C",
            self.soc,
            self.summary.min,
            self.summary.max,
            self.summary.spread,
            self.temperature1,
            self.temperature2
        )
    }
}

/// Time of day used by the timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ClockTime {
    pub hour: u8,
    pub minute: u8,
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// One output timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct Timer {
    pub enabled: bool,
    #[cfg_attr(feature = "serde", serde(serialize_with = "util::display"))]
    pub start: ClockTime,
    #[cfg_attr(feature = "serde", serde(serialize_with = "util::display"))]
    pub end: ClockTime,
    /// Output power in W.
    pub power: u16,
}

impl Timer {
    const LENGTH: usize = 7;

    fn decode(block: &[u8]) -> Self {
        Self {
            enabled: block[0] == 1,
            start: ClockTime {
                hour: block[1],
                minute: block[2],
            },
            end: ClockTime {
                hour: block[3],
                minute: block[4],
            },
            power: u16_le(block, 5),
        }
    }
}

impl fmt::Display for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.enabled { "on" } else { "off" };
        write!(f, "{}-{} {}W ({state})", self.start, self.end, self.power)
    }
}

/// Settings of the adaptive (meter driven) output mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct AdaptiveSettings {
    pub enabled: bool,
    pub power: u16,
    pub meter: u16,
    pub time: u16,
}

/// Timer configuration reported by the `GetTimers` command.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct TimerSchedule {
    pub timestamp: DateTime<Local>,
    pub timers: [Timer; 3],
    pub adaptive: AdaptiveSettings,
    /// Timers 4 and 5, only reported by newer firmware.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub extension: Option<[Timer; 2]>,
}

impl TimerSchedule {
    pub const MIN_FRAME_LENGTH: usize = 33;
    pub const EXTENDED_FRAME_LENGTH: usize = 57;
    const TIMER_OFFSETS: [usize; 3] = [5, 12, 19];
    const EXTENSION_OFFSETS: [usize; 2] = [43, 50];
    const ADAPTIVE_OFFSET: usize = 26;

    pub fn decode(frame: &[u8]) -> Result<Self, proto::Error> {
        validate_len(Opcode::GetTimers, frame, Self::MIN_FRAME_LENGTH)?;
        let timer_at = |offset: usize| Timer::decode(&frame[offset..offset + Timer::LENGTH]);
        let adaptive = &frame[Self::ADAPTIVE_OFFSET..];

        Ok(Self {
            timestamp: Local::now(),
            timers: Self::TIMER_OFFSETS.map(timer_at),
            adaptive: AdaptiveSettings {
                enabled: adaptive[0] == 1,
                power: u16_le(adaptive, 1),
                meter: u16_le(adaptive, 3),
                time: u16_le(adaptive, 5),
            },
            extension: (frame.len() >= Self::EXTENDED_FRAME_LENGTH)
                .then(|| Self::EXTENSION_OFFSETS.map(timer_at)),
        })
    }

    /// All timers in order, including the extension timers when present.
    pub fn iter(&self) -> impl Iterator<Item = &Timer> {
        self.timers.iter().chain(self.extension.iter().flatten())
    }
}

impl fmt::Display for TimerSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, timer) in self.iter().enumerate() {
            write!(f, "Timer{}={}, ", index + 1, timer.enabled)?;
        }
        write!(f, "Adaptive={}", self.adaptive.enabled)
    }
}

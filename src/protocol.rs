//! # Marstek B2500 Protocol Implementation
//!
//! This module provides the low-level framing of the B2500 BLE protocol and the
//! strongly-typed parameters accepted by its setter commands.
//!
//! Every command written to the device has the layout
//!
//! | Offset | Field    | Notes                              |
//! |--------|----------|------------------------------------|
//! | 0      | `0x73`   | fixed prefix                       |
//! | 1      | length   | total frame length incl. checksum  |
//! | 2      | `0x23`   | fixed prefix                       |
//! | 3      | opcode   | command/response code              |
//! | 4..N   | payload  | opcode specific                    |
//! | N+1    | checksum | XOR of all preceding bytes         |
//!
//! Notifications sent back by the device carry the responding opcode at the same
//! offset. Decoding of the notification payloads lives in [`crate::response`].

use std::fmt;

/// Fixed first byte of every frame.
pub const FRAME_PREFIX: u8 = 0x73;
/// Fixed third byte of every frame.
pub const FRAME_MARKER: u8 = 0x23;
/// Number of bytes preceding the payload.
pub const HEADER_LENGTH: usize = 4;
/// Offset of the opcode inside a frame.
pub const OPCODE_OFFSET: usize = 3;
/// Payload used by commands that take no argument.
pub const DEFAULT_PAYLOAD: &[u8] = &[0x01];

/// Errors of the protocol layer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// The frame is too short to carry an opcode.
    #[error("Malformed frame of {0} bytes, at least {HEADER_LENGTH} required")]
    MalformedFrame(usize),

    /// The payload does not match any known layout for its opcode.
    #[error("Cannot decode response 0x{opcode:02X}: {reason}")]
    DecodeFailure { opcode: u8, reason: String },

    /// A setter was called with a value the device does not accept.
    #[error("Invalid {parameter}: {value} (allowed: {allowed})")]
    InvalidParameter {
        parameter: &'static str,
        value: u8,
        allowed: &'static str,
    },
}

impl Error {
    pub(crate) fn decode(opcode: Opcode, reason: impl Into<String>) -> Self {
        Error::DecodeFailure {
            opcode: opcode as u8,
            reason: reason.into(),
        }
    }
}

/// Command and response codes understood by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    SetRegion = 0x02,
    RuntimeInfo = 0x03,
    DeviceInfo = 0x04,
    SetWifi = 0x05,
    GetSsid = 0x09,
    SetDepthOfDischarge = 0x0B,
    CellVoltages = 0x0F,
    EnableAdaptive = 0x11,
    SetTimers = 0x12,
    GetTimers = 0x13,
    GetFc41dVersion = 0x23,
    Reboot = 0x25,
    FactoryReset = 0x26,
}

impl Opcode {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x02 => Opcode::SetRegion,
            0x03 => Opcode::RuntimeInfo,
            0x04 => Opcode::DeviceInfo,
            0x05 => Opcode::SetWifi,
            0x09 => Opcode::GetSsid,
            0x0B => Opcode::SetDepthOfDischarge,
            0x0F => Opcode::CellVoltages,
            0x11 => Opcode::EnableAdaptive,
            0x12 => Opcode::SetTimers,
            0x13 => Opcode::GetTimers,
            0x23 => Opcode::GetFc41dVersion,
            0x25 => Opcode::Reboot,
            0x26 => Opcode::FactoryReset,
            other => return Err(other),
        })
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:02X})", self, *self as u8)
    }
}

/// Calculates the XOR checksum over all given bytes.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Builds a command frame for `opcode` carrying `payload`.
///
/// The length byte is set to the frame length including the trailing checksum,
/// and the checksum is the XOR of every byte preceding it. Consequently the XOR
/// over the complete returned frame is always zero.
///
/// ```
/// use b2500_lib::protocol::encode;
///
/// assert_eq!(encode(0x04, &[0x01]), [0x73, 0x06, 0x23, 0x04, 0x01, 0x53]);
/// ```
pub fn encode(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LENGTH + payload.len() + 1);
    frame.extend_from_slice(&[FRAME_PREFIX, 0x00, FRAME_MARKER, opcode]);
    frame.extend_from_slice(payload);
    // The length byte wraps for payloads longer than the device ever accepts.
    frame[1] = (frame.len() + 1) as u8;
    frame.push(checksum(&frame));
    frame
}

/// Returns the opcode carried by a received frame.
pub fn extract_opcode(frame: &[u8]) -> Result<u8, Error> {
    if frame.len() < HEADER_LENGTH {
        return Err(Error::MalformedFrame(frame.len()));
    }
    Ok(frame[OPCODE_OFFSET])
}

/// Returns the bytes following the 4-byte header.
pub fn payload(frame: &[u8]) -> &[u8] {
    frame.get(HEADER_LENGTH..).unwrap_or_default()
}

/// Depth of discharge limit in percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthOfDischarge(u8);

impl DepthOfDischarge {
    pub const MIN: u8 = 10;
    pub const MAX: u8 = 100;

    pub fn encode(&self) -> [u8; 1] {
        [self.0]
    }
}

impl TryFrom<u8> for DepthOfDischarge {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(Error::InvalidParameter {
                parameter: "depth of discharge",
                value,
                allowed: "10..=100",
            })
        }
    }
}

impl std::ops::Deref for DepthOfDischarge {
    type Target = u8;

    fn deref(&self) -> &u8 {
        &self.0
    }
}

impl fmt::Display for DepthOfDischarge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

/// Grid region the inverter output is configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Region {
    Eu = 0,
    China = 1,
    NonEu = 2,
}

impl Region {
    pub fn encode(&self) -> [u8; 1] {
        [*self as u8]
    }
}

impl TryFrom<u8> for Region {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Region::Eu),
            1 => Ok(Region::China),
            2 => Ok(Region::NonEu),
            _ => Err(Error::InvalidParameter {
                parameter: "region",
                value,
                allowed: "0 (EU), 1 (China), 2 (Non-EU)",
            }),
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Region::Eu => "EU",
            Region::China => "China",
            Region::NonEu => "Non-EU",
        };
        write!(f, "{name}")
    }
}

/// Adaptive output mode switch.
///
/// The device uses an inverted encoding: `0x00` enables, `0x01` disables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdaptiveMode {
    Enabled,
    Disabled,
}

impl AdaptiveMode {
    pub fn encode(&self) -> [u8; 1] {
        match self {
            AdaptiveMode::Enabled => [0x00],
            AdaptiveMode::Disabled => [0x01],
        }
    }
}

impl From<bool> for AdaptiveMode {
    fn from(enable: bool) -> Self {
        if enable {
            AdaptiveMode::Enabled
        } else {
            AdaptiveMode::Disabled
        }
    }
}

/// Wi-Fi credentials pushed to the device's network module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiConfig {
    pub ssid: String,
    pub password: String,
}

impl WifiConfig {
    /// Literal separating SSID and password on the wire.
    pub const DELIMITER: &'static str = "<.,.>";

    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            password: password.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        format!("{}{}{}", self.ssid, Self::DELIMITER, self.password).into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn encode_device_info_request() {
        assert_eq!(
            encode(Opcode::DeviceInfo.code(), DEFAULT_PAYLOAD),
            [0x73, 0x06, 0x23, 0x04, 0x01, 0x53]
        );
    }

    #[test]
    fn encoded_frames_xor_to_zero() {
        let payloads: [&[u8]; 5] = [&[], &[0x00], &[0x01], &[0xFF, 0x10, 0x7A], b"home<.,.>secret"];
        for opcode in 0..=u8::MAX {
            for payload in payloads {
                let frame = encode(opcode, payload);
                assert_eq!(checksum(&frame), 0, "opcode 0x{opcode:02X} payload {payload:?}");
                assert_eq!(frame[1] as usize, frame.len());
                assert_eq!(extract_opcode(&frame), Ok(opcode));
            }
        }
    }

    #[test]
    fn extract_opcode_rejects_short_frames() {
        assert_eq!(extract_opcode(&[]), Err(Error::MalformedFrame(0)));
        assert_eq!(extract_opcode(&[0x73, 0x06, 0x23]), Err(Error::MalformedFrame(3)));
        assert_eq!(extract_opcode(&[0x73, 0x06, 0x23, 0x0F]), Ok(0x0F));
    }

    #[test]
    fn payload_skips_header() {
        assert_eq!(payload(&[0x73, 0x06, 0x23, 0x04, 0x01, 0x53]), &[0x01, 0x53]);
        assert!(payload(&[0x73, 0x06]).is_empty());
    }

    #[test]
    fn opcode_table() {
        assert_eq!(Opcode::try_from(0x0F), Ok(Opcode::CellVoltages));
        assert_eq!(Opcode::try_from(0x26), Ok(Opcode::FactoryReset));
        assert_eq!(Opcode::try_from(0x7F), Err(0x7F));
        assert_eq!(Opcode::GetTimers.to_string(), "GetTimers (0x13)");
    }

    #[test]
    fn depth_of_discharge_range() {
        assert_matches!(
            DepthOfDischarge::try_from(9),
            Err(Error::InvalidParameter { value: 9, .. })
        );
        assert_eq!(*DepthOfDischarge::try_from(10).unwrap(), 10);
        assert_eq!(DepthOfDischarge::try_from(100).unwrap().encode(), [100]);
        assert_matches!(
            DepthOfDischarge::try_from(101),
            Err(Error::InvalidParameter { value: 101, .. })
        );
    }

    #[test]
    fn region_values() {
        assert_eq!(Region::try_from(0), Ok(Region::Eu));
        assert_eq!(Region::try_from(2).unwrap().encode(), [2]);
        assert_matches!(Region::try_from(3), Err(Error::InvalidParameter { .. }));
        assert_eq!(Region::NonEu.to_string(), "Non-EU");
    }

    #[test]
    fn adaptive_mode_is_inverted() {
        assert_eq!(AdaptiveMode::from(true).encode(), [0x00]);
        assert_eq!(AdaptiveMode::from(false).encode(), [0x01]);
    }

    #[test]
    fn wifi_payload() {
        assert_eq!(WifiConfig::new("home", "s3cret").encode(), b"home<.,.>s3cret");
    }
}

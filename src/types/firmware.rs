//! Firmware and hardware identification.

use serde::{Deserialize, Serialize};

use crate::error::{DriverError, Result};

/// Firmware image family running on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FirmwareType {
    /// Bluetooth streaming only
    BtStream,
    /// SD card logging only
    SdLog,
    /// Combined logging and streaming
    LogAndStream,
}

impl FirmwareType {
    pub fn from_wire(raw: u16) -> Result<Self> {
        match raw {
            0x01 => Ok(FirmwareType::BtStream),
            0x02 => Ok(FirmwareType::SdLog),
            0x03 => Ok(FirmwareType::LogAndStream),
            other => Err(DriverError::protocol(format!("unknown firmware type {other:#04x}"))),
        }
    }

    pub const fn to_wire(self) -> u16 {
        match self {
            FirmwareType::BtStream => 0x01,
            FirmwareType::SdLog => 0x02,
            FirmwareType::LogAndStream => 0x03,
        }
    }
}

/// Firmware release number with lexicographic ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FirmwareVersion {
    pub major: u16,
    pub minor: u8,
    pub patch: u8,
}

impl FirmwareVersion {
    pub const fn new(major: u16, minor: u8, patch: u8) -> Self {
        Self { major, minor, patch }
    }
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Hardware board revision byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HardwareVersion(pub u8);

impl HardwareVersion {
    /// Third-generation mainboard, the revision this driver targets.
    pub const fn is_gen3(self) -> bool {
        self.0 == 3
    }
}

/// Status-ack suppression first shipped in LogAndStream 0.15.4.
const ACK_DISABLE_MIN_VERSION: FirmwareVersion = FirmwareVersion::new(0, 15, 4);

/// What the connected firmware can do, derived once during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareCapabilities {
    pub fw_type: FirmwareType,
    pub version: FirmwareVersion,
}

impl FirmwareCapabilities {
    pub const fn new(fw_type: FirmwareType, version: FirmwareVersion) -> Self {
        Self { fw_type, version }
    }

    /// Whether the firmware can suppress the unsolicited ack byte it
    /// otherwise sends before every status notification.
    pub fn supports_status_ack_disable(&self) -> bool {
        self.fw_type == FirmwareType::LogAndStream && self.version >= ACK_DISABLE_MIN_VERSION
    }

    /// Whether the firmware can log to the SD card.
    pub fn supports_sd_logging(&self) -> bool {
        matches!(self.fw_type, FirmwareType::SdLog | FirmwareType::LogAndStream)
    }

    /// Whether the firmware can stream live data over the link.
    pub fn supports_streaming(&self) -> bool {
        matches!(self.fw_type, FirmwareType::BtStream | FirmwareType::LogAndStream)
    }
}

//! Channel and sensor definitions.
//!
//! A device streams a fixed set of data channels. Each channel has a one-byte
//! wire identifier used in the inquiry response and exactly one wire encoding.
//! Sensors are the switchable hardware blocks; enabling one sensor activates
//! one or more channels.

use serde::{Deserialize, Serialize};

use crate::codec::{ByteOrder, ChannelEncoding};
use crate::error::{DriverError, Result};

/// Width of the sensor enable bitfield on the wire, in bytes.
pub const SENSOR_BITFIELD_LEN: usize = 3;

/// Content type of a single data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelType {
    /// Low noise accelerometer X/Y/Z
    AccelLnX,
    AccelLnY,
    AccelLnZ,
    /// Battery voltage sense
    Vbatt,
    /// Wide range accelerometer X/Y/Z (LSM303DLHC)
    AccelWrX,
    AccelWrY,
    AccelWrZ,
    /// Magnetometer X/Y/Z (LSM303DLHC)
    MagX,
    MagY,
    MagZ,
    /// Gyroscope X/Y/Z (MPU9150)
    GyroX,
    GyroY,
    GyroZ,
    ExternalAdcA0,
    ExternalAdcA1,
    ExternalAdcA2,
    InternalAdcA3,
    InternalAdcA0,
    InternalAdcA1,
    InternalAdcA2,
    /// High-G accelerometer X/Y/Z, present on the wire map but not streamed
    /// by current firmware
    AccelHgX,
    AccelHgY,
    AccelHgZ,
    /// Wide-range magnetometer X/Y/Z, present on the wire map but not
    /// streamed by current firmware
    MagWrX,
    MagWrY,
    MagWrZ,
    /// Temperature (BMPX80)
    Temperature,
    /// Pressure (BMPX80)
    Pressure,
    /// Galvanic skin response, raw ADC value
    GsrRaw,
    Exg1Status,
    Exg1Ch1Hi,
    Exg1Ch2Hi,
    Exg2Status,
    Exg2Ch1Hi,
    Exg2Ch2Hi,
    Exg1Ch1Lo,
    Exg1Ch2Lo,
    Exg2Ch1Lo,
    Exg2Ch2Lo,
    /// Bridge amplifier high/low
    StrainHigh,
    StrainLow,
    /// Device clock timestamp. Prepended to every streamed sample and every
    /// recording record; has no public wire identifier of its own.
    Timestamp,
}

const I16_LE: ChannelEncoding = ChannelEncoding::new(2, true, ByteOrder::Little);
const I16_BE: ChannelEncoding = ChannelEncoding::new(2, true, ByteOrder::Big);
const U16_LE: ChannelEncoding = ChannelEncoding::new(2, false, ByteOrder::Little);
const U16_BE: ChannelEncoding = ChannelEncoding::new(2, false, ByteOrder::Big);
const U8: ChannelEncoding = ChannelEncoding::new(1, false, ByteOrder::Little);
const I24_BE: ChannelEncoding = ChannelEncoding::new(3, true, ByteOrder::Big);
const U24_BE: ChannelEncoding = ChannelEncoding::new(3, false, ByteOrder::Big);
const U24_LE: ChannelEncoding = ChannelEncoding::new(3, false, ByteOrder::Little);

impl ChannelType {
    /// Wire encoding of this channel's values.
    ///
    /// Returns `None` for channels current firmware never streams.
    pub const fn encoding(self) -> Option<ChannelEncoding> {
        match self {
            ChannelType::AccelLnX
            | ChannelType::AccelLnY
            | ChannelType::AccelLnZ
            | ChannelType::Vbatt
            | ChannelType::AccelWrX
            | ChannelType::AccelWrY
            | ChannelType::AccelWrZ
            | ChannelType::MagX
            | ChannelType::MagY
            | ChannelType::MagZ => Some(I16_LE),
            ChannelType::GyroX | ChannelType::GyroY | ChannelType::GyroZ => Some(I16_BE),
            ChannelType::ExternalAdcA0
            | ChannelType::ExternalAdcA1
            | ChannelType::ExternalAdcA2
            | ChannelType::InternalAdcA3
            | ChannelType::InternalAdcA0
            | ChannelType::InternalAdcA1
            | ChannelType::InternalAdcA2 => Some(U16_LE),
            ChannelType::AccelHgX
            | ChannelType::AccelHgY
            | ChannelType::AccelHgZ
            | ChannelType::MagWrX
            | ChannelType::MagWrY
            | ChannelType::MagWrZ => None,
            ChannelType::Temperature => Some(U16_BE),
            ChannelType::Pressure => Some(U24_BE),
            ChannelType::GsrRaw => Some(U16_LE),
            ChannelType::Exg1Status | ChannelType::Exg2Status => Some(U8),
            ChannelType::Exg1Ch1Hi
            | ChannelType::Exg1Ch2Hi
            | ChannelType::Exg2Ch1Hi
            | ChannelType::Exg2Ch2Hi => Some(I24_BE),
            ChannelType::Exg1Ch1Lo
            | ChannelType::Exg1Ch2Lo
            | ChannelType::Exg2Ch1Lo
            | ChannelType::Exg2Ch2Lo => Some(I16_BE),
            ChannelType::StrainHigh | ChannelType::StrainLow => Some(U16_LE),
            ChannelType::Timestamp => Some(U24_LE),
        }
    }

    /// One-byte wire identifier used by the inquiry response.
    ///
    /// The timestamp channel is implicit in every sample and has no public
    /// identifier.
    pub const fn wire_id(self) -> Option<u8> {
        match self {
            ChannelType::AccelLnX => Some(0x00),
            ChannelType::AccelLnY => Some(0x01),
            ChannelType::AccelLnZ => Some(0x02),
            ChannelType::Vbatt => Some(0x03),
            ChannelType::AccelWrX => Some(0x04),
            ChannelType::AccelWrY => Some(0x05),
            ChannelType::AccelWrZ => Some(0x06),
            ChannelType::MagX => Some(0x07),
            ChannelType::MagY => Some(0x08),
            ChannelType::MagZ => Some(0x09),
            ChannelType::GyroX => Some(0x0A),
            ChannelType::GyroY => Some(0x0B),
            ChannelType::GyroZ => Some(0x0C),
            ChannelType::ExternalAdcA0 => Some(0x0D),
            ChannelType::ExternalAdcA1 => Some(0x0E),
            ChannelType::ExternalAdcA2 => Some(0x0F),
            ChannelType::InternalAdcA3 => Some(0x10),
            ChannelType::InternalAdcA0 => Some(0x11),
            ChannelType::InternalAdcA1 => Some(0x12),
            ChannelType::InternalAdcA2 => Some(0x13),
            ChannelType::AccelHgX => Some(0x14),
            ChannelType::AccelHgY => Some(0x15),
            ChannelType::AccelHgZ => Some(0x16),
            ChannelType::MagWrX => Some(0x17),
            ChannelType::MagWrY => Some(0x18),
            ChannelType::MagWrZ => Some(0x19),
            ChannelType::Temperature => Some(0x1A),
            ChannelType::Pressure => Some(0x1B),
            ChannelType::GsrRaw => Some(0x1C),
            ChannelType::Exg1Status => Some(0x1D),
            ChannelType::Exg1Ch1Hi => Some(0x1E),
            ChannelType::Exg1Ch2Hi => Some(0x1F),
            ChannelType::Exg2Status => Some(0x20),
            ChannelType::Exg2Ch1Hi => Some(0x21),
            ChannelType::Exg2Ch2Hi => Some(0x22),
            ChannelType::Exg1Ch1Lo => Some(0x23),
            ChannelType::Exg1Ch2Lo => Some(0x24),
            ChannelType::Exg2Ch1Lo => Some(0x25),
            ChannelType::Exg2Ch2Lo => Some(0x26),
            ChannelType::StrainHigh => Some(0x27),
            ChannelType::StrainLow => Some(0x28),
            ChannelType::Timestamp => None,
        }
    }

    /// Resolves a wire identifier from an inquiry response.
    pub fn from_wire_id(id: u8) -> Result<Self> {
        ALL_CHANNELS
            .iter()
            .copied()
            .find(|ch| ch.wire_id() == Some(id))
            .ok_or_else(|| DriverError::protocol(format!("unknown channel id {id:#04x}")))
    }
}

const ALL_CHANNELS: [ChannelType; 42] = [
    ChannelType::AccelLnX,
    ChannelType::AccelLnY,
    ChannelType::AccelLnZ,
    ChannelType::Vbatt,
    ChannelType::AccelWrX,
    ChannelType::AccelWrY,
    ChannelType::AccelWrZ,
    ChannelType::MagX,
    ChannelType::MagY,
    ChannelType::MagZ,
    ChannelType::GyroX,
    ChannelType::GyroY,
    ChannelType::GyroZ,
    ChannelType::ExternalAdcA0,
    ChannelType::ExternalAdcA1,
    ChannelType::ExternalAdcA2,
    ChannelType::InternalAdcA3,
    ChannelType::InternalAdcA0,
    ChannelType::InternalAdcA1,
    ChannelType::InternalAdcA2,
    ChannelType::AccelHgX,
    ChannelType::AccelHgY,
    ChannelType::AccelHgZ,
    ChannelType::MagWrX,
    ChannelType::MagWrY,
    ChannelType::MagWrZ,
    ChannelType::Temperature,
    ChannelType::Pressure,
    ChannelType::GsrRaw,
    ChannelType::Exg1Status,
    ChannelType::Exg1Ch1Hi,
    ChannelType::Exg1Ch2Hi,
    ChannelType::Exg2Status,
    ChannelType::Exg2Ch1Hi,
    ChannelType::Exg2Ch2Hi,
    ChannelType::Exg1Ch1Lo,
    ChannelType::Exg1Ch2Lo,
    ChannelType::Exg2Ch1Lo,
    ChannelType::Exg2Ch2Lo,
    ChannelType::StrainHigh,
    ChannelType::StrainLow,
    ChannelType::Timestamp,
];

/// A switchable sensor block on the device.
///
/// One sensor can feed multiple channels, so there is a one-to-many mapping
/// between sensors and channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SensorGroup {
    AccelLn,
    Battery,
    ExtChA0,
    ExtChA1,
    ExtChA2,
    IntChA0,
    IntChA1,
    IntChA2,
    Strain,
    IntChA3,
    Gsr,
    Gyro,
    AccelWr,
    Mag,
    AccelHg,
    MagWr,
    Temp,
    Pressure,
    Exg1Hi,
    Exg1Lo,
    Exg2Hi,
    Exg2Lo,
}

const ALL_SENSORS: [SensorGroup; 22] = [
    SensorGroup::AccelLn,
    SensorGroup::Battery,
    SensorGroup::ExtChA0,
    SensorGroup::ExtChA1,
    SensorGroup::ExtChA2,
    SensorGroup::IntChA0,
    SensorGroup::IntChA1,
    SensorGroup::IntChA2,
    SensorGroup::Strain,
    SensorGroup::IntChA3,
    SensorGroup::Gsr,
    SensorGroup::Gyro,
    SensorGroup::AccelWr,
    SensorGroup::Mag,
    SensorGroup::AccelHg,
    SensorGroup::MagWr,
    SensorGroup::Temp,
    SensorGroup::Pressure,
    SensorGroup::Exg1Hi,
    SensorGroup::Exg1Lo,
    SensorGroup::Exg2Hi,
    SensorGroup::Exg2Lo,
];

impl SensorGroup {
    /// Bit position in the three-byte enable bitfield, as a little-endian
    /// 24-bit mask.
    pub const fn bitfield_mask(self) -> u32 {
        match self {
            SensorGroup::AccelLn => 0x80,
            SensorGroup::Gyro => 0x40,
            SensorGroup::Mag => 0x20,
            SensorGroup::Exg1Hi => 0x10,
            SensorGroup::Exg2Hi => 0x08,
            SensorGroup::Gsr => 0x04,
            SensorGroup::ExtChA0 => 0x02,
            SensorGroup::ExtChA1 => 0x01,
            SensorGroup::Strain => 0x80 << 8,
            SensorGroup::Battery => 0x20 << 8,
            SensorGroup::AccelWr => 0x10 << 8,
            SensorGroup::ExtChA2 => 0x08 << 8,
            SensorGroup::IntChA3 => 0x04 << 8,
            SensorGroup::IntChA0 => 0x02 << 8,
            SensorGroup::IntChA1 => 0x01 << 8,
            SensorGroup::IntChA2 => 0x80 << 16,
            SensorGroup::AccelHg => 0x40 << 16,
            SensorGroup::MagWr => 0x20 << 16,
            SensorGroup::Exg1Lo => 0x10 << 16,
            SensorGroup::Exg2Lo => 0x08 << 16,
            SensorGroup::Pressure => 0x04 << 16,
            SensorGroup::Temp => 0x02 << 16,
        }
    }

    /// Position of this sensor's channels within a sample record.
    pub const fn record_order(self) -> u8 {
        match self {
            SensorGroup::AccelLn => 1,
            SensorGroup::Battery => 2,
            SensorGroup::ExtChA0 => 3,
            SensorGroup::ExtChA1 => 4,
            SensorGroup::ExtChA2 => 5,
            SensorGroup::IntChA0 => 6,
            SensorGroup::IntChA1 => 7,
            SensorGroup::IntChA2 => 8,
            SensorGroup::Strain => 9,
            SensorGroup::IntChA3 => 10,
            SensorGroup::Gsr => 11,
            SensorGroup::Gyro => 12,
            SensorGroup::AccelWr => 13,
            SensorGroup::Mag => 14,
            SensorGroup::AccelHg => 15,
            SensorGroup::MagWr => 16,
            SensorGroup::Pressure => 17,
            SensorGroup::Exg1Hi => 18,
            SensorGroup::Exg1Lo => 19,
            SensorGroup::Exg2Hi => 20,
            SensorGroup::Exg2Lo => 21,
            SensorGroup::Temp => 22,
        }
    }

    /// Data channels this sensor feeds, in record order.
    pub const fn channels(self) -> &'static [ChannelType] {
        match self {
            SensorGroup::AccelLn => {
                &[ChannelType::AccelLnX, ChannelType::AccelLnY, ChannelType::AccelLnZ]
            }
            SensorGroup::Battery => &[ChannelType::Vbatt],
            SensorGroup::ExtChA0 => &[ChannelType::ExternalAdcA0],
            SensorGroup::ExtChA1 => &[ChannelType::ExternalAdcA1],
            SensorGroup::ExtChA2 => &[ChannelType::ExternalAdcA2],
            SensorGroup::IntChA0 => &[ChannelType::InternalAdcA0],
            SensorGroup::IntChA1 => &[ChannelType::InternalAdcA1],
            SensorGroup::IntChA2 => &[ChannelType::InternalAdcA2],
            SensorGroup::Strain => &[ChannelType::StrainHigh, ChannelType::StrainLow],
            SensorGroup::IntChA3 => &[ChannelType::InternalAdcA3],
            SensorGroup::Gsr => &[ChannelType::GsrRaw],
            SensorGroup::Gyro => &[ChannelType::GyroX, ChannelType::GyroY, ChannelType::GyroZ],
            SensorGroup::AccelWr => {
                &[ChannelType::AccelWrX, ChannelType::AccelWrY, ChannelType::AccelWrZ]
            }
            SensorGroup::Mag => &[ChannelType::MagX, ChannelType::MagY, ChannelType::MagZ],
            SensorGroup::AccelHg => {
                &[ChannelType::AccelHgX, ChannelType::AccelHgY, ChannelType::AccelHgZ]
            }
            SensorGroup::MagWr => &[ChannelType::MagWrX, ChannelType::MagWrY, ChannelType::MagWrZ],
            SensorGroup::Pressure => &[ChannelType::Temperature, ChannelType::Pressure],
            SensorGroup::Exg1Hi => {
                &[ChannelType::Exg1Status, ChannelType::Exg1Ch1Hi, ChannelType::Exg1Ch2Hi]
            }
            SensorGroup::Exg1Lo => {
                &[ChannelType::Exg1Status, ChannelType::Exg1Ch1Lo, ChannelType::Exg1Ch2Lo]
            }
            SensorGroup::Exg2Hi => {
                &[ChannelType::Exg2Status, ChannelType::Exg2Ch1Hi, ChannelType::Exg2Ch2Hi]
            }
            SensorGroup::Exg2Lo => {
                &[ChannelType::Exg2Status, ChannelType::Exg2Ch1Lo, ChannelType::Exg2Ch2Lo]
            }
            // Not yet exposed as a channel by current firmware
            SensorGroup::Temp => &[],
        }
    }
}

/// Serializes a sensor set to the three-byte enable bitfield.
pub fn serialize_sensors(sensors: &[SensorGroup]) -> [u8; SENSOR_BITFIELD_LEN] {
    let mut bitfield: u32 = 0;
    for sensor in sensors {
        bitfield |= sensor.bitfield_mask();
    }
    let bytes = bitfield.to_le_bytes();
    [bytes[0], bytes[1], bytes[2]]
}

/// Decodes the three-byte enable bitfield into a sensor list in record order.
pub fn deserialize_sensors(bitfield: [u8; SENSOR_BITFIELD_LEN]) -> Vec<SensorGroup> {
    let raw = u32::from_le_bytes([bitfield[0], bitfield[1], bitfield[2], 0]);
    let mut sensors: Vec<SensorGroup> =
        ALL_SENSORS.iter().copied().filter(|s| raw & s.bitfield_mask() != 0).collect();
    sort_sensors(&mut sensors);
    sensors
}

/// Sorts sensors by the order their channels appear in a sample record.
pub fn sort_sensors(sensors: &mut [SensorGroup]) {
    sensors.sort_by_key(|s| s.record_order());
}

/// Expands a sensor set into the flat channel list, in record order.
///
/// The caller is expected to pass an already sorted sensor list, as returned
/// by [`deserialize_sensors`].
pub fn enabled_channels(sensors: &[SensorGroup]) -> Vec<ChannelType> {
    sensors.iter().flat_map(|s| s.channels().iter().copied()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_public_channel_round_trips_through_wire_id() {
        for ch in ALL_CHANNELS {
            if let Some(id) = ch.wire_id() {
                assert_eq!(ChannelType::from_wire_id(id).unwrap(), ch);
            }
        }
    }

    #[test]
    fn wire_ids_are_dense_and_unique() {
        let mut ids: Vec<u8> = ALL_CHANNELS.iter().filter_map(|ch| ch.wire_id()).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0x00..=0x28).collect::<Vec<u8>>());
    }

    #[test]
    fn unknown_wire_id_is_a_protocol_error() {
        assert!(ChannelType::from_wire_id(0x42).is_err());
    }

    #[test]
    fn encodings_match_the_device_wire_format() {
        assert_eq!(ChannelType::GyroX.encoding(), Some(I16_BE));
        assert_eq!(ChannelType::InternalAdcA1.encoding(), Some(U16_LE));
        assert_eq!(ChannelType::Pressure.encoding(), Some(U24_BE));
        assert_eq!(ChannelType::Exg1Status.encoding(), Some(U8));
        assert_eq!(ChannelType::Exg2Ch1Hi.encoding(), Some(I24_BE));
        assert_eq!(ChannelType::Timestamp.encoding(), Some(U24_LE));
        assert_eq!(ChannelType::AccelHgX.encoding(), None);
    }

    #[test]
    fn sensor_bitfield_round_trip() {
        let sensors = vec![SensorGroup::Gyro, SensorGroup::AccelLn, SensorGroup::Battery];
        let bitfield = serialize_sensors(&sensors);
        assert_eq!(bitfield, [0x80 | 0x40, 0x20, 0x00]);

        let decoded = deserialize_sensors(bitfield);
        assert_eq!(decoded, vec![SensorGroup::AccelLn, SensorGroup::Battery, SensorGroup::Gyro]);
    }

    #[test]
    fn bitfield_masks_are_unique() {
        let mut masks: Vec<u32> = ALL_SENSORS.iter().map(|s| s.bitfield_mask()).collect();
        masks.sort_unstable();
        masks.dedup();
        assert_eq!(masks.len(), ALL_SENSORS.len());
    }

    #[test]
    fn enabled_channels_follow_record_order() {
        let mut sensors = vec![SensorGroup::Gyro, SensorGroup::Battery, SensorGroup::Pressure];
        sort_sensors(&mut sensors);
        let channels = enabled_channels(&sensors);
        assert_eq!(
            channels,
            vec![
                ChannelType::Vbatt,
                ChannelType::GyroX,
                ChannelType::GyroY,
                ChannelType::GyroZ,
                ChannelType::Temperature,
                ChannelType::Pressure,
            ]
        );
    }
}

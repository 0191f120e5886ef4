//! Binary layout of on-device recording files.
//!
//! The firmware writes a fixed 256-byte header followed by data blocks. All
//! header fields live at fixed offsets; only the ones the reader needs are
//! parsed here. Out-of-range fields fail parsing with a malformed-file error
//! so a broken file never yields partial data.

use crate::codec;
use crate::error::{DriverError, Result};
use crate::types::calibration::{CALIBRATION_SENSOR_LEN, TriaxcalParams};
use crate::types::channel::{
    ChannelType, SENSOR_BITFIELD_LEN, SensorGroup, deserialize_sensors, enabled_channels,
};
use crate::types::exg::{EXG_REGISTER_LEN, ExgRegister};
use crate::types::packet::record_len;

/// Sampling clock divider, u16 little endian.
pub const SAMPLING_RATE_OFFSET: usize = 0x00;
/// Three-byte sensor enable bitfield.
pub const ENABLED_SENSORS_OFFSET: usize = 0x03;
/// Trial configuration flags, u16 little endian.
pub const TRIAL_CONFIG_OFFSET: usize = 0x10;
/// Difference between device clock and master clock, u64 big endian.
pub const CLOCK_DIFF_OFFSET: usize = 0x2C;
/// Two consecutive ten-byte ExG register blocks.
pub const EXG_REGS_OFFSET: usize = 0x38;
/// Per-sensor triaxial calibration blocks, 21 bytes each.
pub const TRIAXCAL_ACCEL_WR_OFFSET: usize = 0x4C;
pub const TRIAXCAL_GYRO_OFFSET: usize = 0x61;
pub const TRIAXCAL_MAG_OFFSET: usize = 0x76;
pub const TRIAXCAL_ACCEL_LN_OFFSET: usize = 0x8B;
/// Forty-bit boot timestamp.
pub const START_TIMESTAMP_OFFSET: usize = 0xFB;
pub const START_TIMESTAMP_LEN: usize = 5;
/// First data block.
pub const DATA_OFFSET: usize = 0x100;
/// Nominal payload length of one data block.
pub const BLOCK_LEN: usize = 0x200;
/// Sync offset prefix per block when synchronization is enabled.
pub const SYNC_OFFSET_LEN: usize = 9;

/// Trial configuration bit marking this device as the clock master.
pub const TRIAL_CONFIG_MASTER: u16 = 0x02;
/// Trial configuration bit enabling per-block sync offsets.
pub const TRIAL_CONFIG_SYNC: u16 = 0x04;

/// Calibrated sensors and where their parameter blocks live in the header.
const TRIAXCAL_SENSORS: [(SensorGroup, usize); 4] = [
    (SensorGroup::AccelWr, TRIAXCAL_ACCEL_WR_OFFSET),
    (SensorGroup::Gyro, TRIAXCAL_GYRO_OFFSET),
    (SensorGroup::Mag, TRIAXCAL_MAG_OFFSET),
    (SensorGroup::AccelLn, TRIAXCAL_ACCEL_LN_OFFSET),
];

/// Parsed recording file header.
#[derive(Debug, Clone)]
pub struct RecordingHeader {
    sampling_divider: u16,
    sensors: Vec<SensorGroup>,
    channels: Vec<ChannelType>,
    trial_config: u16,
    clock_diff: u64,
    start_timestamp: u64,
    exg_regs: [ExgRegister; 2],
    triaxcal: [TriaxcalParams; 4],
}

impl RecordingHeader {
    /// Parses and validates the fixed header of `data`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < DATA_OFFSET {
            return Err(DriverError::malformed_file(
                "header",
                format!("file is {} bytes, header requires {DATA_OFFSET}", data.len()),
            ));
        }

        let sampling_divider = u16::from_le_bytes([
            data[SAMPLING_RATE_OFFSET],
            data[SAMPLING_RATE_OFFSET + 1],
        ]);
        if sampling_divider == 0 {
            return Err(DriverError::malformed_file("header", "sampling clock divider is zero"));
        }

        let mut bitfield = [0u8; SENSOR_BITFIELD_LEN];
        bitfield.copy_from_slice(
            &data[ENABLED_SENSORS_OFFSET..ENABLED_SENSORS_OFFSET + SENSOR_BITFIELD_LEN],
        );
        let sensors = deserialize_sensors(bitfield);

        let mut channels = vec![ChannelType::Timestamp];
        channels.extend(enabled_channels(&sensors));
        // Proves every enabled channel is decodable before any data is read
        if record_len(&channels).is_err() {
            return Err(DriverError::malformed_file(
                "header",
                "sensor bitfield enables channels without a wire encoding",
            ));
        }

        let trial_config =
            u16::from_le_bytes([data[TRIAL_CONFIG_OFFSET], data[TRIAL_CONFIG_OFFSET + 1]]);

        let mut clock_diff_bytes = [0u8; 8];
        clock_diff_bytes.copy_from_slice(&data[CLOCK_DIFF_OFFSET..CLOCK_DIFF_OFFSET + 8]);
        let clock_diff = u64::from_be_bytes(clock_diff_bytes);

        let exg_regs = [
            ExgRegister::from_slice(&data[EXG_REGS_OFFSET..EXG_REGS_OFFSET + EXG_REGISTER_LEN])?,
            ExgRegister::from_slice(
                &data[EXG_REGS_OFFSET + EXG_REGISTER_LEN
                    ..EXG_REGS_OFFSET + 2 * EXG_REGISTER_LEN],
            )?,
        ];

        let start_timestamp = decode_start_timestamp(
            &data[START_TIMESTAMP_OFFSET..START_TIMESTAMP_OFFSET + START_TIMESTAMP_LEN],
        );

        let cal = |offset: usize| {
            TriaxcalParams::from_slice(&data[offset..offset + CALIBRATION_SENSOR_LEN])
        };
        let triaxcal = [
            cal(TRIAXCAL_ACCEL_WR_OFFSET)?,
            cal(TRIAXCAL_GYRO_OFFSET)?,
            cal(TRIAXCAL_MAG_OFFSET)?,
            cal(TRIAXCAL_ACCEL_LN_OFFSET)?,
        ];

        Ok(Self {
            sampling_divider,
            sensors,
            channels,
            trial_config,
            clock_diff,
            start_timestamp,
            exg_regs,
            triaxcal,
        })
    }

    /// Sampling rate in Hz.
    pub fn sampling_rate(&self) -> f64 {
        codec::divider_to_rate(self.sampling_divider)
    }

    /// Sensors enabled for this trial, in record order.
    pub fn sensors(&self) -> &[SensorGroup] {
        &self.sensors
    }

    /// Record layout, timestamp first.
    pub fn channels(&self) -> &[ChannelType] {
        &self.channels
    }

    /// Byte length of one sample record.
    pub fn record_len(&self) -> usize {
        // Validated during parse
        record_len(&self.channels).unwrap_or(0)
    }

    /// Whether blocks carry clock synchronization offsets.
    pub fn has_sync(&self) -> bool {
        self.trial_config & TRIAL_CONFIG_SYNC != 0
    }

    /// Whether this device acted as the clock master of the trial.
    pub fn is_sync_master(&self) -> bool {
        self.trial_config & TRIAL_CONFIG_MASTER != 0
    }

    /// Whether the device clock was aligned to a real-time clock.
    pub fn has_global_clock(&self) -> bool {
        self.clock_diff != 0
    }

    /// Device-to-master clock difference in ticks.
    pub fn global_clock_diff(&self) -> u64 {
        self.clock_diff
    }

    /// Device clock value at recording start, in ticks since boot.
    pub fn start_timestamp(&self) -> u64 {
        self.start_timestamp
    }

    /// ExG front-end configuration of `chip` (0 or 1).
    pub fn exg_register(&self, chip: usize) -> Option<&ExgRegister> {
        self.exg_regs.get(chip)
    }

    /// Triaxial calibration of `sensor`, or `None` for sensors without a
    /// stored parameter block.
    pub fn triaxcal_params(&self, sensor: SensorGroup) -> Option<&TriaxcalParams> {
        let slot = TRIAXCAL_SENSORS.iter().position(|(s, _)| *s == sensor)?;
        Some(&self.triaxcal[slot])
    }

    /// Whole sample records per data block, and the block's total byte
    /// length including the sync prefix.
    pub fn block_geometry(&self) -> (usize, usize) {
        let sync_len = if self.has_sync() { SYNC_OFFSET_LEN } else { 0 };
        let record_len = self.record_len();
        let samples = (BLOCK_LEN - sync_len) / record_len;
        (samples, samples * record_len + sync_len)
    }
}

/// Decodes the 40-bit boot timestamp.
///
/// The field is little endian except that its most significant byte is
/// stored first. Rotating the leading byte to the end restores plain
/// little-endian order.
fn decode_start_timestamp(raw: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes[..START_TIMESTAMP_LEN - 1].copy_from_slice(&raw[1..]);
    bytes[START_TIMESTAMP_LEN - 1] = raw[0];
    u64::from_le_bytes(bytes)
}

//! Factory calibration of the inertial sensors.
//!
//! Each calibrated sensor stores a 21-byte parameter block: three 16-bit
//! big-endian offset bias values, three 16-bit big-endian sensitivity values,
//! and a nine-entry signed alignment matrix in row-major order. The device
//! reports all four blocks at once in response to the calibration command,
//! and writes the same blocks into the recording file header.

use crate::error::{DriverError, Result};
use crate::types::channel::SensorGroup;

/// Byte length of one sensor's calibration block.
pub const CALIBRATION_SENSOR_LEN: usize = 21;
/// Byte length of the full calibration dump, four blocks.
pub const ALL_CALIBRATION_LEN: usize = 4 * CALIBRATION_SENSOR_LEN;

/// Calibration parameters of one triaxial sensor, as stored by the device.
///
/// Values are the raw stored integers; unit scaling is sensor specific and
/// left to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriaxcalParams {
    /// Per-axis offset bias (x, y, z).
    pub offset_bias: [i16; 3],
    /// Per-axis sensitivity (x, y, z).
    pub sensitivity: [i16; 3],
    /// 3x3 axis alignment matrix, row major.
    pub alignment: [i8; 9],
}

impl TriaxcalParams {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != CALIBRATION_SENSOR_LEN {
            return Err(DriverError::protocol(format!(
                "calibration block must be {CALIBRATION_SENSOR_LEN} bytes, got {}",
                bytes.len()
            )));
        }

        let mut offset_bias = [0i16; 3];
        let mut sensitivity = [0i16; 3];
        for axis in 0..3 {
            offset_bias[axis] = i16::from_be_bytes([bytes[2 * axis], bytes[2 * axis + 1]]);
            sensitivity[axis] =
                i16::from_be_bytes([bytes[6 + 2 * axis], bytes[6 + 2 * axis + 1]]);
        }
        let mut alignment = [0i8; 9];
        for (entry, byte) in alignment.iter_mut().zip(&bytes[12..]) {
            *entry = *byte as i8;
        }

        Ok(Self { offset_bias, sensitivity, alignment })
    }
}

/// Order of the sensor blocks in the calibration response.
const SENSOR_ORDER: [SensorGroup; 4] =
    [SensorGroup::AccelLn, SensorGroup::Gyro, SensorGroup::Mag, SensorGroup::AccelWr];

/// The full calibration dump reported by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllCalibration {
    params: [TriaxcalParams; 4],
}

impl AllCalibration {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != ALL_CALIBRATION_LEN {
            return Err(DriverError::protocol(format!(
                "calibration dump must be {ALL_CALIBRATION_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let block = |slot: usize| {
            TriaxcalParams::from_slice(
                &bytes[slot * CALIBRATION_SENSOR_LEN..(slot + 1) * CALIBRATION_SENSOR_LEN],
            )
        };
        Ok(Self { params: [block(0)?, block(1)?, block(2)?, block(3)?] })
    }

    /// Parameters of `sensor`, or `None` for sensors the device does not
    /// calibrate.
    pub fn params(&self, sensor: SensorGroup) -> Option<&TriaxcalParams> {
        let slot = SENSOR_ORDER.iter().position(|s| *s == sensor)?;
        Some(&self.params[slot])
    }
}

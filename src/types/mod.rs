//! Core types for sensor data representation.
//!
//! - [`ChannelType`] and [`SensorGroup`] describe what the device measures
//! - [`DataPacket`] is one decoded sample
//! - [`FirmwareCapabilities`] captures what the connected firmware can do
//! - [`ExgRegister`] decodes the analog front-end configuration blocks
//! - [`AllCalibration`] holds the factory calibration of the inertial sensors

pub mod calibration;
pub mod channel;
pub mod exg;
pub mod firmware;
pub mod packet;

pub use calibration::{
    ALL_CALIBRATION_LEN, AllCalibration, CALIBRATION_SENSOR_LEN, TriaxcalParams,
};
pub use channel::{
    ChannelType, SENSOR_BITFIELD_LEN, SensorGroup, deserialize_sensors, enabled_channels,
    serialize_sensors, sort_sensors,
};
pub use exg::{EXG_REGISTER_LEN, ExgMux, ExgRegister, ExgRldLead, RldRef, exg_chip_and_channel};
pub use firmware::{FirmwareCapabilities, FirmwareType, FirmwareVersion, HardwareVersion};
pub use packet::{DataPacket, record_len};

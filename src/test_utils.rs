//! Helpers for assembling synthetic device data in tests.

use std::sync::Once;

use crate::codec;
use crate::recording::format::{
    CLOCK_DIFF_OFFSET, DATA_OFFSET, ENABLED_SENSORS_OFFSET, SAMPLING_RATE_OFFSET,
    START_TIMESTAMP_OFFSET, TRIAL_CONFIG_MASTER, TRIAL_CONFIG_OFFSET, TRIAL_CONFIG_SYNC,
};
use crate::types::channel::{
    ChannelType, SENSOR_BITFIELD_LEN, SensorGroup, enabled_channels, serialize_sensors,
};

static TRACING: Once = Once::new();

/// Routes driver logs into the test harness, filtered by `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Builds recording file images byte by byte.
///
/// The header is filled from the builder's configuration, everything pushed
/// through [`push_record`](Self::push_record) and
/// [`push_sync_offset`](Self::push_sync_offset) lands verbatim in the data
/// region. Callers are responsible for block geometry; records shorter than
/// a full block simply end the file early.
pub struct RecordingBuilder {
    divider: u16,
    sensors: Vec<SensorGroup>,
    channels: Vec<ChannelType>,
    trial_config: u16,
    clock_diff: u64,
    start_timestamp: u64,
    data: Vec<u8>,
}

impl RecordingBuilder {
    pub fn new(divider: u16, sensors: &[SensorGroup]) -> Self {
        let mut channels = vec![ChannelType::Timestamp];
        channels.extend(enabled_channels(sensors));
        Self {
            divider,
            sensors: sensors.to_vec(),
            channels,
            trial_config: 0,
            clock_diff: 0,
            start_timestamp: 0,
            data: Vec::new(),
        }
    }

    pub fn with_sync(mut self, master: bool) -> Self {
        self.trial_config |= TRIAL_CONFIG_SYNC;
        if master {
            self.trial_config |= TRIAL_CONFIG_MASTER;
        }
        self
    }

    pub fn with_clock_diff(mut self, diff: u64) -> Self {
        self.clock_diff = diff;
        self
    }

    pub fn with_start_timestamp(mut self, ticks: u64) -> Self {
        self.start_timestamp = ticks;
        self
    }

    /// Appends one sample record. `values` must match the channel layout,
    /// timestamp first.
    pub fn push_record(&mut self, values: &[i64]) {
        assert_eq!(values.len(), self.channels.len(), "value count must match channel layout");
        for (channel, value) in self.channels.iter().zip(values) {
            let encoding = channel.encoding().unwrap();
            self.data.extend(codec::encode_int(*value, encoding).unwrap());
        }
    }

    /// Appends a 9-byte sync prefix. `None` writes the all-ones marker for
    /// a block without a recorded offset.
    pub fn push_sync_offset(&mut self, offset: Option<i64>) {
        match offset {
            Some(offset) => {
                self.data.push(if offset < 0 { 1 } else { 0 });
                self.data.extend(offset.unsigned_abs().to_le_bytes());
            }
            None => {
                self.data.push(0);
                self.data.extend(u64::MAX.to_le_bytes());
            }
        }
    }

    pub fn build(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; DATA_OFFSET];

        bytes[SAMPLING_RATE_OFFSET..SAMPLING_RATE_OFFSET + 2]
            .copy_from_slice(&self.divider.to_le_bytes());
        bytes[ENABLED_SENSORS_OFFSET..ENABLED_SENSORS_OFFSET + SENSOR_BITFIELD_LEN]
            .copy_from_slice(&serialize_sensors(&self.sensors));
        bytes[TRIAL_CONFIG_OFFSET..TRIAL_CONFIG_OFFSET + 2]
            .copy_from_slice(&self.trial_config.to_le_bytes());
        bytes[CLOCK_DIFF_OFFSET..CLOCK_DIFF_OFFSET + 8]
            .copy_from_slice(&self.clock_diff.to_be_bytes());

        // Most significant byte first, the low four bytes little endian
        bytes[START_TIMESTAMP_OFFSET] = (self.start_timestamp >> 32) as u8;
        bytes[START_TIMESTAMP_OFFSET + 1..START_TIMESTAMP_OFFSET + 5]
            .copy_from_slice(&(self.start_timestamp as u32).to_le_bytes());

        bytes.extend_from_slice(&self.data);
        bytes
    }
}

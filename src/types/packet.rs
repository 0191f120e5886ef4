//! Decoded data samples.

use crate::codec;
use crate::error::{DriverError, Result};
use crate::types::channel::ChannelType;

/// Total byte length of one sample record for the given channel layout.
///
/// Fails with a protocol error when the layout contains a channel current
/// firmware cannot stream.
pub fn record_len(layout: &[ChannelType]) -> Result<usize> {
    let mut len = 0;
    for ch in layout {
        let encoding = ch
            .encoding()
            .ok_or_else(|| DriverError::protocol(format!("channel {ch:?} is not streamable")))?;
        len += encoding.width;
    }
    Ok(len)
}

/// One decoded sample: an ordered channel-to-value mapping.
///
/// The key order mirrors the active channel configuration, with the device
/// timestamp first when streaming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    values: Vec<(ChannelType, i64)>,
}

impl DataPacket {
    /// Decodes a raw sample record against the active channel layout.
    ///
    /// The record length must match [`record_len`] for the layout exactly.
    pub fn decode(raw: &[u8], layout: &[ChannelType]) -> Result<Self> {
        let expected = record_len(layout)?;
        if raw.len() != expected {
            return Err(DriverError::protocol(format!(
                "sample record is {} bytes, layout requires {expected}",
                raw.len()
            )));
        }

        let mut values = Vec::with_capacity(layout.len());
        let mut offset = 0;
        for ch in layout {
            // record_len already proved every channel has an encoding
            let Some(encoding) = ch.encoding() else {
                return Err(DriverError::protocol(format!("channel {ch:?} is not streamable")));
            };
            let span = &raw[offset..offset + encoding.width];
            values.push((*ch, codec::decode_int(span, encoding)?));
            offset += encoding.width;
        }
        Ok(Self { values })
    }

    /// Value for `channel`, if it is part of this sample.
    pub fn get(&self, channel: ChannelType) -> Option<i64> {
        self.values.iter().find(|(ch, _)| *ch == channel).map(|(_, v)| *v)
    }

    /// Channels of this sample in record order.
    pub fn channels(&self) -> impl Iterator<Item = ChannelType> + '_ {
        self.values.iter().map(|(ch, _)| *ch)
    }

    /// Channel/value pairs in record order.
    pub fn iter(&self) -> impl Iterator<Item = (ChannelType, i64)> + '_ {
        self.values.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYOUT: [ChannelType; 3] =
        [ChannelType::Timestamp, ChannelType::AccelLnX, ChannelType::GyroX];

    #[test]
    fn record_len_sums_channel_widths() {
        // 3-byte timestamp + 2-byte accel + 2-byte gyro
        assert_eq!(record_len(&LAYOUT).unwrap(), 7);
    }

    #[test]
    fn record_len_rejects_unstreamable_channels() {
        assert!(record_len(&[ChannelType::AccelHgX]).is_err());
    }

    #[test]
    fn decode_preserves_order_and_values() {
        // timestamp 0x030201 LE, accel -2 LE, gyro 0x0102 BE
        let raw = [0x01, 0x02, 0x03, 0xFE, 0xFF, 0x01, 0x02];
        let packet = DataPacket::decode(&raw, &LAYOUT).unwrap();

        assert_eq!(packet.get(ChannelType::Timestamp), Some(0x030201));
        assert_eq!(packet.get(ChannelType::AccelLnX), Some(-2));
        assert_eq!(packet.get(ChannelType::GyroX), Some(0x0102));
        assert_eq!(packet.get(ChannelType::Vbatt), None);
        assert_eq!(packet.channels().collect::<Vec<_>>(), LAYOUT.to_vec());
    }

    #[test]
    fn decode_rejects_wrong_record_length() {
        let raw = [0x00; 6];
        assert!(DataPacket::decode(&raw, &LAYOUT).is_err());
    }
}

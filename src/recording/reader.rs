//! Loads a recording file into equal-length channel columns.
//!
//! Data is laid out in blocks after the header. Each block optionally starts
//! with a clock synchronization offset and then holds as many whole sample
//! records as fit the nominal block length. The file may end after any whole
//! record; ending inside a record or a sync prefix is a truncation error.

use std::path::Path;

use tracing::debug;

use crate::codec::{self, DEVICE_CLOCK_RATE};
use crate::error::{DriverError, Result};
use crate::types::channel::ChannelType;

use super::format::{DATA_OFFSET, RecordingHeader, SYNC_OFFSET_LEN};

/// Period of the 24-bit sample timestamp counter.
const TIMESTAMP_MODULUS: i64 = 1 << 24;
/// Magnitude marking a block without a recorded sync offset.
const SYNC_OFFSET_ABSENT: u64 = u64::MAX;

/// One clock correspondence captured during a synchronized trial.
///
/// `local` is a device clock value in ticks, `master` the reference clock
/// value in ticks observed at the same instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncAnchor {
    pub local: f64,
    pub master: f64,
}

/// Maps a local clock value onto the master clock.
///
/// Between two anchors the mapping is linear. Beyond the first or last
/// anchor the nearest segment's slope is extended. A single anchor shifts by
/// a constant offset; with no anchors the local clock is returned as is.
pub fn align_timestamp(anchors: &[SyncAnchor], local: f64) -> f64 {
    match anchors {
        [] => local,
        [only] => local + (only.master - only.local),
        _ => {
            let last = anchors.len() - 2;
            let seg = anchors
                .windows(2)
                .position(|pair| local <= pair[1].local)
                .unwrap_or(last);
            let (a, b) = (&anchors[seg], &anchors[seg + 1]);
            let span = b.local - a.local;
            if span == 0.0 {
                return local + (a.master - a.local);
            }
            a.master + (local - a.local) * (b.master - a.master) / span
        }
    }
}

/// A fully decoded recording file.
///
/// All channel columns and both timestamp columns have the same length.
#[derive(Debug)]
pub struct Recording {
    header: RecordingHeader,
    columns: Vec<(ChannelType, Vec<i64>)>,
    local_timestamps: Vec<f64>,
    timestamps: Vec<f64>,
    anchors: Vec<SyncAnchor>,
}

impl Recording {
    /// Reads and decodes the recording at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|err| DriverError::file_error(path.to_path_buf(), err))?;
        Self::from_bytes(&bytes)
    }

    /// Decodes a recording already held in memory.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header = RecordingHeader::parse(bytes)?;
        let layout = header.channels().to_vec();
        let record_len = header.record_len();
        let (samples_per_block, _) = header.block_geometry();

        let mut columns: Vec<Vec<i64>> = vec![Vec::new(); layout.len()];
        let mut raw_anchors: Vec<(usize, i64)> = Vec::new();
        let mut cursor = DATA_OFFSET;

        'blocks: while cursor < bytes.len() {
            if header.has_sync() {
                let remaining = bytes.len() - cursor;
                if remaining < SYNC_OFFSET_LEN {
                    return Err(DriverError::TruncatedFile {
                        expected: SYNC_OFFSET_LEN,
                        got: remaining,
                    });
                }
                let sample_index = columns[0].len();
                if let Some(offset) =
                    decode_sync_offset(&bytes[cursor..cursor + SYNC_OFFSET_LEN])?
                {
                    raw_anchors.push((sample_index, offset));
                }
                cursor += SYNC_OFFSET_LEN;
            }

            for _ in 0..samples_per_block {
                let remaining = bytes.len() - cursor;
                if remaining == 0 {
                    break 'blocks;
                }
                if remaining < record_len {
                    return Err(DriverError::TruncatedFile { expected: record_len, got: remaining });
                }
                let mut field = cursor;
                for (channel, column) in layout.iter().zip(columns.iter_mut()) {
                    // Unstreamable channels were rejected during header parse
                    let encoding = channel.encoding().ok_or_else(|| {
                        DriverError::malformed_file(
                            "data",
                            format!("channel {channel:?} has no wire encoding"),
                        )
                    })?;
                    column.push(codec::decode_int(
                        &bytes[field..field + encoding.width],
                        encoding,
                    )?);
                    field += encoding.width;
                }
                cursor += record_len;
            }
        }

        let mut ticks = columns.remove(0);
        let anchors = rebase_timestamps(&header, &mut ticks, &raw_anchors);

        let local_timestamps: Vec<f64> =
            ticks.iter().map(|&t| t as f64 / DEVICE_CLOCK_RATE).collect();
        let mut timestamps: Vec<f64> = ticks
            .iter()
            .map(|&t| align_timestamp(&anchors, t as f64) / DEVICE_CLOCK_RATE)
            .collect();
        // The master column is non-decreasing. An anchor whose offset jump
        // exceeds the local tick span to its predecessor would pull aligned
        // samples backwards; clamp those to the previous sample.
        for i in 1..timestamps.len() {
            if timestamps[i] < timestamps[i - 1] {
                timestamps[i] = timestamps[i - 1];
            }
        }

        debug!(
            samples = local_timestamps.len(),
            channels = layout.len() - 1,
            anchors = anchors.len(),
            "decoded recording"
        );

        let columns = layout.into_iter().skip(1).zip(columns).collect();
        Ok(Self { header, columns, local_timestamps, timestamps, anchors })
    }

    pub fn header(&self) -> &RecordingHeader {
        &self.header
    }

    /// Number of samples per column.
    pub fn len(&self) -> usize {
        self.local_timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.local_timestamps.is_empty()
    }

    /// Data channels in record order, timestamp excluded.
    pub fn channels(&self) -> impl Iterator<Item = ChannelType> + '_ {
        self.columns.iter().map(|(channel, _)| *channel)
    }

    /// Raw values of `channel`, or `None` when it was not recorded.
    pub fn column(&self, channel: ChannelType) -> Option<&[i64]> {
        self.columns
            .iter()
            .find(|(c, _)| *c == channel)
            .map(|(_, values)| values.as_slice())
    }

    /// Sample times in seconds on the device's own clock.
    ///
    /// The device's sampling loop starts with its timer already armed, so
    /// the gap between the first two samples can differ from the nominal
    /// sampling interval. Later samples are evenly spaced.
    pub fn local_timestamps(&self) -> &[f64] {
        &self.local_timestamps
    }

    /// Sample times in seconds, aligned to the trial's master clock.
    ///
    /// Identical to [`local_timestamps`](Self::local_timestamps) when the
    /// trial recorded no synchronization offsets. The column never steps
    /// backwards, even when consecutive sync anchors disagree.
    pub fn timestamps(&self) -> &[f64] {
        &self.timestamps
    }

    /// Clock correspondences recovered from the file, in tick units.
    pub fn sync_anchors(&self) -> &[SyncAnchor] {
        &self.anchors
    }
}

/// Lifts the wrapping 24-bit sample counter onto the device's boot clock and
/// converts per-block sync offsets into absolute anchors.
fn rebase_timestamps(
    header: &RecordingHeader,
    ticks: &mut [i64],
    raw_anchors: &[(usize, i64)],
) -> Vec<SyncAnchor> {
    codec::unwrap_counter(ticks, TIMESTAMP_MODULUS);

    let first = match ticks.first() {
        Some(v) => *v,
        None => return Vec::new(),
    };
    let mut shift = header.start_timestamp() as i64 - first;
    if header.has_global_clock() {
        shift += header.global_clock_diff() as i64;
    }
    for t in ticks.iter_mut() {
        *t += shift;
    }

    raw_anchors
        .iter()
        .filter(|(index, _)| *index < ticks.len())
        .map(|&(index, offset)| {
            let local = ticks[index] as f64;
            SyncAnchor { local, master: local - offset as f64 }
        })
        .collect()
}

/// Decodes one 9-byte sync prefix.
///
/// The leading byte carries the sign, the remaining 8 bytes the magnitude in
/// little endian. An all-ones magnitude means the block recorded no offset.
fn decode_sync_offset(raw: &[u8]) -> Result<Option<i64>> {
    let sign = match raw[0] {
        0 => 1i64,
        1 => -1i64,
        other => {
            return Err(DriverError::malformed_file(
                "sync offset",
                format!("invalid sign byte {other:#04x}"),
            ));
        }
    };
    let mut magnitude_bytes = [0u8; 8];
    magnitude_bytes.copy_from_slice(&raw[1..SYNC_OFFSET_LEN]);
    let magnitude = u64::from_le_bytes(magnitude_bytes);
    if magnitude == SYNC_OFFSET_ABSENT {
        return Ok(None);
    }
    Ok(Some(sign * magnitude as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RecordingBuilder;
    use crate::types::channel::SensorGroup;

    #[test]
    fn alignment_interpolates_between_anchors() {
        let anchors = [
            SyncAnchor { local: 0.0, master: 1000.0 },
            SyncAnchor { local: 100.0, master: 1100.0 },
        ];
        assert_eq!(align_timestamp(&anchors, 50.0), 1050.0);
        assert_eq!(align_timestamp(&anchors, 0.0), 1000.0);
        assert_eq!(align_timestamp(&anchors, 100.0), 1100.0);
    }

    #[test]
    fn alignment_extrapolates_with_nearest_segment() {
        let anchors = [
            SyncAnchor { local: 0.0, master: 1000.0 },
            SyncAnchor { local: 100.0, master: 1100.0 },
            SyncAnchor { local: 200.0, master: 1400.0 },
        ];
        // first segment slope 1.0
        assert_eq!(align_timestamp(&anchors, -50.0), 950.0);
        // last segment slope 3.0
        assert_eq!(align_timestamp(&anchors, 300.0), 1700.0);
    }

    #[test]
    fn alignment_with_one_anchor_is_a_constant_shift() {
        let anchors = [SyncAnchor { local: 10.0, master: 40.0 }];
        assert_eq!(align_timestamp(&anchors, 0.0), 30.0);
        assert_eq!(align_timestamp(&anchors, 10.0), 40.0);
    }

    #[test]
    fn alignment_without_anchors_is_identity() {
        assert_eq!(align_timestamp(&[], 123.0), 123.0);
    }

    #[test]
    fn decodes_columns_of_equal_length() {
        let mut builder = RecordingBuilder::new(64, &[SensorGroup::AccelLn]);
        for i in 0..3i64 {
            builder.push_record(&[100 + i * 64, i, 10 + i, 20 + i]);
        }
        let recording = Recording::from_bytes(&builder.build()).unwrap();

        assert_eq!(recording.len(), 3);
        assert_eq!(recording.channels().count(), 3);
        assert_eq!(recording.column(ChannelType::AccelLnX).unwrap(), &[0, 1, 2]);
        assert_eq!(recording.column(ChannelType::AccelLnY).unwrap(), &[10, 11, 12]);
        assert_eq!(recording.column(ChannelType::AccelLnZ).unwrap(), &[20, 21, 22]);
        assert!(recording.column(ChannelType::GyroX).is_none());
        assert_eq!(recording.timestamps().len(), 3);
        assert_eq!(recording.local_timestamps().len(), 3);
    }

    #[test]
    fn timestamps_are_rebased_onto_the_boot_clock() {
        let mut builder =
            RecordingBuilder::new(64, &[SensorGroup::AccelLn]).with_start_timestamp(1000);
        builder.push_record(&[1000, 0, 0, 0]);
        builder.push_record(&[1064, 0, 0, 0]);
        builder.push_record(&[1128, 0, 0, 0]);
        let recording = Recording::from_bytes(&builder.build()).unwrap();

        let expected: Vec<f64> =
            [1000u64, 1064, 1128].iter().map(|&t| t as f64 / DEVICE_CLOCK_RATE).collect();
        assert_eq!(recording.local_timestamps(), expected.as_slice());
        // no sync, master equals local
        assert_eq!(recording.timestamps(), expected.as_slice());
    }

    #[test]
    fn timestamp_counter_wrap_is_unwrapped() {
        let top = TIMESTAMP_MODULUS - 32;
        let mut builder = RecordingBuilder::new(64, &[SensorGroup::AccelLn])
            .with_start_timestamp(top as u64);
        builder.push_record(&[top, 0, 0, 0]);
        builder.push_record(&[32, 0, 0, 0]);
        let recording = Recording::from_bytes(&builder.build()).unwrap();

        let ts = recording.local_timestamps();
        let delta = (ts[1] - ts[0]) * DEVICE_CLOCK_RATE;
        assert!((delta - 64.0).abs() < 1e-6);
    }

    #[test]
    fn global_clock_difference_shifts_all_samples() {
        let mut builder = RecordingBuilder::new(64, &[SensorGroup::AccelLn])
            .with_start_timestamp(0)
            .with_clock_diff(32768);
        builder.push_record(&[0, 0, 0, 0]);
        let recording = Recording::from_bytes(&builder.build()).unwrap();

        assert!((recording.local_timestamps()[0] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn sync_offsets_become_anchors_and_align_timestamps() {
        let mut builder = RecordingBuilder::new(64, &[SensorGroup::AccelLn])
            .with_sync(false)
            .with_start_timestamp(0);
        // device runs 100 ticks ahead of the master clock
        builder.push_sync_offset(Some(100));
        builder.push_record(&[0, 0, 0, 0]);
        builder.push_record(&[64, 0, 0, 0]);
        let recording = Recording::from_bytes(&builder.build()).unwrap();

        assert_eq!(recording.sync_anchors().len(), 1);
        let anchor = recording.sync_anchors()[0];
        assert_eq!(anchor.local, 0.0);
        assert_eq!(anchor.master, -100.0);

        let aligned = recording.timestamps();
        assert!((aligned[0] - (-100.0 / DEVICE_CLOCK_RATE)).abs() < 1e-9);
        assert!((aligned[1] - (-36.0 / DEVICE_CLOCK_RATE)).abs() < 1e-9);
    }

    #[test]
    fn master_timestamps_never_step_backwards() {
        let mut builder = RecordingBuilder::new(64, &[SensorGroup::AccelLn])
            .with_sync(false)
            .with_start_timestamp(0);
        // first block: device and master in step
        builder.push_sync_offset(Some(0));
        for i in 0..55i64 {
            builder.push_record(&[i * 64, 0, 0, 0]);
        }
        // second block: the offset jumps by far more than the tick span
        // between the two anchors
        builder.push_sync_offset(Some(100_000));
        for i in 55..58i64 {
            builder.push_record(&[i * 64, 0, 0, 0]);
        }
        let recording = Recording::from_bytes(&builder.build()).unwrap();

        assert_eq!(recording.sync_anchors().len(), 2);
        let aligned = recording.timestamps();
        assert_eq!(aligned.len(), 58);
        for pair in aligned.windows(2) {
            assert!(
                pair[1] >= pair[0],
                "master timestamps decreased: {} -> {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn absent_sync_offsets_are_skipped() {
        let mut builder = RecordingBuilder::new(64, &[SensorGroup::AccelLn])
            .with_sync(false)
            .with_start_timestamp(0);
        builder.push_sync_offset(None);
        builder.push_record(&[0, 0, 0, 0]);
        let recording = Recording::from_bytes(&builder.build()).unwrap();

        assert!(recording.sync_anchors().is_empty());
        assert_eq!(recording.timestamps(), recording.local_timestamps());
    }

    #[test]
    fn partial_trailing_record_is_a_truncation_error() {
        let mut builder = RecordingBuilder::new(64, &[SensorGroup::AccelLn]);
        builder.push_record(&[0, 0, 0, 0]);
        let mut bytes = builder.build();
        // chop the last record short by one byte and append it again
        let record = bytes[bytes.len() - 9..].to_vec();
        bytes.extend_from_slice(&record[..8]);

        let err = Recording::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, DriverError::TruncatedFile { expected: 9, got: 8 }));
    }

    #[test]
    fn partial_sync_prefix_is_a_truncation_error() {
        let mut builder =
            RecordingBuilder::new(64, &[SensorGroup::AccelLn]).with_sync(false);
        builder.push_sync_offset(Some(0));
        let mut bytes = builder.build();
        bytes.truncate(bytes.len() - 2);

        let err = Recording::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, DriverError::TruncatedFile { expected: 9, got: 7 }));
    }

    #[test]
    fn empty_data_region_yields_an_empty_recording() {
        let bytes = RecordingBuilder::new(64, &[SensorGroup::AccelLn]).build();
        let recording = Recording::from_bytes(&bytes).unwrap();
        assert!(recording.is_empty());
        assert_eq!(recording.len(), 0);
    }

    #[test]
    fn records_spanning_multiple_blocks_are_read_back_to_back() {
        let mut builder = RecordingBuilder::new(64, &[SensorGroup::AccelLn]);
        // 56 records fill one block, 4 spill into the next
        for i in 0..60i64 {
            builder.push_record(&[i * 64, i, i, i]);
        }
        let recording = Recording::from_bytes(&builder.build()).unwrap();
        assert_eq!(recording.len(), 60);
        let xs: Vec<i64> = (0..60).collect();
        assert_eq!(recording.column(ChannelType::AccelLnX).unwrap(), xs.as_slice());
    }

    #[test]
    fn invalid_sync_sign_byte_is_malformed() {
        let mut builder =
            RecordingBuilder::new(64, &[SensorGroup::AccelLn]).with_sync(false);
        builder.push_sync_offset(Some(0));
        builder.push_record(&[0, 0, 0, 0]);
        let mut bytes = builder.build();
        bytes[DATA_OFFSET] = 7;

        let err = Recording::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, DriverError::MalformedFile { .. }));
    }
}

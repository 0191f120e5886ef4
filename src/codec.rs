//! Fixed-width integer codec and device clock conversions.
//!
//! Sensor values travel the wire as 1, 2 or 3 byte integers in either byte
//! order and either signedness. [`decode_int`] is total over any correctly
//! sized span; [`encode_int`] rejects values that do not fit their target
//! encoding instead of truncating silently.

use crate::error::{DriverError, Result};

/// Ticks per second of the device's real-time clock crystal.
pub const DEVICE_CLOCK_RATE: f64 = 32768.0;

/// Byte order of a wire integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ByteOrder {
    Little,
    Big,
}

/// Wire encoding of a single channel value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ChannelEncoding {
    /// Width in bytes, 1 to 3.
    pub width: usize,
    /// Two's-complement when set.
    pub signed: bool,
    pub order: ByteOrder,
}

impl ChannelEncoding {
    pub const fn new(width: usize, signed: bool, order: ByteOrder) -> Self {
        Self { width, signed, order }
    }
}

/// Widest integer the protocol carries, in bytes.
const MAX_WIDTH: usize = 3;

fn check_width(width: usize) -> Result<()> {
    if width == 0 || width > MAX_WIDTH {
        return Err(DriverError::protocol(format!(
            "unsupported channel width {width}, must be 1 to {MAX_WIDTH}"
        )));
    }
    Ok(())
}

/// Decodes a fixed-width integer from `bytes`.
///
/// `bytes` must be exactly `encoding.width` long. Signed values are
/// sign-extended from the declared width, so a 3-byte signed span decodes to
/// the full negative range of `i64`.
pub fn decode_int(bytes: &[u8], encoding: ChannelEncoding) -> Result<i64> {
    check_width(encoding.width)?;
    if bytes.len() != encoding.width {
        return Err(DriverError::protocol(format!(
            "expected {} bytes for channel value, got {}",
            encoding.width,
            bytes.len()
        )));
    }

    let mut raw: u64 = 0;
    match encoding.order {
        ByteOrder::Little => {
            for (i, b) in bytes.iter().enumerate() {
                raw |= (*b as u64) << (8 * i);
            }
        }
        ByteOrder::Big => {
            for b in bytes {
                raw = (raw << 8) | *b as u64;
            }
        }
    }

    if encoding.signed {
        let bits = 8 * encoding.width as u32;
        let sign_bit = 1u64 << (bits - 1);
        if raw & sign_bit != 0 {
            raw |= u64::MAX << bits;
        }
        Ok(raw as i64)
    } else {
        Ok(raw as i64)
    }
}

/// Encodes `value` into exactly `encoding.width` bytes.
///
/// Returns [`DriverError::Range`] when the value does not fit the declared
/// width and signedness.
pub fn encode_int(value: i64, encoding: ChannelEncoding) -> Result<Vec<u8>> {
    check_width(encoding.width)?;
    let bits = 8 * encoding.width as u32;
    let fits = if encoding.signed {
        let min = -(1i64 << (bits - 1));
        let max = (1i64 << (bits - 1)) - 1;
        (min..=max).contains(&value)
    } else {
        let max = (1i64 << bits) - 1;
        (0..=max).contains(&value)
    };
    if !fits {
        return Err(DriverError::range(value, encoding.width, encoding.signed));
    }

    let raw = value as u64;
    let mut out = Vec::with_capacity(encoding.width);
    match encoding.order {
        ByteOrder::Little => {
            for i in 0..encoding.width {
                out.push((raw >> (8 * i)) as u8);
            }
        }
        ByteOrder::Big => {
            for i in (0..encoding.width).rev() {
                out.push((raw >> (8 * i)) as u8);
            }
        }
    }
    Ok(out)
}

/// Converts device clock ticks to seconds.
pub fn ticks_to_secs(ticks: u64) -> f64 {
    ticks as f64 / DEVICE_CLOCK_RATE
}

/// Converts seconds to device clock ticks, rounding to the nearest tick.
pub fn secs_to_ticks(secs: f64) -> u64 {
    (secs * DEVICE_CLOCK_RATE).round() as u64
}

/// Converts the on-wire sampling clock divider to a rate in Hz.
///
/// The device stores the sampling rate as the number of clock ticks between
/// samples. A divider of zero means sampling is disabled and maps to 0 Hz.
pub fn divider_to_rate(divider: u16) -> f64 {
    if divider == 0 { 0.0 } else { DEVICE_CLOCK_RATE / divider as f64 }
}

/// Converts a sampling rate in Hz to the nearest representable clock divider.
pub fn rate_to_divider(rate: f64) -> Result<u16> {
    if !rate.is_finite() || rate <= 0.0 {
        return Err(DriverError::protocol(format!("invalid sampling rate {rate} Hz")));
    }
    let divider = (DEVICE_CLOCK_RATE / rate).round();
    if !(1.0..=u16::MAX as f64).contains(&divider) {
        return Err(DriverError::range(divider as i64, 2, false));
    }
    Ok(divider as u16)
}

/// Unwraps a wrapping counter series in place.
///
/// Each time the raw counter steps backwards, one full period of `modulus`
/// is added to it and every later value. Used for the 24-bit timestamp
/// column of recording files.
pub fn unwrap_counter(series: &mut [i64], modulus: i64) {
    let mut offset = 0i64;
    let mut prev_raw = match series.first() {
        Some(v) => *v,
        None => return,
    };
    for value in series.iter_mut() {
        let raw = *value;
        if raw < prev_raw {
            offset += modulus;
        }
        prev_raw = raw;
        *value = raw + offset;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const U16_LE: ChannelEncoding = ChannelEncoding::new(2, false, ByteOrder::Little);
    const I16_BE: ChannelEncoding = ChannelEncoding::new(2, true, ByteOrder::Big);
    const I24_BE: ChannelEncoding = ChannelEncoding::new(3, true, ByteOrder::Big);
    const U24_LE: ChannelEncoding = ChannelEncoding::new(3, false, ByteOrder::Little);

    #[test]
    fn decode_unsigned_little_endian() {
        assert_eq!(decode_int(&[0x34, 0x12], U16_LE).unwrap(), 0x1234);
        assert_eq!(decode_int(&[0x01, 0x02, 0x03], U24_LE).unwrap(), 0x030201);
    }

    #[test]
    fn decode_signed_big_endian_sign_extends() {
        assert_eq!(decode_int(&[0xFF, 0xFF], I16_BE).unwrap(), -1);
        assert_eq!(decode_int(&[0x80, 0x00, 0x00], I24_BE).unwrap(), -(1 << 23));
        assert_eq!(decode_int(&[0x7F, 0xFF, 0xFF], I24_BE).unwrap(), (1 << 23) - 1);
    }

    #[test]
    fn decode_rejects_wrong_span_length() {
        assert!(decode_int(&[0x00], U16_LE).is_err());
        assert!(decode_int(&[0x00, 0x00, 0x00], U16_LE).is_err());
    }

    #[test]
    fn rejects_widths_outside_the_protocol() {
        let zero = ChannelEncoding::new(0, false, ByteOrder::Little);
        let wide = ChannelEncoding::new(8, true, ByteOrder::Little);

        assert!(matches!(decode_int(&[], zero).unwrap_err(), DriverError::Protocol { .. }));
        assert!(matches!(decode_int(&[0u8; 8], wide).unwrap_err(), DriverError::Protocol { .. }));
        assert!(matches!(encode_int(0, zero).unwrap_err(), DriverError::Protocol { .. }));
        assert!(matches!(encode_int(1, wide).unwrap_err(), DriverError::Protocol { .. }));
    }

    #[test]
    fn encode_rejects_out_of_range_values() {
        let err = encode_int(0x1_0000, U16_LE).unwrap_err();
        assert!(matches!(err, DriverError::Range { value: 0x1_0000, width: 2, signed: false }));

        assert!(encode_int(-1, U16_LE).is_err());
        assert!(encode_int(1 << 23, I24_BE).is_err());
        assert!(encode_int(-(1 << 23) - 1, I24_BE).is_err());
    }

    #[test]
    fn encode_produces_declared_byte_order() {
        assert_eq!(encode_int(0x1234, U16_LE).unwrap(), vec![0x34, 0x12]);
        assert_eq!(encode_int(-2, I16_BE).unwrap(), vec![0xFF, 0xFE]);
    }

    #[test]
    fn clock_conversions() {
        assert_eq!(secs_to_ticks(1.0), 32768);
        assert!((ticks_to_secs(32768) - 1.0).abs() < f64::EPSILON);
        assert!((divider_to_rate(64) - 512.0).abs() < f64::EPSILON);
        assert_eq!(rate_to_divider(512.0).unwrap(), 64);
        assert!(rate_to_divider(0.0).is_err());
        assert!(rate_to_divider(f64::INFINITY).is_err());
    }

    #[test]
    fn counter_unwrap_adds_one_period_per_wrap() {
        let mut series = vec![100, 200, 50, 60, 10];
        unwrap_counter(&mut series, 256);
        assert_eq!(series, vec![100, 200, 306, 316, 522]);
    }

    #[test]
    fn counter_unwrap_handles_empty_and_monotonic_input() {
        let mut empty: Vec<i64> = vec![];
        unwrap_counter(&mut empty, 256);
        assert!(empty.is_empty());

        let mut flat = vec![1, 2, 3];
        unwrap_counter(&mut flat, 256);
        assert_eq!(flat, vec![1, 2, 3]);
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        fn arb_encoding() -> impl Strategy<Value = ChannelEncoding> {
            (1usize..=3, any::<bool>(), prop_oneof![Just(ByteOrder::Little), Just(ByteOrder::Big)])
                .prop_map(|(width, signed, order)| ChannelEncoding::new(width, signed, order))
        }

        proptest! {
            #[test]
            fn round_trip_preserves_in_range_values(
                encoding in arb_encoding(),
                raw in proptest::num::i64::ANY
            ) {
                let bits = 8 * encoding.width as u32;
                let value = if encoding.signed {
                    let half = 1i64 << (bits - 1);
                    raw.rem_euclid(half * 2) - half
                } else {
                    raw.rem_euclid(1i64 << bits)
                };

                let bytes = encode_int(value, encoding).unwrap();
                prop_assert_eq!(bytes.len(), encoding.width);
                prop_assert_eq!(decode_int(&bytes, encoding).unwrap(), value);
            }

            #[test]
            fn decode_never_exceeds_declared_range(
                encoding in arb_encoding(),
                bytes in proptest::collection::vec(any::<u8>(), 1..=3)
            ) {
                prop_assume!(bytes.len() == encoding.width);
                let value = decode_int(&bytes, encoding).unwrap();
                let bits = 8 * encoding.width as u32;
                if encoding.signed {
                    let half = 1i64 << (bits - 1);
                    prop_assert!((-half..half).contains(&value));
                } else {
                    prop_assert!((0..(1i64 << bits)).contains(&value));
                }
            }
        }
    }
}

//! Wire framing for the Bluetooth link.
//!
//! The link carries three kinds of traffic interleaved on one byte stream:
//! one-byte acknowledgements, typed command responses, and raw data sample
//! records while streaming. Nothing on the wire is length-prefixed uniformly,
//! so the [`Deframer`] derives each frame's length from its leading opcode
//! and the caller-supplied [`FrameContext`].
//!
//! When the stream desynchronizes the deframer discards one byte at a time
//! until it finds a recognizable frame again. The number of consecutive
//! discards is bounded; exceeding it is a protocol error.

use tracing::{trace, warn};

use crate::error::{DriverError, Result};

/// Command and response opcodes of the Bluetooth protocol.
pub mod opcode {
    pub const DATA_PACKET: u8 = 0x00;
    pub const INQUIRY: u8 = 0x01;
    pub const INQUIRY_RESPONSE: u8 = 0x02;
    pub const GET_SAMPLING_RATE: u8 = 0x03;
    pub const SAMPLING_RATE_RESPONSE: u8 = 0x04;
    pub const SET_SAMPLING_RATE: u8 = 0x05;
    pub const START_STREAMING: u8 = 0x07;
    pub const SET_SENSORS: u8 = 0x08;
    pub const STOP_STREAMING: u8 = 0x20;
    pub const HARDWARE_VERSION_RESPONSE: u8 = 0x25;
    pub const GET_ALL_CALIBRATION: u8 = 0x2C;
    pub const ALL_CALIBRATION_RESPONSE: u8 = 0x2D;
    pub const GET_FW_VERSION: u8 = 0x2E;
    pub const FW_VERSION_RESPONSE: u8 = 0x2F;
    pub const GET_HARDWARE_VERSION: u8 = 0x3F;
    pub const SET_EXG_REGS: u8 = 0x61;
    pub const EXG_REGS_RESPONSE: u8 = 0x62;
    pub const GET_EXG_REGS: u8 = 0x63;
    pub const STATUS_RESPONSE: u8 = 0x71;
    pub const GET_STATUS: u8 = 0x72;
    pub const SET_DEVICE_NAME: u8 = 0x79;
    pub const DEVICE_NAME_RESPONSE: u8 = 0x7A;
    pub const GET_DEVICE_NAME: u8 = 0x7B;
    pub const SET_EXPERIMENT_ID: u8 = 0x7C;
    pub const EXPERIMENT_ID_RESPONSE: u8 = 0x7D;
    pub const GET_EXPERIMENT_ID: u8 = 0x7E;
    pub const SET_CONFIG_TIME: u8 = 0x85;
    pub const CONFIG_TIME_RESPONSE: u8 = 0x86;
    pub const GET_CONFIG_TIME: u8 = 0x87;
    pub const INSTREAM_RESPONSE: u8 = 0x8A;
    pub const SET_RTC: u8 = 0x8F;
    pub const RTC_RESPONSE: u8 = 0x90;
    pub const GET_RTC: u8 = 0x91;
    pub const START_LOGGING: u8 = 0x92;
    pub const STOP_LOGGING: u8 = 0x93;
    pub const BATTERY_RESPONSE: u8 = 0x94;
    pub const GET_BATTERY: u8 = 0x95;
    pub const PING: u8 = 0x96;
    pub const SET_STATUS_ACK: u8 = 0xA3;
    pub const ACK: u8 = 0xFF;
}

/// Maximum consecutive discarded bytes before resynchronization gives up.
pub const MAX_RESYNC_DISCARDS: usize = 64;

/// An outbound command: opcode byte followed by the raw argument bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    pub opcode: u8,
    pub payload: Vec<u8>,
}

impl CommandFrame {
    pub fn new(opcode: u8) -> Self {
        Self { opcode, payload: Vec::new() }
    }

    pub fn with_payload(opcode: u8, payload: Vec<u8>) -> Self {
        Self { opcode, payload }
    }

    /// Serializes the command for the wire. No padding, no checksum.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.payload.len());
        out.push(self.opcode);
        out.extend_from_slice(&self.payload);
        out
    }
}

/// One inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Command acknowledgement byte.
    Ack,
    /// A typed response. For in-stream responses `opcode` is the inner
    /// response opcode, not the in-stream marker.
    CommandResponse { opcode: u8, payload: Vec<u8> },
    /// Raw bytes of one streamed sample record, opcode stripped.
    DataSample(Vec<u8>),
}

/// Wire shape of a response payload, keyed by response opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseShape {
    /// Exactly this many payload bytes.
    Fixed(usize),
    /// One length byte followed by that many bytes.
    VarLen,
    /// Eight header bytes, with the trailing channel count at offset 6.
    Inquiry,
}

fn response_shape(opcode: u8) -> Option<ResponseShape> {
    match opcode {
        opcode::INQUIRY_RESPONSE => Some(ResponseShape::Inquiry),
        opcode::SAMPLING_RATE_RESPONSE => Some(ResponseShape::Fixed(2)),
        opcode::HARDWARE_VERSION_RESPONSE => Some(ResponseShape::Fixed(1)),
        opcode::ALL_CALIBRATION_RESPONSE => Some(ResponseShape::Fixed(84)),
        opcode::FW_VERSION_RESPONSE => Some(ResponseShape::Fixed(6)),
        opcode::EXG_REGS_RESPONSE => Some(ResponseShape::VarLen),
        opcode::STATUS_RESPONSE => Some(ResponseShape::Fixed(1)),
        opcode::DEVICE_NAME_RESPONSE => Some(ResponseShape::VarLen),
        opcode::EXPERIMENT_ID_RESPONSE => Some(ResponseShape::VarLen),
        opcode::CONFIG_TIME_RESPONSE => Some(ResponseShape::VarLen),
        opcode::RTC_RESPONSE => Some(ResponseShape::Fixed(8)),
        opcode::BATTERY_RESPONSE => Some(ResponseShape::Fixed(3)),
        _ => None,
    }
}

/// Per-call context the deframer cannot derive from the stream itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameContext {
    /// Byte length of one streamed sample record. `None` while the session
    /// is not streaming, in which case a data packet opcode is treated as
    /// noise and resynchronized over.
    pub sample_len: Option<usize>,
}

/// Incremental frame parser. Push bytes in, pull frames out.
#[derive(Debug, Default)]
pub struct Deframer {
    buf: Vec<u8>,
    discards: usize,
}

impl Deframer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw transport bytes to the internal buffer.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Discards all buffered bytes and resets the resynchronization counter.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.discards = 0;
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Extracts the next complete frame.
    ///
    /// Returns `Ok(None)` when the buffer holds only a frame prefix. Returns
    /// a protocol error when resynchronization discards more than
    /// [`MAX_RESYNC_DISCARDS`] bytes in a row; the caller should clear the
    /// deframer before continuing.
    pub fn next_frame(&mut self, ctx: &FrameContext) -> Result<Option<Frame>> {
        loop {
            let Some(&lead) = self.buf.first() else {
                return Ok(None);
            };

            match self.try_parse(lead, ctx)? {
                Parse::Complete(frame, consumed) => {
                    self.buf.drain(..consumed);
                    self.discards = 0;
                    trace!(?frame, consumed, "framed");
                    return Ok(Some(frame));
                }
                Parse::NeedMore => return Ok(None),
                Parse::Unrecognized => {
                    self.buf.remove(0);
                    self.discards += 1;
                    warn!(byte = lead, discards = self.discards, "discarding unrecognized byte");
                    if self.discards > MAX_RESYNC_DISCARDS {
                        return Err(DriverError::protocol(format!(
                            "failed to resynchronize after discarding {} bytes",
                            self.discards
                        )));
                    }
                }
            }
        }
    }

    fn try_parse(&self, lead: u8, ctx: &FrameContext) -> Result<Parse> {
        match lead {
            opcode::ACK => Ok(Parse::Complete(Frame::Ack, 1)),
            opcode::DATA_PACKET => {
                let Some(sample_len) = ctx.sample_len else {
                    // Not streaming, a lone zero byte is noise
                    return Ok(Parse::Unrecognized);
                };
                match self.payload_after(1, sample_len) {
                    Some(payload) => {
                        Ok(Parse::Complete(Frame::DataSample(payload.to_vec()), 1 + sample_len))
                    }
                    None => Ok(Parse::NeedMore),
                }
            }
            opcode::INSTREAM_RESPONSE => {
                let Some(&inner) = self.buf.get(1) else {
                    return Ok(Parse::NeedMore);
                };
                let Some(shape) = response_shape(inner) else {
                    return Ok(Parse::Unrecognized);
                };
                self.parse_response(inner, shape, 2)
            }
            other => match response_shape(other) {
                Some(shape) => self.parse_response(other, shape, 1),
                None => Ok(Parse::Unrecognized),
            },
        }
    }

    fn parse_response(&self, opcode: u8, shape: ResponseShape, header_len: usize) -> Result<Parse> {
        let payload_len = match shape {
            ResponseShape::Fixed(len) => len,
            ResponseShape::VarLen => {
                let Some(&len) = self.buf.get(header_len) else {
                    return Ok(Parse::NeedMore);
                };
                // length byte is part of the consumed span but not the payload
                match self.payload_after(header_len + 1, len as usize) {
                    Some(payload) => {
                        return Ok(Parse::Complete(
                            Frame::CommandResponse { opcode, payload: payload.to_vec() },
                            header_len + 1 + len as usize,
                        ));
                    }
                    None => return Ok(Parse::NeedMore),
                }
            }
            ResponseShape::Inquiry => {
                let Some(header) = self.payload_after(header_len, 8) else {
                    return Ok(Parse::NeedMore);
                };
                8 + header[6] as usize
            }
        };

        match self.payload_after(header_len, payload_len) {
            Some(payload) => Ok(Parse::Complete(
                Frame::CommandResponse { opcode, payload: payload.to_vec() },
                header_len + payload_len,
            )),
            None => Ok(Parse::NeedMore),
        }
    }

    fn payload_after(&self, offset: usize, len: usize) -> Option<&[u8]> {
        self.buf.get(offset..offset + len)
    }
}

enum Parse {
    Complete(Frame, usize),
    NeedMore,
    Unrecognized,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(deframer: &mut Deframer, ctx: &FrameContext) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = deframer.next_frame(ctx).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn parses_ack() {
        let mut deframer = Deframer::new();
        deframer.push_bytes(&[opcode::ACK]);
        assert_eq!(drain(&mut deframer, &FrameContext::default()), vec![Frame::Ack]);
        assert_eq!(deframer.buffered(), 0);
    }

    #[test]
    fn parses_fixed_width_response_across_pushes() {
        let ctx = FrameContext::default();
        let mut deframer = Deframer::new();

        deframer.push_bytes(&[opcode::SAMPLING_RATE_RESPONSE, 0x40]);
        assert_eq!(deframer.next_frame(&ctx).unwrap(), None);

        deframer.push_bytes(&[0x00]);
        assert_eq!(
            deframer.next_frame(&ctx).unwrap(),
            Some(Frame::CommandResponse {
                opcode: opcode::SAMPLING_RATE_RESPONSE,
                payload: vec![0x40, 0x00],
            })
        );
    }

    #[test]
    fn parses_var_len_response() {
        let ctx = FrameContext::default();
        let mut deframer = Deframer::new();
        deframer.push_bytes(&[opcode::DEVICE_NAME_RESPONSE, 3, b'd', b'e', b'v']);
        assert_eq!(
            deframer.next_frame(&ctx).unwrap(),
            Some(Frame::CommandResponse {
                opcode: opcode::DEVICE_NAME_RESPONSE,
                payload: b"dev".to_vec(),
            })
        );
    }

    #[test]
    fn parses_inquiry_with_trailing_channel_list() {
        let ctx = FrameContext::default();
        let mut deframer = Deframer::new();
        // sr=0x0040, ignored u32, 2 channels, buffer size 1, channel ids
        deframer
            .push_bytes(&[opcode::INQUIRY_RESPONSE, 0x40, 0x00, 0, 0, 0, 0, 2, 1, 0x00, 0x0A]);
        assert_eq!(
            deframer.next_frame(&ctx).unwrap(),
            Some(Frame::CommandResponse {
                opcode: opcode::INQUIRY_RESPONSE,
                payload: vec![0x40, 0x00, 0, 0, 0, 0, 2, 1, 0x00, 0x0A],
            })
        );
    }

    #[test]
    fn parses_instream_status_response() {
        let ctx = FrameContext::default();
        let mut deframer = Deframer::new();
        deframer.push_bytes(&[opcode::INSTREAM_RESPONSE, opcode::STATUS_RESPONSE, 0x05]);
        assert_eq!(
            deframer.next_frame(&ctx).unwrap(),
            Some(Frame::CommandResponse { opcode: opcode::STATUS_RESPONSE, payload: vec![0x05] })
        );
    }

    #[test]
    fn data_packets_require_streaming_context() {
        let mut deframer = Deframer::new();
        deframer.push_bytes(&[opcode::DATA_PACKET, 0x31, 0x32, 0x33, opcode::ACK]);

        // Without a sample length the zero byte and sample bytes are noise
        let frames = drain(&mut deframer, &FrameContext::default());
        assert_eq!(frames, vec![Frame::Ack]);

        let ctx = FrameContext { sample_len: Some(3) };
        deframer.push_bytes(&[opcode::DATA_PACKET, 0x01, 0x02, 0x03]);
        assert_eq!(
            deframer.next_frame(&ctx).unwrap(),
            Some(Frame::DataSample(vec![0x01, 0x02, 0x03]))
        );
    }

    #[test]
    fn resynchronizes_over_garbage() {
        let ctx = FrameContext::default();
        let mut deframer = Deframer::new();
        deframer.push_bytes(&[0x33, 0x44, 0x55, opcode::ACK]);
        assert_eq!(deframer.next_frame(&ctx).unwrap(), Some(Frame::Ack));
    }

    #[test]
    fn garbage_between_frames_does_not_break_later_frames() {
        let ctx = FrameContext::default();
        let mut deframer = Deframer::new();
        deframer.push_bytes(&[opcode::ACK, 0x33, 0x44, opcode::STATUS_RESPONSE, 0x01]);
        let frames = drain(&mut deframer, &ctx);
        assert_eq!(
            frames,
            vec![
                Frame::Ack,
                Frame::CommandResponse { opcode: opcode::STATUS_RESPONSE, payload: vec![0x01] },
            ]
        );
    }

    #[test]
    fn bounded_resynchronization_fails_with_protocol_error() {
        let ctx = FrameContext::default();
        let mut deframer = Deframer::new();
        deframer.push_bytes(&vec![0x42; MAX_RESYNC_DISCARDS + 2]);

        let err = deframer.next_frame(&ctx).unwrap_err();
        assert!(matches!(err, DriverError::Protocol { .. }));

        // Recovery path: clear, then parse normally again
        deframer.clear();
        deframer.push_bytes(&[opcode::ACK]);
        assert_eq!(deframer.next_frame(&ctx).unwrap(), Some(Frame::Ack));
    }

    #[test]
    fn successful_frame_resets_discard_budget() {
        let ctx = FrameContext::default();
        let mut deframer = Deframer::new();

        for _ in 0..3 {
            let mut chunk = vec![0x42; MAX_RESYNC_DISCARDS - 1];
            chunk.push(opcode::ACK);
            deframer.push_bytes(&chunk);
            assert_eq!(deframer.next_frame(&ctx).unwrap(), Some(Frame::Ack));
        }
    }

    #[test]
    fn command_frame_serializes_opcode_then_payload() {
        let frame = CommandFrame::with_payload(opcode::SET_SAMPLING_RATE, vec![0x40, 0x00]);
        assert_eq!(frame.to_bytes(), vec![opcode::SET_SAMPLING_RATE, 0x40, 0x00]);
        assert_eq!(CommandFrame::new(opcode::PING).to_bytes(), vec![opcode::PING]);
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn arbitrary_chunking_never_changes_framing(
                splits in proptest::collection::vec(1usize..5, 0..6)
            ) {
                let wire = vec![
                    opcode::ACK,
                    opcode::SAMPLING_RATE_RESPONSE, 0x40, 0x00,
                    opcode::INSTREAM_RESPONSE, opcode::STATUS_RESPONSE, 0x03,
                ];

                let ctx = FrameContext::default();
                let mut deframer = Deframer::new();
                let mut frames = Vec::new();
                let mut cursor = 0;

                for split in splits {
                    let end = (cursor + split).min(wire.len());
                    deframer.push_bytes(&wire[cursor..end]);
                    cursor = end;
                    while let Some(frame) = deframer.next_frame(&ctx).unwrap() {
                        frames.push(frame);
                    }
                }
                deframer.push_bytes(&wire[cursor..]);
                while let Some(frame) = deframer.next_frame(&ctx).unwrap() {
                    frames.push(frame);
                }

                prop_assert_eq!(frames, vec![
                    Frame::Ack,
                    Frame::CommandResponse {
                        opcode: opcode::SAMPLING_RATE_RESPONSE,
                        payload: vec![0x40, 0x00],
                    },
                    Frame::CommandResponse {
                        opcode: opcode::STATUS_RESPONSE,
                        payload: vec![0x03],
                    },
                ]);
            }
        }
    }
}

use std::fmt::{Debug, Formatter};
use std::ops::RangeInclusive;
use bytes::{Buf, BufMut, Bytes};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use crate::error::QuicError;
use crate::safe_converter::{PrecheckedCast, SafeCast};

pub const FRAME_TYPE_PADDING: u8 = 0x00;
pub const FRAME_TYPE_CONNECTION_CLOSE: u8 = 0x02;
pub const FRAME_TYPE_PING: u8 = 0x07;
pub const FRAME_TYPE_ACK: u8 = 0xa0;
pub const FRAME_TYPE_STREAM: u8 = 0xc0;
pub const STREAM_FLAG_FIN: u8 = 0x20;

/// Number of bytes a value takes in the variable-length (LEB128) encoding
pub fn varint_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(7).max(1)
}

fn invalid_frame<E>(_: E) -> QuicError {
    QuicError::InvalidFrameData
}

#[derive(Clone, Eq, PartialEq)]
pub struct StreamFrame {
    pub stream_id: u32,
    pub offset: u64,
    pub data: Bytes,
    pub fin: bool,
}
impl Debug for StreamFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "STREAM({}@{}+{}{})", self.stream_id, self.offset, self.data.len(), if self.fin { ":FIN" } else { "" })
    }
}

impl StreamFrame {
    /// Serialized length of a stream frame's type byte and fields, excluding the data itself
    pub fn header_len(stream_id: u32, offset: u64, data_len: usize) -> usize {
        1
            + varint_len(u64::from(stream_id))
            + varint_len(offset)
            + varint_len(data_len.safe_cast())
    }

    pub fn end_offset(&self) -> Result<u64, QuicError> {
        let len: u64 = self.data.len().safe_cast();
        self.offset.checked_add(len)
            .ok_or(QuicError::InvalidStreamData)
    }

    fn encode(&self, buf: &mut impl BufMut) {
        let mut frame_type = FRAME_TYPE_STREAM;
        if self.fin {
            frame_type |= STREAM_FLAG_FIN;
        }
        buf.put_u8(frame_type);
        buf.put_u32_varint(self.stream_id);
        buf.put_u64_varint(self.offset);
        buf.put_u64_varint(self.data.len().safe_cast());
        buf.put_slice(&self.data);
    }

    fn decode(frame_type: u8, buf: &mut Bytes) -> Result<StreamFrame, QuicError> {
        if frame_type & !(FRAME_TYPE_STREAM | STREAM_FLAG_FIN) != 0 {
            return Err(QuicError::InvalidFrameData);
        }
        let stream_id = buf.try_get_u32_varint().map_err(invalid_frame)?;
        let offset = buf.try_get_u64_varint().map_err(invalid_frame)?;
        let data_len = buf.try_get_u64_varint().map_err(invalid_frame)?;
        if data_len > buf.remaining().safe_cast() {
            return Err(QuicError::InvalidFrameData);
        }

        Ok(StreamFrame {
            stream_id,
            offset,
            data: buf.split_to(data_len.prechecked_cast()),
            fin: frame_type & STREAM_FLAG_FIN != 0,
        })
    }
}

/// Acknowledged packet numbers as inclusive ranges, highest range first
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AckFrame {
    pub ranges: Vec<RangeInclusive<u32>>,
}

impl AckFrame {
    pub fn largest_acknowledged(&self) -> Option<u32> {
        self.ranges.first().map(|r| *r.end())
    }

    pub fn encoded_len(&self) -> usize {
        self.to_wire_fields()
            .map(|(largest, first_len, gaps)| {
                1
                    + varint_len(u64::from(largest))
                    + varint_len(u64::from(first_len))
                    + varint_len(gaps.len().safe_cast())
                    + gaps.iter()
                        .map(|&(gap, len)| varint_len(u64::from(gap)) + varint_len(u64::from(len)))
                        .sum::<usize>()
            })
            .unwrap_or(0)
    }

    /// (largest, first range length - 1, [(gap - 1, length - 1)])
    fn to_wire_fields(&self) -> Option<(u32, u32, Vec<(u32, u32)>)> {
        let first = self.ranges.first()?;
        let mut gaps = Vec::with_capacity(self.ranges.len() - 1);
        let mut low = *first.start();
        for range in &self.ranges[1..] {
            gaps.push((low - *range.end() - 2, *range.end() - *range.start()));
            low = *range.start();
        }
        Some((*first.end(), *first.end() - *first.start(), gaps))
    }

    fn encode(&self, buf: &mut impl BufMut) {
        if let Some((largest, first_len, gaps)) = self.to_wire_fields() {
            buf.put_u8(FRAME_TYPE_ACK);
            buf.put_u32_varint(largest);
            buf.put_u32_varint(first_len);
            buf.put_usize_varint(gaps.len());
            for (gap, len) in gaps {
                buf.put_u32_varint(gap);
                buf.put_u32_varint(len);
            }
        }
    }

    fn decode(buf: &mut Bytes) -> Result<AckFrame, QuicError> {
        let largest = buf.try_get_u32_varint().map_err(invalid_frame)?;
        let first_len = buf.try_get_u32_varint().map_err(invalid_frame)?;
        let mut low = largest.checked_sub(first_len)
            .ok_or(QuicError::InvalidFrameData)?;

        let mut ranges = vec![low..=largest];
        let num_gaps = buf.try_get_u64_varint().map_err(invalid_frame)?;
        for _ in 0..num_gaps {
            let gap = buf.try_get_u32_varint().map_err(invalid_frame)?;
            let len = buf.try_get_u32_varint().map_err(invalid_frame)?;

            let end = gap.checked_add(2)
                .and_then(|distance| low.checked_sub(distance))
                .ok_or(QuicError::InvalidFrameData)?;
            let start = end.checked_sub(len)
                .ok_or(QuicError::InvalidFrameData)?;
            ranges.push(start..=end);
            low = start;
        }
        Ok(AckFrame { ranges })
    }
}

#[derive(Clone, Eq, PartialEq)]
pub enum Frame {
    /// one or more consecutive padding bytes
    Padding,
    ConnectionClose {
        error_code: u32,
        reason: Bytes,
    },
    Ping,
    Ack(AckFrame),
    Stream(StreamFrame),
}
impl Debug for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Frame::Padding => write!(f, "PADDING"),
            Frame::ConnectionClose { error_code, reason } => write!(f, "CONNECTION_CLOSE({:x}:{:?})", error_code, reason),
            Frame::Ping => write!(f, "PING"),
            Frame::Ack(ack) => write!(f, "ACK({:?})", ack.ranges),
            Frame::Stream(frame) => write!(f, "{:?}", frame),
        }
    }
}

impl Frame {
    pub fn encode(&self, buf: &mut impl BufMut) {
        match self {
            Frame::Padding => buf.put_u8(FRAME_TYPE_PADDING),
            Frame::ConnectionClose { error_code, reason } => {
                buf.put_u8(FRAME_TYPE_CONNECTION_CLOSE);
                buf.put_u32(*error_code);
                buf.put_usize_varint(reason.len());
                buf.put_slice(reason);
            }
            Frame::Ping => buf.put_u8(FRAME_TYPE_PING),
            Frame::Ack(ack) => ack.encode(buf),
            Frame::Stream(frame) => frame.encode(buf),
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            Frame::Padding | Frame::Ping => 1,
            Frame::ConnectionClose { reason, .. } => 1 + 4 + varint_len(reason.len().safe_cast()) + reason.len(),
            Frame::Ack(ack) => ack.encoded_len(),
            Frame::Stream(frame) => StreamFrame::header_len(frame.stream_id, frame.offset, frame.data.len()) + frame.data.len(),
        }
    }

    /// Reads a single frame from the start of `buf`. Data in stream frames and close reasons
    ///  share storage with the packet payload.
    pub fn decode(buf: &mut Bytes) -> Result<Frame, QuicError> {
        let frame_type = buf.try_get_u8().map_err(invalid_frame)?;

        match frame_type {
            FRAME_TYPE_PADDING => {
                let num_padding = buf.iter().take_while(|&&b| b == FRAME_TYPE_PADDING).count();
                buf.advance(num_padding);
                Ok(Frame::Padding)
            }
            FRAME_TYPE_CONNECTION_CLOSE => {
                let error_code = buf.try_get_u32().map_err(invalid_frame)?;
                let reason_len = buf.try_get_u64_varint().map_err(invalid_frame)?;
                if reason_len > buf.remaining().safe_cast() {
                    return Err(QuicError::InvalidFrameData);
                }
                let reason = buf.split_to(reason_len.prechecked_cast());
                Ok(Frame::ConnectionClose { error_code, reason })
            }
            FRAME_TYPE_PING => Ok(Frame::Ping),
            FRAME_TYPE_ACK => Ok(Frame::Ack(AckFrame::decode(buf)?)),
            t if t >= FRAME_TYPE_STREAM => Ok(Frame::Stream(StreamFrame::decode(t, buf)?)),
            _ => Err(QuicError::InvalidFrameData),
        }
    }

    /// Frames that require the receiver to send an acknowledgement
    pub fn is_ack_eliciting(&self) -> bool {
        matches!(self, Frame::Ping | Frame::Stream(_))
    }
}

/// Decodes all frames in a packet payload. An empty payload is an error.
pub fn decode_frames(payload: &Bytes) -> Result<Vec<Frame>, QuicError> {
    if payload.is_empty() {
        return Err(QuicError::MissingPayload);
    }
    let mut buf = payload.clone();
    let mut result = Vec::new();
    while buf.has_remaining() {
        result.push(Frame::decode(&mut buf)?);
    }
    Ok(result)
}

use std::cmp::min;
use std::ops::Range;
use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, trace};
use crate::error::QuicError;
use crate::range_set::RangeSet;
use crate::safe_converter::{PrecheckedCast, SafeCast};

/// A slice of stream data selected for transmission in a single STREAM frame
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StreamChunk {
    pub offset: u64,
    pub data: Bytes,
    pub fin: bool,
}

impl StreamChunk {
    pub fn range(&self) -> Range<u64> {
        let len: u64 = self.data.len().safe_cast();
        self.offset..self.offset + len
    }
}

/// The send side of a stream.
///
/// Stream offsets are split into three regions: `[0, acked)` is confirmed by the peer and
///  no longer buffered, `[acked, offset)` was transmitted at least once, `[offset, written)` was
///  never sent. Acknowledgements above `acked` are kept in `acked_ranges` until the gap below
///  them closes, ranges declared lost are kept in `retransmit` and take precedence over new data.
pub struct SendStream {
    stream_id: u32,
    /// bytes starting at stream offset `acked`
    buf: BytesMut,
    acked: u64,
    offset: u64,
    acked_ranges: RangeSet,
    retransmit: RangeSet,

    send_fin: bool,
    fin_sent: bool,
    fin_acked: bool,
    fin_lost: bool,
}

impl SendStream {
    pub fn new(stream_id: u32) -> SendStream {
        SendStream {
            stream_id,
            buf: BytesMut::new(),
            acked: 0,
            offset: 0,
            acked_ranges: RangeSet::new(),
            retransmit: RangeSet::new(),
            send_fin: false,
            fin_sent: false,
            fin_acked: false,
            fin_lost: false,
        }
    }

    /// number of contiguous bytes acknowledged by the peer
    pub fn acked(&self) -> u64 {
        self.acked
    }

    /// offset of the first byte that was never sent
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// total number of bytes the application wrote to the stream
    pub fn written(&self) -> u64 {
        let buffered: u64 = self.buf.len().safe_cast();
        self.acked + buffered
    }

    /// number of bytes that were sent but not acknowledged yet
    pub fn unacked(&self) -> u64 {
        self.offset - self.acked - self.acked_ranges.covered_len()
    }

    pub fn send_fin(&self) -> bool {
        self.send_fin
    }

    /// Appends data to the unsent region. `credit` is the number of bytes flow control allows
    ///  beyond what was written so far; nothing is buffered if the write exceeds it.
    pub fn write(&mut self, data: &[u8], fin: bool, credit: u64) -> Result<(), QuicError> {
        if self.send_fin {
            debug!("stream {}: write after fin", self.stream_id);
            return Err(QuicError::InvalidStreamData);
        }
        let len: u64 = data.len().safe_cast();
        if len > credit {
            debug!("stream {}: write of {} bytes exceeds flow control credit of {}", self.stream_id, len, credit);
            return Err(QuicError::InvalidStreamData);
        }

        self.buf.extend_from_slice(data);
        self.send_fin = fin;
        trace!("stream {}: buffered {} bytes, fin={}", self.stream_id, len, fin);
        Ok(())
    }

    /// true if there is anything to put on the wire
    pub fn has_pending(&self) -> bool {
        !self.retransmit.is_empty()
            || self.offset < self.written()
            || (self.send_fin && !self.fin_sent)
            || self.fin_lost
    }

    /// The offset the next chunk will start at, if anything is pending
    pub fn next_chunk_offset(&self) -> Option<u64> {
        if let Some(range) = self.retransmit.first() {
            return Some(range.start);
        }
        if self.fin_lost {
            return Some(self.written());
        }
        if self.has_pending() {
            return Some(self.offset);
        }
        None
    }

    fn slice(&self, range: Range<u64>) -> Bytes {
        let start: usize = (range.start - self.acked).prechecked_cast();
        let end: usize = (range.end - self.acked).prechecked_cast();
        Bytes::copy_from_slice(&self.buf[start..end])
    }

    /// Selects the next chunk to transmit, at most `max_len` bytes: retransmissions first, then
    ///  data that was never sent. A fin without data is sent as an empty chunk.
    pub fn drain_for_packet(&mut self, max_len: usize) -> Option<StreamChunk> {
        let max_len: u64 = max_len.safe_cast();

        if let Some(range) = self.retransmit.first() {
            if max_len == 0 {
                return None;
            }
            let range = range.start..min(range.end, range.start + max_len);
            self.retransmit.remove(range.clone());

            let fin = self.fin_lost && range.end == self.written() && self.send_fin;
            if fin {
                self.fin_lost = false;
            }
            trace!("stream {}: retransmitting {:?}", self.stream_id, range);
            return Some(StreamChunk { offset: range.start, data: self.slice(range), fin });
        }

        if self.fin_lost {
            self.fin_lost = false;
            trace!("stream {}: retransmitting fin", self.stream_id);
            return Some(StreamChunk { offset: self.written(), data: Bytes::new(), fin: true });
        }

        let written = self.written();
        if self.offset < written && max_len > 0 {
            let range = self.offset..min(written, self.offset + max_len);
            self.offset = range.end;

            let fin = self.send_fin && self.offset == written;
            if fin {
                self.fin_sent = true;
            }
            return Some(StreamChunk { offset: range.start, data: self.slice(range), fin });
        }

        if self.offset == written && self.send_fin && !self.fin_sent {
            self.fin_sent = true;
            return Some(StreamChunk { offset: self.offset, data: Bytes::new(), fin: true });
        }

        None
    }

    /// Records a range as acknowledged. Acknowledging the same range twice has no effect.
    pub fn on_ack(&mut self, range: Range<u64>, fin: bool) {
        let range = range.start.max(self.acked)..range.end.min(self.offset);
        if !range.is_empty() {
            self.acked_ranges.insert(range.clone());
            self.retransmit.remove(range);
        }
        if fin {
            self.fin_acked = true;
            self.fin_lost = false;
        }

        let previous = self.acked;
        while let Some(first) = self.acked_ranges.first() {
            if first.start > self.acked {
                break;
            }
            self.acked = self.acked.max(first.end);
            self.acked_ranges.pop_first();
        }
        if self.acked > previous {
            self.buf.advance((self.acked - previous).prechecked_cast());
            trace!("stream {}: acked up to {}", self.stream_id, self.acked);
        }
    }

    /// Marks a range that was sent but not acknowledged as eligible for retransmission. Parts
    ///  that were acknowledged in the meantime are skipped.
    pub fn on_lost(&mut self, range: Range<u64>, fin: bool) {
        let range = range.start.max(self.acked)..range.end.min(self.offset);
        if !range.is_empty() {
            self.retransmit.insert(range.clone());
            for acked in self.acked_ranges.iter().collect::<Vec<_>>() {
                self.retransmit.remove(acked);
            }
        }
        if fin && !self.fin_acked {
            self.fin_lost = true;
        }
    }

    /// all data including the fin was acknowledged
    pub fn is_complete(&self) -> bool {
        self.send_fin && self.fin_acked && self.acked == self.written()
    }
}

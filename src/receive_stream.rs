use std::collections::BTreeMap;
use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};
use crate::error::QuicError;
use crate::safe_converter::{PrecheckedCast, SafeCast};

/// A contiguous range of received bytes that can not be delivered yet because data before it
///  is missing
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DataHole {
    pub offset: u64,
    pub data: Bytes,
}

/// The contiguous prefix that became deliverable through a call to
///  [ReceiveStream::on_receive]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Delivery {
    pub offset: u64,
    pub data: Bytes,
    pub fin: bool,
}

/// The receive side of a stream, reassembling the byte stream from frames in arbitrary order.
pub struct ReceiveStream {
    stream_id: u32,

    /// Received data above `delivered`, keyed by offset. Entries never overlap and are never
    ///  adjacent: touching ranges are merged on insert, so the entry at `delivered` (if any) is
    ///  the complete deliverable prefix.
    holes: BTreeMap<u64, Bytes>,

    /// Everything below this offset was handed to the application exactly once and is
    ///  discarded.
    delivered: u64,

    /// the highest end offset of any data received so far
    max_received: u64,

    /// fixed by the first frame carrying a fin
    final_offset: Option<u64>,
    fin_delivered: bool,

    /// the highest offset the peer may send to, as advertised in our transport parameters
    max_stream_data: u64,
}

impl ReceiveStream {
    pub fn new(stream_id: u32, max_stream_data: u64) -> ReceiveStream {
        ReceiveStream {
            stream_id,
            holes: BTreeMap::default(),
            delivered: 0,
            max_received: 0,
            final_offset: None,
            fin_delivered: false,
            max_stream_data,
        }
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn max_received(&self) -> u64 {
        self.max_received
    }

    pub fn final_offset(&self) -> Option<u64> {
        self.final_offset
    }

    /// all data up to and including the fin was delivered
    pub fn is_complete(&self) -> bool {
        self.fin_delivered
    }

    pub fn holes(&self) -> impl Iterator<Item = DataHole> + '_ {
        self.holes.iter()
            .map(|(&offset, data)| DataHole { offset, data: data.clone() })
    }

    /// number of bytes buffered but not delivered yet
    pub fn buffered_len(&self) -> usize {
        self.holes.values()
            .map(|data| data.len())
            .sum()
    }

    /// Processes a stream frame's content. All checks happen before any state changes, so a
    ///  rejected frame leaves the stream untouched.
    pub fn on_receive(&mut self, offset: u64, data: Bytes, fin: bool) -> Result<Option<Delivery>, QuicError> {
        let len: u64 = data.len().safe_cast();
        let end = offset.checked_add(len)
            .ok_or(QuicError::InvalidStreamData)?;

        if data.is_empty() && !fin {
            debug!("stream {}: empty frame without fin at offset {}", self.stream_id, offset);
            return Err(QuicError::EmptyStreamFrameNoFin);
        }
        if end > self.max_stream_data {
            debug!("stream {}: data up to {} exceeds the advertised limit of {}", self.stream_id, end, self.max_stream_data);
            return Err(QuicError::InvalidStreamData);
        }
        if let Some(final_offset) = self.final_offset {
            if end > final_offset || (fin && end != final_offset) {
                debug!("stream {}: data up to {} (fin={}) conflicts with final offset {}", self.stream_id, end, fin, final_offset);
                return Err(QuicError::InvalidStreamData);
            }
        }
        if fin && end < self.max_received {
            debug!("stream {}: final offset {} below received data up to {}", self.stream_id, end, self.max_received);
            return Err(QuicError::InvalidStreamData);
        }

        self.max_received = self.max_received.max(end);
        if fin {
            self.final_offset = Some(end);
        }

        if len > 0 && end > self.delivered {
            let (offset, data) = if offset < self.delivered {
                let skip: usize = (self.delivered - offset).prechecked_cast();
                (self.delivered, data.slice(skip..))
            }
            else {
                (offset, data)
            };
            self.insert(offset, data);
        }
        else {
            trace!("stream {}: duplicate data {}..{}", self.stream_id, offset, end);
        }

        Ok(self.take_deliverable())
    }

    fn insert(&mut self, offset: u64, data: Bytes) {
        let len: u64 = data.len().safe_cast();
        let end = offset + len;

        let touching: Vec<(u64, Bytes)> = self.holes.range(..=end).rev()
            .take_while(|(&s, d)| s + d.len() as u64 >= offset)
            .map(|(&s, d)| (s, d.clone()))
            .collect();

        if touching.is_empty() {
            self.holes.insert(offset, data);
            return;
        }

        // rebuild a single entry covering the new data and everything it touches, keeping the
        //  bytes that were received first
        let merged_start = touching.iter().map(|(s, _)| *s).min().unwrap_or(offset).min(offset);
        let merged_end = touching.iter()
            .map(|(s, d)| *s + d.len() as u64)
            .max().unwrap_or(end)
            .max(end);

        let mut merged = BytesMut::with_capacity((merged_end - merged_start).prechecked_cast());
        let mut cursor = merged_start;
        for (s, d) in touching.iter().rev() {
            if cursor < *s {
                merged.extend_from_slice(&data[(cursor - offset).prechecked_cast()..(*s - offset).prechecked_cast()]);
            }
            merged.extend_from_slice(d);
            cursor = *s + d.len() as u64;
            self.holes.remove(s);
        }
        if cursor < end {
            merged.extend_from_slice(&data[(cursor - offset).prechecked_cast()..]);
        }

        self.holes.insert(merged_start, merged.freeze());
    }

    fn take_deliverable(&mut self) -> Option<Delivery> {
        let offset = self.delivered;
        let data = self.holes.remove(&offset).unwrap_or_default();
        let len: u64 = data.len().safe_cast();
        self.delivered += len;

        let fin = !self.fin_delivered && self.final_offset == Some(self.delivered);
        if fin {
            self.fin_delivered = true;
        }

        if data.is_empty() && !fin {
            return None;
        }
        trace!("stream {}: delivering {} bytes at offset {}, fin={}", self.stream_id, len, offset, fin);
        Some(Delivery { offset, data, fin })
    }
}

//! Short headers carry only the low bits of a packet number. The sender picks a width wide
//!  enough to disambiguate against the largest packet number the peer acknowledged, the
//!  receiver reconstructs the full number from the largest one it has seen.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::error::QuicError;

/// The type code in the low five bits of a short header's first byte
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum PacketNumberLen {
    One = 1,
    Two = 2,
    Four = 3,
}

impl PacketNumberLen {
    pub fn from_type_code(code: u8) -> Result<PacketNumberLen, QuicError> {
        PacketNumberLen::try_from(code)
            .map_err(|_| QuicError::InvalidPacketHeader)
    }

    pub fn type_code(self) -> u8 {
        self.into()
    }

    pub fn num_bytes(self) -> usize {
        match self {
            PacketNumberLen::One => 1,
            PacketNumberLen::Two => 2,
            PacketNumberLen::Four => 4,
        }
    }

    fn num_bits(self) -> u32 {
        8 * self.num_bytes() as u32
    }

    /// The narrowest width that still lets the peer reconstruct `packet_number`, allowing for
    ///  twice the number of packets in flight since `largest_acked`
    pub fn for_packet(packet_number: u32, largest_acked: Option<u32>) -> PacketNumberLen {
        let in_flight = match largest_acked {
            Some(acked) => u64::from(packet_number.saturating_sub(acked)),
            None => u64::from(packet_number) + 1,
        };
        let num_bits = 64 - in_flight.leading_zeros() + 1;

        if num_bits <= 8 {
            PacketNumberLen::One
        }
        else if num_bits <= 16 {
            PacketNumberLen::Two
        }
        else {
            PacketNumberLen::Four
        }
    }

    pub fn truncate(self, packet_number: u32) -> u32 {
        match self {
            PacketNumberLen::One => packet_number & 0xff,
            PacketNumberLen::Two => packet_number & 0xffff,
            PacketNumberLen::Four => packet_number,
        }
    }

    /// Picks the packet number closest to `largest_received + 1` whose low bits match
    ///  `truncated`. Numbers that would not fit in 32 bits are a header error.
    pub fn reconstruct(self, truncated: u32, largest_received: Option<u32>) -> Result<u32, QuicError> {
        let expected = largest_received.map(|pn| u64::from(pn) + 1).unwrap_or(0);
        let window = 1u64 << self.num_bits();
        let half_window = window / 2;
        let mask = window - 1;

        let candidate = (expected & !mask) | u64::from(truncated);
        let full = if candidate + half_window <= expected {
            candidate + window
        }
        else if candidate > expected + half_window && candidate >= window {
            candidate - window
        }
        else {
            candidate
        };

        u32::try_from(full)
            .map_err(|_| QuicError::InvalidPacketHeader)
    }
}

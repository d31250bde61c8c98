use std::collections::BTreeMap;
use std::ops::Range;
use tracing::{debug, trace};
use crate::frames::AckFrame;

/// A packet is declared lost once a packet sent this many packet numbers later was acknowledged
pub const PACKET_THRESHOLD: u32 = 3;

/// Stream data carried by a sent packet
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SentStreamRange {
    pub stream_id: u32,
    pub range: Range<u64>,
    pub fin: bool,
}

/// What a sent packet carried that needs to be acted on when it is acknowledged or lost
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SentPacket {
    pub packet_number: u32,
    pub stream_ranges: Vec<SentStreamRange>,
}

#[derive(Debug, Default)]
pub struct AckOutcome {
    pub acked: Vec<SentPacket>,
    pub lost: Vec<SentPacket>,
}

/// Ack-eliciting packets that were sent and are neither acknowledged nor declared lost yet
#[derive(Default)]
pub struct SentPacketLog {
    packets: BTreeMap<u32, SentPacket>,
    largest_acked: Option<u32>,
}

impl SentPacketLog {
    pub fn new() -> SentPacketLog {
        SentPacketLog::default()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn largest_acked(&self) -> Option<u32> {
        self.largest_acked
    }

    pub fn on_sent(&mut self, packet: SentPacket) {
        trace!("tracking sent packet #{}", packet.packet_number);
        self.packets.insert(packet.packet_number, packet);
    }

    /// Removes all packets covered by an ACK frame, and everything that is at least
    ///  [PACKET_THRESHOLD] below the largest acknowledged packet number
    pub fn on_ack(&mut self, ack: &AckFrame) -> AckOutcome {
        let mut result = AckOutcome::default();

        for range in &ack.ranges {
            let acked: Vec<u32> = self.packets.range(range.clone())
                .map(|(&pn, _)| pn)
                .collect();
            for pn in acked {
                if let Some(packet) = self.packets.remove(&pn) {
                    result.acked.push(packet);
                }
            }
        }

        if let Some(largest) = ack.largest_acknowledged() {
            if self.largest_acked.map_or(true, |prev| largest > prev) {
                self.largest_acked = Some(largest);
            }
        }

        if let Some(threshold) = self.largest_acked.and_then(|l| l.checked_sub(PACKET_THRESHOLD)) {
            let lost: Vec<u32> = self.packets.range(..=threshold)
                .map(|(&pn, _)| pn)
                .collect();
            for pn in lost {
                if let Some(packet) = self.packets.remove(&pn) {
                    debug!("packet #{} declared lost", pn);
                    result.lost.push(packet);
                }
            }
        }
        result
    }

    /// Declares every unacknowledged packet lost
    pub fn drain_all(&mut self) -> Vec<SentPacket> {
        std::mem::take(&mut self.packets)
            .into_values()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ops::RangeInclusive;
    use rstest::rstest;

    fn log(packet_numbers: &[u32]) -> SentPacketLog {
        let mut result = SentPacketLog::new();
        for &pn in packet_numbers {
            result.on_sent(SentPacket {
                packet_number: pn,
                stream_ranges: vec![SentStreamRange { stream_id: 1, range: u64::from(pn) * 10..u64::from(pn) * 10 + 10, fin: false }],
            });
        }
        result
    }

    fn numbers(packets: &[SentPacket]) -> Vec<u32> {
        packets.iter().map(|p| p.packet_number).collect()
    }

    #[rstest]
    #[case::single(vec![0..=0], vec![0], vec![])]
    #[case::all(vec![0..=5], vec![0, 1, 2, 3, 4, 5], vec![])]
    #[case::below_threshold(vec![2..=2], vec![2], vec![])]
    #[case::threshold(vec![3..=3], vec![3], vec![0])]
    #[case::gap(vec![5..=5, 1..=2], vec![5, 1, 2], vec![0])]
    #[case::unknown_packet(vec![17..=17], vec![], vec![0, 1, 2, 3, 4, 5])]
    fn test_on_ack(#[case] ranges: Vec<RangeInclusive<u32>>, #[case] expected_acked: Vec<u32>, #[case] expected_lost: Vec<u32>) {
        let mut log = log(&[0, 1, 2, 3, 4, 5]);
        let outcome = log.on_ack(&AckFrame { ranges });
        assert_eq!(numbers(&outcome.acked), expected_acked);
        assert_eq!(numbers(&outcome.lost), expected_lost);
        assert_eq!(log.len(), 6 - expected_acked.len() - expected_lost.len());
    }

    #[test]
    fn test_largest_acked_is_monotonic() {
        let mut log = log(&[0, 1, 2, 3, 4, 5, 6, 7]);
        log.on_ack(&AckFrame { ranges: vec![5..=5] });
        assert_eq!(log.largest_acked(), Some(5));

        let outcome = log.on_ack(&AckFrame { ranges: vec![1..=1] });
        assert_eq!(log.largest_acked(), Some(5));
        assert!(outcome.acked.is_empty(), "1 was declared lost already");

        // acknowledging again has no effect
        let outcome = log.on_ack(&AckFrame { ranges: vec![5..=5] });
        assert!(outcome.acked.is_empty());
        assert!(outcome.lost.is_empty());
    }

    #[test]
    fn test_drain_all() {
        let mut log = log(&[3, 1, 2]);
        assert_eq!(numbers(&log.drain_all()), vec![1, 2, 3]);
        assert!(log.is_empty());
        assert!(log.drain_all().is_empty());
    }
}

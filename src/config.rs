use std::sync::Arc;
use anyhow::bail;
use crate::handshake::HandshakeContext;
use crate::packet_allocator::{DefaultPacketAllocator, PacketAllocator};
use crate::packet_header::{MIN_INITIAL_PACKET_SIZE, PROTOCOL_VERSION};
use crate::stream_handler::StreamOpenHandler;
use crate::transport_parameters::TransportParameters;

pub struct QuicConfig {
    /// The maximum size of a packet, including headers and protection overhead. All paths
    ///  between the peers must support this size without fragmentation.
    ///
    /// Client Initial packets are padded to 1200 bytes, so smaller values are rejected.
    pub max_packet_size: usize,

    /// Limits advertised to the peer. They are enforced on received data.
    pub transport_params: TransportParameters,

    /// The maximum number of handshake bytes that are buffered waiting for missing data. A peer
    ///  exceeding this closes the connection.
    pub max_handshake_size: usize,

    /// Versions a server accepts, in order of preference
    pub supported_versions: Vec<u32>,

    /// Upper bound for the number of ranges in an ACK frame. Older ranges are dropped.
    pub max_ack_ranges: usize,

    /// This is the number of packet buffers the default allocator keeps pooled at a given
    ///  time - buffers in excess of this number are discarded when they are returned.
    pub buffer_pool_size: usize,
}

impl QuicConfig {
    pub fn new_default() -> QuicConfig {
        QuicConfig {
            max_packet_size: 1280,
            transport_params: TransportParameters::default(),
            max_handshake_size: 16384,
            supported_versions: vec![PROTOCOL_VERSION],
            max_ack_ranges: 32,
            buffer_pool_size: 256,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_packet_size < MIN_INITIAL_PACKET_SIZE {
            bail!("max packet size {} is below the minimum of {}", self.max_packet_size, MIN_INITIAL_PACKET_SIZE);
        }
        if self.max_packet_size > u16::MAX as usize {
            bail!("max packet size {} exceeds the maximum UDP payload", self.max_packet_size);
        }
        if !self.supported_versions.contains(&PROTOCOL_VERSION) {
            bail!("supported versions must contain {:x}", PROTOCOL_VERSION);
        }
        if self.supported_versions.len() > 63 {
            bail!("too many supported versions");
        }
        if self.max_ack_ranges == 0 || self.max_ack_ranges > 64 {
            bail!("max ACK ranges must be between 1 and 64");
        }
        if self.max_handshake_size == 0 {
            bail!("max handshake size must not be 0");
        }
        Ok(())
    }
}

/// Engine-wide settings and capabilities, shared by all connections
pub struct QuicContext {
    pub config: QuicConfig,
    pub tls: Arc<dyn HandshakeContext>,
    pub packet_allocator: Arc<dyn PacketAllocator>,
    pub on_stream_open: Arc<dyn StreamOpenHandler>,
}

impl QuicContext {
    /// Uses a [DefaultPacketAllocator] sized according to the config
    pub fn new(config: QuicConfig, tls: Arc<dyn HandshakeContext>, on_stream_open: Arc<dyn StreamOpenHandler>) -> anyhow::Result<QuicContext> {
        config.validate()?;

        let packet_allocator = Arc::new(DefaultPacketAllocator::new(config.max_packet_size, config.buffer_pool_size));
        Ok(QuicContext {
            config,
            tls,
            packet_allocator,
            on_stream_open,
        })
    }

    pub fn with_packet_allocator(mut self, packet_allocator: Arc<dyn PacketAllocator>) -> QuicContext {
        self.packet_allocator = packet_allocator;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::default(|_: &mut QuicConfig| {}, true)]
    #[case::packet_too_small(|c: &mut QuicConfig| c.max_packet_size = 1199, false)]
    #[case::packet_minimal(|c: &mut QuicConfig| c.max_packet_size = 1200, true)]
    #[case::packet_too_big(|c: &mut QuicConfig| c.max_packet_size = 70000, false)]
    #[case::own_version_missing(|c: &mut QuicConfig| c.supported_versions = vec![1], false)]
    #[case::additional_version(|c: &mut QuicConfig| c.supported_versions.push(1), true)]
    #[case::no_ack_ranges(|c: &mut QuicConfig| c.max_ack_ranges = 0, false)]
    #[case::too_many_ack_ranges(|c: &mut QuicConfig| c.max_ack_ranges = 65, false)]
    #[case::no_handshake(|c: &mut QuicConfig| c.max_handshake_size = 0, false)]
    fn test_validate(#[case] modify: fn(&mut QuicConfig), #[case] expected: bool) {
        let mut config = QuicConfig::new_default();
        modify(&mut config);
        assert_eq!(config.validate().is_ok(), expected);
    }
}

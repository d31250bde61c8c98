#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Mutex;
use bytes::BytesMut;
use tracing::{debug, trace};

/// An outbound packet. The caller owns it after [crate::connection::Connection::send] returned,
///  and hands it back to [PacketAllocator::free_packet] after transmitting it.
#[derive(Debug)]
pub struct RawPacket {
    pub data: BytesMut,
    pub dest: SocketAddr,
}

/// Provides buffers for outbound packets
#[cfg_attr(test, automock)]
pub trait PacketAllocator: Send + Sync {
    /// Returns an empty packet with capacity for at least `payload_size` bytes, or `None` if
    ///  no buffer is available right now
    fn alloc_packet(&self, dest: SocketAddr, payload_size: usize) -> Option<RawPacket>;

    fn free_packet(&self, packet: RawPacket);
}

/// Pools buffers of a fixed size. Buffers in excess of the pool size are discarded when they
///  are returned.
pub struct DefaultPacketAllocator {
    buf_size: usize,
    buffers: Mutex<Vec<BytesMut>>,
}

impl DefaultPacketAllocator {
    pub fn new(buf_size: usize, max_pool_size: usize) -> DefaultPacketAllocator {
        DefaultPacketAllocator {
            buf_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    pub fn num_pooled(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }
}

impl PacketAllocator for DefaultPacketAllocator {
    fn alloc_packet(&self, dest: SocketAddr, payload_size: usize) -> Option<RawPacket> {
        if payload_size > self.buf_size {
            debug!("requested packet size {} exceeds buffer size {}", payload_size, self.buf_size);
            return None;
        }

        let pooled = self.buffers.lock().unwrap().pop();
        let data = match pooled {
            Some(buf) => {
                trace!("returning buffer from pool");
                buf
            }
            None => {
                debug!("no buffer in pool: creating new buffer");
                BytesMut::with_capacity(self.buf_size)
            }
        };
        Some(RawPacket { data, dest })
    }

    fn free_packet(&self, packet: RawPacket) {
        let mut data = packet.data;
        if data.capacity() < self.buf_size {
            debug!("returned buffer has less than the regular capacity: discarding");
            return;
        }
        data.clear();

        let mut buffers = self.buffers.lock().unwrap();
        if buffers.capacity() > buffers.len() {
            trace!("returning buffer to pool");
            buffers.push(data);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use rstest::rstest;

    fn addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 4433))
    }

    #[test]
    fn test_reuse_clears_buffer() {
        let allocator = DefaultPacketAllocator::new(10, 2);

        let mut packet = allocator.alloc_packet(addr(), 10).unwrap();
        packet.data.put_u8(1);
        packet.data.put_u8(2);
        allocator.free_packet(packet);
        assert_eq!(allocator.num_pooled(), 1);

        let packet = allocator.alloc_packet(addr(), 5).unwrap();
        assert!(packet.data.is_empty());
        assert!(packet.data.capacity() >= 10);
        assert_eq!(packet.dest, addr());
        assert_eq!(allocator.num_pooled(), 0);
    }

    #[test]
    fn test_pool_is_bounded() {
        let allocator = DefaultPacketAllocator::new(10, 1);
        let a = allocator.alloc_packet(addr(), 10).unwrap();
        let b = allocator.alloc_packet(addr(), 10).unwrap();
        allocator.free_packet(a);
        allocator.free_packet(b);
        assert_eq!(allocator.num_pooled(), 1);
    }

    #[rstest]
    #[case::fits(10, true)]
    #[case::smaller(1, true)]
    #[case::too_big(11, false)]
    fn test_alloc_size(#[case] payload_size: usize, #[case] expected: bool) {
        let allocator = DefaultPacketAllocator::new(10, 1);
        assert_eq!(allocator.alloc_packet(addr(), payload_size).is_some(), expected);
    }
}

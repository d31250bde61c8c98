#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use crate::error::QuicError;
use crate::stream::Stream;

/// What a stream-open callback gets to see of the connection a stream belongs to
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConnectionInfo {
    pub connection_id: u64,
    pub is_client: bool,
    pub peer_addr: SocketAddr,
}

/// Called synchronously for every stream the peer opens, before any of its data is delivered.
///  This is the place to attach a [StreamReceiveHandler]. Returning an error closes the
///  connection with that error.
#[cfg_attr(test, automock)]
pub trait StreamOpenHandler: Send + Sync {
    fn on_stream_open(&self, conn: &ConnectionInfo, stream: &mut Stream) -> Result<(), QuicError>;
}

/// Receives a stream's data in order, each byte exactly once. `fin` is set on the call that
///  delivers the last byte (or on an empty call if the fin arrives separately).
#[cfg_attr(test, automock)]
pub trait StreamReceiveHandler: Send {
    fn on_receive(&mut self, stream_id: u32, data: &[u8], fin: bool) -> Result<(), QuicError>;
}

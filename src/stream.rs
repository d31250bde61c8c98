use bytes::{Bytes, BytesMut};
use tracing::trace;
use crate::error::QuicError;
use crate::receive_stream::ReceiveStream;
use crate::send_stream::SendStream;
use crate::stream_handler::StreamReceiveHandler;

/// Stream 0 carries the handshake
pub const HANDSHAKE_STREAM_ID: u32 = 0;

/// A bidirectional stream. Received data goes to the attached [StreamReceiveHandler], or is
///  buffered for [Stream::read] if there is none.
pub struct Stream {
    stream_id: u32,
    send: SendStream,
    recv: ReceiveStream,
    handler: Option<Box<dyn StreamReceiveHandler>>,
    readable: BytesMut,
}

impl Stream {
    pub(crate) fn new(stream_id: u32, max_stream_data: u64) -> Stream {
        Stream {
            stream_id,
            send: SendStream::new(stream_id),
            recv: ReceiveStream::new(stream_id, max_stream_data),
            handler: None,
            readable: BytesMut::new(),
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// offset of the first byte that was never sent
    pub fn offset(&self) -> u64 {
        self.send.offset()
    }

    pub fn send_fin(&self) -> bool {
        self.send.send_fin()
    }

    pub fn send_stream(&self) -> &SendStream {
        &self.send
    }

    pub(crate) fn send_stream_mut(&mut self) -> &mut SendStream {
        &mut self.send
    }

    pub fn receive_stream(&self) -> &ReceiveStream {
        &self.recv
    }

    pub fn set_receive_handler(&mut self, handler: Box<dyn StreamReceiveHandler>) {
        self.handler = Some(handler);
    }

    /// Takes all data that was delivered while no handler was attached
    pub fn read(&mut self) -> Bytes {
        self.readable.split().freeze()
    }

    pub fn is_fin_received(&self) -> bool {
        self.recv.is_complete()
    }

    pub(crate) fn on_receive(&mut self, offset: u64, data: Bytes, fin: bool) -> Result<(), QuicError> {
        if let Some(delivery) = self.recv.on_receive(offset, data, fin)? {
            match &mut self.handler {
                Some(handler) => handler.on_receive(self.stream_id, &delivery.data, delivery.fin)?,
                None => {
                    trace!("stream {}: buffering {} bytes without handler", self.stream_id, delivery.data.len());
                    self.readable.extend_from_slice(&delivery.data);
                }
            }
        }
        Ok(())
    }

    /// both directions are finished: everything sent was acknowledged, and everything received
    ///  was delivered and read
    pub fn is_closed(&self) -> bool {
        self.send.is_complete() && self.recv.is_complete() && self.readable.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::*;
    use crate::stream_handler::MockStreamReceiveHandler;

    #[test]
    fn test_delivery_to_handler() {
        let mut handler = MockStreamReceiveHandler::new();
        handler.expect_on_receive()
            .with(eq(3), eq(b"abcdef".to_vec()), eq(false))
            .once()
            .returning(|_, _, _| Ok(()));
        handler.expect_on_receive()
            .with(eq(3), eq(b"".to_vec()), eq(true))
            .once()
            .returning(|_, _, _| Ok(()));

        let mut stream = Stream::new(3, 1000);
        stream.set_receive_handler(Box::new(handler));

        stream.on_receive(3, Bytes::from_static(b"def"), false).unwrap();
        stream.on_receive(0, Bytes::from_static(b"abc"), false).unwrap();
        stream.on_receive(6, Bytes::new(), true).unwrap();
        assert!(stream.is_fin_received());
        assert!(stream.read().is_empty());
    }

    #[test]
    fn test_handler_error_is_propagated() {
        let mut handler = MockStreamReceiveHandler::new();
        handler.expect_on_receive()
            .returning(|_, _, _| Err(QuicError::InternalError));

        let mut stream = Stream::new(3, 1000);
        stream.set_receive_handler(Box::new(handler));
        assert_eq!(stream.on_receive(0, Bytes::from_static(b"abc"), false), Err(QuicError::InternalError));
    }

    #[test]
    fn test_readable_without_handler() {
        let mut stream = Stream::new(HANDSHAKE_STREAM_ID, u64::MAX);
        stream.on_receive(2, Bytes::from_static(b"llo"), false).unwrap();
        assert!(stream.read().is_empty());
        stream.on_receive(0, Bytes::from_static(b"he"), false).unwrap();
        assert_eq!(stream.read().as_ref(), b"hello");
        assert!(stream.read().is_empty());
    }

    #[test]
    fn test_closed_after_both_directions_finish() {
        let mut stream = Stream::new(1, 1000);
        stream.send_stream_mut().write(b"x", true, u64::MAX).unwrap();
        let chunk = stream.send_stream_mut().drain_for_packet(10).unwrap();
        assert!(!stream.is_closed());

        stream.send_stream_mut().on_ack(chunk.range(), chunk.fin);
        assert!(!stream.is_closed());

        stream.on_receive(0, Bytes::from_static(b"y"), true).unwrap();
        assert!(!stream.is_closed());
        assert_eq!(stream.read().as_ref(), b"y");
        assert!(stream.is_closed());
    }
}

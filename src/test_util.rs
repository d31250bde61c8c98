//! Utilities for testing code built on connections without a real TLS stack: a deterministic
//!  handshake provider, stream handlers that record what they receive, and helpers for moving
//!  packets between connections in memory.
//!
//! They are used for testing the engine itself, but they are also exported for application
//!  testing.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};
use tracing::trace;
use crate::config::{QuicConfig, QuicContext};
use crate::connection::Connection;
use crate::error::QuicError;
use crate::handshake::{Extension, HandshakeContext, HandshakeError, HandshakeProperties, HandshakeProvider, HandshakeStatus};
use crate::packet_allocator::RawPacket;
use crate::packet_header::decode_packet;
use crate::stream::Stream;
use crate::stream_handler::{ConnectionInfo, StreamOpenHandler, StreamReceiveHandler};

const MSG_CLIENT_HELLO: u8 = 1;
const MSG_SERVER_HELLO: u8 = 2;
const MSG_FINISHED: u8 = 3;

/// Creates [FakeHandshakeProvider]s. `client_hello_padding` inflates the client's first flight,
///  e.g. to make it span several packets.
#[derive(Default)]
pub struct FakeHandshakeContext {
    pub client_hello_padding: usize,
}

impl HandshakeContext for FakeHandshakeContext {
    fn new_session(&self, is_server: bool, server_name: Option<&str>) -> Box<dyn HandshakeProvider> {
        trace!("new fake handshake session for {:?}", server_name);
        Box::new(FakeHandshakeProvider {
            is_server,
            client_hello_padding: self.client_hello_padding,
            step: 0,
            nonce: None,
            pending: BytesMut::new(),
        })
    }
}

/// A handshake in three messages: client hello, server hello, client finished. Each message
///  carries the sender's extensions, and the exported secrets are derived from a nonce in the
///  client hello. There is no security whatsoever.
pub struct FakeHandshakeProvider {
    is_server: bool,
    client_hello_padding: usize,
    step: u8,
    nonce: Option<u64>,
    pending: BytesMut,
}

impl FakeHandshakeProvider {
    fn write_message(out: &mut BytesMut, msg_type: u8, body: &[u8]) {
        out.put_u8(msg_type);
        out.put_u32(body.len() as u32);
        out.put_slice(body);
    }

    fn write_extensions(buf: &mut BytesMut, extensions: &[Extension]) {
        buf.put_u16(extensions.len() as u16);
        for ext in extensions {
            buf.put_u16(ext.ext_type);
            buf.put_u16(ext.data.len() as u16);
            buf.put_slice(&ext.data);
        }
    }

    fn read_extensions(buf: &mut Bytes) -> Result<Vec<Extension>, HandshakeError> {
        let num_extensions = buf.try_get_u16()?;
        let mut result = Vec::new();
        for _ in 0..num_extensions {
            let ext_type = buf.try_get_u16()?;
            let len = buf.try_get_u16()? as usize;
            if len > buf.remaining() {
                bail!("truncated extension");
            }
            result.push(Extension { ext_type, data: buf.split_to(len) });
        }
        Ok(result)
    }

    /// the next complete message, if any
    fn next_message(&mut self) -> Option<(u8, Bytes)> {
        if self.pending.len() < 5 {
            return None;
        }
        let body_len = u32::from_be_bytes([self.pending[1], self.pending[2], self.pending[3], self.pending[4]]) as usize;
        if self.pending.len() < 5 + body_len {
            return None;
        }
        let mut message = self.pending.split_to(5 + body_len).freeze();
        let msg_type = message.get_u8();
        message.advance(4);
        Some((msg_type, message))
    }

    fn on_message(&mut self, msg_type: u8, mut body: Bytes, out: &mut BytesMut, props: &mut HandshakeProperties) -> Result<HandshakeStatus, HandshakeError> {
        match (self.is_server, self.step, msg_type) {
            (true, 0, MSG_CLIENT_HELLO) => {
                self.nonce = Some(body.try_get_u64()?);
                props.collected_extensions.extend(Self::read_extensions(&mut body)?);

                let mut reply = BytesMut::new();
                Self::write_extensions(&mut reply, &props.additional_extensions);
                Self::write_message(out, MSG_SERVER_HELLO, &reply);
                self.step = 1;
                Ok(HandshakeStatus::InProgress)
            }
            (false, 1, MSG_SERVER_HELLO) => {
                props.collected_extensions.extend(Self::read_extensions(&mut body)?);
                Self::write_message(out, MSG_FINISHED, &[]);
                self.step = 2;
                Ok(HandshakeStatus::Complete)
            }
            (true, 1, MSG_FINISHED) => {
                self.step = 2;
                Ok(HandshakeStatus::Complete)
            }
            (is_server, step, msg_type) => Err(anyhow!("unexpected message {} in step {} (server: {})", msg_type, step, is_server)),
        }
    }
}

impl HandshakeProvider for FakeHandshakeProvider {
    fn handle_input(&mut self, input: &[u8], out: &mut BytesMut, props: &mut HandshakeProperties) -> Result<HandshakeStatus, HandshakeError> {
        if !self.is_server && self.step == 0 {
            let nonce = rand::random::<u64>();
            self.nonce = Some(nonce);

            let mut hello = BytesMut::new();
            hello.put_u64(nonce);
            Self::write_extensions(&mut hello, &props.additional_extensions);
            hello.put_bytes(0, self.client_hello_padding);
            Self::write_message(out, MSG_CLIENT_HELLO, &hello);
            self.step = 1;
            return Ok(HandshakeStatus::InProgress);
        }

        self.pending.extend_from_slice(input);
        let mut status = HandshakeStatus::InProgress;
        while let Some((msg_type, body)) = self.next_message() {
            status = self.on_message(msg_type, body, out, props)?;
        }
        Ok(status)
    }

    fn export_secret(&self, label: &str) -> Result<[u8; 32], HandshakeError> {
        let Some(nonce) = self.nonce.filter(|_| self.step == 2) else {
            bail!("handshake is not complete");
        };

        let mut hasher = Sha256::new();
        hasher.update(nonce.to_be_bytes());
        hasher.update(label.as_bytes());
        Ok(hasher.finalize().into())
    }
}

#[derive(Default)]
struct RecordedStreams {
    data: BTreeMap<u32, (Vec<u8>, bool)>,
    opened: Vec<u32>,
}

/// Everything the recording handlers of one context saw, shared between the handlers and the
///  test code
#[derive(Clone, Default)]
pub struct ReceivedData {
    inner: Arc<Mutex<RecordedStreams>>,
}

impl ReceivedData {
    /// all data delivered for a stream so far, and whether the fin was delivered
    pub fn data(&self, stream_id: u32) -> Option<(Vec<u8>, bool)> {
        self.inner.lock().unwrap().data.get(&stream_id).cloned()
    }

    /// ids of peer-opened streams, in the order they were opened
    pub fn opened(&self) -> Vec<u32> {
        self.inner.lock().unwrap().opened.clone()
    }
}

pub struct RecordingReceiveHandler {
    received: ReceivedData,
}

impl StreamReceiveHandler for RecordingReceiveHandler {
    fn on_receive(&mut self, stream_id: u32, data: &[u8], fin: bool) -> Result<(), QuicError> {
        let mut inner = self.received.inner.lock().unwrap();
        let (buf, fin_received) = inner.data.entry(stream_id).or_default();
        assert!(!*fin_received, "data delivered after fin on stream {}", stream_id);
        buf.extend_from_slice(data);
        *fin_received = fin;
        Ok(())
    }
}

/// Attaches a [RecordingReceiveHandler] to every stream the peer opens
pub struct RecordingStreamOpenHandler {
    pub received: ReceivedData,
}

impl StreamOpenHandler for RecordingStreamOpenHandler {
    fn on_stream_open(&self, _conn: &ConnectionInfo, stream: &mut Stream) -> Result<(), QuicError> {
        self.received.inner.lock().unwrap().opened.push(stream.stream_id());
        stream.set_receive_handler(Box::new(RecordingReceiveHandler { received: self.received.clone() }));
        Ok(())
    }
}

/// convenience method for unit test code: the same number generating the same address and
///  different numbers different addresses
pub fn test_addr(number: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, number))
}

/// `len` bytes of non-repeating-looking data
pub fn test_data(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i * 7 + i / 251) as u8)
        .collect()
}

pub fn test_context(client_hello_padding: usize) -> (Arc<QuicContext>, ReceivedData) {
    test_context_with(client_hello_padding, |_| {})
}

/// A context with a fake handshake and recording stream handlers, based on the default config
///  as modified by `f`
pub fn test_context_with(client_hello_padding: usize, f: impl FnOnce(&mut QuicConfig)) -> (Arc<QuicContext>, ReceivedData) {
    let mut config = QuicConfig::new_default();
    f(&mut config);

    let received = ReceivedData::default();
    let ctx = QuicContext::new(
        config,
        Arc::new(FakeHandshakeContext { client_hello_padding }),
        Arc::new(RecordingStreamOpenHandler { received: received.clone() }),
    ).expect("test config should be valid");
    (Arc::new(ctx), received)
}

/// Passes packets to a connection in the given order, returning the result for each of them
pub fn deliver(packets: Vec<RawPacket>, to: &mut Connection) -> Vec<Result<(), QuicError>> {
    packets.into_iter()
        .map(|packet| {
            let packet = decode_packet(&packet.data.freeze())?;
            to.receive(&packet)
        })
        .collect()
}

/// Sends everything pending on `from` to `to`, returning the first error other than
///  [QuicError::PacketIgnored]
pub fn exchange(from: &mut Connection, to: &mut Connection) -> Result<(), QuicError> {
    deliver(from.send(), to).into_iter()
        .find(|r| !matches!(r, Ok(()) | Err(QuicError::PacketIgnored)))
        .unwrap_or(Ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(client: &mut FakeHandshakeProvider, server: &mut FakeHandshakeProvider) -> (HandshakeProperties, HandshakeProperties) {
        let mut client_props = HandshakeProperties::default();
        client_props.additional_extensions.push(Extension { ext_type: 9, data: Bytes::from_static(b"client") });
        let mut server_props = HandshakeProperties::default();
        server_props.additional_extensions.push(Extension { ext_type: 9, data: Bytes::from_static(b"server") });

        let mut client_hello = BytesMut::new();
        assert_eq!(client.handle_input(&[], &mut client_hello, &mut client_props).unwrap(), HandshakeStatus::InProgress);

        // delivered in two fragments
        let mut server_hello = BytesMut::new();
        let (a, b) = client_hello.split_at(3);
        assert_eq!(server.handle_input(a, &mut server_hello, &mut server_props).unwrap(), HandshakeStatus::InProgress);
        assert!(server_hello.is_empty());
        assert_eq!(server.handle_input(b, &mut server_hello, &mut server_props).unwrap(), HandshakeStatus::InProgress);

        let mut finished = BytesMut::new();
        assert_eq!(client.handle_input(&server_hello, &mut finished, &mut client_props).unwrap(), HandshakeStatus::Complete);
        assert_eq!(server.handle_input(&finished, &mut BytesMut::new(), &mut server_props).unwrap(), HandshakeStatus::Complete);

        (client_props, server_props)
    }

    fn provider(is_server: bool) -> FakeHandshakeProvider {
        FakeHandshakeProvider { is_server, client_hello_padding: 100, step: 0, nonce: None, pending: BytesMut::new() }
    }

    #[test]
    fn test_fake_handshake() {
        let mut client = provider(false);
        let mut server = provider(true);
        assert!(client.export_secret("x").is_err());

        let (client_props, server_props) = run(&mut client, &mut server);
        assert_eq!(client_props.collected_extensions[0].data.as_ref(), b"server");
        assert_eq!(server_props.collected_extensions[0].data.as_ref(), b"client");

        assert_eq!(client.export_secret("a").unwrap(), server.export_secret("a").unwrap());
        assert_ne!(client.export_secret("a").unwrap(), client.export_secret("b").unwrap());
    }

    #[test]
    fn test_fake_handshake_rejects_unexpected_message() {
        let mut server = provider(true);
        let mut finished = BytesMut::new();
        FakeHandshakeProvider::write_message(&mut finished, MSG_FINISHED, &[]);
        assert!(server.handle_input(&finished, &mut BytesMut::new(), &mut HandshakeProperties::default()).is_err());
    }

    #[test]
    fn test_recording_handler() {
        let received = ReceivedData::default();
        let mut handler = RecordingReceiveHandler { received: received.clone() };
        handler.on_receive(3, b"ab", false).unwrap();
        handler.on_receive(3, b"c", true).unwrap();
        assert_eq!(received.data(3), Some((b"abc".to_vec(), true)));
        assert_eq!(received.data(5), None);
    }
}

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace, warn};
use crate::config::QuicContext;
use crate::error::QuicError;
use crate::frames::{decode_frames, AckFrame, Frame, StreamFrame};
use crate::handshake::{ConnectionState, HandshakeCoordinator, HandshakeProperties};
use crate::packet_allocator::RawPacket;
use crate::packet_header::{encode_long_header, encode_short_header, DecodedPacket, HeaderForm, LongPacketType, MIN_INITIAL_PACKET_SIZE, PROTOCOL_VERSION, decode_version_list};
use crate::packet_protection::{CleartextProtection, PacketProtection};
use crate::range_set::RangeSet;
use crate::safe_converter::SafeCast;
use crate::sent_packets::{SentPacket, SentPacketLog, SentStreamRange};
use crate::stream::{Stream, HANDSHAKE_STREAM_ID};
use crate::stream_handler::ConnectionInfo;
use crate::transport_parameters::TransportParameters;

static CLEARTEXT: CleartextProtection = CleartextProtection;

/// Why a connection was closed
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CloseReason {
    /// closed by the application, or because the peer violated the protocol
    Local(QuicError),
    /// closed by a CONNECTION_CLOSE frame from the peer. The code is kept as received since
    ///  peers may send codes this engine does not know.
    Remote {
        error_code: u32,
        reason: Bytes,
    },
}

impl CloseReason {
    /// The error kind, if known
    pub fn error(&self) -> Option<QuicError> {
        match self {
            CloseReason::Local(error) => Some(*error),
            CloseReason::Remote { error_code, .. } => QuicError::from_wire_code(*error_code),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Epoch {
    Cleartext,
    OneRtt,
}

/// Packet under construction
struct PacketBuilder {
    packet: RawPacket,
    epoch: Epoch,
    packet_number: u32,
    header_len: usize,
    /// offset in the buffer where the protection trailer starts at the latest
    payload_limit: usize,
    pad_to: Option<usize>,
    sent: SentPacket,
}

impl PacketBuilder {
    fn remaining(&self) -> usize {
        self.payload_limit.saturating_sub(self.packet.data.len())
    }

    fn has_frames(&self) -> bool {
        self.packet.data.len() > self.header_len
    }
}

/// One connection, driven entirely by the caller: datagrams addressed to it are passed to
///  [Connection::receive], and [Connection::send] returns the packets that should go on the
///  wire. There are no timers or threads inside the engine.
pub struct Connection {
    ctx: Arc<QuicContext>,
    connection_id: u64,
    peer_addr: SocketAddr,
    handshake: HandshakeCoordinator,

    streams: BTreeMap<u32, Stream>,
    /// odd for clients, even for servers
    host_next_stream_id: u32,
    peer_next_stream_id: u32,

    next_packet_number: u32,
    sent_packets: SentPacketLog,
    received_packets: RangeSet,
    ack_pending: bool,

    /// connection-level flow control, application streams only
    bytes_written: u64,
    bytes_received: u64,

    close_reason: Option<CloseReason>,
    /// no more packets are sent after this
    drained: bool,
}

impl Connection {
    fn new(ctx: Arc<QuicContext>, connection_id: u64, peer_addr: SocketAddr, handshake: HandshakeCoordinator, host_next_stream_id: u32, peer_next_stream_id: u32) -> Connection {
        let mut streams = BTreeMap::new();
        streams.insert(HANDSHAKE_STREAM_ID, Stream::new(HANDSHAKE_STREAM_ID, u64::MAX));

        Connection {
            ctx,
            connection_id,
            peer_addr,
            handshake,
            streams,
            host_next_stream_id,
            peer_next_stream_id,
            next_packet_number: 0,
            sent_packets: SentPacketLog::new(),
            received_packets: RangeSet::new(),
            ack_pending: false,
            bytes_written: 0,
            bytes_received: 0,
            close_reason: None,
            drained: false,
        }
    }

    /// Starts a client connection. The client's first flight is sent by the next call to
    ///  [Connection::send].
    pub fn connect(ctx: Arc<QuicContext>, server_name: &str, peer_addr: SocketAddr, props: HandshakeProperties) -> Result<Connection, QuicError> {
        let connection_id = rand::random::<u64>();
        debug!("connecting to {} ({}) with connection id {:x}", peer_addr, server_name, connection_id);

        let provider = ctx.tls.new_session(false, Some(server_name));
        let mut first_flight = BytesMut::new();
        let handshake = HandshakeCoordinator::new_client(provider, &ctx.config.transport_params, props, &mut first_flight)?;

        let mut result = Connection::new(ctx, connection_id, peer_addr, handshake, 1, 2);
        result.handshake_stream_mut().send_stream_mut().write(&first_flight, false, u64::MAX)?;
        Ok(result)
    }

    /// Creates a server connection from a client's first packet. The packet must be a Client
    ///  Initial of at least [MIN_INITIAL_PACKET_SIZE] bytes carrying nothing but the start of
    ///  the handshake stream.
    pub fn accept(ctx: Arc<QuicContext>, peer_addr: SocketAddr, props: HandshakeProperties, packet: &DecodedPacket) -> Result<Connection, QuicError> {
        let (Some(LongPacketType::ClientInitial), Some(version), Some(connection_id)) = (packet.long_packet_type(), packet.version(), packet.connection_id()) else {
            debug!("not a client initial packet: {:?}", packet);
            return Err(QuicError::InvalidPacketHeader);
        };
        if packet.len() < MIN_INITIAL_PACKET_SIZE {
            debug!("client initial packet too short: {} bytes", packet.len());
            return Err(QuicError::InvalidPacketHeader);
        }
        if !ctx.config.supported_versions.contains(&version) {
            debug!("unsupported version {:x}", version);
            return Err(QuicError::InvalidVersion);
        }

        let payload = CLEARTEXT.unprotect(packet.packet_number(), packet.header(), packet.payload())?;
        let mut has_client_hello = false;
        for frame in decode_frames(&payload)? {
            match frame {
                Frame::Padding => {}
                Frame::Stream(frame) if frame.stream_id != HANDSHAKE_STREAM_ID => {
                    warn!("client initial packet with data for stream {}", frame.stream_id);
                    return Err(QuicError::UnencryptedStreamData);
                }
                Frame::Stream(frame) if frame.offset == 0 && !frame.fin && !has_client_hello => {
                    has_client_hello = true;
                }
                other => {
                    warn!("unexpected frame in client initial packet: {:?}", other);
                    return Err(QuicError::InvalidFrameData);
                }
            }
        }
        if !has_client_hello {
            return Err(QuicError::InvalidFrameData);
        }

        debug!("accepting connection {:x} from {}", connection_id, peer_addr);
        let provider = ctx.tls.new_session(true, None);
        let handshake = HandshakeCoordinator::new_server(provider, &ctx.config.transport_params, &ctx.config.supported_versions, props);

        let mut result = Connection::new(ctx, connection_id, peer_addr, handshake, 2, 1);
        result.receive(packet)?;
        Ok(result)
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn state(&self) -> ConnectionState {
        self.handshake.state()
    }

    pub fn is_client(&self) -> bool {
        self.host_next_stream_id % 2 == 1
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_transport_parameters(&self) -> &TransportParameters {
        &self.ctx.config.transport_params
    }

    /// `None` until the peer's parameters arrived in the handshake
    pub fn peer_transport_parameters(&self) -> Option<&TransportParameters> {
        self.handshake.peer_params()
    }

    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.close_reason.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.close_reason.is_some()
    }

    /// Closed, and nothing is left to send
    pub fn is_drained(&self) -> bool {
        self.drained
    }

    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            connection_id: self.connection_id,
            is_client: self.is_client(),
            peer_addr: self.peer_addr,
        }
    }

    fn handshake_stream(&self) -> &Stream {
        self.streams.get(&HANDSHAKE_STREAM_ID)
            .expect("this is a bug: handshake stream is never removed")
    }

    fn handshake_stream_mut(&mut self) -> &mut Stream {
        self.streams.get_mut(&HANDSHAKE_STREAM_ID)
            .expect("this is a bug: handshake stream is never removed")
    }

    pub fn get_stream(&self, stream_id: u32) -> Option<&Stream> {
        self.streams.get(&stream_id)
    }

    pub fn get_stream_mut(&mut self, stream_id: u32) -> Option<&mut Stream> {
        self.streams.get_mut(&stream_id)
    }

    /// Opens the next locally initiated stream, if the peer's `initial_max_stream_id` allows it
    pub fn open_stream(&mut self) -> Result<&mut Stream, QuicError> {
        let Some(peer_params) = self.handshake.peer_params() else {
            debug!("cannot open a stream before the peer's transport parameters are known");
            return Err(QuicError::TooManyOpenStreams);
        };

        let stream_id = self.host_next_stream_id;
        if stream_id > peer_params.initial_max_stream_id {
            debug!("stream {} exceeds the peer's limit of {}", stream_id, peer_params.initial_max_stream_id);
            return Err(QuicError::TooManyOpenStreams);
        }
        self.host_next_stream_id = stream_id.checked_add(2)
            .ok_or(QuicError::TooManyOpenStreams)?;

        debug!("opening stream {}", stream_id);
        let max_stream_data = u64::from(self.ctx.config.transport_params.initial_max_stream_data);
        Ok(self.streams.entry(stream_id)
            .or_insert_with(|| Stream::new(stream_id, max_stream_data)))
    }

    /// Buffers data for sending. Writes beyond the peer's flow control limits are rejected as
    ///  a whole.
    pub fn write_stream(&mut self, stream_id: u32, data: &[u8], fin: bool) -> Result<(), QuicError> {
        if stream_id == HANDSHAKE_STREAM_ID {
            return Err(QuicError::InvalidStreamData);
        }
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            debug!("write to unknown stream {}", stream_id);
            return Err(QuicError::InvalidStreamData);
        };
        let peer_params = self.handshake.peer_params()
            .expect("this is a bug: application streams exist only after the peer's transport parameters are known");

        let send_stream = stream.send_stream();
        let stream_credit = u64::from(peer_params.initial_max_stream_data).saturating_sub(send_stream.written());
        let connection_credit = peer_params.max_data_bytes().saturating_sub(self.bytes_written);

        stream.send_stream_mut().write(data, fin, stream_credit.min(connection_credit))?;
        let len: u64 = data.len().safe_cast();
        self.bytes_written += len;
        Ok(())
    }

    /// Closes the connection with an error code that is sent to the peer. Only the first
    ///  close counts.
    pub fn close(&mut self, error: QuicError) {
        if self.close_reason.is_none() {
            debug!("closing connection {:x}: {}", self.connection_id, error);
            self.close_reason = Some(CloseReason::Local(error));
        }
    }

    /// Releases the connection
    pub fn free(self) {
        debug!("freeing connection {:x} with {} open streams", self.connection_id, self.streams.len() - 1);
    }

    /// Declares all packets that were not acknowledged so far lost, making their data eligible
    ///  for retransmission. The caller drives this from a timer.
    pub fn on_retransmission_timeout(&mut self) {
        let lost = self.sent_packets.drain_all();
        debug!("retransmission timeout: {} packets lost", lost.len());
        for packet in lost {
            self.on_packet_lost(packet);
        }
    }

    fn largest_received(&self) -> Option<u32> {
        self.received_packets.last()
            .and_then(|r| u32::try_from(r.end - 1).ok())
    }

    fn accepts_version(&self, version: u32) -> bool {
        if self.is_client() {
            version == PROTOCOL_VERSION
        }
        else {
            self.ctx.config.supported_versions.contains(&version)
        }
    }

    /// Processes a packet addressed to this connection. Errors other than
    ///  [QuicError::PacketIgnored] close the connection.
    pub fn receive(&mut self, packet: &DecodedPacket) -> Result<(), QuicError> {
        if self.is_closed() {
            trace!("connection is closed: ignoring packet");
            return Err(QuicError::PacketIgnored);
        }

        match self.process_packet(packet) {
            Err(e) if e.is_fatal() => {
                warn!("connection {:x}: error processing {:?}: {}", self.connection_id, packet, e);
                self.close(e);
                Err(e)
            }
            result => result,
        }
    }

    fn process_packet(&mut self, packet: &DecodedPacket) -> Result<(), QuicError> {
        if let Some(connection_id) = packet.connection_id() {
            if connection_id != self.connection_id {
                debug!("packet for connection {:x} - ignoring", connection_id);
                return Err(QuicError::PacketIgnored);
            }
        }

        let (epoch, packet_number) = match packet.form() {
            HeaderForm::Long { packet_type: LongPacketType::VersionNegotiation, .. } => {
                return self.on_version_negotiation(packet);
            }
            HeaderForm::Long { packet_type, version } => {
                if !self.accepts_version(version) {
                    debug!("packet with version {:x} - ignoring", version);
                    return Err(QuicError::PacketIgnored);
                }
                let epoch = match packet_type {
                    LongPacketType::ClientInitial | LongPacketType::ClientCleartext if !self.is_client() => Epoch::Cleartext,
                    LongPacketType::ServerCleartext if self.is_client() => Epoch::Cleartext,
                    LongPacketType::OneRttKeyPhase0 => Epoch::OneRtt,
                    other => {
                        debug!("{:?} packet - ignoring", other);
                        return Err(QuicError::PacketIgnored);
                    }
                };
                (epoch, packet.packet_number())
            }
            HeaderForm::Short { key_phase, packet_number_len } => {
                if key_phase {
                    debug!("key phase 1 packet - ignoring");
                    return Err(QuicError::PacketIgnored);
                }
                (Epoch::OneRtt, packet_number_len.reconstruct(packet.packet_number(), self.largest_received())?)
            }
        };

        let payload = match epoch {
            Epoch::Cleartext => CLEARTEXT.unprotect(packet_number, packet.header(), packet.payload())?,
            Epoch::OneRtt => match self.handshake.one_rtt_keys() {
                Some(keys) => keys.recv.unprotect(packet_number, packet.header(), packet.payload())?,
                None => {
                    debug!("1-RTT packet #{} before keys are available", packet_number);
                    return Err(QuicError::DecryptionFailure);
                }
            },
        };

        if self.received_packets.contains(u64::from(packet_number)) {
            debug!("duplicate packet #{} - ignoring", packet_number);
            return Err(QuicError::PacketIgnored);
        }

        let mut ack_eliciting = false;
        for frame in decode_frames(&payload)? {
            ack_eliciting |= frame.is_ack_eliciting();
            match frame {
                Frame::Padding | Frame::Ping => {}
                Frame::Ack(ack) => self.on_ack_frame(&ack)?,
                Frame::ConnectionClose { error_code, reason } => {
                    debug!("connection {:x} closed by peer with code {}", self.connection_id, error_code);
                    self.close_reason = Some(CloseReason::Remote { error_code, reason });
                    self.drained = true;
                    return Ok(());
                }
                Frame::Stream(frame) => self.on_stream_frame(frame, epoch)?,
            }
        }

        let packet_number = u64::from(packet_number);
        self.received_packets.insert(packet_number..packet_number + 1);
        self.received_packets.retain_highest(self.ctx.config.max_ack_ranges);
        if ack_eliciting {
            self.ack_pending = true;
        }

        self.remove_closed_streams();
        Ok(())
    }

    fn on_version_negotiation(&mut self, packet: &DecodedPacket) -> Result<(), QuicError> {
        if !self.is_client() || self.state() != ConnectionState::BeforeServerHello {
            debug!("unexpected version negotiation packet - ignoring");
            return Err(QuicError::PacketIgnored);
        }

        let versions = decode_version_list(packet.payload())?;
        if versions.contains(&PROTOCOL_VERSION) {
            debug!("version negotiation packet lists our own version - ignoring");
            return Err(QuicError::PacketIgnored);
        }
        warn!("server does not support version {:x}, only {:x?}", PROTOCOL_VERSION, versions);
        Err(QuicError::InvalidVersion)
    }

    fn on_ack_frame(&mut self, ack: &AckFrame) -> Result<(), QuicError> {
        if let Some(largest) = ack.largest_acknowledged() {
            if largest >= self.next_packet_number {
                warn!("ACK for packet #{} which was never sent", largest);
                return Err(QuicError::InvalidFrameData);
            }
        }

        let outcome = self.sent_packets.on_ack(ack);
        for packet in outcome.acked {
            trace!("packet #{} acknowledged", packet.packet_number);
            for sent in packet.stream_ranges {
                if let Some(stream) = self.streams.get_mut(&sent.stream_id) {
                    stream.send_stream_mut().on_ack(sent.range, sent.fin);
                }
            }
        }
        for packet in outcome.lost {
            self.on_packet_lost(packet);
        }
        Ok(())
    }

    fn on_packet_lost(&mut self, packet: SentPacket) {
        for sent in packet.stream_ranges {
            if let Some(stream) = self.streams.get_mut(&sent.stream_id) {
                stream.send_stream_mut().on_lost(sent.range, sent.fin);
            }
        }
    }

    fn on_stream_frame(&mut self, frame: StreamFrame, epoch: Epoch) -> Result<(), QuicError> {
        if frame.stream_id == HANDSHAKE_STREAM_ID {
            return self.on_handshake_data(frame);
        }
        if epoch == Epoch::Cleartext {
            warn!("data for stream {} in a cleartext packet", frame.stream_id);
            return Err(QuicError::UnencryptedStreamData);
        }

        let end_offset = frame.end_offset()?;
        let max_data = self.ctx.config.transport_params.max_data_bytes();
        let bytes_received = self.bytes_received;

        let Some(stream) = self.stream_for_frame(frame.stream_id)? else {
            trace!("data for closed stream {} - ignoring", frame.stream_id);
            return Ok(());
        };

        let increase = end_offset.saturating_sub(stream.receive_stream().max_received());
        let Some(total) = bytes_received.checked_add(increase).filter(|&total| total <= max_data) else {
            warn!("peer exceeded the connection's data limit of {} bytes", max_data);
            return Err(QuicError::InvalidStreamData);
        };
        stream.on_receive(frame.offset, frame.data, frame.fin)?;
        self.bytes_received = total;
        Ok(())
    }

    /// Looks up a stream for incoming data, opening peer initiated streams as needed. `None`
    ///  means the stream existed and was closed.
    fn stream_for_frame(&mut self, stream_id: u32) -> Result<Option<&mut Stream>, QuicError> {
        let is_peer_initiated = stream_id % 2 == self.peer_next_stream_id % 2;

        if is_peer_initiated && stream_id >= self.peer_next_stream_id {
            let max_stream_id = self.ctx.config.transport_params.initial_max_stream_id;
            if stream_id > max_stream_id {
                warn!("peer opened stream {} beyond the limit of {}", stream_id, max_stream_id);
                return Err(QuicError::TooManyOpenStreams);
            }

            let info = self.info();
            let max_stream_data = u64::from(self.ctx.config.transport_params.initial_max_stream_data);
            let first = self.peer_next_stream_id;
            self.peer_next_stream_id = stream_id + 2;

            for new_id in (first..=stream_id).step_by(2) {
                debug!("peer opened stream {}", new_id);
                let stream = self.streams.entry(new_id)
                    .or_insert_with(|| Stream::new(new_id, max_stream_data));
                self.ctx.on_stream_open.on_stream_open(&info, stream)?;
            }
        }
        else if !is_peer_initiated && stream_id >= self.host_next_stream_id {
            warn!("data for stream {} that was not opened yet", stream_id);
            return Err(QuicError::InvalidStreamData);
        }

        Ok(self.streams.get_mut(&stream_id))
    }

    fn on_handshake_data(&mut self, frame: StreamFrame) -> Result<(), QuicError> {
        if frame.fin {
            warn!("peer finished the handshake stream");
            return Err(QuicError::ClosedCriticalStream);
        }

        let end_offset = frame.end_offset()?;
        let max_handshake_size: u64 = self.ctx.config.max_handshake_size.safe_cast();
        let stream = self.handshake_stream_mut();
        if end_offset > stream.receive_stream().delivered() + max_handshake_size {
            warn!("handshake data up to offset {} exceeds the buffer limit", end_offset);
            return Err(QuicError::HandshakeTooLarge);
        }

        stream.on_receive(frame.offset, frame.data, false)?;
        let input = stream.read();
        if input.is_empty() {
            return Ok(());
        }

        let mut out = BytesMut::new();
        self.handshake.handle_input(&input, &mut out)?;
        if !out.is_empty() {
            self.handshake_stream_mut().send_stream_mut().write(&out, false, u64::MAX)?;
        }
        Ok(())
    }

    fn remove_closed_streams(&mut self) {
        self.streams.retain(|&stream_id, stream| {
            let closed = stream_id != HANDSHAKE_STREAM_ID && stream.is_closed();
            if closed {
                debug!("stream {} closed", stream_id);
            }
            !closed
        });
    }

    /// Builds all packets that are pending: a CONNECTION_CLOSE if the connection was closed,
    ///  otherwise acknowledgements, handshake data, retransmissions and new stream data.
    ///  Returns an empty list if there is nothing to send, or if the packet allocator has no
    ///  buffers.
    pub fn send(&mut self) -> Vec<RawPacket> {
        let mut result = Vec::new();
        if self.drained {
            return result;
        }
        self.remove_closed_streams();

        if let Some(CloseReason::Local(error)) = self.close_reason {
            if let Some(packet) = self.build_close_packet(error) {
                result.push(packet);
                self.drained = true;
            }
            return result;
        }

        while let Some(packet) = self.build_packet() {
            result.push(packet);
        }
        trace!("sending {} packets", result.len());
        result
    }

    /// Handshake data goes out in cleartext. Everything else waits for 1-RTT keys, and for the
    ///  peer to acknowledge all handshake data: until then, it may not have the keys yet.
    fn send_epoch(&self) -> Epoch {
        let handshake_data = self.handshake_stream().send_stream();
        if self.handshake.one_rtt_keys().is_none() || handshake_data.acked() < handshake_data.written() {
            Epoch::Cleartext
        }
        else {
            Epoch::OneRtt
        }
    }

    fn cleartext_packet_type(&self) -> LongPacketType {
        if !self.is_client() {
            LongPacketType::ServerCleartext
        }
        else if self.received_packets.is_empty() {
            LongPacketType::ClientInitial
        }
        else {
            LongPacketType::ClientCleartext
        }
    }

    fn protection(&self, epoch: Epoch) -> &dyn PacketProtection {
        match epoch {
            Epoch::Cleartext => &CLEARTEXT,
            Epoch::OneRtt => &self.handshake.one_rtt_keys()
                .expect("this is a bug: 1-RTT packet without keys")
                .send,
        }
    }

    fn start_packet(&mut self, epoch: Epoch) -> Option<PacketBuilder> {
        let max_packet_size = self.ctx.config.max_packet_size;
        let Some(mut packet) = self.ctx.packet_allocator.alloc_packet(self.peer_addr, max_packet_size) else {
            debug!("packet allocator exhausted");
            return None;
        };

        let packet_number = self.next_packet_number;
        let mut pad_to = None;
        match epoch {
            Epoch::Cleartext => {
                let packet_type = self.cleartext_packet_type();
                encode_long_header(&mut packet.data, packet_type, self.connection_id, packet_number, PROTOCOL_VERSION);
                if packet_type == LongPacketType::ClientInitial {
                    pad_to = Some(MIN_INITIAL_PACKET_SIZE);
                }
            }
            Epoch::OneRtt => {
                let omit_connection_id = self.handshake.peer_params()
                    .map(|p| p.truncate_connection_id)
                    .unwrap_or(false);
                let connection_id = (!omit_connection_id).then_some(self.connection_id);
                encode_short_header(&mut packet.data, connection_id, false, packet_number, self.sent_packets.largest_acked());
            }
        }

        let header_len = packet.data.len();
        let payload_limit = max_packet_size - self.protection(epoch).overhead();
        Some(PacketBuilder {
            packet,
            epoch,
            packet_number,
            header_len,
            payload_limit,
            pad_to,
            sent: SentPacket { packet_number, stream_ranges: Vec::new() },
        })
    }

    fn finish_packet(&mut self, mut builder: PacketBuilder) -> RawPacket {
        let protection = self.protection(builder.epoch);
        if let Some(pad_to) = builder.pad_to {
            let padded_len = pad_to - protection.overhead();
            let data_len = builder.packet.data.len();
            if data_len < padded_len {
                builder.packet.data.put_bytes(0, padded_len - data_len);
            }
        }
        protection.protect(builder.packet_number, builder.header_len, &mut builder.packet.data);
        trace!("built {:?} packet #{} with {} bytes", builder.epoch, builder.packet_number, builder.packet.data.len());

        self.next_packet_number += 1;
        if !builder.sent.stream_ranges.is_empty() {
            self.sent_packets.on_sent(builder.sent);
        }
        builder.packet
    }

    fn build_close_packet(&mut self, error: QuicError) -> Option<RawPacket> {
        let mut builder = self.start_packet(self.send_epoch())?;

        let wire_code = error.wire_code()
            .or(QuicError::InternalError.wire_code())
            .unwrap_or_default();
        let mut reason = error.to_string();
        reason.truncate(builder.remaining().saturating_sub(16));
        Frame::ConnectionClose { error_code: u32::from(wire_code), reason: Bytes::from(reason) }
            .encode(&mut builder.packet.data);

        debug!("sending CONNECTION_CLOSE with code {}", wire_code);
        Some(self.finish_packet(builder))
    }

    fn build_packet(&mut self) -> Option<RawPacket> {
        let epoch = self.send_epoch();
        let has_stream_data = match epoch {
            Epoch::Cleartext => self.handshake_stream().send_stream().has_pending(),
            Epoch::OneRtt => self.streams.values().any(|s| s.send_stream().has_pending()),
        };
        if !self.ack_pending && !has_stream_data {
            return None;
        }

        let mut builder = self.start_packet(epoch)?;
        if self.ack_pending {
            self.write_ack_frame(&mut builder);
        }
        self.write_stream_frames(&mut builder);

        if !builder.has_frames() {
            debug!("no frame fits into a packet");
            self.ctx.packet_allocator.free_packet(builder.packet);
            return None;
        }

        let carries_handshake = builder.sent.stream_ranges.iter().any(|r| r.stream_id == HANDSHAKE_STREAM_ID);
        let packet = self.finish_packet(builder);
        if carries_handshake {
            self.handshake.on_flight_sent();
        }
        Some(packet)
    }

    fn write_ack_frame(&mut self, builder: &mut PacketBuilder) {
        let ranges = self.received_packets.iter().rev()
            .filter_map(|r| Some(u32::try_from(r.start).ok()?..=u32::try_from(r.end - 1).ok()?))
            .collect();
        let ack = Frame::Ack(AckFrame { ranges });
        if ack.encoded_len() <= builder.remaining() {
            ack.encode(&mut builder.packet.data);
            self.ack_pending = false;
        }
    }

    fn write_stream_frames(&mut self, builder: &mut PacketBuilder) {
        let handshake_only = builder.epoch == Epoch::Cleartext;

        for stream in self.streams.values_mut() {
            let stream_id = stream.stream_id();
            if handshake_only != (stream_id == HANDSHAKE_STREAM_ID) {
                continue;
            }

            while let Some(offset) = stream.send_stream().next_chunk_offset() {
                let remaining = builder.remaining();
                let header_len = StreamFrame::header_len(stream_id, offset, remaining);
                if remaining < header_len {
                    return;
                }
                let Some(chunk) = stream.send_stream_mut().drain_for_packet(remaining - header_len) else {
                    return;
                };

                builder.sent.stream_ranges.push(SentStreamRange { stream_id, range: chunk.range(), fin: chunk.fin });
                Frame::Stream(StreamFrame {
                    stream_id,
                    offset: chunk.offset,
                    data: chunk.data,
                    fin: chunk.fin,
                }).encode(&mut builder.packet.data);
            }
        }
    }
}

use std::net::SocketAddr;
use std::sync::Arc;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{debug, span, trace, warn, Level};
use crate::config::QuicContext;
use crate::connection::Connection;
use crate::error::QuicError;
use crate::handshake::HandshakeProperties;
use crate::packet_allocator::RawPacket;
use crate::packet_header::{decode_packet, encode_version_negotiation, DecodedPacket, LongPacketType};

/// EndPoint is where datagrams meet connections: it routes each incoming datagram to the
///  connection it belongs to, accepts new connections from client initial packets, and collects
///  the outgoing packets of all connections. Socket I/O is left to the caller.
pub struct EndPoint {
    ctx: Arc<QuicContext>,
    connections: FxHashMap<u64, Connection>,
    /// for packets without connection id
    connection_ids_by_addr: FxHashMap<SocketAddr, u64>,
    /// stateless responses, i.e. version negotiation
    outbound: Vec<RawPacket>,
    accept_connections: bool,
}

impl EndPoint {
    pub fn new(ctx: Arc<QuicContext>, accept_connections: bool) -> anyhow::Result<EndPoint> {
        ctx.config.validate()?;

        Ok(EndPoint {
            ctx,
            connections: FxHashMap::default(),
            connection_ids_by_addr: FxHashMap::default(),
            outbound: Vec::new(),
            accept_connections,
        })
    }

    pub fn num_connections(&self) -> usize {
        self.connections.len()
    }

    pub fn connection(&self, connection_id: u64) -> Option<&Connection> {
        self.connections.get(&connection_id)
    }

    pub fn connection_mut(&mut self, connection_id: u64) -> Option<&mut Connection> {
        self.connections.get_mut(&connection_id)
    }

    /// Starts a client connection and returns its connection id
    pub fn connect(&mut self, server_name: &str, peer_addr: SocketAddr, props: HandshakeProperties) -> Result<u64, QuicError> {
        let connection = Connection::connect(self.ctx.clone(), server_name, peer_addr, props)?;
        let connection_id = connection.connection_id();
        self.register(connection);
        Ok(connection_id)
    }

    fn register(&mut self, connection: Connection) {
        self.connection_ids_by_addr.insert(connection.peer_addr(), connection.connection_id());
        self.connections.insert(connection.connection_id(), connection);
    }

    /// Handles a received datagram, returning the id of the connection it was routed to.
    ///  Errors are logged and returned, connections that hit a fatal error are closed and
    ///  send their CONNECTION_CLOSE with the next call to [EndPoint::send].
    pub fn on_datagram(&mut self, from: SocketAddr, datagram: Bytes) -> Result<u64, QuicError> {
        let packet = match decode_packet(&datagram) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("received unparsable datagram from {:?} - dropping", from);
                return Err(e);
            }
        };

        let connection_id = packet.connection_id()
            .or_else(|| self.connection_ids_by_addr.get(&from).copied());

        let span = span!(Level::TRACE, "datagram_received", connection_id = ?connection_id);
        let _entered = span.enter();
        trace!("received {:?} from {:?}", packet, from);

        let Some(connection_id) = connection_id else {
            debug!("packet without connection id from unknown peer {:?} - dropping", from);
            return Err(QuicError::PacketIgnored);
        };

        if let Some(connection) = self.connections.get_mut(&connection_id) {
            if connection.peer_addr() != from {
                warn!("packet for connection {:x} from {:?} instead of {:?} - dropping", connection_id, from, connection.peer_addr());
                return Err(QuicError::PacketIgnored);
            }
            connection.receive(&packet)?;
            return Ok(connection_id);
        }

        self.on_new_connection(from, &packet)?;
        Ok(connection_id)
    }

    fn on_new_connection(&mut self, from: SocketAddr, packet: &DecodedPacket) -> Result<(), QuicError> {
        if !self.accept_connections || packet.long_packet_type() != Some(LongPacketType::ClientInitial) {
            debug!("packet for unknown connection - dropping");
            return Err(QuicError::PacketIgnored);
        }

        if let Some(version) = packet.version() {
            if !self.ctx.config.supported_versions.contains(&version) {
                debug!("client offered unsupported version {:x}: sending version negotiation", version);
                self.send_version_negotiation(from, packet);
                return Err(QuicError::InvalidVersion);
            }
        }

        let connection = Connection::accept(self.ctx.clone(), from, HandshakeProperties::default(), packet)?;
        self.register(connection);
        Ok(())
    }

    fn send_version_negotiation(&mut self, to: SocketAddr, client_packet: &DecodedPacket) {
        let supported_versions = &self.ctx.config.supported_versions;
        let Some(mut packet) = self.ctx.packet_allocator.alloc_packet(to, self.ctx.config.max_packet_size) else {
            debug!("packet allocator exhausted: no version negotiation");
            return;
        };
        encode_version_negotiation(&mut packet.data, client_packet, supported_versions);
        self.outbound.push(packet);
    }

    /// Collects the packets of all connections, and removes connections that are closed and
    ///  have nothing left to send
    pub fn send(&mut self) -> Vec<RawPacket> {
        let mut result = std::mem::take(&mut self.outbound);
        for connection in self.connections.values_mut() {
            result.extend(connection.send());
        }

        let drained: Vec<u64> = self.connections.iter()
            .filter(|(_, c)| c.is_drained())
            .map(|(&id, _)| id)
            .collect();
        for connection_id in drained {
            if let Some(connection) = self.connections.remove(&connection_id) {
                debug!("removing closed connection {:x}: {:?}", connection_id, connection.close_reason());
                self.connection_ids_by_addr.remove(&connection.peer_addr());
                connection.free();
            }
        }
        result
    }

    /// Passes the timer tick to all connections
    pub fn on_retransmission_timeout(&mut self) {
        for connection in self.connections.values_mut() {
            connection.on_retransmission_timeout();
        }
    }

    /// Returns a packet's buffer to the allocator after it was transmitted
    pub fn free_packet(&self, packet: RawPacket) {
        self.ctx.packet_allocator.free_packet(packet);
    }
}

use std::fmt::Debug;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::trace;
use crate::error::QuicError;
use crate::packet_number::PacketNumberLen;

bitflags! {
    #[derive(PartialEq, Eq, Copy, Clone, Debug)]
    struct Flags: u8 {
        const LONG_HEADER = 0b1000_0000;
        const MASK_LONG_TYPE = 0b0111_1111;

        const HAS_CONNECTION_ID = 0b0100_0000;
        const KEY_PHASE = 0b0010_0000;
        const MASK_SHORT_TYPE = 0b0001_1111;
    }
}

pub const PROTOCOL_VERSION: u32 = 0xff00_0005;

/// flags + connection id + packet number + version
pub const LONG_HEADER_LEN: usize = 1 + 8 + 4 + 4;

/// Clients pad their first packet to at least this size, servers discard smaller ones
pub const MIN_INITIAL_PACKET_SIZE: usize = 1200;

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum LongPacketType {
    VersionNegotiation = 1,
    ClientInitial = 2,
    ServerStatelessRetry = 3,
    ServerCleartext = 4,
    ClientCleartext = 5,
    ZeroRttProtected = 6,
    OneRttKeyPhase0 = 7,
    OneRttKeyPhase1 = 8,
    PublicReset = 9,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HeaderForm {
    Long {
        packet_type: LongPacketType,
        version: u32,
    },
    Short {
        key_phase: bool,
        packet_number_len: PacketNumberLen,
    },
}

/// A datagram split into header fields and payload. The header and payload slices share the
///  datagram's storage and stay valid as long as the caller keeps the packet around.
#[derive(Clone, Eq, PartialEq)]
pub struct DecodedPacket {
    form: HeaderForm,
    connection_id: Option<u64>,
    /// for short headers, this is the truncated value as read from the wire
    packet_number: u32,
    header: Bytes,
    payload: Bytes,
}
impl Debug for DecodedPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cid = self.connection_id
            .map(|cid| format!("{:x}", cid))
            .unwrap_or("-".to_string());

        match self.form {
            HeaderForm::Long { packet_type, version } => {
                write!(f, "PCKT{{L:{:?}[{}]#{}@{:x}:{}}}", packet_type, cid, self.packet_number, version, self.payload.len())
            }
            HeaderForm::Short { key_phase, .. } => {
                write!(f, "PCKT{{S{}[{}]#{}:{}}}", if key_phase { 1 } else { 0 }, cid, self.packet_number, self.payload.len())
            }
        }
    }
}

fn invalid_header<E>(_: E) -> QuicError {
    QuicError::InvalidPacketHeader
}

pub fn decode_packet(datagram: &Bytes) -> Result<DecodedPacket, QuicError> {
    DecodedPacket::decode(datagram)
}

impl DecodedPacket {
    pub fn form(&self) -> HeaderForm {
        self.form
    }

    pub fn connection_id(&self) -> Option<u64> {
        self.connection_id
    }

    pub fn packet_number(&self) -> u32 {
        self.packet_number
    }

    pub fn header(&self) -> &Bytes {
        &self.header
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn long_packet_type(&self) -> Option<LongPacketType> {
        match self.form {
            HeaderForm::Long { packet_type, .. } => Some(packet_type),
            HeaderForm::Short { .. } => None,
        }
    }

    pub fn version(&self) -> Option<u32> {
        match self.form {
            HeaderForm::Long { version, .. } => Some(version),
            HeaderForm::Short { .. } => None,
        }
    }

    /// total length of the datagram this packet was decoded from
    pub fn len(&self) -> usize {
        self.header.len() + self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Splits a datagram into header and payload. Only the header is validated; payload
    ///  protection is checked by the connection that owns the packet.
    pub fn decode(datagram: &Bytes) -> Result<DecodedPacket, QuicError> {
        let mut buf: &[u8] = datagram.as_ref();
        let flags = Flags::from_bits_retain(buf.try_get_u8().map_err(invalid_header)?);

        let (form, connection_id, packet_number) = if flags.contains(Flags::LONG_HEADER) {
            let packet_type = LongPacketType::try_from((flags & Flags::MASK_LONG_TYPE).bits())
                .map_err(invalid_header)?;
            let connection_id = buf.try_get_u64().map_err(invalid_header)?;
            let packet_number = buf.try_get_u32().map_err(invalid_header)?;
            let version = buf.try_get_u32().map_err(invalid_header)?;

            (HeaderForm::Long { packet_type, version }, Some(connection_id), packet_number)
        }
        else {
            let packet_number_len = PacketNumberLen::from_type_code((flags & Flags::MASK_SHORT_TYPE).bits())?;
            let connection_id = if flags.contains(Flags::HAS_CONNECTION_ID) {
                Some(buf.try_get_u64().map_err(invalid_header)?)
            }
            else {
                None
            };
            let packet_number = match packet_number_len {
                PacketNumberLen::One => u32::from(buf.try_get_u8().map_err(invalid_header)?),
                PacketNumberLen::Two => u32::from(buf.try_get_u16().map_err(invalid_header)?),
                PacketNumberLen::Four => buf.try_get_u32().map_err(invalid_header)?,
            };

            let form = HeaderForm::Short {
                key_phase: flags.contains(Flags::KEY_PHASE),
                packet_number_len,
            };
            (form, connection_id, packet_number)
        };

        let header_len = datagram.len() - buf.len();
        let result = DecodedPacket {
            form,
            connection_id,
            packet_number,
            header: datagram.slice(..header_len),
            payload: datagram.slice(header_len..),
        };
        trace!("decoded {:?}", result);
        Ok(result)
    }

    /// Writes the header exactly as it was decoded
    pub fn encode_header(&self, buf: &mut impl BufMut) {
        match self.form {
            HeaderForm::Long { packet_type, version } => {
                encode_long_header(buf, packet_type, self.connection_id.unwrap_or_default(), self.packet_number, version);
            }
            HeaderForm::Short { key_phase, packet_number_len } => {
                write_short_header(buf, self.connection_id, key_phase, self.packet_number, packet_number_len);
            }
        }
    }
}

pub fn encode_long_header(buf: &mut impl BufMut, packet_type: LongPacketType, connection_id: u64, packet_number: u32, version: u32) {
    buf.put_u8((Flags::LONG_HEADER | Flags::from_bits_retain(packet_type.into())).bits());
    buf.put_u64(connection_id);
    buf.put_u32(packet_number);
    buf.put_u32(version);
}

/// Writes a short header with the narrowest packet number encoding the peer can reconstruct
///  given the largest packet number it acknowledged, and returns the chosen width
pub fn encode_short_header(buf: &mut impl BufMut, connection_id: Option<u64>, key_phase: bool, packet_number: u32, largest_acked: Option<u32>) -> PacketNumberLen {
    let packet_number_len = PacketNumberLen::for_packet(packet_number, largest_acked);
    write_short_header(buf, connection_id, key_phase, packet_number, packet_number_len);
    packet_number_len
}

/// `packet_number` is truncated to the given width
fn write_short_header(buf: &mut impl BufMut, connection_id: Option<u64>, key_phase: bool, packet_number: u32, packet_number_len: PacketNumberLen) {
    let mut flags = Flags::from_bits_retain(packet_number_len.type_code());
    flags.set(Flags::HAS_CONNECTION_ID, connection_id.is_some());
    flags.set(Flags::KEY_PHASE, key_phase);
    buf.put_u8(flags.bits());

    if let Some(connection_id) = connection_id {
        buf.put_u64(connection_id);
    }

    let truncated = packet_number_len.truncate(packet_number);
    match packet_number_len {
        PacketNumberLen::One => buf.put_u8(truncated as u8),
        PacketNumberLen::Two => buf.put_u16(truncated as u16),
        PacketNumberLen::Four => buf.put_u32(truncated),
    }
}

pub fn short_header_len(has_connection_id: bool, packet_number_len: PacketNumberLen) -> usize {
    1 + if has_connection_id { 8 } else { 0 } + packet_number_len.num_bytes()
}

/// A version negotiation packet echoes the connection id, packet number and version of the
///  client's packet and lists the versions the server supports as payload.
pub fn encode_version_negotiation(buf: &mut impl BufMut, client_packet: &DecodedPacket, supported_versions: &[u32]) {
    encode_long_header(
        buf,
        LongPacketType::VersionNegotiation,
        client_packet.connection_id.unwrap_or_default(),
        client_packet.packet_number,
        client_packet.version().unwrap_or_default(),
    );
    for &version in supported_versions {
        buf.put_u32(version);
    }
}

/// The payload of a version negotiation packet is a plain list of u32 versions
pub fn decode_version_list(payload: &[u8]) -> Result<Vec<u32>, QuicError> {
    if payload.len() % 4 != 0 {
        return Err(QuicError::InvalidPacketHeader);
    }
    let mut buf = payload;
    let mut result = Vec::with_capacity(payload.len() / 4);
    while buf.has_remaining() {
        result.push(buf.get_u32());
    }
    Ok(result)
}

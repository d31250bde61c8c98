//! A QUIC connection engine: reliable, ordered, multiplexed byte streams over an unreliable
//!  datagram network, with transport-level encryption negotiated through a pluggable TLS-like
//!  handshake.
//!
//! The engine is synchronous and does no I/O of its own. The application decodes received
//!  datagrams with [packet_header::decode_packet], passes them to a [connection::Connection]
//!  (or lets an [end_point::EndPoint] route them), and transmits whatever
//!  [connection::Connection::send] returns.
//!
//! ## Packets
//!
//! There are two header forms (all numbers in network byte order):
//!
//! ```ascii
//! long header (17 bytes):
//! 0:  0x80 | packet type
//! 1:  connection id (u64)
//! 9:  packet number (u32)
//! 13: version (u32)
//!
//! short header:
//! 0:  flags: 0x40 = connection id present, 0x20 = key phase, low bits = packet number width
//! 1:  connection id (u64, optional)
//! *:  packet number, truncated to 1, 2 or 4 bytes
//! ```
//!
//! Long headers are used during the handshake. Their payload is protected by a CRC-64 trailer
//!  only. Once the handshake completes, packets have short headers, and their payload is
//!  encrypted with AES-256-GCM using keys derived from secrets exported by the handshake.
//!
//! The payload is a sequence of frames (STREAM, ACK, PADDING, PING, CONNECTION_CLOSE), with
//!  variable-length integers in LEB128 encoding.
//!
//! ## Streams
//!
//! Stream 0 carries the handshake. Clients open odd-numbered streams, servers even-numbered
//!  ones, and peer-opened streams are announced through a [stream_handler::StreamOpenHandler].
//!  Both sides advertise transport parameters in the handshake that limit how much the peer
//!  may send per stream and per connection, and how many streams it may open.
//!
//! Lost packets are detected when an acknowledgement covers a packet number at least three
//!  higher, or when the application's retransmission timer fires. Their data is sent again in
//!  new packets.

pub mod config;
pub mod connection;
pub mod end_point;
pub mod error;
pub mod frames;
pub mod handshake;
pub mod packet_allocator;
pub mod packet_header;
pub mod packet_number;
pub mod packet_protection;
pub mod range_set;
pub mod receive_stream;
pub mod safe_converter;
pub mod send_stream;
pub mod sent_packets;
pub mod stream;
pub mod stream_handler;
pub mod test_util;
pub mod transport_parameters;

//! Connection-level limits exchanged in a handshake extension.
//!
//! ```ascii
//! client hello:          u32 initial_version
//! encrypted extensions:  u32 negotiated_version
//!                        u8  byte length of the following list
//!                        u32 supported version (repeated)
//! both:                  u16 byte length of the following list
//!                        (u16 id, u16 length, value) (repeated)
//! ```
//!
//! Parameter ids: 0 initial_max_stream_data (u32), 1 initial_max_data (u32, in KB),
//!  2 initial_max_stream_id (u32), 3 idle_timeout (u16, in seconds), 4 truncate_connection_id
//!  (no value). The first four are mandatory, unknown ids are skipped.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;
use crate::error::QuicError;
use crate::safe_converter::PrecheckedCast;

/// Extension type carrying transport parameters in the handshake
pub const TRANSPORT_PARAMETERS_EXTENSION: u16 = 26;

const ID_INITIAL_MAX_STREAM_DATA: u16 = 0;
const ID_INITIAL_MAX_DATA: u16 = 1;
const ID_INITIAL_MAX_STREAM_ID: u16 = 2;
const ID_IDLE_TIMEOUT: u16 = 3;
const ID_TRUNCATE_CONNECTION_ID: u16 = 4;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransportParameters {
    /// in octets
    pub initial_max_stream_data: u32,
    /// in KB
    pub initial_max_data: u32,
    pub initial_max_stream_id: u32,
    /// in seconds
    pub idle_timeout: u16,
    pub truncate_connection_id: bool,
}

impl Default for TransportParameters {
    fn default() -> Self {
        TransportParameters {
            initial_max_stream_data: 1024 * 1024,
            initial_max_data: 16 * 1024,
            initial_max_stream_id: 100,
            idle_timeout: 60,
            truncate_connection_id: false,
        }
    }
}

fn malformed<E>(_: E) -> QuicError {
    QuicError::HandshakeFailed
}

impl TransportParameters {
    pub fn max_data_bytes(&self) -> u64 {
        u64::from(self.initial_max_data) * 1024
    }

    fn ser_params(&self, buf: &mut BytesMut) {
        let mut params = BytesMut::new();

        params.put_u16(ID_INITIAL_MAX_STREAM_DATA);
        params.put_u16(4);
        params.put_u32(self.initial_max_stream_data);

        params.put_u16(ID_INITIAL_MAX_DATA);
        params.put_u16(4);
        params.put_u32(self.initial_max_data);

        params.put_u16(ID_INITIAL_MAX_STREAM_ID);
        params.put_u16(4);
        params.put_u32(self.initial_max_stream_id);

        params.put_u16(ID_IDLE_TIMEOUT);
        params.put_u16(2);
        params.put_u16(self.idle_timeout);

        if self.truncate_connection_id {
            params.put_u16(ID_TRUNCATE_CONNECTION_ID);
            params.put_u16(0);
        }

        buf.put_u16(params.len().prechecked_cast());
        buf.put_slice(&params);
    }

    fn deser_params(buf: &mut impl Buf) -> Result<TransportParameters, QuicError> {
        let params_len = buf.try_get_u16().map_err(malformed)? as usize;
        if params_len != buf.remaining() {
            debug!("transport parameters: length {} does not match remaining {} bytes", params_len, buf.remaining());
            return Err(QuicError::HandshakeFailed);
        }

        let mut initial_max_stream_data = None;
        let mut initial_max_data = None;
        let mut initial_max_stream_id = None;
        let mut idle_timeout = None;
        let mut truncate_connection_id = false;

        let mut seen = Vec::new();
        while buf.has_remaining() {
            let id = buf.try_get_u16().map_err(malformed)?;
            let len = buf.try_get_u16().map_err(malformed)? as usize;
            if len > buf.remaining() {
                return Err(QuicError::HandshakeFailed);
            }
            if seen.contains(&id) {
                debug!("transport parameters: duplicate id {}", id);
                return Err(QuicError::HandshakeFailed);
            }
            seen.push(id);

            let mut value = buf.copy_to_bytes(len);
            match (id, len) {
                (ID_INITIAL_MAX_STREAM_DATA, 4) => initial_max_stream_data = Some(value.get_u32()),
                (ID_INITIAL_MAX_DATA, 4) => initial_max_data = Some(value.get_u32()),
                (ID_INITIAL_MAX_STREAM_ID, 4) => initial_max_stream_id = Some(value.get_u32()),
                (ID_IDLE_TIMEOUT, 2) => idle_timeout = Some(value.get_u16()),
                (ID_TRUNCATE_CONNECTION_ID, 0) => truncate_connection_id = true,
                (ID_INITIAL_MAX_STREAM_DATA..=ID_TRUNCATE_CONNECTION_ID, _) => {
                    debug!("transport parameters: invalid length {} for id {}", len, id);
                    return Err(QuicError::HandshakeFailed);
                }
                _ => debug!("transport parameters: skipping unknown id {}", id),
            }
        }

        match (initial_max_stream_data, initial_max_data, initial_max_stream_id, idle_timeout) {
            (Some(initial_max_stream_data), Some(initial_max_data), Some(initial_max_stream_id), Some(idle_timeout)) => {
                Ok(TransportParameters {
                    initial_max_stream_data,
                    initial_max_data,
                    initial_max_stream_id,
                    idle_timeout,
                    truncate_connection_id,
                })
            }
            _ => {
                debug!("transport parameters: mandatory parameter missing");
                Err(QuicError::HandshakeFailed)
            }
        }
    }

    /// The extension payload a client sends in its hello
    pub fn ser_client(&self, initial_version: u32) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32(initial_version);
        self.ser_params(&mut buf);
        buf.freeze()
    }

    /// Returns the client's initial version and its parameters
    pub fn deser_client(mut buf: &[u8]) -> Result<(u32, TransportParameters), QuicError> {
        let initial_version = buf.try_get_u32().map_err(malformed)?;
        let params = Self::deser_params(&mut buf)?;
        Ok((initial_version, params))
    }

    /// The extension payload a server sends in its encrypted extensions
    pub fn ser_server(&self, negotiated_version: u32, supported_versions: &[u32]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32(negotiated_version);
        buf.put_u8((supported_versions.len() * 4).prechecked_cast());
        for &version in supported_versions {
            buf.put_u32(version);
        }
        self.ser_params(&mut buf);
        buf.freeze()
    }

    /// Returns the negotiated version, the server's supported versions and its parameters
    pub fn deser_server(mut buf: &[u8]) -> Result<(u32, Vec<u32>, TransportParameters), QuicError> {
        let negotiated_version = buf.try_get_u32().map_err(malformed)?;
        let versions_len = buf.try_get_u8().map_err(malformed)? as usize;
        if versions_len % 4 != 0 || versions_len > buf.remaining() {
            return Err(QuicError::HandshakeFailed);
        }
        let mut supported_versions = Vec::with_capacity(versions_len / 4);
        for _ in 0..versions_len / 4 {
            supported_versions.push(buf.get_u32());
        }
        let params = Self::deser_params(&mut buf)?;
        Ok((negotiated_version, supported_versions, params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn params(truncate_connection_id: bool) -> TransportParameters {
        TransportParameters {
            initial_max_stream_data: 65536,
            initial_max_data: 1024,
            initial_max_stream_id: 40,
            idle_timeout: 30,
            truncate_connection_id,
        }
    }

    #[rstest]
    #[case::plain(params(false))]
    #[case::truncate_cid(params(true))]
    #[case::defaults(TransportParameters::default())]
    fn test_client_ser_deser(#[case] params: TransportParameters) {
        let buf = params.ser_client(0xff00_0005);
        assert_eq!(TransportParameters::deser_client(&buf), Ok((0xff00_0005, params)));
    }

    #[rstest]
    #[case::one_version(vec![0xff00_0005])]
    #[case::several_versions(vec![0xff00_0005, 0xff00_0004, 1])]
    fn test_server_ser_deser(#[case] versions: Vec<u32>) {
        let buf = params(true).ser_server(0xff00_0005, &versions);
        assert_eq!(TransportParameters::deser_server(&buf), Ok((0xff00_0005, versions, params(true))));
    }

    #[test]
    fn test_wire_layout() {
        let buf = params(false).ser_client(7);
        assert_eq!(buf.as_ref(), &[
            0, 0, 0, 7,
            0, 30,
            0, 0, 0, 4, 0, 1, 0, 0,
            0, 1, 0, 4, 0, 0, 4, 0,
            0, 2, 0, 4, 0, 0, 0, 40,
            0, 3, 0, 2, 0, 30,
        ]);
    }

    #[test]
    fn test_unknown_id_is_skipped() {
        let mut buf = BytesMut::new();
        buf.put_u32(7);
        let mut list = BytesMut::new();
        list.put_slice(&params(false).ser_client(7)[6..]);
        list.put_u16(99);
        list.put_u16(3);
        list.put_slice(b"abc");
        buf.put_u16(list.len() as u16);
        buf.put_slice(&list);

        assert_eq!(TransportParameters::deser_client(&buf), Ok((7, params(false))));
    }

    fn client_ext(entries: Vec<(u16, Vec<u8>)>) -> Vec<u8> {
        let mut list = BytesMut::new();
        for (id, value) in entries {
            list.put_u16(id);
            list.put_u16(value.len() as u16);
            list.put_slice(&value);
        }
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u16(list.len() as u16);
        buf.put_slice(&list);
        buf.to_vec()
    }

    #[rstest]
    #[case::missing_idle_timeout(client_ext(vec![(0, vec![0, 0, 0, 1]), (1, vec![0, 0, 0, 1]), (2, vec![0, 0, 0, 1])]))]
    #[case::duplicate(client_ext(vec![(0, vec![0, 0, 0, 1]), (0, vec![0, 0, 0, 1]), (1, vec![0, 0, 0, 1]), (2, vec![0, 0, 0, 1]), (3, vec![0, 1])]))]
    #[case::wrong_length(client_ext(vec![(0, vec![0, 0, 1]), (1, vec![0, 0, 0, 1]), (2, vec![0, 0, 0, 1]), (3, vec![0, 1])]))]
    #[case::truncate_with_value(client_ext(vec![(0, vec![0, 0, 0, 1]), (1, vec![0, 0, 0, 1]), (2, vec![0, 0, 0, 1]), (3, vec![0, 1]), (4, vec![1])]))]
    #[case::truncated_version(vec![0, 0])]
    #[case::length_mismatch(vec![0, 0, 0, 1, 0, 10, 0, 0])]
    fn test_malformed(#[case] buf: Vec<u8>) {
        assert_eq!(TransportParameters::deser_client(&buf), Err(QuicError::HandshakeFailed));
    }

    #[test]
    fn test_server_versions_truncated() {
        assert_eq!(TransportParameters::deser_server(&[0, 0, 0, 1, 8, 0, 0, 0, 1]), Err(QuicError::HandshakeFailed));
    }

    #[test]
    fn test_max_data_bytes() {
        assert_eq!(params(false).max_data_bytes(), 1024 * 1024);
    }
}

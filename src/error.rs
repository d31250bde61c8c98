use std::fmt::{Display, Formatter};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Local representation of transport error codes is `TRANSPORT_ERROR_BASE + <wire code>`
pub const TRANSPORT_ERROR_BASE: u16 = 1024;
/// Internal errors are never put on the wire
pub const INTERNAL_ERROR_BASE: u16 = 1280;

pub type Result<T> = std::result::Result<T, QuicError>;

/// All errors the engine reports. The numeric values are stable: transport errors map 1:1 to
///  the code carried in a CONNECTION_CLOSE frame (after subtracting [TRANSPORT_ERROR_BASE]),
///  internal errors are local diagnostics only.
#[repr(u16)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum QuicError {
    NoError = 1024,
    InternalError = 1025,
    InvalidPacketHeader = 1027,
    InvalidFrameData = 1028,
    ClosedCriticalStream = 1031,
    DecryptionFailure = 1036,
    TooManyOpenStreams = 1042,
    InvalidVersion = 1044,
    HandshakeFailed = 1052,
    InvalidStreamData = 1070,
    MissingPayload = 1072,
    EmptyStreamFrameNoFin = 1074,
    VersionNegotiationMismatch = 1079,
    UnencryptedStreamData = 1085,

    /// The peer's handshake data exceeds the configured bound. Fatal, but local: the peer
    ///  sees `InternalError`.
    HandshakeTooLarge = 1281,
    /// A single packet was dropped without affecting connection state
    PacketIgnored = 1282,
}

impl QuicError {
    pub fn code(self) -> u16 {
        self.into()
    }

    pub fn is_transport_error(self) -> bool {
        (TRANSPORT_ERROR_BASE..INTERNAL_ERROR_BASE).contains(&self.code())
    }

    /// The code that goes into a CONNECTION_CLOSE frame, `None` for internal errors
    pub fn wire_code(self) -> Option<u16> {
        if self.is_transport_error() {
            Some(self.code() - TRANSPORT_ERROR_BASE)
        }
        else {
            None
        }
    }

    /// Maps a code received in a CONNECTION_CLOSE frame back to a known error kind. Unknown
    ///  codes are legal on the wire and yield `None`.
    pub fn from_wire_code(wire_code: u32) -> Option<QuicError> {
        let wire_code: u16 = wire_code.try_into().ok()?;
        let local = wire_code.checked_add(TRANSPORT_ERROR_BASE)?;
        QuicError::try_from(local).ok()
            .filter(|e| e.is_transport_error())
    }

    /// Connection-terminating errors. [QuicError::PacketIgnored] is the only recoverable one.
    pub fn is_fatal(self) -> bool {
        self != QuicError::PacketIgnored
    }
}

impl Display for QuicError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let description = match self {
            QuicError::NoError => "no error",
            QuicError::InternalError => "internal error",
            QuicError::InvalidPacketHeader => "invalid packet header",
            QuicError::InvalidFrameData => "invalid frame data",
            QuicError::ClosedCriticalStream => "closed critical stream",
            QuicError::DecryptionFailure => "decryption failure",
            QuicError::TooManyOpenStreams => "too many open streams",
            QuicError::InvalidVersion => "invalid version",
            QuicError::HandshakeFailed => "handshake failed",
            QuicError::InvalidStreamData => "invalid stream data",
            QuicError::MissingPayload => "missing payload",
            QuicError::EmptyStreamFrameNoFin => "empty stream frame without fin",
            QuicError::VersionNegotiationMismatch => "version negotiation mismatch",
            QuicError::UnencryptedStreamData => "unencrypted stream data",
            QuicError::HandshakeTooLarge => "handshake too large",
            QuicError::PacketIgnored => "packet ignored",
        };
        write!(f, "{} ({})", description, self.code())
    }
}

impl std::error::Error for QuicError {}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::invalid_packet_header(QuicError::InvalidPacketHeader, Some(0x3))]
    #[case::invalid_frame_data(QuicError::InvalidFrameData, Some(0x4))]
    #[case::closed_critical_stream(QuicError::ClosedCriticalStream, Some(0x7))]
    #[case::missing_payload(QuicError::MissingPayload, Some(0x30))]
    #[case::invalid_stream_data(QuicError::InvalidStreamData, Some(0x2e))]
    #[case::unencrypted_stream_data(QuicError::UnencryptedStreamData, Some(0x3d))]
    #[case::decryption_failure(QuicError::DecryptionFailure, Some(0xc))]
    #[case::too_many_open_streams(QuicError::TooManyOpenStreams, Some(0x12))]
    #[case::invalid_version(QuicError::InvalidVersion, Some(0x14))]
    #[case::empty_stream_frame_no_fin(QuicError::EmptyStreamFrameNoFin, Some(0x32))]
    #[case::version_negotiation_mismatch(QuicError::VersionNegotiationMismatch, Some(0x37))]
    #[case::handshake_too_large(QuicError::HandshakeTooLarge, None)]
    #[case::packet_ignored(QuicError::PacketIgnored, None)]
    fn test_wire_code(#[case] error: QuicError, #[case] expected: Option<u16>) {
        assert_eq!(error.wire_code(), expected);
        if let Some(wire_code) = expected {
            assert_eq!(QuicError::from_wire_code(wire_code as u32), Some(error));
        }
    }

    #[rstest]
    #[case::handshake_too_large(1281, Some(QuicError::HandshakeTooLarge))]
    #[case::packet_ignored(1282, Some(QuicError::PacketIgnored))]
    #[case::unknown(1283, None)]
    #[case::below_transport_base(3, None)]
    fn test_from_local_code(#[case] code: u16, #[case] expected: Option<QuicError>) {
        assert_eq!(QuicError::try_from(code).ok(), expected);
    }

    #[rstest]
    #[case::unknown_code(0x99)]
    #[case::internal_range(256 + 1)]
    #[case::overflow(u32::MAX)]
    fn test_from_wire_code_unknown(#[case] wire_code: u32) {
        assert_eq!(QuicError::from_wire_code(wire_code), None);
    }

    #[test]
    fn test_only_packet_ignored_is_recoverable() {
        assert!(!QuicError::PacketIgnored.is_fatal());
        assert!(QuicError::HandshakeTooLarge.is_fatal());
        assert!(QuicError::InvalidStreamData.is_fatal());
    }

    #[test]
    fn test_display() {
        assert_eq!(QuicError::InvalidStreamData.to_string(), "invalid stream data (1070)");
    }
}

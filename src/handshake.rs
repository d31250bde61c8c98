#[cfg(test)] use mockall::automock;
use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};
use crate::error::QuicError;
use crate::packet_header::PROTOCOL_VERSION;
use crate::packet_protection::{Aes256GcmProtection, OneRttKeys, CLIENT_1RTT_SECRET_LABEL, SERVER_1RTT_SECRET_LABEL};
use crate::transport_parameters::{TransportParameters, TRANSPORT_PARAMETERS_EXTENSION};

/// Failures reported by a handshake provider. They surface as [QuicError::HandshakeFailed].
pub type HandshakeError = anyhow::Error;

/// A handshake extension, identified by its type
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Extension {
    pub ext_type: u16,
    pub data: Bytes,
}

/// Extensions exchanged through the handshake: `additional_extensions` are sent to the peer,
///  the provider places the peer's extensions in `collected_extensions`.
#[derive(Clone, Debug, Default)]
pub struct HandshakeProperties {
    pub additional_extensions: Vec<Extension>,
    pub collected_extensions: Vec<Extension>,
}

impl HandshakeProperties {
    fn collected(&self, ext_type: u16) -> Option<&Extension> {
        self.collected_extensions.iter()
            .find(|e| e.ext_type == ext_type)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HandshakeStatus {
    InProgress,
    Complete,
}

/// One side of a TLS-like handshake, driven as a byte-oriented machine: peer bytes go in, bytes
///  for the peer are appended to `out`.
#[cfg_attr(test, automock)]
pub trait HandshakeProvider: Send {
    fn handle_input(&mut self, input: &[u8], out: &mut BytesMut, props: &mut HandshakeProperties) -> Result<HandshakeStatus, HandshakeError>;

    /// Exports a 32-byte secret for a label, available once the handshake is complete
    fn export_secret(&self, label: &str) -> Result<[u8; 32], HandshakeError>;
}

/// Creates a handshake provider per connection
pub trait HandshakeContext: Send + Sync {
    fn new_session(&self, is_server: bool, server_name: Option<&str>) -> Box<dyn HandshakeProvider>;
}

/// The handshake progress of a connection. States only ever move forward.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ConnectionState {
    BeforeServerHello,
    BeforeServerFinished,
    OneRttEncrypted,
}

/// Drives the handshake provider on behalf of a connection: it adds the local transport
///  parameters to the handshake, extracts and validates the peer's, derives 1-RTT keys on
///  completion and owns the connection's [ConnectionState].
pub struct HandshakeCoordinator {
    provider: Box<dyn HandshakeProvider>,
    is_client: bool,
    state: ConnectionState,
    props: HandshakeProperties,
    supported_versions: Vec<u32>,
    peer_params: Option<TransportParameters>,
    one_rtt_keys: Option<OneRttKeys>,
}

impl HandshakeCoordinator {
    /// Starts a client handshake, writing the client's first flight to `out`
    pub fn new_client(
        provider: Box<dyn HandshakeProvider>,
        local_params: &TransportParameters,
        mut props: HandshakeProperties,
        out: &mut BytesMut,
    ) -> Result<HandshakeCoordinator, QuicError> {
        props.additional_extensions.push(Extension {
            ext_type: TRANSPORT_PARAMETERS_EXTENSION,
            data: local_params.ser_client(PROTOCOL_VERSION),
        });

        let mut result = HandshakeCoordinator {
            provider,
            is_client: true,
            state: ConnectionState::BeforeServerHello,
            props,
            supported_versions: vec![PROTOCOL_VERSION],
            peer_params: None,
            one_rtt_keys: None,
        };

        match result.call_provider(&[], out)? {
            HandshakeStatus::InProgress => Ok(result),
            HandshakeStatus::Complete => {
                warn!("handshake provider completed before receiving anything from the server");
                Err(QuicError::HandshakeFailed)
            }
        }
    }

    /// Prepares a server handshake. Nothing happens until the client's first flight is passed
    ///  to [HandshakeCoordinator::handle_input].
    pub fn new_server(
        provider: Box<dyn HandshakeProvider>,
        local_params: &TransportParameters,
        supported_versions: &[u32],
        mut props: HandshakeProperties,
    ) -> HandshakeCoordinator {
        props.additional_extensions.push(Extension {
            ext_type: TRANSPORT_PARAMETERS_EXTENSION,
            data: local_params.ser_server(PROTOCOL_VERSION, supported_versions),
        });

        HandshakeCoordinator {
            provider,
            is_client: false,
            state: ConnectionState::BeforeServerHello,
            props,
            supported_versions: supported_versions.to_vec(),
            peer_params: None,
            one_rtt_keys: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == ConnectionState::OneRttEncrypted
    }

    pub fn peer_params(&self) -> Option<&TransportParameters> {
        self.peer_params.as_ref()
    }

    pub fn one_rtt_keys(&self) -> Option<&OneRttKeys> {
        self.one_rtt_keys.as_ref()
    }

    pub fn properties(&self) -> &HandshakeProperties {
        &self.props
    }

    /// Feeds handshake bytes received from the peer, appending the response to `out`
    pub fn handle_input(&mut self, input: &[u8], out: &mut BytesMut) -> Result<(), QuicError> {
        if self.is_complete() {
            debug!("ignoring {} handshake bytes after completion", input.len());
            return Ok(());
        }

        let status = self.call_provider(input, out)?;
        self.process_peer_params()?;

        match status {
            HandshakeStatus::Complete => {
                if self.peer_params.is_none() {
                    warn!("handshake completed without peer transport parameters");
                    return Err(QuicError::HandshakeFailed);
                }
                self.one_rtt_keys = Some(self.derive_keys()?);
                self.advance(ConnectionState::OneRttEncrypted);
            }
            HandshakeStatus::InProgress => {
                if self.is_client && !input.is_empty() {
                    self.advance(ConnectionState::BeforeServerFinished);
                }
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn override_peer_params(&mut self, f: impl FnOnce(&mut TransportParameters)) {
        if let Some(params) = &mut self.peer_params {
            f(params);
        }
    }

    /// The server's first flight went out on the wire
    pub fn on_flight_sent(&mut self) {
        if !self.is_client {
            self.advance(ConnectionState::BeforeServerFinished);
        }
    }

    fn advance(&mut self, new_state: ConnectionState) {
        if new_state > self.state {
            debug!("connection state {:?} -> {:?}", self.state, new_state);
            self.state = new_state;
        }
    }

    fn call_provider(&mut self, input: &[u8], out: &mut BytesMut) -> Result<HandshakeStatus, QuicError> {
        self.provider.handle_input(input, out, &mut self.props)
            .map_err(|e| {
                warn!("handshake failed: {:#}", e);
                QuicError::HandshakeFailed
            })
    }

    fn process_peer_params(&mut self) -> Result<(), QuicError> {
        if self.peer_params.is_some() {
            return Ok(());
        }
        let Some(ext) = self.props.collected(TRANSPORT_PARAMETERS_EXTENSION) else {
            return Ok(());
        };

        let params = if self.is_client {
            let (negotiated_version, _, params) = TransportParameters::deser_server(&ext.data)?;
            if negotiated_version != PROTOCOL_VERSION {
                warn!("server negotiated version {:x}, but we offered {:x}", negotiated_version, PROTOCOL_VERSION);
                return Err(QuicError::VersionNegotiationMismatch);
            }
            params
        }
        else {
            let (initial_version, params) = TransportParameters::deser_client(&ext.data)?;
            if !self.supported_versions.contains(&initial_version) {
                warn!("client's initial version {:x} is not supported", initial_version);
                return Err(QuicError::InvalidVersion);
            }
            params
        };

        debug!("peer transport parameters: {:?}", params);
        self.peer_params = Some(params);
        Ok(())
    }

    fn derive_keys(&self) -> Result<OneRttKeys, QuicError> {
        let export = |label: &str| self.provider.export_secret(label)
            .map_err(|e| {
                warn!("exporting secret '{}' failed: {:#}", label, e);
                QuicError::HandshakeFailed
            });

        let client = Aes256GcmProtection::from_secret(&export(CLIENT_1RTT_SECRET_LABEL)?)?;
        let server = Aes256GcmProtection::from_secret(&export(SERVER_1RTT_SECRET_LABEL)?)?;

        Ok(if self.is_client {
            OneRttKeys { send: client, recv: server }
        }
        else {
            OneRttKeys { send: server, recv: client }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use bytes::BufMut;
    use mockall::predicate::*;
    use rstest::rstest;
    use crate::packet_protection::PacketProtection;

    fn server_ext(negotiated_version: u32) -> Extension {
        Extension {
            ext_type: TRANSPORT_PARAMETERS_EXTENSION,
            data: TransportParameters::default().ser_server(negotiated_version, &[PROTOCOL_VERSION]),
        }
    }

    fn client_ext(initial_version: u32) -> Extension {
        Extension {
            ext_type: TRANSPORT_PARAMETERS_EXTENSION,
            data: TransportParameters::default().ser_client(initial_version),
        }
    }

    /// a provider that emits `hello` on the first call and completes on the second, collecting
    ///  `peer_ext` on the second call
    fn two_step_provider(peer_ext: Option<Extension>) -> MockHandshakeProvider {
        let mut provider = MockHandshakeProvider::new();
        let mut seq = mockall::Sequence::new();
        provider.expect_handle_input()
            .once()
            .in_sequence(&mut seq)
            .returning(|_, out, _| {
                out.put_slice(b"hello");
                Ok(HandshakeStatus::InProgress)
            });
        provider.expect_handle_input()
            .once()
            .in_sequence(&mut seq)
            .returning(move |_, out, props| {
                out.put_slice(b"finished");
                if let Some(ext) = &peer_ext {
                    props.collected_extensions.push(ext.clone());
                }
                Ok(HandshakeStatus::Complete)
            });
        provider.expect_export_secret()
            .returning(|label| Ok(if label == CLIENT_1RTT_SECRET_LABEL { [1; 32] } else { [2; 32] }));
        provider
    }

    #[test]
    fn test_client_happy_path() {
        let mut out = BytesMut::new();
        let mut handshake = HandshakeCoordinator::new_client(
            Box::new(two_step_provider(Some(server_ext(PROTOCOL_VERSION)))),
            &TransportParameters::default(),
            HandshakeProperties::default(),
            &mut out,
        ).unwrap();
        assert_eq!(out.as_ref(), b"hello");
        assert_eq!(handshake.state(), ConnectionState::BeforeServerHello);
        assert_eq!(handshake.properties().additional_extensions[0].ext_type, TRANSPORT_PARAMETERS_EXTENSION);

        out.clear();
        handshake.handle_input(b"server hello", &mut out).unwrap();
        assert_eq!(out.as_ref(), b"finished");
        assert_eq!(handshake.state(), ConnectionState::OneRttEncrypted);
        assert_eq!(handshake.peer_params(), Some(&TransportParameters::default()));
        assert!(handshake.one_rtt_keys().is_some());

        // further input after completion is dropped without calling the provider
        handshake.handle_input(b"ticket", &mut out).unwrap();
    }

    #[rstest]
    #[case::missing_params(None, QuicError::HandshakeFailed)]
    #[case::version_mismatch(Some(server_ext(0x1a2a_3a4a)), QuicError::VersionNegotiationMismatch)]
    #[case::malformed(Some(Extension { ext_type: TRANSPORT_PARAMETERS_EXTENSION, data: Bytes::from_static(&[1, 2]) }), QuicError::HandshakeFailed)]
    fn test_client_rejects_peer_params(#[case] peer_ext: Option<Extension>, #[case] expected: QuicError) {
        let mut out = BytesMut::new();
        let mut handshake = HandshakeCoordinator::new_client(
            Box::new(two_step_provider(peer_ext)),
            &TransportParameters::default(),
            HandshakeProperties::default(),
            &mut out,
        ).unwrap();

        assert_eq!(handshake.handle_input(b"server hello", &mut out), Err(expected));
        assert_eq!(handshake.state(), ConnectionState::BeforeServerHello);
        assert!(handshake.one_rtt_keys().is_none());
    }

    #[test]
    fn test_client_intermediate_state() {
        let mut provider = MockHandshakeProvider::new();
        provider.expect_handle_input()
            .returning(|_, _, _| Ok(HandshakeStatus::InProgress));

        let mut out = BytesMut::new();
        let mut handshake = HandshakeCoordinator::new_client(Box::new(provider), &TransportParameters::default(), HandshakeProperties::default(), &mut out).unwrap();
        handshake.handle_input(b"partial", &mut out).unwrap();
        assert_eq!(handshake.state(), ConnectionState::BeforeServerFinished);

        // the client does not react to sent flights
        handshake.on_flight_sent();
        assert_eq!(handshake.state(), ConnectionState::BeforeServerFinished);
    }

    #[test]
    fn test_provider_failure() {
        let mut provider = MockHandshakeProvider::new();
        provider.expect_handle_input()
            .with(eq(b"".to_vec()), always(), always())
            .returning(|_, _, _| Err(anyhow!("no cipher suite")));

        let result = HandshakeCoordinator::new_client(Box::new(provider), &TransportParameters::default(), HandshakeProperties::default(), &mut BytesMut::new());
        assert!(matches!(result, Err(QuicError::HandshakeFailed)));
    }

    #[rstest]
    #[case::supported(PROTOCOL_VERSION, Ok(()))]
    #[case::unsupported(0x0a0a_0a0a, Err(QuicError::InvalidVersion))]
    fn test_server_checks_client_version(#[case] initial_version: u32, #[case] expected: Result<(), QuicError>) {
        let mut provider = MockHandshakeProvider::new();
        provider.expect_handle_input()
            .returning(move |_, out, props| {
                props.collected_extensions.push(client_ext(initial_version));
                out.put_slice(b"server flight");
                Ok(HandshakeStatus::InProgress)
            });

        let mut handshake = HandshakeCoordinator::new_server(Box::new(provider), &TransportParameters::default(), &[PROTOCOL_VERSION], HandshakeProperties::default());
        let mut out = BytesMut::new();
        assert_eq!(handshake.handle_input(b"client hello", &mut out), expected);
        assert_eq!(handshake.state(), ConnectionState::BeforeServerHello);
    }

    #[test]
    fn test_server_keys_mirror_client_keys() {
        let mut server = HandshakeCoordinator::new_server(
            Box::new(two_step_provider(Some(client_ext(PROTOCOL_VERSION)))),
            &TransportParameters::default(),
            &[PROTOCOL_VERSION],
            HandshakeProperties::default(),
        );
        let mut out = BytesMut::new();
        server.handle_input(b"client hello", &mut out).unwrap();
        server.on_flight_sent();
        assert_eq!(server.state(), ConnectionState::BeforeServerFinished);
        server.handle_input(b"client finished", &mut out).unwrap();
        assert_eq!(server.state(), ConnectionState::OneRttEncrypted);

        // a packet protected with the client secret is readable by the server
        let client_send = Aes256GcmProtection::from_secret(&[1; 32]).unwrap();
        let mut packet = BytesMut::from(&b"Hpayload"[..]);
        client_send.protect(5, 1, &mut packet);
        let packet = packet.freeze();
        let keys = server.one_rtt_keys().unwrap();
        assert_eq!(keys.recv.unprotect(5, b"H", &packet.slice(1..)).unwrap().as_ref(), b"payload");

        // no regression
        server.on_flight_sent();
        assert_eq!(server.state(), ConnectionState::OneRttEncrypted);
    }
}

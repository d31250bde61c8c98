use aead::{AeadInPlace, KeyInit, Nonce};
use aes_gcm::{Aes256Gcm, Key, Tag};
use bytes::{BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_64_REDIS};
use hkdf::Hkdf;
use sha2::Sha256;
use tracing::{debug, error};
use crate::error::QuicError;

const CHECKSUM: Crc<u64> = Crc::<u64>::new(&CRC_64_REDIS);

pub const CLIENT_1RTT_SECRET_LABEL: &str = "EXPORTER-QUIC client 1-RTT Secret";
pub const SERVER_1RTT_SECRET_LABEL: &str = "EXPORTER-QUIC server 1-RTT Secret";

/// Protection of a packet's payload. The header is never encrypted, but it is authenticated.
pub trait PacketProtection: Send + Sync {
    /// number of bytes `protect` appends to a packet
    fn overhead(&self) -> usize;

    /// Protects the payload in place. `packet` contains the header followed by the plaintext
    ///  payload, the result is written back to `packet` (including the trailer / tag).
    fn protect(&self, packet_number: u32, header_len: usize, packet: &mut BytesMut);

    /// Verifies (and decrypts) a payload, returning the plaintext
    fn unprotect(&self, packet_number: u32, header: &[u8], payload: &Bytes) -> Result<Bytes, QuicError>;
}

/// Handshake packets are not encrypted, they carry a CRC-64 over header and payload to detect
///  corruption.
pub struct CleartextProtection;

impl CleartextProtection {
    const CHECKSUM_LEN: usize = 8;

    fn checksum(header: &[u8], payload: &[u8]) -> u64 {
        let mut digest = CHECKSUM.digest();
        digest.update(header);
        digest.update(payload);
        digest.finalize()
    }
}

impl PacketProtection for CleartextProtection {
    fn overhead(&self) -> usize {
        Self::CHECKSUM_LEN
    }

    fn protect(&self, _packet_number: u32, header_len: usize, packet: &mut BytesMut) {
        let checksum = {
            let (header, payload) = packet.split_at(header_len);
            Self::checksum(header, payload)
        };
        packet.put_u64(checksum);
    }

    fn unprotect(&self, _packet_number: u32, header: &[u8], payload: &Bytes) -> Result<Bytes, QuicError> {
        if payload.len() < Self::CHECKSUM_LEN {
            debug!("cleartext packet too short for checksum");
            return Err(QuicError::DecryptionFailure);
        }
        let data_len = payload.len() - Self::CHECKSUM_LEN;
        let expected = u64::from_be_bytes(payload[data_len..].try_into()
            .map_err(|_| QuicError::DecryptionFailure)?);

        if Self::checksum(header, &payload[..data_len]) != expected {
            debug!("cleartext packet checksum mismatch");
            return Err(QuicError::DecryptionFailure);
        }
        Ok(payload.slice(..data_len))
    }
}


/// 1-RTT protection: AES-256-GCM with the nonce derived from the packet number and the header
///  as associated data
pub struct Aes256GcmProtection {
    cipher: Aes256Gcm,
    iv: [u8; 12],
}

impl Aes256GcmProtection {
    const TAG_LEN: usize = 16;

    pub fn new(key: &[u8; 32], iv: [u8; 12]) -> Aes256GcmProtection {
        Aes256GcmProtection {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            iv,
        }
    }

    /// Derives key and iv from a 32-byte traffic secret exported by the handshake
    pub fn from_secret(secret: &[u8; 32]) -> Result<Aes256GcmProtection, QuicError> {
        let mut key = [0u8; 32];
        let mut iv = [0u8; 12];
        hkdf_expand_label(secret, b"quic key", &mut key)?;
        hkdf_expand_label(secret, b"quic iv", &mut iv)?;
        Ok(Self::new(&key, iv))
    }

    fn nonce(&self, packet_number: u32) -> [u8; 12] {
        let mut nonce = self.iv;
        for (n, pn) in nonce[4..].iter_mut().zip(u64::from(packet_number).to_be_bytes()) {
            *n ^= pn;
        }
        nonce
    }
}

impl PacketProtection for Aes256GcmProtection {
    fn overhead(&self) -> usize {
        Self::TAG_LEN
    }

    fn protect(&self, packet_number: u32, header_len: usize, packet: &mut BytesMut) {
        let nonce = self.nonce(packet_number);
        let (header, payload) = packet.split_at_mut(header_len);

        match self.cipher.encrypt_in_place_detached(Nonce::<Aes256Gcm>::from_slice(&nonce), header, payload) {
            Ok(tag) => packet.put_slice(&tag),
            Err(e) => {
                // only fails for payloads beyond the cipher's length limit, far above any packet size
                error!("encryption error: {}", e);
                panic!("this is a bug: encryption of a packet payload failed");
            }
        }
    }

    fn unprotect(&self, packet_number: u32, header: &[u8], payload: &Bytes) -> Result<Bytes, QuicError> {
        if payload.len() < Self::TAG_LEN {
            debug!("protected packet too short for authentication tag");
            return Err(QuicError::DecryptionFailure);
        }
        let (ciphertext, tag) = payload.split_at(payload.len() - Self::TAG_LEN);
        let nonce = self.nonce(packet_number);

        let mut plaintext = BytesMut::from(ciphertext);
        self.cipher.decrypt_in_place_detached(Nonce::<Aes256Gcm>::from_slice(&nonce), header, &mut plaintext, Tag::from_slice(tag))
            .map_err(|_| {
                debug!("packet {} failed authentication", packet_number);
                QuicError::DecryptionFailure
            })?;
        Ok(plaintext.freeze())
    }
}

/// HKDF-Expand-Label with an empty context, as in TLS 1.3
fn hkdf_expand_label(secret: &[u8], label: &[u8], out: &mut [u8]) -> Result<(), QuicError> {
    let full_label_len = b"tls13 ".len() + label.len();

    let mut info = Vec::with_capacity(2 + 1 + full_label_len + 1);
    info.put_u16(out.len() as u16);
    info.put_u8(full_label_len as u8);
    info.put_slice(b"tls13 ");
    info.put_slice(label);
    info.put_u8(0);

    Hkdf::<Sha256>::from_prk(secret)
        .map_err(|_| QuicError::HandshakeFailed)?
        .expand(&info, out)
        .map_err(|_| QuicError::HandshakeFailed)
}

/// The packet protection for both directions once the handshake completed
pub struct OneRttKeys {
    pub send: Aes256GcmProtection,
    pub recv: Aes256GcmProtection,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn packet(header: &[u8], payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_slice(header);
        buf.put_slice(payload);
        buf
    }

    fn aes() -> Aes256GcmProtection {
        Aes256GcmProtection::from_secret(&[7u8; 32]).unwrap()
    }

    #[rstest]
    #[case::cleartext(Box::new(CleartextProtection))]
    #[case::aes(Box::new(aes()))]
    fn test_protect_unprotect(#[case] protection: Box<dyn PacketProtection>) {
        let header = b"HEADER";
        let mut buf = packet(header, b"some payload");
        protection.protect(17, header.len(), &mut buf);
        assert_eq!(buf.len(), header.len() + 12 + protection.overhead());

        let protected = buf.freeze();
        let plaintext = protection.unprotect(17, header, &protected.slice(header.len()..)).unwrap();
        assert_eq!(plaintext.as_ref(), b"some payload");
    }

    #[rstest]
    #[case::cleartext(Box::new(CleartextProtection))]
    #[case::aes(Box::new(aes()))]
    fn test_tampering_is_detected(#[case] protection: Box<dyn PacketProtection>) {
        let header = b"HEADER";
        let mut buf = packet(header, b"some payload");
        protection.protect(3, header.len(), &mut buf);
        let protected = buf.freeze();
        let payload = protected.slice(header.len()..);

        let mut tampered = payload.to_vec();
        tampered[2] ^= 1;
        assert_eq!(protection.unprotect(3, header, &Bytes::from(tampered)), Err(QuicError::DecryptionFailure));

        assert_eq!(protection.unprotect(3, b"HEADEr", &payload), Err(QuicError::DecryptionFailure));
        assert_eq!(protection.unprotect(3, header, &payload.slice(..4)), Err(QuicError::DecryptionFailure));
    }

    #[test]
    fn test_aes_binds_packet_number() {
        let protection = aes();
        let mut buf = packet(b"H", b"payload");
        protection.protect(1, 1, &mut buf);
        let protected = buf.freeze();
        assert_eq!(protection.unprotect(2, b"H", &protected.slice(1..)), Err(QuicError::DecryptionFailure));
    }

    #[test]
    fn test_aes_keys_differ_per_secret() {
        let sender = Aes256GcmProtection::from_secret(&[1u8; 32]).unwrap();
        let other = Aes256GcmProtection::from_secret(&[2u8; 32]).unwrap();
        let mut buf = packet(b"H", b"payload");
        sender.protect(1, 1, &mut buf);
        let protected = buf.freeze();
        assert!(other.unprotect(1, b"H", &protected.slice(1..)).is_err());
        assert!(sender.unprotect(1, b"H", &protected.slice(1..)).is_ok());
    }

    #[test]
    fn test_cleartext_layout() {
        let mut buf = packet(b"AB", b"CD");
        CleartextProtection.protect(0, 2, &mut buf);
        assert_eq!(&buf[..4], b"ABCD");
        assert_eq!(u64::from_be_bytes(buf[4..].try_into().unwrap()), CHECKSUM.checksum(b"ABCD"));
    }
}

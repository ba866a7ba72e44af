//! IPMI v2.0 RMCP+ session codec: header framing, the integrity trailer,
//! and AES-CBC payload confidentiality, parameterized by the negotiated
//! cipher suite.

use rand::RngCore;
use zeroize::Zeroizing;

use crate::crypto::{
    codes_match, decrypt_payload_aes_cbc, encrypt_payload_aes_cbc, integrity_check,
    CipherSuite, ConfidentialityAlgorithm, IntegrityAlgorithm,
};
use crate::error::{Error, Result};
use crate::proto::{check_rmcp_header, push_rmcp_header, RMCP_CLASS_IPMI};

/// RMCP+ session auth type/format byte.
const RMCPPLUS_AUTH_TYPE: u8 = 0x06;

/// RMCP+ session trailer next-header value.
const RMCPPLUS_NEXT_HEADER: u8 = 0x07;

/// Payload kind for an inner LAN message.
pub(crate) const PAYLOAD_KIND_IPMI: u8 = 0x00;

/// Keys and algorithms of an established RMCP+ session.
///
/// Immutable once negotiated; the codec reads it on every packet.
pub(crate) struct SessionCrypto {
    pub(crate) suite: CipherSuite,
    k1: Option<Zeroizing<Vec<u8>>>,
    aes_key: Option<Zeroizing<[u8; 16]>>,
    password20: Zeroizing<[u8; 20]>,
}

impl SessionCrypto {
    pub(crate) fn new(
        suite: CipherSuite,
        k1: Option<Zeroizing<Vec<u8>>>,
        aes_key: Option<Zeroizing<[u8; 16]>>,
        password20: Zeroizing<[u8; 20]>,
    ) -> Result<Self> {
        if suite.integrity != IntegrityAlgorithm::None
            && suite.integrity != IntegrityAlgorithm::Md5_128
            && k1.is_none()
        {
            return Err(Error::Crypto("integrity algorithm requires K1"));
        }
        if suite.confidentiality == ConfidentialityAlgorithm::AesCbc128 && aes_key.is_none() {
            return Err(Error::Crypto("confidentiality algorithm requires an AES key"));
        }
        Ok(Self {
            suite,
            k1,
            aes_key,
            password20,
        })
    }

    fn authenticated(&self) -> bool {
        self.suite.integrity != IntegrityAlgorithm::None
    }

    fn encrypted(&self) -> bool {
        self.suite.confidentiality != ConfidentialityAlgorithm::None
    }

    /// Integrity key: K1, except the raw-MD5 algorithm which keys with the
    /// padded password directly.
    fn integrity_key(&self) -> Result<&[u8]> {
        match self.suite.integrity {
            IntegrityAlgorithm::Md5_128 => Ok(&self.password20[..]),
            _ => self
                .k1
                .as_deref()
                .map(|k| &k[..])
                .ok_or(Error::Crypto("missing integrity key")),
        }
    }

    fn aes_key(&self) -> Result<&[u8; 16]> {
        self.aes_key
            .as_deref()
            .ok_or(Error::Crypto("missing confidentiality key"))
    }
}

/// A decoded RMCP+ packet; payload is verified and decrypted.
#[derive(Debug)]
pub(crate) struct DecodedPacket {
    pub(crate) payload_type: u8,
    pub(crate) is_authenticated: bool,
    #[allow(dead_code)]
    pub(crate) is_encrypted: bool,
    #[allow(dead_code)]
    pub(crate) session_id: u32,
    #[allow(dead_code)]
    pub(crate) session_seq: u32,
    pub(crate) payload: Vec<u8>,
}

/// Encode an RMCP+ session packet.
///
/// With `crypto` present the negotiated suite decides the integrity and
/// confidentiality bits; handshake traffic passes `None` and goes on the
/// wire unprotected.
pub(crate) fn encode_packet(
    crypto: Option<&SessionCrypto>,
    payload_kind: u8,
    session_id: u32,
    session_seq: u32,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let authenticated = crypto.is_some_and(SessionCrypto::authenticated);
    let encrypted = crypto.is_some_and(SessionCrypto::encrypted);

    let payload_bytes = if encrypted {
        let crypto = crypto.ok_or(Error::Crypto("missing session crypto"))?;
        let mut iv = [0u8; 16];
        rand::rng().fill_bytes(&mut iv);
        encrypt_payload_aes_cbc(payload, crypto.aes_key()?, &iv)?
    } else {
        payload.to_vec()
    };

    let payload_len: u16 = payload_bytes
        .len()
        .try_into()
        .map_err(|_| Error::Protocol("payload too large"))?;

    let mut type_byte = payload_kind & 0x3F;
    if authenticated {
        type_byte |= 0x40;
    }
    if encrypted {
        type_byte |= 0x80;
    }

    let mut packet = Vec::with_capacity(4 + 12 + payload_bytes.len() + 32);
    push_rmcp_header(&mut packet, RMCP_CLASS_IPMI);
    packet.push(RMCPPLUS_AUTH_TYPE);
    packet.push(type_byte);
    packet.extend_from_slice(&session_id.to_le_bytes());
    packet.extend_from_slice(&session_seq.to_le_bytes());
    packet.extend_from_slice(&payload_len.to_le_bytes());
    packet.extend_from_slice(&payload_bytes);

    if authenticated {
        let crypto = crypto.ok_or(Error::Crypto("missing session crypto"))?;

        // Integrity padding aligns session header + payload + 2 to 4 bytes.
        let base_len = 12 + payload_bytes.len() + 2;
        let pad_len = ((4 - (base_len % 4)) % 4) as u8;
        packet.extend(std::iter::repeat_n(0xFF, pad_len as usize));
        packet.push(pad_len);
        packet.push(RMCPPLUS_NEXT_HEADER);

        let code = integrity_check(crypto.suite.integrity, crypto.integrity_key()?, &packet[4..])?;
        packet.extend_from_slice(&code);
    }

    Ok(packet)
}

/// Decode an RMCP+ session packet, verifying the integrity trailer and
/// decrypting the payload as the bits demand.
pub(crate) fn decode_packet(
    crypto: Option<&SessionCrypto>,
    bytes: &[u8],
) -> Result<DecodedPacket> {
    check_rmcp_header(bytes, RMCP_CLASS_IPMI)?;
    if bytes.len() < 16 {
        return Err(Error::Protocol("session packet too short"));
    }
    if bytes[4] != RMCPPLUS_AUTH_TYPE {
        return Err(Error::Protocol("unsupported session auth type"));
    }

    let type_byte = bytes[5];
    let payload_type = type_byte & 0x3F;
    let is_authenticated = type_byte & 0x40 != 0;
    let is_encrypted = type_byte & 0x80 != 0;

    let session_id = u32::from_le_bytes(
        bytes[6..10]
            .try_into()
            .map_err(|_| Error::Protocol("invalid session id"))?,
    );
    let session_seq = u32::from_le_bytes(
        bytes[10..14]
            .try_into()
            .map_err(|_| Error::Protocol("invalid session seq"))?,
    );
    let payload_len = u16::from_le_bytes(
        bytes[14..16]
            .try_into()
            .map_err(|_| Error::Protocol("invalid payload len"))?,
    ) as usize;

    let payload_end = 16 + payload_len;
    if bytes.len() < payload_end {
        return Err(Error::Protocol("truncated payload"));
    }

    if is_authenticated {
        let crypto = crypto.ok_or(Error::Protocol(
            "authenticated packet outside an established session",
        ))?;
        let code_len = crypto.suite.integrity.check_len();
        if code_len == 0 {
            return Err(Error::Protocol("unexpected integrity trailer"));
        }
        if bytes.len() < payload_end + 2 + code_len {
            return Err(Error::Protocol("authenticated packet too short"));
        }

        let code_start = bytes.len() - code_len;
        let expected = integrity_check(
            crypto.suite.integrity,
            crypto.integrity_key()?,
            &bytes[4..code_start],
        )?;
        if !codes_match(&bytes[code_start..], &expected) {
            return Err(Error::AuthenticationFailed("invalid packet integrity check"));
        }

        let pad_len = bytes[code_start - 2];
        if bytes[code_start - 1] != RMCPPLUS_NEXT_HEADER {
            return Err(Error::Protocol("unexpected next header"));
        }
        let pad_bytes = &bytes[payload_end..code_start - 2];
        if pad_bytes.len() != pad_len as usize {
            return Err(Error::Protocol("pad length mismatch"));
        }
        if pad_bytes.iter().any(|&b| b != 0xFF) {
            return Err(Error::Protocol("invalid integrity pad bytes"));
        }
    }

    let raw_payload = &bytes[16..payload_end];
    let payload = if is_encrypted {
        let crypto = crypto.ok_or(Error::Protocol(
            "encrypted packet outside an established session",
        ))?;
        decrypt_payload_aes_cbc(raw_payload, crypto.aes_key()?)?
    } else {
        raw_payload.to_vec()
    };

    Ok(DecodedPacket {
        payload_type,
        is_authenticated,
        is_encrypted,
        session_id,
        session_seq,
        payload,
    })
}

//! Cryptographic primitives for both protocol generations: IPMI checksums,
//! the v1.5 keyed auth codes, RAKP authentication codes, session integrity
//! checks, and AES-CBC-128 confidentiality with IPMI padding.

use core::fmt;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use hmac::{Hmac, Mac};
use md2::Md2;
use md5::{Digest, Md5};
use sha1::Sha1;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::{Error, Result};
use crate::types::AuthType;

/// A minimal secret container that zeroizes its contents on drop.
///
/// This is intentionally small and avoids exposing secrets via `Debug`.
#[derive(Clone)]
pub(crate) struct SecretBytes(Vec<u8>);

impl SecretBytes {
    pub(crate) fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Truncate/zero-pad to the fixed 16-byte key used by v1.5 auth codes.
    pub(crate) fn to_key_16(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        let n = self.0.len().min(out.len());
        out[..n].copy_from_slice(&self.0[..n]);
        out
    }

    /// Truncate/zero-pad to the fixed 20-byte key used by RAKP.
    pub(crate) fn to_key_20(&self) -> [u8; 20] {
        let mut out = [0u8; 20];
        let n = self.0.len().min(out.len());
        out[..n].copy_from_slice(&self.0[..n]);
        out
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<secret>")
    }
}

impl Drop for SecretBytes {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// RAKP authentication algorithm numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthAlgorithm {
    /// RAKP-none (no key exchange authentication).
    None = 0x00,
    /// RAKP-HMAC-SHA1.
    HmacSha1 = 0x01,
    /// RAKP-HMAC-MD5.
    HmacMd5 = 0x02,
    /// RAKP-HMAC-SHA256.
    HmacSha256 = 0x03,
}

/// Session integrity algorithm numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IntegrityAlgorithm {
    /// No integrity trailer.
    None = 0x00,
    /// HMAC-SHA1 truncated to 12 bytes.
    HmacSha1_96 = 0x01,
    /// HMAC-MD5, full 16 bytes.
    HmacMd5_128 = 0x02,
    /// Raw keyed MD5 (`MD5(key || data || key)`), 16 bytes, keyed by the
    /// padded password rather than K1.
    Md5_128 = 0x03,
    /// HMAC-SHA256 truncated to 16 bytes.
    HmacSha256_128 = 0x04,
}

/// Session confidentiality algorithm numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConfidentialityAlgorithm {
    /// No encryption.
    None = 0x00,
    /// AES-128 in CBC mode with a random per-packet IV.
    AesCbc128 = 0x01,
}

impl AuthAlgorithm {
    pub(crate) fn as_u8(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::None),
            0x01 => Some(Self::HmacSha1),
            0x02 => Some(Self::HmacMd5),
            0x03 => Some(Self::HmacSha256),
            _ => None,
        }
    }

    /// Length in bytes of this algorithm's full key-exchange auth code.
    pub(crate) fn digest_len(self) -> usize {
        match self {
            Self::None => 0,
            Self::HmacSha1 => 20,
            Self::HmacMd5 => 16,
            Self::HmacSha256 => 32,
        }
    }

    /// The integrity algorithm RAKP message 4 uses for its check value.
    pub(crate) fn paired_integrity(self) -> IntegrityAlgorithm {
        match self {
            Self::None => IntegrityAlgorithm::None,
            Self::HmacSha1 => IntegrityAlgorithm::HmacSha1_96,
            Self::HmacMd5 => IntegrityAlgorithm::HmacMd5_128,
            Self::HmacSha256 => IntegrityAlgorithm::HmacSha256_128,
        }
    }
}

impl IntegrityAlgorithm {
    pub(crate) fn as_u8(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::None),
            0x01 => Some(Self::HmacSha1_96),
            0x02 => Some(Self::HmacMd5_128),
            0x03 => Some(Self::Md5_128),
            0x04 => Some(Self::HmacSha256_128),
            _ => None,
        }
    }

    /// Length in bytes of the integrity check value on the wire.
    pub(crate) fn check_len(self) -> usize {
        match self {
            Self::None => 0,
            Self::HmacSha1_96 => 12,
            Self::HmacMd5_128 | Self::Md5_128 | Self::HmacSha256_128 => 16,
        }
    }
}

impl ConfidentialityAlgorithm {
    pub(crate) fn as_u8(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::None),
            0x01 => Some(Self::AesCbc128),
            _ => None,
        }
    }
}

/// A negotiated (authentication, integrity, confidentiality) triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherSuite {
    /// Key exchange authentication algorithm.
    pub auth: AuthAlgorithm,
    /// Per-packet integrity algorithm.
    pub integrity: IntegrityAlgorithm,
    /// Per-packet confidentiality algorithm.
    pub confidentiality: ConfidentialityAlgorithm,
}

impl CipherSuite {
    /// Look up a standard cipher suite by its numeric ID.
    ///
    /// The RC4-based suites (4, 5, 9, 10, 13, 14, 18, 19) are not supported.
    pub fn from_id(id: u8) -> Option<Self> {
        use AuthAlgorithm as A;
        use ConfidentialityAlgorithm as C;
        use IntegrityAlgorithm as I;

        let (auth, integrity, confidentiality) = match id {
            0 => (A::None, I::None, C::None),
            1 => (A::HmacSha1, I::None, C::None),
            2 => (A::HmacSha1, I::HmacSha1_96, C::None),
            3 => (A::HmacSha1, I::HmacSha1_96, C::AesCbc128),
            6 => (A::HmacMd5, I::None, C::None),
            7 => (A::HmacMd5, I::HmacMd5_128, C::None),
            8 => (A::HmacMd5, I::HmacMd5_128, C::AesCbc128),
            11 => (A::HmacMd5, I::Md5_128, C::None),
            12 => (A::HmacMd5, I::Md5_128, C::AesCbc128),
            15 => (A::HmacSha256, I::None, C::None),
            16 => (A::HmacSha256, I::HmacSha256_128, C::None),
            17 => (A::HmacSha256, I::HmacSha256_128, C::AesCbc128),
            _ => return None,
        };

        Some(Self {
            auth,
            integrity,
            confidentiality,
        })
    }

    /// Rebuild a suite from the algorithm numbers a BMC selected.
    pub(crate) fn from_selected(auth: u8, integrity: u8, confidentiality: u8) -> Result<Self> {
        Ok(Self {
            auth: AuthAlgorithm::from_u8(auth)
                .ok_or(Error::Unsupported("selected authentication algorithm"))?,
            integrity: IntegrityAlgorithm::from_u8(integrity)
                .ok_or(Error::Unsupported("selected integrity algorithm"))?,
            confidentiality: ConfidentialityAlgorithm::from_u8(confidentiality)
                .ok_or(Error::Unsupported("selected confidentiality algorithm"))?,
        })
    }
}

/// Compute the standard IPMI two's-complement checksum: appending the result
/// makes the segment sum to zero mod 256.
pub(crate) fn checksum(bytes: &[u8]) -> u8 {
    let sum = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    (!sum).wrapping_add(1)
}

/// Plain byte-equality comparison of authentication codes.
///
/// Deliberately not constant-time; this client only verifies codes computed
/// by the managed system.
pub(crate) fn codes_match(a: &[u8], b: &[u8]) -> bool {
    a == b
}

/// Compute the v1.5 per-packet auth code for the given auth type.
///
/// MD2/MD5 hash `password || session id || payload || sequence || password`
/// with the password zero-padded to 16 bytes; the password auth type uses
/// the padded password itself.
pub(crate) fn legacy_auth_code(
    auth: AuthType,
    password: &[u8; 16],
    session_id: &[u8; 4],
    session_seq: u32,
    payload: &[u8],
) -> Result<[u8; 16]> {
    match auth {
        AuthType::Password => Ok(*password),
        AuthType::Md2 | AuthType::Md5 => {
            let mut data =
                Vec::with_capacity(16 + 4 + payload.len() + 4 + 16);
            data.extend_from_slice(password);
            data.extend_from_slice(session_id);
            data.extend_from_slice(payload);
            data.extend_from_slice(&session_seq.to_le_bytes());
            data.extend_from_slice(password);

            let digest: [u8; 16] = if auth == AuthType::Md2 {
                Md2::digest(&data).into()
            } else {
                Md5::digest(&data).into()
            };
            data.zeroize();
            Ok(digest)
        }
        AuthType::None | AuthType::Oem => {
            Err(Error::Unsupported("auth type has no auth code"))
        }
    }
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(key)
        .map_err(|_| Error::Crypto("invalid HMAC key"))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn hmac_md5(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac =
        <Hmac<Md5> as Mac>::new_from_slice(key).map_err(|_| Error::Crypto("invalid HMAC key"))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
        .map_err(|_| Error::Crypto("invalid HMAC key"))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Compute a RAKP key-exchange authentication code (full digest length).
pub(crate) fn rakp_auth_code(algo: AuthAlgorithm, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    match algo {
        AuthAlgorithm::HmacSha1 => hmac_sha1(key, data),
        AuthAlgorithm::HmacMd5 => hmac_md5(key, data),
        AuthAlgorithm::HmacSha256 => hmac_sha256(key, data),
        AuthAlgorithm::None => Err(Error::Crypto("auth algorithm none has no auth code")),
    }
}

/// Compute a session integrity check value, truncated per algorithm.
pub(crate) fn integrity_check(
    algo: IntegrityAlgorithm,
    key: &[u8],
    data: &[u8],
) -> Result<Vec<u8>> {
    let mut code = match algo {
        IntegrityAlgorithm::HmacSha1_96 => hmac_sha1(key, data)?,
        IntegrityAlgorithm::HmacMd5_128 => hmac_md5(key, data)?,
        IntegrityAlgorithm::HmacSha256_128 => hmac_sha256(key, data)?,
        IntegrityAlgorithm::Md5_128 => {
            let mut hasher = Md5::new();
            hasher.update(key);
            hasher.update(data);
            hasher.update(key);
            hasher.finalize().to_vec()
        }
        IntegrityAlgorithm::None => {
            return Err(Error::Crypto("integrity algorithm none has no check value"))
        }
    };
    code.truncate(algo.check_len());
    Ok(code)
}

/// AES-128-CBC encryption without padding.
///
/// The caller must ensure `plaintext.len()` is a multiple of 16.
pub(crate) fn aes128_cbc_encrypt(
    key: &[u8; 16],
    iv: &[u8; 16],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    if !plaintext.len().is_multiple_of(16) {
        return Err(Error::Crypto(
            "AES-CBC plaintext length must be a multiple of 16",
        ));
    }

    let cipher = Aes128::new_from_slice(key).map_err(|_| Error::Crypto("invalid AES-128 key"))?;

    let mut out = Vec::with_capacity(plaintext.len());
    let mut prev = *iv;

    for block in plaintext.chunks(16) {
        let mut xored = [0u8; 16];
        for i in 0..16 {
            xored[i] = block[i] ^ prev[i];
        }

        let mut ga = GenericArray::clone_from_slice(&xored);
        cipher.encrypt_block(&mut ga);

        let mut ct = [0u8; 16];
        ct.copy_from_slice(&ga);
        out.extend_from_slice(&ct);
        prev = ct;
    }

    Ok(out)
}

/// AES-128-CBC decryption without padding.
///
/// The caller must ensure `ciphertext.len()` is a multiple of 16.
pub(crate) fn aes128_cbc_decrypt(
    key: &[u8; 16],
    iv: &[u8; 16],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    if !ciphertext.len().is_multiple_of(16) {
        return Err(Error::Crypto(
            "AES-CBC ciphertext length must be a multiple of 16",
        ));
    }

    let cipher = Aes128::new_from_slice(key).map_err(|_| Error::Crypto("invalid AES-128 key"))?;

    let mut out = Vec::with_capacity(ciphertext.len());
    let mut prev = *iv;

    for block in ciphertext.chunks(16) {
        let mut ga = GenericArray::clone_from_slice(block);
        cipher.decrypt_block(&mut ga);

        let mut pt = [0u8; 16];
        pt.copy_from_slice(&ga);
        for i in 0..16 {
            pt[i] ^= prev[i];
        }

        out.extend_from_slice(&pt);

        let mut next_prev = [0u8; 16];
        next_prev.copy_from_slice(block);
        prev = next_prev;
    }

    Ok(out)
}

/// Encrypt an IPMI payload with AES-CBC-128 and IPMI confidentiality padding.
///
/// Plaintext is padded with incrementing byte values followed by a trailing
/// pad-length byte so the total is a block multiple. Returns
/// `iv || ciphertext`.
pub(crate) fn encrypt_payload_aes_cbc(
    plaintext: &[u8],
    key: &[u8; 16],
    iv: &[u8; 16],
) -> Result<Vec<u8>> {
    let base = plaintext.len() + 1;
    let pad_len = (16 - (base % 16)) % 16;

    let mut to_encrypt = Vec::with_capacity(base + pad_len);
    to_encrypt.extend_from_slice(plaintext);
    for i in 0..pad_len {
        to_encrypt.push((i + 1) as u8);
    }
    to_encrypt.push(pad_len as u8);

    let ciphertext = aes128_cbc_encrypt(key, iv, &to_encrypt)?;
    to_encrypt.zeroize();

    let mut out = Vec::with_capacity(16 + ciphertext.len());
    out.extend_from_slice(iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt an `iv || ciphertext` IPMI payload and strip the confidentiality
/// padding.
pub(crate) fn decrypt_payload_aes_cbc(payload: &[u8], key: &[u8; 16]) -> Result<Vec<u8>> {
    if payload.len() < 16 {
        return Err(Error::Protocol("encrypted payload too short"));
    }

    let iv: [u8; 16] = payload[..16]
        .try_into()
        .map_err(|_| Error::Protocol("invalid IV"))?;
    let ciphertext = &payload[16..];
    if ciphertext.is_empty() || !ciphertext.len().is_multiple_of(16) {
        return Err(Error::Protocol("invalid AES-CBC ciphertext length"));
    }

    let mut plaintext = aes128_cbc_decrypt(key, &iv, ciphertext)?;

    let pad_len = *plaintext
        .last()
        .ok_or(Error::Protocol("missing confidentiality pad length"))? as usize;
    if pad_len > plaintext.len().saturating_sub(1) {
        return Err(Error::Protocol("invalid confidentiality pad length"));
    }

    let body_len = plaintext.len() - 1 - pad_len;
    let pad_bytes = &plaintext[body_len..plaintext.len() - 1];
    for (i, &b) in pad_bytes.iter().enumerate() {
        if b != (i as u8 + 1) {
            return Err(Error::Protocol("invalid confidentiality pad bytes"));
        }
    }

    plaintext.truncate(body_len);
    Ok(plaintext)
}

//! IPMI v1.5 "lan" codec: the checksummed inner LAN message shared with the
//! v2.0 payload, and the classic session packet with its legacy auth code.

use crate::crypto::{checksum, codes_match, legacy_auth_code};
use crate::error::{Error, Result};
use crate::message;
use crate::proto::{check_rmcp_header, push_rmcp_header, RMCP_CLASS_IPMI};
use crate::types::{AuthType, RawResponse};

/// Default BMC responder address.
pub(crate) const BMC_ADDR: u8 = 0x20;
/// Remote console (our) requester address.
pub(crate) const REMOTE_ADDR: u8 = 0x81;

/// Encode an inner LAN message: two checksummed segments framed against
/// `dest_addr` (0x20, or the bridging target).
pub(crate) fn encode_lan_request(
    dest_addr: u8,
    netfn: u8,
    cmd: u8,
    lun: u8,
    rq_seq: u8,
    data: &[u8],
) -> Result<Vec<u8>> {
    if rq_seq > 0x3F {
        return Err(Error::Protocol("rq_seq must be 6-bit"));
    }

    let netfn_lun = (netfn << 2) | (lun & 0x03);
    let csum1 = checksum(&[dest_addr, netfn_lun]);

    let mut msg = Vec::with_capacity(7 + data.len());
    msg.push(dest_addr);
    msg.push(netfn_lun);
    msg.push(csum1);

    msg.push(REMOTE_ADDR);
    msg.push(rq_seq << 2);
    msg.push(cmd);
    msg.extend_from_slice(data);

    let csum2 = checksum(&msg[3..]);
    msg.push(csum2);

    Ok(msg)
}

/// Decode and validate an inner LAN response message.
///
/// A request-sequence mismatch is [`Error::SequenceMismatch`] so the caller
/// can keep receiving; every other violation is fatal. The completion code
/// is returned untouched.
pub(crate) fn decode_lan_response(
    dest_addr: u8,
    req_netfn: u8,
    req_cmd: u8,
    rq_seq: u8,
    msg: &[u8],
) -> Result<RawResponse> {
    if msg.len() < 8 {
        return Err(Error::Protocol("IPMI response too short"));
    }

    let rq_addr = msg[0];
    let netfn_lun = msg[1];
    let csum1 = msg[2];
    if rq_addr.wrapping_add(netfn_lun).wrapping_add(csum1) != 0 {
        return Err(Error::Protocol("invalid IPMI checksum1"));
    }

    let provided_csum2 = *msg.last().ok_or(Error::Protocol("missing checksum2"))?;
    let sum2 = msg[3..msg.len() - 1]
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b))
        .wrapping_add(provided_csum2);
    if sum2 != 0 {
        return Err(Error::Protocol("invalid IPMI checksum2"));
    }

    if rq_addr != REMOTE_ADDR {
        return Err(Error::Protocol("unexpected requester address"));
    }
    if msg[3] != dest_addr {
        return Err(Error::Protocol("unexpected responder address"));
    }

    // Match by sequence before anything else: a foreign tag means a stale
    // response may still be queued in front of ours.
    if msg[4] >> 2 != rq_seq {
        return Err(Error::SequenceMismatch);
    }

    message::check_pair(req_netfn, req_cmd, netfn_lun >> 2, msg[5])?;

    Ok(RawResponse {
        completion_code: msg[6],
        data: msg[7..msg.len() - 1].to_vec(),
    })
}

/// Encode a classic session packet around an inner LAN message.
///
/// `password16` must be provided for every auth type except none.
pub(crate) fn encode_session_packet(
    auth: AuthType,
    password16: Option<&[u8; 16]>,
    session_id: &[u8; 4],
    session_seq: u32,
    inner: &[u8],
) -> Result<Vec<u8>> {
    if inner.len() > 0xFF {
        return Err(Error::Protocol("inner payload too large"));
    }

    let mut packet = Vec::with_capacity(4 + 26 + inner.len());
    push_rmcp_header(&mut packet, RMCP_CLASS_IPMI);
    packet.push(auth.as_u8());
    packet.extend_from_slice(&session_seq.to_le_bytes());
    packet.extend_from_slice(session_id);

    if auth != AuthType::None {
        let password16 =
            password16.ok_or(Error::InvalidArgument("auth type requires a password"))?;
        let code = legacy_auth_code(auth, password16, session_id, session_seq, inner)?;
        packet.extend_from_slice(&code);
    }

    packet.push(inner.len() as u8);
    packet.extend_from_slice(inner);
    Ok(packet)
}

/// Decode a classic session packet, verifying the legacy auth code when the
/// session auth type carries one.
pub(crate) fn decode_session_packet(
    auth: AuthType,
    password16: Option<&[u8; 16]>,
    bytes: &[u8],
) -> Result<([u8; 4], u32, Vec<u8>)> {
    check_rmcp_header(bytes, RMCP_CLASS_IPMI)?;

    let header_len = if auth == AuthType::None { 14 } else { 30 };
    if bytes.len() < header_len {
        return Err(Error::Protocol("session packet too short"));
    }

    if bytes[4] != auth.as_u8() {
        return Err(Error::Protocol("unexpected session auth type"));
    }

    let session_seq = u32::from_le_bytes(
        bytes[5..9]
            .try_into()
            .map_err(|_| Error::Protocol("invalid session seq"))?,
    );
    let session_id: [u8; 4] = bytes[9..13]
        .try_into()
        .map_err(|_| Error::Protocol("invalid session id"))?;

    let (code, len_at) = if auth == AuthType::None {
        (None, 13)
    } else {
        let code: [u8; 16] = bytes[13..29]
            .try_into()
            .map_err(|_| Error::Protocol("invalid auth code"))?;
        (Some(code), 29)
    };

    let payload_len = bytes[len_at] as usize;
    let payload = &bytes[len_at + 1..];
    if payload.len() != payload_len {
        return Err(Error::Protocol("session payload length mismatch"));
    }

    if let Some(code) = code {
        let password16 =
            password16.ok_or(Error::InvalidArgument("auth type requires a password"))?;
        let expected = legacy_auth_code(auth, password16, &session_id, session_seq, payload)?;
        if !codes_match(&code, &expected) {
            return Err(Error::AuthenticationFailed("invalid session auth code"));
        }
    }

    Ok((session_id, session_seq, payload.to_vec()))
}

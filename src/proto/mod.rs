//! Wire codecs: the shared RMCP envelope and ASF presence ping, plus the
//! v1.5 and v2.0 session packet formats and the RAKP handshake payloads.

pub(crate) mod rakp;
pub(crate) mod v1_5;
pub(crate) mod v2_0;

use crate::error::{Error, Result};

/// RMCP header values.
pub(crate) const RMCP_VERSION: u8 = 0x06;
pub(crate) const RMCP_RESERVED: u8 = 0x00;
pub(crate) const RMCP_SEQ_NO_ACK: u8 = 0xFF;
pub(crate) const RMCP_CLASS_ASF: u8 = 0x06;
pub(crate) const RMCP_CLASS_IPMI: u8 = 0x07;

/// ASF IANA enterprise number (big-endian on the wire).
const ASF_IANA: u32 = 4542;
const ASF_TYPE_PRESENCE_PONG: u8 = 0x40;
const ASF_TYPE_PRESENCE_PING: u8 = 0x80;

/// Length of a well-formed presence pong datagram.
const PONG_LEN: usize = 28;

pub(crate) fn push_rmcp_header(packet: &mut Vec<u8>, class: u8) {
    packet.push(RMCP_VERSION);
    packet.push(RMCP_RESERVED);
    packet.push(RMCP_SEQ_NO_ACK);
    packet.push(class);
}

pub(crate) fn check_rmcp_header(bytes: &[u8], class: u8) -> Result<()> {
    if bytes.len() < 4 {
        return Err(Error::Protocol("packet too short for RMCP header"));
    }
    if bytes[0] != RMCP_VERSION {
        return Err(Error::Protocol("unexpected RMCP version"));
    }
    if bytes[3] != class {
        return Err(Error::Protocol("unexpected RMCP class"));
    }
    Ok(())
}

/// Stateless ASF presence-ping codec with a per-instance message tag.
#[derive(Debug)]
pub(crate) struct Pinger {
    tag: u8,
}

impl Pinger {
    pub(crate) fn new() -> Self {
        Self { tag: 0 }
    }

    /// Build the next ping datagram, bumping the message tag.
    pub(crate) fn build_ping(&mut self) -> Vec<u8> {
        let tag = self.tag;
        self.tag = self.tag.wrapping_add(1);

        let mut packet = Vec::with_capacity(12);
        push_rmcp_header(&mut packet, RMCP_CLASS_ASF);
        packet.extend_from_slice(&ASF_IANA.to_be_bytes());
        packet.push(ASF_TYPE_PRESENCE_PING);
        packet.push(tag);
        packet.push(0x00); // reserved
        packet.push(0x00); // data length
        packet
    }

    /// Validate a presence-pong datagram.
    pub(crate) fn check_pong(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() != PONG_LEN {
            return Err(Error::Protocol("presence pong has wrong length"));
        }
        check_rmcp_header(bytes, RMCP_CLASS_ASF)?;
        if bytes[8] != ASF_TYPE_PRESENCE_PONG {
            return Err(Error::Protocol("unexpected ASF message type"));
        }
        Ok(())
    }
}

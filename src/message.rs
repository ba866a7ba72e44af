//! The command/response envelope shared by every transport.
//!
//! A [`Request`] is plain data: NetFn, command number, LUN, payload bytes,
//! and a [`MessageKind`] tag that tells the codecs and transports how the
//! message travels and how its completion code is interpreted. Transports
//! never dispatch on command types; the typed [`Command`] trait sits on top
//! and produces `Request` values.

use crate::error::{Error, Result};
use crate::types::RawResponse;

/// RMCP+ payload type numbers for the session-setup stages a client sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStage {
    /// RMCP+ Open Session Request (payload type 0x10).
    OpenSessionRequest,
    /// RAKP Message 1 (payload type 0x12).
    Rakp1,
    /// RAKP Message 3 (payload type 0x14).
    Rakp3,
}

impl HandshakeStage {
    /// Payload type number on the wire.
    pub fn payload_type(self) -> u8 {
        match self {
            Self::OpenSessionRequest => 0x10,
            Self::Rakp1 => 0x12,
            Self::Rakp3 => 0x14,
        }
    }

    /// Payload type number of the expected response stage.
    pub fn response_payload_type(self) -> u8 {
        self.payload_type() + 1
    }
}

/// How a request's payload travels and how its completion code is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// A typed IPMI command. A non-zero completion code becomes
    /// [`Error::CompletionCode`].
    Structured,
    /// A raw passthrough command. The completion code is returned as data
    /// and never raised as an error.
    Raw,
    /// An RMCP+ session-setup payload. Completion-code semantics do not
    /// apply; the RAKP module interprets the payload.
    Handshake(HandshakeStage),
}

/// A single IPMI request.
#[derive(Debug, Clone)]
pub struct Request {
    pub(crate) netfn: u8,
    pub(crate) cmd: u8,
    pub(crate) lun: u8,
    pub(crate) data: Vec<u8>,
    pub(crate) kind: MessageKind,
}

impl Request {
    /// Build a structured request. The NetFn must be even (a request code).
    pub fn structured(netfn: u8, cmd: u8, data: Vec<u8>) -> Result<Self> {
        if netfn & 0x01 != 0 {
            return Err(Error::InvalidArgument("request netfn must be even"));
        }
        Ok(Self {
            netfn,
            cmd,
            lun: 0,
            data,
            kind: MessageKind::Structured,
        })
    }

    /// Build a raw passthrough request from `[netfn, cmd, data...]` bytes.
    pub fn raw(bytes: &[u8], lun: u8) -> Result<Self> {
        if bytes.len() < 2 {
            return Err(Error::InvalidArgument(
                "raw request needs at least netfn and cmd bytes",
            ));
        }
        if bytes[0] & 0x01 != 0 {
            return Err(Error::InvalidArgument("request netfn must be even"));
        }
        if lun > 0x03 {
            return Err(Error::InvalidArgument("lun must be 2-bit"));
        }
        Ok(Self {
            netfn: bytes[0],
            cmd: bytes[1],
            lun,
            data: bytes[2..].to_vec(),
            kind: MessageKind::Raw,
        })
    }

    /// NetFn of this request.
    pub fn netfn(&self) -> u8 {
        self.netfn
    }

    /// Command number of this request.
    pub fn cmd(&self) -> u8 {
        self.cmd
    }

    /// Message kind tag.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }
}

/// Check the response NetFn/command pair against the request.
///
/// A valid response NetFn is the request NetFn + 1 and the command numbers
/// match; anything else is fatal.
pub(crate) fn check_pair(req_netfn: u8, req_cmd: u8, rsp_netfn: u8, rsp_cmd: u8) -> Result<()> {
    if rsp_netfn != req_netfn + 1 {
        return Err(Error::Protocol("unexpected netfn in response"));
    }
    if rsp_cmd != req_cmd {
        return Err(Error::Protocol("unexpected command in response"));
    }
    Ok(())
}

/// Require an exact payload length before field extraction.
pub(crate) fn expect_len(data: &[u8], expected: usize, what: &'static str) -> Result<()> {
    if data.len() != expected {
        return Err(Error::protocol_owned(format!(
            "{what}: expected {expected} response bytes, got {}",
            data.len()
        )));
    }
    Ok(())
}

/// A typed IPMI command (single request/response).
pub trait Command {
    /// Parsed output type.
    type Output;

    /// Network Function (NetFn) for the request.
    const NETFN: u8;

    /// Command number.
    const CMD: u8;

    /// Encode request payload bytes (excluding NetFn/Cmd framing).
    fn request_data(&self) -> Vec<u8>;

    /// Parse a raw response into the typed output.
    fn parse_response(&self, response: RawResponse) -> Result<Self::Output>;

    /// Build the plain-data request for this command.
    fn to_request(&self) -> Result<Request> {
        Request::structured(Self::NETFN, Self::CMD, self.request_data())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_request_rejects_odd_netfn() {
        let err = Request::structured(0x07, 0x01, Vec::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn raw_request_splits_netfn_cmd_data() {
        let req = Request::raw(&[0x06, 0x01, 0xAA, 0xBB], 0).expect("raw");
        assert_eq!(req.netfn(), 0x06);
        assert_eq!(req.cmd(), 0x01);
        assert_eq!(req.data, vec![0xAA, 0xBB]);
        assert_eq!(req.kind(), MessageKind::Raw);

        let err = Request::raw(&[0x06], 0).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn pair_check_requires_netfn_plus_one() {
        assert!(check_pair(0x06, 0x01, 0x07, 0x01).is_ok());
        assert!(check_pair(0x06, 0x01, 0x06, 0x01).is_err());
        assert!(check_pair(0x06, 0x01, 0x07, 0x02).is_err());
    }

    #[test]
    fn handshake_stage_payload_types() {
        assert_eq!(HandshakeStage::OpenSessionRequest.payload_type(), 0x10);
        assert_eq!(HandshakeStage::Rakp1.payload_type(), 0x12);
        assert_eq!(HandshakeStage::Rakp3.payload_type(), 0x14);
        assert_eq!(HandshakeStage::Rakp1.response_payload_type(), 0x13);
    }
}

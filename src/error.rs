use std::io;

use thiserror::Error;

/// Result type used across this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (socket, OS, etc.).
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Operation timed out.
    #[error("timeout waiting for response")]
    Timeout,

    /// Peer responded with an unexpected or invalid packet.
    #[error("protocol error: {0}")]
    Protocol(&'static str),

    /// Peer responded with an unexpected or invalid packet.
    #[error("protocol error: {0}")]
    ProtocolOwned(String),

    /// The request sequence number embedded in a response does not match the
    /// request just sent. Recoverable: the matching response may still be
    /// queued behind a stale one.
    #[error("response sequence number mismatch")]
    SequenceMismatch,

    /// Authentication or integrity verification failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(&'static str),

    /// The managed system rejected an RMCP+ handshake stage with a non-zero
    /// status code.
    #[error("rmcp+ status code {code:#04x}: {}", rmcpplus_status_reason(*.code))]
    RmcpPlusStatus {
        /// Raw RMCP+ status code from the Open Session / RAKP response.
        code: u8,
    },

    /// Cryptographic failure (invalid key sizes, decrypt failure, etc.).
    #[error("crypto error: {0}")]
    Crypto(&'static str),

    /// Unsupported configuration or protocol feature.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// Invalid caller-supplied argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// An IPMI command completed with a non-zero completion code.
    #[error("completion code {code:#04x} (netfn {netfn:#04x}, cmd {cmd:#04x}): {}", completion_code_reason(*.code))]
    CompletionCode {
        /// NetFn of the request that failed.
        netfn: u8,
        /// Command number of the request that failed.
        cmd: u8,
        /// Raw completion code returned by the BMC.
        code: u8,
    },
}

impl Error {
    pub(crate) fn protocol_owned(msg: impl Into<String>) -> Self {
        Self::ProtocolOwned(msg.into())
    }
}

/// Human-readable reason for an RMCP+ status code (Open Session / RAKP).
pub fn rmcpplus_status_reason(code: u8) -> &'static str {
    const REASONS: [&str; 19] = [
        "no errors",
        "insufficient resources to create a session",
        "invalid session ID",
        "invalid payload type",
        "invalid authentication algorithm",
        "invalid integrity algorithm",
        "no matching authentication payload",
        "no matching integrity payload",
        "inactive session ID",
        "invalid role",
        "unauthorized role or privilege level requested",
        "insufficient resources to create a session at the requested role",
        "invalid name length",
        "unauthorized name",
        "unauthorized GUID",
        "invalid integrity check value",
        "invalid confidentiality algorithm",
        "no cipher suite match with proposed security algorithms",
        "illegal or unrecognized parameter",
    ];

    if (code as usize) < REASONS.len() {
        REASONS[code as usize]
    } else {
        "reserved"
    }
}

/// Human-readable reason for an IPMI completion code.
pub fn completion_code_reason(code: u8) -> &'static str {
    match code {
        0x00 => "command completed normally",
        0xC0 => "node busy",
        0xC1 => "invalid command",
        0xC2 => "invalid LUN",
        0xC3 => "timeout while processing command",
        0xC4 => "out of space",
        0xC5 => "invalid reservation ID",
        0xC6 => "request data truncated",
        0xC7 => "request data length invalid",
        0xC8 => "request data field length limit exceeded",
        0xC9 => "parameter out of range",
        0xCA => "cannot return number of requested data bytes",
        0xCB => "requested sensor, data, or record not present",
        0xCC => "invalid data field in request",
        0xCD => "command illegal for specified sensor or record type",
        0xCE => "command response could not be provided",
        0xCF => "cannot execute duplicated request",
        0xD0 => "SDR repository in update mode",
        0xD1 => "device in firmware update mode",
        0xD2 => "BMC initialization in progress",
        0xD3 => "destination unavailable",
        0xD4 => "insufficient privilege level",
        0xD5 => "command not supported in present state",
        0xD6 => "command sub-function disabled or unavailable",
        0xFF => "unspecified error",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_code_error_carries_reason() {
        let err = Error::CompletionCode {
            netfn: 0x06,
            cmd: 0x01,
            code: 0xC3,
        };
        let text = format!("{err}");
        assert!(text.contains("0xc3"));
        assert!(text.contains("timeout while processing command"));
    }

    #[test]
    fn rmcpplus_status_reason_table() {
        assert_eq!(rmcpplus_status_reason(0x00), "no errors");
        assert_eq!(rmcpplus_status_reason(0x02), "invalid session ID");
        assert_eq!(
            rmcpplus_status_reason(0x11),
            "no cipher suite match with proposed security algorithms"
        );
        assert_eq!(rmcpplus_status_reason(0x13), "reserved");
        assert_eq!(rmcpplus_status_reason(0xFF), "reserved");
    }
}

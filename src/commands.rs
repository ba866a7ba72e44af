//! The bring-up command catalog: typed [`Command`] implementations for the
//! App-netfn commands the session transports need, plus `Get Device ID`.
//!
//! Each command is plain data; the transports only see the [`Request`]
//! values these produce.
//!
//! [`Request`]: crate::message::Request

use crate::error::{Error, Result};
use crate::message::{expect_len, Command};
use crate::types::{
    AuthType, ChannelAuthCapabilities, DeviceId, PrivilegeLevel, RawResponse,
};

/// Application network function.
pub const NETFN_APP: u8 = 0x06;

pub(crate) const CMD_GET_DEVICE_ID: u8 = 0x01;
pub(crate) const CMD_SEND_MESSAGE: u8 = 0x34;

/// `Get Channel Authentication Capabilities` (App, 0x38).
#[derive(Debug, Clone)]
pub struct GetChannelAuthCapabilities {
    /// Channel to query; 0x0E means "this channel".
    pub channel: u8,
    /// Privilege level the capabilities are requested for.
    pub privilege: PrivilegeLevel,
}

impl Command for GetChannelAuthCapabilities {
    type Output = ChannelAuthCapabilities;
    const NETFN: u8 = NETFN_APP;
    const CMD: u8 = 0x38;

    fn request_data(&self) -> Vec<u8> {
        // Bit 7 asks for the IPMI v2.0 extended data.
        vec![0x80 | (self.channel & 0x0F), self.privilege.as_u8() & 0x0F]
    }

    fn parse_response(&self, response: RawResponse) -> Result<Self::Output> {
        let d = &response.data;
        expect_len(d, 8, "channel auth capabilities")?;

        let v20_data_available = d[1] & 0x80 != 0;
        Ok(ChannelAuthCapabilities {
            channel_number: d[0],
            v20_data_available,
            enabled_auth_types: d[1] & 0x3F,
            per_message_auth_disabled: d[2] & 0x10 != 0,
            user_level_auth_disabled: d[2] & 0x08 != 0,
            non_null_usernames: d[2] & 0x04 != 0,
            null_usernames: d[2] & 0x02 != 0,
            anonymous_login_enabled: d[2] & 0x01 != 0,
            kg_nonzero: d[2] & 0x20 != 0,
            supports_ipmi_v1_5: !v20_data_available || d[3] & 0x01 != 0,
            supports_ipmi_v2_0: v20_data_available && d[3] & 0x02 != 0,
            oem_id: u32::from(d[4]) | u32::from(d[5]) << 8 | u32::from(d[6]) << 16,
            oem_aux_data: d[7],
        })
    }
}

/// `Get Session Challenge` (App, 0x39).
#[derive(Debug, Clone)]
pub struct GetSessionChallenge {
    /// Auth type the session will be activated with.
    pub auth: AuthType,
    /// Username, zero-padded to the fixed 16-byte field.
    pub username: [u8; 16],
}

/// Temporary session id and challenge string for `Activate Session`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionChallenge {
    /// Temporary session id to activate against.
    pub temporary_session_id: [u8; 4],
    /// Challenge string echoed into `Activate Session`.
    pub challenge: [u8; 16],
}

impl Command for GetSessionChallenge {
    type Output = SessionChallenge;
    const NETFN: u8 = NETFN_APP;
    const CMD: u8 = 0x39;

    fn request_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(17);
        data.push(self.auth.as_u8() & 0x0F);
        data.extend_from_slice(&self.username);
        data
    }

    fn parse_response(&self, response: RawResponse) -> Result<Self::Output> {
        let d = &response.data;
        expect_len(d, 20, "session challenge")?;
        Ok(SessionChallenge {
            temporary_session_id: d[0..4]
                .try_into()
                .map_err(|_| Error::Protocol("invalid temporary session id"))?,
            challenge: d[4..20]
                .try_into()
                .map_err(|_| Error::Protocol("invalid challenge string"))?,
        })
    }
}

/// `Activate Session` (App, 0x3A).
#[derive(Debug, Clone)]
pub struct ActivateSession {
    /// Auth type for the activated session.
    pub auth: AuthType,
    /// Maximum requested privilege level.
    pub privilege: PrivilegeLevel,
    /// Challenge string from `Get Session Challenge`.
    pub challenge: [u8; 16],
    /// Initial outbound sequence number; must be non-zero.
    pub initial_outbound_seq: u32,
}

/// Parameters of the activated session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivatedSession {
    /// Auth type the BMC selected for the rest of the session.
    pub auth: AuthType,
    /// Session id for all subsequent packets.
    pub session_id: [u8; 4],
    /// Initial inbound sequence number for our session headers.
    pub initial_inbound_seq: u32,
    /// Maximum privilege level allowed on this session.
    pub max_privilege: u8,
}

impl Command for ActivateSession {
    type Output = ActivatedSession;
    const NETFN: u8 = NETFN_APP;
    const CMD: u8 = 0x3A;

    fn request_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(22);
        data.push(self.auth.as_u8() & 0x0F);
        data.push(self.privilege.as_u8() & 0x0F);
        data.extend_from_slice(&self.challenge);
        data.extend_from_slice(&self.initial_outbound_seq.to_le_bytes());
        data
    }

    fn parse_response(&self, response: RawResponse) -> Result<Self::Output> {
        let d = &response.data;
        expect_len(d, 10, "activate session")?;
        let auth = AuthType::from_u8(d[0] & 0x0F)
            .ok_or(Error::Protocol("unknown auth type in activate session"))?;
        Ok(ActivatedSession {
            auth,
            session_id: d[1..5]
                .try_into()
                .map_err(|_| Error::Protocol("invalid session id"))?,
            initial_inbound_seq: u32::from_le_bytes(
                d[5..9]
                    .try_into()
                    .map_err(|_| Error::Protocol("invalid initial sequence"))?,
            ),
            max_privilege: d[9] & 0x0F,
        })
    }
}

/// `Set Session Privilege Level` (App, 0x3B).
#[derive(Debug, Clone)]
pub struct SetSessionPrivilegeLevel {
    /// Privilege level to operate at.
    pub privilege: PrivilegeLevel,
}

impl Command for SetSessionPrivilegeLevel {
    type Output = u8;
    const NETFN: u8 = NETFN_APP;
    const CMD: u8 = 0x3B;

    fn request_data(&self) -> Vec<u8> {
        vec![self.privilege.as_u8() & 0x0F]
    }

    fn parse_response(&self, response: RawResponse) -> Result<Self::Output> {
        expect_len(&response.data, 1, "set session privilege level")?;
        Ok(response.data[0] & 0x0F)
    }
}

/// `Close Session` (App, 0x3C).
#[derive(Debug, Clone)]
pub struct CloseSession {
    /// Session id to tear down.
    pub session_id: [u8; 4],
}

impl Command for CloseSession {
    type Output = ();
    const NETFN: u8 = NETFN_APP;
    const CMD: u8 = 0x3C;

    fn request_data(&self) -> Vec<u8> {
        self.session_id.to_vec()
    }

    fn parse_response(&self, _response: RawResponse) -> Result<Self::Output> {
        Ok(())
    }
}

/// `Send Message` (App, 0x34) — the outer half of bridging.
#[derive(Debug, Clone)]
pub struct SendMessage {
    /// Destination channel number.
    pub channel: u8,
    /// Encoded inner LAN message.
    pub message: Vec<u8>,
}

impl Command for SendMessage {
    type Output = Vec<u8>;
    const NETFN: u8 = NETFN_APP;
    const CMD: u8 = CMD_SEND_MESSAGE;

    fn request_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(1 + self.message.len());
        // 0x40 requests response tracking.
        data.push(0x40 | (self.channel & 0x0F));
        data.extend_from_slice(&self.message);
        data
    }

    fn parse_response(&self, response: RawResponse) -> Result<Self::Output> {
        Ok(response.data)
    }
}

/// `Get Device ID` (App, 0x01).
#[derive(Debug, Clone, Default)]
pub struct GetDeviceId;

impl Command for GetDeviceId {
    type Output = DeviceId;
    const NETFN: u8 = NETFN_APP;
    const CMD: u8 = CMD_GET_DEVICE_ID;

    fn request_data(&self) -> Vec<u8> {
        Vec::new()
    }

    fn parse_response(&self, response: RawResponse) -> Result<Self::Output> {
        let d = &response.data;
        if d.len() != 11 && d.len() != 15 {
            return Err(Error::protocol_owned(format!(
                "device id: expected 11 or 15 response bytes, got {}",
                d.len()
            )));
        }

        let aux_firmware_revision = if d.len() == 15 {
            Some(
                d[11..15]
                    .try_into()
                    .map_err(|_| Error::Protocol("invalid aux firmware revision"))?,
            )
        } else {
            None
        };

        Ok(DeviceId {
            device_id: d[0],
            device_revision: d[1] & 0x0F,
            firmware_major: d[2] & 0x7F,
            firmware_minor: d[3],
            ipmi_version: d[4],
            additional_support: d[5],
            manufacturer_id: u32::from(d[6]) | u32::from(d[7]) << 8 | u32::from(d[8]) << 16,
            product_id: u16::from_le_bytes(
                d[9..11]
                    .try_into()
                    .map_err(|_| Error::Protocol("invalid product id"))?,
            ),
            aux_firmware_revision,
        })
    }
}

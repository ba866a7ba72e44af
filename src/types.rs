use core::fmt;

/// The privilege level requested for the IPMI session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PrivilegeLevel {
    /// Callback privilege.
    Callback = 0x01,
    /// User privilege.
    User = 0x02,
    /// Operator privilege.
    Operator = 0x03,
    /// Administrator privilege.
    Administrator = 0x04,
    /// OEM-defined privilege.
    Oem = 0x05,
}

impl PrivilegeLevel {
    pub(crate) fn as_u8(self) -> u8 {
        self as u8
    }
}

/// IPMI v1.5 session authentication type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthType {
    /// No per-packet authentication.
    None = 0x00,
    /// Keyed MD2 auth code.
    Md2 = 0x01,
    /// Keyed MD5 auth code.
    Md5 = 0x02,
    /// Straight 16-byte password as the auth code.
    Password = 0x04,
    /// OEM-defined authentication (not implemented by this crate).
    Oem = 0x05,
}

impl AuthType {
    pub(crate) fn as_u8(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::None),
            0x01 => Some(Self::Md2),
            0x02 => Some(Self::Md5),
            0x04 => Some(Self::Password),
            0x05 => Some(Self::Oem),
            _ => None,
        }
    }

    /// Parse a configuration name ("none", "md2", "md5", "password", "oem").
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(Self::None),
            "md2" => Some(Self::Md2),
            "md5" => Some(Self::Md5),
            "password" => Some(Self::Password),
            "oem" => Some(Self::Oem),
            _ => None,
        }
    }
}

/// A raw IPMI response.
#[derive(Clone, PartialEq, Eq)]
pub struct RawResponse {
    /// IPMI completion code.
    pub completion_code: u8,
    /// Payload bytes after the completion code.
    pub data: Vec<u8>,
}

impl RawResponse {
    /// Return the payload data, or a typed completion-code error when the
    /// completion code is non-zero.
    pub fn expect_success(&self, netfn: u8, cmd: u8) -> crate::error::Result<&[u8]> {
        if self.completion_code != 0x00 {
            return Err(crate::error::Error::CompletionCode {
                netfn,
                cmd,
                code: self.completion_code,
            });
        }
        Ok(&self.data)
    }
}

impl fmt::Debug for RawResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawResponse")
            .field(
                "completion_code",
                &format_args!("{:#04x}", self.completion_code),
            )
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// Parsed response for the `Get Device ID` command.
///
/// BMCs return either the 11-byte base layout or the 15-byte layout that adds
/// the auxiliary firmware revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceId {
    /// Device ID (BMC-defined).
    pub device_id: u8,
    /// Device revision (lower 4 bits are the revision).
    pub device_revision: u8,
    /// Firmware major revision.
    pub firmware_major: u8,
    /// Firmware minor revision.
    pub firmware_minor: u8,
    /// IPMI version as BCD (e.g. 0x02 for 2.0).
    pub ipmi_version: u8,
    /// Additional device support flags.
    pub additional_support: u8,
    /// Manufacturer ID (24-bit, least-significant byte first).
    pub manufacturer_id: u32,
    /// Product ID.
    pub product_id: u16,
    /// Auxiliary firmware revision, present only in the 15-byte layout.
    pub aux_firmware_revision: Option<[u8; 4]>,
}

/// Parsed response for `Get Channel Authentication Capabilities`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelAuthCapabilities {
    /// Channel number.
    pub channel_number: u8,
    /// Indicates IPMI v2.0 data is available in the response.
    pub v20_data_available: bool,
    /// IPMI v1.5 enabled authentication types (bitmask).
    pub enabled_auth_types: u8,
    /// Per-message authentication is disabled when true.
    pub per_message_auth_disabled: bool,
    /// User-level authentication is disabled when true.
    pub user_level_auth_disabled: bool,
    /// One or more non-null user names exist.
    pub non_null_usernames: bool,
    /// One or more null user names with non-null passwords exist.
    pub null_usernames: bool,
    /// Anonymous login (null user/null password) is enabled.
    pub anonymous_login_enabled: bool,
    /// Non-zero Kg key is configured (two-key login).
    pub kg_nonzero: bool,
    /// Channel supports IPMI v1.5.
    pub supports_ipmi_v1_5: bool,
    /// Channel supports IPMI v2.0.
    pub supports_ipmi_v2_0: bool,
    /// OEM IANA enterprise number.
    pub oem_id: u32,
    /// OEM auxiliary data.
    pub oem_aux_data: u8,
}

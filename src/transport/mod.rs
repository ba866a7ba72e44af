//! Session transports: the capability interface every transport kind
//! implements, the UDP channel the network transports share, and the
//! builder/dispatcher that selects a transport kind.

use std::io;
use std::net::UdpSocket;
use std::time::Duration;

use crate::commands;
use crate::crypto::SecretBytes;
use crate::error::{Error, Result};
use crate::message::{Command, Request};
use crate::proto::Pinger;
use crate::types::{AuthType, PrivilegeLevel, RawResponse};

#[cfg(target_os = "linux")]
pub(crate) mod device;
pub(crate) mod keepalive;
pub(crate) mod lan;
pub(crate) mod lanplus;

pub use lan::LanTransport;
pub use lanplus::LanPlusTransport;

#[cfg(target_os = "linux")]
pub use device::DeviceTransport;

/// Bounded wait for one response datagram.
pub(crate) const RESPONSE_TIMEOUT: Duration = Duration::from_millis(1500);

/// Send/wait cycles for a simple command before giving up.
pub(crate) const SEND_ATTEMPTS: u32 = 3;

/// Extra receive attempts after a response with a foreign sequence tag.
pub(crate) const SEQ_MISMATCH_RETRIES: u32 = 2;

/// Extra receive cycles for the deferred half of a bridged command.
pub(crate) const BRIDGE_RESPONSE_ATTEMPTS: u32 = 3;

/// A datagram channel owned by one session.
pub(crate) trait Channel: Send {
    fn send(&mut self, bytes: &[u8]) -> Result<()>;

    /// Wait up to `timeout` for one datagram; `Ok(None)` on timeout.
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>>;
}

pub(crate) struct UdpChannel {
    socket: UdpSocket,
}

impl UdpChannel {
    pub(crate) fn connect(host: &str, port: u16) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.connect((host, port))?;
        Ok(Self { socket })
    }
}

impl Channel for UdpChannel {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.socket.send(bytes)?;
        Ok(())
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        self.socket.set_read_timeout(Some(timeout))?;
        let mut buf = [0u8; 4096];
        match self.socket.recv(&mut buf) {
            Ok(n) => Ok(Some(buf[..n].to_vec())),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Ping with the same retry discipline as a simple command.
pub(crate) fn ping_channel(channel: &mut dyn Channel, pinger: &mut Pinger) -> Result<()> {
    for _ in 0..SEND_ATTEMPTS {
        let ping = pinger.build_ping();
        crate::debug::dump_hex("ping send", &ping);
        channel.send(&ping)?;
        if let Some(pong) = channel.recv_timeout(RESPONSE_TIMEOUT)? {
            crate::debug::dump_hex("ping recv", &pong);
            pinger.check_pong(&pong)?;
            return Ok(());
        }
    }
    Err(Error::Timeout)
}

/// What a connected transport can do. One in-flight request per session.
pub trait Transport: Send {
    /// Presence ping; session-less.
    fn ping(&mut self) -> Result<()>;

    /// Issue a plain-data request and return the raw response.
    fn issue(&mut self, request: &Request) -> Result<RawResponse>;

    /// Issue raw `[netfn, cmd, data...]` bytes. The completion code comes
    /// back as data and is never raised as an error.
    fn issue_raw_cmd(&mut self, bytes: &[u8], lun: u8) -> Result<RawResponse> {
        let request = Request::raw(bytes, lun)?;
        self.issue(&request)
    }

    /// Issue raw bytes to a bridged target behind `channel`.
    fn issue_bridging_cmd(
        &mut self,
        channel: u8,
        target_addr: u8,
        bytes: &[u8],
        lun: u8,
    ) -> Result<RawResponse>;

    /// Tear the session down. Best effort on the wire; the session is
    /// locally closed afterwards either way.
    fn close(&mut self) -> Result<()>;

    /// Whether the session is established and usable.
    fn is_active(&self) -> bool;
}

/// Issue a typed command over any transport.
///
/// A non-zero completion code becomes [`Error::CompletionCode`] before the
/// command's parser runs.
pub fn issue_cmd<T, C>(transport: &mut T, command: &C) -> Result<C::Output>
where
    T: Transport + ?Sized,
    C: Command,
{
    let request = command.to_request()?;
    let response = transport.issue(&request)?;
    response.expect_success(C::NETFN, C::CMD)?;
    command.parse_response(response)
}

/// Which transport a [`SessionBuilder`] connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// IPMI v1.5 classic session over UDP.
    Lan,
    /// IPMI v2.0 RMCP+ session over UDP.
    LanPlus,
    /// Local in-band character device.
    Device,
    /// Presence ping only; no session.
    PingOnly,
}

/// Session options, builder style. `connect()` dispatches on the kind.
pub struct SessionBuilder {
    pub(crate) kind: TransportKind,
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) username: String,
    pub(crate) password: SecretBytes,
    pub(crate) kg: Option<SecretBytes>,
    pub(crate) privilege: PrivilegeLevel,
    pub(crate) cipher_suite: u8,
    pub(crate) auth_type: AuthType,
    pub(crate) keep_alive: bool,
    pub(crate) skip_ping: bool,
    pub(crate) lenient_bridge_ack: bool,
    pub(crate) device_num: u32,
    pub(crate) local_addr: u8,
}

impl SessionBuilder {
    /// Start from the defaults for the given transport kind.
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            host: String::new(),
            port: 623,
            username: String::new(),
            password: SecretBytes::new(Vec::new()),
            kg: None,
            privilege: PrivilegeLevel::Administrator,
            cipher_suite: 3,
            auth_type: AuthType::Md5,
            keep_alive: false,
            skip_ping: false,
            lenient_bridge_ack: true,
            device_num: 0,
            local_addr: 0,
        }
    }

    /// BMC hostname or address.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// RMCP port (default 623).
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Username (at most 16 bytes).
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    /// Password / user key.
    pub fn password(mut self, password: impl Into<Vec<u8>>) -> Self {
        self.password = SecretBytes::new(password.into());
        self
    }

    /// Optional KG BMC key for two-key RMCP+ logins.
    pub fn kg(mut self, kg: impl Into<Vec<u8>>) -> Self {
        self.kg = Some(SecretBytes::new(kg.into()));
        self
    }

    /// Requested session privilege level (default Administrator).
    pub fn privilege(mut self, privilege: PrivilegeLevel) -> Self {
        self.privilege = privilege;
        self
    }

    /// Cipher suite id for RMCP+ sessions (default 3).
    pub fn cipher_suite(mut self, id: u8) -> Self {
        self.cipher_suite = id;
        self
    }

    /// v1.5 auth type for classic sessions (default MD5).
    pub fn auth_type(mut self, auth: AuthType) -> Self {
        self.auth_type = auth;
        self
    }

    /// Spawn the background keep-alive worker after open.
    pub fn keep_alive(mut self, enabled: bool) -> Self {
        self.keep_alive = enabled;
        self
    }

    /// Skip the presence ping during open.
    pub fn skip_ping(mut self, skip: bool) -> Self {
        self.skip_ping = skip;
        self
    }

    /// Tolerate a sequence-tag mismatch on the bridging acknowledgment
    /// (default on; some firmware tags the ack wrong).
    pub fn lenient_bridge_ack(mut self, lenient: bool) -> Self {
        self.lenient_bridge_ack = lenient;
        self
    }

    /// In-band device number (`/dev/ipmiN`, default 0).
    pub fn device(mut self, num: u32) -> Self {
        self.device_num = num;
        self
    }

    /// Local IPMB address for the in-band kind; 0 leaves the default.
    pub fn local_address(mut self, addr: u8) -> Self {
        self.local_addr = addr;
        self
    }

    /// Connect the configured transport.
    pub fn connect(self) -> Result<Box<dyn Transport>> {
        match self.kind {
            TransportKind::Lan => Ok(Box::new(LanTransport::open(&self)?)),
            TransportKind::LanPlus => Ok(Box::new(LanPlusTransport::open(&self)?)),
            #[cfg(target_os = "linux")]
            TransportKind::Device => Ok(Box::new(DeviceTransport::open(&self)?)),
            #[cfg(not(target_os = "linux"))]
            TransportKind::Device => Err(Error::Unsupported(
                "in-band transport is only available on Linux",
            )),
            TransportKind::PingOnly => Ok(Box::new(PingTransport::open(&self)?)),
        }
    }

    pub(crate) fn username_field(&self) -> Result<[u8; 16]> {
        let name = self.username.as_bytes();
        if name.len() > 16 {
            return Err(Error::InvalidArgument("username too long (max 16 bytes)"));
        }
        let mut field = [0u8; 16];
        field[..name.len()].copy_from_slice(name);
        Ok(field)
    }
}

/// A session-less transport that only answers [`Transport::ping`].
pub struct PingTransport {
    channel: UdpChannel,
    pinger: Pinger,
}

impl PingTransport {
    pub(crate) fn open(builder: &SessionBuilder) -> Result<Self> {
        let mut transport = Self {
            channel: UdpChannel::connect(&builder.host, builder.port)?,
            pinger: Pinger::new(),
        };
        transport.ping()?;
        Ok(transport)
    }
}

impl Transport for PingTransport {
    fn ping(&mut self) -> Result<()> {
        ping_channel(&mut self.channel, &mut self.pinger)
    }

    fn issue(&mut self, _request: &Request) -> Result<RawResponse> {
        Err(Error::Unsupported("ping-only transport has no session"))
    }

    fn issue_bridging_cmd(
        &mut self,
        _channel: u8,
        _target_addr: u8,
        _bytes: &[u8],
        _lun: u8,
    ) -> Result<RawResponse> {
        Err(Error::Unsupported("ping-only transport has no session"))
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_active(&self) -> bool {
        false
    }
}

/// Shorthand for the keep-alive no-op: raw `Get Device ID`.
pub(crate) fn keepalive_noop_bytes() -> [u8; 2] {
    [commands::NETFN_APP, commands::CMD_GET_DEVICE_ID]
}

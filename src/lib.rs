#![deny(unsafe_code)]
#![warn(missing_docs)]

//! A blocking IPMI client engine: sessions, transports, and the message
//! plumbing underneath them.
//!
//! Three transport kinds share one capability interface:
//! - `lan`: IPMI v1.5 classic sessions over UDP (MD2/MD5/password auth)
//! - `lanplus`: IPMI v2.0 RMCP+ sessions (RAKP key exchange, HMAC
//!   integrity, AES-CBC-128 confidentiality)
//! - `device`: the local OpenIPMI character device on Linux
//!
//! A session is opened through [`SessionBuilder`] and driven through the
//! [`Transport`] trait; typed commands implement [`Command`] and go out
//! via [`issue_cmd`], raw byte commands via [`Transport::issue_raw_cmd`].
//!
//! ```no_run
//! use ipmi_client::{issue_cmd, SessionBuilder, TransportKind};
//! use ipmi_client::commands::GetDeviceId;
//!
//! # fn main() -> ipmi_client::Result<()> {
//! let mut session = SessionBuilder::new(TransportKind::LanPlus)
//!     .host("10.0.0.12")
//!     .username("admin")
//!     .password("secret")
//!     .connect()?;
//! let device = issue_cmd(session.as_mut(), &GetDeviceId)?;
//! println!("manufacturer {:06x}", device.manufacturer_id);
//! # Ok(())
//! # }
//! ```

pub mod commands;
pub mod crypto;
mod debug;
mod error;
pub mod message;
mod observe;
mod proto;
pub mod transport;
mod types;

pub use crate::crypto::CipherSuite;
pub use crate::error::{completion_code_reason, rmcpplus_status_reason, Error, Result};
pub use crate::message::{Command, MessageKind, Request};
pub use crate::transport::{
    issue_cmd, LanPlusTransport, LanTransport, PingTransport, SessionBuilder, Transport,
    TransportKind,
};
pub use crate::types::{
    AuthType, ChannelAuthCapabilities, DeviceId, PrivilegeLevel, RawResponse,
};

#[cfg(target_os = "linux")]
pub use crate::transport::DeviceTransport;

//! In-band transport over the Linux OpenIPMI character device.
//!
//! Requests go down as `ipmi_req` ioctls tagged with a message id; the
//! kernel routes them to the system interface or out over IPMB and hands
//! completions back through `ipmi_recv`. There is no session and no
//! network framing here, so the retry discipline reduces to a bounded
//! wait that discards completions for message ids we no longer care about.

use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::message::{MessageKind, Request};
use crate::observe;
use crate::transport::{SessionBuilder, Transport};
use crate::types::RawResponse;

/// Bounded wait for one completion from the kernel.
const DEVICE_RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);

/// Where the kernel should deliver a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeviceAddr {
    /// The local BMC via the system interface.
    SystemInterface { lun: u8 },
    /// A satellite controller behind an IPMB channel.
    Ipmb { channel: u8, slave: u8, lun: u8 },
}

#[derive(Debug, Clone)]
pub(crate) struct DeviceRequest {
    pub(crate) addr: DeviceAddr,
    pub(crate) msgid: i64,
    pub(crate) netfn: u8,
    pub(crate) cmd: u8,
    pub(crate) data: Vec<u8>,
}

/// One response message from the kernel. `payload[0]` is the completion
/// code, the rest is response data.
#[derive(Debug, Clone)]
pub(crate) struct DeviceCompletion {
    pub(crate) msgid: i64,
    pub(crate) payload: Vec<u8>,
}

/// The ioctl surface of the device, behind a trait so the transport logic
/// is testable without a kernel.
pub(crate) trait DeviceIo: Send {
    fn submit(&mut self, request: &DeviceRequest) -> Result<()>;

    /// Wait up to `timeout` for one response message; `Ok(None)` on
    /// timeout. Event messages are filtered out here.
    fn receive(&mut self, timeout: Duration) -> Result<Option<DeviceCompletion>>;
}

/// A connection to `/dev/ipmiN`.
pub struct DeviceTransport {
    io: Box<dyn DeviceIo>,
    msgid: i64,
    active: bool,
}

impl DeviceTransport {
    pub(crate) fn open(builder: &SessionBuilder) -> Result<Self> {
        let device = openipmi::OpenIpmiDevice::open(builder.device_num, builder.local_addr)?;
        Ok(Self::with_io(Box::new(device)))
    }

    #[cfg(test)]
    fn with_io_for_test(io: Box<dyn DeviceIo>) -> Self {
        Self::with_io(io)
    }

    fn with_io(io: Box<dyn DeviceIo>) -> Self {
        Self {
            io,
            msgid: 0,
            active: true,
        }
    }

    fn next_msgid(&mut self) -> i64 {
        self.msgid = if self.msgid >= 0xFFFF { 1 } else { self.msgid + 1 };
        self.msgid
    }

    fn issue_at(
        &mut self,
        addr: DeviceAddr,
        netfn: u8,
        cmd: u8,
        data: &[u8],
    ) -> Result<RawResponse> {
        if !self.active {
            return Err(Error::Protocol("device transport is closed"));
        }

        let msgid = self.next_msgid();
        self.io.submit(&DeviceRequest {
            addr,
            msgid,
            netfn,
            cmd,
            data: data.to_vec(),
        })?;

        let deadline = Instant::now() + DEVICE_RESPONSE_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }
            match self.io.receive(remaining)? {
                None => return Err(Error::Timeout),
                // A completion for an abandoned earlier request.
                Some(completion) if completion.msgid != msgid => continue,
                Some(completion) => {
                    let Some((&completion_code, data)) = completion.payload.split_first() else {
                        return Err(Error::Protocol("empty device response"));
                    };
                    return Ok(RawResponse {
                        completion_code,
                        data: data.to_vec(),
                    });
                }
            }
        }
    }

    fn issue_request(&mut self, request: &Request) -> Result<RawResponse> {
        match request.kind() {
            MessageKind::Structured | MessageKind::Raw => self.issue_at(
                DeviceAddr::SystemInterface { lun: request.lun },
                request.netfn,
                request.cmd,
                &request.data,
            ),
            MessageKind::Handshake(_) => {
                Err(Error::Protocol("in-band transport has no session handshake"))
            }
        }
    }
}

impl Transport for DeviceTransport {
    fn ping(&mut self) -> Result<()> {
        Err(Error::Unsupported("in-band transport has no presence ping"))
    }

    fn issue(&mut self, request: &Request) -> Result<RawResponse> {
        let start = Instant::now();
        let result = self.issue_request(request);
        match &result {
            Ok(response) => observe::record_ok(
                "device",
                request.netfn(),
                request.cmd(),
                start.elapsed(),
                response.completion_code,
            ),
            Err(err) => observe::record_err(
                "device",
                request.netfn(),
                request.cmd(),
                start.elapsed(),
                err,
            ),
        }
        result
    }

    fn issue_bridging_cmd(
        &mut self,
        channel: u8,
        target_addr: u8,
        bytes: &[u8],
        lun: u8,
    ) -> Result<RawResponse> {
        let request = Request::raw(bytes, lun)?;
        self.issue_at(
            DeviceAddr::Ipmb {
                channel,
                slave: target_addr,
                lun: request.lun,
            },
            request.netfn,
            request.cmd,
            &request.data,
        )
    }

    fn close(&mut self) -> Result<()> {
        self.active = false;
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

/// The raw OpenIPMI ioctl layer. Everything unsafe lives here.
mod openipmi {
    use std::fs::{File, OpenOptions};
    use std::io;
    use std::mem::size_of;
    use std::os::fd::AsRawFd;
    use std::time::Duration;

    use super::{DeviceAddr, DeviceCompletion, DeviceIo, DeviceRequest};
    use crate::error::{Error, Result};

    const IPMI_SYSTEM_INTERFACE_ADDR_TYPE: i32 = 0x0C;
    const IPMI_IPMB_ADDR_TYPE: i32 = 0x01;
    const IPMI_BMC_CHANNEL: i16 = 0x0F;
    const IPMI_RESPONSE_RECV_TYPE: i32 = 1;

    // Largest message the kernel driver will hand back.
    const IPMI_MAX_MSG_LENGTH: usize = 272;
    const IPMI_MAX_ADDR_SIZE: usize = 32;

    #[repr(C)]
    struct IpmiMsg {
        netfn: u8,
        cmd: u8,
        data_len: u16,
        data: *mut u8,
    }

    #[repr(C)]
    struct IpmiReq {
        addr: *mut u8,
        addr_len: u32,
        msgid: libc::c_long,
        msg: IpmiMsg,
    }

    #[repr(C)]
    struct IpmiRecv {
        recv_type: i32,
        addr: *mut u8,
        addr_len: u32,
        msgid: libc::c_long,
        msg: IpmiMsg,
    }

    #[repr(C)]
    struct IpmiSystemInterfaceAddr {
        addr_type: i32,
        channel: i16,
        lun: u8,
    }

    #[repr(C)]
    struct IpmiIpmbAddr {
        addr_type: i32,
        channel: i16,
        slave_addr: u8,
        lun: u8,
    }

    // Generic receive-side address buffer, as large as the kernel's.
    #[repr(C)]
    struct IpmiAddr {
        addr_type: i32,
        channel: i16,
        data: [u8; IPMI_MAX_ADDR_SIZE],
    }

    const IPMI_IOC_MAGIC: libc::c_ulong = b'i' as libc::c_ulong;

    const fn ioc(dir: libc::c_ulong, nr: libc::c_ulong, size: usize) -> libc::c_ulong {
        (dir << 30) | ((size as libc::c_ulong) << 16) | (IPMI_IOC_MAGIC << 8) | nr
    }

    const IOC_READ: libc::c_ulong = 2;
    const IOC_READ_WRITE: libc::c_ulong = 3;

    const IPMICTL_RECEIVE_MSG_TRUNC: libc::c_ulong =
        ioc(IOC_READ_WRITE, 11, size_of::<IpmiRecv>());
    const IPMICTL_SEND_COMMAND: libc::c_ulong = ioc(IOC_READ, 13, size_of::<IpmiReq>());
    const IPMICTL_SET_GETS_EVENTS_CMD: libc::c_ulong =
        ioc(IOC_READ, 16, size_of::<libc::c_int>());
    const IPMICTL_SET_MY_ADDRESS_CMD: libc::c_ulong =
        ioc(IOC_READ, 17, size_of::<libc::c_uint>());

    pub(super) struct OpenIpmiDevice {
        file: File,
    }

    impl OpenIpmiDevice {
        pub(super) fn open(device_num: u32, local_addr: u8) -> Result<Self> {
            let candidates = [
                format!("/dev/ipmi{device_num}"),
                format!("/dev/ipmi/{device_num}"),
                format!("/dev/ipmidev/{device_num}"),
            ];

            let mut last_err = None;
            for path in &candidates {
                match OpenOptions::new().read(true).write(true).open(path) {
                    Ok(file) => {
                        let device = Self { file };
                        device.set_gets_events(true)?;
                        if local_addr != 0 {
                            device.set_my_address(local_addr)?;
                        }
                        return Ok(device);
                    }
                    Err(err) => last_err = Some(err),
                }
            }
            match last_err {
                Some(err) => Err(err.into()),
                None => Err(Error::Unsupported("no OpenIPMI device node found")),
            }
        }

        #[allow(unsafe_code)]
        fn ioctl<T>(&self, request: libc::c_ulong, arg: *mut T) -> Result<()> {
            let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), request, arg) };
            if rc < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(())
        }

        fn set_gets_events(&self, enabled: bool) -> Result<()> {
            let mut value: libc::c_int = enabled.into();
            self.ioctl(IPMICTL_SET_GETS_EVENTS_CMD, &mut value)
        }

        fn set_my_address(&self, addr: u8) -> Result<()> {
            let mut value: libc::c_uint = addr.into();
            self.ioctl(IPMICTL_SET_MY_ADDRESS_CMD, &mut value)
        }

        /// Wait for the fd to become readable; false on timeout.
        #[allow(unsafe_code)]
        fn poll_readable(&self, timeout: Duration) -> Result<bool> {
            let mut fds = libc::pollfd {
                fd: self.file.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
            let rc = unsafe { libc::poll(&mut fds, 1, millis) };
            if rc < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(rc > 0)
        }
    }

    impl DeviceIo for OpenIpmiDevice {
        #[allow(unsafe_code)]
        fn submit(&mut self, request: &DeviceRequest) -> Result<()> {
            if request.data.len() > IPMI_MAX_MSG_LENGTH {
                return Err(Error::InvalidArgument("request data too large for device"));
            }

            let msg = IpmiMsg {
                netfn: request.netfn,
                cmd: request.cmd,
                data_len: request.data.len() as u16,
                // The kernel only reads from the request buffer.
                data: request.data.as_ptr() as *mut u8,
            };

            match request.addr {
                DeviceAddr::SystemInterface { lun } => {
                    let mut addr = IpmiSystemInterfaceAddr {
                        addr_type: IPMI_SYSTEM_INTERFACE_ADDR_TYPE,
                        channel: IPMI_BMC_CHANNEL,
                        lun,
                    };
                    let mut req = IpmiReq {
                        addr: (&mut addr as *mut IpmiSystemInterfaceAddr).cast(),
                        addr_len: size_of::<IpmiSystemInterfaceAddr>() as u32,
                        msgid: request.msgid as libc::c_long,
                        msg,
                    };
                    self.ioctl(IPMICTL_SEND_COMMAND, &mut req)
                }
                DeviceAddr::Ipmb { channel, slave, lun } => {
                    let mut addr = IpmiIpmbAddr {
                        addr_type: IPMI_IPMB_ADDR_TYPE,
                        channel: channel.into(),
                        slave_addr: slave,
                        lun,
                    };
                    let mut req = IpmiReq {
                        addr: (&mut addr as *mut IpmiIpmbAddr).cast(),
                        addr_len: size_of::<IpmiIpmbAddr>() as u32,
                        msgid: request.msgid as libc::c_long,
                        msg,
                    };
                    self.ioctl(IPMICTL_SEND_COMMAND, &mut req)
                }
            }
        }

        #[allow(unsafe_code)]
        fn receive(&mut self, timeout: Duration) -> Result<Option<DeviceCompletion>> {
            if !self.poll_readable(timeout)? {
                return Ok(None);
            }

            let mut addr = IpmiAddr {
                addr_type: 0,
                channel: 0,
                data: [0u8; IPMI_MAX_ADDR_SIZE],
            };
            let mut data = [0u8; IPMI_MAX_MSG_LENGTH];
            let mut recv = IpmiRecv {
                recv_type: 0,
                addr: (&mut addr as *mut IpmiAddr).cast(),
                addr_len: size_of::<IpmiAddr>() as u32,
                msgid: 0,
                msg: IpmiMsg {
                    netfn: 0,
                    cmd: 0,
                    data_len: data.len() as u16,
                    data: data.as_mut_ptr(),
                },
            };
            self.ioctl(IPMICTL_RECEIVE_MSG_TRUNC, &mut recv)?;

            // Asynchronous events are not ours to consume.
            if recv.recv_type != IPMI_RESPONSE_RECV_TYPE {
                return Ok(None);
            }

            let len = (recv.msg.data_len as usize).min(data.len());
            Ok(Some(DeviceCompletion {
                msgid: recv.msgid as i64,
                payload: data[..len].to_vec(),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::GetDeviceId;
    use crate::transport::issue_cmd;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    struct MockDeviceIo {
        submitted: Arc<Mutex<Vec<DeviceRequest>>>,
        responses: VecDeque<DeviceCompletion>,
    }

    impl MockDeviceIo {
        fn new(responses: Vec<DeviceCompletion>) -> (Self, Arc<Mutex<Vec<DeviceRequest>>>) {
            let submitted = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    submitted: Arc::clone(&submitted),
                    responses: responses.into(),
                },
                submitted,
            )
        }
    }

    impl DeviceIo for MockDeviceIo {
        fn submit(&mut self, request: &DeviceRequest) -> Result<()> {
            self.submitted.lock().unwrap().push(request.clone());
            Ok(())
        }

        fn receive(&mut self, _timeout: Duration) -> Result<Option<DeviceCompletion>> {
            Ok(self.responses.pop_front())
        }
    }

    fn device_id_payload() -> Vec<u8> {
        let mut payload = vec![0x00];
        payload.extend_from_slice(&[0u8; 11]);
        payload
    }

    #[test]
    fn system_interface_round_trip() {
        let (io, submitted) = MockDeviceIo::new(vec![DeviceCompletion {
            msgid: 1,
            payload: device_id_payload(),
        }]);
        let mut transport = DeviceTransport::with_io_for_test(Box::new(io));

        let device = issue_cmd(&mut transport, &GetDeviceId).expect("device id");
        assert_eq!(device.device_id, 0);

        let submitted = submitted.lock().unwrap();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].netfn, 0x06);
        assert_eq!(submitted[0].cmd, 0x01);
        assert_eq!(
            submitted[0].addr,
            DeviceAddr::SystemInterface { lun: 0 }
        );
    }

    #[test]
    fn stale_completions_are_discarded() {
        let (io, _) = MockDeviceIo::new(vec![
            DeviceCompletion {
                msgid: 99,
                payload: vec![0xC3],
            },
            DeviceCompletion {
                msgid: 1,
                payload: device_id_payload(),
            },
        ]);
        let mut transport = DeviceTransport::with_io_for_test(Box::new(io));
        assert!(issue_cmd(&mut transport, &GetDeviceId).is_ok());
    }

    #[test]
    fn no_completion_is_a_timeout() {
        let (io, _) = MockDeviceIo::new(vec![]);
        let mut transport = DeviceTransport::with_io_for_test(Box::new(io));
        let err = issue_cmd(&mut transport, &GetDeviceId).unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }

    #[test]
    fn bridged_request_targets_ipmb() {
        let (io, submitted) = MockDeviceIo::new(vec![DeviceCompletion {
            msgid: 1,
            payload: vec![0x00, 0xAA],
        }]);
        let mut transport = DeviceTransport::with_io_for_test(Box::new(io));

        let response = transport
            .issue_bridging_cmd(0x07, 0x72, &[0x04, 0x2D, 0x05], 0)
            .expect("bridged");
        assert_eq!(response.completion_code, 0x00);
        assert_eq!(response.data, [0xAA]);

        let submitted = submitted.lock().unwrap();
        assert_eq!(
            submitted[0].addr,
            DeviceAddr::Ipmb {
                channel: 0x07,
                slave: 0x72,
                lun: 0
            }
        );
        assert_eq!(submitted[0].netfn, 0x04);
        assert_eq!(submitted[0].cmd, 0x2D);
        assert_eq!(submitted[0].data, [0x05]);
    }

    #[test]
    fn msgid_wraps_before_ffff() {
        let (io, _) = MockDeviceIo::new(vec![]);
        let mut transport = DeviceTransport::with_io_for_test(Box::new(io));
        transport.msgid = 0xFFFE;
        assert_eq!(transport.next_msgid(), 0xFFFF);
        assert_eq!(transport.next_msgid(), 1);
    }

    #[test]
    fn closed_transport_refuses_commands() {
        let (io, _) = MockDeviceIo::new(vec![]);
        let mut transport = DeviceTransport::with_io_for_test(Box::new(io));
        transport.close().expect("close");
        assert!(!transport.is_active());
        assert!(issue_cmd(&mut transport, &GetDeviceId).is_err());
    }
}

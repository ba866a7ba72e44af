//! IPMI v1.5 classic session transport.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use rand::RngCore;

use crate::commands::{
    ActivateSession, CloseSession, GetChannelAuthCapabilities, GetSessionChallenge,
    SetSessionPrivilegeLevel, CMD_SEND_MESSAGE, NETFN_APP,
};
use crate::debug;
use crate::error::{Error, Result};
use crate::message::{Command, MessageKind, Request};
use crate::observe;
use crate::proto::v1_5::{self, BMC_ADDR};
use crate::proto::Pinger;
use crate::transport::keepalive::{KeepAlive, IDLE_TICKS, TICK};
use crate::transport::{
    ping_channel, Channel, SessionBuilder, Transport, UdpChannel, BRIDGE_RESPONSE_ATTEMPTS,
    RESPONSE_TIMEOUT, SEND_ATTEMPTS, SEQ_MISMATCH_RETRIES,
};
use crate::types::{AuthType, RawResponse};

/// A classic (v1.5) session over UDP.
pub struct LanTransport {
    inner: Arc<Mutex<Inner>>,
    keepalive: Option<KeepAlive>,
}

struct Inner {
    channel: Box<dyn Channel>,
    pinger: Pinger,
    auth: AuthType,
    password16: [u8; 16],
    session_id: [u8; 4],
    session_seq: u32,
    rq_seq: u8,
    active: bool,
    use_auth: bool,
    lenient_bridge_ack: bool,
}

impl Inner {
    fn next_rq_seq(&mut self) -> u8 {
        let seq = self.rq_seq;
        self.rq_seq = (self.rq_seq + 1) & 0x3F;
        seq
    }

    /// Incremented before each send once the session is active; wraps past
    /// 0xFFFFFFFF to 1, never back to 0.
    fn next_session_seq(&mut self) -> u32 {
        if !self.active {
            return 0;
        }
        self.session_seq = match self.session_seq {
            u32::MAX => 1,
            seq => seq + 1,
        };
        self.session_seq
    }

    fn wire_auth(&self) -> (AuthType, Option<&[u8; 16]>) {
        if self.use_auth {
            (self.auth, Some(&self.password16))
        } else {
            (AuthType::None, None)
        }
    }

    fn ping(&mut self) -> Result<()> {
        ping_channel(self.channel.as_mut(), &mut self.pinger)
    }

    /// One send/wait cycle set for a command framed against `dest_addr`.
    fn issue_at(
        &mut self,
        dest_addr: u8,
        netfn: u8,
        cmd: u8,
        lun: u8,
        data: &[u8],
    ) -> Result<RawResponse> {
        let rq_seq = self.next_rq_seq();
        let inner = v1_5::encode_lan_request(dest_addr, netfn, cmd, lun, rq_seq, data)?;

        for _ in 0..SEND_ATTEMPTS {
            self.send_framed(&inner)?;
            if let Some(response) = self.wait_lan_response(dest_addr, netfn, cmd, rq_seq)? {
                return Ok(response);
            }
        }
        Err(Error::Timeout)
    }

    fn send_framed(&mut self, inner: &[u8]) -> Result<()> {
        let session_seq = self.next_session_seq();
        let session_id = self.session_id;
        let (auth, password) = self.wire_auth();
        let packet =
            v1_5::encode_session_packet(auth, password, &session_id, session_seq, inner)?;
        debug::dump_hex("lan send", &packet);
        self.channel.send(&packet)
    }

    /// Wait for the response matching `rq_seq`, tolerating up to
    /// `SEQ_MISMATCH_RETRIES` stale datagrams. `Ok(None)` means the wait
    /// timed out and the caller may resend.
    fn wait_lan_response(
        &mut self,
        dest_addr: u8,
        netfn: u8,
        cmd: u8,
        rq_seq: u8,
    ) -> Result<Option<RawResponse>> {
        let mut stale = 0;
        loop {
            let Some(bytes) = self.channel.recv_timeout(RESPONSE_TIMEOUT)? else {
                return Ok(None);
            };
            debug::dump_hex("lan recv", &bytes);

            let (auth, password) = self.wire_auth();
            let (_, _, payload) = v1_5::decode_session_packet(auth, password, &bytes)?;
            match v1_5::decode_lan_response(dest_addr, netfn, cmd, rq_seq, &payload) {
                Ok(response) => return Ok(Some(response)),
                Err(Error::SequenceMismatch) if stale < SEQ_MISMATCH_RETRIES => {
                    stale += 1;
                }
                Err(Error::SequenceMismatch) => {
                    return Err(Error::Protocol(
                        "could not match response sequence after retries",
                    ))
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn issue_request(&mut self, request: &Request) -> Result<RawResponse> {
        match request.kind() {
            MessageKind::Structured | MessageKind::Raw => self.issue_at(
                BMC_ADDR,
                request.netfn,
                request.cmd,
                request.lun,
                &request.data,
            ),
            MessageKind::Handshake(_) => Err(Error::Protocol(
                "handshake payloads only travel over RMCP+ sessions",
            )),
        }
    }

    fn issue_typed<C: Command>(&mut self, command: &C) -> Result<C::Output> {
        let request = command.to_request()?;
        let response = self.issue_request(&request)?;
        response.expect_success(C::NETFN, C::CMD)?;
        command.parse_response(response)
    }

    /// Bridged command: Send Message wrapping an inner LAN message for the
    /// target, then the deferred response framed against the target.
    fn issue_bridged(
        &mut self,
        channel: u8,
        target_addr: u8,
        netfn: u8,
        cmd: u8,
        lun: u8,
        data: &[u8],
    ) -> Result<RawResponse> {
        let inner_rq_seq = self.next_rq_seq();
        let inner_msg =
            v1_5::encode_lan_request(target_addr, netfn, cmd, lun, inner_rq_seq, data)?;

        let mut outer_data = Vec::with_capacity(1 + inner_msg.len());
        outer_data.push(0x40 | (channel & 0x0F));
        outer_data.extend_from_slice(&inner_msg);

        let outer_rq_seq = self.next_rq_seq();
        let outer = v1_5::encode_lan_request(
            BMC_ADDR,
            NETFN_APP,
            CMD_SEND_MESSAGE,
            0,
            outer_rq_seq,
            &outer_data,
        )?;

        let mut acked = false;
        for _ in 0..SEND_ATTEMPTS {
            self.send_framed(&outer)?;
            if let Some(ack) = self.wait_bridge_ack(outer_rq_seq)? {
                ack.expect_success(NETFN_APP, CMD_SEND_MESSAGE)?;
                acked = true;
                break;
            }
        }
        if !acked {
            return Err(Error::Timeout);
        }

        for _ in 0..BRIDGE_RESPONSE_ATTEMPTS {
            if let Some(response) =
                self.wait_lan_response(target_addr, netfn, cmd, inner_rq_seq)?
            {
                return Ok(response);
            }
        }
        Err(Error::Timeout)
    }

    /// First bridging stage: the local Send Message acknowledgment. Some
    /// firmware tags it with the wrong sequence; the leniency flag accepts
    /// it anyway.
    fn wait_bridge_ack(&mut self, rq_seq: u8) -> Result<Option<RawResponse>> {
        let Some(bytes) = self.channel.recv_timeout(RESPONSE_TIMEOUT)? else {
            return Ok(None);
        };
        debug::dump_hex("lan recv", &bytes);

        let (auth, password) = self.wire_auth();
        let (_, _, payload) = v1_5::decode_session_packet(auth, password, &bytes)?;
        match v1_5::decode_lan_response(BMC_ADDR, NETFN_APP, CMD_SEND_MESSAGE, rq_seq, &payload)
        {
            Ok(ack) => Ok(Some(ack)),
            Err(Error::SequenceMismatch) if self.lenient_bridge_ack && payload.len() > 4 => {
                let actual = payload[4] >> 2;
                Ok(Some(v1_5::decode_lan_response(
                    BMC_ADDR,
                    NETFN_APP,
                    CMD_SEND_MESSAGE,
                    actual,
                    &payload,
                )?))
            }
            Err(err) => Err(err),
        }
    }

    fn close_session(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        let session_id = self.session_id;
        let result = self.issue_typed(&CloseSession { session_id });
        // Locally closed either way; a wire timeout is tolerated.
        self.active = false;
        self.use_auth = false;
        match result {
            Ok(()) | Err(Error::Timeout) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl LanTransport {
    pub(crate) fn open(builder: &SessionBuilder) -> Result<Self> {
        let channel = UdpChannel::connect(&builder.host, builder.port)?;
        Self::open_with_channel(builder, Box::new(channel))
    }

    pub(crate) fn open_with_channel(
        builder: &SessionBuilder,
        channel: Box<dyn Channel>,
    ) -> Result<Self> {
        if builder.auth_type == AuthType::Oem {
            return Err(Error::Unsupported("OEM auth type"));
        }

        let mut inner = Inner {
            channel,
            pinger: Pinger::new(),
            auth: builder.auth_type,
            password16: builder.password.to_key_16(),
            session_id: [0u8; 4],
            session_seq: 0,
            rq_seq: 0,
            active: false,
            use_auth: false,
            lenient_bridge_ack: builder.lenient_bridge_ack,
        };

        if !builder.skip_ping {
            inner.ping()?;
        }

        let caps = inner.issue_typed(&GetChannelAuthCapabilities {
            channel: 0x0E,
            privilege: builder.privilege,
        })?;
        if caps.enabled_auth_types & (1 << builder.auth_type.as_u8()) == 0 {
            return Err(Error::Unsupported(
                "requested auth type not enabled on the channel",
            ));
        }

        let challenge = inner.issue_typed(&GetSessionChallenge {
            auth: builder.auth_type,
            username: builder.username_field()?,
        })?;

        inner.session_id = challenge.temporary_session_id;
        inner.use_auth = builder.auth_type != AuthType::None;

        let mut rng = rand::rng();
        let initial_outbound_seq = loop {
            let seq = rng.next_u32();
            if seq != 0 {
                break seq;
            }
        };
        let activated = inner.issue_typed(&ActivateSession {
            auth: builder.auth_type,
            privilege: builder.privilege,
            challenge: challenge.challenge,
            initial_outbound_seq,
        })?;

        inner.auth = activated.auth;
        inner.use_auth = activated.auth != AuthType::None;
        inner.session_id = activated.session_id;
        inner.session_seq = activated.initial_inbound_seq;
        inner.active = true;

        inner.issue_typed(&SetSessionPrivilegeLevel {
            privilege: builder.privilege,
        })?;

        let inner = Arc::new(Mutex::new(inner));
        let keepalive = if builder.keep_alive {
            Some(spawn_keepalive(&inner)?)
        } else {
            None
        };

        Ok(Self { inner, keepalive })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn touch(&self) {
        if let Some(keepalive) = &self.keepalive {
            keepalive.touch();
        }
    }
}

fn spawn_keepalive(inner: &Arc<Mutex<Inner>>) -> Result<KeepAlive> {
    let weak = Arc::downgrade(inner);
    KeepAlive::spawn(TICK, IDLE_TICKS, move || {
        let Some(inner) = weak.upgrade() else {
            return false;
        };
        let mut inner = inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !inner.active {
            return false;
        }
        let noop = crate::transport::keepalive_noop_bytes();
        if let Ok(request) = Request::raw(&noop, 0) {
            let _ = inner.issue_request(&request);
        }
        true
    })
}

impl Transport for LanTransport {
    fn ping(&mut self) -> Result<()> {
        self.lock().ping()
    }

    fn issue(&mut self, request: &Request) -> Result<RawResponse> {
        self.touch();
        let start = Instant::now();
        let result = self.lock().issue_request(request);
        match &result {
            Ok(response) => observe::record_ok(
                "lan",
                request.netfn(),
                request.cmd(),
                start.elapsed(),
                response.completion_code,
            ),
            Err(err) => {
                observe::record_err("lan", request.netfn(), request.cmd(), start.elapsed(), err)
            }
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
        self.touch();
        let request = Request::raw(bytes, lun)?;
        self.lock().issue_bridged(
            channel,
            target_addr,
            request.netfn,
            request.cmd,
            request.lun,
            &request.data,
        )
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut keepalive) = self.keepalive.take() {
            keepalive.stop();
        }
        self.lock().close_session()
    }

    fn is_active(&self) -> bool {
        self.lock().active
    }
}

impl Drop for LanTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::GetDeviceId;
    use crate::crypto::checksum;
    use crate::transport::{issue_cmd, TransportKind};
    use std::collections::VecDeque;
    use std::time::Duration;

    struct MockChannel {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        responses: VecDeque<Vec<u8>>,
    }

    impl Channel for MockChannel {
        fn send(&mut self, bytes: &[u8]) -> Result<()> {
            self.sent.lock().unwrap().push(bytes.to_vec());
            Ok(())
        }

        fn recv_timeout(&mut self, _timeout: Duration) -> Result<Option<Vec<u8>>> {
            Ok(self.responses.pop_front())
        }
    }

    fn lan_response(
        dest_addr: u8,
        netfn: u8,
        cmd: u8,
        rq_seq: u8,
        completion_code: u8,
        data: &[u8],
    ) -> Vec<u8> {
        let netfn_lun = (netfn + 1) << 2;
        let mut msg = vec![0x81, netfn_lun, checksum(&[0x81, netfn_lun])];
        msg.push(dest_addr);
        msg.push(rq_seq << 2);
        msg.push(cmd);
        msg.push(completion_code);
        msg.extend_from_slice(data);
        let csum2 = checksum(&msg[3..]);
        msg.push(csum2);
        msg
    }

    fn session_wrap(
        auth: AuthType,
        password: Option<&[u8; 16]>,
        session_id: &[u8; 4],
        session_seq: u32,
        inner: &[u8],
    ) -> Vec<u8> {
        v1_5::encode_session_packet(auth, password, session_id, session_seq, inner)
            .expect("session packet")
    }

    fn password16() -> [u8; 16] {
        let mut p = [0u8; 16];
        p[..5].copy_from_slice(b"admin");
        p
    }

    const TEMP_SID: [u8; 4] = [0xDE, 0xAD, 0xBE, 0xEF];
    const LIVE_SID: [u8; 4] = [0x01, 0x02, 0x03, 0x04];

    /// The canned BMC half of a full MD5 session: bring-up, one Get Device
    /// ID, close. `rq_seq` advances 0..=5 on the client side.
    fn scripted_session(device_id_len: usize) -> VecDeque<Vec<u8>> {
        let pw = password16();
        let mut responses = VecDeque::new();

        // Get Channel Authentication Capabilities: MD5 enabled, v1.5 only.
        responses.push_back(session_wrap(
            AuthType::None,
            None,
            &[0u8; 4],
            0,
            &lan_response(0x20, 0x06, 0x38, 0, 0x00, &[0x01, 0x04, 0x04, 0x00, 0, 0, 0, 0]),
        ));

        // Get Session Challenge: temp sid + challenge.
        let mut challenge_data = Vec::new();
        challenge_data.extend_from_slice(&TEMP_SID);
        challenge_data.extend_from_slice(&[0x55u8; 16]);
        responses.push_back(session_wrap(
            AuthType::None,
            None,
            &[0u8; 4],
            0,
            &lan_response(0x20, 0x06, 0x39, 1, 0x00, &challenge_data),
        ));

        // Activate Session: adopt MD5, the live sid, inbound seq 0x20.
        let mut activate_data = vec![AuthType::Md5.as_u8()];
        activate_data.extend_from_slice(&LIVE_SID);
        activate_data.extend_from_slice(&0x20u32.to_le_bytes());
        activate_data.push(0x04);
        responses.push_back(session_wrap(
            AuthType::Md5,
            Some(&pw),
            &TEMP_SID,
            0,
            &lan_response(0x20, 0x06, 0x3A, 2, 0x00, &activate_data),
        ));

        // Set Session Privilege Level.
        responses.push_back(session_wrap(
            AuthType::Md5,
            Some(&pw),
            &LIVE_SID,
            1,
            &lan_response(0x20, 0x06, 0x3B, 3, 0x00, &[0x04]),
        ));

        // Get Device ID.
        let device_data: Vec<u8> = (0..device_id_len as u8).collect();
        responses.push_back(session_wrap(
            AuthType::Md5,
            Some(&pw),
            &LIVE_SID,
            2,
            &lan_response(0x20, 0x06, 0x01, 4, 0x00, &device_data),
        ));

        // Close Session.
        responses.push_back(session_wrap(
            AuthType::Md5,
            Some(&pw),
            &LIVE_SID,
            3,
            &lan_response(0x20, 0x06, 0x3C, 5, 0x00, &[]),
        ));

        responses
    }

    fn builder() -> SessionBuilder {
        SessionBuilder::new(TransportKind::Lan)
            .host("203.0.113.9")
            .username("admin")
            .password(b"admin".to_vec())
            .auth_type(AuthType::Md5)
            .skip_ping(true)
    }

    fn open_scripted(
        device_id_len: usize,
    ) -> (LanTransport, Arc<Mutex<Vec<Vec<u8>>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let channel = MockChannel {
            sent: Arc::clone(&sent),
            responses: scripted_session(device_id_len),
        };
        let transport =
            LanTransport::open_with_channel(&builder(), Box::new(channel)).expect("open");
        (transport, sent)
    }

    #[test]
    fn classic_session_end_to_end() {
        let (mut transport, _sent) = open_scripted(11);
        assert!(transport.is_active());

        let device = issue_cmd(&mut transport, &GetDeviceId).expect("device id");
        assert_eq!(device.device_id, 0);
        assert_eq!(device.aux_firmware_revision, None);

        transport.close().expect("close");
        assert!(!transport.is_active());
    }

    #[test]
    fn device_id_long_layout_carries_aux_revision() {
        let (mut transport, _sent) = open_scripted(15);
        let device = issue_cmd(&mut transport, &GetDeviceId).expect("device id");
        assert_eq!(device.aux_firmware_revision, Some([11, 12, 13, 14]));
        transport.close().expect("close");
    }

    #[test]
    fn session_sequence_increments_per_send() {
        let (mut transport, sent) = open_scripted(11);
        let _ = issue_cmd(&mut transport, &GetDeviceId).expect("device id");
        transport.close().expect("close");

        // Session seq lives at bytes 5..9 of every session packet.
        let seqs: Vec<u32> = sent
            .lock()
            .unwrap()
            .iter()
            .map(|p| u32::from_le_bytes(p[5..9].try_into().unwrap()))
            .collect();
        // Pre-session packets ride seq 0; active packets strictly increase
        // from the adopted initial value.
        assert_eq!(&seqs[..3], &[0, 0, 0]);
        assert_eq!(&seqs[3..], &[0x21, 0x22, 0x23]);
    }

    #[test]
    fn stale_sequence_tags_get_bounded_retries() {
        let pw = password16();
        let stale = session_wrap(
            AuthType::Md5,
            Some(&pw),
            &LIVE_SID,
            9,
            &lan_response(0x20, 0x06, 0x01, 0x3F, 0x00, &[0u8; 11]),
        );

        let mut responses = scripted_session(11);
        // Two stale datagrams ahead of the real Get Device ID response.
        let real = responses.remove(4).unwrap();
        responses.insert(4, real);
        responses.insert(4, stale.clone());
        responses.insert(4, stale.clone());

        let sent = Arc::new(Mutex::new(Vec::new()));
        let channel = MockChannel {
            sent: Arc::clone(&sent),
            responses,
        };
        let mut transport =
            LanTransport::open_with_channel(&builder(), Box::new(channel)).expect("open");
        assert!(issue_cmd(&mut transport, &GetDeviceId).is_ok());

        // A third stale datagram exhausts the retry budget.
        let mut responses = scripted_session(11);
        let real = responses.remove(4).unwrap();
        responses.insert(4, real);
        for _ in 0..3 {
            responses.insert(4, stale.clone());
        }
        let channel = MockChannel {
            sent: Arc::new(Mutex::new(Vec::new())),
            responses,
        };
        let mut transport =
            LanTransport::open_with_channel(&builder(), Box::new(channel)).expect("open");
        let err = issue_cmd(&mut transport, &GetDeviceId).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn structured_completion_code_raises_raw_does_not() {
        let pw = password16();
        let mut responses = scripted_session(11);
        let busy = session_wrap(
            AuthType::Md5,
            Some(&pw),
            &LIVE_SID,
            2,
            &lan_response(0x20, 0x06, 0x01, 4, 0xC3, &[]),
        );
        responses.remove(4);
        responses.insert(4, busy);

        let channel = MockChannel {
            sent: Arc::new(Mutex::new(Vec::new())),
            responses,
        };
        let mut transport =
            LanTransport::open_with_channel(&builder(), Box::new(channel)).expect("open");

        let err = issue_cmd(&mut transport, &GetDeviceId).unwrap_err();
        assert!(matches!(err, Error::CompletionCode { code: 0xC3, .. }));

        // The same code on the raw path comes back as data.
        let pw = password16();
        let mut responses = scripted_session(11);
        let busy = session_wrap(
            AuthType::Md5,
            Some(&pw),
            &LIVE_SID,
            2,
            &lan_response(0x20, 0x06, 0x01, 4, 0xC3, &[]),
        );
        responses.remove(4);
        responses.insert(4, busy);
        let channel = MockChannel {
            sent: Arc::new(Mutex::new(Vec::new())),
            responses,
        };
        let mut transport =
            LanTransport::open_with_channel(&builder(), Box::new(channel)).expect("open");
        let response = transport
            .issue_raw_cmd(&[0x06, 0x01], 0)
            .expect("raw issue");
        assert_eq!(response.completion_code, 0xC3);
    }

    #[test]
    fn bridged_command_two_stage_response() {
        let pw = password16();
        let mut responses = scripted_session(11);
        // Drop the scripted Get Device ID exchange; replace it with the
        // bridging pair: local ack (rq_seq 5, outer) then the deferred
        // response framed against the target (rq_seq 4, inner).
        responses.remove(4);
        let ack = session_wrap(
            AuthType::Md5,
            Some(&pw),
            &LIVE_SID,
            2,
            &lan_response(0x20, 0x06, 0x34, 5, 0x00, &[]),
        );
        let deferred = session_wrap(
            AuthType::Md5,
            Some(&pw),
            &LIVE_SID,
            3,
            &lan_response(0x72, 0x04, 0x2D, 4, 0x00, &[0x40]),
        );
        responses.insert(4, deferred);
        responses.insert(4, ack);
        // Fix up the close response sequence tag (rq_seq 6 after bridging).
        responses.pop_back();
        responses.push_back(session_wrap(
            AuthType::Md5,
            Some(&pw),
            &LIVE_SID,
            4,
            &lan_response(0x20, 0x06, 0x3C, 6, 0x00, &[]),
        ));

        let channel = MockChannel {
            sent: Arc::new(Mutex::new(Vec::new())),
            responses,
        };
        let mut transport =
            LanTransport::open_with_channel(&builder(), Box::new(channel)).expect("open");

        let response = transport
            .issue_bridging_cmd(0x00, 0x72, &[0x04, 0x2D], 0)
            .expect("bridged");
        assert_eq!(response.completion_code, 0x00);
        assert_eq!(response.data, vec![0x40]);
        transport.close().expect("close");
    }

    #[test]
    fn lenient_bridge_ack_tolerates_wrong_tag() {
        let pw = password16();
        let mut responses = scripted_session(11);
        responses.remove(4);
        // The ack comes back tagged rq_seq 0 instead of 5.
        let ack = session_wrap(
            AuthType::Md5,
            Some(&pw),
            &LIVE_SID,
            2,
            &lan_response(0x20, 0x06, 0x34, 0, 0x00, &[]),
        );
        let deferred = session_wrap(
            AuthType::Md5,
            Some(&pw),
            &LIVE_SID,
            3,
            &lan_response(0x72, 0x04, 0x2D, 4, 0x00, &[0x00]),
        );
        responses.insert(4, deferred);
        responses.insert(4, ack);

        let channel = MockChannel {
            sent: Arc::new(Mutex::new(Vec::new())),
            responses,
        };
        let mut transport =
            LanTransport::open_with_channel(&builder(), Box::new(channel)).expect("open");
        assert!(transport
            .issue_bridging_cmd(0x00, 0x72, &[0x04, 0x2D], 0)
            .is_ok());

        // With leniency off the same ack is a hard mismatch.
        let pw = password16();
        let mut responses = scripted_session(11);
        responses.remove(4);
        let ack = session_wrap(
            AuthType::Md5,
            Some(&pw),
            &LIVE_SID,
            2,
            &lan_response(0x20, 0x06, 0x34, 0, 0x00, &[]),
        );
        responses.insert(4, ack);
        let channel = MockChannel {
            sent: Arc::new(Mutex::new(Vec::new())),
            responses,
        };
        let mut transport = LanTransport::open_with_channel(
            &builder().lenient_bridge_ack(false),
            Box::new(channel),
        )
        .expect("open");
        assert!(transport
            .issue_bridging_cmd(0x00, 0x72, &[0x04, 0x2D], 0)
            .is_err());
    }
}

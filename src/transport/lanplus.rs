//! IPMI v2.0 RMCP+ session transport.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use zeroize::Zeroizing;

use crate::commands::{
    CloseSession, GetChannelAuthCapabilities, SetSessionPrivilegeLevel, CMD_SEND_MESSAGE,
    NETFN_APP,
};
use crate::crypto::{CipherSuite, IntegrityAlgorithm};
use crate::debug;
use crate::error::{Error, Result};
use crate::message::{Command, HandshakeStage, MessageKind, Request};
use crate::observe;
use crate::proto::rakp::RakpHandshake;
use crate::proto::v1_5::{self, BMC_ADDR};
use crate::proto::v2_0::{self, SessionCrypto, PAYLOAD_KIND_IPMI};
use crate::proto::Pinger;
use crate::transport::keepalive::{KeepAlive, IDLE_TICKS, TICK};
use crate::transport::{
    ping_channel, Channel, SessionBuilder, Transport, UdpChannel, BRIDGE_RESPONSE_ATTEMPTS,
    RESPONSE_TIMEOUT, SEND_ATTEMPTS, SEQ_MISMATCH_RETRIES,
};
use crate::types::{AuthType, RawResponse};

/// A secure (RMCP+) session over UDP.
pub struct LanPlusTransport {
    inner: Arc<Mutex<Inner>>,
    keepalive: Option<KeepAlive>,
}

struct Inner {
    channel: Box<dyn Channel>,
    pinger: Pinger,
    crypto: Option<SessionCrypto>,
    mssid: u32,
    session_seq: u32,
    rq_seq: u8,
    active: bool,
    lenient_bridge_ack: bool,
}

impl Inner {
    fn next_rq_seq(&mut self) -> u8 {
        let seq = self.rq_seq;
        self.rq_seq = (self.rq_seq + 1) & 0x3F;
        seq
    }

    fn next_session_seq(&mut self) -> u32 {
        self.session_seq = match self.session_seq {
            u32::MAX => 1,
            seq => seq + 1,
        };
        self.session_seq
    }

    fn ping(&mut self) -> Result<()> {
        ping_channel(self.channel.as_mut(), &mut self.pinger)
    }

    /// Session-less v1.5 exchange used before the handshake (channel
    /// capability discovery rides outside the RMCP+ session).
    fn issue_presession(&mut self, netfn: u8, cmd: u8, data: &[u8]) -> Result<RawResponse> {
        let rq_seq = self.next_rq_seq();
        let inner = v1_5::encode_lan_request(BMC_ADDR, netfn, cmd, 0, rq_seq, data)?;

        for _ in 0..SEND_ATTEMPTS {
            let packet =
                v1_5::encode_session_packet(AuthType::None, None, &[0u8; 4], 0, &inner)?;
            debug::dump_hex("lanplus send", &packet);
            self.channel.send(&packet)?;

            let mut stale = 0;
            loop {
                let Some(bytes) = self.channel.recv_timeout(RESPONSE_TIMEOUT)? else {
                    break;
                };
                debug::dump_hex("lanplus recv", &bytes);
                let (_, _, payload) =
                    v1_5::decode_session_packet(AuthType::None, None, &bytes)?;
                match v1_5::decode_lan_response(BMC_ADDR, netfn, cmd, rq_seq, &payload) {
                    Ok(response) => return Ok(response),
                    Err(Error::SequenceMismatch) if stale < SEQ_MISMATCH_RETRIES => stale += 1,
                    Err(Error::SequenceMismatch) => {
                        return Err(Error::Protocol(
                            "could not match response sequence after retries",
                        ))
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Err(Error::Timeout)
    }

    /// Send one handshake stage and wait for its response payload.
    fn exchange_handshake(
        &mut self,
        stage: HandshakeStage,
        payload: &[u8],
    ) -> Result<(u8, Vec<u8>)> {
        for _ in 0..SEND_ATTEMPTS {
            let packet = v2_0::encode_packet(None, stage.payload_type(), 0, 0, payload)?;
            debug::dump_hex("lanplus send", &packet);
            self.channel.send(&packet)?;

            if let Some(bytes) = self.channel.recv_timeout(RESPONSE_TIMEOUT)? {
                debug::dump_hex("lanplus recv", &bytes);
                let decoded = v2_0::decode_packet(None, &bytes)?;
                return Ok((decoded.payload_type, decoded.payload));
            }
        }
        Err(Error::Timeout)
    }

    fn send_framed(&mut self, inner: &[u8]) -> Result<()> {
        let session_seq = self.next_session_seq();
        let mssid = self.mssid;
        let crypto = self
            .crypto
            .as_ref()
            .ok_or(Error::Protocol("session not established"))?;
        let packet =
            v2_0::encode_packet(Some(crypto), PAYLOAD_KIND_IPMI, mssid, session_seq, inner)?;
        debug::dump_hex("lanplus send", &packet);
        self.channel.send(&packet)
    }

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
            debug::dump_hex("lanplus recv", &bytes);

            let crypto = self
                .crypto
                .as_ref()
                .ok_or(Error::Protocol("session not established"))?;
            let protected = crypto.suite.integrity != IntegrityAlgorithm::None;
            let decoded = v2_0::decode_packet(Some(crypto), &bytes)?;
            if decoded.payload_type != PAYLOAD_KIND_IPMI {
                return Err(Error::Protocol("unexpected payload type in session"));
            }
            if protected && !decoded.is_authenticated {
                return Err(Error::AuthenticationFailed(
                    "unauthenticated response on a protected session",
                ));
            }

            match v1_5::decode_lan_response(dest_addr, netfn, cmd, rq_seq, &decoded.payload) {
                Ok(response) => return Ok(Some(response)),
                Err(Error::SequenceMismatch) if stale < SEQ_MISMATCH_RETRIES => stale += 1,
                Err(Error::SequenceMismatch) => {
                    return Err(Error::Protocol(
                        "could not match response sequence after retries",
                    ))
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn issue_at(
        &mut self,
        dest_addr: u8,
        netfn: u8,
        cmd: u8,
        lun: u8,
        data: &[u8],
    ) -> Result<RawResponse> {
        if !self.active {
            return Err(Error::Protocol("session not established"));
        }
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

    fn issue_request(&mut self, request: &Request) -> Result<RawResponse> {
        match request.kind() {
            MessageKind::Structured | MessageKind::Raw => self.issue_at(
                BMC_ADDR,
                request.netfn,
                request.cmd,
                request.lun,
                &request.data,
            ),
            MessageKind::Handshake(_) => {
                Err(Error::Protocol("handshake already completed for this session"))
            }
        }
    }

    fn issue_typed<C: Command>(&mut self, command: &C) -> Result<C::Output> {
        let request = command.to_request()?;
        let response = self.issue_request(&request)?;
        response.expect_success(C::NETFN, C::CMD)?;
        command.parse_response(response)
    }

    fn issue_bridged(
        &mut self,
        channel: u8,
        target_addr: u8,
        netfn: u8,
        cmd: u8,
        lun: u8,
        data: &[u8],
    ) -> Result<RawResponse> {
        if !self.active {
            return Err(Error::Protocol("session not established"));
        }

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

    fn wait_bridge_ack(&mut self, rq_seq: u8) -> Result<Option<RawResponse>> {
        let Some(bytes) = self.channel.recv_timeout(RESPONSE_TIMEOUT)? else {
            return Ok(None);
        };
        debug::dump_hex("lanplus recv", &bytes);

        let crypto = self
            .crypto
            .as_ref()
            .ok_or(Error::Protocol("session not established"))?;
        let protected = crypto.suite.integrity != IntegrityAlgorithm::None;
        let decoded = v2_0::decode_packet(Some(crypto), &bytes)?;
        if decoded.payload_type != PAYLOAD_KIND_IPMI {
            return Err(Error::Protocol("unexpected payload type in session"));
        }
        if protected && !decoded.is_authenticated {
            return Err(Error::AuthenticationFailed(
                "unauthenticated response on a protected session",
            ));
        }

        let payload = decoded.payload;
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
        let session_id = self.mssid.to_le_bytes();
        let result = self.issue_typed(&CloseSession { session_id });
        self.active = false;
        self.crypto = None;
        match result {
            Ok(()) | Err(Error::Timeout) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl LanPlusTransport {
    pub(crate) fn open(builder: &SessionBuilder) -> Result<Self> {
        let channel = UdpChannel::connect(&builder.host, builder.port)?;
        Self::open_with_channel(builder, Box::new(channel))
    }

    pub(crate) fn open_with_channel(
        builder: &SessionBuilder,
        channel: Box<dyn Channel>,
    ) -> Result<Self> {
        let suite = CipherSuite::from_id(builder.cipher_suite)
            .ok_or(Error::InvalidArgument("unsupported cipher suite id"))?;

        let mut inner = Inner {
            channel,
            pinger: Pinger::new(),
            crypto: None,
            mssid: 0,
            session_seq: 0,
            rq_seq: 0,
            active: false,
            lenient_bridge_ack: builder.lenient_bridge_ack,
        };

        if !builder.skip_ping {
            inner.ping()?;
        }

        let caps_cmd = GetChannelAuthCapabilities {
            channel: 0x0E,
            privilege: builder.privilege,
        };
        let caps_response = inner.issue_presession(
            GetChannelAuthCapabilities::NETFN,
            GetChannelAuthCapabilities::CMD,
            &caps_cmd.request_data(),
        )?;
        caps_response.expect_success(
            GetChannelAuthCapabilities::NETFN,
            GetChannelAuthCapabilities::CMD,
        )?;
        let caps = caps_cmd.parse_response(caps_response)?;
        if !caps.supports_ipmi_v2_0 {
            return Err(Error::Unsupported("channel does not support IPMI v2.0"));
        }

        let mut handshake = RakpHandshake::new(
            suite,
            builder.privilege,
            builder.username.as_bytes(),
            Zeroizing::new(builder.password.to_key_20()),
            builder.kg.as_ref().map(|kg| Zeroizing::new(kg.to_key_20())),
        )?;

        let open = handshake.build_open_session()?;
        let (ptype, payload) =
            inner.exchange_handshake(HandshakeStage::OpenSessionRequest, &open)?;
        handshake.handle_open_session_response(ptype, &payload)?;

        let rakp1 = handshake.build_rakp1()?;
        let (ptype, payload) = inner.exchange_handshake(HandshakeStage::Rakp1, &rakp1)?;
        handshake.handle_rakp2(ptype, &payload)?;

        let rakp3 = handshake.build_rakp3()?;
        let (ptype, payload) = inner.exchange_handshake(HandshakeStage::Rakp3, &rakp3)?;
        let crypto = handshake.handle_rakp4(ptype, &payload)?;

        inner.mssid = handshake.managed_system_session_id();
        inner.crypto = Some(crypto);
        inner.session_seq = 0;
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

impl Transport for LanPlusTransport {
    fn ping(&mut self) -> Result<()> {
        self.lock().ping()
    }

    fn issue(&mut self, request: &Request) -> Result<RawResponse> {
        self.touch();
        let start = Instant::now();
        let result = self.lock().issue_request(request);
        match &result {
            Ok(response) => observe::record_ok(
                "lanplus",
                request.netfn(),
                request.cmd(),
                start.elapsed(),
                response.completion_code,
            ),
            Err(err) => observe::record_err(
                "lanplus",
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

impl Drop for LanPlusTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

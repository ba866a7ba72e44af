//! RMCP+ session setup: Open Session Request/Response and the four RAKP
//! key-exchange messages, driven as an explicit state machine.
//!
//! The transport owns the socket and the packet framing; this module only
//! builds and verifies the handshake payloads and ends up with the
//! negotiated [`SessionCrypto`].

use rand::RngCore;
use zeroize::Zeroizing;

use crate::crypto::{
    codes_match, integrity_check, rakp_auth_code, AuthAlgorithm, CipherSuite,
    ConfidentialityAlgorithm, IntegrityAlgorithm,
};
use crate::error::{Error, Result};
use crate::message::HandshakeStage;
use crate::proto::v2_0::SessionCrypto;
use crate::types::PrivilegeLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RakpState {
    Idle,
    OpenSessionSent,
    OpenSessionAck,
    Rakp1Sent,
    Rakp2Ack,
    Rakp3Sent,
    Established,
    Aborted,
}

/// The four-message RMCP+ key exchange.
pub(crate) struct RakpHandshake {
    state: RakpState,
    proposed: CipherSuite,
    selected: CipherSuite,
    privilege: PrivilegeLevel,
    username: Vec<u8>,
    password20: Zeroizing<[u8; 20]>,
    kg20: Option<Zeroizing<[u8; 20]>>,
    tag: u8,
    rcsid: u32,
    mssid: u32,
    console_random: [u8; 16],
    server_random: [u8; 16],
    server_guid: [u8; 16],
    sik: Zeroizing<Vec<u8>>,
}

impl RakpHandshake {
    pub(crate) fn new(
        suite: CipherSuite,
        privilege: PrivilegeLevel,
        username: &[u8],
        password20: Zeroizing<[u8; 20]>,
        kg20: Option<Zeroizing<[u8; 20]>>,
    ) -> Result<Self> {
        if username.len() > 16 {
            return Err(Error::InvalidArgument("username too long (max 16 bytes)"));
        }

        let mut rng = rand::rng();
        let rcsid = loop {
            let id = rng.next_u32();
            if id != 0 {
                break id;
            }
        };
        let mut console_random = [0u8; 16];
        rng.fill_bytes(&mut console_random);

        Ok(Self {
            state: RakpState::Idle,
            proposed: suite,
            selected: suite,
            privilege,
            username: username.to_vec(),
            password20,
            kg20,
            tag: (rng.next_u32() & 0xFF) as u8,
            rcsid,
            mssid: 0,
            console_random,
            server_random: [0u8; 16],
            server_guid: [0u8; 16],
            sik: Zeroizing::new(Vec::new()),
        })
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> RakpState {
        self.state
    }

    /// Managed-system session id, valid from the Open Session ack on.
    pub(crate) fn managed_system_session_id(&self) -> u32 {
        self.mssid
    }

    fn fail<T>(&mut self, err: Error) -> Result<T> {
        self.state = RakpState::Aborted;
        Err(err)
    }

    fn require_state(&mut self, expected: RakpState) -> Result<()> {
        if self.state != expected {
            self.state = RakpState::Aborted;
            return Err(Error::Protocol("handshake message out of order"));
        }
        Ok(())
    }

    fn role(&self) -> u8 {
        self.privilege.as_u8() & 0x0F
    }

    /// Common RAKP-era response prologue: payload type, tag echo, status
    /// code, remote-console session id echo, minimum length.
    fn check_response(
        &mut self,
        stage: HandshakeStage,
        payload_type: u8,
        payload: &[u8],
        min_len: usize,
    ) -> Result<()> {
        if payload_type != stage.response_payload_type() {
            return self.fail(Error::Protocol("unexpected handshake payload type"));
        }
        if payload.len() < 8 {
            return self.fail(Error::Protocol("handshake response too short"));
        }
        if payload[0] != self.tag {
            return self.fail(Error::Protocol("handshake message tag mismatch"));
        }
        if payload[1] != 0x00 {
            let code = payload[1];
            return self.fail(Error::RmcpPlusStatus { code });
        }
        if payload.len() < min_len {
            return self.fail(Error::Protocol("handshake response too short"));
        }
        let echoed = u32::from_le_bytes(
            payload[4..8]
                .try_into()
                .map_err(|_| Error::Protocol("invalid session id echo"))?,
        );
        if echoed != self.rcsid {
            return self.fail(Error::Protocol("remote console session id mismatch"));
        }
        Ok(())
    }

    /// Open Session Request: tag | privilege | reserved | rcsid | three
    /// 8-byte algorithm proposals.
    pub(crate) fn build_open_session(&mut self) -> Result<Vec<u8>> {
        self.require_state(RakpState::Idle)?;

        let mut p = Vec::with_capacity(32);
        p.push(self.tag);
        p.push(self.role());
        p.extend_from_slice(&[0x00, 0x00]);
        p.extend_from_slice(&self.rcsid.to_le_bytes());
        p.extend_from_slice(&algorithm_proposal(0x00, self.proposed.auth.as_u8()));
        p.extend_from_slice(&algorithm_proposal(0x01, self.proposed.integrity.as_u8()));
        p.extend_from_slice(&algorithm_proposal(
            0x02,
            self.proposed.confidentiality.as_u8(),
        ));
        debug_assert_eq!(p.len(), 32);

        self.state = RakpState::OpenSessionSent;
        Ok(p)
    }

    /// Open Session Response: adopt the managed-system session id and the
    /// server-selected algorithm triple.
    pub(crate) fn handle_open_session_response(
        &mut self,
        payload_type: u8,
        payload: &[u8],
    ) -> Result<()> {
        self.require_state(RakpState::OpenSessionSent)?;
        self.check_response(HandshakeStage::OpenSessionRequest, payload_type, payload, 36)?;

        self.mssid = u32::from_le_bytes(
            payload[8..12]
                .try_into()
                .map_err(|_| Error::Protocol("invalid managed session id"))?,
        );

        // Selected algorithm sits in byte 5 of each 8-byte block.
        let selected = CipherSuite::from_selected(
            payload[12 + 4] & 0x3F,
            payload[20 + 4] & 0x3F,
            payload[28 + 4] & 0x3F,
        );
        self.selected = match selected {
            Ok(suite) => suite,
            Err(err) => return self.fail(err),
        };
        if self.selected.auth == AuthAlgorithm::None
            && self.selected.integrity != IntegrityAlgorithm::None
            && self.selected.integrity != IntegrityAlgorithm::Md5_128
        {
            return self.fail(Error::Unsupported(
                "integrity algorithm requires an authentication algorithm",
            ));
        }

        self.state = RakpState::OpenSessionAck;
        self.tag = self.tag.wrapping_add(1);
        Ok(())
    }

    /// RAKP message 1: tag | reserved | mssid | console random | role |
    /// reserved | username length | username field (16 bytes on the wire).
    pub(crate) fn build_rakp1(&mut self) -> Result<Vec<u8>> {
        self.require_state(RakpState::OpenSessionAck)?;

        let mut p = Vec::with_capacity(44);
        p.push(self.tag);
        p.extend_from_slice(&[0x00, 0x00, 0x00]);
        p.extend_from_slice(&self.mssid.to_le_bytes());
        p.extend_from_slice(&self.console_random);
        p.push(self.role());
        p.extend_from_slice(&[0x00, 0x00]);
        p.push(self.username.len() as u8);

        // The wire field is zero-padded to 16 bytes; auth-code inputs use
        // the unpadded name.
        let mut name = [0u8; 16];
        name[..self.username.len()].copy_from_slice(&self.username);
        p.extend_from_slice(&name);

        self.state = RakpState::Rakp1Sent;
        Ok(p)
    }

    /// RAKP message 2: verify the server's key-exchange auth code and
    /// derive the Session Integrity Key.
    pub(crate) fn handle_rakp2(&mut self, payload_type: u8, payload: &[u8]) -> Result<()> {
        self.require_state(RakpState::Rakp1Sent)?;
        self.check_response(HandshakeStage::Rakp1, payload_type, payload, 40)?;

        self.server_random = payload[8..24]
            .try_into()
            .map_err(|_| Error::Protocol("invalid server random"))?;
        self.server_guid = payload[24..40]
            .try_into()
            .map_err(|_| Error::Protocol("invalid server guid"))?;

        let auth = self.selected.auth;
        if auth != AuthAlgorithm::None {
            let code_len = auth.digest_len();
            if payload.len() < 40 + code_len {
                return self.fail(Error::Protocol("RAKP message 2 auth code truncated"));
            }

            let mut input = Vec::with_capacity(4 + 4 + 16 + 16 + 16 + 2 + self.username.len());
            input.extend_from_slice(&self.rcsid.to_le_bytes());
            input.extend_from_slice(&self.mssid.to_le_bytes());
            input.extend_from_slice(&self.console_random);
            input.extend_from_slice(&self.server_random);
            input.extend_from_slice(&self.server_guid);
            input.push(self.role());
            input.push(self.username.len() as u8);
            input.extend_from_slice(&self.username);

            let expected = rakp_auth_code(auth, &self.password20[..], &input)?;
            if !codes_match(&payload[40..40 + code_len], &expected) {
                return self.fail(Error::AuthenticationFailed(
                    "RAKP message 2 auth code mismatch",
                ));
            }

            // SIK keys with KG when configured, else the padded password.
            let sik_key = match &self.kg20 {
                Some(kg) => &kg[..],
                None => &self.password20[..],
            };
            let mut sik_input = Vec::with_capacity(16 + 16 + 2 + self.username.len());
            sik_input.extend_from_slice(&self.console_random);
            sik_input.extend_from_slice(&self.server_random);
            sik_input.push(self.role());
            sik_input.push(self.username.len() as u8);
            sik_input.extend_from_slice(&self.username);
            self.sik = Zeroizing::new(rakp_auth_code(auth, sik_key, &sik_input)?);
        }

        self.state = RakpState::Rakp2Ack;
        self.tag = self.tag.wrapping_add(1);
        Ok(())
    }

    /// RAKP message 3: tag | status 0 | reserved | mssid | key-exchange
    /// auth code keyed by the password.
    pub(crate) fn build_rakp3(&mut self) -> Result<Vec<u8>> {
        self.require_state(RakpState::Rakp2Ack)?;

        let mut p = Vec::with_capacity(8 + 32);
        p.push(self.tag);
        p.push(0x00);
        p.extend_from_slice(&[0x00, 0x00]);
        p.extend_from_slice(&self.mssid.to_le_bytes());

        if self.selected.auth != AuthAlgorithm::None {
            let mut input = Vec::with_capacity(16 + 4 + 2 + self.username.len());
            input.extend_from_slice(&self.server_random);
            input.extend_from_slice(&self.rcsid.to_le_bytes());
            input.push(self.role());
            input.push(self.username.len() as u8);
            input.extend_from_slice(&self.username);
            let code = rakp_auth_code(self.selected.auth, &self.password20[..], &input)?;
            p.extend_from_slice(&code);
        }

        self.state = RakpState::Rakp3Sent;
        Ok(p)
    }

    /// RAKP message 4: verify the SIK-keyed integrity check value, then
    /// derive K1/K2 and hand the session keys to the codec.
    pub(crate) fn handle_rakp4(
        &mut self,
        payload_type: u8,
        payload: &[u8],
    ) -> Result<SessionCrypto> {
        self.require_state(RakpState::Rakp3Sent)?;
        self.check_response(HandshakeStage::Rakp3, payload_type, payload, 8)?;

        let auth = self.selected.auth;
        if auth != AuthAlgorithm::None {
            let icv_algo = auth.paired_integrity();
            let icv_len = icv_algo.check_len();
            if payload.len() < 8 + icv_len {
                return self.fail(Error::Protocol("RAKP message 4 check value truncated"));
            }

            let mut input = Vec::with_capacity(16 + 4 + 16);
            input.extend_from_slice(&self.console_random);
            input.extend_from_slice(&self.mssid.to_le_bytes());
            input.extend_from_slice(&self.server_guid);

            let expected = integrity_check(icv_algo, &self.sik, &input)?;
            if !codes_match(&payload[8..8 + icv_len], &expected) {
                return self.fail(Error::AuthenticationFailed(
                    "RAKP message 4 integrity check mismatch",
                ));
            }
        }

        let k1 = match self.selected.integrity {
            IntegrityAlgorithm::None | IntegrityAlgorithm::Md5_128 => None,
            _ => Some(Zeroizing::new(rakp_auth_code(auth, &self.sik, &[0x01; 20])?)),
        };
        let aes_key = match self.selected.confidentiality {
            ConfidentialityAlgorithm::None => None,
            ConfidentialityAlgorithm::AesCbc128 => {
                let k2 = Zeroizing::new(rakp_auth_code(auth, &self.sik, &[0x02; 20])?);
                let mut key = [0u8; 16];
                key.copy_from_slice(&k2[..16]);
                Some(Zeroizing::new(key))
            }
        };

        let crypto =
            SessionCrypto::new(self.selected, k1, aes_key, self.password20.clone())?;
        self.state = RakpState::Established;
        Ok(crypto)
    }
}

fn algorithm_proposal(kind: u8, algorithm: u8) -> [u8; 8] {
    [kind, 0x00, 0x00, 0x08, algorithm & 0x3F, 0x00, 0x00, 0x00]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake(suite_id: u8) -> RakpHandshake {
        let mut hs = RakpHandshake::new(
            CipherSuite::from_id(suite_id).expect("suite"),
            PrivilegeLevel::Administrator,
            b"admin",
            Zeroizing::new(fixed_password()),
            None,
        )
        .expect("handshake");
        // Pin the randoms so the exchange is reproducible.
        hs.tag = 0x40;
        hs.rcsid = 0xA1B2_C3D4;
        hs.console_random = [0x0C; 16];
        hs
    }

    fn fixed_password() -> [u8; 20] {
        let mut p = [0u8; 20];
        p[..6].copy_from_slice(b"secret");
        p
    }

    const MSSID: u32 = 0x0200_0000;
    const SERVER_RANDOM: [u8; 16] = [0x5D; 16];
    const SERVER_GUID: [u8; 16] = [0x6D; 16];

    fn open_session_response(hs: &RakpHandshake, suite: CipherSuite) -> Vec<u8> {
        let mut p = vec![hs.tag, 0x00, 0x04, 0x00];
        p.extend_from_slice(&hs.rcsid.to_le_bytes());
        p.extend_from_slice(&MSSID.to_le_bytes());
        p.extend_from_slice(&algorithm_proposal(0x00, suite.auth.as_u8()));
        p.extend_from_slice(&algorithm_proposal(0x01, suite.integrity.as_u8()));
        p.extend_from_slice(&algorithm_proposal(0x02, suite.confidentiality.as_u8()));
        p
    }

    fn rakp2_response(hs: &RakpHandshake, suite: CipherSuite) -> Vec<u8> {
        let mut p = vec![hs.tag, 0x00, 0x00, 0x00];
        p.extend_from_slice(&hs.rcsid.to_le_bytes());
        p.extend_from_slice(&SERVER_RANDOM);
        p.extend_from_slice(&SERVER_GUID);

        let mut input = Vec::new();
        input.extend_from_slice(&hs.rcsid.to_le_bytes());
        input.extend_from_slice(&MSSID.to_le_bytes());
        input.extend_from_slice(&hs.console_random);
        input.extend_from_slice(&SERVER_RANDOM);
        input.extend_from_slice(&SERVER_GUID);
        input.push(0x04);
        input.push(5);
        input.extend_from_slice(b"admin");
        let code = rakp_auth_code(suite.auth, &fixed_password(), &input).expect("code");
        p.extend_from_slice(&code);
        p
    }

    fn rakp4_response(hs: &RakpHandshake, suite: CipherSuite) -> Vec<u8> {
        let mut p = vec![hs.tag, 0x00, 0x00, 0x00];
        p.extend_from_slice(&hs.rcsid.to_le_bytes());

        let mut sik_input = Vec::new();
        sik_input.extend_from_slice(&hs.console_random);
        sik_input.extend_from_slice(&SERVER_RANDOM);
        sik_input.push(0x04);
        sik_input.push(5);
        sik_input.extend_from_slice(b"admin");
        let sik = rakp_auth_code(suite.auth, &fixed_password(), &sik_input).expect("sik");

        let mut input = Vec::new();
        input.extend_from_slice(&hs.console_random);
        input.extend_from_slice(&MSSID.to_le_bytes());
        input.extend_from_slice(&SERVER_GUID);
        let icv =
            integrity_check(suite.auth.paired_integrity(), &sik, &input).expect("icv");
        p.extend_from_slice(&icv);
        p
    }

    #[test]
    fn full_exchange_reaches_established() {
        let suite = CipherSuite::from_id(3).expect("suite");
        let mut hs = handshake(3);

        let open = hs.build_open_session().expect("open");
        assert_eq!(open.len(), 32);
        assert_eq!(open[0], 0x40);
        assert_eq!(open[1], 0x04); // requested privilege

        hs.handle_open_session_response(0x11, &open_session_response(&hs, suite))
            .expect("open ack");
        assert_eq!(hs.managed_system_session_id(), MSSID);

        let rakp1 = hs.build_rakp1().expect("rakp1");
        assert_eq!(rakp1.len(), 44);
        assert_eq!(rakp1[27], 5); // username length
        assert_eq!(&rakp1[28..33], b"admin");
        assert_eq!(&rakp1[33..44], &[0u8; 11]); // padded name field

        hs.handle_rakp2(0x13, &rakp2_response(&hs, suite)).expect("rakp2");

        let rakp3 = hs.build_rakp3().expect("rakp3");
        assert_eq!(rakp3.len(), 8 + 20);

        let crypto = hs
            .handle_rakp4(0x15, &rakp4_response(&hs, suite))
            .expect("rakp4");
        assert_eq!(hs.state(), RakpState::Established);
        assert_eq!(crypto.suite, suite);
    }

    #[test]
    fn flipped_rakp2_code_aborts() {
        let suite = CipherSuite::from_id(3).expect("suite");
        let mut hs = handshake(3);
        let _ = hs.build_open_session().expect("open");
        hs.handle_open_session_response(0x11, &open_session_response(&hs, suite))
            .expect("open ack");

        // Skipping straight to RAKP2 without RAKP1 is out of order.
        let mut fresh = handshake(3);
        assert!(fresh.handle_rakp2(0x13, &[]).is_err());
        assert_eq!(fresh.state(), RakpState::Aborted);

        let _ = hs.build_rakp1().expect("rakp1");
        let response = rakp2_response(&hs, suite);
        for i in 40..response.len() {
            let mut tampered = response.clone();
            tampered[i] ^= 0x01;
            let mut hs2 = handshake(3);
            let _ = hs2.build_open_session().expect("open");
            hs2.handle_open_session_response(0x11, &open_session_response(&hs2, suite))
                .expect("open ack");
            let _ = hs2.build_rakp1().expect("rakp1");
            let err = hs2.handle_rakp2(0x13, &tampered).unwrap_err();
            assert!(matches!(err, Error::AuthenticationFailed(_)), "byte {i}");
            assert_eq!(hs2.state(), RakpState::Aborted);
            // No stage can proceed after an abort.
            assert!(hs2.build_rakp3().is_err());
        }

        // The untampered code still verifies.
        hs.handle_rakp2(0x13, &response).expect("rakp2");
    }

    #[test]
    fn nonzero_status_maps_to_typed_error() {
        let mut hs = handshake(3);
        let _ = hs.build_open_session().expect("open");

        let mut response = vec![hs.tag, 0x11, 0x00, 0x00];
        response.extend_from_slice(&hs.rcsid.to_le_bytes());
        let err = hs.handle_open_session_response(0x11, &response).unwrap_err();
        assert!(matches!(err, Error::RmcpPlusStatus { code: 0x11 }));
        assert_eq!(hs.state(), RakpState::Aborted);
    }

    #[test]
    fn tag_mismatch_is_fatal() {
        let suite = CipherSuite::from_id(2).expect("suite");
        let mut hs = handshake(2);
        let _ = hs.build_open_session().expect("open");

        let mut response = open_session_response(&hs, suite);
        response[0] ^= 0xFF;
        assert!(hs.handle_open_session_response(0x11, &response).is_err());
        assert_eq!(hs.state(), RakpState::Aborted);
    }

    #[test]
    fn kg_keys_the_sik_but_not_the_auth_codes() {
        let suite = CipherSuite::from_id(2).expect("suite");
        let mut hs = RakpHandshake::new(
            suite,
            PrivilegeLevel::Administrator,
            b"admin",
            Zeroizing::new(fixed_password()),
            Some(Zeroizing::new([0x7E; 20])),
        )
        .expect("handshake");
        hs.tag = 0x40;
        hs.rcsid = 0xA1B2_C3D4;
        hs.console_random = [0x0C; 16];

        let _ = hs.build_open_session().expect("open");
        hs.handle_open_session_response(0x11, &open_session_response(&hs, suite))
            .expect("open ack");
        let _ = hs.build_rakp1().expect("rakp1");
        // RAKP2 still verifies against the password even with KG set.
        hs.handle_rakp2(0x13, &rakp2_response(&hs, suite)).expect("rakp2");

        let mut sik_input = Vec::new();
        sik_input.extend_from_slice(&hs.console_random);
        sik_input.extend_from_slice(&SERVER_RANDOM);
        sik_input.push(0x04);
        sik_input.push(5);
        sik_input.extend_from_slice(b"admin");
        let expected = rakp_auth_code(suite.auth, &[0x7E; 20], &sik_input).expect("sik");
        assert_eq!(&hs.sik[..], &expected[..]);
    }
}

//! Session establishment.
//!
//! ```text
//! Alice (initiator)                         Bob (responder)
//!   SessionRequest  {X, bob ip}       ──▶   sealed with Bob's intro key
//!                                     ◀──   SessionCreated {Y, alice ip/port,
//!                                             relay tag, signed_on, sig_B}
//!                                             sealed with Bob's intro key
//!   SessionConfirmed {identity,       ──▶   sealed with the session keys,
//!     signed_on, sig_A}                      possibly in several fragments
//! ```
//!
//! Both signatures cover the [`SignedDataset`], each with the signer's own
//! `signed_on`.

use rand::Rng;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;
use tracing::debug;

use super::{LocalRouter, Session, SessionError, SessionEvent, SessionState};
use crate::crypto::{DhKeyPair, SessionKeys, DH_PUBLIC_SIZE};
use crate::identity::RouterIdentity;
use crate::protocol::{
    ip_len, now_secs, put_ip, seal, ConfirmedBody, PacketHeader, PacketKeys, PayloadType,
    SessionConfirmed, SessionCreated, SessionRequest, EXT_OPT_REQUEST_RELAY_TAG,
};

/// Bytes covered by both handshake signatures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedDataset {
    pub dh_x: [u8; DH_PUBLIC_SIZE],
    pub dh_y: [u8; DH_PUBLIC_SIZE],
    pub alice_ip: Option<IpAddr>,
    pub alice_port: u16,
    pub bob_ip: Option<IpAddr>,
    pub bob_port: u16,
    pub relay_tag: u32,
    pub signed_on: u32,
}

impl SignedDataset {
    /// Encoded length for the given address families.
    pub fn expected_len(alice_ip: Option<IpAddr>, bob_ip: Option<IpAddr>) -> usize {
        2 * DH_PUBLIC_SIZE + ip_len(alice_ip) + 2 + ip_len(bob_ip) + 2 + 4 + 4
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::expected_len(self.alice_ip, self.bob_ip));
        buf.extend_from_slice(&self.dh_x);
        buf.extend_from_slice(&self.dh_y);
        put_ip(&mut buf, self.alice_ip);
        buf.extend_from_slice(&self.alice_port.to_be_bytes());
        put_ip(&mut buf, self.bob_ip);
        buf.extend_from_slice(&self.bob_port.to_be_bytes());
        buf.extend_from_slice(&self.relay_tag.to_be_bytes());
        buf.extend_from_slice(&self.signed_on.to_be_bytes());
        buf
    }

    fn with_signed_on(&self, signed_on: u32) -> Self {
        Self {
            signed_on,
            ..self.clone()
        }
    }
}

/// Handshake material held until the session is established.
pub(super) enum Handshake {
    /// Sent SessionRequest; the DH secret is needed for SessionCreated.
    Initiator { dh: DhKeyPair },
    /// Sent SessionCreated; collecting SessionConfirmed.
    Responder {
        dh_x: [u8; DH_PUBLIC_SIZE],
        dataset: SignedDataset,
        /// Resent verbatim if the initiator repeats its request.
        created_packet: Vec<u8>,
        confirm: ConfirmAssembler,
    },
}

/// Collects SessionConfirmed fragments into a [`ConfirmedBody`] buffer.
#[derive(Debug, Default)]
pub(super) struct ConfirmAssembler {
    count: u8,
    fragments: Vec<Option<Vec<u8>>>,
}

impl ConfirmAssembler {
    /// Add a fragment; returns the full body once all have arrived.
    ///
    /// The body must have exactly [`ConfirmedBody::SIZE`] bytes.
    pub(super) fn submit(
        &mut self,
        fragment: SessionConfirmed,
    ) -> Result<Option<Vec<u8>>, SessionError> {
        if self.count == 0 {
            self.count = fragment.fragment_count;
            self.fragments = vec![None; fragment.fragment_count as usize];
        } else if fragment.fragment_count != self.count {
            return Err(SessionError::Handshake(format!(
                "SessionConfirmed fragment count changed from {} to {}",
                self.count, fragment.fragment_count
            )));
        }

        let index = fragment.fragment_num as usize;
        if let Some(slot) = self.fragments.get_mut(index) {
            *slot = Some(fragment.data);
        }
        if self.fragments.iter().any(Option::is_none) {
            return Ok(None);
        }

        let body: Vec<u8> = self.fragments.iter().flatten().flatten().copied().collect();
        if body.len() != ConfirmedBody::SIZE {
            return Err(SessionError::Handshake(format!(
                "SessionConfirmed length {} != {}",
                body.len(),
                ConfirmedBody::SIZE
            )));
        }
        Ok(Some(body))
    }
}

fn agree(dh: &DhKeyPair, peer_public: &[u8]) -> Result<SessionKeys, SessionError> {
    let shared = dh
        .agree(peer_public)
        .map_err(|e| SessionError::Handshake(format!("invalid DH value: {}", e)))?;
    Ok(shared.session_keys()?)
}

impl Session {
    /// Open an outbound session by sending SessionRequest.
    ///
    /// `request_relay_tag` asks the responder to act as our introducer.
    pub fn connect(
        &mut self,
        local: &LocalRouter<'_>,
        request_relay_tag: bool,
        now: Instant,
    ) -> Result<Vec<SessionEvent>, SessionError> {
        if self.state != SessionState::Unknown {
            return Err(SessionError::Handshake(format!(
                "connect from state {}",
                self.state
            )));
        }
        let keys = self
            .remote_intro
            .clone()
            .ok_or_else(|| SessionError::Handshake("remote intro key unknown".into()))?;

        let dh = DhKeyPair::generate();
        let request = SessionRequest {
            dh_x: *dh.public(),
            bob_ip: Some(self.remote.ip()),
        };
        let mut header = PacketHeader::new(PayloadType::SessionRequest, now_secs());
        if request_relay_tag {
            header = header.with_extended_options(vec![EXT_OPT_REQUEST_RELAY_TAG]);
        }
        let packet = seal(&keys, &header, &request.encode());
        self.record_sent(packet.len(), now);

        self.handshake = Some(Handshake::Initiator { dh });
        self.state = SessionState::RequestSent;
        self.connect_deadline = Some(now + local.timers.connect_timeout);

        debug!(
            remote_addr = %self.remote,
            request_relay_tag,
            "SessionRequest sent"
        );
        Ok(vec![SessionEvent::Send(packet)])
    }

    pub(super) fn handle_session_request(
        &mut self,
        local: &LocalRouter<'_>,
        header: &PacketHeader,
        payload: &[u8],
        now: Instant,
    ) -> Result<Vec<SessionEvent>, SessionError> {
        let request = SessionRequest::decode(payload)?;
        match self.state {
            SessionState::Unknown | SessionState::Introduced => {}
            SessionState::CreatedSent => {
                if let Some(Handshake::Responder {
                    dh_x,
                    created_packet,
                    ..
                }) = &self.handshake
                    && *dh_x == request.dh_x
                {
                    let packet = created_packet.clone();
                    self.record_sent(packet.len(), now);
                    debug!(remote_addr = %self.remote, "Repeated SessionRequest, resending SessionCreated");
                    return Ok(vec![SessionEvent::Send(packet)]);
                }
                return Err(self.unexpected(PayloadType::SessionRequest));
            }
            _ => return Err(self.unexpected(PayloadType::SessionRequest)),
        }

        let dh = DhKeyPair::generate();
        let keys = agree(&dh, &request.dh_x)?;

        let wants_tag = header
            .extended_options
            .as_deref()
            .and_then(|opts| opts.first())
            .is_some_and(|b| b & EXT_OPT_REQUEST_RELAY_TAG != 0);
        let relay_tag = if wants_tag && local.accept_relay {
            rand::thread_rng().gen_range(1..=u32::MAX)
        } else {
            0
        };

        let dataset = SignedDataset {
            dh_x: request.dh_x,
            dh_y: *dh.public(),
            alice_ip: Some(self.remote.ip()),
            alice_port: self.remote.port(),
            bob_ip: request.bob_ip,
            bob_port: local.local_port,
            relay_tag,
            signed_on: now_secs(),
        };
        let created = SessionCreated {
            dh_y: dataset.dh_y,
            alice_ip: dataset.alice_ip,
            alice_port: dataset.alice_port,
            relay_tag,
            signed_on: dataset.signed_on,
            signature: local.identity.sign(&dataset.encode()),
        };
        let packet = seal(
            local.intro_keys,
            &PacketHeader::new(PayloadType::SessionCreated, now_secs()),
            &created.encode(),
        );
        self.record_sent(packet.len(), now);

        self.packet_keys = Some(PacketKeys::session(&keys));
        self.keys = Some(keys);
        self.handshake = Some(Handshake::Responder {
            dh_x: request.dh_x,
            dataset,
            created_packet: packet.clone(),
            confirm: ConfirmAssembler::default(),
        });
        self.state = SessionState::CreatedSent;
        self.connect_deadline = Some(now + local.timers.connect_timeout);

        debug!(remote_addr = %self.remote, relay_tag, "SessionCreated sent");

        let mut events = vec![SessionEvent::Send(packet)];
        if relay_tag != 0 {
            self.assigned_relay_tag = Some(relay_tag);
            events.push(SessionEvent::RelayTagAssigned(relay_tag));
        }
        Ok(events)
    }

    pub(super) fn handle_session_created(
        &mut self,
        local: &LocalRouter<'_>,
        payload: &[u8],
        now: Instant,
    ) -> Result<Vec<SessionEvent>, SessionError> {
        if self.state != SessionState::RequestSent {
            return Err(self.unexpected(PayloadType::SessionCreated));
        }
        let created = SessionCreated::decode(payload)?;

        let (keys, dh_x) = match &self.handshake {
            Some(Handshake::Initiator { dh }) => (agree(dh, &created.dh_y)?, *dh.public()),
            _ => return Err(SessionError::Handshake("no pending SessionRequest".into())),
        };
        let identity = self
            .remote_identity
            .ok_or_else(|| SessionError::Handshake("responder identity unknown".into()))?;

        let dataset = SignedDataset {
            dh_x,
            dh_y: created.dh_y,
            alice_ip: created.alice_ip,
            alice_port: created.alice_port,
            bob_ip: Some(self.remote.ip()),
            bob_port: self.remote.port(),
            relay_tag: created.relay_tag,
            signed_on: created.signed_on,
        };
        if !identity.verify(&dataset.encode(), &created.signature) {
            return Err(SessionError::Handshake(
                "SessionCreated signature invalid".into(),
            ));
        }

        let mut events = Vec::new();
        if let Some(ip) = created.alice_ip
            && created.alice_port != 0
        {
            events.push(SessionEvent::ExternalAddress(SocketAddr::new(
                ip,
                created.alice_port,
            )));
        }
        if created.relay_tag != 0 {
            self.relay_tag = Some(created.relay_tag);
        }

        let signed_on = now_secs();
        let body = ConfirmedBody {
            identity: local.identity.router_identity().to_bytes(),
            signed_on,
            signature: local
                .identity
                .sign(&dataset.with_signed_on(signed_on).encode()),
        };
        let packet_keys = PacketKeys::session(&keys);
        // Fragment header: info byte and size
        let max_fragment = local.max_payload().saturating_sub(3);
        for fragment in body.fragments(max_fragment) {
            let packet = seal(
                &packet_keys,
                &PacketHeader::new(PayloadType::SessionConfirmed, now_secs()),
                &fragment.encode(),
            );
            self.record_sent(packet.len(), now);
            events.push(SessionEvent::Send(packet));
        }

        self.packet_keys = Some(packet_keys);
        self.keys = Some(keys);
        events.extend(self.establish(local, now));
        Ok(events)
    }

    pub(super) fn handle_session_confirmed(
        &mut self,
        local: &LocalRouter<'_>,
        payload: &[u8],
        now: Instant,
    ) -> Result<Vec<SessionEvent>, SessionError> {
        match self.state {
            SessionState::CreatedSent => {}
            SessionState::Established => {
                debug!(remote_addr = %self.remote, "Duplicate SessionConfirmed ignored");
                return Ok(Vec::new());
            }
            _ => return Err(self.unexpected(PayloadType::SessionConfirmed)),
        }
        let fragment = SessionConfirmed::decode(payload)
            .map_err(|e| SessionError::Handshake(format!("malformed SessionConfirmed: {}", e)))?;

        let (assembled, dataset) = match self.handshake.as_mut() {
            Some(Handshake::Responder {
                dataset, confirm, ..
            }) => match confirm.submit(fragment)? {
                Some(assembled) => (assembled, dataset.clone()),
                None => return Ok(Vec::new()),
            },
            _ => return Err(SessionError::Handshake("no pending SessionCreated".into())),
        };

        let body = ConfirmedBody::decode(&assembled)
            .map_err(|e| SessionError::Handshake(format!("malformed SessionConfirmed: {}", e)))?;
        let identity = RouterIdentity::from_bytes(&body.identity)
            .map_err(|e| SessionError::Handshake(format!("invalid initiator identity: {}", e)))?;
        if let Some(expected) = &self.remote_identity
            && *expected != identity
        {
            return Err(SessionError::Handshake(format!(
                "initiator is {}, expected {}",
                identity.ident_hash().short(),
                expected.ident_hash().short()
            )));
        }

        let signed = dataset.with_signed_on(body.signed_on);
        if !identity.verify(&signed.encode(), &body.signature) {
            return Err(SessionError::Handshake(
                "SessionConfirmed signature invalid".into(),
            ));
        }

        self.remote_identity = Some(identity);
        Ok(self.establish(local, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    fn body() -> ConfirmedBody {
        ConfirmedBody {
            identity: Identity::generate().router_identity().to_bytes(),
            signed_on: 1_700_000_000,
            signature: [7u8; 64],
        }
    }

    #[test]
    fn test_signed_dataset_length_by_family() {
        let v4: IpAddr = "192.0.2.1".parse().unwrap();
        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        let dataset = SignedDataset {
            dh_x: [1u8; 33],
            dh_y: [2u8; 33],
            alice_ip: Some(v4),
            alice_port: 1,
            bob_ip: Some(v6),
            bob_port: 2,
            relay_tag: 3,
            signed_on: 4,
        };
        assert_eq!(dataset.encode().len(), 66 + 5 + 2 + 17 + 2 + 8);
        assert_eq!(
            dataset.encode().len(),
            SignedDataset::expected_len(Some(v4), Some(v6))
        );
        assert_eq!(SignedDataset::expected_len(None, None), 66 + 1 + 2 + 1 + 2 + 8);
    }

    #[test]
    fn test_confirm_assembler_out_of_order() {
        let body = body();
        let mut fragments = body.fragments(30);
        assert!(fragments.len() > 1);
        fragments.reverse();

        let mut assembler = ConfirmAssembler::default();
        let last = fragments.pop().unwrap();
        for fragment in fragments {
            assert!(assembler.submit(fragment).unwrap().is_none());
        }
        let assembled = assembler.submit(last).unwrap().unwrap();
        assert_eq!(ConfirmedBody::decode(&assembled).unwrap(), body);
    }

    #[test]
    fn test_confirm_assembler_count_change() {
        let body = body();
        let mut assembler = ConfirmAssembler::default();
        let first = body.fragments(30).remove(0);
        assert!(assembler.submit(first).unwrap().is_none());

        let other = body.fragments(60).remove(0);
        assert!(matches!(
            assembler.submit(other),
            Err(SessionError::Handshake(_))
        ));
    }

    #[test]
    fn test_confirm_assembler_wrong_length() {
        let mut assembler = ConfirmAssembler::default();
        let short = SessionConfirmed {
            fragment_num: 0,
            fragment_count: 1,
            data: vec![0u8; 50],
        };
        assert!(matches!(
            assembler.submit(short),
            Err(SessionError::Handshake(_))
        ));
    }
}

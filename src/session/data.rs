//! Application data over an established session.
//!
//! Outbound messages are split into fragments that each fit one Data
//! packet, held until the remote acknowledges the whole message, and
//! resent on the tick. Inbound fragments are collected by a
//! [`DataReassembler`]; completed messages are acknowledged and delivered
//! once.

use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::{LocalRouter, Session, SessionError, SessionEvent, MAX_QUEUED_MESSAGES};
use crate::protocol::{DataPayload, Fragment, PayloadType, MAX_FRAGMENTS_PER_MESSAGE};

/// Delivered message ids remembered to suppress duplicates.
const DUPLICATE_WINDOW: usize = 256;

/// ACK count is carried in one byte.
const MAX_ACKS_PER_PACKET: usize = 255;

/// Most ACKs that fit in one Data packet at the local MTU.
fn acks_per_packet(local: &LocalRouter<'_>) -> usize {
    // Flags, fragment count and the ACK count byte
    let room = local.max_payload().saturating_sub(DataPayload::overhead(0, 0) + 1);
    (room / 4).clamp(1, MAX_ACKS_PER_PACKET)
}

// ============================================================================
// Inbound
// ============================================================================

/// Outcome of offering a fragment to the reassembler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitResult {
    /// Stored; the message may now be complete.
    Accepted,
    /// This fragment is already held.
    Repeated,
    /// The whole message was already delivered; re-acknowledge it.
    AlreadyDelivered,
    /// Inconsistent with fragments already held.
    Rejected,
}

struct PartialMessage {
    fragments: Vec<Option<Vec<u8>>>,
    last: Option<usize>,
    first_seen: Instant,
}

/// Reassembles fragmented inbound messages.
pub struct DataReassembler {
    partial: HashMap<u32, PartialMessage>,
    delivered: HashSet<u32>,
    delivered_order: VecDeque<u32>,
}

impl DataReassembler {
    pub fn new() -> Self {
        Self {
            partial: HashMap::new(),
            delivered: HashSet::new(),
            delivered_order: VecDeque::with_capacity(DUPLICATE_WINDOW),
        }
    }

    pub fn submit_fragment(&mut self, fragment: Fragment, now: Instant) -> SubmitResult {
        if self.delivered.contains(&fragment.msg_id) {
            return SubmitResult::AlreadyDelivered;
        }
        let num = fragment.fragment_num as usize;
        if num >= MAX_FRAGMENTS_PER_MESSAGE {
            return SubmitResult::Rejected;
        }

        let partial = self
            .partial
            .entry(fragment.msg_id)
            .or_insert_with(|| PartialMessage {
                fragments: Vec::new(),
                last: None,
                first_seen: now,
            });

        if let Some(last) = partial.last
            && (num > last || (fragment.is_last && num != last))
        {
            return SubmitResult::Rejected;
        }
        if fragment.is_last {
            if partial.fragments.len() > num + 1 {
                return SubmitResult::Rejected;
            }
            partial.last = Some(num);
        }

        if partial.fragments.len() <= num {
            partial.fragments.resize(num + 1, None);
        }
        if partial.fragments[num].is_some() {
            return SubmitResult::Repeated;
        }
        partial.fragments[num] = Some(fragment.data);
        SubmitResult::Accepted
    }

    /// Remove and return the message if every fragment has arrived.
    pub fn try_reassemble(&mut self, msg_id: u32) -> Option<Vec<u8>> {
        let partial = self.partial.get(&msg_id)?;
        let last = partial.last?;
        if partial.fragments.len() != last + 1 || partial.fragments.iter().any(Option::is_none) {
            return None;
        }
        let partial = self.partial.remove(&msg_id)?;
        let message: Vec<u8> = partial.fragments.into_iter().flatten().flatten().collect();

        self.delivered.insert(msg_id);
        self.delivered_order.push_back(msg_id);
        if self.delivered_order.len() > DUPLICATE_WINDOW
            && let Some(old) = self.delivered_order.pop_front()
        {
            self.delivered.remove(&old);
        }
        Some(message)
    }

    /// Drop incomplete messages older than `max_age`. Returns how many.
    pub fn expire(&mut self, now: Instant, max_age: Duration) -> usize {
        let before = self.partial.len();
        self.partial
            .retain(|_, p| now.duration_since(p.first_seen) < max_age);
        let expired = before - self.partial.len();
        if expired > 0 {
            debug!(expired, "Incomplete inbound messages expired");
        }
        expired
    }

    /// Number of incomplete messages held.
    pub fn len(&self) -> usize {
        self.partial.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partial.is_empty()
    }
}

impl Default for DataReassembler {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Outbound
// ============================================================================

struct PendingMessage {
    fragments: Vec<Fragment>,
    sent_at: Instant,
    resends: u32,
}

/// Messages awaiting establishment or acknowledgement.
pub(super) struct OutboundMessages {
    next_msg_id: u32,
    queued: VecDeque<Vec<u8>>,
    pending: HashMap<u32, PendingMessage>,
}

impl OutboundMessages {
    pub(super) fn new() -> Self {
        Self {
            next_msg_id: rand::thread_rng().r#gen(),
            queued: VecDeque::new(),
            pending: HashMap::new(),
        }
    }

    fn allocate_msg_id(&mut self) -> u32 {
        let id = self.next_msg_id;
        self.next_msg_id = self.next_msg_id.wrapping_add(1);
        id
    }

    /// Queue a message until establishment; the oldest is dropped when full.
    fn queue(&mut self, message: Vec<u8>) {
        if self.queued.len() >= MAX_QUEUED_MESSAGES {
            self.queued.pop_front();
            debug!("Outbound queue full, dropped oldest message");
        }
        self.queued.push_back(message);
    }

    pub(super) fn take_queued(&mut self) -> Vec<Vec<u8>> {
        self.queued.drain(..).collect()
    }

    pub(super) fn queued_len(&self) -> usize {
        self.queued.len()
    }

    pub(super) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn acknowledge(&mut self, msg_id: u32) -> bool {
        self.pending.remove(&msg_id).is_some()
    }

    pub(super) fn clear(&mut self) {
        self.queued.clear();
        self.pending.clear();
    }
}

/// Split a message into fragments of at most `max_fragment` bytes.
fn fragment_message(msg_id: u32, message: &[u8], max_fragment: usize) -> Vec<Fragment> {
    if message.is_empty() {
        return vec![Fragment {
            msg_id,
            fragment_num: 0,
            is_last: true,
            data: Vec::new(),
        }];
    }
    let chunks: Vec<&[u8]> = message.chunks(max_fragment).collect();
    let count = chunks.len();
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| Fragment {
            msg_id,
            fragment_num: i as u8,
            is_last: i + 1 == count,
            data: chunk.to_vec(),
        })
        .collect()
}

impl Session {
    /// Send an application message, or queue it until the session is
    /// established.
    pub fn send_message(
        &mut self,
        local: &LocalRouter<'_>,
        message: Vec<u8>,
        now: Instant,
    ) -> Result<Vec<SessionEvent>, SessionError> {
        if self.state.is_terminal() {
            return Err(SessionError::NotEstablished);
        }
        if !self.state.is_established() {
            self.outbound.queue(message);
            return Ok(Vec::new());
        }

        let max_fragment = local
            .max_payload()
            .saturating_sub(DataPayload::overhead(0, 1));
        let max = max_fragment * MAX_FRAGMENTS_PER_MESSAGE;
        if message.len() > max {
            return Err(SessionError::MessageTooLarge {
                size: message.len(),
                max,
            });
        }

        let msg_id = self.outbound.allocate_msg_id();
        let fragments = fragment_message(msg_id, &message, max_fragment);
        let mut events = Vec::with_capacity(fragments.len());
        for fragment in &fragments {
            events.push(SessionEvent::Send(self.seal_fragment(fragment, now)?));
        }
        trace!(
            remote_addr = %self.remote,
            msg_id,
            fragments = fragments.len(),
            "Message sent"
        );
        self.outbound.pending.insert(
            msg_id,
            PendingMessage {
                fragments,
                sent_at: now,
                resends: 0,
            },
        );
        Ok(events)
    }

    fn seal_fragment(&mut self, fragment: &Fragment, now: Instant) -> Result<Vec<u8>, SessionError> {
        let payload = DataPayload {
            acks: Vec::new(),
            fragments: vec![fragment.clone()],
        };
        self.seal_payload(PayloadType::Data, &payload.encode(), now)
    }

    pub(super) fn send_keepalive(&mut self, now: Instant) -> Result<Vec<u8>, SessionError> {
        self.seal_payload(PayloadType::Data, &DataPayload::default().encode(), now)
    }

    /// Queue messages moved from another holder, e.g. a pending introduction.
    pub fn queue_messages(&mut self, messages: Vec<Vec<u8>>) {
        for message in messages {
            self.outbound.queue(message);
        }
    }

    pub(super) fn handle_data(
        &mut self,
        local: &LocalRouter<'_>,
        payload: &[u8],
        now: Instant,
    ) -> Result<Vec<SessionEvent>, SessionError> {
        self.require_established(PayloadType::Data)?;
        let data = DataPayload::decode(payload)?;

        for msg_id in &data.acks {
            if self.outbound.acknowledge(*msg_id) {
                trace!(remote_addr = %self.remote, msg_id, "Message acknowledged");
            }
        }

        let from = self.ident_hash().copied();
        let mut events = Vec::new();
        let mut acks = Vec::new();
        for fragment in data.fragments {
            let msg_id = fragment.msg_id;
            match self.reassembler.submit_fragment(fragment, now) {
                SubmitResult::Accepted => {
                    if let Some(message) = self.reassembler.try_reassemble(msg_id) {
                        acks.push(msg_id);
                        if let Some(from) = from {
                            events.push(SessionEvent::Deliver { from, message });
                        }
                    }
                }
                SubmitResult::AlreadyDelivered => acks.push(msg_id),
                SubmitResult::Repeated => {}
                SubmitResult::Rejected => {
                    debug!(remote_addr = %self.remote, msg_id, "Inconsistent fragment dropped");
                }
            }
        }

        for chunk in acks.chunks(acks_per_packet(local)) {
            let ack = DataPayload {
                acks: chunk.to_vec(),
                fragments: Vec::new(),
            };
            events.push(SessionEvent::Send(self.seal_payload(
                PayloadType::Data,
                &ack.encode(),
                now,
            )?));
        }
        Ok(events)
    }

    /// Resend unacknowledged messages whose resend interval has elapsed,
    /// dropping those out of attempts.
    pub(super) fn resend_due(&mut self, local: &LocalRouter<'_>, now: Instant) -> Vec<SessionEvent> {
        let interval = local.timers.resend_interval;
        let max_resends = local.timers.max_resends;

        let due: Vec<u32> = self
            .outbound
            .pending
            .iter()
            .filter(|(_, m)| now.duration_since(m.sent_at) >= interval)
            .map(|(id, _)| *id)
            .collect();

        let mut events = Vec::new();
        for msg_id in due {
            let Some(mut message) = self.outbound.pending.remove(&msg_id) else {
                continue;
            };
            if message.resends >= max_resends {
                debug!(
                    remote_addr = %self.remote,
                    msg_id,
                    resends = message.resends,
                    "Message unacknowledged, giving up"
                );
                continue;
            }
            for fragment in &message.fragments {
                match self.seal_fragment(fragment, now) {
                    Ok(packet) => events.push(SessionEvent::Send(packet)),
                    Err(e) => debug!(remote_addr = %self.remote, error = %e, "Resend failed"),
                }
            }
            message.resends += 1;
            message.sent_at = now;
            self.outbound.pending.insert(msg_id, message);
        }
        events
    }
}

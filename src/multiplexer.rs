//! Request/Response Multiplexer (spec.md §4.3): message-id allocation,
//! the retransmission table, and ACK/COMPLETE waiter correlation.
//!
//! Grounded in the token→channel correlation pattern of the pack's CoAP
//! client example, adapted to a single owning task: waiters live in a
//! plain `HashMap` rather than behind a shared lock, since exactly one
//! `tokio::task` ever touches a `Multiplexer`.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::coap::Frame;

/// The two internal signals correlating inbound ACKs with pending
/// outbound confirmables (GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaiterKind {
    Ack,
    Complete,
}

/// What a `listen_for` call resolves to.
#[derive(Debug, Clone)]
pub enum WaiterResolution {
    Matched(Frame),
    Disconnected,
}

/// Filter predicate for `listen_for` (spec.md §4.3 "Waiters").
#[derive(Debug, Clone, Default)]
pub struct WaiterFilter {
    pub token: Option<Vec<u8>>,
    pub message_id: Option<u16>,
}

impl WaiterFilter {
    pub fn by_token(token: Vec<u8>) -> Self {
        Self {
            token: Some(token),
            message_id: None,
        }
    }

    pub fn by_message_id(message_id: u16) -> Self {
        Self {
            token: None,
            message_id: Some(message_id),
        }
    }

    fn matches(&self, frame: &Frame) -> bool {
        if let Some(token) = &self.token {
            if &frame.token != token {
                return false;
            }
        }
        if let Some(message_id) = self.message_id {
            if frame.message_id != message_id || !frame.code.is_success_class() {
                return false;
            }
        }
        true
    }
}

struct Waiter {
    kind: WaiterKind,
    filter: WaiterFilter,
    sender: oneshot::Sender<WaiterResolution>,
}

struct RetransmissionEntry {
    attempt: u8,
    payload: Bytes,
    deadline: Instant,
}

/// Outcome of a retransmission deadline firing.
pub enum RetransmitOutcome {
    Retry { payload: Bytes, timeout: Duration },
    Exhausted,
}

const BASE_RETRANSMIT_TIMEOUT: Duration = Duration::from_secs(4);
const MAX_ATTEMPTS: u8 = 3;

pub struct Multiplexer {
    message_id: u16,
    retransmissions: HashMap<u16, RetransmissionEntry>,
    waiters: HashMap<u64, Waiter>,
    next_waiter_id: u64,
}

impl Multiplexer {
    /// `initial_message_id` is the counter value derived from the
    /// handshake's session material (spec.md §3); the first call to
    /// `alloc_message_id` returns the value after it.
    pub fn new(initial_message_id: u16) -> Self {
        Self {
            message_id: initial_message_id,
            retransmissions: HashMap::new(),
            waiters: HashMap::new(),
            next_waiter_id: 0,
        }
    }

    /// Increments the 16-bit counter (wrapping 65535→0) and returns the
    /// new value (invariants 1 and 7 in spec.md §8).
    pub fn alloc_message_id(&mut self) -> u16 {
        self.message_id = self.message_id.wrapping_add(1);
        self.message_id
    }

    /// Registers a confirmable send's first attempt and returns the
    /// timeout to arm for it.
    pub fn arm_confirmable(&mut self, message_id: u16, payload: Bytes) -> Duration {
        let timeout = BASE_RETRANSMIT_TIMEOUT;
        self.retransmissions.insert(
            message_id,
            RetransmissionEntry {
                attempt: 1,
                payload,
                deadline: Instant::now() + timeout,
            },
        );
        timeout
    }

    /// The message-id with the nearest pending retransmission deadline,
    /// if any — the session loop's `tokio::select!` sleeps until this.
    pub fn next_deadline(&self) -> Option<(u16, Instant)> {
        self.retransmissions
            .iter()
            .map(|(id, e)| (*id, e.deadline))
            .min_by_key(|(_, deadline)| *deadline)
    }

    /// The retransmission deadline for one specific message-id, if it
    /// still has a pending entry.
    pub fn deadline_for(&self, message_id: u16) -> Option<Instant> {
        self.retransmissions.get(&message_id).map(|e| e.deadline)
    }

    /// Called when a confirmable's deadline fires without a COMPLETE.
    /// Per spec.md §4.3/§8 invariant 2: attempts 1→2→3 double the
    /// timeout (4s, 8s, 16s); after attempt 3 expires, the session
    /// reconnects instead of retrying again.
    pub fn on_retransmit_timeout(&mut self, message_id: u16) -> RetransmitOutcome {
        let Some(entry) = self.retransmissions.get_mut(&message_id) else {
            return RetransmitOutcome::Exhausted;
        };
        if entry.attempt >= MAX_ATTEMPTS {
            self.retransmissions.remove(&message_id);
            return RetransmitOutcome::Exhausted;
        }
        entry.attempt += 1;
        let timeout = BASE_RETRANSMIT_TIMEOUT * (1u32 << (entry.attempt - 1));
        entry.deadline = Instant::now() + timeout;
        RetransmitOutcome::Retry {
            payload: entry.payload.clone(),
            timeout,
        }
    }

    /// Removes a message-id's retransmission-table entry (its COMPLETE
    /// waiter resolved, success or otherwise).
    pub fn complete(&mut self, message_id: u16) {
        self.retransmissions.remove(&message_id);
    }

    /// Registers a waiter; the caller awaits the returned receiver,
    /// itself wrapped in a `tokio::time::timeout` by the session loop,
    /// and must call `cancel_waiter` on timeout to avoid a leaked entry.
    pub fn listen_for(
        &mut self,
        kind: WaiterKind,
        filter: WaiterFilter,
    ) -> (u64, oneshot::Receiver<WaiterResolution>) {
        let id = self.next_waiter_id;
        self.next_waiter_id += 1;
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(
            id,
            Waiter {
                kind,
                filter,
                sender: tx,
            },
        );
        (id, rx)
    }

    pub fn cancel_waiter(&mut self, id: u64) {
        self.waiters.remove(&id);
    }

    /// Classifies an inbound frame (spec.md §4.3 "Inbound classification")
    /// and resolves every waiter it matches. Returns the set of waiter
    /// kinds that had at least one match, so the caller can decide
    /// whether e.g. a ping-ACK still needs handling.
    pub fn dispatch_inbound(&mut self, frame: &Frame) -> Vec<WaiterKind> {
        let mut fired = Vec::new();
        if !frame.kind_is_ack() {
            return fired;
        }

        // Any ack bearing this message-id answers whatever we sent under
        // it, waiter or not (e.g. a keepalive ping has no waiter at all) —
        // its retransmission-table entry is done regardless.
        self.complete(frame.message_id);

        let kinds: &[WaiterKind] = if frame.code == crate::coap::CoapCode::EMPTY {
            &[WaiterKind::Ack, WaiterKind::Complete]
        } else {
            &[WaiterKind::Complete]
        };

        for &kind in kinds {
            let matched_ids: Vec<u64> = self
                .waiters
                .iter()
                .filter(|(_, w)| w.kind == kind && w.filter.matches(frame))
                .map(|(id, _)| *id)
                .collect();
            if !matched_ids.is_empty() {
                fired.push(kind);
            }
            for id in matched_ids {
                if let Some(waiter) = self.waiters.remove(&id) {
                    let _ = waiter.sender.send(WaiterResolution::Matched(frame.clone()));
                }
            }
        }
        fired
    }

    /// Resolves every pending waiter with a disconnect signal and clears
    /// the retransmission table (spec.md §4.2/§5 "Cancellation").
    pub fn disconnect_all(&mut self) {
        for (_, waiter) in self.waiters.drain() {
            let _ = waiter.sender.send(WaiterResolution::Disconnected);
        }
        self.retransmissions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coap::{CoapCode, Confirmability};

    #[test]
    fn message_id_wraps_at_65536() {
        let mut mux = Multiplexer::new(65534);
        assert_eq!(mux.alloc_message_id(), 65535);
        assert_eq!(mux.alloc_message_id(), 0);
    }

    #[test]
    fn retransmit_backoff_doubles_and_exhausts_after_three_attempts() {
        let mut mux = Multiplexer::new(0);
        mux.arm_confirmable(100, Bytes::from_static(b"payload"));

        match mux.on_retransmit_timeout(100) {
            RetransmitOutcome::Retry { timeout, .. } => assert_eq!(timeout, Duration::from_secs(8)),
            _ => panic!("expected retry"),
        }
        match mux.on_retransmit_timeout(100) {
            RetransmitOutcome::Retry { timeout, .. } => assert_eq!(timeout, Duration::from_secs(16)),
            _ => panic!("expected retry"),
        }
        match mux.on_retransmit_timeout(100) {
            RetransmitOutcome::Exhausted => {}
            _ => panic!("expected exhaustion after 3 attempts"),
        }
    }

    #[tokio::test]
    async fn complete_waiter_resolves_on_matching_ack() {
        let mut mux = Multiplexer::new(0);
        let (_id, rx) = mux.listen_for(WaiterKind::Complete, WaiterFilter::by_message_id(7));

        let ack = Frame::new(Confirmability::Ack, CoapCode::CHANGED, 7);
        let fired = mux.dispatch_inbound(&ack);
        assert_eq!(fired, vec![WaiterKind::Complete]);

        match rx.await.unwrap() {
            WaiterResolution::Matched(frame) => assert_eq!(frame.message_id, 7),
            _ => panic!("expected a match"),
        }
    }

    #[tokio::test]
    async fn ping_ack_fires_both_ack_and_complete_waiters() {
        let mut mux = Multiplexer::new(0);
        let (_id, rx) = mux.listen_for(WaiterKind::Ack, WaiterFilter::by_message_id(7));

        let ack = Frame::new(Confirmability::Ack, CoapCode::EMPTY, 7);
        let fired = mux.dispatch_inbound(&ack);
        assert_eq!(fired, vec![WaiterKind::Ack]);
        assert!(rx.await.is_ok());
    }

    #[test]
    fn ack_clears_retransmission_entry_even_without_a_waiter() {
        // A keepalive ping arms a retransmission entry but registers no
        // waiter at all; its ACK must still retire the entry, or the
        // session re-sends and eventually tears down a healthy link.
        let mut mux = Multiplexer::new(0);
        mux.arm_confirmable(7, Bytes::from_static(b"ping"));
        assert!(mux.next_deadline().is_some());

        let ack = Frame::new(Confirmability::Ack, CoapCode::EMPTY, 7);
        mux.dispatch_inbound(&ack);

        assert!(mux.deadline_for(7).is_none());
        assert!(mux.next_deadline().is_none());
    }

    #[tokio::test]
    async fn disconnect_resolves_pending_waiters_with_disconnected() {
        let mut mux = Multiplexer::new(0);
        let (_id, rx) = mux.listen_for(WaiterKind::Complete, WaiterFilter::by_message_id(1));
        mux.disconnect_all();
        match rx.await.unwrap() {
            WaiterResolution::Disconnected => {}
            _ => panic!("expected disconnect"),
        }
    }
}

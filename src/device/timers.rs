//! Per-peer timer engine
//!
//! Five stateful timers drive a peer's lifecycle: handshake retransmission
//! (with jitter and a hard give-up deadline), passive keepalive, stale
//! session recovery, key-material erasure, and persistent keepalive. The
//! engine stores event timestamps and armed flags; a periodic tick calls
//! [`Timers::update`], which returns the actions that fired. Cancellation
//! is implicit and idempotent: a newer event simply rewrites the timestamp
//! the deadline is computed from.

use std::time::{Duration, Instant};

use crate::noise::{
    KEEPALIVE_TIMEOUT, REKEY_ATTEMPT_TIME, REKEY_TIMEOUT, ZERO_KEY_MATERIAL_AFTER,
};

/// Actions produced by a timer tick, executed by the peer's timer task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// Retransmit the handshake initiation (attempts remain)
    RetransmitHandshake,
    /// Abandon the handshake: flush the nonce queue, stop keepalives
    GiveUpHandshake,
    /// Send an empty transport packet
    SendKeepalive,
    /// Sent data went unanswered; start a fresh handshake
    NewHandshake,
    /// Erase all handshake and key-pair material
    ZeroKeyMaterial,
    /// Persistent keepalive interval elapsed
    PersistentKeepalive,
}

pub struct Timers {
    persistent_keepalive: Option<u16>,

    attempt_started: Option<Instant>,
    retransmit_at: Option<Instant>,

    session_established: Option<Instant>,
    is_initiator: bool,
    zero_key_at: Option<Instant>,

    last_packet_received: Option<Instant>,
    last_packet_sent: Option<Instant>,
    last_data_sent: Option<Instant>,

    /// Deadline of the armed passive keepalive, if any
    keepalive_due: Option<Instant>,
    need_another_keepalive: bool,
    want_handshake: bool,

    /// Anchor for persistent keepalive: any authenticated traversal
    last_traversal: Instant,
}

impl Timers {
    pub fn new(persistent_keepalive: Option<u16>, now: Instant) -> Self {
        Self {
            persistent_keepalive: persistent_keepalive.filter(|&i| i > 0),
            attempt_started: None,
            retransmit_at: None,
            session_established: None,
            is_initiator: false,
            zero_key_at: None,
            last_packet_received: None,
            last_packet_sent: None,
            last_data_sent: None,
            keepalive_due: None,
            need_another_keepalive: false,
            want_handshake: false,
            last_traversal: now,
        }
    }

    pub fn persistent_keepalive(&self) -> Option<u16> {
        self.persistent_keepalive
    }

    pub fn set_persistent_keepalive(&mut self, interval: Option<u16>, now: Instant) {
        self.persistent_keepalive = interval.filter(|&i| i > 0);
        self.last_traversal = now;
    }

    pub fn handshake_attempt_started(&self) -> Option<Instant> {
        self.attempt_started
    }

    /// An initiation went out; arm the retransmit deadline
    pub fn on_initiation_sent(&mut self, now: Instant, jitter: Duration) {
        if self.attempt_started.is_none() {
            self.attempt_started = Some(now);
        }
        self.retransmit_at = Some(now + REKEY_TIMEOUT + jitter);
    }

    /// A key-pair was derived; the attempt (if any) succeeded
    pub fn on_handshake_complete(&mut self, now: Instant, is_initiator: bool) {
        self.attempt_started = None;
        self.retransmit_at = None;
        self.session_established = Some(now);
        self.is_initiator = is_initiator;
        self.zero_key_at = Some(now + ZERO_KEY_MATERIAL_AFTER);
    }

    pub fn on_handshake_given_up(&mut self) {
        self.attempt_started = None;
        self.retransmit_at = None;
        self.keepalive_due = None;
        self.need_another_keepalive = false;
        self.want_handshake = false;
    }

    pub fn session_established(&self) -> Option<Instant> {
        self.session_established
    }

    pub fn session_is_initiator(&self) -> bool {
        self.is_initiator
    }

    /// Any authenticated packet left for the peer; cancels a pending
    /// passive keepalive
    pub fn on_any_packet_sent(&mut self, now: Instant) {
        self.last_packet_sent = Some(now);
        self.keepalive_due = None;
        self.need_another_keepalive = false;
        self.last_traversal = now;
    }

    /// Any authenticated packet arrived from the peer
    pub fn on_any_packet_received(&mut self, now: Instant) {
        self.last_packet_received = Some(now);
        self.want_handshake = false;
        self.last_traversal = now;
    }

    /// A non-empty data packet arrived; arm the passive keepalive
    ///
    /// Received keep-alives deliberately do not arm it, or two idle peers
    /// would answer each other's keep-alives indefinitely.
    pub fn on_data_packet_received(&mut self, now: Instant) {
        match self.keepalive_due {
            None => self.keepalive_due = Some(now + KEEPALIVE_TIMEOUT),
            Some(_) => self.need_another_keepalive = true,
        }
    }

    /// A non-empty data packet was sent
    pub fn on_data_packet_sent(&mut self, now: Instant) {
        self.last_data_sent = Some(now);
        self.want_handshake = true;
    }

    /// Evaluate every timer against `now`
    pub fn update(&mut self, now: Instant) -> Vec<TimerAction> {
        let mut actions = Vec::new();

        if let Some(at) = self.zero_key_at {
            if now >= at {
                self.zero_key_at = None;
                self.session_established = None;
                actions.push(TimerAction::ZeroKeyMaterial);
            }
        }

        if let Some(started) = self.attempt_started {
            if now.saturating_duration_since(started) >= REKEY_ATTEMPT_TIME {
                self.on_handshake_given_up();
                actions.push(TimerAction::GiveUpHandshake);
            } else if self.retransmit_at.is_some_and(|at| now >= at) {
                // Rearmed by the next on_initiation_sent
                self.retransmit_at = None;
                actions.push(TimerAction::RetransmitHandshake);
            }
            return actions;
        }

        // Stale session: data went out and nothing authenticated came back
        if self.want_handshake {
            if let Some(sent) = self.last_data_sent {
                let unanswered = self.last_packet_received.map_or(true, |r| r < sent);
                if unanswered
                    && now.saturating_duration_since(sent) >= KEEPALIVE_TIMEOUT + REKEY_TIMEOUT
                {
                    self.want_handshake = false;
                    actions.push(TimerAction::NewHandshake);
                    return actions;
                }
            }
        }

        // Passive keepalive: we received data but did not answer
        if self.keepalive_due.is_some_and(|due| now >= due) {
            self.keepalive_due = std::mem::take(&mut self.need_another_keepalive)
                .then(|| now + KEEPALIVE_TIMEOUT);
            actions.push(TimerAction::SendKeepalive);
        }

        if let Some(interval) = self.persistent_keepalive {
            let interval = Duration::from_secs(interval as u64);
            if now.saturating_duration_since(self.last_traversal) >= interval {
                self.last_traversal = now;
                actions.push(TimerAction::PersistentKeepalive);
            }
        }

        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: Duration = Duration::from_secs(1);

    #[test]
    fn retransmit_then_give_up() {
        let t0 = Instant::now();
        let mut timers = Timers::new(None, t0);

        timers.on_initiation_sent(t0, Duration::from_millis(100));
        assert!(timers.update(t0 + 4 * SEC).is_empty());

        let actions = timers.update(t0 + 6 * SEC);
        assert_eq!(actions, vec![TimerAction::RetransmitHandshake]);

        // Deadline not rearmed until the retry actually goes out
        assert!(timers.update(t0 + 7 * SEC).is_empty());
        timers.on_initiation_sent(t0 + 7 * SEC, Duration::ZERO);

        // Past the attempt deadline the handshake is abandoned
        let actions = timers.update(t0 + REKEY_ATTEMPT_TIME + SEC);
        assert_eq!(actions, vec![TimerAction::GiveUpHandshake]);
        assert!(timers.handshake_attempt_started().is_none());
    }

    #[test]
    fn handshake_completion_cancels_retransmit() {
        let t0 = Instant::now();
        let mut timers = Timers::new(None, t0);

        timers.on_initiation_sent(t0, Duration::ZERO);
        timers.on_handshake_complete(t0 + 2 * SEC, true);

        assert!(timers.update(t0 + 10 * SEC).is_empty());
        assert!(timers.session_is_initiator());
    }

    #[test]
    fn passive_keepalive_fires_once() {
        let t0 = Instant::now();
        let mut timers = Timers::new(None, t0);
        timers.on_handshake_complete(t0, false);

        timers.on_any_packet_received(t0 + SEC);
        timers.on_data_packet_received(t0 + SEC);

        assert!(timers.update(t0 + 5 * SEC).is_empty());
        let actions = timers.update(t0 + 11 * SEC);
        assert_eq!(actions, vec![TimerAction::SendKeepalive]);

        // Not rearmed without further traffic
        assert!(timers.update(t0 + 30 * SEC).is_empty());
    }

    #[test]
    fn received_keepalives_do_not_arm_keepalive() {
        let t0 = Instant::now();
        let mut timers = Timers::new(None, t0);
        timers.on_handshake_complete(t0, false);

        // An empty packet arrived: any-packet bookkeeping only
        timers.on_any_packet_received(t0 + SEC);
        assert!(timers.update(t0 + 20 * SEC).is_empty());
    }

    #[test]
    fn keepalive_rearms_when_more_data_arrived() {
        let t0 = Instant::now();
        let mut timers = Timers::new(None, t0);
        timers.on_handshake_complete(t0, false);

        timers.on_data_packet_received(t0 + SEC);
        // More data while armed: the deadline holds, one more firing queues
        timers.on_data_packet_received(t0 + 2 * SEC);

        let actions = timers.update(t0 + 11 * SEC);
        assert_eq!(actions, vec![TimerAction::SendKeepalive]);
        assert!(timers.update(t0 + 12 * SEC).is_empty());
        let actions = timers.update(t0 + 21 * SEC);
        assert_eq!(actions, vec![TimerAction::SendKeepalive]);
    }

    #[test]
    fn sending_cancels_keepalive() {
        let t0 = Instant::now();
        let mut timers = Timers::new(None, t0);
        timers.on_handshake_complete(t0, false);

        timers.on_data_packet_received(t0 + SEC);
        timers.on_any_packet_sent(t0 + 2 * SEC);

        assert!(timers.update(t0 + 20 * SEC).is_empty());
    }

    #[test]
    fn unanswered_data_triggers_new_handshake() {
        let t0 = Instant::now();
        let mut timers = Timers::new(None, t0);
        timers.on_handshake_complete(t0, true);

        timers.on_data_packet_sent(t0 + SEC);
        timers.on_any_packet_sent(t0 + SEC);

        assert!(timers.update(t0 + 10 * SEC).is_empty());
        let actions = timers.update(t0 + SEC + KEEPALIVE_TIMEOUT + REKEY_TIMEOUT);
        assert_eq!(actions, vec![TimerAction::NewHandshake]);
    }

    #[test]
    fn answered_data_does_not_trigger_handshake() {
        let t0 = Instant::now();
        let mut timers = Timers::new(None, t0);
        timers.on_handshake_complete(t0, true);

        timers.on_data_packet_sent(t0 + SEC);
        timers.on_any_packet_sent(t0 + SEC);
        timers.on_any_packet_received(t0 + 2 * SEC);

        let actions = timers.update(t0 + SEC + KEEPALIVE_TIMEOUT + REKEY_TIMEOUT);
        assert!(!actions.contains(&TimerAction::NewHandshake));
    }

    #[test]
    fn persistent_keepalive_cadence() {
        let t0 = Instant::now();
        let mut timers = Timers::new(Some(25), t0);

        // No traffic at all: exactly one keepalive per interval
        assert!(timers.update(t0 + 24 * SEC).is_empty());
        assert_eq!(
            timers.update(t0 + 25 * SEC),
            vec![TimerAction::PersistentKeepalive]
        );
        assert!(timers.update(t0 + 26 * SEC).is_empty());
        assert_eq!(
            timers.update(t0 + 50 * SEC),
            vec![TimerAction::PersistentKeepalive]
        );
    }

    #[test]
    fn traffic_resets_persistent_keepalive() {
        let t0 = Instant::now();
        let mut timers = Timers::new(Some(25), t0);

        timers.on_any_packet_sent(t0 + 20 * SEC);
        assert!(timers.update(t0 + 26 * SEC).is_empty());
        assert_eq!(
            timers.update(t0 + 45 * SEC),
            vec![TimerAction::PersistentKeepalive]
        );
    }

    #[test]
    fn zero_key_material_after_triple_reject() {
        let t0 = Instant::now();
        let mut timers = Timers::new(None, t0);
        timers.on_handshake_complete(t0, true);

        assert!(timers.update(t0 + ZERO_KEY_MATERIAL_AFTER - SEC).is_empty());
        let actions = timers.update(t0 + ZERO_KEY_MATERIAL_AFTER);
        assert_eq!(actions, vec![TimerAction::ZeroKeyMaterial]);

        // Fires once
        assert!(timers.update(t0 + ZERO_KEY_MATERIAL_AFTER + SEC).is_empty());
    }

    #[test]
    fn zero_interval_disables_persistent_keepalive() {
        let t0 = Instant::now();
        let mut timers = Timers::new(Some(0), t0);
        assert!(timers.persistent_keepalive().is_none());
        assert!(timers.update(t0 + 3600 * SEC).is_empty());
    }
}

//! The RCU's protocol session: a pure state transition over one received
//! byte at a time, table-driven over the enum of states the RCU can be in
//! while it waits for the master's next poll.
//!
//! `Session` never touches a transport. It is driven by
//! [`Session::on_frame`] / [`Session::on_untagged_byte`] / [`Session::on_timeout`],
//! each returning a list of [`SessionAction`]s for the worker thread to
//! execute, keeping the state transition itself free of I/O so it can be
//! exercised directly by feeding it recorded byte streams.

use crate::rcu::constants::*;
use crate::rcu::error::{RcuError, UnknownParameterWarning};
use crate::rcu::frame::{decode_data_packet, encode_write_packet, tag_as_data, FrameByte};
use crate::rcu::registry::{Projection, Registry};
use crate::rcu::store::StoreKey;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The six session states the RCU can occupy. `WRITE_PENDING` and `POLLED`
/// share one variant (`Polled { write_pending }`) since every transition out
/// of either only ever depends on that one flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// `IDLE'`: `Address(0x00)` seen, awaiting the target address byte.
    AddressLead,
    Polled { write_pending: bool },
    Receiving,
    Writing,
    Complete,
}

/// Outcome of an in-flight write, delivered to the façade's completion
/// channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Accepted,
    Rejected,
    Timeout,
}

/// A single queued write request, already validated for writability and
/// range by the façade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingWrite {
    pub index: u8,
    pub raw: u32,
    pub width: u8,
}

/// A side effect for the worker thread to execute. The session itself never
/// calls `Transport::send`; only the worker turns these into actual I/O,
/// which keeps emission ordering and parity switching in one place.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    Emit(FrameByte),
    Decoded { key: StoreKey, value: crate::rcu::registry::DecodedValue },
    UnknownParameter(UnknownParameterWarning),
    WriteOutcome(WriteOutcome),
    /// Three consecutive checksum failures: the line is probably noisy.
    BusNoisy,
}

/// Response-deadline and delay knobs, kept as fields rather than constants
/// since the right values are empirical and vary by installation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionConfig {
    /// How long the RCU waits for `Data(0xC0)` after emitting ACK, or for a
    /// byte stream to complete a packet, before giving up.
    pub response_deadline: Duration,
    /// How long the RCU waits for the master's ACK of its ENQ before
    /// dropping the queued write.
    pub post_enq_delay: Duration,
    /// How long the RCU waits for the master's ACK/NAK of its write packet.
    pub post_write_delay: Duration,
    /// Maximum gap between an untagged `0x00` and a following untagged byte
    /// for the pair to still be inferred as an address poll.
    pub inter_byte_gap: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            response_deadline: Duration::from_millis(300),
            post_enq_delay: Duration::from_millis(150),
            post_write_delay: Duration::from_millis(200),
            inter_byte_gap: Duration::from_millis(20),
        }
    }
}

/// The RCU's protocol state machine. One instance per open session; never
/// shared across sessions — each session starts with a fresh value store.
pub struct Session {
    state: SessionState,
    registry: Arc<Registry>,
    config: SessionConfig,
    checksum_failures: u32,
    recv_buffer: Vec<FrameByte>,
    expected_total: Option<usize>,
    pending_write: Option<PendingWrite>,
    deadline: Option<Instant>,
    pending_poll_lead: Option<Instant>,
}

impl Session {
    pub fn new(registry: Arc<Registry>, config: SessionConfig) -> Self {
        Self {
            state: SessionState::Idle,
            registry,
            config,
            checksum_failures: 0,
            recv_buffer: Vec::new(),
            expected_total: None,
            pending_write: None,
            deadline: None,
            pending_poll_lead: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn has_pending_write(&self) -> bool {
        self.pending_write.is_some()
    }

    /// The minimum dwell the worker should sleep before its next `recv`
    /// call, honoring the floor half of the post-ENQ/post-write delay ranges
    /// (a deadline alone only enforces the ceiling).
    pub fn settle_delay(&self) -> Option<Duration> {
        match self.state {
            SessionState::Polled { write_pending: true } => Some(self.config.post_enq_delay),
            SessionState::Writing => Some(self.config.post_write_delay),
            _ => None,
        }
    }

    /// Queues a single write request. The caller (façade) is responsible
    /// for writability/range validation before calling this.
    pub fn queue_write(&mut self, write: PendingWrite) {
        self.pending_write = Some(write);
    }

    fn arm_deadline(&mut self, now: Instant, duration: Duration) {
        self.deadline = Some(now + duration);
    }

    fn reset_to_idle(&mut self) {
        self.state = SessionState::Idle;
        self.deadline = None;
        self.recv_buffer.clear();
        self.expected_total = None;
        self.pending_poll_lead = None;
    }

    /// Feeds one byte whose ninth-bit tag is known for certain (either read
    /// directly off the wire, or already resolved by [`Session::on_untagged_byte`]).
    pub fn on_frame(&mut self, frame: FrameByte, now: Instant) -> Vec<SessionAction> {
        match (self.state, frame) {
            (SessionState::Idle, FrameByte::Address(v)) if v == POLL_LEAD => {
                self.state = SessionState::AddressLead;
                vec![]
            }
            (SessionState::AddressLead, FrameByte::Address(v)) if v == RCU_ADDR => {
                let write_pending = self.pending_write.is_some();
                self.state = SessionState::Polled { write_pending };
                if write_pending {
                    self.arm_deadline(now, self.config.post_enq_delay);
                    vec![SessionAction::Emit(FrameByte::Data(ENQ))]
                } else {
                    self.arm_deadline(now, self.config.response_deadline);
                    vec![SessionAction::Emit(FrameByte::Data(ACK))]
                }
            }
            (SessionState::AddressLead, FrameByte::Address(_other)) => {
                self.reset_to_idle();
                vec![]
            }
            (SessionState::Polled { write_pending: false }, FrameByte::Data(v))
                if v == CMD_DATA =>
            {
                self.state = SessionState::Receiving;
                self.recv_buffer = vec![FrameByte::Data(CMD_DATA)];
                self.expected_total = None;
                self.arm_deadline(now, self.config.response_deadline);
                vec![]
            }
            (SessionState::Polled { write_pending: true }, FrameByte::Data(v)) if v == ACK => {
                let actions = self.emit_write_packet();
                self.state = SessionState::Writing;
                self.arm_deadline(now, self.config.post_write_delay);
                actions
            }
            (SessionState::Polled { write_pending: true }, _other) => {
                self.pending_write = None;
                self.reset_to_idle();
                vec![SessionAction::WriteOutcome(WriteOutcome::Timeout)]
            }
            (SessionState::Receiving, FrameByte::Data(v)) => self.on_receiving_byte(v),
            (SessionState::Writing, FrameByte::Data(v)) if v == ACK => {
                self.reset_to_idle();
                vec![
                    SessionAction::Emit(FrameByte::Address(ETX)),
                    SessionAction::WriteOutcome(WriteOutcome::Accepted),
                ]
            }
            (SessionState::Writing, FrameByte::Data(v)) if v == NAK => {
                self.reset_to_idle();
                vec![SessionAction::WriteOutcome(WriteOutcome::Rejected)]
            }
            (SessionState::Idle, FrameByte::Data(_)) => vec![],
            (_, _) => {
                self.reset_to_idle();
                vec![]
            }
        }
    }

    /// Feeds one byte whose ninth-bit tag the transport could not report,
    /// applying the tag-inference heuristic: a `0x00` followed within one
    /// inter-byte-gap by the RCU's own address is treated as an address
    /// poll; everything else defaults to `Data`.
    pub fn on_untagged_byte(&mut self, byte: u8, now: Instant) -> Vec<SessionAction> {
        if matches!(self.state, SessionState::Idle) {
            if let Some(seen_at) = self.pending_poll_lead.take() {
                let within_gap = now.saturating_duration_since(seen_at) <= self.config.inter_byte_gap;
                if within_gap && byte == RCU_ADDR {
                    self.on_frame(FrameByte::Address(POLL_LEAD), now);
                    return self.on_frame(FrameByte::Address(RCU_ADDR), now);
                }
                // Gap expired or mismatched byte: the earlier 0x00 is reclassified
                // as data noise; fall through and classify the current byte fresh.
            }
            if byte == POLL_LEAD {
                self.pending_poll_lead = Some(now);
                return vec![];
            }
        }
        self.on_frame(FrameByte::Data(byte), now)
    }

    /// Deadline expiry for whichever state is currently waiting on one.
    pub fn on_timeout(&mut self, now: Instant) -> Vec<SessionAction> {
        let Some(deadline) = self.deadline else {
            return vec![];
        };
        if now < deadline {
            return vec![];
        }
        match self.state {
            SessionState::Polled { write_pending: true } => {
                self.pending_write = None;
                self.reset_to_idle();
                vec![SessionAction::WriteOutcome(WriteOutcome::Timeout)]
            }
            SessionState::Writing => {
                self.reset_to_idle();
                vec![SessionAction::WriteOutcome(WriteOutcome::Timeout)]
            }
            _ => {
                self.reset_to_idle();
                vec![]
            }
        }
    }

    fn emit_write_packet(&mut self) -> Vec<SessionAction> {
        let Some(pending) = self.pending_write.take() else {
            return vec![];
        };
        let wire = encode_write_packet(pending.index, pending.raw, pending.width);
        tag_as_data(&wire).into_iter().map(SessionAction::Emit).collect()
    }

    fn on_receiving_byte(&mut self, byte: u8) -> Vec<SessionAction> {
        self.recv_buffer.push(FrameByte::Data(byte));
        if self.recv_buffer.len() == 4 {
            let len = self.recv_buffer[3].value() as usize;
            self.expected_total = Some(4 + len + 1);
        }
        let Some(total) = self.expected_total else {
            return vec![];
        };
        if self.recv_buffer.len() < total {
            return vec![];
        }
        let buffer = std::mem::take(&mut self.recv_buffer);
        self.expected_total = None;
        self.finish_packet(&buffer)
    }

    fn finish_packet(&mut self, buffer: &[FrameByte]) -> Vec<SessionAction> {
        let registry = Arc::clone(&self.registry);
        match decode_data_packet(buffer, registry.unknown_parameter_width, |idx| registry.size(idx)) {
            Ok(packet) => {
                self.checksum_failures = 0;
                let mut actions = Vec::new();
                for record in &packet.records {
                    if record.unknown {
                        actions.push(SessionAction::UnknownParameter(UnknownParameterWarning {
                            index: record.index,
                            assumed_width: record.width,
                        }));
                    }
                    match registry.definition(record.index) {
                        Some(def) => match def.project(record.raw) {
                            Projection::Scalar(value) => actions.push(SessionAction::Decoded {
                                key: StoreKey::Index(record.index),
                                value,
                            }),
                            Projection::Bitfields(fields) => {
                                for (name, value) in fields {
                                    actions.push(SessionAction::Decoded {
                                        key: StoreKey::Bitfield(record.index, name),
                                        value,
                                    });
                                }
                            }
                        },
                        None => actions.push(SessionAction::Decoded {
                            key: StoreKey::Index(record.index),
                            value: crate::rcu::registry::DecodedValue::Integer(record.raw as i64),
                        }),
                    }
                }
                actions.push(SessionAction::Emit(FrameByte::Data(ACK)));
                actions.push(SessionAction::Emit(FrameByte::Address(ETX)));
                self.reset_to_idle();
                actions
            }
            Err(RcuError::Checksum { .. }) => {
                self.checksum_failures += 1;
                let mut actions = vec![SessionAction::Emit(FrameByte::Data(NAK))];
                if self.checksum_failures >= 3 {
                    actions.push(SessionAction::BusNoisy);
                }
                self.reset_to_idle();
                actions
            }
            Err(_) => {
                // FramingError / AddressingError: reset, emit nothing. Also
                // clears the checksum-failure streak so a framing error in
                // between two bad checksums doesn't let them count toward
                // BusNoisy as if they were back-to-back.
                self.checksum_failures = 0;
                self.reset_to_idle();
                vec![]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rcu::registry::Registry;
    use std::time::Instant;

    fn session() -> Session {
        Session::new(Arc::new(Registry::built_in()), SessionConfig::default())
    }

    fn poll(session: &mut Session, now: Instant) -> Vec<SessionAction> {
        let mut actions = session.on_frame(FrameByte::Address(POLL_LEAD), now);
        actions.extend(session.on_frame(FrameByte::Address(RCU_ADDR), now));
        actions
    }

    #[test]
    fn poll_without_pending_write_emits_ack() {
        let mut s = session();
        let actions = poll(&mut s, Instant::now());
        assert_eq!(actions, vec![SessionAction::Emit(FrameByte::Data(ACK))]);
        assert_eq!(s.state(), SessionState::Polled { write_pending: false });
    }

    #[test]
    fn poll_with_pending_write_emits_enq() {
        let mut s = session();
        s.queue_write(PendingWrite { index: 0x0B, raw: 5, width: 1 });
        let actions = poll(&mut s, Instant::now());
        assert_eq!(actions, vec![SessionAction::Emit(FrameByte::Data(ENQ))]);
        assert_eq!(s.state(), SessionState::Polled { write_pending: true });
    }

    #[test]
    fn scenario_s1_single_temperature_reply() {
        let mut s = session();
        let now = Instant::now();
        poll(&mut s, now);
        assert_eq!(s.state(), SessionState::Polled { write_pending: false });

        let packet = [CMD_DATA, 0x00, MASTER_ADDR, 0x05, 0x00, 0x01, 0xFE, 0x3A];
        let chk = crate::rcu::frame::checksum(&packet);
        let mut wire = packet.to_vec();
        wire.push(chk);

        let mut all_actions = Vec::new();
        for &b in &wire {
            all_actions.extend(s.on_frame(FrameByte::Data(b), now));
        }

        let decoded = all_actions
            .iter()
            .find_map(|a| match a {
                SessionAction::Decoded { key, value } if *key == StoreKey::Index(0x01) => {
                    Some(value.clone())
                }
                _ => None,
            })
            .unwrap();
        match decoded {
            crate::rcu::registry::DecodedValue::Real(v, unit) => {
                assert!((v - (-45.4)).abs() < 1e-9);
                assert_eq!(unit, "°C");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(all_actions.contains(&SessionAction::Emit(FrameByte::Data(ACK))));
        assert!(all_actions.contains(&SessionAction::Emit(FrameByte::Address(ETX))));
        assert_eq!(s.state(), SessionState::Idle);
    }

    #[test]
    fn scenario_s4_checksum_failure_emits_single_nak_and_no_store_update() {
        let mut s = session();
        let now = Instant::now();
        poll(&mut s, now);

        let packet = [CMD_DATA, 0x00, MASTER_ADDR, 0x05, 0x00, 0x01, 0xFE, 0x3A];
        let chk = crate::rcu::frame::checksum(&packet) ^ 0x01;
        let mut wire = packet.to_vec();
        wire.push(chk);

        let mut all_actions = Vec::new();
        for &b in &wire {
            all_actions.extend(s.on_frame(FrameByte::Data(b), now));
        }

        assert_eq!(all_actions, vec![SessionAction::Emit(FrameByte::Data(NAK))]);
        assert_eq!(s.state(), SessionState::Idle);
    }

    #[test]
    fn scenario_s5_write_handshake_emits_packet_after_master_ack() {
        let mut s = session();
        let now = Instant::now();
        s.queue_write(PendingWrite { index: 0x0B, raw: 5, width: 1 });
        let actions = poll(&mut s, now);
        assert_eq!(actions, vec![SessionAction::Emit(FrameByte::Data(ENQ))]);

        let actions = s.on_frame(FrameByte::Data(ACK), now);
        assert_eq!(s.state(), SessionState::Writing);
        let expected_wire = encode_write_packet(0x0B, 5, 1);
        let emitted: Vec<u8> = actions
            .iter()
            .map(|a| match a {
                SessionAction::Emit(f) => f.value(),
                other => panic!("unexpected action: {other:?}"),
            })
            .collect();
        assert_eq!(emitted, expected_wire);

        let actions = s.on_frame(FrameByte::Data(ACK), now);
        assert_eq!(
            actions,
            vec![
                SessionAction::Emit(FrameByte::Address(ETX)),
                SessionAction::WriteOutcome(WriteOutcome::Accepted),
            ]
        );
        assert_eq!(s.state(), SessionState::Idle);
    }

    #[test]
    fn write_request_times_out_without_master_ack_of_enq() {
        let mut s = session();
        let now = Instant::now();
        s.queue_write(PendingWrite { index: 0x0B, raw: 5, width: 1 });
        poll(&mut s, now);
        assert_eq!(s.state(), SessionState::Polled { write_pending: true });

        let late = now + Duration::from_secs(1);
        let actions = s.on_timeout(late);
        assert_eq!(actions, vec![SessionAction::WriteOutcome(WriteOutcome::Timeout)]);
        assert_eq!(s.state(), SessionState::Idle);
        assert!(!s.has_pending_write());
    }

    #[test]
    fn three_consecutive_checksum_failures_raise_bus_noisy() {
        let mut s = session();
        let now = Instant::now();
        let packet = [CMD_DATA, 0x00, MASTER_ADDR, 0x05, 0x00, 0x01, 0xFE, 0x3A];
        let bad_chk = crate::rcu::frame::checksum(&packet) ^ 0x01;
        let mut wire = packet.to_vec();
        wire.push(bad_chk);

        let mut last_actions = Vec::new();
        for _ in 0..3 {
            poll(&mut s, now);
            last_actions = Vec::new();
            for &b in &wire {
                last_actions.extend(s.on_frame(FrameByte::Data(b), now));
            }
        }
        assert!(last_actions.contains(&SessionAction::BusNoisy));
    }

    #[test]
    fn checksum_failure_streak_resets_on_an_intervening_framing_error() {
        let mut s = session();
        let now = Instant::now();

        let bad_checksum_wire = {
            let packet = [CMD_DATA, 0x00, MASTER_ADDR, 0x05, 0x00, 0x01, 0xFE, 0x3A];
            let bad_chk = crate::rcu::frame::checksum(&packet) ^ 0x01;
            let mut wire = packet.to_vec();
            wire.push(bad_chk);
            wire
        };
        let wrong_sender_wire = {
            // Decodes to an AddressingError, not a ChecksumError: the
            // checksum itself is correct, the sender byte just isn't the
            // master's address.
            let packet = [CMD_DATA, 0x00, 0x99, 0x03, 0x00, 0x0B, 0x05];
            let chk = crate::rcu::frame::checksum(&packet);
            let mut wire = packet.to_vec();
            wire.push(chk);
            wire
        };

        // One checksum failure, then a framing-class error, then two more
        // checksum failures: the streak must not have carried across the
        // framing error, so only two of the three are back-to-back and
        // BusNoisy must not fire yet.
        poll(&mut s, now);
        for &b in &bad_checksum_wire {
            s.on_frame(FrameByte::Data(b), now);
        }
        poll(&mut s, now);
        for &b in &wrong_sender_wire {
            s.on_frame(FrameByte::Data(b), now);
        }
        let mut last_actions = Vec::new();
        for _ in 0..2 {
            poll(&mut s, now);
            last_actions = Vec::new();
            for &b in &bad_checksum_wire {
                last_actions.extend(s.on_frame(FrameByte::Data(b), now));
            }
        }
        assert!(!last_actions.contains(&SessionAction::BusNoisy));

        // A third consecutive checksum failure now does trip it.
        poll(&mut s, now);
        let mut last_actions = Vec::new();
        for &b in &bad_checksum_wire {
            last_actions.extend(s.on_frame(FrameByte::Data(b), now));
        }
        assert!(last_actions.contains(&SessionAction::BusNoisy));
    }

    #[test]
    fn tag_inference_recognizes_untagged_poll_pair() {
        let mut s = session();
        let now = Instant::now();
        let actions = s.on_untagged_byte(0x00, now);
        assert!(actions.is_empty());
        let actions = s.on_untagged_byte(RCU_ADDR, now + Duration::from_millis(1));
        assert_eq!(actions, vec![SessionAction::Emit(FrameByte::Data(ACK))]);
    }

    #[test]
    fn tag_inference_treats_stale_zero_as_data_after_gap() {
        let mut s = session();
        let now = Instant::now();
        let actions = s.on_untagged_byte(0x00, now);
        assert!(actions.is_empty());
        let late = now + Duration::from_secs(1);
        let actions = s.on_untagged_byte(RCU_ADDR, late);
        assert!(actions.is_empty());
        assert_eq!(s.state(), SessionState::Idle);
    }
}

//! The single background worker thread that owns the [`TransportPort`] and
//! the [`Session`], draining bytes, driving state transitions, and
//! publishing decoded values to the [`ValueStore`].

use crate::rcu::error::RcuError;
use crate::rcu::frame::FrameByte;
use crate::rcu::session::{PendingWrite, Session, SessionAction, WriteOutcome};
use crate::rcu::store::{StoreKey, ValueStore};
use crate::rcu::transport::{FrameTag, TransportPort};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// One write enqueued by the façade, with a completion channel.
pub struct PendingWriteRequest {
    pub index: u8,
    pub raw: u32,
    pub width: u8,
    pub completion: Sender<Result<(), RcuError>>,
}

/// A diagnostic-capture request: timestamp every raw byte for `duration`
/// instead of running it through the `Session`.
pub struct CaptureRequest {
    pub duration: Duration,
    pub completion: Sender<Vec<TimestampedByte>>,
}

/// One byte observed during `diagnostic_capture`, timestamped with a
/// monotonic clock rather than wall-clock time.
#[derive(Debug, Clone, Copy)]
pub struct TimestampedByte {
    pub at: Instant,
    pub byte: u8,
    pub tag: Option<FrameTag>,
}

/// The single-slot write queue and capture-request slot shared between the
/// façade thread and the worker thread.
#[derive(Default)]
pub struct SharedSlots {
    pub write: Mutex<Option<PendingWriteRequest>>,
    pub capture: Mutex<Option<CaptureRequest>>,
}

const POLL_TICK: Duration = Duration::from_millis(20);

/// Runs until `stop` is set or the transport errors out. Intended to be the
/// body of the one worker thread spawned by `Rcu::open`: block on recv, feed
/// bytes to the session, and deliver decoded values to the store.
pub fn run(
    mut transport: Box<dyn TransportPort>,
    mut session: Session,
    store: Arc<ValueStore>,
    slots: Arc<SharedSlots>,
    stop: Arc<AtomicBool>,
) {
    let mut in_flight_write: Option<PendingWriteRequest> = None;

    loop {
        if stop.load(Ordering::Acquire) {
            break;
        }

        if let Some(capture) = slots.capture.lock().unwrap().take() {
            let bytes = capture_once(transport.as_mut(), capture.duration, &stop);
            let _ = capture.completion.send(bytes);
            continue;
        }

        if in_flight_write.is_none() && !session.has_pending_write() {
            if let Some(req) = slots.write.lock().unwrap().take() {
                session.queue_write(PendingWrite {
                    index: req.index,
                    raw: req.raw,
                    width: req.width,
                });
                in_flight_write = Some(req);
            }
        }

        let now = Instant::now();
        let wait = match session.deadline() {
            Some(deadline) => deadline.saturating_duration_since(now).min(POLL_TICK),
            None => POLL_TICK,
        };

        match transport.recv(wait) {
            Ok(Some(recv_byte)) => {
                let now = Instant::now();
                let prev_state = session.state();
                let actions = match recv_byte.tag {
                    Some(FrameTag::Address) => {
                        session.on_frame(FrameByte::Address(recv_byte.byte), now)
                    }
                    Some(FrameTag::Data) => session.on_frame(FrameByte::Data(recv_byte.byte), now),
                    None => session.on_untagged_byte(recv_byte.byte, now),
                };
                apply_actions(&actions, transport.as_mut(), &store, &mut in_flight_write);
                let new_state = session.state();
                let awaiting_master = matches!(
                    new_state,
                    crate::rcu::session::SessionState::Polled { write_pending: true }
                        | crate::rcu::session::SessionState::Writing
                );
                if awaiting_master {
                    // Discard whatever noise accumulated before we sent our
                    // ENQ/write packet, then honor the post-ENQ/post-write
                    // floor delay exactly once, right after the transition,
                    // before the next `recv` goes looking for the master's
                    // real reply (the response deadline alone only bounds the
                    // ceiling).
                    let _ = transport.drain();
                }
                if new_state != prev_state {
                    if let Some(settle) = session.settle_delay() {
                        spin_sleep::sleep(settle);
                    }
                }
            }
            Ok(None) => {
                if let Some(deadline) = session.deadline() {
                    if Instant::now() >= deadline {
                        let actions = session.on_timeout(Instant::now());
                        apply_actions(&actions, transport.as_mut(), &store, &mut in_flight_write);
                    }
                }
            }
            Err(e) => {
                log::error!("transport error, tearing down session: {e}");
                if let Some(req) = in_flight_write.take() {
                    let _ = req.completion.send(Err(RcuError::Transport(e)));
                }
                break;
            }
        }
    }
}

/// Applies one batch of session actions, coalescing any run of consecutive
/// `Emit`s into a single [`TransportPort::send_many`] call instead of one
/// `send` per byte: the ACK+ETX pair after a successful packet and the
/// whole write-packet wire form are exactly these runs, and coalescing them
/// means one parity-set operation instead of one per byte.
fn apply_actions(
    actions: &[SessionAction],
    transport: &mut dyn TransportPort,
    store: &ValueStore,
    in_flight_write: &mut Option<PendingWriteRequest>,
) {
    let mut i = 0;
    while i < actions.len() {
        if matches!(actions[i], SessionAction::Emit(_)) {
            let run_start = i;
            while i < actions.len() && matches!(actions[i], SessionAction::Emit(_)) {
                i += 1;
            }
            let frames: Vec<FrameByte> = actions[run_start..i]
                .iter()
                .map(|a| match a {
                    SessionAction::Emit(frame) => *frame,
                    _ => unreachable!("run bounded by the matches! check above"),
                })
                .collect();
            if let Err(e) = transport.send_many(&frames) {
                log::warn!("failed to emit {} frame byte(s): {e}", frames.len());
            }
            continue;
        }

        match &actions[i] {
            SessionAction::Decoded { key, value } => {
                log_decoded(key, value);
                store.record(key.clone(), value.clone());
            }
            SessionAction::UnknownParameter(warning) => {
                log::warn!("{warning}");
                store.record_warning(warning.clone());
            }
            SessionAction::WriteOutcome(outcome) => {
                if let Some(req) = in_flight_write.take() {
                    let result = match outcome {
                        WriteOutcome::Accepted => Ok(()),
                        WriteOutcome::Rejected => Err(RcuError::WriteRejected(req.index)),
                        WriteOutcome::Timeout => Err(RcuError::WriteTimeout(req.index)),
                    };
                    let _ = req.completion.send(result);
                }
            }
            SessionAction::BusNoisy => {
                log::warn!("bus noisy: three consecutive checksum failures");
            }
            SessionAction::Emit(_) => unreachable!("handled by the run above"),
        }
        i += 1;
    }
}

fn log_decoded(key: &StoreKey, value: &crate::rcu::registry::DecodedValue) {
    match key {
        StoreKey::Index(idx) => log::debug!("decoded {idx:#04x} = {value:?}"),
        StoreKey::Bitfield(idx, name) => log::debug!("decoded {idx:#04x}.{name} = {value:?}"),
    }
}

fn capture_once(
    transport: &mut dyn TransportPort,
    duration: Duration,
    stop: &AtomicBool,
) -> Vec<TimestampedByte> {
    let deadline = Instant::now() + duration;
    let mut captured = Vec::new();
    while Instant::now() < deadline {
        if stop.load(Ordering::Acquire) {
            break;
        }
        let remaining = deadline.saturating_duration_since(Instant::now()).min(POLL_TICK);
        match transport.recv(remaining) {
            Ok(Some(recv_byte)) => captured.push(TimestampedByte {
                at: Instant::now(),
                byte: recv_byte.byte,
                tag: recv_byte.tag,
            }),
            Ok(None) => {}
            Err(e) => {
                log::warn!("capture aborted: {e}");
                break;
            }
        }
    }
    captured
}

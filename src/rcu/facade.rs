//! Public façade: the operations a host program invokes. Opens the
//! transport and registry, spawns the one worker thread that owns the
//! session, and exposes `run_once`/`run_forever`/`request_write`/
//! `get`/`get_bitfield`/`diagnostic_capture`.

use crate::rcu::error::RcuError;
use crate::rcu::registry::{DecodedValue, Registry};
use crate::rcu::session::{Session, SessionConfig};
use crate::rcu::store::{StoreKey, ValueStore};
use crate::rcu::transport::{SerialTransport, TransportPort};
use crate::rcu::worker::{self, CaptureRequest, PendingWriteRequest, SharedSlots, TimestampedByte};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Connection parameters for opening an [`Rcu`].
pub struct RcuConfig {
    pub port: String,
    pub baud: u32,
    pub registry: Arc<Registry>,
    pub session: SessionConfig,
}

impl RcuConfig {
    pub fn new(port: impl Into<String>, registry: Arc<Registry>) -> Self {
        Self {
            port: port.into(),
            baud: 19_200,
            registry,
            session: SessionConfig::default(),
        }
    }
}

/// Partial result returned by [`Rcu::run_once`] when the caller-supplied
/// deadline expired before collection completed: whatever the store has
/// accumulated so far, tagged as incomplete.
pub struct ReadResult {
    pub values: HashMap<StoreKey, DecodedValue>,
    pub complete: bool,
}

/// A handle to a running session: the worker thread, the shared store, and
/// the single-slot write/capture queues.
pub struct Rcu {
    store: Arc<ValueStore>,
    slots: Arc<SharedSlots>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    registry: Arc<Registry>,
}

impl Rcu {
    /// Opens the serial port, spawns the worker thread, and returns a handle.
    /// Transport-open failure propagates to the caller.
    pub fn open(config: RcuConfig) -> Result<Self, RcuError> {
        let transport = SerialTransport::open(&config.port, config.baud)?;
        Ok(Self::open_with_transport(
            Box::new(transport),
            config.registry,
            config.session,
        ))
    }

    /// Opens against an arbitrary [`TransportPort`] (used by tests and by
    /// any host embedding a non-serial transport).
    pub fn open_with_transport(
        transport: Box<dyn TransportPort>,
        registry: Arc<Registry>,
        session_config: SessionConfig,
    ) -> Self {
        let store = Arc::new(ValueStore::new());
        let slots = Arc::new(SharedSlots::default());
        let stop = Arc::new(AtomicBool::new(false));

        let session = Session::new(Arc::clone(&registry), session_config);
        let worker_store = Arc::clone(&store);
        let worker_slots = Arc::clone(&slots);
        let worker_stop = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            worker::run(transport, session, worker_store, worker_slots, worker_stop);
        });

        Self {
            store,
            slots,
            stop,
            worker: Some(handle),
            registry,
        }
    }

    /// Blocks until every index in `expected` has been observed or
    /// `timeout` elapses, then returns a coherent snapshot.
    pub fn run_once(&self, expected: &std::collections::HashSet<u8>, timeout: Duration) -> ReadResult {
        let deadline = Instant::now() + timeout;
        let complete = self.store.wait_for_collection(expected, deadline);
        ReadResult {
            values: self.store.snapshot(),
            complete,
        }
    }

    /// Runs until `stop_flag` is set (typically driven by the caller from
    /// another thread, e.g. on Ctrl-C), invoking `callback` for each
    /// decoded value in decode order.
    pub fn run_forever(&self, stop_flag: &AtomicBool, mut callback: impl FnMut(&StoreKey, &DecodedValue)) {
        let mut cursor = 0usize;
        while !stop_flag.load(Ordering::Acquire) {
            let (fresh, next_cursor) = self.store.entries_since(cursor);
            cursor = next_cursor;
            for (key, value) in &fresh {
                callback(key, value);
            }
            if fresh.is_empty() {
                self.store.wait_for_entry(cursor, Duration::from_millis(200));
            }
        }
    }

    /// Validates writability/range synchronously, then enqueues the write
    /// and blocks for its outcome.
    pub fn request_write(&self, index: u8, raw_value: i64) -> Result<(), RcuError> {
        let def = self
            .registry
            .definition(index)
            .ok_or(RcuError::NotWritable(index))?;
        if !def.writable {
            return Err(RcuError::NotWritable(index));
        }
        let (min, max) = def.effective_range();
        if raw_value < min || raw_value > max {
            return Err(RcuError::OutOfRange {
                index,
                value: raw_value,
                min,
                max,
            });
        }

        let (tx, rx) = mpsc::channel();
        let request = PendingWriteRequest {
            index,
            raw: raw_value as u32,
            width: def.size,
            completion: tx,
        };
        {
            let mut slot = self.slots.write.lock().unwrap();
            if slot.is_some() {
                return Err(RcuError::Config(format!(
                    "a write to parameter {index:#04x} is already pending"
                )));
            }
            *slot = Some(request);
        }
        rx.recv().unwrap_or(Err(RcuError::WriteTimeout(index)))
    }

    pub fn get(&self, index: u8) -> Option<DecodedValue> {
        self.store.get(index)
    }

    pub fn get_bitfield(&self, index: u8, name: &str) -> Option<DecodedValue> {
        self.store.get_bitfield(index, name)
    }

    /// The `UnknownParameter` annotation recorded for `index`, if its width
    /// had to be assumed rather than looked up.
    pub fn warning(&self, index: u8) -> Option<crate::rcu::error::UnknownParameterWarning> {
        self.store.warning(index)
    }

    /// Passes through the raw byte stream with timestamps for offline
    /// analysis, bypassing the Session entirely for `duration`.
    pub fn diagnostic_capture(&self, duration: Duration) -> Vec<TimestampedByte> {
        let (tx, rx) = mpsc::channel();
        {
            let mut slot = self.slots.capture.lock().unwrap();
            *slot = Some(CaptureRequest {
                duration,
                completion: tx,
            });
        }
        rx.recv_timeout(duration + Duration::from_secs(2))
            .unwrap_or_default()
    }

    /// Closes the transport (forcing the worker's `recv` to error out) and
    /// joins the worker thread cooperatively.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Rcu {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rcu::frame::checksum;
    use crate::rcu::transport::LoopbackTransport;
    use std::collections::HashSet;

    fn wire_s1() -> Vec<u8> {
        let packet = [0xC0, 0x00, 0x24, 0x05, 0x00, 0x01, 0xFE, 0x3A];
        let chk = checksum(&packet);
        let mut wire = packet.to_vec();
        wire.push(chk);
        wire
    }

    #[test]
    fn run_once_collects_a_single_temperature_reading() {
        let mut transport = LoopbackTransport::new();
        transport.push_address(0x00);
        transport.push_address(0x14);
        for b in wire_s1() {
            transport.push_data(b);
        }

        let registry = Arc::new(Registry::built_in());
        let rcu = Rcu::open_with_transport(
            Box::new(transport),
            registry,
            SessionConfig::default(),
        );

        let mut expected = HashSet::new();
        expected.insert(0x01);
        let result = rcu.run_once(&expected, Duration::from_secs(2));
        assert!(result.complete);
        match rcu.get(0x01) {
            Some(DecodedValue::Real(v, _)) => assert!((v - (-45.4)).abs() < 1e-9),
            other => panic!("unexpected: {other:?}"),
        }
        rcu.shutdown();
    }

    #[test]
    fn request_write_rejects_non_writable_parameter() {
        let transport = LoopbackTransport::new();
        let registry = Arc::new(Registry::built_in());
        let rcu = Rcu::open_with_transport(Box::new(transport), registry, SessionConfig::default());
        let err = rcu.request_write(0x01, 5).unwrap_err();
        assert!(matches!(err, RcuError::NotWritable(0x01)));
        rcu.shutdown();
    }

    #[test]
    fn request_write_rejects_out_of_range_value() {
        let transport = LoopbackTransport::new();
        let registry = Arc::new(Registry::built_in());
        let rcu = Rcu::open_with_transport(Box::new(transport), registry, SessionConfig::default());
        let err = rcu.request_write(0x0B, 100).unwrap_err();
        assert!(matches!(err, RcuError::OutOfRange { index: 0x0B, .. }));
        rcu.shutdown();
    }
}

//! In-memory value store: the last-observed decoded value per parameter
//! index (and per bitfield), plus the "collection complete" predicate used
//! to terminate a one-shot read.
//!
//! Backed by a `Mutex` + `Condvar` so a worker thread can hand decoded
//! state to a caller thread without the caller busy-polling for it.

use crate::rcu::error::UnknownParameterWarning;
use crate::rcu::registry::DecodedValue;
use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Key under which a decoded value is stored: either a whole parameter, or
/// one named subfield of a bitfield parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StoreKey {
    Index(u8),
    Bitfield(u8, String),
}

impl StoreKey {
    /// The parameter index this key belongs to, used by the
    /// collection-complete predicate regardless of whether the key is a
    /// plain index or one of its bitfields.
    pub fn index(&self) -> u8 {
        match self {
            StoreKey::Index(i) => *i,
            StoreKey::Bitfield(i, _) => *i,
        }
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    values: HashMap<StoreKey, DecodedValue>,
    observed: HashSet<u8>,
    warnings: HashMap<u8, UnknownParameterWarning>,
    /// Append-only log of every update, used by `run_forever` consumers to
    /// replay updates in decode order without missing any between polls.
    log: Vec<(StoreKey, DecodedValue)>,
}

/// Thread-safe key-value mapping from [`StoreKey`] to [`DecodedValue`].
/// Writes come from the session's worker thread; reads come from the
/// façade thread. Last write wins; deletion is unsupported.
#[derive(Debug, Default)]
pub struct ValueStore {
    inner: Mutex<StoreInner>,
    updated: Condvar,
}

impl ValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a newly decoded value, overwriting any prior value under the
    /// same key, and wakes anyone waiting on `wait_for_update`.
    pub fn record(&self, key: StoreKey, value: DecodedValue) {
        let mut inner = self.inner.lock().unwrap();
        let index = key.index();
        inner.observed.insert(index);
        inner.log.push((key.clone(), value.clone()));
        inner.values.insert(key, value);
        drop(inner);
        self.updated.notify_all();
    }

    /// Records a non-fatal `UnknownParameter` annotation alongside whatever
    /// raw value was stored for `index`.
    pub fn record_warning(&self, warning: UnknownParameterWarning) {
        let mut inner = self.inner.lock().unwrap();
        inner.warnings.insert(warning.index, warning);
    }

    pub fn get(&self, index: u8) -> Option<DecodedValue> {
        self.inner.lock().unwrap().values.get(&StoreKey::Index(index)).cloned()
    }

    pub fn get_bitfield(&self, index: u8, name: &str) -> Option<DecodedValue> {
        self.inner
            .lock()
            .unwrap()
            .values
            .get(&StoreKey::Bitfield(index, name.to_string()))
            .cloned()
    }

    pub fn warning(&self, index: u8) -> Option<UnknownParameterWarning> {
        self.inner.lock().unwrap().warnings.get(&index).cloned()
    }

    /// A coherent copy of the full store: no caller ever observes a
    /// multi-byte value mid-update, since the whole map is cloned under one
    /// lock acquisition.
    pub fn snapshot(&self) -> HashMap<StoreKey, DecodedValue> {
        self.inner.lock().unwrap().values.clone()
    }

    pub fn has_observed(&self, index: u8) -> bool {
        self.inner.lock().unwrap().observed.contains(&index)
    }

    /// True once every index in `expected` has been observed at least once.
    pub fn collection_complete(&self, expected: &HashSet<u8>) -> bool {
        let inner = self.inner.lock().unwrap();
        expected.iter().all(|idx| inner.observed.contains(idx))
    }

    /// Blocks until either `expected` is fully collected or `deadline`
    /// elapses, whichever comes first. Returns `true` if collection
    /// completed, `false` on timeout.
    pub fn wait_for_collection(&self, expected: &HashSet<u8>, deadline: Instant) -> bool {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if expected.iter().all(|idx| inner.observed.contains(idx)) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, timeout_result) = self
                .updated
                .wait_timeout(inner, deadline - now)
                .unwrap();
            inner = next;
            if timeout_result.timed_out()
                && !expected.iter().all(|idx| inner.observed.contains(idx))
            {
                return false;
            }
        }
    }

    /// Returns every log entry recorded after `cursor`, along with the new
    /// cursor position, for `run_forever`'s polling loop.
    pub fn entries_since(&self, cursor: usize) -> (Vec<(StoreKey, DecodedValue)>, usize) {
        let inner = self.inner.lock().unwrap();
        let fresh = inner.log[cursor.min(inner.log.len())..].to_vec();
        (fresh, inner.log.len())
    }

    /// Waits for at least one new log entry past `cursor`, up to `timeout`.
    pub fn wait_for_entry(&self, cursor: usize, timeout: Duration) {
        let inner = self.inner.lock().unwrap();
        if inner.log.len() > cursor {
            return;
        }
        let _ = self.updated.wait_timeout(inner, timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_write_wins() {
        let store = ValueStore::new();
        store.record(StoreKey::Index(0x01), DecodedValue::Integer(1));
        store.record(StoreKey::Index(0x01), DecodedValue::Integer(2));
        assert_eq!(store.get(0x01), Some(DecodedValue::Integer(2)));
    }

    #[test]
    fn collection_complete_requires_every_expected_index() {
        let store = ValueStore::new();
        let mut expected = HashSet::new();
        expected.insert(0x01);
        expected.insert(0x02);
        assert!(!store.collection_complete(&expected));
        store.record(StoreKey::Index(0x01), DecodedValue::Integer(1));
        assert!(!store.collection_complete(&expected));
        store.record(StoreKey::Index(0x02), DecodedValue::Integer(2));
        assert!(store.collection_complete(&expected));
    }

    #[test]
    fn bitfield_observation_counts_toward_parent_index() {
        let store = ValueStore::new();
        store.record(
            StoreKey::Bitfield(0x13, "Kompressor".into()),
            DecodedValue::Boolean(true),
        );
        assert!(store.has_observed(0x13));
        assert_eq!(
            store.get_bitfield(0x13, "Kompressor"),
            Some(DecodedValue::Boolean(true))
        );
    }

    #[test]
    fn wait_for_collection_times_out_with_partial_data() {
        let store = ValueStore::new();
        let mut expected = HashSet::new();
        expected.insert(0x01);
        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(!store.wait_for_collection(&expected, deadline));
    }
}

//! Receive counter tracking for replay protection.
//!
//! Counters are compared with serial number arithmetic so that wrapping
//! senders keep being accepted: a value is newer when it is ahead of the
//! last accepted one by less than half the counter space.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sid_storage::{get_json, put_json, KvStore, RecordKey};
use sid_wire::Address;
use tracing::{debug, warn};

use crate::LinkError;

const COUNTER_BITS: u32 = 31;
const LL_SEQN_BITS: u32 = 22;

/// Which protocol layer a counter belongs to
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterLayer {
    /// Link layer counter
    Link = 0,
    /// Application layer counter
    App = 1,
}

/// Counter pair carried by an inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RxSequence {
    /// Send counter
    pub counter: u32,
    /// Link sequence
    pub ll_seqn: u32,
}

fn serial_after(new: u32, last: u32, bits: u32) -> bool {
    let modulus_mask = (1u32 << bits) - 1;
    let delta = new.wrapping_sub(last) & modulus_mask;
    delta != 0 && delta < (1u32 << (bits - 1))
}

impl RxSequence {
    /// Whether `self` is strictly newer than `last`
    pub fn is_after(&self, last: &RxSequence) -> bool {
        if self.counter != last.counter {
            serial_after(self.counter, last.counter, COUNTER_BITS)
        } else {
            serial_after(self.ll_seqn, last.ll_seqn, LL_SEQN_BITS)
        }
    }
}

/// Last accepted counters per source and layer
pub struct ReplayGuard {
    last: HashMap<(Address, CounterLayer), RxSequence>,
    store: Arc<dyn KvStore>,
    time_window: Duration,
}

impl ReplayGuard {
    /// Create a guard persisting through `store`
    pub fn new(store: Arc<dyn KvStore>, time_window: Duration) -> Self {
        Self {
            last: HashMap::new(),
            store,
            time_window,
        }
    }

    fn record_key(src: &Address, layer: CounterLayer) -> RecordKey {
        let mut raw = Vec::with_capacity(src.size() + 2);
        raw.push(layer as u8);
        raw.push(src.kind as u8);
        raw.extend_from_slice(src.as_raw());
        RecordKey::RxCounter(raw)
    }

    fn last_accepted(
        &mut self,
        src: &Address,
        layer: CounterLayer,
    ) -> Result<Option<RxSequence>, LinkError> {
        if let Some(seq) = self.last.get(&(*src, layer)) {
            return Ok(Some(*seq));
        }

        let stored: Option<RxSequence> =
            get_json(self.store.as_ref(), &Self::record_key(src, layer))?;
        if let Some(seq) = stored {
            debug!("Restored receive counter {:?} for {:?}", seq, src.as_raw());
            self.last.insert((*src, layer), seq);
        }
        Ok(stored)
    }

    /// Fail with `ReplayDetected` unless `seq` is newer than the last accepted value
    pub fn check(
        &mut self,
        src: &Address,
        layer: CounterLayer,
        seq: RxSequence,
    ) -> Result<(), LinkError> {
        match self.last_accepted(src, layer)? {
            Some(last) if !seq.is_after(&last) => {
                warn!(
                    "Replay from {:?}: counter {} seqn {} not after {} {}",
                    src.as_raw(),
                    seq.counter,
                    seq.ll_seqn,
                    last.counter,
                    last.ll_seqn
                );
                Err(LinkError::ReplayDetected {
                    counter: seq.counter,
                    ll_seqn: seq.ll_seqn,
                })
            }
            _ => Ok(()),
        }
    }

    /// Record `seq` as the last accepted value, optionally persisting it
    pub fn accept(
        &mut self,
        src: &Address,
        layer: CounterLayer,
        seq: RxSequence,
        persist: bool,
    ) -> Result<(), LinkError> {
        self.last.insert((*src, layer), seq);
        if persist {
            put_json(self.store.as_ref(), &Self::record_key(src, layer), &seq)?;
        }
        Ok(())
    }

    /// Fail with `ReplayDetected` when a timestamp is outside the accepted window
    pub fn check_time(&self, sent_secs: u32, now_secs: u32) -> Result<(), LinkError> {
        let skew = (now_secs as i64 - sent_secs as i64).unsigned_abs();
        if skew > self.time_window.as_secs() {
            warn!("Stale frame: sent at {}, now {}", sent_secs, now_secs);
            return Err(LinkError::ReplayDetected {
                counter: sent_secs,
                ll_seqn: 0,
            });
        }
        Ok(())
    }

    /// Forget all in-memory state
    pub fn reset(&mut self) {
        self.last.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sid_storage::MemoryStore;
    use sid_wire::AddressType;

    fn src() -> Address {
        Address::new(AddressType::Cloud, &[0x01]).unwrap()
    }

    fn seq(counter: u32, ll_seqn: u32) -> RxSequence {
        RxSequence { counter, ll_seqn }
    }

    #[test]
    fn test_serial_ordering() {
        assert!(seq(2, 0).is_after(&seq(1, 9)));
        assert!(!seq(1, 9).is_after(&seq(2, 0)));
        assert!(seq(1, 10).is_after(&seq(1, 9)));
        assert!(!seq(1, 9).is_after(&seq(1, 9)));

        // wrapped senders
        assert!(seq(0, 0).is_after(&seq(0x7FFF_FFFF, 0)));
        assert!(seq(5, 0).is_after(&seq(5, 0x3F_FFFF)));
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut guard = ReplayGuard::new(Arc::new(MemoryStore::new()), Duration::from_secs(60));
        let addr = src();

        guard.check(&addr, CounterLayer::Link, seq(3, 0)).unwrap();
        guard.accept(&addr, CounterLayer::Link, seq(3, 0), false).unwrap();

        assert!(matches!(
            guard.check(&addr, CounterLayer::Link, seq(3, 0)),
            Err(LinkError::ReplayDetected { counter: 3, .. })
        ));
        // layers are tracked separately
        guard.check(&addr, CounterLayer::App, seq(3, 0)).unwrap();
        guard.check(&addr, CounterLayer::Link, seq(4, 0)).unwrap();
    }

    #[test]
    fn test_persisted_counter_survives_reset() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let mut guard = ReplayGuard::new(store.clone(), Duration::from_secs(60));
        let addr = src();

        guard.accept(&addr, CounterLayer::Link, seq(10, 2), true).unwrap();
        guard.reset();

        assert!(guard.check(&addr, CounterLayer::Link, seq(10, 2)).is_err());

        let mut fresh = ReplayGuard::new(store, Duration::from_secs(60));
        assert!(fresh.check(&addr, CounterLayer::Link, seq(9, 0)).is_err());
        fresh.check(&addr, CounterLayer::Link, seq(11, 0)).unwrap();
    }

    #[test]
    fn test_time_window() {
        let guard = ReplayGuard::new(Arc::new(MemoryStore::new()), Duration::from_secs(60));
        guard.check_time(1_000, 1_030).unwrap();
        guard.check_time(1_030, 1_000).unwrap();
        assert!(guard.check_time(1_000, 1_061).is_err());
    }
}

//! Time-ordered unique transaction id generation.
//!
//! A transaction id packs `[40 bits wall-clock ms | 9 bits counter | 15
//! bits initiator]`: milliseconds since a fixed epoch base, a same-
//! millisecond counter, and the initiator id in the low bits. Comparing two
//! ids therefore orders them by creation time with the initiator as the
//! final tie-break, a strict total order across every initiator in the
//! cluster, which is exactly what the ordering queue relies on.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::{NodeId, TxnId};

/// 2020-01-01T00:00:00Z in unix milliseconds. 40 bits of ms on top of this
/// base lasts until roughly 2054.
const EPOCH_BASE_MS: u64 = 1_577_836_800_000;

const TIMESTAMP_BITS: u32 = 40;
const COUNTER_BITS: u32 = 9;
const INITIATOR_BITS: u32 = 15;

const COUNTER_MAX: u64 = (1 << COUNTER_BITS) - 1;

/// Largest initiator id representable in a transaction id.
pub const MAX_INITIATOR_ID: NodeId = (1 << INITIATOR_BITS) - 1;

/// Extract the initiator id embedded in a transaction id.
#[inline]
pub fn initiator_of(txn_id: TxnId) -> NodeId {
    (txn_id & u64::from(MAX_INITIATOR_ID)) as NodeId
}

/// Extract the creation time (unix milliseconds) embedded in a transaction id.
#[inline]
pub fn time_of(txn_id: TxnId) -> u64 {
    (txn_id >> (COUNTER_BITS + INITIATOR_BITS)) + EPOCH_BASE_MS
}

#[inline]
fn make_id(ts_ms: u64, counter: u64, initiator: NodeId) -> TxnId {
    debug_assert!(ts_ms < (1 << TIMESTAMP_BITS));
    debug_assert!(counter <= COUNTER_MAX);
    (ts_ms << (COUNTER_BITS + INITIATOR_BITS))
        | (counter << INITIATOR_BITS)
        | u64::from(initiator)
}

/// Per-node generator of strictly increasing transaction ids.
///
/// Not thread safe; owned by the engine thread like all protocol state.
pub struct TxnIdSource {
    initiator: NodeId,
    last_ts_ms: u64,
    counter: u64,
}

impl TxnIdSource {
    /// # Panics
    ///
    /// Panics if `initiator` does not fit in the id's initiator field.
    pub fn new(initiator: NodeId) -> Self {
        assert!(
            initiator <= MAX_INITIATOR_ID,
            "initiator id {} exceeds {} and cannot be embedded in txn ids",
            initiator,
            MAX_INITIATOR_ID
        );
        TxnIdSource {
            initiator,
            last_ts_ms: 0,
            counter: 0,
        }
    }

    /// Produce the next id. Strictly greater than every id previously
    /// returned by this source; a wall clock that stands still or runs
    /// backwards is absorbed by the counter field.
    pub fn next_id(&mut self) -> TxnId {
        let mut now = Self::wall_ms();
        if now <= self.last_ts_ms {
            // Clock stalled or regressed: stay on the last timestamp and
            // burn counter slots instead.
            now = self.last_ts_ms;
            self.counter += 1;
            if self.counter > COUNTER_MAX {
                // Counter exhausted within one millisecond; wait the clock out.
                while Self::wall_ms() <= self.last_ts_ms {
                    std::thread::yield_now();
                }
                now = Self::wall_ms();
                self.counter = 0;
            }
        } else {
            self.counter = 0;
        }
        self.last_ts_ms = now;
        make_id(now, self.counter, self.initiator)
    }

    fn wall_ms() -> u64 {
        let unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        unix_ms.saturating_sub(EPOCH_BASE_MS)
    }
}

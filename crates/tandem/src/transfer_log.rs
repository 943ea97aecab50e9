use std::sync::atomic::{AtomicU64, Ordering};

use spin::RwLock;
use tandem_utils::proto_violation;
use tracing::error;

use crate::request::ReqHandle;

/// Slot encoding in one atomic word: requests carry their handle bits with
/// the tag bit set, so `dependence` can empty a slot under the read lock
/// (a monotone transition racing only readers).
const SLOT_EMPTY: u64 = 0;
const SLOT_BARRIER: u64 = 1;
const SLOT_REQ_TAG: u64 = 1 << 63;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Slot {
    Empty,
    Barrier,
    Req(ReqHandle),
}

impl Slot {
    fn decode(bits: u64) -> Self {
        match bits {
            SLOT_EMPTY => Slot::Empty,
            SLOT_BARRIER => Slot::Barrier,
            _ => Slot::Req(ReqHandle::from_id_bits(bits & !SLOT_REQ_TAG)),
        }
    }

    fn encode(self) -> u64 {
        match self {
            Slot::Empty => SLOT_EMPTY,
            Slot::Barrier => SLOT_BARRIER,
            Slot::Req(h) => h.block_id() | SLOT_REQ_TAG,
        }
    }
}

struct Ring {
    slots: Vec<AtomicU64>,
    /// Oldest un-acked entry.
    begin: usize,
    /// Next free slot.
    end: usize,
    /// Ordinal handed to the next barrier appended.
    nr_issue: u32,
    /// Ordinal of the last epoch the peer acknowledged.
    nr_done: u32,
}

impl Ring {
    #[inline]
    fn advance(&self, i: usize) -> usize {
        (i + 1) % self.slots.len()
    }

    #[inline]
    fn retreat(&self, i: usize) -> usize {
        (i + self.slots.len() - 1) % self.slots.len()
    }

    #[inline]
    fn get(&self, i: usize) -> Slot {
        Slot::decode(self.slots[i].load(Ordering::Acquire))
    }

    #[inline]
    fn set(&self, i: usize, s: Slot) {
        self.slots[i].store(s.encode(), Ordering::Release);
    }
}

/// Outcome of releasing one epoch.
pub(crate) struct ReleasedEpoch {
    /// Live request handles popped from the epoch, in log order.
    pub reqs: Vec<ReqHandle>,
    /// Entries the epoch spanned, emptied slots included; compared against
    /// the peer-reported set size.
    pub popped: u32,
}

/// Ordered ring of in-flight writes, partitioned into epochs by barrier
/// markers. Mutators take the write lock; `dependence` runs from completion
/// context under the read lock.
pub(crate) struct TransferLog {
    ring: RwLock<Ring>,
}

impl TransferLog {
    pub fn new(size: usize) -> Self {
        let mut slots = Vec::with_capacity(size.max(4));
        slots.resize_with(size.max(4), || AtomicU64::new(SLOT_EMPTY));
        Self {
            ring: RwLock::new(Ring { slots, begin: 0, end: 0, nr_issue: 1, nr_done: 0 }),
        }
    }

    /// Append a write at the tail. The caller bounds submissions via the
    /// in-flight counters; running the ring full is a critical condition,
    /// not a recoverable one.
    pub fn add(&self, h: ReqHandle) {
        let mut ring = self.ring.write();
        let end = ring.end;
        ring.set(end, Slot::Req(h));
        ring.end = ring.advance(end);
        if ring.end == ring.begin {
            error!("transfer log ring is full; submissions were not bounded");
        }
    }

    /// Append a barrier marker and hand out its ordinal.
    ///
    /// Must be called with the data-channel send mutex held so the in-log
    /// order matches the on-wire order.
    pub fn add_barrier(&self) -> u32 {
        let mut ring = self.ring.write();
        let end = ring.end;
        ring.set(end, Slot::Barrier);
        ring.end = ring.advance(end);
        if ring.end == ring.begin {
            error!("transfer log ring is full; submissions were not bounded");
        }
        let nr = ring.nr_issue;
        ring.nr_issue += 1;
        nr
    }

    /// Pop the oldest epoch for `BarrierAck { barrier_nr, set_size }`.
    /// Ordinal or size mismatches are protocol errors: logged, state kept
    /// live, never silently repaired.
    pub fn release(&self, barrier_nr: u32, set_size: u32) -> ReleasedEpoch {
        let mut ring = self.ring.write();
        let mut reqs = Vec::new();
        let mut popped = 0u32;

        loop {
            if ring.begin == ring.end {
                proto_violation!("barrier ack {barrier_nr} but the transfer log holds no epoch");
                break;
            }
            let begin = ring.begin;
            let slot = ring.get(begin);
            ring.set(begin, Slot::Empty);
            ring.begin = ring.advance(begin);
            match slot {
                Slot::Barrier => break,
                Slot::Req(h) => {
                    reqs.push(h);
                    popped += 1;
                }
                Slot::Empty => popped += 1,
            }
        }

        if ring.nr_done + 1 != barrier_nr {
            proto_violation!(
                "barrier acks must arrive in order: done {} got {barrier_nr}",
                ring.nr_done
            );
        }
        ring.nr_done = barrier_nr;
        if popped != set_size {
            proto_violation!(
                "epoch {barrier_nr} popped {popped} entries but the peer reported {set_size}"
            );
        }

        ReleasedEpoch { reqs, popped }
    }

    /// Walk back from the tail, stopping at the first barrier (or the ring
    /// head): true iff `h` sits in the still-open epoch. On a hit the slot
    /// is emptied so its completion is never re-signalled by a later pop.
    pub fn dependence(&self, h: ReqHandle) -> bool {
        let ring = self.ring.read();
        let mut i = ring.end;
        while i != ring.begin {
            i = ring.retreat(i);
            match ring.get(i) {
                Slot::Barrier => return false,
                Slot::Req(found) if found == h => {
                    ring.set(i, Slot::Empty);
                    return true;
                }
                _ => {}
            }
        }
        false
    }

    /// Disconnect cleanup: hand every live request back to the caller (which
    /// dirties the bitmap and fails the network halves) and reinitialise the
    /// ring. Barrier ordinals restart with the next connection.
    pub fn clear(&self) -> Vec<ReqHandle> {
        let mut ring = self.ring.write();
        let mut out = Vec::new();
        let mut i = ring.begin;
        while i != ring.end {
            if let Slot::Req(h) = ring.get(i) {
                out.push(h);
            }
            ring.set(i, Slot::Empty);
            i = ring.advance(i);
        }
        ring.begin = 0;
        ring.end = 0;
        for s in &ring.slots {
            s.store(SLOT_EMPTY, Ordering::Release);
        }
        ring.nr_issue = 1;
        ring.nr_done = 0;
        out
    }

    pub fn nr_done(&self) -> u32 {
        self.ring.read().nr_done
    }

    pub fn nr_issue(&self) -> u32 {
        self.ring.read().nr_issue
    }

    /// Live entries currently in the ring, barriers excluded.
    pub fn live_requests(&self) -> usize {
        let ring = self.ring.read();
        let mut i = ring.begin;
        let mut n = 0;
        while i != ring.end {
            if matches!(ring.get(i), Slot::Req(_)) {
                n += 1;
            }
            i = ring.advance(i);
        }
        n
    }
}

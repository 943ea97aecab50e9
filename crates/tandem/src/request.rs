use std::{any::Any, sync::Arc, time::Instant};

use tandem_sync::BlockState;
use tandem_utils::{safe_assert, safe_panic};
use tandem_wire::ID_SYNCER;

use crate::{error::IoError, worker::WorkItem};

/// 512-byte sectors, the unit the upper layer addresses us in.
pub const SECTOR_SHIFT: u32 = 9;

bitflags::bitflags! {
    /// Per-request state bits. Local and network halves advance
    /// independently; the only mutator is [`Core::req_mod`] under the core
    /// lock.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RqState: u32 {
        const LOCAL_PENDING   = 1 << 0;
        const LOCAL_COMPLETED = 1 << 1;
        const LOCAL_OK        = 1 << 2;
        const LOCAL_ABORTED   = 1 << 3;
        const IN_ACT_LOG      = 1 << 4;

        const NET_PENDING     = 1 << 5;
        const NET_QUEUED      = 1 << 6;
        const NET_SENT        = 1 << 7;
        const NET_OK          = 1 << 8;
        const NET_DONE        = 1 << 9;
        /// Set-in-sync: a peer ack that additionally clears bitmap bits.
        const NET_SIS         = 1 << 10;
        const EXP_RECEIVE_ACK = 1 << 11;
        const EXP_WRITE_ACK   = 1 << 12;
        const POSTPONED       = 1 << 13;

        const WRITE           = 1 << 14;
    }
}

impl RqState {
    /// Whether the request has a network half at all.
    pub const NET_MASK: RqState = Self::NET_PENDING
        .union(Self::NET_QUEUED)
        .union(Self::NET_SENT)
        .union(Self::NET_OK)
        .union(Self::NET_DONE);

    pub const EXP_ACK_MASK: RqState = Self::EXP_RECEIVE_ACK.union(Self::EXP_WRITE_ACK);
}

/// Exhaustive event set fed into the state mutator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReqEvent {
    // Submission.
    ToBeSent,
    ToBeSubmitted,
    QueueForNetRead,
    QueueForNetWrite,
    QueueForSendOos,
    // Sender-side.
    SendCanceled,
    SendFailed,
    HandedOverToNetwork,
    OosHandedToNetwork,
    ReadRetryRemoteCanceled,
    // Local endio.
    CompletedOk,
    WriteCompletedWithError,
    ReadCompletedWithError,
    ReadAheadCompletedWithError,
    AbortDiskIo,
    // Peer acks.
    WriteAckedByPeer,
    WriteAckedByPeerAndSis,
    RecvAckedByPeer,
    NegAcked,
    PostponeWrite,
    DiscardWrite,
    DataReceived,
    BarrierAcked,
    // Connection events.
    ConnectionLostWhilePending,
    Resend,
    FailFrozenDiskIo,
    RestartFrozenDiskIo,
}

pub type WriteDone = Box<dyn FnOnce(Result<(), IoError>) + Send>;
pub type ReadDone = Box<dyn FnOnce(Result<Vec<u8>, IoError>) + Send>;

/// The upper layer's stake in a request: its completion callback.
pub enum MasterIo {
    Write(WriteDone),
    Read(ReadDone),
}

/// A postponed request packaged for re-submission.
pub struct RetryIo {
    pub sector: u64,
    pub size: u32,
    pub payload: Option<Arc<Vec<u8>>>,
    pub master: MasterIo,
}

/// Work the state mutator wants done after the core lock drops.
pub(crate) enum Signal {
    WriteDone(WriteDone, Result<(), IoError>),
    ReadDone(ReadDone, Result<Vec<u8>, IoError>),
    Retry(RetryIo),
    /// Re-submit the local half of a thawed request.
    Resubmit(ReqHandle),
    /// A conflicting submitter is parked on the conflict condvar.
    WakeMisc,
}

pub(crate) struct Request {
    pub sector: u64,
    pub size: u32,
    pub rq_state: RqState,
    pub epoch: u32,
    pub start_time: Instant,
    pub master: Option<MasterIo>,
    /// Write payload, shared with the wire and the local target.
    pub payload: Option<Arc<Vec<u8>>>,
    /// Bytes received for a remote read, staged before `DataReceived`.
    pub read_data: Option<Vec<u8>>,
    pub local_error: Option<IoError>,
    /// Still installed in the transfer-log ring.
    pub in_tl: bool,
    pub al_ref: Option<Box<dyn Any + Send>>,
}

impl Request {
    pub fn is_write(&self) -> bool {
        self.rq_state.contains(RqState::WRITE)
    }

    pub fn byte_offset(&self) -> u64 {
        self.sector << SECTOR_SHIFT
    }
}

/// Index + generation into the request arena. The generation guards against
/// a peer ack resolving to a recycled slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ReqHandle {
    idx: u32,
    r#gen: u32,
}

impl ReqHandle {
    /// Wire identity of this request. The generation stays below 2^31 so
    /// the top bit remains free to flag read traffic.
    pub fn block_id(self) -> u64 {
        ((self.r#gen as u64) << 32) | self.idx as u64
    }

    /// Inverse of `block_id`, for identities stored in the transfer-log
    /// ring and echoed by the peer.
    pub(crate) fn from_id_bits(id: u64) -> Self {
        Self { idx: id as u32, r#gen: (id >> 32) as u32 }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(n: usize) -> Self {
        Self { idx: n as u32, r#gen: 0 }
    }
}

struct Slot {
    r#gen: u32,
    req: Option<Request>,
}

/// Slab of requests owned by the device; everything else holds indices.
/// The arena outlives every handle, which is what breaks the
/// request -> device ownership cycle.
pub(crate) struct ReqArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    cap: usize,
}

impl ReqArena {
    pub fn with_capacity(cap: usize) -> Self {
        Self { slots: Vec::new(), free: Vec::new(), live: 0, cap }
    }

    /// Install a request; hands it back on arena exhaustion so the caller
    /// can fail the upper layer with a shortage error.
    pub fn alloc(&mut self, req: Request) -> Result<ReqHandle, Request> {
        if self.live >= self.cap {
            return Err(req);
        }
        self.live += 1;
        if let Some(idx) = self.free.pop() {
            let slot = &mut self.slots[idx as usize];
            slot.req = Some(req);
            return Ok(ReqHandle { idx, r#gen: slot.r#gen });
        }
        let idx = self.slots.len() as u32;
        self.slots.push(Slot { r#gen: 0, req: Some(req) });
        Ok(ReqHandle { idx, r#gen: 0 })
    }

    fn slot(&self, h: ReqHandle) -> Option<&Slot> {
        self.slots.get(h.idx as usize).filter(|s| s.r#gen == h.r#gen)
    }

    pub fn get(&self, h: ReqHandle) -> Option<&Request> {
        self.slot(h).and_then(|s| s.req.as_ref())
    }

    pub fn get_mut(&mut self, h: ReqHandle) -> Option<&mut Request> {
        self.slots.get_mut(h.idx as usize).filter(|s| s.r#gen == h.r#gen).and_then(|s| s.req.as_mut())
    }

    /// Detach the request for a locked transition; pair with `put_back` or
    /// `release_slot`.
    fn take(&mut self, h: ReqHandle) -> Option<Request> {
        self.slots.get_mut(h.idx as usize).filter(|s| s.r#gen == h.r#gen).and_then(|s| s.req.take())
    }

    fn put_back(&mut self, h: ReqHandle, req: Request) {
        self.slots[h.idx as usize].req = Some(req);
    }

    fn release_slot(&mut self, h: ReqHandle) {
        let slot = &mut self.slots[h.idx as usize];
        debug_assert!(slot.req.is_none());
        slot.r#gen = (slot.r#gen + 1) & 0x7fff_ffff;
        self.free.push(h.idx);
        self.live -= 1;
    }

    pub fn from_block_id(&self, block_id: u64) -> Option<ReqHandle> {
        if block_id == ID_SYNCER {
            return None;
        }
        let h = ReqHandle { idx: block_id as u32, r#gen: (block_id >> 32) as u32 };
        self.get(h).map(|_| h)
    }

    pub fn live(&self) -> usize {
        self.live
    }

    pub fn handles(&self) -> Vec<ReqHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.req.is_some())
            .map(|(i, s)| ReqHandle { idx: i as u32, r#gen: s.r#gen })
            .collect()
    }
}

use crate::device::Core;

impl Core {
    /// Account a transition out of `NET_PENDING`: exactly one peer-pending
    /// decrement, and the in-flight byte count for writes.
    fn dec_net_pending(&mut self, req: &Request) {
        safe_assert!(self.ap_pending > 0);
        self.ap_pending = self.ap_pending.saturating_sub(1);
        if req.is_write() {
            self.ap_in_flight = self.ap_in_flight.saturating_sub(req.size as u64);
        }
    }

    /// The only mutator of `rq_state`. Holds the core lock (the caller
    /// does); every transition is atomic with respect to every other.
    /// Returned signals must be fired after the lock drops.
    pub(crate) fn req_mod(&mut self, h: ReqHandle, event: ReqEvent) -> Vec<Signal> {
        let mut sigs = Vec::new();
        self.req_mod_into(h, event, &mut sigs);
        sigs
    }

    pub(crate) fn req_mod_into(&mut self, h: ReqHandle, event: ReqEvent, sigs: &mut Vec<Signal>) {
        let Some(mut req) = self.arena.take(h) else {
            safe_panic!("state event {event:?} for a dead request handle");
            return;
        };

        let mut check_completion = true;
        match event {
            ReqEvent::ToBeSent => {
                safe_assert!(!req.rq_state.contains(RqState::NET_PENDING));
                req.rq_state.insert(RqState::NET_PENDING);
                if req.is_write() {
                    match self.protocol {
                        crate::config::Protocol::C => req.rq_state.insert(RqState::EXP_WRITE_ACK),
                        crate::config::Protocol::B => req.rq_state.insert(RqState::EXP_RECEIVE_ACK),
                        crate::config::Protocol::A => {}
                    }
                    self.ap_in_flight += req.size as u64;
                }
                self.ap_pending += 1;
                check_completion = false;
            }
            ReqEvent::ToBeSubmitted => {
                req.rq_state.insert(RqState::LOCAL_PENDING);
                self.local_cnt += 1;
                check_completion = false;
            }
            ReqEvent::QueueForNetRead | ReqEvent::QueueForNetWrite | ReqEvent::QueueForSendOos => {
                req.rq_state.insert(RqState::NET_QUEUED);
                check_completion = false;
            }

            ReqEvent::SendCanceled | ReqEvent::SendFailed => {
                if req.rq_state.contains(RqState::NET_PENDING) {
                    self.dec_net_pending(&req);
                }
                req.rq_state.remove(RqState::NET_QUEUED | RqState::NET_PENDING);
                req.rq_state.insert(RqState::NET_DONE);
            }
            ReqEvent::HandedOverToNetwork => {
                req.rq_state.remove(RqState::NET_QUEUED);
                req.rq_state.insert(RqState::NET_SENT);
                if req.is_write() && !req.rq_state.intersects(RqState::EXP_ACK_MASK) {
                    // Protocol A: handing the bytes to the stack is all the
                    // acknowledgement there will be before the barrier.
                    if req.rq_state.contains(RqState::NET_PENDING) {
                        self.dec_net_pending(&req);
                    }
                    req.rq_state.remove(RqState::NET_PENDING);
                    req.rq_state.insert(RqState::NET_OK);
                }
            }
            ReqEvent::OosHandedToNetwork => {
                req.rq_state.remove(RqState::NET_QUEUED);
                req.rq_state.insert(RqState::NET_DONE);
            }
            ReqEvent::ReadRetryRemoteCanceled => {
                if req.rq_state.contains(RqState::NET_PENDING) {
                    self.dec_net_pending(&req);
                }
                req.rq_state.remove(RqState::NET_QUEUED | RqState::NET_PENDING);
                req.rq_state.insert(RqState::NET_DONE);
            }

            ReqEvent::CompletedOk => {
                req.rq_state.remove(RqState::LOCAL_PENDING);
                req.rq_state.insert(RqState::LOCAL_COMPLETED | RqState::LOCAL_OK);
                self.local_cnt = self.local_cnt.saturating_sub(1);
            }
            ReqEvent::WriteCompletedWithError | ReqEvent::ReadAheadCompletedWithError => {
                req.rq_state.remove(RqState::LOCAL_PENDING);
                req.rq_state.insert(RqState::LOCAL_COMPLETED);
                req.local_error = Some(IoError::LocalDisk);
                self.local_cnt = self.local_cnt.saturating_sub(1);
                self.chk_io_error(&req);
            }
            ReqEvent::ReadCompletedWithError => {
                req.rq_state.remove(RqState::LOCAL_PENDING);
                req.rq_state.insert(RqState::LOCAL_COMPLETED);
                req.local_error = Some(IoError::LocalDisk);
                self.local_cnt = self.local_cnt.saturating_sub(1);
                self.chk_io_error(&req);
                if self.peer_usable() && !req.rq_state.intersects(RqState::NET_MASK) {
                    // Retry the read remotely instead of failing upward.
                    req.rq_state.insert(RqState::NET_PENDING | RqState::NET_QUEUED);
                    self.ap_pending += 1;
                    let _ = self.work_tx.send(WorkItem::SendReadReq(h));
                    check_completion = false;
                }
            }
            ReqEvent::AbortDiskIo => {
                req.rq_state.insert(RqState::LOCAL_ABORTED);
            }

            ReqEvent::WriteAckedByPeer | ReqEvent::WriteAckedByPeerAndSis => {
                if !req.rq_state.contains(RqState::EXP_WRITE_ACK) {
                    tandem_utils::proto_violation!(
                        "write ack for request at sector {} without EXP_WRITE_ACK",
                        req.sector
                    );
                }
                if event == ReqEvent::WriteAckedByPeerAndSis {
                    req.rq_state.insert(RqState::NET_SIS);
                }
                if req.rq_state.contains(RqState::NET_PENDING) {
                    self.dec_net_pending(&req);
                }
                req.rq_state.remove(RqState::NET_PENDING);
                req.rq_state.insert(RqState::NET_OK);
            }
            ReqEvent::RecvAckedByPeer => {
                if !req.rq_state.contains(RqState::EXP_RECEIVE_ACK) {
                    tandem_utils::proto_violation!(
                        "receive ack for request at sector {} without EXP_RECEIVE_ACK",
                        req.sector
                    );
                }
                if req.rq_state.contains(RqState::NET_PENDING) {
                    self.dec_net_pending(&req);
                }
                req.rq_state.remove(RqState::NET_PENDING);
                req.rq_state.insert(RqState::NET_OK);
            }
            ReqEvent::NegAcked => {
                if req.rq_state.contains(RqState::NET_PENDING) {
                    self.dec_net_pending(&req);
                }
                req.rq_state.remove(RqState::NET_OK | RqState::NET_PENDING);
                req.rq_state.insert(RqState::NET_DONE);
                if !req.is_write() &&
                    self.has_disk &&
                    !self.disk_failed &&
                    !req.rq_state
                        .intersects(RqState::LOCAL_PENDING | RqState::LOCAL_COMPLETED)
                {
                    // The peer could not serve the read; fall back to the
                    // untouched local replica.
                    req.rq_state.insert(RqState::LOCAL_PENDING);
                    self.local_cnt += 1;
                    sigs.push(Signal::Resubmit(h));
                    check_completion = false;
                }
            }
            ReqEvent::PostponeWrite => {
                req.rq_state.insert(RqState::POSTPONED);
            }
            ReqEvent::DiscardWrite => {
                // Our write lost a concurrent-write race; the peer's data
                // supersedes it and the outcome is success.
                if req.rq_state.contains(RqState::NET_PENDING) {
                    self.dec_net_pending(&req);
                }
                req.rq_state.remove(RqState::NET_PENDING);
                req.rq_state.insert(RqState::NET_OK | RqState::NET_DONE);
            }
            ReqEvent::DataReceived => {
                if req.rq_state.contains(RqState::NET_PENDING) {
                    self.dec_net_pending(&req);
                }
                req.rq_state.remove(RqState::NET_PENDING);
                req.rq_state.insert(RqState::NET_OK | RqState::NET_DONE);
            }
            ReqEvent::BarrierAcked => {
                if !req.is_write() {
                    tandem_utils::proto_violation!("barrier ack popped a non-write request");
                }
                if req.rq_state.contains(RqState::NET_PENDING) {
                    tandem_utils::proto_violation!(
                        "write at sector {} still NET_PENDING at barrier ack",
                        req.sector
                    );
                    self.dec_net_pending(&req);
                    req.rq_state.remove(RqState::NET_PENDING);
                }
                req.rq_state.insert(RqState::NET_DONE);
            }

            ReqEvent::ConnectionLostWhilePending => {
                if req.rq_state.contains(RqState::NET_PENDING) {
                    self.dec_net_pending(&req);
                }
                req.rq_state
                    .remove(RqState::NET_OK | RqState::NET_PENDING | RqState::NET_QUEUED);
                req.rq_state.insert(RqState::NET_DONE);
                // No suspension gate on this event: completion proceeds even
                // on a suspended device.
            }
            ReqEvent::Resend => {
                if req.rq_state.contains(RqState::NET_OK) {
                    // The data made it and was acked before the loss; only
                    // the barrier ack is missing. Pretend it arrived.
                    if req.rq_state.contains(RqState::NET_PENDING) {
                        self.dec_net_pending(&req);
                        req.rq_state.remove(RqState::NET_PENDING);
                    }
                    req.rq_state.insert(RqState::NET_DONE);
                } else {
                    if !req.rq_state.contains(RqState::NET_PENDING) {
                        self.ap_pending += 1;
                        if req.is_write() {
                            self.ap_in_flight += req.size as u64;
                        }
                    }
                    req.rq_state.remove(RqState::NET_SENT | RqState::NET_DONE);
                    req.rq_state.insert(RqState::NET_QUEUED | RqState::NET_PENDING);
                    if req.is_write() {
                        let _ = self.work_tx.send(WorkItem::SendDBlock(h));
                    } else {
                        let _ = self.work_tx.send(WorkItem::SendReadReq(h));
                    }
                    check_completion = false;
                }
            }
            ReqEvent::FailFrozenDiskIo => {
                if req.rq_state.contains(RqState::LOCAL_PENDING) {
                    self.local_cnt = self.local_cnt.saturating_sub(1);
                }
                req.rq_state.remove(RqState::LOCAL_PENDING | RqState::POSTPONED);
                req.rq_state.insert(RqState::LOCAL_COMPLETED);
                req.local_error = Some(IoError::LocalDisk);
            }
            ReqEvent::RestartFrozenDiskIo => {
                req.rq_state.remove(RqState::POSTPONED | RqState::LOCAL_COMPLETED);
                req.rq_state.insert(RqState::LOCAL_PENDING);
                self.local_cnt += 1;
                sigs.push(Signal::Resubmit(h));
                check_completion = false;
            }
        }

        safe_assert!(
            !req.rq_state.contains(RqState::NET_PENDING | RqState::NET_DONE),
            "NET_PENDING and NET_DONE are mutually exclusive"
        );

        let freed = if check_completion {
            self.req_may_be_completed(&mut req, h, sigs)
        } else {
            false
        };

        if freed {
            self.arena.release_slot(h);
        } else {
            self.arena.put_back(h, req);
        }
    }

    /// Evaluate whether the upper layer can be signalled, then whether the
    /// request can leave the transfer log and be freed. Returns true when
    /// the slot is to be released.
    fn req_may_be_completed(
        &mut self,
        req: &mut Request,
        h: ReqHandle,
        sigs: &mut Vec<Signal>,
    ) -> bool {
        let s = req.rq_state;
        if (s.contains(RqState::LOCAL_PENDING) && !s.contains(RqState::LOCAL_ABORTED)) ||
            s.intersects(RqState::NET_QUEUED | RqState::NET_PENDING)
        {
            return false;
        }

        if req.master.is_some() || s.contains(RqState::POSTPONED) {
            let ok = s.intersects(RqState::LOCAL_OK | RqState::NET_OK);

            // Leave the conflict trees before anyone is woken.
            let waiting = if req.is_write() {
                self.write_requests.remove(h)
            } else {
                self.read_requests.remove(h)
            };
            if waiting {
                sigs.push(Signal::WakeMisc);
            }

            if req.is_write() && req.epoch == self.current_epoch_nr {
                self.maybe_start_new_epoch();
            }

            if let Some(master) = req.master.take() {
                if s.contains(RqState::POSTPONED) {
                    sigs.push(Signal::Retry(RetryIo {
                        sector: req.sector,
                        size: req.size,
                        payload: req.payload.clone(),
                        master,
                    }));
                } else {
                    // The error, when there is one, comes from the private
                    // local bio if it failed, else from the network half.
                    let err = if ok {
                        None
                    } else {
                        Some(req.local_error.unwrap_or(IoError::PeerLost))
                    };
                    match master {
                        MasterIo::Write(done) => {
                            sigs.push(Signal::WriteDone(done, err.map_or(Ok(()), Err)));
                        }
                        MasterIo::Read(done) => {
                            let res = match err {
                                Some(e) => Err(e),
                                None => Ok(req.read_data.take().unwrap_or_default()),
                            };
                            sigs.push(Signal::ReadDone(done, res));
                        }
                    }
                }
            }
        }

        self.req_may_be_done(req, h)
    }

    /// Second stage: once the master signal is out, the request may leave
    /// the transfer log and die. A mirrored write lives until its network
    /// half is NET_DONE. For protocol A that is the barrier ack, the only
    /// proof the epoch reached the peer. The bitmap verdict lands here,
    /// strictly before the slot is released.
    fn req_may_be_done(&mut self, req: &mut Request, h: ReqHandle) -> bool {
        let s = req.rq_state;
        if req.master.is_some() ||
            s.contains(RqState::LOCAL_PENDING) ||
            (s.intersects(RqState::NET_MASK) && !s.contains(RqState::NET_DONE))
        {
            return false;
        }

        if req.in_tl {
            // Network half resolved but the slot was not popped yet: a
            // request still in the open epoch removes itself, one in a
            // closed epoch waits for the barrier-ack pop.
            if self.tl.dependence(h) {
                req.in_tl = false;
            } else {
                return false;
            }
        }

        if req.is_write() {
            let both_ok = s.contains(RqState::LOCAL_OK) && s.contains(RqState::NET_OK);
            if !both_ok {
                self.bitmap.set_range_bytes(
                    req.byte_offset(),
                    req.size as u64,
                    self.ln2_blksize,
                    BlockState::OutOfSync,
                );
            } else if s.contains(RqState::NET_SIS) {
                self.bitmap.set_range_bytes(
                    req.byte_offset(),
                    req.size as u64,
                    self.ln2_blksize,
                    BlockState::InSync,
                );
            }
        }

        true
    }

    /// Close the running epoch if it carries writes: bump the epoch counter
    /// so new writes land in the next one, and queue the barrier. The
    /// barrier itself enters the ring under the send mutex so ring order
    /// matches wire order.
    pub(crate) fn maybe_start_new_epoch(&mut self) {
        if self.current_epoch_writes == 0 {
            return;
        }
        self.current_epoch_nr += 1;
        self.current_epoch_writes = 0;
        let _ = self.work_tx.send(WorkItem::SendBarrier);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use crossbeam_channel::{Receiver, unbounded};
    use tandem_sync::Bitmap;

    use super::*;
    use crate::{
        config::{DeviceConfig, Protocol},
        device::{ConnState, Core},
        transfer_log::TransferLog,
    };

    type WriteSlot = Arc<Mutex<Option<Result<(), IoError>>>>;
    type ReadSlot = Arc<Mutex<Option<Result<Vec<u8>, IoError>>>>;

    fn mk_core(protocol: Protocol) -> (Core, Receiver<WorkItem>) {
        let cfg = DeviceConfig::new(
            0,
            1 << 20,
            "/tmp/tandem-test-md".into(),
            "127.0.0.1:1".parse().unwrap(),
            "127.0.0.1:2".parse().unwrap(),
            false,
        )
        .with_protocol(protocol);
        let (tx, rx) = unbounded();
        let mut core = Core::new(
            &cfg,
            tx,
            Arc::new(Bitmap::new(1 << 20)),
            Arc::new(TransferLog::new(64)),
        );
        core.cstate = ConnState::Connected;
        (core, rx)
    }

    fn push_write(core: &mut Core, sector: u64, size: u32, slot: &WriteSlot) -> ReqHandle {
        let slot = slot.clone();
        let req = Request {
            sector,
            size,
            rq_state: RqState::WRITE,
            epoch: core.current_epoch_nr,
            start_time: Instant::now(),
            master: Some(MasterIo::Write(Box::new(move |r| {
                *slot.lock().unwrap() = Some(r);
            }))),
            payload: Some(Arc::new(vec![0xaa; size as usize])),
            read_data: None,
            local_error: None,
            in_tl: false,
            al_ref: None,
        };
        let h = core.arena.alloc(req).unwrap_or_else(|_| panic!("arena alloc failed"));
        core.write_requests.insert(sector << SECTOR_SHIFT, size, h);
        h
    }

    fn push_read(core: &mut Core, sector: u64, size: u32, slot: &ReadSlot) -> ReqHandle {
        let slot = slot.clone();
        let req = Request {
            sector,
            size,
            rq_state: RqState::empty(),
            epoch: core.current_epoch_nr,
            start_time: Instant::now(),
            master: Some(MasterIo::Read(Box::new(move |r| {
                *slot.lock().unwrap() = Some(r);
            }))),
            payload: None,
            read_data: None,
            local_error: None,
            in_tl: false,
            al_ref: None,
        };
        let h = core.arena.alloc(req).unwrap_or_else(|_| panic!("arena alloc failed"));
        core.read_requests.insert(sector << SECTOR_SHIFT, size, h);
        h
    }

    /// Mirror the submit path for a replicated write: ring + queue + local.
    fn mirror_and_submit(core: &mut Core, h: ReqHandle) -> Vec<Signal> {
        core.tl.add(h);
        core.arena.get_mut(h).unwrap().in_tl = true;
        core.current_epoch_writes += 1;
        let mut sigs = Vec::new();
        core.req_mod_into(h, ReqEvent::ToBeSent, &mut sigs);
        core.req_mod_into(h, ReqEvent::QueueForNetWrite, &mut sigs);
        core.req_mod_into(h, ReqEvent::ToBeSubmitted, &mut sigs);
        sigs
    }

    fn fire(sigs: Vec<Signal>) {
        for sig in sigs {
            match sig {
                Signal::WriteDone(done, res) => done(res),
                Signal::ReadDone(done, res) => done(res),
                _ => {}
            }
        }
    }

    fn state_of(core: &Core, h: ReqHandle) -> RqState {
        core.arena.get(h).unwrap().rq_state
    }

    #[test]
    fn protocol_c_write_happy_path() {
        let (mut core, _rx) = mk_core(Protocol::C);
        let slot: WriteSlot = Default::default();
        let h = push_write(&mut core, 0, 4096, &slot);
        fire(mirror_and_submit(&mut core, h));

        let s = state_of(&core, h);
        assert!(s.contains(RqState::NET_PENDING | RqState::EXP_WRITE_ACK));
        assert!(s.contains(RqState::LOCAL_PENDING | RqState::NET_QUEUED));
        assert_eq!(core.ap_pending, 1);
        assert_eq!(core.ap_in_flight, 4096);

        fire(core.req_mod(h, ReqEvent::HandedOverToNetwork));
        let s = state_of(&core, h);
        assert!(s.contains(RqState::NET_SENT));
        assert!(s.contains(RqState::NET_PENDING), "C keeps waiting for the write ack");

        fire(core.req_mod(h, ReqEvent::CompletedOk));
        assert!(slot.lock().unwrap().is_none(), "completion gated on NET_PENDING");

        fire(core.req_mod(h, ReqEvent::WriteAckedByPeer));
        assert_eq!(core.ap_pending, 0);
        assert_eq!(core.ap_in_flight, 0);
        assert!(slot.lock().unwrap().as_ref().unwrap().is_ok());
        assert!(!core.bitmap.is_dirty(0), "confirmed write leaves the block clean");

        // The epoch close pops it and frees the slot.
        let epoch = core.tl.release(1, 1);
        assert_eq!(epoch.reqs, vec![h]);
        core.arena.get_mut(h).unwrap().in_tl = false;
        fire(core.req_mod(h, ReqEvent::BarrierAcked));
        assert_eq!(core.arena.live(), 0);
    }

    #[test]
    fn protocol_a_completes_on_handover_and_dirties_on_loss() {
        let (mut core, _rx) = mk_core(Protocol::A);
        let slot: WriteSlot = Default::default();
        let h = push_write(&mut core, 0, 4096, &slot);
        fire(mirror_and_submit(&mut core, h));
        assert!(!state_of(&core, h).intersects(RqState::EXP_ACK_MASK));

        fire(core.req_mod(h, ReqEvent::HandedOverToNetwork));
        let s = state_of(&core, h);
        assert!(s.contains(RqState::NET_OK), "A synthesises success at handover");
        assert!(!s.contains(RqState::NET_PENDING));
        assert_eq!(core.ap_pending, 0);

        fire(core.req_mod(h, ReqEvent::CompletedOk));
        assert!(slot.lock().unwrap().as_ref().unwrap().is_ok());
        // Still pinned in the ring: durability arrives with the barrier ack.
        assert_eq!(core.arena.live(), 1);

        // Disconnect before the barrier ack: the range must read dirty.
        core.arena.get_mut(h).unwrap().in_tl = false;
        fire(core.req_mod(h, ReqEvent::ConnectionLostWhilePending));
        assert_eq!(core.arena.live(), 0);
        assert!(core.bitmap.is_dirty(0));
    }

    #[test]
    fn protocol_b_completes_on_receive_ack() {
        let (mut core, _rx) = mk_core(Protocol::B);
        let slot: WriteSlot = Default::default();
        let h = push_write(&mut core, 8, 4096, &slot);
        fire(mirror_and_submit(&mut core, h));
        assert!(state_of(&core, h).contains(RqState::EXP_RECEIVE_ACK));

        fire(core.req_mod(h, ReqEvent::HandedOverToNetwork));
        fire(core.req_mod(h, ReqEvent::CompletedOk));
        assert!(slot.lock().unwrap().is_none());

        fire(core.req_mod(h, ReqEvent::RecvAckedByPeer));
        assert!(slot.lock().unwrap().as_ref().unwrap().is_ok());
    }

    #[test]
    fn neg_ack_with_good_local_still_succeeds_but_dirties() {
        let (mut core, _rx) = mk_core(Protocol::C);
        let slot: WriteSlot = Default::default();
        let h = push_write(&mut core, 0, 4096, &slot);
        fire(mirror_and_submit(&mut core, h));
        fire(core.req_mod(h, ReqEvent::HandedOverToNetwork));
        fire(core.req_mod(h, ReqEvent::CompletedOk));

        fire(core.req_mod(h, ReqEvent::NegAcked));
        assert!(slot.lock().unwrap().as_ref().unwrap().is_ok(), "local copy satisfied it");
        assert!(core.bitmap.is_dirty(0), "unmirrored write must be resynced");
        assert_eq!(core.arena.live(), 0, "NET_DONE plus open epoch frees it");
        assert_eq!(core.ap_pending, 0);
    }

    #[test]
    fn local_error_with_peer_ack_succeeds_and_dirties() {
        let (mut core, _rx) = mk_core(Protocol::C);
        let slot: WriteSlot = Default::default();
        let h = push_write(&mut core, 0, 4096, &slot);
        fire(mirror_and_submit(&mut core, h));
        fire(core.req_mod(h, ReqEvent::HandedOverToNetwork));

        fire(core.req_mod(h, ReqEvent::WriteCompletedWithError));
        assert!(core.disk_failed, "write error detaches the local target");
        assert!(slot.lock().unwrap().is_none());

        fire(core.req_mod(h, ReqEvent::WriteAckedByPeer));
        assert!(slot.lock().unwrap().as_ref().unwrap().is_ok());
        assert!(core.bitmap.is_dirty(0));
    }

    #[test]
    fn read_error_retries_remotely_then_serves_peer_bytes() {
        let (mut core, rx) = mk_core(Protocol::C);
        let slot: ReadSlot = Default::default();
        let h = push_read(&mut core, 8, 4096, &slot);
        fire(core.req_mod(h, ReqEvent::ToBeSubmitted));

        fire(core.req_mod(h, ReqEvent::ReadCompletedWithError));
        assert!(slot.lock().unwrap().is_none(), "retry goes remote instead of failing");
        assert!(state_of(&core, h).contains(RqState::NET_PENDING | RqState::NET_QUEUED));
        assert!(matches!(rx.try_recv(), Ok(WorkItem::SendReadReq(got)) if got == h));

        fire(core.req_mod(h, ReqEvent::HandedOverToNetwork));
        core.arena.get_mut(h).unwrap().read_data = Some(vec![7u8; 4096]);
        fire(core.req_mod(h, ReqEvent::DataReceived));
        assert_eq!(
            slot.lock().unwrap().as_ref().unwrap().as_ref().unwrap(),
            &vec![7u8; 4096]
        );
        assert_eq!(core.arena.live(), 0);
    }

    #[test]
    fn read_error_without_peer_fails_upward() {
        let (mut core, _rx) = mk_core(Protocol::C);
        core.cstate = ConnState::StandAlone;
        let slot: ReadSlot = Default::default();
        let h = push_read(&mut core, 8, 4096, &slot);
        fire(core.req_mod(h, ReqEvent::ToBeSubmitted));
        fire(core.req_mod(h, ReqEvent::ReadCompletedWithError));
        assert_eq!(
            slot.lock().unwrap().as_ref().unwrap().as_ref().unwrap_err(),
            &IoError::LocalDisk
        );
    }

    #[test]
    fn barrier_ack_while_pending_keeps_the_machine_consistent() {
        let (mut core, _rx) = mk_core(Protocol::C);
        let slot: WriteSlot = Default::default();
        let h = push_write(&mut core, 0, 4096, &slot);
        fire(mirror_and_submit(&mut core, h));
        fire(core.req_mod(h, ReqEvent::HandedOverToNetwork));
        fire(core.req_mod(h, ReqEvent::CompletedOk));

        // The ack never came, yet the epoch was acknowledged: a protocol
        // error that must not strand the request or the counters.
        core.arena.get_mut(h).unwrap().in_tl = false;
        fire(core.req_mod(h, ReqEvent::BarrierAcked));
        assert_eq!(core.ap_pending, 0);
        assert_eq!(core.ap_in_flight, 0);
        assert_eq!(core.arena.live(), 0);
        assert!(core.bitmap.is_dirty(0), "never acked, so the range reads dirty");
        assert!(slot.lock().unwrap().as_ref().unwrap().is_ok());
    }

    #[test]
    fn duplicate_ack_decrements_only_once() {
        let (mut core, _rx) = mk_core(Protocol::C);
        let slot: WriteSlot = Default::default();
        let h = push_write(&mut core, 0, 4096, &slot);
        fire(mirror_and_submit(&mut core, h));
        fire(core.req_mod(h, ReqEvent::HandedOverToNetwork));
        fire(core.req_mod(h, ReqEvent::WriteAckedByPeer));
        assert_eq!(core.ap_pending, 0);
        fire(core.req_mod(h, ReqEvent::WriteAckedByPeer));
        assert_eq!(core.ap_pending, 0, "second ack must not double-decrement");
    }

    #[test]
    fn discard_write_reports_success() {
        let (mut core, _rx) = mk_core(Protocol::C);
        let slot: WriteSlot = Default::default();
        let h = push_write(&mut core, 0, 4096, &slot);
        fire(mirror_and_submit(&mut core, h));
        fire(core.req_mod(h, ReqEvent::CompletedOk));
        core.arena.get_mut(h).unwrap().in_tl = false;
        fire(core.req_mod(h, ReqEvent::DiscardWrite));
        assert!(slot.lock().unwrap().as_ref().unwrap().is_ok());
        assert_eq!(core.arena.live(), 0);
    }

    #[test]
    fn postponed_write_is_repackaged_for_retry() {
        let (mut core, _rx) = mk_core(Protocol::C);
        core.cstate = ConnState::StandAlone;
        let slot: WriteSlot = Default::default();
        let h = push_write(&mut core, 16, 4096, &slot);
        fire(core.req_mod(h, ReqEvent::ToBeSubmitted));
        fire(core.req_mod(h, ReqEvent::PostponeWrite));

        let sigs = core.req_mod(h, ReqEvent::CompletedOk);
        let retried = sigs.iter().any(|s| {
            matches!(s, Signal::Retry(RetryIo { sector: 16, size: 4096, .. }))
        });
        assert!(retried, "postponed requests re-dispatch instead of completing");
        assert!(slot.lock().unwrap().is_none());
        assert_eq!(core.arena.live(), 0);
    }

    #[test]
    fn resend_replays_unacked_writes() {
        let (mut core, rx) = mk_core(Protocol::C);
        let slot: WriteSlot = Default::default();
        let h = push_write(&mut core, 0, 4096, &slot);
        fire(mirror_and_submit(&mut core, h));
        fire(core.req_mod(h, ReqEvent::HandedOverToNetwork));
        while rx.try_recv().is_ok() {}

        fire(core.req_mod(h, ReqEvent::Resend));
        let s = state_of(&core, h);
        assert!(s.contains(RqState::NET_QUEUED | RqState::NET_PENDING));
        assert!(!s.contains(RqState::NET_SENT));
        assert!(matches!(rx.try_recv(), Ok(WorkItem::SendDBlock(got)) if got == h));
    }

    #[test]
    fn resend_with_ack_already_in_acts_as_barrier_ack() {
        let (mut core, _rx) = mk_core(Protocol::C);
        let slot: WriteSlot = Default::default();
        let h = push_write(&mut core, 0, 4096, &slot);
        fire(mirror_and_submit(&mut core, h));
        fire(core.req_mod(h, ReqEvent::HandedOverToNetwork));
        fire(core.req_mod(h, ReqEvent::CompletedOk));
        fire(core.req_mod(h, ReqEvent::WriteAckedByPeer));

        core.arena.get_mut(h).unwrap().in_tl = false;
        fire(core.req_mod(h, ReqEvent::Resend));
        assert_eq!(core.arena.live(), 0, "only the barrier ack was missing");
        assert!(!core.bitmap.is_dirty(0));
    }

    #[test]
    fn frozen_local_io_can_fail_or_restart() {
        let (mut core, _rx) = mk_core(Protocol::C);
        core.cstate = ConnState::StandAlone;
        let slot: WriteSlot = Default::default();
        let h = push_write(&mut core, 0, 4096, &slot);
        fire(core.req_mod(h, ReqEvent::ToBeSubmitted));

        let sigs = core.req_mod(h, ReqEvent::RestartFrozenDiskIo);
        assert!(sigs.iter().any(|s| matches!(s, Signal::Resubmit(got) if *got == h)));
        assert!(state_of(&core, h).contains(RqState::LOCAL_PENDING));

        fire(core.req_mod(h, ReqEvent::FailFrozenDiskIo));
        assert_eq!(
            slot.lock().unwrap().as_ref().unwrap().as_ref().unwrap_err(),
            &IoError::LocalDisk
        );
    }

    #[test]
    fn aborted_local_io_unblocks_completion() {
        let (mut core, _rx) = mk_core(Protocol::C);
        let slot: WriteSlot = Default::default();
        let h = push_write(&mut core, 0, 4096, &slot);
        fire(mirror_and_submit(&mut core, h));
        fire(core.req_mod(h, ReqEvent::HandedOverToNetwork));
        fire(core.req_mod(h, ReqEvent::WriteAckedByPeer));
        assert!(slot.lock().unwrap().is_none(), "local half still pending");

        // The local target hangs; abandoning it lets the network result
        // stand.
        fire(core.req_mod(h, ReqEvent::AbortDiskIo));
        assert!(slot.lock().unwrap().as_ref().unwrap().is_ok());
    }

    #[test]
    fn arena_ids_survive_slot_reuse() {
        let (mut core, _rx) = mk_core(Protocol::C);
        let slot: WriteSlot = Default::default();
        let h1 = push_write(&mut core, 0, 4096, &slot);
        let id1 = h1.block_id();
        fire(core.req_mod(h1, ReqEvent::ToBeSubmitted));
        fire(core.req_mod(h1, ReqEvent::CompletedOk));
        assert_eq!(core.arena.live(), 0);

        let h2 = push_write(&mut core, 8, 4096, &slot);
        assert_ne!(h2.block_id(), id1, "recycled slot must carry a new generation");
        assert!(core.arena.from_block_id(id1).is_none(), "stale ids resolve to nothing");
    }
}

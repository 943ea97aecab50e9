use std::{
    sync::{
        Arc, Condvar, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender, unbounded};
use tandem_sync::{Bitmap, BlockState, MetaRecord};
use tandem_wire::FramedSender;
use tracing::{error, info, warn};

use crate::{
    config::{DeviceConfig, OnCongestion, Protocol, ReadBalancing},
    error::{DeviceError, IoError},
    interval::IntervalSet,
    request::{ReqArena, ReqEvent, Request, RetryIo, RqState, Signal},
    target::{ActivityLog, BackingDisk, DiskIo, IoDir},
    transfer_log::TransferLog,
    worker::{AsenderCmd, WorkItem},
};

/// Replication/connection state of the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Unconfigured,
    StandAlone,
    Unconnected,
    WfReportParams,
    Connected,
    SyncSource,
    SyncTarget,
    Timeout,
    BrokenPipe,
}

impl ConnState {
    pub fn wire_id(self) -> u32 {
        match self {
            ConnState::Unconfigured => 0,
            ConnState::StandAlone => 1,
            ConnState::Unconnected => 2,
            ConnState::WfReportParams => 3,
            ConnState::Connected => 4,
            ConnState::SyncSource => 5,
            ConnState::SyncTarget => 6,
            ConnState::Timeout => 7,
            ConnState::BrokenPipe => 8,
        }
    }

    pub fn from_wire(v: u32) -> Option<Self> {
        Some(match v {
            0 => ConnState::Unconfigured,
            1 => ConnState::StandAlone,
            2 => ConnState::Unconnected,
            3 => ConnState::WfReportParams,
            4 => ConnState::Connected,
            5 => ConnState::SyncSource,
            6 => ConnState::SyncTarget,
            7 => ConnState::Timeout,
            8 => ConnState::BrokenPipe,
            _ => return None,
        })
    }
}

/// Only Primary accepts upper-layer writes; Secondary mirrors the peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Primary,
    Secondary,
}

/// Policies adjustable at runtime through the administrative surface.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Tunables {
    pub protocol: Protocol,
    pub timeout: Duration,
    pub ko_count: u32,
    pub read_balancing: ReadBalancing,
    pub on_congestion: OnCongestion,
    pub max_epoch_size: u32,
}

/// Everything mutated under the core lock: the request arena and its
/// conflict trees, the epoch counters, the in-flight accounting and the
/// replication state. `req_mod` (request.rs) is the only place request
/// state bits change.
pub(crate) struct Core {
    pub protocol: Protocol,
    pub tune: Tunables,
    pub cstate: ConnState,
    pub role: Role,

    pub arena: ReqArena,
    pub write_requests: IntervalSet,
    pub read_requests: IntervalSet,

    pub current_epoch_nr: u32,
    pub current_epoch_writes: u32,

    /// Bytes handed to the peer and not yet acknowledged.
    pub ap_in_flight: u64,
    /// Requests with an outstanding peer acknowledgement.
    pub ap_pending: u32,
    /// Resync blocks sent and not yet acknowledged.
    pub rs_pending: u32,
    /// Requests with the local disk half still pending.
    pub local_cnt: u32,

    pub suspended: bool,
    /// Pull-ahead: congestion switched us to bitmap-only mirroring.
    pub ahead: bool,
    /// A local block target is attached at all.
    pub has_disk: bool,
    pub disk_failed: bool,
    /// Round-robin read balancing toggle bit.
    pub rr_toggle: bool,

    /// Postponed submissions parked while the device is suspended.
    pub frozen: Vec<RetryIo>,

    pub work_tx: Sender<WorkItem>,
    pub bitmap: Arc<Bitmap>,
    pub tl: Arc<TransferLog>,
    pub ln2_blksize: u32,
}

impl Core {
    pub(crate) fn new(
        cfg: &DeviceConfig,
        work_tx: Sender<WorkItem>,
        bitmap: Arc<Bitmap>,
        tl: Arc<TransferLog>,
    ) -> Self {
        Self {
            protocol: cfg.protocol,
            tune: Tunables {
                protocol: cfg.protocol,
                timeout: cfg.timeout,
                ko_count: cfg.ko_count,
                read_balancing: cfg.read_balancing,
                on_congestion: cfg.on_congestion,
                max_epoch_size: cfg.max_epoch_size,
            },
            cstate: ConnState::StandAlone,
            role: Role::Secondary,
            arena: ReqArena::with_capacity(cfg.max_requests),
            write_requests: IntervalSet::default(),
            read_requests: IntervalSet::default(),
            current_epoch_nr: 1,
            current_epoch_writes: 0,
            ap_in_flight: 0,
            ap_pending: 0,
            rs_pending: 0,
            local_cnt: 0,
            suspended: false,
            ahead: false,
            has_disk: false,
            disk_failed: false,
            rr_toggle: false,
            frozen: Vec::new(),
            work_tx,
            bitmap,
            tl,
            ln2_blksize: cfg.ln2_blksize(),
        }
    }

    /// Whether the peer currently holds data we may read or mirror to.
    pub(crate) fn peer_usable(&self) -> bool {
        !self.ahead &&
            matches!(self.cstate, ConnState::Connected | ConnState::SyncSource | ConnState::SyncTarget)
    }

    /// Whether a write must be mirrored to the peer right now. During
    /// pull-ahead the data stays home and only the bitmap records it.
    pub(crate) fn should_do_remote(&self) -> bool {
        !self.ahead && matches!(self.cstate, ConnState::Connected | ConnState::SyncSource)
    }

    pub(crate) fn should_send_oos(&self) -> bool {
        self.ahead &&
            matches!(self.cstate, ConnState::Connected | ConnState::SyncSource)
    }

    /// Local-disk error policy: detach-equivalent. The device keeps serving
    /// through the peer; the failed half is recorded per request.
    pub(crate) fn chk_io_error(&mut self, req: &Request) {
        if !self.disk_failed {
            error!(
                sector = req.sector,
                size = req.size,
                "backing disk reported an error, detaching local target"
            );
            self.disk_failed = true;
        }
    }
}

/// Snapshot of the device counters for callers and tests.
#[derive(Clone, Copy, Debug)]
pub struct DeviceStatus {
    pub cstate: ConnState,
    pub role: Role,
    pub ap_pending: u32,
    pub ap_in_flight: u64,
    pub rs_pending: u32,
    pub local_cnt: u32,
    pub live_requests: usize,
    pub current_epoch_nr: u32,
    pub dirty_bits: u64,
    pub suspended: bool,
}

pub(crate) struct DeviceInner {
    pub cfg: DeviceConfig,
    pub core: Mutex<Core>,
    /// Conflict-resolution waiters (overlapping writes).
    pub misc_wait: Condvar,
    /// Role / connection state watchers.
    pub state_wait: Condvar,

    pub bitmap: Arc<Bitmap>,
    pub meta: Mutex<MetaRecord>,
    /// Snapshot of the peer's generation counters at the last successful
    /// handshake; drives the partial-vs-full resync decision.
    pub bm_gen: Mutex<Option<[u32; 4]>>,
    /// Our own counters at the same moment, the source-side mirror of the
    /// same predicate.
    pub own_gen_snap: Mutex<Option<[u32; 4]>>,

    pub tl: Arc<TransferLog>,
    pub disk: Option<Arc<dyn BackingDisk>>,
    pub al: Arc<dyn ActivityLog>,

    pub work_tx: Sender<WorkItem>,
    pub work_rx: Receiver<WorkItem>,
    /// Receiver -> asender: acks and packets only the asender may write.
    pub ack_tx: Sender<AsenderCmd>,
    pub ack_rx: Receiver<AsenderCmd>,

    /// Current data-channel sender. The mutex is the send mutex: barrier
    /// ring insertion and the wire write happen inside one critical section.
    pub data_tx: Mutex<Option<FramedSender>>,
    pub meta_tx: Mutex<Option<FramedSender>>,

    /// Receiver -> asender handoff of the established meta channel, tagged
    /// with the connection generation it belongs to.
    pub meta_chan_slot: Mutex<Option<(tandem_wire::FramedChannel, u32)>>,
    pub asender_wait: Condvar,

    /// Bumped on every teardown so stale channels are dropped by their
    /// owning workers.
    pub net_gen: AtomicU32,
    /// Asender should emit a probe ping on the data channel's behalf.
    pub send_ping: AtomicBool,
}

/// One replicated block device: the owning handle the administrative shim
/// and the upper block layer talk to. Cheap to clone; workers hold clones.
#[derive(Clone)]
pub struct Device {
    pub(crate) inner: Arc<DeviceInner>,
}

impl Device {
    /// Bind a device to its backing target and metadata record.
    /// `disk = None` attaches diskless: every read and write must be served
    /// by the peer.
    pub fn attach(
        cfg: DeviceConfig,
        disk: Option<Arc<dyn BackingDisk>>,
        al: Arc<dyn ActivityLog>,
    ) -> Result<Self, DeviceError> {
        let meta = MetaRecord::read(&cfg.meta_path)?;
        let bitmap = Arc::new(Bitmap::new(cfg.capacity));
        let tl = Arc::new(TransferLog::new(cfg.tl_size));
        let (work_tx, work_rx) = unbounded();
        let (ack_tx, ack_rx) = unbounded();

        if !meta.consistent() {
            warn!(minor = cfg.minor, "attaching with inconsistent data, full resync required");
        }

        let mut core = Core::new(&cfg, work_tx.clone(), bitmap.clone(), tl.clone());
        core.has_disk = disk.is_some();
        info!(minor = cfg.minor, capacity = cfg.capacity, "device attached");

        Ok(Self {
            inner: Arc::new(DeviceInner {
                cfg,
                core: Mutex::new(core),
                misc_wait: Condvar::new(),
                state_wait: Condvar::new(),
                bitmap,
                meta: Mutex::new(meta),
                bm_gen: Mutex::new(None),
                own_gen_snap: Mutex::new(None),
                tl,
                disk,
                al,
                work_tx,
                work_rx,
                ack_tx,
                ack_rx,
                data_tx: Mutex::new(None),
                meta_tx: Mutex::new(None),
                meta_chan_slot: Mutex::new(None),
                asender_wait: Condvar::new(),
                net_gen: AtomicU32::new(0),
                send_ping: AtomicBool::new(false),
            }),
        })
    }

    pub fn minor(&self) -> u32 {
        self.inner.cfg.minor
    }

    pub fn status(&self) -> DeviceStatus {
        let core = self.lock_core();
        DeviceStatus {
            cstate: core.cstate,
            role: core.role,
            ap_pending: core.ap_pending,
            ap_in_flight: core.ap_in_flight,
            rs_pending: core.rs_pending,
            local_cnt: core.local_cnt,
            live_requests: core.arena.live(),
            current_epoch_nr: core.current_epoch_nr,
            dirty_bits: self.inner.bitmap.dirty_bits(),
            suspended: core.suspended,
        }
    }

    pub(crate) fn lock_core(&self) -> MutexGuard<'_, Core> {
        self.inner.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ---- administrative surface -------------------------------------------

    /// Change the role. Promotion without a connected, consistent peer is a
    /// generation event and marks the record as degraded-promoted: forced
    /// promotion counts as administrator intervention, an unforced one as an
    /// arbitrary promotion. A clean demotion clears the mark.
    pub fn set_role(&self, role: Role, forced: bool) -> Result<(), DeviceError> {
        let degraded;
        {
            let mut core = self.lock_core();
            if core.role == role {
                return Ok(());
            }
            degraded = !core.peer_usable();
            core.role = role;
        }

        let mut meta = self.inner.meta.lock().unwrap_or_else(|e| e.into_inner());
        match role {
            Role::Primary if degraded => {
                meta.set_primary(true);
                if forced {
                    meta.bump_human();
                } else {
                    meta.bump_arbitrary();
                }
            }
            Role::Primary => {}
            Role::Secondary => meta.set_primary(false),
        }
        meta.write(&self.inner.cfg.meta_path)?;
        drop(meta);

        info!(minor = self.minor(), ?role, forced, "role changed");
        self.inner.state_wait.notify_all();
        Ok(())
    }

    pub fn set_protocol(&self, protocol: Protocol) -> Result<(), DeviceError> {
        let mut core = self.lock_core();
        if core.peer_usable() {
            // Renegotiation needs a fresh handshake.
            warn!("protocol change while connected takes effect after the next reconnect");
        }
        core.tune.protocol = protocol;
        core.protocol = protocol;
        Ok(())
    }

    pub fn set_timeout(&self, timeout: Duration, ko_count: u32) {
        let mut core = self.lock_core();
        core.tune.timeout = timeout;
        core.tune.ko_count = ko_count;
    }

    pub fn set_read_balancing(&self, rb: ReadBalancing) {
        self.lock_core().tune.read_balancing = rb;
    }

    pub fn set_on_congestion(&self, oc: OnCongestion) {
        self.lock_core().tune.on_congestion = oc;
    }

    pub fn set_max_epoch_size(&self, n: u32) {
        self.lock_core().tune.max_epoch_size = n.max(1);
    }

    /// Freeze incoming I/O: new submissions park as postponed retries.
    pub fn suspend_io(&self) {
        self.lock_core().suspended = true;
    }

    /// Thaw: re-drive everything that queued up while frozen.
    pub fn resume_io(&self) {
        let frozen = {
            let mut core = self.lock_core();
            core.suspended = false;
            std::mem::take(&mut core.frozen)
        };
        for retry in frozen {
            self.resubmit_retry(retry);
        }
    }

    /// Fail everything parked while frozen instead of re-driving it.
    pub fn fail_frozen(&self) {
        let frozen = {
            let mut core = self.lock_core();
            std::mem::take(&mut core.frozen)
        };
        for retry in frozen {
            match retry.master {
                crate::request::MasterIo::Write(done) => done(Err(IoError::Aborted)),
                crate::request::MasterIo::Read(done) => done(Err(IoError::Aborted)),
            }
        }
    }

    // ---- engine internals --------------------------------------------------

    /// Fire the deferred effects of a locked transition. Must be called
    /// without the core lock held.
    pub(crate) fn fire_signals(&self, sigs: Vec<Signal>) {
        for sig in sigs {
            match sig {
                Signal::WriteDone(done, res) => done(res),
                Signal::ReadDone(done, res) => done(res),
                Signal::WakeMisc => self.inner.misc_wait.notify_all(),
                Signal::Retry(retry) => {
                    let mut core = self.lock_core();
                    if core.suspended {
                        core.frozen.push(retry);
                    } else {
                        drop(core);
                        self.resubmit_retry(retry);
                    }
                }
                Signal::Resubmit(h) => self.resubmit_local(h),
            }
        }
    }

    /// Re-drive the local half of a thawed request.
    fn resubmit_local(&self, h: crate::request::ReqHandle) {
        let Some(disk) = self.inner.disk.clone() else {
            let sigs = self.lock_core().req_mod(h, ReqEvent::FailFrozenDiskIo);
            self.fire_signals(sigs);
            return;
        };
        let (offset, len, dir, payload) = {
            let core = self.lock_core();
            let Some(req) = core.arena.get(h) else { return };
            (
                req.byte_offset(),
                req.size,
                if req.is_write() { IoDir::Write } else { IoDir::Read },
                req.payload.clone(),
            )
        };
        let dev = self.clone();
        disk.submit(
            DiskIo { offset, len, dir, payload },
            Box::new(move |res| dev.local_endio(h, res)),
        );
    }

    /// Local target endio: translate the result into the state event and run
    /// the mutator.
    pub(crate) fn local_endio(
        &self,
        h: crate::request::ReqHandle,
        result: std::io::Result<Option<Vec<u8>>>,
    ) {
        let sigs = {
            let mut core = self.lock_core();
            let event = match result {
                Ok(data) => {
                    if let Some(req) = core.arena.get_mut(h) {
                        if let Some(bytes) = data {
                            req.read_data = Some(bytes);
                        }
                    }
                    ReqEvent::CompletedOk
                }
                Err(e) => {
                    let is_write =
                        core.arena.get(h).map(|r| r.is_write()).unwrap_or_default();
                    warn!(%e, write = is_write, "local target error");
                    if is_write {
                        ReqEvent::WriteCompletedWithError
                    } else {
                        ReqEvent::ReadCompletedWithError
                    }
                }
            };
            core.req_mod(h, event)
        };
        self.fire_signals(sigs);
    }

    /// Meta-channel `BarrierAck`: collapse one epoch, advance requests.
    pub(crate) fn barrier_acked(&self, barrier_nr: u32, set_size: u32) {
        let epoch = self.inner.tl.release(barrier_nr, set_size);
        let sigs = {
            let mut core = self.lock_core();
            let mut sigs = Vec::new();
            for h in epoch.reqs {
                if let Some(req) = core.arena.get_mut(h) {
                    req.in_tl = false;
                }
                core.req_mod_into(h, ReqEvent::BarrierAcked, &mut sigs);
            }
            sigs
        };
        self.fire_signals(sigs);
    }

    /// Upper-layer disconnect cleanup: every request with an unfinished
    /// network half gets its range dirtied and its network half forced to a
    /// synthetic completion, then the ring restarts.
    pub(crate) fn tl_clear(&self) {
        let _ = self.inner.tl.clear();
        let sigs = {
            let mut core = self.lock_core();
            // Barrier ordinals restart with the ring; epoch numbering
            // follows.
            core.current_epoch_nr = 1;
            core.current_epoch_writes = 0;
            let mut sigs = Vec::new();
            for h in core.arena.handles() {
                let Some(req) = core.arena.get_mut(h) else { continue };
                let s = req.rq_state;
                if !s.intersects(RqState::NET_MASK) || s.contains(RqState::NET_DONE) {
                    continue;
                }
                req.in_tl = false;
                let off = req.byte_offset();
                let len = req.size as u64;
                if s.contains(RqState::WRITE) {
                    core.bitmap.set_range_bytes(off, len, core.ln2_blksize, BlockState::OutOfSync);
                }
                core.req_mod_into(h, ReqEvent::ConnectionLostWhilePending, &mut sigs);
            }
            sigs
        };
        self.fire_signals(sigs);
    }

    /// Re-drive surviving requests after a reconnect that found the device
    /// suspended (nothing was cleared, nothing was failed).
    pub(crate) fn resend_all(&self) {
        let sigs = {
            let mut core = self.lock_core();
            let mut sigs = Vec::new();
            for h in core.arena.handles() {
                let Some(req) = core.arena.get(h) else { continue };
                let s = req.rq_state;
                if s.intersects(RqState::NET_MASK) && !s.contains(RqState::NET_DONE) {
                    core.req_mod_into(h, ReqEvent::Resend, &mut sigs);
                }
            }
            sigs
        };
        self.fire_signals(sigs);
    }

    /// Connection teardown cascade: state, senders, transfer log.
    pub(crate) fn conn_lost(&self, to: ConnState) {
        let suspended;
        {
            let mut core = self.lock_core();
            if matches!(core.cstate, ConnState::StandAlone | ConnState::Unconfigured) {
                return;
            }
            if core.cstate == to {
                // Another worker already ran this teardown.
                return;
            }
            info!(minor = self.minor(), from = ?core.cstate, ?to, "connection lost");
            core.cstate = to;
            core.ahead = false;
            suspended = core.suspended;
        }
        self.inner.net_gen.fetch_add(1, Ordering::SeqCst);
        *self.inner.data_tx.lock().unwrap_or_else(|e| e.into_inner()) = None;
        *self.inner.meta_tx.lock().unwrap_or_else(|e| e.into_inner()) = None;

        if to == ConnState::Timeout {
            let mut meta = self.inner.meta.lock().unwrap_or_else(|e| e.into_inner());
            meta.bump_timeout();
            if let Err(e) = meta.write(&self.inner.cfg.meta_path) {
                error!(%e, "couldn't persist timeout generation bump");
            }
        }

        if suspended {
            info!("device suspended, freezing in-flight requests instead of failing them");
        } else {
            self.tl_clear();
        }
        self.inner.state_wait.notify_all();
    }

    /// Wait until the device reaches one of `states`, for tests and the
    /// administrative shim.
    pub fn wait_for_cstate(&self, states: &[ConnState], timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut core = self.lock_core();
        loop {
            if states.contains(&core.cstate) {
                return true;
            }
            let Some(left) = deadline.checked_duration_since(std::time::Instant::now()) else {
                return false;
            };
            let (guard, _) = self
                .inner
                .state_wait
                .wait_timeout(core, left)
                .unwrap_or_else(|e| e.into_inner());
            core = guard;
        }
    }

    pub(crate) fn resubmit_retry(&self, retry: RetryIo) {
        use crate::request::MasterIo;
        match retry.master {
            MasterIo::Write(done) => {
                let payload = match retry.payload {
                    Some(p) => p,
                    None => {
                        done(Err(IoError::Aborted));
                        return;
                    }
                };
                self.submit_write_shared(retry.sector, payload, done);
            }
            MasterIo::Read(done) => self.submit_read_cb(retry.sector, retry.size, done),
        }
    }
}

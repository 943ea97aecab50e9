use std::{
    collections::VecDeque,
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::RecvTimeoutError;
use tandem_sync::BlockState;
use tandem_utils::{Repeater, ThreadPriority, proto_violation, thread_boot};
use tandem_wire::{
    ConnState as ChanState, Endpoint, FramedChannel, FramedSender, ID_SYNCER, Packet,
    ReportParams, STATE_WANT_FULL_SYNC,
};
use tracing::{Level, debug, error, info, span, warn};

use crate::{
    device::{ConnState, Device},
    handshake::SyncDecision,
    request::{ReqEvent, ReqHandle, RqState},
    target::{DiskIo, IoDir},
};

/// Marks read traffic in the wire `block_id`: an empty-payload frame is the
/// request, the echoed id on a full frame is the reply.
const ID_READ_FLAG: u64 = 1 << 63;

const POLL: Duration = Duration::from_millis(5);

/// Sender work, dispatched on tag by the worker thread. Queue order is wire
/// order; order-sensitive items are enqueued under the core lock.
pub(crate) enum WorkItem {
    SendDBlock(ReqHandle),
    SendReadReq(ReqHandle),
    SendOos(ReqHandle),
    SendBarrier,
    /// A resync block came back from the local target.
    ResyncRead { block_nr: u64, result: Result<Vec<u8>, ()> },
}

/// Packets composed elsewhere but written by the asender, the meta channel's
/// only writer.
pub(crate) enum AsenderCmd {
    WriteAck { block_nr: u64, block_id: u64 },
    RecvAck { block_nr: u64, block_id: u64 },
    NegAck { block_nr: u64, block_id: u64 },
    BarrierAck { barrier_nr: u32, set_size: u32 },
    CState(u32),
}

/// Worker thread control states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    Running,
    Restarting,
    Exiting,
}

pub(crate) struct ThreadCtl {
    state: Mutex<ThreadState>,
    wait: Condvar,
}

impl ThreadCtl {
    fn new() -> Arc<Self> {
        Arc::new(Self { state: Mutex::new(ThreadState::Running), wait: Condvar::new() })
    }

    fn should_exit(&self) -> bool {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) == ThreadState::Exiting
    }

    /// Consume a pending restart request.
    fn take_restart(&self) -> bool {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *s == ThreadState::Restarting {
            *s = ThreadState::Running;
            true
        } else {
            false
        }
    }

    fn request(&self, state: ThreadState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
        self.wait.notify_all();
    }

    /// Interruptible sleep: stop requests cut it short.
    fn idle(&self, d: Duration) {
        let guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *guard == ThreadState::Running {
            let _ = self.wait.wait_timeout(guard, d);
        }
    }
}

/// One long-lived worker thread and its control block.
pub struct WorkerHandle {
    name: &'static str,
    ctl: Arc<ThreadCtl>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    fn spawn<F>(name: &'static str, f: F) -> Self
    where
        F: FnOnce(Arc<ThreadCtl>) + Send + 'static,
    {
        let ctl = ThreadCtl::new();
        let thread_ctl = ctl.clone();
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || f(thread_ctl))
            .expect("spawning a worker thread");
        Self { name, ctl, join: Some(join) }
    }

    /// Signal the thread down and wait for it.
    pub fn stop(&mut self) {
        self.ctl.request(ThreadState::Exiting);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!(thread = self.name, "worker panicked during shutdown");
            }
        }
    }

    /// Ask the thread to tear its connection state down and start over.
    pub fn restart(&self) {
        self.ctl.request(ThreadState::Restarting);
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(|j| j.is_finished())
    }
}

/// The three cooperating threads of one device.
pub struct WorkerSet {
    device: Device,
    pub receiver: WorkerHandle,
    pub asender: WorkerHandle,
    pub worker: WorkerHandle,
    zombies: Vec<WorkerHandle>,
}

impl WorkerSet {
    /// Boot the worker threads and open the device for networking.
    pub fn start(device: &Device) -> Self {
        device.set_cstate(ConnState::Unconnected);
        let receiver = {
            let dev = device.clone();
            WorkerHandle::spawn("tandem-receiver", move |ctl| receiver_loop(dev, &ctl))
        };
        let asender = {
            let dev = device.clone();
            WorkerHandle::spawn("tandem-asender", move |ctl| asender_loop(dev, &ctl))
        };
        let worker = {
            let dev = device.clone();
            WorkerHandle::spawn("tandem-worker", move |ctl| worker_loop(dev, &ctl))
        };
        Self { device: device.clone(), receiver, asender, worker, zombies: Vec::new() }
    }

    /// Stop everything: the receiver first so the network dies before the
    /// state machinery.
    pub fn stop(&mut self) {
        self.receiver.stop();
        self.asender.stop();
        self.worker.stop();
        self.device.conn_lost(ConnState::StandAlone);
        self.device.set_cstate(ConnState::StandAlone);
    }

    /// Tear the connection down and reconnect.
    pub fn restart_receiver(&self) {
        self.receiver.restart();
        self.asender.restart();
    }

    /// Reap handles of threads that already terminated.
    pub fn collect_zombies(&mut self) {
        self.zombies.retain(|z| !z.is_finished());
    }
}

impl Drop for WorkerSet {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Device {
    pub(crate) fn set_cstate(&self, cstate: ConnState) {
        self.lock_core().cstate = cstate;
        self.inner.state_wait.notify_all();
    }
}

fn make_endpoint(dial: bool, addr: std::net::SocketAddr) -> Endpoint {
    if dial { Endpoint::dial(addr) } else { Endpoint::listen(addr) }
        .with_retry_interval(Duration::from_millis(200))
}

/// Establish one channel, bailing out on stop/restart requests.
fn establish(
    ep: &mut Endpoint,
    ctl: &ThreadCtl,
) -> Option<(FramedChannel, FramedSender)> {
    loop {
        if ctl.should_exit() || ctl.take_restart() {
            return None;
        }
        if let Some(split) = ep.try_establish() {
            return Some(split);
        }
        ctl.idle(Duration::from_millis(10));
    }
}

// ---- receiver --------------------------------------------------------------

/// Receiver-side epoch bookkeeping for peer writes (the `ee` lists).
struct RecvState {
    /// Writes received in the open incoming epoch.
    epoch_writes: u32,
    /// Peer writes submitted to the local target and not yet completed.
    active: Arc<AtomicU32>,
    /// Barriers waiting for their epoch's writes to drain.
    pending_barriers: VecDeque<(u32, u32)>,
}

impl RecvState {
    fn new() -> Self {
        Self {
            epoch_writes: 0,
            active: Arc::new(AtomicU32::new(0)),
            pending_barriers: VecDeque::new(),
        }
    }

    /// Acknowledge every barrier whose epoch has fully drained.
    fn flush_barrier_acks(&mut self, dev: &Device) {
        while let Some(&(barrier_nr, set_size)) = self.pending_barriers.front() {
            if self.active.load(Ordering::Acquire) != 0 {
                return;
            }
            self.pending_barriers.pop_front();
            let _ = dev.inner.ack_tx.send(AsenderCmd::BarrierAck { barrier_nr, set_size });
        }
    }
}

fn receiver_loop(dev: Device, ctl: &ThreadCtl) {
    let _span = span!(Level::INFO, "", thread = "receiver", minor = dev.minor()).entered();
    thread_boot(None, ThreadPriority::OSDefault);
    let cfg = dev.inner.cfg.clone();
    let mut data_ep = make_endpoint(cfg.dial, cfg.data_addr);
    let mut meta_ep = make_endpoint(cfg.dial, cfg.meta_addr);

    'outer: while !ctl.should_exit() {
        let _ = ctl.take_restart();
        match dev.lock_core().cstate {
            ConnState::StandAlone | ConnState::Unconfigured => {
                ctl.idle(Duration::from_millis(100));
                continue;
            }
            _ => {}
        }
        dev.set_cstate(ConnState::Unconnected);

        let Some((mut data_chan, data_tx)) = establish(&mut data_ep, ctl) else { continue };
        let Some((meta_chan, meta_tx)) = establish(&mut meta_ep, ctl) else { continue };
        let my_gen = dev.inner.net_gen.load(Ordering::SeqCst);
        *dev.inner.data_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(data_tx.clone());
        *dev.inner.meta_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(meta_tx);

        // Parameter exchange on the data channel.
        dev.set_cstate(ConnState::WfReportParams);
        if data_tx.send(&Packet::ReportParams(dev.build_params(false))) ==
            ChanState::Disconnected
        {
            dev.conn_lost(ConnState::BrokenPipe);
            continue;
        }
        let deadline = Instant::now() + cfg.timeout * cfg.ko_count.max(1);
        let mut remote: Option<ReportParams> = None;
        while remote.is_none() {
            if ctl.should_exit() {
                break 'outer;
            }
            if Instant::now() > deadline {
                warn!("peer never reported parameters");
                dev.conn_lost(ConnState::BrokenPipe);
                continue 'outer;
            }
            if data_chan.poll_with(POLL, |pkt| {
                if let Packet::ReportParams(p) = pkt {
                    remote = Some(p);
                }
            }) == ChanState::Disconnected
            {
                dev.conn_lost(ConnState::BrokenPipe);
                continue 'outer;
            }
        }

        let decision = match dev.apply_handshake(remote.take().expect("just received")) {
            Ok(d) => d,
            Err(e) => {
                error!(%e, "handshake failed, standing alone");
                dev.conn_lost(ConnState::StandAlone);
                dev.set_cstate(ConnState::StandAlone);
                continue;
            }
        };
        if decision == (SyncDecision::Target { full: true }) {
            // The source cannot see our bitmap generation; tell it to mark
            // everything.
            if data_tx.send(&Packet::ReportParams(dev.build_params(true))) ==
                ChanState::Disconnected
            {
                dev.conn_lost(ConnState::BrokenPipe);
                continue;
            }
        }

        // Hand the meta channel to the asender.
        {
            let mut slot = dev.inner.meta_chan_slot.lock().unwrap_or_else(|e| e.into_inner());
            *slot = Some((meta_chan, my_gen));
            dev.inner.asender_wait.notify_all();
        }

        // A device suspended through the outage still holds its requests.
        if dev.lock_core().suspended {
            dev.resend_all();
        }

        let mut recv = RecvState::new();
        loop {
            if ctl.should_exit() {
                dev.conn_lost(ConnState::StandAlone);
                break 'outer;
            }
            if ctl.take_restart() {
                dev.conn_lost(ConnState::BrokenPipe);
                continue 'outer;
            }
            if dev.inner.net_gen.load(Ordering::SeqCst) != my_gen {
                // Someone else (timeout watchdog, meta channel) tore us down.
                continue 'outer;
            }
            let state = data_chan.poll_with(POLL, |pkt| {
                handle_data_packet(&dev, &data_tx, &mut recv, pkt);
            });
            if state == ChanState::Disconnected {
                dev.conn_lost(ConnState::BrokenPipe);
                continue 'outer;
            }
            recv.flush_barrier_acks(&dev);
        }
    }
    info!("receiver exiting");
}

/// Dispatch table for the data channel.
fn handle_data_packet(dev: &Device, data_tx: &FramedSender, recv: &mut RecvState, pkt: Packet) {
    match pkt {
        Packet::Data { block_nr, block_id, payload } => {
            if block_id == ID_SYNCER {
                apply_peer_write(dev, recv, block_nr, block_id, payload, AckMode::Resync);
            } else if block_id & ID_READ_FLAG != 0 {
                if payload.is_empty() {
                    serve_remote_read(dev, data_tx, block_nr, block_id);
                } else {
                    complete_remote_read(dev, block_id, payload);
                }
            } else {
                recv.epoch_writes += 1;
                let protocol = dev.lock_core().protocol;
                let mode = match protocol {
                    crate::config::Protocol::A => AckMode::None,
                    crate::config::Protocol::B => AckMode::Receive,
                    crate::config::Protocol::C => AckMode::Write,
                };
                apply_peer_write(dev, recv, block_nr, block_id, payload, mode);
            }
        }
        Packet::Barrier { barrier_nr } => {
            recv.pending_barriers.push_back((barrier_nr, recv.epoch_writes));
            recv.epoch_writes = 0;
        }
        Packet::ReportParams(p) => {
            // Re-announcement mid-connection: the peer decided it needs the
            // full stream.
            if p.state & STATE_WANT_FULL_SYNC != 0 {
                info!("peer requests a full resync");
                dev.force_full_source();
            } else {
                debug!("ignoring repeated parameter report");
            }
        }
        Packet::CStateChanged { .. } => debug!("cstate change on the data channel, ignoring"),
        other => proto_violation!("unexpected {other:?} on the data channel"),
    }
}

enum AckMode {
    None,
    Receive,
    Write,
    Resync,
}

/// Install a peer write: submit to the local target, acknowledge per the
/// negotiated protocol. Resync writes bypass the epoch accounting.
fn apply_peer_write(
    dev: &Device,
    recv: &RecvState,
    block_nr: u64,
    block_id: u64,
    payload: &[u8],
    mode: AckMode,
) {
    let Some(disk) = dev.inner.disk.clone() else {
        let _ = dev.inner.ack_tx.send(AsenderCmd::NegAck { block_nr, block_id });
        return;
    };
    let ln2 = dev.inner.cfg.ln2_blksize();
    let offset = block_nr << ln2;
    let len = payload.len() as u32;

    if matches!(mode, AckMode::Receive) {
        let _ = dev.inner.ack_tx.send(AsenderCmd::RecvAck { block_nr, block_id });
    }

    recv.active.fetch_add(1, Ordering::AcqRel);
    let active = recv.active.clone();
    let dev = dev.clone();
    let want_write_ack = matches!(mode, AckMode::Write | AckMode::Resync);
    let is_resync = matches!(mode, AckMode::Resync);
    disk.submit(
        DiskIo { offset, len, dir: IoDir::Write, payload: Some(Arc::new(payload.to_vec())) },
        Box::new(move |res| {
            active.fetch_sub(1, Ordering::AcqRel);
            match res {
                Ok(_) => {
                    if is_resync {
                        // The freshly written range is in sync by definition.
                        dev.inner.bitmap.set_range_bytes(
                            offset,
                            len as u64,
                            ln2,
                            BlockState::InSync,
                        );
                    }
                    if want_write_ack {
                        let _ = dev
                            .inner
                            .ack_tx
                            .send(AsenderCmd::WriteAck { block_nr, block_id });
                    }
                }
                Err(e) => {
                    warn!(%e, block_nr, "peer write failed locally");
                    let _ = dev.inner.ack_tx.send(AsenderCmd::NegAck { block_nr, block_id });
                }
            }
        }),
    );
}

/// The peer wants one of our blocks (read balancing or its disk died).
fn serve_remote_read(dev: &Device, data_tx: &FramedSender, block_nr: u64, block_id: u64) {
    let usable = dev.inner.disk.is_some() && !dev.lock_core().disk_failed;
    if !usable {
        let _ = dev.inner.ack_tx.send(AsenderCmd::NegAck { block_nr, block_id });
        return;
    }
    let disk = dev.inner.disk.clone().expect("checked above");
    let ln2 = dev.inner.cfg.ln2_blksize();
    let offset = block_nr << ln2;
    let len = dev.inner.cfg.blksize;
    let dev = dev.clone();
    let reply_tx = data_tx.clone();
    disk.submit(
        DiskIo { offset, len, dir: IoDir::Read, payload: None },
        Box::new(move |res| match res {
            Ok(Some(data)) => {
                if reply_tx.send(&Packet::Data { block_nr, block_id, payload: &data }) ==
                    ChanState::Disconnected
                {
                    dev.conn_lost(ConnState::BrokenPipe);
                }
            }
            Ok(None) | Err(_) => {
                let _ = dev.inner.ack_tx.send(AsenderCmd::NegAck { block_nr, block_id });
            }
        }),
    );
}

/// A peer served one of our remote reads.
fn complete_remote_read(dev: &Device, block_id: u64, payload: &[u8]) {
    let sigs = {
        let mut core = dev.lock_core();
        let Some(h) = core.arena.from_block_id(block_id & !ID_READ_FLAG) else {
            proto_violation!("data reply for unknown request {block_id:#x}");
            return;
        };
        if let Some(req) = core.arena.get_mut(h) {
            // Replies are served at block granularity; keep what was asked.
            let n = (req.size as usize).min(payload.len());
            req.read_data = Some(payload[..n].to_vec());
        }
        core.req_mod(h, ReqEvent::DataReceived)
    };
    dev.fire_signals(sigs);
}

impl Device {
    /// Escalation from the sync target: mark every block and restart the
    /// scan; the running SyncSource state picks it up.
    pub(crate) fn force_full_source(&self) {
        self.inner.bitmap.set_all_out_of_sync();
        self.inner.bitmap.reset(self.inner.cfg.ln2_blksize());
        let mut core = self.lock_core();
        if core.cstate == ConnState::Connected {
            core.cstate = ConnState::SyncSource;
        }
        drop(core);
        self.inner.state_wait.notify_all();
    }
}

// ---- asender ---------------------------------------------------------------

fn asender_loop(dev: Device, ctl: &ThreadCtl) {
    let _span = span!(Level::INFO, "", thread = "asender", minor = dev.minor()).entered();
    thread_boot(None, ThreadPriority::OSDefault);

    'outer: while !ctl.should_exit() {
        let _ = ctl.take_restart();

        // Wait for the receiver to hand over an established meta channel.
        let Some((mut meta_chan, my_gen)) = ({
            let mut slot = dev.inner.meta_chan_slot.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                let (guard, _) = dev
                    .inner
                    .asender_wait
                    .wait_timeout(slot, Duration::from_millis(100))
                    .unwrap_or_else(|e| e.into_inner());
                slot = guard;
            }
            slot.take()
        }) else {
            continue;
        };
        let Some(meta_tx) =
            dev.inner.meta_tx.lock().unwrap_or_else(|e| e.into_inner()).clone()
        else {
            continue;
        };

        let mut ping_pending: Option<Instant> = None;
        let mut idle_ping = Repeater::every(dev.inner.cfg.ping_interval);
        idle_ping.reset();
        let mut watchdog = Repeater::every(Duration::from_millis(250));
        watchdog.reset();

        loop {
            if ctl.should_exit() {
                break 'outer;
            }
            if ctl.take_restart() || dev.inner.net_gen.load(Ordering::SeqCst) != my_gen {
                continue 'outer;
            }

            let state = meta_chan.poll_with(POLL, |pkt| {
                handle_meta_packet(&dev, &meta_tx, &mut ping_pending, pkt);
            });
            if state == ChanState::Disconnected {
                dev.conn_lost(ConnState::BrokenPipe);
                continue 'outer;
            }

            // Packets composed by the receiver; we are the only meta writer.
            let mut broke = false;
            while let Ok(cmd) = dev.inner.ack_rx.try_recv() {
                let sent = match cmd {
                    AsenderCmd::WriteAck { block_nr, block_id } => {
                        meta_tx.send(&Packet::WriteAck { block_nr, block_id })
                    }
                    AsenderCmd::RecvAck { block_nr, block_id } => {
                        meta_tx.send(&Packet::RecvAck { block_nr, block_id })
                    }
                    AsenderCmd::NegAck { block_nr, block_id } => {
                        meta_tx.send(&Packet::NegAck { block_nr, block_id })
                    }
                    AsenderCmd::BarrierAck { barrier_nr, set_size } => {
                        meta_tx.send(&Packet::BarrierAck { barrier_nr, set_size })
                    }
                    AsenderCmd::CState(cstate) => {
                        meta_tx.send(&Packet::CStateChanged { cstate })
                    }
                };
                if sent == ChanState::Disconnected {
                    dev.conn_lost(ConnState::BrokenPipe);
                    broke = true;
                    break;
                }
            }
            if broke {
                continue 'outer;
            }

            // Timeout duties.
            if watchdog.fired() && run_watchdogs(&dev, &meta_tx, &mut ping_pending, &mut idle_ping)
            {
                continue 'outer;
            }
        }
    }
    info!("asender exiting");
}

/// Dispatch table for the meta channel.
fn handle_meta_packet(
    dev: &Device,
    meta_tx: &FramedSender,
    ping_pending: &mut Option<Instant>,
    pkt: Packet,
) {
    match pkt {
        Packet::BarrierAck { barrier_nr, set_size } => dev.barrier_acked(barrier_nr, set_size),
        Packet::WriteAck { block_nr, block_id } => {
            if block_id == ID_SYNCER {
                dev.resync_block_acked(block_nr);
            } else {
                dev.peer_acked(block_id, true);
            }
        }
        Packet::RecvAck { block_id, .. } => dev.peer_acked(block_id, false),
        Packet::NegAck { block_nr, block_id } => {
            if block_id == ID_SYNCER {
                warn!(block_nr, "peer rejected a resync block");
                let mut core = dev.lock_core();
                core.rs_pending = core.rs_pending.saturating_sub(1);
            } else {
                dev.peer_nacked(block_id);
            }
        }
        Packet::Ping => {
            let _ = meta_tx.send(&Packet::PingAck);
        }
        Packet::PingAck => *ping_pending = None,
        Packet::CStateChanged { cstate } => match ConnState::from_wire(cstate) {
            Some(ConnState::Connected) => dev.finish_sync_target(),
            Some(state) => debug!(?state, "peer changed state"),
            None => proto_violation!("unknown peer cstate {cstate}"),
        },
        other => proto_violation!("unexpected {other:?} on the meta channel"),
    }
}

/// Ack timeout, disk timeout, ping pacing. Returns true when the connection
/// was torn down.
fn run_watchdogs(
    dev: &Device,
    meta_tx: &FramedSender,
    ping_pending: &mut Option<Instant>,
    idle_ping: &mut Repeater,
) -> bool {
    let now = Instant::now();
    let (ack_deadline, disk_deadline, stalled_data) = {
        let core = dev.lock_core();
        let ack_timeout = core.tune.timeout * core.tune.ko_count.max(1);
        let mut oldest_net: Option<Instant> = None;
        let mut oldest_local: Option<Instant> = None;
        for h in core.arena.handles() {
            let Some(req) = core.arena.get(h) else { continue };
            if req.rq_state.contains(RqState::NET_PENDING) {
                oldest_net = Some(oldest_net.map_or(req.start_time, |t| t.min(req.start_time)));
            }
            if req.rq_state.contains(RqState::LOCAL_PENDING) {
                oldest_local =
                    Some(oldest_local.map_or(req.start_time, |t| t.min(req.start_time)));
            }
        }
        let stalled = dev
            .inner
            .data_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(|tx| tx.stalled_for())
            .is_some_and(|d| d > core.tune.timeout);
        (
            oldest_net.map(|t| t + ack_timeout),
            oldest_local.map(|t| t + dev.inner.cfg.disk_timeout),
            stalled,
        )
    };

    if ack_deadline.is_some_and(|d| d < now) {
        warn!(minor = dev.minor(), "peer stopped acknowledging, timing the connection out");
        dev.conn_lost(ConnState::Timeout);
        return true;
    }
    if disk_deadline.is_some_and(|d| d < now) {
        let mut core = dev.lock_core();
        if !core.disk_failed {
            error!(minor = dev.minor(), "local request exceeded the disk timeout");
            core.disk_failed = true;
        }
    }

    // Ping when the data channel stalls mid-send (are-you-alive probe), when
    // someone requested one, or on plain idleness.
    let want_ping = stalled_data ||
        dev.inner.send_ping.swap(false, Ordering::SeqCst) ||
        idle_ping.fired();
    if want_ping && ping_pending.is_none() {
        if meta_tx.send(&Packet::Ping) == ChanState::Disconnected {
            dev.conn_lost(ConnState::BrokenPipe);
            return true;
        }
        *ping_pending = Some(now);
    }
    if let Some(sent) = *ping_pending {
        let timeout = dev.lock_core().tune.timeout;
        if now.duration_since(sent) > timeout {
            warn!(minor = dev.minor(), "ping went unanswered, timing the connection out");
            dev.conn_lost(ConnState::Timeout);
            return true;
        }
    }
    // A stalled meta channel means our acks are not getting out either.
    let meta_stalled = meta_tx.stalled_for().is_some_and(|d| {
        d > dev.lock_core().tune.timeout
    });
    if meta_stalled {
        warn!(minor = dev.minor(), "meta channel send stalled, tearing down");
        dev.conn_lost(ConnState::Timeout);
        return true;
    }
    false
}

impl Device {
    /// Current data-channel sender, if any. The mutex this clones out of is
    /// the send serialisation point for the data channel.
    pub(crate) fn data_sender(&self) -> Option<FramedSender> {
        self.inner.data_tx.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Peer ack resolution for application writes and remote reads (the
    /// read-traffic flag is stripped before the handle lookup).
    fn peer_acked(&self, block_id: u64, write_ack: bool) {
        let block_id = block_id & !ID_READ_FLAG;
        let sigs = {
            let mut core = self.lock_core();
            let Some(h) = core.arena.from_block_id(block_id) else {
                proto_violation!("ack for unknown request {block_id:#x}");
                return;
            };
            let event = if write_ack {
                if core.cstate == ConnState::SyncSource {
                    // The target just caught up on this range as a side
                    // effect; clear it with the completion.
                    ReqEvent::WriteAckedByPeerAndSis
                } else {
                    ReqEvent::WriteAckedByPeer
                }
            } else {
                ReqEvent::RecvAckedByPeer
            };
            core.req_mod(h, event)
        };
        self.fire_signals(sigs);
    }

    fn peer_nacked(&self, block_id: u64) {
        let block_id = block_id & !ID_READ_FLAG;
        let sigs = {
            let mut core = self.lock_core();
            let Some(h) = core.arena.from_block_id(block_id) else {
                proto_violation!("negative ack for unknown request {block_id:#x}");
                return;
            };
            core.req_mod(h, ReqEvent::NegAcked)
        };
        self.fire_signals(sigs);
    }

    /// The peer confirmed a resync block; clear its bit (through the
    /// coalescer when blocks are finer than bitmap granularity).
    fn resync_block_acked(&self, block_nr: u64) {
        let ln2 = self.inner.cfg.ln2_blksize();
        self.inner.bitmap.set_bit(block_nr, ln2, BlockState::InSync);
        let mut core = self.lock_core();
        core.rs_pending = core.rs_pending.saturating_sub(1);
    }
}

// ---- worker (sender + resync driver) ---------------------------------------

fn worker_loop(dev: Device, ctl: &ThreadCtl) {
    let _span = span!(Level::INFO, "", thread = "worker", minor = dev.minor()).entered();
    thread_boot(None, ThreadPriority::OSDefault);
    let mut pacer = Repeater::every(Duration::from_millis(20));

    loop {
        if ctl.should_exit() {
            break;
        }
        let _ = ctl.take_restart();

        match dev.inner.work_rx.recv_timeout(POLL) {
            Ok(item) => handle_work(&dev, item),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if pacer.fired() {
            drive_resync(&dev);
        }
    }
    info!("worker exiting");
}

fn handle_work(dev: &Device, item: WorkItem) {
    match item {
        WorkItem::SendDBlock(h) => send_dblock(dev, h),
        WorkItem::SendReadReq(h) => send_read_req(dev, h),
        WorkItem::SendOos(h) => send_oos(dev, h),
        WorkItem::SendBarrier => send_barrier(dev),
        WorkItem::ResyncRead { block_nr, result } => forward_resync_block(dev, block_nr, result),
    }
}

fn send_dblock(dev: &Device, h: ReqHandle) {
    let Some((offset, payload, block_id)) = ({
        let core = dev.lock_core();
        core.arena.get(h).and_then(|req| {
            if !req.rq_state.contains(RqState::NET_QUEUED) {
                return None; // stale work item, the net half already resolved
            }
            req.payload.clone().map(|p| (req.byte_offset(), p, h.block_id()))
        })
    }) else {
        return;
    };

    let Some(tx) = dev.data_sender() else {
        let sigs = dev.lock_core().req_mod(h, ReqEvent::SendCanceled);
        dev.fire_signals(sigs);
        return;
    };
    let block_nr = offset >> dev.inner.cfg.ln2_blksize();
    let sent = tx.send(&Packet::Data { block_nr, block_id, payload: &payload });
    if tx.stalled_for().is_some() {
        // The kernel took only part of the frame: have the asender probe
        // whether the peer is still alive while the send continues.
        dev.inner.send_ping.store(true, Ordering::SeqCst);
    }

    let event = match sent {
        ChanState::Alive => ReqEvent::HandedOverToNetwork,
        ChanState::Disconnected => ReqEvent::SendFailed,
    };
    let sigs = dev.lock_core().req_mod(h, event);
    dev.fire_signals(sigs);
    if sent == ChanState::Disconnected {
        dev.conn_lost(ConnState::BrokenPipe);
    }
}

fn send_read_req(dev: &Device, h: ReqHandle) {
    let Some((offset, block_id)) = ({
        let core = dev.lock_core();
        core.arena.get(h).and_then(|req| {
            req.rq_state
                .contains(RqState::NET_QUEUED)
                .then(|| (req.byte_offset(), h.block_id() | ID_READ_FLAG))
        })
    }) else {
        return;
    };

    let Some(tx) = dev.data_sender() else {
        let sigs = dev.lock_core().req_mod(h, ReqEvent::ReadRetryRemoteCanceled);
        dev.fire_signals(sigs);
        return;
    };
    let block_nr = offset >> dev.inner.cfg.ln2_blksize();
    let sent = tx.send(&Packet::Data { block_nr, block_id, payload: &[] });

    let event = match sent {
        ChanState::Alive => ReqEvent::HandedOverToNetwork,
        ChanState::Disconnected => ReqEvent::SendFailed,
    };
    let sigs = dev.lock_core().req_mod(h, event);
    dev.fire_signals(sigs);
    if sent == ChanState::Disconnected {
        dev.conn_lost(ConnState::BrokenPipe);
    }
}

/// Pull-ahead: the data stays home, only the divergence is recorded.
fn send_oos(dev: &Device, h: ReqHandle) {
    let sigs = {
        let mut core = dev.lock_core();
        let Some(req) = core.arena.get(h) else { return };
        if !req.rq_state.contains(RqState::NET_QUEUED) {
            return;
        }
        let (off, len) = (req.byte_offset(), req.size as u64);
        core.bitmap.set_range_bytes(off, len, core.ln2_blksize, BlockState::OutOfSync);
        core.req_mod(h, ReqEvent::OosHandedToNetwork)
    };
    dev.fire_signals(sigs);
}

/// Close the epoch on the wire. The ring insertion and the wire write share
/// the send-mutex critical section so wire epochs equal log epochs.
fn send_barrier(dev: &Device) {
    let closing = dev.inner.tl.nr_issue();
    let blocked = {
        let core = dev.lock_core();
        core.arena.handles().iter().any(|&h| {
            core.arena.get(h).is_some_and(|req| {
                req.in_tl &&
                    req.epoch == closing &&
                    req.rq_state.contains(RqState::LOCAL_PENDING)
            })
        })
    };
    if blocked {
        // A local write in this epoch is still in flight; the barrier must
        // not pass it.
        thread::sleep(Duration::from_micros(500));
        let _ = dev.inner.work_tx.send(WorkItem::SendBarrier);
        return;
    }

    let guard = dev.inner.data_tx.lock().unwrap_or_else(|e| e.into_inner());
    let Some(tx) = guard.as_ref() else {
        return; // disconnected; the epoch died with tl_clear
    };
    let barrier_nr = dev.inner.tl.add_barrier();
    let sent = tx.send(&Packet::Barrier { barrier_nr });
    drop(guard);
    if sent == ChanState::Disconnected {
        dev.conn_lost(ConnState::BrokenPipe);
    }
}

/// SyncSource driver: walk the dirty bitmap, read blocks, ship them tagged
/// `ID_SYNCER` so the peer acks without logging them.
fn drive_resync(dev: &Device) {
    let ln2 = dev.inner.cfg.ln2_blksize();
    loop {
        {
            let core = dev.lock_core();
            if core.cstate != ConnState::SyncSource {
                return;
            }
            if core.rs_pending >= dev.inner.cfg.resync_window {
                return;
            }
        }
        let Some(block_nr) = dev.inner.bitmap.next_dirty(ln2) else {
            let done = {
                let core = dev.lock_core();
                core.rs_pending == 0
            };
            if done && dev.inner.bitmap.dirty_bits() == 0 {
                dev.finish_sync_source();
                let _ = dev
                    .inner
                    .ack_tx
                    .send(AsenderCmd::CState(ConnState::Connected.wire_id()));
            } else if done {
                // Unacked blocks remain dirty; run the scan again.
                dev.inner.bitmap.reset(ln2);
            }
            return;
        };

        let Some(disk) = dev.inner.disk.clone() else {
            warn!("sync source without a usable disk, aborting resync");
            dev.set_cstate(ConnState::Connected);
            return;
        };
        dev.lock_core().rs_pending += 1;
        let offset = block_nr << ln2;
        let len = dev.inner.cfg.blksize;
        let work_tx = dev.inner.work_tx.clone();
        disk.submit(
            DiskIo { offset, len, dir: IoDir::Read, payload: None },
            Box::new(move |res| {
                let result = match res {
                    Ok(Some(data)) => Ok(data),
                    Ok(None) | Err(_) => Err(()),
                };
                let _ = work_tx.send(WorkItem::ResyncRead { block_nr, result });
            }),
        );
    }
}

fn forward_resync_block(dev: &Device, block_nr: u64, result: Result<Vec<u8>, ()>) {
    match result {
        Ok(data) => {
            let sent = match dev.data_sender() {
                Some(tx) => {
                    tx.send(&Packet::Data { block_nr, block_id: ID_SYNCER, payload: &data })
                }
                None => ChanState::Disconnected,
            };
            if sent == ChanState::Disconnected {
                let mut core = dev.lock_core();
                core.rs_pending = core.rs_pending.saturating_sub(1);
            }
        }
        Err(()) => {
            error!(block_nr, "resync read failed, block stays dirty");
            let mut core = dev.lock_core();
            core.rs_pending = core.rs_pending.saturating_sub(1);
        }
    }
}

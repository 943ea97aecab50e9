use std::{sync::Arc, time::Instant};

use tandem_sync::BlockState;
use tracing::{info, warn};

use crate::{
    config::{OnCongestion, ReadBalancing},
    device::{ConnState, Core, Device, Role},
    error::{DeviceError, IoError},
    request::{
        MasterIo, ReadDone, ReqEvent, Request, RetryIo, RqState, SECTOR_SHIFT, WriteDone,
    },
    target::{DiskIo, IoDir},
    worker::WorkItem,
};

/// Where a read will be served.
fn read_balance(core: &mut Core, congested: bool, sector: u64) -> bool {
    match core.tune.read_balancing {
        ReadBalancing::PreferLocal => false,
        ReadBalancing::PreferRemote => true,
        ReadBalancing::LeastPending => core.local_cnt > core.ap_pending + core.rs_pending,
        ReadBalancing::RoundRobin => {
            core.rr_toggle = !core.rr_toggle;
            core.rr_toggle
        }
        ReadBalancing::CongestedRemote => congested,
        ReadBalancing::Striping { shift } => (sector >> shift) & 1 == 1,
    }
}

impl Device {
    fn validate(&self, sector: u64, size: u32) -> Result<(), DeviceError> {
        let backing_limit =
            self.inner.disk.as_ref().map_or(u32::MAX, |d| d.max_request());
        if size == 0 || self.inner.cfg.clamp_io(size, backing_limit) != size {
            return Err(DeviceError::TooLarge);
        }
        if (sector << SECTOR_SHIFT) + size as u64 > self.inner.cfg.capacity {
            return Err(DeviceError::OutOfRange);
        }
        Ok(())
    }

    /// Accept a write from the upper layer. Synchronous rejections come back
    /// as `Err`; everything else reports through `done` once the completion
    /// policy of the negotiated protocol is satisfied.
    pub fn submit_write(
        &self,
        sector: u64,
        payload: Vec<u8>,
        done: WriteDone,
    ) -> Result<(), DeviceError> {
        self.write_inner(sector, Arc::new(payload), done).map_err(|(e, _done)| e)
    }

    /// Retry-path variant: rejections are delivered through the callback.
    pub(crate) fn submit_write_shared(&self, sector: u64, payload: Arc<Vec<u8>>, done: WriteDone) {
        if let Err((e, done)) = self.write_inner(sector, payload, done) {
            warn!(%e, sector, "postponed write could not be re-driven");
            done(Err(IoError::Aborted));
        }
    }

    fn write_inner(
        &self,
        sector: u64,
        payload: Arc<Vec<u8>>,
        done: WriteDone,
    ) -> Result<(), (DeviceError, WriteDone)> {
        let size = payload.len() as u32;
        if let Err(e) = self.validate(sector, size) {
            return Err((e, done));
        }
        let offset = sector << SECTOR_SHIFT;

        let local_ok = self.inner.disk.is_some() && !self.lock_core().disk_failed;
        // Activity-log reference before the core lock: this may block on an
        // on-disk extent update.
        let al_ref = if local_ok { Some(self.inner.al.get(offset, size)) } else { None };

        let mut core = self.lock_core();
        if core.role != Role::Primary {
            return Err((DeviceError::NotPrimary, done));
        }
        if core.suspended {
            core.frozen.push(RetryIo {
                sector,
                size,
                payload: Some(payload),
                master: MasterIo::Write(done),
            });
            return Ok(());
        }

        // Conflict resolution: wait until no in-flight write overlaps; the
        // holder wakes us when its interval leaves the tree.
        while core.write_requests.mark_conflict(offset, size).is_some() {
            core = self
                .inner
                .misc_wait
                .wait(core)
                .unwrap_or_else(|e| e.into_inner());
            if core.suspended {
                core.frozen.push(RetryIo {
                    sector,
                    size,
                    payload: Some(payload),
                    master: MasterIo::Write(done),
                });
                return Ok(());
            }
        }

        // Congestion may flip the peer to pull-ahead or drop it entirely,
        // before this write is queued.
        let mut disconnect_after = false;
        if core.should_do_remote() && core.tune.on_congestion != OnCongestion::Block {
            let congested = core.ap_in_flight >= self.inner.cfg.cong_fill ||
                self.inner.al.extents_in_use() >= self.inner.cfg.cong_extents;
            if congested {
                match core.tune.on_congestion {
                    OnCongestion::PullAhead => {
                        if !core.ahead {
                            info!(minor = self.minor(), "congested, pulling ahead of the peer");
                            core.ahead = true;
                        }
                    }
                    OnCongestion::Disconnect => disconnect_after = true,
                    OnCongestion::Block => {}
                }
            }
        }

        let remote = core.should_do_remote() && !disconnect_after;
        let send_oos = !remote && core.should_send_oos();

        if !local_ok && !remote && !send_oos {
            // Nothing can serve this write. It stays unconfirmed, so its
            // range must read dirty before the error goes up.
            core.bitmap.set_range_bytes(
                offset,
                size as u64,
                core.ln2_blksize,
                BlockState::OutOfSync,
            );
            drop(core);
            done(Err(IoError::ReplicasFailed));
            return Ok(());
        }

        let mut state = RqState::WRITE;
        if al_ref.is_some() {
            state.insert(RqState::IN_ACT_LOG);
        }
        let req = Request {
            sector,
            size,
            rq_state: state,
            epoch: core.current_epoch_nr,
            start_time: Instant::now(),
            master: Some(MasterIo::Write(done)),
            payload: Some(payload.clone()),
            read_data: None,
            local_error: None,
            in_tl: false,
            al_ref,
        };
        let h = match core.arena.alloc(req) {
            Ok(h) => h,
            Err(mut req) => {
                let Some(MasterIo::Write(done)) = req.master.take() else { unreachable!() };
                return Err((DeviceError::NoResources, done));
            }
        };

        core.write_requests.insert(offset, size, h);

        let mut sigs = Vec::new();
        if remote {
            // Only mirrored writes enter the ring: the peer's epoch size
            // counts the data packets it received.
            core.tl.add(h);
            if let Some(req) = core.arena.get_mut(h) {
                req.in_tl = true;
            }
            core.current_epoch_writes += 1;
            if core.current_epoch_writes >= core.tune.max_epoch_size {
                core.maybe_start_new_epoch();
            }
            core.req_mod_into(h, ReqEvent::ToBeSent, &mut sigs);
            core.req_mod_into(h, ReqEvent::QueueForNetWrite, &mut sigs);
            let _ = core.work_tx.send(WorkItem::SendDBlock(h));
        } else if send_oos {
            core.req_mod_into(h, ReqEvent::QueueForSendOos, &mut sigs);
            let _ = core.work_tx.send(WorkItem::SendOos(h));
        }
        if local_ok {
            core.req_mod_into(h, ReqEvent::ToBeSubmitted, &mut sigs);
        }
        drop(core);

        self.fire_signals(sigs);
        if disconnect_after {
            warn!(minor = self.minor(), "congestion policy: dropping the connection");
            self.conn_lost(ConnState::StandAlone);
        }
        if local_ok {
            let disk = self.inner.disk.as_ref().expect("local_ok implies a disk").clone();
            let dev = self.clone();
            disk.submit(
                DiskIo { offset, len: size, dir: IoDir::Write, payload: Some(payload) },
                Box::new(move |res| dev.local_endio(h, res)),
            );
        }
        Ok(())
    }

    /// Accept a read. Serving replica is chosen from the bitmap's in-sync
    /// state plus the read-balancing policy.
    pub fn submit_read(&self, sector: u64, size: u32, done: ReadDone) -> Result<(), DeviceError> {
        self.read_inner(sector, size, done).map_err(|(e, _done)| e)
    }

    pub(crate) fn submit_read_cb(&self, sector: u64, size: u32, done: ReadDone) {
        if let Err((e, done)) = self.read_inner(sector, size, done) {
            warn!(%e, sector, "postponed read could not be re-driven");
            done(Err(IoError::Aborted));
        }
    }

    fn read_inner(
        &self,
        sector: u64,
        size: u32,
        done: ReadDone,
    ) -> Result<(), (DeviceError, ReadDone)> {
        if let Err(e) = self.validate(sector, size) {
            return Err((e, done));
        }
        let offset = sector << SECTOR_SHIFT;

        let mut core = self.lock_core();
        if core.suspended {
            core.frozen.push(RetryIo {
                sector,
                size,
                payload: None,
                master: MasterIo::Read(done),
            });
            return Ok(());
        }

        let local_ok = self.inner.disk.is_some() && !core.disk_failed;
        // An out-of-sync block on a resync target only exists on the peer.
        let must_remote = core.cstate == ConnState::SyncTarget &&
            self.inner.bitmap.range_dirty_bytes(offset, size as u64);

        let remote = if !local_ok || must_remote {
            if !core.peer_usable() {
                drop(core);
                done(Err(IoError::ReplicasFailed));
                return Ok(());
            }
            true
        } else if core.peer_usable() {
            let congested = self.inner.disk.as_ref().is_some_and(|d| d.congested());
            read_balance(&mut core, congested, sector)
        } else {
            false
        };

        let req = Request {
            sector,
            size,
            rq_state: RqState::empty(),
            epoch: core.current_epoch_nr,
            start_time: Instant::now(),
            master: Some(MasterIo::Read(done)),
            payload: None,
            read_data: None,
            local_error: None,
            in_tl: false,
            al_ref: None,
        };
        let h = match core.arena.alloc(req) {
            Ok(h) => h,
            Err(mut req) => {
                let Some(MasterIo::Read(done)) = req.master.take() else { unreachable!() };
                return Err((DeviceError::NoResources, done));
            }
        };
        core.read_requests.insert(offset, size, h);

        let mut sigs = Vec::new();
        if remote {
            // The private local bio is never created for a remote read.
            core.req_mod_into(h, ReqEvent::ToBeSent, &mut sigs);
            core.req_mod_into(h, ReqEvent::QueueForNetRead, &mut sigs);
            let _ = core.work_tx.send(WorkItem::SendReadReq(h));
        } else {
            core.req_mod_into(h, ReqEvent::ToBeSubmitted, &mut sigs);
        }
        drop(core);

        self.fire_signals(sigs);
        if !remote {
            let disk = self.inner.disk.as_ref().expect("local read implies a disk").clone();
            let dev = self.clone();
            disk.submit(
                DiskIo { offset, len: size, dir: IoDir::Read, payload: None },
                Box::new(move |res| dev.local_endio(h, res)),
            );
        }
        Ok(())
    }
}

use tandem_sync::{Authority, MetaRecord};
use tandem_wire::{
    ReportParams, STATE_CONSISTENT, STATE_PRIMARY, STATE_WANT_FULL_SYNC, WIRE_VERSION,
};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::device::{ConnState, Device, Role};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("peer runs wire version {0}, we run {v}", v = WIRE_VERSION)]
    Version(u32),
    #[error("peer device size {0} does not match ours")]
    Size(u64),
    #[error("peer block size {0} does not match ours")]
    BlockSize(u32),
    #[error("peer negotiated protocol {0:?}, we are configured for {1:?}")]
    Protocol(u32, crate::config::Protocol),
    #[error("both replicas claim the Primary role")]
    TwoPrimaries,
    #[error("both replicas are inconsistent, refusing to pick a survivor")]
    BothInconsistent,
}

/// What the generation comparison told us to do with this connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SyncDecision {
    /// Replicas agree; plain Connected.
    Stay,
    /// We hold the good data and feed the peer.
    Source { full: bool },
    /// The peer holds the good data; our bitmap may or may not suffice.
    Target { full: bool },
}

/// Pure decision kernel, evaluated identically on both nodes from the local
/// record plus the peer's wire parameters.
pub(crate) fn decide(
    local: &MetaRecord,
    own_gen_snap: Option<[u32; 4]>,
    bm_gen: Option<[u32; 4]>,
    remote: &MetaRecord,
    remote_wants_full: bool,
    local_dirty_bits: u64,
) -> Result<SyncDecision, HandshakeError> {
    match local.compare(remote) {
        Authority::Tie => {
            if !local.consistent() && !remote.consistent() {
                return Err(HandshakeError::BothInconsistent);
            }
            if !local.consistent() {
                // Crash during a resync we were the target of.
                return Ok(SyncDecision::Target { full: true });
            }
            if !remote.consistent() {
                return Ok(SyncDecision::Source { full: true });
            }
            if remote_wants_full {
                return Ok(SyncDecision::Source { full: true });
            }
            if local_dirty_bits > 0 {
                // Equal generations but unconfirmed writes in the bitmap:
                // drain them without a full pass.
                return Ok(SyncDecision::Source { full: false });
            }
            Ok(SyncDecision::Stay)
        }
        Authority::LocalGood => {
            if remote_wants_full {
                return Ok(SyncDecision::Source { full: true });
            }
            // Mirror of the target-side predicate: our counters unchanged
            // since the snapshot means the peer's bitmap-generation check
            // will pass over there.
            let partial =
                local.syncq_ok(&own_gen_snap.unwrap_or_default(), remote, Authority::LocalGood);
            Ok(SyncDecision::Source { full: !partial })
        }
        Authority::PeerGood => {
            let partial =
                local.syncq_ok(&bm_gen.unwrap_or_default(), remote, Authority::PeerGood);
            Ok(SyncDecision::Target { full: !partial })
        }
    }
}

/// Reconstruct the peer's generation record from its wire parameters.
pub(crate) fn remote_record(p: &ReportParams) -> MetaRecord {
    let mut md = MetaRecord {
        human_cnt: p.gen_cnt[0],
        timeout_cnt: p.gen_cnt[1],
        connected_cnt: p.gen_cnt[2],
        arbitrary_cnt: p.gen_cnt[3],
        ..Default::default()
    };
    md.set_primary(p.gen_cnt[4] == 1);
    md.set_consistent(p.state & STATE_CONSISTENT != 0);
    md
}

impl Device {
    /// Our half of the parameter exchange.
    pub(crate) fn build_params(&self, want_full_sync: bool) -> ReportParams {
        let core = self.lock_core();
        let meta = self.inner.meta.lock().unwrap_or_else(|e| e.into_inner());
        let mut state = 0;
        if core.role == Role::Primary {
            state |= STATE_PRIMARY;
        }
        if meta.consistent() {
            state |= STATE_CONSISTENT;
        }
        if want_full_sync {
            state |= STATE_WANT_FULL_SYNC;
        }
        let r#gen = meta.gen_cnt();
        ReportParams {
            size: self.inner.cfg.capacity,
            blksize: self.inner.cfg.blksize,
            state,
            protocol: core.tune.protocol.wire_id(),
            version: WIRE_VERSION,
            gen_cnt: [r#gen[0], r#gen[1], r#gen[2], r#gen[3], meta.primary_ind()],
        }
    }

    /// Validate the peer's parameters and apply the sync decision. Returns
    /// the decision so the receiver can escalate a full-sync request.
    pub(crate) fn apply_handshake(
        &self,
        remote: ReportParams,
    ) -> Result<SyncDecision, HandshakeError> {
        if remote.version != WIRE_VERSION {
            return Err(HandshakeError::Version(remote.version));
        }
        if remote.size != self.inner.cfg.capacity {
            return Err(HandshakeError::Size(remote.size));
        }
        if remote.blksize != self.inner.cfg.blksize {
            return Err(HandshakeError::BlockSize(remote.blksize));
        }

        let (protocol, role) = {
            let core = self.lock_core();
            (core.tune.protocol, core.role)
        };
        if remote.protocol != protocol.wire_id() {
            return Err(HandshakeError::Protocol(remote.protocol, protocol));
        }
        if role == Role::Primary && remote.state & STATE_PRIMARY != 0 {
            return Err(HandshakeError::TwoPrimaries);
        }

        let remote_md = remote_record(&remote);
        let decision = {
            let meta = self.inner.meta.lock().unwrap_or_else(|e| e.into_inner());
            let own_snap = *self.inner.own_gen_snap.lock().unwrap_or_else(|e| e.into_inner());
            let bm_gen = *self.inner.bm_gen.lock().unwrap_or_else(|e| e.into_inner());
            decide(
                &meta,
                own_snap,
                bm_gen,
                &remote_md,
                remote.state & STATE_WANT_FULL_SYNC != 0,
                self.inner.bitmap.dirty_bits(),
            )?
        };

        // A reconnect is a generation event; snapshot the post-bump values
        // both sides will agree on at the next handshake.
        {
            let mut meta = self.inner.meta.lock().unwrap_or_else(|e| e.into_inner());
            meta.bump_connected();
            match decision {
                SyncDecision::Target { full: true } => meta.set_consistent(false),
                SyncDecision::Target { full: false } => {}
                SyncDecision::Source { .. } | SyncDecision::Stay => {}
            }
            if let Err(e) = meta.write(&self.inner.cfg.meta_path) {
                error!(%e, "couldn't persist connected generation bump");
            }
            *self.inner.own_gen_snap.lock().unwrap_or_else(|e| e.into_inner()) =
                Some(meta.gen_cnt());
            *self.inner.bm_gen.lock().unwrap_or_else(|e| e.into_inner()) = Some([
                remote.gen_cnt[0],
                remote.gen_cnt[1],
                remote.gen_cnt[2] + 1,
                remote.gen_cnt[3],
            ]);
        }
        let new_cstate = match decision {
            SyncDecision::Stay => ConnState::Connected,
            SyncDecision::Source { full } => {
                if full {
                    warn!(minor = self.minor(), "full resync required, marking everything");
                    self.inner.bitmap.set_all_out_of_sync();
                }
                self.inner.bitmap.reset(self.inner.cfg.ln2_blksize());
                ConnState::SyncSource
            }
            SyncDecision::Target { full } => {
                if full {
                    warn!(minor = self.minor(), "becoming target of a full resync");
                    // Every local block is suspect until the stream covers
                    // it; reads route to the peer meanwhile.
                    self.inner.bitmap.set_all_out_of_sync();
                }
                ConnState::SyncTarget
            }
        };

        {
            let mut core = self.lock_core();
            core.cstate = new_cstate;
            core.ahead = false;
        }
        info!(minor = self.minor(), ?decision, ?new_cstate, "handshake complete");
        self.inner.state_wait.notify_all();
        Ok(decision)
    }

    /// The source told us the resync stream is complete: we hold identical
    /// data now.
    pub(crate) fn finish_sync_target(&self) {
        {
            let mut core = self.lock_core();
            if core.cstate != ConnState::SyncTarget {
                return;
            }
            core.cstate = ConnState::Connected;
        }
        let mut meta = self.inner.meta.lock().unwrap_or_else(|e| e.into_inner());
        meta.set_consistent(true);
        meta.set_primary(false);
        if let Err(e) = meta.write(&self.inner.cfg.meta_path) {
            error!(%e, "couldn't persist consistency after resync");
        }
        drop(meta);
        info!(minor = self.minor(), "resync complete, replicas consistent");
        self.inner.state_wait.notify_all();
    }

    /// Source-side resync completion: scan exhausted and every syncer block
    /// acknowledged.
    pub(crate) fn finish_sync_source(&self) {
        {
            let mut core = self.lock_core();
            if core.cstate != ConnState::SyncSource {
                return;
            }
            core.cstate = ConnState::Connected;
        }
        let mut meta = self.inner.meta.lock().unwrap_or_else(|e| e.into_inner());
        meta.set_primary(false);
        if let Err(e) = meta.write(&self.inner.cfg.meta_path) {
            error!(%e, "couldn't clear degraded-promotion mark");
        }
        drop(meta);
        info!(minor = self.minor(), "resync stream drained, replicas consistent");
        self.inner.state_wait.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consistent(r#gen: [u32; 4]) -> MetaRecord {
        MetaRecord {
            human_cnt: r#gen[0],
            timeout_cnt: r#gen[1],
            connected_cnt: r#gen[2],
            arbitrary_cnt: r#gen[3],
            ..Default::default()
        }
    }

    #[test]
    fn equal_consistent_records_stay_connected() {
        let a = consistent([1, 1, 2, 1]);
        let d = decide(&a, None, None, &a, false, 0).unwrap();
        assert_eq!(d, SyncDecision::Stay);
    }

    #[test]
    fn dirty_bitmap_on_a_tie_drains_partially() {
        let a = consistent([1, 1, 2, 1]);
        let d = decide(&a, None, None, &a, false, 7).unwrap();
        assert_eq!(d, SyncDecision::Source { full: false });
    }

    #[test]
    fn timeout_survivor_feeds_the_peer() {
        let mut source = consistent([1, 1, 2, 1]);
        source.bump_timeout();
        let target = consistent([1, 1, 2, 1]);

        // Target side: its snapshot of the source's counters is current.
        let d = decide(&target, None, Some(source.gen_cnt()), &source, false, 0).unwrap();
        assert_eq!(d, SyncDecision::Target { full: false });

        // Source side mirror: its own counters moved since the snapshot, so
        // it must assume the peer's bitmap is stale.
        let d = decide(&source, Some([1, 1, 2, 1]), None, &target, false, 0).unwrap();
        assert_eq!(d, SyncDecision::Source { full: true });
    }

    #[test]
    fn inconsistent_side_is_always_the_target() {
        let mut crashed = consistent([1, 1, 2, 1]);
        crashed.set_consistent(false);
        let healthy = consistent([1, 1, 2, 1]);

        assert_eq!(
            decide(&crashed, None, None, &healthy, false, 0).unwrap(),
            SyncDecision::Target { full: true }
        );
        assert_eq!(
            decide(&healthy, None, None, &crashed, false, 0).unwrap(),
            SyncDecision::Source { full: true }
        );
    }

    #[test]
    fn both_inconsistent_refuses() {
        let mut a = consistent([1, 1, 2, 1]);
        a.set_consistent(false);
        assert_eq!(decide(&a, None, None, &a, false, 0), Err(HandshakeError::BothInconsistent));
    }

    #[test]
    fn peer_escalation_forces_full() {
        let a = consistent([2, 1, 2, 1]);
        let b = consistent([1, 1, 2, 1]);
        let d = decide(&a, Some(a.gen_cnt()), None, &b, true, 0).unwrap();
        assert_eq!(d, SyncDecision::Source { full: true });
    }
}

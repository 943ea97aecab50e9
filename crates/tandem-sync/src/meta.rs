use std::{
    cmp::Ordering,
    fs,
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{info, warn};

/// Identifies a tandem metadata file.
pub const MD_MAGIC: u32 = 0x544d_4431;

/// Bit layout of the flags word. Only the role bit takes part in the
/// authority comparison; the inconsistent bit survives crashes so a node
/// that died mid-resync never claims clean data.
const FLAG_PRIMARY: u32 = 1 << 0;
const FLAG_INCONSISTENT: u32 = 1 << 1;

const RECORD_WORDS: usize = 6;
const RECORD_BYTES: usize = RECORD_WORDS * 4;

#[derive(Error, Debug)]
pub enum MetaError {
    #[error("metadata io: {0}")]
    Io(#[from] io::Error),
}

/// Which replica holds the authoritative data after a disconnect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Authority {
    LocalGood,
    Tie,
    PeerGood,
}

/// The per-device generation record: four event counters plus a flags word,
/// persisted as six 32-bit big-endian words (the sixth is the magic).
///
/// The counters advance on well-defined life events and decide, compared
/// lexicographically against the peer's copy, which side's data survives a
/// split.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MetaRecord {
    pub human_cnt: u32,
    pub timeout_cnt: u32,
    pub connected_cnt: u32,
    pub arbitrary_cnt: u32,
    pub flags: u32,
}

impl Default for MetaRecord {
    fn default() -> Self {
        Self { human_cnt: 1, timeout_cnt: 1, connected_cnt: 1, arbitrary_cnt: 1, flags: 0 }
    }
}

impl MetaRecord {
    /// Load the record, byte-swapping from disk order. A short read or a
    /// magic mismatch reinitialises the counters to 1 and writes the fresh
    /// record back.
    pub fn read(path: &Path) -> Result<Self, MetaError> {
        let mut buf = [0u8; RECORD_BYTES];
        let fresh = match fs::File::open(path) {
            Ok(mut f) => match f.read_exact(&mut buf) {
                Ok(()) => {
                    let words: Vec<u32> = buf
                        .chunks_exact(4)
                        .map(|c| u32::from_be_bytes(c.try_into().unwrap()))
                        .collect();
                    if words[5] == MD_MAGIC {
                        return Ok(Self {
                            human_cnt: words[0],
                            timeout_cnt: words[1],
                            connected_cnt: words[2],
                            arbitrary_cnt: words[3],
                            flags: words[4],
                        });
                    }
                    warn!(?path, magic = words[5], "metadata magic mismatch, reinitialising");
                    true
                }
                Err(e) => {
                    warn!(?path, %e, "short metadata read, reinitialising");
                    true
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(?path, "no metadata yet, initialising");
                true
            }
            Err(e) => return Err(e.into()),
        };
        debug_assert!(fresh);
        let md = Self::default();
        md.write(path)?;
        Ok(md)
    }

    /// Atomically overwrite the record: write-and-fsync a sibling temp file,
    /// then rename over the target. The record is durable when this returns.
    pub fn write(&self, path: &Path) -> Result<(), MetaError> {
        let mut buf = [0u8; RECORD_BYTES];
        for (chunk, word) in buf.chunks_exact_mut(4).zip([
            self.human_cnt,
            self.timeout_cnt,
            self.connected_cnt,
            self.arbitrary_cnt,
            self.flags,
            MD_MAGIC,
        ]) {
            chunk.copy_from_slice(&word.to_be_bytes());
        }

        let tmp: PathBuf = path.with_extension("new");
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&buf)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        if let Some(dir) = path.parent() {
            if let Ok(d) = fs::File::open(dir) {
                let _ = d.sync_all();
            }
        }
        Ok(())
    }

    /// The five compared generation values, in comparison order. The flags
    /// word contributes only its role bit.
    fn cmp_key(&self) -> [u32; 5] {
        [
            self.human_cnt,
            self.timeout_cnt,
            self.connected_cnt,
            self.arbitrary_cnt,
            self.primary_ind(),
        ]
    }

    /// First four counters, the shape `bm_gen` snapshots take.
    pub fn gen_cnt(&self) -> [u32; 4] {
        [self.human_cnt, self.timeout_cnt, self.connected_cnt, self.arbitrary_cnt]
    }

    /// Lexicographic compare of the five generation values decides
    /// post-disconnect authority.
    pub fn compare(&self, remote: &MetaRecord) -> Authority {
        match self.cmp_key().cmp(&remote.cmp_key()) {
            Ordering::Greater => Authority::LocalGood,
            Ordering::Equal => Authority::Tie,
            Ordering::Less => Authority::PeerGood,
        }
    }

    /// Whether a partial (bitmap-driven) resync is sufficient, evaluated on
    /// the side that would become sync target. Requires: both replicas
    /// consistent, the authoritative side not crash-promoted, and the local
    /// bitmap generation matching the authoritative side's counters.
    pub fn syncq_ok(&self, local_bm_gen: &[u32; 4], remote: &MetaRecord, who: Authority) -> bool {
        if !self.consistent() || !remote.consistent() {
            return false;
        }
        let (good, bm_gen) = match who {
            Authority::PeerGood => (remote, *local_bm_gen),
            // On a tie there is nothing to fetch; callers only ask when a
            // sync is already decided, so fail toward the full path.
            Authority::Tie => return false,
            Authority::LocalGood => (self, *local_bm_gen),
        };
        if good.primary_ind() == 1 {
            // Crash-induced promotion: the counter trail is not trustworthy.
            return false;
        }
        bm_gen == good.gen_cnt()
    }

    pub fn primary_ind(&self) -> u32 {
        self.flags & FLAG_PRIMARY
    }

    pub fn set_primary(&mut self, primary: bool) {
        if primary {
            self.flags |= FLAG_PRIMARY;
        } else {
            self.flags &= !FLAG_PRIMARY;
        }
    }

    pub fn consistent(&self) -> bool {
        self.flags & FLAG_INCONSISTENT == 0
    }

    pub fn set_consistent(&mut self, consistent: bool) {
        if consistent {
            self.flags &= !FLAG_INCONSISTENT;
        } else {
            self.flags |= FLAG_INCONSISTENT;
        }
    }

    /// Administrator intervention (forced promotion, invalidate, …).
    pub fn bump_human(&mut self) {
        self.human_cnt += 1;
    }

    /// The peer stopped acknowledging and we timed it out.
    pub fn bump_timeout(&mut self) {
        self.timeout_cnt += 1;
    }

    /// A connection handshake completed.
    pub fn bump_connected(&mut self) {
        self.connected_cnt += 1;
    }

    /// Promotion without a reachable peer and without administrator input.
    pub fn bump_arbitrary(&mut self) {
        self.arbitrary_cnt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_preserves_counters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("md0");

        let mut md = MetaRecord::default();
        md.bump_connected();
        md.bump_timeout();
        md.set_primary(true);
        md.set_consistent(false);
        md.write(&path).unwrap();

        let back = MetaRecord::read(&path).unwrap();
        assert_eq!(back, md);
        assert_eq!(back.primary_ind(), 1);
        assert!(!back.consistent());
    }

    #[test]
    fn bad_magic_reinitialises() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("md0");
        fs::write(&path, [0xffu8; RECORD_BYTES]).unwrap();

        let md = MetaRecord::read(&path).unwrap();
        assert_eq!(md, MetaRecord::default());
        // And the rewrite is durable.
        assert_eq!(MetaRecord::read(&path).unwrap(), md);
    }

    #[test]
    fn short_read_reinitialises() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("md0");
        fs::write(&path, [0u8; 7]).unwrap();
        assert_eq!(MetaRecord::read(&path).unwrap(), MetaRecord::default());
    }

    #[test]
    fn compare_is_lexicographic() {
        let a = MetaRecord { human_cnt: 3, ..Default::default() };
        let b = MetaRecord { human_cnt: 2, timeout_cnt: 9, ..Default::default() };
        assert_eq!(a.compare(&b), Authority::LocalGood);
        assert_eq!(b.compare(&a), Authority::PeerGood);
        assert_eq!(b.compare(&b), Authority::Tie);
    }

    #[test]
    fn primary_bit_breaks_ties() {
        let mut a = MetaRecord::default();
        let b = MetaRecord::default();
        a.set_primary(true);
        assert_eq!(a.compare(&b), Authority::LocalGood);
    }

    #[test]
    fn crash_during_sync_forces_full_resync() {
        // Equal counters but the local replica died mid-resync.
        let mut local = MetaRecord {
            human_cnt: 3,
            timeout_cnt: 0,
            connected_cnt: 2,
            arbitrary_cnt: 0,
            flags: 0,
        };
        local.set_primary(true);
        let remote = local;
        local.set_consistent(false);

        assert_eq!(local.compare(&remote), Authority::Tie);
        let bm_gen = local.gen_cnt();
        assert!(!local.syncq_ok(&bm_gen, &remote, Authority::Tie));
        assert!(!local.syncq_ok(&bm_gen, &remote, Authority::PeerGood));
    }

    #[test]
    fn partial_resync_when_bitmap_generation_matches() {
        let local = MetaRecord::default();
        let mut remote = MetaRecord::default();
        remote.bump_timeout();

        assert_eq!(local.compare(&remote), Authority::PeerGood);
        let bm_gen = remote.gen_cnt();
        assert!(local.syncq_ok(&bm_gen, &remote, Authority::PeerGood));

        // Stale snapshot: the peer advanced past what our bitmap covers.
        let stale = MetaRecord::default().gen_cnt();
        assert!(!local.syncq_ok(&stale, &remote, Authority::PeerGood));
    }

    #[test]
    fn crash_promoted_authority_is_not_trusted() {
        let local = MetaRecord::default();
        let mut remote = MetaRecord::default();
        remote.bump_timeout();
        remote.set_primary(true);

        let bm_gen = remote.gen_cnt();
        assert!(!local.syncq_ok(&bm_gen, &remote, Authority::PeerGood));
    }
}

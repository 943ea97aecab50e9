use std::{
    any::Any,
    io,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use spin::Mutex;

/// Direction of a backing-device request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoDir {
    Read,
    Write,
}

/// One request handed to the local block target.
pub struct DiskIo {
    pub offset: u64,
    pub len: u32,
    pub dir: IoDir,
    /// Present for writes.
    pub payload: Option<Arc<Vec<u8>>>,
}

/// Endio callback; reads resolve to the bytes, writes to `None`.
pub type DiskDone = Box<dyn FnOnce(io::Result<Option<Vec<u8>>>) + Send>;

/// The local block target as the engine sees it: submit with endio
/// semantics, nothing more. The callback may run inline or from another
/// thread; the engine never holds its core lock across `submit`.
pub trait BackingDisk: Send + Sync {
    fn submit(&self, io: DiskIo, done: DiskDone);

    /// Queue-depth hint for the congested-remote read policy.
    fn congested(&self) -> bool {
        false
    }

    /// Largest request the target accepts, for the merge clamp.
    fn max_request(&self) -> u32 {
        u32::MAX
    }

    fn capacity(&self) -> u64;
}

/// The activity-log seam: writes that will touch the local disk hold a
/// reference over the covered extent across submission. The real log is an
/// external collaborator; the engine only takes and drops references.
pub trait ActivityLog: Send + Sync {
    fn get(&self, offset: u64, len: u32) -> Box<dyn Any + Send>;

    /// Extents currently held, for the congestion policy.
    fn extents_in_use(&self) -> u32 {
        0
    }
}

/// Activity log that never blocks and never persists. Default for tests and
/// diskless operation.
pub struct NoopActivityLog;

impl ActivityLog for NoopActivityLog {
    fn get(&self, _offset: u64, _len: u32) -> Box<dyn Any + Send> {
        Box::new(())
    }
}

/// Memory-backed block target. Endio runs inline on the submitting thread,
/// which exercises the engine's reentrancy the hard way.
pub struct MemDisk {
    data: Mutex<Vec<u8>>,
    fail_next: AtomicU32,
    congested: AtomicU32,
}

impl MemDisk {
    pub fn new(capacity: u64) -> Self {
        Self {
            data: Mutex::new(vec![0; capacity as usize]),
            fail_next: AtomicU32::new(0),
            congested: AtomicU32::new(0),
        }
    }

    /// Fail the next `n` submissions with an I/O error.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn set_congested(&self, c: bool) {
        self.congested.store(c as u32, Ordering::SeqCst);
    }

    /// Test hook: read the raw backing bytes.
    pub fn snapshot(&self, offset: u64, len: usize) -> Vec<u8> {
        let data = self.data.lock();
        data[offset as usize..offset as usize + len].to_vec()
    }

    fn take_fault(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl BackingDisk for MemDisk {
    fn submit(&self, io: DiskIo, done: DiskDone) {
        if self.take_fault() {
            done(Err(std::io::Error::other("injected fault")));
            return;
        }
        let start = io.offset as usize;
        let end = start + io.len as usize;
        let result = {
            let mut data = self.data.lock();
            if end > data.len() {
                Err(std::io::Error::other("out of range"))
            } else {
                match io.dir {
                    IoDir::Read => Ok(Some(data[start..end].to_vec())),
                    IoDir::Write => {
                        let payload = io.payload.as_ref().expect("write without payload");
                        data[start..end].copy_from_slice(&payload[..io.len as usize]);
                        Ok(None)
                    }
                }
            }
        };
        done(result);
    }

    fn congested(&self) -> bool {
        self.congested.load(Ordering::SeqCst) != 0
    }

    fn capacity(&self) -> u64 {
        self.data.lock().len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memdisk_write_then_read() {
        let disk = MemDisk::new(1 << 16);
        let payload = Arc::new(vec![7u8; 512]);
        disk.submit(
            DiskIo { offset: 1024, len: 512, dir: IoDir::Write, payload: Some(payload) },
            Box::new(|r| assert!(r.unwrap().is_none())),
        );
        disk.submit(
            DiskIo { offset: 1024, len: 512, dir: IoDir::Read, payload: None },
            Box::new(|r| assert_eq!(r.unwrap().unwrap(), vec![7u8; 512])),
        );
    }

    #[test]
    fn fault_injection_counts_down() {
        let disk = MemDisk::new(4096);
        disk.fail_next(1);
        disk.submit(
            DiskIo { offset: 0, len: 16, dir: IoDir::Read, payload: None },
            Box::new(|r| assert!(r.is_err())),
        );
        disk.submit(
            DiskIo { offset: 0, len: 16, dir: IoDir::Read, payload: None },
            Box::new(|r| assert!(r.is_ok())),
        );
    }
}

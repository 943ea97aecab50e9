use std::{net::SocketAddr, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Largest single request accepted from the upper layer. Keeps every frame
/// within the 16-bit body length of the wire prelude.
pub const MAX_IO_SIZE: u32 = 32 * 1024;

/// When the peer acknowledges a mirrored write.
///
/// A: on handover to the local TCP stack (asynchronous).
/// B: when the peer received the data (memory-synchronous).
/// C: when the peer's disk completed the write (synchronous).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    A,
    B,
    C,
}

impl Protocol {
    pub fn wire_id(self) -> u32 {
        match self {
            Protocol::A => 1,
            Protocol::B => 2,
            Protocol::C => 3,
        }
    }

    pub fn from_wire(id: u32) -> Option<Self> {
        Some(match id {
            1 => Protocol::A,
            2 => Protocol::B,
            3 => Protocol::C,
            _ => return None,
        })
    }
}

/// Where reads go when both replicas could serve them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadBalancing {
    PreferLocal,
    PreferRemote,
    /// Compare local in-flight count against peer-pending + resync-pending.
    LeastPending,
    /// Alternate strictly between the replicas.
    RoundRobin,
    /// Go remote while the backing device reports congestion.
    CongestedRemote,
    /// A bit of `sector >> shift` picks the replica.
    Striping { shift: u32 },
}

/// What to do when the data channel can no longer keep up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnCongestion {
    /// Let submitters feel the backpressure.
    Block,
    /// Stop mirroring, track divergence in the bitmap, resync later.
    PullAhead,
    /// Tear the connection down.
    Disconnect,
}

/// Everything the engine needs to run one replicated device. The
/// administrative shim fills this in; the core never parses it from
/// anywhere itself.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub minor: u32,
    /// Exported capacity in bytes.
    pub capacity: u64,
    /// Logical block size in bytes, a power of two.
    pub blksize: u32,
    /// Path of the six-word generation record.
    pub meta_path: PathBuf,
    pub protocol: Protocol,

    pub data_addr: SocketAddr,
    pub meta_addr: SocketAddr,
    /// This side initiates both channels; the peer listens.
    pub dial: bool,

    /// Base ack timeout; the watchdog fires after `ko_count` multiples.
    pub timeout: Duration,
    pub ko_count: u32,
    /// Local request age past which the backing disk is considered broken.
    pub disk_timeout: Duration,
    pub ping_interval: Duration,

    pub read_balancing: ReadBalancing,
    pub on_congestion: OnCongestion,
    /// Bytes in flight to the peer before `on_congestion` applies.
    pub cong_fill: u64,
    /// Activity-log extents in use before `on_congestion` applies.
    pub cong_extents: u32,

    /// Writes per epoch before a barrier is forced.
    pub max_epoch_size: u32,
    /// Transfer-log ring slots.
    pub tl_size: usize,
    /// Request arena slots; submissions beyond this fail with a shortage
    /// error.
    pub max_requests: usize,
    /// Resync blocks in flight at once.
    pub resync_window: u32,
}

impl DeviceConfig {
    pub fn new(
        minor: u32,
        capacity: u64,
        meta_path: PathBuf,
        data_addr: SocketAddr,
        meta_addr: SocketAddr,
        dial: bool,
    ) -> Self {
        Self {
            minor,
            capacity,
            blksize: 4096,
            meta_path,
            protocol: Protocol::C,
            data_addr,
            meta_addr,
            dial,
            timeout: Duration::from_secs(6),
            ko_count: 7,
            disk_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(10),
            read_balancing: ReadBalancing::PreferLocal,
            on_congestion: OnCongestion::Block,
            cong_fill: 128 * 1024 * 1024,
            cong_extents: 1237,
            max_epoch_size: 2048,
            tl_size: 4096,
            max_requests: 1024,
            resync_window: 32,
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_read_balancing(mut self, rb: ReadBalancing) -> Self {
        self.read_balancing = rb;
        self
    }

    pub fn with_on_congestion(mut self, oc: OnCongestion) -> Self {
        self.on_congestion = oc;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration, ko_count: u32) -> Self {
        self.timeout = timeout;
        self.ko_count = ko_count;
        self
    }

    pub fn with_max_epoch_size(mut self, n: u32) -> Self {
        self.max_epoch_size = n;
        self
    }

    /// log2 of the logical block size.
    pub fn ln2_blksize(&self) -> u32 {
        self.blksize.trailing_zeros()
    }

    /// Clamp a proposed request size the way the block layer's merge hook
    /// would: our frame ceiling intersected with the backing device's limit.
    pub fn clamp_io(&self, proposed: u32, backing_limit: u32) -> u32 {
        proposed.min(MAX_IO_SIZE).min(backing_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_clamp_takes_the_tightest_limit() {
        let cfg = DeviceConfig::new(
            0,
            1 << 20,
            "/tmp/md".into(),
            "127.0.0.1:7788".parse().unwrap(),
            "127.0.0.1:7789".parse().unwrap(),
            false,
        );
        assert_eq!(cfg.clamp_io(1 << 20, u32::MAX), MAX_IO_SIZE);
        assert_eq!(cfg.clamp_io(1 << 20, 8192), 8192);
        assert_eq!(cfg.clamp_io(512, 8192), 512);
    }

    #[test]
    fn protocol_wire_ids_roundtrip() {
        for p in [Protocol::A, Protocol::B, Protocol::C] {
            assert_eq!(Protocol::from_wire(p.wire_id()), Some(p));
        }
        assert_eq!(Protocol::from_wire(9), None);
    }
}

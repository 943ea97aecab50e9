pub mod config;
mod device;
mod error;
mod handshake;
mod interval;
mod request;
mod submit;
mod target;
mod transfer_log;
mod worker;

pub use config::{DeviceConfig, MAX_IO_SIZE, OnCongestion, Protocol, ReadBalancing};
pub use device::{ConnState, Device, DeviceStatus, Role};
pub use error::{DeviceError, IoError};
pub use handshake::HandshakeError;
pub use request::{ReadDone, RqState, SECTOR_SHIFT, WriteDone};
pub use tandem_sync as sync;
pub use tandem_wire as wire;
pub use target::{ActivityLog, BackingDisk, DiskDone, DiskIo, IoDir, MemDisk, NoopActivityLog};
pub use tracing;
pub use worker::{ThreadState, WorkerHandle, WorkerSet};

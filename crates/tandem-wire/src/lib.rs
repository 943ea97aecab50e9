mod channel;
mod endpoint;
mod packet;

pub use channel::{ConnState, FramedChannel, FramedSender};
pub use endpoint::Endpoint;
pub use packet::{
    ID_SYNCER, MAX_FRAME_SIZE, PRELUDE_SIZE, Packet, ReportParams, STATE_CONSISTENT,
    STATE_PRIMARY, STATE_WANT_FULL_SYNC, WIRE_MAGIC, WIRE_VERSION, WireError,
};

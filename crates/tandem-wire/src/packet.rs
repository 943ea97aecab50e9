use thiserror::Error;

/// First word of every frame.
pub const WIRE_MAGIC: u32 = 0x8354_4442;

/// Wire protocol revision, carried in `ReportParams`.
pub const WIRE_VERSION: u32 = 1;

/// Reserved `block_id` flagging resync-initiated data. The peer must ack it
/// but must not install it into its transfer log.
pub const ID_SYNCER: u64 = u64::MAX;

/// Bits of the `ReportParams.state` word.
pub const STATE_PRIMARY: u32 = 1 << 0;
pub const STATE_CONSISTENT: u32 = 1 << 1;
/// Set by the side that evaluated its bitmap as insufficient for a partial
/// resync; the authoritative side then marks everything out-of-sync.
pub const STATE_WANT_FULL_SYNC: u32 = 1 << 2;

/// magic (4) + command (2) + length (2).
pub const PRELUDE_SIZE: usize = 8;

/// Largest frame we accept: fixed header plus one maximal data payload.
pub const MAX_FRAME_SIZE: usize = PRELUDE_SIZE + 16 + (1 << 16) - 1;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum WireError {
    #[error("bad frame magic {0:#010x}")]
    BadMagic(u32),
    #[error("unknown command {0:#06x}")]
    UnknownCommand(u16),
    #[error("frame truncated: {have} bytes for command {cmd:#06x}")]
    Truncated { cmd: u16, have: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
enum Command {
    ReportParams = 0x01,
    CStateChanged = 0x02,
    Barrier = 0x03,
    BarrierAck = 0x04,
    Data = 0x05,
    WriteAck = 0x06,
    RecvAck = 0x07,
    NegAck = 0x08,
    Ping = 0x09,
    PingAck = 0x0a,
}

impl Command {
    fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0x01 => Self::ReportParams,
            0x02 => Self::CStateChanged,
            0x03 => Self::Barrier,
            0x04 => Self::BarrierAck,
            0x05 => Self::Data,
            0x06 => Self::WriteAck,
            0x07 => Self::RecvAck,
            0x08 => Self::NegAck,
            0x09 => Self::Ping,
            0x0a => Self::PingAck,
            _ => return None,
        })
    }
}

/// Device parameters exchanged when a connection comes up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReportParams {
    pub size: u64,
    pub blksize: u32,
    pub state: u32,
    pub protocol: u32,
    pub version: u32,
    pub gen_cnt: [u32; 5],
}

/// One framed message. Multi-byte scalars travel in network byte order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Packet<'a> {
    ReportParams(ReportParams),
    CStateChanged { cstate: u32 },
    Barrier { barrier_nr: u32 },
    BarrierAck { barrier_nr: u32, set_size: u32 },
    Data { block_nr: u64, block_id: u64, payload: &'a [u8] },
    WriteAck { block_nr: u64, block_id: u64 },
    RecvAck { block_nr: u64, block_id: u64 },
    NegAck { block_nr: u64, block_id: u64 },
    Ping,
    PingAck,
}

struct Writer<'a>(&'a mut Vec<u8>);

impl Writer<'_> {
    #[inline]
    fn u16(&mut self, v: u16) {
        self.0.extend_from_slice(&v.to_be_bytes());
    }
    #[inline]
    fn u32(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_be_bytes());
    }
    #[inline]
    fn u64(&mut self, v: u64) {
        self.0.extend_from_slice(&v.to_be_bytes());
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let s = self.buf.get(self.pos..self.pos + n)?;
        self.pos += n;
        Some(s)
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes(b.try_into().unwrap()))
    }
    fn u32(&mut self) -> Option<u32> {
        self.take(4).map(|b| u32::from_be_bytes(b.try_into().unwrap()))
    }
    fn u64(&mut self) -> Option<u64> {
        self.take(8).map(|b| u64::from_be_bytes(b.try_into().unwrap()))
    }

    fn rest(&mut self) -> &'a [u8] {
        let s = &self.buf[self.pos..];
        self.pos = self.buf.len();
        s
    }
}

impl<'a> Packet<'a> {
    fn command(&self) -> Command {
        match self {
            Packet::ReportParams(_) => Command::ReportParams,
            Packet::CStateChanged { .. } => Command::CStateChanged,
            Packet::Barrier { .. } => Command::Barrier,
            Packet::BarrierAck { .. } => Command::BarrierAck,
            Packet::Data { .. } => Command::Data,
            Packet::WriteAck { .. } => Command::WriteAck,
            Packet::RecvAck { .. } => Command::RecvAck,
            Packet::NegAck { .. } => Command::NegAck,
            Packet::Ping => Command::Ping,
            Packet::PingAck => Command::PingAck,
        }
    }

    /// Append the full frame (prelude included) to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let start = buf.len();
        let mut w = Writer(buf);
        w.u32(WIRE_MAGIC);
        w.u16(self.command() as u16);
        w.u16(0); // patched below

        match *self {
            Packet::ReportParams(p) => {
                w.u64(p.size);
                w.u32(p.blksize);
                w.u32(p.state);
                w.u32(p.protocol);
                w.u32(p.version);
                for g in p.gen_cnt {
                    w.u32(g);
                }
            }
            Packet::CStateChanged { cstate } => w.u32(cstate),
            Packet::Barrier { barrier_nr } => w.u32(barrier_nr),
            Packet::BarrierAck { barrier_nr, set_size } => {
                w.u32(barrier_nr);
                w.u32(set_size);
            }
            Packet::Data { block_nr, block_id, payload } => {
                w.u64(block_nr);
                w.u64(block_id);
                w.0.extend_from_slice(payload);
            }
            Packet::WriteAck { block_nr, block_id } |
            Packet::RecvAck { block_nr, block_id } |
            Packet::NegAck { block_nr, block_id } => {
                w.u64(block_nr);
                w.u64(block_id);
            }
            Packet::Ping | Packet::PingAck => {}
        }

        let body = buf.len() - start - PRELUDE_SIZE;
        debug_assert!(body <= u16::MAX as usize, "frame body exceeds the length field");
        buf[start + 6..start + 8].copy_from_slice(&(body as u16).to_be_bytes());
    }

    /// Decode one complete frame (prelude included).
    pub fn decode(frame: &'a [u8]) -> Result<Packet<'a>, WireError> {
        let mut r = Reader::new(frame);
        let magic = r.u32().ok_or(WireError::Truncated { cmd: 0, have: frame.len() })?;
        if magic != WIRE_MAGIC {
            return Err(WireError::BadMagic(magic));
        }
        let raw_cmd = r.u16().ok_or(WireError::Truncated { cmd: 0, have: frame.len() })?;
        let cmd = Command::from_u16(raw_cmd).ok_or(WireError::UnknownCommand(raw_cmd))?;
        let _len = r.u16().ok_or(WireError::Truncated { cmd: raw_cmd, have: frame.len() })?;

        let short = || WireError::Truncated { cmd: raw_cmd, have: frame.len() };
        Ok(match cmd {
            Command::ReportParams => {
                let size = r.u64().ok_or_else(short)?;
                let blksize = r.u32().ok_or_else(short)?;
                let state = r.u32().ok_or_else(short)?;
                let protocol = r.u32().ok_or_else(short)?;
                let version = r.u32().ok_or_else(short)?;
                let mut gen_cnt = [0u32; 5];
                for g in &mut gen_cnt {
                    *g = r.u32().ok_or_else(short)?;
                }
                Packet::ReportParams(ReportParams { size, blksize, state, protocol, version, gen_cnt })
            }
            Command::CStateChanged => Packet::CStateChanged { cstate: r.u32().ok_or_else(short)? },
            Command::Barrier => Packet::Barrier { barrier_nr: r.u32().ok_or_else(short)? },
            Command::BarrierAck => Packet::BarrierAck {
                barrier_nr: r.u32().ok_or_else(short)?,
                set_size: r.u32().ok_or_else(short)?,
            },
            Command::Data => Packet::Data {
                block_nr: r.u64().ok_or_else(short)?,
                block_id: r.u64().ok_or_else(short)?,
                payload: r.rest(),
            },
            Command::WriteAck => Packet::WriteAck {
                block_nr: r.u64().ok_or_else(short)?,
                block_id: r.u64().ok_or_else(short)?,
            },
            Command::RecvAck => Packet::RecvAck {
                block_nr: r.u64().ok_or_else(short)?,
                block_id: r.u64().ok_or_else(short)?,
            },
            Command::NegAck => Packet::NegAck {
                block_nr: r.u64().ok_or_else(short)?,
                block_id: r.u64().ok_or_else(short)?,
            },
            Command::Ping => Packet::Ping,
            Command::PingAck => Packet::PingAck,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(p: Packet) {
        let mut buf = Vec::new();
        p.encode(&mut buf);
        assert_eq!(Packet::decode(&buf).unwrap(), p);
    }

    #[test]
    fn every_command_roundtrips() {
        roundtrip(Packet::ReportParams(ReportParams {
            size: 1 << 30,
            blksize: 4096,
            state: STATE_PRIMARY | STATE_CONSISTENT,
            protocol: 2,
            version: WIRE_VERSION,
            gen_cnt: [3, 0, 2, 0, 1],
        }));
        roundtrip(Packet::CStateChanged { cstate: 4 });
        roundtrip(Packet::Barrier { barrier_nr: 7 });
        roundtrip(Packet::BarrierAck { barrier_nr: 7, set_size: 4 });
        roundtrip(Packet::Data { block_nr: 12, block_id: 0xdead_beef, payload: &[1, 2, 3, 4] });
        roundtrip(Packet::WriteAck { block_nr: 12, block_id: 0xdead_beef });
        roundtrip(Packet::RecvAck { block_nr: 0, block_id: 1 });
        roundtrip(Packet::NegAck { block_nr: 9, block_id: ID_SYNCER });
        roundtrip(Packet::Ping);
        roundtrip(Packet::PingAck);
    }

    #[test]
    fn scalars_travel_big_endian() {
        let mut buf = Vec::new();
        Packet::Barrier { barrier_nr: 0x0102_0304 }.encode(&mut buf);
        assert_eq!(&buf[..4], &WIRE_MAGIC.to_be_bytes());
        assert_eq!(&buf[8..12], &[1, 2, 3, 4]);
    }

    #[test]
    fn length_field_counts_body_only() {
        let mut buf = Vec::new();
        Packet::Data { block_nr: 0, block_id: 0, payload: &[0u8; 100] }.encode(&mut buf);
        let len = u16::from_be_bytes(buf[6..8].try_into().unwrap());
        assert_eq!(len as usize, 16 + 100);
        assert_eq!(buf.len(), PRELUDE_SIZE + len as usize);
    }

    #[test]
    fn rejects_foreign_magic() {
        let mut buf = Vec::new();
        Packet::Ping.encode(&mut buf);
        buf[0] ^= 0xff;
        assert!(matches!(Packet::decode(&buf), Err(WireError::BadMagic(_))));
    }

    #[test]
    fn rejects_unknown_command() {
        let mut buf = Vec::new();
        Packet::Ping.encode(&mut buf);
        buf[5] = 0x7f;
        assert_eq!(Packet::decode(&buf), Err(WireError::UnknownCommand(0x7f)));
    }

    #[test]
    fn truncated_header_is_an_error() {
        let mut buf = Vec::new();
        Packet::WriteAck { block_nr: 1, block_id: 2 }.encode(&mut buf);
        buf.truncate(PRELUDE_SIZE + 10);
        assert!(matches!(Packet::decode(&buf), Err(WireError::Truncated { .. })));
    }
}

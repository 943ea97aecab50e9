use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use mio::{Events, Interest, Poll, Token, net::TcpStream};
use tracing::{debug, error, warn};

use crate::packet::{MAX_FRAME_SIZE, PRELUDE_SIZE, Packet};

const CHANNEL: Token = Token(0);

/// Response type for all channel calls.
///
/// `Alive` means the connection is still usable. `Disconnected` means the
/// peer is gone and the channel must be torn down and re-established.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ConnState {
    Alive,
    Disconnected,
}

enum ReadOutcome {
    FrameDone { frame_len: usize },
    WouldBlock,
    Disconnected,
}

#[derive(Clone, Copy)]
enum RxState {
    /// Collecting the 8-byte prelude.
    Prelude { buf: [u8; PRELUDE_SIZE], have: usize },
    /// Collecting the typed header + payload.
    Body { frame_len: usize, offset: usize },
}

struct TxState {
    send_buf: Vec<u8>,
    /// Filled when a send would block. First entry may be a partially
    /// written frame tail.
    backlog: VecDeque<Vec<u8>>,
    /// Set when the backlog went empty -> non-empty; cleared on full drain.
    /// Drives the per-send timeout policy of the owning worker.
    blocked_since: Option<Instant>,
}

struct Shared {
    stream: TcpStream,
    peer_addr: SocketAddr,
    tx: Mutex<TxState>,
}

impl Shared {
    /// Flush queued frames until the kernel blocks or the queue is empty.
    fn drain_backlog(&self) -> ConnState {
        let mut tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        while let Some(front) = tx.backlog.front_mut() {
            let mut s = &self.stream;
            match s.write(front) {
                Ok(0) => return ConnState::Disconnected,
                Ok(n) => {
                    if n == front.len() {
                        tx.backlog.pop_front();
                    } else {
                        front.drain(..n);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    debug!(?err, "channel: write from backlog");
                    return ConnState::Disconnected;
                }
            }
        }
        if tx.backlog.is_empty() {
            tx.blocked_since = None;
        }
        ConnState::Alive
    }
}

/// Write half of a framed channel. Clones share one send queue; the internal
/// mutex is the send serialisation point for every writer on this channel.
#[derive(Clone)]
pub struct FramedSender {
    shared: Arc<Shared>,
}

impl FramedSender {
    /// Encode `pkt` and write it out, queueing any unwritten remainder for
    /// the next writable event on the receiving half.
    pub fn send(&self, pkt: &Packet) -> ConnState {
        let mut tx = self.shared.tx.lock().unwrap_or_else(|e| e.into_inner());

        let mut send_buf = std::mem::take(&mut tx.send_buf);
        send_buf.clear();
        pkt.encode(&mut send_buf);

        let state = if tx.backlog.is_empty() {
            let mut s = &self.shared.stream;
            match s.write(&send_buf) {
                Ok(0) => {
                    warn!("channel: zero-length write, disconnecting");
                    ConnState::Disconnected
                }
                Ok(n) if n == send_buf.len() => ConnState::Alive,
                Ok(n) => {
                    tx.backlog.push_back(send_buf[n..].to_vec());
                    tx.blocked_since = Some(Instant::now());
                    ConnState::Alive
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    tx.backlog.push_back(send_buf.clone());
                    tx.blocked_since = Some(Instant::now());
                    ConnState::Alive
                }
                Err(err) => {
                    warn!(?err, "channel: send failed");
                    ConnState::Disconnected
                }
            }
        } else {
            tx.backlog.push_back(send_buf.clone());
            ConnState::Alive
        };

        tx.send_buf = send_buf;
        state
    }

    /// How long the oldest queued frame has been stuck behind a full socket,
    /// if any. Feeds the per-send timeout policy: probe-ping on the data
    /// channel, teardown on the meta channel.
    pub fn stalled_for(&self) -> Option<Duration> {
        let tx = self.shared.tx.lock().unwrap_or_else(|e| e.into_inner());
        tx.blocked_since.map(|t| t.elapsed())
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr
    }
}

/// Read half of a framed channel, owned by exactly one worker.
///
/// Frames carry the 8-byte prelude (magic, command, body length) followed by
/// the command-typed header and payload; `poll_with` reassembles them across
/// partial reads and hands each decoded [`Packet`] to the callback.
pub struct FramedChannel {
    shared: Arc<Shared>,
    poll: Poll,
    events: Events,
    rx_state: RxState,
    rx_buf: Vec<u8>,
}

impl FramedChannel {
    /// Take ownership of a connected non-blocking stream and split it into
    /// the polling half and a cloneable sender.
    pub fn from_stream(
        mut stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> io::Result<(Self, FramedSender)> {
        stream.set_nodelay(true)?;
        let poll = Poll::new()?;
        poll.registry().register(
            &mut stream,
            CHANNEL,
            Interest::READABLE | Interest::WRITABLE,
        )?;

        let shared = Arc::new(Shared {
            stream,
            peer_addr,
            tx: Mutex::new(TxState {
                send_buf: Vec::with_capacity(MAX_FRAME_SIZE),
                backlog: VecDeque::with_capacity(64),
                blocked_since: None,
            }),
        });
        let sender = FramedSender { shared: shared.clone() };
        let chan = Self {
            shared,
            poll,
            events: Events::with_capacity(64),
            rx_state: RxState::Prelude { buf: [0; PRELUDE_SIZE], have: 0 },
            rx_buf: vec![0; MAX_FRAME_SIZE],
        };
        Ok((chan, sender))
    }

    /// Poll the socket once, waiting at most `timeout`, and call `on_packet`
    /// for every fully assembled frame. Frame payloads are only valid for
    /// the duration of the callback.
    pub fn poll_with<F>(&mut self, timeout: Duration, mut on_packet: F) -> ConnState
    where
        F: for<'a> FnMut(Packet<'a>),
    {
        if let Err(err) = self.poll.poll(&mut self.events, Some(timeout)) {
            if err.kind() == io::ErrorKind::Interrupted {
                return ConnState::Alive;
            }
            error!(?err, "channel: poll failed");
            return ConnState::Disconnected;
        }

        let mut readable = false;
        let mut writable = false;
        for ev in self.events.iter() {
            readable |= ev.is_readable();
            writable |= ev.is_writable();
        }

        if readable {
            loop {
                match self.read_frame() {
                    ReadOutcome::FrameDone { frame_len } => {
                        match Packet::decode(&self.rx_buf[..frame_len]) {
                            Ok(pkt) => on_packet(pkt),
                            Err(err) => {
                                error!(%err, peer = %self.shared.peer_addr, "channel: undecodable frame");
                                return ConnState::Disconnected;
                            }
                        }
                    }
                    ReadOutcome::WouldBlock => break,
                    ReadOutcome::Disconnected => return ConnState::Disconnected,
                }
            }
        }

        if writable && self.shared.drain_backlog() == ConnState::Disconnected {
            return ConnState::Disconnected;
        }

        ConnState::Alive
    }

    /// Read a single complete frame if present. Loops until one frame is
    /// assembled or the read would block.
    fn read_frame(&mut self) -> ReadOutcome {
        loop {
            match self.rx_state {
                RxState::Prelude { mut buf, mut have } => {
                    while have < PRELUDE_SIZE {
                        let mut s = &self.shared.stream;
                        match s.read(&mut buf[have..]) {
                            Ok(0) => return ReadOutcome::Disconnected,
                            Ok(n) => have += n,
                            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                                self.rx_state = RxState::Prelude { buf, have };
                                return ReadOutcome::WouldBlock;
                            }
                            Err(err) => {
                                debug!(?err, "channel: read prelude");
                                return ReadOutcome::Disconnected;
                            }
                        }
                    }
                    let body = u16::from_be_bytes(buf[6..8].try_into().unwrap()) as usize;
                    let frame_len = PRELUDE_SIZE + body;
                    self.rx_buf[..PRELUDE_SIZE].copy_from_slice(&buf);
                    self.rx_state = RxState::Body { frame_len, offset: PRELUDE_SIZE };
                }

                RxState::Body { frame_len, mut offset } => {
                    while offset < frame_len {
                        let mut s = &self.shared.stream;
                        match s.read(&mut self.rx_buf[offset..frame_len]) {
                            Ok(0) => return ReadOutcome::Disconnected,
                            Ok(n) => offset += n,
                            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                                self.rx_state = RxState::Body { frame_len, offset };
                                return ReadOutcome::WouldBlock;
                            }
                            Err(err) => {
                                debug!(?err, "channel: read body");
                                return ReadOutcome::Disconnected;
                            }
                        }
                    }
                    self.rx_state = RxState::Prelude { buf: [0; PRELUDE_SIZE], have: 0 };
                    return ReadOutcome::FrameDone { frame_len };
                }
            }
        }
    }

    /// Shut the socket down and report who we were talking to. Dropping the
    /// channel afterwards unregisters the descriptor.
    pub fn close(&mut self) -> SocketAddr {
        debug!(peer = %self.shared.peer_addr, "terminating channel");
        let _ = self.shared.stream.shutdown(std::net::Shutdown::Both);
        self.shared.peer_addr
    }
}

/// Set kernel SO_SNDBUF and SO_RCVBUF on a mio TcpStream.
pub(crate) fn set_socket_buf_size(stream: &TcpStream, size: usize) {
    use std::os::fd::AsRawFd;
    let fd = stream.as_raw_fd();
    let size = size as libc::c_int;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &size as *const _ as *const libc::c_void,
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &size as *const _ as *const libc::c_void,
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

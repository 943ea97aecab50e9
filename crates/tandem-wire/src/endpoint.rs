use std::{
    io,
    net::{SocketAddr, TcpListener, TcpStream as StdTcpStream},
    time::Duration,
};

use mio::net::TcpStream;
use tandem_utils::Repeater;
use tracing::{debug, info, warn};

use crate::channel::{FramedChannel, FramedSender, set_socket_buf_size};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

enum Role {
    /// Accept the peer's connection attempts. Never retried by us.
    Listen(Option<TcpListener>),
    /// Connect out to the peer, re-attempted on the retry interval.
    Dial,
}

/// Produces one established framed channel at a time, either by accepting
/// from a bound listener or by dialling the peer on a paced retry loop.
/// Workers call [`try_establish`] from their idle loop; the call never
/// blocks beyond the dial timeout.
pub struct Endpoint {
    addr: SocketAddr,
    role: Role,
    retry: Repeater,
    socket_buf_size: Option<usize>,
}

impl Endpoint {
    pub fn listen(addr: SocketAddr) -> Self {
        Self {
            addr,
            role: Role::Listen(None),
            retry: Repeater::every(Duration::from_secs(2)),
            socket_buf_size: None,
        }
    }

    pub fn dial(addr: SocketAddr) -> Self {
        Self {
            addr,
            role: Role::Dial,
            retry: Repeater::every(Duration::from_secs(2)),
            socket_buf_size: None,
        }
    }

    /// Sets the interval used to pace dial attempts (and listener rebinds).
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry = Repeater::every(interval);
        self
    }

    /// Sets kernel SO_SNDBUF and SO_RCVBUF on every established socket.
    pub fn with_socket_buf_size(mut self, size: usize) -> Self {
        self.socket_buf_size = Some(size);
        self
    }

    /// Make the next `try_establish` attempt immediately.
    pub fn force_retry(&mut self) {
        self.retry.force_fire();
    }

    /// One establishment attempt. Returns the split channel once a peer is
    /// on the other end.
    pub fn try_establish(&mut self) -> Option<(FramedChannel, FramedSender)> {
        let (stream, peer_addr) = match &mut self.role {
            Role::Listen(slot) => {
                if slot.is_none() {
                    if !self.retry.fired() {
                        return None;
                    }
                    match TcpListener::bind(self.addr) {
                        Ok(l) => {
                            l.set_nonblocking(true).ok()?;
                            info!(addr = %self.addr, "listening");
                            *slot = Some(l);
                        }
                        Err(e) => {
                            warn!(addr = %self.addr, %e, "couldn't bind listener");
                            return None;
                        }
                    }
                }
                match slot.as_ref().unwrap().accept() {
                    Ok((s, peer)) => {
                        info!(%peer, "peer connected");
                        (s, peer)
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return None,
                    Err(e) => {
                        warn!(%e, "accept failed, rebinding");
                        *slot = None;
                        return None;
                    }
                }
            }
            Role::Dial => {
                if !self.retry.fired() {
                    return None;
                }
                match StdTcpStream::connect_timeout(&self.addr, CONNECT_TIMEOUT) {
                    Ok(s) => {
                        info!(peer = %self.addr, "connected");
                        (s, self.addr)
                    }
                    Err(e) => {
                        debug!(peer = %self.addr, %e, "dial attempt failed");
                        return None;
                    }
                }
            }
        };

        if let Err(e) = stream.set_nonblocking(true) {
            warn!(%e, "couldn't make stream non-blocking");
            return None;
        }
        let stream = TcpStream::from_std(stream);
        if let Some(size) = self.socket_buf_size {
            set_socket_buf_size(&stream, size);
        }

        match FramedChannel::from_stream(stream, peer_addr) {
            Ok(split) => Some(split),
            Err(e) => {
                warn!(%e, "couldn't set up framed channel");
                None
            }
        }
    }
}

//! In-process duplex link.
//!
//! Two [`MemoryLink`]s share a pair of frame queues. Dropping one end closes
//! both directions: the peer drains what was already queued and then sees
//! [`TransportError::Closed`].

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::{Channel, FrameLink, Role};
use crate::error::TransportError;

/// A [`Channel`] over an in-process link.
pub type MemoryChannel = Channel<MemoryLink>;

#[derive(Debug, Default)]
struct PipeState {
    frames: VecDeque<Vec<u8>>,
    closed: bool,
}

#[derive(Debug, Default)]
struct Pipe {
    state: Mutex<PipeState>,
    ready: Condvar,
}

impl Pipe {
    fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }
}

/// One end of an in-process duplex.
#[derive(Debug)]
pub struct MemoryLink {
    tx: Arc<Pipe>,
    rx: Arc<Pipe>,
    peer: Option<IpAddr>,
    recv_timeout: Option<Duration>,
}

impl MemoryLink {
    /// Sets the address reported as the peer's.
    #[must_use]
    pub fn with_peer_address(mut self, addr: IpAddr) -> Self {
        self.peer = Some(addr);
        self
    }
}

impl FrameLink for MemoryLink {
    fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        let mut state = self.tx.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.frames.push_back(frame);
        drop(state);
        self.tx.ready.notify_one();
        Ok(())
    }

    fn recv_frame(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut state = self.rx.state.lock();
        loop {
            if let Some(frame) = state.frames.pop_front() {
                return Ok(frame);
            }
            if state.closed {
                return Err(TransportError::Closed);
            }
            match self.recv_timeout {
                Some(limit) => {
                    if self.rx.ready.wait_for(&mut state, limit).timed_out()
                        && state.frames.is_empty()
                    {
                        return Err(TransportError::Io(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "no frame within receive timeout",
                        )));
                    }
                }
                None => self.rx.ready.wait(&mut state),
            }
        }
    }

    fn frame_ready(&mut self) -> Result<bool, TransportError> {
        let state = self.rx.state.lock();
        Ok(!state.frames.is_empty() || state.closed)
    }

    fn peer_address(&self) -> Option<IpAddr> {
        self.peer
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        self.tx.close();
        self.rx.close();
    }
}

fn link_pair(recv_timeout: Option<Duration>) -> (MemoryLink, MemoryLink) {
    let a_to_b = Arc::new(Pipe::default());
    let b_to_a = Arc::new(Pipe::default());
    let client = MemoryLink {
        tx: Arc::clone(&a_to_b),
        rx: Arc::clone(&b_to_a),
        peer: None,
        recv_timeout,
    };
    let server = MemoryLink {
        tx: b_to_a,
        rx: a_to_b,
        peer: None,
        recv_timeout,
    };
    (client, server)
}

/// Creates a connected `(client, server)` channel pair.
#[must_use]
pub fn duplex() -> (MemoryChannel, MemoryChannel) {
    let (c, s) = link_pair(None);
    (Channel::new(c, Role::Client), Channel::new(s, Role::Server))
}

/// Like [`duplex`], but blocking reads give up after `timeout`.
#[must_use]
pub fn duplex_with_timeout(timeout: Duration) -> (MemoryChannel, MemoryChannel) {
    let (c, s) = link_pair(Some(timeout));
    (Channel::new(c, Role::Client), Channel::new(s, Role::Server))
}

/// Creates a pair from explicit links, e.g. after setting peer addresses.
#[must_use]
pub fn links(timeout: Option<Duration>) -> (MemoryLink, MemoryLink) {
    link_pair(timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportChannel;
    use std::thread;

    #[test]
    fn frames_cross_threads_in_order() {
        let (mut client, mut server) = duplex_with_timeout(Duration::from_secs(5));
        let handle = thread::spawn(move || {
            for i in 0..10 {
                client.send_ints(&[i]).expect("send");
            }
            client
        });
        for i in 0..10 {
            assert_eq!(server.recv_int().expect("recv"), i);
        }
        drop(handle.join().expect("sender thread"));
    }

    #[test]
    fn drop_closes_peer_after_drain() {
        let (mut client, mut server) = duplex_with_timeout(Duration::from_secs(5));
        client.send_ints(&[42]).expect("send");
        drop(client);
        assert_eq!(server.recv_int().expect("queued frame survives"), 42);
        assert!(server.read_ready());
        assert!(matches!(server.recv_int(), Err(TransportError::Closed)));
        assert!(server.send_ints(&[1]).is_err());
    }

    #[test]
    fn receive_timeout_is_reported() {
        let (_client, mut server) = duplex_with_timeout(Duration::from_millis(20));
        let err = server.recv_int().expect_err("nothing was sent");
        assert!(matches!(err, TransportError::Io(ref e) if e.kind() == std::io::ErrorKind::TimedOut));
    }

    #[test]
    fn peer_address_is_reported() {
        let (c, s) = links(None);
        let addr: IpAddr = "10.0.0.7".parse().expect("ip");
        let server = Channel::new(s.with_peer_address(addr), Role::Server);
        let client = Channel::new(c, Role::Client);
        assert_eq!(server.peer_address(), Some(addr));
        assert_eq!(client.peer_address(), None);
        assert!(client.is_client());
        assert!(!server.is_client());
    }
}

//! Byte-stream link: length-delimited frames over any `Read + Write`.

use std::io::{self, Read, Write};
use std::net::{IpAddr, TcpStream};

use super::{Channel, FrameLink, Role};
use crate::codec::{Decoder, Encoder, FrameCodec};
use crate::error::TransportError;

/// Streams whose blocking mode can be toggled for readiness checks.
pub trait Pollable {
    /// Switches the stream between blocking and non-blocking reads.
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;
}

impl Pollable for TcpStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        Self::set_nonblocking(self, nonblocking)
    }
}

#[cfg(unix)]
impl Pollable for std::os::unix::net::UnixStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        Self::set_nonblocking(self, nonblocking)
    }
}

/// A [`Channel`] over a byte stream.
pub type StreamChannel<S> = Channel<StreamLink<S>>;

const READ_CHUNK: usize = 8 * 1024;

/// Frames over a byte stream.
#[derive(Debug)]
pub struct StreamLink<S> {
    stream: S,
    codec: FrameCodec,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    peer: Option<IpAddr>,
    eof: bool,
}

impl<S: Read + Write + Pollable + Send> StreamLink<S> {
    /// Wraps `stream` with the default frame limit.
    #[must_use]
    pub fn new(stream: S) -> Self {
        Self::with_codec(stream, FrameCodec::new())
    }

    /// Wraps `stream` with a custom codec.
    #[must_use]
    pub fn with_codec(stream: S, codec: FrameCodec) -> Self {
        Self {
            stream,
            codec,
            read_buf: Vec::new(),
            write_buf: Vec::new(),
            peer: None,
            eof: false,
        }
    }

    /// Sets the address reported as the peer's.
    #[must_use]
    pub fn with_peer_address(mut self, addr: IpAddr) -> Self {
        self.peer = Some(addr);
        self
    }

    /// Borrows the stream.
    #[must_use]
    pub const fn get_ref(&self) -> &S {
        &self.stream
    }

    fn fill(&mut self) -> Result<usize, TransportError> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.stream.read(&mut chunk)?;
        if n == 0 {
            self.eof = true;
        }
        self.read_buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    fn buffered_frame_complete(&self) -> Result<bool, TransportError> {
        // Decode on a scratch copy so the buffer is left untouched.
        let mut peek = self.read_buf.clone();
        let mut codec = self.codec;
        Ok(codec.decode(&mut peek)?.is_some())
    }
}

impl StreamLink<TcpStream> {
    /// Wraps a TCP stream, recording its peer address.
    pub fn tcp(stream: TcpStream) -> Result<Self, TransportError> {
        let peer = stream.peer_addr()?.ip();
        Ok(Self::new(stream).with_peer_address(peer))
    }
}

impl<S: Read + Write + Pollable + Send> FrameLink for StreamLink<S> {
    fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.write_buf.clear();
        self.codec.encode(frame.as_slice(), &mut self.write_buf)?;
        self.stream.write_all(&self.write_buf)?;
        self.stream.flush()?;
        Ok(())
    }

    fn recv_frame(&mut self) -> Result<Vec<u8>, TransportError> {
        loop {
            if self.eof {
                return match self.codec.decode_eof(&mut self.read_buf)? {
                    Some(frame) => Ok(frame),
                    None => Err(TransportError::Closed),
                };
            }
            if let Some(frame) = self.codec.decode(&mut self.read_buf)? {
                return Ok(frame);
            }
            self.fill()?;
        }
    }

    fn frame_ready(&mut self) -> Result<bool, TransportError> {
        if self.eof || self.buffered_frame_complete()? {
            return Ok(true);
        }
        self.stream.set_nonblocking(true)?;
        let polled = loop {
            match self.fill() {
                Ok(0) => break Ok(()),
                Ok(_) => {}
                Err(TransportError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                    break Ok(());
                }
                Err(e) => break Err(e),
            }
        };
        self.stream.set_nonblocking(false)?;
        polled?;
        Ok(self.eof || self.buffered_frame_complete()?)
    }

    fn peer_address(&self) -> Option<IpAddr> {
        self.peer
    }
}

impl StreamChannel<TcpStream> {
    /// Wraps a TCP stream as a channel for `role`.
    pub fn from_tcp(stream: TcpStream, role: Role) -> Result<Self, TransportError> {
        Ok(Channel::new(StreamLink::tcp(stream)?, role))
    }
}

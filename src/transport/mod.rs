//! Message-framed channels used by the authentication protocols.
//!
//! ```text
//!   Authenticator ──put_*/get_*──► Channel<L> ──frames──► FrameLink ──► peer
//!                  end_of_message      │                    │
//!                                      │             MemoryLink (in-process)
//!                                      │             StreamLink (TCP / Unix)
//!                                 FieldWriter / FieldReader
//! ```
//!
//! A channel is either encoding (writing an outgoing message) or decoding
//! (reading an incoming one). Every logical protocol step ends with
//! [`TransportChannel::end_of_message`]: in encode mode it ships the
//! buffered message as one frame, in decode mode it discards whatever the
//! protocol did not read from the current frame (reading and dropping the
//! next frame if none was opened yet).

pub mod memory;
pub mod stream;

use std::net::IpAddr;

use crate::codec::{FieldReader, FieldWriter};
use crate::error::TransportError;

pub use memory::{MemoryChannel, MemoryLink, duplex, duplex_with_timeout, links};
pub use stream::{Pollable, StreamChannel, StreamLink};

/// Which end of the connection this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The connecting side. Drives method retries.
    Client,
    /// The accepting side.
    Server,
}

impl Role {
    /// Short label for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
        }
    }
}

/// Current coding direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodingMode {
    /// Writing an outgoing message.
    Encode,
    /// Reading an incoming message.
    Decode,
}

impl CodingMode {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Encode => "encode",
            Self::Decode => "decode",
        }
    }
}

/// A bidirectional message-framed channel.
pub trait TransportChannel: Send {
    /// Returns `true` on the connecting side.
    fn is_client(&self) -> bool;

    /// Switches to encode mode.
    fn encode(&mut self);

    /// Switches to decode mode.
    fn decode(&mut self);

    /// Current coding direction.
    fn mode(&self) -> CodingMode;

    /// Writes an integer field.
    fn put_i32(&mut self, value: i32) -> Result<(), TransportError>;

    /// Writes a string field.
    fn put_str(&mut self, value: &str) -> Result<(), TransportError>;

    /// Writes raw bytes.
    fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Reads an integer field, waiting for a message if none is open.
    fn get_i32(&mut self) -> Result<i32, TransportError>;

    /// Reads a string field.
    fn get_str(&mut self) -> Result<String, TransportError>;

    /// Reads exactly `len` raw bytes.
    fn get_bytes(&mut self, len: usize) -> Result<Vec<u8>, TransportError>;

    /// Closes the current logical message.
    fn end_of_message(&mut self) -> Result<(), TransportError>;

    /// Returns `true` if the next read will not block.
    fn read_ready(&mut self) -> bool;

    /// Address the transport observed for the peer.
    fn peer_address(&self) -> Option<IpAddr>;

    /// Writes a boolean field.
    fn put_bool(&mut self, value: bool) -> Result<(), TransportError> {
        self.put_i32(i32::from(value))
    }

    /// Reads a boolean field.
    fn get_bool(&mut self) -> Result<bool, TransportError> {
        Ok(self.get_i32()? != 0)
    }

    /// Sends one message made of integers.
    fn send_ints(&mut self, values: &[i32]) -> Result<(), TransportError> {
        self.encode();
        for v in values {
            self.put_i32(*v)?;
        }
        self.end_of_message()
    }

    /// Receives one message made of a single integer.
    fn recv_int(&mut self) -> Result<i32, TransportError> {
        self.decode();
        let v = self.get_i32()?;
        self.end_of_message()?;
        Ok(v)
    }

    /// Sends `{len, bytes}` as one message, preceded by `tag`.
    fn send_blob(&mut self, tag: i32, bytes: &[u8]) -> Result<(), TransportError> {
        self.encode();
        self.put_i32(tag)?;
        self.put_i32(blob_len(bytes)?)?;
        self.put_bytes(bytes)?;
        self.end_of_message()
    }

    /// Receives a `{tag, len, bytes}` message, bounding `len` by `max`.
    fn recv_blob(&mut self, max: usize) -> Result<(i32, Vec<u8>), TransportError> {
        self.decode();
        let tag = self.get_i32()?;
        let len = self.get_i32()?;
        let len = usize::try_from(len).map_err(|_| TransportError::MessageExhausted("length"))?;
        if len > max {
            return Err(TransportError::FrameTooLarge { len, max });
        }
        let bytes = self.get_bytes(len)?;
        self.end_of_message()?;
        Ok((tag, bytes))
    }
}

/// Converts a buffer length to the wire's signed length field.
pub(crate) fn blob_len(bytes: &[u8]) -> Result<i32, TransportError> {
    i32::try_from(bytes.len()).map_err(|_| TransportError::FrameTooLarge {
        len: bytes.len(),
        max: i32::MAX as usize,
    })
}

/// Moves whole frames between two peers.
pub trait FrameLink: Send {
    /// Sends one frame.
    fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Receives one frame, blocking until one arrives or the peer closes.
    fn recv_frame(&mut self) -> Result<Vec<u8>, TransportError>;

    /// Returns `true` if [`recv_frame`](Self::recv_frame) will not block.
    fn frame_ready(&mut self) -> Result<bool, TransportError>;

    /// Address of the peer as seen by this link.
    fn peer_address(&self) -> Option<IpAddr>;
}

/// A [`TransportChannel`] built from a [`FrameLink`].
#[derive(Debug)]
pub struct Channel<L> {
    link: L,
    role: Role,
    mode: CodingMode,
    writer: FieldWriter,
    reader: Option<FieldReader>,
}

impl<L: FrameLink> Channel<L> {
    /// Wraps `link`.
    #[must_use]
    pub fn new(link: L, role: Role) -> Self {
        Self {
            link,
            role,
            mode: CodingMode::Encode,
            writer: FieldWriter::new(),
            reader: None,
        }
    }

    /// This end's role.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// Borrows the link.
    #[must_use]
    pub const fn link(&self) -> &L {
        &self.link
    }

    /// Unwraps the link.
    pub fn into_link(self) -> L {
        self.link
    }

    fn require(&self, expected: CodingMode) -> Result<(), TransportError> {
        if self.mode == expected {
            Ok(())
        } else {
            Err(TransportError::WrongMode {
                expected: expected.as_str(),
                actual: self.mode.as_str(),
            })
        }
    }

    fn open_reader(&mut self) -> Result<&mut FieldReader, TransportError> {
        self.require(CodingMode::Decode)?;
        if self.reader.is_none() {
            let frame = self.link.recv_frame()?;
            self.reader = Some(FieldReader::new(frame));
        }
        self.reader
            .as_mut()
            .ok_or(TransportError::MessageExhausted("message"))
    }
}

impl<L: FrameLink> TransportChannel for Channel<L> {
    fn is_client(&self) -> bool {
        self.role == Role::Client
    }

    fn encode(&mut self) {
        self.mode = CodingMode::Encode;
    }

    fn decode(&mut self) {
        self.mode = CodingMode::Decode;
    }

    fn mode(&self) -> CodingMode {
        self.mode
    }

    fn put_i32(&mut self, value: i32) -> Result<(), TransportError> {
        self.require(CodingMode::Encode)?;
        self.writer.put_i32(value);
        Ok(())
    }

    fn put_str(&mut self, value: &str) -> Result<(), TransportError> {
        self.require(CodingMode::Encode)?;
        self.writer.put_str(value);
        Ok(())
    }

    fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.require(CodingMode::Encode)?;
        self.writer.put_bytes(bytes);
        Ok(())
    }

    fn get_i32(&mut self) -> Result<i32, TransportError> {
        self.open_reader()?.get_i32()
    }

    fn get_str(&mut self) -> Result<String, TransportError> {
        self.open_reader()?.get_str()
    }

    fn get_bytes(&mut self, len: usize) -> Result<Vec<u8>, TransportError> {
        self.open_reader()?.get_bytes(len)
    }

    fn end_of_message(&mut self) -> Result<(), TransportError> {
        match self.mode {
            CodingMode::Encode => {
                let frame = self.writer.take();
                self.link.send_frame(frame)
            }
            CodingMode::Decode => {
                let reader = match self.reader.take() {
                    Some(reader) => reader,
                    None => FieldReader::new(self.link.recv_frame()?),
                };
                if reader.remaining() > 0 {
                    tracing::trace!(
                        unread = reader.remaining(),
                        "discarding unread message tail"
                    );
                }
                Ok(())
            }
        }
    }

    fn read_ready(&mut self) -> bool {
        if self.reader.is_some() {
            return true;
        }
        // A broken link counts as ready so the next read surfaces the error.
        self.link.frame_ready().unwrap_or(true)
    }

    fn peer_address(&self) -> Option<IpAddr> {
        self.link.peer_address()
    }
}

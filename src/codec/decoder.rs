//! Reading frames out of a receive buffer.

use std::io;

/// Splits buffered bytes into frames.
pub trait Decoder {
    /// A complete frame.
    type Item;
    /// Failure type; I/O failures convert into it.
    type Error: From<io::Error>;

    /// Takes one frame off the front of `buf`, draining its bytes.
    ///
    /// `Ok(None)` leaves `buf` untouched and asks for more input.
    fn decode(&mut self, buf: &mut Vec<u8>) -> Result<Option<Self::Item>, Self::Error>;

    /// Like [`decode`](Self::decode), once the peer stopped sending.
    ///
    /// Leftover bytes that do not form a frame are a truncated message.
    fn decode_eof(&mut self, buf: &mut Vec<u8>) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        if buf.is_empty() {
            Ok(None)
        } else {
            Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("peer closed with {} bytes of a partial message", buf.len()),
            )
            .into())
        }
    }
}

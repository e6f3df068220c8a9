//! Writing frames into a send buffer.

use std::io;

/// Serializes one outgoing message.
pub trait Encoder<Item> {
    /// Failure type; I/O failures convert into it.
    type Error: From<io::Error>;

    /// Appends the framed form of `item` to `out`.
    fn encode(&mut self, item: Item, out: &mut Vec<u8>) -> Result<(), Self::Error>;
}

//! Codec traits and the built-in codecs for framed authentication traffic.
//!
//! Authentication messages are sequences of typed fields closed by an
//! end-of-message boundary. On a byte stream each message becomes one
//! length-delimited frame ([`FrameCodec`]); inside a frame fields are
//! written by [`FieldWriter`] and read back by [`FieldReader`].

pub mod decoder;
pub mod encoder;
pub mod field;
pub mod frame;

pub use decoder::Decoder;
pub use encoder::Encoder;
pub use field::{FieldReader, FieldWriter};
pub use frame::{DEFAULT_MAX_FRAME, FrameCodec};

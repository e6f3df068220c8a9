//! Length-delimited frames: a big-endian `u32` length followed by the payload.

use super::{Decoder, Encoder};
use crate::error::TransportError;

/// Largest frame accepted unless configured otherwise.
pub const DEFAULT_MAX_FRAME: usize = 1 << 20;

const HEADER_LEN: usize = 4;

/// Codec for one authentication message per frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame: usize,
}

impl FrameCodec {
    /// Creates a codec with [`DEFAULT_MAX_FRAME`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame: DEFAULT_MAX_FRAME,
        }
    }

    /// Creates a codec with a custom frame limit.
    #[must_use]
    pub const fn with_max_frame(max_frame: usize) -> Self {
        Self { max_frame }
    }

    /// Configured frame limit.
    #[must_use]
    pub const fn max_frame(&self) -> usize {
        self.max_frame
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Vec<u8>;
    type Error = TransportError;

    fn decode(&mut self, src: &mut Vec<u8>) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&src[..HEADER_LEN]);
        let len = u32::from_be_bytes(header) as usize;
        if len > self.max_frame {
            return Err(TransportError::FrameTooLarge {
                len,
                max: self.max_frame,
            });
        }
        if src.len() < HEADER_LEN + len {
            return Ok(None);
        }
        let frame = src[HEADER_LEN..HEADER_LEN + len].to_vec();
        src.drain(..HEADER_LEN + len);
        Ok(Some(frame))
    }
}

impl Encoder<&[u8]> for FrameCodec {
    type Error = TransportError;

    fn encode(&mut self, item: &[u8], dst: &mut Vec<u8>) -> Result<(), Self::Error> {
        if item.len() > self.max_frame {
            return Err(TransportError::FrameTooLarge {
                len: item.len(),
                max: self.max_frame,
            });
        }
        let len = u32::try_from(item.len()).map_err(|_| TransportError::FrameTooLarge {
            len: item.len(),
            max: self.max_frame,
        })?;
        dst.reserve(HEADER_LEN + item.len());
        dst.extend_from_slice(&len.to_be_bytes());
        dst.extend_from_slice(item);
        Ok(())
    }
}

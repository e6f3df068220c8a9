//! Typed fields inside one message.
//!
//! Integers are big-endian `i32`, booleans travel as integers, strings as a
//! `u32` length followed by UTF-8 bytes. Raw byte runs carry no length of
//! their own; protocols send the length as a separate integer first.

use crate::error::TransportError;

/// Appends fields to an outgoing message.
#[derive(Debug, Default)]
pub struct FieldWriter {
    buf: Vec<u8>,
}

impl FieldWriter {
    /// Creates an empty message.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an integer.
    pub fn put_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Appends a boolean.
    pub fn put_bool(&mut self, value: bool) {
        self.put_i32(i32::from(value));
    }

    /// Appends a length-prefixed string.
    pub fn put_str(&mut self, value: &str) {
        let len = u32::try_from(value.len()).unwrap_or(u32::MAX);
        self.buf.extend_from_slice(&len.to_be_bytes());
        self.buf.extend_from_slice(value.as_bytes());
    }

    /// Appends raw bytes.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Returns `true` if nothing was written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Takes the message bytes, leaving the writer empty.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

/// Reads fields from a received message.
#[derive(Debug, Default)]
pub struct FieldReader {
    buf: Vec<u8>,
    pos: usize,
}

impl FieldReader {
    /// Wraps a received message.
    #[must_use]
    pub const fn new(buf: Vec<u8>) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&[u8], TransportError> {
        if self.remaining() < n {
            return Err(TransportError::MessageExhausted(what));
        }
        let start = self.pos;
        self.pos += n;
        Ok(&self.buf[start..self.pos])
    }

    /// Reads an integer.
    pub fn get_i32(&mut self) -> Result<i32, TransportError> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4, "integer")?);
        Ok(i32::from_be_bytes(raw))
    }

    /// Reads a boolean; any non-zero integer is `true`.
    pub fn get_bool(&mut self) -> Result<bool, TransportError> {
        Ok(self.get_i32()? != 0)
    }

    /// Reads a length-prefixed string.
    pub fn get_str(&mut self) -> Result<String, TransportError> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4, "string length")?);
        let len = u32::from_be_bytes(raw) as usize;
        let bytes = self.take(len, "string")?.to_vec();
        String::from_utf8(bytes).map_err(|_| TransportError::InvalidUtf8)
    }

    /// Reads exactly `len` raw bytes.
    pub fn get_bytes(&mut self, len: usize) -> Result<Vec<u8>, TransportError> {
        Ok(self.take(len, "bytes")?.to_vec())
    }

    /// Bytes not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_read_back_in_order() {
        let mut w = FieldWriter::new();
        w.put_i32(-1);
        w.put_bool(true);
        w.put_str("alice@example.org");
        w.put_bytes(&[9, 8, 7]);

        let mut r = FieldReader::new(w.take());
        assert_eq!(r.get_i32().expect("int"), -1);
        assert!(r.get_bool().expect("bool"));
        assert_eq!(r.get_str().expect("str"), "alice@example.org");
        assert_eq!(r.get_bytes(3).expect("bytes"), vec![9, 8, 7]);
        assert_eq!(r.remaining(), 0);
        assert!(w.is_empty());
    }

    #[test]
    fn reading_past_the_message_fails() {
        let mut r = FieldReader::new(vec![0, 0]);
        assert!(matches!(
            r.get_i32(),
            Err(TransportError::MessageExhausted("integer"))
        ));
        let mut r = FieldReader::new(vec![0, 0, 0, 5, b'a']);
        assert!(r.get_str().is_err());
    }

    #[test]
    fn invalid_utf8_is_reported() {
        let mut r = FieldReader::new(vec![0, 0, 0, 1, 0xff]);
        assert!(matches!(r.get_str(), Err(TransportError::InvalidUtf8)));
    }
}

//! Session keys handed from the accepting side to the connecting side.
//!
//! A [`SessionKey`] is opaque key material plus the protocol tag and
//! lifetime the hosting platform attaches to it. The key exchange moves it
//! across the wire wrapped by the method that just authenticated.

use core::fmt;

use crate::crypto::entropy::EntropySource;
use crate::error::AuthResult;

/// Size of generated session keys in bytes (256 bits).
pub const SESSION_KEY_SIZE: usize = 32;

/// Protocol tag for keys used with AES-256-GCM.
pub const PROTOCOL_AES_GCM: i32 = 4;

/// Opaque session key.
///
/// # Example
///
/// ```
/// use peerauth::crypto::{DetEntropy, SessionKey, PROTOCOL_AES_GCM};
///
/// let key = SessionKey::generate(&DetEntropy::new(1), PROTOCOL_AES_GCM, 3600).unwrap();
/// assert_eq!(key.len(), 32);
/// assert!(!format!("{key:?}").contains(&format!("{:?}", key.as_bytes())));
/// ```
#[derive(Clone)]
pub struct SessionKey {
    bytes: Vec<u8>,
    protocol: i32,
    duration_secs: i32,
}

impl SessionKey {
    /// Wraps existing key material.
    #[must_use]
    pub const fn new(bytes: Vec<u8>, protocol: i32, duration_secs: i32) -> Self {
        Self {
            bytes,
            protocol,
            duration_secs,
        }
    }

    /// Generates a fresh [`SESSION_KEY_SIZE`]-byte key.
    pub fn generate(
        entropy: &dyn EntropySource,
        protocol: i32,
        duration_secs: i32,
    ) -> AuthResult<Self> {
        let mut bytes = vec![0u8; SESSION_KEY_SIZE];
        entropy.fill_bytes(&mut bytes)?;
        Ok(Self::new(bytes, protocol, duration_secs))
    }

    /// Key material.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Key length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns `true` for an empty key.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Protocol tag.
    #[must_use]
    pub const fn protocol(&self) -> i32 {
        self.protocol
    }

    /// Validity in seconds.
    #[must_use]
    pub const fn duration_secs(&self) -> i32 {
        self.duration_secs
    }
}

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        if self.bytes.len() != other.bytes.len()
            || self.protocol != other.protocol
            || self.duration_secs != other.duration_secs
        {
            return false;
        }
        // Constant time over the key bytes.
        let mut diff = 0u8;
        for (a, b) in self.bytes.iter().zip(&other.bytes) {
            diff |= a ^ b;
        }
        diff == 0
    }
}

impl Eq for SessionKey {}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKey")
            .field("len", &self.bytes.len())
            .field("protocol", &self.protocol)
            .field("duration_secs", &self.duration_secs)
            .finish_non_exhaustive()
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        // Best effort; the optimizer may still elide this.
        self.bytes.fill(0);
    }
}

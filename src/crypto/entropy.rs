//! Entropy source abstraction.
//!
//! Session keys and nonces draw from an [`EntropySource`]. Production code
//! uses [`OsEntropy`]; tests that need reproducible keys use
//! [`DetEntropy`].

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{AuthError, AuthResult};

/// Source of nonces and key material.
pub trait EntropySource: Send + Sync + 'static {
    /// Fills `buf` completely.
    fn fill_bytes(&self, dest: &mut [u8]) -> AuthResult<()>;

    /// Name logged alongside key generation.
    fn source_id(&self) -> &'static str;
}

/// Entropy from the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn fill_bytes(&self, dest: &mut [u8]) -> AuthResult<()> {
        getrandom::fill(dest).map_err(|e| AuthError::crypto(format!("OS entropy failed: {e}")))
    }

    fn source_id(&self) -> &'static str {
        "os"
    }
}

/// Deterministic entropy source for tests. Not for key generation in
/// production.
#[derive(Debug)]
pub struct DetEntropy {
    state: Mutex<u64>,
}

impl DetEntropy {
    /// Seeds a reproducible stream.
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self {
            state: Mutex::new(seed),
        }
    }

    fn mix_seed(mut seed: u64) -> u64 {
        seed ^= seed >> 30;
        seed = seed.wrapping_mul(0xbf58_476d_1ce4_e5b9);
        seed ^= seed >> 27;
        seed = seed.wrapping_mul(0x94d0_49bb_1331_11eb);
        seed ^= seed >> 31;
        seed
    }
}

impl EntropySource for DetEntropy {
    fn fill_bytes(&self, dest: &mut [u8]) -> AuthResult<()> {
        let mut state = self.state.lock();
        for chunk in dest.chunks_mut(8) {
            *state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
            let word = Self::mix_seed(*state).to_le_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
        Ok(())
    }

    fn source_id(&self) -> &'static str {
        "deterministic"
    }
}

/// Shared handle to the process entropy source.
#[must_use]
pub fn os_entropy() -> Arc<dyn EntropySource> {
    Arc::new(OsEntropy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn det_entropy_is_reproducible() {
        let a = DetEntropy::new(7);
        let b = DetEntropy::new(7);
        let mut x = [0u8; 19];
        let mut y = [0u8; 19];
        a.fill_bytes(&mut x).expect("fill");
        b.fill_bytes(&mut y).expect("fill");
        assert_eq!(x, y);

        let mut z = [0u8; 19];
        a.fill_bytes(&mut z).expect("fill");
        assert_ne!(x, z, "stream advances");
    }

    #[test]
    fn os_entropy_fills() {
        let mut buf = [0u8; 32];
        OsEntropy.fill_bytes(&mut buf).expect("os entropy");
        assert!(buf.iter().any(|b| *b != 0));
        assert_eq!(OsEntropy.source_id(), "os");
    }
}

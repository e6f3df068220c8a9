//! Symmetric wrap/unwrap for methods that establish key material.
//!
//! Output layout is `nonce(12) || ciphertext || tag(16)` under AES-256-GCM.
//! Keys shorter or longer than 32 bytes are stretched or folded through
//! SHA-256 so any method-provided secret can drive the cipher.

use ring::aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::digest;

use crate::crypto::entropy::EntropySource;
use crate::error::{AuthError, AuthResult};

/// AEAD state for one established session.
pub struct SessionCipher {
    key: LessSafeKey,
}

impl core::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("SessionCipher(AES-256-GCM)")
    }
}

impl SessionCipher {
    /// Builds a cipher from arbitrary key material.
    pub fn new(material: &[u8]) -> AuthResult<Self> {
        if material.is_empty() {
            return Err(AuthError::crypto("empty key material"));
        }
        let derived;
        let key_bytes = if material.len() == AES_256_GCM.key_len() {
            material
        } else {
            derived = digest::digest(&digest::SHA256, material);
            derived.as_ref()
        };
        let unbound = UnboundKey::new(&AES_256_GCM, key_bytes)
            .map_err(|_| AuthError::crypto("rejected AES-256-GCM key"))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
        })
    }

    /// Encrypts `plaintext` under a fresh random nonce.
    pub fn seal(&self, entropy: &dyn EntropySource, plaintext: &[u8]) -> AuthResult<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        entropy.fill_bytes(&mut nonce)?;
        let mut body = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut body)
            .map_err(|_| AuthError::crypto("seal failed"))?;
        let mut out = Vec::with_capacity(NONCE_LEN + body.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decrypts and authenticates the output of [`seal`](Self::seal).
    pub fn open(&self, sealed: &[u8]) -> AuthResult<Vec<u8>> {
        if sealed.len() < NONCE_LEN + AES_256_GCM.tag_len() {
            return Err(AuthError::crypto("sealed buffer too short"));
        }
        let (nonce, body) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce)
            .map_err(|_| AuthError::crypto("bad nonce"))?;
        let mut buf = body.to_vec();
        let plain = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut buf)
            .map_err(|_| AuthError::crypto("authentication tag mismatch"))?;
        Ok(plain.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::entropy::DetEntropy;

    #[test]
    fn seal_open_round_trip_including_empty() {
        let cipher = SessionCipher::new(&[7u8; 32]).expect("cipher");
        let entropy = DetEntropy::new(9);
        for msg in [&b""[..], b"x", b"a longer payload spanning blocks......"] {
            let sealed = cipher.seal(&entropy, msg).expect("seal");
            assert_eq!(sealed.len(), msg.len() + NONCE_LEN + 16);
            assert_eq!(cipher.open(&sealed).expect("open"), msg);
        }
    }

    #[test]
    fn tampering_is_detected() {
        let cipher = SessionCipher::new(b"short secret").expect("cipher");
        let mut sealed = cipher.seal(&DetEntropy::new(1), b"payload").expect("seal");
        let last = sealed.len() - 1;
        sealed[last] ^= 1;
        assert!(cipher.open(&sealed).is_err());
        assert!(cipher.open(&[0u8; 4]).is_err());
    }

    #[test]
    fn different_keys_do_not_interoperate() {
        let a = SessionCipher::new(&[1u8; 32]).expect("cipher");
        let b = SessionCipher::new(&[2u8; 32]).expect("cipher");
        let sealed = a.seal(&DetEntropy::new(5), b"secret").expect("seal");
        assert!(b.open(&sealed).is_err());
        assert!(SessionCipher::new(&[]).is_err());
    }
}

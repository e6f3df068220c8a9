//! Key material, entropy and the session cipher.

pub mod cipher;
pub mod entropy;
pub mod key;

pub use cipher::SessionCipher;
pub use entropy::{DetEntropy, EntropySource, OsEntropy, os_entropy};
pub use key::{PROTOCOL_AES_GCM, SESSION_KEY_SIZE, SessionKey};

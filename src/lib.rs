//! peerauth: method-negotiating peer authentication.
//!
//! # Overview
//!
//! Two peers on a message-framed connection agree on one of several
//! authentication methods, run that method's protocol, and come out with a
//! canonical `user@domain` for the peer and, for most methods, key material
//! for wrapping later traffic.
//!
//! ```text
//!   Authentication (orchestrator)
//!     │ handshake: client mask ──► server selection
//!     │ retry: client drops failed methods, server follows
//!     ▼
//!   MethodRegistry ──► Box<dyn Authenticator> ──► TransportChannel
//!     │                  (ANONYMOUS, CLAIMTOBE, FS, FS_REMOTE, MUNGE,
//!     │                   KERBEROS, SSL, SCITOKENS, GSI, NTSSPI)
//!     ▼
//!   IdentityMapper (rule file) ──► canonical user@domain
//! ```
//!
//! # Module Structure
//!
//! - [`error`](mod@error): error kinds and the diagnostic stack
//! - [`method`]: method ids and candidate sets
//! - [`config`]: [`AuthConfig`]
//! - [`codec`]: frames and typed fields
//! - [`transport`]: [`TransportChannel`] and its in-memory and stream links
//! - [`crypto`]: session keys, the wrap cipher and entropy
//! - [`continuation`]: resumable phase machines
//! - [`identity`]: identities, the rule file and the realm map
//! - [`authenticator`]: the methods and their registry
//! - [`handshake`]: method negotiation
//! - [`orchestrator`]: the [`Authentication`] session
//!
//! # Concurrency
//!
//! A session never spawns threads. Blocking methods read the channel
//! directly; SSL and the Kerberos server can instead yield through
//! [`Authentication::authenticate_nonblocking`] so a reactor can service
//! many connections on one thread.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_inception)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

pub mod authenticator;
pub mod codec;
pub mod config;
pub mod continuation;
pub mod crypto;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod method;
pub mod orchestrator;
pub mod transport;

// ── Test-only modules ───────────────────────────────────────────────────
#[cfg(any(test, feature = "test-internals"))]
pub mod test_utils;

pub use authenticator::{Authenticator, MethodRegistry, Providers};
pub use config::AuthConfig;
pub use continuation::{Continuation, DriveMode, PhaseMachine, Step};
pub use crypto::SessionKey;
pub use error::{AuthError, AuthErrorKind, AuthResult, ErrorStack};
pub use identity::{AuthenticatedIdentity, CanonicalIdentity, IdentityMapper};
pub use method::{AuthMethod, MethodSet};
pub use orchestrator::{Authentication, SessionState};
pub use transport::{Role, TransportChannel};

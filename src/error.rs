//! Authentication error types.
//!
//! Every failure carries an [`AuthErrorKind`] that places it in the
//! negotiation taxonomy, an optional human-readable context, and an
//! [`ErrorStack`]: the ordered list of `stage: message` entries collected
//! while the session ran. Operators read the stack to see every method
//! that was tried and why each one failed.
//!
//! Lower-level framing failures are expressed as [`TransportError`]
//! (derived with `thiserror`) and are folded into [`AuthError`] at the
//! point where the session decides what they mean.

use core::fmt;
use std::io;

/// Failure category; decides whether the session retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthErrorKind {
    /// Malformed or unreadable negotiation message. Never retried.
    HandshakeFailure,
    /// A specific method denied or failed. The initiating side retries.
    MethodFailure,
    /// The overall deadline passed.
    Timeout,
    /// The candidate set is exhausted or the peers share no method.
    OutOfMethods,
    /// The authenticated peer host differs from the transport peer.
    AddressMismatch,
    /// A wrap/unwrap or handshake crypto primitive failed.
    CryptoFailure,
    /// Framing or I/O failure on the underlying channel.
    Transport,
    /// Invalid or unloadable configuration.
    Configuration,
    /// An operation that needs a completed session ran before completion.
    NotAuthenticated,
    /// The peer sent a value the method's protocol does not allow.
    Protocol,
}

impl AuthErrorKind {
    /// Returns a static description of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HandshakeFailure => "method handshake failed",
            Self::MethodFailure => "authentication method failed",
            Self::Timeout => "authentication timed out",
            Self::OutOfMethods => "no authentication methods left to try",
            Self::AddressMismatch => "authenticated host does not match connection address",
            Self::CryptoFailure => "cryptographic operation failed",
            Self::Transport => "transport failure",
            Self::Configuration => "invalid authentication configuration",
            Self::NotAuthenticated => "session is not authenticated",
            Self::Protocol => "protocol violation",
        }
    }

    /// Returns `true` if the initiating side may retry with another method.
    #[must_use]
    pub const fn is_recoverable(self) -> bool {
        matches!(
            self,
            Self::MethodFailure | Self::AddressMismatch | Self::CryptoFailure | Self::Protocol
        )
    }
}

/// One entry of an [`ErrorStack`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEntry {
    /// Stage that produced the entry, usually a method name or `AUTHENTICATE`.
    pub stage: String,
    /// What went wrong.
    pub message: String,
}

impl fmt::Display for ErrorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.stage, self.message)
    }
}

/// Ordered diagnostic chain accumulated across a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorStack {
    entries: Vec<ErrorEntry>,
}

impl ErrorStack {
    /// Creates an empty stack.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Appends an entry.
    pub fn push(&mut self, stage: impl Into<String>, message: impl Into<String>) {
        self.entries.push(ErrorEntry {
            stage: stage.into(),
            message: message.into(),
        });
    }

    /// Appends every entry of `other`.
    pub fn extend(&mut self, other: &Self) {
        self.entries.extend(other.entries.iter().cloned());
    }

    /// Entries in the order they were pushed.
    #[must_use]
    pub fn entries(&self) -> &[ErrorEntry] {
        &self.entries
    }

    /// Returns `true` if no entry was pushed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns `true` if any entry's stage equals `stage`.
    #[must_use]
    pub fn has_stage(&self, stage: &str) -> bool {
        self.entries.iter().any(|e| e.stage == stage)
    }

    /// Drops all entries.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl fmt::Display for ErrorStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{entry}")?;
        }
        Ok(())
    }
}

/// Why a session, a method or a configuration step failed.
///
/// # Example
///
/// ```
/// use peerauth::{AuthError, AuthErrorKind};
///
/// let err = AuthError::new(AuthErrorKind::MethodFailure)
///     .with_context("KERBEROS: ticket expired");
///
/// assert!(err.is_method_failure());
/// assert!(err.to_string().contains("ticket expired"));
/// ```
#[derive(Debug, Clone)]
pub struct AuthError {
    kind: AuthErrorKind,
    context: Option<String>,
    stack: ErrorStack,
}

impl AuthError {
    /// Creates a new authentication error with the given kind.
    #[must_use]
    pub const fn new(kind: AuthErrorKind) -> Self {
        Self {
            kind,
            context: None,
            stack: ErrorStack::new(),
        }
    }

    /// Creates a method failure.
    #[must_use]
    pub fn method(ctx: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::MethodFailure).with_context(ctx)
    }

    /// Creates a protocol violation error.
    #[must_use]
    pub fn protocol(ctx: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::Protocol).with_context(ctx)
    }

    /// Creates a crypto failure.
    #[must_use]
    pub fn crypto(ctx: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::CryptoFailure).with_context(ctx)
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn config(ctx: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::Configuration).with_context(ctx)
    }

    /// Creates a not-authenticated error.
    #[must_use]
    pub const fn not_authenticated() -> Self {
        Self::new(AuthErrorKind::NotAuthenticated)
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> AuthErrorKind {
        self.kind
    }

    /// Returns `true` if this is a method failure.
    #[must_use]
    pub const fn is_method_failure(&self) -> bool {
        matches!(self.kind, AuthErrorKind::MethodFailure)
    }

    /// Returns `true` if the candidate set ran out.
    #[must_use]
    pub const fn is_out_of_methods(&self) -> bool {
        matches!(self.kind, AuthErrorKind::OutOfMethods)
    }

    /// Returns `true` if the deadline passed.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self.kind, AuthErrorKind::Timeout)
    }

    /// Adds context to the error.
    #[must_use]
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }

    /// Attaches the session's diagnostic chain.
    #[must_use]
    pub fn with_stack(mut self, stack: ErrorStack) -> Self {
        self.stack = stack;
        self
    }

    /// Returns the error context, if any.
    #[must_use]
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Returns the diagnostic chain.
    #[must_use]
    pub const fn stack(&self) -> &ErrorStack {
        &self.stack
    }

    /// Re-tags the error with another kind, keeping context and stack.
    #[must_use]
    pub fn into_kind(mut self, kind: AuthErrorKind) -> Self {
        self.kind = kind;
        self
    }
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind.as_str())?;

        if let Some(ctx) = &self.context {
            write!(f, ": {ctx}")?;
        }

        if !self.stack.is_empty() {
            write!(f, "\n{}", self.stack)?;
        }

        Ok(())
    }
}

impl std::error::Error for AuthError {}

impl From<TransportError> for AuthError {
    fn from(e: TransportError) -> Self {
        Self::new(AuthErrorKind::Transport).with_context(e.to_string())
    }
}

/// `Result` alias used across the crate.
pub type AuthResult<T> = Result<T, AuthError>;

/// Errors raised by the framed transport and its field codec.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Underlying I/O failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// The peer closed the connection.
    #[error("peer closed the connection")]
    Closed,
    /// A frame exceeded the configured maximum.
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge {
        /// Announced length.
        len: usize,
        /// Configured limit.
        max: usize,
    },
    /// A field read ran past the end of the current message.
    #[error("message exhausted reading {0}")]
    MessageExhausted(&'static str),
    /// A string field was not valid UTF-8.
    #[error("string field is not valid utf-8")]
    InvalidUtf8,
    /// An operation was issued in the wrong coding direction.
    #[error("channel is in {actual} mode, {expected} required")]
    WrongMode {
        /// Mode required by the operation.
        expected: &'static str,
        /// Mode the channel was in.
        actual: &'static str,
    },
}

impl TransportError {
    /// Returns `true` if the error means the peer is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        match self {
            Self::Closed => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

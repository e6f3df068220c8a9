//! Authentication method identifiers and candidate sets.
//!
//! Method ids are single bits so that a whole candidate set travels as one
//! integer during the handshake. The numeric values are part of the wire
//! format and must not change.

use core::fmt;
use core::str::FromStr;
use smallvec::SmallVec;

use crate::error::{AuthError, AuthResult};

/// One authentication method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(i32)]
pub enum AuthMethod {
    /// Client asserts its local user name without proof.
    ClaimToBe = 2,
    /// Proof by creating a directory on a local filesystem.
    Filesystem = 4,
    /// Proof by creating a directory on a shared filesystem.
    FilesystemRemote = 8,
    /// Native platform credential negotiation.
    Sspi = 16,
    /// X.509 / GSI.
    Gsi = 32,
    /// Kerberos AP-REQ / AP-REP.
    Kerberos = 64,
    /// Fixed anonymous identity.
    Anonymous = 128,
    /// TLS tunnelled over framed messages.
    Ssl = 256,
    /// Pool password. Recognised on the wire, no local implementation.
    Password = 512,
    /// Host daemon signed credential.
    Munge = 1024,
    /// Signed token method. Recognised on the wire, no local implementation.
    Token = 2048,
    /// TLS followed by a bearer token exchange.
    SciTokens = 4096,
}

/// The "no method" id sent by the server when nothing is shared.
pub const METHOD_NONE: i32 = 0;

/// Legacy "any method" bit. Never selected.
pub const METHOD_ANY: i32 = 1;

impl AuthMethod {
    /// Every method, in the default preference order.
    pub const ALL: [Self; 12] = [
        Self::Ssl,
        Self::SciTokens,
        Self::Gsi,
        Self::Kerberos,
        Self::Munge,
        Self::Filesystem,
        Self::FilesystemRemote,
        Self::Sspi,
        Self::Password,
        Self::Token,
        Self::ClaimToBe,
        Self::Anonymous,
    ];

    /// Returns the wire bit.
    #[must_use]
    pub const fn bit(self) -> i32 {
        self as i32
    }

    /// Resolves a single wire bit back to a method.
    #[must_use]
    pub const fn from_bit(bit: i32) -> Option<Self> {
        Some(match bit {
            2 => Self::ClaimToBe,
            4 => Self::Filesystem,
            8 => Self::FilesystemRemote,
            16 => Self::Sspi,
            32 => Self::Gsi,
            64 => Self::Kerberos,
            128 => Self::Anonymous,
            256 => Self::Ssl,
            512 => Self::Password,
            1024 => Self::Munge,
            2048 => Self::Token,
            4096 => Self::SciTokens,
            _ => return None,
        })
    }

    /// Canonical method name as used in mapfiles and diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ClaimToBe => "CLAIMTOBE",
            Self::Filesystem => "FS",
            Self::FilesystemRemote => "FS_REMOTE",
            Self::Sspi => "NTSSPI",
            Self::Gsi => "GSI",
            Self::Kerberos => "KERBEROS",
            Self::Anonymous => "ANONYMOUS",
            Self::Ssl => "SSL",
            Self::Password => "PASSWORD",
            Self::Munge => "MUNGE",
            Self::Token => "TOKEN",
            Self::SciTokens => "SCITOKENS",
        }
    }

    /// Returns `true` if the method may need to yield instead of blocking.
    #[must_use]
    pub const fn is_resumable(self) -> bool {
        matches!(self, Self::Ssl | Self::SciTokens | Self::Kerberos)
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AuthMethod {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        Ok(match upper.as_str() {
            "CLAIMTOBE" => Self::ClaimToBe,
            "FS" => Self::Filesystem,
            "FS_REMOTE" => Self::FilesystemRemote,
            "NTSSPI" => Self::Sspi,
            "GSI" | "X509" => Self::Gsi,
            "KERBEROS" => Self::Kerberos,
            "ANONYMOUS" => Self::Anonymous,
            "SSL" => Self::Ssl,
            "PASSWORD" => Self::Password,
            "MUNGE" => Self::Munge,
            "TOKEN" | "IDTOKENS" => Self::Token,
            "SCITOKENS" | "SCITOKEN" => Self::SciTokens,
            _ => {
                return Err(AuthError::config(format!(
                    "unknown authentication method '{s}'"
                )));
            }
        })
    }
}

/// An ordered set of methods that can also be viewed as a bitmask.
///
/// Order is preference order. Inserting an existing member is a no-op and
/// removal keeps the relative order of the rest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodSet {
    order: SmallVec<[AuthMethod; 12]>,
}

impl MethodSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set from methods in preference order, dropping duplicates.
    #[must_use]
    pub fn from_ordered(methods: impl IntoIterator<Item = AuthMethod>) -> Self {
        let mut set = Self::new();
        for m in methods {
            set.insert(m);
        }
        set
    }

    /// Parses a comma or whitespace separated list of method names.
    pub fn parse_list(list: &str) -> AuthResult<Self> {
        let mut set = Self::new();
        for token in list
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|t| !t.is_empty())
        {
            set.insert(token.parse()?);
        }
        Ok(set)
    }

    /// Decodes a wire bitmask. Unknown bits are ignored; order follows
    /// [`AuthMethod::ALL`].
    #[must_use]
    pub fn from_bitmask(mask: i32) -> Self {
        Self::from_ordered(
            AuthMethod::ALL
                .iter()
                .copied()
                .filter(|m| mask & m.bit() != 0),
        )
    }

    /// Appends `method` if absent.
    pub fn insert(&mut self, method: AuthMethod) {
        if !self.contains(method) {
            self.order.push(method);
        }
    }

    /// Removes `method`, returning whether it was present.
    pub fn remove(&mut self, method: AuthMethod) -> bool {
        let before = self.order.len();
        self.order.retain(|m| *m != method);
        before != self.order.len()
    }

    /// Returns `true` if `method` is a member.
    #[must_use]
    pub fn contains(&self, method: AuthMethod) -> bool {
        self.order.contains(&method)
    }

    /// Bitwise OR of every member.
    #[must_use]
    pub fn bitmask(&self) -> i32 {
        self.order.iter().fold(0, |acc, m| acc | m.bit())
    }

    /// Members of `self`, in `self`'s order, that satisfy `keep`.
    #[must_use]
    pub fn filtered(&self, mut keep: impl FnMut(AuthMethod) -> bool) -> Self {
        Self {
            order: self.order.iter().copied().filter(|m| keep(*m)).collect(),
        }
    }

    /// First member of `self` whose bit is set in `mask`.
    #[must_use]
    pub fn first_in_mask(&self, mask: i32) -> Option<AuthMethod> {
        self.order.iter().copied().find(|m| mask & m.bit() != 0)
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns `true` if there are no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Iterates members in preference order.
    pub fn iter(&self) -> impl Iterator<Item = AuthMethod> + '_ {
        self.order.iter().copied()
    }
}

impl FromIterator<AuthMethod> for MethodSet {
    fn from_iter<I: IntoIterator<Item = AuthMethod>>(iter: I) -> Self {
        Self::from_ordered(iter)
    }
}

impl fmt::Display for MethodSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, m) in self.order.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            f.write_str(m.name())?;
        }
        Ok(())
    }
}

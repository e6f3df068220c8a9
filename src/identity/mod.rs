//! Peer identities before and after canonicalization.
//!
//! A method fills a [`PeerIdentity`] while it runs. Once it succeeds the
//! session freezes an [`AuthenticatedIdentity`] snapshot from it and asks
//! the [`IdentityMapper`] for the canonical `user@domain`.

pub mod lazy;
pub mod mapfile;
pub mod mapper;
pub mod realm;

use std::cell::OnceCell;
use std::collections::BTreeMap;
use std::time::SystemTime;

pub use mapfile::{MapFile, MapRule};
pub use mapper::IdentityMapper;
pub use realm::{RealmMap, RealmMapper};

/// Domain given to identities no rule mapped.
pub const UNMAPPED_DOMAIN: &str = "unmapped";

/// User name for peers that proved nothing.
pub const UNAUTHENTICATED_USER: &str = "unauthenticated";

/// Fully qualified form of [`UNAUTHENTICATED_USER`].
pub const UNAUTHENTICATED_FQU: &str = "unauthenticated@unmapped";

/// User assigned by the anonymous method.
pub const ANONYMOUS_USER: &str = "anonymous";

/// Splits a canonical name at the first `@`.
///
/// Without an `@` the whole name is the user and `default_domain` applies.
///
/// ```
/// use peerauth::identity::split_canonical_name;
///
/// assert_eq!(
///     split_canonical_name("alice@example.org", "local"),
///     ("alice".to_string(), "example.org".to_string())
/// );
/// assert_eq!(
///     split_canonical_name("bob", "local"),
///     ("bob".to_string(), "local".to_string())
/// );
/// ```
#[must_use]
pub fn split_canonical_name(name: &str, default_domain: &str) -> (String, String) {
    match name.split_once('@') {
        Some((user, domain)) => (user.to_owned(), domain.to_owned()),
        None => (name.to_owned(), default_domain.to_owned()),
    }
}

/// `user@domain`, with a cached fully qualified form.
///
/// The cache is dropped whenever either half is written, so
/// [`fully_qualified_user`](Self::fully_qualified_user) never returns a
/// stale value.
#[derive(Debug, Clone, Default)]
pub struct CanonicalIdentity {
    user: Option<String>,
    domain: Option<String>,
    fqu: OnceCell<Option<String>>,
}

impl PartialEq for CanonicalIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.user == other.user && self.domain == other.domain
    }
}

impl Eq for CanonicalIdentity {}

impl CanonicalIdentity {
    /// Creates an identity with both halves set.
    #[must_use]
    pub fn new(user: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            domain: Some(domain.into()),
            fqu: OnceCell::new(),
        }
    }

    /// The user half.
    #[must_use]
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// The domain half.
    #[must_use]
    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    /// Replaces the user and drops the cached fully qualified form.
    pub fn set_user(&mut self, user: Option<String>) {
        self.user = user;
        self.fqu = OnceCell::new();
    }

    /// Replaces the domain and drops the cached fully qualified form.
    pub fn set_domain(&mut self, domain: Option<String>) {
        self.domain = domain;
        self.fqu = OnceCell::new();
    }

    /// `user@domain`, or `user` alone when there is no domain.
    #[must_use]
    pub fn fully_qualified_user(&self) -> Option<&str> {
        self.fqu
            .get_or_init(|| match (&self.user, &self.domain) {
                (Some(user), Some(domain)) => Some(format!("{user}@{domain}")),
                (Some(user), None) => Some(user.clone()),
                _ => None,
            })
            .as_deref()
    }

    /// Returns `true` if the fully qualified form is currently cached.
    #[must_use]
    pub fn is_cached(&self) -> bool {
        self.fqu.get().is_some()
    }
}

/// Claims extracted from a verified bearer token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenClaims {
    /// `iss`.
    pub issuer: String,
    /// `sub`.
    pub subject: String,
    /// `jti`, if present.
    pub token_id: Option<String>,
    /// Space separated `scope` entries.
    pub scopes: Vec<String>,
    /// Group memberships.
    pub groups: Vec<String>,
    /// `exp`.
    pub expires_at: Option<SystemTime>,
}

/// Identity state a method fills in while it runs.
#[derive(Debug, Clone, Default)]
pub struct PeerIdentity {
    canonical: CanonicalIdentity,
    remote_host: Option<String>,
    authenticated_name: Option<String>,
    alternate_names: Vec<String>,
    claims: Option<TokenClaims>,
    attributes: BTreeMap<String, String>,
}

impl PeerIdentity {
    /// Current user/domain pair.
    #[must_use]
    pub const fn canonical(&self) -> &CanonicalIdentity {
        &self.canonical
    }

    /// Remote user.
    #[must_use]
    pub fn remote_user(&self) -> Option<&str> {
        self.canonical.user()
    }

    /// Remote domain.
    #[must_use]
    pub fn remote_domain(&self) -> Option<&str> {
        self.canonical.domain()
    }

    /// Host the method authenticated, if it binds one.
    #[must_use]
    pub fn remote_host(&self) -> Option<&str> {
        self.remote_host.as_deref()
    }

    /// Raw principal before mapping.
    #[must_use]
    pub fn authenticated_name(&self) -> Option<&str> {
        self.authenticated_name.as_deref()
    }

    /// Fully qualified user derived from the current pair.
    #[must_use]
    pub fn fully_qualified_user(&self) -> Option<&str> {
        self.canonical.fully_qualified_user()
    }

    /// Sets the remote user.
    pub fn set_remote_user(&mut self, user: impl Into<String>) {
        self.canonical.set_user(Some(user.into()));
    }

    /// Sets the remote domain.
    pub fn set_remote_domain(&mut self, domain: impl Into<String>) {
        self.canonical.set_domain(Some(domain.into()));
    }

    /// Sets the authenticated host.
    pub fn set_remote_host(&mut self, host: impl Into<String>) {
        self.remote_host = Some(host.into());
    }

    /// Sets the raw principal.
    pub fn set_authenticated_name(&mut self, name: impl Into<String>) {
        self.authenticated_name = Some(name.into());
    }

    /// Adds a mapping key tried before the raw principal.
    pub fn push_alternate_name(&mut self, name: impl Into<String>) {
        self.alternate_names.push(name.into());
    }

    /// Attaches verified token claims.
    pub fn set_claims(&mut self, claims: TokenClaims) {
        self.claims = Some(claims);
    }

    /// Records a free-form attribute, e.g. an FQAN.
    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// Freezes the current state.
    #[must_use]
    pub fn snapshot(
        &self,
        method_name: &str,
        authenticated_until: Option<SystemTime>,
    ) -> AuthenticatedIdentity {
        AuthenticatedIdentity {
            raw_principal: self
                .authenticated_name
                .clone()
                .or_else(|| self.canonical.user.clone()),
            method_name: method_name.to_owned(),
            remote_user: self.canonical.user.clone(),
            remote_host: self.remote_host.clone(),
            remote_domain: self.canonical.domain.clone(),
            authenticated_until,
            alternate_names: self.alternate_names.clone(),
            claims: self.claims.clone(),
            attributes: self.attributes.clone(),
        }
    }
}

/// Immutable record of what a method established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedIdentity {
    /// Method-specific principal, e.g. a Kerberos principal or DN.
    pub raw_principal: Option<String>,
    /// Canonical method name.
    pub method_name: String,
    /// User the method assigned before mapping.
    pub remote_user: Option<String>,
    /// Host the method bound, if any.
    pub remote_host: Option<String>,
    /// Domain the method assigned before mapping.
    pub remote_domain: Option<String>,
    /// Credential expiry, if tracked.
    pub authenticated_until: Option<SystemTime>,
    /// Keys tried before `raw_principal`, most specific first.
    pub alternate_names: Vec<String>,
    /// Verified token claims.
    pub claims: Option<TokenClaims>,
    /// Method-specific attributes.
    pub attributes: BTreeMap<String, String>,
}

impl AuthenticatedIdentity {
    /// Mapping keys in the order they should be tried.
    pub fn mapping_keys(&self) -> impl Iterator<Item = &str> {
        self.alternate_names
            .iter()
            .map(String::as_str)
            .chain(self.raw_principal.as_deref())
    }
}

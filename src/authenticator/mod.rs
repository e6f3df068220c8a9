//! Pluggable authentication methods.
//!
//! Every method implements [`Authenticator`] and owns its wire
//! sub-protocol. Methods never know about each other: the session picks one
//! through the [`MethodRegistry`], which only holds factories for methods
//! whose local prerequisites (key material, daemons, native mechanisms) were
//! available when it was built.
//!
//! ```text
//!   MethodRegistry ──create(method, ctx)──► Box<dyn Authenticator>
//!        ▲                                      │ authenticate / continue
//!   from_config(AuthConfig, Providers)          │ wrap / unwrap
//!                                               ▼
//!                                         PeerIdentity
//! ```

pub mod anonymous;
pub mod claim;
pub mod fs;
pub mod gsi;
pub mod gss;
pub mod kerberos;
#[cfg(any(test, feature = "test-internals"))]
pub mod loopback;
pub mod munge;
#[cfg(feature = "tls")]
pub mod ssl;
pub mod sspi;
#[cfg(feature = "tokens")]
pub mod token;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::task::Poll;
use std::time::SystemTime;

use crate::config::AuthConfig;
use crate::continuation::DriveMode;
use crate::crypto::{EntropySource, SessionCipher};
use crate::error::{AuthError, AuthResult};
use crate::identity::{PeerIdentity, RealmMapper};
use crate::method::{AuthMethod, MethodSet};
use crate::transport::{Role, TransportChannel};

pub use anonymous::AnonymousAuthenticator;
pub use claim::ClaimToBeAuthenticator;
pub use fs::{FsAuthenticator, MarkerStat};
pub use gsi::{CredentialCache, GsiAuthenticator, GsiCredential, GssMechanism};
pub use gss::{GssContext, GssStep};
pub use kerberos::{
    CredentialSource, KerberosAcceptance, KerberosAuthenticator, KerberosInitiator,
    KerberosMechanism, KerberosSession,
};
pub use munge::{MungeAuthenticator, MungeCommand, MungeCredential, MungeDaemon};
#[cfg(feature = "tls")]
pub use ssl::{SslAuthenticator, SslContext};
pub use sspi::{Impersonation, SspiAuthenticator, SspiProvider};

/// One authentication method's implementation.
///
/// Blocking methods complete inside [`authenticate`](Self::authenticate)
/// and always return `Poll::Ready`. Resumable methods may return
/// `Poll::Pending` when driven with [`DriveMode::NonBlocking`]; the caller
/// then invokes [`authenticate_continue`](Self::authenticate_continue) once
/// the channel is readable.
pub trait Authenticator: Send {
    /// Method implemented.
    fn method(&self) -> AuthMethod;

    /// Runs the method's protocol.
    fn authenticate(
        &mut self,
        chan: &mut dyn TransportChannel,
        remote_host: Option<&str>,
        mode: DriveMode,
    ) -> Poll<AuthResult<()>>;

    /// Resumes a protocol that returned `Poll::Pending`.
    fn authenticate_continue(
        &mut self,
        _chan: &mut dyn TransportChannel,
        _mode: DriveMode,
    ) -> Poll<AuthResult<()>> {
        Poll::Ready(Err(AuthError::protocol(format!(
            "{} has no pending protocol to resume",
            self.method()
        ))))
    }

    /// Returns `true` once the method can wrap and unwrap.
    fn is_valid(&self) -> bool;

    /// Expiry of the established credential, if tracked.
    fn end_time(&self) -> Option<SystemTime> {
        None
    }

    /// Identity established so far.
    fn peer(&self) -> &PeerIdentity;

    /// Mutable identity, used by the session to apply mapping results.
    fn peer_mut(&mut self) -> &mut PeerIdentity;

    /// Protects `plaintext`. Methods without key material copy it.
    fn wrap(&self, plaintext: &[u8]) -> AuthResult<Vec<u8>> {
        passthrough(self.is_valid(), plaintext)
    }

    /// Reverses [`wrap`](Self::wrap).
    fn unwrap(&self, ciphertext: &[u8]) -> AuthResult<Vec<u8>> {
        passthrough(self.is_valid(), ciphertext)
    }
}

/// Identity copy for methods without key material.
pub(crate) fn passthrough(valid: bool, buf: &[u8]) -> AuthResult<Vec<u8>> {
    if valid {
        Ok(buf.to_vec())
    } else {
        Err(AuthError::not_authenticated())
    }
}

/// An established mechanism context able to protect messages.
pub trait SecurityContext: Send {
    /// Protects `plaintext`.
    fn wrap(&self, plaintext: &[u8]) -> AuthResult<Vec<u8>>;

    /// Reverses [`wrap`](Self::wrap).
    fn unwrap(&self, ciphertext: &[u8]) -> AuthResult<Vec<u8>>;

    /// Credential expiry.
    fn end_time(&self) -> Option<SystemTime> {
        None
    }
}

/// A [`SecurityContext`] backed by a session cipher.
pub struct CipherContext {
    cipher: SessionCipher,
    entropy: Arc<dyn EntropySource>,
    end_time: Option<SystemTime>,
}

impl CipherContext {
    /// Derives a context from shared key material.
    pub fn new(
        material: &[u8],
        entropy: Arc<dyn EntropySource>,
        end_time: Option<SystemTime>,
    ) -> AuthResult<Self> {
        Ok(Self {
            cipher: SessionCipher::new(material)?,
            entropy,
            end_time,
        })
    }
}

impl core::fmt::Debug for CipherContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CipherContext")
            .field("entropy", &self.entropy.source_id())
            .field("end_time", &self.end_time)
            .finish_non_exhaustive()
    }
}

impl SecurityContext for CipherContext {
    fn wrap(&self, plaintext: &[u8]) -> AuthResult<Vec<u8>> {
        self.cipher.seal(self.entropy.as_ref(), plaintext)
    }

    fn unwrap(&self, ciphertext: &[u8]) -> AuthResult<Vec<u8>> {
        self.cipher.open(ciphertext)
    }

    fn end_time(&self) -> Option<SystemTime> {
        self.end_time
    }
}

/// Resolves numeric user ids to account names.
pub trait UserDirectory: Send + Sync {
    /// Account name owning `uid`.
    fn user_name(&self, uid: u32) -> Option<String>;

    /// Account name of the running process.
    fn current_user(&self) -> Option<String>;
}

/// The operating system's account database.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemUsers;

#[cfg(unix)]
impl UserDirectory for SystemUsers {
    fn user_name(&self, uid: u32) -> Option<String> {
        nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
            .ok()
            .flatten()
            .map(|user| user.name)
    }

    fn current_user(&self) -> Option<String> {
        self.user_name(nix::unistd::geteuid().as_raw())
            .or_else(|| std::env::var("USER").ok())
    }
}

#[cfg(not(unix))]
impl UserDirectory for SystemUsers {
    fn user_name(&self, _uid: u32) -> Option<String> {
        None
    }

    fn current_user(&self) -> Option<String> {
        std::env::var("USERNAME").ok()
    }
}

/// A fixed account table.
#[derive(Debug, Default, Clone)]
pub struct StaticUsers {
    names: HashMap<u32, String>,
    current: Option<String>,
}

impl StaticUsers {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `uid -> name`.
    #[must_use]
    pub fn with_user(mut self, uid: u32, name: impl Into<String>) -> Self {
        self.names.insert(uid, name.into());
        self
    }

    /// Sets the name reported for the running process.
    #[must_use]
    pub fn with_current(mut self, name: impl Into<String>) -> Self {
        self.current = Some(name.into());
        self
    }
}

impl UserDirectory for StaticUsers {
    fn user_name(&self, uid: u32) -> Option<String> {
        self.names.get(&uid).cloned()
    }

    fn current_user(&self) -> Option<String> {
        self.current.clone()
    }
}

/// Native collaborators a method may need.
///
/// A method whose provider is absent is not registered.
#[derive(Clone)]
pub struct Providers {
    /// Kerberos mechanism.
    pub kerberos: Option<Arc<dyn KerberosMechanism>>,
    /// GSI mechanism.
    pub gsi: Option<Arc<dyn GssMechanism>>,
    /// Native platform negotiation.
    pub sspi: Option<Arc<dyn SspiProvider>>,
    /// Credential daemon.
    pub munge: Option<Arc<dyn MungeDaemon>>,
    /// Account lookups.
    pub users: Arc<dyn UserDirectory>,
}

impl Default for Providers {
    fn default() -> Self {
        Self {
            kerberos: None,
            gsi: None,
            sspi: None,
            munge: None,
            users: Arc::new(SystemUsers),
        }
    }
}

impl core::fmt::Debug for Providers {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Providers")
            .field("kerberos", &self.kerberos.is_some())
            .field("gsi", &self.gsi.is_some())
            .field("sspi", &self.sspi.is_some())
            .field("munge", &self.munge.is_some())
            .finish_non_exhaustive()
    }
}

impl Providers {
    /// Replaces the account directory.
    #[must_use]
    pub fn with_users(mut self, users: Arc<dyn UserDirectory>) -> Self {
        self.users = users;
        self
    }

    /// Supplies a Kerberos mechanism.
    #[must_use]
    pub fn with_kerberos(mut self, mech: Arc<dyn KerberosMechanism>) -> Self {
        self.kerberos = Some(mech);
        self
    }

    /// Supplies a GSI mechanism.
    #[must_use]
    pub fn with_gsi(mut self, mech: Arc<dyn GssMechanism>) -> Self {
        self.gsi = Some(mech);
        self
    }

    /// Supplies a native negotiation provider.
    #[must_use]
    pub fn with_sspi(mut self, provider: Arc<dyn SspiProvider>) -> Self {
        self.sspi = Some(provider);
        self
    }

    /// Supplies a credential daemon.
    #[must_use]
    pub fn with_munge(mut self, daemon: Arc<dyn MungeDaemon>) -> Self {
        self.munge = Some(daemon);
        self
    }
}

/// Everything a factory may draw on when instantiating a method.
#[derive(Clone)]
pub struct MethodContext {
    /// Session configuration.
    pub config: Arc<AuthConfig>,
    /// This end's role.
    pub role: Role,
    /// Randomness for keys and nonces.
    pub entropy: Arc<dyn EntropySource>,
    /// Native collaborators.
    pub providers: Providers,
}

/// Instantiates one method for one attempt.
pub trait AuthenticatorFactory: Send + Sync {
    /// Creates a fresh authenticator.
    fn create(&self, ctx: &MethodContext) -> AuthResult<Box<dyn Authenticator>>;
}

impl<F> AuthenticatorFactory for F
where
    F: Fn(&MethodContext) -> AuthResult<Box<dyn Authenticator>> + Send + Sync,
{
    fn create(&self, ctx: &MethodContext) -> AuthResult<Box<dyn Authenticator>> {
        self(ctx)
    }
}

/// Runtime capability table: method id to factory.
#[derive(Clone, Default)]
pub struct MethodRegistry {
    factories: BTreeMap<AuthMethod, Arc<dyn AuthenticatorFactory>>,
    providers: Providers,
}

impl core::fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("available", &self.available().to_string())
            .finish_non_exhaustive()
    }
}

impl MethodRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty registry that hands `providers` to its factories.
    #[must_use]
    pub fn with_providers(providers: Providers) -> Self {
        Self {
            factories: BTreeMap::new(),
            providers,
        }
    }

    /// Registers every method whose prerequisites are present.
    #[must_use]
    pub fn from_config(config: &AuthConfig, providers: Providers) -> Self {
        let mut registry = Self::with_providers(providers);

        registry.register(AuthMethod::Anonymous, anonymous::create);
        registry.register(AuthMethod::ClaimToBe, claim::create);
        if cfg!(unix) {
            registry.register(AuthMethod::Filesystem, fs::create_local);
            if config.fs.remote_dir.is_some() {
                registry.register(AuthMethod::FilesystemRemote, fs::create_remote);
            }
        }
        if registry.providers.munge.is_some() {
            registry.register(AuthMethod::Munge, munge::create);
        }
        if registry.providers.kerberos.is_some() {
            let realms = Arc::new(RealmMapper::new(config.kerberos.realm_map_file.clone()));
            registry.register(AuthMethod::Kerberos, kerberos::factory(realms));
        }
        if registry.providers.gsi.is_some() {
            registry.register(AuthMethod::Gsi, gsi::factory(Arc::new(CredentialCache::default())));
        }
        if registry.providers.sspi.is_some() {
            registry.register(AuthMethod::Sspi, sspi::create);
        }
        #[cfg(feature = "tls")]
        registry.register_tls(config);

        tracing::debug!(available = %registry.available(), "method registry built");
        registry
    }

    #[cfg(feature = "tls")]
    fn register_tls(&mut self, config: &AuthConfig) {
        let tls = match SslContext::from_config(config) {
            Ok(tls) => Arc::new(tls),
            Err(err) => {
                tracing::info!(error = %err, "SSL unavailable");
                return;
            }
        };
        let plain = Arc::clone(&tls);
        self.register(
            AuthMethod::Ssl,
            move |ctx: &MethodContext| -> AuthResult<Box<dyn Authenticator>> {
                Ok(Box::new(SslAuthenticator::new(
                    ctx,
                    Arc::clone(&plain),
                    false,
                )?))
            },
        );

        #[cfg(feature = "tokens")]
        match token::TokenVerifier::from_config(&config.tokens) {
            Ok(verifier) => {
                let client_token = token::client_token(&config.tokens);
                if verifier.is_empty() && client_token.is_none() {
                    tracing::debug!("SCITOKENS unavailable: no issuers and no token");
                    return;
                }
                let verifier: Arc<dyn ssl::BearerVerifier> = Arc::new(verifier);
                self.register(
                    AuthMethod::SciTokens,
                    move |ctx: &MethodContext| -> AuthResult<Box<dyn Authenticator>> {
                        Ok(Box::new(
                            SslAuthenticator::new(ctx, Arc::clone(&tls), true)?
                                .with_tokens(Arc::clone(&verifier), client_token.clone()),
                        ))
                    },
                );
            }
            Err(err) => tracing::info!(error = %err, "SCITOKENS unavailable"),
        }
    }

    /// Adds or replaces the factory for `method`.
    pub fn register(&mut self, method: AuthMethod, factory: impl AuthenticatorFactory + 'static) {
        self.factories.insert(method, Arc::new(factory));
    }

    /// Removes `method`, returning whether it was registered.
    pub fn unregister(&mut self, method: AuthMethod) -> bool {
        self.factories.remove(&method).is_some()
    }

    /// Returns `true` if `method` can be instantiated.
    #[must_use]
    pub fn is_available(&self, method: AuthMethod) -> bool {
        self.factories.contains_key(&method)
    }

    /// Registered methods in default preference order.
    #[must_use]
    pub fn available(&self) -> MethodSet {
        MethodSet::from_ordered(
            AuthMethod::ALL
                .iter()
                .copied()
                .filter(|m| self.factories.contains_key(m)),
        )
    }

    /// Providers handed to factories.
    #[must_use]
    pub const fn providers(&self) -> &Providers {
        &self.providers
    }

    /// Instantiates `method`.
    pub fn create(
        &self,
        method: AuthMethod,
        config: &Arc<AuthConfig>,
        role: Role,
        entropy: &Arc<dyn EntropySource>,
    ) -> AuthResult<Box<dyn Authenticator>> {
        let factory = self.factories.get(&method).ok_or_else(|| {
            AuthError::config(format!("{method} is not available on this host"))
        })?;
        let ctx = MethodContext {
            config: Arc::clone(config),
            role,
            entropy: Arc::clone(entropy),
            providers: self.providers.clone(),
        };
        factory.create(&ctx)
    }
}

/// Maps a transport failure inside a method to a method failure.
pub(crate) fn wire(method: AuthMethod, what: &str) -> impl FnOnce(crate::error::TransportError) -> AuthError {
    let what = what.to_owned();
    move |err| {
        let kind = if err.is_closed() {
            crate::error::AuthErrorKind::Transport
        } else {
            crate::error::AuthErrorKind::MethodFailure
        };
        AuthError::new(kind).with_context(format!("{method}: {what}: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::os_entropy;

    #[test]
    fn default_registry_has_local_methods_only() {
        let registry = MethodRegistry::from_config(&AuthConfig::default(), Providers::default());
        assert!(registry.is_available(AuthMethod::Anonymous));
        assert!(registry.is_available(AuthMethod::ClaimToBe));
        assert!(!registry.is_available(AuthMethod::Kerberos));
        assert!(!registry.is_available(AuthMethod::Munge));
        assert!(!registry.is_available(AuthMethod::FilesystemRemote));
        assert!(!registry.is_available(AuthMethod::Password));
        assert!(!registry.is_available(AuthMethod::Token));
    }

    #[test]
    fn custom_factory_and_unregister() {
        let mut registry = MethodRegistry::new();
        registry.register(
            AuthMethod::Password,
            |_: &MethodContext| -> AuthResult<Box<dyn Authenticator>> {
                Err(AuthError::config("no pool password"))
            },
        );
        assert!(registry.available().contains(AuthMethod::Password));

        let config = Arc::new(AuthConfig::default());
        let err = registry
            .create(AuthMethod::Password, &config, Role::Server, &os_entropy())
            .err()
            .expect("factory fails");
        assert!(err.to_string().contains("pool password"));

        assert!(registry.unregister(AuthMethod::Password));
        assert!(registry.available().is_empty());
    }

    #[test]
    fn static_users_lookup() {
        let users = StaticUsers::new().with_user(1000, "alice").with_current("bob");
        assert_eq!(users.user_name(1000).as_deref(), Some("alice"));
        assert_eq!(users.user_name(1), None);
        assert_eq!(users.current_user().as_deref(), Some("bob"));
    }

    #[test]
    fn passthrough_requires_validity() {
        assert_eq!(passthrough(true, b"").expect("empty ok"), Vec::<u8>::new());
        assert!(passthrough(false, b"x").is_err());
    }
}

//! X.509 proxy authentication (GSI).
//!
//! Context establishment runs the shared token loop in [`super::gss`];
//! the proxy handling lives behind [`GssMechanism`]. A successful server
//! side sees the client's certificate subject (DN) and, when the proxy
//! carries VOMS attributes, its first FQAN. The identity is user `gsi` in
//! the `unmapped` domain: only the mapfile turns a DN into a local account.
//!
//! The local credential is acquired once and cached until it expires.

use std::sync::Arc;
use std::task::Poll;
use std::time::SystemTime;

use parking_lot::Mutex;

use super::gss::{self, GssContext};
use super::{Authenticator, MethodContext};
use crate::config::GsiConfig;
use crate::continuation::DriveMode;
use crate::error::{AuthError, AuthResult};
use crate::identity::{PeerIdentity, UNMAPPED_DOMAIN};
use crate::method::AuthMethod;
use crate::transport::{Role, TransportChannel};

/// User assigned to GSI peers before mapping.
pub const GSI_USER: &str = "gsi";

/// Attribute key under which the peer's FQAN is recorded.
pub const FQAN_ATTRIBUTE: &str = "fqan";

/// A local X.509 credential.
#[derive(Clone)]
pub struct GsiCredential {
    /// Certificate subject.
    pub subject: String,
    /// `notAfter` of the credential.
    pub expires_at: Option<SystemTime>,
    /// Mechanism-specific handle or encoded proxy.
    pub material: Vec<u8>,
}

impl GsiCredential {
    /// Returns `true` once `now` is past the expiry.
    #[must_use]
    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

impl core::fmt::Debug for GsiCredential {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GsiCredential")
            .field("subject", &self.subject)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Native X.509 context operations.
pub trait GssMechanism: Send + Sync {
    /// Loads this process's credential.
    fn acquire_credential(&self) -> AuthResult<GsiCredential>;

    /// Starts an initiating context.
    fn initiate(
        &self,
        credential: &GsiCredential,
        target: Option<&str>,
        delegate: bool,
    ) -> AuthResult<Box<dyn GssContext>>;

    /// Starts an accepting context.
    fn accept(&self, credential: &GsiCredential) -> AuthResult<Box<dyn GssContext>>;
}

/// Process-wide slot for the local credential.
#[derive(Debug, Default)]
pub struct CredentialCache {
    slot: Mutex<Option<Arc<GsiCredential>>>,
}

impl CredentialCache {
    /// The cached credential, acquiring a new one if none is held or the
    /// held one expired.
    pub fn get_or_acquire(&self, mechanism: &dyn GssMechanism) -> AuthResult<Arc<GsiCredential>> {
        let mut slot = self.slot.lock();
        if let Some(cred) = slot.as_ref() {
            if !cred.is_expired(SystemTime::now()) {
                return Ok(Arc::clone(cred));
            }
            tracing::info!(subject = %cred.subject, "GSI credential expired, reacquiring");
        }
        let cred = Arc::new(mechanism.acquire_credential()?);
        tracing::debug!(subject = %cred.subject, "GSI credential acquired");
        *slot = Some(Arc::clone(&cred));
        Ok(cred)
    }

    /// Drops the cached credential.
    pub fn invalidate(&self) {
        *self.slot.lock() = None;
    }

    /// Returns `true` if a credential is cached.
    #[must_use]
    pub fn is_cached(&self) -> bool {
        self.slot.lock().is_some()
    }
}

/// The GSI method.
pub struct GsiAuthenticator {
    role: Role,
    mechanism: Arc<dyn GssMechanism>,
    cache: Arc<CredentialCache>,
    options: GsiConfig,
    context: Option<Box<dyn GssContext>>,
    delegated: Option<Vec<u8>>,
    peer: PeerIdentity,
}

impl core::fmt::Debug for GsiAuthenticator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GsiAuthenticator")
            .field("role", &self.role)
            .field("valid", &self.context.is_some())
            .field("delegated", &self.delegated.is_some())
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl GsiAuthenticator {
    /// Creates the method.
    #[must_use]
    pub fn new(
        role: Role,
        mechanism: Arc<dyn GssMechanism>,
        cache: Arc<CredentialCache>,
        options: GsiConfig,
    ) -> Self {
        Self {
            role,
            mechanism,
            cache,
            options,
            context: None,
            delegated: None,
            peer: PeerIdentity::default(),
        }
    }

    /// Credential the client delegated, on the accepting side.
    #[must_use]
    pub fn delegated_credential(&self) -> Option<&[u8]> {
        self.delegated.as_deref()
    }

    fn open_context(&self, target: Option<&str>) -> AuthResult<Box<dyn GssContext>> {
        let cred = self.cache.get_or_acquire(self.mechanism.as_ref())?;
        match self.role {
            Role::Client => self
                .mechanism
                .initiate(&cred, target, self.options.delegate),
            Role::Server => self.mechanism.accept(&cred),
        }
    }

    /// Applies local policy to an established context.
    fn judge(&mut self, context: &mut dyn GssContext) -> AuthResult<()> {
        let subject = context
            .peer_name()
            .ok_or_else(|| AuthError::method("GSI: peer presented no subject"))?;
        match self.role {
            Role::Client => {
                if let Some(expected) = &self.options.server_name {
                    if *expected != subject {
                        return Err(AuthError::method(format!(
                            "GSI: server subject {subject} does not match expected {expected}"
                        )));
                    }
                }
            }
            Role::Server => {
                self.peer.set_remote_user(GSI_USER);
                self.peer.set_remote_domain(UNMAPPED_DOMAIN);
                if let Some(fqan) = context.peer_attribute() {
                    if self.options.use_fqan {
                        self.peer.push_alternate_name(format!("{subject},{fqan}"));
                    }
                    self.peer.set_attribute(FQAN_ATTRIBUTE, fqan);
                }
                self.delegated = context.take_delegated();
            }
        }
        self.peer.set_authenticated_name(subject);
        Ok(())
    }

    fn run(&mut self, chan: &mut dyn TransportChannel, remote_host: Option<&str>) -> AuthResult<()> {
        let method = AuthMethod::Gsi;
        let mut context = match self.open_context(remote_host) {
            Ok(context) => context,
            Err(err) => return Err(gss::refuse(method, self.role, chan, err)),
        };
        gss::establish(method, self.role, context.as_mut(), chan)?;
        let verdict = self.judge(context.as_mut());
        gss::exchange_verdicts(method, self.role, chan, verdict)?;
        tracing::debug!(
            side = self.role.as_str(),
            peer = ?self.peer.authenticated_name(),
            "GSI context established"
        );
        self.context = Some(context);
        Ok(())
    }
}

impl Authenticator for GsiAuthenticator {
    fn method(&self) -> AuthMethod {
        AuthMethod::Gsi
    }

    fn authenticate(
        &mut self,
        chan: &mut dyn TransportChannel,
        remote_host: Option<&str>,
        _mode: DriveMode,
    ) -> Poll<AuthResult<()>> {
        Poll::Ready(self.run(chan, remote_host))
    }

    fn is_valid(&self) -> bool {
        self.context.is_some()
    }

    fn end_time(&self) -> Option<SystemTime> {
        self.context.as_ref().and_then(|ctx| ctx.end_time())
    }

    fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    fn peer_mut(&mut self) -> &mut PeerIdentity {
        &mut self.peer
    }

    fn wrap(&self, plaintext: &[u8]) -> AuthResult<Vec<u8>> {
        self.context
            .as_ref()
            .ok_or_else(AuthError::not_authenticated)?
            .wrap(plaintext)
    }

    fn unwrap(&self, ciphertext: &[u8]) -> AuthResult<Vec<u8>> {
        self.context
            .as_ref()
            .ok_or_else(AuthError::not_authenticated)?
            .unwrap(ciphertext)
    }
}

/// Factory closure for the registry; `cache` is shared across attempts.
pub(crate) fn factory(
    cache: Arc<CredentialCache>,
) -> impl Fn(&MethodContext) -> AuthResult<Box<dyn Authenticator>> + Send + Sync {
    move |ctx: &MethodContext| {
        let mechanism = ctx
            .providers
            .gsi
            .clone()
            .ok_or_else(|| AuthError::config("GSI: no mechanism available"))?;
        Ok(Box::new(GsiAuthenticator::new(
            ctx.role,
            mechanism,
            Arc::clone(&cache),
            ctx.config.gsi.clone(),
        )) as Box<dyn Authenticator>)
    }
}

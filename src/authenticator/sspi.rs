//! Native platform negotiation (NTSSPI).
//!
//! The platform's negotiate package produces the context tokens; they travel
//! through the shared loop in [`super::gss`]. The accepting side then
//! impersonates the client just long enough to read its account and domain
//! names. [`Impersonation`] reverts when dropped, so an early return can
//! never leave the process running as the client.

use std::sync::Arc;
use std::task::Poll;
use std::time::SystemTime;

use super::gss::{self, GssContext};
use super::{Authenticator, MethodContext};
use crate::continuation::DriveMode;
use crate::error::{AuthError, AuthResult};
use crate::identity::PeerIdentity;
use crate::method::AuthMethod;
use crate::transport::{Role, TransportChannel};

/// An active impersonation of the authenticated client.
pub struct Impersonation {
    user: String,
    domain: String,
    revert: Option<Box<dyn FnOnce() + Send>>,
}

impl Impersonation {
    /// Records the impersonated account; `revert` runs on drop.
    pub fn new(
        user: impl Into<String>,
        domain: impl Into<String>,
        revert: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            user: user.into(),
            domain: domain.into(),
            revert: Some(Box::new(revert)),
        }
    }

    /// Account name of the client.
    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Domain of the client.
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl core::fmt::Debug for Impersonation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Impersonation")
            .field("user", &self.user)
            .field("domain", &self.domain)
            .field("active", &self.revert.is_some())
            .finish()
    }
}

impl Drop for Impersonation {
    fn drop(&mut self) {
        if let Some(revert) = self.revert.take() {
            revert();
        }
    }
}

/// The platform's negotiate package.
pub trait SspiProvider: Send + Sync {
    /// Starts an outbound context towards `target`.
    fn client_context(&self, target: Option<&str>) -> AuthResult<Box<dyn GssContext>>;

    /// Starts an inbound context.
    fn server_context(&self) -> AuthResult<Box<dyn GssContext>>;

    /// Impersonates the client of an established inbound context.
    fn impersonate(&self, context: &dyn GssContext) -> AuthResult<Impersonation>;
}

/// The NTSSPI method.
pub struct SspiAuthenticator {
    role: Role,
    provider: Arc<dyn SspiProvider>,
    context: Option<Box<dyn GssContext>>,
    peer: PeerIdentity,
}

impl core::fmt::Debug for SspiAuthenticator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SspiAuthenticator")
            .field("role", &self.role)
            .field("valid", &self.context.is_some())
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl SspiAuthenticator {
    /// Creates the method.
    #[must_use]
    pub fn new(role: Role, provider: Arc<dyn SspiProvider>) -> Self {
        Self {
            role,
            provider,
            context: None,
            peer: PeerIdentity::default(),
        }
    }

    fn identify(&mut self, context: &dyn GssContext) -> AuthResult<()> {
        if self.role == Role::Client {
            if let Some(name) = context.peer_name() {
                self.peer.set_authenticated_name(name);
            }
            return Ok(());
        }
        let guard = self.provider.impersonate(context)?;
        if guard.user().is_empty() {
            return Err(AuthError::method("NTSSPI: client account has no name"));
        }
        self.peer.set_remote_user(guard.user());
        self.peer.set_remote_domain(guard.domain());
        self.peer
            .set_authenticated_name(format!("{}@{}", guard.user(), guard.domain()));
        Ok(())
    }

    fn run(&mut self, chan: &mut dyn TransportChannel, remote_host: Option<&str>) -> AuthResult<()> {
        let method = AuthMethod::Sspi;
        let opened = match self.role {
            Role::Client => self.provider.client_context(remote_host),
            Role::Server => self.provider.server_context(),
        };
        let mut context = match opened {
            Ok(context) => context,
            Err(err) => return Err(gss::refuse(method, self.role, chan, err)),
        };
        gss::establish(method, self.role, context.as_mut(), chan)?;
        let verdict = self.identify(context.as_ref());
        gss::exchange_verdicts(method, self.role, chan, verdict)?;
        tracing::debug!(
            side = self.role.as_str(),
            user = ?self.peer.remote_user(),
            domain = ?self.peer.remote_domain(),
            "NTSSPI context established"
        );
        self.context = Some(context);
        Ok(())
    }
}

impl Authenticator for SspiAuthenticator {
    fn method(&self) -> AuthMethod {
        AuthMethod::Sspi
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

pub(crate) fn create(ctx: &MethodContext) -> AuthResult<Box<dyn Authenticator>> {
    let provider = ctx
        .providers
        .sspi
        .clone()
        .ok_or_else(|| AuthError::config("NTSSPI: no provider available"))?;
    Ok(Box::new(SspiAuthenticator::new(ctx.role, provider)))
}

//! Claim-to-be: the client names itself and the server believes it.
//!
//! Only suitable between hosts that already trust each other.
//!
//! Wire: client `{status, name}`, server `{status}`. A client that cannot
//! determine a name sends status 0 and no name.

use std::sync::Arc;
use std::task::Poll;

use super::{Authenticator, MethodContext, UserDirectory, wire};
use crate::config::AuthConfig;
use crate::continuation::DriveMode;
use crate::error::{AuthError, AuthResult};
use crate::identity::PeerIdentity;
use crate::method::AuthMethod;
use crate::transport::{Role, TransportChannel};

/// The claim-to-be method.
pub struct ClaimToBeAuthenticator {
    role: Role,
    config: Arc<AuthConfig>,
    users: Arc<dyn UserDirectory>,
    peer: PeerIdentity,
    valid: bool,
}

impl core::fmt::Debug for ClaimToBeAuthenticator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ClaimToBeAuthenticator")
            .field("role", &self.role)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl ClaimToBeAuthenticator {
    /// Creates the method.
    #[must_use]
    pub fn new(role: Role, config: Arc<AuthConfig>, users: Arc<dyn UserDirectory>) -> Self {
        Self {
            role,
            config,
            users,
            peer: PeerIdentity::default(),
            valid: false,
        }
    }

    /// Name the client will claim, if it can determine one.
    #[must_use]
    pub fn claimed_name(&self) -> Option<String> {
        let user = self
            .config
            .claim_to_be
            .user
            .clone()
            .or_else(|| self.users.current_user())?;
        if self.config.claim_to_be.include_domain {
            Some(format!("{user}@{}", self.config.uid_domain))
        } else {
            Some(user)
        }
    }

    fn run_client(&mut self, chan: &mut dyn TransportChannel) -> AuthResult<()> {
        let method = AuthMethod::ClaimToBe;
        let name = self.claimed_name();
        chan.encode();
        match &name {
            Some(name) => {
                chan.put_i32(1).map_err(wire(method, "sending status"))?;
                chan.put_str(name).map_err(wire(method, "sending name"))?;
            }
            None => chan.put_i32(0).map_err(wire(method, "sending status"))?,
        }
        chan.end_of_message().map_err(wire(method, "sending claim"))?;

        let reply = chan.recv_int().map_err(wire(method, "reading reply"))?;
        match (name, reply) {
            (None, _) => Err(AuthError::method(
                "CLAIMTOBE: cannot determine a local user name to claim",
            )),
            (Some(_), 1) => {
                self.valid = true;
                Ok(())
            }
            (Some(_), _) => Err(AuthError::method("CLAIMTOBE: server refused the claim")),
        }
    }

    fn run_server(&mut self, chan: &mut dyn TransportChannel) -> AuthResult<()> {
        let method = AuthMethod::ClaimToBe;
        chan.decode();
        let status = chan.get_i32().map_err(wire(method, "reading status"))?;
        let claimed = if status == 1 {
            Some(chan.get_str().map_err(wire(method, "reading name"))?)
        } else {
            None
        };
        chan.end_of_message().map_err(wire(method, "reading claim"))?;

        let accepted = claimed.filter(|name| !name.is_empty());
        chan.send_ints(&[i32::from(accepted.is_some())])
            .map_err(wire(method, "sending reply"))?;

        let Some(name) = accepted else {
            return Err(AuthError::method("CLAIMTOBE: client made no claim"));
        };
        let (user, domain) = if self.config.claim_to_be.include_domain {
            match name.rsplit_once('@') {
                Some((user, domain)) => (user.to_owned(), domain.to_owned()),
                None => (name.clone(), self.config.uid_domain.clone()),
            }
        } else {
            (name.clone(), self.config.uid_domain.clone())
        };
        tracing::debug!(user = %user, domain = %domain, "accepted claimed identity");
        self.peer.set_remote_user(user);
        self.peer.set_remote_domain(domain);
        self.peer.set_authenticated_name(name);
        self.valid = true;
        Ok(())
    }
}

impl Authenticator for ClaimToBeAuthenticator {
    fn method(&self) -> AuthMethod {
        AuthMethod::ClaimToBe
    }

    fn authenticate(
        &mut self,
        chan: &mut dyn TransportChannel,
        _remote_host: Option<&str>,
        _mode: DriveMode,
    ) -> Poll<AuthResult<()>> {
        Poll::Ready(match self.role {
            Role::Client => self.run_client(chan),
            Role::Server => self.run_server(chan),
        })
    }

    fn is_valid(&self) -> bool {
        self.valid
    }

    fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    fn peer_mut(&mut self) -> &mut PeerIdentity {
        &mut self.peer
    }
}

pub(crate) fn create(ctx: &MethodContext) -> AuthResult<Box<dyn Authenticator>> {
    Ok(Box::new(ClaimToBeAuthenticator::new(
        ctx.role,
        Arc::clone(&ctx.config),
        Arc::clone(&ctx.providers.users),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authenticator::StaticUsers;
    use crate::transport::duplex_with_timeout;
    use std::thread;
    use std::time::Duration;

    fn pair(
        client_cfg: AuthConfig,
        server_cfg: AuthConfig,
        users: StaticUsers,
    ) -> (AuthResult<()>, AuthResult<()>, PeerIdentity) {
        let (mut c, mut s) = duplex_with_timeout(Duration::from_secs(5));
        let users: Arc<dyn UserDirectory> = Arc::new(users);
        let client_users = Arc::clone(&users);
        let client = thread::spawn(move || {
            let mut auth =
                ClaimToBeAuthenticator::new(Role::Client, Arc::new(client_cfg), client_users);
            match auth.authenticate(&mut c, None, DriveMode::Blocking) {
                Poll::Ready(r) => r,
                Poll::Pending => Err(AuthError::protocol("pending")),
            }
        });
        let mut server = ClaimToBeAuthenticator::new(Role::Server, Arc::new(server_cfg), users);
        let server_result = match server.authenticate(&mut s, None, DriveMode::Blocking) {
            Poll::Ready(r) => r,
            Poll::Pending => Err(AuthError::protocol("pending")),
        };
        let client_result = client.join().expect("client thread");
        (client_result, server_result, server.peer().clone())
    }

    #[test]
    fn domain_is_carried_when_enabled() {
        let mut cfg = AuthConfig::default().with_uid_domain("example.org");
        cfg.claim_to_be.include_domain = true;
        let (c, s, peer) = pair(
            cfg.clone(),
            cfg,
            StaticUsers::new().with_current("alice"),
        );
        assert!(c.is_ok());
        assert!(s.is_ok());
        assert_eq!(peer.fully_qualified_user(), Some("alice@example.org"));
        assert_eq!(peer.authenticated_name(), Some("alice@example.org"));
    }

    #[test]
    fn override_name_and_server_domain() {
        let mut client_cfg = AuthConfig::default();
        client_cfg.claim_to_be.user = Some("condor".into());
        let server_cfg = AuthConfig::default().with_uid_domain("pool.example");
        let (_, s, peer) = pair(client_cfg, server_cfg, StaticUsers::new().with_current("x"));
        assert!(s.is_ok());
        assert_eq!(peer.remote_user(), Some("condor"));
        assert_eq!(peer.remote_domain(), Some("pool.example"));
    }

    #[test]
    fn no_local_name_fails_both_sides() {
        let (c, s, peer) = pair(
            AuthConfig::default(),
            AuthConfig::default(),
            StaticUsers::new(),
        );
        assert!(c.expect_err("client fails").is_method_failure());
        assert!(s.expect_err("server fails").is_method_failure());
        assert_eq!(peer.remote_user(), None);
    }
}

//! The anonymous method: a fixed identity, no proof.

use std::task::Poll;

use super::{Authenticator, MethodContext, wire};
use crate::continuation::DriveMode;
use crate::error::{AuthError, AuthResult};
use crate::identity::{ANONYMOUS_USER, PeerIdentity, UNMAPPED_DOMAIN};
use crate::method::AuthMethod;
use crate::transport::{Role, TransportChannel};

/// Assigns the well-known anonymous user to the client.
#[derive(Debug)]
pub struct AnonymousAuthenticator {
    role: Role,
    peer: PeerIdentity,
}

impl AnonymousAuthenticator {
    /// Creates the method for `role`.
    #[must_use]
    pub fn new(role: Role) -> Self {
        Self {
            role,
            peer: PeerIdentity::default(),
        }
    }

    fn run(&mut self, chan: &mut dyn TransportChannel) -> AuthResult<()> {
        let method = AuthMethod::Anonymous;
        match self.role {
            Role::Client => {
                chan.send_ints(&[1]).map_err(wire(method, "sending request"))?;
                let reply = chan.recv_int().map_err(wire(method, "reading reply"))?;
                if reply != 1 {
                    return Err(AuthError::method("ANONYMOUS: server refused"));
                }
            }
            Role::Server => {
                let request = chan.recv_int().map_err(wire(method, "reading request"))?;
                self.peer.set_remote_user(ANONYMOUS_USER);
                self.peer.set_remote_domain(UNMAPPED_DOMAIN);
                self.peer.set_authenticated_name(ANONYMOUS_USER);
                chan.send_ints(&[1]).map_err(wire(method, "sending reply"))?;
                if request != 1 {
                    tracing::debug!(request, "anonymous client sent unexpected request value");
                }
            }
        }
        Ok(())
    }
}

impl Authenticator for AnonymousAuthenticator {
    fn method(&self) -> AuthMethod {
        AuthMethod::Anonymous
    }

    fn authenticate(
        &mut self,
        chan: &mut dyn TransportChannel,
        _remote_host: Option<&str>,
        _mode: DriveMode,
    ) -> Poll<AuthResult<()>> {
        Poll::Ready(self.run(chan))
    }

    fn is_valid(&self) -> bool {
        true
    }

    fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    fn peer_mut(&mut self) -> &mut PeerIdentity {
        &mut self.peer
    }
}

pub(crate) fn create(ctx: &MethodContext) -> AuthResult<Box<dyn Authenticator>> {
    Ok(Box::new(AnonymousAuthenticator::new(ctx.role)))
}

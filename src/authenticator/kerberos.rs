//! Kerberos mutual authentication.
//!
//! The ticket machinery lives behind [`KerberosMechanism`]; this module owns
//! the wire exchange and the principal-to-identity rules.
//!
//! ```text
//!   client                                   server
//!   {PROCEED|ABORT}            ──────────►   AwaitReady
//!   {PROCEED, len, AP-REQ}     ──────────►   ProcessRequest
//!                              ◄──────────   {MUTUAL} | {DENY}
//!                              ◄──────────   {PROCEED, len, AP-REP}
//!   {GRANT|ABORT}              ──────────►   AwaitClientStatus
//!                              ◄──────────   {GRANT|DENY}
//! ```
//!
//! The server side is a [`PhaseMachine`], so a reactor can drive it with
//! [`DriveMode::NonBlocking`] and resume it when the socket turns readable.
//! A principal `user/instance@REALM` authenticates as `user` in the domain
//! the realm map assigns to `REALM`.

use std::path::PathBuf;
use std::sync::Arc;
use std::task::Poll;
use std::time::SystemTime;

use super::{Authenticator, CipherContext, MethodContext, SecurityContext, wire};
use crate::continuation::{Continuation, DriveMode, PhaseIo, PhaseMachine, Step};
use crate::crypto::EntropySource;
use crate::error::{AuthError, AuthResult};
use crate::identity::{PeerIdentity, RealmMapper};
use crate::method::AuthMethod;
use crate::transport::{Role, TransportChannel};

/// Client gave up.
pub const KERBEROS_ABORT: i32 = -1;
/// Peer refused.
pub const KERBEROS_DENY: i32 = 0;
/// Peer accepted.
pub const KERBEROS_GRANT: i32 = 1;
/// Credential forwarding request. Recognised, never sent.
pub const KERBEROS_FORWARD: i32 = 2;
/// Server is about to send its AP-REP.
pub const KERBEROS_MUTUAL: i32 = 3;
/// A token follows.
pub const KERBEROS_PROCEED: i32 = 4;

/// Default service name.
pub const DEFAULT_SERVICE: &str = "host";

/// Account given to peers that authenticate as the service itself.
pub const DEFAULT_SERVER_USER: &str = "condor";

/// Upper bound on AP-REQ / AP-REP size.
const MAX_TOKEN_LEN: usize = 64 * 1024;

/// Where local credentials come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// Daemon identity from a keytab; `None` is the system default keytab.
    Keytab(Option<PathBuf>),
    /// Interactive identity from the user's ticket cache.
    TicketCache,
}

/// A completed Kerberos context.
pub struct KerberosSession {
    /// The peer's principal.
    pub principal: String,
    /// Address bound into the ticket, if any.
    pub peer_address: Option<String>,
    /// Subkey shared by both ends.
    pub session_key: Vec<u8>,
    /// Ticket expiry.
    pub end_time: Option<SystemTime>,
}

impl core::fmt::Debug for KerberosSession {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("KerberosSession")
            .field("principal", &self.principal)
            .field("peer_address", &self.peer_address)
            .field("end_time", &self.end_time)
            .finish_non_exhaustive()
    }
}

/// What the accepting side produces from an AP-REQ.
#[derive(Debug)]
pub struct KerberosAcceptance {
    /// Reply for mutual authentication.
    pub ap_rep: Vec<u8>,
    /// The established context.
    pub session: KerberosSession,
}

/// Client context waiting for the server's AP-REP.
pub trait KerberosInitiator: Send {
    /// Verifies the AP-REP and completes the context.
    fn finish(self: Box<Self>, ap_rep: &[u8]) -> AuthResult<KerberosSession>;
}

/// Native Kerberos operations.
pub trait KerberosMechanism: Send + Sync {
    /// Builds an AP-REQ for `service` on `host`.
    fn initiate(
        &self,
        service: &str,
        host: Option<&str>,
        credentials: &CredentialSource,
    ) -> AuthResult<(Vec<u8>, Box<dyn KerberosInitiator>)>;

    /// Verifies an AP-REQ addressed to `service`.
    fn accept(
        &self,
        service: &str,
        credentials: &CredentialSource,
        ap_req: &[u8],
    ) -> AuthResult<KerberosAcceptance>;
}

/// Splits `user/instance@REALM` into `(user, realm)`.
///
/// ```
/// use peerauth::authenticator::kerberos::split_principal;
///
/// assert_eq!(split_principal("alice/admin@EXAMPLE.ORG"), ("alice", Some("EXAMPLE.ORG")));
/// assert_eq!(split_principal("bob@EXAMPLE.ORG"), ("bob", Some("EXAMPLE.ORG")));
/// assert_eq!(split_principal("carol"), ("carol", None));
/// ```
#[must_use]
pub fn split_principal(principal: &str) -> (&str, Option<&str>) {
    let (name, realm) = match principal.rsplit_once('@') {
        Some((name, realm)) => (name, Some(realm)),
        None => (principal, None),
    };
    let user = name.split_once('/').map_or(name, |(user, _)| user);
    (user, realm)
}

/// Rules turning a principal into a user and a domain.
#[derive(Debug, Clone)]
struct PrincipalRules {
    service: String,
    server_user: String,
    realms: Arc<RealmMapper>,
}

impl PrincipalRules {
    fn resolve(&self, principal: &str) -> AuthResult<(String, String)> {
        let (user, realm) = split_principal(principal);
        if user.is_empty() {
            return Err(AuthError::method(format!(
                "KERBEROS: principal {principal} has no user part"
            )));
        }
        let user = if user == self.service {
            self.server_user.clone()
        } else {
            user.to_owned()
        };
        let realm = realm.ok_or_else(|| {
            AuthError::method(format!("KERBEROS: principal {principal} has no realm"))
        })?;
        let domain = self.realms.domain_for(realm)?;
        Ok((user, domain))
    }
}

/// Outcome of the accepting side.
#[derive(Debug)]
struct Accepted {
    session: KerberosSession,
    user: String,
    domain: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerPhase {
    AwaitReady,
    ProcessRequest,
    AwaitClientStatus,
}

struct ServerExchange {
    mechanism: Arc<dyn KerberosMechanism>,
    credentials: CredentialSource,
    rules: PrincipalRules,
    session: Option<KerberosSession>,
}

impl ServerExchange {
    fn deny(io: &mut PhaseIo<'_>, err: AuthError) -> Step<ServerPhase, Accepted> {
        if let Err(send) = io.chan.send_ints(&[KERBEROS_DENY]) {
            tracing::debug!(error = %send, "could not deliver KERBEROS denial");
        }
        Step::Done(Err(err))
    }
}

impl PhaseMachine for ServerExchange {
    type Phase = ServerPhase;
    type Output = Accepted;

    fn step(&mut self, phase: ServerPhase, io: &mut PhaseIo<'_>) -> Step<ServerPhase, Accepted> {
        let method = AuthMethod::Kerberos;
        if io.would_block() {
            return Step::Pending;
        }
        match phase {
            ServerPhase::AwaitReady => match io.chan.recv_int() {
                Ok(KERBEROS_PROCEED) => Step::Continue(ServerPhase::ProcessRequest),
                Ok(status) => {
                    tracing::debug!(status, "KERBEROS client is not ready");
                    Step::Done(Err(AuthError::method(
                        "KERBEROS: client could not build a request",
                    )))
                }
                Err(e) => Step::Done(Err(wire(method, "reading client status")(e))),
            },
            ServerPhase::ProcessRequest => {
                let ap_req = match read_token(io.chan) {
                    Ok(Some(token)) => token,
                    Ok(None) => {
                        return Step::Done(Err(AuthError::method(
                            "KERBEROS: client aborted before sending a request",
                        )));
                    }
                    Err(e) => return Step::Done(Err(e)),
                };
                let accepted = match self.mechanism.accept(
                    &self.rules.service,
                    &self.credentials,
                    &ap_req,
                ) {
                    Ok(accepted) => accepted,
                    Err(err) => return Self::deny(io, err),
                };
                let sent = io
                    .chan
                    .send_ints(&[KERBEROS_MUTUAL])
                    .and_then(|()| io.chan.send_blob(KERBEROS_PROCEED, &accepted.ap_rep));
                if let Err(e) = sent {
                    return Step::Done(Err(wire(method, "sending AP-REP")(e)));
                }
                self.session = Some(accepted.session);
                Step::Continue(ServerPhase::AwaitClientStatus)
            }
            ServerPhase::AwaitClientStatus => {
                match io.chan.recv_int() {
                    Ok(KERBEROS_GRANT) => {}
                    Ok(status) => {
                        tracing::debug!(status, "KERBEROS client rejected the AP-REP");
                        return Step::Done(Err(AuthError::method(
                            "KERBEROS: client failed mutual authentication",
                        )));
                    }
                    Err(e) => return Step::Done(Err(wire(method, "reading client verdict")(e))),
                }
                let Some(session) = self.session.take() else {
                    return Step::Done(Err(AuthError::protocol(
                        "KERBEROS: no context after AP-REQ",
                    )));
                };
                let (user, domain) = match self.rules.resolve(&session.principal) {
                    Ok(resolved) => resolved,
                    Err(err) => return Self::deny(io, err),
                };
                if let Err(e) = io.chan.send_ints(&[KERBEROS_GRANT]) {
                    return Step::Done(Err(wire(method, "sending verdict")(e)));
                }
                Step::Done(Ok(Accepted {
                    session,
                    user,
                    domain,
                }))
            }
        }
    }
}

/// Reads `{PROCEED, len, bytes}`; a bare non-PROCEED status yields `None`.
fn read_token(chan: &mut dyn TransportChannel) -> AuthResult<Option<Vec<u8>>> {
    let method = AuthMethod::Kerberos;
    chan.decode();
    let tag = chan.get_i32().map_err(wire(method, "reading token tag"))?;
    if tag != KERBEROS_PROCEED {
        chan.end_of_message()
            .map_err(wire(method, "reading token"))?;
        return Ok(None);
    }
    let len = chan.get_i32().map_err(wire(method, "reading token length"))?;
    let len = usize::try_from(len)
        .ok()
        .filter(|len| *len <= MAX_TOKEN_LEN)
        .ok_or_else(|| AuthError::protocol(format!("KERBEROS: bad token length {len}")))?;
    let token = chan
        .get_bytes(len)
        .map_err(wire(method, "reading token body"))?;
    chan.end_of_message()
        .map_err(wire(method, "reading token"))?;
    Ok(Some(token))
}

/// The Kerberos method.
pub struct KerberosAuthenticator {
    role: Role,
    mechanism: Arc<dyn KerberosMechanism>,
    credentials: CredentialSource,
    rules: PrincipalRules,
    entropy: Arc<dyn EntropySource>,
    server: Option<Continuation<ServerExchange>>,
    context: Option<CipherContext>,
    peer: PeerIdentity,
}

impl core::fmt::Debug for KerberosAuthenticator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("KerberosAuthenticator")
            .field("role", &self.role)
            .field("credentials", &self.credentials)
            .field("service", &self.rules.service)
            .field("valid", &self.context.is_some())
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl KerberosAuthenticator {
    /// Creates the method for `role`.
    #[must_use]
    pub fn new(
        role: Role,
        mechanism: Arc<dyn KerberosMechanism>,
        credentials: CredentialSource,
        realms: Arc<RealmMapper>,
        entropy: Arc<dyn EntropySource>,
    ) -> Self {
        Self {
            role,
            mechanism,
            credentials,
            rules: PrincipalRules {
                service: DEFAULT_SERVICE.to_owned(),
                server_user: DEFAULT_SERVER_USER.to_owned(),
                realms,
            },
            entropy,
            server: None,
            context: None,
            peer: PeerIdentity::default(),
        }
    }

    /// Uses `service` instead of [`DEFAULT_SERVICE`].
    #[must_use]
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.rules.service = service.into();
        self
    }

    /// Assigns `user` to peers authenticating as the service principal.
    #[must_use]
    pub fn with_server_user(mut self, user: impl Into<String>) -> Self {
        self.rules.server_user = user.into();
        self
    }

    fn establish(&mut self, session: &KerberosSession, user: String, domain: String) -> AuthResult<()> {
        self.context = Some(CipherContext::new(
            &session.session_key,
            Arc::clone(&self.entropy),
            session.end_time,
        )?);
        if let Some(address) = &session.peer_address {
            self.peer.set_remote_host(address.clone());
        }
        self.peer.set_authenticated_name(session.principal.clone());
        self.peer.set_remote_user(user);
        self.peer.set_remote_domain(domain);
        Ok(())
    }

    fn run_client(&mut self, chan: &mut dyn TransportChannel, host: Option<&str>) -> AuthResult<()> {
        let method = AuthMethod::Kerberos;
        let prepared = self
            .mechanism
            .initiate(&self.rules.service, host, &self.credentials);
        let ready = if prepared.is_ok() {
            KERBEROS_PROCEED
        } else {
            KERBEROS_ABORT
        };
        chan.send_ints(&[ready])
            .map_err(wire(method, "sending ready status"))?;
        let (ap_req, pending) = prepared?;

        chan.send_blob(KERBEROS_PROCEED, &ap_req)
            .map_err(wire(method, "sending AP-REQ"))?;
        match chan.recv_int().map_err(wire(method, "reading server reply"))? {
            KERBEROS_MUTUAL => {}
            KERBEROS_DENY => return Err(AuthError::method("KERBEROS: server rejected the AP-REQ")),
            other => {
                return Err(AuthError::protocol(format!(
                    "KERBEROS: unexpected server reply {other}"
                )));
            }
        }
        let ap_rep = read_token(chan)?
            .ok_or_else(|| AuthError::method("KERBEROS: server sent no AP-REP"))?;

        let resolved = pending.finish(&ap_rep).and_then(|session| {
            let (user, domain) = self.rules.resolve(&session.principal)?;
            Ok((session, user, domain))
        });
        let (session, user, domain) = match resolved {
            Ok(resolved) => resolved,
            Err(err) => {
                if let Err(e) = chan.send_ints(&[KERBEROS_ABORT]) {
                    tracing::debug!(error = %e, "could not deliver KERBEROS abort");
                }
                return Err(err);
            }
        };
        chan.send_ints(&[KERBEROS_GRANT])
            .map_err(wire(method, "sending verdict"))?;
        match chan.recv_int().map_err(wire(method, "reading final verdict"))? {
            KERBEROS_GRANT => {}
            _ => return Err(AuthError::method("KERBEROS: server refused the mapped principal")),
        }

        tracing::debug!(server = %session.principal, "KERBEROS server authenticated");
        self.establish(&session, user, domain)
    }

    fn drive_server(&mut self, chan: &mut dyn TransportChannel, mode: DriveMode) -> Poll<AuthResult<()>> {
        let Some(server) = self.server.as_mut() else {
            return Poll::Ready(Err(AuthError::protocol(
                "KERBEROS: no server exchange in progress",
            )));
        };
        let outcome = match server.resume(chan, mode) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(outcome) => outcome,
        };
        self.server = None;
        Poll::Ready(outcome.and_then(|accepted| {
            tracing::debug!(
                principal = %accepted.session.principal,
                user = %accepted.user,
                domain = %accepted.domain,
                "KERBEROS client authenticated"
            );
            let Accepted {
                session,
                user,
                domain,
            } = accepted;
            self.establish(&session, user, domain)
        }))
    }
}

impl Authenticator for KerberosAuthenticator {
    fn method(&self) -> AuthMethod {
        AuthMethod::Kerberos
    }

    fn authenticate(
        &mut self,
        chan: &mut dyn TransportChannel,
        remote_host: Option<&str>,
        mode: DriveMode,
    ) -> Poll<AuthResult<()>> {
        match self.role {
            Role::Client => Poll::Ready(self.run_client(chan, remote_host)),
            Role::Server => {
                self.server = Some(Continuation::new(
                    ServerExchange {
                        mechanism: Arc::clone(&self.mechanism),
                        credentials: self.credentials.clone(),
                        rules: self.rules.clone(),
                        session: None,
                    },
                    ServerPhase::AwaitReady,
                ));
                self.drive_server(chan, mode)
            }
        }
    }

    fn authenticate_continue(
        &mut self,
        chan: &mut dyn TransportChannel,
        mode: DriveMode,
    ) -> Poll<AuthResult<()>> {
        self.drive_server(chan, mode)
    }

    fn is_valid(&self) -> bool {
        self.context.is_some()
    }

    fn end_time(&self) -> Option<SystemTime> {
        self.context.as_ref().and_then(SecurityContext::end_time)
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

/// Factory closure for the registry; `realms` is shared across attempts.
pub(crate) fn factory(
    realms: Arc<RealmMapper>,
) -> impl Fn(&MethodContext) -> AuthResult<Box<dyn Authenticator>> + Send + Sync {
    move |ctx: &MethodContext| {
        let mechanism = ctx
            .providers
            .kerberos
            .clone()
            .ok_or_else(|| AuthError::config("KERBEROS: no mechanism available"))?;
        let cfg = &ctx.config.kerberos;
        let credentials = match ctx.role {
            Role::Client if cfg.use_ticket_cache => CredentialSource::TicketCache,
            _ => CredentialSource::Keytab(cfg.keytab.clone()),
        };
        let mut auth = KerberosAuthenticator::new(
            ctx.role,
            mechanism,
            credentials,
            Arc::clone(&realms),
            Arc::clone(&ctx.entropy),
        );
        if let Some(service) = &cfg.service {
            auth = auth.with_service(service.clone());
        }
        if let Some(user) = &cfg.server_user {
            auth = auth.with_server_user(user.clone());
        }
        Ok(Box::new(auth) as Box<dyn Authenticator>)
    }
}

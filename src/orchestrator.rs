//! The authentication session.
//!
//! [`Authentication`] owns one negotiation on one channel. The client
//! proposes its candidate mask, the server selects, both run the selected
//! method, and on a recoverable failure the client drops that method and
//! proposes again while the server goes back to waiting for a proposal.
//!
//! ```text
//!  client: Propose ─► AwaitSelection ─► Run ─► Verify ─► AwaitKey ─► [AwaitKeyBody] ─► done
//!             ▲                          │
//!             └──── method failed ───────┘
//!
//!  server: AwaitProposal ─► Run ─► Verify ─► SendKey ─► done
//!             ▲              │
//!             └── failed ────┘
//! ```
//!
//! The whole negotiation is one [`PhaseMachine`], so the same session can
//! be driven to completion by a blocking caller or one readiness event at a
//! time by a reactor. The deadline is only checked around the method
//! selection round; a method that has started runs until it finishes or
//! its transport fails.
//!
//! Nothing about the peer is published until every step succeeded: a
//! failed session reports no user, no domain and no method.
//!
//! Only the client compares the method's authenticated host with the
//! connection's peer address. The server has already finished by then, so a
//! mismatch ends the client's session instead of starting another round.

use std::net::IpAddr;
use std::sync::Arc;
use std::task::Poll;
use std::time::{Duration, Instant, SystemTime};

use crate::authenticator::{Authenticator, MethodRegistry};
use crate::config::AuthConfig;
use crate::continuation::{Continuation, DriveMode, PhaseIo, PhaseMachine, Step};
use crate::crypto::{EntropySource, SessionKey, os_entropy};
use crate::error::{AuthError, AuthErrorKind, AuthResult, ErrorStack};
use crate::handshake;
use crate::identity::{AuthenticatedIdentity, CanonicalIdentity, IdentityMapper};
use crate::method::{AuthMethod, MethodSet};
use crate::transport::{Role, TransportChannel};

const STAGE: &str = "AUTHENTICATE";
const MAX_WRAPPED_KEY: usize = 64 * 1024;

/// Where a session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// `authenticate` was not called yet.
    NotStarted,
    /// Agreeing on a method.
    Negotiating,
    /// A method's protocol is running.
    Running(AuthMethod),
    /// Authenticated.
    Succeeded,
    /// Terminally failed.
    Failed,
}

/// What a successful negotiation produced.
struct Established {
    authenticator: Box<dyn Authenticator>,
    method: AuthMethod,
    identity: AuthenticatedIdentity,
    canonical: CanonicalIdentity,
    session_key: Option<SessionKey>,
    stack: ErrorStack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Propose,
    AwaitSelection,
    AwaitProposal,
    Run,
    Verify,
    SendKey,
    AwaitKey,
    AwaitKeyBody,
}

struct Negotiation {
    role: Role,
    config: Arc<AuthConfig>,
    registry: Arc<MethodRegistry>,
    mapper: Arc<IdentityMapper>,
    entropy: Arc<dyn EntropySource>,
    remote_host: Option<String>,
    candidates: MethodSet,
    deadline: Option<(Instant, Duration)>,
    server_key: Option<SessionKey>,
    stack: ErrorStack,
    attempt: u32,
    selected: Option<AuthMethod>,
    active: Option<Box<dyn Authenticator>>,
    started: bool,
    verified: Option<(AuthenticatedIdentity, CanonicalIdentity)>,
    /// Address mismatch found after the server already accepted; reported
    /// once the server's key message has been consumed.
    mismatch: Option<AuthError>,
}

impl Negotiation {
    fn fail<P>(&mut self, err: AuthError) -> Step<P, Established> {
        let err = self.mismatch.take().unwrap_or(err);
        if let Some(ctx) = err.context() {
            self.stack.push(STAGE, ctx);
        } else {
            self.stack.push(STAGE, err.kind().as_str());
        }
        tracing::info!(
            side = self.role.as_str(),
            kind = ?err.kind(),
            error = %err,
            "authentication failed"
        );
        self.active = None;
        Step::Done(Err(err.with_stack(self.stack.clone())))
    }

    fn check_deadline(&self) -> AuthResult<()> {
        match self.deadline {
            Some((at, limit)) if Instant::now() >= at => Err(AuthError::new(
                AuthErrorKind::Timeout,
            )
            .with_context(format!("exceeded {}s deadline", limit.as_secs()))),
            _ => Ok(()),
        }
    }

    fn instantiate(&self, method: AuthMethod) -> AuthResult<Box<dyn Authenticator>> {
        self.registry
            .create(method, &self.config, self.role, &self.entropy)
    }

    fn begin(&mut self, method: AuthMethod, authenticator: Box<dyn Authenticator>) -> Phase {
        self.attempt += 1;
        self.selected = Some(method);
        self.active = Some(authenticator);
        self.started = false;
        tracing::debug!(
            side = self.role.as_str(),
            method = %method,
            attempt = self.attempt,
            "starting method"
        );
        Phase::Run
    }

    /// Records a failed attempt and picks where to go next.
    fn method_failed(&mut self, err: AuthError) -> Step<Phase, Established> {
        let Some(method) = self.selected.take() else {
            return self.fail(err);
        };
        self.active = None;
        self.verified = None;
        self.stack.push(
            method.name(),
            err.context().unwrap_or_else(|| err.kind().as_str()),
        );
        self.stack
            .push(method.name(), format!("Failed to authenticate using {method}"));
        tracing::info!(
            side = self.role.as_str(),
            method = %method,
            attempt = self.attempt,
            error = %err,
            "method failed"
        );
        if !err.kind().is_recoverable() {
            return self.fail(err);
        }
        match self.role {
            Role::Client => {
                self.candidates.remove(method);
                Step::Continue(Phase::Propose)
            }
            Role::Server => Step::Continue(Phase::AwaitProposal),
        }
    }

    fn out_of_methods(&mut self) -> Step<Phase, Established> {
        let err = if self.attempt == 0 {
            AuthError::new(AuthErrorKind::OutOfMethods).with_context(format!(
                "no authentication methods in common ({} offered)",
                self.candidates
            ))
        } else {
            AuthError::new(AuthErrorKind::OutOfMethods)
                .with_context("exhausted all possible authentication methods")
        };
        self.fail(err)
    }

    fn verify(&mut self, io: &mut PhaseIo<'_>) -> Step<Phase, Established> {
        let Some(authenticator) = self.active.as_deref() else {
            return self.fail(AuthError::protocol("no method to verify"));
        };
        let Some(method) = self.selected else {
            return self.fail(AuthError::protocol("no method selected"));
        };
        if self.role == Role::Client && !self.config.disable_address_check {
            let observed = io.chan.peer_address();
            if !address_matches(authenticator.peer().remote_host(), observed) {
                let claimed = authenticator.peer().remote_host().unwrap_or_default().to_owned();
                let err = AuthError::new(AuthErrorKind::AddressMismatch).with_context(format!(
                    "authenticated host {claimed} does not match connection peer {}",
                    observed.map_or_else(String::new, |a| a.to_string())
                ));
                return self.address_mismatch(method, err);
            }
        }

        let identity = authenticator
            .peer()
            .snapshot(method.name(), authenticator.end_time());
        let canonical = match self.mapper.canonicalize(
            &identity,
            &self.config.uid_domain,
            self.config.ssl.allow_extra_slash,
        ) {
            Some(mapped) => CanonicalIdentity::new(mapped.user, mapped.domain),
            None => authenticator.peer().canonical().clone(),
        };
        tracing::debug!(
            side = self.role.as_str(),
            method = %method,
            principal = ?identity.raw_principal,
            user = ?canonical.user(),
            domain = ?canonical.domain(),
            "method succeeded"
        );
        self.verified = Some((identity, canonical));

        if !self.config.exchange_keys {
            return self.finish(None);
        }
        match self.role {
            Role::Server => Step::Continue(Phase::SendKey),
            Role::Client => Step::Continue(Phase::AwaitKey),
        }
    }

    /// The server has already finished with this method, so there is no
    /// handshake left to retry on. Drain its key message, then fail.
    fn address_mismatch(&mut self, method: AuthMethod, err: AuthError) -> Step<Phase, Established> {
        self.stack.push(
            method.name(),
            err.context().unwrap_or_else(|| err.kind().as_str()),
        );
        self.stack
            .push(method.name(), format!("Failed to authenticate using {method}"));
        tracing::info!(
            side = self.role.as_str(),
            method = %method,
            error = %err,
            "peer address mismatch"
        );
        if !self.config.exchange_keys {
            return self.fail(err);
        }
        self.mismatch = Some(err);
        Step::Continue(Phase::AwaitKey)
    }

    fn finish(&mut self, session_key: Option<SessionKey>) -> Step<Phase, Established> {
        if let Some(err) = self.mismatch.take() {
            return self.fail(err);
        }
        let (Some(authenticator), Some(method), Some((identity, canonical))) =
            (self.active.take(), self.selected, self.verified.take())
        else {
            return self.fail(AuthError::protocol("negotiation finished without a method"));
        };
        tracing::info!(
            side = self.role.as_str(),
            method = %method,
            attempts = self.attempt,
            user = ?canonical.fully_qualified_user(),
            "authenticated"
        );
        Step::Done(Ok(Established {
            authenticator,
            method,
            identity,
            canonical,
            session_key,
            stack: self.stack.clone(),
        }))
    }

    fn send_key(&mut self, io: &mut PhaseIo<'_>) -> Step<Phase, Established> {
        let Some(authenticator) = self.active.as_deref() else {
            return self.fail(AuthError::protocol("no method for key exchange"));
        };
        let Some(key) = self.server_key.clone() else {
            tracing::debug!("no session key to send");
            if let Err(e) = send_flag(io.chan, false) {
                return self.fail(e);
            }
            return self.finish(None);
        };
        let wrapped = match authenticator.wrap(key.as_bytes()) {
            Ok(wrapped) => wrapped,
            Err(e) => return self.fail(e.into_kind(AuthErrorKind::CryptoFailure)),
        };
        if let Err(e) = send_flag(io.chan, true) {
            return self.fail(e);
        }
        if let Err(e) = send_key_body(io.chan, &key, &wrapped) {
            return self.fail(AuthError::from(e).with_context("sending session key"));
        }
        tracing::debug!(protocol = key.protocol(), duration = key.duration_secs(), "session key sent");
        self.finish(Some(key))
    }

    fn await_key(&mut self, io: &mut PhaseIo<'_>) -> Step<Phase, Established> {
        if io.would_block() {
            return Step::Pending;
        }
        match io.chan.recv_int() {
            Ok(0) => {
                tracing::debug!("server sent no session key");
                self.finish(None)
            }
            Ok(_) => Step::Continue(Phase::AwaitKeyBody),
            Err(e) => self.fail(AuthError::from(e).with_context("reading session key flag")),
        }
    }

    fn await_key_body(&mut self, io: &mut PhaseIo<'_>) -> Step<Phase, Established> {
        if io.would_block() {
            return Step::Pending;
        }
        let Some(authenticator) = self.active.as_deref() else {
            return self.fail(AuthError::protocol("no method for key exchange"));
        };
        let body = match recv_key_body(io.chan) {
            Ok(body) => body,
            Err(e) => return self.fail(e),
        };
        let (key_len, protocol, duration, wrapped) = body;
        let bytes = match authenticator.unwrap(&wrapped) {
            Ok(bytes) => bytes,
            Err(e) => return self.fail(e.into_kind(AuthErrorKind::CryptoFailure)),
        };
        if usize::try_from(key_len).ok() != Some(bytes.len()) {
            return self.fail(AuthError::crypto(format!(
                "session key is {} bytes, announced {key_len}",
                bytes.len()
            )));
        }
        tracing::debug!(protocol, duration, "session key received");
        self.finish(Some(SessionKey::new(bytes, protocol, duration)))
    }
}

fn send_flag(chan: &mut dyn TransportChannel, value: bool) -> AuthResult<()> {
    chan.encode();
    chan.put_bool(value)
        .and_then(|()| chan.end_of_message())
        .map_err(|e| AuthError::from(e).with_context("sending session key flag"))
}

/// Passes when either address is unknown or both agree.
fn address_matches(claimed: Option<&str>, observed: Option<IpAddr>) -> bool {
    let (Some(claimed), Some(observed)) = (claimed, observed) else {
        return true;
    };
    claimed
        .parse::<IpAddr>()
        .is_ok_and(|claimed| claimed == observed)
}

fn send_key_body(
    chan: &mut dyn TransportChannel,
    key: &SessionKey,
    wrapped: &[u8],
) -> Result<(), crate::error::TransportError> {
    let key_len = crate::transport::blob_len(key.as_bytes())?;
    let wrapped_len = crate::transport::blob_len(wrapped)?;
    chan.encode();
    chan.put_i32(key_len)?;
    chan.put_i32(key.protocol())?;
    chan.put_i32(key.duration_secs())?;
    chan.put_i32(wrapped_len)?;
    chan.put_bytes(wrapped)?;
    chan.end_of_message()
}

fn recv_key_header(
    chan: &mut dyn TransportChannel,
) -> Result<(i32, i32, i32, i32), crate::error::TransportError> {
    chan.decode();
    let key_len = chan.get_i32()?;
    let protocol = chan.get_i32()?;
    let duration = chan.get_i32()?;
    let wrapped_len = chan.get_i32()?;
    Ok((key_len, protocol, duration, wrapped_len))
}

fn recv_key_body(chan: &mut dyn TransportChannel) -> AuthResult<(i32, i32, i32, Vec<u8>)> {
    let (key_len, protocol, duration, wrapped_len) =
        recv_key_header(chan).map_err(|e| AuthError::from(e).with_context("reading session key"))?;
    let wrapped_len = usize::try_from(wrapped_len)
        .ok()
        .filter(|len| *len <= MAX_WRAPPED_KEY)
        .ok_or_else(|| AuthError::protocol(format!("bad wrapped key length {wrapped_len}")))?;
    let wrapped = chan
        .get_bytes(wrapped_len)
        .map_err(|e| AuthError::from(e).with_context("reading session key"))?;
    chan.end_of_message()
        .map_err(|e| AuthError::from(e).with_context("reading session key"))?;
    Ok((key_len, protocol, duration, wrapped))
}

impl PhaseMachine for Negotiation {
    type Phase = Phase;
    type Output = Established;

    fn step(&mut self, phase: Phase, io: &mut PhaseIo<'_>) -> Step<Phase, Established> {
        match phase {
            Phase::Propose => {
                if let Err(e) = self.check_deadline() {
                    return self.fail(e);
                }
                match handshake::propose(io.chan, &self.candidates) {
                    Ok(()) => Step::Continue(Phase::AwaitSelection),
                    Err(e) => self.fail(e),
                }
            }
            Phase::AwaitSelection => {
                if io.would_block() {
                    return Step::Pending;
                }
                let selected = match handshake::read_selection(io.chan, &self.candidates) {
                    Ok(selected) => selected,
                    Err(e) => return self.fail(e),
                };
                if let Err(e) = self.check_deadline() {
                    return self.fail(e);
                }
                let Some(method) = selected else {
                    return self.out_of_methods();
                };
                match self.instantiate(method) {
                    Ok(authenticator) => Step::Continue(self.begin(method, authenticator)),
                    Err(e) => self.fail(e),
                }
            }
            Phase::AwaitProposal => {
                if let Err(e) = self.check_deadline() {
                    return self.fail(e);
                }
                if io.would_block() {
                    return Step::Pending;
                }
                let mask = match handshake::read_proposal(io.chan) {
                    Ok(mask) => mask,
                    Err(e) => return self.fail(e),
                };
                let candidates = self.candidates.clone();
                let registry = Arc::clone(&self.registry);
                let (config, role, entropy) =
                    (Arc::clone(&self.config), self.role, Arc::clone(&self.entropy));
                let picked = handshake::select(&candidates, mask, &mut self.stack, |method| {
                    registry.create(method, &config, role, &entropy)
                });
                let reply = handshake::reply(io.chan, picked.as_ref().map(|(m, _)| *m));
                if let Err(e) = reply {
                    return self.fail(e);
                }
                if let Err(e) = self.check_deadline() {
                    return self.fail(e);
                }
                match picked {
                    Some((method, authenticator)) => {
                        Step::Continue(self.begin(method, authenticator))
                    }
                    None => self.out_of_methods(),
                }
            }
            Phase::Run => {
                let Some(authenticator) = self.active.as_mut() else {
                    return self.fail(AuthError::protocol("no method to run"));
                };
                let mode = io.mode();
                let polled = if self.started {
                    authenticator.authenticate_continue(io.chan, mode)
                } else {
                    self.started = true;
                    authenticator.authenticate(io.chan, self.remote_host.as_deref(), mode)
                };
                match polled {
                    Poll::Pending => Step::Pending,
                    Poll::Ready(Ok(())) => Step::Continue(Phase::Verify),
                    Poll::Ready(Err(e)) => self.method_failed(e),
                }
            }
            Phase::Verify => self.verify(io),
            Phase::SendKey => self.send_key(io),
            Phase::AwaitKey => self.await_key(io),
            Phase::AwaitKeyBody => self.await_key_body(io),
        }
    }
}

enum Progress {
    NotStarted,
    Negotiating(Box<Continuation<Negotiation>>),
    Succeeded(Box<Established>),
    Failed(AuthError),
}

/// One side of one authentication negotiation.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::thread;
/// use peerauth::{
///     AuthConfig, AuthMethod, Authentication, IdentityMapper, MethodRegistry, Providers, Role,
/// };
/// use peerauth::transport::duplex;
///
/// let config = Arc::new(
///     AuthConfig::default().with_methods(&[AuthMethod::Anonymous]),
/// );
/// let registry = Arc::new(MethodRegistry::from_config(&config, Providers::default()));
/// let mapper = Arc::new(IdentityMapper::disabled());
/// let (mut client_chan, mut server_chan) = duplex();
///
/// let mut client = Authentication::new(
///     Role::Client,
///     Arc::clone(&config),
///     Arc::clone(&registry),
///     Arc::clone(&mapper),
/// );
/// let peer = thread::spawn(move || client.authenticate(&mut client_chan).map(|()| client));
///
/// let mut server = Authentication::new(Role::Server, config, registry, mapper);
/// server.authenticate(&mut server_chan).unwrap();
/// peer.join().unwrap().unwrap();
///
/// assert_eq!(server.method_used(), Some(AuthMethod::Anonymous));
/// assert_eq!(server.fully_qualified_user(), Some("anonymous@unmapped"));
/// ```
pub struct Authentication {
    role: Role,
    config: Arc<AuthConfig>,
    registry: Arc<MethodRegistry>,
    mapper: Arc<IdentityMapper>,
    entropy: Arc<dyn EntropySource>,
    remote_host: Option<String>,
    methods: Option<MethodSet>,
    timeout: Option<Duration>,
    server_key: Option<SessionKey>,
    progress: Progress,
}

impl core::fmt::Debug for Authentication {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Authentication")
            .field("role", &self.role)
            .field("state", &self.state())
            .field("remote_host", &self.remote_host)
            .field("method", &self.method_used())
            .finish_non_exhaustive()
    }
}

impl Authentication {
    /// Creates a session for `role`.
    #[must_use]
    pub fn new(
        role: Role,
        config: Arc<AuthConfig>,
        registry: Arc<MethodRegistry>,
        mapper: Arc<IdentityMapper>,
    ) -> Self {
        Self {
            role,
            config,
            registry,
            mapper,
            entropy: os_entropy(),
            remote_host: None,
            methods: None,
            timeout: None,
            server_key: None,
            progress: Progress::NotStarted,
        }
    }

    /// Host name or address of the peer, passed to the methods.
    #[must_use]
    pub fn with_remote_host(mut self, host: impl Into<String>) -> Self {
        self.remote_host = Some(host.into());
        self
    }

    /// Overrides the configured preference list.
    #[must_use]
    pub fn with_methods(mut self, methods: MethodSet) -> Self {
        self.methods = Some(methods);
        self
    }

    /// Overrides the configured deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Key the server hands to the client after authenticating.
    #[must_use]
    pub fn with_session_key(mut self, key: SessionKey) -> Self {
        self.server_key = Some(key);
        self
    }

    /// Replaces the randomness source.
    #[must_use]
    pub fn with_entropy(mut self, entropy: Arc<dyn EntropySource>) -> Self {
        self.entropy = entropy;
        self
    }

    /// This end's role.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// Candidate methods: the preference list restricted to what this
    /// host can run.
    fn candidates(&self) -> AuthResult<MethodSet> {
        let preferred = match &self.methods {
            Some(methods) => methods.clone(),
            None => self.config.method_preference()?,
        };
        Ok(preferred.filtered(|m| self.registry.is_available(m)))
    }

    fn start(&mut self) -> AuthResult<()> {
        let candidates = self.candidates()?;
        let deadline = self
            .timeout
            .or_else(|| self.config.timeout())
            .map(|limit| (Instant::now() + limit, limit));
        tracing::debug!(
            side = self.role.as_str(),
            candidates = %candidates,
            deadline = ?deadline.map(|(_, limit)| limit),
            "authentication started"
        );
        let start = match self.role {
            Role::Client => Phase::Propose,
            Role::Server => Phase::AwaitProposal,
        };
        let machine = Negotiation {
            role: self.role,
            config: Arc::clone(&self.config),
            registry: Arc::clone(&self.registry),
            mapper: Arc::clone(&self.mapper),
            entropy: Arc::clone(&self.entropy),
            remote_host: self.remote_host.clone(),
            candidates,
            deadline,
            server_key: self.server_key.clone(),
            stack: ErrorStack::new(),
            attempt: 0,
            selected: None,
            active: None,
            started: false,
            verified: None,
            mismatch: None,
        };
        self.progress = Progress::Negotiating(Box::new(Continuation::new(machine, start)));
        Ok(())
    }

    fn drive(&mut self, chan: &mut dyn TransportChannel, mode: DriveMode) -> Poll<AuthResult<()>> {
        if matches!(self.progress, Progress::NotStarted) {
            if let Err(e) = self.start() {
                self.progress = Progress::Failed(e.clone());
                return Poll::Ready(Err(e));
            }
        }
        let polled = match &mut self.progress {
            Progress::NotStarted => return Poll::Ready(Err(AuthError::protocol("session not started"))),
            Progress::Negotiating(cont) => cont.resume(chan, mode),
            Progress::Succeeded(_) => return Poll::Ready(Ok(())),
            Progress::Failed(err) => return Poll::Ready(Err(err.clone())),
        };
        match polled {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(established)) => {
                self.progress = Progress::Succeeded(Box::new(established));
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(err)) => {
                self.progress = Progress::Failed(err.clone());
                Poll::Ready(Err(err))
            }
        }
    }

    /// Runs the negotiation to completion, blocking on reads.
    pub fn authenticate(&mut self, chan: &mut dyn TransportChannel) -> AuthResult<()> {
        loop {
            if let Poll::Ready(result) = self.drive(chan, DriveMode::Blocking) {
                return result;
            }
        }
    }

    /// Starts the negotiation without blocking on reads.
    ///
    /// On `Poll::Pending`, call [`authenticate_continue`](Self::authenticate_continue)
    /// once the channel is readable.
    pub fn authenticate_nonblocking(
        &mut self,
        chan: &mut dyn TransportChannel,
    ) -> Poll<AuthResult<()>> {
        self.drive(chan, DriveMode::NonBlocking)
    }

    /// Resumes a negotiation that returned `Poll::Pending`.
    pub fn authenticate_continue(
        &mut self,
        chan: &mut dyn TransportChannel,
    ) -> Poll<AuthResult<()>> {
        if matches!(self.progress, Progress::NotStarted) {
            return Poll::Ready(Err(AuthError::protocol(
                "authenticate_continue called before authenticate",
            )));
        }
        self.drive(chan, DriveMode::NonBlocking)
    }

    /// Where the session stands.
    #[must_use]
    pub fn state(&self) -> SessionState {
        match &self.progress {
            Progress::NotStarted => SessionState::NotStarted,
            Progress::Negotiating(cont) => match (cont.phase(), cont.machine().selected) {
                (Some(Phase::Run), Some(method)) => SessionState::Running(method),
                _ => SessionState::Negotiating,
            },
            Progress::Succeeded(_) => SessionState::Succeeded,
            Progress::Failed(_) => SessionState::Failed,
        }
    }

    fn established(&self) -> Option<&Established> {
        match &self.progress {
            Progress::Succeeded(established) => Some(&**established),
            _ => None,
        }
    }

    /// Returns `true` once the session succeeded.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.established().is_some()
    }

    /// Canonical user of the peer.
    #[must_use]
    pub fn canonical_user(&self) -> Option<&str> {
        self.established()?.canonical.user()
    }

    /// Canonical domain of the peer.
    #[must_use]
    pub fn canonical_domain(&self) -> Option<&str> {
        self.established()?.canonical.domain()
    }

    /// `user@domain` of the peer.
    #[must_use]
    pub fn fully_qualified_user(&self) -> Option<&str> {
        self.established()?.canonical.fully_qualified_user()
    }

    /// Principal the method authenticated, before mapping.
    #[must_use]
    pub fn authenticated_name(&self) -> Option<&str> {
        self.established()?.identity.raw_principal.as_deref()
    }

    /// What the method established, before mapping.
    #[must_use]
    pub fn identity(&self) -> Option<&AuthenticatedIdentity> {
        self.established().map(|e| &e.identity)
    }

    /// Method that authenticated the session.
    #[must_use]
    pub fn method_used(&self) -> Option<AuthMethod> {
        self.established().map(|e| e.method)
    }

    /// Expiry of the credential the method established.
    #[must_use]
    pub fn credential_expires_at(&self) -> Option<SystemTime> {
        self.established()?.identity.authenticated_until
    }

    /// Key sent (server) or received (client) after authenticating.
    #[must_use]
    pub fn session_key(&self) -> Option<&SessionKey> {
        self.established()?.session_key.as_ref()
    }

    /// Every failure recorded so far, in order.
    #[must_use]
    pub fn error_stack(&self) -> ErrorStack {
        match &self.progress {
            Progress::NotStarted => ErrorStack::new(),
            Progress::Succeeded(established) => established.stack.clone(),
            Progress::Negotiating(cont) => cont.machine().stack.clone(),
            Progress::Failed(err) => err.stack().clone(),
        }
    }

    fn authenticator(&self) -> AuthResult<&dyn Authenticator> {
        self.established()
            .map(|e| e.authenticator.as_ref())
            .ok_or_else(AuthError::not_authenticated)
    }

    /// Protects `plaintext` with the method that authenticated the session.
    pub fn wrap(&self, plaintext: &[u8]) -> AuthResult<Vec<u8>> {
        self.authenticator()?.wrap(plaintext)
    }

    /// Reverses [`wrap`](Self::wrap).
    pub fn unwrap(&self, ciphertext: &[u8]) -> AuthResult<Vec<u8>> {
        self.authenticator()?.unwrap(ciphertext)
    }
}

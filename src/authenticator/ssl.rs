//! TLS tunnelled over framed messages, optionally followed by a bearer
//! token (SCITOKENS mode).
//!
//! No socket is handed to TLS. Each side runs an in-memory rustls
//! connection and the two trade its records in lock-step rounds of
//! `{status, len, bytes}` messages, client first:
//!
//! ```text
//!   client                                   server
//!   {A_OK|ERROR}               ──────────►
//!                              ◄──────────   {A_OK|ERROR}
//!   {SENDING|HOLDING, tls}     ──────────►           ┐
//!                              ◄──────────   {SENDING|HOLDING, tls}  ├ until both HOLDING
//!                              ◄──────────   {SENDING, tls(key)}
//!   {A_OK}                     ──────────►
//!   {SENDING, tls(len, token)} ──────────►   (SCITOKENS only)
//!                              ◄──────────   {A_OK|QUITTING}
//! ```
//!
//! A side that sends QUITTING stops at once; a side that reads QUITTING
//! stops without replying. After the handshake the server draws a fresh
//! 32-byte key and delivers it inside the tunnel; both ends then wrap with
//! AES-256-GCM under that key.
//!
//! Both roles are [`PhaseMachine`]s whose receive phases yield when the
//! channel has nothing to read.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::task::Poll;
use std::time::SystemTime;

use rustls::crypto::CryptoProvider;
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, ClientConnection, Connection, RootCertStore, ServerConfig, ServerConnection};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};

use super::{Authenticator, CipherContext, MethodContext, SecurityContext, wire};
use crate::config::{AuthConfig, SslConfig};
use crate::continuation::{Continuation, DriveMode, PhaseIo, PhaseMachine, Step};
use crate::crypto::EntropySource;
use crate::error::{AuthError, AuthResult};
use crate::identity::{PeerIdentity, TokenClaims, UNAUTHENTICATED_USER, UNMAPPED_DOMAIN};
use crate::method::AuthMethod;
use crate::transport::{Role, TransportChannel};

/// Sender failed to initialise.
pub const SSL_ERROR: i32 = -1;
/// Sender is ready, or accepted the last message.
pub const SSL_A_OK: i32 = 0;
/// Sender has records for the peer.
pub const SSL_SENDING: i32 = 1;
/// Sender expects records.
pub const SSL_RECEIVING: i32 = 2;
/// Sender gave up.
pub const SSL_QUITTING: i32 = 3;
/// Sender's handshake is done and it has nothing to send.
pub const SSL_HOLDING: i32 = 4;

/// Length of the session key delivered through the tunnel.
pub const SSL_SESSION_KEY_LEN: usize = 32;

/// User assigned to certificate-authenticated peers.
pub const SSL_USER: &str = "ssl";

/// User assigned to token-authenticated peers.
pub const SCITOKENS_USER: &str = "scitokens";

const MAX_RECORD_BATCH: usize = 1024 * 1024;
const MAX_TOKEN_LEN: usize = 64 * 1024;
const MAX_ROUNDS: u32 = 32;

/// Checks bearer tokens presented through the tunnel.
pub trait BearerVerifier: Send + Sync {
    /// Verifies `token`.
    fn verify(&self, token: &str) -> AuthResult<TokenClaims>;
}

#[cfg(feature = "tokens")]
impl BearerVerifier for super::token::TokenVerifier {
    fn verify(&self, token: &str) -> AuthResult<TokenClaims> {
        Self::verify(self, token)
    }
}

fn tls_err(what: &str) -> impl FnOnce(rustls::Error) -> AuthError + '_ {
    move |e| AuthError::crypto(format!("SSL: {what}: {e}"))
}

fn load_certs(path: &Path) -> AuthResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| AuthError::config(format!("SSL: cannot open {}: {e}", path.display())))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AuthError::config(format!("SSL: bad PEM in {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(AuthError::config(format!(
            "SSL: no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> AuthResult<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| AuthError::config(format!("SSL: cannot open {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| AuthError::config(format!("SSL: bad PEM in {}: {e}", path.display())))?
        .ok_or_else(|| AuthError::config(format!("SSL: no private key in {}", path.display())))
}

fn crypto_provider(suites: &[String]) -> AuthResult<Arc<CryptoProvider>> {
    let mut provider = rustls::crypto::ring::default_provider();
    if !suites.is_empty() {
        provider.cipher_suites.retain(|suite| {
            let name = format!("{:?}", suite.suite());
            suites.iter().any(|wanted| wanted.eq_ignore_ascii_case(&name))
        });
        if provider.cipher_suites.is_empty() {
            return Err(AuthError::config(format!(
                "SSL: none of the cipher suites {suites:?} is supported"
            )));
        }
    }
    Ok(Arc::new(provider))
}

/// Renders a certificate subject as `/K=V/K=V`.
fn subject_dn(der: &CertificateDer<'_>) -> AuthResult<String> {
    use x509_parser::objects::{oid_registry, oid2abbrev};

    let (_, cert) = x509_parser::parse_x509_certificate(der.as_ref())
        .map_err(|e| AuthError::crypto(format!("SSL: unreadable peer certificate: {e}")))?;
    let mut dn = String::new();
    for rdn in cert.subject().iter_rdn() {
        for attr in rdn.iter() {
            let key = oid2abbrev(attr.attr_type(), oid_registry())
                .map_or_else(|_| attr.attr_type().to_id_string(), str::to_owned);
            dn.push('/');
            dn.push_str(&key);
            dn.push('=');
            dn.push_str(attr.as_str().unwrap_or_default());
        }
    }
    Ok(dn)
}

/// TLS material loaded once per registry.
pub struct SslContext {
    server: Option<Arc<ServerConfig>>,
    client: Option<Arc<ClientConfig>>,
    server_name: Option<String>,
}

impl core::fmt::Debug for SslContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SslContext")
            .field("server", &self.server.is_some())
            .field("client", &self.client.is_some())
            .field("server_name", &self.server_name)
            .finish()
    }
}

impl SslContext {
    /// Loads whatever server and client material `config` names.
    ///
    /// Fails when neither side can be built.
    pub fn from_config(config: &AuthConfig) -> AuthResult<Self> {
        let ssl = &config.ssl;
        let provider = crypto_provider(&ssl.cipher_suites)?;
        let mut roots = RootCertStore::empty();
        if let Some(ca) = &ssl.ca_file {
            for cert in load_certs(ca)? {
                roots
                    .add(cert)
                    .map_err(|e| AuthError::config(format!("SSL: bad CA certificate: {e}")))?;
            }
        }
        let roots = Arc::new(roots);

        let server = match (&ssl.server_cert, &ssl.server_key) {
            (Some(cert), Some(key)) => Some(Arc::new(Self::server_config(
                &provider,
                &roots,
                load_certs(cert)?,
                load_key(key)?,
            )?)),
            _ => None,
        };
        let client = if roots.is_empty() {
            None
        } else {
            Some(Arc::new(Self::client_config(&provider, &roots, ssl)?))
        };
        if server.is_none() && client.is_none() {
            return Err(AuthError::config(
                "SSL: no server certificate and no trust store configured",
            ));
        }
        tracing::debug!(
            server = server.is_some(),
            client = client.is_some(),
            "SSL material loaded"
        );
        Ok(Self {
            server,
            client,
            server_name: ssl.server_name.clone(),
        })
    }

    fn server_config(
        provider: &Arc<CryptoProvider>,
        roots: &Arc<RootCertStore>,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> AuthResult<ServerConfig> {
        let builder = ServerConfig::builder_with_provider(Arc::clone(provider))
            .with_safe_default_protocol_versions()
            .map_err(tls_err("protocol versions"))?;
        let builder = if roots.is_empty() {
            builder.with_no_client_auth()
        } else {
            let verifier =
                WebPkiClientVerifier::builder_with_provider(Arc::clone(roots), Arc::clone(provider))
                    .allow_unauthenticated()
                    .build()
                    .map_err(|e| AuthError::config(format!("SSL: client verifier: {e}")))?;
            builder.with_client_cert_verifier(verifier)
        };
        builder
            .with_single_cert(chain, key)
            .map_err(|e| AuthError::config(format!("SSL: server certificate: {e}")))
    }

    fn client_config(
        provider: &Arc<CryptoProvider>,
        roots: &Arc<RootCertStore>,
        ssl: &SslConfig,
    ) -> AuthResult<ClientConfig> {
        let builder = ClientConfig::builder_with_provider(Arc::clone(provider))
            .with_safe_default_protocol_versions()
            .map_err(tls_err("protocol versions"))?
            .with_root_certificates(Arc::clone(roots));
        match (&ssl.client_cert, &ssl.client_key) {
            (Some(cert), Some(key)) => builder
                .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
                .map_err(|e| AuthError::config(format!("SSL: client certificate: {e}"))),
            _ => Ok(builder.with_no_client_auth()),
        }
    }

    /// Returns `true` if this host can accept SSL.
    #[must_use]
    pub const fn can_serve(&self) -> bool {
        self.server.is_some()
    }

    /// Returns `true` if this host can initiate SSL.
    #[must_use]
    pub const fn can_connect(&self) -> bool {
        self.client.is_some()
    }

    fn connection(&self, role: Role, remote_host: Option<&str>) -> AuthResult<Connection> {
        match role {
            Role::Server => {
                let config = self
                    .server
                    .clone()
                    .ok_or_else(|| AuthError::config("SSL: no server certificate"))?;
                Ok(Connection::Server(
                    ServerConnection::new(config).map_err(tls_err("server session"))?,
                ))
            }
            Role::Client => {
                let config = self
                    .client
                    .clone()
                    .ok_or_else(|| AuthError::config("SSL: no trust store"))?;
                let name = self
                    .server_name
                    .as_deref()
                    .or(remote_host)
                    .unwrap_or("localhost")
                    .to_owned();
                let name = ServerName::try_from(name)
                    .map_err(|e| AuthError::config(format!("SSL: bad server name: {e}")))?;
                Ok(Connection::Client(
                    ClientConnection::new(config, name).map_err(tls_err("client session"))?,
                ))
            }
        }
    }
}

/// One in-memory TLS connection.
struct TlsEngine {
    conn: Connection,
}

impl TlsEngine {
    fn feed(&mut self, mut records: &[u8]) -> AuthResult<()> {
        while !records.is_empty() {
            self.conn
                .read_tls(&mut records)
                .map_err(|e| AuthError::crypto(format!("SSL: reading records: {e}")))?;
            self.conn
                .process_new_packets()
                .map_err(tls_err("processing records"))?;
        }
        Ok(())
    }

    fn drain(&mut self) -> AuthResult<Vec<u8>> {
        let mut out = Vec::new();
        while self.conn.wants_write() {
            self.conn
                .write_tls(&mut out)
                .map_err(|e| AuthError::crypto(format!("SSL: writing records: {e}")))?;
        }
        Ok(out)
    }

    fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    fn write_plain(&mut self, data: &[u8]) -> AuthResult<()> {
        self.conn
            .writer()
            .write_all(data)
            .map_err(|e| AuthError::crypto(format!("SSL: sealing data: {e}")))
    }

    fn read_plain(&mut self, len: usize) -> AuthResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.conn
            .reader()
            .read_exact(&mut buf)
            .map_err(|e| AuthError::crypto(format!("SSL: short tunnel read: {e}")))?;
        Ok(buf)
    }

    fn peer_subject(&self) -> AuthResult<Option<String>> {
        match self.conn.peer_certificates().and_then(<[_]>::first) {
            Some(leaf) => subject_dn(leaf).map(Some),
            None => Ok(None),
        }
    }

    /// Status for the next handshake round.
    fn round_status(&self, out: &[u8]) -> i32 {
        if !self.is_handshaking() && out.is_empty() {
            SSL_HOLDING
        } else {
            SSL_SENDING
        }
    }
}

/// What a finished exchange established.
#[derive(Debug, Default)]
struct SslOutcome {
    key: Vec<u8>,
    peer_subject: Option<String>,
    claims: Option<TokenClaims>,
}

fn send_status(io: &mut PhaseIo<'_>, status: i32, records: &[u8]) -> AuthResult<()> {
    io.chan
        .send_blob(status, records)
        .map_err(wire(AuthMethod::Ssl, "sending status"))
}

fn recv_status(io: &mut PhaseIo<'_>) -> AuthResult<(i32, Vec<u8>)> {
    io.chan
        .recv_blob(MAX_RECORD_BATCH)
        .map_err(wire(AuthMethod::Ssl, "reading status"))
}

/// Sends QUITTING and ends with `err`.
fn quit<P>(io: &mut PhaseIo<'_>, err: AuthError) -> Step<P, SslOutcome> {
    if let Err(e) = send_status(io, SSL_QUITTING, &[]) {
        tracing::debug!(error = %e, "could not deliver SSL quit");
    }
    Step::Done(Err(err))
}

fn peer_quit<P>(status: i32, stage: &str) -> Step<P, SslOutcome> {
    Step::Done(Err(AuthError::method(format!(
        "SSL: peer quit during {stage} (status {status})"
    ))))
}

macro_rules! try_step {
    ($expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(err) => return Step::Done(Err(err)),
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientPhase {
    SendHello,
    AwaitHello,
    SendRound,
    AwaitRound,
    AwaitKey,
    SendToken,
    AwaitTokenVerdict,
}

struct ClientExchange {
    engine: AuthResult<TlsEngine>,
    token: Option<Option<String>>,
    sent: i32,
    rounds: u32,
    pending_error: Option<AuthError>,
    outcome: SslOutcome,
}

impl ClientExchange {
    fn engine(&mut self) -> AuthResult<&mut TlsEngine> {
        self.engine.as_mut().map_err(|e| e.clone())
    }
}

impl PhaseMachine for ClientExchange {
    type Phase = ClientPhase;
    type Output = SslOutcome;

    fn step(&mut self, phase: ClientPhase, io: &mut PhaseIo<'_>) -> Step<ClientPhase, SslOutcome> {
        match phase {
            ClientPhase::SendHello => {
                let status = if self.engine.is_ok() { SSL_A_OK } else { SSL_ERROR };
                try_step!(send_status(io, status, &[]));
                Step::Continue(ClientPhase::AwaitHello)
            }
            ClientPhase::AwaitHello => {
                if io.would_block() {
                    return Step::Pending;
                }
                let (server, _) = try_step!(recv_status(io));
                try_step!(self.engine());
                if server != SSL_A_OK {
                    return Step::Done(Err(AuthError::method(
                        "SSL: server could not initialise TLS",
                    )));
                }
                Step::Continue(ClientPhase::SendRound)
            }
            ClientPhase::SendRound => {
                self.rounds += 1;
                if self.rounds > MAX_ROUNDS && self.pending_error.is_none() {
                    self.pending_error = Some(AuthError::protocol("SSL: handshake did not converge"));
                }
                if let Some(err) = self.pending_error.take() {
                    return quit(io, err);
                }
                let engine = try_step!(self.engine());
                let out = match engine.drain() {
                    Ok(out) => out,
                    Err(err) => return quit(io, err),
                };
                let status = engine.round_status(&out);
                try_step!(send_status(io, status, &out));
                self.sent = status;
                Step::Continue(ClientPhase::AwaitRound)
            }
            ClientPhase::AwaitRound => {
                if io.would_block() {
                    return Step::Pending;
                }
                let (server, records) = try_step!(recv_status(io));
                if server != SSL_SENDING && server != SSL_HOLDING {
                    return peer_quit(server, "handshake");
                }
                let sent = self.sent;
                let engine = try_step!(self.engine());
                if let Err(err) = engine.feed(&records) {
                    self.pending_error = Some(err);
                    return Step::Continue(ClientPhase::SendRound);
                }
                if sent == SSL_HOLDING && server == SSL_HOLDING {
                    self.outcome.peer_subject = try_step!(engine.peer_subject());
                    return Step::Continue(ClientPhase::AwaitKey);
                }
                Step::Continue(ClientPhase::SendRound)
            }
            ClientPhase::AwaitKey => {
                if io.would_block() {
                    return Step::Pending;
                }
                let (server, records) = try_step!(recv_status(io));
                if server != SSL_SENDING {
                    return peer_quit(server, "key delivery");
                }
                let engine = try_step!(self.engine());
                let key = match engine
                    .feed(&records)
                    .and_then(|()| engine.read_plain(SSL_SESSION_KEY_LEN))
                {
                    Ok(key) => key,
                    Err(err) => return quit(io, err),
                };
                self.outcome.key = key;
                try_step!(send_status(io, SSL_A_OK, &[]));
                if self.token.is_some() {
                    Step::Continue(ClientPhase::SendToken)
                } else {
                    Step::Done(Ok(core::mem::take(&mut self.outcome)))
                }
            }
            ClientPhase::SendToken => {
                let Some(token) = self.token.take().flatten() else {
                    return quit(io, AuthError::method("SCITOKENS: no token to present"));
                };
                let Ok(len) = u32::try_from(token.len()) else {
                    return quit(io, AuthError::method("SCITOKENS: token too large"));
                };
                let engine = try_step!(self.engine());
                let mut framed = len.to_be_bytes().to_vec();
                framed.extend_from_slice(token.as_bytes());
                let out = match engine.write_plain(&framed).and_then(|()| engine.drain()) {
                    Ok(out) => out,
                    Err(err) => return quit(io, err),
                };
                try_step!(send_status(io, SSL_SENDING, &out));
                Step::Continue(ClientPhase::AwaitTokenVerdict)
            }
            ClientPhase::AwaitTokenVerdict => {
                if io.would_block() {
                    return Step::Pending;
                }
                let (server, _) = try_step!(recv_status(io));
                if server == SSL_A_OK {
                    Step::Done(Ok(core::mem::take(&mut self.outcome)))
                } else {
                    Step::Done(Err(AuthError::method("SCITOKENS: server rejected the token")))
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerPhase {
    AwaitHello,
    AwaitRound,
    SendKey,
    AwaitKeyAck,
    AwaitToken,
}

struct ServerExchange {
    engine: AuthResult<TlsEngine>,
    verifier: Option<Arc<dyn BearerVerifier>>,
    entropy: Arc<dyn EntropySource>,
    rounds: u32,
    outcome: SslOutcome,
}

impl ServerExchange {
    fn engine(&mut self) -> AuthResult<&mut TlsEngine> {
        self.engine.as_mut().map_err(|e| e.clone())
    }
}

impl PhaseMachine for ServerExchange {
    type Phase = ServerPhase;
    type Output = SslOutcome;

    fn step(&mut self, phase: ServerPhase, io: &mut PhaseIo<'_>) -> Step<ServerPhase, SslOutcome> {
        match phase {
            ServerPhase::AwaitHello => {
                if io.would_block() {
                    return Step::Pending;
                }
                let (client, _) = try_step!(recv_status(io));
                let status = if self.engine.is_ok() { SSL_A_OK } else { SSL_ERROR };
                try_step!(send_status(io, status, &[]));
                try_step!(self.engine());
                if client != SSL_A_OK {
                    return Step::Done(Err(AuthError::method(
                        "SSL: client could not initialise TLS",
                    )));
                }
                Step::Continue(ServerPhase::AwaitRound)
            }
            ServerPhase::AwaitRound => {
                if io.would_block() {
                    return Step::Pending;
                }
                let (client, records) = try_step!(recv_status(io));
                if client != SSL_SENDING && client != SSL_HOLDING {
                    return peer_quit(client, "handshake");
                }
                self.rounds += 1;
                if self.rounds > MAX_ROUNDS {
                    return quit(io, AuthError::protocol("SSL: handshake did not converge"));
                }
                let engine = try_step!(self.engine());
                let out = match engine.feed(&records).and_then(|()| engine.drain()) {
                    Ok(out) => out,
                    Err(err) => return quit(io, err),
                };
                let status = engine.round_status(&out);
                try_step!(send_status(io, status, &out));
                if client == SSL_HOLDING && status == SSL_HOLDING {
                    self.outcome.peer_subject = try_step!(engine.peer_subject());
                    return Step::Continue(ServerPhase::SendKey);
                }
                Step::Continue(ServerPhase::AwaitRound)
            }
            ServerPhase::SendKey => {
                let mut key = vec![0u8; SSL_SESSION_KEY_LEN];
                if let Err(err) = self.entropy.fill_bytes(&mut key) {
                    return quit(io, err);
                }
                let engine = try_step!(self.engine());
                let out = match engine.write_plain(&key).and_then(|()| engine.drain()) {
                    Ok(out) => out,
                    Err(err) => return quit(io, err),
                };
                try_step!(send_status(io, SSL_SENDING, &out));
                self.outcome.key = key;
                Step::Continue(ServerPhase::AwaitKeyAck)
            }
            ServerPhase::AwaitKeyAck => {
                if io.would_block() {
                    return Step::Pending;
                }
                let (client, _) = try_step!(recv_status(io));
                if client != SSL_A_OK {
                    return peer_quit(client, "key delivery");
                }
                if self.verifier.is_some() {
                    Step::Continue(ServerPhase::AwaitToken)
                } else {
                    Step::Done(Ok(core::mem::take(&mut self.outcome)))
                }
            }
            ServerPhase::AwaitToken => {
                if io.would_block() {
                    return Step::Pending;
                }
                let (client, records) = try_step!(recv_status(io));
                if client != SSL_SENDING {
                    return peer_quit(client, "token delivery");
                }
                let token = match self.read_token(&records) {
                    Ok(token) => token,
                    Err(err) => return quit(io, err),
                };
                let verified = match &self.verifier {
                    Some(verifier) => verifier.verify(&token),
                    None => Err(AuthError::protocol("SCITOKENS: no verifier")),
                };
                let claims = match verified {
                    Ok(claims) => claims,
                    Err(err) => return quit(io, err),
                };
                try_step!(send_status(io, SSL_A_OK, &[]));
                self.outcome.claims = Some(claims);
                Step::Done(Ok(core::mem::take(&mut self.outcome)))
            }
        }
    }
}

impl ServerExchange {
    fn read_token(&mut self, records: &[u8]) -> AuthResult<String> {
        let engine = self.engine()?;
        engine.feed(records)?;
        let header = engine.read_plain(4)?;
        let mut len = [0u8; 4];
        len.copy_from_slice(&header);
        let len = usize::try_from(u32::from_be_bytes(len)).unwrap_or(usize::MAX);
        if len > MAX_TOKEN_LEN {
            return Err(AuthError::protocol(format!(
                "SCITOKENS: token of {len} bytes exceeds {MAX_TOKEN_LEN}"
            )));
        }
        String::from_utf8(engine.read_plain(len)?)
            .map_err(|_| AuthError::protocol("SCITOKENS: token is not utf-8"))
    }
}

enum Exchange {
    Client(Continuation<ClientExchange>),
    Server(Continuation<ServerExchange>),
}

/// The SSL method, and SCITOKENS when built in token mode.
pub struct SslAuthenticator {
    role: Role,
    tls: Arc<SslContext>,
    token_mode: bool,
    verifier: Option<Arc<dyn BearerVerifier>>,
    client_token: Option<String>,
    entropy: Arc<dyn EntropySource>,
    exchange: Option<Exchange>,
    context: Option<CipherContext>,
    peer: PeerIdentity,
}

impl core::fmt::Debug for SslAuthenticator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SslAuthenticator")
            .field("role", &self.role)
            .field("token_mode", &self.token_mode)
            .field("valid", &self.context.is_some())
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl SslAuthenticator {
    /// Creates the method; fails if this host lacks material for `ctx.role`.
    pub fn new(ctx: &MethodContext, tls: Arc<SslContext>, token_mode: bool) -> AuthResult<Self> {
        let ready = match ctx.role {
            Role::Server => tls.can_serve(),
            Role::Client => tls.can_connect(),
        };
        if !ready {
            return Err(AuthError::config(format!(
                "SSL: no material to act as {}",
                ctx.role.as_str()
            )));
        }
        Ok(Self {
            role: ctx.role,
            tls,
            token_mode,
            verifier: None,
            client_token: None,
            entropy: Arc::clone(&ctx.entropy),
            exchange: None,
            context: None,
            peer: PeerIdentity::default(),
        })
    }

    /// Supplies the server's verifier and the client's token.
    #[must_use]
    pub fn with_tokens(
        mut self,
        verifier: Arc<dyn BearerVerifier>,
        client_token: Option<String>,
    ) -> Self {
        self.verifier = Some(verifier);
        self.client_token = client_token;
        self
    }

    fn method_id(&self) -> AuthMethod {
        if self.token_mode {
            AuthMethod::SciTokens
        } else {
            AuthMethod::Ssl
        }
    }

    fn start(&mut self, remote_host: Option<&str>) {
        let engine = self
            .tls
            .connection(self.role, remote_host)
            .map(|conn| TlsEngine { conn });
        if let Err(err) = &engine {
            tracing::info!(error = %err, "SSL session could not be initialised");
        }
        self.exchange = Some(match self.role {
            Role::Client => Exchange::Client(Continuation::new(
                ClientExchange {
                    engine,
                    token: self.token_mode.then(|| self.client_token.clone()),
                    sent: SSL_RECEIVING,
                    rounds: 0,
                    pending_error: None,
                    outcome: SslOutcome::default(),
                },
                ClientPhase::SendHello,
            )),
            Role::Server => Exchange::Server(Continuation::new(
                ServerExchange {
                    engine,
                    verifier: if self.token_mode {
                        self.verifier.clone()
                    } else {
                        None
                    },
                    entropy: Arc::clone(&self.entropy),
                    rounds: 0,
                    outcome: SslOutcome::default(),
                },
                ServerPhase::AwaitHello,
            )),
        });
    }

    fn drive(&mut self, chan: &mut dyn TransportChannel, mode: DriveMode) -> Poll<AuthResult<()>> {
        let polled = match self.exchange.as_mut() {
            Some(Exchange::Client(cont)) => cont.resume(chan, mode),
            Some(Exchange::Server(cont)) => cont.resume(chan, mode),
            None => {
                return Poll::Ready(Err(AuthError::protocol(
                    "SSL: no exchange in progress",
                )));
            }
        };
        let outcome = match polled {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(outcome) => outcome,
        };
        self.exchange = None;
        Poll::Ready(outcome.and_then(|outcome| self.establish(outcome)))
    }

    fn establish(&mut self, outcome: SslOutcome) -> AuthResult<()> {
        let expires = outcome.claims.as_ref().and_then(|c| c.expires_at);
        self.context = Some(CipherContext::new(
            &outcome.key,
            Arc::clone(&self.entropy),
            expires,
        )?);
        match (self.role, outcome.claims, outcome.peer_subject) {
            (Role::Server, Some(claims), subject) => {
                #[cfg(feature = "tokens")]
                tracing::debug!(
                    issuer = %claims.issuer,
                    subject = %claims.subject,
                    remaining = ?super::token::remaining(&claims),
                    "SCITOKENS client authenticated"
                );
                self.peer.set_remote_user(SCITOKENS_USER);
                self.peer
                    .set_authenticated_name(format!("{},{}", claims.issuer, claims.subject));
                if let Some(dn) = subject {
                    self.peer.set_attribute("x509_subject", dn);
                }
                self.peer.set_claims(claims);
            }
            (Role::Server, None, Some(dn)) => {
                tracing::debug!(subject = %dn, "SSL client authenticated by certificate");
                self.peer.set_remote_user(SSL_USER);
                self.peer.set_authenticated_name(dn);
            }
            (Role::Server, None, None) => {
                tracing::debug!("SSL client presented no certificate");
                self.peer.set_remote_user(UNAUTHENTICATED_USER);
                self.peer.set_authenticated_name(UNAUTHENTICATED_USER);
            }
            (Role::Client, _, subject) => {
                if let Some(dn) = subject {
                    self.peer.set_authenticated_name(dn);
                }
            }
        }
        if self.role == Role::Server {
            self.peer.set_remote_domain(UNMAPPED_DOMAIN);
        }
        Ok(())
    }
}

impl Authenticator for SslAuthenticator {
    fn method(&self) -> AuthMethod {
        self.method_id()
    }

    fn authenticate(
        &mut self,
        chan: &mut dyn TransportChannel,
        remote_host: Option<&str>,
        mode: DriveMode,
    ) -> Poll<AuthResult<()>> {
        self.start(remote_host);
        self.drive(chan, mode)
    }

    fn authenticate_continue(
        &mut self,
        chan: &mut dyn TransportChannel,
        mode: DriveMode,
    ) -> Poll<AuthResult<()>> {
        self.drive(chan, mode)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authenticator::Providers;
    use crate::crypto::DetEntropy;
    use crate::transport::duplex_with_timeout;
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
    use std::path::PathBuf;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Pki {
        dir: TempDir,
    }

    impl Pki {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().expect("tempdir"),
            }
        }

        /// Writes a self-signed certificate for `cn` and returns (cert, key).
        fn issue(&self, cn: &str) -> (PathBuf, PathBuf) {
            let mut params =
                CertificateParams::new(vec!["localhost".to_owned()]).expect("params");
            params.distinguished_name = DistinguishedName::new();
            params.distinguished_name.push(DnType::CommonName, cn);
            let key = KeyPair::generate().expect("key");
            let cert = params.self_signed(&key).expect("cert");
            let cert_path = self.dir.path().join(format!("{cn}.crt"));
            let key_path = self.dir.path().join(format!("{cn}.key"));
            std::fs::write(&cert_path, cert.pem()).expect("write cert");
            std::fs::write(&key_path, key.serialize_pem()).expect("write key");
            (cert_path, key_path)
        }

        fn bundle(&self, certs: &[&Path]) -> PathBuf {
            let mut pem = String::new();
            for cert in certs {
                pem.push_str(&std::fs::read_to_string(cert).expect("read cert"));
            }
            let path = self.dir.path().join("ca.pem");
            std::fs::write(&path, pem).expect("write bundle");
            path
        }
    }

    fn ctx(role: Role, config: &AuthConfig, seed: u64) -> MethodContext {
        MethodContext {
            config: Arc::new(config.clone()),
            role,
            entropy: Arc::new(DetEntropy::new(seed)),
            providers: Providers::default(),
        }
    }

    fn run_pair(
        mut client: SslAuthenticator,
        mut server: SslAuthenticator,
        server_mode: DriveMode,
    ) -> (AuthResult<()>, SslAuthenticator, AuthResult<()>, SslAuthenticator) {
        let (mut c, mut s) = duplex_with_timeout(Duration::from_secs(10));
        let handle = thread::spawn(move || {
            let result = match client.authenticate(&mut c, Some("localhost"), DriveMode::Blocking) {
                Poll::Ready(result) => result,
                Poll::Pending => Err(AuthError::protocol("blocking client yielded")),
            };
            (result, client)
        });
        let mut polled = server.authenticate(&mut s, None, server_mode);
        let server_result = loop {
            match polled {
                Poll::Ready(result) => break result,
                Poll::Pending => {
                    thread::sleep(Duration::from_millis(1));
                    polled = server.authenticate_continue(&mut s, server_mode);
                }
            }
        };
        let (client_result, client) = handle.join().expect("client thread");
        (server_result, server, client_result, client)
    }

    #[test]
    fn server_certificate_only() {
        let pki = Pki::new();
        let (cert, key) = pki.issue("server");
        let mut config = AuthConfig::default();
        config.ssl.server_cert = Some(cert.clone());
        config.ssl.server_key = Some(key);
        config.ssl.ca_file = Some(pki.bundle(&[&cert]));
        let tls = Arc::new(SslContext::from_config(&config).expect("tls"));

        let client = SslAuthenticator::new(&ctx(Role::Client, &config, 1), Arc::clone(&tls), false)
            .expect("client");
        let server =
            SslAuthenticator::new(&ctx(Role::Server, &config, 2), tls, false).expect("server");
        let (server_result, server, client_result, client) =
            run_pair(client, server, DriveMode::Blocking);
        server_result.expect("server");
        client_result.expect("client");

        assert_eq!(server.peer().fully_qualified_user(), Some("unauthenticated@unmapped"));
        assert_eq!(client.peer().authenticated_name(), Some("/CN=server"));

        let sealed = client.wrap(b"hello").expect("wrap");
        assert_eq!(server.unwrap(&sealed).expect("unwrap"), b"hello");
        let empty = server.wrap(b"").expect("wrap empty");
        assert_eq!(client.unwrap(&empty).expect("unwrap empty"), b"");
    }

    #[test]
    fn client_certificate_sets_dn_nonblocking() {
        let pki = Pki::new();
        let (server_cert, server_key) = pki.issue("server");
        let (client_cert, client_key) = pki.issue("alice");
        let ca = pki.bundle(&[&server_cert, &client_cert]);

        let mut server_config = AuthConfig::default();
        server_config.ssl.server_cert = Some(server_cert);
        server_config.ssl.server_key = Some(server_key);
        server_config.ssl.ca_file = Some(ca.clone());
        let mut client_config = AuthConfig::default();
        client_config.ssl.client_cert = Some(client_cert);
        client_config.ssl.client_key = Some(client_key);
        client_config.ssl.ca_file = Some(ca);

        let client = SslAuthenticator::new(
            &ctx(Role::Client, &client_config, 3),
            Arc::new(SslContext::from_config(&client_config).expect("client tls")),
            false,
        )
        .expect("client");
        let server = SslAuthenticator::new(
            &ctx(Role::Server, &server_config, 4),
            Arc::new(SslContext::from_config(&server_config).expect("server tls")),
            false,
        )
        .expect("server");
        let (server_result, server, client_result, _) =
            run_pair(client, server, DriveMode::NonBlocking);
        server_result.expect("server");
        client_result.expect("client");
        assert_eq!(server.peer().remote_user(), Some(SSL_USER));
        assert_eq!(server.peer().authenticated_name(), Some("/CN=alice"));
    }

    #[test]
    fn untrusted_server_fails_both_sides() {
        let pki = Pki::new();
        let (cert, key) = pki.issue("server");
        let (other, _) = pki.issue("someone-else");
        let mut server_config = AuthConfig::default();
        server_config.ssl.server_cert = Some(cert);
        server_config.ssl.server_key = Some(key);
        let mut client_config = AuthConfig::default();
        client_config.ssl.ca_file = Some(pki.bundle(&[&other]));

        let client = SslAuthenticator::new(
            &ctx(Role::Client, &client_config, 5),
            Arc::new(SslContext::from_config(&client_config).expect("client tls")),
            false,
        )
        .expect("client");
        let server = SslAuthenticator::new(
            &ctx(Role::Server, &server_config, 6),
            Arc::new(SslContext::from_config(&server_config).expect("server tls")),
            false,
        )
        .expect("server");
        let (server_result, server, client_result, client) =
            run_pair(client, server, DriveMode::Blocking);
        assert!(client_result.is_err());
        assert!(server_result.is_err());
        assert!(!server.is_valid());
        assert!(client.wrap(b"x").is_err());
    }

    #[test]
    fn missing_material_is_configuration_error() {
        assert!(SslContext::from_config(&AuthConfig::default()).is_err());

        let pki = Pki::new();
        let (cert, _) = pki.issue("ca");
        let mut config = AuthConfig::default();
        config.ssl.ca_file = Some(pki.bundle(&[&cert]));
        let tls = Arc::new(SslContext::from_config(&config).expect("client only"));
        let err = SslAuthenticator::new(&ctx(Role::Server, &config, 7), tls, false)
            .expect_err("cannot serve");
        assert_eq!(err.kind(), crate::error::AuthErrorKind::Configuration);
    }

    #[test]
    fn unknown_cipher_suite_is_rejected() {
        let mut config = AuthConfig::default();
        config.ssl.cipher_suites = vec!["TLS_NULL_WITH_NULL_NULL".into()];
        assert!(crypto_provider(&config.ssl.cipher_suites).is_err());
        assert!(crypto_provider(&["TLS13_AES_256_GCM_SHA384".to_owned()]).is_ok());
    }

    #[cfg(feature = "tokens")]
    #[test]
    fn scitokens_mode_carries_claims() {
        use crate::authenticator::token::TokenVerifier;
        use crate::config::{TokenConfig, TrustedIssuer};
        use jsonwebtoken::{EncodingKey, Header, encode};

        let pki = Pki::new();
        let (cert, key) = pki.issue("server");
        let mut config = AuthConfig::default();
        config.ssl.server_cert = Some(cert.clone());
        config.ssl.server_key = Some(key);
        config.ssl.ca_file = Some(pki.bundle(&[&cert]));
        let tls = Arc::new(SslContext::from_config(&config).expect("tls"));

        let verifier = Arc::new(
            TokenVerifier::from_config(&TokenConfig {
                trusted_issuers: vec![TrustedIssuer {
                    issuer: "https://issuer.example".into(),
                    algorithm: "HS256".into(),
                    secret: Some("s3cret".into()),
                    ..TrustedIssuer::default()
                }],
                ..TokenConfig::default()
            })
            .expect("verifier"),
        );
        let exp = SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_secs()
            + 600;
        let token = encode(
            &Header::default(),
            &serde_json::json!({"iss": "https://issuer.example", "sub": "bob", "exp": exp}),
            &EncodingKey::from_secret(b"s3cret"),
        )
        .expect("token");

        let client = SslAuthenticator::new(&ctx(Role::Client, &config, 8), Arc::clone(&tls), true)
            .expect("client")
            .with_tokens(verifier.clone(), Some(token));
        let server = SslAuthenticator::new(&ctx(Role::Server, &config, 9), tls, true)
            .expect("server")
            .with_tokens(verifier, None);
        let (server_result, server, client_result, _) =
            run_pair(client, server, DriveMode::NonBlocking);
        server_result.expect("server");
        client_result.expect("client");
        let snap = server.peer().snapshot("SCITOKENS", None);
        assert_eq!(snap.remote_user.as_deref(), Some(SCITOKENS_USER));
        assert_eq!(snap.raw_principal.as_deref(), Some("https://issuer.example,bob"));
        assert_eq!(snap.claims.map(|c| c.subject).as_deref(), Some("bob"));
        assert_eq!(server.method(), AuthMethod::SciTokens);
    }
}

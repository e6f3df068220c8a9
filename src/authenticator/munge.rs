//! Host-daemon signed credentials.
//!
//! The client asks its local daemon to sign a credential whose payload is a
//! fresh random key and sends it; the server asks its daemon to verify it,
//! which yields the originating uid and the payload. Both sides then wrap
//! and unwrap with that key. This layer performs no network cryptography of
//! its own for the proof: it trusts the daemon's signature.
//!
//! Wire: client `{status, credential}`, server `{status}`.

use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::task::Poll;

use super::{Authenticator, CipherContext, MethodContext, SecurityContext, UserDirectory, wire};
use crate::continuation::DriveMode;
use crate::crypto::{EntropySource, SESSION_KEY_SIZE};
use crate::error::{AuthError, AuthResult};
use crate::identity::PeerIdentity;
use crate::method::AuthMethod;
use crate::transport::{Role, TransportChannel};

/// What the daemon vouches for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MungeCredential {
    /// Originating uid.
    pub uid: u32,
    /// Originating gid.
    pub gid: u32,
    /// Payload embedded by the encoder.
    pub payload: Vec<u8>,
}

/// The local credential daemon.
pub trait MungeDaemon: Send + Sync {
    /// Signs a credential carrying `payload`.
    fn encode(&self, payload: &[u8]) -> AuthResult<String>;

    /// Verifies a credential.
    fn decode(&self, credential: &str) -> AuthResult<MungeCredential>;
}

/// Talks to the daemon through the `munge` and `unmunge` tools.
///
/// Payloads travel hex encoded so binary keys survive the tools' text
/// handling.
#[derive(Debug, Clone)]
pub struct MungeCommand {
    munge: String,
    unmunge: String,
}

impl Default for MungeCommand {
    fn default() -> Self {
        Self {
            munge: "munge".to_owned(),
            unmunge: "unmunge".to_owned(),
        }
    }
}

impl MungeCommand {
    /// Uses the tools at the given paths.
    #[must_use]
    pub fn with_tools(munge: impl Into<String>, unmunge: impl Into<String>) -> Self {
        Self {
            munge: munge.into(),
            unmunge: unmunge.into(),
        }
    }

    fn pipe(program: &str, input: &[u8]) -> AuthResult<Vec<u8>> {
        let mut child = Command::new(program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| AuthError::method(format!("cannot run {program}: {e}")))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input)
                .map_err(|e| AuthError::method(format!("{program}: {e}")))?;
        }
        let output = child
            .wait_with_output()
            .map_err(|e| AuthError::method(format!("{program}: {e}")))?;
        if !output.status.success() {
            return Err(AuthError::method(format!(
                "{program} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }
}

impl MungeDaemon for MungeCommand {
    fn encode(&self, payload: &[u8]) -> AuthResult<String> {
        let out = Self::pipe(&self.munge, hex::encode(payload).as_bytes())?;
        String::from_utf8(out)
            .map(|s| s.trim().to_owned())
            .map_err(|_| AuthError::method("munge produced a non-text credential"))
    }

    fn decode(&self, credential: &str) -> AuthResult<MungeCredential> {
        let out = Self::pipe(&self.unmunge, credential.as_bytes())?;
        let text = String::from_utf8(out)
            .map_err(|_| AuthError::method("unmunge produced non-text output"))?;
        parse_unmunge(&text)
    }
}

/// Parses `unmunge` output: `KEY: value` metadata, a blank line, the payload.
pub(crate) fn parse_unmunge(text: &str) -> AuthResult<MungeCredential> {
    let (head, body) = text.split_once("\n\n").unwrap_or((text, ""));
    let mut uid = None;
    let mut gid = None;
    for line in head.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "STATUS" if !value.trim_start().starts_with("Success") => {
                return Err(AuthError::method(format!(
                    "credential rejected: {}",
                    value.trim()
                )));
            }
            "UID" => uid = parenthesized_id(value),
            "GID" => gid = parenthesized_id(value),
            _ => {}
        }
    }
    let uid = uid.ok_or_else(|| AuthError::method("unmunge output has no UID"))?;
    let gid = gid.ok_or_else(|| AuthError::method("unmunge output has no GID"))?;
    Ok(MungeCredential {
        uid,
        gid,
        payload: hex::decode(body.trim())
            .map_err(|e| AuthError::method(format!("payload is not hex: {e}")))?,
    })
}

/// `alice (1000)` -> 1000.
fn parenthesized_id(value: &str) -> Option<u32> {
    let open = value.rfind('(')?;
    let close = value.rfind(')')?;
    value.get(open + 1..close)?.trim().parse().ok()
}

/// The `MUNGE` method.
pub struct MungeAuthenticator {
    role: Role,
    daemon: Arc<dyn MungeDaemon>,
    users: Arc<dyn UserDirectory>,
    entropy: Arc<dyn EntropySource>,
    domain: String,
    peer: PeerIdentity,
    context: Option<CipherContext>,
}

impl core::fmt::Debug for MungeAuthenticator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MungeAuthenticator")
            .field("role", &self.role)
            .field("valid", &self.context.is_some())
            .finish_non_exhaustive()
    }
}

impl MungeAuthenticator {
    /// Creates the method.
    #[must_use]
    pub fn new(
        role: Role,
        daemon: Arc<dyn MungeDaemon>,
        users: Arc<dyn UserDirectory>,
        entropy: Arc<dyn EntropySource>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            role,
            daemon,
            users,
            entropy,
            domain: domain.into(),
            peer: PeerIdentity::default(),
            context: None,
        }
    }

    fn run_client(&mut self, chan: &mut dyn TransportChannel) -> AuthResult<()> {
        let method = AuthMethod::Munge;
        let mut key = vec![0u8; SESSION_KEY_SIZE];
        let signed = self
            .entropy
            .fill_bytes(&mut key)
            .and_then(|()| self.daemon.encode(&key));

        chan.encode();
        match &signed {
            Ok(credential) => {
                chan.put_i32(0).map_err(wire(method, "sending status"))?;
                chan.put_str(credential)
                    .map_err(wire(method, "sending credential"))?;
            }
            Err(err) => {
                tracing::debug!(error = %err, "munge encode failed");
                chan.put_i32(-1).map_err(wire(method, "sending status"))?;
                chan.put_str("").map_err(wire(method, "sending credential"))?;
            }
        }
        chan.end_of_message().map_err(wire(method, "sending credential"))?;

        let verdict = chan.recv_int().map_err(wire(method, "reading verdict"))?;
        signed?;
        if verdict != 0 {
            return Err(AuthError::method("MUNGE: server rejected the credential"));
        }
        self.context = Some(CipherContext::new(&key, Arc::clone(&self.entropy), None)?);
        Ok(())
    }

    fn run_server(&mut self, chan: &mut dyn TransportChannel) -> AuthResult<()> {
        let method = AuthMethod::Munge;
        chan.decode();
        let status = chan.get_i32().map_err(wire(method, "reading status"))?;
        let credential = chan.get_str().map_err(wire(method, "reading credential"))?;
        chan.end_of_message().map_err(wire(method, "reading credential"))?;

        let outcome = if status == 0 {
            self.accept(&credential)
        } else {
            Err(AuthError::method("MUNGE: client could not obtain a credential"))
        };
        let verdict = if outcome.is_ok() { 0 } else { -1 };
        chan.send_ints(&[verdict]).map_err(wire(method, "sending verdict"))?;

        let (user, cred) = outcome?;
        tracing::debug!(user = %user, uid = cred.uid, gid = cred.gid, "munge credential accepted");
        self.peer.set_authenticated_name(user.clone());
        self.peer.set_remote_user(user);
        self.peer.set_remote_domain(self.domain.clone());
        self.context = Some(CipherContext::new(
            &cred.payload,
            Arc::clone(&self.entropy),
            None,
        )?);
        Ok(())
    }

    fn accept(&self, credential: &str) -> AuthResult<(String, MungeCredential)> {
        let cred = self.daemon.decode(credential)?;
        if cred.payload.is_empty() {
            return Err(AuthError::method("MUNGE: credential carries no key"));
        }
        let user = self
            .users
            .user_name(cred.uid)
            .ok_or_else(|| AuthError::method(format!("MUNGE: no account for uid {}", cred.uid)))?;
        Ok((user, cred))
    }
}

impl Authenticator for MungeAuthenticator {
    fn method(&self) -> AuthMethod {
        AuthMethod::Munge
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
        self.context.is_some()
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
    let daemon = ctx
        .providers
        .munge
        .clone()
        .ok_or_else(|| AuthError::config("MUNGE needs a credential daemon"))?;
    Ok(Box::new(MungeAuthenticator::new(
        ctx.role,
        daemon,
        Arc::clone(&ctx.providers.users),
        Arc::clone(&ctx.entropy),
        ctx.config.uid_domain.clone(),
    )))
}

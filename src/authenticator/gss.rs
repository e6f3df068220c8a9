//! Context-establishment loop shared by the GSS-style methods.
//!
//! GSI and SSPI both establish a context by trading opaque tokens until
//! each side's mechanism reports completion. Every message is
//! `{status, len, token}` where the status tells the receiver whether the
//! sender's context is complete. A side stops once it has both sent and
//! received [`GSS_COMPLETE`]. A failing side sends [`GSS_FAILURE`] with an
//! empty token so its peer stops waiting.
//!
//! After the loop both methods run [`exchange_verdicts`] so that a local
//! policy rejection (wrong server name, unmappable peer) reaches the peer.

use super::{SecurityContext, wire};
use crate::error::{AuthError, AuthResult};
use crate::method::AuthMethod;
use crate::transport::{Role, TransportChannel};

/// Sender's context is established.
pub const GSS_COMPLETE: i32 = 0;
/// Sender needs another token.
pub const GSS_CONTINUE: i32 = 1;
/// Sender gave up.
pub const GSS_FAILURE: i32 = -1;

/// Upper bound on a single context token.
const MAX_TOKEN_LEN: usize = 256 * 1024;

/// Result of feeding one token to a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GssStep {
    /// Send this token and wait for another.
    Continue(Vec<u8>),
    /// The context is established; send this (possibly empty) token.
    Complete(Vec<u8>),
}

impl GssStep {
    fn status(&self) -> i32 {
        match self {
            Self::Continue(_) => GSS_CONTINUE,
            Self::Complete(_) => GSS_COMPLETE,
        }
    }

    fn token(&self) -> &[u8] {
        match self {
            Self::Continue(token) | Self::Complete(token) => token,
        }
    }
}

/// A security context under establishment.
pub trait GssContext: SecurityContext {
    /// Consumes the peer's token (`None` for the initiator's first call).
    fn step(&mut self, input: Option<&[u8]>) -> AuthResult<GssStep>;

    /// The authenticated peer name, once established.
    fn peer_name(&self) -> Option<String>;

    /// The peer's attribute string (e.g. a VOMS FQAN), if it carries one.
    fn peer_attribute(&self) -> Option<String> {
        None
    }

    /// Takes a credential the peer delegated during establishment.
    fn take_delegated(&mut self) -> Option<Vec<u8>> {
        None
    }
}

fn send_token(
    chan: &mut dyn TransportChannel,
    method: AuthMethod,
    status: i32,
    token: &[u8],
) -> AuthResult<()> {
    chan.send_blob(status, token)
        .map_err(wire(method, "sending context token"))
}

/// Drives `context` to completion.
pub fn establish(
    method: AuthMethod,
    role: Role,
    context: &mut dyn GssContext,
    chan: &mut dyn TransportChannel,
) -> AuthResult<()> {
    let fail = |chan: &mut dyn TransportChannel, err: AuthError| -> AuthResult<()> {
        if let Err(e) = chan.send_blob(GSS_FAILURE, &[]) {
            tracing::debug!(%method, error = %e, "could not deliver context failure");
        }
        Err(err)
    };

    let mut sent_complete = false;
    if role == Role::Client {
        let step = match context.step(None) {
            Ok(step) => step,
            Err(err) => return fail(chan, err),
        };
        send_token(chan, method, step.status(), step.token())?;
        sent_complete = step.status() == GSS_COMPLETE;
    }

    let mut rounds = 0u32;
    loop {
        rounds += 1;
        let (status, token) = chan
            .recv_blob(MAX_TOKEN_LEN)
            .map_err(wire(method, "reading context token"))?;
        let peer_complete = match status {
            GSS_COMPLETE => true,
            GSS_CONTINUE => false,
            GSS_FAILURE => {
                return Err(AuthError::method(format!(
                    "{method}: peer failed to establish a context"
                )));
            }
            other => {
                return Err(AuthError::protocol(format!(
                    "{method}: unknown context status {other}"
                )));
            }
        };

        if sent_complete {
            if peer_complete {
                break;
            }
            return fail(
                chan,
                AuthError::protocol(format!("{method}: peer continued after completion")),
            );
        }

        let step = match context.step(Some(&token)) {
            Ok(step) => step,
            Err(err) => return fail(chan, err),
        };
        if peer_complete && step.status() != GSS_COMPLETE {
            return fail(
                chan,
                AuthError::protocol(format!("{method}: peer finished before the local context")),
            );
        }
        send_token(chan, method, step.status(), step.token())?;
        sent_complete = step.status() == GSS_COMPLETE;
        if sent_complete && peer_complete {
            break;
        }
    }
    tracing::trace!(%method, side = role.as_str(), rounds, "context established");
    Ok(())
}

/// Tells the peer this side cannot take part, keeping the loop in step.
///
/// The server first consumes the client's opening token so the client
/// reads the failure instead of blocking.
pub fn refuse(
    method: AuthMethod,
    role: Role,
    chan: &mut dyn TransportChannel,
    err: AuthError,
) -> AuthError {
    if role == Role::Server {
        if let Err(e) = chan.recv_blob(MAX_TOKEN_LEN) {
            tracing::debug!(%method, error = %e, "no opening token to discard");
        }
    }
    if let Err(e) = chan.send_blob(GSS_FAILURE, &[]) {
        tracing::debug!(%method, error = %e, "could not deliver context failure");
    }
    err
}

/// Trades final verdicts: the client speaks first, the server answers.
///
/// Returns `Ok` only if both sides accepted.
pub fn exchange_verdicts(
    method: AuthMethod,
    role: Role,
    chan: &mut dyn TransportChannel,
    local: AuthResult<()>,
) -> AuthResult<()> {
    let ours = i32::from(local.is_ok());
    let theirs = match role {
        Role::Client => {
            chan.send_ints(&[ours])
                .map_err(wire(method, "sending verdict"))?;
            chan.recv_int().map_err(wire(method, "reading verdict"))?
        }
        Role::Server => {
            let theirs = chan.recv_int().map_err(wire(method, "reading verdict"))?;
            chan.send_ints(&[ours])
                .map_err(wire(method, "sending verdict"))?;
            theirs
        }
    };
    local?;
    if theirs == 1 {
        Ok(())
    } else {
        Err(AuthError::method(format!("{method}: peer rejected the exchange")))
    }
}

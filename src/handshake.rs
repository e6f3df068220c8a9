//! Method negotiation.
//!
//! One request/reply round per attempt:
//!
//! ```text
//!   client                          server
//!   {int32 mask}     ──────────►    first of server order ∩ mask
//!                    ◄──────────    {int32 method}   (0 = none in common)
//! ```
//!
//! The client never selects; it takes the server's answer as is. The
//! server may skip its first choice when that method cannot be
//! instantiated locally, see [`select`].

use crate::error::{AuthError, AuthErrorKind, AuthResult, ErrorStack, TransportError};
use crate::method::{AuthMethod, METHOD_NONE, MethodSet};
use crate::transport::TransportChannel;

fn unreadable(what: &str, err: &TransportError) -> AuthError {
    AuthError::new(AuthErrorKind::HandshakeFailure).with_context(format!("{what}: {err}"))
}

fn unsendable(what: &str, err: &TransportError) -> AuthError {
    AuthError::new(AuthErrorKind::Transport).with_context(format!("{what}: {err}"))
}

/// Sends the client's candidate mask.
pub fn propose(chan: &mut dyn TransportChannel, candidates: &MethodSet) -> AuthResult<()> {
    let mask = candidates.bitmask();
    tracing::debug!(mask, methods = %candidates, "proposing methods");
    chan.send_ints(&[mask])
        .map_err(|e| unsendable("sending method mask", &e))
}

/// Reads the server's selection.
///
/// `Ok(None)` means no common method. A server that hung up instead of
/// replying is read the same way.
pub fn read_selection(
    chan: &mut dyn TransportChannel,
    candidates: &MethodSet,
) -> AuthResult<Option<AuthMethod>> {
    let id = match chan.recv_int() {
        Ok(id) => id,
        Err(e) if e.is_closed() => {
            tracing::debug!("server closed during negotiation");
            METHOD_NONE
        }
        Err(e) => return Err(unreadable("reading selected method", &e)),
    };
    if id == METHOD_NONE {
        return Ok(None);
    }
    match AuthMethod::from_bit(id) {
        Some(method) if candidates.contains(method) => {
            tracing::debug!(method = %method, "server selected method");
            Ok(Some(method))
        }
        _ => Err(AuthError::new(AuthErrorKind::HandshakeFailure)
            .with_context(format!("server selected {id}, which was not offered"))),
    }
}

/// Reads the client's candidate mask.
pub fn read_proposal(chan: &mut dyn TransportChannel) -> AuthResult<i32> {
    chan.recv_int().map_err(|e| {
        if e.is_closed() {
            AuthError::from(e).with_context("client closed during negotiation")
        } else {
            unreadable("reading method mask", &e)
        }
    })
}

/// Picks the first method of `preference` present in `mask` for which
/// `instantiate` succeeds.
///
/// A method that fails to instantiate is dropped from the mask, recorded
/// on `stack`, and selection runs again.
pub fn select<T>(
    preference: &MethodSet,
    mut mask: i32,
    stack: &mut ErrorStack,
    mut instantiate: impl FnMut(AuthMethod) -> AuthResult<T>,
) -> Option<(AuthMethod, T)> {
    while let Some(method) = preference.first_in_mask(mask) {
        match instantiate(method) {
            Ok(value) => return Some((method, value)),
            Err(err) => {
                tracing::info!(method = %method, error = %err, "cannot start selected method");
                stack.push(method.name(), format!("Failed to initialise {method}: {err}"));
                mask &= !method.bit();
            }
        }
    }
    None
}

/// Sends the server's answer.
pub fn reply(chan: &mut dyn TransportChannel, selected: Option<AuthMethod>) -> AuthResult<()> {
    let id = selected.map_or(METHOD_NONE, AuthMethod::bit);
    tracing::debug!(selected = id, "replying to method proposal");
    chan.send_ints(&[id])
        .map_err(|e| unsendable("sending selected method", &e))
}

//! Deterministic in-process providers.
//!
//! These stand in for the native Kerberos, X.509, negotiate and credential
//! daemon stacks so that every method can run end to end inside one
//! process. Tokens are readable text; keys derive from a fixed secret and a
//! per-exchange nonce, so two providers built separately still agree.
//! Nothing here offers any security.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use ring::digest;

use super::gss::{GssContext, GssStep};
use super::gsi::{GsiCredential, GssMechanism};
use super::kerberos::{
    CredentialSource, KerberosAcceptance, KerberosInitiator, KerberosMechanism, KerberosSession,
};
use super::munge::{MungeCredential, MungeDaemon};
use super::sspi::{Impersonation, SspiProvider};
use super::{CipherContext, SecurityContext};
use crate::crypto::os_entropy;
use crate::error::{AuthError, AuthResult};

const LOOPBACK_SECRET: &[u8] = b"peerauth-loopback";

const CREDENTIAL_LIFETIME: Duration = Duration::from_secs(3600);

fn derive_key(label: &str, nonce: u64) -> Vec<u8> {
    let mut ctx = digest::Context::new(&digest::SHA256);
    ctx.update(LOOPBACK_SECRET);
    ctx.update(label.as_bytes());
    ctx.update(&nonce.to_be_bytes());
    ctx.finish().as_ref().to_vec()
}

fn fields(token: &[u8], tag: &str, count: usize) -> AuthResult<Vec<String>> {
    let text = std::str::from_utf8(token)
        .map_err(|_| AuthError::protocol("loopback token is not text"))?;
    let mut parts = text.split('\n');
    if parts.next() != Some(tag) {
        return Err(AuthError::protocol(format!("expected a {tag} token")));
    }
    let rest: Vec<String> = parts.map(str::to_owned).collect();
    if rest.len() != count {
        return Err(AuthError::protocol(format!("malformed {tag} token")));
    }
    Ok(rest)
}

fn parse_nonce(text: &str) -> AuthResult<u64> {
    text.parse()
        .map_err(|_| AuthError::protocol("loopback nonce is not a number"))
}

fn non_empty(text: &str) -> Option<String> {
    (!text.is_empty()).then(|| text.to_owned())
}

/// A Kerberos realm with a single client principal.
#[derive(Debug)]
pub struct LoopbackKerberos {
    client_principal: String,
    server_principal: String,
    client_address: Option<String>,
    server_address: Option<String>,
    reject: bool,
    nonce: AtomicU64,
}

impl LoopbackKerberos {
    /// Issues tickets for `client_principal`.
    #[must_use]
    pub fn new(client_principal: impl Into<String>) -> Self {
        Self {
            client_principal: client_principal.into(),
            server_principal: "host/server.example.org@EXAMPLE.ORG".to_owned(),
            client_address: None,
            server_address: None,
            reject: false,
            nonce: AtomicU64::new(1),
        }
    }

    /// Uses `principal` for the accepting service.
    #[must_use]
    pub fn with_server_principal(mut self, principal: impl Into<String>) -> Self {
        self.server_principal = principal.into();
        self
    }

    /// Binds `address` into client tickets.
    #[must_use]
    pub fn with_client_address(mut self, address: impl Into<String>) -> Self {
        self.client_address = Some(address.into());
        self
    }

    /// Binds `address` into the server's reply.
    #[must_use]
    pub fn with_server_address(mut self, address: impl Into<String>) -> Self {
        self.server_address = Some(address.into());
        self
    }

    /// The accepting side rejects every request.
    #[must_use]
    pub fn rejecting(mut self) -> Self {
        self.reject = true;
        self
    }
}

struct LoopbackInitiator {
    nonce: u64,
    server_principal: String,
    server_address: Option<String>,
}

impl KerberosInitiator for LoopbackInitiator {
    fn finish(self: Box<Self>, ap_rep: &[u8]) -> AuthResult<KerberosSession> {
        let parts = fields(ap_rep, "AP-REP", 1)?;
        if parse_nonce(&parts[0])? != self.nonce {
            return Err(AuthError::method("KERBEROS: AP-REP answers another request"));
        }
        Ok(KerberosSession {
            principal: self.server_principal,
            peer_address: self.server_address,
            session_key: derive_key("krb", self.nonce),
            end_time: Some(SystemTime::now() + CREDENTIAL_LIFETIME),
        })
    }
}

impl KerberosMechanism for LoopbackKerberos {
    fn initiate(
        &self,
        service: &str,
        _host: Option<&str>,
        _credentials: &CredentialSource,
    ) -> AuthResult<(Vec<u8>, Box<dyn KerberosInitiator>)> {
        let nonce = self.nonce.fetch_add(1, Ordering::Relaxed);
        let ap_req = format!(
            "AP-REQ\n{}\n{service}\n{nonce}\n{}",
            self.client_principal,
            self.client_address.as_deref().unwrap_or_default()
        );
        Ok((
            ap_req.into_bytes(),
            Box::new(LoopbackInitiator {
                nonce,
                server_principal: self.server_principal.clone(),
                server_address: self.server_address.clone(),
            }),
        ))
    }

    fn accept(
        &self,
        service: &str,
        _credentials: &CredentialSource,
        ap_req: &[u8],
    ) -> AuthResult<KerberosAcceptance> {
        if self.reject {
            return Err(AuthError::method("KERBEROS: ticket rejected by the KDC"));
        }
        let parts = fields(ap_req, "AP-REQ", 4)?;
        if parts[1] != service {
            return Err(AuthError::method(format!(
                "KERBEROS: ticket is for service {}, not {service}",
                parts[1]
            )));
        }
        let nonce = parse_nonce(&parts[2])?;
        Ok(KerberosAcceptance {
            ap_rep: format!("AP-REP\n{nonce}").into_bytes(),
            session: KerberosSession {
                principal: parts[0].clone(),
                peer_address: non_empty(&parts[3]),
                session_key: derive_key("krb", nonce),
                end_time: Some(SystemTime::now() + CREDENTIAL_LIFETIME),
            },
        })
    }
}

/// An X.509 world where every subject trusts every other.
#[derive(Debug)]
pub struct LoopbackGss {
    subject: String,
    fqan: Option<String>,
    delegate: bool,
    reject: bool,
    has_credential: bool,
    acquisitions: AtomicUsize,
    nonce: AtomicU64,
}

impl LoopbackGss {
    /// A mechanism whose local credential is `subject`.
    #[must_use]
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            fqan: None,
            delegate: false,
            reject: false,
            has_credential: true,
            acquisitions: AtomicUsize::new(0),
            nonce: AtomicU64::new(1),
        }
    }

    /// Presents `fqan` when initiating.
    #[must_use]
    pub fn with_fqan(mut self, fqan: impl Into<String>) -> Self {
        self.fqan = Some(fqan.into());
        self
    }

    /// Delegates a credential when the caller asks for it.
    #[must_use]
    pub fn delegating(mut self) -> Self {
        self.delegate = true;
        self
    }

    /// The accepting side rejects every initiator.
    #[must_use]
    pub fn rejecting(mut self) -> Self {
        self.reject = true;
        self
    }

    /// Credential acquisition fails.
    #[must_use]
    pub fn without_credential(mut self) -> Self {
        self.has_credential = false;
        self
    }

    /// Number of successful credential acquisitions.
    #[must_use]
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    /// An initiating context for `subject` towards `target`.
    #[must_use]
    pub fn initiator(&self, subject: &str, target: Option<&str>) -> LoopbackGssContext {
        LoopbackGssContext::new(
            true,
            subject,
            self.fqan.clone(),
            self.delegate,
            self.reject,
            self.nonce.fetch_add(1, Ordering::Relaxed),
            target,
        )
    }

    /// An accepting context for this mechanism's subject.
    #[must_use]
    pub fn acceptor(&self) -> LoopbackGssContext {
        LoopbackGssContext::new(false, &self.subject, None, false, self.reject, 0, None)
    }
}

impl GssMechanism for LoopbackGss {
    fn acquire_credential(&self) -> AuthResult<GsiCredential> {
        if !self.has_credential {
            return Err(AuthError::method("GSI: no proxy certificate found"));
        }
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(GsiCredential {
            subject: self.subject.clone(),
            expires_at: Some(SystemTime::now() + CREDENTIAL_LIFETIME),
            material: Vec::new(),
        })
    }

    fn initiate(
        &self,
        credential: &GsiCredential,
        target: Option<&str>,
        delegate: bool,
    ) -> AuthResult<Box<dyn GssContext>> {
        let mut context = self.initiator(&credential.subject, target);
        context.delegate &= delegate;
        Ok(Box::new(context))
    }

    fn accept(&self, credential: &GsiCredential) -> AuthResult<Box<dyn GssContext>> {
        let mut context = self.acceptor();
        context.subject.clone_from(&credential.subject);
        Ok(Box::new(context))
    }
}

/// One side of a loopback context.
#[derive(Debug)]
pub struct LoopbackGssContext {
    initiator: bool,
    subject: String,
    fqan: Option<String>,
    delegate: bool,
    reject: bool,
    nonce: u64,
    target: Option<String>,
    peer_name: Option<String>,
    peer_fqan: Option<String>,
    delegated: Option<Vec<u8>>,
    cipher: Option<CipherContext>,
    end_time: Option<SystemTime>,
}

impl LoopbackGssContext {
    fn new(
        initiator: bool,
        subject: &str,
        fqan: Option<String>,
        delegate: bool,
        reject: bool,
        nonce: u64,
        target: Option<&str>,
    ) -> Self {
        Self {
            initiator,
            subject: subject.to_owned(),
            fqan,
            delegate,
            reject,
            nonce,
            target: target.map(str::to_owned),
            peer_name: None,
            peer_fqan: None,
            delegated: None,
            cipher: None,
            end_time: None,
        }
    }

    fn complete(&mut self, nonce: u64) -> AuthResult<()> {
        let end_time = SystemTime::now() + CREDENTIAL_LIFETIME;
        self.cipher = Some(CipherContext::new(
            &derive_key("gss", nonce),
            os_entropy(),
            Some(end_time),
        )?);
        self.end_time = Some(end_time);
        Ok(())
    }
}

impl SecurityContext for LoopbackGssContext {
    fn wrap(&self, plaintext: &[u8]) -> AuthResult<Vec<u8>> {
        self.cipher
            .as_ref()
            .ok_or_else(AuthError::not_authenticated)?
            .wrap(plaintext)
    }

    fn unwrap(&self, ciphertext: &[u8]) -> AuthResult<Vec<u8>> {
        self.cipher
            .as_ref()
            .ok_or_else(AuthError::not_authenticated)?
            .unwrap(ciphertext)
    }

    fn end_time(&self) -> Option<SystemTime> {
        self.end_time
    }
}

impl GssContext for LoopbackGssContext {
    fn step(&mut self, input: Option<&[u8]>) -> AuthResult<GssStep> {
        match (self.initiator, input) {
            (true, None) => Ok(GssStep::Continue(
                format!(
                    "GSS-INIT\n{}\n{}\n{}\n{}\n{}",
                    self.subject,
                    self.fqan.as_deref().unwrap_or_default(),
                    u8::from(self.delegate),
                    self.target.as_deref().unwrap_or_default(),
                    self.nonce
                )
                .into_bytes(),
            )),
            (true, Some(reply)) => {
                let parts = fields(reply, "GSS-ACCEPT", 2)?;
                let nonce = parse_nonce(&parts[1])?;
                if nonce != self.nonce {
                    return Err(AuthError::method("reply answers another context"));
                }
                self.peer_name = Some(parts[0].clone());
                self.complete(nonce)?;
                Ok(GssStep::Complete(Vec::new()))
            }
            (false, Some(init)) => {
                if self.reject {
                    return Err(AuthError::method("initiator is not trusted"));
                }
                let parts = fields(init, "GSS-INIT", 5)?;
                let nonce = parse_nonce(&parts[4])?;
                self.peer_name = Some(parts[0].clone());
                self.peer_fqan = non_empty(&parts[1]);
                if parts[2] == "1" {
                    self.delegated = Some(format!("delegated:{}", parts[0]).into_bytes());
                }
                self.complete(nonce)?;
                Ok(GssStep::Complete(
                    format!("GSS-ACCEPT\n{}\n{nonce}", self.subject).into_bytes(),
                ))
            }
            (false, None) => Err(AuthError::protocol("acceptor needs the initiator's token")),
        }
    }

    fn peer_name(&self) -> Option<String> {
        self.peer_name.clone()
    }

    fn peer_attribute(&self) -> Option<String> {
        self.peer_fqan.clone()
    }

    fn take_delegated(&mut self) -> Option<Vec<u8>> {
        self.delegated.take()
    }
}

/// A negotiate package for one `DOMAIN\user` account.
#[derive(Debug)]
pub struct LoopbackSspi {
    user: String,
    domain: String,
    gss: LoopbackGss,
    active: Arc<AtomicUsize>,
    reverts: Arc<AtomicUsize>,
}

impl LoopbackSspi {
    /// Authenticates clients as `domain\user`.
    #[must_use]
    pub fn new(user: impl Into<String>, domain: impl Into<String>) -> Self {
        let user = user.into();
        let domain = domain.into();
        Self {
            gss: LoopbackGss::new(format!("{domain}\\server")),
            user,
            domain,
            active: Arc::new(AtomicUsize::new(0)),
            reverts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Impersonations not yet reverted.
    #[must_use]
    pub fn active_impersonations(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Impersonations reverted so far.
    #[must_use]
    pub fn reverts(&self) -> usize {
        self.reverts.load(Ordering::SeqCst)
    }
}

impl SspiProvider for LoopbackSspi {
    fn client_context(&self, target: Option<&str>) -> AuthResult<Box<dyn GssContext>> {
        let account = format!("{}\\{}", self.domain, self.user);
        Ok(Box::new(self.gss.initiator(&account, target)))
    }

    fn server_context(&self) -> AuthResult<Box<dyn GssContext>> {
        Ok(Box::new(self.gss.acceptor()))
    }

    fn impersonate(&self, context: &dyn GssContext) -> AuthResult<Impersonation> {
        let account = context
            .peer_name()
            .ok_or_else(|| AuthError::method("NTSSPI: context has no client"))?;
        let (domain, user) = account
            .split_once('\\')
            .ok_or_else(|| AuthError::method("NTSSPI: client name has no domain"))?;
        self.active.fetch_add(1, Ordering::SeqCst);
        let active = Arc::clone(&self.active);
        let reverts = Arc::clone(&self.reverts);
        Ok(Impersonation::new(user, domain, move || {
            active.fetch_sub(1, Ordering::SeqCst);
            reverts.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

/// A credential daemon that remembers what it signed.
#[derive(Debug, Default)]
pub struct LoopbackMunge {
    uid: u32,
    gid: u32,
    issued: Mutex<HashMap<String, Vec<u8>>>,
}

impl LoopbackMunge {
    /// Signs every credential as `uid:gid`.
    #[must_use]
    pub fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            issued: Mutex::new(HashMap::new()),
        }
    }
}

impl MungeDaemon for LoopbackMunge {
    fn encode(&self, payload: &[u8]) -> AuthResult<String> {
        let mut issued = self.issued.lock();
        let credential = format!("MUNGE:{}:{}", self.uid, issued.len());
        issued.insert(credential.clone(), payload.to_vec());
        Ok(credential)
    }

    fn decode(&self, credential: &str) -> AuthResult<MungeCredential> {
        let payload = self
            .issued
            .lock()
            .get(credential)
            .cloned()
            .ok_or_else(|| AuthError::method("MUNGE: credential was not issued here"))?;
        Ok(MungeCredential {
            uid: self.uid,
            gid: self.gid,
            payload,
        })
    }
}

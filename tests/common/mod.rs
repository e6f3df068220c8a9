//! Shared helpers for the integration suites.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::task::Poll;
use std::thread;
use std::time::Duration;

use peerauth::crypto::{DetEntropy, PROTOCOL_AES_GCM};
use peerauth::transport::duplex_with_timeout;
use peerauth::{
    AuthConfig, AuthError, AuthResult, Authentication, IdentityMapper, MethodRegistry, Providers,
    Role, SessionKey,
};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use tempfile::TempDir;

pub use peerauth::test_utils::init_test_logging;

/// How long either end of a pair waits on a read.
pub const PAIR_TIMEOUT: Duration = Duration::from_secs(10);

/// One end of a session, ready to run.
pub struct Side {
    pub config: Arc<AuthConfig>,
    pub registry: Arc<MethodRegistry>,
    pub mapper: Arc<IdentityMapper>,
}

impl Side {
    pub fn new(config: AuthConfig, providers: Providers) -> Self {
        let registry = Arc::new(MethodRegistry::from_config(&config, providers));
        let mapper = IdentityMapper::from_config(&config);
        Self {
            config: Arc::new(config),
            registry,
            mapper,
        }
    }

    pub fn with_mapper(mut self, mapper: IdentityMapper) -> Self {
        self.mapper = Arc::new(mapper);
        self
    }

    pub fn session(&self, role: Role, seed: u64) -> Authentication {
        Authentication::new(
            role,
            Arc::clone(&self.config),
            Arc::clone(&self.registry),
            Arc::clone(&self.mapper),
        )
        .with_entropy(Arc::new(DetEntropy::new(seed)))
    }
}

/// A fresh session key from a fixed seed.
pub fn session_key(seed: u64) -> SessionKey {
    SessionKey::generate(&DetEntropy::new(seed), PROTOCOL_AES_GCM, 3600).expect("session key")
}

/// Outcome of running both ends of a session.
pub struct PairOutcome {
    pub client: Authentication,
    pub client_result: AuthResult<()>,
    pub server: Authentication,
    pub server_result: AuthResult<()>,
}

/// Runs the client on its own thread and the server on this one, both
/// blocking.
pub fn run_pair(client: Authentication, server: Authentication) -> PairOutcome {
    run_pair_with(client, server, false)
}

/// Like [`run_pair`], but the server is driven without blocking and
/// polled until it finishes.
pub fn run_pair_nonblocking_server(client: Authentication, server: Authentication) -> PairOutcome {
    run_pair_with(client, server, true)
}

fn run_pair_with(
    mut client: Authentication,
    mut server: Authentication,
    nonblocking_server: bool,
) -> PairOutcome {
    let (mut c, mut s) = duplex_with_timeout(PAIR_TIMEOUT);
    let handle = thread::spawn(move || {
        let result = client.authenticate(&mut c);
        // Keep the link open until the server is done with it.
        (result, client, c)
    });
    let server_result = if nonblocking_server {
        let mut polled = server.authenticate_nonblocking(&mut s);
        loop {
            match polled {
                Poll::Ready(result) => break result,
                Poll::Pending => {
                    thread::sleep(Duration::from_millis(1));
                    polled = server.authenticate_continue(&mut s);
                }
            }
        }
    } else {
        server.authenticate(&mut s)
    };
    drop(s);
    let (client_result, client, _link) = handle.join().expect("client thread");
    PairOutcome {
        client,
        client_result,
        server,
        server_result,
    }
}

/// Maps a blocked poll to an error so tests can `?` through it.
pub fn ready<T>(polled: Poll<AuthResult<T>>) -> AuthResult<T> {
    match polled {
        Poll::Ready(result) => result,
        Poll::Pending => Err(AuthError::protocol("still pending")),
    }
}

/// A scratch directory of self-signed certificates.
pub struct Pki {
    dir: TempDir,
}

impl Pki {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Writes a self-signed certificate for `cn`, valid for `localhost`,
    /// and returns (cert, key).
    pub fn issue(&self, cn: &str) -> (PathBuf, PathBuf) {
        let mut params = CertificateParams::new(vec!["localhost".to_owned()]).expect("params");
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

    /// Concatenates `certs` into one trust bundle.
    pub fn bundle(&self, certs: &[&Path]) -> PathBuf {
        let mut pem = String::new();
        for cert in certs {
            pem.push_str(&std::fs::read_to_string(cert).expect("read cert"));
        }
        let path = self.dir.path().join("ca.pem");
        std::fs::write(&path, pem).expect("write bundle");
        path
    }
}

//! Authentication configuration.
//!
//! [`AuthConfig`] is plain data: it can be built in code with the `with_*`
//! setters or deserialized from TOML (feature `config-file`). Nothing here
//! touches the filesystem except [`AuthConfig::from_file`]; certificate and
//! key paths are only opened when the owning method initialises.
//!
//! ```toml
//! methods = ["SSL", "KERBEROS", "CLAIMTOBE"]
//! uid_domain = "example.org"
//! timeout_secs = 20
//! map_file = "/etc/peerauth/certificate_mapfile"
//!
//! [claim_to_be]
//! include_domain = true
//!
//! [ssl]
//! server_cert = "/etc/peerauth/host.crt"
//! server_key = "/etc/peerauth/host.key"
//! ca_file = "/etc/peerauth/ca.crt"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AuthError, AuthResult};
use crate::method::{AuthMethod, MethodSet};

/// Default domain for names that carry none.
pub const DEFAULT_UID_DOMAIN: &str = "localdomain";

/// Top-level configuration consumed by the session and the method registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Method preference list, most preferred first.
    pub methods: Vec<String>,
    /// Methods never advertised, even when available.
    pub disabled_methods: Vec<String>,
    /// Overall deadline in seconds; zero disables it.
    pub timeout_secs: u64,
    /// Domain appended to canonical names without one.
    pub uid_domain: String,
    /// Skip the authenticated-host versus transport-peer comparison.
    pub disable_address_check: bool,
    /// Run the session-key exchange after a method succeeds.
    pub exchange_keys: bool,
    /// Canonicalization rule file.
    pub map_file: Option<PathBuf>,
    /// Plain principals in the rule file are literal keys; only `/.../` is a regex.
    pub map_assume_hash: bool,
    /// Claim-to-be options.
    pub claim_to_be: ClaimToBeConfig,
    /// Filesystem rendezvous options.
    pub fs: FsConfig,
    /// Kerberos options.
    pub kerberos: KerberosConfig,
    /// TLS options.
    pub ssl: SslConfig,
    /// Bearer token options.
    pub tokens: TokenConfig,
    /// X.509 / GSI options.
    pub gsi: GsiConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            methods: AuthMethod::ALL.iter().map(|m| m.name().to_owned()).collect(),
            disabled_methods: Vec::new(),
            timeout_secs: 0,
            uid_domain: DEFAULT_UID_DOMAIN.to_owned(),
            disable_address_check: false,
            exchange_keys: true,
            map_file: None,
            map_assume_hash: false,
            claim_to_be: ClaimToBeConfig::default(),
            fs: FsConfig::default(),
            kerberos: KerberosConfig::default(),
            ssl: SslConfig::default(),
            tokens: TokenConfig::default(),
            gsi: GsiConfig::default(),
        }
    }
}

/// Claim-to-be options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaimToBeConfig {
    /// Name to claim instead of the local OS user.
    pub user: Option<String>,
    /// Send and accept `user@domain` instead of a bare user.
    pub include_domain: bool,
}

/// Filesystem rendezvous options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    /// Directory for FS rendezvous paths.
    pub local_dir: PathBuf,
    /// Shared directory for FS_REMOTE rendezvous paths.
    pub remote_dir: Option<PathBuf>,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            local_dir: std::env::temp_dir(),
            remote_dir: None,
        }
    }
}

/// Kerberos options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KerberosConfig {
    /// Keytab for daemon credentials.
    pub keytab: Option<PathBuf>,
    /// Service principal name, `host` if unset.
    pub service: Option<String>,
    /// `REALM = DOMAIN` mapping file.
    pub realm_map_file: Option<PathBuf>,
    /// Use the interactive ticket cache instead of the keytab.
    pub use_ticket_cache: bool,
    /// Account given to peers authenticating as the service principal,
    /// `condor` if unset.
    pub server_user: Option<String>,
}

/// TLS options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SslConfig {
    /// Server certificate chain (PEM).
    pub server_cert: Option<PathBuf>,
    /// Server private key (PEM).
    pub server_key: Option<PathBuf>,
    /// Client certificate chain (PEM).
    pub client_cert: Option<PathBuf>,
    /// Client private key (PEM).
    pub client_key: Option<PathBuf>,
    /// Trust store (PEM bundle).
    pub ca_file: Option<PathBuf>,
    /// Cipher suite names to allow; empty keeps the provider defaults.
    pub cipher_suites: Vec<String>,
    /// Name the client verifies the server certificate against.
    pub server_name: Option<String>,
    /// Retry token mapping with a trailing `/` on the issuer.
    pub allow_extra_slash: bool,
}

/// One trusted token issuer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustedIssuer {
    /// Expected `iss` claim.
    pub issuer: String,
    /// Accepted `aud` values; empty disables the audience check.
    pub audiences: Vec<String>,
    /// JWS algorithm name, e.g. `RS256` or `HS256`.
    pub algorithm: String,
    /// PEM public key for asymmetric algorithms.
    pub key_file: Option<PathBuf>,
    /// Shared secret for HMAC algorithms.
    pub secret: Option<String>,
}

/// Bearer token options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Issuers the server accepts.
    pub trusted_issuers: Vec<TrustedIssuer>,
    /// Token the client presents.
    pub token: Option<String>,
    /// File holding the token the client presents.
    pub token_file: Option<PathBuf>,
}

/// X.509 / GSI options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GsiConfig {
    /// Delegate the client credential to the server.
    pub delegate: bool,
    /// Subject name the client requires of the server.
    pub server_name: Option<String>,
    /// Map `DN,FQAN` before falling back to the bare DN.
    pub use_fqan: bool,
}

impl AuthConfig {
    /// Sets the method preference list.
    #[must_use]
    pub fn with_methods(mut self, methods: &[AuthMethod]) -> Self {
        self.methods = methods.iter().map(|m| m.name().to_owned()).collect();
        self
    }

    /// Sets the overall deadline, rounded up to whole seconds.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
        self
    }

    /// Sets the default domain.
    #[must_use]
    pub fn with_uid_domain(mut self, domain: impl Into<String>) -> Self {
        self.uid_domain = domain.into();
        self
    }

    /// Sets the rule file.
    #[must_use]
    pub fn with_map_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.map_file = Some(path.into());
        self
    }

    /// Disables the address check.
    #[must_use]
    pub fn with_address_check_disabled(mut self, disabled: bool) -> Self {
        self.disable_address_check = disabled;
        self
    }

    /// Parsed preference list with disabled methods removed.
    pub fn method_preference(&self) -> AuthResult<MethodSet> {
        let disabled = MethodSet::parse_list(&self.disabled_methods.join(","))?;
        let wanted = MethodSet::parse_list(&self.methods.join(","))?;
        Ok(wanted.filtered(|m| !disabled.contains(m)))
    }

    /// Overall deadline, if any.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    /// Parses a TOML document.
    #[cfg(feature = "config-file")]
    pub fn from_toml_str(doc: &str) -> AuthResult<Self> {
        toml::from_str(doc).map_err(|e| AuthError::config(format!("invalid config: {e}")))
    }

    /// Reads and parses a TOML file.
    #[cfg(feature = "config-file")]
    pub fn from_file(path: &Path) -> AuthResult<Self> {
        let doc = std::fs::read_to_string(path)
            .map_err(|e| AuthError::config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&doc)
    }

    /// Enables or disables the session-key exchange.
    #[must_use]
    pub fn with_key_exchange(mut self, enabled: bool) -> Self {
        self.exchange_keys = enabled;
        self
    }

    /// Rejects values that can never work.
    pub fn validate(&self) -> AuthResult<()> {
        self.method_preference()?;
        if self.uid_domain.is_empty() {
            return Err(AuthError::config("uid_domain must not be empty"));
        }
        if self.ssl.server_cert.is_some() != self.ssl.server_key.is_some() {
            return Err(AuthError::config(
                "ssl.server_cert and ssl.server_key must be set together",
            ));
        }
        if self.ssl.client_cert.is_some() != self.ssl.client_key.is_some() {
            return Err(AuthError::config(
                "ssl.client_cert and ssl.client_key must be set together",
            ));
        }
        for issuer in &self.tokens.trusted_issuers {
            if issuer.issuer.is_empty() {
                return Err(AuthError::config("trusted issuer without an issuer name"));
            }
            if issuer.key_file.is_none() && issuer.secret.is_none() {
                return Err(AuthError::config(format!(
                    "trusted issuer {} has neither key_file nor secret",
                    issuer.issuer
                )));
            }
        }
        Ok(())
    }
}

/// Resolves `path` against the directory of `base` unless it is absolute.
#[must_use]
pub(crate) fn resolve_relative(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    base.parent()
        .map_or_else(|| path.to_path_buf(), |dir| dir.join(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_offer_every_method() {
        let config = AuthConfig::default();
        let pref = config.method_preference().expect("default list parses");
        assert_eq!(pref.len(), AuthMethod::ALL.len());
        assert_eq!(config.timeout(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn sub_second_timeouts_round_up() {
        let config = AuthConfig::default().with_timeout(Duration::from_millis(500));
        assert_eq!(config.timeout(), Some(Duration::from_secs(1)));
        let config = AuthConfig::default().with_timeout(Duration::from_millis(2001));
        assert_eq!(config.timeout(), Some(Duration::from_secs(3)));
        let config = AuthConfig::default().with_timeout(Duration::from_secs(4));
        assert_eq!(config.timeout(), Some(Duration::from_secs(4)));
    }

    #[test]
    fn disabled_methods_are_removed() {
        let mut config = AuthConfig::default().with_methods(&[
            AuthMethod::Ssl,
            AuthMethod::Kerberos,
            AuthMethod::ClaimToBe,
        ]);
        config.disabled_methods = vec!["kerberos".into()];
        let pref = config.method_preference().expect("parses");
        assert_eq!(
            pref.iter().collect::<Vec<_>>(),
            vec![AuthMethod::Ssl, AuthMethod::ClaimToBe]
        );
    }

    #[test]
    fn unknown_method_is_configuration_error() {
        let mut config = AuthConfig::default();
        config.methods.push("CARRIER_PIGEON".into());
        let err = config.validate().expect_err("must reject");
        assert_eq!(err.kind(), crate::error::AuthErrorKind::Configuration);
    }

    #[test]
    fn half_configured_tls_pair_is_rejected() {
        let mut config = AuthConfig::default();
        config.ssl.server_cert = Some("/tmp/host.crt".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn relative_paths_follow_base() {
        let resolved = resolve_relative(Path::new("/etc/auth/mapfile"), Path::new("extra.map"));
        assert_eq!(resolved, PathBuf::from("/etc/auth/extra.map"));
        let absolute = resolve_relative(Path::new("/etc/auth/mapfile"), Path::new("/x"));
        assert_eq!(absolute, PathBuf::from("/x"));
    }

    #[cfg(feature = "config-file")]
    #[test]
    fn toml_round_trip() {
        let config = AuthConfig::from_toml_str(
            r#"
            methods = ["claimtobe", "anonymous"]
            uid_domain = "example.org"
            timeout_secs = 5

            [claim_to_be]
            include_domain = true
            "#,
        )
        .expect("parses");
        assert_eq!(config.uid_domain, "example.org");
        assert!(config.claim_to_be.include_domain);
        assert_eq!(config.timeout(), Some(Duration::from_secs(5)));
        assert!(!config.map_assume_hash);
    }
}

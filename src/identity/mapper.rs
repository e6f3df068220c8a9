//! The canonicalization service.
//!
//! One [`IdentityMapper`] is built per process and shared by handle with
//! every session. It loads its rule file on first use and keeps it until
//! [`reconfig`](IdentityMapper::reconfig) is called.

use std::path::PathBuf;
use std::sync::Arc;

use super::lazy::LazyFile;
use super::mapfile::MapFile;
use super::{AuthenticatedIdentity, split_canonical_name};
use crate::config::AuthConfig;
use crate::method::AuthMethod;

/// Result of canonicalizing one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Canonicalized {
    /// Canonical user.
    pub user: String,
    /// Canonical domain.
    pub domain: String,
    /// The key that matched.
    pub matched: String,
}

/// Maps raw principals to canonical `user@domain` names.
#[derive(Debug)]
pub struct IdentityMapper {
    file: LazyFile<MapFile>,
    assume_hash: bool,
}

impl IdentityMapper {
    /// A mapper with no rule file; [`map`](Self::map) always misses.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            file: LazyFile::new(None),
            assume_hash: true,
        }
    }

    /// A mapper over the rule file at `path`, loaded on first use.
    #[must_use]
    pub fn new(path: Option<PathBuf>, assume_hash: bool) -> Self {
        Self {
            file: LazyFile::new(path),
            assume_hash,
        }
    }

    /// A mapper built from configuration.
    #[must_use]
    pub fn from_config(config: &AuthConfig) -> Arc<Self> {
        Arc::new(Self::new(config.map_file.clone(), config.map_assume_hash))
    }

    /// A mapper over already parsed rules.
    #[must_use]
    pub fn with_rules(rules: MapFile) -> Self {
        Self {
            file: LazyFile::preloaded(rules),
            assume_hash: true,
        }
    }

    /// Returns `true` if there are rules to consult.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.file.is_configured()
    }

    fn rules(&self) -> Option<Arc<MapFile>> {
        let assume_hash = self.assume_hash;
        self.file.get_or_load(|path| MapFile::load(path, assume_hash))
    }

    /// Maps one principal.
    #[must_use]
    pub fn map(&self, method: &str, principal: &str) -> Option<String> {
        let rules = self.rules()?;
        rules.map(method, principal)
    }

    /// Maps an identity, trying its alternate keys before the raw principal.
    ///
    /// `uid_domain` fills in the domain for mapped names without an `@`.
    /// With `allow_extra_slash`, a miss on a token's `issuer,subject` key is
    /// retried with a `/` appended to the issuer.
    #[must_use]
    pub fn canonicalize(
        &self,
        identity: &AuthenticatedIdentity,
        uid_domain: &str,
        allow_extra_slash: bool,
    ) -> Option<Canonicalized> {
        let rules = self.rules()?;
        let slash_retry =
            allow_extra_slash && identity.method_name == AuthMethod::SciTokens.name();
        for key in identity.mapping_keys() {
            let hit = rules.map(&identity.method_name, key).or_else(|| {
                if !slash_retry {
                    return None;
                }
                let (issuer, subject) = key.split_once(',')?;
                rules.map(&identity.method_name, &format!("{issuer}/,{subject}"))
            });
            if let Some(canonical) = hit {
                let (user, domain) = split_canonical_name(&canonical, uid_domain);
                tracing::debug!(
                    method = %identity.method_name,
                    principal = key,
                    canonical = %canonical,
                    "mapped identity"
                );
                return Some(Canonicalized {
                    user,
                    domain,
                    matched: key.to_owned(),
                });
            }
        }
        tracing::debug!(
            method = %identity.method_name,
            principal = ?identity.raw_principal,
            "no mapping rule matched"
        );
        None
    }

    /// Forgets the loaded rules; the next lookup reads the file again.
    /// Rules given to [`with_rules`](Self::with_rules) are kept.
    pub fn reconfig(&self) {
        tracing::info!("canonicalization map invalidated");
        self.file.invalidate();
    }

    /// Switches to another rule file.
    pub fn reconfig_with(&self, path: Option<PathBuf>) {
        tracing::info!(path = ?path, "canonicalization map path changed");
        self.file.set_path(path);
    }

    /// Returns `true` once a load was attempted since the last reconfig.
    #[must_use]
    pub fn load_attempted(&self) -> bool {
        self.file.attempted()
    }
}

impl Default for IdentityMapper {
    fn default() -> Self {
        Self::disabled()
    }
}

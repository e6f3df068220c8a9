//! Kerberos realm to domain mapping.
//!
//! The map file holds `REALM = DOMAIN` lines; `#` starts a comment. When a
//! map is configured and loads, a realm it does not list is refused. When
//! no map is configured, or it cannot be read, the realm itself is the
//! domain.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::lazy::LazyFile;
use crate::error::{AuthError, AuthResult};

/// Parsed realm table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RealmMap {
    entries: HashMap<String, String>,
}

impl RealmMap {
    /// Parses `REALM = DOMAIN` lines, skipping malformed ones.
    #[must_use]
    pub fn parse_str(text: &str) -> Self {
        let mut entries = HashMap::new();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let parsed = line
                .split_once('=')
                .map(|(realm, domain)| (realm.trim(), domain.trim()))
                .filter(|(realm, domain)| {
                    !realm.is_empty() && !domain.is_empty() && !domain.contains(char::is_whitespace)
                });
            match parsed {
                Some((realm, domain)) => {
                    entries
                        .entry(realm.to_owned())
                        .or_insert_with(|| domain.to_owned());
                }
                None => tracing::warn!(line = lineno + 1, "skipping malformed realm map line"),
            }
        }
        Self { entries }
    }

    /// Reads a realm map file.
    pub fn load(path: &Path) -> AuthResult<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| AuthError::config(format!("cannot read {}: {e}", path.display())))?;
        let map = Self::parse_str(&text);
        tracing::info!(path = %path.display(), realms = map.entries.len(), "loaded realm map");
        Ok(map)
    }

    /// Domain for `realm`, if listed.
    #[must_use]
    pub fn get(&self, realm: &str) -> Option<&str> {
        self.entries.get(realm).map(String::as_str)
    }

    /// Number of realms listed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no realm is listed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Lazily loaded realm map with the same reload rules as the identity map.
#[derive(Debug)]
pub struct RealmMapper {
    file: LazyFile<RealmMap>,
}

impl RealmMapper {
    /// A mapper for the file at `path`.
    #[must_use]
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            file: LazyFile::new(path),
        }
    }

    /// A mapper over an already parsed table.
    #[must_use]
    pub fn with_map(map: RealmMap) -> Self {
        Self {
            file: LazyFile::preloaded(map),
        }
    }

    /// Domain for `realm`.
    pub fn domain_for(&self, realm: &str) -> AuthResult<String> {
        match self.file.get_or_load(RealmMap::load) {
            Some(map) => map.get(realm).map(str::to_owned).ok_or_else(|| {
                AuthError::method(format!("realm {realm} is not listed in the realm map"))
            }),
            None => Ok(realm.to_owned()),
        }
    }

    /// Forces a reload on next use.
    pub fn reconfig(&self) {
        self.file.invalidate();
    }
}

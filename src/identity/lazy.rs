//! Load-once file caches with explicit invalidation.
//!
//! The first lookup loads the file and records that an attempt was made,
//! whether or not it succeeded, so an absent or broken file is not re-read
//! on every call. [`LazyFile::invalidate`] clears the attempt and the next
//! lookup loads again; a cache with no path keeps what it holds. Readers hold a shared `Arc` snapshot: a reload never
//! tears a lookup in progress.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::AuthResult;

#[derive(Debug)]
struct LazyState<T> {
    attempted: bool,
    value: Option<Arc<T>>,
}

impl<T> Default for LazyState<T> {
    fn default() -> Self {
        Self {
            attempted: false,
            value: None,
        }
    }
}

/// A file-backed value loaded on first use.
#[derive(Debug)]
pub struct LazyFile<T> {
    path: RwLock<Option<PathBuf>>,
    state: RwLock<LazyState<T>>,
}

impl<T> LazyFile<T> {
    /// Creates a cache for `path`; `None` means nothing to load.
    #[must_use]
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path: RwLock::new(path),
            state: RwLock::new(LazyState::default()),
        }
    }

    /// Creates a cache already holding `value`.
    #[must_use]
    pub fn preloaded(value: T) -> Self {
        Self {
            path: RwLock::new(None),
            state: RwLock::new(LazyState {
                attempted: true,
                value: Some(Arc::new(value)),
            }),
        }
    }

    /// Returns the value, loading it with `load` if no attempt was made yet.
    pub fn get_or_load(&self, load: impl FnOnce(&Path) -> AuthResult<T>) -> Option<Arc<T>> {
        {
            let state = self.state.read();
            if state.attempted {
                return state.value.clone();
            }
        }
        let mut state = self.state.write();
        if state.attempted {
            return state.value.clone();
        }
        state.attempted = true;
        let path = self.path.read().clone();
        state.value = path.and_then(|p| match load(&p) {
            Ok(value) => Some(Arc::new(value)),
            Err(err) => {
                tracing::warn!(path = %p.display(), error = %err, "failed to load file");
                None
            }
        });
        state.value.clone()
    }

    /// Forgets the loaded value; the next lookup loads again.
    ///
    /// Without a path there is nothing to reload from, so a value given to
    /// [`preloaded`](Self::preloaded) or [`replace`](Self::replace) stays.
    pub fn invalidate(&self) {
        if self.path.read().is_none() {
            return;
        }
        *self.state.write() = LazyState::default();
    }

    /// Points the cache at another file and drops whatever it held.
    pub fn set_path(&self, path: Option<PathBuf>) {
        *self.path.write() = path;
        *self.state.write() = LazyState::default();
    }

    /// Replaces the value directly.
    pub fn replace(&self, value: T) {
        *self.state.write() = LazyState {
            attempted: true,
            value: Some(Arc::new(value)),
        };
    }

    /// The configured path.
    #[must_use]
    pub fn path(&self) -> Option<PathBuf> {
        self.path.read().clone()
    }

    /// Returns `true` once a load was attempted since the last invalidation.
    #[must_use]
    pub fn attempted(&self) -> bool {
        self.state.read().attempted
    }

    /// Returns `true` if a path is set or a value is held.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.path.read().is_some() || self.state.read().value.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuthError;
    use std::cell::Cell;

    #[test]
    fn failed_load_is_not_retried_until_invalidated() {
        let cache: LazyFile<String> = LazyFile::new(Some(PathBuf::from("/nonexistent")));
        let calls = Cell::new(0);
        let load = |_: &Path| {
            calls.set(calls.get() + 1);
            Err(AuthError::config("missing"))
        };
        assert!(cache.get_or_load(load).is_none());
        assert!(cache.get_or_load(load).is_none());
        assert_eq!(calls.get(), 1);
        assert!(cache.attempted());

        cache.invalidate();
        assert!(!cache.attempted());
        assert!(cache.get_or_load(load).is_none());
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn no_path_loads_nothing() {
        let cache: LazyFile<u32> = LazyFile::new(None);
        assert!(cache.get_or_load(|_| Ok(1)).is_none());
        assert!(!cache.is_configured());
        cache.replace(5);
        assert_eq!(cache.get_or_load(|_| Ok(1)).as_deref(), Some(&5));
    }

    #[test]
    fn invalidate_keeps_values_without_a_path() {
        let cache = LazyFile::preloaded(7u32);
        cache.invalidate();
        assert!(cache.attempted());
        assert_eq!(cache.get_or_load(|_| Ok(1)).as_deref(), Some(&7));

        cache.set_path(None);
        assert!(cache.get_or_load(|_| Ok(1)).is_none());
    }

    #[test]
    fn set_path_forces_reload() {
        let cache: LazyFile<String> = LazyFile::new(Some(PathBuf::from("a")));
        let first = cache.get_or_load(|p| Ok(p.display().to_string()));
        assert_eq!(first.as_deref().map(String::as_str), Some("a"));
        cache.set_path(Some(PathBuf::from("b")));
        let second = cache.get_or_load(|p| Ok(p.display().to_string()));
        assert_eq!(second.as_deref().map(String::as_str), Some("b"));
    }
}

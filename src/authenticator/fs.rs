//! Filesystem rendezvous.
//!
//! The server names a fresh path in a directory both sides can see; the
//! client proves its identity by creating a private directory there. The
//! server then `lstat`s the path and accepts the uid that owns it, but only
//! if the marker cannot have been planted by someone else:
//!
//! - it is not a symlink,
//! - it is a directory,
//! - it has no extra hard links (a fresh directory has one or two),
//! - its permission bits are exactly `0700`.
//!
//! `FS_REMOTE` uses a shared directory instead and writes and removes a
//! scratch file there before the `lstat`, so a network filesystem's
//! attribute cache sees the client's directory.
//!
//! Wire: server `{path}` (empty on failure), client `{status}` (0 or -1),
//! server `{status}`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::task::Poll;

use super::{Authenticator, MethodContext, UserDirectory, wire};
use crate::continuation::DriveMode;
use crate::crypto::EntropySource;
use crate::error::{AuthError, AuthResult};
use crate::identity::PeerIdentity;
use crate::method::AuthMethod;
use crate::transport::{Role, TransportChannel};

/// Largest link count a freshly created directory may have.
pub const MAX_MARKER_LINKS: u64 = 2;

/// Required permission bits of the marker.
pub const MARKER_MODE: u32 = 0o700;

/// The attributes of a marker that decide whether it is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkerStat {
    /// `lstat` saw a symlink.
    pub is_symlink: bool,
    /// The path is a directory.
    pub is_dir: bool,
    /// Hard link count.
    pub nlink: u64,
    /// `st_mode`.
    pub mode: u32,
    /// Owner.
    pub uid: u32,
}

impl MarkerStat {
    /// Reads the attributes of `path` without following symlinks.
    #[cfg(unix)]
    pub fn lstat(path: &Path) -> std::io::Result<Self> {
        use std::os::unix::fs::MetadataExt;

        let meta = std::fs::symlink_metadata(path)?;
        Ok(Self {
            is_symlink: meta.file_type().is_symlink(),
            is_dir: meta.is_dir(),
            nlink: meta.nlink(),
            mode: meta.mode(),
            uid: meta.uid(),
        })
    }
}

/// Checks a marker and returns its owner.
pub fn validate_marker(stat: &MarkerStat) -> AuthResult<u32> {
    if stat.is_symlink {
        return Err(AuthError::method("marker is a symlink"));
    }
    if !stat.is_dir {
        return Err(AuthError::method("marker is not a directory"));
    }
    if stat.nlink > MAX_MARKER_LINKS {
        return Err(AuthError::method(format!(
            "marker has {} hard links",
            stat.nlink
        )));
    }
    if stat.mode & 0o7777 != MARKER_MODE {
        return Err(AuthError::method(format!(
            "marker mode is {:o}, expected {MARKER_MODE:o}",
            stat.mode & 0o7777
        )));
    }
    Ok(stat.uid)
}

/// The `FS` and `FS_REMOTE` methods.
pub struct FsAuthenticator {
    role: Role,
    remote: bool,
    dir: PathBuf,
    users: Arc<dyn UserDirectory>,
    entropy: Arc<dyn EntropySource>,
    domain: Option<String>,
    peer: PeerIdentity,
    valid: bool,
}

impl core::fmt::Debug for FsAuthenticator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FsAuthenticator")
            .field("role", &self.role)
            .field("remote", &self.remote)
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl FsAuthenticator {
    /// Creates the method rendezvousing in `dir`.
    #[must_use]
    pub fn new(
        role: Role,
        remote: bool,
        dir: PathBuf,
        users: Arc<dyn UserDirectory>,
        entropy: Arc<dyn EntropySource>,
    ) -> Self {
        Self {
            role,
            remote,
            dir,
            users,
            entropy,
            domain: None,
            peer: PeerIdentity::default(),
            valid: false,
        }
    }

    /// Domain given to accepted accounts.
    #[must_use]
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    fn method_id(&self) -> AuthMethod {
        if self.remote {
            AuthMethod::FilesystemRemote
        } else {
            AuthMethod::Filesystem
        }
    }

    fn fresh_path(&self) -> AuthResult<PathBuf> {
        for _ in 0..8 {
            let mut nonce = [0u8; 8];
            self.entropy.fill_bytes(&mut nonce)?;
            let name = hex::encode(nonce);
            let candidate = self.dir.join(format!("FS_{name}"));
            if std::fs::symlink_metadata(&candidate).is_err() {
                return Ok(candidate);
            }
        }
        Err(AuthError::method(format!(
            "cannot pick an unused rendezvous name in {}",
            self.dir.display()
        )))
    }

    fn run_client(&mut self, chan: &mut dyn TransportChannel) -> AuthResult<()> {
        let method = self.method_id();
        chan.decode();
        let path = chan.get_str().map_err(wire(method, "reading path"))?;
        chan.end_of_message().map_err(wire(method, "reading path"))?;

        let status = if path.is_empty() {
            tracing::debug!(method = %method, "server sent no rendezvous path");
            -1
        } else {
            match create_marker(Path::new(&path)) {
                Ok(()) => 0,
                Err(err) => {
                    tracing::debug!(method = %method, path = %path, error = %err, "cannot create marker");
                    -1
                }
            }
        };
        chan.send_ints(&[status]).map_err(wire(method, "sending status"))?;

        let verdict = chan.recv_int().map_err(wire(method, "reading verdict"))?;
        if status == 0 && verdict == 0 {
            self.valid = true;
            Ok(())
        } else {
            Err(AuthError::method(format!(
                "{method}: rendezvous at '{path}' was rejected"
            )))
        }
    }

    fn run_server(&mut self, chan: &mut dyn TransportChannel) -> AuthResult<()> {
        let method = self.method_id();
        let path = self.fresh_path();
        let announced = path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        chan.encode();
        chan.put_str(&announced).map_err(wire(method, "sending path"))?;
        chan.end_of_message().map_err(wire(method, "sending path"))?;

        let status = chan.recv_int().map_err(wire(method, "reading status"))?;
        let outcome = match path {
            Ok(path) if status == 0 => {
                let checked = self.check_marker(&path);
                if let Err(err) = std::fs::remove_dir(&path) {
                    tracing::debug!(path = %path.display(), error = %err, "cannot remove marker");
                }
                checked
            }
            Ok(_) => Err(AuthError::method(format!(
                "{method}: client could not create the marker"
            ))),
            Err(err) => Err(err),
        };
        let verdict = if outcome.is_ok() { 0 } else { -1 };
        chan.send_ints(&[verdict]).map_err(wire(method, "sending verdict"))?;

        let user = outcome?;
        tracing::debug!(method = %method, user = %user, "filesystem rendezvous accepted");
        self.peer.set_authenticated_name(user.clone());
        self.peer.set_remote_user(user);
        if let Some(domain) = &self.domain {
            self.peer.set_remote_domain(domain.clone());
        }
        self.valid = true;
        Ok(())
    }

    #[cfg(unix)]
    fn check_marker(&self, path: &Path) -> AuthResult<String> {
        if self.remote {
            // Forces a network filesystem to refresh the directory's attributes.
            match tempfile::NamedTempFile::new_in(&self.dir) {
                Ok(scratch) => drop(scratch),
                Err(err) => tracing::debug!(error = %err, "scratch file for cache sync failed"),
            }
        }
        let stat = MarkerStat::lstat(path)
            .map_err(|e| AuthError::method(format!("cannot stat {}: {e}", path.display())))?;
        let uid = validate_marker(&stat)
            .map_err(|e| AuthError::method(format!("{}: {e}", self.method_id())))?;
        self.users
            .user_name(uid)
            .ok_or_else(|| AuthError::method(format!("no account for uid {uid}")))
    }

    #[cfg(not(unix))]
    fn check_marker(&self, _path: &Path) -> AuthResult<String> {
        Err(AuthError::method("filesystem rendezvous needs a unix host"))
    }
}

#[cfg(unix)]
fn create_marker(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::{DirBuilderExt, PermissionsExt};

    std::fs::DirBuilder::new().mode(MARKER_MODE).create(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(MARKER_MODE))
}

#[cfg(not(unix))]
fn create_marker(_path: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "filesystem rendezvous needs a unix host",
    ))
}

impl Authenticator for FsAuthenticator {
    fn method(&self) -> AuthMethod {
        self.method_id()
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
        self.valid
    }

    fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    fn peer_mut(&mut self) -> &mut PeerIdentity {
        &mut self.peer
    }
}

pub(crate) fn create_local(ctx: &MethodContext) -> AuthResult<Box<dyn Authenticator>> {
    Ok(Box::new(FsAuthenticator::new(
        ctx.role,
        false,
        ctx.config.fs.local_dir.clone(),
        Arc::clone(&ctx.providers.users),
        Arc::clone(&ctx.entropy),
    )
    .with_domain(ctx.config.uid_domain.clone())))
}

pub(crate) fn create_remote(ctx: &MethodContext) -> AuthResult<Box<dyn Authenticator>> {
    let dir = ctx
        .config
        .fs
        .remote_dir
        .clone()
        .ok_or_else(|| AuthError::config("FS_REMOTE needs fs.remote_dir"))?;
    Ok(Box::new(FsAuthenticator::new(
        ctx.role,
        true,
        dir,
        Arc::clone(&ctx.providers.users),
        Arc::clone(&ctx.entropy),
    )
    .with_domain(ctx.config.uid_domain.clone())))
}

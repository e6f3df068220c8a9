use peerauth::authenticator::fs::{MARKER_MODE, validate_marker};
use peerauth::authenticator::MarkerStat;

fn trusted() -> MarkerStat {
    MarkerStat {
        is_symlink: false,
        is_dir: true,
        nlink: 2,
        mode: 0o040_000 | MARKER_MODE,
        uid: 1000,
    }
}

#[test]
fn well_formed_marker_yields_owner() {
    assert_eq!(validate_marker(&trusted()).expect("trusted"), 1000);
}

#[test]
fn spoofed_markers_are_refused() {
    let cases = [
        ("symlink", MarkerStat { is_symlink: true, ..trusted() }),
        ("plain file", MarkerStat { is_dir: false, ..trusted() }),
        ("extra hard links", MarkerStat { nlink: 3, ..trusted() }),
        ("group readable", MarkerStat { mode: 0o040_750, ..trusted() }),
        ("setgid", MarkerStat { mode: 0o042_700, ..trusted() }),
    ];
    for (label, stat) in cases {
        let err = validate_marker(&stat).expect_err(label);
        assert!(err.is_method_failure(), "{label}: {err}");
    }
}

#[cfg(unix)]
mod on_disk {
    use super::*;
    use crate::common::{Side, run_pair};
    use peerauth::authenticator::StaticUsers;
    use peerauth::{AuthConfig, AuthMethod, Providers, Role};
    use std::os::unix::fs::{MetadataExt, PermissionsExt, symlink};
    use std::sync::Arc;

    #[test]
    fn lstat_sees_through_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = dir.path().join("marker");
        std::fs::create_dir(&marker).expect("mkdir");
        std::fs::set_permissions(&marker, std::fs::Permissions::from_mode(0o700)).expect("chmod");
        let owner = std::fs::metadata(&marker).expect("stat").uid();
        assert_eq!(
            validate_marker(&MarkerStat::lstat(&marker).expect("lstat")).expect("trusted"),
            owner
        );

        let link = dir.path().join("link");
        symlink(&marker, &link).expect("symlink");
        let stat = MarkerStat::lstat(&link).expect("lstat link");
        assert!(stat.is_symlink);
        assert!(validate_marker(&stat).is_err());

        std::fs::set_permissions(&marker, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        assert!(validate_marker(&MarkerStat::lstat(&marker).expect("lstat")).is_err());
    }

    #[test]
    fn remote_rendezvous_uses_shared_directory() {
        let local = tempfile::tempdir().expect("local");
        let shared = tempfile::tempdir().expect("shared");
        let uid = std::fs::metadata(shared.path()).expect("stat").uid();

        let mut config = AuthConfig::default()
            .with_methods(&[AuthMethod::FilesystemRemote])
            .with_uid_domain("example.org");
        config.fs.local_dir = local.path().to_path_buf();
        config.fs.remote_dir = Some(shared.path().to_path_buf());
        let users = Arc::new(StaticUsers::new().with_user(uid, "remote"));
        let side = Side::new(config, Providers::default().with_users(users));
        assert!(side.registry.is_available(AuthMethod::FilesystemRemote));

        let out = run_pair(side.session(Role::Client, 1), side.session(Role::Server, 2));
        out.server_result.expect("server");
        out.client_result.expect("client");
        assert_eq!(out.server.method_used(), Some(AuthMethod::FilesystemRemote));
        assert_eq!(out.server.fully_qualified_user(), Some("remote@example.org"));
    }

    #[test]
    fn unknown_owner_fails_the_method() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = AuthConfig::default().with_methods(&[AuthMethod::Filesystem]);
        config.fs.local_dir = dir.path().to_path_buf();
        let side = Side::new(config, Providers::default().with_users(Arc::new(StaticUsers::new())));

        let out = run_pair(side.session(Role::Client, 1), side.session(Role::Server, 2));
        assert!(out.server_result.is_err());
        assert!(out.client_result.is_err());
        assert!(out.server.error_stack().has_stage("FS"));
    }
}

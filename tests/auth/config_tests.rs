use crate::common::{Side, run_pair};
use peerauth::{AuthConfig, AuthMethod, IdentityMapper, Providers, Role};
use std::fs;

#[test]
fn file_config_drives_a_session() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join("mapfile"), "CLAIMTOBE operator admin@ops.example.org\n")
        .expect("write mapfile");
    let path = dir.path().join("auth.toml");
    fs::write(
        &path,
        format!(
            r#"
            methods = ["CLAIMTOBE", "ANONYMOUS"]
            disabled_methods = ["anonymous"]
            uid_domain = "example.org"
            exchange_keys = false
            map_file = "{}"

            [claim_to_be]
            user = "operator"
            "#,
            dir.path().join("mapfile").display()
        ),
    )
    .expect("write config");

    let config = AuthConfig::from_file(&path).expect("config");
    config.validate().expect("valid");
    assert_eq!(
        config.method_preference().expect("methods").iter().collect::<Vec<_>>(),
        vec![AuthMethod::ClaimToBe]
    );
    let mapper = IdentityMapper::from_config(&config);
    assert!(mapper.is_configured());

    let side = Side::new(config, Providers::default());
    let out = run_pair(side.session(Role::Client, 1), side.session(Role::Server, 2));
    out.server_result.expect("server");
    out.client_result.expect("client");
    assert_eq!(out.server.fully_qualified_user(), Some("admin@ops.example.org"));
    assert_eq!(out.server.authenticated_name(), Some("operator"));
    assert!(out.client.session_key().is_none());
}

#[test]
fn malformed_file_is_configuration_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("auth.toml");
    fs::write(&path, "timeout_secs = \"soon\"\n").expect("write");
    let err = AuthConfig::from_file(&path).expect_err("rejected");
    assert_eq!(err.kind(), peerauth::AuthErrorKind::Configuration);
    assert!(AuthConfig::from_file(&dir.path().join("absent.toml")).is_err());
}

use crate::common::{Side, run_pair, session_key};
use peerauth::authenticator::StaticUsers;
use peerauth::authenticator::loopback::{LoopbackGss, LoopbackKerberos, LoopbackMunge, LoopbackSspi};
use peerauth::identity::MapFile;
use peerauth::{AuthConfig, AuthMethod, IdentityMapper, Providers, Role};
use std::sync::Arc;

const KERBEROS_RULES: &str = r"KERBEROS /^([^\/@]+)(\/[^@]+)?@EXAMPLE\.ORG$/ \1@example.org
";

const GSI_RULES: &str = r#"GSI "/DC=org/CN=alice,/cms/Role=production" alice_prod@grid.example.org
GSI /\/CN=([a-z]+)$/ \1@grid.example.org
"#;

fn rules(text: &str) -> IdentityMapper {
    IdentityMapper::with_rules(MapFile::parse_str(text, true, None))
}

#[test]
fn kerberos_session_maps_principal_and_delivers_key() {
    let providers = Providers::default()
        .with_kerberos(Arc::new(LoopbackKerberos::new("alice/admin@EXAMPLE.ORG")));
    let side = Side::new(
        AuthConfig::default().with_methods(&[AuthMethod::Kerberos]),
        providers,
    )
    .with_mapper(rules(KERBEROS_RULES));
    let key = session_key(77);

    let out = run_pair(
        side.session(Role::Client, 1),
        side.session(Role::Server, 2).with_session_key(key.clone()),
    );
    out.server_result.expect("server");
    out.client_result.expect("client");

    assert_eq!(out.server.fully_qualified_user(), Some("alice@example.org"));
    assert_eq!(out.server.authenticated_name(), Some("alice/admin@EXAMPLE.ORG"));
    let identity = out.server.identity().expect("identity");
    assert_eq!(identity.method_name, "KERBEROS");
    assert_eq!(identity.raw_principal.as_deref(), Some("alice/admin@EXAMPLE.ORG"));
    assert!(out.server.credential_expires_at().is_some());

    let received = out.client.session_key().expect("client key");
    assert_eq!(received.as_bytes(), key.as_bytes());
    assert_eq!(received.protocol(), key.protocol());
    assert_eq!(
        out.server.session_key().map(|k| k.as_bytes().to_vec()),
        Some(key.as_bytes().to_vec())
    );

    let sealed = out.client.wrap(b"negotiated").expect("wrap");
    assert_eq!(out.server.unwrap(&sealed).expect("unwrap"), b"negotiated");
}

#[test]
fn kerberos_without_rules_keeps_realm_as_domain() {
    let providers =
        Providers::default().with_kerberos(Arc::new(LoopbackKerberos::new("dave@EXAMPLE.ORG")));
    let side = Side::new(
        AuthConfig::default().with_methods(&[AuthMethod::Kerberos]),
        providers,
    );
    let out = run_pair(side.session(Role::Client, 1), side.session(Role::Server, 2));
    out.server_result.expect("server");
    out.client_result.expect("client");
    assert_eq!(out.server.fully_qualified_user(), Some("dave@EXAMPLE.ORG"));
    assert!(out.client.session_key().is_none());
}

#[test]
fn gsi_prefers_fqan_rule_over_bare_subject() {
    let mech = Arc::new(LoopbackGss::new("/DC=org/CN=alice").with_fqan("/cms/Role=production"));
    let mut config = AuthConfig::default().with_methods(&[AuthMethod::Gsi]);
    config.gsi.use_fqan = true;
    let side = Side::new(config, Providers::default().with_gsi(mech.clone()))
        .with_mapper(rules(GSI_RULES));

    let out = run_pair(side.session(Role::Client, 1), side.session(Role::Server, 2));
    out.server_result.expect("server");
    out.client_result.expect("client");

    assert_eq!(out.server.fully_qualified_user(), Some("alice_prod@grid.example.org"));
    let identity = out.server.identity().expect("identity");
    assert_eq!(identity.raw_principal.as_deref(), Some("/DC=org/CN=alice"));
    assert!(mech.acquisitions() >= 1);
}

#[test]
fn gsi_without_fqan_falls_back_to_subject_rule() {
    let mech = Arc::new(LoopbackGss::new("/DC=org/CN=alice").with_fqan("/cms/Role=production"));
    let side = Side::new(
        AuthConfig::default().with_methods(&[AuthMethod::Gsi]),
        Providers::default().with_gsi(mech),
    )
    .with_mapper(rules(GSI_RULES));

    let out = run_pair(side.session(Role::Client, 1), side.session(Role::Server, 2));
    out.server_result.expect("server");
    out.client_result.expect("client");
    assert_eq!(out.server.fully_qualified_user(), Some("alice@grid.example.org"));
}

#[test]
fn gsi_unmapped_subject_keeps_placeholder_identity() {
    let mech = Arc::new(LoopbackGss::new("/DC=org/CN=Mallory 2"));
    let side = Side::new(
        AuthConfig::default().with_methods(&[AuthMethod::Gsi]),
        Providers::default().with_gsi(mech),
    )
    .with_mapper(rules(GSI_RULES));

    let out = run_pair(side.session(Role::Client, 1), side.session(Role::Server, 2));
    out.server_result.expect("server");
    assert_eq!(out.server.fully_qualified_user(), Some("gsi@unmapped"));
    assert_eq!(out.server.authenticated_name(), Some("/DC=org/CN=Mallory 2"));
}

#[test]
fn sspi_reads_account_and_reverts_impersonation() {
    let provider = Arc::new(LoopbackSspi::new("alice", "CORP"));
    let side = Side::new(
        AuthConfig::default().with_methods(&[AuthMethod::Sspi]),
        Providers::default().with_sspi(provider.clone()),
    );

    let out = run_pair(side.session(Role::Client, 1), side.session(Role::Server, 2));
    out.server_result.expect("server");
    out.client_result.expect("client");

    assert_eq!(out.server.fully_qualified_user(), Some("alice@CORP"));
    assert_eq!(provider.active_impersonations(), 0);
    assert_eq!(provider.reverts(), 1);
}

#[test]
fn munge_names_the_credential_owner() {
    let users = Arc::new(StaticUsers::new().with_user(4242, "carol"));
    let providers = Providers::default()
        .with_munge(Arc::new(LoopbackMunge::new(4242, 4242)))
        .with_users(users);
    let side = Side::new(
        AuthConfig::default()
            .with_methods(&[AuthMethod::Munge])
            .with_uid_domain("example.org"),
        providers,
    );
    let key = session_key(5);

    let out = run_pair(
        side.session(Role::Client, 1),
        side.session(Role::Server, 2).with_session_key(key.clone()),
    );
    out.server_result.expect("server");
    out.client_result.expect("client");

    assert_eq!(out.server.fully_qualified_user(), Some("carol@example.org"));
    assert_eq!(
        out.client.session_key().map(|k| k.as_bytes().to_vec()),
        Some(key.as_bytes().to_vec())
    );
}

#[test]
fn munge_unknown_uid_falls_back_to_next_method() {
    let providers = Providers::default()
        .with_munge(Arc::new(LoopbackMunge::new(7, 7)))
        .with_users(Arc::new(StaticUsers::new()));
    let side = Side::new(
        AuthConfig::default().with_methods(&[AuthMethod::Munge, AuthMethod::Anonymous]),
        providers,
    );

    let out = run_pair(side.session(Role::Client, 1), side.session(Role::Server, 2));
    out.server_result.expect("server");
    out.client_result.expect("client");
    assert_eq!(out.server.method_used(), Some(AuthMethod::Anonymous));
    assert_eq!(out.server.fully_qualified_user(), Some("anonymous@unmapped"));
    assert!(out.server.error_stack().has_stage("MUNGE"));
}

#[cfg(feature = "tls")]
#[test]
fn ssl_client_certificate_is_mapped() {
    let pki = crate::common::Pki::new();
    let (server_cert, server_key) = pki.issue("server");
    let (client_cert, client_key) = pki.issue("alice");
    let ca = pki.bundle(&[&server_cert, &client_cert]);

    let mut server_config = AuthConfig::default().with_methods(&[AuthMethod::Ssl]);
    server_config.ssl.server_cert = Some(server_cert);
    server_config.ssl.server_key = Some(server_key);
    server_config.ssl.ca_file = Some(ca.clone());
    let mut client_config = AuthConfig::default().with_methods(&[AuthMethod::Ssl]);
    client_config.ssl.client_cert = Some(client_cert);
    client_config.ssl.client_key = Some(client_key);
    client_config.ssl.ca_file = Some(ca);
    client_config.ssl.server_name = Some("localhost".to_owned());

    let server = Side::new(server_config, Providers::default())
        .with_mapper(rules("SSL \"/CN=alice\" alice@example.org\n"));
    let client = Side::new(client_config, Providers::default());
    let key = session_key(9);

    let out = run_pair(
        client.session(Role::Client, 1).with_remote_host("localhost"),
        server.session(Role::Server, 2).with_session_key(key.clone()),
    );
    out.server_result.expect("server");
    out.client_result.expect("client");

    assert_eq!(out.server.fully_qualified_user(), Some("alice@example.org"));
    assert_eq!(out.server.authenticated_name(), Some("/CN=alice"));
    assert_eq!(
        out.client.session_key().map(|k| k.as_bytes().to_vec()),
        Some(key.as_bytes().to_vec())
    );
}

#[cfg(feature = "tokens")]
#[test]
fn client_with_token_offers_scitokens() {
    let pki = crate::common::Pki::new();
    let (cert, _key) = pki.issue("server");
    let mut config = AuthConfig::default().with_methods(&[AuthMethod::SciTokens, AuthMethod::Ssl]);
    config.ssl.ca_file = Some(pki.bundle(&[&cert]));

    let without = Side::new(config.clone(), Providers::default());
    assert!(without.registry.is_available(AuthMethod::Ssl));
    assert!(!without.registry.is_available(AuthMethod::SciTokens));

    config.tokens.token = Some("header.payload.signature".to_owned());
    let with = Side::new(config, Providers::default());
    assert!(with.registry.is_available(AuthMethod::SciTokens));
}

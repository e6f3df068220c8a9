use crate::common::{PairOutcome, Side, run_pair};
use peerauth::authenticator::loopback::LoopbackKerberos;
use peerauth::{AuthConfig, AuthMethod, Authentication, Providers, Role};
use proptest::prelude::*;
use proptest::test_runner::TestRunner;
use std::sync::Arc;

fn payloads() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 0..512)
}

/// Checks `unwrap(wrap(b)) == b` in both directions for arbitrary payloads.
fn assert_round_trips(out: &PairOutcome) {
    let mut runner = TestRunner::default();
    runner
        .run(&payloads(), |payload| {
            let sealed = out.client.wrap(&payload).expect("client wrap");
            prop_assert_eq!(out.server.unwrap(&sealed).expect("server unwrap"), payload.clone());
            let sealed = out.server.wrap(&payload).expect("server wrap");
            prop_assert_eq!(out.client.unwrap(&sealed).expect("client unwrap"), payload);
            Ok(())
        })
        .expect("wrap/unwrap round trip");
}

fn assert_refused_before_auth(session: &Authentication) {
    assert!(session.wrap(b"early").is_err());
    assert!(session.unwrap(b"early").is_err());
    assert!(session.wrap(b"").is_err());
}

#[test]
fn kerberos_sessions_round_trip_payloads() {
    let providers =
        Providers::default().with_kerberos(Arc::new(LoopbackKerberos::new("frank@EXAMPLE.ORG")));
    let side = Side::new(
        AuthConfig::default().with_methods(&[AuthMethod::Kerberos]),
        providers,
    );
    assert_refused_before_auth(&side.session(Role::Client, 1));

    let out = run_pair(side.session(Role::Client, 1), side.session(Role::Server, 2));
    out.server_result.as_ref().expect("server");
    out.client_result.as_ref().expect("client");
    let sealed = out.client.wrap(b"plain").expect("wrap");
    assert_ne!(sealed.as_slice(), b"plain");
    assert_round_trips(&out);
}

#[test]
fn keyless_sessions_copy_payloads_through() {
    let mut config = AuthConfig::default().with_methods(&[AuthMethod::ClaimToBe]);
    config.claim_to_be.user = Some("grace".to_owned());
    let side = Side::new(config, Providers::default());
    assert_refused_before_auth(&side.session(Role::Server, 2));

    let out = run_pair(side.session(Role::Client, 1), side.session(Role::Server, 2));
    out.server_result.as_ref().expect("server");
    out.client_result.as_ref().expect("client");
    assert_eq!(out.client.wrap(b"plain").expect("wrap"), b"plain");
    assert_round_trips(&out);
}

#[cfg(feature = "tls")]
#[test]
fn ssl_sessions_round_trip_payloads() {
    let pki = crate::common::Pki::new();
    let (cert, key) = pki.issue("server");
    let mut server_config = AuthConfig::default().with_methods(&[AuthMethod::Ssl]);
    server_config.ssl.server_cert = Some(cert.clone());
    server_config.ssl.server_key = Some(key);
    let mut client_config = AuthConfig::default().with_methods(&[AuthMethod::Ssl]);
    client_config.ssl.ca_file = Some(pki.bundle(&[&cert]));
    client_config.ssl.server_name = Some("localhost".to_owned());

    let server = Side::new(server_config, Providers::default());
    let client = Side::new(client_config, Providers::default());
    assert_refused_before_auth(&client.session(Role::Client, 1));

    let out = run_pair(
        client.session(Role::Client, 1).with_remote_host("localhost"),
        server.session(Role::Server, 2),
    );
    out.server_result.as_ref().expect("server");
    out.client_result.as_ref().expect("client");
    assert_round_trips(&out);
}
